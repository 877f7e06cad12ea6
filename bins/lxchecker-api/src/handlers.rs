// HTTP route handlers for the lxchecker API

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, NaiveDate, Utc};
use lxchecker_common::grading::{self, Grade};
use lxchecker_common::store::{StoreError, SubmissionStore};
use lxchecker_common::types::{
    is_valid_id, latest_per_owner, Assignment, ExecutionFailure, Submission, SubmissionStatus,
    TeacherGrade,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info};

use crate::{metrics, AppState};

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => Self::not_found("no such object"),
            StoreError::AlreadyExists => Self::new(StatusCode::CONFLICT, "object already exists"),
            StoreError::Finished(e) => Self::new(StatusCode::CONFLICT, e.to_string()),
            other => {
                error!(error = %other, "Store failure");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            }
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { error: self.message })).into_response()
    }
}

/// A deadline given either as a calendar date or as a full instant
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(untagged)]
pub enum Deadline {
    Date(NaiveDate),
    Instant(DateTime<Utc>),
}

impl Deadline {
    pub fn resolve(self) -> DateTime<Utc> {
        match self {
            Deadline::Date(date) => grading::end_of_day(date),
            Deadline::Instant(at) => at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateAssignmentRequest {
    pub id: String,
    pub name: String,
    pub image: String,
    pub submission_path: String,
    pub timeout_secs: u64,
    pub soft_deadline: Deadline,
    pub hard_deadline: Deadline,
    #[serde(default)]
    pub daily_penalty: u64,
    #[serde(default)]
    pub max_score_by_tests: u64,
    #[serde(default)]
    pub max_score_by_teacher: u64,
}

fn build_assignment(
    subject_id: &str,
    request: CreateAssignmentRequest,
) -> Result<Assignment, ApiError> {
    if request.timeout_secs == 0 {
        return Err(ApiError::bad_request("`timeout_secs` must be positive"));
    }

    let assignment = Assignment {
        id: request.id,
        subject_id: subject_id.to_string(),
        name: request.name,
        image: request.image,
        submission_path: request.submission_path,
        timeout_secs: request.timeout_secs,
        soft_deadline: request.soft_deadline.resolve(),
        hard_deadline: request.hard_deadline.resolve(),
        daily_penalty: request.daily_penalty,
        max_score_by_tests: request.max_score_by_tests,
        max_score_by_teacher: request.max_score_by_teacher,
    };
    assignment
        .validate()
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    Ok(assignment)
}

/// POST /subjects/:subject/assignments
pub async fn create_assignment(
    State(state): State<Arc<AppState>>,
    Path(subject_id): Path<String>,
    Json(payload): Json<CreateAssignmentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let assignment = build_assignment(&subject_id, payload)?;
    state.store.insert_assignment(&assignment).await?;

    info!(
        subject_id = %assignment.subject_id,
        assignment_id = %assignment.id,
        image = %assignment.image,
        "Assignment created"
    );
    Ok((StatusCode::CREATED, Json(assignment)))
}

/// GET /subjects/:subject/assignments/:assignment
pub async fn get_assignment(
    State(state): State<Arc<AppState>>,
    Path((subject_id, assignment_id)): Path<(String, String)>,
) -> Result<Json<Assignment>, ApiError> {
    let assignment = state
        .store
        .get_assignment(&subject_id, &assignment_id)
        .await?;
    Ok(Json(assignment))
}

#[derive(Debug, Deserialize)]
pub struct CreateSubmissionRequest {
    pub owner: String,
    pub filename: String,
    pub content_base64: String,
}

#[derive(Debug, Serialize)]
pub struct CreateSubmissionResponse {
    pub id: String,
    pub status: SubmissionStatus,
}

fn reject(reason: &str, error: ApiError) -> ApiError {
    metrics::record_submission_rejected(reason);
    error
}

/// Validate an upload and store it as a `pending` submission
///
/// Penalty and overdue are stamped with `now`, which also becomes the
/// submission timestamp.
pub async fn accept_submission(
    store: &dyn SubmissionStore,
    subject_id: &str,
    assignment_id: &str,
    request: CreateSubmissionRequest,
    now: DateTime<Utc>,
) -> Result<Submission, ApiError> {
    if !is_valid_id(subject_id) || !is_valid_id(assignment_id) {
        return Err(reject(
            "invalid_id",
            ApiError::bad_request("bad `subject_id` or `assignment_id`"),
        ));
    }
    if request.owner.trim().is_empty() {
        return Err(reject(
            "missing_field",
            ApiError::bad_request("missing required `owner` field"),
        ));
    }
    if request.filename.trim().is_empty() {
        return Err(reject(
            "missing_field",
            ApiError::bad_request("missing required `filename` field"),
        ));
    }
    let content = general_purpose::STANDARD
        .decode(request.content_base64.as_bytes())
        .map_err(|_| {
            reject(
                "bad_encoding",
                ApiError::bad_request("`content_base64` is not valid base64"),
            )
        })?;

    let no_assignment = || {
        reject(
            "unknown_assignment",
            ApiError::bad_request("no assignment matching given `subject_id` and `assignment_id`"),
        )
    };
    let assignment = match store.get_assignment(subject_id, assignment_id).await {
        Ok(assignment) => assignment,
        Err(StoreError::NotFound) => return Err(no_assignment()),
        Err(e) => return Err(e.into()),
    };

    let mut submission = Submission::new_pending(
        subject_id,
        assignment_id,
        request.owner,
        now,
        content,
        request.filename,
    );
    let lateness = grading::assess(now, &assignment);
    submission.penalty = lateness.penalty;
    submission.overdue = lateness.overdue;

    match store.insert_submission(&submission).await {
        Ok(()) => Ok(submission),
        Err(StoreError::NotFound) => Err(no_assignment()),
        Err(e) => Err(e.into()),
    }
}

/// POST /subjects/:subject/assignments/:assignment/submissions
///
/// Responds as soon as the submission is stored and queued; execution
/// happens on a worker.
pub async fn create_submission(
    State(state): State<Arc<AppState>>,
    Path((subject_id, assignment_id)): Path<(String, String)>,
    Json(payload): Json<CreateSubmissionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let submission = accept_submission(
        state.store.as_ref(),
        &subject_id,
        &assignment_id,
        payload,
        Utc::now(),
    )
    .await?;

    let job = submission.job();
    if let Err(e) = state.jobs.enqueue(&job).await {
        // The record is stored; `lxchecker-cli stuck` reports it for requeue
        error!(job = %job, error = %e, "Failed to queue submission");
    }
    metrics::record_submission_created();

    info!(
        job = %job,
        owner = %submission.owner_username,
        bytes = submission.uploaded_file.len(),
        penalty = submission.penalty,
        overdue = submission.overdue,
        "Submission accepted"
    );

    Ok((
        StatusCode::CREATED,
        Json(CreateSubmissionResponse {
            id: submission.id,
            status: submission.status,
        }),
    ))
}

/// Stored submission without the uploaded bytes, plus its derived grade
#[derive(Debug, Serialize)]
pub struct SubmissionView {
    pub id: String,
    pub subject_id: String,
    pub assignment_id: String,
    pub owner_username: String,
    pub timestamp: DateTime<Utc>,
    pub uploaded_file_name: String,
    pub status: SubmissionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<ExecutionFailure>,
    pub logs: Option<String>,
    pub metadata: HashMap<String, String>,
    pub score_by_tests: Option<u64>,
    pub graded_by_teacher: bool,
    pub score_by_teacher: u64,
    pub feedback: String,
    pub grader_username: Option<String>,
    pub grade: Grade,
}

impl SubmissionView {
    pub fn new(submission: Submission, assignment: &Assignment) -> Self {
        let grade = grading::grade(&submission, assignment);
        Self {
            id: submission.id,
            subject_id: submission.subject_id,
            assignment_id: submission.assignment_id,
            owner_username: submission.owner_username,
            timestamp: submission.timestamp,
            uploaded_file_name: submission.uploaded_file_name,
            status: submission.status,
            failure_reason: submission.failure_reason,
            logs: submission
                .logs
                .map(|logs| String::from_utf8_lossy(&logs).into_owned()),
            metadata: submission.metadata,
            score_by_tests: submission.score_by_tests,
            graded_by_teacher: submission.graded_by_teacher,
            score_by_teacher: submission.score_by_teacher,
            feedback: submission.feedback,
            grader_username: submission.grader_username,
            grade,
        }
    }
}

/// GET /subjects/:subject/assignments/:assignment/submissions/:submission
pub async fn get_submission(
    State(state): State<Arc<AppState>>,
    Path((subject_id, assignment_id, submission_id)): Path<(String, String, String)>,
) -> Result<Json<SubmissionView>, ApiError> {
    let submission = state
        .store
        .get_submission(&subject_id, &assignment_id, &submission_id)
        .await?;
    let assignment = state
        .store
        .get_assignment(&subject_id, &assignment_id)
        .await?;
    Ok(Json(SubmissionView::new(submission, &assignment)))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub owner: Option<String>,
    /// Only the latest submission of each owner
    #[serde(default)]
    pub active: bool,
}

/// GET /subjects/:subject/assignments/:assignment/submissions
///
/// Newest first. `owner` keeps one user's submissions, `active` keeps the
/// latest submission per owner.
pub async fn list_submissions(
    State(state): State<Arc<AppState>>,
    Path((subject_id, assignment_id)): Path<(String, String)>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<SubmissionView>>, ApiError> {
    let assignment = state
        .store
        .get_assignment(&subject_id, &assignment_id)
        .await?;
    let mut submissions = state
        .store
        .list_submissions(&subject_id, &assignment_id)
        .await?;

    if let Some(owner) = &query.owner {
        submissions.retain(|s| &s.owner_username == owner);
    }
    if query.active {
        submissions = latest_per_owner(submissions);
    }

    Ok(Json(
        submissions
            .into_iter()
            .map(|s| SubmissionView::new(s, &assignment))
            .collect(),
    ))
}

/// GET /subjects/:subject/assignments/:assignment/submissions/:submission/upload
pub async fn download_upload(
    State(state): State<Arc<AppState>>,
    Path((subject_id, assignment_id, submission_id)): Path<(String, String, String)>,
) -> Result<Response, ApiError> {
    let submission = state
        .store
        .get_submission(&subject_id, &assignment_id, &submission_id)
        .await?;

    let filename: String = submission
        .uploaded_file_name
        .chars()
        .filter(|c| *c != '"' && *c != '\\' && !c.is_control())
        .collect();
    let disposition = format!("attachment; filename=\"{}\"", filename);
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        submission.uploaded_file,
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
pub struct GradeRequest {
    pub grader: String,
    pub score: u64,
    #[serde(default)]
    pub feedback: String,
}

/// POST /subjects/:subject/assignments/:assignment/submissions/:submission/grade
///
/// Teacher review. Leaves status and execution results untouched.
pub async fn grade_submission(
    State(state): State<Arc<AppState>>,
    Path((subject_id, assignment_id, submission_id)): Path<(String, String, String)>,
    Json(payload): Json<GradeRequest>,
) -> Result<Json<SubmissionView>, ApiError> {
    if payload.grader.trim().is_empty() {
        return Err(ApiError::bad_request("missing required `grader` field"));
    }

    let assignment = state
        .store
        .get_assignment(&subject_id, &assignment_id)
        .await?;

    if payload.score > assignment.max_score_by_teacher {
        return Err(ApiError::bad_request(format!(
            "`score` exceeds the maximum of {}",
            assignment.max_score_by_teacher
        )));
    }

    let grade = TeacherGrade {
        score: payload.score,
        feedback: payload.feedback,
        grader_username: payload.grader,
    };
    let submission = state
        .store
        .record_teacher_grade(&subject_id, &assignment_id, &submission_id, &grade)
        .await?;

    info!(
        submission_id = %submission.id,
        score = submission.score_by_teacher,
        grader = ?submission.grader_username,
        "Submission graded"
    );
    Ok(Json(SubmissionView::new(submission, &assignment)))
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_secs: u64,
}

/// GET /health - Health check endpoint
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok",
            uptime_secs: state.start_time.elapsed().as_secs(),
        }),
    )
}

/// GET /metrics - Prometheus text exposition
pub async fn prometheus_metrics() -> impl IntoResponse {
    (StatusCode::OK, metrics::render_metrics())
}
