use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Component, Path};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

lazy_static! {
    static ref VALID_ID: Regex = Regex::new(r"^[a-z]+[0-9a-z]+$").expect("id pattern compiles");
}

/// Subject and assignment identifiers: lowercase letters first, then letters or digits.
pub fn is_valid_id(id: &str) -> bool {
    VALID_ID.is_match(id)
}

/// Tar entry name for an in-container file path
///
/// The path must be absolute, name a file (no trailing `/`) and contain only
/// plain components. The entry name is the path without its leading `/`.
pub fn container_entry_path(path: &str) -> Option<String> {
    if !path.starts_with('/') || path.ends_with('/') {
        return None;
    }

    let mut parts = Vec::new();
    for component in Path::new(path).components() {
        match component {
            Component::RootDir => {}
            Component::Normal(part) => parts.push(part.to_str()?),
            _ => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

/// Submission lifecycle
///
/// `Pending` is set at intake. `Done` and `Failed` are terminal and
/// written exactly once by the execution task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionStatus {
    Pending,
    Done,
    Failed,
}

impl SubmissionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SubmissionStatus::Pending)
    }
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmissionStatus::Pending => write!(f, "pending"),
            SubmissionStatus::Done => write!(f, "done"),
            SubmissionStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Why a submission ended up `failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Engine,
    Timeout,
    MissingScore,
    AssignmentMissing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl ExecutionFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AssignmentError {
    #[error("bad or missing `id` field")]
    InvalidId,
    #[error("bad or missing `subject_id` field")]
    InvalidSubjectId,
    #[error("missing required `{0}` field")]
    MissingField(&'static str),
    #[error("`submission_path` must be an absolute in-container file path")]
    InvalidSubmissionPath,
    #[error("soft deadline is after hard deadline")]
    DeadlinesOutOfOrder,
}

/// Gradable task bound to a container image
///
/// Immutable once stored. `timeout_secs` bounds only the container's run phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub id: String,
    pub subject_id: String,
    pub name: String,
    pub image: String,
    pub submission_path: String,
    pub timeout_secs: u64,
    pub soft_deadline: DateTime<Utc>,
    pub hard_deadline: DateTime<Utc>,
    pub daily_penalty: u64,
    pub max_score_by_tests: u64,
    pub max_score_by_teacher: u64,
}

impl Assignment {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn validate(&self) -> Result<(), AssignmentError> {
        if !is_valid_id(&self.id) {
            return Err(AssignmentError::InvalidId);
        }
        if !is_valid_id(&self.subject_id) {
            return Err(AssignmentError::InvalidSubjectId);
        }
        if self.name.trim().is_empty() {
            return Err(AssignmentError::MissingField("name"));
        }
        if self.image.trim().is_empty() {
            return Err(AssignmentError::MissingField("image"));
        }
        if self.submission_path.is_empty() {
            return Err(AssignmentError::MissingField("submission_path"));
        }
        if container_entry_path(&self.submission_path).is_none() {
            return Err(AssignmentError::InvalidSubmissionPath);
        }
        if self.soft_deadline > self.hard_deadline {
            return Err(AssignmentError::DeadlinesOutOfOrder);
        }
        Ok(())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("submission {id} is already {status}")]
pub struct InvalidTransition {
    pub id: String,
    pub status: SubmissionStatus,
}

/// One graded attempt by a user against one assignment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub id: String,
    pub subject_id: String,
    pub assignment_id: String,
    pub owner_username: String,
    pub timestamp: DateTime<Utc>,

    #[serde(with = "base64_bytes")]
    pub uploaded_file: Vec<u8>,
    pub uploaded_file_name: String,
    #[serde(default, with = "base64_opt_bytes")]
    pub logs: Option<Vec<u8>>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,

    pub status: SubmissionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<ExecutionFailure>,
    pub score_by_tests: Option<u64>,

    pub graded_by_teacher: bool,
    pub score_by_teacher: u64,
    pub feedback: String,
    pub grader_username: Option<String>,

    pub overdue: bool,
    pub penalty: u64,
}

impl Submission {
    /// Fresh intake record: `pending`, no logs, metadata or scores.
    pub fn new_pending(
        subject_id: impl Into<String>,
        assignment_id: impl Into<String>,
        owner_username: impl Into<String>,
        timestamp: DateTime<Utc>,
        uploaded_file: Vec<u8>,
        uploaded_file_name: impl Into<String>,
    ) -> Self {
        Self {
            id: new_submission_id(),
            subject_id: subject_id.into(),
            assignment_id: assignment_id.into(),
            owner_username: owner_username.into(),
            timestamp,
            uploaded_file,
            uploaded_file_name: uploaded_file_name.into(),
            logs: None,
            metadata: HashMap::new(),
            status: SubmissionStatus::Pending,
            failure_reason: None,
            score_by_tests: None,
            graded_by_teacher: false,
            score_by_teacher: 0,
            feedback: String::new(),
            grader_username: None,
            overdue: false,
            penalty: 0,
        }
    }

    fn ensure_pending(&self) -> Result<(), InvalidTransition> {
        if self.status.is_terminal() {
            return Err(InvalidTransition {
                id: self.id.clone(),
                status: self.status,
            });
        }
        Ok(())
    }

    /// `pending → done`
    pub fn mark_done(
        &mut self,
        logs: Vec<u8>,
        metadata: HashMap<String, String>,
        score: u64,
    ) -> Result<(), InvalidTransition> {
        self.ensure_pending()?;
        self.logs = Some(logs);
        self.metadata = metadata;
        self.score_by_tests = Some(score);
        self.failure_reason = None;
        self.status = SubmissionStatus::Done;
        Ok(())
    }

    /// `pending → failed`
    ///
    /// Logs and metadata are kept when the run itself succeeded but no score
    /// could be read from them.
    pub fn mark_failed(
        &mut self,
        failure: ExecutionFailure,
        logs: Option<Vec<u8>>,
        metadata: HashMap<String, String>,
    ) -> Result<(), InvalidTransition> {
        self.ensure_pending()?;
        self.logs = logs;
        self.metadata = metadata;
        self.score_by_tests = None;
        self.failure_reason = Some(failure);
        self.status = SubmissionStatus::Failed;
        Ok(())
    }

    /// Apply a run's result: `pending → done` or `pending → failed`
    pub fn finish(&mut self, result: ExecutionResult) -> Result<(), InvalidTransition> {
        match result {
            ExecutionResult::Done {
                logs,
                metadata,
                score,
            } => self.mark_done(logs, metadata, score),
            ExecutionResult::Failed {
                failure,
                logs,
                metadata,
            } => self.mark_failed(failure, logs, metadata),
        }
    }

    /// Teacher review. Orthogonal to the status lifecycle.
    pub fn apply_teacher_grade(
        &mut self,
        score: u64,
        feedback: impl Into<String>,
        grader_username: impl Into<String>,
    ) {
        self.score_by_teacher = score;
        self.feedback = feedback.into();
        self.grader_username = Some(grader_username.into());
        self.graded_by_teacher = true;
    }

    pub fn job(&self) -> SubmissionJob {
        SubmissionJob {
            subject_id: self.subject_id.clone(),
            assignment_id: self.assignment_id.clone(),
            submission_id: self.id.clone(),
        }
    }
}

/// Execution-derived fields of a submission's terminal write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionResult {
    Done {
        logs: Vec<u8>,
        metadata: HashMap<String, String>,
        score: u64,
    },
    Failed {
        failure: ExecutionFailure,
        logs: Option<Vec<u8>>,
        metadata: HashMap<String, String>,
    },
}

/// Teacher-owned fields of a submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeacherGrade {
    pub score: u64,
    pub feedback: String,
    pub grader_username: String,
}

/// Newest submission of each owner, newest first
pub fn latest_per_owner(submissions: Vec<Submission>) -> Vec<Submission> {
    let mut latest: HashMap<String, Submission> = HashMap::new();
    for submission in submissions {
        match latest.get(&submission.owner_username) {
            Some(kept) if kept.timestamp >= submission.timestamp => {}
            _ => {
                latest.insert(submission.owner_username.clone(), submission);
            }
        }
    }
    let mut latest: Vec<Submission> = latest.into_values().collect();
    latest.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id)));
    latest
}

pub fn new_submission_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Queue message referencing one pending submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionJob {
    pub subject_id: String,
    pub assignment_id: String,
    pub submission_id: String,
}

impl fmt::Display for SubmissionJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.subject_id, self.assignment_id, self.submission_id
        )
    }
}

/// Input of a single scheduler run. Not persisted.
#[derive(Debug, Clone)]
pub struct SubmitOptions {
    pub image: String,
    pub submission: Vec<u8>,
    pub submission_path: String,
    pub timeout: Duration,
}

impl SubmitOptions {
    pub fn for_assignment(assignment: &Assignment, submission: Vec<u8>) -> Self {
        Self {
            image: assignment.image.clone(),
            submission,
            submission_path: assignment.submission_path.clone(),
            timeout: assignment.timeout(),
        }
    }
}

/// Output of a single scheduler run: combined stdout and stderr.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitResponse {
    pub logs: Vec<u8>,
    pub exit_code: i64,
}

/// Published by workers after each terminal write
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub submission_id: String,
    pub assignment_id: String,
    pub status: SubmissionStatus,
    pub execution_time_ms: u64,
}

mod base64_bytes {
    use base64::{engine::general_purpose, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

mod base64_opt_bytes {
    use base64::{engine::general_purpose, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&general_purpose::STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|encoded| {
                general_purpose::STANDARD
                    .decode(encoded)
                    .map_err(serde::de::Error::custom)
            })
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn assignment() -> Assignment {
        Assignment {
            id: "tema3".to_string(),
            subject_id: "so".to_string(),
            name: "Tema 3".to_string(),
            image: "lxchecker/so-tema3".to_string(),
            submission_path: "/submission/submission.zip".to_string(),
            timeout_secs: 60,
            soft_deadline: Utc.with_ymd_and_hms(2024, 3, 10, 23, 59, 59).unwrap(),
            hard_deadline: Utc.with_ymd_and_hms(2024, 3, 15, 23, 59, 59).unwrap(),
            daily_penalty: 10,
            max_score_by_tests: 90,
            max_score_by_teacher: 10,
        }
    }

    fn pending() -> Submission {
        Submission::new_pending(
            "so",
            "tema3",
            "student",
            Utc.with_ymd_and_hms(2024, 3, 9, 12, 0, 0).unwrap(),
            b"PK\x03\x04".to_vec(),
            "tema3.zip",
        )
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&SubmissionStatus::Pending).unwrap(),
            "\"pending\""
        );
        assert_eq!(
            serde_json::to_string(&SubmissionStatus::Failed).unwrap(),
            "\"failed\""
        );
        assert_eq!(
            serde_json::to_string(&FailureKind::MissingScore).unwrap(),
            "\"missing_score\""
        );
    }

    #[test]
    fn test_valid_ids() {
        assert!(is_valid_id("so"));
        assert!(is_valid_id("tema3"));
        assert!(!is_valid_id("a"));
        assert!(!is_valid_id("3tema"));
        assert!(!is_valid_id("Tema3"));
        assert!(!is_valid_id("tema-3"));
        assert!(!is_valid_id(""));
    }

    #[test]
    fn test_assignment_validation() {
        assert_eq!(assignment().validate(), Ok(()));

        for path in ["submission.zip", "/", "/submission/", "/a/../etc/passwd", ""] {
            let mut bad_path = assignment();
            bad_path.submission_path = path.to_string();
            assert!(bad_path.validate().is_err(), "accepted {:?}", path);
        }
        let mut directory = assignment();
        directory.submission_path = "/submission/".to_string();
        assert_eq!(
            directory.validate(),
            Err(AssignmentError::InvalidSubmissionPath)
        );

        let mut swapped = assignment();
        std::mem::swap(&mut swapped.soft_deadline, &mut swapped.hard_deadline);
        assert_eq!(swapped.validate(), Err(AssignmentError::DeadlinesOutOfOrder));

        let mut no_image = assignment();
        no_image.image = " ".to_string();
        assert_eq!(no_image.validate(), Err(AssignmentError::MissingField("image")));
    }

    #[test]
    fn test_new_submission_is_pending_and_empty() {
        let s = pending();
        assert_eq!(s.status, SubmissionStatus::Pending);
        assert!(s.logs.is_none());
        assert!(s.metadata.is_empty());
        assert_eq!(s.score_by_tests, None);
        assert!(!s.graded_by_teacher);
        assert_eq!(s.id.len(), 32);
    }

    #[test]
    fn test_terminal_states_do_not_revert() {
        let mut s = pending();
        s.mark_done(b"@SCORE 5\n".to_vec(), HashMap::new(), 5).unwrap();
        assert_eq!(s.status, SubmissionStatus::Done);

        let err = s
            .mark_failed(
                ExecutionFailure::new(FailureKind::Engine, "late failure"),
                None,
                HashMap::new(),
            )
            .unwrap_err();
        assert_eq!(err.status, SubmissionStatus::Done);
        assert_eq!(s.score_by_tests, Some(5));

        let mut f = pending();
        f.mark_failed(
            ExecutionFailure::new(FailureKind::Timeout, "timed out"),
            None,
            HashMap::new(),
        )
        .unwrap();
        assert!(f.mark_done(Vec::new(), HashMap::new(), 1).is_err());
        assert_eq!(f.status, SubmissionStatus::Failed);
    }

    #[test]
    fn test_teacher_grade_leaves_execution_fields() {
        let mut s = pending();
        s.mark_done(b"@SCORE 80\n".to_vec(), HashMap::new(), 80).unwrap();
        s.apply_teacher_grade(9, "nice", "prof");

        assert!(s.graded_by_teacher);
        assert_eq!(s.score_by_teacher, 9);
        assert_eq!(s.grader_username.as_deref(), Some("prof"));
        assert_eq!(s.status, SubmissionStatus::Done);
        assert_eq!(s.score_by_tests, Some(80));
    }

    #[test]
    fn test_container_entry_path() {
        assert_eq!(
            container_entry_path("/submission/submission.zip").as_deref(),
            Some("submission/submission.zip")
        );
        assert_eq!(container_entry_path("/main.c").as_deref(), Some("main.c"));
        assert_eq!(container_entry_path("/"), None);
        assert_eq!(container_entry_path("/submission/"), None);
        assert_eq!(container_entry_path("/a/../b"), None);
        assert_eq!(container_entry_path("relative.zip"), None);
    }

    #[test]
    fn test_finish_applies_result_once() {
        let mut s = pending();
        s.finish(ExecutionResult::Done {
            logs: b"@SCORE 3\n".to_vec(),
            metadata: HashMap::new(),
            score: 3,
        })
        .unwrap();
        assert_eq!(s.status, SubmissionStatus::Done);

        let again = s.finish(ExecutionResult::Failed {
            failure: ExecutionFailure::new(FailureKind::Engine, "boom"),
            logs: None,
            metadata: HashMap::new(),
        });
        assert!(again.is_err());
        assert_eq!(s.score_by_tests, Some(3));
    }

    #[test]
    fn test_latest_per_owner() {
        let at = |owner: &str, hour: u32| {
            Submission::new_pending(
                "so",
                "tema3",
                owner,
                Utc.with_ymd_and_hms(2024, 3, 9, hour, 0, 0).unwrap(),
                Vec::new(),
                "tema3.zip",
            )
        };
        let alice_old = at("alice", 8);
        let alice_new = at("alice", 11);
        let bob = at("bob", 10);

        let latest = latest_per_owner(vec![alice_new.clone(), bob.clone(), alice_old]);
        let ids: Vec<&str> = latest.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec![alice_new.id.as_str(), bob.id.as_str()]);
    }

    #[test]
    fn test_submission_json_encodes_bytes_as_base64() {
        let mut s = pending();
        s.logs = Some(b"hello".to_vec());
        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json["uploaded_file"], "UEsDBA==");
        assert_eq!(json["logs"], "aGVsbG8=");
        assert!(json.get("failure_reason").is_none());

        let back: Submission = serde_json::from_value(json).unwrap();
        assert_eq!(back, s);
    }

    #[test]
    fn test_submit_options_from_assignment() {
        let a = assignment();
        let options = SubmitOptions::for_assignment(&a, vec![1, 2, 3]);
        assert_eq!(options.image, "lxchecker/so-tema3");
        assert_eq!(options.submission_path, "/submission/submission.zip");
        assert_eq!(options.timeout, Duration::from_secs(60));
    }
}
