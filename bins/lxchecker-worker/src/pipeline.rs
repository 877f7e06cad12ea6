/// Submission task - drives one submission through its status lifecycle
///
/// **Responsibility:**
/// Load the pending submission, run it through the Scheduler, extract
/// metadata and score from the logs, and publish the terminal state in a
/// single conditional store write:
///
/// - `pending → done`   logs stored, metadata extracted, score parsed
/// - `pending → failed` any scheduler error, or no parseable `SCORE`
///
/// Nothing ever moves a submission back to `pending`. A cancelled run
/// (worker shutdown) leaves it `pending` so the job can be picked up again.

use crate::engine::ContainerRuntime;
use crate::scheduler::{Scheduler, SchedulerError};
use lxchecker_common::metadata::{extract_metadata, parse_score};
use lxchecker_common::store::{StoreError, SubmissionStore};
use lxchecker_common::types::{
    ExecutionFailure, ExecutionResult, FailureKind, Submission, SubmissionJob, SubmissionStatus,
    SubmitOptions,
};
use std::collections::HashMap;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// What happened to one queued job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Terminal state written
    Finished {
        status: SubmissionStatus,
        execution_time_ms: u64,
    },
    /// Nothing to do: submission gone or already terminal
    Skipped,
    /// Run aborted by cancellation; submission left `pending`
    Interrupted,
}

/// Process one job. Only unexpected store errors are returned.
pub async fn process_submission<S, R>(
    store: &S,
    scheduler: &Scheduler<R>,
    job: &SubmissionJob,
    cancel: &CancellationToken,
) -> Result<Outcome, StoreError>
where
    S: SubmissionStore + ?Sized,
    R: ContainerRuntime,
{
    let submission = match load(store, job).await? {
        Some(submission) if submission.status.is_terminal() => {
            info!(job = %job, status = %submission.status, "Submission already finished");
            return Ok(Outcome::Skipped);
        }
        Some(submission) => submission,
        None => return Ok(Outcome::Skipped),
    };

    let assignment = match store
        .get_assignment(&job.subject_id, &job.assignment_id)
        .await
    {
        Ok(assignment) => assignment,
        Err(StoreError::NotFound) => {
            let result = ExecutionResult::Failed {
                failure: ExecutionFailure::new(
                    FailureKind::AssignmentMissing,
                    "assignment no longer exists",
                ),
                logs: None,
                metadata: HashMap::new(),
            };
            return commit(store, job, result, 0).await;
        }
        Err(e) => return Err(e),
    };

    info!(
        job = %job,
        image = %assignment.image,
        timeout_secs = assignment.timeout_secs,
        "Running submission"
    );

    let started = Instant::now();
    let options = SubmitOptions::for_assignment(&assignment, submission.uploaded_file);
    let run = scheduler.submit(cancel, &options).await;
    let execution_time_ms = started.elapsed().as_millis() as u64;

    let result = match run {
        Err(SchedulerError::Cancelled) => {
            warn!(job = %job, "Run cancelled; submission stays pending");
            return Ok(Outcome::Interrupted);
        }
        Err(e) => {
            warn!(job = %job, phase = e.phase(), error = %e, "Execution failed");
            ExecutionResult::Failed {
                failure: ExecutionFailure::new(e.failure_kind(), e.to_string()),
                logs: None,
                metadata: HashMap::new(),
            }
        }
        Ok(response) => {
            let metadata = extract_metadata(&response.logs);
            match parse_score(&metadata) {
                Some(score) => {
                    info!(job = %job, score, exit_code = response.exit_code, "Score extracted");
                    ExecutionResult::Done {
                        logs: response.logs,
                        metadata,
                        score,
                    }
                }
                None => {
                    warn!(
                        job = %job,
                        exit_code = response.exit_code,
                        log_bytes = response.logs.len(),
                        "Logs carry no parseable SCORE"
                    );
                    ExecutionResult::Failed {
                        failure: ExecutionFailure::new(
                            FailureKind::MissingScore,
                            "no parseable @SCORE line in execution logs",
                        ),
                        logs: Some(response.logs),
                        metadata,
                    }
                }
            }
        }
    };

    commit(store, job, result, execution_time_ms).await
}

async fn load<S>(store: &S, job: &SubmissionJob) -> Result<Option<Submission>, StoreError>
where
    S: SubmissionStore + ?Sized,
{
    match store
        .get_submission(&job.subject_id, &job.assignment_id, &job.submission_id)
        .await
    {
        Ok(submission) => Ok(Some(submission)),
        Err(StoreError::NotFound) => {
            warn!(job = %job, "Submission no longer exists");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// The single terminal write
///
/// Only lands while the stored record is still `pending`, and only touches
/// execution fields, so a teacher grade stored meanwhile is kept.
async fn commit<S>(
    store: &S,
    job: &SubmissionJob,
    result: ExecutionResult,
    execution_time_ms: u64,
) -> Result<Outcome, StoreError>
where
    S: SubmissionStore + ?Sized,
{
    let finished = match store
        .record_execution(
            &job.subject_id,
            &job.assignment_id,
            &job.submission_id,
            &result,
        )
        .await
    {
        Ok(finished) => finished,
        Err(StoreError::Finished(e)) => {
            warn!(job = %job, error = %e, "Dropping duplicate result");
            return Ok(Outcome::Skipped);
        }
        Err(StoreError::NotFound) => {
            warn!(job = %job, "Submission deleted before its result was stored");
            return Ok(Outcome::Skipped);
        }
        Err(e) => return Err(e),
    };

    info!(
        job = %job,
        status = %finished.status,
        reason = ?finished.failure_reason.as_ref().map(|f| f.kind),
        execution_time_ms,
        "Submission finished"
    );
    Ok(Outcome::Finished {
        status: finished.status,
        execution_time_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{FakeRuntime, Phase};
    use chrono::{Duration as ChronoDuration, Utc};
    use lxchecker_common::store::MemoryStore;
    use lxchecker_common::types::{Assignment, TeacherGrade};
    use std::sync::Arc;
    use std::time::Duration;

    fn assignment(timeout_secs: u64) -> Assignment {
        let soft = Utc::now() + ChronoDuration::days(7);
        Assignment {
            id: "tema3".to_string(),
            subject_id: "so".to_string(),
            name: "Tema 3".to_string(),
            image: "lxchecker/so-tema3".to_string(),
            submission_path: "/submission/submission.zip".to_string(),
            timeout_secs,
            soft_deadline: soft,
            hard_deadline: soft + ChronoDuration::days(7),
            daily_penalty: 10,
            max_score_by_tests: 100,
            max_score_by_teacher: 0,
        }
    }

    async fn seeded(timeout_secs: u64) -> (MemoryStore, SubmissionJob) {
        let store = MemoryStore::new();
        store.insert_assignment(&assignment(timeout_secs)).await.unwrap();
        let submission = Submission::new_pending(
            "so",
            "tema3",
            "student",
            Utc::now(),
            b"PK\x03\x04".to_vec(),
            "tema3.zip",
        );
        store.insert_submission(&submission).await.unwrap();
        (store, submission.job())
    }

    async fn stored(store: &MemoryStore, job: &SubmissionJob) -> Submission {
        store
            .get_submission(&job.subject_id, &job.assignment_id, &job.submission_id)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_score_line_moves_submission_to_done() {
        let (store, job) = seeded(60).await;
        let scheduler = Scheduler::new(Arc::new(FakeRuntime::with_logs(b"@SCORE 87\n@NOTE ok\n")));

        let outcome = process_submission(&store, &scheduler, &job, &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            Outcome::Finished {
                status: SubmissionStatus::Done,
                ..
            }
        ));

        let s = stored(&store, &job).await;
        assert_eq!(s.status, SubmissionStatus::Done);
        assert_eq!(s.score_by_tests, Some(87));
        assert_eq!(s.metadata.len(), 2);
        assert_eq!(s.metadata["SCORE"], "87");
        assert_eq!(s.metadata["NOTE"], "ok");
        assert_eq!(s.logs.as_deref(), Some(&b"@SCORE 87\n@NOTE ok\n"[..]));
        assert!(s.failure_reason.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_moves_submission_to_failed() {
        let (store, job) = seeded(2).await;
        let mut fake = FakeRuntime::with_logs(b"@SCORE 100\n");
        fake.run_time = Duration::from_secs(3600);
        let scheduler = Scheduler::new(Arc::new(fake));

        process_submission(&store, &scheduler, &job, &CancellationToken::new())
            .await
            .unwrap();

        let s = stored(&store, &job).await;
        assert_eq!(s.status, SubmissionStatus::Failed);
        assert_eq!(s.score_by_tests, None);
        assert_eq!(
            s.failure_reason.map(|f| f.kind),
            Some(FailureKind::Timeout)
        );
    }

    #[tokio::test]
    async fn test_missing_score_fails_despite_clean_exit() {
        let (store, job) = seeded(60).await;
        let scheduler = Scheduler::new(Arc::new(FakeRuntime::with_logs(
            b"running 12 tests\nall tests passed\n",
        )));

        process_submission(&store, &scheduler, &job, &CancellationToken::new())
            .await
            .unwrap();

        let s = stored(&store, &job).await;
        assert_eq!(s.status, SubmissionStatus::Failed);
        assert_eq!(s.score_by_tests, None);
        assert!(s.logs.is_some());
        assert_eq!(
            s.failure_reason.map(|f| f.kind),
            Some(FailureKind::MissingScore)
        );
    }

    #[tokio::test]
    async fn test_engine_error_moves_submission_to_failed() {
        let (store, job) = seeded(60).await;
        let scheduler = Scheduler::new(Arc::new(FakeRuntime::failing_at(Phase::Start)));

        process_submission(&store, &scheduler, &job, &CancellationToken::new())
            .await
            .unwrap();

        let s = stored(&store, &job).await;
        assert_eq!(s.status, SubmissionStatus::Failed);
        let failure = s.failure_reason.unwrap();
        assert_eq!(failure.kind, FailureKind::Engine);
        assert!(failure.message.starts_with("failed to start container"));
    }

    #[tokio::test]
    async fn test_finished_submission_is_not_rerun() {
        let (store, job) = seeded(60).await;
        let runtime = Arc::new(FakeRuntime::with_logs(b"@SCORE 50\n"));
        let scheduler = Scheduler::new(Arc::clone(&runtime));
        let cancel = CancellationToken::new();

        process_submission(&store, &scheduler, &job, &cancel).await.unwrap();
        let calls_after_first = runtime.calls().len();

        let again = process_submission(&store, &scheduler, &job, &cancel).await.unwrap();
        assert_eq!(again, Outcome::Skipped);
        assert_eq!(runtime.calls().len(), calls_after_first);
        assert_eq!(stored(&store, &job).await.score_by_tests, Some(50));
    }

    #[tokio::test]
    async fn test_cancelled_run_stays_pending() {
        let (store, job) = seeded(60).await;
        let scheduler = Scheduler::new(Arc::new(FakeRuntime::with_logs(b"@SCORE 1\n")));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = process_submission(&store, &scheduler, &job, &cancel).await.unwrap();
        assert_eq!(outcome, Outcome::Interrupted);
        assert_eq!(stored(&store, &job).await.status, SubmissionStatus::Pending);
    }

    #[tokio::test]
    async fn test_unknown_submission_is_skipped() {
        let (store, mut job) = seeded(60).await;
        job.submission_id = "doesnotexist".to_string();
        let scheduler = Scheduler::new(Arc::new(FakeRuntime::with_logs(b"")));

        let outcome = process_submission(&store, &scheduler, &job, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Skipped);
        assert_eq!(store.submission_count().await, 1);
    }

    fn grade(score: u64) -> TeacherGrade {
        TeacherGrade {
            score,
            feedback: "clean code".to_string(),
            grader_username: "prof".to_string(),
        }
    }

    #[tokio::test]
    async fn test_teacher_grade_survives_execution_result() {
        let (store, job) = seeded(60).await;
        store
            .record_teacher_grade(
                &job.subject_id,
                &job.assignment_id,
                &job.submission_id,
                &grade(8),
            )
            .await
            .unwrap();

        let scheduler = Scheduler::new(Arc::new(FakeRuntime::with_logs(b"@SCORE 70\n")));
        process_submission(&store, &scheduler, &job, &CancellationToken::new())
            .await
            .unwrap();

        let s = stored(&store, &job).await;
        assert_eq!(s.status, SubmissionStatus::Done);
        assert_eq!(s.score_by_tests, Some(70));
        assert_eq!(s.score_by_teacher, 8);
        assert!(s.graded_by_teacher);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grade_stored_mid_run_is_kept() {
        let (store, job) = seeded(60).await;
        let mut fake = FakeRuntime::with_logs(b"@SCORE 64\n");
        fake.run_time = Duration::from_secs(10);
        let scheduler = Scheduler::new(Arc::new(fake));
        let cancel = CancellationToken::new();

        let run = process_submission(&store, &scheduler, &job, &cancel);
        let teacher = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            store
                .record_teacher_grade(
                    &job.subject_id,
                    &job.assignment_id,
                    &job.submission_id,
                    &grade(5),
                )
                .await
                .unwrap()
        };
        let (outcome, graded) = tokio::join!(run, teacher);
        assert_eq!(graded.status, SubmissionStatus::Pending);
        assert!(matches!(
            outcome.unwrap(),
            Outcome::Finished {
                status: SubmissionStatus::Done,
                ..
            }
        ));

        let s = stored(&store, &job).await;
        assert_eq!(s.status, SubmissionStatus::Done);
        assert_eq!(s.score_by_tests, Some(64));
        assert_eq!(s.score_by_teacher, 5);
        assert!(store.list_pending().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_for_submission_finished_mid_run_is_dropped() {
        let (store, job) = seeded(60).await;
        let mut fake = FakeRuntime::with_logs(b"@SCORE 10\n");
        fake.run_time = Duration::from_secs(10);
        let scheduler = Scheduler::new(Arc::new(fake));
        let cancel = CancellationToken::new();

        let run = process_submission(&store, &scheduler, &job, &cancel);
        let other_worker = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let result = ExecutionResult::Done {
                logs: b"@SCORE 99\n".to_vec(),
                metadata: HashMap::from([("SCORE".to_string(), "99".to_string())]),
                score: 99,
            };
            store
                .record_execution(
                    &job.subject_id,
                    &job.assignment_id,
                    &job.submission_id,
                    &result,
                )
                .await
                .unwrap();
        };
        let (outcome, ()) = tokio::join!(run, other_worker);
        assert_eq!(outcome.unwrap(), Outcome::Skipped);

        let s = stored(&store, &job).await;
        assert_eq!(s.status, SubmissionStatus::Done);
        assert_eq!(s.score_by_tests, Some(99));
    }
}
