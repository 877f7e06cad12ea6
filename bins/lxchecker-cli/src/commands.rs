// CLI commands for managing lxchecker
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use lxchecker_common::grading::{self, end_of_day};
use lxchecker_common::redis as queue;
use lxchecker_common::{Assignment, Config, RedisStore, StoreError, Submission, SubmissionStore};
use redis::aio::ConnectionManager;

/// Everything `add-assignment` takes on the command line
#[derive(Debug, Clone)]
pub struct AssignmentArgs {
    pub subject: String,
    pub id: String,
    pub name: String,
    pub image: String,
    pub submission_path: String,
    pub timeout_secs: u64,
    pub soft_deadline: NaiveDate,
    pub hard_deadline: NaiveDate,
    pub daily_penalty: u64,
    pub max_score_by_tests: u64,
    pub max_score_by_teacher: u64,
}

impl AssignmentArgs {
    /// Deadlines close at the end of the given day
    pub fn into_assignment(self) -> Result<Assignment> {
        if self.timeout_secs == 0 {
            bail!("Timeout must be at least one second");
        }

        let assignment = Assignment {
            id: self.id,
            subject_id: self.subject,
            name: self.name,
            image: self.image,
            submission_path: self.submission_path,
            timeout_secs: self.timeout_secs,
            soft_deadline: end_of_day(self.soft_deadline),
            hard_deadline: end_of_day(self.hard_deadline),
            daily_penalty: self.daily_penalty,
            max_score_by_tests: self.max_score_by_tests,
            max_score_by_teacher: self.max_score_by_teacher,
        };
        assignment.validate()?;
        Ok(assignment)
    }
}

async fn connect(config: &Config) -> Result<(RedisStore, ConnectionManager)> {
    let client = redis::Client::open(config.redis_url.as_str())
        .with_context(|| format!("Invalid Redis URL {}", config.redis_url))?;
    let conn = ConnectionManager::new(client)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", config.redis_url))?;
    Ok((RedisStore::new(conn.clone()), conn))
}

/// Create a new assignment
pub async fn add_assignment(config: &Config, args: AssignmentArgs) -> Result<()> {
    println!("🚀 Adding assignment: {}/{}", args.subject, args.id);

    let assignment = args.into_assignment()?;
    let (store, _) = connect(config).await?;

    match store.insert_assignment(&assignment).await {
        Ok(()) => {}
        Err(StoreError::AlreadyExists) => {
            bail!(
                "Assignment '{}/{}' already exists",
                assignment.subject_id,
                assignment.id
            );
        }
        Err(e) => return Err(e).context("Failed to store assignment"),
    }

    println!("✅ Assignment '{}' added successfully!", assignment.name);
    println!("   image:           {}", assignment.image);
    println!("   submission path: {}", assignment.submission_path);
    println!("   timeout:         {}s", assignment.timeout_secs);
    println!("   soft deadline:   {}", assignment.soft_deadline);
    println!("   hard deadline:   {}", assignment.hard_deadline);
    Ok(())
}

/// Print an assignment, or a submission with its derived grade
pub async fn show(
    config: &Config,
    subject_id: &str,
    assignment_id: &str,
    submission_id: Option<&str>,
) -> Result<()> {
    let (store, _) = connect(config).await?;
    let assignment = store
        .get_assignment(subject_id, assignment_id)
        .await
        .with_context(|| format!("Assignment '{}/{}' not found", subject_id, assignment_id))?;

    let Some(submission_id) = submission_id else {
        println!("{}", serde_json::to_string_pretty(&assignment)?);
        return Ok(());
    };

    let submission = store
        .get_submission(subject_id, assignment_id, submission_id)
        .await
        .with_context(|| format!("Submission '{}' not found", submission_id))?;
    print_submission(&submission, &assignment);
    Ok(())
}

fn print_submission(submission: &Submission, assignment: &Assignment) {
    let grade = grading::grade(submission, assignment);

    println!("📋 Submission {}", submission.id);
    println!("   owner:     {}", submission.owner_username);
    println!("   file:      {}", submission.uploaded_file_name);
    println!("   submitted: {}", submission.timestamp);
    println!("   status:    {}", submission.status);
    if let Some(failure) = &submission.failure_reason {
        println!("   failure:   {:?}: {}", failure.kind, failure.message);
    }
    match submission.score_by_tests {
        Some(score) => println!("   tests:     {}/{}", score, assignment.max_score_by_tests),
        None => println!("   tests:     -"),
    }
    if submission.graded_by_teacher {
        println!(
            "   teacher:   {}/{} by {}",
            submission.score_by_teacher,
            assignment.max_score_by_teacher,
            submission.grader_username.as_deref().unwrap_or("unknown")
        );
    }
    println!(
        "   penalty:   {}{}",
        grade.penalty,
        if grade.overdue { " (overdue)" } else { "" }
    );
    println!("   overall:   {}", grade.overall);

    if let Some(logs) = &submission.logs {
        println!("\n{}", String::from_utf8_lossy(logs));
    }
}

/// Pending submissions older than `threshold` at `now`, oldest first
pub fn stuck_submissions(
    pending: Vec<Submission>,
    now: DateTime<Utc>,
    threshold: Duration,
) -> Vec<Submission> {
    let mut stuck: Vec<Submission> = pending
        .into_iter()
        .filter(|s| now - s.timestamp > threshold)
        .collect();
    stuck.sort_by_key(|s| s.timestamp);
    stuck
}

/// `secs` as a chrono duration, refusing values chrono cannot represent
pub fn stuck_threshold(secs: u64) -> Result<Duration> {
    match i64::try_from(secs).ok().and_then(Duration::try_seconds) {
        Some(threshold) => Ok(threshold),
        None => bail!("Threshold of {}s is too large", secs),
    }
}

/// Report submissions that have been pending for too long
pub async fn list_stuck(config: &Config, older_than_secs: u64) -> Result<()> {
    let threshold = stuck_threshold(older_than_secs)?;
    let (store, _) = connect(config).await?;
    let pending = store
        .list_pending()
        .await
        .context("Failed to list pending submissions")?;
    let total = pending.len();

    let stuck = stuck_submissions(pending, Utc::now(), threshold);

    if stuck.is_empty() {
        println!("✅ No stuck submissions ({} pending)", total);
        return Ok(());
    }

    println!("⚠️  Stuck submissions (pending for over {}s):\n", older_than_secs);
    println!(
        "{:<34} {:<12} {:<12} {:<16} {:<25}",
        "ID", "SUBJECT", "ASSIGNMENT", "OWNER", "SUBMITTED"
    );
    println!("{}", "─".repeat(100));
    for s in &stuck {
        println!(
            "{:<34} {:<12} {:<12} {:<16} {:<25}",
            s.id, s.subject_id, s.assignment_id, s.owner_username, s.timestamp
        );
    }
    println!("\n💡 Requeue one with: lxchecker-cli requeue --subject <s> --assignment <a> --id <id>");
    Ok(())
}

/// Push a pending submission back onto the queue
pub async fn requeue(
    config: &Config,
    subject_id: &str,
    assignment_id: &str,
    submission_id: &str,
) -> Result<()> {
    let (store, mut conn) = connect(config).await?;
    let submission = store
        .get_submission(subject_id, assignment_id, submission_id)
        .await
        .with_context(|| format!("Submission '{}' not found", submission_id))?;

    if submission.status.is_terminal() {
        bail!(
            "Submission '{}' is already {}, nothing to requeue",
            submission.id,
            submission.status
        );
    }

    let job = submission.job();
    queue::push_job(&mut conn, &job)
        .await
        .context("Failed to push job")?;
    println!("✅ Requeued {}", job);
    Ok(())
}
