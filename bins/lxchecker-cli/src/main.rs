mod commands;

use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "lxchecker-cli")]
#[command(about = "lxchecker CLI - Manage assignments and inspect the submission queue", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an assignment bound to a checker image
    AddAssignment {
        /// Subject id (e.g., so)
        #[arg(short, long)]
        subject: String,

        /// Assignment id (e.g., tema1)
        #[arg(short, long)]
        id: String,

        /// Human readable name
        #[arg(short, long)]
        name: String,

        /// Checker image (e.g., lxchecker/so-tema1)
        #[arg(long)]
        image: String,

        /// Absolute path the upload is placed at inside the container
        #[arg(long, default_value = "/submission/submission.zip")]
        submission_path: String,

        /// Bound on the container's run phase, in seconds
        #[arg(short, long, default_value = "300")]
        timeout_secs: u64,

        /// Last day without penalty (YYYY-MM-DD, closes at 23:59:59 UTC)
        #[arg(long)]
        soft_deadline: NaiveDate,

        /// Last day submissions are graded (YYYY-MM-DD, closes at 23:59:59 UTC)
        #[arg(long)]
        hard_deadline: NaiveDate,

        /// Points taken per started day past the soft deadline
        #[arg(long, default_value = "0")]
        daily_penalty: u64,

        /// Maximum automated score
        #[arg(long, default_value = "100")]
        max_score_by_tests: u64,

        /// Maximum teacher score
        #[arg(long, default_value = "0")]
        max_score_by_teacher: u64,
    },

    /// Show an assignment, or one of its submissions
    Show {
        #[arg(short, long)]
        subject: String,

        #[arg(short, long)]
        assignment: String,

        /// Submission id
        #[arg(short, long)]
        id: Option<String>,
    },

    /// List pending submissions nobody has finished in time
    Stuck {
        /// Age threshold in seconds (defaults to STUCK_AFTER_SECS)
        #[arg(long)]
        older_than_secs: Option<u64>,
    },

    /// Put a pending submission back on the queue
    Requeue {
        #[arg(short, long)]
        subject: String,

        #[arg(short, long)]
        assignment: String,

        /// Submission id
        #[arg(short, long)]
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = lxchecker_common::Config::from_env();

    match cli.command {
        Commands::AddAssignment {
            subject,
            id,
            name,
            image,
            submission_path,
            timeout_secs,
            soft_deadline,
            hard_deadline,
            daily_penalty,
            max_score_by_tests,
            max_score_by_teacher,
        } => {
            let assignment = commands::AssignmentArgs {
                subject,
                id,
                name,
                image,
                submission_path,
                timeout_secs,
                soft_deadline,
                hard_deadline,
                daily_penalty,
                max_score_by_tests,
                max_score_by_teacher,
            };
            commands::add_assignment(&config, assignment).await?;
        }
        Commands::Show {
            subject,
            assignment,
            id,
        } => {
            commands::show(&config, &subject, &assignment, id.as_deref()).await?;
        }
        Commands::Stuck { older_than_secs } => {
            let threshold = older_than_secs.unwrap_or(config.stuck_after_secs);
            commands::list_stuck(&config, threshold).await?;
        }
        Commands::Requeue {
            subject,
            assignment,
            id,
        } => {
            commands::requeue(&config, &subject, &assignment, &id).await?;
        }
    }

    Ok(())
}
