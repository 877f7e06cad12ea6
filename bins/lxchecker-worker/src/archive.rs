/// Submission Tar Builder
///
/// Packs the uploaded bytes into a one-entry tar archive. The archive is
/// extracted at the container's filesystem root, so the entry path is the
/// in-container path with its leading `/` dropped.

use lxchecker_common::types::container_entry_path;
use thiserror::Error;

/// Read-only for everyone, the harness only needs to read the submission
const SUBMISSION_MODE: u32 = 0o444;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("submission path `{0}` is not an absolute file path")]
    InvalidPath(String),
    #[error("failed to write archive: {0}")]
    Io(#[from] std::io::Error),
}

/// Validate an in-container path and turn it into a tar entry name
fn entry_name(submission_path: &str) -> Result<String, ArchiveError> {
    container_entry_path(submission_path)
        .ok_or_else(|| ArchiveError::InvalidPath(submission_path.to_string()))
}

/// Build a tar archive holding `submission` at `submission_path`
pub fn build_submission_archive(
    submission: &[u8],
    submission_path: &str,
) -> Result<Vec<u8>, ArchiveError> {
    let name = entry_name(submission_path)?;

    let mut header = tar::Header::new_gnu();
    header.set_size(submission.len() as u64);
    header.set_mode(SUBMISSION_MODE);
    header.set_entry_type(tar::EntryType::Regular);

    let mut archive = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut archive);
        // append_data writes a long-name extension for paths over 100 bytes
        builder.append_data(&mut header, &name, submission)?;
        builder.finish()?;
    }
    Ok(archive)
}
