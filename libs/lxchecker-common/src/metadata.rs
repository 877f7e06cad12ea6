/// Log metadata protocol
///
/// The harness inside the container reports structured results as log lines
/// of the form `@KEY VALUE`. Everything else in the logs is free-form output.
///
/// Extraction never fails: malformed lines are skipped and the result may be
/// empty or partial. Deciding what a missing `SCORE` means is up to the caller.

use std::collections::HashMap;

pub const SIGIL: char = '@';
pub const SCORE_KEY: &str = "SCORE";

/// Scan raw logs for `@KEY VALUE` lines
///
/// A line counts only if it starts with the sigil after trimming. The key
/// ends at the first space, the value is the rest of the line (spaces
/// included). Lines with no space after the key are ignored. Later
/// occurrences of a key overwrite earlier ones.
pub fn extract_metadata(logs: &[u8]) -> HashMap<String, String> {
    let text = String::from_utf8_lossy(logs);
    let mut metadata = HashMap::new();

    for line in text.lines() {
        let Some(entry) = line.trim().strip_prefix(SIGIL) else {
            continue;
        };
        let Some((key, value)) = entry.split_once(' ') else {
            continue;
        };
        if key.is_empty() {
            continue;
        }
        metadata.insert(key.to_string(), value.to_string());
    }

    metadata
}

/// Read the automated score reported by the harness
///
/// Only plain decimal digits are accepted.
pub fn parse_score(metadata: &HashMap<String, String>) -> Option<u64> {
    let value = metadata.get(SCORE_KEY)?;
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_and_note() {
        let metadata = extract_metadata(b"@SCORE 87\n@NOTE ok\n");
        assert_eq!(metadata.len(), 2);
        assert_eq!(metadata["SCORE"], "87");
        assert_eq!(metadata["NOTE"], "ok");
        assert_eq!(parse_score(&metadata), Some(87));
    }

    #[test]
    fn test_value_keeps_embedded_spaces() {
        let metadata = extract_metadata(b"@FEEDBACK test 3 failed: expected 4 got 5\n");
        assert_eq!(metadata["FEEDBACK"], "test 3 failed: expected 4 got 5");
    }

    #[test]
    fn test_no_sigil_lines_yield_empty_mapping() {
        let logs = b"Compiling...\nRunning 10 tests\nall good\nSCORE 100\n";
        assert!(extract_metadata(logs).is_empty());
        assert!(extract_metadata(b"").is_empty());
    }

    #[test]
    fn test_surrounding_whitespace_is_trimmed() {
        let metadata = extract_metadata(b"   @SCORE 42   \r\n\t@STAGE build\n");
        assert_eq!(metadata["SCORE"], "42");
        assert_eq!(metadata["STAGE"], "build");
    }

    #[test]
    fn test_lines_without_value_are_ignored() {
        let metadata = extract_metadata(b"@SCORE\n@DONE\n@ orphan\n");
        assert!(metadata.is_empty());
    }

    #[test]
    fn test_last_write_wins() {
        let metadata = extract_metadata(b"@SCORE 10\nnoise\n@SCORE 20\n");
        assert_eq!(metadata["SCORE"], "20");
    }

    #[test]
    fn test_sigil_must_lead_the_line() {
        let metadata = extract_metadata(b"email me at a@b.c now\n");
        assert!(metadata.is_empty());
    }

    #[test]
    fn test_invalid_utf8_does_not_break_extraction() {
        let metadata = extract_metadata(b"\xff\xfe garbage\n@SCORE 7\n");
        assert_eq!(parse_score(&metadata), Some(7));
    }

    #[test]
    fn test_score_parsing_rejects_non_integers() {
        for bad in ["", "-3", "+3", "4.5", "ten", " 5"] {
            let mut metadata = HashMap::new();
            metadata.insert(SCORE_KEY.to_string(), bad.to_string());
            assert_eq!(parse_score(&metadata), None, "accepted {:?}", bad);
        }
        assert_eq!(parse_score(&HashMap::new()), None);
    }
}
