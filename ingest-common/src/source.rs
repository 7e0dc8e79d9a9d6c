//! Reading scraper output files.
use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("failed to read {path}: {error}")]
    ReadError {
        path: PathBuf,
        error: std::io::Error,
    },
    #[error("malformed source data: {0}")]
    DecodeError(#[from] serde_json::Error),
}

/// Parse scraper output: a JSON array, or JSON Lines with blank lines skipped.
/// An empty input yields no rows.
pub fn parse_rows(contents: &str) -> Result<Vec<Value>, serde_json::Error> {
    let trimmed = contents.trim_start();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed);
    }

    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(serde_json::from_str)
        .collect()
}

pub async fn read_rows(path: &Path) -> Result<Vec<Value>, SourceError> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|error| SourceError::ReadError {
            path: path.to_owned(),
            error,
        })?;

    Ok(parse_rows(&contents)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rows_formats() {
        assert!(parse_rows("").unwrap().is_empty());
        assert!(parse_rows("  \n").unwrap().is_empty());
        assert_eq!(parse_rows(r#"[{"a": 1}, {"a": 2}]"#).unwrap().len(), 2);
        assert_eq!(parse_rows("{\"a\": 1}\n\n{\"a\": 2}\n").unwrap().len(), 2);
        assert!(parse_rows("{\"a\": 1}\nnot json\n").is_err());
    }

    #[tokio::test]
    async fn test_missing_file_is_a_read_error() {
        let path = std::env::temp_dir().join("ingest-common-does-not-exist.json");

        assert!(matches!(
            read_rows(&path).await,
            Err(SourceError::ReadError { .. })
        ));
    }
}
