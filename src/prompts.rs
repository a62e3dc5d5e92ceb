//! Prompt loading from line-delimited JSON record files.
//!
//! Each line is one JSON object carrying a caption under a configurable
//! text key (a single string or a list of caption variants) and a
//! `location` field pointing at the matching reference recording. Only the
//! basename of `location` matters: stripped of its extension it becomes the
//! output-file stem, so generated files line up with the reference corpus
//! by name. Stems are assumed unique; no collision detection is performed.
//!
//! Loading is fail-fast: one malformed line aborts the whole load with its
//! line number — a partially loaded dataset would silently shift batch
//! boundaries on resume.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

/// Caption text: a single string or a list of caption variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PromptText {
    Single(String),
    Variants(Vec<String>),
}

impl PromptText {
    /// The caption handed to the model (first variant when several exist).
    pub fn primary(&self) -> &str {
        match self {
            Self::Single(text) => text,
            Self::Variants(variants) => variants.first().map(String::as_str).unwrap_or(""),
        }
    }
}

/// One prompt with its derived output-file stem.
///
/// Immutable once loaded; source-file order defines generation order.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptRecord {
    pub text: PromptText,
    pub output_stem: String,
}

/// Load prompts from a line-delimited JSON file.
///
/// Blank lines are skipped. Any malformed line, missing field, or empty
/// caption list fails the entire load (no partial dataset).
pub fn load_prompts(path: &Path, text_key: &str) -> Result<Vec<PromptRecord>> {
    let contents = fs::read_to_string(path)?;
    let mut records = Vec::new();

    for (index, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let lineno = index + 1;
        let record = parse_line(line, text_key)
            .map_err(|e| Error::Data(format!("{}:{lineno}: {e}", path.display())))?;
        records.push(record);
    }

    tracing::info!(
        count = records.len(),
        path = %path.display(),
        "loaded prompt records"
    );
    Ok(records)
}

fn parse_line(line: &str, text_key: &str) -> std::result::Result<PromptRecord, String> {
    let value: Value =
        serde_json::from_str(line).map_err(|e| format!("invalid JSON record: {e}"))?;

    let text_value = value
        .get(text_key)
        .ok_or_else(|| format!("missing text field '{text_key}'"))?;
    let text: PromptText = serde_json::from_value(text_value.clone())
        .map_err(|_| format!("field '{text_key}' must be a string or a list of strings"))?;
    if let PromptText::Variants(variants) = &text {
        if variants.is_empty() {
            return Err(format!("field '{text_key}' is an empty caption list"));
        }
    }

    let location = value
        .get("location")
        .and_then(Value::as_str)
        .ok_or_else(|| "missing string field 'location'".to_string())?;
    let output_stem = stem_of(location);
    if output_stem.is_empty() {
        return Err(format!("'location' has an empty basename: '{location}'"));
    }

    Ok(PromptRecord { text, output_stem })
}

/// Basename of a path with everything from the first dot on stripped.
fn stem_of(location: &str) -> String {
    let basename = Path::new(location)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("");
    basename
        .split('.')
        .next()
        .unwrap_or(basename)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_records(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        file
    }

    #[test]
    fn count_and_order_preserved() {
        let file = write_records(&[
            r#"{"captions": "a dog barks", "location": "data/ref/dog.wav"}"#,
            "",
            r#"{"captions": ["rain falls", "heavy rain"], "location": "data/ref/rain.wav"}"#,
            r#"{"captions": "a car horn", "location": "/abs/path/horn.flac"}"#,
        ]);

        let records = load_prompts(file.path(), "captions").unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].output_stem, "dog");
        assert_eq!(records[1].output_stem, "rain");
        assert_eq!(records[2].output_stem, "horn");
        assert_eq!(records[0].text.primary(), "a dog barks");
        assert_eq!(records[1].text.primary(), "rain falls");
    }

    #[test]
    fn stem_strips_at_first_dot() {
        assert_eq!(stem_of("data/ref/clip.16k.wav"), "clip");
        assert_eq!(stem_of("noext"), "noext");
    }

    #[test]
    fn malformed_line_fails_whole_load() {
        let file = write_records(&[
            r#"{"captions": "ok", "location": "a.wav"}"#,
            r#"{"captions": "broken""#,
        ]);
        let err = load_prompts(file.path(), "captions").unwrap_err();
        let msg = err.to_string();
        assert!(matches!(err, Error::Data(_)), "got {err:?}");
        assert!(msg.contains(":2:"), "line number missing from {msg}");
    }

    #[test]
    fn missing_fields_rejected() {
        let file = write_records(&[r#"{"location": "a.wav"}"#]);
        assert!(load_prompts(file.path(), "captions").is_err());

        let file = write_records(&[r#"{"captions": "no location"}"#]);
        assert!(load_prompts(file.path(), "captions").is_err());

        let file = write_records(&[r#"{"captions": [], "location": "a.wav"}"#]);
        assert!(load_prompts(file.path(), "captions").is_err());
    }
}
