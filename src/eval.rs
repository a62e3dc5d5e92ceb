//! Evaluation against reference audio and the append-only result log.
//!
//! The metric computation itself is an external collaborator: an
//! [`Evaluator`] receives the generated directory and the reference
//! directory and returns a flat metric map. [`CommandEvaluator`] shells out
//! to a configured executable — the evaluator prints one JSON object on
//! stdout and exits zero.
//!
//! [`write_report`] merges run metadata into the metric map and appends the
//! result as one JSON line plus a blank separator line to the shared
//! `tango_checkpoint_summary.jsonl`. The log is append-only: prior lines are
//! never rewritten. Single writer assumed; concurrent appends race.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde_json::{Map, Value};

use crate::run::RunConfig;
use crate::scheduler::DdpmSchedulerConfig;
use crate::{Error, Result};

/// Shared result log filename under the log root.
pub const RESULT_LOG_NAME: &str = "tango_checkpoint_summary.jsonl";

/// Computes audio similarity metrics between two directories of WAV files.
pub trait Evaluator {
    fn evaluate(&self, generated_dir: &Path, reference_dir: &Path) -> Result<Map<String, Value>>;
}

/// Runs an external evaluator command.
///
/// Invocation: `<command> <generated_dir> <reference_dir> <sample_rate>`.
/// The command's stdout must be a single JSON object of metric name → value.
pub struct CommandEvaluator {
    command: PathBuf,
    sample_rate: u32,
}

impl CommandEvaluator {
    pub fn new(command: impl Into<PathBuf>, sample_rate: u32) -> Self {
        Self {
            command: command.into(),
            sample_rate,
        }
    }
}

impl Evaluator for CommandEvaluator {
    fn evaluate(&self, generated_dir: &Path, reference_dir: &Path) -> Result<Map<String, Value>> {
        if !reference_dir.is_dir() {
            return Err(Error::Eval(format!(
                "reference directory not found: {}",
                reference_dir.display()
            )));
        }

        tracing::info!(
            command = %self.command.display(),
            generated = %generated_dir.display(),
            references = %reference_dir.display(),
            "running evaluator"
        );
        let output = Command::new(&self.command)
            .arg(generated_dir)
            .arg(reference_dir)
            .arg(self.sample_rate.to_string())
            .output()
            .map_err(|e| Error::Eval(format!("failed to spawn {}: {e}", self.command.display())))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Eval(format!(
                "evaluator exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let metrics: Map<String, Value> = serde_json::from_str(stdout.trim())
            .map_err(|e| Error::Eval(format!("evaluator produced invalid JSON: {e}")))?;
        Ok(metrics)
    }
}

/// Merge run metadata into `metrics` and append one line to the result log.
///
/// Returns the log path. The line and its blank separator are written with a
/// single `write_all` on an append-mode handle, so a crash cannot truncate
/// prior results.
pub fn write_report(
    logdir: &Path,
    mut metrics: Map<String, Value>,
    config: &RunConfig,
    scheduler_config: &DdpmSchedulerConfig,
    prompt_count: usize,
    output_dir: &Path,
) -> Result<PathBuf> {
    metrics.insert("Steps".into(), config.num_steps.into());
    metrics.insert("Guidance Scale".into(), config.guidance.into());
    metrics.insert("Test Instances".into(), prompt_count.into());
    metrics.insert(
        "scheduler_config".into(),
        serde_json::to_value(scheduler_config)?,
    );
    metrics.insert("args".into(), serde_json::to_value(config)?);
    metrics.insert(
        "output_dir".into(),
        output_dir.to_string_lossy().into_owned().into(),
    );

    std::fs::create_dir_all(logdir)?;
    let log_path = logdir.join(RESULT_LOG_NAME);
    let line = format!("{}\n\n", serde_json::to_string(&Value::Object(metrics))?);

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;
    file.write_all(line.as_bytes())?;

    tracing::info!(log = %log_path.display(), "appended evaluation result");
    Ok(log_path)
}
