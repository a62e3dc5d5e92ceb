//! Run identity and output directory naming.
//!
//! A run is identified on disk by a directory name that embeds every
//! generation-relevant parameter plus a timestamp-derived id. The parameter
//! part makes runs with different settings collision-free; the id part keeps
//! repeated invocations with identical settings apart. Resuming an
//! interrupted run therefore means re-invoking with the same arguments *and*
//! pointing at the existing directory (the id is minted fresh each time).

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::config::ScheduleAdjustment;
use crate::{Error, Result};

/// The full argument set of one run.
///
/// Serialized verbatim into the result log under `args`, and the source of
/// the output directory name.
#[derive(Debug, Clone, Serialize)]
pub struct RunConfig {
    pub checkpoint: String,
    pub test_file: PathBuf,
    pub text_key: String,
    pub device: String,
    pub num_steps: usize,
    pub guidance: f64,
    pub batch_size: usize,
    pub logdir: PathBuf,
    pub test_references: PathBuf,
    pub seed: u64,
    #[serde(flatten)]
    pub adjustment: ScheduleAdjustment,
}

impl RunConfig {
    /// Reject unusable settings before any model or file work starts.
    pub fn validate(&self) -> Result<()> {
        if self.num_steps == 0 {
            return Err(Error::Config("num_steps must be positive".into()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be positive".into()));
        }
        self.adjustment.validate()
    }

    /// Checkpoint id with any repo-owner prefix stripped (`declare-lab/tango`
    /// → `tango`).
    pub fn checkpoint_name(&self) -> &str {
        self.checkpoint
            .rsplit('/')
            .next()
            .unwrap_or(&self.checkpoint)
    }

    /// Output directory name for this configuration under `run_id`.
    ///
    /// Deterministic in (config, run_id); any differing parameter yields a
    /// different name.
    pub fn dir_name(&self, run_id: u64) -> String {
        let adj = &self.adjustment;
        format!(
            "{run_id}_steps_{}_guidance_{}_s1_{}_s2_{}_b1_{}_b2_{}_m_{}_{}_{}_seed{}",
            self.num_steps,
            self.guidance,
            adj.s1,
            adj.s2,
            adj.b1,
            adj.b2,
            adj.magnitude,
            adj.mode,
            self.checkpoint_name(),
            self.seed,
        )
    }
}

/// Timestamp-derived run id: Unix seconds at invocation.
///
/// Monotonically increasing in practice; uniqueness across back-to-back
/// identical invocations is best-effort, not guaranteed.
pub fn run_id_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Create the log root and the run directory, idempotently.
pub fn prepare_run_dir(config: &RunConfig, run_id: u64) -> Result<PathBuf> {
    let run_dir = config.logdir.join(config.dir_name(run_id));
    std::fs::create_dir_all(&run_dir)?;
    Ok(run_dir)
}

/// Expected output path for one prompt stem inside a run directory.
pub fn output_path(run_dir: &Path, stem: &str) -> PathBuf {
    run_dir.join(format!("{stem}.wav"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScheduleMode;

    fn base_config() -> RunConfig {
        RunConfig {
            checkpoint: "declare-lab/tango".into(),
            test_file: "data/test.json".into(),
            text_key: "captions".into(),
            device: "cpu".into(),
            num_steps: 200,
            guidance: 3.0,
            batch_size: 8,
            logdir: "./output".into(),
            test_references: "data/refs".into(),
            seed: 42,
            adjustment: ScheduleAdjustment::default(),
        }
    }

    #[test]
    fn dir_name_embeds_all_parameters() {
        let config = base_config();
        let name = config.dir_name(1700000000);
        assert_eq!(
            name,
            "1700000000_steps_200_guidance_3_s1_1_s2_1_b1_1_b2_1_m_1_none_tango_seed42"
        );
    }

    #[test]
    fn dir_name_unique_per_parameter() {
        let base = base_config();
        let variants = [
            RunConfig {
                num_steps: 100,
                ..base.clone()
            },
            RunConfig {
                guidance: 2.5,
                ..base.clone()
            },
            RunConfig {
                seed: 43,
                ..base.clone()
            },
            RunConfig {
                checkpoint: "declare-lab/tango-full".into(),
                ..base.clone()
            },
            RunConfig {
                adjustment: ScheduleAdjustment {
                    s1: 0.9,
                    ..base.adjustment
                },
                ..base.clone()
            },
            RunConfig {
                adjustment: ScheduleAdjustment {
                    b2: 1.1,
                    ..base.adjustment
                },
                ..base.clone()
            },
            RunConfig {
                adjustment: ScheduleAdjustment {
                    mode: ScheduleMode::Reweight,
                    ..base.adjustment
                },
                ..base.clone()
            },
            RunConfig {
                adjustment: ScheduleAdjustment {
                    magnitude: 0.5,
                    ..base.adjustment
                },
                ..base.clone()
            },
        ];

        let reference = base.dir_name(1);
        for variant in variants {
            assert_ne!(variant.dir_name(1), reference, "{variant:?}");
        }
        // Same config, same id → same name.
        assert_eq!(base.dir_name(1), reference);
    }

    #[test]
    fn validate_rejects_zero_counts() {
        let config = RunConfig {
            num_steps: 0,
            ..base_config()
        };
        assert!(config.validate().is_err());

        let config = RunConfig {
            batch_size: 0,
            ..base_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn prepare_run_dir_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let config = RunConfig {
            logdir: tmp.path().to_path_buf(),
            ..base_config()
        };
        let first = prepare_run_dir(&config, 7).unwrap();
        let second = prepare_run_dir(&config, 7).unwrap();
        assert_eq!(first, second);
        assert!(first.is_dir());
    }
}
