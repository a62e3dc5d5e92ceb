//! Batched generation with resume-by-batch.
//!
//! Prompts are partitioned into fixed-size contiguous batches processed
//! strictly in order. Per batch the states are:
//!
//! ```text
//! Pending → Complete (skip)
//! Pending → Generated → Written → Complete
//! ```
//!
//! There is no retry state: any generation or write failure aborts the whole
//! run. Batches already on disk are honored by the next invocation, so
//! re-running the same arguments against the same directory resumes from the
//! first incomplete batch. Completeness is tracked in the run manifest with a
//! file-existence fallback (all expected files present and non-empty).

use std::path::{Path, PathBuf};

use candle_core::Tensor;
use indicatif::{ProgressBar, ProgressStyle};

use crate::audio::write_wav;
use crate::config::ScheduleAdjustment;
use crate::manifest::{batch_files_present, RunManifest};
use crate::prompts::{PromptRecord, PromptText};
use crate::run::{output_path, RunConfig};
use crate::scheduler::DdpmScheduler;
use crate::{Error, Result};

/// Sample rate of every generated clip.
pub const OUTPUT_SAMPLE_RATE: u32 = 16_000;

/// The narrow seam between the batch loop and the diffusion stack.
///
/// Three fixed-signature stages: prompts → latents → mel → one waveform per
/// item. Candle builds no gradient graph for inference-only tensors, so no
/// explicit no-grad guard is needed around calls.
pub trait DiffusionBackend {
    /// Denoise a batch of prompts into latents.
    fn inference(
        &mut self,
        prompts: &[PromptText],
        scheduler: &mut DdpmScheduler,
        steps: usize,
        guidance: f64,
        adjustment: &ScheduleAdjustment,
    ) -> Result<Tensor>;

    /// Decode latents into the intermediate mel representation.
    fn decode_first_stage(&self, latents: &Tensor) -> Result<Tensor>;

    /// Vocode the mel representation into one waveform per batch item.
    fn decode_to_waveform(&self, mel: &Tensor) -> Result<Vec<Vec<f32>>>;
}

/// What a completed generation pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationReport {
    pub prompt_count: usize,
    pub generated_batches: usize,
    pub skipped_batches: usize,
}

/// Run every batch of `prompts` through `backend`, writing WAVs to `run_dir`.
///
/// Strictly sequential; returns after the last batch is complete on disk.
pub fn generate_all<B: DiffusionBackend>(
    backend: &mut B,
    scheduler: &mut DdpmScheduler,
    prompts: &[PromptRecord],
    run_dir: &Path,
    config: &RunConfig,
) -> Result<GenerationReport> {
    config.validate()?;
    // Surfaces an unusable step count before any batch work starts.
    scheduler.set_timesteps(config.num_steps)?;

    let batch_count = prompts.len().div_ceil(config.batch_size);
    let mut manifest = RunManifest::load_or_new(run_dir, config.batch_size);
    let mut report = GenerationReport {
        prompt_count: prompts.len(),
        generated_batches: 0,
        skipped_batches: 0,
    };

    let progress = ProgressBar::new(batch_count as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} batches")
            .map_err(|e| Error::Config(e.to_string()))?
            .progress_chars("#>-"),
    );

    for (batch_index, batch) in prompts.chunks(config.batch_size).enumerate() {
        let expected: Vec<PathBuf> = batch
            .iter()
            .map(|record| output_path(run_dir, &record.output_stem))
            .collect();

        if manifest.is_complete(batch_index) || batch_files_present(&expected) {
            tracing::info!(batch = batch_index + 1, "all files in batch already exist, skipping");
            if !manifest.is_complete(batch_index) {
                manifest.mark_complete(batch_index);
                manifest.save(run_dir)?;
            }
            report.skipped_batches += 1;
            progress.inc(1);
            continue;
        }

        let texts: Vec<PromptText> = batch.iter().map(|record| record.text.clone()).collect();
        let latents = backend.inference(
            &texts,
            scheduler,
            config.num_steps,
            config.guidance,
            &config.adjustment,
        )?;
        let mel = backend.decode_first_stage(&latents)?;
        let waveforms = backend.decode_to_waveform(&mel)?;

        if waveforms.len() != batch.len() {
            return Err(Error::Audio(format!(
                "decoder returned {} waveforms for a batch of {}",
                waveforms.len(),
                batch.len()
            )));
        }

        for (waveform, path) in waveforms.iter().zip(&expected) {
            write_wav(path, waveform, OUTPUT_SAMPLE_RATE)?;
        }

        manifest.mark_complete(batch_index);
        manifest.save(run_dir)?;
        report.generated_batches += 1;
        progress.inc(1);
    }

    progress.finish_and_clear();
    tracing::info!(
        generated = report.generated_batches,
        skipped = report.skipped_batches,
        prompts = report.prompt_count,
        "generation pass complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScheduleAdjustment;
    use crate::scheduler::{DdpmScheduler, DdpmSchedulerConfig};
    use std::fs;

    /// Backend that emits a constant ramp per item and counts calls.
    struct FakeBackend {
        inference_calls: usize,
        fill: f32,
    }

    impl FakeBackend {
        fn new() -> Self {
            Self {
                inference_calls: 0,
                fill: 0.25,
            }
        }
    }

    impl DiffusionBackend for FakeBackend {
        fn inference(
            &mut self,
            prompts: &[PromptText],
            _scheduler: &mut DdpmScheduler,
            _steps: usize,
            _guidance: f64,
            _adjustment: &ScheduleAdjustment,
        ) -> Result<Tensor> {
            self.inference_calls += 1;
            Ok(Tensor::zeros(
                (prompts.len(), 1, 4, 4),
                candle_core::DType::F32,
                &candle_core::Device::Cpu,
            )?)
        }

        fn decode_first_stage(&self, latents: &Tensor) -> Result<Tensor> {
            Ok(latents.clone())
        }

        fn decode_to_waveform(&self, mel: &Tensor) -> Result<Vec<Vec<f32>>> {
            let batch = mel.dim(0)?;
            Ok(vec![vec![self.fill; 64]; batch])
        }
    }

    fn record(stem: &str) -> PromptRecord {
        PromptRecord {
            text: PromptText::Single(format!("caption for {stem}")),
            output_stem: stem.to_string(),
        }
    }

    fn test_config(run_root: &Path, batch_size: usize) -> RunConfig {
        RunConfig {
            checkpoint: "declare-lab/tango".into(),
            test_file: "unused.json".into(),
            text_key: "captions".into(),
            device: "cpu".into(),
            num_steps: 10,
            guidance: 3.0,
            batch_size,
            logdir: run_root.to_path_buf(),
            test_references: "unused".into(),
            seed: 42,
            adjustment: ScheduleAdjustment::default(),
        }
    }

    fn scheduler() -> DdpmScheduler {
        DdpmScheduler::new(DdpmSchedulerConfig::default())
    }

    #[test]
    fn partitions_and_writes_all_batches() {
        let tmp = tempfile::tempdir().unwrap();
        let prompts = [record("a"), record("b"), record("c")];
        let config = test_config(tmp.path(), 2);
        let mut backend = FakeBackend::new();

        let report =
            generate_all(&mut backend, &mut scheduler(), &prompts, tmp.path(), &config).unwrap();

        // 3 records at batch size 2 → batches of 2 and 1.
        assert_eq!(backend.inference_calls, 2);
        assert_eq!(report.generated_batches, 2);
        assert_eq!(report.skipped_batches, 0);
        assert_eq!(report.prompt_count, 3);
        for stem in ["a", "b", "c"] {
            let path = tmp.path().join(format!("{stem}.wav"));
            assert!(path.is_file(), "{stem}.wav missing");
            let (samples, sr) = crate::audio::read_wav(&path).unwrap();
            assert_eq!(sr, OUTPUT_SAMPLE_RATE);
            assert_eq!(samples.len(), 64);
        }
    }

    #[test]
    fn fully_complete_run_makes_zero_backend_calls() {
        let tmp = tempfile::tempdir().unwrap();
        let prompts = [record("a"), record("b"), record("c")];
        let config = test_config(tmp.path(), 2);

        let mut first = FakeBackend::new();
        generate_all(&mut first, &mut scheduler(), &prompts, tmp.path(), &config).unwrap();

        let mut second = FakeBackend::new();
        let report =
            generate_all(&mut second, &mut scheduler(), &prompts, tmp.path(), &config).unwrap();
        assert_eq!(second.inference_calls, 0);
        assert_eq!(report.skipped_batches, 2);
        assert_eq!(report.generated_batches, 0);
    }

    #[test]
    fn resumes_after_first_complete_batch() {
        let tmp = tempfile::tempdir().unwrap();
        let prompts = [record("a"), record("b"), record("c"), record("d")];
        let config = test_config(tmp.path(), 2);

        // Pre-populate batch 0 only (no manifest: file-existence fallback).
        let mut seed_backend = FakeBackend::new();
        generate_all(
            &mut seed_backend,
            &mut scheduler(),
            &prompts[..2],
            tmp.path(),
            &config,
        )
        .unwrap();
        fs::remove_file(tmp.path().join(crate::manifest::MANIFEST_NAME)).unwrap();
        let before = fs::read(tmp.path().join("a.wav")).unwrap();

        let mut backend = FakeBackend {
            fill: 0.9,
            ..FakeBackend::new()
        };
        let report =
            generate_all(&mut backend, &mut scheduler(), &prompts, tmp.path(), &config).unwrap();

        assert_eq!(backend.inference_calls, 1);
        assert_eq!(report.skipped_batches, 1);
        assert_eq!(report.generated_batches, 1);
        // Pre-existing outputs are byte-unchanged.
        assert_eq!(fs::read(tmp.path().join("a.wav")).unwrap(), before);
        assert!(tmp.path().join("d.wav").is_file());
    }

    #[test]
    fn zero_length_file_does_not_count_as_done() {
        let tmp = tempfile::tempdir().unwrap();
        let prompts = [record("a"), record("b")];
        let config = test_config(tmp.path(), 2);
        fs::write(tmp.path().join("a.wav"), b"").unwrap();
        fs::write(tmp.path().join("b.wav"), b"x").unwrap();

        let mut backend = FakeBackend::new();
        let report =
            generate_all(&mut backend, &mut scheduler(), &prompts, tmp.path(), &config).unwrap();
        assert_eq!(backend.inference_calls, 1);
        assert_eq!(report.generated_batches, 1);
    }

    #[test]
    fn invalid_batch_size_rejected_before_any_work() {
        let tmp = tempfile::tempdir().unwrap();
        let prompts = [record("a")];
        let config = test_config(tmp.path(), 0);
        let mut backend = FakeBackend::new();
        let err = generate_all(&mut backend, &mut scheduler(), &prompts, tmp.path(), &config)
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)), "got {err:?}");
        assert_eq!(backend.inference_calls, 0);
    }

    #[test]
    fn waveform_count_mismatch_is_fatal() {
        struct ShortBackend;
        impl DiffusionBackend for ShortBackend {
            fn inference(
                &mut self,
                prompts: &[PromptText],
                _scheduler: &mut DdpmScheduler,
                _steps: usize,
                _guidance: f64,
                _adjustment: &ScheduleAdjustment,
            ) -> Result<Tensor> {
                Ok(Tensor::zeros(
                    (prompts.len(), 1, 2, 2),
                    candle_core::DType::F32,
                    &candle_core::Device::Cpu,
                )?)
            }
            fn decode_first_stage(&self, latents: &Tensor) -> Result<Tensor> {
                Ok(latents.clone())
            }
            fn decode_to_waveform(&self, _mel: &Tensor) -> Result<Vec<Vec<f32>>> {
                Ok(vec![vec![0.0; 8]])
            }
        }

        let tmp = tempfile::tempdir().unwrap();
        let prompts = [record("a"), record("b")];
        let config = test_config(tmp.path(), 2);
        let err = generate_all(
            &mut ShortBackend,
            &mut scheduler(),
            &prompts,
            tmp.path(),
            &config,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Audio(_)), "got {err:?}");
    }
}
