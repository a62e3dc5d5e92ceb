//! The pretrained TANGO diffusion stack.
//!
//! ## Components
//!
//! - [`diffusion`] — FLAN-T5 text encoder + conditional UNet and the
//!   classifier-free-guidance denoising loop
//! - [`vae`] — AutoencoderKL first-stage decoder (latent → mel spectrogram)
//! - [`vocoder`] — HiFiGAN (mel spectrogram → 16 kHz waveform)
//!
//! [`Tango`] loads all three from a checkpoint (HuggingFace repo id or local
//! directory) and exposes them through the
//! [`DiffusionBackend`](crate::pipeline::DiffusionBackend) seam the batch
//! generator consumes. The network internals are opaque to the rest of the
//! crate: everything outside this module sees prompts in, latents, mel and
//! waveforms out.

pub mod diffusion;
pub mod vae;
pub mod vocoder;

use std::path::{Path, PathBuf};

use candle_core::{Device, IndexOp, Module, Tensor};
use hf_hub::api::sync::Api;

use crate::config::{ScheduleAdjustment, TangoConfig};
use crate::pipeline::DiffusionBackend;
use crate::prompts::PromptText;
use crate::scheduler::DdpmScheduler;
use diffusion::{AudioDiffusion, TextEncoder};
use vae::FirstStageDecoder;
use vocoder::Vocoder;

use crate::{Error, Result};

/// The loaded TANGO pipeline: text encoder, UNet, first-stage VAE, vocoder.
pub struct Tango {
    diffusion: AudioDiffusion,
    first_stage: FirstStageDecoder,
    vocoder: Vocoder,
    device: Device,
}

impl Tango {
    /// Load every component from `checkpoint` onto `device`.
    ///
    /// `checkpoint` is a HuggingFace repo id (`declare-lab/tango`) or a local
    /// directory with the same file layout. Missing geometry config falls
    /// back to the published TANGO defaults. `seed` fixes the run's noise
    /// stream, making generation reproducible.
    pub fn load(checkpoint: &str, device: &Device, seed: u64) -> Result<Self> {
        let files = CheckpointFiles::resolve(checkpoint)?;

        let config = match &files.main_config {
            Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
            None => {
                tracing::warn!(checkpoint, "no config.json in checkpoint, using TANGO defaults");
                TangoConfig::default()
            }
        };
        config.vocoder.verify()?;

        tracing::info!(checkpoint, device = ?device, "loading TANGO pipeline");

        let text_encoder = TextEncoder::load(
            &files.tokenizer,
            &files.text_encoder_config,
            &files.text_encoder,
            device,
        )?;
        let diffusion = AudioDiffusion::new(text_encoder, &files.unet, &config, device, seed)?;
        let first_stage = FirstStageDecoder::load(&files.vae, &config, device)?;

        let vocoder_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(
                &[&files.vocoder],
                candle_core::DType::F32,
                device,
            )?
        };
        let vocoder = Vocoder::new(config.mel_channels, &config.vocoder, vocoder_vb)?;

        Ok(Self {
            diffusion,
            first_stage,
            vocoder,
            device: device.clone(),
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

impl DiffusionBackend for Tango {
    fn inference(
        &mut self,
        prompts: &[PromptText],
        scheduler: &mut DdpmScheduler,
        steps: usize,
        guidance: f64,
        adjustment: &ScheduleAdjustment,
    ) -> Result<Tensor> {
        let texts: Vec<&str> = prompts.iter().map(PromptText::primary).collect();
        self.diffusion
            .inference(&texts, scheduler, steps, guidance, adjustment)
    }

    fn decode_first_stage(&self, latents: &Tensor) -> Result<Tensor> {
        self.first_stage.decode(latents)
    }

    fn decode_to_waveform(&self, mel: &Tensor) -> Result<Vec<Vec<f32>>> {
        // [B, 1, T, M] → [B, M, T]
        let mel = mel.squeeze(1)?.transpose(1, 2)?;
        let wave = self.vocoder.forward(&mel)?.squeeze(1)?;
        let batch = wave.dim(0)?;
        let mut out = Vec::with_capacity(batch);
        for item in 0..batch {
            out.push(wave.i(item)?.to_vec1::<f32>()?);
        }
        Ok(out)
    }
}

/// Resolved on-disk paths for every checkpoint component.
#[derive(Debug)]
struct CheckpointFiles {
    main_config: Option<PathBuf>,
    tokenizer: PathBuf,
    text_encoder_config: PathBuf,
    text_encoder: PathBuf,
    unet: PathBuf,
    vae: PathBuf,
    vocoder: PathBuf,
}

impl CheckpointFiles {
    fn resolve(checkpoint: &str) -> Result<Self> {
        if Path::new(checkpoint).is_dir() {
            Self::from_local(Path::new(checkpoint))
        } else {
            Self::from_hub(checkpoint)
        }
    }

    fn from_local(root: &Path) -> Result<Self> {
        let require = |rel: &str| -> Result<PathBuf> {
            let path = root.join(rel);
            if path.is_file() {
                Ok(path)
            } else {
                Err(Error::WeightLoad(format!(
                    "checkpoint file missing: {}",
                    path.display()
                )))
            }
        };
        let main_config = root.join("config.json");
        Ok(Self {
            main_config: main_config.is_file().then_some(main_config),
            tokenizer: require("tokenizer.json")?,
            text_encoder_config: require("text_encoder/config.json")?,
            text_encoder: require("text_encoder/model.safetensors")?,
            unet: require("unet/model.safetensors")?,
            vae: require("vae/model.safetensors")?,
            vocoder: require("vocoder/model.safetensors")?,
        })
    }

    fn from_hub(repo_id: &str) -> Result<Self> {
        let api = Api::new()?;
        let repo = api.model(repo_id.to_string());
        Ok(Self {
            main_config: repo.get("config.json").ok(),
            tokenizer: repo.get("tokenizer.json")?,
            text_encoder_config: repo.get("text_encoder/config.json")?,
            text_encoder: repo.get("text_encoder/model.safetensors")?,
            unet: repo.get("unet/model.safetensors")?,
            vae: repo.get("vae/model.safetensors")?,
            vocoder: repo.get("vocoder/model.safetensors")?,
        })
    }
}

/// Parse a CLI device string: `auto`, `cpu`, `cuda` or `cuda:N`.
pub fn parse_device(device: &str) -> Result<Device> {
    match device.to_lowercase().as_str() {
        "auto" => Ok(Device::cuda_if_available(0)?),
        "cpu" => Ok(Device::Cpu),
        s if s.starts_with("cuda") => {
            let ordinal: usize = match s.strip_prefix("cuda:") {
                Some(index) => index
                    .parse()
                    .map_err(|_| Error::Config(format!("invalid CUDA ordinal in '{device}'")))?,
                None => 0,
            };
            Ok(Device::cuda_if_available(ordinal)?)
        }
        other => Err(Error::Config(format!(
            "unknown device '{other}' (expected auto, cpu, cuda or cuda:N)"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_device_accepts_known_forms() {
        assert!(matches!(parse_device("cpu").unwrap(), Device::Cpu));
        // Falls back to CPU when CUDA is not compiled in.
        parse_device("auto").unwrap();
        parse_device("cuda:1").unwrap();
        assert!(parse_device("tpu").is_err());
        assert!(parse_device("cuda:x").is_err());
    }

    #[test]
    fn local_checkpoint_with_missing_files_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let err = CheckpointFiles::resolve(tmp.path().to_str().unwrap()).unwrap_err();
        assert!(matches!(err, Error::WeightLoad(_)), "got {err:?}");
    }
}
