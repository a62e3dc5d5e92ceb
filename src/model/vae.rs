//! First-stage decoder: latents → mel spectrogram.
//!
//! Wraps the checkpoint's AutoencoderKL decoder. Latents are divided by the
//! scaling factor the encoder applied at training time before decoding.

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::stable_diffusion::vae::{AutoEncoderKL, AutoEncoderKLConfig};

use crate::config::TangoConfig;
use crate::Result;

/// AutoencoderKL decoder over single-channel mel "images".
pub struct FirstStageDecoder {
    vae: AutoEncoderKL,
    scaling_factor: f64,
}

impl FirstStageDecoder {
    pub fn load(weights_path: &Path, config: &TangoConfig, device: &Device) -> Result<Self> {
        let vae_config = AutoEncoderKLConfig {
            block_out_channels: config.vae_block_out_channels.clone(),
            layers_per_block: config.vae_layers_per_block,
            latent_channels: config.latent_channels,
            norm_num_groups: 32,
            ..Default::default()
        };
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights_path], DType::F32, device)?
        };
        let vae = AutoEncoderKL::new(vb, 1, 1, vae_config)?;
        Ok(Self {
            vae,
            scaling_factor: config.vae_scaling_factor,
        })
    }

    /// Decode latents `[B, C, T_lat, F_lat]` into a mel tensor `[B, 1, T, M]`.
    pub fn decode(&self, latents: &Tensor) -> Result<Tensor> {
        let scaled = (latents / self.scaling_factor)?;
        Ok(self.vae.decode(&scaled)?)
    }
}
