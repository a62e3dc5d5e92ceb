//! Latent diffusion: text conditioning and the denoising loop.
//!
//! [`TextEncoder`] wraps the FLAN-T5 encoder; [`AudioDiffusion`] owns the
//! conditional UNet and runs classifier-free guidance over the scheduler's
//! timesteps. The schedule adjustment arrives as a parameter on every call —
//! there is no persistent schedule state on the model.

use std::fs;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::stable_diffusion::unet_2d::{
    BlockConfig, UNet2DConditionModel, UNet2DConditionModelConfig,
};
use candle_transformers::models::t5;
use tokenizers::Tokenizer;

use crate::config::{ScheduleAdjustment, TangoConfig};
use crate::scheduler::{DdpmScheduler, NoiseSource};
use crate::{Error, Result};

/// FLAN-T5 text encoder with its tokenizer.
pub struct TextEncoder {
    tokenizer: Tokenizer,
    encoder: t5::T5EncoderModel,
    device: Device,
}

impl TextEncoder {
    /// Load tokenizer, encoder config and weights.
    pub fn load(
        tokenizer_path: &Path,
        config_path: &Path,
        weights_path: &Path,
        device: &Device,
    ) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(tokenizer_path)?;
        let t5_config: t5::Config = serde_json::from_str(&fs::read_to_string(config_path)?)?;
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights_path], DType::F32, device)?
        };
        let encoder = t5::T5EncoderModel::load(vb, &t5_config)?;
        Ok(Self {
            tokenizer,
            encoder,
            device: device.clone(),
        })
    }

    /// Encode captions into zero-padded hidden states `[B, L_max, D]`.
    pub fn encode(&mut self, texts: &[&str]) -> Result<Tensor> {
        let mut states = Vec::with_capacity(texts.len());
        let mut max_len = 0;
        for text in texts {
            let ids = self.tokenizer.encode(*text, true)?.get_ids().to_vec();
            let ids = Tensor::new(ids.as_slice(), &self.device)?.unsqueeze(0)?;
            let hidden = self.encoder.forward(&ids)?;
            max_len = max_len.max(hidden.dim(1)?);
            states.push(hidden);
        }
        let padded = states
            .into_iter()
            .map(|hidden| pad_seq(&hidden, max_len))
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::cat(&padded, 0)?)
    }
}

fn pad_seq(hidden: &Tensor, target_len: usize) -> Result<Tensor> {
    let len = hidden.dim(1)?;
    if len < target_len {
        Ok(hidden.pad_with_zeros(1, 0, target_len - len)?)
    } else {
        Ok(hidden.clone())
    }
}

/// The conditional UNet plus text encoder: prompts → denoised latents.
pub struct AudioDiffusion {
    text_encoder: TextEncoder,
    unet: UNet2DConditionModel,
    noise: NoiseSource,
    config: TangoConfig,
    device: Device,
}

impl AudioDiffusion {
    /// Build the UNet from safetensors and pair it with a loaded text encoder.
    ///
    /// `seed` initializes the run's noise stream; the same seed replays the
    /// same latent initializations and posterior draws.
    pub fn new(
        text_encoder: TextEncoder,
        unet_weights: &Path,
        config: &TangoConfig,
        device: &Device,
        seed: u64,
    ) -> Result<Self> {
        let blocks = config
            .block_out_channels
            .iter()
            .map(|&out_channels| BlockConfig {
                out_channels,
                use_cross_attn: Some(1),
                attention_head_dim: config.attention_head_dim,
            })
            .collect();
        let unet_config = UNet2DConditionModelConfig {
            blocks,
            cross_attention_dim: config.cross_attention_dim,
            ..Default::default()
        };
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[unet_weights], DType::F32, device)?
        };
        let unet = UNet2DConditionModel::new(
            vb,
            config.latent_channels,
            config.latent_channels,
            false,
            unet_config,
        )?;
        Ok(Self {
            text_encoder,
            unet,
            noise: NoiseSource::new(seed),
            config: config.clone(),
            device: device.clone(),
        })
    }

    /// Run classifier-free-guided denoising for one prompt batch.
    ///
    /// The scheduler supplies the timestep schedule; `adjustment` decides how
    /// many of those iterations run and how guidance is weighted across them.
    /// Returns latents `[B, C, T, F]`.
    pub fn inference(
        &mut self,
        prompts: &[&str],
        scheduler: &mut DdpmScheduler,
        steps: usize,
        guidance: f64,
        adjustment: &ScheduleAdjustment,
    ) -> Result<Tensor> {
        if prompts.is_empty() {
            return Err(Error::Config("empty prompt batch".into()));
        }
        let batch = prompts.len();

        let cond = self.text_encoder.encode(prompts)?;
        let empty: Vec<&str> = vec![""; batch];
        let uncond = self.text_encoder.encode(&empty)?;
        let context_len = cond.dim(1)?.max(uncond.dim(1)?);
        let cond = pad_seq(&cond, context_len)?;
        let uncond = pad_seq(&uncond, context_len)?;
        // Unconditional first, conditional second.
        let context = Tensor::cat(&[&uncond, &cond], 0)?;

        scheduler.set_timesteps(steps)?;
        let total = adjustment.effective_steps(steps);

        let mut latents = self.noise.randn(
            &[
                batch,
                self.config.latent_channels,
                self.config.latent_frames,
                self.config.latent_freq,
            ],
            &self.device,
        )?;

        for (index, &timestep) in scheduler.timesteps()[..total].iter().enumerate() {
            let latent_in = Tensor::cat(&[&latents, &latents], 0)?;
            let noise_pred = self.unet.forward(&latent_in, timestep as f64, &context)?;
            let halves = noise_pred.chunk(2, 0)?;
            let (uncond_eps, cond_eps) = (&halves[0], &halves[1]);

            let g = adjustment.guidance_at(index, total, guidance);
            let guided = (uncond_eps + ((cond_eps - uncond_eps)? * g)?)?;
            let guided = (guided * adjustment.noise_scale_at(index, total))?;

            latents = scheduler.step(&guided, timestep, &latents, &mut self.noise)?;
        }

        Ok(latents)
    }
}
