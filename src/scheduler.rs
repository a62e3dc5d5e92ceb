//! DDPM noise scheduler for the denoising loop.
//!
//! One instance is created per run and passed into every inference call; it
//! is never reconfigured mid-run. Its [`DdpmSchedulerConfig`] is what the
//! result log serializes under `scheduler_config`.
//!
//! ## Formulation
//!
//! Ancestral DDPM sampling with an epsilon-predicting model:
//!
//! ```text
//! x0      = (x_t - sqrt(1 - ᾱ_t) * ε) / sqrt(ᾱ_t)
//! μ_{t-1} = sqrt(ᾱ_{t-1}) β_t / (1 - ᾱ_t) * x0
//!         + sqrt(α_t) (1 - ᾱ_{t-1}) / (1 - ᾱ_t) * x_t
//! x_{t-1} = μ_{t-1} + sqrt(σ²_t) * z,   z ~ N(0, I) for t > 0
//! ```
//!
//! Defaults match the Stable Diffusion 2.1 scheduler config: 1000 training
//! timesteps, scaled-linear betas in [0.00085, 0.012].
//!
//! All randomness flows through a [`NoiseSource`]: a seeded PCG stream that
//! makes a run reproducible on any device, CPU included.

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Seeded source of standard-normal noise tensors.
///
/// One instance per run; both the initial latent draw and every posterior
/// noise draw come from the same stream, so a (seed, prompt batch, schedule)
/// triple fully determines the generated waveforms.
pub struct NoiseSource {
    /// PCG XSH RR 64/32 state.
    state: u64,
}

impl NoiseSource {
    pub fn new(seed: u64) -> Self {
        // Mix the seed with the PCG increment to avoid degenerate states.
        let state = seed
            .wrapping_mul(2685821657736338717)
            .wrapping_add(1442695040888963407);
        Self { state }
    }

    fn next_f32(&mut self) -> f32 {
        let old_state = self.state;
        self.state = old_state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        let xorshifted = (((old_state >> 18) ^ old_state) >> 27) as u32;
        let rot = (old_state >> 59) as u32;
        let output = xorshifted.rotate_right(rot);
        (output as f32) / (u32::MAX as f32)
    }

    /// Draw a standard-normal tensor of the given shape via Box-Muller.
    pub fn randn(&mut self, shape: &[usize], device: &Device) -> Result<Tensor> {
        let count: usize = shape.iter().product();
        let mut data = Vec::with_capacity(count);
        while data.len() < count {
            let u1 = self.next_f32().max(f32::EPSILON);
            let u2 = self.next_f32();
            let radius = (-2.0 * u1.ln()).sqrt();
            let theta = 2.0 * std::f32::consts::PI * u2;
            data.push(radius * theta.cos());
            if data.len() < count {
                data.push(radius * theta.sin());
            }
        }
        Ok(Tensor::from_vec(data, shape, device)?)
    }

    /// Draw noise shaped like `reference`, on its device.
    pub fn randn_like(&mut self, reference: &Tensor) -> Result<Tensor> {
        self.randn(reference.dims(), reference.device())
    }
}

/// Spacing of the training beta schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
    /// Betas linear in t.
    Linear,
    /// sqrt(betas) linear in t.
    ScaledLinear,
}

/// What quantity the diffusion model predicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionType {
    Epsilon,
    VPrediction,
}

/// Configuration shared by every call in a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DdpmSchedulerConfig {
    pub num_train_timesteps: usize,
    pub beta_start: f64,
    pub beta_end: f64,
    pub beta_schedule: BetaSchedule,
    pub prediction_type: PredictionType,
    pub clip_sample: bool,
    pub clip_sample_range: f64,
}

impl Default for DdpmSchedulerConfig {
    fn default() -> Self {
        Self {
            num_train_timesteps: 1000,
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: BetaSchedule::ScaledLinear,
            prediction_type: PredictionType::Epsilon,
            clip_sample: false,
            clip_sample_range: 1.0,
        }
    }
}

/// DDPM ancestral sampler.
pub struct DdpmScheduler {
    config: DdpmSchedulerConfig,
    alphas_cumprod: Vec<f64>,
    timesteps: Vec<usize>,
    step_ratio: usize,
}

impl DdpmScheduler {
    pub fn new(config: DdpmSchedulerConfig) -> Self {
        let t = config.num_train_timesteps;
        let mut alphas_cumprod = Vec::with_capacity(t);
        let mut cumprod = 1.0;
        for i in 0..t {
            let frac = i as f64 / (t - 1).max(1) as f64;
            let beta = match config.beta_schedule {
                BetaSchedule::Linear => config.beta_start + (config.beta_end - config.beta_start) * frac,
                BetaSchedule::ScaledLinear => {
                    let sqrt = config.beta_start.sqrt()
                        + (config.beta_end.sqrt() - config.beta_start.sqrt()) * frac;
                    sqrt * sqrt
                }
            };
            cumprod *= 1.0 - beta;
            alphas_cumprod.push(cumprod);
        }

        Self {
            config,
            alphas_cumprod,
            timesteps: Vec::new(),
            step_ratio: 1,
        }
    }

    pub fn config(&self) -> &DdpmSchedulerConfig {
        &self.config
    }

    /// Set up the inference timestep schedule: `num_inference_steps` evenly
    /// strided training timesteps, descending.
    pub fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<()> {
        let t = self.config.num_train_timesteps;
        if num_inference_steps == 0 || num_inference_steps > t {
            return Err(Error::Config(format!(
                "num_inference_steps must be in 1..={t}, got {num_inference_steps}"
            )));
        }
        self.step_ratio = t / num_inference_steps;
        self.timesteps = (0..num_inference_steps)
            .map(|i| i * self.step_ratio)
            .rev()
            .collect();
        Ok(())
    }

    /// The inference timesteps, descending. Empty before `set_timesteps`.
    pub fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    /// One ancestral step: predicted noise + current sample at `timestep` →
    /// the sample at the previous timestep.
    ///
    /// For every timestep except the last a posterior noise draw is taken
    /// from `noise`.
    pub fn step(
        &self,
        model_output: &Tensor,
        timestep: usize,
        sample: &Tensor,
        noise: &mut NoiseSource,
    ) -> Result<Tensor> {
        let alpha_prod_t = self.alphas_cumprod[timestep];
        let prev_timestep = timestep as isize - self.step_ratio as isize;
        let alpha_prod_prev = if prev_timestep >= 0 {
            self.alphas_cumprod[prev_timestep as usize]
        } else {
            1.0
        };
        let beta_prod_t = 1.0 - alpha_prod_t;
        let current_alpha = alpha_prod_t / alpha_prod_prev;
        let current_beta = 1.0 - current_alpha;

        let pred_original = match self.config.prediction_type {
            PredictionType::Epsilon => {
                ((sample - (model_output * beta_prod_t.sqrt())?)? / alpha_prod_t.sqrt())?
            }
            PredictionType::VPrediction => {
                ((sample * alpha_prod_t.sqrt())? - (model_output * beta_prod_t.sqrt())?)?
            }
        };
        let pred_original = if self.config.clip_sample {
            pred_original.clamp(-self.config.clip_sample_range, self.config.clip_sample_range)?
        } else {
            pred_original
        };

        let original_coeff = alpha_prod_prev.sqrt() * current_beta / beta_prod_t;
        let sample_coeff = current_alpha.sqrt() * (1.0 - alpha_prod_prev) / beta_prod_t;
        let mut prev_sample =
            ((pred_original * original_coeff)? + (sample * sample_coeff)?)?;

        if timestep > 0 {
            let variance = ((1.0 - alpha_prod_prev) / beta_prod_t * current_beta).max(1e-20);
            let draw = noise.randn_like(sample)?;
            prev_sample = (prev_sample + (draw * variance.sqrt())?)?;
        }

        Ok(prev_sample)
    }
}
