//! Run and model configuration.
//!
//! [`ScheduleAdjustment`] packages the denoising-schedule adjustment
//! parameters (mode + four scale factors + magnitude). It is validated once
//! before the batch loop and then threaded immutably into every generation
//! call — the model never carries hidden schedule state between calls.
//!
//! [`TangoConfig`] describes the checkpoint geometry (latent shape, text
//! encoder width, UNet/VAE channels) the loader needs to assemble the model.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::model::vocoder::VocoderConfig;
use crate::{Error, Result};

/// Strategy for redistributing or reducing denoising work across timesteps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleMode {
    /// No adjustment: the scheduler's own timestep spacing is used as-is.
    None,
    /// Guidance is scaled by `s1`/`s2` over the early/late halves of the
    /// schedule, the predicted noise by `b1`/`b2`, and the whole guidance
    /// envelope by `magnitude`.
    Reweight,
    /// Only the first `ceil(magnitude * steps)` denoising iterations run.
    Truncate,
}

impl FromStr for ScheduleMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Self::None),
            "reweight" => Ok(Self::Reweight),
            "truncate" => Ok(Self::Truncate),
            other => Err(Error::Config(format!(
                "unknown schedule mode '{other}' (expected none, reweight or truncate)"
            ))),
        }
    }
}

impl fmt::Display for ScheduleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Reweight => "reweight",
            Self::Truncate => "truncate",
        };
        write!(f, "{name}")
    }
}

/// Denoising-schedule adjustment: mode, four scale params and a magnitude.
///
/// Immutable for the lifetime of a run. Only the generation loop reads it;
/// prompt loading and batch-skip logic never do.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScheduleAdjustment {
    pub mode: ScheduleMode,
    pub s1: f64,
    pub s2: f64,
    pub b1: f64,
    pub b2: f64,
    pub magnitude: f64,
}

impl Default for ScheduleAdjustment {
    fn default() -> Self {
        Self {
            mode: ScheduleMode::None,
            s1: 1.0,
            s2: 1.0,
            b1: 1.0,
            b2: 1.0,
            magnitude: 1.0,
        }
    }
}

impl ScheduleAdjustment {
    /// Reject unusable parameter combinations before any generation work.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("s1", self.s1),
            ("s2", self.s2),
            ("b1", self.b1),
            ("b2", self.b2),
            ("m", self.magnitude),
        ] {
            if !value.is_finite() {
                return Err(Error::Config(format!(
                    "schedule parameter {name} must be finite, got {value}"
                )));
            }
        }
        if self.mode == ScheduleMode::Truncate
            && !(self.magnitude > 0.0 && self.magnitude <= 1.0)
        {
            return Err(Error::Config(format!(
                "truncate mode requires magnitude in (0, 1], got {}",
                self.magnitude
            )));
        }
        Ok(())
    }

    /// Number of denoising iterations actually executed out of `steps`.
    pub fn effective_steps(&self, steps: usize) -> usize {
        match self.mode {
            ScheduleMode::Truncate => {
                let n = (self.magnitude * steps as f64).ceil() as usize;
                n.clamp(1, steps)
            }
            _ => steps,
        }
    }

    /// Guidance scale for iteration `index` of `total`.
    pub fn guidance_at(&self, index: usize, total: usize, base: f64) -> f64 {
        match self.mode {
            ScheduleMode::Reweight => {
                let half = if index * 2 < total { self.s1 } else { self.s2 };
                base * self.magnitude * half
            }
            _ => base,
        }
    }

    /// Multiplier applied to the guided noise prediction at iteration `index`.
    pub fn noise_scale_at(&self, index: usize, total: usize) -> f64 {
        match self.mode {
            ScheduleMode::Reweight => {
                if index * 2 < total {
                    self.b1
                } else {
                    self.b2
                }
            }
            _ => 1.0,
        }
    }
}

/// Checkpoint geometry for the TANGO diffusion stack.
///
/// Loaded from the checkpoint's `config.json`; all fields default to the
/// published `declare-lab/tango` layout (10 s clips at 16 kHz, 64-bin mel,
/// FLAN-T5-Large conditioning).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TangoConfig {
    /// Channels of the UNet latent.
    pub latent_channels: usize,
    /// Latent extent along the time axis.
    pub latent_frames: usize,
    /// Latent extent along the frequency axis.
    pub latent_freq: usize,
    /// Width of the text-encoder hidden states fed to cross-attention.
    pub cross_attention_dim: usize,
    /// UNet down/up block output channels.
    pub block_out_channels: Vec<usize>,
    /// UNet attention head dimension.
    pub attention_head_dim: usize,
    /// VAE decoder block output channels.
    pub vae_block_out_channels: Vec<usize>,
    /// Residual layers per VAE block.
    pub vae_layers_per_block: usize,
    /// Latent scaling factor applied before first-stage decoding.
    pub vae_scaling_factor: f64,
    /// Mel bins produced by the first-stage decoder.
    pub mel_channels: usize,
    /// Vocoder (mel → waveform) geometry.
    pub vocoder: VocoderConfig,
}

impl Default for TangoConfig {
    fn default() -> Self {
        Self {
            latent_channels: 8,
            latent_frames: 256,
            latent_freq: 16,
            cross_attention_dim: 1024,
            block_out_channels: vec![128, 256, 384, 640],
            attention_head_dim: 8,
            vae_block_out_channels: vec![128, 256, 512],
            vae_layers_per_block: 2,
            vae_scaling_factor: 0.18215,
            mel_channels: 64,
            vocoder: VocoderConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_round_trip() {
        for name in ["none", "reweight", "truncate"] {
            let mode: ScheduleMode = name.parse().unwrap();
            assert_eq!(mode.to_string(), name);
        }
    }

    #[test]
    fn unknown_mode_rejected() {
        let err = "freeu".parse::<ScheduleMode>().unwrap_err();
        assert!(matches!(err, Error::Config(_)), "got {err:?}");
    }

    #[test]
    fn truncate_magnitude_bounds() {
        let adj = ScheduleAdjustment {
            mode: ScheduleMode::Truncate,
            magnitude: 0.0,
            ..Default::default()
        };
        assert!(adj.validate().is_err());

        let adj = ScheduleAdjustment {
            mode: ScheduleMode::Truncate,
            magnitude: 0.25,
            ..Default::default()
        };
        adj.validate().unwrap();
        assert_eq!(adj.effective_steps(200), 50);
        // Never rounds down to zero iterations.
        assert_eq!(adj.effective_steps(1), 1);
    }

    #[test]
    fn non_finite_params_rejected() {
        let adj = ScheduleAdjustment {
            s2: f64::NAN,
            ..Default::default()
        };
        assert!(adj.validate().is_err());
    }

    #[test]
    fn reweight_guidance_halves() {
        let adj = ScheduleAdjustment {
            mode: ScheduleMode::Reweight,
            s1: 2.0,
            s2: 0.5,
            magnitude: 1.0,
            ..Default::default()
        };
        assert_eq!(adj.guidance_at(0, 10, 3.0), 6.0);
        assert_eq!(adj.guidance_at(9, 10, 3.0), 1.5);
        // `none` ignores the scales entirely.
        let plain = ScheduleAdjustment::default();
        assert_eq!(plain.guidance_at(0, 10, 3.0), 3.0);
        assert_eq!(plain.noise_scale_at(0, 10), 1.0);
    }
}
