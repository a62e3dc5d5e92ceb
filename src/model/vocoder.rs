//! HiFiGAN vocoder: mel spectrogram → audio waveform.
//!
//! ```text
//! Input: [B, 64, T_mel]
//! conv_pre(64, 512, k=7)
//! 5 upsample stages: rates=[5,4,2,2,2], product=160=hop_length
//! Each: LeakyReLU + ConvTranspose1d + multi-kernel ResBlocks (averaged)
//! conv_post → [B, 1, T_audio]
//! tanh
//! Output: T_audio = T_mel × 160  (10 ms of 16 kHz audio per mel frame)
//! ```
//!
//! Convolutions use weight-norm loading via
//! `candle_transformers::models::encodec`.

use candle_core::{Module, Result, Tensor};
use candle_nn::ops::leaky_relu;
use candle_nn::{Conv1d, Conv1dConfig, ConvTranspose1d, ConvTranspose1dConfig, VarBuilder};
use candle_transformers::models::encodec;
use serde::{Deserialize, Serialize};

const LRELU_SLOPE: f64 = 0.1;

/// Vocoder configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VocoderConfig {
    /// Upsample rates per stage (product must equal `hop_length`).
    pub upsample_rates: Vec<usize>,
    /// Transposed-conv kernel sizes (each must differ from its rate by an
    /// even amount so the stage upsamples exactly rate×).
    pub upsample_kernel_sizes: Vec<usize>,
    /// ResBlock kernel sizes.
    pub resblock_kernel_sizes: Vec<usize>,
    /// ResBlock dilation ladder, shared by all kernels.
    pub resblock_dilations: Vec<usize>,
    /// Channel count entering the first upsample stage.
    pub upsample_initial_channel: usize,
    /// Mel hop length in samples.
    pub hop_length: usize,
}

impl Default for VocoderConfig {
    fn default() -> Self {
        Self {
            upsample_rates: vec![5, 4, 2, 2, 2],
            upsample_kernel_sizes: vec![9, 8, 4, 4, 4],
            resblock_kernel_sizes: vec![3, 7, 11],
            resblock_dilations: vec![1, 3, 5],
            upsample_initial_channel: 512,
            hop_length: 160,
        }
    }
}

impl VocoderConfig {
    /// Verify the geometry upsamples each mel frame to exactly `hop_length`
    /// samples.
    pub fn verify(&self) -> crate::Result<()> {
        let product: usize = self.upsample_rates.iter().product();
        if product != self.hop_length {
            return Err(crate::Error::Config(format!(
                "upsample_rates product is {product}, expected hop_length {}",
                self.hop_length
            )));
        }
        if self.upsample_rates.len() != self.upsample_kernel_sizes.len() {
            return Err(crate::Error::Config(format!(
                "{} upsample rates but {} kernel sizes",
                self.upsample_rates.len(),
                self.upsample_kernel_sizes.len()
            )));
        }
        for (&rate, &kernel) in self.upsample_rates.iter().zip(&self.upsample_kernel_sizes) {
            if kernel < rate || (kernel - rate) % 2 != 0 {
                return Err(crate::Error::Config(format!(
                    "kernel {kernel} incompatible with rate {rate}: (kernel - rate) must be even"
                )));
            }
        }
        if self.resblock_kernel_sizes.is_empty() {
            return Err(crate::Error::Config(
                "at least one resblock kernel size is required".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ResBlock: two dilated conv passes per dilation, with residual connections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct ResBlock {
    convs1: Vec<Conv1d>,
    convs2: Vec<Conv1d>,
}

impl ResBlock {
    fn new(channels: usize, kernel: usize, dilations: &[usize], vb: VarBuilder) -> Result<Self> {
        let mut convs1 = Vec::with_capacity(dilations.len());
        let mut convs2 = Vec::with_capacity(dilations.len());
        for (i, &dilation) in dilations.iter().enumerate() {
            let cfg1 = Conv1dConfig {
                dilation,
                padding: (kernel - 1) * dilation / 2,
                ..Default::default()
            };
            convs1.push(encodec::conv1d_weight_norm(
                channels,
                channels,
                kernel,
                cfg1,
                vb.pp(format!("convs1.{i}")),
            )?);
            let cfg2 = Conv1dConfig {
                padding: (kernel - 1) / 2,
                ..Default::default()
            };
            convs2.push(encodec::conv1d_weight_norm(
                channels,
                channels,
                kernel,
                cfg2,
                vb.pp(format!("convs2.{i}")),
            )?);
        }
        Ok(Self { convs1, convs2 })
    }
}

impl Module for ResBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut xs = xs.clone();
        for (conv1, conv2) in self.convs1.iter().zip(&self.convs2) {
            let ys = leaky_relu(&xs, LRELU_SLOPE)?.apply(conv1)?;
            let ys = leaky_relu(&ys, LRELU_SLOPE)?.apply(conv2)?;
            xs = (xs + ys)?;
        }
        Ok(xs)
    }
}

// ---------------------------------------------------------------------------
// Upsample stage: LeakyReLU → ConvTranspose1d → averaged ResBlocks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct UpsampleStage {
    conv_t: ConvTranspose1d,
    resblocks: Vec<ResBlock>,
}

impl UpsampleStage {
    fn new(
        in_dim: usize,
        out_dim: usize,
        rate: usize,
        kernel: usize,
        config: &VocoderConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        let cfg = ConvTranspose1dConfig {
            stride: rate,
            padding: (kernel - rate) / 2,
            ..Default::default()
        };
        let conv_t = encodec::conv_transpose1d_weight_norm(
            in_dim,
            out_dim,
            kernel,
            true,
            cfg,
            vb.pp("conv_t"),
        )?;
        let mut resblocks = Vec::with_capacity(config.resblock_kernel_sizes.len());
        for (i, &k) in config.resblock_kernel_sizes.iter().enumerate() {
            resblocks.push(ResBlock::new(
                out_dim,
                k,
                &config.resblock_dilations,
                vb.pp(format!("resblocks.{i}")),
            )?);
        }
        Ok(Self { conv_t, resblocks })
    }
}

impl Module for UpsampleStage {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = leaky_relu(xs, LRELU_SLOPE)?.apply(&self.conv_t)?;
        let mut sum = self.resblocks[0].forward(&xs)?;
        for resblock in &self.resblocks[1..] {
            sum = (sum + resblock.forward(&xs)?)?;
        }
        sum / self.resblocks.len() as f64
    }
}

// ---------------------------------------------------------------------------
// Vocoder
// ---------------------------------------------------------------------------

/// HiFiGAN generator: `[B, mel_channels, T]` → `[B, 1, T × hop_length]`.
#[derive(Debug, Clone)]
pub struct Vocoder {
    conv_pre: Conv1d,
    stages: Vec<UpsampleStage>,
    conv_post: Conv1d,
}

impl Vocoder {
    pub fn new(mel_channels: usize, config: &VocoderConfig, vb: VarBuilder) -> Result<Self> {
        let initial = config.upsample_initial_channel;
        let pre_cfg = Conv1dConfig {
            padding: 3,
            ..Default::default()
        };
        let conv_pre =
            encodec::conv1d_weight_norm(mel_channels, initial, 7, pre_cfg, vb.pp("conv_pre"))?;

        let mut stages = Vec::with_capacity(config.upsample_rates.len());
        let mut channels = initial;
        for (i, (&rate, &kernel)) in config
            .upsample_rates
            .iter()
            .zip(&config.upsample_kernel_sizes)
            .enumerate()
        {
            let out = channels / 2;
            stages.push(UpsampleStage::new(
                channels,
                out,
                rate,
                kernel,
                config,
                vb.pp(format!("ups.{i}")),
            )?);
            channels = out;
        }

        let post_cfg = Conv1dConfig {
            padding: 3,
            ..Default::default()
        };
        let conv_post = encodec::conv1d_weight_norm(channels, 1, 7, post_cfg, vb.pp("conv_post"))?;

        Ok(Self {
            conv_pre,
            stages,
            conv_post,
        })
    }
}

impl Module for Vocoder {
    fn forward(&self, mel: &Tensor) -> Result<Tensor> {
        let mut xs = mel.apply(&self.conv_pre)?;
        for stage in &self.stages {
            xs = stage.forward(&xs)?;
        }
        leaky_relu(&xs, LRELU_SLOPE)?.apply(&self.conv_post)?.tanh()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_upsample_product() {
        let config = VocoderConfig::default();
        config.verify().unwrap();
        let product: usize = config.upsample_rates.iter().product();
        assert_eq!(product, 160);
    }

    #[test]
    fn bad_upsample_rates_rejected() {
        let config = VocoderConfig {
            upsample_rates: vec![4, 4, 2, 2],
            ..Default::default()
        };
        assert!(config.verify().is_err());
    }

    #[test]
    fn odd_kernel_rate_gap_rejected() {
        let config = VocoderConfig {
            upsample_kernel_sizes: vec![10, 8, 4, 4, 4],
            ..Default::default()
        };
        assert!(config.verify().is_err());
    }
}
