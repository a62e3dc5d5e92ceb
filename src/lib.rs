//! Batched text-to-audio diffusion inference with evaluation.
//!
//! Drives a pretrained TANGO latent diffusion checkpoint over a file of test
//! prompts and scores the generated clips against reference recordings.
//!
//! ## Pipeline
//!
//! ```text
//! prompt records (JSONL) ──→ fixed-size batches
//!                                  ↓ (skip batches already on disk)
//!                  UNet denoising loop (classifier-free guidance)
//!                                  ↓
//!                  AutoencoderKL decoder (latent → mel)
//!                                  ↓
//!                  HiFiGAN vocoder (mel → 16 kHz waveform)
//!                                  ↓
//!                  <logdir>/<run>/<stem>.wav
//!                                  ↓ (after all batches)
//!                  external evaluator → tango_checkpoint_summary.jsonl
//! ```
//!
//! Re-running with identical arguments against an existing run directory
//! resumes at batch granularity: complete batches are skipped, their files
//! left byte-for-byte untouched.
//!
//! ## Modules
//!
//! - [`prompts`] — line-delimited JSON prompt loading
//! - [`run`] — run identity and output directory naming
//! - [`config`] — schedule adjustment and checkpoint geometry
//! - [`scheduler`] — DDPM noise scheduler
//! - [`model`] — the diffusion stack (text encoder, UNet, VAE, vocoder)
//! - [`pipeline`] — batched generation with resume-by-batch
//! - [`manifest`] — per-run batch completion tracking
//! - [`eval`] — external evaluation and the append-only result log
//! - [`audio`] — WAV I/O

pub mod audio;
pub mod config;
pub mod eval;
pub mod manifest;
pub mod model;
pub mod pipeline;
pub mod prompts;
pub mod run;
pub mod scheduler;

mod error;

pub use error::{Error, Result};
