//! Text-to-audio generation over a test set, with evaluation.
//!
//! Loads a TANGO checkpoint, generates one 16 kHz WAV per prompt record into
//! a parameter-named run directory, then scores the directory against the
//! reference recordings and appends the result to the shared summary log.
//!
//! Re-running the same command resumes an interrupted run: batches whose
//! output files are already on disk are skipped.
//!
//! Exit code 0 on success, non-zero on any fatal error.

use std::path::PathBuf;

use clap::Parser;

use tango_infer::config::{ScheduleAdjustment, ScheduleMode};
use tango_infer::eval::{CommandEvaluator, Evaluator};
use tango_infer::model::{parse_device, Tango};
use tango_infer::pipeline::{generate_all, OUTPUT_SAMPLE_RATE};
use tango_infer::prompts::load_prompts;
use tango_infer::run::{prepare_run_dir, run_id_now, RunConfig};
use tango_infer::scheduler::{DdpmScheduler, DdpmSchedulerConfig};

#[derive(Parser, Debug)]
#[command(
    name = "tango-infer",
    about = "Inference for the text-to-audio generation task",
    long_about = "Generate audio for every prompt in a line-delimited JSON test file,\n\
                  then evaluate the output directory against reference recordings.\n\
                  Re-running the same command resumes at batch granularity."
)]
struct Args {
    /// Tango huggingface checkpoint (repo id or local directory).
    #[arg(long, default_value = "declare-lab/tango")]
    checkpoint: String,

    /// JSON file containing the test prompts for generation.
    #[arg(long, default_value = "data/test_audiocaps_subset.json")]
    test_file: PathBuf,

    /// Key containing the text in the json file.
    #[arg(long, default_value = "captions")]
    text_key: String,

    /// Device to use for inference (auto, cpu, cuda, cuda:N).
    #[arg(long, default_value = "cuda:0")]
    device: String,

    /// How many denoising steps for generation.
    #[arg(long, default_value_t = 200)]
    num_steps: usize,

    /// Guidance scale for classifier free guidance.
    #[arg(long, default_value_t = 3.0)]
    guidance: f64,

    /// Batch size for generation.
    #[arg(long, default_value_t = 8)]
    batch_size: usize,

    /// Root directory for run outputs and the result log.
    #[arg(long, default_value = "./output")]
    logdir: PathBuf,

    /// Folder containing the test reference wav files.
    #[arg(long, default_value = "data/audiocaps_test_references/subset")]
    test_references: PathBuf,

    /// Schedule adjustment mode (none, reweight, truncate).
    #[arg(long, default_value = "none")]
    adjust_mode: String,

    /// Seed everything.
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Early-half guidance scale factor.
    #[arg(long, default_value_t = 1.0)]
    s1: f64,

    /// Late-half guidance scale factor.
    #[arg(long, default_value_t = 1.0)]
    s2: f64,

    /// Early-half noise scale factor.
    #[arg(long, default_value_t = 1.0)]
    b1: f64,

    /// Late-half noise scale factor.
    #[arg(long, default_value_t = 1.0)]
    b2: f64,

    /// Schedule magnitude.
    #[arg(long, default_value_t = 1.0)]
    m: f64,

    /// External evaluator executable. When omitted, evaluation is skipped.
    #[arg(long)]
    evaluator: Option<PathBuf>,

    /// Skip generation and evaluate an existing output directory.
    #[arg(long, default_value_t = false)]
    eval_only: bool,

    /// Use this output directory instead of deriving a fresh run name
    /// (required with --eval-only).
    #[arg(long)]
    output_dir: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mode: ScheduleMode = args.adjust_mode.parse()?;
    let adjustment = ScheduleAdjustment {
        mode,
        s1: args.s1,
        s2: args.s2,
        b1: args.b1,
        b2: args.b2,
        magnitude: args.m,
    };
    let config = RunConfig {
        checkpoint: args.checkpoint.clone(),
        test_file: args.test_file.clone(),
        text_key: args.text_key.clone(),
        device: args.device.clone(),
        num_steps: args.num_steps,
        guidance: args.guidance,
        batch_size: args.batch_size,
        logdir: args.logdir.clone(),
        test_references: args.test_references.clone(),
        seed: args.seed,
        adjustment,
    };
    config.validate()?;

    if args.eval_only && args.output_dir.is_none() {
        anyhow::bail!("--eval-only requires --output-dir");
    }

    let prompts = load_prompts(&config.test_file, &config.text_key)?;

    let run_dir = match &args.output_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            dir.clone()
        }
        None => prepare_run_dir(&config, run_id_now())?,
    };
    tracing::info!(run_dir = %run_dir.display(), mode = %adjustment.mode, "starting run");

    let mut scheduler = DdpmScheduler::new(DdpmSchedulerConfig::default());

    if !args.eval_only {
        let device = parse_device(&config.device)?;
        tracing::info!(device = ?device, seed = config.seed, "using device");

        let mut tango = Tango::load(&config.checkpoint, &device, config.seed)?;
        let report = generate_all(&mut tango, &mut scheduler, &prompts, &run_dir, &config)?;
        tracing::info!(
            generated = report.generated_batches,
            skipped = report.skipped_batches,
            "generation finished"
        );
    }

    match &args.evaluator {
        Some(command) => {
            let evaluator = CommandEvaluator::new(command, OUTPUT_SAMPLE_RATE);
            let metrics = evaluator.evaluate(&run_dir, &config.test_references)?;
            let log_path = tango_infer::eval::write_report(
                &config.logdir,
                metrics,
                &config,
                scheduler.config(),
                prompts.len(),
                &run_dir,
            )?;
            tracing::info!(log = %log_path.display(), "evaluation result appended");
        }
        None => {
            tracing::warn!("no --evaluator given, skipping evaluation");
        }
    }

    Ok(())
}
