//! Info subcommand - summarize a model bundle.

use eyre::{Result, WrapErr};
use latgen_asr::model::ModelBundle;
use std::path::PathBuf;

/// CLI arguments for bundle inspection.
#[derive(clap::Args, Debug)]
pub struct Args {
    /// Model bundle directory
    pub model_dir: PathBuf,
}

pub fn execute(args: Args) -> Result<()> {
    let bundle =
        ModelBundle::load(&args.model_dir).wrap_err("failed to load model bundle")?;

    println!("Model bundle: {}", args.model_dir.display());
    println!("  sample rate:   {} Hz", bundle.meta.sample_rate);
    println!(
        "  frame:         {} samples, shift {}",
        bundle.meta.frame_length, bundle.meta.frame_shift
    );
    println!("  mel bins:      {}", bundle.meta.num_mel_bins);
    println!("  acoustic pdfs: {}", bundle.am.num_pdfs());
    println!("  graph states:  {}", bundle.graph.num_states());
    println!("  vocabulary:    {} words", bundle.words.len());

    Ok(())
}
