//! CLI argument definitions using clap.

use clap::{Parser, Subcommand};
use eyre::Result;

#[derive(Debug, Parser)]
#[command(name = "latgen")]
#[command(about = "Streaming WFST lattice decoding tools")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Decode a WAV file incrementally, printing partial hypotheses
    Decode(crate::decode::Args),

    /// Print summary information about a model bundle
    Info(crate::info::Args),
}

/// Execute CLI command - separated for testing.
pub fn run_cli(cli: Cli) -> Result<()> {
    tracing::debug!(?cli, "parsed arguments");

    match cli.command {
        Commands::Decode(args) => {
            crate::decode::execute(args.try_into()?)?;
            Ok(())
        }
        Commands::Info(args) => crate::info::execute(args),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_decode_command() {
        let cli = Cli::parse_from(["latgen", "decode", "audio.wav", "--model-dir", "model"]);

        match &cli.command {
            Commands::Decode(args)
                if args.wav.to_str() == Some("audio.wav")
                    && args.model_dir.to_str() == Some("model") =>
            {
                assert_eq!(args.chunk_samples, 8000);
                assert!(args.nbest.is_none());
                assert!(!args.print_lattice);
            }
            _ => panic!("unexpected command: {:?}", cli.command),
        }
    }

    #[test]
    fn parses_decode_with_options() {
        let cli = Cli::parse_from([
            "latgen",
            "decode",
            "audio.wav",
            "--model-dir",
            "model",
            "--chunk-samples",
            "4000",
            "--nbest",
            "5",
            "--print-lattice",
            "--silence-phones",
            "1:2",
        ]);

        match &cli.command {
            Commands::Decode(args) => {
                assert_eq!(args.chunk_samples, 4000);
                assert_eq!(args.nbest, Some(5));
                assert!(args.print_lattice);
                assert_eq!(args.silence_phones.as_deref(), Some("1:2"));
            }
            _ => panic!("unexpected command: {:?}", cli.command),
        }
    }

    #[test]
    fn parses_info_command() {
        let cli = Cli::parse_from(["latgen", "info", "model"]);

        match &cli.command {
            Commands::Info(args) if args.model_dir.to_str() == Some("model") => {}
            _ => panic!("unexpected command: {:?}", cli.command),
        }
    }
}
