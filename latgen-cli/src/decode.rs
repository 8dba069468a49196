//! Decode subcommand - stream a WAV file through a session in chunks.

use eyre::{Result, WrapErr, eyre};
use hound::{SampleFormat, WavReader};
use latgen_asr::config::{self, DecoderConfig};
use latgen_asr::error::{DecodeError, Error};
use latgen_asr::model::ModelBundle;
use latgen_asr::session::Session;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// CLI arguments for incremental decoding.
#[derive(clap::Args, Debug)]
pub struct Args {
    /// Path to the input WAV file (mono, model sample rate)
    pub wav: PathBuf,

    /// Model bundle directory (model.json, final.mdl, HCLG.fst, words.txt)
    #[arg(long)]
    pub model_dir: PathBuf,

    /// Master config file; when given it supplies the model paths and
    /// decoder options and the tuning flags below are ignored
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Samples fed per accept/decode round
    #[arg(long, default_value_t = 8000)]
    pub chunk_samples: usize,

    /// Also print the top-k hypotheses after finalization
    #[arg(long)]
    pub nbest: Option<usize>,

    /// Dump the final lattice states and arcs
    #[arg(long)]
    pub print_lattice: bool,

    /// Decoding beam
    #[arg(long)]
    pub beam: Option<f32>,

    /// Lattice pruning beam
    #[arg(long)]
    pub lattice_beam: Option<f32>,

    /// Cap on live search tokens
    #[arg(long)]
    pub max_active: Option<usize>,

    /// Floor on live search tokens
    #[arg(long)]
    pub min_active: Option<usize>,

    /// Acoustic log-likelihood scale
    #[arg(long)]
    pub acoustic_scale: Option<f32>,

    /// Colon-separated silence phone ilabels for endpointing
    #[arg(long)]
    pub silence_phones: Option<String>,

    /// Trailing silence in seconds that triggers an endpoint
    #[arg(long)]
    pub min_trailing_silence: Option<f32>,
}

/// Resolved configuration for a decode run.
pub struct Config {
    pub wav: PathBuf,
    pub bundle: Arc<ModelBundle>,
    pub decoder: DecoderConfig,
    pub chunk_samples: usize,
    pub nbest: Option<usize>,
    pub print_lattice: bool,
}

impl TryFrom<Args> for Config {
    type Error = eyre::Error;

    fn try_from(args: Args) -> Result<Self> {
        let (bundle, decoder) = match &args.config {
            Some(path) => {
                let (paths, decoder) =
                    config::load_config_file(path).wrap_err("failed to load master config")?;
                let meta = path.parent().unwrap_or(Path::new(".")).join("model.json");
                let bundle = ModelBundle::load_with_paths(meta, &paths)
                    .wrap_err("failed to load model bundle")?;
                (bundle, decoder)
            }
            None => {
                let bundle = ModelBundle::load(&args.model_dir)
                    .wrap_err("failed to load model bundle")?;
                let mut decoder = DecoderConfig::default();
                if let Some(beam) = args.beam {
                    decoder.beam = beam;
                }
                if let Some(lattice_beam) = args.lattice_beam {
                    decoder.lattice_beam = lattice_beam;
                }
                if let Some(max_active) = args.max_active {
                    decoder.max_active = max_active;
                }
                if let Some(min_active) = args.min_active {
                    decoder.min_active = min_active;
                }
                if let Some(acoustic_scale) = args.acoustic_scale {
                    decoder.acoustic_scale = acoustic_scale;
                }
                if let Some(phones) = &args.silence_phones {
                    decoder.endpoint.silence_phones = config::parse_silence_phones(phones)?;
                }
                if let Some(secs) = args.min_trailing_silence {
                    decoder.endpoint.min_trailing_silence = secs;
                }
                decoder.validate()?;
                (bundle, decoder)
            }
        };

        Ok(Self {
            wav: args.wav,
            bundle: Arc::new(bundle),
            decoder,
            chunk_samples: args.chunk_samples,
            nbest: args.nbest,
            print_lattice: args.print_lattice,
        })
    }
}

/// Run the incremental decode loop; returns the final transcript.
pub fn execute(config: Config) -> Result<String> {
    let samples = read_wav_mono(&config.wav, config.bundle.meta.sample_rate)?;
    tracing::debug!(samples = samples.len(), "loaded audio");

    let mut session = Session::new(Arc::clone(&config.bundle), config.decoder)?;

    for chunk in samples.chunks(config.chunk_samples.max(1)) {
        session.accept_waveform(chunk);
        let decoded = decode_chunk(&mut session, config.chunk_samples)?;

        if decoded > 0 {
            let partial = transcript(&session)?;
            println!(
                "Hypothesis: {:?} (speaker finished speaking: {})",
                partial,
                session.endpoint_detected()
            );
        }
    }

    session.input_finished();
    while decode_chunk(&mut session, usize::MAX)? > 0 {}
    session.finalize_decoding();

    let best = session.best_path();
    let text = transcript(&session)?;
    println!("Final hypothesis ({:.2}): {:?}", best.score, text);

    if let Some(k) = config.nbest {
        for (rank, hyp) in session.nbest(k)?.iter().enumerate() {
            let words: Result<Vec<&str>> = hyp
                .words
                .iter()
                .map(|&w| session.word(w).map_err(Into::into))
                .collect();
            println!("{}. ({:.2}) {}", rank + 1, hyp.score, words?.join(" "));
        }
    }

    if config.print_lattice {
        let lattice = session.lattice()?;
        println!(
            "Lattice: {} states, total score {:.2}",
            lattice.states.len(),
            lattice.total_score
        );
        for state in &lattice.states {
            let is_final = state.final_weight.is_some();
            println!("  State {}{}", state.id, if is_final { " [final]" } else { "" });
            for arc in &state.arcs {
                let word = if arc.olabel == 0 {
                    "<eps>"
                } else {
                    session.word(latgen_asr::WordId(arc.olabel))?
                };
                println!(
                    "    -> {} {}:{} / {:.2}",
                    arc.nextstate, arc.ilabel, word, arc.weight
                );
            }
        }
    }

    Ok(text)
}

/// Decode with a frame budget, treating a search failure as a degraded
/// step rather than a fatal error: the session stays usable.
fn decode_chunk(session: &mut Session, max_frames: usize) -> Result<usize> {
    let before = session.num_frames_decoded();
    match session.decode(max_frames) {
        Ok(decoded) => Ok(decoded),
        Err(Error::Decode(DecodeError::SearchFailure { frame })) => {
            tracing::warn!(frame, "search failure; continuing degraded");
            Ok(session.num_frames_decoded() - before)
        }
        Err(e) => Err(e.into()),
    }
}

fn transcript(session: &Session) -> Result<String> {
    let words: Result<Vec<&str>> = session
        .best_path()
        .words
        .iter()
        .map(|&w| session.word(w).map_err(Into::into))
        .collect();
    Ok(words?.join(" "))
}

/// Load a WAV file as mono samples at 16-bit scale, validating the sample
/// rate against the model bundle.
fn read_wav_mono(path: &Path, expected_rate: u32) -> Result<Vec<f32>> {
    let mut reader = WavReader::open(path).wrap_err("failed to open WAV file")?;
    let spec = reader.spec();

    if spec.sample_rate != expected_rate {
        return Err(eyre!(
            "sample rate mismatch: model expects {} Hz, file is {} Hz",
            expected_rate,
            spec.sample_rate
        ));
    }
    if spec.channels == 0 || spec.channels > 2 {
        return Err(eyre!("unsupported channel count: {}", spec.channels));
    }

    let mut samples: Vec<f32> = match spec.sample_format {
        SampleFormat::Int => reader
            .samples::<i16>()
            .map(|s| s.map(|s| s as f32))
            .collect::<hound::Result<_>>()?,
        SampleFormat::Float => reader
            .samples::<f32>()
            .map(|s| s.map(|s| s * 32768.0))
            .collect::<hound::Result<_>>()?,
    };

    if spec.channels == 2 {
        samples = samples
            .chunks(2)
            .map(|pair| pair.iter().sum::<f32>() / 2.0)
            .collect();
    }

    Ok(samples)
}
