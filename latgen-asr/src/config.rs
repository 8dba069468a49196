//! Decoder configuration: search-beam parameters, endpointing, and the
//! master config-file surface.
//!
//! The config file is line-oriented: one `--key=value` (the leading `--`
//! is optional) per line, `#` comments and blank lines ignored. Keys that
//! are not recognized are rejected with [`ConfigError::UnknownOption`]
//! rather than silently ignored.

use crate::error::ConfigError;
use crate::fst::Label;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Search and endpointing parameters for one session.
#[derive(Clone, Debug)]
pub struct DecoderConfig {
    /// Maximum cost gap from the best token within which tokens stay live.
    pub beam: f32,
    /// Cost gap used when pruning the output lattice at finalization.
    pub lattice_beam: f32,
    /// Hard cap on live tokens per frame.
    pub max_active: usize,
    /// Floor on retained tokens per frame, kept even outside the beam.
    pub min_active: usize,
    /// Scale applied to acoustic log-likelihoods.
    pub acoustic_scale: f32,
    /// PCM sample width accepted by `accept_audio` (8 or 16).
    pub bits_per_sample: u32,
    pub endpoint: EndpointConfig,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            beam: 16.0,
            lattice_beam: 10.0,
            max_active: 7000,
            min_active: 200,
            acoustic_scale: 0.1,
            bits_per_sample: 16,
            endpoint: EndpointConfig::default(),
        }
    }
}

impl DecoderConfig {
    /// Validate parameter ranges. Creation-time failures abort session
    /// construction.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.beam > 0.0) {
            return Err(ConfigError::InvalidBeam { beam: self.beam });
        }
        if !(self.lattice_beam > 0.0) {
            return Err(ConfigError::InvalidLatticeBeam {
                lattice_beam: self.lattice_beam,
            });
        }
        if !(self.acoustic_scale > 0.0) {
            return Err(ConfigError::InvalidAcousticScale {
                acoustic_scale: self.acoustic_scale,
            });
        }
        if self.max_active == 0 {
            return Err(ConfigError::ZeroMaxActive);
        }
        if self.min_active > self.max_active {
            return Err(ConfigError::ActiveBounds {
                min_active: self.min_active,
                max_active: self.max_active,
            });
        }
        if self.bits_per_sample != 8 && self.bits_per_sample != 16 {
            return Err(ConfigError::InvalidBitsPerSample {
                bits: self.bits_per_sample,
            });
        }
        Ok(())
    }
}

/// Endpointing parameters.
#[derive(Clone, Debug)]
pub struct EndpointConfig {
    /// Graph ilabels treated as silence when measuring trailing silence.
    pub silence_phones: BTreeSet<Label>,
    /// Trailing silence, in seconds, after which an endpoint is declared.
    pub min_trailing_silence: f32,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            silence_phones: BTreeSet::new(),
            min_trailing_silence: 0.5,
        }
    }
}

/// Model artifact locations, resolved relative to the config file or
/// model directory.
#[derive(Clone, Debug, Default)]
pub struct ModelPaths {
    pub model: Option<PathBuf>,
    pub hclg: Option<PathBuf>,
    pub words: Option<PathBuf>,
    pub mat_lda: Option<PathBuf>,
    pub mat_fmllr: Option<PathBuf>,
    pub mat_cmvn: Option<PathBuf>,
}

impl ModelPaths {
    /// Default artifact names inside a model directory.
    pub fn in_dir(dir: &Path) -> Self {
        let opt = |name: &str| {
            let p = dir.join(name);
            p.exists().then_some(p)
        };
        Self {
            model: Some(dir.join("final.mdl")),
            hclg: Some(dir.join("HCLG.fst")),
            words: Some(dir.join("words.txt")),
            mat_lda: opt("lda.mat"),
            mat_fmllr: opt("fmllr.mat"),
            mat_cmvn: opt("cmvn.mat"),
        }
    }

    /// Require the mandatory paths, erroring with the option name that is
    /// missing.
    pub fn require(&self) -> Result<(&Path, &Path, &Path), ConfigError> {
        let model = self
            .model
            .as_deref()
            .ok_or(ConfigError::MissingPath { option: "model" })?;
        let hclg = self
            .hclg
            .as_deref()
            .ok_or(ConfigError::MissingPath { option: "hclg" })?;
        let words = self
            .words
            .as_deref()
            .ok_or(ConfigError::MissingPath { option: "words" })?;
        Ok((model, hclg, words))
    }
}

/// Parse a colon-separated phone list, e.g. `1:2:3`.
pub fn parse_silence_phones(value: &str) -> Result<BTreeSet<Label>, ConfigError> {
    let mut phones = BTreeSet::new();
    for part in value.split(':').filter(|p| !p.is_empty()) {
        let phone = part.parse().map_err(|_| ConfigError::InvalidValue {
            key: "endpoint.silence-phones".to_string(),
            value: value.to_string(),
        })?;
        phones.insert(phone);
    }
    Ok(phones)
}

/// Load a master config file into `(ModelPaths, DecoderConfig)`.
///
/// Relative artifact paths are resolved against the config file's parent
/// directory. The returned config is validated.
pub fn load_config_file(path: &Path) -> Result<(ModelPaths, DecoderConfig), ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let base = path.parent().unwrap_or(Path::new("."));
    let (paths, config) = parse_config(&text, base)?;
    config.validate()?;

    tracing::debug!(path = %path.display(), "loaded master config");

    Ok((paths, config))
}

fn parse_config(text: &str, base: &Path) -> Result<(ModelPaths, DecoderConfig), ConfigError> {
    let mut paths = ModelPaths::default();
    let mut config = DecoderConfig::default();

    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let line = line.strip_prefix("--").unwrap_or(line);
        let (key, value) = line.split_once('=').ok_or_else(|| ConfigError::Malformed {
            line: lineno + 1,
            text: raw.to_string(),
        })?;
        let (key, value) = (key.trim(), value.trim());

        let resolve = |v: &str| Some(base.join(v));
        let invalid = |key: &str, value: &str| ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        };

        match key {
            "model" => paths.model = resolve(value),
            "hclg" => paths.hclg = resolve(value),
            "words" => paths.words = resolve(value),
            "mat_lda" => paths.mat_lda = resolve(value),
            "mat_fmllr" => paths.mat_fmllr = resolve(value),
            "mat_cmvn" => paths.mat_cmvn = resolve(value),
            "beam" => config.beam = value.parse().map_err(|_| invalid(key, value))?,
            "lattice-beam" => {
                config.lattice_beam = value.parse().map_err(|_| invalid(key, value))?
            }
            "max-active" => config.max_active = value.parse().map_err(|_| invalid(key, value))?,
            "min-active" => config.min_active = value.parse().map_err(|_| invalid(key, value))?,
            "acoustic-scale" => {
                config.acoustic_scale = value.parse().map_err(|_| invalid(key, value))?
            }
            "bits-per-sample" => {
                config.bits_per_sample = value.parse().map_err(|_| invalid(key, value))?
            }
            "endpoint.silence-phones" => {
                config.endpoint.silence_phones = parse_silence_phones(value)?
            }
            "endpoint.min-trailing-silence" => {
                config.endpoint.min_trailing_silence =
                    value.parse().map_err(|_| invalid(key, value))?
            }
            _ => {
                return Err(ConfigError::UnknownOption {
                    key: key.to_string(),
                });
            }
        }
    }

    Ok((paths, config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(DecoderConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_nonpositive_beam() {
        let config = DecoderConfig {
            beam: 0.0,
            ..DecoderConfig::default()
        };

        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBeam { .. })
        ));
    }

    #[test]
    fn rejects_min_active_above_max_active() {
        let config = DecoderConfig {
            min_active: 10,
            max_active: 5,
            ..DecoderConfig::default()
        };

        assert!(matches!(
            config.validate(),
            Err(ConfigError::ActiveBounds {
                min_active: 10,
                max_active: 5
            })
        ));
    }

    #[test]
    fn rejects_bad_bits_per_sample() {
        let config = DecoderConfig {
            bits_per_sample: 24,
            ..DecoderConfig::default()
        };

        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBitsPerSample { bits: 24 })
        ));
    }

    #[test]
    fn parses_silence_phone_list() {
        let phones = parse_silence_phones("1:2:15").unwrap();

        assert_eq!(phones, BTreeSet::from([1, 2, 15]));
        assert!(parse_silence_phones("1:x").is_err());
        assert!(parse_silence_phones("").unwrap().is_empty());
    }

    #[test]
    fn parses_master_config() {
        let text = "\
# decoder
--model=final.mdl
--hclg=HCLG.fst
--words=words.txt
beam = 12.0
max-active=5000
endpoint.silence-phones=1:2
";
        let (paths, config) = parse_config(text, Path::new("/m")).unwrap();

        assert_eq!(paths.model.as_deref(), Some(Path::new("/m/final.mdl")));
        assert_eq!(config.beam, 12.0);
        assert_eq!(config.max_active, 5000);
        assert_eq!(config.endpoint.silence_phones, BTreeSet::from([1, 2]));
    }

    #[test]
    fn rejects_unknown_option() {
        let result = parse_config("--frobnicate=1\n", Path::new("."));

        assert!(matches!(
            result,
            Err(ConfigError::UnknownOption { key }) if key == "frobnicate"
        ));
    }

    #[test]
    fn rejects_malformed_line() {
        let result = parse_config("beam 12\n", Path::new("."));

        assert!(matches!(result, Err(ConfigError::Malformed { line: 1, .. })));
    }
}
