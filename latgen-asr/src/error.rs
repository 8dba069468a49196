//! Error types for latgen-asr organized by processing stage.

use std::path::PathBuf;
use thiserror::Error;

/// Decoder error variants organized by processing stage.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration stage error
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Model bundle loading stage error
    #[error(transparent)]
    Model(#[from] ModelError),

    /// Audio input stage error
    #[error(transparent)]
    Audio(#[from] AudioError),

    /// Search stage error
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Hypothesis/lattice extraction error
    #[error(transparent)]
    Lattice(#[from] LatticeError),
}

/// Configuration errors. Fatal at session creation: no session is built.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Beam must be positive
    #[error("invalid beam: {beam} (must be > 0)")]
    InvalidBeam { beam: f32 },

    /// Lattice beam must be positive
    #[error("invalid lattice beam: {lattice_beam} (must be > 0)")]
    InvalidLatticeBeam { lattice_beam: f32 },

    /// Acoustic scale must be positive
    #[error("invalid acoustic scale: {acoustic_scale} (must be > 0)")]
    InvalidAcousticScale { acoustic_scale: f32 },

    /// Active-token bounds are inconsistent
    #[error("invalid active token bounds: min_active {min_active} > max_active {max_active}")]
    ActiveBounds {
        min_active: usize,
        max_active: usize,
    },

    /// max_active must be positive
    #[error("max_active must be > 0")]
    ZeroMaxActive,

    /// Only 8 and 16 bit input is supported
    #[error("unsupported bits per sample: {bits} (expected 8 or 16)")]
    InvalidBitsPerSample { bits: u32 },

    /// A required model path option was not set
    #[error("missing required option: {option}")]
    MissingPath { option: &'static str },

    /// Unrecognized option keys are rejected, not ignored
    #[error("unknown configuration option: {key:?}")]
    UnknownOption { key: String },

    /// Config file line could not be parsed
    #[error("malformed configuration at line {line}: {text:?}")]
    Malformed { line: usize, text: String },

    /// Option value could not be parsed
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },

    /// IO error while reading the config file
    #[error("failed to read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Model bundle loading errors. Fatal at creation.
#[derive(Debug, Error)]
pub enum ModelError {
    /// IO error while reading a model artifact
    #[error("failed to read model file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Artifact exists but could not be parsed
    #[error("corrupt model file {path:?} at line {line}: {message}")]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },

    /// Model metadata JSON error
    #[error("invalid model metadata {path:?}: {source}")]
    Metadata {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// Artifact dimensions are mutually inconsistent
    #[error("dimension mismatch in {what}: expected {expected}, got {got}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    /// Graph references an acoustic unit the model does not have
    #[error("graph ilabel {ilabel} exceeds acoustic model pdf count {num_pdfs}")]
    IlabelOutOfRange { ilabel: u32, num_pdfs: usize },
}

/// Audio input errors. Recoverable: the chunk is rejected, the session
/// remains usable.
#[derive(Debug, Error)]
pub enum AudioError {
    /// 16-bit PCM chunk with an odd number of bytes
    #[error("truncated 16-bit PCM chunk: {len} bytes")]
    OddByteLength { len: usize },
}

/// Search errors. Recoverable: the session stays usable for further audio.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The live token set became empty at this frame
    #[error("search failure at frame {frame}: no token survived the beam")]
    SearchFailure { frame: usize },

    /// decode() after finalize_decoding()
    #[error("cannot decode: session already finalized")]
    SessionFinalized,
}

/// Hypothesis and lattice extraction errors. Recoverable lookup/argument
/// failures.
#[derive(Debug, Error)]
pub enum LatticeError {
    /// n-best request with k == 0
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Word identifier outside the symbol table domain
    #[error("unknown word id {id} (vocabulary size {vocab_size})")]
    UnknownWordId { id: u32, vocab_size: usize },

    /// Lattice requested before any frame was decoded
    #[error("cannot get a lattice: no frames decoded")]
    NoFramesDecoded,
}

/// Result type alias for latgen-asr operations.
pub type Result<T> = std::result::Result<T, Error>;
