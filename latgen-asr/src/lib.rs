//! latgen-asr: streaming WFST lattice decoder for online speech recognition.
//!
//! The crate decodes audio incrementally: a [`session::Session`] accepts
//! raw PCM in caller-chosen chunks, advances a token-passing beam search
//! over an immutable HCLG graph, detects utterance endpoints from trailing
//! silence, and extracts partial or final hypotheses and lattices on
//! demand.
//!
//! # Architecture
//!
//! - [`model::ModelBundle`]: the immutable artifacts (acoustic model,
//!   search graph, word symbols, feature transforms), loaded once and
//!   shared read-only across sessions
//! - [`features::FeaturePipeline`]: streaming log-mel front end with the
//!   bundle's CMVN / splice+LDA / fMLLR transform chain
//! - [`decoder::LatticeDecoder`]: frame-synchronous token passing with
//!   beam, `max_active` and `min_active` pruning
//! - [`session::Session`]: the public decode loop tying them together
//!
//! # Quick Start
//!
//! ```ignore
//! use latgen_asr::config::DecoderConfig;
//! use latgen_asr::model::ModelBundle;
//! use latgen_asr::session::Session;
//! use std::sync::Arc;
//!
//! let bundle = Arc::new(ModelBundle::load("model_dir".as_ref())?);
//! let mut session = Session::new(bundle, DecoderConfig::default())?;
//!
//! loop {
//!     let chunk = next_audio_chunk();
//!     if chunk.is_empty() {
//!         break;
//!     }
//!     session.accept_audio(&chunk)?;
//!     session.decode(8000)?;
//!     if session.endpoint_detected() {
//!         break;
//!     }
//! }
//!
//! session.input_finished();
//! session.decode(usize::MAX)?;
//! session.finalize_decoding();
//!
//! for word in &session.best_path().words {
//!     print!("{} ", session.word(*word)?);
//! }
//! ```

pub mod config;
pub mod decodable;
pub mod decoder;
pub mod endpoint;
pub mod error;
pub mod features;
pub mod fst;
pub mod lattice;
pub mod model;
pub mod session;
pub mod symbols;

pub use config::{DecoderConfig, EndpointConfig, ModelPaths};
pub use error::{Error, Result};
pub use lattice::{Hypothesis, Lattice};
pub use model::ModelBundle;
pub use session::Session;
pub use symbols::WordId;
