//! The decoding session: one utterance-at-a-time controller over the
//! feature pipeline, search, and endpointing.
//!
//! A session is a sequential state machine driven by one logical caller:
//! `accept_audio` -> `decode(n)` -> queries -> `input_finished` ->
//! `finalize_decoding` -> final extraction, then optionally `reset` for
//! the next utterance. The model bundle is shared read-only, so any
//! number of sessions may run in parallel against one loaded bundle.

use crate::config::DecoderConfig;
use crate::decodable::GmmDecodable;
use crate::decoder::LatticeDecoder;
use crate::endpoint::{EndpointDetector, EndpointState};
use crate::error::{AudioError, Result};
use crate::features::FeaturePipeline;
use crate::lattice::{self, Hypothesis, Lattice};
use crate::model::ModelBundle;
use crate::symbols::WordId;
use std::sync::Arc;

pub struct Session {
    bundle: Arc<ModelBundle>,
    config: DecoderConfig,
    pipeline: FeaturePipeline,
    decoder: LatticeDecoder,
    endpoint: EndpointDetector,
    final_lattice: Option<Arc<Lattice>>,
}

impl Session {
    /// Create a session against a loaded bundle. Fails on invalid
    /// configuration; the bundle itself was validated at load time.
    pub fn new(bundle: Arc<ModelBundle>, config: DecoderConfig) -> Result<Self> {
        config.validate()?;

        let pipeline = FeaturePipeline::new(bundle.meta.clone(), bundle.transforms.clone());
        let decoder = LatticeDecoder::new(&config, &bundle.graph);
        let endpoint = EndpointDetector::new(
            config.endpoint.clone(),
            bundle.meta.frame_shift_secs(),
        );

        tracing::debug!(
            beam = config.beam,
            max_active = config.max_active,
            "session created"
        );

        Ok(Self {
            bundle,
            config,
            pipeline,
            decoder,
            endpoint,
            final_lattice: None,
        })
    }

    /// Append raw little-endian PCM bytes at the configured sample width.
    /// An empty chunk is a no-op.
    pub fn accept_audio(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }

        let samples: Vec<f32> = match self.config.bits_per_sample {
            8 => bytes.iter().map(|&b| b as f32).collect(),
            _ => {
                if bytes.len() % 2 != 0 {
                    return Err(AudioError::OddByteLength { len: bytes.len() }.into());
                }
                bytes
                    .chunks_exact(2)
                    .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32)
                    .collect()
            }
        };

        self.pipeline.accept_waveform(&samples);
        Ok(())
    }

    /// Append raw waveform samples directly.
    pub fn accept_waveform(&mut self, samples: &[f32]) {
        self.pipeline.accept_waveform(samples);
    }

    /// Advance the search by up to `max_frames` feature frames; returns
    /// how many were actually decoded (possibly 0 when the buffer is
    /// drained). On a search failure the frame is consumed, the error is
    /// reported, and the session stays usable.
    pub fn decode(&mut self, max_frames: usize) -> Result<usize> {
        let mut decodable = GmmDecodable::new(
            &mut self.pipeline,
            &self.bundle.am,
            self.config.acoustic_scale,
        );
        let result = self
            .decoder
            .advance(&self.bundle.graph, &mut decodable, max_frames);
        drop(decodable);

        if !self.decoder.is_finalized() {
            let trailing = self
                .decoder
                .trailing_silence_frames(&self.config.endpoint.silence_phones);
            self.endpoint.update(trailing);
        }

        Ok(result?)
    }

    /// Signal that no more audio will arrive for this utterance, releasing
    /// any feature look-ahead so the remaining frames can be decoded.
    pub fn input_finished(&mut self) {
        self.pipeline.input_finished();
    }

    /// Collapse the lattice to its final immutable form. Idempotent; must
    /// be called before lattice extraction is authoritative.
    pub fn finalize_decoding(&mut self) {
        self.decoder.finalize(&self.bundle.graph);
        if self.final_lattice.is_none() {
            self.final_lattice = lattice::build_lattice(&self.decoder).ok().map(Arc::new);
        }
    }

    /// Reuse this session for a new utterance, keeping the loaded bundle.
    pub fn reset(&mut self) {
        self.pipeline =
            FeaturePipeline::new(self.bundle.meta.clone(), self.bundle.transforms.clone());
        self.decoder.reset(&self.bundle.graph);
        self.endpoint.reset();
        self.final_lattice = None;

        tracing::debug!("session reset");
    }

    /// Whether the speaker is inferred to have finished. Pure read, safe
    /// after every `decode`.
    pub fn endpoint_detected(&self) -> bool {
        self.endpoint.detected()
    }

    pub fn endpoint_state(&self) -> EndpointState {
        self.endpoint.state()
    }

    /// The single best hypothesis: partial mid-utterance, complete after
    /// `finalize_decoding`.
    pub fn best_path(&self) -> Hypothesis {
        match self.decoder.best_path_raw() {
            Some((cost, labels)) => Hypothesis {
                score: -cost,
                words: labels.into_iter().map(WordId).collect(),
            },
            None => Hypothesis {
                score: f32::NEG_INFINITY,
                words: Vec::new(),
            },
        }
    }

    /// Up to `k` distinct hypotheses in non-increasing score order.
    pub fn nbest(&self, k: usize) -> Result<Vec<Hypothesis>> {
        Ok(lattice::nbest(&self.decoder, k)?)
    }

    /// The current pruned lattice: partial mid-utterance, immutable and
    /// idempotent after `finalize_decoding`.
    pub fn lattice(&self) -> Result<Arc<Lattice>> {
        if let Some(lat) = &self.final_lattice {
            return Ok(Arc::clone(lat));
        }
        Ok(Arc::new(lattice::build_lattice(&self.decoder)?))
    }

    /// Resolve a word id through the bundle's symbol table.
    pub fn word(&self, id: WordId) -> Result<&str> {
        Ok(self.bundle.words.word(id)?)
    }

    /// Cumulative samples accepted for this utterance.
    pub fn samples_accepted(&self) -> u64 {
        self.pipeline.samples_accepted()
    }

    /// Cumulative feature frames decoded for this utterance.
    pub fn num_frames_decoded(&self) -> usize {
        self.decoder.num_frames_decoded()
    }

    /// Feature frames buffered and ready to decode.
    pub fn frames_ready(&self) -> usize {
        self.pipeline.num_frames_ready()
    }

    /// Trailing silence behind the best hypothesis, in frames.
    pub fn trailing_silence_frames(&self) -> usize {
        self.endpoint.trailing_silence_frames()
    }

    /// Gap between the best final-state cost and the overall best cost;
    /// infinite while no live hypothesis reaches a final state.
    pub fn final_relative_cost(&self) -> f32 {
        self.decoder.final_relative_cost(&self.bundle.graph)
    }

    pub fn bundle(&self) -> &Arc<ModelBundle> {
        &self.bundle
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EndpointConfig;
    use crate::error::{DecodeError, Error, LatticeError};
    use crate::features::FeatureConfig;
    use crate::fst::{Fst, FstArc, Label, StateId};
    use crate::model::{AcousticModel, FeatureTransforms};
    use crate::symbols::SymbolTable;
    use ndarray::Array2;
    use std::collections::BTreeSet;

    const SILENCE_PHONE: Label = 1;
    const SPEECH_PHONE: Label = 2;
    const WORD_ELEVEN: u32 = 1;
    const WORD_SEVEN: u32 = 2;

    fn arc(ilabel: Label, olabel: Label, weight: f32, nextstate: StateId) -> FstArc {
        FstArc {
            ilabel,
            olabel,
            weight,
            nextstate,
        }
    }

    /// silence* ( eleven | seven ) silence* with "eleven" the cheaper word.
    fn fixture_graph() -> Fst {
        Fst::from_parts(
            0,
            vec![
                vec![
                    arc(SILENCE_PHONE, 0, 0.3, 0),
                    arc(SPEECH_PHONE, WORD_ELEVEN, 0.5, 1),
                    arc(SPEECH_PHONE, WORD_SEVEN, 1.0, 2),
                ],
                vec![arc(SPEECH_PHONE, 0, 0.2, 1), arc(SILENCE_PHONE, 0, 0.3, 3)],
                vec![arc(SPEECH_PHONE, 0, 0.2, 2), arc(SILENCE_PHONE, 0, 0.3, 3)],
                vec![arc(SILENCE_PHONE, 0, 0.1, 3)],
            ],
            vec![f32::INFINITY, f32::INFINITY, f32::INFINITY, 0.0],
        )
    }

    /// Two diagonal Gaussians over 4 log-mel bins: pdf 0 models digital
    /// silence (the log floor), pdf 1 models broadband noise.
    fn fixture_bundle() -> Arc<ModelBundle> {
        let dim = 4;
        let silence_mean = (1e-10f32).ln();

        let mut means = Array2::zeros((2, dim));
        let mut vars = Array2::zeros((2, dim));
        for d in 0..dim {
            means[[0, d]] = silence_mean;
            vars[[0, d]] = 9.0;
            means[[1, d]] = 17.0;
            vars[[1, d]] = 100.0;
        }

        let meta = FeatureConfig {
            sample_rate: 16000,
            frame_length: 400,
            frame_shift: 160,
            num_mel_bins: dim,
            preemphasis: 0.97,
        };
        let am = AcousticModel::from_gaussians(means, vars);
        let words = SymbolTable::from_words(["<eps>", "eleven", "seven"]);

        let bundle = ModelBundle::from_parts(
            meta,
            am,
            fixture_graph(),
            words,
            FeatureTransforms::none(),
        )
        .unwrap();
        Arc::new(bundle)
    }

    fn fixture_config() -> DecoderConfig {
        DecoderConfig {
            beam: 16.0,
            lattice_beam: 10.0,
            max_active: 500,
            min_active: 2,
            acoustic_scale: 0.1,
            bits_per_sample: 16,
            endpoint: EndpointConfig {
                silence_phones: BTreeSet::from([SILENCE_PHONE]),
                min_trailing_silence: 0.3,
            },
        }
    }

    fn session() -> Session {
        Session::new(fixture_bundle(), fixture_config()).unwrap()
    }

    /// Deterministic broadband noise at 16-bit scale.
    fn noise(len: usize) -> Vec<f32> {
        let mut state: u32 = 0x2545_f491;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1103515245).wrapping_add(12345);
                ((state >> 16) % 4001) as f32 - 2000.0
            })
            .collect()
    }

    /// 0.3 s silence, 0.5 s noise, 0.5 s silence.
    fn utterance() -> Vec<f32> {
        let mut samples = vec![0.0; 4800];
        samples.extend(noise(8000));
        samples.extend(vec![0.0; 8000]);
        samples
    }

    #[test]
    fn rejects_invalid_config_at_creation() {
        let config = DecoderConfig {
            acoustic_scale: -1.0,
            ..fixture_config()
        };

        let result = Session::new(fixture_bundle(), config);

        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn chunked_decode_yields_reference_transcript() {
        let mut session = session();
        let samples = utterance();

        let mut decoded_total = 0;
        for chunk in samples.chunks(8000) {
            session.accept_waveform(chunk);
            decoded_total += session.decode(8000).unwrap();

            // consumed frames are monotonic: each frame decoded exactly once
            assert_eq!(session.num_frames_decoded(), decoded_total);
        }
        session.input_finished();
        decoded_total += session.decode(usize::MAX).unwrap();
        assert!(decoded_total > 0);

        session.finalize_decoding();

        let best = session.best_path();
        let words: Vec<&str> = best
            .words
            .iter()
            .map(|&w| session.word(w).unwrap())
            .collect();
        assert_eq!(words, vec!["eleven"]);
    }

    #[test]
    fn endpoint_fires_after_trailing_silence() {
        let mut session = session();

        for chunk in utterance().chunks(8000) {
            session.accept_waveform(chunk);
            session.decode(8000).unwrap();
        }

        // 0.5 s trailing silence decoded against a 0.3 s threshold
        assert!(session.endpoint_detected());
    }

    #[test]
    fn endpoint_resets_when_speech_resumes() {
        let mut session = session();

        let mut samples = vec![0.0; 8000];
        samples.extend(noise(4800));
        session.accept_waveform(&samples);
        session.decode(usize::MAX).unwrap();

        assert!(!session.endpoint_detected());
        assert_eq!(session.endpoint_state(), EndpointState::Listening);
    }

    #[test]
    fn nbest_contains_both_words_in_score_order() {
        let mut session = session();
        session.accept_waveform(&utterance());
        session.input_finished();
        session.decode(usize::MAX).unwrap();
        session.finalize_decoding();

        let hyps = session.nbest(5).unwrap();

        assert!(hyps.len() >= 2);
        for pair in hyps.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
        assert_eq!(session.word(hyps[0].words[0]).unwrap(), "eleven");
        assert!(hyps.iter().any(|h| h
            .words
            .first()
            .is_some_and(|&w| w == WordId(WORD_SEVEN))));

        // best path bounds every n-best score
        let best = session.best_path();
        for hyp in &hyps {
            assert!(best.score >= hyp.score - 1e-4);
        }
    }

    #[test]
    fn finalized_lattice_is_stable_across_calls() {
        let mut session = session();
        session.accept_waveform(&utterance());
        session.input_finished();
        session.decode(usize::MAX).unwrap();
        session.finalize_decoding();

        let first = session.lattice().unwrap();
        session.finalize_decoding();
        let second = session.lattice().unwrap();

        assert_eq!(*first, *second);
    }

    #[test]
    fn lattice_before_decoding_is_an_error() {
        let session = session();

        assert!(matches!(
            session.lattice(),
            Err(Error::Lattice(LatticeError::NoFramesDecoded))
        ));
    }

    #[test]
    fn empty_audio_chunk_is_a_noop() {
        let mut session = session();

        session.accept_audio(&[]).unwrap();

        assert_eq!(session.samples_accepted(), 0);
        assert_eq!(session.frames_ready(), 0);
    }

    #[test]
    fn rejects_odd_byte_count_for_16_bit_audio() {
        let mut session = session();

        let err = session.accept_audio(&[0, 1, 2]).unwrap_err();

        assert!(matches!(
            err,
            Error::Audio(AudioError::OddByteLength { len: 3 })
        ));
        // the rejected chunk left no samples behind
        assert_eq!(session.samples_accepted(), 0);
    }

    #[test]
    fn accept_audio_decodes_little_endian_pcm() {
        let mut session = session();

        let samples: Vec<i16> = vec![0, 1000, -1000, 32767];
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        session.accept_audio(&bytes).unwrap();

        assert_eq!(session.samples_accepted(), 4);
    }

    #[test]
    fn frames_are_consumed_monotonically_and_once() {
        let mut session = session();
        session.accept_waveform(&utterance());

        let ready = session.frames_ready();
        let first = session.decode(10).unwrap();
        let second = session.decode(10).unwrap();
        let rest = session.decode(usize::MAX).unwrap();

        assert_eq!(first, 10);
        assert_eq!(second, 10);
        assert_eq!(first + second + rest, ready);
        assert_eq!(session.num_frames_decoded(), ready);

        // nothing left to decode, not an error
        assert_eq!(session.decode(10).unwrap(), 0);
    }

    #[test]
    fn decode_after_finalize_is_rejected() {
        let mut session = session();
        session.accept_waveform(&utterance());
        session.decode(usize::MAX).unwrap();
        session.finalize_decoding();

        session.accept_waveform(&noise(8000));
        let err = session.decode(usize::MAX).unwrap_err();

        assert!(matches!(
            err,
            Error::Decode(DecodeError::SessionFinalized)
        ));
    }

    #[test]
    fn reset_reuses_the_session_for_a_new_utterance() {
        let mut session = session();
        session.accept_waveform(&utterance());
        session.input_finished();
        session.decode(usize::MAX).unwrap();
        session.finalize_decoding();

        session.reset();

        assert_eq!(session.num_frames_decoded(), 0);
        assert_eq!(session.samples_accepted(), 0);
        assert!(!session.endpoint_detected());

        session.accept_waveform(&utterance());
        session.input_finished();
        session.decode(usize::MAX).unwrap();
        session.finalize_decoding();

        let words: Vec<&str> = session
            .best_path()
            .words
            .iter()
            .map(|&w| session.word(w).unwrap())
            .collect();
        assert_eq!(words, vec!["eleven"]);
    }

    #[test]
    fn unknown_word_id_is_rejected() {
        let session = session();

        let err = session.word(WordId(99)).unwrap_err();

        assert!(matches!(
            err,
            Error::Lattice(LatticeError::UnknownWordId { id: 99, .. })
        ));
    }

    #[test]
    fn final_relative_cost_becomes_finite_in_trailing_silence() {
        let mut session = session();

        session.accept_waveform(&vec![0.0; 4800]);
        session.decode(usize::MAX).unwrap();
        // still in the non-final start state region: a final state may or
        // may not be reachable, but after speech plus silence it must be
        session.accept_waveform(&noise(8000));
        session.accept_waveform(&vec![0.0; 8000]);
        session.decode(usize::MAX).unwrap();

        assert!(session.final_relative_cost().is_finite());
    }
}
