//! The decodable seam between the feature front end and the search.
//!
//! The decoder only ever sees scaled per-frame log-likelihoods through
//! this trait, which keeps the search testable against synthetic scores.

use crate::features::FeaturePipeline;
use crate::fst::Label;
use crate::model::AcousticModel;
use std::collections::HashMap;

/// Source of acoustic scores for the token-passing search.
pub trait Decodable {
    /// Scaled log-likelihood of emitting `ilabel` (pdf `ilabel - 1`) at
    /// `frame`. Only called with `frame < num_frames_ready()` and
    /// `ilabel > 0`.
    fn log_likelihood(&mut self, frame: usize, ilabel: Label) -> f32;

    /// Frames currently available for scoring.
    fn num_frames_ready(&self) -> usize;
}

/// GMM scores over the streaming feature pipeline.
pub struct GmmDecodable<'a> {
    pipeline: &'a mut FeaturePipeline,
    am: &'a AcousticModel,
    scale: f32,
    cache_frame: usize,
    cache: HashMap<Label, f32>,
}

impl<'a> GmmDecodable<'a> {
    pub fn new(pipeline: &'a mut FeaturePipeline, am: &'a AcousticModel, scale: f32) -> Self {
        Self {
            pipeline,
            am,
            scale,
            cache_frame: usize::MAX,
            cache: HashMap::new(),
        }
    }
}

impl Decodable for GmmDecodable<'_> {
    fn log_likelihood(&mut self, frame: usize, ilabel: Label) -> f32 {
        if frame != self.cache_frame {
            self.cache.clear();
            self.cache_frame = frame;
        }

        if let Some(&loglike) = self.cache.get(&ilabel) {
            return loglike;
        }

        let pdf = (ilabel - 1) as usize;
        let loglike = self.scale * self.am.log_likelihood(self.pipeline.frame(frame), pdf);
        self.cache.insert(ilabel, loglike);
        loglike
    }

    fn num_frames_ready(&self) -> usize {
        self.pipeline.num_frames_ready()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Fixed score table for search tests: `scores[frame][ilabel - 1]`.
    pub struct TableDecodable {
        pub scores: Vec<Vec<f32>>,
    }

    impl Decodable for TableDecodable {
        fn log_likelihood(&mut self, frame: usize, ilabel: Label) -> f32 {
            self.scores[frame][(ilabel - 1) as usize]
        }

        fn num_frames_ready(&self) -> usize {
            self.scores.len()
        }
    }
}
