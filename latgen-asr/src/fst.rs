//! Weighted finite-state transducer: the immutable search graph.

use crate::error::ModelError;
use std::path::Path;

/// Graph state identifier.
pub type StateId = u32;

/// Arc label. 0 is epsilon; an ilabel `n > 0` selects acoustic pdf `n - 1`,
/// an olabel `n > 0` is a word id.
pub type Label = u32;

/// Epsilon label constant.
pub const EPSILON: Label = 0;

/// One weighted transition of the search graph.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FstArc {
    pub ilabel: Label,
    pub olabel: Label,
    pub weight: f32,
    pub nextstate: StateId,
}

/// Immutable WFST over dense state ids.
///
/// Loaded once per model bundle and shared read-only across sessions.
#[derive(Clone, Debug)]
pub struct Fst {
    start: StateId,
    arcs: Vec<Vec<FstArc>>,
    finals: Vec<f32>,
}

impl Fst {
    /// Build a graph from explicit parts. `finals[s]` is the final weight of
    /// state `s`, `f32::INFINITY` for non-final states.
    pub fn from_parts(start: StateId, arcs: Vec<Vec<FstArc>>, finals: Vec<f32>) -> Self {
        debug_assert_eq!(arcs.len(), finals.len());
        Self { start, arcs, finals }
    }

    /// Parse a graph in AT&T text format.
    ///
    /// Arc lines are `src dst ilabel olabel [weight]`, final lines are
    /// `state [weight]`; the source state of the first line is the start
    /// state. Weights are costs (negated log-probabilities).
    pub fn from_text(text: &str, path: &Path) -> Result<Self, ModelError> {
        let parse_err = |lineno: usize, message: String| ModelError::Parse {
            path: path.to_path_buf(),
            line: lineno + 1,
            message,
        };

        let mut start: Option<StateId> = None;
        let mut arcs: Vec<Vec<FstArc>> = Vec::new();
        let mut finals: Vec<f32> = Vec::new();

        let mut ensure_state = |arcs: &mut Vec<Vec<FstArc>>, finals: &mut Vec<f32>, s: StateId| {
            let needed = s as usize + 1;
            if arcs.len() < needed {
                arcs.resize_with(needed, Vec::new);
                finals.resize(needed, f32::INFINITY);
            }
        };

        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let fields: Vec<&str> = line.split_whitespace().collect();

            let field = |i: usize| -> Result<u32, ModelError> {
                fields[i]
                    .parse()
                    .map_err(|_| parse_err(lineno, format!("invalid integer {:?}", fields[i])))
            };
            let weight_field = |i: usize| -> Result<f32, ModelError> {
                fields[i]
                    .parse()
                    .map_err(|_| parse_err(lineno, format!("invalid weight {:?}", fields[i])))
            };

            match fields.len() {
                // final state: `state [weight]`
                1 | 2 => {
                    let s = field(0)?;
                    let w = if fields.len() == 2 { weight_field(1)? } else { 0.0 };
                    ensure_state(&mut arcs, &mut finals, s);
                    finals[s as usize] = w;
                    start.get_or_insert(s);
                }
                // arc: `src dst ilabel olabel [weight]`
                4 | 5 => {
                    let src = field(0)?;
                    let dst = field(1)?;
                    let ilabel = field(2)?;
                    let olabel = field(3)?;
                    let weight = if fields.len() == 5 { weight_field(4)? } else { 0.0 };

                    ensure_state(&mut arcs, &mut finals, src.max(dst));
                    arcs[src as usize].push(FstArc {
                        ilabel,
                        olabel,
                        weight,
                        nextstate: dst,
                    });
                    start.get_or_insert(src);
                }
                n => {
                    return Err(parse_err(lineno, format!("expected 1-5 fields, got {n}")));
                }
            }
        }

        let start = start.ok_or_else(|| parse_err(0, "empty graph".to_string()))?;

        Ok(Self { start, arcs, finals })
    }

    /// Load a graph from an AT&T text file.
    pub fn from_text_file(path: &Path) -> Result<Self, ModelError> {
        let text = std::fs::read_to_string(path).map_err(|source| ModelError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_text(&text, path)
    }

    pub fn start(&self) -> StateId {
        self.start
    }

    pub fn num_states(&self) -> usize {
        self.arcs.len()
    }

    /// Outgoing arcs of a state, in load order.
    pub fn arcs(&self, state: StateId) -> &[FstArc] {
        &self.arcs[state as usize]
    }

    /// Final weight of a state, `None` for non-final states.
    pub fn final_weight(&self, state: StateId) -> Option<f32> {
        let w = self.finals[state as usize];
        w.is_finite().then_some(w)
    }

    /// Largest ilabel appearing on any arc.
    pub fn max_ilabel(&self) -> Label {
        self.arcs
            .iter()
            .flatten()
            .map(|arc| arc.ilabel)
            .max()
            .unwrap_or(EPSILON)
    }
}
