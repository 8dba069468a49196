//! Incremental token-passing search over the WFST.
//!
//! The search keeps an arena of tokens grouped by frame. Each token is one
//! live hypothesis at a graph state; its incoming links carry the arc
//! labels and costs that later become the lattice. Per decoded frame the
//! frontier is expanded along emitting arcs, closed over epsilon arcs,
//! then pruned by beam, `max_active` cap, and `min_active` floor.
//!
//! All costs are negated log-probabilities: lower is better.

use crate::config::DecoderConfig;
use crate::decodable::Decodable;
use crate::error::DecodeError;
use crate::fst::{EPSILON, Fst, Label, StateId};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, VecDeque};

pub(crate) type TokenId = u32;

/// Incoming lattice link: how this token was reached.
#[derive(Clone, Copy, Debug)]
pub(crate) struct LatticeLink {
    pub prev: TokenId,
    pub ilabel: Label,
    pub olabel: Label,
    pub graph_cost: f32,
    pub acoustic_cost: f32,
}

impl LatticeLink {
    pub fn cost(&self) -> f32 {
        self.graph_cost + self.acoustic_cost
    }
}

/// One live hypothesis: a graph state reached at a frame with the best
/// (Viterbi) cost over all of its incoming links.
pub(crate) struct Token {
    pub state: StateId,
    pub frame: usize,
    pub cost: f32,
    pub links: Vec<LatticeLink>,
    pub best_link: Option<usize>,
}

/// Search pruning parameters, taken from [`DecoderConfig`].
#[derive(Clone, Copy, Debug)]
struct SearchOptions {
    beam: f32,
    lattice_beam: f32,
    max_active: usize,
    min_active: usize,
}

/// The incremental lattice-generating decoder for one utterance.
pub struct LatticeDecoder {
    opts: SearchOptions,
    pub(crate) tokens: Vec<Token>,
    /// `frames[t]` is the frontier after `t` decoded frames, token ids
    /// sorted by graph state for deterministic iteration.
    pub(crate) frames: Vec<Vec<TokenId>>,
    cur: HashMap<StateId, TokenId>,
    num_frames_decoded: usize,
    finalized: bool,
    /// Final weight charged per last-frontier token, set by `finalize`.
    pub(crate) final_costs: HashMap<TokenId, f32>,
}

impl LatticeDecoder {
    pub fn new(config: &DecoderConfig, graph: &Fst) -> Self {
        let mut decoder = Self {
            opts: SearchOptions {
                beam: config.beam,
                lattice_beam: config.lattice_beam,
                max_active: config.max_active,
                min_active: config.min_active,
            },
            tokens: Vec::new(),
            frames: Vec::new(),
            cur: HashMap::new(),
            num_frames_decoded: 0,
            finalized: false,
            final_costs: HashMap::new(),
        };
        decoder.init_decoding(graph);
        decoder
    }

    /// Start a fresh utterance, dropping all search state.
    pub fn reset(&mut self, graph: &Fst) {
        self.tokens.clear();
        self.frames.clear();
        self.cur.clear();
        self.num_frames_decoded = 0;
        self.finalized = false;
        self.final_costs.clear();
        self.init_decoding(graph);
    }

    fn init_decoding(&mut self, graph: &Fst) {
        self.cur = self.seed_start(graph);
        self.frames.push(self.frontier_snapshot());
    }

    pub fn num_frames_decoded(&self) -> usize {
        self.num_frames_decoded
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Advance the search by up to `max_frames` frames, bounded by what
    /// the decodable has ready. Returns the number of frames decoded.
    pub fn advance(
        &mut self,
        graph: &Fst,
        decodable: &mut dyn Decodable,
        max_frames: usize,
    ) -> Result<usize, DecodeError> {
        if self.finalized {
            return Err(DecodeError::SessionFinalized);
        }

        let start = self.num_frames_decoded;
        let target = start
            .saturating_add(max_frames)
            .min(decodable.num_frames_ready());

        while self.num_frames_decoded < target {
            let frame = self.num_frames_decoded;
            let ok = self.step(graph, decodable, frame);
            self.num_frames_decoded += 1;

            if !ok {
                tracing::warn!(frame, "search failure: restarting from the graph start state");
                return Err(DecodeError::SearchFailure { frame });
            }
        }

        let decoded = self.num_frames_decoded - start;
        tracing::trace!(decoded, total = self.num_frames_decoded, "advanced decoding");
        Ok(decoded)
    }

    /// Process one frame. Returns false on total search failure, in which
    /// case the frontier has been re-seeded from the start state so the
    /// utterance can continue (degraded).
    fn step(&mut self, graph: &Fst, decodable: &mut dyn Decodable, frame: usize) -> bool {
        let frontier = self.frontier_snapshot();
        let mut next: HashMap<StateId, TokenId> = HashMap::new();
        let mut best_next = f32::INFINITY;

        for &tok_id in &frontier {
            let (state, tok_cost) = {
                let tok = &self.tokens[tok_id as usize];
                (tok.state, tok.cost)
            };

            for arc in graph.arcs(state) {
                if arc.ilabel == EPSILON {
                    continue;
                }

                let acoustic_cost = -decodable.log_likelihood(frame, arc.ilabel);
                let new_cost = tok_cost + arc.weight + acoustic_cost;

                // all emitting candidates are admitted; beam, max_active
                // and min_active are applied in one prune after the
                // epsilon closure, so the min_active floor can rank
                // candidates that fall outside the beam
                if new_cost < best_next {
                    best_next = new_cost;
                }

                let link = LatticeLink {
                    prev: tok_id,
                    ilabel: arc.ilabel,
                    olabel: arc.olabel,
                    graph_cost: arc.weight,
                    acoustic_cost,
                };
                self.upsert(&mut next, arc.nextstate, frame + 1, new_cost, link, true);
            }
        }

        self.process_nonemitting(graph, &mut next, &mut best_next, frame + 1);

        let kept = self.prune_frontier(&next, best_next);
        if kept.is_empty() {
            self.cur = self.seed_start(graph);
            self.frames.push(self.frontier_snapshot());
            return false;
        }

        self.cur = kept;
        self.frames.push(self.frontier_snapshot());
        true
    }

    /// Insert or update a token at `state` in the frontier being built.
    ///
    /// Emitting links are always recorded (they are the lattice's
    /// alternatives); epsilon links only when they create or improve the
    /// token, which keeps the link graph acyclic for non-negative weights.
    fn upsert(
        &mut self,
        frontier: &mut HashMap<StateId, TokenId>,
        state: StateId,
        frame: usize,
        cost: f32,
        link: LatticeLink,
        keep_worse_link: bool,
    ) -> bool {
        match frontier.get(&state) {
            Some(&tok_id) => {
                let tok = &mut self.tokens[tok_id as usize];
                if cost < tok.cost {
                    tok.cost = cost;
                    tok.links.push(link);
                    tok.best_link = Some(tok.links.len() - 1);
                    true
                } else if keep_worse_link {
                    tok.links.push(link);
                    false
                } else {
                    false
                }
            }
            None => {
                let tok_id = self.tokens.len() as TokenId;
                self.tokens.push(Token {
                    state,
                    frame,
                    cost,
                    links: vec![link],
                    best_link: Some(0),
                });
                frontier.insert(state, tok_id);
                true
            }
        }
    }

    /// Epsilon closure over the frontier being built.
    fn process_nonemitting(
        &mut self,
        graph: &Fst,
        frontier: &mut HashMap<StateId, TokenId>,
        best: &mut f32,
        frame: usize,
    ) {
        let mut queue: VecDeque<StateId> = {
            let mut states: Vec<StateId> = frontier.keys().copied().collect();
            states.sort_unstable();
            states.into()
        };

        while let Some(state) = queue.pop_front() {
            let Some(&tok_id) = frontier.get(&state) else {
                continue;
            };
            let tok_cost = self.tokens[tok_id as usize].cost;

            for arc in graph.arcs(state) {
                if arc.ilabel != EPSILON {
                    continue;
                }

                let new_cost = tok_cost + arc.weight;
                if new_cost > *best + self.opts.beam {
                    continue;
                }
                if new_cost < *best {
                    *best = new_cost;
                }

                let link = LatticeLink {
                    prev: tok_id,
                    ilabel: EPSILON,
                    olabel: arc.olabel,
                    graph_cost: arc.weight,
                    acoustic_cost: 0.0,
                };
                if self.upsert(frontier, arc.nextstate, frame, new_cost, link, false) {
                    queue.push_back(arc.nextstate);
                }
            }
        }
    }

    /// Beam pruning with the `max_active` cap and `min_active` floor.
    ///
    /// Tokens are ranked by `(cost, state)`; the floor keeps the best
    /// `min_active` tokens even when they fall outside the beam, so the
    /// search always makes forward progress.
    fn prune_frontier(
        &self,
        frontier: &HashMap<StateId, TokenId>,
        best: f32,
    ) -> HashMap<StateId, TokenId> {
        let mut ranked: Vec<(f32, StateId, TokenId)> = frontier
            .iter()
            .map(|(&s, &t)| (self.tokens[t as usize].cost, s, t))
            .collect();
        ranked.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(Ordering::Equal)
                .then(a.1.cmp(&b.1))
        });

        let beam_cutoff = best + self.opts.beam;
        let mut keep = ranked
            .iter()
            .take_while(|&&(cost, _, _)| cost <= beam_cutoff)
            .count();

        keep = keep.min(self.opts.max_active);
        if keep < self.opts.min_active {
            keep = self.opts.min_active.min(ranked.len());
        }

        ranked
            .into_iter()
            .take(keep)
            .map(|(_, s, t)| (s, t))
            .collect()
    }

    /// Fresh frontier at the graph start state: one zero-cost token plus
    /// its epsilon closure.
    fn seed_start(&mut self, graph: &Fst) -> HashMap<StateId, TokenId> {
        let frame = self.frames.len();
        let mut frontier = HashMap::new();

        let tok_id = self.tokens.len() as TokenId;
        self.tokens.push(Token {
            state: graph.start(),
            frame,
            cost: 0.0,
            links: Vec::new(),
            best_link: None,
        });
        frontier.insert(graph.start(), tok_id);

        let mut best = 0.0;
        self.process_nonemitting(graph, &mut frontier, &mut best, frame);
        frontier
    }

    fn frontier_snapshot(&self) -> Vec<TokenId> {
        let mut ids: Vec<TokenId> = self.cur.values().copied().collect();
        ids.sort_by_key(|&t| self.tokens[t as usize].state);
        ids
    }

    /// Best token of the last frontier with the total cost it pays.
    ///
    /// After `finalize`, final-state charges are included (so the cost is
    /// that of a complete path); mid-utterance the plain Viterbi cost is
    /// used, making the result a partial hypothesis. Ties on exactly
    /// equal cost break toward the lower state id.
    pub(crate) fn best_token(&self) -> Option<(TokenId, f32)> {
        let frontier = self.frames.last()?;

        let mut best: Option<(f32, StateId, TokenId)> = None;
        for &tok_id in frontier {
            let tok = &self.tokens[tok_id as usize];
            let total = if self.finalized {
                match self.final_costs.get(&tok_id) {
                    Some(&charge) => tok.cost + charge,
                    None => continue,
                }
            } else {
                tok.cost
            };
            let better = match best {
                None => true,
                Some((c, s, _)) => total < c || (total == c && tok.state < s),
            };
            if better {
                best = Some((total, tok.state, tok_id));
            }
        }
        best.map(|(cost, _, id)| (id, cost))
    }

    /// Best-path backtrace: `(total cost, output labels in time order)`.
    pub(crate) fn best_path_raw(&self) -> Option<(f32, Vec<Label>)> {
        let (tok_id, cost) = self.best_token()?;

        let mut labels = Vec::new();
        let mut tok = &self.tokens[tok_id as usize];
        while let Some(best_link) = tok.best_link {
            let link = &tok.links[best_link];
            if link.olabel != EPSILON {
                labels.push(link.olabel);
            }
            tok = &self.tokens[link.prev as usize];
        }
        labels.reverse();

        Some((cost, labels))
    }

    /// Consecutive trailing frames of the best path whose emitting ilabel
    /// is a configured silence phone.
    pub(crate) fn trailing_silence_frames(&self, silence: &BTreeSet<Label>) -> usize {
        let Some((tok_id, _)) = self.best_token() else {
            return 0;
        };

        let mut count = 0;
        let mut tok = &self.tokens[tok_id as usize];
        while let Some(best_link) = tok.best_link {
            let link = &tok.links[best_link];
            if link.ilabel != EPSILON {
                if silence.contains(&link.ilabel) {
                    count += 1;
                } else {
                    break;
                }
            }
            tok = &self.tokens[link.prev as usize];
        }
        count
    }

    /// Gap between the best final-state cost and the overall best cost of
    /// the last frontier; infinite when no live token is final.
    pub(crate) fn final_relative_cost(&self, graph: &Fst) -> f32 {
        let Some(frontier) = self.frames.last() else {
            return f32::INFINITY;
        };

        let mut best = f32::INFINITY;
        let mut best_final = f32::INFINITY;
        for &tok_id in frontier {
            let tok = &self.tokens[tok_id as usize];
            best = best.min(tok.cost);
            if let Some(w) = graph.final_weight(tok.state) {
                best_final = best_final.min(tok.cost + w);
            }
        }
        best_final - best
    }

    /// Collapse the search into its final form: charge final weights and
    /// prune tokens and links outside `lattice_beam` of the best complete
    /// path. Idempotent.
    pub fn finalize(&mut self, graph: &Fst) {
        if self.finalized {
            return;
        }
        self.finalized = true;

        let Some(frontier) = self.frames.last().cloned() else {
            return;
        };

        // final cost per last-frontier token; fall back to zero when no
        // live token reaches a final state (truncated utterance)
        let any_final = frontier
            .iter()
            .any(|&t| graph.final_weight(self.tokens[t as usize].state).is_some());
        for &tok_id in &frontier {
            let state = self.tokens[tok_id as usize].state;
            let charge = match graph.final_weight(state) {
                Some(w) => Some(w),
                None if !any_final => Some(0.0),
                None => None,
            };
            if let Some(charge) = charge {
                self.final_costs.insert(tok_id, charge);
            }
        }

        self.prune_lattice();

        tracing::debug!(
            frames = self.num_frames_decoded,
            tokens = self.tokens.len(),
            "decoding finalized"
        );
    }

    /// Backward-cost pruning of the whole token arena with `lattice_beam`.
    fn prune_lattice(&mut self) {
        let beta = self.compute_backward_costs();

        let total_best = self
            .frames
            .last()
            .into_iter()
            .flatten()
            .filter_map(|&t| {
                let b = beta[t as usize];
                b.is_finite().then(|| self.tokens[t as usize].cost + b)
            })
            .fold(f32::INFINITY, f32::min);

        if !total_best.is_finite() {
            return;
        }
        let bound = total_best + self.opts.lattice_beam;

        // a token survives only if it was on a frontier snapshot (tokens
        // beam-pruned from a frontier never resurface) and some path
        // through it stays within the bound
        let mut in_frames = vec![false; self.tokens.len()];
        for frame in &self.frames {
            for &t in frame {
                in_frames[t as usize] = true;
            }
        }
        let alive: Vec<bool> = self
            .tokens
            .iter()
            .enumerate()
            .map(|(i, tok)| in_frames[i] && tok.cost + beta[i] <= bound)
            .collect();

        for i in 0..self.tokens.len() {
            if !alive[i] {
                self.tokens[i].links.clear();
                self.tokens[i].best_link = None;
                continue;
            }

            let beta_i = beta[i];
            let links = std::mem::take(&mut self.tokens[i].links);
            let kept: Vec<LatticeLink> = links
                .into_iter()
                .filter(|link| {
                    alive[link.prev as usize]
                        && self.tokens[link.prev as usize].cost + link.cost() + beta_i <= bound
                })
                .collect();

            // recompute the Viterbi link over the survivors
            let mut best: Option<(f32, usize)> = None;
            for (li, link) in kept.iter().enumerate() {
                let c = self.tokens[link.prev as usize].cost + link.cost();
                if best.is_none_or(|(bc, _)| c < bc) {
                    best = Some((c, li));
                }
            }
            self.tokens[i].links = kept;
            self.tokens[i].best_link = best.map(|(_, li)| li);
        }

        for frame in &mut self.frames {
            frame.retain(|&t| alive[t as usize]);
        }
        self.final_costs.retain(|&t, _| alive[t as usize]);
    }

    /// Best cost-to-end per token (including final charges), computed
    /// frame by frame in reverse; epsilon links within a frame are relaxed
    /// to a fixpoint.
    fn compute_backward_costs(&self) -> Vec<f32> {
        let mut beta = vec![f32::INFINITY; self.tokens.len()];

        for &tok_id in self.frames.last().into_iter().flatten() {
            if let Some(&charge) = self.final_costs.get(&tok_id) {
                beta[tok_id as usize] = charge;
            }
        }

        for f in (0..self.frames.len()).rev() {
            // same-frame epsilon links
            loop {
                let mut changed = false;
                for &tok_id in &self.frames[f] {
                    let b = beta[tok_id as usize];
                    if !b.is_finite() {
                        continue;
                    }
                    for link in &self.tokens[tok_id as usize].links {
                        if self.tokens[link.prev as usize].frame != f {
                            continue;
                        }
                        let candidate = b + link.cost();
                        if candidate < beta[link.prev as usize] {
                            beta[link.prev as usize] = candidate;
                            changed = true;
                        }
                    }
                }
                if !changed {
                    break;
                }
            }

            // emitting links into the previous frame
            if f == 0 {
                continue;
            }
            for &tok_id in &self.frames[f] {
                let b = beta[tok_id as usize];
                if !b.is_finite() {
                    continue;
                }
                for link in &self.tokens[tok_id as usize].links {
                    if self.tokens[link.prev as usize].frame != f - 1 {
                        continue;
                    }
                    let candidate = b + link.cost();
                    if candidate < beta[link.prev as usize] {
                        beta[link.prev as usize] = candidate;
                    }
                }
            }
        }

        beta
    }
}
