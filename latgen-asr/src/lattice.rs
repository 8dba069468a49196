//! Consumer-facing lattice and hypothesis extraction.
//!
//! A [`Lattice`] is a plain graph of states with ordered weighted arcs,
//! built from the decoder's token arena. State ids are dense and stable
//! within one extraction; after `finalize_decoding` the structure is
//! immutable, so repeated extractions are identical.

use crate::decoder::{LatticeDecoder, TokenId};
use crate::error::LatticeError;
use crate::fst::{EPSILON, Label};
use crate::symbols::WordId;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};

/// Bound on n-best heap expansion, a backstop against lattices whose
/// distinct-path count explodes.
const MAX_HEAP_POPS: usize = 100_000;

/// One scored word sequence. Higher score is better (scores are negated
/// path costs).
#[derive(Clone, Debug, PartialEq)]
pub struct Hypothesis {
    pub score: f32,
    pub words: Vec<WordId>,
}

/// One weighted lattice transition.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LatticeArc {
    /// Acoustic/context unit label (graph ilabel), 0 for epsilon
    pub ilabel: Label,
    /// Word id, 0 for epsilon
    pub olabel: Label,
    /// Combined graph + acoustic cost
    pub weight: f32,
    pub nextstate: u32,
}

/// One lattice state with its ordered outgoing arcs.
#[derive(Clone, Debug, PartialEq)]
pub struct LatticeState {
    pub id: u32,
    pub arcs: Vec<LatticeArc>,
    /// Cost charged when a path ends here, `None` for interior states
    pub final_weight: Option<f32>,
}

/// Pruned lattice over everything the search retained.
#[derive(Clone, Debug, PartialEq)]
pub struct Lattice {
    pub start: u32,
    /// Negated cost of the best complete path through the lattice
    pub total_score: f32,
    pub states: Vec<LatticeState>,
}

/// Terminal tokens and the final cost each one pays.
///
/// After finalization these are the charges fixed by `finalize`;
/// mid-utterance every frontier token terminates a partial path at no
/// charge.
fn terminal_charges(decoder: &LatticeDecoder) -> HashMap<TokenId, f32> {
    if decoder.is_finalized() {
        decoder.final_costs.clone()
    } else {
        decoder
            .frames
            .last()
            .into_iter()
            .flatten()
            .map(|&t| (t, 0.0))
            .collect()
    }
}

/// Build the current lattice from the decoder's token arena.
pub(crate) fn build_lattice(decoder: &LatticeDecoder) -> Result<Lattice, LatticeError> {
    if decoder.num_frames_decoded() == 0 {
        return Err(LatticeError::NoFramesDecoded);
    }

    let charges = terminal_charges(decoder);

    // tokens present on a frontier snapshot, the only ones a lattice
    // state may come from
    let mut in_frames = vec![false; decoder.tokens.len()];
    for frame in &decoder.frames {
        for &t in frame {
            in_frames[t as usize] = true;
        }
    }

    // backward reachability from the terminal tokens
    let mut reachable: HashSet<TokenId> = HashSet::new();
    let mut stack: Vec<TokenId> = charges.keys().copied().collect();
    while let Some(tok_id) = stack.pop() {
        if !in_frames[tok_id as usize] || !reachable.insert(tok_id) {
            continue;
        }
        for link in &decoder.tokens[tok_id as usize].links {
            if in_frames[link.prev as usize] && !reachable.contains(&link.prev) {
                stack.push(link.prev);
            }
        }
    }

    // dense ids ordered by (frame, graph state): stable within this call
    let mut ordered: Vec<TokenId> = reachable.iter().copied().collect();
    ordered.sort_by_key(|&t| {
        let tok = &decoder.tokens[t as usize];
        (tok.frame, tok.state)
    });
    let ids: HashMap<TokenId, u32> = ordered
        .iter()
        .enumerate()
        .map(|(i, &t)| (t, i as u32))
        .collect();

    let mut states: Vec<LatticeState> = ordered
        .iter()
        .map(|&t| LatticeState {
            id: ids[&t],
            arcs: Vec::new(),
            final_weight: charges.get(&t).copied(),
        })
        .collect();

    for &tok_id in &ordered {
        let dst = ids[&tok_id];
        for link in &decoder.tokens[tok_id as usize].links {
            let Some(&src) = ids.get(&link.prev) else {
                continue;
            };
            states[src as usize].arcs.push(LatticeArc {
                ilabel: link.ilabel,
                olabel: link.olabel,
                weight: link.cost(),
                nextstate: dst,
            });
        }
    }
    for state in &mut states {
        state
            .arcs
            .sort_by(|a, b| a.nextstate.cmp(&b.nextstate).then(a.ilabel.cmp(&b.ilabel)));
    }

    let total_cost = charges
        .iter()
        .filter(|(t, _)| reachable.contains(t))
        .map(|(&t, &charge)| decoder.tokens[t as usize].cost + charge)
        .fold(f32::INFINITY, f32::min);

    // the root with the earliest frame is the start; later roots can only
    // come from search-failure re-seeds
    let start = ordered
        .iter()
        .position(|&t| decoder.tokens[t as usize].links.is_empty())
        .unwrap_or(0) as u32;

    Ok(Lattice {
        start,
        total_score: -total_cost,
        states,
    })
}

/// Best-first n-best path enumeration over the token arena.
///
/// Walks backward from the terminal tokens with the exact cost-to-start
/// (each token's Viterbi cost) as the heuristic, so complete paths pop in
/// non-decreasing cost order; duplicate word sequences are dropped.
pub(crate) fn nbest(decoder: &LatticeDecoder, k: usize) -> Result<Vec<Hypothesis>, LatticeError> {
    if k == 0 {
        return Err(LatticeError::InvalidArgument {
            message: "nbest requires k > 0".to_string(),
        });
    }

    struct Entry {
        /// Lower bound on the complete path cost
        f: f32,
        /// Cost from this token to the path end, final charge included
        g: f32,
        token: TokenId,
        /// Output labels collected end-to-start
        words: Vec<Label>,
    }

    impl PartialEq for Entry {
        fn eq(&self, other: &Self) -> bool {
            self.f == other.f && self.token == other.token
        }
    }
    impl Eq for Entry {}
    impl PartialOrd for Entry {
        fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
            Some(self.cmp(other))
        }
    }
    impl Ord for Entry {
        // reversed: BinaryHeap is a max-heap, we want the smallest f first
        fn cmp(&self, other: &Self) -> Ordering {
            other
                .f
                .partial_cmp(&self.f)
                .unwrap_or(Ordering::Equal)
                .then(other.token.cmp(&self.token))
        }
    }

    let mut heap: BinaryHeap<Entry> = BinaryHeap::new();
    for (&token, &charge) in &terminal_charges(decoder) {
        let alpha = decoder.tokens[token as usize].cost;
        heap.push(Entry {
            f: alpha + charge,
            g: charge,
            token,
            words: Vec::new(),
        });
    }

    let mut results: Vec<Hypothesis> = Vec::new();
    let mut seen: HashSet<Vec<Label>> = HashSet::new();
    let mut pops = 0;

    while let Some(entry) = heap.pop() {
        pops += 1;
        if pops > MAX_HEAP_POPS {
            tracing::warn!(found = results.len(), "nbest enumeration bound reached");
            break;
        }

        let token = &decoder.tokens[entry.token as usize];

        if token.links.is_empty() {
            // reached a path root: entry.words is the full sequence reversed
            let mut words = entry.words.clone();
            words.reverse();
            if seen.insert(words.clone()) {
                results.push(Hypothesis {
                    score: -entry.f,
                    words: words.into_iter().map(WordId).collect(),
                });
                if results.len() == k {
                    break;
                }
            }
            continue;
        }

        for link in &token.links {
            let g = entry.g + link.cost();
            let alpha = decoder.tokens[link.prev as usize].cost;
            let mut words = entry.words.clone();
            if link.olabel != EPSILON {
                words.push(link.olabel);
            }
            heap.push(Entry {
                f: g + alpha,
                g,
                token: link.prev,
                words,
            });
        }
    }

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DecoderConfig;
    use crate::decodable::testing::TableDecodable;
    use crate::fst::{Fst, FstArc, StateId};

    fn arc(ilabel: Label, olabel: Label, weight: f32, nextstate: StateId) -> FstArc {
        FstArc {
            ilabel,
            olabel,
            weight,
            nextstate,
        }
    }

    fn config() -> DecoderConfig {
        DecoderConfig {
            beam: 30.0,
            lattice_beam: 30.0,
            max_active: 100,
            min_active: 1,
            ..DecoderConfig::default()
        }
    }

    /// Two competing words over the same acoustics, the second 1.0 worse:
    /// 0 -(1:w1, 0.5)-> 1 -loop-> 1, 0 -(1:w2, 1.5)-> 2 -loop-> 2.
    fn two_word_graph() -> Fst {
        Fst::from_parts(
            0,
            vec![
                vec![arc(1, 1, 0.5, 1), arc(1, 2, 1.5, 2)],
                vec![arc(1, 0, 0.0, 1)],
                vec![arc(1, 0, 0.0, 2)],
            ],
            vec![f32::INFINITY, 0.0, 0.0],
        )
    }

    fn decoded(frames: usize) -> LatticeDecoder {
        let graph = two_word_graph();
        let mut decoder = LatticeDecoder::new(&config(), &graph);
        let mut decodable = TableDecodable {
            scores: vec![vec![0.0]; frames],
        };
        decoder.advance(&graph, &mut decodable, frames).unwrap();
        decoder
    }

    #[test]
    fn nbest_orders_by_score_without_duplicates() {
        let decoder = decoded(3);

        let hyps = nbest(&decoder, 5).unwrap();

        assert_eq!(hyps.len(), 2);
        assert_eq!(hyps[0].words, vec![WordId(1)]);
        assert_eq!(hyps[1].words, vec![WordId(2)]);
        assert!(hyps[0].score >= hyps[1].score);
        assert!((hyps[0].score - hyps[1].score).abs() > 0.5);
    }

    #[test]
    fn nbest_rejects_zero_k() {
        let decoder = decoded(2);

        let result = nbest(&decoder, 0);

        assert!(matches!(
            result,
            Err(LatticeError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn best_path_score_bounds_every_nbest_score() {
        let decoder = decoded(3);

        let (best_cost, _) = decoder.best_path_raw().unwrap();
        let hyps = nbest(&decoder, 5).unwrap();

        for hyp in &hyps {
            assert!(-best_cost >= hyp.score - 1e-4);
        }
        assert!((-best_cost - hyps[0].score).abs() < 1e-4);
    }

    #[test]
    fn lattice_before_any_frame_is_an_error() {
        let graph = two_word_graph();
        let decoder = LatticeDecoder::new(&config(), &graph);

        assert!(matches!(
            build_lattice(&decoder),
            Err(LatticeError::NoFramesDecoded)
        ));
    }

    #[test]
    fn lattice_holds_both_alternatives() {
        let decoder = decoded(2);

        let lattice = build_lattice(&decoder).unwrap();

        let olabels: HashSet<Label> = lattice
            .states
            .iter()
            .flat_map(|s| s.arcs.iter())
            .map(|a| a.olabel)
            .filter(|&o| o != EPSILON)
            .collect();
        assert_eq!(olabels, HashSet::from([1, 2]));

        // arcs reference valid states, start is a real state
        for state in &lattice.states {
            for arc in &state.arcs {
                assert!((arc.nextstate as usize) < lattice.states.len());
            }
        }
        assert!((lattice.start as usize) < lattice.states.len());
    }

    #[test]
    fn finalized_lattice_is_idempotent() {
        let graph = two_word_graph();
        let mut decoder = decoded(3);
        decoder.finalize(&graph);

        let first = build_lattice(&decoder).unwrap();
        let second = build_lattice(&decoder).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn finalized_total_score_includes_final_weights() {
        let graph = Fst::from_parts(
            0,
            vec![vec![arc(1, 1, 0.0, 1)], vec![arc(1, 0, 0.0, 1)]],
            vec![f32::INFINITY, 2.5],
        );
        let mut decoder = LatticeDecoder::new(&config(), &graph);
        let mut decodable = TableDecodable {
            scores: vec![vec![0.0]],
        };
        decoder.advance(&graph, &mut decodable, 1).unwrap();

        let partial = build_lattice(&decoder).unwrap();
        decoder.finalize(&graph);
        let final_lattice = build_lattice(&decoder).unwrap();

        assert!((partial.total_score - 0.0).abs() < 1e-5);
        assert!((final_lattice.total_score + 2.5).abs() < 1e-5);
    }
}
