// BSD 2-Clause License
//
// Copyright (c) 2024 Alasdair Armstrong
//
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
// 1. Redistributions of source code must retain the above copyright
// notice, this list of conditions and the following disclaimer.
//
// 2. Redistributions in binary form must reproduce the above copyright
// notice, this list of conditions and the following disclaimer in the
// documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT
// LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR
// A PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT
// HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT
// LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE,
// DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY
// THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT
// (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE
// OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! Exploration policies choose which ready state a worker runs next.
//! Each worker owns its own [`Policy`], so selection only ever reads
//! the shared coverage snapshot.
//!
//! All policies treat the ready set as ordered by id, and break ties
//! in favour of the lowest id (the oldest state).

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::coverage::CoverageView;
use crate::error::PolicyError;
use crate::state::{Address, StateId};
use crate::workspace::ReadyState;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PolicyKind {
    Random,
    Uncovered,
    Weighted,
}

impl FromStr for PolicyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "random" => Ok(PolicyKind::Random),
            "uncovered" => Ok(PolicyKind::Uncovered),
            "weighted" => Ok(PolicyKind::Weighted),
            _ => Err(format!("unknown policy '{}', expected random, uncovered, or weighted", s)),
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyKind::Random => write!(f, "random"),
            PolicyKind::Uncovered => write!(f, "uncovered"),
            PolicyKind::Weighted => write!(f, "weighted"),
        }
    }
}

pub enum Policy {
    Random(StdRng),
    Uncovered,
    Weighted,
}

/// The addresses a state's score is computed over: its recent trail
/// and the address it will resume at.
fn ancestry(state: &ReadyState) -> BTreeSet<Address> {
    let mut addrs: BTreeSet<Address> = state.summary.trail.iter().copied().collect();
    addrs.insert(state.summary.pc);
    addrs
}

fn uncovered_score(state: &ReadyState, view: &CoverageView) -> usize {
    ancestry(state).into_iter().filter(|addr| !view.is_covered(*addr)).count()
}

/// Total and number of hit counts, compared as a fraction so that no
/// precision is lost.
fn hit_weight(state: &ReadyState, view: &CoverageView) -> (u128, u128) {
    let addrs = ancestry(state);
    let total: u128 = addrs.iter().map(|addr| view.hit_count(*addr) as u128).sum();
    (total, addrs.len() as u128)
}

impl Policy {
    pub fn new(kind: PolicyKind, seed: u64) -> Self {
        match kind {
            PolicyKind::Random => Policy::Random(StdRng::seed_from_u64(seed)),
            PolicyKind::Uncovered => Policy::Uncovered,
            PolicyKind::Weighted => Policy::Weighted,
        }
    }

    /// Pick a state from `ready`, which must be sorted by id. Only
    /// the random policy changes (its generator advances).
    pub fn select(&mut self, ready: &[ReadyState], view: &CoverageView) -> Result<StateId, PolicyError> {
        if ready.is_empty() {
            return Err(PolicyError::Empty);
        }

        let chosen = match self {
            Policy::Random(rng) => &ready[rng.gen_range(0, ready.len())],

            Policy::Uncovered => {
                let mut best = &ready[0];
                let mut best_score = uncovered_score(best, view);
                for state in &ready[1..] {
                    let score = uncovered_score(state, view);
                    if score > best_score {
                        best = state;
                        best_score = score
                    }
                }
                best
            }

            Policy::Weighted => {
                let mut best = &ready[0];
                let (mut best_total, mut best_len) = hit_weight(best, view);
                for state in &ready[1..] {
                    let (total, len) = hit_weight(state, view);
                    if total * best_len < best_total * len {
                        best = state;
                        best_total = total;
                        best_len = len
                    }
                }
                best
            }
        };

        Ok(chosen.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::CoverageTracker;
    use crate::state::StateSummary;
    use std::collections::HashMap;

    fn ready(id: u64, pc: Address, trail: &[Address]) -> ReadyState {
        ReadyState { id: StateId::from_u64(id), summary: StateSummary { pc, depth: 1, trail: trail.to_vec() } }
    }

    fn coverage(hits: &[(Address, u64)]) -> CoverageView {
        let tracker = CoverageTracker::new();
        tracker.merge(&hits.iter().copied().collect::<HashMap<_, _>>());
        tracker.view()
    }

    #[test]
    fn empty_ready_set() {
        for kind in &[PolicyKind::Random, PolicyKind::Uncovered, PolicyKind::Weighted] {
            let mut policy = Policy::new(*kind, 0);
            assert_eq!(policy.select(&[], &CoverageView::default()), Err(PolicyError::Empty));
        }
    }

    #[test]
    fn policy_names() {
        assert_eq!("weighted".parse::<PolicyKind>(), Ok(PolicyKind::Weighted));
        assert_eq!(PolicyKind::Uncovered.to_string(), "uncovered");
        assert!("depth-first".parse::<PolicyKind>().is_err());
    }

    #[test]
    fn random_is_reproducible() {
        let states: Vec<ReadyState> = (0..20).map(|i| ready(i, 0x400000 + 4 * i, &[])).collect();
        let view = CoverageView::default();
        let run = |seed| {
            let mut policy = Policy::new(PolicyKind::Random, seed);
            (0..50).map(|_| policy.select(&states, &view).unwrap()).collect::<Vec<_>>()
        };
        assert_eq!(run(7), run(7));
        assert!(run(7).iter().all(|id| id.as_u64() < 20));
    }

    #[test]
    fn uncovered_prefers_new_code() {
        let view = coverage(&[(0x10, 5), (0x14, 5), (0x18, 1)]);
        let states = vec![ready(1, 0x10, &[0x14]), ready(2, 0x20, &[0x10, 0x14]), ready(3, 0x24, &[0x10])];
        let mut policy = Policy::new(PolicyKind::Uncovered, 0);
        assert_eq!(policy.select(&states, &view), Ok(StateId::from_u64(2)));
    }

    #[test]
    fn uncovered_ties_go_to_lowest_id() {
        let view = coverage(&[(0x10, 1)]);
        let states = vec![ready(4, 0x10, &[]), ready(9, 0x10, &[])];
        let mut policy = Policy::new(PolicyKind::Uncovered, 0);
        assert_eq!(policy.select(&states, &view), Ok(StateId::from_u64(4)));
    }

    #[test]
    fn weighted_avoids_hot_paths() {
        let view = coverage(&[(0x10, 1000), (0x14, 1000), (0x18, 2), (0x1c, 1)]);
        let states = vec![ready(1, 0x14, &[0x10]), ready(2, 0x1c, &[0x10, 0x18]), ready(3, 0x18, &[0x1c])];
        let mut policy = Policy::new(PolicyKind::Weighted, 0);
        assert_eq!(policy.select(&states, &view), Ok(StateId::from_u64(3)));

        let tied = vec![ready(5, 0x18, &[]), ready(6, 0x18, &[])];
        assert_eq!(policy.select(&tied, &view), Ok(StateId::from_u64(5)));
    }
}
