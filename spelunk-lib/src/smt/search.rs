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

//! A small, deterministic solver for path conditions over narrow
//! bitvectors. It splits the assertions into independent groups
//! (assertions that share no variables) and solves each group with a
//! backtracking search over the variables it mentions, checking each
//! assertion as soon as all of its variables are assigned. Values are
//! tried in ascending order, so the model returned is the
//! lexicographically smallest one.
//!
//! Variables wider than 16 bits are only tried against a set of
//! candidate values drawn from the constants in their group. If such
//! a search fails the answer is reported as an error rather than as
//! unsat, as the search was not exhaustive.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use super::smtlib::*;
use super::{eval, mask, EvalError, Lit, Model, PathCondition, Solver};
use crate::error::SolverError;

const MAX_ENUMERATED_WIDTH: u32 = 16;
const DEADLINE_CHECK_INTERVAL: u64 = 256;

#[derive(Clone, Debug)]
pub struct SearchSolver {
    timeout: Option<Duration>,
    max_nodes: u64,
}

impl Default for SearchSolver {
    fn default() -> Self {
        Self::new()
    }
}

enum Domain {
    Upto(u64),
    Values(Vec<u64>),
}

struct Group<'a> {
    vars: BTreeSet<u32>,
    asserts: Vec<&'a Exp>,
}

struct Search<'a> {
    pc: &'a PathCondition,
    order: Vec<u32>,
    buckets: Vec<Vec<&'a Exp>>,
    model: Model,
    nodes: u64,
    max_nodes: u64,
    deadline: Option<Instant>,
    incomplete: bool,
}

fn holds(exp: &Exp, pc: &PathCondition, model: &Model) -> Result<Option<bool>, SolverError> {
    match eval(exp, pc.decls(), model) {
        Ok(Lit::Bool(b)) => Ok(Some(b)),
        Ok(Lit::Bits(_, _)) => Err(SolverError::Failed(format!("assertion {} is not boolean", exp))),
        Err(EvalError::Unassigned(_)) => Ok(None),
        Err(EvalError::Type(msg)) => Err(SolverError::Failed(format!("{} in {}", msg, exp))),
    }
}

impl<'a> Search<'a> {
    fn domain(&mut self, v: u32, constants: &BTreeSet<u64>) -> Result<Domain, SolverError> {
        match self.pc.decls().get(&v) {
            Some(Ty::Bool) => Ok(Domain::Upto(1)),
            Some(Ty::BitVec(width)) if *width <= MAX_ENUMERATED_WIDTH => Ok(Domain::Upto(mask(*width))),
            Some(Ty::BitVec(width)) => {
                self.incomplete = true;
                let m = mask(*width);
                let mut values: BTreeSet<u64> = [0, 1, m].iter().copied().collect();
                for c in constants {
                    values.insert(c & m);
                    values.insert(c.wrapping_add(1) & m);
                    values.insert(c.wrapping_sub(1) & m);
                }
                Ok(Domain::Values(values.into_iter().collect()))
            }
            None => Err(SolverError::Failed(format!("variable v{} is not declared", v))),
        }
    }

    fn tick(&mut self) -> Result<(), SolverError> {
        self.nodes += 1;
        if self.nodes > self.max_nodes {
            return Err(SolverError::Failed("search budget exhausted".to_string()));
        }
        if self.nodes % DEADLINE_CHECK_INTERVAL == 0 {
            if let Some(deadline) = self.deadline {
                if Instant::now() >= deadline {
                    return Err(SolverError::Timeout);
                }
            }
        }
        Ok(())
    }

    fn consistent(&self, depth: usize) -> Result<bool, SolverError> {
        for exp in &self.buckets[depth] {
            if holds(exp, self.pc, &self.model)? == Some(false) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn dfs(&mut self, depth: usize, domains: &[Domain]) -> Result<bool, SolverError> {
        if depth == self.order.len() {
            return Ok(true);
        }
        let v = self.order[depth];
        let values: Box<dyn Iterator<Item = u64>> = match &domains[depth] {
            Domain::Upto(max) => Box::new(0..=*max),
            Domain::Values(values) => Box::new(values.clone().into_iter()),
        };
        for value in values {
            self.tick()?;
            self.model.insert(v, value);
            if self.consistent(depth)? && self.dfs(depth + 1, domains)? {
                return Ok(true);
            }
        }
        self.model.remove(v);
        Ok(false)
    }
}

/// Split assertions into groups that share no variables.
fn independent_groups(asserts: &[Exp]) -> Vec<Group<'_>> {
    let mut groups: Vec<Group> = Vec::new();
    for exp in asserts.iter() {
        let vars = exp.vars();
        let mut merged = Group { vars, asserts: vec![exp] };
        let mut i = 0;
        while i < groups.len() {
            if groups[i].vars.is_disjoint(&merged.vars) {
                i += 1
            } else {
                let group = groups.swap_remove(i);
                merged.vars.extend(group.vars);
                merged.asserts.extend(group.asserts);
            }
        }
        groups.push(merged)
    }
    groups.sort_by_key(|group| group.vars.iter().next().copied());
    groups
}

impl SearchSolver {
    pub fn new() -> Self {
        SearchSolver { timeout: None, max_nodes: 1_000_000 }
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        SearchSolver { timeout: Some(timeout), ..self }
    }

    pub fn with_max_nodes(self, max_nodes: u64) -> Self {
        SearchSolver { max_nodes, ..self }
    }

    pub fn solve(&self, pc: &PathCondition) -> Result<Option<Model>, SolverError> {
        let deadline = self.timeout.map(|timeout| Instant::now() + timeout);
        let mut nodes = 0;

        let (ground, symbolic): (Vec<Exp>, Vec<Exp>) = pc.asserts().iter().cloned().partition(Exp::is_ground);
        for exp in &ground {
            if holds(exp, pc, &Model::new())? == Some(false) {
                return Ok(None);
            }
        }

        let mut solution = Model::new();
        for group in independent_groups(&symbolic) {
            let order: Vec<u32> = group.vars.iter().copied().collect();
            let mut buckets: Vec<Vec<&Exp>> = vec![Vec::new(); order.len()];
            let mut constants = BTreeSet::new();
            for exp in group.asserts {
                // Variables are assigned in ascending order, so an
                // assertion can be checked once its largest variable
                // has a value.
                let last = exp.vars().iter().next_back().copied().unwrap_or(0);
                let depth = order.iter().position(|v| *v == last).unwrap_or(0);
                buckets[depth].push(exp);
                constants.extend(exp.constants())
            }

            let mut search = Search {
                pc,
                order: order.clone(),
                buckets,
                model: Model::new(),
                nodes,
                max_nodes: self.max_nodes,
                deadline,
                incomplete: false,
            };
            let mut domains = Vec::with_capacity(order.len());
            for v in &order {
                domains.push(search.domain(*v, &constants)?)
            }

            let found = search.dfs(0, &domains)?;
            nodes = search.nodes;
            if !found {
                if search.incomplete {
                    return Err(SolverError::Failed("search over wide variable was not exhaustive".to_string()));
                }
                return Ok(None);
            }
            for (v, value) in search.model.iter() {
                solution.insert(v, value)
            }
        }

        // Variables no assertion mentions can take any value.
        for v in pc.decls().keys() {
            if solution.get(*v).is_none() {
                solution.insert(*v, 0)
            }
        }
        Ok(Some(solution))
    }
}

impl Solver for SearchSolver {
    fn is_satisfiable(&mut self, pc: &PathCondition) -> Result<bool, SolverError> {
        self.solve(pc).map(|model| model.is_some())
    }

    fn get_model(&mut self, pc: &PathCondition) -> Result<Option<Model>, SolverError> {
        self.solve(pc)
    }
}
