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

//! Process-wide coverage. Workers count executed addresses locally
//! during a run and merge the counts in batches. Readers take a
//! [`CoverageView`], an immutable snapshot that may lag behind the
//! latest merges, and never contend with each other for a lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::error::WorkspaceError;
use crate::log;
use crate::state::Address;
use crate::workspace::Workspace;

#[derive(Clone, Debug, Default)]
pub struct CoverageView {
    hits: Arc<HashMap<Address, u64>>,
}

impl CoverageView {
    pub fn is_covered(&self, addr: Address) -> bool {
        self.hits.contains_key(&addr)
    }

    /// How often `addr` has been executed, across all workers.
    pub fn hit_count(&self, addr: Address) -> u64 {
        self.hits.get(&addr).copied().unwrap_or(0)
    }

    /// Number of unique addresses visited.
    pub fn unique(&self) -> usize {
        self.hits.len()
    }

    pub fn total(&self) -> u64 {
        self.hits.values().sum()
    }
}

#[derive(Default)]
pub struct CoverageTracker {
    counts: Mutex<HashMap<Address, u64>>,
    published: RwLock<CoverageView>,
}

impl CoverageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the tracker from the visited log of an existing workspace,
    /// so a resumed run does not treat old code as new. Each address
    /// starts with a single hit.
    pub fn from_workspace(workspace: &Workspace) -> Result<Self, WorkspaceError> {
        let tracker = CoverageTracker::new();
        let hits: HashMap<Address, u64> = workspace.read_visited()?.into_iter().map(|addr| (addr, 1)).collect();
        tracker.merge(&hits);
        Ok(tracker)
    }

    /// Add a batch of local hit counts, returning the addresses that
    /// had never been seen before in ascending order.
    pub fn merge(&self, hits: &HashMap<Address, u64>) -> Vec<Address> {
        if hits.is_empty() {
            return Vec::new();
        }

        let mut fresh = Vec::new();
        let mut counts = match self.counts.lock() {
            Ok(counts) => counts,
            Err(poisoned) => poisoned.into_inner(),
        };
        for (addr, n) in hits {
            let count = counts.entry(*addr).or_insert(0);
            if *count == 0 {
                fresh.push(*addr)
            }
            *count += n
        }

        // Published while still holding `counts`, so views never go
        // backwards.
        let snapshot = CoverageView { hits: Arc::new(counts.clone()) };
        match self.published.write() {
            Ok(mut view) => *view = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
        drop(counts);

        fresh.sort_unstable();
        if !fresh.is_empty() {
            log!(log::COVERAGE, &format!("{} new addresses covered", fresh.len()))
        }
        fresh
    }

    pub fn view(&self) -> CoverageView {
        match self.published.read() {
            Ok(view) => view.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}
