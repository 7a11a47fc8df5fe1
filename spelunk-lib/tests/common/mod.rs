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

use std::fs;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use spelunk_lib::assertion::AssertionChecker;
use spelunk_lib::coverage::CoverageTracker;
use spelunk_lib::emulator::InputSpec;
use spelunk_lib::machine::Program;
use spelunk_lib::pool::{PoolOptions, PoolStats, WorkerPool};
use spelunk_lib::smt::search::SearchSolver;
use spelunk_lib::workspace::Workspace;

static COUNTER: AtomicUsize = AtomicUsize::new(0);

/// A fresh directory for one workspace, removed when dropped.
pub struct Scratch {
    pub dir: PathBuf,
}

impl Scratch {
    pub fn new(tag: &str) -> Self {
        let n = COUNTER.fetch_add(1, Ordering::SeqCst);
        let dir = std::env::temp_dir().join(format!("spelunk_{}_{}_{}", tag, process::id(), n));
        let _ = fs::remove_dir_all(&dir);
        Scratch { dir }
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.dir);
    }
}

/// Store the root state of `program` for the given argument and run a
/// pool over the workspace until it is done.
#[allow(dead_code)]
pub fn explore(
    workspace: &Workspace,
    program: &Program,
    arg: &str,
    options: PoolOptions,
    assertions: Option<&AssertionChecker>,
) -> PoolStats {
    workspace.put(&program.root_state(&[InputSpec::parse(arg)])).unwrap();
    resume(workspace, program, options, assertions)
}

/// Run a pool over whatever is ready in the workspace.
#[allow(dead_code)]
pub fn resume(
    workspace: &Workspace,
    program: &Program,
    options: PoolOptions,
    assertions: Option<&AssertionChecker>,
) -> PoolStats {
    let coverage = CoverageTracker::from_workspace(workspace).unwrap();
    WorkerPool::new(workspace, program, SearchSolver::new(), &coverage, options)
        .with_assertions(assertions)
        .run(&AtomicBool::new(false))
}
