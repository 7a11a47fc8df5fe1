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

use std::collections::{BTreeMap, BTreeSet};
use std::process::exit;
use std::sync::atomic::AtomicBool;
use std::time::Instant;

mod opts;

use spelunk_lib::coverage::CoverageTracker;
use spelunk_lib::emulator::Loader;
use spelunk_lib::error::WorkspaceError;
use spelunk_lib::log;
use spelunk_lib::machine::ListingLoader;
use spelunk_lib::pool::{PoolStats, WorkerPool};
use spelunk_lib::workspace::Workspace;

use opts::ExploreOpts;

fn main() {
    let code = spelunk_main();
    exit(code)
}

fn print_summary(workspace: &Workspace, stats: &PoolStats, millis: u128) -> Result<(), WorkspaceError> {
    let counts = workspace.counts()?;
    let reports = workspace.read_testcases()?;
    let visited = workspace.read_visited()?;
    let hits = workspace.read_assertion_hits()?;

    let mut reasons: BTreeMap<&str, usize> = BTreeMap::new();
    for report in &reports {
        *reasons.entry(report.reason.name()).or_insert(0) += 1
    }

    println!(
        "Explored {} states in {}ms ({} runs, {} forks){}",
        counts.states,
        millis,
        stats.claimed,
        stats.forked,
        if stats.halted { ", stopped early" } else { "" }
    );
    println!("{} ready, {} terminated", counts.ready + counts.claimed, reports.len());
    for (reason, n) in &reasons {
        println!("  {}: {}", reason, n)
    }
    if !hits.is_empty() {
        let addrs: BTreeSet<_> = hits.iter().map(|(addr, _)| addr).collect();
        println!("Assertion failures at {} addresses", addrs.len())
    }
    println!("Visited {} unique addresses, digest {}", visited.len(), workspace.visited_digest()?);
    println!("Results in {}", workspace.path().display());
    Ok(())
}

fn spelunk_main() -> i32 {
    let opts = opts::explore_opts();
    let ExploreOpts { workspace, program, args, config, assertions } = opts::parse(&opts);

    let (emulator, root) = match ListingLoader.load(&program, &args) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Error when loading program '{}': {}", program.display(), e);
            return 1;
        }
    };

    let workspace = match Workspace::open(&workspace) {
        Ok(workspace) => workspace,
        Err(e) => {
            eprintln!("Could not open workspace '{}': {}", workspace.display(), e);
            return 1;
        }
    };

    let counts = match workspace.counts() {
        Ok(counts) => counts,
        Err(e) => {
            eprintln!("Could not read workspace '{}': {}", workspace.path().display(), e);
            return 1;
        }
    };
    if counts.states == 0 {
        match workspace.put(&root) {
            Ok(id) => log!(log::VERBOSE, &format!("Stored root state {}", id)),
            Err(e) => {
                eprintln!("Could not store the initial state: {}", e);
                return 1;
            }
        }
    } else {
        log!(log::VERBOSE, &format!("Resuming workspace with {} ready states", counts.ready));
        if let Some(grace) = config.grace {
            match workspace.requeue_stale(grace) {
                Ok(requeued) if !requeued.is_empty() => {
                    log!(log::VERBOSE, &format!("Requeued {} stale claims", requeued.len()))
                }
                Ok(_) => (),
                Err(e) => {
                    eprintln!("Could not requeue stale claims: {}", e);
                    return 1;
                }
            }
        }
    }

    let coverage = match CoverageTracker::from_workspace(&workspace) {
        Ok(coverage) => coverage,
        Err(e) => {
            eprintln!("Could not read visited addresses: {}", e);
            return 1;
        }
    };

    let options = config.pool_options(num_cpus::get());
    log!(
        log::VERBOSE,
        &format!("Exploring with {} workers, {} policy, seed {}", options.workers, options.policy, options.seed)
    );

    let now = Instant::now();
    let stop = AtomicBool::new(false);
    let stats = WorkerPool::new(&workspace, &emulator, config.solver(), &coverage, options)
        .with_assertions(assertions.as_ref())
        .run(&stop);

    if let Err(e) = print_summary(&workspace, &stats, now.elapsed().as_millis()) {
        eprintln!("Could not summarise workspace '{}': {}", workspace.path().display(), e);
        return 1;
    }
    0
}
