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

//! A fixed pool of workers exploring one workspace. Each worker
//! repeatedly asks its policy for a ready state, claims it, runs it,
//! and stores what the run produced. The main thread supervises: it
//! decides when the pool is quiescent, enforces the global timeout and
//! the external stop flag, and periodically requeues stale claims.

use crossbeam::thread;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::thread::sleep;
use std::time::{Duration, Instant};

use crate::assertion::AssertionChecker;
use crate::coverage::CoverageTracker;
use crate::emulator::Emulator;
use crate::error::WorkspaceError;
use crate::executor::{Executor, Outcome, DEFAULT_MAX_STEPS};
use crate::log;
use crate::policy::{Policy, PolicyKind};
use crate::report::{Reason, TerminalReport};
use crate::smt::Solver;
use crate::state::{Address, StateId, StateImage, Status};
use crate::workspace::Workspace;

#[derive(Clone, Debug)]
pub struct PoolOptions {
    pub workers: usize,
    /// Wall-clock limit for the whole pool.
    pub timeout: Option<Duration>,
    pub policy: PolicyKind,
    /// Worker `n` seeds its policy with `seed + n`.
    pub seed: u64,
    pub max_steps: u64,
    /// Claims older than this are returned to the ready set. `None`
    /// disables the sweep.
    pub grace: Option<Duration>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        PoolOptions {
            workers: 1,
            timeout: None,
            policy: PolicyKind::Uncovered,
            seed: 0,
            max_steps: DEFAULT_MAX_STEPS,
            grace: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub claimed: usize,
    pub forked: usize,
    pub successors: usize,
    pub terminated: usize,
    /// Assertion failures reported on paths a run did not follow.
    pub violations: usize,
    pub interrupted: usize,
    pub faults: usize,
    /// True if the pool stopped because of the timeout or stop flag,
    /// rather than running out of work.
    pub halted: bool,
}

#[derive(Default)]
struct Counters {
    claimed: AtomicUsize,
    forked: AtomicUsize,
    successors: AtomicUsize,
    terminated: AtomicUsize,
    violations: AtomicUsize,
    interrupted: AtomicUsize,
    faults: AtomicUsize,
}

impl Counters {
    fn bump(counter: &AtomicUsize, n: usize) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    fn stats(&self, halted: bool) -> PoolStats {
        PoolStats {
            claimed: self.claimed.load(Ordering::Relaxed),
            forked: self.forked.load(Ordering::Relaxed),
            successors: self.successors.load(Ordering::Relaxed),
            terminated: self.terminated.load(Ordering::Relaxed),
            violations: self.violations.load(Ordering::Relaxed),
            interrupted: self.interrupted.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            halted,
        }
    }
}

enum Response {
    Poke,
    Kill,
}

#[derive(Clone)]
enum Activity {
    Idle(usize, Sender<Response>),
    Busy(usize),
}

pub struct WorkerPool<'a, E, S> {
    workspace: &'a Workspace,
    emulator: &'a E,
    solver: S,
    coverage: &'a CoverageTracker,
    assertions: Option<&'a AssertionChecker>,
    options: PoolOptions,
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl<'a, E, S> WorkerPool<'a, E, S>
where
    E: Emulator,
    S: Solver + Clone + Send + Sync,
{
    pub fn new(
        workspace: &'a Workspace,
        emulator: &'a E,
        solver: S,
        coverage: &'a CoverageTracker,
        options: PoolOptions,
    ) -> Self {
        WorkerPool { workspace, emulator, solver, coverage, assertions: None, options }
    }

    pub fn with_assertions(self, assertions: Option<&'a AssertionChecker>) -> Self {
        WorkerPool { assertions, ..self }
    }

    /// Pick and claim a ready state. Candidates that another worker
    /// claims first are dropped from the local snapshot and the policy
    /// chooses again.
    fn find_state(&self, tid: usize, policy: &mut Policy) -> Option<StateId> {
        let mut ready = match self.workspace.list_ready() {
            Ok(ready) => ready,
            Err(e) => {
                log_from!(tid, log::WORKSPACE, &format!("Could not list ready states: {}", e));
                return None;
            }
        };
        while !ready.is_empty() {
            let id = policy.select(&ready, &self.coverage.view()).ok()?;
            match self.workspace.claim(id) {
                Ok(true) => {
                    log_from!(tid, log::POLICY, &format!("Claimed state {} ({} ready)", id, ready.len()));
                    return Some(id);
                }
                Ok(false) => ready.retain(|state| state.id != id),
                Err(e) => {
                    log_from!(tid, log::WORKSPACE, &format!("Could not claim state {}: {}", id, e));
                    return None;
                }
            }
        }
        None
    }

    fn record(&self, tid: usize, id: StateId, report: &TerminalReport, counters: &Counters) {
        log_from!(tid, log::VERBOSE, &report.to_string());
        if let Err(e) = self.workspace.record_testcase(report) {
            log_from!(tid, log::WORKSPACE, &format!("Could not record testcase for state {}: {}", id, e))
        }
        if let Reason::AssertionFailed(addr) = report.reason {
            if let Err(e) = self.workspace.record_assertion_hit(addr, id) {
                log_from!(tid, log::WORKSPACE, &format!("Could not record assertion hit for state {}: {}", id, e))
            }
        }
        if let Reason::ExecutionFault(_) = report.reason {
            Counters::bump(&counters.faults, 1)
        }
    }

    fn finish(&self, tid: usize, id: StateId, report: TerminalReport, counters: &Counters) {
        self.record(tid, id, &report, counters);
        Counters::bump(&counters.terminated, 1);
        self.close(tid, id, &Status::Terminated(report.reason))
    }

    fn close(&self, tid: usize, id: StateId, status: &Status) {
        if let Err(e) = self.workspace.mark_closed(id, status) {
            log_from!(tid, log::WORKSPACE, &format!("Could not close state {}: {}", id, e))
        }
    }

    fn unclaim(&self, tid: usize, id: StateId) {
        if let Err(e) = self.workspace.unclaim(id) {
            log_from!(tid, log::WORKSPACE, &format!("Could not unclaim state {}: {}", id, e))
        }
    }

    /// Store the successors of a fork. If none could be stored the
    /// parent goes back to the ready set to be run again. Once any
    /// successor is stored the parent is closed, since running it
    /// again would store that successor twice, and the lost
    /// successors are reported as a fault of the parent.
    fn store_fork(&self, tid: usize, id: StateId, pc: Address, successors: Vec<StateImage>, counters: &Counters) {
        let total = successors.len();
        let mut stored = 0;
        for successor in &successors {
            match self.workspace.put(successor) {
                Ok(child) => {
                    log_from!(tid, log::FORK, &format!("State {} -> {}", id, child));
                    stored += 1
                }
                Err(e) => {
                    log_from!(tid, log::WORKSPACE, &format!("Could not store successor of {}: {}", id, e));
                    break;
                }
            }
        }

        if stored == 0 {
            return self.unclaim(tid, id);
        }
        Counters::bump(&counters.forked, 1);
        Counters::bump(&counters.successors, stored);
        if stored == total {
            self.close(tid, id, &Status::Forked)
        } else {
            let reason = Reason::ExecutionFault(format!("stored {} of {} successors", stored, total));
            self.finish(tid, id, TerminalReport::new(id, pc, reason), counters)
        }
    }

    fn do_work(&self, tid: usize, id: StateId, executor: &mut Executor<'_, E, S>, counters: &Counters) {
        Counters::bump(&counters.claimed, 1);

        let image = match self.workspace.get(id) {
            Ok(image) => image,
            Err(WorkspaceError::NotFound(_)) => {
                log_from!(tid, log::WORKSPACE, &format!("State {} has no record", id));
                let status = Status::Terminated(Reason::ExecutionFault("no record".to_string()));
                return self.close(tid, id, &status);
            }
            Err(WorkspaceError::Corrupt(msg)) => {
                let report = TerminalReport::new(id, 0, Reason::ExecutionFault(msg));
                return self.finish(tid, id, report, counters);
            }
            Err(e) => {
                log_from!(tid, log::WORKSPACE, &format!("Could not load state {}: {}", id, e));
                return self.unclaim(tid, id);
            }
        };

        let pc = image.pc;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| executor.run(id, image)));
        // An interrupted run is repeated from its stored image, and
        // will find the same violations again.
        let violations = executor.take_violations();
        if !matches!(outcome, Ok(Outcome::Interrupted)) {
            for report in &violations {
                self.record(tid, id, report, counters);
                Counters::bump(&counters.violations, 1)
            }
        }

        match outcome {
            Ok(Outcome::Forked(successors)) => self.store_fork(tid, id, pc, successors, counters),
            Ok(Outcome::Terminated(report)) => self.finish(tid, id, report, counters),
            Ok(Outcome::Interrupted) => {
                Counters::bump(&counters.interrupted, 1);
                self.unclaim(tid, id)
            }
            Err(payload) => {
                let reason = Reason::ExecutionFault(format!("executor panicked: {}", panic_message(payload)));
                self.finish(tid, id, TerminalReport::new(id, pc, reason), counters)
            }
        }
    }

    /// True when the workspace holds nothing this pool could still run:
    /// no ready states, and no claims that might yet fork. Claims only
    /// count while the liveness sweep can recover them.
    fn drained(&self) -> bool {
        match self.workspace.counts() {
            Ok(counts) => counts.ready == 0 && (counts.claimed == 0 || self.options.grace.is_none()),
            Err(e) => {
                log!(log::WORKSPACE, &format!("Could not count states: {}", e));
                true
            }
        }
    }

    /// Explore until the ready set is exhausted and every worker is
    /// idle, the timeout expires, or `stop` is set.
    pub fn run(&self, stop: &AtomicBool) -> PoolStats {
        let num_workers = self.options.workers.max(1);
        let deadline = self.options.timeout.map(|timeout| Instant::now() + timeout);
        let halt = AtomicBool::new(false);
        let counters = Counters::default();
        let (tx, rx): (SyncSender<Activity>, Receiver<Activity>) = mpsc::sync_channel(2 * num_workers);

        let halted = thread::scope(|scope| {
            for tid in 0..num_workers {
                // An idle worker hands the supervisor a channel it can
                // be poked through to look for work again, or killed.
                let (poke_tx, poke_rx): (Sender<Response>, Receiver<Response>) = mpsc::channel();
                let thread_tx = tx.clone();
                let halt = &halt;
                let counters = &counters;

                scope.spawn(move |_| {
                    let mut policy = Policy::new(self.options.policy, self.options.seed.wrapping_add(tid as u64));
                    let mut executor =
                        Executor::new(tid, self.emulator, self.solver.clone(), self.coverage, self.workspace, halt)
                            .with_assertions(self.assertions)
                            .with_max_steps(self.options.max_steps);
                    loop {
                        if !halt.load(Ordering::SeqCst) {
                            if let Some(id) = self.find_state(tid, &mut policy) {
                                if thread_tx.send(Activity::Busy(tid)).is_err() {
                                    self.unclaim(tid, id);
                                    break;
                                }
                                self.do_work(tid, id, &mut executor, counters);
                                while !halt.load(Ordering::SeqCst) {
                                    match self.find_state(tid, &mut policy) {
                                        Some(id) => self.do_work(tid, id, &mut executor, counters),
                                        None => break,
                                    }
                                }
                            }
                        }
                        if thread_tx.send(Activity::Idle(tid, poke_tx.clone())).is_err() {
                            break;
                        }
                        match poke_rx.recv() {
                            Ok(Response::Poke) => (),
                            Ok(Response::Kill) | Err(_) => break,
                        }
                    }
                    log_from!(tid, log::VERBOSE, "Worker finished");
                });
            }

            // A worker is only counted as idle after it has been poked
            // and still found nothing to do. The pool is quiescent once
            // every worker is idle in that sense, as no worker can then
            // be holding a claim that might fork new work.
            let mut current_activity = vec![0; num_workers];
            let mut last_messages = vec![Activity::Busy(0); num_workers];
            let mut killed = vec![false; num_workers];
            let mut last_sweep = Instant::now();
            let halted = loop {
                while let Ok(message) = rx.try_recv() {
                    match message {
                        Activity::Busy(tid) => {
                            last_messages[tid] = Activity::Busy(tid);
                            current_activity[tid] = 0;
                        }
                        Activity::Idle(tid, poke) => {
                            last_messages[tid] = Activity::Idle(tid, poke);
                            current_activity[tid] += 1;
                        }
                    }
                }

                if halt.load(Ordering::SeqCst) {
                    for message in &last_messages {
                        if let Activity::Idle(tid, poke) = message {
                            if !killed[*tid] {
                                let _ = poke.send(Response::Kill);
                                killed[*tid] = true
                            }
                        }
                    }
                    if killed.iter().all(|k| *k) {
                        break true;
                    }
                    sleep(Duration::from_millis(1));
                    continue;
                }

                if stop.load(Ordering::SeqCst) || deadline.map_or(false, |deadline| Instant::now() >= deadline) {
                    log!(log::VERBOSE, "Stopping workers");
                    halt.store(true, Ordering::SeqCst);
                    continue;
                }

                if current_activity.iter().all(|idleness| *idleness >= 2) && self.drained() {
                    for message in &last_messages {
                        if let Activity::Idle(_, poke) = message {
                            let _ = poke.send(Response::Kill);
                        }
                    }
                    break false;
                }

                if let Some(grace) = self.options.grace {
                    if last_sweep.elapsed() >= grace / 2 {
                        match self.workspace.requeue_stale(grace) {
                            Ok(requeued) if !requeued.is_empty() => {
                                log!(log::WORKSPACE, &format!("Requeued {} stale states", requeued.len()))
                            }
                            Ok(_) => (),
                            Err(e) => log!(log::WORKSPACE, &format!("Liveness sweep failed: {}", e)),
                        }
                        last_sweep = Instant::now()
                    }
                }

                for message in &last_messages {
                    if let Activity::Idle(tid, poke) = message {
                        let _ = poke.send(Response::Poke);
                        current_activity[*tid] = 1;
                    }
                }
                sleep(Duration::from_millis(1))
            };
            // Workers still draining pokes see the channel closed and
            // exit instead of blocking on a full channel.
            drop(rx);
            halted
        });

        match halted {
            Ok(halted) => counters.stats(halted),
            Err(_) => {
                log!(log::VERBOSE, "A worker thread panicked");
                counters.stats(true)
            }
        }
    }
}
