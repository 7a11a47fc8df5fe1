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

//! The executor runs one claimed state forward until it forks, reaches
//! a terminal condition, or is interrupted.
//!
//! Branches whose condition is decided by the state's concrete values
//! are resolved by the emulator. Symbolic branches are resolved here:
//! every side is checked against the path condition, unsatisfiable
//! sides are dropped, a single survivor is followed in place, and two
//! or more survivors end the run with one successor image each.
//!
//! An assertion that can fail is handled the same way. If no input on
//! the path satisfies it the run ends as an assertion failure. If some
//! inputs do, the failure is reported for the others and the run
//! continues on the inputs that satisfy it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::assertion::{AssertionChecker, Violation};
use crate::coverage::CoverageTracker;
use crate::emulator::{Emulator, StepResult};
use crate::error::SolverError;
use crate::log;
use crate::report::{Reason, TerminalReport};
use crate::smt::Solver;
use crate::state::{Address, StateId, StateImage, Status};
use crate::workspace::Workspace;

pub const DEFAULT_MAX_STEPS: u64 = 100_000;

/// Hit counts are merged into the shared tracker once this many
/// distinct addresses have been seen locally, and at the end of a run.
const FLUSH_THRESHOLD: usize = 512;

#[derive(Debug)]
pub enum Outcome {
    /// Two or more successors, not yet stored.
    Forked(Vec<StateImage>),
    Terminated(TerminalReport),
    /// Stopped between steps by the halt flag. Progress made by the
    /// run is discarded.
    Interrupted,
}

pub struct Executor<'a, E, S> {
    tid: usize,
    emulator: &'a E,
    solver: S,
    assertions: Option<&'a AssertionChecker>,
    coverage: &'a CoverageTracker,
    workspace: &'a Workspace,
    halt: &'a AtomicBool,
    max_steps: u64,
    hits: HashMap<Address, u64>,
    violations: Vec<TerminalReport>,
}

fn solver_fault(pc: Address, err: SolverError) -> Reason {
    Reason::ExecutionFault(format!("{} at {:#x}", err, pc))
}

impl<'a, E: Emulator, S: Solver> Executor<'a, E, S> {
    pub fn new(
        tid: usize,
        emulator: &'a E,
        solver: S,
        coverage: &'a CoverageTracker,
        workspace: &'a Workspace,
        halt: &'a AtomicBool,
    ) -> Self {
        Executor {
            tid,
            emulator,
            solver,
            assertions: None,
            coverage,
            workspace,
            halt,
            max_steps: DEFAULT_MAX_STEPS,
            hits: HashMap::new(),
            violations: Vec::new(),
        }
    }

    pub fn with_assertions(self, assertions: Option<&'a AssertionChecker>) -> Self {
        Executor { assertions, ..self }
    }

    /// Limit the number of instructions a single run may execute.
    pub fn with_max_steps(self, max_steps: u64) -> Self {
        Executor { max_steps, ..self }
    }

    fn flush(&mut self) {
        let fresh = self.coverage.merge(&self.hits);
        self.hits.clear();
        if let Err(e) = self.workspace.record_visited_all(&fresh) {
            log_from!(self.tid, log::WORKSPACE, &format!("Failed to record visited addresses: {}", e))
        }
    }

    fn report(&mut self, id: StateId, state: &StateImage, reason: Reason) -> TerminalReport {
        let mut report = TerminalReport::new(id, state.pc, reason);
        report.steps = state.steps;
        if report.reason != Reason::DeadEnd {
            match self.solver.get_model(&state.path) {
                Ok(Some(model)) => {
                    report.input = Some(state.concretize_input(&model));
                    report.model = Some(model)
                }
                Ok(None) => log_from!(self.tid, log::SOLVER, &format!("No model for state {}", id)),
                Err(e) => log_from!(self.tid, log::SOLVER, &format!("No model for state {}: {}", id, e)),
            }
        }
        report
    }

    fn terminate(&mut self, id: StateId, state: &StateImage, reason: Reason) -> Outcome {
        self.flush();
        log_from!(self.tid, log::VERBOSE, &format!("State {} {} at {:#x}", id, reason, state.pc));
        Outcome::Terminated(self.report(id, state, reason))
    }

    /// Assertion failures found by the last run on paths it did not
    /// follow. The run itself continued, so these come in addition to
    /// its outcome.
    pub fn take_violations(&mut self) -> Vec<TerminalReport> {
        std::mem::take(&mut self.violations)
    }

    pub fn run(&mut self, id: StateId, mut state: StateImage) -> Outcome {
        state.id = Some(id);
        state.status = Status::Running;
        self.violations.clear();
        log_from!(self.tid, log::VERBOSE, &format!("Running state {} from {:#x}", id, state.pc));

        let mut steps = 0;
        loop {
            if self.halt.load(Ordering::Relaxed) {
                self.flush();
                return Outcome::Interrupted;
            }
            if steps >= self.max_steps {
                return self.terminate(id, &state, Reason::TimedOut);
            }
            steps += 1;

            let pc = state.pc;
            state.note_visit(pc);
            *self.hits.entry(pc).or_insert(0) += 1;
            if self.hits.len() >= FLUSH_THRESHOLD {
                self.flush()
            }

            if let Some(assertions) = self.assertions {
                // Each rule that can both fail and hold is asserted once
                // it is reported, so this ends after at most one pass
                // over the rules at `pc`.
                loop {
                    match assertions.violation(pc, &state, &mut self.solver) {
                        Ok(None) => break,
                        Ok(Some(Violation { fails, holds: None })) => {
                            state.path.assert(fails);
                            return self.terminate(id, &state, Reason::AssertionFailed(pc));
                        }
                        Ok(Some(Violation { fails, holds: Some(holds) })) => {
                            let mut failing = state.clone();
                            failing.path.assert(fails);
                            log_from!(self.tid, log::VERBOSE, &format!("State {} can fail assertion at {:#x}", id, pc));
                            let report = self.report(id, &failing, Reason::AssertionFailed(pc));
                            self.violations.push(report);
                            state.path.assert(holds)
                        }
                        Err(e) => return self.terminate(id, &state, solver_fault(pc, e)),
                    }
                }
            }

            let successors = match self.emulator.step(&mut state) {
                Ok(StepResult::Continue) => continue,
                Ok(StepResult::Exit(code)) => return self.terminate(id, &state, Reason::Exited(code)),
                Ok(StepResult::Fault(kind)) => return self.terminate(id, &state, Reason::Crashed(kind)),
                Ok(StepResult::Branch(successors)) => successors,
                Err(e) => return self.terminate(id, &state, Reason::ExecutionFault(e.to_string())),
            };

            let mut live = Vec::with_capacity(successors.len());
            for successor in successors {
                match self.solver.check_sat_with(&state.path, &successor.condition) {
                    Ok(true) => live.push(successor),
                    Ok(false) => {
                        log_from!(self.tid, log::FORK, &format!("Pruned branch {:#x} -> {:#x}", pc, successor.target))
                    }
                    Err(e) => return self.terminate(id, &state, solver_fault(pc, e)),
                }
            }

            match live.len() {
                0 => return self.terminate(id, &state, Reason::DeadEnd),
                1 => {
                    let successor = live.remove(0);
                    state.path.assert(successor.condition);
                    state.pc = successor.target
                }
                n => {
                    self.flush();
                    log_from!(self.tid, log::FORK, &format!("State {} forks {} ways at {:#x}", id, n, pc));
                    state.status = Status::Forked;
                    let successors = live.into_iter().map(|s| state.fork(s.condition, s.target)).collect();
                    return Outcome::Forked(successors);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulator::InputSpec;
    use crate::machine::{Program, DEFAULT_BASE};
    use crate::report::FaultKind;
    use crate::smt::search::SearchSolver;
    use crate::smt::smtlib::Exp;
    use crate::workspace::scratch_dir;
    use std::fs;

    const CHOOSE: &str = "
        _start:
            input r1, 0
            bne r1, 0x61, other
            exit 1
        other:
            blt r1, 0x61, low
            exit 2
        low:
            exit 3
    ";

    fn with_executor<F>(listing: &str, assertions: Option<&AssertionChecker>, f: F)
    where
        F: FnOnce(&Program, &mut Executor<Program, SearchSolver>, &Workspace),
    {
        let dir = scratch_dir("exec");
        let workspace = Workspace::open(&dir).unwrap();
        let coverage = CoverageTracker::new();
        let halt = AtomicBool::new(false);
        let program = Program::parse(listing).unwrap();
        let mut executor = Executor::new(0, &program, SearchSolver::new(), &coverage, &workspace, &halt)
            .with_assertions(assertions)
            .with_max_steps(50);
        f(&program, &mut executor, &workspace);
        fs::remove_dir_all(&dir).unwrap();
    }

    fn terminated(outcome: Outcome) -> TerminalReport {
        match outcome {
            Outcome::Terminated(report) => report,
            other => panic!("expected a terminal report, got {:?}", other),
        }
    }

    #[test]
    fn concrete_input_runs_to_exit() {
        with_executor(CHOOSE, None, |program, executor, workspace| {
            let root = program.root_state(&[InputSpec::parse("a")]);
            let report = terminated(executor.run(StateId::from_u64(0), root));
            assert_eq!(report.reason, Reason::Exited(1));
            assert_eq!(report.input, Some(b"a".to_vec()));
            assert_eq!(report.steps, 3);
            assert!(workspace.read_visited().unwrap().contains(&(DEFAULT_BASE + 8)));
        })
    }

    #[test]
    fn symbolic_branch_forks() {
        with_executor(CHOOSE, None, |program, executor, _| {
            let root = program.root_state(&[InputSpec::parse("+")]);
            let successors = match executor.run(StateId::from_u64(5), root.clone()) {
                Outcome::Forked(successors) => successors,
                other => panic!("expected a fork, got {:?}", other),
            };
            assert_eq!(successors.len(), 2);
            for successor in &successors {
                assert_eq!(successor.parent, Some(StateId::from_u64(5)));
                assert_eq!(successor.status, Status::Ready);
                assert_eq!(successor.path.len(), 1);
                assert!(successor.path.extends(&root.path));
            }
            assert_eq!(successors[0].pc, program.label("other").unwrap());
            assert_eq!(successors[1].pc, DEFAULT_BASE + 8);
        })
    }

    #[test]
    fn one_sided_branch_continues_in_place() {
        let listing = "
            input r1, 0
            blt r1, 0x10, small
            exit 0
        small:
            blt r1, 0x20, tiny    ; always taken once r1 < 0x10
            exit 1
        tiny:
            exit 2
        ";
        with_executor(listing, None, |program, executor, _| {
            let mut root = program.root_state(&[InputSpec::parse("+")]);
            root.path.assert(Exp::Bvult(Box::new(Exp::Var(0)), Box::new(Exp::Bits64(0x10, 8))));
            let report = terminated(executor.run(StateId::from_u64(1), root));
            assert_eq!(report.reason, Reason::Exited(2));
            assert!(report.input.unwrap()[0] < 0x10);
        })
    }

    #[test]
    fn step_budget() {
        with_executor("spin: jmp spin", None, |program, executor, _| {
            let report = terminated(executor.run(StateId::from_u64(0), program.root_state(&[])));
            assert_eq!(report.reason, Reason::TimedOut);
            assert_eq!(report.steps, 50);
        })
    }

    #[test]
    fn halt_interrupts() {
        let dir = scratch_dir("exec");
        let workspace = Workspace::open(&dir).unwrap();
        let coverage = CoverageTracker::new();
        let halt = AtomicBool::new(true);
        let program = Program::parse("spin: jmp spin").unwrap();
        let mut executor = Executor::new(0, &program, SearchSolver::new(), &coverage, &workspace, &halt);
        assert!(matches!(executor.run(StateId::from_u64(0), program.root_state(&[])), Outcome::Interrupted));
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn assertion_failure_is_terminal() {
        let listing = "
            input r1, 0
            add r1, 1
            nop
            exit 0
        ";
        let assertions = AssertionChecker::parse(&format!("{:#x} r1 != 0x42", DEFAULT_BASE + 8)).unwrap();
        with_executor(listing, Some(&assertions), |program, executor, _| {
            let report = terminated(executor.run(StateId::from_u64(2), program.root_state(&[InputSpec::parse("A")])));
            assert_eq!(report.reason, Reason::AssertionFailed(DEFAULT_BASE + 8));
            assert_eq!(report.input, Some(vec![0x41]));
            assert!(executor.take_violations().is_empty());
        })
    }

    #[test]
    fn assertion_that_can_hold_reports_and_continues() {
        let listing = "
            input r1, 0
            nop
            beq r1, 0x62, deep
            exit 0
        deep:
            exit 7
        ";
        let assertions = AssertionChecker::parse(&format!("{:#x} r1 != 0x61", DEFAULT_BASE + 4)).unwrap();
        with_executor(listing, Some(&assertions), |program, executor, _| {
            let root = program.root_state(&[InputSpec::parse("+")]);
            let successors = match executor.run(StateId::from_u64(3), root) {
                Outcome::Forked(successors) => successors,
                other => panic!("expected a fork, got {:?}", other),
            };
            assert_eq!(successors.len(), 2);
            // The rule and the branch predicate are both on each path.
            assert!(successors.iter().all(|successor| successor.path.len() == 2));

            let violations = executor.take_violations();
            assert_eq!(violations.len(), 1);
            assert_eq!(violations[0].state_id, StateId::from_u64(3));
            assert_eq!(violations[0].reason, Reason::AssertionFailed(DEFAULT_BASE + 4));
            assert_eq!(violations[0].input, Some(b"a".to_vec()));
            assert!(executor.take_violations().is_empty());

            for successor in successors {
                let report = terminated(executor.run(StateId::from_u64(4), successor));
                assert!(matches!(report.reason, Reason::Exited(0) | Reason::Exited(7)));
                assert_ne!(report.input, Some(b"a".to_vec()));
            }
            assert!(executor.take_violations().is_empty());
        })
    }

    #[test]
    fn out_of_window_access_crashes() {
        with_executor("mov r1, 0x20000\nstore [r1], r1\n", None, |program, executor, _| {
            let report = terminated(executor.run(StateId::from_u64(0), program.root_state(&[])));
            assert_eq!(report.reason, Reason::Crashed(FaultKind::SegFault(0x20000)));
        })
    }

    #[test]
    fn emulator_errors_are_execution_faults() {
        with_executor("input r1, 0\nstore [r1], r1\n", None, |program, executor, _| {
            let report = terminated(executor.run(StateId::from_u64(0), program.root_state(&[InputSpec::parse("+")])));
            assert!(matches!(report.reason, Reason::ExecutionFault(_)));
        })
    }

    #[test]
    fn solver_errors_are_execution_faults() {
        let dir = scratch_dir("exec");
        let workspace = Workspace::open(&dir).unwrap();
        let coverage = CoverageTracker::new();
        let halt = AtomicBool::new(false);
        let program = Program::parse(CHOOSE).unwrap();
        let solver = SearchSolver::new().with_max_nodes(0);
        let mut executor = Executor::new(0, &program, solver, &coverage, &workspace, &halt);
        let report = terminated(executor.run(StateId::from_u64(0), program.root_state(&[InputSpec::parse("+")])));
        assert!(matches!(report.reason, Reason::ExecutionFault(_)));
        assert_eq!(report.pc, DEFAULT_BASE + 4);
        fs::remove_dir_all(&dir).unwrap();
    }
}
