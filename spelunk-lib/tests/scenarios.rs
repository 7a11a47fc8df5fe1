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

mod common;

use std::collections::HashMap;
use std::fs;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

use common::{explore, Scratch};
use spelunk_lib::assertion::AssertionChecker;
use spelunk_lib::coverage::CoverageTracker;
use spelunk_lib::emulator::InputSpec;
use spelunk_lib::machine::Program;
use spelunk_lib::policy::PolicyKind;
use spelunk_lib::pool::{PoolOptions, WorkerPool};
use spelunk_lib::report::{FaultKind, Reason};
use spelunk_lib::smt::search::SearchSolver;
use spelunk_lib::state::Status;
use spelunk_lib::workspace::Workspace;

/// One symbolic byte decides between a plain exit and a block guarded
/// by an assertion.
const GUARDED: &str = "
    _start:
        input r1, 0              ; 0x400000
        beq r1, 0x41, bad        ; 0x400004
        exit 0                   ; 0x400008
    bad:
        mov r2, r1               ; 0x40000c
        exit 1                   ; 0x400010
";

#[test]
fn assertion_failure_on_one_side_of_a_branch() {
    let scratch = Scratch::new("assert");
    let workspace = Workspace::open(&scratch.dir).unwrap();
    let program = Program::parse(GUARDED).unwrap();
    let checker = AssertionChecker::parse("0x40000c r1 != 0x41\n0x400008 r1 != 0x41\n").unwrap();

    let options = PoolOptions { workers: 2, ..PoolOptions::default() };
    let stats = explore(&workspace, &program, "+", options, Some(&checker));
    assert_eq!(stats.claimed, 3);
    assert_eq!(stats.forked, 1);
    assert_eq!(stats.successors, 2);
    assert_eq!(stats.terminated, 2);
    assert_eq!(stats.faults, 0);

    let mut reports = workspace.read_testcases().unwrap();
    reports.sort_by_key(|report| report.pc);
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].reason, Reason::Exited(0));
    assert_eq!(reports[1].reason, Reason::AssertionFailed(0x40000c));
    assert_eq!(reports[1].input, Some(b"A".to_vec()));

    let hits: Vec<_> = workspace.read_assertion_hits().unwrap().into_iter().collect();
    assert_eq!(hits, vec![(0x40000c, reports[1].state_id)]);
    assert_eq!(
        workspace.status(reports[1].state_id).unwrap(),
        Status::Terminated(Reason::AssertionFailed(0x40000c))
    );
}

/// The assertion before the branch fails for one input and holds for
/// all others, which go on to the branch.
const MAYBE: &str = "
    _start:
        input r1, 0              ; 0x400000
        nop                      ; 0x400004
        beq r1, 0x62, deep       ; 0x400008
        exit 0                   ; 0x40000c
    deep:
        exit 7                   ; 0x400010
";

#[test]
fn exploration_continues_past_an_assertion_that_can_hold() {
    let scratch = Scratch::new("maybe");
    let workspace = Workspace::open(&scratch.dir).unwrap();
    let program = Program::parse(MAYBE).unwrap();
    let checker = AssertionChecker::parse("0x400004 r1 != 0x61").unwrap();

    let options = PoolOptions { workers: 2, ..PoolOptions::default() };
    let stats = explore(&workspace, &program, "+", options, Some(&checker));
    assert_eq!(stats.claimed, 3);
    assert_eq!(stats.forked, 1);
    assert_eq!(stats.terminated, 2);
    assert_eq!(stats.violations, 1);
    assert_eq!(stats.faults, 0);

    let mut reports = workspace.read_testcases().unwrap();
    reports.sort_by_key(|report| report.pc);
    let outcomes: Vec<_> = reports.iter().map(|report| (report.reason.clone(), report.input.clone())).collect();
    assert_eq!(
        outcomes,
        vec![
            (Reason::AssertionFailed(0x400004), Some(b"a".to_vec())),
            (Reason::Exited(0), Some(vec![0])),
            (Reason::Exited(7), Some(b"b".to_vec())),
        ]
    );

    let hits: Vec<_> = workspace.read_assertion_hits().unwrap().into_iter().collect();
    assert_eq!(hits, vec![(0x400004, reports[0].state_id)]);
    let visited = workspace.read_visited().unwrap();
    assert!(visited.contains(&0x40000c));
    assert!(visited.contains(&0x400010));
}

#[test]
fn timeout_stops_an_endless_symbolic_loop() {
    let scratch = Scratch::new("timeout");
    let workspace = Workspace::open(&scratch.dir).unwrap();
    let program = Program::parse(
        "
        _start:
            input r1, 0
        spin:
            beq r1, 0x41, spin
            jmp spin
        ",
    )
    .unwrap();
    workspace.put(&program.root_state(&[InputSpec::parse("+")])).unwrap();

    let coverage = CoverageTracker::new();
    let options =
        PoolOptions { workers: 4, timeout: Some(Duration::from_secs(1)), max_steps: u64::MAX, ..PoolOptions::default() };
    let start = Instant::now();
    let stats = WorkerPool::new(&workspace, &program, SearchSolver::new(), &coverage, options).run(&AtomicBool::new(false));
    assert!(start.elapsed() < Duration::from_secs(5));

    assert!(stats.halted);
    assert_eq!(stats.forked, 1);
    assert_eq!(stats.terminated, 0);
    assert!(workspace.read_testcases().unwrap().is_empty());

    // Both sides of the fork were interrupted and can be resumed.
    let counts = workspace.counts().unwrap();
    assert_eq!(counts.states, 3);
    assert_eq!(counts.ready, 2);
    assert_eq!(counts.claimed, 0);
    assert_eq!(counts.closed, 1);

    let visited = workspace.read_visited().unwrap();
    assert!(visited.contains(&0x400000));
    assert!(visited.contains(&0x400004));
    assert!(visited.contains(&0x400008));
}

/// The first branch leads either to a block that is reached once or
/// into a counted loop that forks on every iteration. Every fork in the
/// loop resumes at an address that has already been executed.
const RARE: &str = "
    _start:
        input r1, 0              ; 0x400000
        bne r1, 0x52, setup      ; 0x400004
    rare:
        mov r0, 0x52             ; 0x400008
        exit r0                  ; 0x40000c
    setup:
        input r3, 1              ; 0x400010
        mov r2, 0                ; 0x400014
        jmp loop                 ; 0x400018
    check:
        blt r3, r2, loop         ; 0x40001c
    loop:
        add r2, 1                ; 0x400020
        beq r2, 20, done         ; 0x400024
        jmp check                ; 0x400028
    done:
        exit r2                  ; 0x40002c
";

#[test]
fn rare_branch_is_reached_before_the_loop_is_exhausted() {
    let scratch = Scratch::new("rare");
    let workspace = Workspace::open(&scratch.dir).unwrap();
    let program = Program::parse(RARE).unwrap();
    assert_eq!(program.label("rare"), Some(0x400008));
    assert_eq!(program.label("done"), Some(0x40002c));

    let options = PoolOptions { workers: 1, policy: PolicyKind::Uncovered, ..PoolOptions::default() };
    let stats = explore(&workspace, &program, "++", options, None);
    assert!(!stats.halted);

    let reports = workspace.read_testcases().unwrap();
    assert_eq!(reports.len(), 21);
    assert_eq!(reports[0].reason, Reason::Exited(0x52));
    assert_eq!(reports[0].input.as_ref().map(|input| input[0]), Some(b'R'));
    assert!(reports[1..].iter().all(|report| report.reason == Reason::Exited(20)));

    // The visited log is in order of first sight.
    let log = fs::read_to_string(workspace.path().join("visited.txt")).unwrap();
    let position = |addr: u64| log.lines().position(|line| line == format!("{:#018x}", addr)).unwrap();
    assert!(position(0x400008) < position(0x40002c));
}

/// Four states parked at exits that have already run, stored before
/// a state that came through a hot loop and resumes at new code.
const PARKED: &str = "
    _start:
        exit 1                   ; 0x400000
        exit 2                   ; 0x400004
    hot:
        jmp hot                  ; 0x400008
    fresh:
        exit 3                   ; 0x40000c
";

fn first_exit(policy: PolicyKind, seed: u64) -> Reason {
    let scratch = Scratch::new("parked");
    let workspace = Workspace::open(&scratch.dir).unwrap();
    let program = Program::parse(PARKED).unwrap();
    for i in 0..4 {
        let mut state = program.root_state(&[]);
        state.pc = 0x400000 + 4 * (i % 2);
        workspace.put(&state).unwrap();
    }
    let mut fresh = program.root_state(&[]);
    fresh.pc = program.label("fresh").unwrap();
    fresh.trail.push_back(program.label("hot").unwrap());
    let fresh_id = workspace.put(&fresh).unwrap();
    assert_eq!(fresh_id.as_u64(), 4);

    let coverage = CoverageTracker::new();
    let hits: HashMap<u64, u64> = vec![(0x400000, 1), (0x400004, 1), (0x400008, 1000)].into_iter().collect();
    coverage.merge(&hits);

    let options = PoolOptions { workers: 1, policy, seed, ..PoolOptions::default() };
    WorkerPool::new(&workspace, &program, SearchSolver::new(), &coverage, options).run(&AtomicBool::new(false));
    let reports = workspace.read_testcases().unwrap();
    assert_eq!(reports.len(), 5);
    reports[0].reason.clone()
}

#[test]
fn uncovered_policy_picks_new_code_over_older_states() {
    assert_eq!(first_exit(PolicyKind::Uncovered, 0), Reason::Exited(3));
    // Weighted ranks by average hit count, and the hot loop in the
    // fresh state's trail outweighs its new address.
    assert_eq!(first_exit(PolicyKind::Weighted, 0), Reason::Exited(1));
    let random: Vec<Reason> = (0..8).map(|seed| first_exit(PolicyKind::Random, seed)).collect();
    assert!(random.iter().any(|reason| *reason != Reason::Exited(3)));
}

#[test]
fn every_policy_reaches_the_same_states() {
    let mut digests = Vec::new();
    for policy in &[PolicyKind::Random, PolicyKind::Uncovered, PolicyKind::Weighted] {
        let scratch = Scratch::new("policies");
        let workspace = Workspace::open(&scratch.dir).unwrap();
        let program = Program::parse(RARE).unwrap();
        let options = PoolOptions { workers: 3, policy: *policy, seed: 11, ..PoolOptions::default() };
        let stats = explore(&workspace, &program, "++", options, None);
        assert_eq!(stats.terminated, 21);
        assert_eq!(stats.forked, 20);
        assert_eq!(workspace.read_visited().unwrap().len(), 12);
        digests.push(workspace.visited_digest().unwrap())
    }
    assert!(digests.windows(2).all(|pair| pair[0] == pair[1]));
}

#[test]
fn crashes_are_reported_with_their_inputs() {
    let scratch = Scratch::new("crash");
    let workspace = Workspace::open(&scratch.dir).unwrap();
    let program = Program::parse(
        "
        .memory 0x1000 0x10
        _start:
            input r1, 0          ; 0x400000
            blt r1, 0x10, ok     ; 0x400004
            abort                ; 0x400008
        ok:
            mov r2, 0x1000       ; 0x40000c
            store [r2], r1       ; 0x400010
            mov r2, 0x2000       ; 0x400014
            load r3, [r2]        ; 0x400018
            exit r3
        ",
    )
    .unwrap();

    let options = PoolOptions { workers: 2, ..PoolOptions::default() };
    let stats = explore(&workspace, &program, "+", options, None);
    assert_eq!(stats.terminated, 2);

    let mut reports = workspace.read_testcases().unwrap();
    reports.sort_by_key(|report| report.pc);
    assert_eq!(reports[0].reason, Reason::Crashed(FaultKind::Abort));
    assert_eq!(reports[0].input, Some(vec![0x10]));
    assert_eq!(reports[1].reason, Reason::Crashed(FaultKind::SegFault(0x2000)));
    assert_eq!(reports[1].input, Some(vec![0]));
}
