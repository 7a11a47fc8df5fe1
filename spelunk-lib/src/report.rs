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

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::smt::Model;
use crate::state::{Address, StateId};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultKind {
    /// Access outside of mapped memory.
    SegFault(Address),
    /// The program counter does not point at an instruction.
    IllegalInstruction(Address),
    /// The program aborted itself.
    Abort,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultKind::SegFault(addr) => write!(f, "segmentation fault accessing {:#x}", addr),
            FaultKind::IllegalInstruction(addr) => write!(f, "illegal instruction at {:#x}", addr),
            FaultKind::Abort => write!(f, "abort"),
        }
    }
}

/// Why a state stopped for good.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reason {
    Exited(u64),
    Crashed(FaultKind),
    AssertionFailed(Address),
    /// The per-run step budget ran out.
    TimedOut,
    /// The path condition itself is unsatisfiable.
    DeadEnd,
    /// The emulator or solver failed in a way the program itself
    /// cannot cause.
    ExecutionFault(String),
}

impl Reason {
    pub fn name(&self) -> &'static str {
        match self {
            Reason::Exited(_) => "exited",
            Reason::Crashed(_) => "crashed",
            Reason::AssertionFailed(_) => "assertion-failed",
            Reason::TimedOut => "timed-out",
            Reason::DeadEnd => "dead-end",
            Reason::ExecutionFault(_) => "execution-fault",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reason::Exited(code) => write!(f, "exited with code {}", code),
            Reason::Crashed(kind) => write!(f, "crashed: {}", kind),
            Reason::AssertionFailed(addr) => write!(f, "assertion failed at {:#x}", addr),
            Reason::TimedOut => write!(f, "step budget exhausted"),
            Reason::DeadEnd => write!(f, "path condition is unsatisfiable"),
            Reason::ExecutionFault(msg) => write!(f, "execution fault: {}", msg),
        }
    }
}

/// The record kept for every state that reaches a terminal
/// condition. `input` is the concrete program input picked by `model`,
/// when the solver could produce one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalReport {
    pub state_id: StateId,
    pub pc: Address,
    pub reason: Reason,
    pub steps: u64,
    pub model: Option<Model>,
    pub input: Option<Vec<u8>>,
}

impl TerminalReport {
    pub fn new(state_id: StateId, pc: Address, reason: Reason) -> Self {
        TerminalReport { state_id, pc, reason, steps: 0, model: None, input: None }
    }
}

impl fmt::Display for TerminalReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "state {} at {:#x}: {}", self.state_id, self.pc, self.reason)?;
        if let Some(input) = &self.input {
            write!(f, " (input {:?})", String::from_utf8_lossy(input))?
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_display() {
        let mut report = TerminalReport::new(StateId::from_u64(4), 0x401003, Reason::AssertionFailed(0x401003));
        report.input = Some(b"ab".to_vec());
        assert_eq!(report.to_string(), "state 4 at 0x401003: assertion failed at 0x401003 (input \"ab\")");
    }

    #[test]
    fn reason_names_are_distinct() {
        let reasons = vec![
            Reason::Exited(0),
            Reason::Crashed(FaultKind::Abort),
            Reason::AssertionFailed(0),
            Reason::TimedOut,
            Reason::DeadEnd,
            Reason::ExecutionFault(String::new()),
        ];
        let names: std::collections::HashSet<_> = reasons.iter().map(Reason::name).collect();
        assert_eq!(names.len(), reasons.len());
    }
}
