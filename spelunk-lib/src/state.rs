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

//! Snapshots of a single execution path. A [`StateImage`] is what the
//! workspace persists and what an executor resumes. Parent links are
//! plain ids, never pointers, so an image can be stored and loaded in
//! isolation.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use crate::report::Reason;
use crate::smt::smtlib::Exp;
use crate::smt::{eval, mask, Lit, Model, PathCondition};

pub type Address = u64;

/// How many of the most recently executed addresses a state carries
/// with it for the exploration policies.
pub const TRAIL_LEN: usize = 64;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateId {
    id: u64,
}

impl StateId {
    pub fn from_u64(id: u64) -> Self {
        StateId { id }
    }

    pub fn as_u64(self) -> u64 {
        self.id
    }

    /// Parse the file name used for a state in the workspace.
    pub fn parse(name: &str) -> Option<Self> {
        let digits = name.strip_suffix(".state").unwrap_or(name);
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok().map(StateId::from_u64)
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    Concrete(u64),
    Symbolic(Exp),
}

impl Value {
    pub fn to_exp(&self, width: u32) -> Exp {
        match self {
            Value::Concrete(bits) => Exp::Bits64(bits & mask(width), width),
            Value::Symbolic(exp) => exp.clone(),
        }
    }

    pub fn as_concrete(&self) -> Option<u64> {
        match self {
            Value::Concrete(bits) => Some(*bits),
            Value::Symbolic(_) => None,
        }
    }

    pub fn is_symbolic(&self) -> bool {
        matches!(self, Value::Symbolic(_))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ready,
    Running,
    Forked,
    Terminated(Reason),
}

/// Sparse byte-addressed memory with a single mapped window. Bytes
/// that have never been written read as zero.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Memory {
    start: Address,
    end: Address,
    bytes: BTreeMap<Address, Value>,
}

impl Memory {
    pub fn new(start: Address, size: u64) -> Self {
        Memory { start, end: start.saturating_add(size), bytes: BTreeMap::new() }
    }

    pub fn contains(&self, addr: Address) -> bool {
        self.start <= addr && addr < self.end
    }

    pub fn read_byte(&self, addr: Address) -> Option<Value> {
        if !self.contains(addr) {
            return None;
        }
        Some(self.bytes.get(&addr).cloned().unwrap_or(Value::Concrete(0)))
    }

    pub fn write_byte(&mut self, addr: Address, value: Value) -> bool {
        if !self.contains(addr) {
            return false;
        }
        let value = match value {
            Value::Concrete(bits) => Value::Concrete(bits & 0xff),
            symbolic => symbolic,
        };
        self.bytes.insert(addr, value);
        true
    }
}

/// One byte of program input.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputByte {
    Concrete(u8),
    /// A symbolic byte, represented by an 8-bit variable of the path
    /// condition.
    Symbolic(u32),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateImage {
    /// Assigned by the workspace when the image is stored.
    pub id: Option<StateId>,
    pub parent: Option<StateId>,
    pub pc: Address,
    pub registers: BTreeMap<String, Value>,
    pub memory: Memory,
    pub path: PathCondition,
    pub input: Vec<InputByte>,
    pub status: Status,
    pub trail: VecDeque<Address>,
    /// Number of forks between the root and this state.
    pub depth: u32,
    /// Instructions executed from the root to this state.
    pub steps: u64,
}

/// What the policies need to know about a ready state, small enough
/// to keep in the ready marker so scheduling never loads full images.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSummary {
    pub pc: Address,
    pub depth: u32,
    pub trail: Vec<Address>,
}

impl StateImage {
    pub fn new(pc: Address, memory: Memory) -> Self {
        StateImage {
            id: None,
            parent: None,
            pc,
            registers: BTreeMap::new(),
            memory,
            path: PathCondition::new(),
            input: Vec::new(),
            status: Status::Ready,
            trail: VecDeque::new(),
            depth: 0,
            steps: 0,
        }
    }

    /// Registers that have never been written read as zero.
    pub fn register(&self, name: &str) -> Value {
        self.registers.get(name).cloned().unwrap_or(Value::Concrete(0))
    }

    pub fn set_register(&mut self, name: &str, value: Value) {
        self.registers.insert(name.to_string(), value);
    }

    pub fn note_visit(&mut self, pc: Address) {
        self.steps += 1;
        self.trail.push_back(pc);
        if self.trail.len() > TRAIL_LEN {
            self.trail.pop_front();
        }
    }

    /// Create a successor that takes a branch: it inherits everything
    /// from this state, with the branch predicate appended to its
    /// path condition.
    pub fn fork(&self, condition: Exp, target: Address) -> StateImage {
        let mut successor = self.clone();
        successor.id = None;
        successor.parent = self.id;
        successor.path.assert(condition);
        successor.pc = target;
        successor.status = Status::Ready;
        successor.depth = self.depth + 1;
        successor
    }

    pub fn summary(&self) -> StateSummary {
        StateSummary { pc: self.pc, depth: self.depth, trail: self.trail.iter().copied().collect() }
    }

    /// The concrete input bytes a model picks for this state.
    pub fn concretize_input(&self, model: &Model) -> Vec<u8> {
        self.input
            .iter()
            .map(|byte| match byte {
                InputByte::Concrete(b) => *b,
                InputByte::Symbolic(v) => match eval(&Exp::Var(*v), self.path.decls(), model) {
                    Ok(Lit::Bits(bits, _)) => bits as u8,
                    _ => 0,
                },
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smt::smtlib::Ty;

    #[test]
    fn state_id_parsing() {
        assert_eq!(StateId::parse("17.state"), Some(StateId::from_u64(17)));
        assert_eq!(StateId::parse("42"), Some(StateId::from_u64(42)));
        assert_eq!(StateId::parse(".tmp-1-2"), None);
        assert_eq!(StateId::parse(""), None);
    }

    #[test]
    fn memory_window() {
        let mut memory = Memory::new(0x1000, 0x10);
        assert_eq!(memory.read_byte(0x1000), Some(Value::Concrete(0)));
        assert!(memory.write_byte(0x100f, Value::Concrete(0x1ff)));
        assert_eq!(memory.read_byte(0x100f), Some(Value::Concrete(0xff)));
        assert!(!memory.write_byte(0x1010, Value::Concrete(1)));
        assert_eq!(memory.read_byte(0xfff), None);
    }

    #[test]
    fn fork_appends_and_links() {
        let mut parent = StateImage::new(0x400000, Memory::new(0, 0));
        parent.id = Some(StateId::from_u64(3));
        let v = parent.path.declare(Ty::BitVec(8));
        parent.path.assert(Exp::Bvult(Box::new(Exp::Var(v)), Box::new(Exp::Bits64(9, 8))));
        parent.status = Status::Running;

        let child = parent.fork(Exp::Eq(Box::new(Exp::Var(v)), Box::new(Exp::Bits64(1, 8))), 0x400010);
        assert_eq!(child.parent, Some(StateId::from_u64(3)));
        assert_eq!(child.id, None);
        assert_eq!(child.pc, 0x400010);
        assert_eq!(child.status, Status::Ready);
        assert_eq!(child.depth, 1);
        assert_eq!(child.path.len(), parent.path.len() + 1);
        assert!(child.path.extends(&parent.path));
    }

    #[test]
    fn trail_is_bounded() {
        let mut state = StateImage::new(0, Memory::new(0, 0));
        for pc in 0..(TRAIL_LEN as u64 + 10) {
            state.note_visit(pc)
        }
        assert_eq!(state.trail.len(), TRAIL_LEN);
        assert_eq!(state.trail.front(), Some(&10));
        assert_eq!(state.steps, TRAIL_LEN as u64 + 10);
    }

    #[test]
    fn concretize_input_from_model() {
        let mut state = StateImage::new(0, Memory::new(0, 0));
        let v = state.path.declare(Ty::BitVec(8));
        state.input = vec![InputByte::Concrete(b'a'), InputByte::Symbolic(v)];
        let mut model = Model::new();
        model.insert(v, b'z' as u64);
        assert_eq!(state.concretize_input(&model), b"az".to_vec());
        assert_eq!(state.concretize_input(&Model::new()), b"a\0".to_vec());
    }
}
