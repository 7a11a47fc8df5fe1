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

//! The interfaces the exploration core consumes: a loader that builds
//! the root state from a program, and an emulator that advances a
//! state by one instruction.

use std::path::Path;

use crate::error::{EmulatorError, LoadError};
use crate::report::FaultKind;
use crate::smt::smtlib::{Exp, Ty};
use crate::state::{Address, InputByte, StateImage};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Successor {
    /// A boolean predicate over the path condition's variables.
    pub condition: Exp,
    pub target: Address,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StepResult {
    /// The instruction was applied in place, and `pc` now points at
    /// the next one.
    Continue,
    /// Control flow depends on symbolic data. The conditions of the
    /// successors are mutually exclusive.
    Branch(Vec<Successor>),
    Fault(FaultKind),
    Exit(u64),
}

/// Emulators are shared by all workers, so stepping takes `&self` and
/// only mutates the state being run.
pub trait Emulator: Sync {
    fn step(&self, state: &mut StateImage) -> Result<StepResult, EmulatorError>;
}

pub trait Loader {
    type Emulator: Emulator;

    fn load(&self, path: &Path, input: &[InputSpec]) -> Result<(Self::Emulator, StateImage), LoadError>;
}

/// A command line argument given to the program under test.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InputSpec {
    bytes: Vec<Option<u8>>,
}

impl InputSpec {
    /// Parse an argument where each `+` stands for a symbolic byte.
    pub fn parse(arg: &str) -> Self {
        InputSpec { bytes: arg.bytes().map(|b| if b == b'+' { None } else { Some(b) }).collect() }
    }

    pub fn symbolic_bytes(&self) -> usize {
        self.bytes.iter().filter(|b| b.is_none()).count()
    }
}

/// Lay the arguments out as the program's input, separating them by
/// NUL bytes, and declare an 8-bit variable for every symbolic byte.
pub fn build_input(state: &mut StateImage, args: &[InputSpec]) {
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            state.input.push(InputByte::Concrete(0))
        }
        for byte in &arg.bytes {
            let byte = match byte {
                Some(b) => InputByte::Concrete(*b),
                None => InputByte::Symbolic(state.path.declare(Ty::BitVec(8))),
            };
            state.input.push(byte)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Memory;

    #[test]
    fn symbolic_arguments() {
        let args = vec![InputSpec::parse("a+"), InputSpec::parse("++")];
        assert_eq!(args[1].symbolic_bytes(), 2);
        let mut state = StateImage::new(0, Memory::new(0, 0));
        build_input(&mut state, &args);
        assert_eq!(state.input.len(), 5);
        assert_eq!(state.input[0], InputByte::Concrete(b'a'));
        assert_eq!(state.input[2], InputByte::Concrete(0));
        assert_eq!(state.path.decls().len(), 3);
        assert!(state.path.is_empty());
    }
}
