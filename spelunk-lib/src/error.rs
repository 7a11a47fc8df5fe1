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

//! Error types shared by the exploration core. Only conditions that
//! a caller can act upon are errors here; program-level outcomes such
//! as crashes and failed assertions are terminal reasons (see
//! [`crate::report::Reason`]).

use std::error::Error;
use std::fmt;
use std::io;

use crate::state::StateId;

#[derive(Debug)]
pub enum WorkspaceError {
    /// I/O failure against the workspace directory. Fatal to the
    /// current step of the worker that hit it, but not to the pool.
    Storage(io::Error),
    /// The id is unknown, or its record has been removed.
    NotFound(StateId),
    /// A record exists but could not be decoded, or its checksum does
    /// not match.
    Corrupt(String),
}

impl fmt::Display for WorkspaceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use WorkspaceError::*;
        match self {
            Storage(e) => write!(f, "workspace storage error: {}", e),
            NotFound(id) => write!(f, "state {} not found in workspace", id),
            Corrupt(msg) => write!(f, "corrupt workspace record: {}", msg),
        }
    }
}

impl Error for WorkspaceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            WorkspaceError::Storage(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for WorkspaceError {
    fn from(e: io::Error) -> Self {
        WorkspaceError::Storage(e)
    }
}

impl From<bincode::Error> for WorkspaceError {
    fn from(e: bincode::Error) -> Self {
        WorkspaceError::Corrupt(e.to_string())
    }
}

impl From<serde_json::Error> for WorkspaceError {
    fn from(e: serde_json::Error) -> Self {
        WorkspaceError::Corrupt(e.to_string())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SolverError {
    /// The per-call deadline expired before an answer was found.
    Timeout,
    Failed(String),
}

impl fmt::Display for SolverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SolverError::Timeout => write!(f, "solver timeout"),
            SolverError::Failed(msg) => write!(f, "solver error: {}", msg),
        }
    }
}

impl Error for SolverError {}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EmulatorError {
    /// The instruction is well formed, but the emulator cannot model
    /// it with the current state (for example a symbolic address).
    Unsupported(u64, String),
}

impl fmt::Display for EmulatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmulatorError::Unsupported(pc, msg) => write!(f, "unsupported operation at {:#x}: {}", pc, msg),
        }
    }
}

impl Error for EmulatorError {}

#[derive(Debug)]
pub enum LoadError {
    Io(io::Error),
    Parse { line: usize, message: String },
    Empty,
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::Io(e) => write!(f, "could not read program: {}", e),
            LoadError::Parse { line, message } => write!(f, "line {}: {}", line, message),
            LoadError::Empty => write!(f, "program contains no instructions"),
        }
    }
}

impl Error for LoadError {}

impl From<io::Error> for LoadError {
    fn from(e: io::Error) -> Self {
        LoadError::Io(e)
    }
}

#[derive(Debug)]
pub struct RuleError {
    pub line: usize,
    pub message: String,
}

impl fmt::Display for RuleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "assertion rule on line {}: {}", self.line, self.message)
    }
}

impl Error for RuleError {}

/// Returned by a policy asked to choose from an empty ready set. This
/// is the normal "nothing to do" signal rather than a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PolicyError {
    Empty,
}

impl fmt::Display for PolicyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no ready states to select from")
    }
}

impl Error for PolicyError {}
