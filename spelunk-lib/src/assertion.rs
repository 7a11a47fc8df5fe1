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

//! Per-address assertions, read from a rule file with one rule per
//! line:
//!
//! ```text
//! # address  operand  op  value
//! 0x400010   r1       ==  0x2a
//! 0x400018   [0x1000] <   10
//! ```
//!
//! An operand is a register name or a memory byte in brackets. The
//! comparison operators are `==`, `!=`, `<`, `<=`, `>`, and `>=`, all
//! unsigned over 64 bits. Several rules may share an address, in which
//! case all of them must hold.
//!
//! A rule is violated when the solver can find an assignment of the
//! inputs, consistent with the path condition, that makes it false.

use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;

use crate::error::{RuleError, SolverError};
use crate::log;
use crate::smt::smtlib::Exp;
use crate::smt::{eval, Lit, Model, Solver};
use crate::state::{Address, StateImage, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cmp {
    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operand {
    Register(String),
    Memory(Address),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rule {
    pub operand: Operand,
    pub cmp: Cmp,
    pub value: u64,
}

impl fmt::Display for Cmp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            Cmp::Eq => "==",
            Cmp::Neq => "!=",
            Cmp::Lt => "<",
            Cmp::Le => "<=",
            Cmp::Gt => ">",
            Cmp::Ge => ">=",
        };
        write!(f, "{}", op)
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.operand {
            Operand::Register(name) => write!(f, "{} {} {:#x}", name, self.cmp, self.value),
            Operand::Memory(addr) => write!(f, "[{:#x}] {} {:#x}", addr, self.cmp, self.value),
        }
    }
}

lazy_static! {
    static ref RULE_REGEX: Regex = Regex::new(
        r"^(0x[0-9a-fA-F]+|[0-9]+)\s+(\[\s*(?:0x[0-9a-fA-F]+|[0-9]+)\s*\]|[a-zA-Z_][0-9a-zA-Z_]*)\s*(==|!=|<=|>=|<|>)\s*(0x[0-9a-fA-F]+|[0-9]+)$"
    )
    .unwrap();
}

pub fn parse_number(s: &str) -> Option<u64> {
    match s.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

fn parse_cmp(op: &str) -> Cmp {
    match op {
        "==" => Cmp::Eq,
        "!=" => Cmp::Neq,
        "<" => Cmp::Lt,
        "<=" => Cmp::Le,
        ">" => Cmp::Gt,
        _ => Cmp::Ge,
    }
}

impl Rule {
    fn predicate(&self, image: &StateImage) -> Result<Exp, SolverError> {
        let lhs = match &self.operand {
            Operand::Register(name) => image.register(name).to_exp(64),
            Operand::Memory(addr) => match image.memory.read_byte(*addr) {
                Some(Value::Concrete(byte)) => Exp::Bits64(byte, 64),
                Some(Value::Symbolic(byte)) => Exp::ZeroExtend(56, Box::new(byte)),
                None => return Err(SolverError::Failed(format!("assertion reads unmapped address {:#x}", addr))),
            },
        };
        let lhs = Box::new(lhs);
        let rhs = Box::new(Exp::Bits64(self.value, 64));
        Ok(match self.cmp {
            Cmp::Eq => Exp::Eq(lhs, rhs),
            Cmp::Neq => Exp::Neq(lhs, rhs),
            Cmp::Lt => Exp::Bvult(lhs, rhs),
            Cmp::Le => Exp::Bvule(lhs, rhs),
            Cmp::Gt => Exp::Bvugt(lhs, rhs),
            Cmp::Ge => Exp::Bvuge(lhs, rhs),
        })
    }
}

/// A rule that can fail on some path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Violation {
    /// The negated rule. Adding it to the path condition picks out the
    /// inputs that trigger the failure.
    pub fails: Exp,
    /// The rule itself, when some inputs on the path also satisfy it.
    pub holds: Option<Exp>,
}

#[derive(Clone, Debug, Default)]
pub struct AssertionChecker {
    rules: HashMap<Address, Vec<Rule>>,
}

impl AssertionChecker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_rule(&mut self, addr: Address, rule: Rule) {
        self.rules.entry(addr).or_insert_with(Vec::new).push(rule)
    }

    pub fn parse(contents: &str) -> Result<Self, RuleError> {
        let mut checker = AssertionChecker::new();
        for (i, line) in contents.lines().enumerate() {
            let line = match line.find('#') {
                Some(comment) => &line[..comment],
                None => line,
            }
            .trim();
            if line.is_empty() {
                continue;
            }
            let caps = RULE_REGEX
                .captures(line)
                .ok_or_else(|| RuleError { line: i + 1, message: format!("expected '<address> <operand> <op> <value>', found '{}'", line) })?;
            let number = |s: &str| {
                parse_number(s).ok_or_else(|| RuleError { line: i + 1, message: format!("number {} out of range", s) })
            };

            let addr = number(&caps[1])?;
            let operand = if let Some(inner) = caps[2].strip_prefix('[') {
                Operand::Memory(number(inner.trim_end_matches(']').trim())?)
            } else {
                Operand::Register(caps[2].to_lowercase())
            };
            let rule = Rule { operand, cmp: parse_cmp(&caps[3]), value: number(&caps[4])? };
            checker.add_rule(addr, rule)
        }
        Ok(checker)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, RuleError> {
        let contents = fs::read_to_string(path.as_ref()).map_err(|e| RuleError {
            line: 0,
            message: format!("could not read {}: {}", path.as_ref().display(), e),
        })?;
        AssertionChecker::parse(&contents)
    }

    pub fn has_rule(&self, addr: Address) -> bool {
        self.rules.contains_key(&addr)
    }

    pub fn rules_at(&self, addr: Address) -> &[Rule] {
        self.rules.get(&addr).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.values().map(Vec::len).sum()
    }

    /// Returns whether every rule at `addr` holds for all inputs that
    /// satisfy the path condition of `image`. Addresses without rules
    /// always pass without consulting the solver.
    pub fn check<S: Solver>(&self, addr: Address, image: &StateImage, solver: &mut S) -> Result<bool, SolverError> {
        Ok(self.violation(addr, image, solver)?.is_none())
    }

    /// The first rule at `addr` that can fail under the path condition
    /// of `image`, if any.
    pub fn violation<S: Solver>(
        &self,
        addr: Address,
        image: &StateImage,
        solver: &mut S,
    ) -> Result<Option<Violation>, SolverError> {
        let rules = match self.rules.get(&addr) {
            Some(rules) => rules,
            None => return Ok(None),
        };
        for rule in rules {
            let predicate = rule.predicate(image)?;
            let negated = Exp::Not(Box::new(predicate.clone()));
            if negated.is_ground() {
                match eval(&negated, image.path.decls(), &Model::new()) {
                    Ok(Lit::Bool(false)) => continue,
                    Ok(Lit::Bool(true)) => {
                        log!(log::SOLVER, &format!("Assertion {} at {:#x} always fails", rule, addr));
                        return Ok(Some(Violation { fails: negated, holds: None }));
                    }
                    _ => return Err(SolverError::Failed(format!("cannot evaluate assertion {}", rule))),
                }
            }
            if !solver.check_sat_with(&image.path, &negated)? {
                continue;
            }
            let holds = if solver.check_sat_with(&image.path, &predicate)? { Some(predicate) } else { None };
            log!(
                log::SOLVER,
                &format!("Assertion {} at {:#x} can fail{}", rule, addr, if holds.is_some() { " or hold" } else { "" })
            );
            return Ok(Some(Violation { fails: negated, holds }));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smt::search::SearchSolver;
    use crate::smt::smtlib::Ty;
    use crate::state::Memory;

    const RULES: &str = "
        # checks for the test program
        0x400010 r1 == 0x2a
        0x400010 R2 != 0
        4194328 [0x1000]<10   # byte compare
    ";

    #[test]
    fn parse_rules() {
        let checker = AssertionChecker::parse(RULES).unwrap();
        assert_eq!(checker.len(), 3);
        assert!(checker.has_rule(0x400010));
        assert!(!checker.has_rule(0x400014));
        assert_eq!(checker.rules_at(0x400010)[1], Rule { operand: Operand::Register("r2".to_string()), cmp: Cmp::Neq, value: 0 });
        assert_eq!(checker.rules_at(0x400018)[0].operand, Operand::Memory(0x1000));
        assert_eq!(checker.rules_at(0x400018)[0].to_string(), "[0x1000] < 0xa");
    }

    #[test]
    fn parse_errors_have_line_numbers() {
        let err = AssertionChecker::parse("0x10 r1 == 1\n0x14 r1 ~ 2\n").unwrap_err();
        assert_eq!(err.line, 2);
        assert!(AssertionChecker::parse("0x10 r1 == 0x1ffffffffffffffff").is_err());
    }

    #[test]
    fn concrete_assertions() {
        let checker = AssertionChecker::parse("0x40 r1 == 5\n0x44 [0x1000] >= 3").unwrap();
        let mut image = StateImage::new(0x40, Memory::new(0x1000, 16));
        image.set_register("r1", Value::Concrete(5));
        image.memory.write_byte(0x1000, Value::Concrete(2));
        let mut solver = SearchSolver::new();
        assert_eq!(checker.check(0x40, &image, &mut solver), Ok(true));
        assert_eq!(checker.check(0x44, &image, &mut solver), Ok(false));
        assert_eq!(checker.check(0x48, &image, &mut solver), Ok(true));
        assert_eq!(checker.violation(0x44, &image, &mut solver).unwrap().unwrap().holds, None);
    }

    #[test]
    fn symbolic_assertions_consult_the_path() {
        let checker = AssertionChecker::parse("0x40 r1 != 0x61").unwrap();
        let mut image = StateImage::new(0x40, Memory::new(0, 0));
        let v = image.path.declare(Ty::BitVec(8));
        image.set_register("r1", Value::Symbolic(Exp::ZeroExtend(56, Box::new(Exp::Var(v)))));
        let mut solver = SearchSolver::new();
        assert_eq!(checker.check(0x40, &image, &mut solver), Ok(false));

        let violation = checker.violation(0x40, &image, &mut solver).unwrap().unwrap();
        assert!(violation.holds.is_some());
        let model = solver.get_model(&image.path.with(violation.fails)).unwrap().unwrap();
        assert_eq!(model.get(v), Some(0x61));

        let mut forced = image.clone();
        forced.path.assert(Exp::Eq(Box::new(Exp::Var(v)), Box::new(Exp::Bits64(0x61, 8))));
        let violation = checker.violation(0x40, &forced, &mut solver).unwrap().unwrap();
        assert_eq!(violation.holds, None);

        image.path.assert(Exp::Bvult(Box::new(Exp::Var(v)), Box::new(Exp::Bits64(0x61, 8))));
        assert_eq!(checker.check(0x40, &image, &mut solver), Ok(true));
    }

    #[test]
    fn unmapped_memory_is_an_error() {
        let checker = AssertionChecker::parse("0x40 [0x9000] == 0").unwrap();
        let image = StateImage::new(0x40, Memory::new(0x1000, 16));
        assert!(checker.check(0x40, &image, &mut SearchSolver::new()).is_err());
    }
}
