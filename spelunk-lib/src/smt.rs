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

//! The constraint language used for path conditions, together with
//! the interface to the constraint solver. Expressions are a small
//! fragment of SMTLIB quantifier-free bitvector logic, restricted to
//! bitvectors of at most 64 bits so they can be evaluated directly
//! under a model.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::SolverError;

pub mod search;

pub mod smtlib {
    use serde::{Deserialize, Serialize};
    use std::collections::BTreeSet;
    use std::fmt;

    #[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum Ty {
        Bool,
        BitVec(u32),
    }

    impl fmt::Display for Ty {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            use Ty::*;
            match self {
                Bool => write!(f, "Bool"),
                BitVec(sz) => write!(f, "(_ BitVec {})", sz),
            }
        }
    }

    #[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum Exp {
        Var(u32),
        Bits64(u64, u32),
        Bool(bool),
        Eq(Box<Exp>, Box<Exp>),
        Neq(Box<Exp>, Box<Exp>),
        And(Box<Exp>, Box<Exp>),
        Or(Box<Exp>, Box<Exp>),
        Not(Box<Exp>),
        Bvnot(Box<Exp>),
        Bvand(Box<Exp>, Box<Exp>),
        Bvor(Box<Exp>, Box<Exp>),
        Bvxor(Box<Exp>, Box<Exp>),
        Bvneg(Box<Exp>),
        Bvadd(Box<Exp>, Box<Exp>),
        Bvsub(Box<Exp>, Box<Exp>),
        Bvmul(Box<Exp>, Box<Exp>),
        Bvudiv(Box<Exp>, Box<Exp>),
        Bvurem(Box<Exp>, Box<Exp>),
        Bvult(Box<Exp>, Box<Exp>),
        Bvule(Box<Exp>, Box<Exp>),
        Bvuge(Box<Exp>, Box<Exp>),
        Bvugt(Box<Exp>, Box<Exp>),
        Bvshl(Box<Exp>, Box<Exp>),
        Bvlshr(Box<Exp>, Box<Exp>),
        Extract(u32, u32, Box<Exp>),
        ZeroExtend(u32, Box<Exp>),
        Ite(Box<Exp>, Box<Exp>, Box<Exp>),
    }

    impl Exp {
        /// Apply the supplied function to every sub-expression, in a
        /// top-down order.
        pub fn visit<F>(&self, f: &mut F)
        where
            F: FnMut(&Exp),
        {
            use Exp::*;
            f(self);
            match self {
                Var(_) | Bits64(_, _) | Bool(_) => (),
                Not(exp) | Bvnot(exp) | Bvneg(exp) | Extract(_, _, exp) | ZeroExtend(_, exp) => exp.visit(f),
                Eq(lhs, rhs)
                | Neq(lhs, rhs)
                | And(lhs, rhs)
                | Or(lhs, rhs)
                | Bvand(lhs, rhs)
                | Bvor(lhs, rhs)
                | Bvxor(lhs, rhs)
                | Bvadd(lhs, rhs)
                | Bvsub(lhs, rhs)
                | Bvmul(lhs, rhs)
                | Bvudiv(lhs, rhs)
                | Bvurem(lhs, rhs)
                | Bvult(lhs, rhs)
                | Bvule(lhs, rhs)
                | Bvuge(lhs, rhs)
                | Bvugt(lhs, rhs)
                | Bvshl(lhs, rhs)
                | Bvlshr(lhs, rhs) => {
                    lhs.visit(f);
                    rhs.visit(f)
                }
                Ite(cond, then_exp, else_exp) => {
                    cond.visit(f);
                    then_exp.visit(f);
                    else_exp.visit(f)
                }
            }
        }

        pub fn vars(&self) -> BTreeSet<u32> {
            let mut vars = BTreeSet::new();
            self.visit(&mut |exp| {
                if let Exp::Var(v) = exp {
                    vars.insert(*v);
                }
            });
            vars
        }

        pub fn is_ground(&self) -> bool {
            self.vars().is_empty()
        }

        /// Collect the bitvector literals mentioned by an expression.
        pub fn constants(&self) -> BTreeSet<u64> {
            let mut constants = BTreeSet::new();
            self.visit(&mut |exp| {
                if let Exp::Bits64(bits, _) = exp {
                    constants.insert(*bits);
                }
            });
            constants
        }
    }

    fn write_bits64(f: &mut fmt::Formatter<'_>, bits: u64, len: u32) -> fmt::Result {
        if len % 4 == 0 {
            write!(f, "#x{:0width$x}", bits, width = (len / 4) as usize)
        } else {
            write!(f, "#b{:0width$b}", bits, width = len as usize)
        }
    }

    impl fmt::Display for Exp {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            use Exp::*;
            match self {
                Var(v) => write!(f, "v{}", v),
                Bits64(bits, len) => write_bits64(f, *bits, *len),
                Bool(b) => write!(f, "{}", b),
                Eq(lhs, rhs) => write!(f, "(= {} {})", lhs, rhs),
                Neq(lhs, rhs) => write!(f, "(not (= {} {}))", lhs, rhs),
                And(lhs, rhs) => write!(f, "(and {} {})", lhs, rhs),
                Or(lhs, rhs) => write!(f, "(or {} {})", lhs, rhs),
                Not(exp) => write!(f, "(not {})", exp),
                Bvnot(exp) => write!(f, "(bvnot {})", exp),
                Bvand(lhs, rhs) => write!(f, "(bvand {} {})", lhs, rhs),
                Bvor(lhs, rhs) => write!(f, "(bvor {} {})", lhs, rhs),
                Bvxor(lhs, rhs) => write!(f, "(bvxor {} {})", lhs, rhs),
                Bvneg(exp) => write!(f, "(bvneg {})", exp),
                Bvadd(lhs, rhs) => write!(f, "(bvadd {} {})", lhs, rhs),
                Bvsub(lhs, rhs) => write!(f, "(bvsub {} {})", lhs, rhs),
                Bvmul(lhs, rhs) => write!(f, "(bvmul {} {})", lhs, rhs),
                Bvudiv(lhs, rhs) => write!(f, "(bvudiv {} {})", lhs, rhs),
                Bvurem(lhs, rhs) => write!(f, "(bvurem {} {})", lhs, rhs),
                Bvult(lhs, rhs) => write!(f, "(bvult {} {})", lhs, rhs),
                Bvule(lhs, rhs) => write!(f, "(bvule {} {})", lhs, rhs),
                Bvuge(lhs, rhs) => write!(f, "(bvuge {} {})", lhs, rhs),
                Bvugt(lhs, rhs) => write!(f, "(bvugt {} {})", lhs, rhs),
                Bvshl(lhs, rhs) => write!(f, "(bvshl {} {})", lhs, rhs),
                Bvlshr(lhs, rhs) => write!(f, "(bvlshr {} {})", lhs, rhs),
                Extract(i, j, exp) => write!(f, "((_ extract {} {}) {})", i, j, exp),
                ZeroExtend(n, exp) => write!(f, "((_ zero_extend {}) {})", n, exp),
                Ite(cond, then_exp, else_exp) => write!(f, "(ite {} {} {})", cond, then_exp, else_exp),
            }
        }
    }

    #[derive(Clone, Debug)]
    pub enum Def {
        DeclareConst(u32, Ty),
        Assert(Exp),
    }

    impl fmt::Display for Def {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            use Def::*;
            match self {
                DeclareConst(v, ty) => write!(f, "(declare-const v{} {})", v, ty),
                Assert(exp) => write!(f, "(assert {})", exp),
            }
        }
    }
}

use smtlib::*;

/// A concrete assignment of values to variables.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Model {
    values: BTreeMap<u32, u64>,
}

impl Model {
    pub fn new() -> Self {
        Model { values: BTreeMap::new() }
    }

    pub fn get(&self, v: u32) -> Option<u64> {
        self.values.get(&v).copied()
    }

    pub fn insert(&mut self, v: u32, value: u64) {
        self.values.insert(v, value);
    }

    pub fn remove(&mut self, v: u32) {
        self.values.remove(&v);
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, u64)> + '_ {
        self.values.iter().map(|(v, x)| (*v, *x))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lit {
    Bool(bool),
    Bits(u64, u32),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EvalError {
    /// The expression depends on a variable the model does not assign.
    Unassigned(u32),
    Type(&'static str),
}

pub fn mask(width: u32) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

fn eval_bits(exp: &Exp, decls: &BTreeMap<u32, Ty>, model: &Model) -> Result<(u64, u32), EvalError> {
    match eval(exp, decls, model)? {
        Lit::Bits(bits, width) => Ok((bits, width)),
        Lit::Bool(_) => Err(EvalError::Type("expected bitvector")),
    }
}

fn eval_bool(exp: &Exp, decls: &BTreeMap<u32, Ty>, model: &Model) -> Result<bool, EvalError> {
    match eval(exp, decls, model)? {
        Lit::Bool(b) => Ok(b),
        Lit::Bits(_, _) => Err(EvalError::Type("expected boolean")),
    }
}

fn eval_binop<F>(lhs: &Exp, rhs: &Exp, decls: &BTreeMap<u32, Ty>, model: &Model, op: F) -> Result<Lit, EvalError>
where
    F: FnOnce(u64, u64, u32) -> u64,
{
    let (x, w1) = eval_bits(lhs, decls, model)?;
    let (y, w2) = eval_bits(rhs, decls, model)?;
    if w1 != w2 {
        return Err(EvalError::Type("bitvector width mismatch"));
    }
    Ok(Lit::Bits(op(x, y, w1) & mask(w1), w1))
}

fn eval_cmp<F>(lhs: &Exp, rhs: &Exp, decls: &BTreeMap<u32, Ty>, model: &Model, op: F) -> Result<Lit, EvalError>
where
    F: FnOnce(u64, u64) -> bool,
{
    let (x, w1) = eval_bits(lhs, decls, model)?;
    let (y, w2) = eval_bits(rhs, decls, model)?;
    if w1 != w2 {
        return Err(EvalError::Type("bitvector width mismatch"));
    }
    Ok(Lit::Bool(op(x, y)))
}

/// Evaluate an expression under a (possibly partial) model. Boolean
/// connectives short-circuit, so a conjunction with one false
/// conjunct is false even if the other depends on unassigned
/// variables.
pub fn eval(exp: &Exp, decls: &BTreeMap<u32, Ty>, model: &Model) -> Result<Lit, EvalError> {
    use Exp::*;
    match exp {
        Var(v) => {
            let value = model.get(*v).ok_or(EvalError::Unassigned(*v))?;
            match decls.get(v) {
                Some(Ty::Bool) => Ok(Lit::Bool(value != 0)),
                Some(Ty::BitVec(width)) if *width <= 64 => Ok(Lit::Bits(value & mask(*width), *width)),
                Some(Ty::BitVec(_)) => Err(EvalError::Type("bitvector wider than 64 bits")),
                None => Err(EvalError::Type("undeclared variable")),
            }
        }
        Bits64(bits, width) => Ok(Lit::Bits(bits & mask(*width), *width)),
        Bool(b) => Ok(Lit::Bool(*b)),
        Eq(lhs, rhs) | Neq(lhs, rhs) => {
            let equal = match (eval(lhs, decls, model)?, eval(rhs, decls, model)?) {
                (Lit::Bool(x), Lit::Bool(y)) => x == y,
                (Lit::Bits(x, w1), Lit::Bits(y, w2)) if w1 == w2 => x == y,
                _ => return Err(EvalError::Type("ill-typed equality")),
            };
            Ok(Lit::Bool(if let Eq(_, _) = exp { equal } else { !equal }))
        }
        And(lhs, rhs) => match (eval_bool(lhs, decls, model), eval_bool(rhs, decls, model)) {
            (Ok(false), _) | (_, Ok(false)) => Ok(Lit::Bool(false)),
            (Ok(true), Ok(true)) => Ok(Lit::Bool(true)),
            (Err(e), _) | (_, Err(e)) => Err(e),
        },
        Or(lhs, rhs) => match (eval_bool(lhs, decls, model), eval_bool(rhs, decls, model)) {
            (Ok(true), _) | (_, Ok(true)) => Ok(Lit::Bool(true)),
            (Ok(false), Ok(false)) => Ok(Lit::Bool(false)),
            (Err(e), _) | (_, Err(e)) => Err(e),
        },
        Not(exp) => Ok(Lit::Bool(!eval_bool(exp, decls, model)?)),
        Bvnot(exp) => {
            let (x, w) = eval_bits(exp, decls, model)?;
            Ok(Lit::Bits(!x & mask(w), w))
        }
        Bvneg(exp) => {
            let (x, w) = eval_bits(exp, decls, model)?;
            Ok(Lit::Bits(x.wrapping_neg() & mask(w), w))
        }
        Bvand(lhs, rhs) => eval_binop(lhs, rhs, decls, model, |x, y, _| x & y),
        Bvor(lhs, rhs) => eval_binop(lhs, rhs, decls, model, |x, y, _| x | y),
        Bvxor(lhs, rhs) => eval_binop(lhs, rhs, decls, model, |x, y, _| x ^ y),
        Bvadd(lhs, rhs) => eval_binop(lhs, rhs, decls, model, |x, y, _| x.wrapping_add(y)),
        Bvsub(lhs, rhs) => eval_binop(lhs, rhs, decls, model, |x, y, _| x.wrapping_sub(y)),
        Bvmul(lhs, rhs) => eval_binop(lhs, rhs, decls, model, |x, y, _| x.wrapping_mul(y)),
        // SMTLIB fixes division by zero to all ones, and remainder by
        // zero to the dividend.
        Bvudiv(lhs, rhs) => eval_binop(lhs, rhs, decls, model, |x, y, w| if y == 0 { mask(w) } else { x / y }),
        Bvurem(lhs, rhs) => eval_binop(lhs, rhs, decls, model, |x, y, _| if y == 0 { x } else { x % y }),
        Bvshl(lhs, rhs) => eval_binop(lhs, rhs, decls, model, |x, y, w| if y >= w as u64 { 0 } else { x << y }),
        Bvlshr(lhs, rhs) => eval_binop(lhs, rhs, decls, model, |x, y, w| if y >= w as u64 { 0 } else { x >> y }),
        Bvult(lhs, rhs) => eval_cmp(lhs, rhs, decls, model, |x, y| x < y),
        Bvule(lhs, rhs) => eval_cmp(lhs, rhs, decls, model, |x, y| x <= y),
        Bvuge(lhs, rhs) => eval_cmp(lhs, rhs, decls, model, |x, y| x >= y),
        Bvugt(lhs, rhs) => eval_cmp(lhs, rhs, decls, model, |x, y| x > y),
        Extract(i, j, exp) => {
            let (x, w) = eval_bits(exp, decls, model)?;
            if j > i || *i >= w {
                return Err(EvalError::Type("extract out of range"));
            }
            let width = i - j + 1;
            Ok(Lit::Bits((x >> j) & mask(width), width))
        }
        ZeroExtend(n, exp) => {
            let (x, w) = eval_bits(exp, decls, model)?;
            if w + n > 64 {
                return Err(EvalError::Type("bitvector wider than 64 bits"));
            }
            Ok(Lit::Bits(x, w + n))
        }
        Ite(cond, then_exp, else_exp) => {
            if eval_bool(cond, decls, model)? {
                eval(then_exp, decls, model)
            } else {
                eval(else_exp, decls, model)
            }
        }
    }
}

/// The path condition of a state: the variables it has declared and
/// the branch predicates accumulated from the root. Assertions are
/// only ever appended.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathCondition {
    decls: BTreeMap<u32, Ty>,
    asserts: Vec<Exp>,
}

impl PathCondition {
    pub fn new() -> Self {
        PathCondition { decls: BTreeMap::new(), asserts: Vec::new() }
    }

    /// Declare a fresh variable of the given type.
    pub fn declare(&mut self, ty: Ty) -> u32 {
        let v = self.decls.keys().next_back().map(|v| v + 1).unwrap_or(0);
        self.decls.insert(v, ty);
        v
    }

    pub fn assert(&mut self, exp: Exp) {
        self.asserts.push(exp)
    }

    /// A copy of this path condition with one more assertion.
    pub fn with(&self, exp: Exp) -> Self {
        let mut pc = self.clone();
        pc.assert(exp);
        pc
    }

    pub fn decls(&self) -> &BTreeMap<u32, Ty> {
        &self.decls
    }

    pub fn asserts(&self) -> &[Exp] {
        &self.asserts
    }

    pub fn len(&self) -> usize {
        self.asserts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.asserts.is_empty()
    }

    /// True if `self` is `parent` with zero or more assertions appended.
    pub fn extends(&self, parent: &PathCondition) -> bool {
        self.asserts.len() >= parent.asserts.len()
            && self.asserts[..parent.asserts.len()] == parent.asserts[..]
            && parent.decls.iter().all(|(v, ty)| self.decls.get(v) == Some(ty))
    }

    pub fn to_smtlib(&self) -> Vec<Def> {
        let mut defs: Vec<Def> = self.decls.iter().map(|(v, ty)| Def::DeclareConst(*v, ty.clone())).collect();
        defs.extend(self.asserts.iter().map(|exp| Def::Assert(exp.clone())));
        defs
    }
}

impl fmt::Display for PathCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for def in self.to_smtlib() {
            writeln!(f, "{}", def)?
        }
        Ok(())
    }
}

/// The interface to a constraint solver. Each worker owns its own
/// solver instance, so methods take `&mut self` and implementations
/// may keep caches between calls.
pub trait Solver {
    fn is_satisfiable(&mut self, pc: &PathCondition) -> Result<bool, SolverError>;

    /// Returns a model of the path condition, or `None` if it is
    /// unsatisfiable.
    fn get_model(&mut self, pc: &PathCondition) -> Result<Option<Model>, SolverError>;

    fn check_sat_with(&mut self, pc: &PathCondition, exp: &Exp) -> Result<bool, SolverError> {
        self.is_satisfiable(&pc.with(exp.clone()))
    }
}
