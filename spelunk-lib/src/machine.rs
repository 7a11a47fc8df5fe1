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

//! A small register machine, read from a text listing. It is the
//! program format the command line tool and the tests run, and serves
//! as the reference [`Emulator`] implementation.
//!
//! ```text
//! .base 0x400000          ; address of the first instruction
//! .memory 0x10000 4096    ; the single mapped memory window
//! _start:
//!     input r1, 0         ; r1 = first input byte
//!     cmp r1, 0x61
//!     jz found
//!     exit 0
//! found:
//!     abort
//! ```
//!
//! Registers are `r0` to `r15`, 64 bits wide, plus the flag `zf` which
//! `cmp` sets to 1 if its operands are equal and 0 otherwise. Every
//! instruction occupies 4 bytes. Execution starts at `_start`, or
//! `main`, or failing both the first instruction.

use regex::Regex;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::emulator::{build_input, Emulator, InputSpec, Loader, StepResult, Successor};
use crate::error::{EmulatorError, LoadError};
use crate::report::FaultKind;
use crate::smt::smtlib::Exp;
use crate::state::{Address, InputByte, Memory, StateImage, Value};

pub const DEFAULT_BASE: Address = 0x400000;
pub const DEFAULT_MEMORY: (Address, u64) = (0x10000, 0x10000);
pub const INSTR_SIZE: u64 = 4;

const FLAG: &str = "zf";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Src {
    Reg(String),
    Imm(u64),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BranchOp {
    Eq,
    Ne,
    Lt,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Instr {
    Mov(String, Src),
    Alu(AluOp, String, Src),
    Cmp(String, Src),
    Input(String, u64),
    Load(String, String),
    Store(String, String),
    Jmp(Address),
    Jz(Address),
    Jnz(Address),
    Branch(BranchOp, String, Src, Address),
    Exit(Src),
    Abort,
    Nop,
}

#[derive(Clone, Debug)]
pub struct Program {
    base: Address,
    entry: Address,
    memory: (Address, u64),
    instrs: Vec<Instr>,
    labels: HashMap<String, Address>,
}

lazy_static! {
    static ref LABEL_REGEX: Regex = Regex::new(r"^([a-zA-Z_.][0-9a-zA-Z_.]*):\s*(.*)$").unwrap();
    static ref REGISTER_REGEX: Regex = Regex::new(r"^(r([0-9]|1[0-5])|zf)$").unwrap();
    static ref MEMORY_REGEX: Regex = Regex::new(r"^\[\s*([0-9a-zA-Z_]+)\s*\]$").unwrap();
}

fn parse_number(s: &str) -> Option<u64> {
    match s.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

struct LineParser {
    line: usize,
}

/// An instruction whose jump targets are still label names.
enum Unresolved {
    Done(Instr),
    Jump(String, Box<dyn Fn(Address) -> Instr>),
}

impl LineParser {
    fn error<T>(&self, message: String) -> Result<T, LoadError> {
        Err(LoadError::Parse { line: self.line, message })
    }

    fn register(&self, s: &str) -> Result<String, LoadError> {
        let s = s.to_lowercase();
        if REGISTER_REGEX.is_match(&s) {
            Ok(s)
        } else {
            self.error(format!("'{}' is not a register", s))
        }
    }

    fn src(&self, s: &str) -> Result<Src, LoadError> {
        match parse_number(s) {
            Some(n) => Ok(Src::Imm(n)),
            None => Ok(Src::Reg(self.register(s)?)),
        }
    }

    fn memory(&self, s: &str) -> Result<String, LoadError> {
        match MEMORY_REGEX.captures(s) {
            Some(caps) => self.register(&caps[1]),
            None => self.error(format!("expected a memory operand like [r1], found '{}'", s)),
        }
    }

    fn instr(&self, mnemonic: &str, ops: &[&str]) -> Result<Unresolved, LoadError> {
        use Unresolved::*;

        let arity = match mnemonic {
            "abort" | "nop" => 0,
            "jmp" | "jz" | "jnz" | "exit" => 1,
            "beq" | "bne" | "blt" => 3,
            _ => 2,
        };
        if ops.len() != arity {
            return self.error(format!("{} takes {} operands, found {}", mnemonic, arity, ops.len()));
        }

        let arith = |op: AluOp| -> Result<Unresolved, LoadError> {
            Ok(Done(Instr::Alu(op, self.register(ops[0])?, self.src(ops[1])?)))
        };
        let branch = |op: BranchOp| -> Result<Unresolved, LoadError> {
            let (reg, src) = (self.register(ops[0])?, self.src(ops[1])?);
            Ok(Jump(ops[2].to_string(), Box::new(move |target| Instr::Branch(op, reg.clone(), src.clone(), target))))
        };

        match mnemonic {
            "mov" => Ok(Done(Instr::Mov(self.register(ops[0])?, self.src(ops[1])?))),
            "add" => arith(AluOp::Add),
            "sub" => arith(AluOp::Sub),
            "mul" => arith(AluOp::Mul),
            "and" => arith(AluOp::And),
            "or" => arith(AluOp::Or),
            "xor" => arith(AluOp::Xor),
            "cmp" => Ok(Done(Instr::Cmp(self.register(ops[0])?, self.src(ops[1])?))),
            "input" => match parse_number(ops[1]) {
                Some(index) => Ok(Done(Instr::Input(self.register(ops[0])?, index))),
                None => self.error(format!("input index '{}' is not a number", ops[1])),
            },
            "load" => Ok(Done(Instr::Load(self.register(ops[0])?, self.memory(ops[1])?))),
            "store" => Ok(Done(Instr::Store(self.memory(ops[0])?, self.register(ops[1])?))),
            "jmp" => Ok(Jump(ops[0].to_string(), Box::new(Instr::Jmp))),
            "jz" => Ok(Jump(ops[0].to_string(), Box::new(Instr::Jz))),
            "jnz" => Ok(Jump(ops[0].to_string(), Box::new(Instr::Jnz))),
            "beq" => branch(BranchOp::Eq),
            "bne" => branch(BranchOp::Ne),
            "blt" => branch(BranchOp::Lt),
            "exit" => Ok(Done(Instr::Exit(self.src(ops[0])?))),
            "abort" => Ok(Done(Instr::Abort)),
            "nop" => Ok(Done(Instr::Nop)),
            _ => self.error(format!("unknown instruction '{}'", mnemonic)),
        }
    }
}

fn truthy(value: &Value) -> Exp {
    match value {
        Value::Symbolic(Exp::Ite(cond, then_exp, else_exp))
            if **then_exp == Exp::Bits64(1, 64) && **else_exp == Exp::Bits64(0, 64) =>
        {
            (**cond).clone()
        }
        _ => Exp::Neq(Box::new(value.to_exp(64)), Box::new(Exp::Bits64(0, 64))),
    }
}

fn alu(op: AluOp, x: &Value, y: &Value) -> Value {
    if let (Some(x), Some(y)) = (x.as_concrete(), y.as_concrete()) {
        return Value::Concrete(match op {
            AluOp::Add => x.wrapping_add(y),
            AluOp::Sub => x.wrapping_sub(y),
            AluOp::Mul => x.wrapping_mul(y),
            AluOp::And => x & y,
            AluOp::Or => x | y,
            AluOp::Xor => x ^ y,
        });
    }
    let (x, y) = (Box::new(x.to_exp(64)), Box::new(y.to_exp(64)));
    Value::Symbolic(match op {
        AluOp::Add => Exp::Bvadd(x, y),
        AluOp::Sub => Exp::Bvsub(x, y),
        AluOp::Mul => Exp::Bvmul(x, y),
        AluOp::And => Exp::Bvand(x, y),
        AluOp::Or => Exp::Bvor(x, y),
        AluOp::Xor => Exp::Bvxor(x, y),
    })
}

/// Either the branch outcome, when both sides are concrete, or the
/// predicate under which it is taken.
fn compare(op: BranchOp, x: &Value, y: &Value) -> Result<bool, Exp> {
    if let (Some(x), Some(y)) = (x.as_concrete(), y.as_concrete()) {
        return Ok(match op {
            BranchOp::Eq => x == y,
            BranchOp::Ne => x != y,
            BranchOp::Lt => x < y,
        });
    }
    let (x, y) = (Box::new(x.to_exp(64)), Box::new(y.to_exp(64)));
    Err(match op {
        BranchOp::Eq => Exp::Eq(x, y),
        BranchOp::Ne => Exp::Neq(x, y),
        BranchOp::Lt => Exp::Bvult(x, y),
    })
}

fn jump_if(state: &mut StateImage, taken: Result<bool, Exp>, target: Address, next: Address) -> StepResult {
    match taken {
        Ok(taken) => {
            state.pc = if taken { target } else { next };
            StepResult::Continue
        }
        Err(cond) => StepResult::Branch(vec![
            Successor { condition: cond.clone(), target },
            Successor { condition: Exp::Not(Box::new(cond)), target: next },
        ]),
    }
}

impl Program {
    pub fn parse(listing: &str) -> Result<Self, LoadError> {
        let mut base = DEFAULT_BASE;
        let mut memory = DEFAULT_MEMORY;
        let mut labels = HashMap::new();
        let mut pending = Vec::new();

        for (i, line) in listing.lines().enumerate() {
            let parser = LineParser { line: i + 1 };
            let mut line = match line.find(';') {
                Some(comment) => &line[..comment],
                None => line,
            }
            .trim();

            while let Some(caps) = LABEL_REGEX.captures(line) {
                let label = caps.get(1).map_or("", |m| m.as_str());
                let address = base + INSTR_SIZE * pending.len() as u64;
                if labels.insert(label.to_string(), address).is_some() {
                    return parser.error(format!("label '{}' defined twice", label));
                }
                line = caps.get(2).map_or("", |m| m.as_str()).trim()
            }
            if line.is_empty() {
                continue;
            }

            let (mnemonic, rest) = match line.find(char::is_whitespace) {
                Some(split) => (&line[..split], line[split..].trim()),
                None => (line, ""),
            };
            let ops: Vec<&str> = if rest.is_empty() { Vec::new() } else { rest.split(',').map(str::trim).collect() };
            let number = |s: &str| match parse_number(s) {
                Some(n) => Ok(n),
                None => parser.error(format!("'{}' is not a number", s)),
            };

            match mnemonic {
                ".base" if ops.len() == 1 => {
                    if !pending.is_empty() {
                        return parser.error(".base must come before the first instruction".to_string());
                    }
                    base = number(ops[0])?
                }
                ".memory" => {
                    let words: Vec<&str> = rest.split(|c: char| c == ',' || c.is_whitespace()).filter(|w| !w.is_empty()).collect();
                    if words.len() != 2 {
                        return parser.error(".memory takes a start address and a size".to_string());
                    }
                    memory = (number(words[0])?, number(words[1])?)
                }
                _ if mnemonic.starts_with('.') => return parser.error(format!("unknown directive '{}'", line)),
                _ => pending.push((i + 1, parser.instr(&mnemonic.to_lowercase(), &ops)?)),
            }
        }

        if pending.is_empty() {
            return Err(LoadError::Empty);
        }

        let mut instrs = Vec::with_capacity(pending.len());
        for (line, instr) in pending {
            instrs.push(match instr {
                Unresolved::Done(instr) => instr,
                Unresolved::Jump(label, make) => match labels.get(&label) {
                    Some(target) => make(*target),
                    None => return Err(LoadError::Parse { line, message: format!("undefined label '{}'", label) }),
                },
            })
        }

        let entry = labels.get("_start").or_else(|| labels.get("main")).copied().unwrap_or(base);
        Ok(Program { base, entry, memory, instrs, labels })
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, LoadError> {
        Program::parse(&fs::read_to_string(path)?)
    }

    pub fn entry(&self) -> Address {
        self.entry
    }

    pub fn label(&self, name: &str) -> Option<Address> {
        self.labels.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    pub fn fetch(&self, pc: Address) -> Option<&Instr> {
        if pc < self.base || (pc - self.base) % INSTR_SIZE != 0 {
            return None;
        }
        self.instrs.get(((pc - self.base) / INSTR_SIZE) as usize)
    }

    /// The state at the entry point with the given program input.
    pub fn root_state(&self, args: &[InputSpec]) -> StateImage {
        let mut state = StateImage::new(self.entry, Memory::new(self.memory.0, self.memory.1));
        build_input(&mut state, args);
        state
    }

    fn read(state: &StateImage, src: &Src) -> Value {
        match src {
            Src::Reg(reg) => state.register(reg),
            Src::Imm(n) => Value::Concrete(*n),
        }
    }

    fn address(state: &StateImage, reg: &str, pc: Address) -> Result<Address, EmulatorError> {
        state
            .register(reg)
            .as_concrete()
            .ok_or_else(|| EmulatorError::Unsupported(pc, format!("symbolic address in {}", reg)))
    }
}

impl Emulator for Program {
    fn step(&self, state: &mut StateImage) -> Result<StepResult, EmulatorError> {
        let pc = state.pc;
        let instr = match self.fetch(pc) {
            Some(instr) => instr,
            None => return Ok(StepResult::Fault(FaultKind::IllegalInstruction(pc))),
        };
        let next = pc + INSTR_SIZE;

        match instr {
            Instr::Mov(rd, src) => {
                let value = Self::read(state, src);
                state.set_register(rd, value)
            }
            Instr::Alu(op, rd, src) => {
                let value = alu(*op, &state.register(rd), &Self::read(state, src));
                state.set_register(rd, value)
            }
            Instr::Cmp(rs, src) => {
                let flag = match compare(BranchOp::Eq, &state.register(rs), &Self::read(state, src)) {
                    Ok(equal) => Value::Concrete(equal as u64),
                    Err(cond) => Value::Symbolic(Exp::Ite(
                        Box::new(cond),
                        Box::new(Exp::Bits64(1, 64)),
                        Box::new(Exp::Bits64(0, 64)),
                    )),
                };
                state.set_register(FLAG, flag)
            }
            Instr::Input(rd, index) => {
                let value = match state.input.get(*index as usize) {
                    Some(InputByte::Concrete(b)) => Value::Concrete(*b as u64),
                    Some(InputByte::Symbolic(v)) => Value::Symbolic(Exp::ZeroExtend(56, Box::new(Exp::Var(*v)))),
                    None => Value::Concrete(0),
                };
                state.set_register(rd, value)
            }
            Instr::Load(rd, rs) => {
                let addr = Self::address(state, rs, pc)?;
                let value = match state.memory.read_byte(addr) {
                    Some(Value::Symbolic(byte)) => Value::Symbolic(Exp::ZeroExtend(56, Box::new(byte))),
                    Some(concrete) => concrete,
                    None => return Ok(StepResult::Fault(FaultKind::SegFault(addr))),
                };
                state.set_register(rd, value)
            }
            Instr::Store(rd, rs) => {
                let addr = Self::address(state, rd, pc)?;
                let byte = match state.register(rs) {
                    Value::Concrete(bits) => Value::Concrete(bits),
                    Value::Symbolic(exp) => Value::Symbolic(Exp::Extract(7, 0, Box::new(exp))),
                };
                if !state.memory.write_byte(addr, byte) {
                    return Ok(StepResult::Fault(FaultKind::SegFault(addr)));
                }
            }
            Instr::Jmp(target) => {
                state.pc = *target;
                return Ok(StepResult::Continue);
            }
            Instr::Jz(target) | Instr::Jnz(target) => {
                let flag = state.register(FLAG);
                let taken = match flag.as_concrete() {
                    Some(bits) => Ok(bits != 0),
                    None => Err(truthy(&flag)),
                };
                let taken = match (instr, taken) {
                    (Instr::Jz(_), taken) => taken,
                    (_, Ok(taken)) => Ok(!taken),
                    (_, Err(cond)) => Err(Exp::Not(Box::new(cond))),
                };
                return Ok(jump_if(state, taken, *target, next));
            }
            Instr::Branch(op, rs, src, target) => {
                let taken = compare(*op, &state.register(rs), &Self::read(state, src));
                return Ok(jump_if(state, taken, *target, next));
            }
            Instr::Exit(src) => {
                return match Self::read(state, src) {
                    Value::Concrete(code) => Ok(StepResult::Exit(code)),
                    Value::Symbolic(_) => Err(EmulatorError::Unsupported(pc, "symbolic exit code".to_string())),
                }
            }
            Instr::Abort => return Ok(StepResult::Fault(FaultKind::Abort)),
            Instr::Nop => (),
        }

        state.pc = next;
        Ok(StepResult::Continue)
    }
}

/// Loads programs in the listing format.
#[derive(Clone, Copy, Debug, Default)]
pub struct ListingLoader;

impl Loader for ListingLoader {
    type Emulator = Program;

    fn load(&self, path: &Path, input: &[InputSpec]) -> Result<(Program, StateImage), LoadError> {
        let program = Program::from_file(path)?;
        let root = program.root_state(input);
        Ok((program, root))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smt::search::SearchSolver;
    use crate::smt::Solver;

    const BRANCHY: &str = "
        .memory 0x1000 16
        main:
            input r1, 0      ; symbolic byte
            cmp r1, 0x61
            jz yes
            exit 0
        yes: abort
    ";

    fn run_to_branch(program: &Program, state: &mut StateImage) -> StepResult {
        loop {
            match program.step(state).unwrap() {
                StepResult::Continue => continue,
                other => return other,
            }
        }
    }

    #[test]
    fn parse_listing() {
        let program = Program::parse(BRANCHY).unwrap();
        assert_eq!(program.len(), 5);
        assert_eq!(program.entry(), DEFAULT_BASE);
        assert_eq!(program.label("yes"), Some(DEFAULT_BASE + 16));
        assert_eq!(program.fetch(DEFAULT_BASE + 8), Some(&Instr::Jz(DEFAULT_BASE + 16)));
        assert_eq!(program.fetch(DEFAULT_BASE + 2), None);
    }

    #[test]
    fn parse_errors() {
        assert!(matches!(Program::parse("; nothing\n"), Err(LoadError::Empty)));
        assert!(matches!(Program::parse("nop\njmp nowhere"), Err(LoadError::Parse { line: 2, .. })));
        assert!(matches!(Program::parse("mov r16, 1"), Err(LoadError::Parse { line: 1, .. })));
        assert!(matches!(Program::parse("a: nop\na: nop"), Err(LoadError::Parse { line: 2, .. })));
        assert!(matches!(Program::parse("frob r1"), Err(LoadError::Parse { .. })));
    }

    #[test]
    fn concrete_execution() {
        let program = Program::parse(
            "
            .base 0x1000
            .memory 0x2000, 0x10
            _start:
                mov r1, 0x2000
                mov r2, 0x1ff
                store [r1], r2
                load r3, [r1]
                mov r4, 0
            loop:
                add r4, 3
                blt r4, 10, loop
                mul r4, r3
                exit r4
            ",
        )
        .unwrap();
        let mut state = program.root_state(&[]);
        assert_eq!(state.pc, 0x1000);
        assert_eq!(run_to_branch(&program, &mut state), StepResult::Exit(12 * 0xff));
    }

    #[test]
    fn faults() {
        let program = Program::parse("mov r1, 0x10\nload r2, [r1]\n").unwrap();
        let mut state = program.root_state(&[]);
        assert_eq!(run_to_branch(&program, &mut state), StepResult::Fault(FaultKind::SegFault(0x10)));

        let program = Program::parse("nop").unwrap();
        let mut state = program.root_state(&[]);
        assert_eq!(run_to_branch(&program, &mut state), StepResult::Fault(FaultKind::IllegalInstruction(DEFAULT_BASE + 4)));
    }

    #[test]
    fn symbolic_branch() {
        let program = Program::parse(BRANCHY).unwrap();
        let mut state = program.root_state(&[InputSpec::parse("+")]);
        let successors = match run_to_branch(&program, &mut state) {
            StepResult::Branch(successors) => successors,
            other => panic!("expected a branch, got {:?}", other),
        };
        assert_eq!(successors.len(), 2);
        assert_eq!(successors[0].target, DEFAULT_BASE + 16);
        assert_eq!(successors[1].target, DEFAULT_BASE + 12);

        let mut solver = SearchSolver::new();
        for successor in &successors {
            assert_eq!(solver.check_sat_with(&state.path, &successor.condition), Ok(true))
        }
        let both = state.path.with(successors[0].condition.clone()).with(successors[1].condition.clone());
        assert_eq!(solver.is_satisfiable(&both), Ok(false));
    }

    #[test]
    fn symbolic_addresses_are_unsupported() {
        let program = Program::parse("input r1, 0\nload r2, [r1]\n").unwrap();
        let mut state = program.root_state(&[InputSpec::parse("+")]);
        assert_eq!(program.step(&mut state), Ok(StepResult::Continue));
        assert!(matches!(program.step(&mut state), Err(EmulatorError::Unsupported(_, _))));
    }
}
