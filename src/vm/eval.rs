// KEEL, a bytecode virtual machine.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// KEEL is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/vm/eval.rs

// Executes resolved bytecode. The machine keeps an operand stack, a
// stack of call frames, a stack of return addresses pushed by `Call`
// and a fixed global area. Execution is a flat loop; nothing here
// recurses on the program's behalf.

// <>

use log::{info, trace};

use super::decode::ByteCode;
use super::error::{Fault, RunError};
use super::instr::{Instr, Instruction, Ip, Location, Operator, RuntimeCall};
use super::memmgt::Heap;
use super::stdenv::{render, Console};
use super::word::{ObjRef, SlotRef, Word};

/// Operand stack of a running machine
#[derive(Debug, Default)]
pub struct OperandStack {
    words: Vec<Word>,
}

impl OperandStack {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline(always)]
    pub fn push(&mut self, word: Word) {
        self.words.push(word);
    }

    #[inline(always)]
    pub fn pop(&mut self) -> Result<Word, Fault> {
        self.words.pop().ok_or(Fault::StackUnderflow)
    }

    /// Current top, left in place
    pub fn top(&self) -> Result<Word, Fault> {
        self.words.last().copied().ok_or(Fault::StackUnderflow)
    }

    /// Removes the top `n` words, returned in the order they were pushed
    pub fn pop_n(&mut self, n: usize) -> Result<Vec<Word>, Fault> {
        if n > self.words.len() {
            return Err(Fault::StackUnderflow);
        }
        Ok(self.words.split_off(self.words.len() - n))
    }

    pub fn depth(&self) -> usize {
        self.words.len()
    }

    pub fn as_slice(&self) -> &[Word] {
        &self.words
    }
}

/// Storage for one active function body
#[derive(Debug)]
struct Frame {
    /// Serial number, never reused within a run
    id: u64,
    args: Vec<Word>,
    locals: Vec<Word>,
}

#[derive(Debug, Clone, Copy)]
struct Return {
    ip: Ip,
    /// Arguments the `Call` left on the operand stack
    n_args: usize,
}

/// Summary of a completed run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    /// Instructions executed
    pub steps: u64,
    /// Operand stack depth at halt
    pub operand_depth: usize,
}

/// Interpreter state for one run of a program
pub struct Machine<'p, C: Console> {
    code: &'p ByteCode,
    ip: Ip,
    stack: OperandStack,
    frames: Vec<Frame>,
    returns: Vec<Return>,
    globals: Vec<Word>,
    heap: Heap,
    console: C,
    line: Option<u32>,
    next_frame: u64,
    steps: u64,
    halted: bool,
}

impl<'p, C: Console> Machine<'p, C> {
    pub fn new(code: &'p ByteCode, globals: usize, console: C) -> Self {
        Self {
            code,
            ip: 0,
            stack: OperandStack::new(),
            frames: vec![],
            returns: vec![],
            globals: vec![Word::default(); globals],
            heap: Heap::new(),
            console,
            line: None,
            next_frame: 0,
            steps: 0,
            halted: false,
        }
    }

    pub fn ip(&self) -> Ip {
        self.ip
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn stack(&self) -> &[Word] {
        self.stack.as_slice()
    }

    pub fn globals(&self) -> &[Word] {
        &self.globals
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn console(&self) -> &C {
        &self.console
    }

    pub fn into_console(self) -> C {
        self.console
    }

    /// Frames currently open
    pub fn frame_depth(&self) -> usize {
        self.frames.len()
    }

    /// Calls that have not yet returned
    pub fn return_depth(&self) -> usize {
        self.returns.len()
    }

    /// Last source line announced by the program
    pub fn line(&self) -> Option<u32> {
        self.line
    }

    /// Runs until the program halts or faults
    pub fn run(&mut self) -> Result<Outcome, RunError> {
        while self.step()? {}

        info!(
            "halted after {} steps, {} words on the operand stack",
            self.steps,
            self.stack.depth()
        );

        Ok(Outcome {
            steps: self.steps,
            operand_depth: self.stack.depth(),
        })
    }

    /// Executes one instruction; false once the machine has halted
    pub fn step(&mut self) -> Result<bool, RunError> {
        if self.halted {
            return Ok(false);
        }

        let ip = self.ip;
        let code: &'p ByteCode = self.code;
        let instr = match code.get(ip) {
            Some(i) => i,
            None => {
                // falling off the end of the code is a normal halt
                self.halted = true;
                return Ok(false);
            }
        };

        if cfg!(feature = "stkdbg") {
            trace!("{:>6}  {:<24} {:?}", ip, instr.to_string(), self.stack.as_slice());
        }

        self.ip += 1;
        self.steps += 1;

        self.exec(instr).map_err(|fault| RunError {
            ip,
            kind: instr.name(),
            line: self.line,
            fault,
        })?;

        Ok(!self.halted)
    }

    fn frame(&self) -> Result<&Frame, Fault> {
        self.frames.last().ok_or(Fault::NoFrame)
    }

    fn frame_by_id(&mut self, id: u64) -> Result<&mut Frame, Fault> {
        // frames only ever end in LIFO order, so serials stay sorted
        let at = self
            .frames
            .binary_search_by_key(&id, |f| f.id)
            .map_err(|_| Fault::DanglingSlot)?;
        Ok(&mut self.frames[at])
    }

    /// Address of a location in the current frame or global area
    fn address(&self, loc: &Location) -> Result<SlotRef, Fault> {
        let checked = |kind, index: usize, len: usize| {
            if index < len {
                Ok(index)
            } else {
                Err(Fault::SlotOutOfRange { kind, index, len })
            }
        };

        Ok(match *loc {
            Location::Global(i) => SlotRef::Global(checked("global", i, self.globals.len())?),
            Location::Local(i) => {
                let f = self.frame()?;
                SlotRef::Local {
                    frame: f.id,
                    index: checked("local", i, f.locals.len())?,
                }
            }
            Location::Arg(i) => {
                let f = self.frame()?;
                SlotRef::Arg {
                    frame: f.id,
                    index: checked("argument", i, f.args.len())?,
                }
            }
            Location::Const(_) => return Err(Fault::ConstAddress),
        })
    }

    fn slot_mut(&mut self, slot: SlotRef) -> Result<&mut Word, Fault> {
        match slot {
            SlotRef::Global(i) => {
                let len = self.globals.len();
                self.globals.get_mut(i).ok_or(Fault::SlotOutOfRange {
                    kind: "global",
                    index: i,
                    len,
                })
            }
            SlotRef::Local { frame, index } => {
                let f = self.frame_by_id(frame)?;
                let len = f.locals.len();
                f.locals.get_mut(index).ok_or(Fault::SlotOutOfRange {
                    kind: "local",
                    index,
                    len,
                })
            }
            SlotRef::Arg { frame, index } => {
                let f = self.frame_by_id(frame)?;
                let len = f.args.len();
                f.args.get_mut(index).ok_or(Fault::SlotOutOfRange {
                    kind: "argument",
                    index,
                    len,
                })
            }
        }
    }

    fn load(&mut self, loc: &Location) -> Result<Word, Fault> {
        match loc {
            Location::Const(w) => Ok(*w),
            _ => {
                let slot = self.address(loc)?;
                Ok(*self.slot_mut(slot)?)
            }
        }
    }

    fn binop(op: Operator, l: i32, r: i32) -> Result<i32, Fault> {
        Ok(match op {
            Operator::Plus => l.wrapping_add(r),
            Operator::Minus => l.wrapping_sub(r),
            Operator::Mult => l.wrapping_mul(r),
            Operator::Div => l.checked_div(r).ok_or(Fault::DivisionByZero)?,
            Operator::Mod => l.checked_rem(r).ok_or(Fault::DivisionByZero)?,
            Operator::Lt => (l < r) as i32,
            Operator::Le => (l <= r) as i32,
            Operator::Gt => (l > r) as i32,
            Operator::Ge => (l >= r) as i32,
            Operator::Eq => (l == r) as i32,
            Operator::Neq => (l != r) as i32,
            Operator::Or => (l != 0 || r != 0) as i32,
            Operator::And => (l != 0 && r != 0) as i32,
        })
    }

    /// Stores `elems` into a fresh object, first pushed at index 0
    fn fill(&mut self, obj: ObjRef, elems: Vec<Word>) -> Result<Word, Fault> {
        for (i, w) in elems.into_iter().enumerate() {
            self.heap.sta(w, i as i32, obj)?;
        }
        Ok(Word::obj(obj))
    }

    fn exec(&mut self, instr: &Instruction) -> Result<(), Fault> {
        match instr {
            Instr::Const(w) => self.stack.push(*w),

            Instr::String(s) => {
                let r = self.heap.make_string(s);
                self.stack.push(Word::obj(r));
            }

            Instr::Binop(op) => {
                let r = self.stack.pop()?.as_int()?;
                let l = self.stack.pop()?.as_int()?;
                self.stack.push(Word::int(Self::binop(*op, l, r)?));
            }

            Instr::Drop => {
                self.stack.pop()?;
            }

            Instr::Dup => {
                let w = self.stack.top()?;
                self.stack.push(w);
            }

            Instr::Swap => {
                let a = self.stack.pop()?;
                let b = self.stack.pop()?;
                self.stack.push(a);
                self.stack.push(b);
            }

            Instr::Ld(loc) => {
                let w = self.load(loc)?;
                self.stack.push(w);
            }

            Instr::Lda(loc) => {
                let slot = self.address(loc)?;
                self.stack.push(Word::slot(slot));
            }

            Instr::St(loc) => {
                let w = self.stack.top()?;
                let slot = self.address(loc)?;
                *self.slot_mut(slot)? = w;
            }

            Instr::Sti => {
                let v = self.stack.pop()?;
                let slot = self.stack.pop()?.as_slot()?;
                *self.slot_mut(slot)? = v;
                self.stack.push(v);
            }

            Instr::Sta => {
                let v = self.stack.pop()?;
                let i = self.stack.pop()?.as_int()?;
                let arr = self.stack.pop()?.as_obj()?;
                let stored = self.heap.sta(v, i, arr)?;
                self.stack.push(stored);
            }

            Instr::Elem => {
                let i = self.stack.pop()?.as_int()?;
                let obj = self.stack.pop()?.as_obj()?;
                let w = self.heap.elem(obj, i)?;
                self.stack.push(w);
            }

            Instr::Jmp(target) => self.ip = *target,

            Instr::CJmp { on_nonzero, target } => {
                if self.stack.pop()?.truthy()? == *on_nonzero {
                    self.ip = *target;
                }
            }

            Instr::Begin { n_args, n_locals } => {
                // only the outermost frame opens with no return pending
                let args = match self.returns.last() {
                    Some(ret) if ret.n_args != *n_args => {
                        return Err(Fault::ArityMismatch {
                            passed: ret.n_args,
                            declared: *n_args,
                        })
                    }
                    Some(_) => self.stack.pop_n(*n_args)?,
                    None => vec![Word::default(); *n_args],
                };

                let id = self.next_frame;
                self.next_frame += 1;
                trace!("enter frame {} at {}: {} args, {} locals", id, self.ip - 1, n_args, n_locals);

                self.frames.push(Frame {
                    id,
                    args,
                    locals: vec![Word::default(); *n_locals],
                });
            }

            Instr::End | Instr::Ret => {
                let f = self.frames.pop().ok_or(Fault::NoFrame)?;
                match self.returns.pop() {
                    Some(ret) => {
                        trace!("leave frame {} to {}", f.id, ret.ip);
                        self.ip = ret.ip;
                    }
                    None => {
                        trace!("leave outermost frame {}", f.id);
                        self.halted = true;
                    }
                }
            }

            Instr::Call { target, n_args } => {
                trace!("call {} from {} with {} args", target, self.ip - 1, n_args);
                self.returns.push(Return {
                    ip: self.ip,
                    n_args: *n_args,
                });
                self.ip = *target;
            }

            Instr::Tag { tag, n_fields } => {
                let w = self.stack.pop()?;
                let hit = self.heap.tag_check(w, tag.hash, *n_fields);
                self.stack.push(Word::from_bool(hit));
            }

            Instr::Array(n) | Instr::Runtime(RuntimeCall::Array(n)) => {
                let elems = self.stack.pop_n(*n)?;
                let arr = self.heap.make_array(elems.len());
                let w = self.fill(arr, elems)?;
                self.stack.push(w);
            }

            Instr::Sexp { tag, n_args } => {
                let elems = self.stack.pop_n(*n_args)?;
                let sx = self.heap.make_sexp(tag.hash, elems.len());
                let w = self.fill(sx, elems)?;
                self.stack.push(w);
            }

            Instr::Fail { line, col } => {
                let w = self.stack.pop()?;
                return Err(Fault::MatchFailure {
                    line: *line,
                    col: *col,
                    value: render(w, &self.heap, self.code.tags())?,
                });
            }

            Instr::Line(n) => self.line = Some(*n),

            Instr::Runtime(RuntimeCall::Read) => {
                let n = self.console.read_int()?;
                self.stack.push(Word::int(n));
            }

            Instr::Runtime(RuntimeCall::Write) => {
                let n = self.stack.pop()?.as_int()?;
                self.console.write_int(n)?;
                self.stack.push(Word::int(0));
            }

            Instr::Runtime(RuntimeCall::Length) => {
                let obj = self.stack.pop()?.as_obj()?;
                let n = self.heap.length(obj)?;
                self.stack.push(Word::int(n as i32));
            }

            Instr::Runtime(RuntimeCall::Stringify) => {
                let w = self.stack.pop()?;
                let text = render(w, &self.heap, self.code.tags())?;
                let r = self.heap.make_string(text.as_bytes());
                self.stack.push(Word::obj(r));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::asm::Asm;
    use crate::vm::bytefile::ByteFile;
    use crate::vm::decode::decode;
    use crate::vm::memmgt::Object;
    use crate::vm::stdenv::Scripted;

    fn run_with(file: &ByteFile, input: &[i32]) -> (Result<Outcome, RunError>, Vec<i32>) {
        let code = decode(file).unwrap();
        let mut m = Machine::new(&code, 2, Scripted::new(input.iter().copied()));
        let res = m.run();
        (res, m.into_console().written().to_vec())
    }

    fn output(file: &ByteFile) -> Vec<i32> {
        let (res, out) = run_with(file, &[]);
        res.unwrap();
        out
    }

    #[test]
    fn adds() {
        let file = Asm::new()
            .begin(2, 0)
            .konst(2)
            .konst(3)
            .binop(Operator::Plus)
            .write()
            .drop()
            .end()
            .finish();

        let code = decode(&file).unwrap();
        let mut m = Machine::new(&code, 0, Scripted::default());
        m.run().unwrap();
        assert_eq!(m.console().written(), &[5]);
        assert!(m.stack().is_empty());
        assert_eq!(m.frame_depth(), 0);
        assert_eq!(m.return_depth(), 0);
    }

    #[test]
    fn operand_order() {
        let file = Asm::new()
            .begin(0, 0)
            .konst(7)
            .konst(2)
            .binop(Operator::Minus)
            .write()
            .konst(7)
            .konst(2)
            .binop(Operator::Div)
            .write()
            .konst(-7)
            .konst(2)
            .binop(Operator::Mod)
            .write()
            .konst(1)
            .konst(2)
            .binop(Operator::Lt)
            .write()
            .konst(0)
            .konst(5)
            .binop(Operator::And)
            .write()
            .end()
            .finish();

        assert_eq!(output(&file), [5, 3, -1, 1, 0]);
    }

    #[test]
    fn arrays() {
        let file = Asm::new()
            .begin(0, 0)
            .konst(7)
            .konst(8)
            .konst(9)
            .array(3)
            .dup()
            .konst(0)
            .elem()
            .write()
            .drop()
            .dup()
            .konst(1)
            .elem()
            .write()
            .drop()
            .dup()
            .konst(2)
            .elem()
            .write()
            .drop()
            .length()
            .write()
            .end()
            .finish();

        assert_eq!(output(&file), [7, 8, 9, 3]);
    }

    #[test]
    fn divides_by_zero() {
        let file = Asm::new()
            .begin(0, 0)
            .konst(1)
            .write()
            .konst(4)
            .konst(0)
            .binop(Operator::Div)
            .write()
            .end()
            .finish();

        let (res, out) = run_with(&file, &[]);
        let err = res.unwrap_err();
        assert!(matches!(err.fault, Fault::DivisionByZero));
        assert_eq!(err.kind, "Binop");
        assert_eq!(err.ip, 5);
        // output already produced stays produced, nothing after the fault
        assert_eq!(out, [1]);
    }

    #[test]
    fn frames_isolated() {
        // f(x) stores x in its local; two calls must not see each other
        let file = Asm::new()
            .begin(0, 0)
            .konst(10)
            .call("f", 1)
            .write()
            .konst(20)
            .call("f", 1)
            .write()
            .end()
            .label("f")
            .begin(1, 1)
            .ld(Location::Local(0))
            .ld(Location::Arg(0))
            .binop(Operator::Plus)
            .st(Location::Local(0))
            .end()
            .finish();

        assert_eq!(output(&file), [10, 20]);
    }

    #[test]
    fn nested_calls() {
        // f(x) writes g(x, 1), where g(a, b) = a - b
        let file = Asm::new()
            .begin(0, 0)
            .konst(5)
            .call("f", 1)
            .drop()
            .end()
            .label("f")
            .begin(1, 0)
            .ld(Location::Arg(0))
            .konst(1)
            .call("g", 2)
            .write()
            .end()
            .label("g")
            .begin(2, 0)
            .ld(Location::Arg(0))
            .ld(Location::Arg(1))
            .binop(Operator::Minus)
            .end()
            .finish();

        assert_eq!(output(&file), [4]);
    }

    #[test]
    fn calls_unwind_in_order() {
        // main -> f -> g -> h, each writing before and after its call
        let file = Asm::new()
            .begin(0, 0)
            .konst(1)
            .write()
            .drop()
            .call("f", 0)
            .konst(7)
            .write()
            .drop()
            .end()
            .label("f")
            .begin(0, 0)
            .konst(2)
            .write()
            .drop()
            .call("g", 0)
            .konst(6)
            .write()
            .drop()
            .end()
            .label("g")
            .begin(0, 0)
            .konst(3)
            .write()
            .drop()
            .call("h", 0)
            .konst(5)
            .write()
            .drop()
            .end()
            .label("h")
            .begin(0, 0)
            .konst(4)
            .write()
            .drop()
            .end()
            .finish();

        let code = decode(&file).unwrap();
        let mut m = Machine::new(&code, 0, Scripted::default());
        let (mut frames, mut returns) = (0, 0);
        while m.step().unwrap() {
            frames = frames.max(m.frame_depth());
            returns = returns.max(m.return_depth());
        }

        assert_eq!(m.console().written(), &[1, 2, 3, 4, 5, 6, 7]);
        assert_eq!((frames, returns), (4, 3));
        assert_eq!(m.frame_depth(), 0);
        assert_eq!(m.return_depth(), 0);
        assert!(m.stack().is_empty());
    }

    #[test]
    fn begin_after_line() {
        // the callee announces a line before opening its frame
        let file = Asm::new()
            .begin(0, 0)
            .konst(5)
            .call("f", 1)
            .write()
            .end()
            .label("f")
            .line(1)
            .begin(1, 0)
            .ld(Location::Arg(0))
            .end()
            .finish();

        let code = decode(&file).unwrap();
        let mut m = Machine::new(&code, 0, Scripted::default());
        m.run().unwrap();
        assert_eq!(m.console().written(), &[5]);
        // the argument was consumed; only Write's result is left
        assert_eq!(m.stack(), &[Word::int(0)]);
        assert_eq!(m.line(), Some(1));

        // a jump ahead of Begin, and the arity still checked
        let file = Asm::new()
            .begin(0, 0)
            .konst(5)
            .konst(6)
            .call("f", 2)
            .end()
            .label("f")
            .jmp("body")
            .label("body")
            .begin(1, 0)
            .end()
            .finish();

        let err = run_with(&file, &[]).0.unwrap_err();
        assert_eq!(err.kind, "Begin");
        assert!(matches!(
            err.fault,
            Fault::ArityMismatch {
                passed: 2,
                declared: 1
            }
        ));
    }

    #[test]
    fn arity_checked() {
        let file = Asm::new()
            .begin(0, 0)
            .konst(1)
            .konst(2)
            .call("f", 2)
            .end()
            .label("f")
            .begin(1, 0)
            .end()
            .finish();

        let err = run_with(&file, &[]).0.unwrap_err();
        assert!(matches!(
            err.fault,
            Fault::ArityMismatch {
                passed: 2,
                declared: 1
            }
        ));
    }

    #[test]
    fn dangling_slot() {
        // f returns the address of its own local
        let file = Asm::new()
            .begin(0, 0)
            .call("f", 0)
            .konst(3)
            .sti()
            .end()
            .label("f")
            .begin(0, 1)
            .lda(Location::Local(0))
            .end()
            .finish();

        let err = run_with(&file, &[]).0.unwrap_err();
        assert!(matches!(err.fault, Fault::DanglingSlot));
        assert_eq!(err.kind, "Sti");
    }

    #[test]
    fn store_indirect() {
        let file = Asm::new()
            .begin(0, 1)
            .lda(Location::Local(0))
            .konst(6)
            .sti()
            .drop()
            .ld(Location::Local(0))
            .write()
            .lda(Location::Global(1))
            .konst(2)
            .sti()
            .drop()
            .ld(Location::Global(1))
            .write()
            .end()
            .finish();

        assert_eq!(output(&file), [6, 2]);
    }

    #[test]
    fn store_keeps_top() {
        let file = Asm::new()
            .begin(0, 0)
            .konst(4)
            .st(Location::Global(0))
            .write()
            .ld(Location::Global(0))
            .write()
            .end()
            .finish();

        let code = decode(&file).unwrap();
        let mut m = Machine::new(&code, 1, Scripted::default());
        m.run().unwrap();
        assert_eq!(m.globals(), &[Word::int(4)]);
        assert_eq!(m.console().written(), &[4, 4]);
    }

    #[test]
    fn const_has_no_address() {
        let file = Asm::new()
            .begin(0, 0)
            .lda(Location::Const(Word::int(1)))
            .end()
            .finish();

        let err = run_with(&file, &[]).0.unwrap_err();
        assert!(matches!(err.fault, Fault::ConstAddress));

        // loading a constant is fine
        let file = Asm::new()
            .begin(0, 0)
            .ld(Location::Const(Word::int(9)))
            .write()
            .end()
            .finish();
        assert_eq!(output(&file), [9]);
    }

    #[test]
    fn slot_bounds() {
        let file = Asm::new().begin(0, 1).ld(Location::Local(1)).end().finish();
        let err = run_with(&file, &[]).0.unwrap_err();
        assert!(matches!(
            err.fault,
            Fault::SlotOutOfRange {
                kind: "local",
                index: 1,
                len: 1
            }
        ));

        let file = Asm::new().begin(0, 0).ld(Location::Global(2)).end().finish();
        let err = run_with(&file, &[]).0.unwrap_err();
        assert!(matches!(err.fault, Fault::SlotOutOfRange { kind: "global", .. }));
    }

    #[test]
    fn sums_loop() {
        // G0 = i, G1 = sum; while i <= 10
        let file = Asm::new()
            .begin(0, 0)
            .konst(1)
            .st(Location::Global(0))
            .drop()
            .label("loop")
            .ld(Location::Global(0))
            .konst(10)
            .binop(Operator::Le)
            .cjmpz("done")
            .ld(Location::Global(1))
            .ld(Location::Global(0))
            .binop(Operator::Plus)
            .st(Location::Global(1))
            .drop()
            .ld(Location::Global(0))
            .konst(1)
            .binop(Operator::Plus)
            .st(Location::Global(0))
            .drop()
            .jmp("loop")
            .label("done")
            .ld(Location::Global(1))
            .write()
            .end()
            .finish();

        assert_eq!(output(&file), [55]);
    }

    #[test]
    fn sexps() {
        let file = Asm::new()
            .begin(0, 0)
            .konst(1)
            .konst(2)
            .sexp("Pair", 2)
            .dup()
            .tag("Pair", 2)
            .write()
            .drop()
            .dup()
            .tag("Pair", 1)
            .write()
            .drop()
            .dup()
            .tag("Other", 2)
            .write()
            .drop()
            .konst(1)
            .elem()
            .write()
            .konst(5)
            .tag("Pair", 2)
            .write()
            .end()
            .finish();

        assert_eq!(output(&file), [1, 0, 0, 2, 0]);
    }

    #[test]
    fn aggregate_underflow_allocates_nothing() {
        let programs = [
            Asm::new().begin(0, 0).array(1_000_000).end().finish(),
            Asm::new().begin(0, 0).konst(1).sexp("Pair", 2).end().finish(),
            Asm::new().begin(0, 0).barray(3).end().finish(),
        ];

        for file in &programs {
            let code = decode(file).unwrap();
            let mut m = Machine::new(&code, 0, Scripted::default());
            let err = m.run().unwrap_err();
            assert!(matches!(err.fault, Fault::StackUnderflow));
            assert!(m.heap().is_empty());
        }
    }

    #[test]
    fn boxes_objects_only() {
        let file = Asm::new()
            .begin(0, 0)
            .konst(4)
            .string("s")
            .konst(1)
            .array(1)
            .konst(2)
            .sexp("One", 1)
            .konst(3)
            .barray(1)
            .konst(0)
            .tag("One", 1)
            .end()
            .finish();

        let code = decode(&file).unwrap();
        let mut m = Machine::new(&code, 0, Scripted::default());
        m.run().unwrap();

        let stack = m.stack();
        assert_eq!(stack.len(), 6);
        assert!(stack[0].is_unboxed());
        assert!(stack[5].is_unboxed());
        let kinds: Vec<_> = stack[1..5]
            .iter()
            .map(|w| {
                assert!(!w.is_unboxed());
                m.heap().get(w.as_obj().unwrap()).unwrap().kind_name()
            })
            .collect();
        assert_eq!(kinds, ["string", "array", "s-expression", "array"]);
    }

    #[test]
    fn fails() {
        let file = Asm::new()
            .begin(0, 0)
            .line(3)
            .konst(1)
            .konst(2)
            .sexp("Pair", 2)
            .fail(3, 14)
            .end()
            .finish();

        let err = run_with(&file, &[]).0.unwrap_err();
        assert_eq!(err.line, Some(3));
        match err.fault {
            Fault::MatchFailure { line, col, value } => {
                assert_eq!((line, col), (3, 14));
                assert_eq!(value, "Pair (1, 2)");
            }
            other => panic!("unexpected fault {:?}", other),
        }
    }

    #[test]
    fn elem_needs_reference() {
        let file = Asm::new().begin(0, 0).konst(1).konst(0).elem().end().finish();
        let err = run_with(&file, &[]).0.unwrap_err();
        assert!(matches!(err.fault, Fault::NotAReference));
    }

    #[test]
    fn stringifies() {
        let file = Asm::new()
            .begin(0, 0)
            .konst(1)
            .string("a")
            .barray(2)
            .stringify()
            .dup()
            .length()
            .write()
            .end()
            .finish();

        let code = decode(&file).unwrap();
        let mut m = Machine::new(&code, 0, Scripted::default());
        m.run().unwrap();
        assert_eq!(m.console().written(), &[8]);

        let s = m.stack()[0].as_obj().unwrap();
        assert_eq!(m.heap().get(s).unwrap(), &Object::String(b"[1, \"a\"]".to_vec()));
    }

    #[test]
    fn reads() {
        let file = Asm::new()
            .begin(0, 0)
            .read()
            .read()
            .binop(Operator::Mult)
            .write()
            .end()
            .finish();

        let (res, out) = run_with(&file, &[6, 7]);
        res.unwrap();
        assert_eq!(out, [42]);

        let (res, _) = run_with(&file, &[6]);
        assert!(matches!(res.unwrap_err().fault, Fault::Console(_)));
    }

    #[test]
    fn swaps_and_underflows() {
        let file = Asm::new()
            .begin(0, 0)
            .konst(1)
            .konst(2)
            .swap()
            .write()
            .drop()
            .write()
            .drop()
            .drop()
            .end()
            .finish();

        let (res, out) = run_with(&file, &[]);
        assert_eq!(out, [1, 2]);
        assert!(matches!(res.unwrap_err().fault, Fault::StackUnderflow));
    }

    #[test]
    fn halts() {
        // no End at all
        let file = Asm::new().konst(1).write().finish();
        let code = decode(&file).unwrap();
        let mut m = Machine::new(&code, 0, Scripted::default());
        let out = m.run().unwrap();
        assert_eq!(out, Outcome { steps: 2, operand_depth: 1 });
        assert!(m.is_halted());
        assert!(!m.step().unwrap());

        // Ret closes a frame like End
        let file = Asm::new()
            .begin(0, 0)
            .call("f", 0)
            .write()
            .end()
            .label("f")
            .begin(0, 0)
            .konst(8)
            .ret()
            .finish();
        assert_eq!(output(&file), [8]);
    }

    #[test]
    fn stack_effects() {
        // straight-line code: depth after each step matches the table
        let file = Asm::new()
            .globals(1)
            .begin(0, 1)
            .konst(3)
            .dup()
            .swap()
            .binop(Operator::Plus)
            .st(Location::Global(0))
            .ld(Location::Local(0))
            .lda(Location::Global(0))
            .swap()
            .sti()
            .string("xy")
            .dup()
            .konst(0)
            .konst(122)
            .sta()
            .drop()
            .konst(1)
            .elem()
            .konst(1)
            .konst(2)
            .sexp("Two", 2)
            .tag("Two", 2)
            .array(2)
            .length()
            .line(1)
            .stringify()
            .konst(9)
            .barray(2)
            .drop()
            .end()
            .finish();

        let code = decode(&file).unwrap();
        let mut m = Machine::new(&code, 1, Scripted::default());

        // past Begin
        m.step().unwrap();
        while let Some(instr) = code.get(m.ip()) {
            let (pops, pushes) = match instr.stack_effect() {
                Some(e) => e,
                None => break,
            };
            let before = m.stack().len();
            m.step().unwrap();
            assert_eq!(m.stack().len() + pops, before + pushes, "{}", instr);
        }
        assert_eq!(code.get(m.ip()), Some(&Instruction::End));
    }
}
