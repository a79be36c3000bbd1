// KEEL, a bytecode virtual machine.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// KEEL is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/vm/instr.rs

// The instruction set. Instructions are generic over their jump
// target so that freshly decoded code (byte offset labels) and
// resolved code (instruction indices) are distinct types.

// <>

use std::fmt;
use std::rc::Rc;

use super::symtab::Tag;
use super::word::Word;

/// Generates a `u8`-backed enum whose `TryFrom<u8>` hands back any
/// nibble it does not recognise
macro_rules! nibble_enum {
    ($(#[$meta:meta])* $vis:vis enum $name:ident {
        $($vname:ident = $val:literal,)*
    }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u8)]
        $vis enum $name {
            $($vname = $val,)*
        }

        impl TryFrom<u8> for $name {
            type Error = u8;

            #[inline(always)]
            fn try_from(nibble: u8) -> Result<Self, u8> {
                match nibble {
                    $($val => Ok($name::$vname),)*
                    other => Err(other),
                }
            }
        }
    }
}

nibble_enum! {
    /// High nibble of an opcode byte
    pub enum Family {
        Binop = 0,
        Misc = 1,
        Ld = 2,
        Lda = 3,
        St = 4,
        Ctrl = 5,
        Patt = 6,
        Builtin = 7,
        Stop = 15,
    }
}

nibble_enum! {
    /// Binary operators; the discriminant is the opcode's low nibble
    pub enum Operator {
        Plus = 1,
        Minus = 2,
        Mult = 3,
        Div = 4,
        Mod = 5,
        Lt = 6,
        Le = 7,
        Gt = 8,
        Ge = 9,
        Eq = 10,
        Neq = 11,
        Or = 12,
        And = 13,
    }
}

impl Operator {
    pub fn symbol(self) -> &'static str {
        match self {
            Operator::Plus => "+",
            Operator::Minus => "-",
            Operator::Mult => "*",
            Operator::Div => "/",
            Operator::Mod => "%",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::Eq => "==",
            Operator::Neq => "!=",
            Operator::Or => "!!",
            Operator::And => "&&",
        }
    }
}

/// Byte offset of an instruction within the code, as encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(pub u32);

/// Index of an instruction within resolved code
pub type Ip = usize;

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Symbolic storage address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Global(usize),
    Local(usize),
    Arg(usize),
    /// Inline value; has no address
    Const(Word),
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Global(i) => write!(f, "G({})", i),
            Location::Local(i) => write!(f, "L({})", i),
            Location::Arg(i) => write!(f, "A({})", i),
            Location::Const(w) => write!(f, "C({})", w),
        }
    }
}

/// Host primitives reachable from code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeCall {
    Read,
    Write,
    Length,
    /// Render any value as a fresh string
    Stringify,
    /// Build an array from the top `n` values
    Array(usize),
}

/// A single instruction with jump targets of type `L`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instr<L> {
    Binop(Operator),
    Const(Word),
    String(Rc<[u8]>),
    Sexp { tag: Tag, n_args: usize },
    Sti,
    Sta,
    Jmp(L),
    End,
    Ret,
    Drop,
    Dup,
    Swap,
    Elem,
    Ld(Location),
    Lda(Location),
    St(Location),
    CJmp { on_nonzero: bool, target: L },
    Begin { n_args: usize, n_locals: usize },
    Call { target: L, n_args: usize },
    Tag { tag: Tag, n_fields: usize },
    Array(usize),
    Fail { line: i32, col: i32 },
    Line(u32),
    Runtime(RuntimeCall),
}

/// Instruction as decoded, targets still byte offsets
pub type RawInstruction = Instr<Label>;

/// Instruction with targets resolved to instruction indices
pub type Instruction = Instr<Ip>;

impl<L> Instr<L> {
    /// Rewrites every jump target, leaving other instructions as they are
    pub fn map_target<M, E>(self, mut f: impl FnMut(L) -> Result<M, E>) -> Result<Instr<M>, E> {
        Ok(match self {
            Instr::Jmp(t) => Instr::Jmp(f(t)?),
            Instr::CJmp { on_nonzero, target } => Instr::CJmp {
                on_nonzero,
                target: f(target)?,
            },
            Instr::Call { target, n_args } => Instr::Call {
                target: f(target)?,
                n_args,
            },

            Instr::Binop(op) => Instr::Binop(op),
            Instr::Const(w) => Instr::Const(w),
            Instr::String(s) => Instr::String(s),
            Instr::Sexp { tag, n_args } => Instr::Sexp { tag, n_args },
            Instr::Sti => Instr::Sti,
            Instr::Sta => Instr::Sta,
            Instr::End => Instr::End,
            Instr::Ret => Instr::Ret,
            Instr::Drop => Instr::Drop,
            Instr::Dup => Instr::Dup,
            Instr::Swap => Instr::Swap,
            Instr::Elem => Instr::Elem,
            Instr::Ld(loc) => Instr::Ld(loc),
            Instr::Lda(loc) => Instr::Lda(loc),
            Instr::St(loc) => Instr::St(loc),
            Instr::Begin { n_args, n_locals } => Instr::Begin { n_args, n_locals },
            Instr::Tag { tag, n_fields } => Instr::Tag { tag, n_fields },
            Instr::Array(n) => Instr::Array(n),
            Instr::Fail { line, col } => Instr::Fail { line, col },
            Instr::Line(n) => Instr::Line(n),
            Instr::Runtime(rt) => Instr::Runtime(rt),
        })
    }

    /// Jump or call target, if any
    pub fn target(&self) -> Option<&L> {
        match self {
            Instr::Jmp(t) | Instr::CJmp { target: t, .. } | Instr::Call { target: t, .. } => {
                Some(t)
            }
            _ => None,
        }
    }

    /// Kind name, independent of operands
    pub fn name(&self) -> &'static str {
        match self {
            Instr::Binop(_) => "Binop",
            Instr::Const(_) => "Const",
            Instr::String(_) => "String",
            Instr::Sexp { .. } => "Sexp",
            Instr::Sti => "Sti",
            Instr::Sta => "Sta",
            Instr::Jmp(_) => "Jmp",
            Instr::End => "End",
            Instr::Ret => "Ret",
            Instr::Drop => "Drop",
            Instr::Dup => "Dup",
            Instr::Swap => "Swap",
            Instr::Elem => "Elem",
            Instr::Ld(_) => "Ld",
            Instr::Lda(_) => "Lda",
            Instr::St(_) => "St",
            Instr::CJmp { .. } => "CJmp",
            Instr::Begin { .. } => "Begin",
            Instr::Call { .. } => "Call",
            Instr::Tag { .. } => "Tag",
            Instr::Array(_) => "Array",
            Instr::Fail { .. } => "Fail",
            Instr::Line(_) => "Line",
            Instr::Runtime(_) => "RuntimeCall",
        }
    }

    /// Whether the encoding carries an immediate operand
    pub fn has_operand(&self) -> bool {
        match self {
            Instr::Sti
            | Instr::Sta
            | Instr::End
            | Instr::Ret
            | Instr::Drop
            | Instr::Dup
            | Instr::Swap
            | Instr::Elem
            | Instr::Binop(_) => false,
            Instr::Runtime(rt) => matches!(rt, RuntimeCall::Array(_)),
            _ => true,
        }
    }

    /// Values popped and pushed, for instructions whose effect on the
    /// operand stack does not depend on control flow
    pub fn stack_effect(&self) -> Option<(usize, usize)> {
        Some(match self {
            Instr::Binop(_) => (2, 1),
            Instr::Const(_) | Instr::String(_) => (0, 1),
            Instr::Sexp { n_args, .. } => (*n_args, 1),
            Instr::Sti => (2, 1),
            Instr::Sta => (3, 1),
            Instr::Drop => (1, 0),
            Instr::Dup => (1, 2),
            Instr::Swap => (2, 2),
            Instr::Elem => (2, 1),
            Instr::Ld(_) | Instr::Lda(_) => (0, 1),
            Instr::St(_) => (1, 1),
            Instr::Tag { .. } => (1, 1),
            Instr::Array(n) => (*n, 1),
            Instr::Line(_) => (0, 0),
            Instr::Runtime(RuntimeCall::Read) => (0, 1),
            Instr::Runtime(RuntimeCall::Array(n)) => (*n, 1),
            Instr::Runtime(_) => (1, 1),
            Instr::Jmp(_)
            | Instr::CJmp { .. }
            | Instr::End
            | Instr::Ret
            | Instr::Begin { .. }
            | Instr::Call { .. }
            | Instr::Fail { .. } => return None,
        })
    }
}

impl<L: fmt::Display> fmt::Display for Instr<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instr::Binop(op) => write!(f, "BINOP {}", op.symbol()),
            Instr::Const(w) => write!(f, "CONST {}", w),
            Instr::String(s) => write!(f, "STRING {:?}", String::from_utf8_lossy(s)),
            Instr::Sexp { tag, n_args } => write!(f, "SEXP {} {}", tag.name, n_args),
            Instr::Sti => write!(f, "STI"),
            Instr::Sta => write!(f, "STA"),
            Instr::Jmp(t) => write!(f, "JMP @{}", t),
            Instr::End => write!(f, "END"),
            Instr::Ret => write!(f, "RET"),
            Instr::Drop => write!(f, "DROP"),
            Instr::Dup => write!(f, "DUP"),
            Instr::Swap => write!(f, "SWAP"),
            Instr::Elem => write!(f, "ELEM"),
            Instr::Ld(loc) => write!(f, "LD {}", loc),
            Instr::Lda(loc) => write!(f, "LDA {}", loc),
            Instr::St(loc) => write!(f, "ST {}", loc),
            Instr::CJmp { on_nonzero, target } => {
                write!(f, "CJMP{} @{}", if *on_nonzero { "nz" } else { "z" }, target)
            }
            Instr::Begin { n_args, n_locals } => write!(f, "BEGIN {} {}", n_args, n_locals),
            Instr::Call { target, n_args } => write!(f, "CALL @{} {}", target, n_args),
            Instr::Tag { tag, n_fields } => write!(f, "TAG {} {}", tag.name, n_fields),
            Instr::Array(n) => write!(f, "ARRAY {}", n),
            Instr::Fail { line, col } => write!(f, "FAIL {} {}", line, col),
            Instr::Line(n) => write!(f, "LINE {}", n),
            Instr::Runtime(RuntimeCall::Read) => write!(f, "CALL Lread"),
            Instr::Runtime(RuntimeCall::Write) => write!(f, "CALL Lwrite"),
            Instr::Runtime(RuntimeCall::Length) => write!(f, "CALL Llength"),
            Instr::Runtime(RuntimeCall::Stringify) => write!(f, "CALL Lstring"),
            Instr::Runtime(RuntimeCall::Array(n)) => write!(f, "CALL Barray {}", n),
        }
    }
}
