// KEEL, a bytecode virtual machine.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// KEEL is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/vm/error.rs

// Error taxonomy for loading, decoding and running bytecode.

// <>

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use super::symtab::TagError;

/// Failure to build a program image from raw file contents
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("cannot read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("truncated {section}: need {need} bytes, have {have}")]
    Truncated {
        section: &'static str,
        need: usize,
        have: usize,
    },

    #[error("negative {field} in header: {value}")]
    Negative { field: &'static str, value: i32 },

    #[error("public symbol {index} names string offset {offset}, which does not resolve")]
    BadSymbol { index: usize, offset: usize },
}

/// Malformed program; decoding stops at the first one
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("operand of instruction at {offset:#x} runs past the end of code")]
    Truncated { offset: usize },

    #[error("code ends without a terminator")]
    MissingTerminator,

    #[error("unknown opcode {byte:#04x} at {offset:#x}")]
    UnknownOpcode { offset: usize, byte: u8 },

    #[error("unsupported instruction {name} at {offset:#x}")]
    Unsupported { offset: usize, name: &'static str },

    #[error("string offset {pos} of instruction at {offset:#x} does not resolve")]
    BadString { offset: usize, pos: i32 },

    #[error("constructor tag of instruction at {offset:#x}: {source}")]
    BadTag {
        offset: usize,
        #[source]
        source: TagError,
    },

    #[error("negative {what} {value} at {offset:#x}")]
    NegativeSize {
        offset: usize,
        what: &'static str,
        value: i32,
    },

    #[error("instruction at {offset:#x} targets {label:#x}, which starts no instruction")]
    UnresolvedLabel { offset: usize, label: u32 },
}

/// Violated runtime invariant; aborts the run
#[derive(Debug, Error)]
pub enum Fault {
    #[error("operand stack underflow")]
    StackUnderflow,

    #[error("{kind} index {index} out of range (size {len})")]
    SlotOutOfRange {
        kind: &'static str,
        index: usize,
        len: usize,
    },

    #[error("no active frame")]
    NoFrame,

    #[error("constants have no address")]
    ConstAddress,

    #[error("division by zero")]
    DivisionByZero,

    #[error("expected an integer, found {found}")]
    NotAnInteger { found: &'static str },

    #[error("expected a reference, found an integer")]
    NotAReference,

    #[error("expected {expected}, found {found}")]
    WrongKind {
        expected: &'static str,
        found: &'static str,
    },

    #[error("index {index} out of bounds (length {len})")]
    IndexOutOfBounds { index: i32, len: usize },

    #[error("reference into a frame that has already ended")]
    DanglingSlot,

    #[error("reference to an object that does not exist")]
    DanglingObject,

    #[error("call passes {passed} arguments to a function taking {declared}")]
    ArityMismatch { passed: usize, declared: usize },

    #[error("match failure at {line}:{col}, value '{value}'")]
    MatchFailure { line: i32, col: i32, value: String },

    #[error("console: {0}")]
    Console(#[from] io::Error),

    #[error("console input {0:?} is not an integer")]
    BadInput(String),
}

/// Runtime fault located at the instruction that raised it
#[derive(Debug, Error)]
#[error("{kind} at {ip}{}: {fault}", at_line(.line))]
pub struct RunError {
    pub ip: usize,
    pub kind: &'static str,
    pub line: Option<u32>,
    #[source]
    pub fault: Fault,
}

fn at_line(line: &Option<u32>) -> String {
    match line {
        Some(l) => format!(" (line {})", l),
        None => String::new(),
    }
}

/// Anything that can stop a program from loading or completing
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Run(#[from] RunError),
}
