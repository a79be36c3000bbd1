// KEEL, a bytecode virtual machine.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// KEEL is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/vm/word.rs

// The universal machine value. A word is either an unboxed integer
// or a boxed reference, and the two are never confused: every
// conversion out of a word checks which one it holds.

// <>

use std::fmt;

use super::error::Fault;

/// Width of an unboxed integer; one bit of a machine word is the tag
pub const INT_BITS: u32 = 31;

/// Handle to an object owned by the heap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(pub(crate) u32);

impl ObjRef {
    #[inline(always)]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Address of a storage slot, as produced by `Lda`
///
/// Frame-relative slots carry the serial number of the frame they
/// point into, so a slot outliving its frame is detected on use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotRef {
    Global(usize),
    Local { frame: u64, index: usize },
    Arg { frame: u64, index: usize },
}

/// Anything a boxed word may point at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ref {
    Obj(ObjRef),
    Slot(SlotRef),
}

/// Tagged machine word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Word {
    Unboxed(i32),
    Boxed(Ref),
}

impl Word {
    /// Boxes an integer, keeping only the low `INT_BITS` bits
    #[inline(always)]
    pub const fn int(n: i32) -> Word {
        const SHIFT: u32 = i32::BITS - INT_BITS;
        Word::Unboxed((n << SHIFT) >> SHIFT)
    }

    #[inline(always)]
    pub const fn from_bool(b: bool) -> Word {
        Word::Unboxed(b as i32)
    }

    #[inline(always)]
    pub const fn obj(r: ObjRef) -> Word {
        Word::Boxed(Ref::Obj(r))
    }

    #[inline(always)]
    pub const fn slot(s: SlotRef) -> Word {
        Word::Boxed(Ref::Slot(s))
    }

    /// Low tag bit of the word in its packed form
    #[inline(always)]
    pub fn is_unboxed(self) -> bool {
        matches!(self, Word::Unboxed(_))
    }

    /// Integer value of an unboxed word
    pub fn as_int(self) -> Result<i32, Fault> {
        match self {
            Word::Unboxed(n) => Ok(n),
            Word::Boxed(r) => Err(Fault::NotAnInteger {
                found: r.kind_name(),
            }),
        }
    }

    /// Heap handle of a boxed word
    pub fn as_obj(self) -> Result<ObjRef, Fault> {
        match self {
            Word::Boxed(Ref::Obj(r)) => Ok(r),
            Word::Boxed(Ref::Slot(_)) => Err(Fault::WrongKind {
                expected: "heap object",
                found: "slot address",
            }),
            Word::Unboxed(_) => Err(Fault::NotAReference),
        }
    }

    /// Slot address of a boxed word
    pub fn as_slot(self) -> Result<SlotRef, Fault> {
        match self {
            Word::Boxed(Ref::Slot(s)) => Ok(s),
            Word::Boxed(Ref::Obj(_)) => Err(Fault::WrongKind {
                expected: "slot address",
                found: "heap object",
            }),
            Word::Unboxed(_) => Err(Fault::NotAReference),
        }
    }

    /// Truth value used by conditional jumps
    pub fn truthy(self) -> Result<bool, Fault> {
        Ok(self.as_int()? != 0)
    }
}

impl Ref {
    fn kind_name(self) -> &'static str {
        match self {
            Ref::Obj(_) => "heap object",
            Ref::Slot(_) => "slot address",
        }
    }
}

/// Uninitialised slots and globals hold integer zero
impl Default for Word {
    fn default() -> Self {
        Word::Unboxed(0)
    }
}

impl fmt::Display for Word {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Word::Unboxed(n) => write!(f, "{}", n),
            Word::Boxed(Ref::Obj(r)) => write!(f, "<obj {}>", r.0),
            Word::Boxed(Ref::Slot(SlotRef::Global(i))) => write!(f, "<&G({})>", i),
            Word::Boxed(Ref::Slot(SlotRef::Local { index, .. })) => write!(f, "<&L({})>", index),
            Word::Boxed(Ref::Slot(SlotRef::Arg { index, .. })) => write!(f, "<&A({})>", index),
        }
    }
}
