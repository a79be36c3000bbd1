// KEEL, a bytecode virtual machine.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// KEEL is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/vm/memmgt.rs

// Memory management for KEEL. Owns every heap object a program
// creates (strings, arrays and s-expressions) and provides the
// primitive operations the interpreter performs on them. Objects are
// only reached through handles, and every access is bounds checked.

// <>

use log::debug;

use super::error::Fault;
use super::word::{ObjRef, Word};

/// A heap object
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Object {
    String(Vec<u8>),
    Array(Vec<Word>),
    /// Tagged tuple; the tag occupies no field
    Sexp { tag: i32, fields: Vec<Word> },
}

impl Object {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Object::String(_) => "string",
            Object::Array(_) => "array",
            Object::Sexp { .. } => "s-expression",
        }
    }

    /// Number of elements (bytes for strings)
    pub fn len(&self) -> usize {
        match self {
            Object::String(s) => s.len(),
            Object::Array(a) => a.len(),
            Object::Sexp { fields, .. } => fields.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Arena holding all objects for one run
///
/// Nothing is reclaimed before the heap itself is dropped.
#[derive(Debug, Default)]
pub struct Heap {
    objects: Vec<Object>,
}

fn checked_index(index: i32, len: usize) -> Result<usize, Fault> {
    if index < 0 || index as usize >= len {
        Err(Fault::IndexOutOfBounds { index, len })
    } else {
        Ok(index as usize)
    }
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of objects allocated so far
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    fn alloc(&mut self, obj: Object) -> ObjRef {
        let r = ObjRef(self.objects.len() as u32);

        if cfg!(feature = "memdbg") {
            debug!("alloc {} #{} len {}", obj.kind_name(), r.0, obj.len());
        }

        self.objects.push(obj);
        r
    }

    pub fn get(&self, r: ObjRef) -> Result<&Object, Fault> {
        self.objects.get(r.index()).ok_or(Fault::DanglingObject)
    }

    fn get_mut(&mut self, r: ObjRef) -> Result<&mut Object, Fault> {
        self.objects.get_mut(r.index()).ok_or(Fault::DanglingObject)
    }

    /// Creates a string holding a copy of `bytes`
    pub fn make_string(&mut self, bytes: &[u8]) -> ObjRef {
        self.alloc(Object::String(bytes.to_vec()))
    }

    /// Creates an array of `len` integer zeros
    pub fn make_array(&mut self, len: usize) -> ObjRef {
        self.alloc(Object::Array(vec![Word::default(); len]))
    }

    /// Creates an s-expression with `n_fields` fields, all integer zero
    pub fn make_sexp(&mut self, tag: i32, n_fields: usize) -> ObjRef {
        self.alloc(Object::Sexp {
            tag,
            fields: vec![Word::default(); n_fields],
        })
    }

    /// Reads element `index`; characters of a string come back as integers
    pub fn elem(&self, r: ObjRef, index: i32) -> Result<Word, Fault> {
        match self.get(r)? {
            Object::String(s) => {
                let i = checked_index(index, s.len())?;
                Ok(Word::int(s[i] as i32))
            }
            Object::Array(a) => Ok(a[checked_index(index, a.len())?]),
            Object::Sexp { fields, .. } => Ok(fields[checked_index(index, fields.len())?]),
        }
    }

    /// Writes `value` at `index`, returning the stored value
    ///
    /// Strings only accept integers, truncated to a byte.
    pub fn sta(&mut self, value: Word, index: i32, r: ObjRef) -> Result<Word, Fault> {
        match self.get_mut(r)? {
            Object::String(s) => {
                let i = checked_index(index, s.len())?;
                s[i] = value.as_int()? as u8;
            }
            Object::Array(a) => {
                let i = checked_index(index, a.len())?;
                a[i] = value;
            }
            Object::Sexp { fields, .. } => {
                let i = checked_index(index, fields.len())?;
                fields[i] = value;
            }
        }
        Ok(value)
    }

    pub fn length(&self, r: ObjRef) -> Result<usize, Fault> {
        Ok(self.get(r)?.len())
    }

    /// Whether `word` is an s-expression with this tag and field count
    ///
    /// Anything that is not an s-expression simply fails the check.
    pub fn tag_check(&self, word: Word, tag: i32, n_fields: usize) -> bool {
        match word.as_obj().ok().and_then(|r| self.objects.get(r.index())) {
            Some(Object::Sexp { tag: t, fields }) => *t == tag && fields.len() == n_fields,
            _ => false,
        }
    }
}
