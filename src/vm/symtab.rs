// KEEL, a bytecode virtual machine.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// KEEL is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/vm/symtab.rs

// A table to associate constructor names with the integer tags that
// s-expressions carry at runtime.

// <>

use std::collections::HashMap;
use std::rc::Rc;

use log::trace;
use thiserror::Error;

/// Characters permitted in a constructor name, in hash order
const TAG_CHARS: &[u8; 64] = b"_abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789'";

/// Only this many leading characters contribute to a hash
pub const TAG_HASH_LEN: usize = 5;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TagError {
    #[error("empty constructor name")]
    Empty,

    #[error("character {0:?} not allowed in constructor name")]
    BadChar(char),

    #[error("constructor {0} has the same hash as {1}")]
    Collision(String, String),
}

/// Hashes a constructor name into a tag
///
/// Each of the first `TAG_HASH_LEN` characters contributes its
/// position in `TAG_CHARS`, six bits at a time. The remaining
/// characters are checked but not hashed.
pub fn hash_tag(name: &str) -> Result<i32, TagError> {
    if name.is_empty() {
        return Err(TagError::Empty);
    }

    let mut h = 0i32;
    for (i, c) in name.bytes().enumerate() {
        let pos = match TAG_CHARS.iter().position(|&t| t == c) {
            Some(pos) => pos,
            None => return Err(TagError::BadChar(c as char)),
        };
        if i < TAG_HASH_LEN {
            h = (h << 6) | pos as i32;
        }
    }

    Ok(h)
}

/// Recovers the hashed prefix of a constructor name from its tag
pub fn unhash_tag(mut h: i32) -> String {
    let mut out = vec![];
    while h != 0 {
        out.push(TAG_CHARS[(h & 0x3F) as usize]);
        h >>= 6;
    }
    out.reverse();
    // TAG_CHARS is pure ASCII
    out.into_iter().map(char::from).collect()
}

/// A constructor as it appears in decoded instructions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub name: Rc<str>,
    pub hash: i32,
}

/// Interned constructor names, keyed by hash
#[derive(Debug, Default)]
pub struct TagTable {
    by_hash: HashMap<i32, Rc<str>>,
}

impl TagTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the tag for a name, interning it on first sight
    ///
    /// Two distinct names that hash alike cannot both be told apart at
    /// runtime, so the second one is refused.
    pub fn intern(&mut self, name: &str) -> Result<Tag, TagError> {
        let hash = hash_tag(name)?;

        if let Some(known) = self.by_hash.get(&hash) {
            if &**known != name {
                return Err(TagError::Collision(name.to_string(), known.to_string()));
            }
            return Ok(Tag {
                name: known.clone(),
                hash,
            });
        }

        trace!("tag {} = {:#x}", name, hash);
        let name: Rc<str> = Rc::from(name);
        self.by_hash.insert(hash, name.clone());

        Ok(Tag { name, hash })
    }

    /// Looks up the constructor name for a tag
    pub fn name(&self, hash: i32) -> Option<&str> {
        self.by_hash.get(&hash).map(|n| &**n)
    }

    /// Name for display; falls back to the hashed prefix
    pub fn display_name(&self, hash: i32) -> String {
        match self.name(hash) {
            Some(n) => n.to_string(),
            None => unhash_tag(hash),
        }
    }

    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }
}
