// KEEL, a bytecode virtual machine.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// KEEL is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/vm/bytefile.rs

// Program images. The decoder and interpreter only see the
// `ProgramImage` trait; `ByteFile` implements it for compiled files.

// <>

use std::fs;
use std::path::Path;

use log::info;

use super::error::LoadError;

/// A loaded compiled unit
pub trait ProgramImage {
    /// Executable code, starting at offset zero
    fn code(&self) -> &[u8];

    /// NUL-terminated string table entry beginning at `offset`
    fn string_at(&self, offset: usize) -> Option<&[u8]>;

    /// Size of the global area in words
    fn global_area_size(&self) -> usize;

    /// Exported names and their code offsets
    fn public_symbols(&self) -> Vec<PublicSymbol<'_>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicSymbol<'a> {
    pub name: &'a [u8],
    pub offset: usize,
}

/// Contents of a compiled bytecode file
///
/// Layout, all integers little-endian `i32`:
/// - string table size, global area size, public symbol count
/// - (name offset, code offset) for each public symbol
/// - the string table
/// - code, to the end of the file
#[derive(Debug, Clone)]
pub struct ByteFile {
    strings: Vec<u8>,
    publics: Vec<(usize, usize)>,
    globals: usize,
    code: Vec<u8>,
}

const HEADER_LEN: usize = 12;

fn read_i32(bytes: &[u8], at: usize) -> i32 {
    i32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn non_negative(field: &'static str, value: i32) -> Result<usize, LoadError> {
    if value < 0 {
        Err(LoadError::Negative { field, value })
    } else {
        Ok(value as usize)
    }
}

fn need(section: &'static str, need: usize, have: usize) -> Result<(), LoadError> {
    if need > have {
        Err(LoadError::Truncated {
            section,
            need,
            have,
        })
    } else {
        Ok(())
    }
}

fn entry_at(strings: &[u8], offset: usize) -> Option<&[u8]> {
    let tail = strings.get(offset..)?;
    let end = tail.iter().position(|&b| b == 0)?;
    Some(&tail[..end])
}

impl ByteFile {
    /// Assembles an image from its parts
    pub fn new(strings: Vec<u8>, globals: usize, publics: Vec<(usize, usize)>, code: Vec<u8>) -> Self {
        Self {
            strings,
            publics,
            globals,
            code,
        }
    }

    /// Reads and parses a compiled file
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let file = Self::parse(&bytes)?;
        info!(
            "loaded {}: {} code bytes, {} string bytes, {} globals, {} publics",
            path.display(),
            file.code.len(),
            file.strings.len(),
            file.globals,
            file.publics.len()
        );

        Ok(file)
    }

    /// Parses the raw contents of a compiled file
    pub fn parse(bytes: &[u8]) -> Result<Self, LoadError> {
        need("header", HEADER_LEN, bytes.len())?;

        let strings_len = non_negative("string table size", read_i32(bytes, 0))?;
        let globals = non_negative("global area size", read_i32(bytes, 4))?;
        let n_publics = non_negative("public symbol count", read_i32(bytes, 8))?;

        let publics_end = HEADER_LEN + n_publics * 8;
        need("public symbol table", publics_end, bytes.len())?;

        let strings_end = publics_end + strings_len;
        need("string table", strings_end, bytes.len())?;
        let strings = bytes[publics_end..strings_end].to_vec();

        let mut publics = Vec::with_capacity(n_publics);
        for i in 0..n_publics {
            let at = HEADER_LEN + i * 8;
            let name = non_negative("public symbol name", read_i32(bytes, at))?;
            let offset = non_negative("public symbol offset", read_i32(bytes, at + 4))?;

            if entry_at(&strings, name).is_none() {
                return Err(LoadError::BadSymbol {
                    index: i,
                    offset: name,
                });
            }

            publics.push((name, offset));
        }

        Ok(Self {
            strings,
            publics,
            globals,
            code: bytes[strings_end..].to_vec(),
        })
    }

    /// Serialises the image back to the file layout
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            HEADER_LEN + self.publics.len() * 8 + self.strings.len() + self.code.len(),
        );

        out.extend_from_slice(&(self.strings.len() as i32).to_le_bytes());
        out.extend_from_slice(&(self.globals as i32).to_le_bytes());
        out.extend_from_slice(&(self.publics.len() as i32).to_le_bytes());
        for &(name, offset) in &self.publics {
            out.extend_from_slice(&(name as i32).to_le_bytes());
            out.extend_from_slice(&(offset as i32).to_le_bytes());
        }
        out.extend_from_slice(&self.strings);
        out.extend_from_slice(&self.code);

        out
    }
}

impl ProgramImage for ByteFile {
    fn code(&self) -> &[u8] {
        &self.code
    }

    fn string_at(&self, offset: usize) -> Option<&[u8]> {
        entry_at(&self.strings, offset)
    }

    fn global_area_size(&self) -> usize {
        self.globals
    }

    fn public_symbols(&self) -> Vec<PublicSymbol<'_>> {
        self.publics
            .iter()
            .filter_map(|&(name, offset)| {
                Some(PublicSymbol {
                    name: entry_at(&self.strings, name)?,
                    offset,
                })
            })
            .collect()
    }
}
