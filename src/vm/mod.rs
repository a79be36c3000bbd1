// KEEL, a bytecode virtual machine.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// KEEL is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/vm/mod.rs

// The KEEL virtual machine. A compiled file is loaded into a program
// image, decoded into resolved instructions and then interpreted.

// <>

use std::fmt::Write as _;
use std::path::Path;

pub mod analyze;
pub mod bytefile;
pub mod decode;
pub mod error;
pub mod eval;
pub mod instr;
pub mod memmgt;
pub mod stdenv;
pub mod symtab;
pub mod word;

#[cfg(test)]
mod asm;

pub use analyze::Grouping;
pub use bytefile::{ByteFile, ProgramImage, PublicSymbol};
pub use decode::{decode, ByteCode};
pub use error::{DecodeError, Error, Fault, LoadError, RunError};
pub use eval::{Machine, Outcome};
pub use instr::{Instr, Instruction, Location, RawInstruction};
pub use stdenv::{Console, Scripted, StdConsole};
pub use word::Word;

/// Loads, decodes and runs a compiled file against a console
pub fn run_image<I: ProgramImage, C: Console>(image: &I, console: C) -> Result<Outcome, Error> {
    let code = decode(image)?;
    let mut machine = Machine::new(&code, image.global_area_size(), console);
    Ok(machine.run()?)
}

/// Runs a compiled file on the standard streams
pub fn run_file<P: AsRef<Path>>(path: P) -> Result<Outcome, Error> {
    let file = ByteFile::read(path)?;
    run_image(&file, StdConsole::stdio())
}

/// Instruction frequency report for a compiled file
pub fn analyze_file<P: AsRef<Path>>(path: P, grouping: Grouping) -> Result<String, Error> {
    let file = ByteFile::read(path)?;
    let code = decode(&file)?;
    Ok(analyze::report(&analyze::frequencies(
        code.instructions(),
        grouping,
    )))
}

/// Listing of an image's resolved code, public symbols marked
pub fn disassemble<I: ProgramImage>(image: &I) -> Result<String, Error> {
    let code = decode(image)?;
    let publics = image.public_symbols();

    let mut out = String::new();
    for (ip, instr) in code.instructions().iter().enumerate() {
        let offset = code.offset_of(ip).unwrap_or_default();
        for sym in publics.iter().filter(|s| s.offset == offset) {
            let _ = writeln!(out, "{}:", String::from_utf8_lossy(sym.name));
        }
        let _ = writeln!(out, "{:>6} {:#010x}  {}", ip, offset, instr);
    }

    Ok(out)
}

pub fn disassemble_file<P: AsRef<Path>>(path: P) -> Result<String, Error> {
    disassemble(&ByteFile::read(path)?)
}
