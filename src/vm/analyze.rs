// KEEL, a bytecode virtual machine.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// KEEL is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/vm/analyze.rs

// Static instruction frequencies, for profiling compiled programs.

// <>

use std::collections::BTreeMap;
use std::fmt::{self, Write};

use super::instr::Instr;

/// What counts as the same instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grouping {
    /// Instruction kind alone
    Kind,
    /// Kind together with its operands, as disassembled
    Text,
}

/// Counts instructions, most frequent first; ties sort by name
pub fn frequencies<L: fmt::Display>(code: &[Instr<L>], grouping: Grouping) -> Vec<(String, usize)> {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for instr in code {
        let key = match grouping {
            Grouping::Kind => instr.name().to_string(),
            Grouping::Text => instr.to_string(),
        };
        *counts.entry(key).or_insert(0) += 1;
    }

    let mut out: Vec<_> = counts.into_iter().collect();
    // stable, so equal counts keep the map's name order
    out.sort_by(|a, b| b.1.cmp(&a.1));
    out
}

/// One `name\t: count` line per entry
pub fn report(freqs: &[(String, usize)]) -> String {
    let mut out = String::new();
    for (name, count) in freqs {
        // writing to a String cannot fail
        let _ = writeln!(out, "{}\t: {}", name, count);
    }
    out
}
