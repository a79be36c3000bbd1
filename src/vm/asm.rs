// KEEL, a bytecode virtual machine.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// KEEL is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/vm/asm.rs

// Small assembler for writing bytecode images by mnemonic in tests.

// <>

use std::collections::HashMap;

use super::bytefile::ByteFile;
use super::instr::{Family, Location, Operator};

#[derive(Debug, Default)]
pub struct Asm {
    code: Vec<u8>,
    strings: Vec<u8>,
    interned: HashMap<String, usize>,
    labels: HashMap<String, usize>,
    fixups: Vec<(usize, String)>,
    globals: usize,
    publics: Vec<(usize, usize)>,
}

impl Asm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn globals(&mut self, n: usize) -> &mut Self {
        self.globals = n;
        self
    }

    /// Names the offset of the next instruction
    pub fn label(&mut self, name: &str) -> &mut Self {
        self.labels.insert(name.to_string(), self.code.len());
        self
    }

    /// Exports the offset of the next instruction
    pub fn public(&mut self, name: &str) -> &mut Self {
        let at = self.intern(name);
        self.publics.push((at, self.code.len()));
        self
    }

    fn intern(&mut self, s: &str) -> usize {
        if let Some(&at) = self.interned.get(s) {
            return at;
        }
        let at = self.strings.len();
        self.strings.extend_from_slice(s.as_bytes());
        self.strings.push(0);
        self.interned.insert(s.to_string(), at);
        at
    }

    fn op(&mut self, family: Family, variant: u8) -> &mut Self {
        self.code.push(((family as u8) << 4) | variant);
        self
    }

    fn int(&mut self, n: i32) -> &mut Self {
        self.code.extend_from_slice(&n.to_le_bytes());
        self
    }

    fn str_operand(&mut self, s: &str) -> &mut Self {
        let at = self.intern(s);
        self.int(at as i32)
    }

    fn target(&mut self, label: &str) -> &mut Self {
        self.fixups.push((self.code.len(), label.to_string()));
        self.int(0)
    }

    fn loc(&mut self, family: Family, loc: Location) -> &mut Self {
        match loc {
            Location::Global(i) => self.op(family, 0).int(i as i32),
            Location::Local(i) => self.op(family, 1).int(i as i32),
            Location::Arg(i) => self.op(family, 2).int(i as i32),
            Location::Const(w) => self.op(family, 3).int(w.as_int().unwrap()),
        }
    }

    pub fn binop(&mut self, op: Operator) -> &mut Self {
        self.op(Family::Binop, op as u8)
    }

    pub fn konst(&mut self, n: i32) -> &mut Self {
        self.op(Family::Misc, 0).int(n)
    }

    pub fn string(&mut self, s: &str) -> &mut Self {
        self.op(Family::Misc, 1).str_operand(s)
    }

    pub fn sexp(&mut self, tag: &str, n: i32) -> &mut Self {
        self.op(Family::Misc, 2).str_operand(tag).int(n)
    }

    pub fn sti(&mut self) -> &mut Self {
        self.op(Family::Misc, 3)
    }

    pub fn sta(&mut self) -> &mut Self {
        self.op(Family::Misc, 4)
    }

    pub fn jmp(&mut self, label: &str) -> &mut Self {
        self.op(Family::Misc, 5).target(label)
    }

    pub fn end(&mut self) -> &mut Self {
        self.op(Family::Misc, 6)
    }

    pub fn ret(&mut self) -> &mut Self {
        self.op(Family::Misc, 7)
    }

    pub fn drop(&mut self) -> &mut Self {
        self.op(Family::Misc, 8)
    }

    pub fn dup(&mut self) -> &mut Self {
        self.op(Family::Misc, 9)
    }

    pub fn swap(&mut self) -> &mut Self {
        self.op(Family::Misc, 10)
    }

    pub fn elem(&mut self) -> &mut Self {
        self.op(Family::Misc, 11)
    }

    pub fn ld(&mut self, loc: Location) -> &mut Self {
        self.loc(Family::Ld, loc)
    }

    pub fn lda(&mut self, loc: Location) -> &mut Self {
        self.loc(Family::Lda, loc)
    }

    pub fn st(&mut self, loc: Location) -> &mut Self {
        self.loc(Family::St, loc)
    }

    pub fn cjmpz(&mut self, label: &str) -> &mut Self {
        self.op(Family::Ctrl, 0).target(label)
    }

    pub fn cjmpnz(&mut self, label: &str) -> &mut Self {
        self.op(Family::Ctrl, 1).target(label)
    }

    pub fn begin(&mut self, n_args: i32, n_locals: i32) -> &mut Self {
        self.op(Family::Ctrl, 2).int(n_args).int(n_locals)
    }

    pub fn call(&mut self, label: &str, n_args: i32) -> &mut Self {
        self.op(Family::Ctrl, 6).target(label).int(n_args)
    }

    pub fn tag(&mut self, name: &str, n: i32) -> &mut Self {
        self.op(Family::Ctrl, 7).str_operand(name).int(n)
    }

    pub fn array(&mut self, n: i32) -> &mut Self {
        self.op(Family::Ctrl, 8).int(n)
    }

    pub fn fail(&mut self, line: i32, col: i32) -> &mut Self {
        self.op(Family::Ctrl, 9).int(line).int(col)
    }

    pub fn line(&mut self, n: i32) -> &mut Self {
        self.op(Family::Ctrl, 10).int(n)
    }

    pub fn read(&mut self) -> &mut Self {
        self.op(Family::Builtin, 0)
    }

    pub fn write(&mut self) -> &mut Self {
        self.op(Family::Builtin, 1)
    }

    pub fn length(&mut self) -> &mut Self {
        self.op(Family::Builtin, 2)
    }

    pub fn stringify(&mut self) -> &mut Self {
        self.op(Family::Builtin, 3)
    }

    pub fn barray(&mut self, n: i32) -> &mut Self {
        self.op(Family::Builtin, 4).int(n)
    }

    /// Patches every target, appends the terminator and builds the image
    pub fn finish(&mut self) -> ByteFile {
        let mut code = self.code.clone();
        for (at, label) in &self.fixups {
            let target = self.labels[label] as i32;
            code[*at..*at + 4].copy_from_slice(&target.to_le_bytes());
        }
        code.push(0xFF);

        ByteFile::new(self.strings.clone(), self.globals, self.publics.clone(), code)
    }
}
