// KEEL, a bytecode virtual machine.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// KEEL is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/vm/decode.rs

// Turns the code bytes of a program image into resolved instructions.
// The first pass decodes every instruction with its jump targets left
// as byte offsets and notes where each instruction began; the second
// rewrites those offsets as instruction indices.

// <>

use std::collections::HashMap;
use std::rc::Rc;

use log::debug;

use super::bytefile::ProgramImage;
use super::error::DecodeError;
use super::instr::{
    Family, Instr, Instruction, Ip, Label, Location, Operator, RawInstruction, RuntimeCall,
};
use super::symtab::{Tag, TagTable};
use super::word::Word;

/// A fully decoded and resolved program
#[derive(Debug)]
pub struct ByteCode {
    instrs: Vec<Instruction>,
    offsets: Vec<usize>,
    tags: TagTable,
}

impl ByteCode {
    pub fn instructions(&self) -> &[Instruction] {
        &self.instrs
    }

    pub fn get(&self, ip: Ip) -> Option<&Instruction> {
        self.instrs.get(ip)
    }

    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    /// Byte offset the instruction at `ip` was decoded from
    pub fn offset_of(&self, ip: Ip) -> Option<usize> {
        self.offsets.get(ip).copied()
    }

    /// Instruction beginning at a byte offset, if one does
    pub fn ip_of_offset(&self, offset: usize) -> Option<Ip> {
        self.offsets.binary_search(&offset).ok()
    }

    /// Every constructor the code mentions
    pub fn tags(&self) -> &TagTable {
        &self.tags
    }
}

/// Output of the first pass
#[derive(Debug, Clone)]
pub struct RawCode {
    pub instrs: Vec<RawInstruction>,
    /// Starting byte offset of each instruction
    pub offsets: Vec<usize>,
    /// Inverse of `offsets`
    pub index_of: HashMap<usize, Ip>,
}

struct Reader<'a, I: ProgramImage> {
    image: &'a I,
    code: &'a [u8],
    pos: usize,
    /// Offset of the instruction being decoded
    start: usize,
}

impl<'a, I: ProgramImage> Reader<'a, I> {
    fn int(&mut self) -> Result<i32, DecodeError> {
        let bytes = self
            .code
            .get(self.pos..self.pos + 4)
            .ok_or(DecodeError::Truncated { offset: self.start })?;
        self.pos += 4;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn size(&mut self, what: &'static str) -> Result<usize, DecodeError> {
        let value = self.int()?;
        if value < 0 {
            Err(DecodeError::NegativeSize {
                offset: self.start,
                what,
                value,
            })
        } else {
            Ok(value as usize)
        }
    }

    fn label(&mut self) -> Result<Label, DecodeError> {
        // negative offsets wrap far past any code and fail to resolve
        Ok(Label(self.int()? as u32))
    }

    fn string(&mut self) -> Result<&'a [u8], DecodeError> {
        let pos = self.int()?;
        let image: &'a I = self.image;
        usize::try_from(pos)
            .ok()
            .and_then(|p| image.string_at(p))
            .ok_or(DecodeError::BadString {
                offset: self.start,
                pos,
            })
    }

    fn tag(&mut self, tags: &mut TagTable) -> Result<Tag, DecodeError> {
        let name = String::from_utf8_lossy(self.string()?);
        tags.intern(&name).map_err(|source| DecodeError::BadTag {
            offset: self.start,
            source,
        })
    }

    fn location(&mut self, variant: u8) -> Result<Location, DecodeError> {
        Ok(match variant {
            0 => Location::Global(self.size("global index")?),
            1 => Location::Local(self.size("local index")?),
            2 => Location::Arg(self.size("argument index")?),
            3 => Location::Const(Word::int(self.int()?)),
            _ => return self.unknown(),
        })
    }

    fn unknown<T>(&self) -> Result<T, DecodeError> {
        Err(DecodeError::UnknownOpcode {
            offset: self.start,
            byte: self.code[self.start],
        })
    }

    fn unsupported<T>(&self, name: &'static str) -> Result<T, DecodeError> {
        Err(DecodeError::Unsupported {
            offset: self.start,
            name,
        })
    }

    /// Decodes the instruction at the cursor; `None` at the terminator
    fn instruction(&mut self, tags: &mut TagTable) -> Result<Option<RawInstruction>, DecodeError> {
        self.start = self.pos;
        let op = match self.code.get(self.pos) {
            Some(&op) => op,
            None => return Err(DecodeError::MissingTerminator),
        };
        self.pos += 1;

        let (hi, lo) = (op >> 4, op & 0x0F);
        let family = match Family::try_from(hi) {
            Ok(f) => f,
            Err(_) => return self.unknown(),
        };

        let instr = match family {
            Family::Stop => return Ok(None),

            Family::Binop => match Operator::try_from(lo) {
                Ok(op) => Instr::Binop(op),
                Err(_) => return self.unknown(),
            },

            Family::Misc => match lo {
                0 => Instr::Const(Word::int(self.int()?)),
                1 => Instr::String(Rc::from(self.string()?)),
                2 => {
                    let tag = self.tag(tags)?;
                    let n_args = self.size("s-expression size")?;
                    Instr::Sexp { tag, n_args }
                }
                3 => Instr::Sti,
                4 => Instr::Sta,
                5 => Instr::Jmp(self.label()?),
                6 => Instr::End,
                7 => Instr::Ret,
                8 => Instr::Drop,
                9 => Instr::Dup,
                10 => Instr::Swap,
                11 => Instr::Elem,
                _ => return self.unknown(),
            },

            Family::Ld => Instr::Ld(self.location(lo)?),
            Family::Lda => Instr::Lda(self.location(lo)?),
            Family::St => Instr::St(self.location(lo)?),

            Family::Ctrl => match lo {
                0 | 1 => Instr::CJmp {
                    on_nonzero: lo == 1,
                    target: self.label()?,
                },
                2 => {
                    let n_args = self.size("argument count")?;
                    let n_locals = self.size("local count")?;
                    Instr::Begin { n_args, n_locals }
                }
                3 => return self.unsupported("CBegin"),
                4 => return self.unsupported("Closure"),
                5 => return self.unsupported("Callc"),
                6 => {
                    let target = self.label()?;
                    let n_args = self.size("argument count")?;
                    Instr::Call { target, n_args }
                }
                7 => {
                    let tag = self.tag(tags)?;
                    let n_fields = self.size("s-expression size")?;
                    Instr::Tag { tag, n_fields }
                }
                8 => Instr::Array(self.size("array size")?),
                9 => {
                    let line = self.int()?;
                    let col = self.int()?;
                    Instr::Fail { line, col }
                }
                10 => Instr::Line(self.size("line number")? as u32),
                _ => return self.unknown(),
            },

            Family::Patt => return self.unsupported("Patt"),

            Family::Builtin => match lo {
                0 => Instr::Runtime(RuntimeCall::Read),
                1 => Instr::Runtime(RuntimeCall::Write),
                2 => Instr::Runtime(RuntimeCall::Length),
                3 => Instr::Runtime(RuntimeCall::Stringify),
                4 => Instr::Runtime(RuntimeCall::Array(self.size("array size")?)),
                _ => return self.unknown(),
            },
        };

        Ok(Some(instr))
    }
}

/// First pass: decodes up to the terminator without resolving targets
pub fn decode_raw<I: ProgramImage>(image: &I, tags: &mut TagTable) -> Result<RawCode, DecodeError> {
    let mut rd = Reader {
        image,
        code: image.code(),
        pos: 0,
        start: 0,
    };

    let mut instrs = vec![];
    let mut offsets = vec![];
    let mut index_of = HashMap::new();

    while let Some(instr) = rd.instruction(tags)? {
        index_of.insert(rd.start, instrs.len());
        offsets.push(rd.start);
        instrs.push(instr);
    }

    Ok(RawCode {
        instrs,
        offsets,
        index_of,
    })
}

/// Second pass: rewrites every byte offset target as an instruction index
pub fn resolve(raw: &RawCode) -> Result<Vec<Instruction>, DecodeError> {
    raw.instrs
        .iter()
        .zip(&raw.offsets)
        .map(|(instr, &offset)| {
            instr.clone().map_target(|Label(label)| {
                raw.index_of
                    .get(&(label as usize))
                    .copied()
                    .ok_or(DecodeError::UnresolvedLabel { offset, label })
            })
        })
        .collect()
}

/// Decodes and resolves the code of a program image
pub fn decode<I: ProgramImage>(image: &I) -> Result<ByteCode, DecodeError> {
    let mut tags = TagTable::new();
    let raw = decode_raw(image, &mut tags)?;
    let instrs = resolve(&raw)?;

    debug!(
        "decoded {} instructions from {} code bytes, {} constructors",
        instrs.len(),
        image.code().len(),
        tags.len()
    );

    Ok(ByteCode {
        instrs,
        offsets: raw.offsets,
        tags,
    })
}
