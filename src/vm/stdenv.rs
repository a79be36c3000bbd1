// KEEL, a bytecode virtual machine.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// KEEL is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/vm/stdenv.rs

// Host primitives available to every program: the integer console
// behind `Lread` and `Lwrite`, and the value printer behind `Lstring`.

// <>

use std::collections::VecDeque;
use std::io::{self, BufRead, Write};

use super::error::Fault;
use super::memmgt::{Heap, Object};
use super::symtab::TagTable;
use super::word::{Ref, Word};

/// Integer input and output as seen by a running program
pub trait Console {
    fn read_int(&mut self) -> Result<i32, Fault>;
    fn write_int(&mut self, n: i32) -> Result<(), Fault>;
}

/// Line-oriented console over any reader and writer
pub struct StdConsole<R, W> {
    input: R,
    output: W,
}

impl StdConsole<io::StdinLock<'static>, io::Stdout> {
    /// Console bound to the process' standard streams
    pub fn stdio() -> Self {
        Self::new(io::stdin().lock(), io::stdout())
    }
}

impl<R: BufRead, W: Write> StdConsole<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    pub fn into_inner(self) -> (R, W) {
        (self.input, self.output)
    }
}

impl<R: BufRead, W: Write> Console for StdConsole<R, W> {
    /// Prompts with `> ` and parses one integer from the next line
    fn read_int(&mut self) -> Result<i32, Fault> {
        write!(self.output, "> ")?;
        self.output.flush()?;

        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "end of input").into());
        }

        let text = line.trim();
        text.parse().map_err(|_| Fault::BadInput(text.to_string()))
    }

    fn write_int(&mut self, n: i32) -> Result<(), Fault> {
        writeln!(self.output, "{}", n)?;
        Ok(())
    }
}

/// Console fed from a fixed list of inputs, recording every output
#[derive(Debug, Default)]
pub struct Scripted {
    input: VecDeque<i32>,
    written: Vec<i32>,
}

impl Scripted {
    pub fn new<T: IntoIterator<Item = i32>>(input: T) -> Self {
        Self {
            input: input.into_iter().collect(),
            written: vec![],
        }
    }

    pub fn written(&self) -> &[i32] {
        &self.written
    }
}

impl Console for Scripted {
    fn read_int(&mut self) -> Result<i32, Fault> {
        self.input.pop_front().ok_or_else(|| {
            io::Error::new(io::ErrorKind::UnexpectedEof, "scripted input exhausted").into()
        })
    }

    fn write_int(&mut self, n: i32) -> Result<(), Fault> {
        self.written.push(n);
        Ok(())
    }
}

/// Nesting beyond this is printed as `...`; arrays may contain themselves
const RENDER_DEPTH: usize = 64;

/// Constructor printed as a braced list
const CONS: &str = "cons";

/// Renders a value the way `Lstring` presents it
pub fn render(word: Word, heap: &Heap, tags: &TagTable) -> Result<String, Fault> {
    let mut out = String::new();
    render_into(&mut out, word, heap, tags, 0)?;
    Ok(out)
}

fn render_into(
    out: &mut String,
    word: Word,
    heap: &Heap,
    tags: &TagTable,
    depth: usize,
) -> Result<(), Fault> {
    if depth > RENDER_DEPTH {
        out.push_str("...");
        return Ok(());
    }

    let r = match word {
        Word::Unboxed(n) => {
            out.push_str(&n.to_string());
            return Ok(());
        }
        Word::Boxed(Ref::Slot(_)) => {
            out.push_str(&word.to_string());
            return Ok(());
        }
        Word::Boxed(Ref::Obj(r)) => r,
    };

    match heap.get(r)? {
        Object::String(s) => {
            out.push('"');
            out.push_str(&String::from_utf8_lossy(s));
            out.push('"');
        }
        Object::Array(elems) => {
            out.push('[');
            render_seq(out, elems, heap, tags, depth)?;
            out.push(']');
        }
        Object::Sexp { tag, fields } => {
            let name = tags.display_name(*tag);
            if name == CONS && fields.len() == 2 {
                out.push('{');
                render_list(out, fields, heap, tags, depth)?;
                out.push('}');
            } else {
                out.push_str(&name);
                if !fields.is_empty() {
                    out.push_str(" (");
                    render_seq(out, fields, heap, tags, depth)?;
                    out.push(')');
                }
            }
        }
    }

    Ok(())
}

fn render_seq(
    out: &mut String,
    words: &[Word],
    heap: &Heap,
    tags: &TagTable,
    depth: usize,
) -> Result<(), Fault> {
    for (i, &w) in words.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        render_into(out, w, heap, tags, depth + 1)?;
    }
    Ok(())
}

/// Walks a chain of cons cells, stopping at the first tail that is not one
fn render_list(
    out: &mut String,
    first: &[Word],
    heap: &Heap,
    tags: &TagTable,
    depth: usize,
) -> Result<(), Fault> {
    render_into(out, first[0], heap, tags, depth + 1)?;

    let mut tail = first[1];
    for _ in 0..heap.len() {
        let cell = match tail.as_obj().ok().map(|r| heap.get(r)).transpose()? {
            Some(Object::Sexp { tag, fields })
                if fields.len() == 2 && tags.name(*tag) == Some(CONS) =>
            {
                fields
            }
            _ => break,
        };

        out.push_str(", ");
        render_into(out, cell[0], heap, tags, depth + 1)?;
        tail = cell[1];
    }

    // a proper list ends in 0
    if tail != Word::int(0) {
        out.push_str(" | ");
        render_into(out, tail, heap, tags, depth + 1)?;
    }

    Ok(())
}
