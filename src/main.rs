// KEEL, a bytecode virtual machine.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// KEEL is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/main.rs

// Command line driver: interpret, analyze or list a compiled file.

// <>

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{debug, LevelFilter};
use simple_logger::SimpleLogger;

use keel::vm::{self, Grouping};

#[derive(Parser, Debug)]
#[command(name = "keel", version, about = "Runs compiled bytecode files")]
struct Args {
    /// Compiled bytecode file
    file: PathBuf,

    /// Print static instruction frequencies instead of running
    #[arg(short = 'a', long = "analyze", conflicts_with = "dump")]
    analyze: bool,

    /// Count instructions together with their operands
    #[arg(long, requires = "analyze")]
    operands: bool,

    /// Print the resolved instruction listing instead of running
    #[arg(short = 'd', long = "dump")]
    dump: bool,

    /// More log output; repeat for more
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn level(verbose: u8) -> LevelFilter {
    match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = SimpleLogger::new().with_level(level(args.verbose)).init() {
        eprintln!("keel: cannot start logger: {}", e);
    }

    let res = if args.analyze {
        let grouping = if args.operands {
            Grouping::Text
        } else {
            Grouping::Kind
        };
        vm::analyze_file(&args.file, grouping).map(|report| print!("{}", report))
    } else if args.dump {
        vm::disassemble_file(&args.file).map(|listing| print!("{}", listing))
    } else {
        vm::run_file(&args.file).map(|_| ())
    };

    match res {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            debug!("{:?}", e);
            eprintln!("keel: {}", e);
            ExitCode::FAILURE
        }
    }
}
