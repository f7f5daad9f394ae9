// This file is part of Argus, a motion-triggered camera recording pipeline.
// Copyright (C) 2025 The Argus Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

use base::Error;
use bpaf::Bpaf;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

mod analyser;
mod backend;
mod cmds;
mod config;
mod discovery;
mod manager;
mod motion;
mod pipeline;
mod recorder;
mod web;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Argus: motion-triggered camera recording and analysis.
#[derive(Bpaf, Debug)]
#[bpaf(options, version(VERSION))]
enum Args {
    // See docstrings of `cmds::*::Args` structs for a description of the
    // respective subcommands.
    Detector(#[bpaf(external(cmds::detector::args))] cmds::detector::Args),
    Analyser(#[bpaf(external(cmds::analyser::args))] cmds::analyser::Args),
}

impl Args {
    fn run(self) -> Result<i32, Error> {
        match self {
            Args::Detector(a) => cmds::detector::run(a),
            Args::Analyser(a) => cmds::analyser::run(a),
        }
    }
}

fn main() {
    // If using the clock will fail, find out now *before* trying to log
    // anything (with timestamps...) so we can print a helpful error.
    if let Err(e) = nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC) {
        eprintln!("clock_gettime failed: {e}\n\nThis indicates a broken environment.");
        std::process::exit(1);
    }

    base::tracing_setup::install();

    // Use the program name from the OS (e.g. if invoked via a symlink),
    // falling back to the crate name.
    let progname = std::env::args_os().next().map(PathBuf::from);
    let progname = progname
        .as_deref()
        .and_then(Path::file_name)
        .and_then(OsStr::to_str)
        .unwrap_or(env!("CARGO_PKG_NAME"));

    let args = match args()
        .fallback_to_usage()
        .run_inner(bpaf::Args::current_args().set_name(progname))
    {
        Ok(a) => a,
        Err(e) => std::process::exit(e.exit_code()),
    };
    tracing::trace!("parsed command-line arguments: {args:#?}");

    match args.run() {
        Err(e) => {
            error!(err = %e.chain(), "exiting due to error");
            std::process::exit(1);
        }
        Ok(status) => {
            debug!("exiting with status {status}");
            std::process::exit(status)
        }
    }
}
