// BSD 2-Clause License
//
// Copyright (c) 2024 Alasdair Armstrong
//
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
// 1. Redistributions of source code must retain the above copyright
// notice, this list of conditions and the following disclaimer.
//
// 2. Redistributions in binary form must reproduce the above copyright
// notice, this list of conditions and the following disclaimer in the
// documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT
// LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR
// A PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT
// HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT
// LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE,
// DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY
// THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT
// (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE
// OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

use getopts::{Matches, Options};
use std::path::PathBuf;
use std::process::{self, exit};
use std::str::FromStr;
use std::time::Duration;

use spelunk_lib::assertion::{parse_number, AssertionChecker};
use spelunk_lib::config::ExploreConfig;
use spelunk_lib::emulator::InputSpec;
use spelunk_lib::log;
use spelunk_lib::policy::PolicyKind;

fn tool_name() -> Option<String> {
    match std::env::current_exe() {
        Ok(path) => Some(path.components().last()?.as_os_str().to_str()?.to_string()),
        Err(_) => None,
    }
}

fn print_usage(opts: &Options, code: i32) -> ! {
    let tool = match tool_name() {
        Some(name) => name,
        None => "spelunk".to_string(),
    };
    let brief = format!("Usage: {} [options] PROGRAM [ARG...]\n\nEach '+' in an ARG is a symbolic input byte.", tool);
    eprint!("{}", opts.usage(&brief));
    exit(code)
}

pub fn explore_opts() -> Options {
    let mut opts = Options::new();
    opts.optopt("w", "workspace", "store states and results in this directory", "DIR");
    opts.optopt("", "timeout", "stop exploring after this many seconds", "SECS");
    opts.optopt("t", "threads", "use this many worker threads", "N");
    opts.optopt("", "procs", "same as --threads", "N");
    opts.optopt("", "proc", "same as --threads", "N");
    opts.optopt("p", "policy", "state selection policy (random, uncovered, weighted)", "NAME");
    opts.optopt("", "seed", "seed for the random policy", "N");
    opts.optopt("a", "assertions", "check the assertions in this rule file", "FILE");
    opts.optopt("c", "config", "load exploration settings from this TOML file", "FILE");
    opts.optopt("", "max-steps", "instructions a single run may execute", "N");
    opts.optflag("h", "help", "print this help message");
    opts.optflagmulti("v", "verbose", "print verbose output");
    opts
}

pub struct ExploreOpts {
    pub workspace: PathBuf,
    pub program: PathBuf,
    pub args: Vec<InputSpec>,
    pub config: ExploreConfig,
    pub assertions: Option<AssertionChecker>,
}

fn get_opt<T: FromStr>(opts: &Options, matches: &Matches, name: &str) -> Option<T>
where
    T::Err: ToString,
{
    match matches.opt_get(name) {
        Ok(value) => value,
        Err(e) => {
            eprintln!("Could not parse --{} option: {}", name, e.to_string());
            print_usage(opts, 1)
        }
    }
}

fn get_number(opts: &Options, matches: &Matches, name: &str) -> Option<u64> {
    let value = matches.opt_str(name)?;
    match parse_number(&value) {
        Some(n) => Some(n),
        None => {
            eprintln!("Could not parse --{} option: '{}' is not a number", name, value);
            print_usage(opts, 1)
        }
    }
}

/// Parse the command line. Settings given on the command line take
/// precedence over the configuration file.
pub fn parse(opts: &Options) -> ExploreOpts {
    let args: Vec<String> = std::env::args().collect();
    parse_args(opts, &args[1..])
}

fn parse_args(opts: &Options, args: &[String]) -> ExploreOpts {
    let matches = match opts.parse(args) {
        Ok(m) => m,
        Err(f) => {
            eprintln!("{}", f);
            print_usage(opts, 1)
        }
    };

    if matches.opt_present("help") {
        print_usage(opts, 0)
    }

    log::set_verbosity(matches.opt_count("verbose"));

    let (program, args) = match matches.free.split_first() {
        Some((program, args)) => (PathBuf::from(program), args.iter().map(|arg| InputSpec::parse(arg)).collect()),
        None => {
            eprintln!("No program given");
            print_usage(opts, 1)
        }
    };

    let mut config = match matches.opt_str("config") {
        Some(file) => match ExploreConfig::from_file(&file) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("{}", e);
                exit(1)
            }
        },
        None => ExploreConfig::default(),
    };

    let workers = ["threads", "procs", "proc"].iter().find_map(|name| get_opt::<usize>(opts, &matches, name));
    if let Some(workers) = workers {
        if workers == 0 {
            eprintln!("At least one worker thread is required");
            print_usage(opts, 1)
        }
        config.workers = Some(workers)
    }
    if let Some(secs) = get_number(opts, &matches, "timeout") {
        config.timeout = Some(Duration::from_secs(secs))
    }
    if let Some(policy) = get_opt::<PolicyKind>(opts, &matches, "policy") {
        config.policy = policy
    }
    if let Some(seed) = get_number(opts, &matches, "seed") {
        config.seed = seed
    }
    if let Some(max_steps) = get_number(opts, &matches, "max-steps") {
        config.max_steps = max_steps
    }

    let assertions = matches.opt_str("assertions").map(|file| match AssertionChecker::from_file(&file) {
        Ok(checker) => checker,
        Err(e) => {
            eprintln!("Error in assertion file '{}': {}", file, e);
            exit(1)
        }
    });

    let workspace = match matches.opt_str("workspace") {
        Some(dir) => PathBuf::from(dir),
        None => PathBuf::from(format!("spelunk_{}", process::id())),
    };

    ExploreOpts { workspace, program, args, config, assertions }
}
