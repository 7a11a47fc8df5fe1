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

//! Exploration settings read from a TOML file:
//!
//! ```toml
//! [explore]
//! workers = 4
//! timeout = 60          # seconds
//! policy = "uncovered"
//! seed = 0
//! max_steps = 100000
//! grace = 30            # seconds, 0 disables the liveness sweep
//!
//! [solver]
//! timeout_ms = 2000
//! max_nodes = 1000000
//! ```
//!
//! Every key is optional. Numbers may be TOML integers or strings,
//! which allows hexadecimal with a `0x` prefix.

use std::fs;
use std::path::Path;
use std::time::Duration;
use toml::Value;

use crate::executor::DEFAULT_MAX_STEPS;
use crate::policy::PolicyKind;
use crate::pool::PoolOptions;
use crate::smt::search::SearchSolver;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExploreConfig {
    pub workers: Option<usize>,
    pub timeout: Option<Duration>,
    pub policy: PolicyKind,
    pub seed: u64,
    pub max_steps: u64,
    pub grace: Option<Duration>,
    pub solver_timeout: Option<Duration>,
    pub solver_max_nodes: Option<u64>,
}

impl Default for ExploreConfig {
    fn default() -> Self {
        ExploreConfig {
            workers: None,
            timeout: None,
            policy: PolicyKind::Uncovered,
            seed: 0,
            max_steps: DEFAULT_MAX_STEPS,
            grace: None,
            solver_timeout: None,
            solver_max_nodes: None,
        }
    }
}

fn get_table_value(config: &Value, table: &str, key: &str) -> Result<Option<u64>, String> {
    let value = match config.get(table).and_then(|table| table.get(key)) {
        Some(value) => value,
        None => return Ok(None),
    };
    match value {
        Value::Integer(n) if *n >= 0 => Ok(Some(*n as u64)),
        Value::String(s) => {
            if s.len() >= 2 && &s[0..2] == "0x" {
                u64::from_str_radix(&s[2..], 16)
            } else {
                s.parse::<u64>()
            }
            .map(Some)
            .map_err(|e| format!("Could not parse {} as a 64-bit unsigned integer in {}.{}: {}", s, table, key, e))
        }
        _ => Err(format!("{}.{} must be a non-negative integer", table, key)),
    }
}

fn get_table_string(config: &Value, table: &str, key: &str) -> Result<Option<String>, String> {
    match config.get(table).and_then(|table| table.get(key)) {
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(format!("{}.{} must be a string", table, key)),
        None => Ok(None),
    }
}

impl ExploreConfig {
    pub fn parse(contents: &str) -> Result<Self, String> {
        let config = contents.parse::<Value>().map_err(|e| format!("Error when parsing configuration: {}", e))?;
        let mut result = ExploreConfig::default();

        if let Some(workers) = get_table_value(&config, "explore", "workers")? {
            if workers == 0 {
                return Err("explore.workers must be at least 1".to_string());
            }
            result.workers = Some(workers as usize)
        }
        result.timeout = get_table_value(&config, "explore", "timeout")?.map(Duration::from_secs);
        if let Some(policy) = get_table_string(&config, "explore", "policy")? {
            result.policy = policy.parse()?
        }
        result.seed = get_table_value(&config, "explore", "seed")?.unwrap_or(0);
        result.max_steps = get_table_value(&config, "explore", "max_steps")?.unwrap_or(DEFAULT_MAX_STEPS);
        result.grace = get_table_value(&config, "explore", "grace")?.filter(|secs| *secs > 0).map(Duration::from_secs);

        result.solver_timeout = get_table_value(&config, "solver", "timeout_ms")?.map(Duration::from_millis);
        result.solver_max_nodes = get_table_value(&config, "solver", "max_nodes")?;

        Ok(result)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let contents = fs::read_to_string(&path)
            .map_err(|e| format!("Error when loading config '{}': {}", path.as_ref().display(), e))?;
        ExploreConfig::parse(&contents)
    }

    /// Pool settings, using `default_workers` when no worker count was
    /// configured.
    pub fn pool_options(&self, default_workers: usize) -> PoolOptions {
        PoolOptions {
            workers: self.workers.unwrap_or(default_workers),
            timeout: self.timeout,
            policy: self.policy,
            seed: self.seed,
            max_steps: self.max_steps,
            grace: self.grace,
        }
    }

    pub fn solver(&self) -> SearchSolver {
        let mut solver = SearchSolver::new();
        if let Some(timeout) = self.solver_timeout {
            solver = solver.with_timeout(timeout)
        }
        if let Some(max_nodes) = self.solver_max_nodes {
            solver = solver.with_max_nodes(max_nodes)
        }
        solver
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_is_default() {
        assert_eq!(ExploreConfig::parse(""), Ok(ExploreConfig::default()));
    }

    #[test]
    fn full_config() {
        let config = ExploreConfig::parse(
            r#"
            [explore]
            workers = 3
            timeout = 10
            policy = "weighted"
            seed = "0x2a"
            max_steps = 500
            grace = 0

            [solver]
            timeout_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(config.workers, Some(3));
        assert_eq!(config.timeout, Some(Duration::from_secs(10)));
        assert_eq!(config.policy, PolicyKind::Weighted);
        assert_eq!(config.seed, 42);
        assert_eq!(config.max_steps, 500);
        assert_eq!(config.grace, None);
        assert_eq!(config.solver_timeout, Some(Duration::from_millis(250)));

        let options = config.pool_options(8);
        assert_eq!(options.workers, 3);
        assert_eq!(options.max_steps, 500);
    }

    #[test]
    fn bad_values() {
        assert!(ExploreConfig::parse("[explore]\nworkers = 0").is_err());
        assert!(ExploreConfig::parse("[explore]\nworkers = -1").is_err());
        assert!(ExploreConfig::parse("[explore]\npolicy = \"bfs\"").is_err());
        assert!(ExploreConfig::parse("[explore]\nseed = \"0xzz\"").is_err());
        assert!(ExploreConfig::parse("[explore").is_err());
    }
}
