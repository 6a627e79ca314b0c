/*!
 * Server Configuration
 *
 * Loaded once from a TOML file at startup and read-only afterwards. Every
 * field has a default so an empty file (or no file at all) yields a
 * runnable server.
 */

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::net::IpAddr;

fn default_port() -> u16 {
    crate::DEFAULT_PORT
}

fn default_binds() -> Vec<String> {
    vec!["0.0.0.0".to_string()]
}

fn default_backlog() -> u32 {
    1024
}

fn default_maxclients() -> u64 {
    10000
}

fn default_workers() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// TCP listen port for the normal worker reactors
    #[serde(default = "default_port")]
    pub port: u16,
    /// TCP listen port for the replication reactor; absent disables it
    #[serde(default)]
    pub repl_port: Option<u16>,
    /// Interface addresses the normal reactors bind
    #[serde(default = "default_binds")]
    pub binds: Vec<String>,
    /// Interface addresses for the replication reactor; empty falls back to `binds`
    #[serde(default)]
    pub repl_binds: Vec<String>,
    /// listen() backlog
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// Soft cap on the number of connected clients
    #[serde(default = "default_maxclients")]
    pub maxclients: u64,
    /// Seconds of idleness before a client is kicked out; 0 disables
    #[serde(default)]
    pub timeout: u64,
    /// Number of normal worker reactors
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// AOF file path; absent disables command logging
    #[serde(default)]
    pub aof_file: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: default_port(),
            repl_port: None,
            binds: default_binds(),
            repl_binds: Vec::new(),
            backlog: default_backlog(),
            maxclients: default_maxclients(),
            timeout: 0,
            workers: default_workers(),
            aof_file: None,
        }
    }
}

impl Config {
    /// Load and validate a configuration from a TOML file.
    pub fn from_file(path: &str) -> Result<Config> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("failed to read config file {path}"))?;
        let config: Config =
            toml::from_str(&contents).with_context(|| format!("failed to parse config file {path}"))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            bail!("workers must be at least 1");
        }
        if self.binds.is_empty() {
            bail!("at least one bind address is required");
        }
        if self.maxclients == 0 {
            bail!("maxclients must be at least 1");
        }
        for bind in self.binds.iter().chain(self.repl_binds.iter()) {
            bind.parse::<IpAddr>()
                .with_context(|| format!("invalid bind address {bind}"))?;
        }
        Ok(())
    }

    /// Bind addresses for the replication reactor.
    pub fn effective_repl_binds(&self) -> &[String] {
        if self.repl_binds.is_empty() {
            &self.binds
        } else {
            &self.repl_binds
        }
    }
}
