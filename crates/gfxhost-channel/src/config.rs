//! Host configuration.
//!
//! Loaded from JSON or from `GFXHOST_*` environment variables. Every field has a default, so
//! a partial JSON document or an empty environment yields a usable configuration.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use gfxhost_cdma::opcodes::HOST_CLASS_ID;
use gfxhost_cdma::HostGeneration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::JobLimits;

/// Syncpoint ids are 8 bits wide in host wait payloads.
pub const MAX_SYNCPTS: u32 = 256;
pub const MAX_WAIT_BASES: u32 = 256;
pub const MIN_PUSH_BUFFER_WORDS: u32 = 16;
pub const MAX_PUSH_BUFFER_WORDS: u32 = 1 << 20;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid value for env var {0}")]
    InvalidEnv(&'static str),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelConfig {
    pub name: String,
    pub class_id: u32,
}

impl ChannelConfig {
    pub fn new(name: impl Into<String>, class_id: u32) -> Self {
        Self {
            name: name.into(),
            class_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostConfig {
    pub syncpts: u32,
    pub wait_bases: u32,
    pub generation: HostGeneration,
    /// Capacity of each channel's command ring, in words. Must be a power of two.
    pub push_buffer_words: u32,
    pub max_gathers: usize,
    pub max_wait_checks: usize,
    pub channels: Vec<ChannelConfig>,
}

impl Default for HostConfig {
    fn default() -> Self {
        let limits = JobLimits::default();
        Self {
            syncpts: 32,
            wait_bases: 8,
            generation: HostGeneration::V1,
            push_buffer_words: 1024,
            max_gathers: limits.max_gathers,
            max_wait_checks: limits.max_wait_checks,
            channels: vec![
                ChannelConfig::new("gr3d", 0x60),
                ChannelConfig::new("gr2d", 0x51),
            ],
        }
    }
}

impl HostConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    /// Reads the process environment. See [`from_lookup`](Self::from_lookup).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from `GFXHOST_*` variables resolved through `lookup`.
    ///
    /// `GFXHOST_CONFIG` names a JSON file used as the base; the remaining variables override
    /// individual fields. `GFXHOST_CHANNELS` is a comma-separated list of `name:class` pairs,
    /// with the class in decimal or `0x` hex.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = match lookup("GFXHOST_CONFIG") {
            Some(path) if !path.trim().is_empty() => Self::from_path(path.trim())?,
            _ => Self::default(),
        };

        if let Some(v) = lookup("GFXHOST_SYNCPTS") {
            config.syncpts = parse_u32(&v).ok_or(ConfigError::InvalidEnv("GFXHOST_SYNCPTS"))?;
        }
        if let Some(v) = lookup("GFXHOST_WAIT_BASES") {
            config.wait_bases =
                parse_u32(&v).ok_or(ConfigError::InvalidEnv("GFXHOST_WAIT_BASES"))?;
        }
        if let Some(v) = lookup("GFXHOST_GENERATION") {
            config.generation = v
                .parse()
                .map_err(|_| ConfigError::InvalidEnv("GFXHOST_GENERATION"))?;
        }
        if let Some(v) = lookup("GFXHOST_PUSH_BUFFER_WORDS") {
            config.push_buffer_words =
                parse_u32(&v).ok_or(ConfigError::InvalidEnv("GFXHOST_PUSH_BUFFER_WORDS"))?;
        }
        if let Some(v) = lookup("GFXHOST_MAX_GATHERS") {
            config.max_gathers = parse_u32(&v)
                .ok_or(ConfigError::InvalidEnv("GFXHOST_MAX_GATHERS"))?
                as usize;
        }
        if let Some(v) = lookup("GFXHOST_MAX_WAIT_CHECKS") {
            config.max_wait_checks = parse_u32(&v)
                .ok_or(ConfigError::InvalidEnv("GFXHOST_MAX_WAIT_CHECKS"))?
                as usize;
        }
        if let Some(v) = lookup("GFXHOST_CHANNELS") {
            config.channels =
                parse_channels(&v).ok_or(ConfigError::InvalidEnv("GFXHOST_CHANNELS"))?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if !(2..=MAX_SYNCPTS).contains(&self.syncpts) {
            return invalid(format!(
                "syncpts must be between 2 and {MAX_SYNCPTS}, got {}",
                self.syncpts
            ));
        }
        if self.wait_bases > MAX_WAIT_BASES {
            return invalid(format!(
                "wait_bases must be at most {MAX_WAIT_BASES}, got {}",
                self.wait_bases
            ));
        }
        if !self.push_buffer_words.is_power_of_two()
            || !(MIN_PUSH_BUFFER_WORDS..=MAX_PUSH_BUFFER_WORDS).contains(&self.push_buffer_words)
        {
            return invalid(format!(
                "push_buffer_words must be a power of two between {MIN_PUSH_BUFFER_WORDS} and {MAX_PUSH_BUFFER_WORDS}, got {}",
                self.push_buffer_words
            ));
        }
        if self.max_gathers == 0 {
            return invalid("max_gathers must be non-zero".into());
        }
        if self.channels.is_empty() {
            return invalid("at least one channel is required".into());
        }

        let mut names = HashSet::new();
        for channel in &self.channels {
            if channel.name.is_empty() {
                return invalid("channel names must be non-empty".into());
            }
            if !names.insert(channel.name.as_str()) {
                return invalid(format!("duplicate channel name {:?}", channel.name));
            }
            if channel.class_id == 0 || channel.class_id == HOST_CLASS_ID || channel.class_id > 0x3ff
            {
                return invalid(format!(
                    "channel {:?} has unusable class id {:#x}",
                    channel.name, channel.class_id
                ));
            }
        }
        Ok(())
    }

    pub fn limits(&self) -> JobLimits {
        JobLimits {
            max_gathers: self.max_gathers,
            max_wait_checks: self.max_wait_checks,
        }
    }
}

fn parse_u32(raw: &str) -> Option<u32> {
    let raw = raw.trim();
    match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => raw.parse().ok(),
    }
}

fn parse_channels(raw: &str) -> Option<Vec<ChannelConfig>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let (name, class) = entry.split_once(':')?;
            Some(ChannelConfig::new(name.trim(), parse_u32(class)?))
        })
        .collect()
}
