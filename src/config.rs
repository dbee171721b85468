//! Configuration (SPEC_FULL §10.1): a `clap::Parser` CLI taking a
//! `--config` path, whose contents are deserialized from TOML with
//! `serde`, mirroring the teacher's `Config::load` / `LogLevel` /
//! `#[serde(default = "...")]` pattern in `src/config.rs`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;

use crate::codec::Codec;

#[derive(Parser, Debug)]
#[command(name = env!("CARGO_PKG_NAME"), version, about = env!("CARGO_PKG_DESCRIPTION"))]
pub struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long, default_value = "config.toml")]
    pub config: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(Self::Error),
            "warn" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            "trace" => Ok(Self::Trace),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match self {
            Self::Error => log::Level::Error,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
        }
    }
}

/// `server.codec` (spec §6: `NewServer(..., codec)`, `codec ∈ {"ulaw",
/// "slin16"}`). Fixed at construction; per-session renegotiation is a
/// non-goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    Ulaw,
    Slin16,
}

impl Default for CodecKind {
    fn default() -> Self {
        Self::Ulaw
    }
}

impl CodecKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ulaw => "ulaw",
            Self::Slin16 => "slin16",
        }
    }

    pub fn to_codec(self, slin16_payload_type: u8) -> Codec {
        match self {
            Self::Ulaw => Codec::Ulaw,
            Self::Slin16 => Codec::Slin16 {
                payload_type: slin16_payload_type,
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Server {
    /// UDP bind address.
    pub listen: SocketAddr,
    #[serde(default)]
    pub codec: CodecKind,
    #[serde(default = "Server::default_slin16_payload_type")]
    pub slin16_payload_type: u8,
    #[serde(default = "Server::default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "Server::default_stats_interval_frames")]
    pub stats_interval_frames: u64,
}

impl Server {
    fn default_slin16_payload_type() -> u8 {
        118
    }

    fn default_idle_timeout_secs() -> u64 {
        30
    }

    fn default_stats_interval_frames() -> u64 {
        50
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    pub server: Server,
    #[serde(default)]
    pub log: Log,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let cli = Cli::parse();
        Self::load_from(&cli.config)
    }

    pub fn load_from(path: &std::path::Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {path:?}"))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file {path:?}"))?;
        Ok(config)
    }
}
