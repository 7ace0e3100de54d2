//! CLI configuration: optional TOML file merged with command-line flags.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

pub use tone_player::config::SessionConfig;

use crate::cli::Args;

/// Config file schema.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// Output device index used when `--device` is not given.
    pub device: Option<usize>,
    pub session: SessionConfig,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        Self::parse(&raw).with_context(|| format!("parse config {:?}", path))
    }

    fn parse(raw: &str) -> Result<Self> {
        Ok(toml::from_str::<FileConfig>(raw)?)
    }
}

/// Resolved settings for one CLI run.
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    /// `None` means prompt on stdin.
    pub device: Option<usize>,
    /// One-shot message; `None` streams stdin lines.
    pub text: Option<String>,
    pub session: SessionConfig,
}

impl BridgeConfig {
    pub fn from_args(args: &Args) -> Result<Self> {
        let file = match args.config.as_deref() {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Ok(Self::merge(file, args))
    }

    fn merge(file: FileConfig, args: &Args) -> Self {
        let mut session = file.session;
        if let Some(volume) = args.volume {
            session.volume_percent = volume;
        }
        if let Some(protocol) = args.protocol {
            session.protocol = protocol;
        }
        if let Some(settle) = args.settle_ms {
            session.settle_delay_ms = settle;
        }
        Self {
            device: args.device.or(file.device),
            text: args.text.clone(),
            session: session.normalized(),
        }
    }
}
