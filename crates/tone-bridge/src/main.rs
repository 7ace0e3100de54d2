//! Tone Bridge: a small CLI that turns text into tones and plays them on an output device.
//!
//! 1. **Select**: pick an output device by `--device` or from an interactive list.
//! 2. **Encode**: the session encoder turns input text into PCM in the device's native format.
//! 3. **Play**: the CPAL callback drains the PCM pipe, playing silence while more text is typed.
//!
//! With `--text` one message is played and the process exits. Otherwise each stdin line is
//! sent as it is entered until input ends.

use anyhow::Result;
use clap::Parser;
use tone_bridge::{cli, config::BridgeConfig, runtime};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,tone_bridge=info,tone_player=info")
        }))
        .init();

    if args.list_devices {
        return runtime::list_devices();
    }

    let config = BridgeConfig::from_args(&args)?;
    runtime::run(config)
}
