use std::path::PathBuf;

use clap::Parser;
use tone_bridge_types::ProtocolId;

#[derive(Parser, Debug)]
#[command(name = "tone-bridge", version)]
pub struct Args {
    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Output device index (skips the prompt)
    #[arg(long)]
    pub device: Option<usize>,

    /// Encode this message, play it, and exit. Without it, stdin lines are sent as typed.
    #[arg(long)]
    pub text: Option<String>,

    /// Codec output volume, 0-100
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=100))]
    pub volume: Option<u8>,

    /// Codec protocol, e.g. audible-fastest or ultrasound-normal
    #[arg(long)]
    pub protocol: Option<ProtocolId>,

    /// Wait after playback stops before the next message may start (ms)
    #[arg(long)]
    pub settle_ms: Option<u64>,

    /// TOML config file with a [session] table; flags override its values
    #[arg(long)]
    pub config: Option<PathBuf>,
}
