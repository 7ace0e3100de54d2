//! Streaming text-to-audio encoding and playback.
//!
//! - [`pipe`]: growable in-memory byte stream between the encoder and the device
//! - [`codec`]: the codec contract and the built-in tone codec
//! - [`device`]: output device discovery and the CPAL renderer
//! - [`session`]: the encode-and-play state machine tying them together

pub mod cancel;
pub mod codec;
pub mod config;
pub mod device;
pub mod error;
pub mod format;
pub mod pipe;
pub mod playback;
pub mod session;
pub mod status;

pub use error::{SessionError, SessionResult};
pub use session::{CycleHandle, CycleOutcome, EncodeSession};
