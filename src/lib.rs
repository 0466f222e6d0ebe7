//! MirrorLive - live microphone and screen mirroring into Gemini Live.
//!
//! The client captures PulseAudio microphone audio and periodic screen
//! snapshots, ships both over a WebSocket to the relay, and plays the
//! assistant's audio replies. The relay speaks the Gemini Live wire
//! protocol on the far side and fans replies back to its clients.

#![forbid(unsafe_code)]

/// Microphone capture and chunk accumulation
pub mod audio_in;
/// Client side of the relay link
pub mod bridge;
/// Command-line arguments and logging setup
pub mod config;
/// Gemini Live upstream client used by the relay
pub mod gemini;
/// Link lifecycle state machine
pub mod link;
/// PCM sample conversion helpers
pub mod pcm;
/// Assistant audio playback
pub mod playback;
/// Client to relay wire messages
pub mod protocol;
/// Session WAV recording
pub mod recorder;
/// Relay server between clients and Gemini Live
pub mod relay;
/// Periodic screen snapshot sampler
pub mod screen;
/// End-to-end client session wiring
pub mod session;
