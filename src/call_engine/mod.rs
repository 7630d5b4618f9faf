//! Call Engine Module - Anruf-Lebenszyklus und Audio-Bridge
//!
//! Dieses Modul verwaltet:
//! - Die State Machine des einen aktiven Anrufs
//! - Die Vollduplex-Audio-Bridge zwischen Telefonie und Voice-AI
//! - Die steckbare Codec-Konvertierung

mod bridge;
mod engine;
mod transcode;

pub use bridge::{AgentAudioSink, AudioBridge, AudioFrame, BridgeEvent, Direction};
pub use engine::{CallEngine, CallEngineError, CallEvent, CallSession, CallState};
pub use transcode::{select_transcoder, G711Ulaw, Passthrough, Transcoder, TELEPHONY_RATE};
