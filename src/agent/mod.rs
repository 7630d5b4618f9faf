//! Agent Module - WebSocket Client für die Voice-AI-Session
//!
//! Dieses Modul verwaltet die per-Anruf-Session zur Voice-AI:
//! - Verbindungsaufbau mit einmaligem Settings-Snapshot
//! - Bereitschafts-Gate auf der Settings-Bestätigung
//! - Audio rein/raus, Events klassifiziert nach außen
//! - KeepAlive und idempotenter Abbau
//!

mod client;
mod messages;

pub use client::{AgentError, AgentEvent, AgentSession};
pub use messages::*;
