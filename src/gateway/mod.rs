//! Gateway Module - WebSocket Client für das Janus Gateway
//!
//! Dieses Modul verwaltet die Signalisierung zum SIP-Gateway:
//! - Langlebige WebSocket-Verbindung mit Session und Plugin-Handle
//! - Korrelierte Request/Response-Abwicklung über Transaction-Ids
//! - Verteilung unaufgeforderter Events an registrierte Handler
//! - Session-Keepalive
//!

mod client;
mod dispatch;
mod messages;
mod transact;

pub use client::{GatewayClient, GatewayError, CONTROL_TIMEOUT, NEGOTIATION_TIMEOUT};
pub use dispatch::{EventDispatcher, GatewayEvent};
pub use messages::*;
pub use transact::TransactionTable;
