//! Message Types für das Janus Gateway Protokoll
//!
//! Diese Strukturen spiegeln das WebSocket-API des Janus Gateways wider
//! (Envelope mit `janus`-Diskriminante, Korrelation über `transaction`,
//! Plugin-Payloads unter `plugindata.data`). SDP-Payloads (`jsep`) werden
//! als opake Blobs durchgereicht und nie interpretiert.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// CLIENT → GATEWAY MESSAGES
// ============================================================================

/// Envelope für alle Anfragen an das Gateway
///
/// Die `transaction` wird vom RPC-Layer vergeben, bevor die Nachricht den
/// Socket erreicht.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayRequest {
    pub janus: &'static str,
    pub transaction: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apisecret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jsep: Option<Jsep>,
}

impl GatewayRequest {
    fn bare(janus: &'static str, transaction: String) -> Self {
        Self {
            janus,
            transaction,
            session_id: None,
            handle_id: None,
            apisecret: None,
            body: None,
            jsep: None,
        }
    }

    /// Neue Gateway-Session anlegen
    pub fn create(transaction: String) -> Self {
        Self::bare("create", transaction)
    }

    /// SIP-Plugin an eine Session anhängen
    pub fn attach(transaction: String, session_id: u64) -> Self {
        Self {
            session_id: Some(session_id),
            body: Some(serde_json::json!({ "plugin": SIP_PLUGIN })),
            ..Self::bare("attach", transaction)
        }
    }

    /// Session-Keepalive
    pub fn keepalive(transaction: String, session_id: u64) -> Self {
        Self {
            session_id: Some(session_id),
            ..Self::bare("keepalive", transaction)
        }
    }

    /// Session abbauen
    pub fn destroy(transaction: String, session_id: u64) -> Self {
        Self {
            session_id: Some(session_id),
            ..Self::bare("destroy", transaction)
        }
    }

    /// Plugin-Nachricht (register, call, accept, hangup, dtmf_info)
    pub fn plugin_message(
        transaction: String,
        session_id: u64,
        handle_id: u64,
        body: Value,
        jsep: Option<Jsep>,
    ) -> Self {
        Self {
            session_id: Some(session_id),
            handle_id: Some(handle_id),
            body: Some(body),
            jsep,
            ..Self::bare("message", transaction)
        }
    }
}

/// Plugin-Name des Janus SIP-Plugins
pub const SIP_PLUGIN: &str = "janus.plugin.sip";

/// SIP-Registrierung an der PBX
#[derive(Debug, Clone, Serialize)]
pub struct RegisterBody {
    pub request: &'static str,
    pub username: String,
    pub authuser: String,
    pub display_name: String,
    pub secret: String,
    pub proxy: String,
    pub force_udp: bool,
}

impl RegisterBody {
    pub fn new(host: &str, port: u16, extension: &str, password: &str, display_name: &str) -> Self {
        Self {
            request: "register",
            username: format!("sip:{}@{}", extension, host),
            authuser: extension.to_string(),
            display_name: display_name.to_string(),
            secret: password.to_string(),
            proxy: format!("sip:{}:{}", host, port),
            force_udp: true,
        }
    }
}

/// Ausgehender Anruf
#[derive(Debug, Clone, Serialize)]
pub struct CallBody {
    pub request: &'static str,
    pub uri: String,
    pub autoaccept_reinvites: bool,
}

impl CallBody {
    pub fn new(uri: String) -> Self {
        Self {
            request: "call",
            uri,
            autoaccept_reinvites: true,
        }
    }
}

/// Eingehenden Anruf annehmen
#[derive(Debug, Clone, Serialize)]
pub struct AcceptBody {
    pub request: &'static str,
}

impl AcceptBody {
    pub fn new() -> Self {
        Self { request: "accept" }
    }
}

impl Default for AcceptBody {
    fn default() -> Self {
        Self::new()
    }
}

/// Aktuellen Anruf beenden bzw. eingehenden Anruf abweisen
#[derive(Debug, Clone, Serialize)]
pub struct HangupBody {
    pub request: &'static str,
}

impl HangupBody {
    pub fn new() -> Self {
        Self { request: "hangup" }
    }
}

impl Default for HangupBody {
    fn default() -> Self {
        Self::new()
    }
}

/// Eingehenden Anruf ablehnen, ohne einen laufenden Anruf anzufassen
#[derive(Debug, Clone, Serialize)]
pub struct DeclineBody {
    pub request: &'static str,
    pub code: u16,
}

impl DeclineBody {
    pub fn new() -> Self {
        Self {
            request: "decline",
            code: 486, // Busy Here
        }
    }
}

impl Default for DeclineBody {
    fn default() -> Self {
        Self::new()
    }
}

/// DTMF-Töne senden
#[derive(Debug, Clone, Serialize)]
pub struct DtmfBody {
    pub request: &'static str,
    pub digit: String,
}

impl DtmfBody {
    pub fn new(tones: String) -> Self {
        Self {
            request: "dtmf_info",
            digit: tones,
        }
    }
}

// ============================================================================
// GATEWAY → CLIENT MESSAGES
// ============================================================================

/// Opaker SDP-Payload (Offer/Answer), wird nie interpretiert
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Jsep(pub Value);

/// Session-Daten aus `success`-Antworten (`data.id`)
#[derive(Debug, Clone, Deserialize)]
pub struct SessionData {
    pub id: u64,
}

/// Fehler-Payload des Gateways
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorBody {
    pub code: i64,
    pub reason: String,
}

/// Plugin-Daten-Envelope (`plugindata.data` enthält den eigentlichen Payload)
#[derive(Debug, Clone, Deserialize)]
pub struct PluginData {
    pub plugin: String,
    pub data: Value,
}

/// Alle Nachrichten, die das Gateway schicken kann
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "janus", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Bestätigung einer asynchronen Anfrage
    Ack {
        transaction: Option<String>,
    },

    /// Synchrone Antwort (z.B. create/attach)
    Success {
        transaction: Option<String>,
        data: Option<SessionData>,
    },

    /// Fehlerantwort
    Error {
        transaction: Option<String>,
        error: ErrorBody,
    },

    /// Asynchrones Plugin-Event
    Event {
        transaction: Option<String>,
        sender: Option<u64>,
        plugindata: Option<PluginData>,
        jsep: Option<Jsep>,
    },

    /// PeerConnection steht
    Webrtcup {
        sender: Option<u64>,
    },

    /// Media-Status (audio/video fließt bzw. fließt nicht mehr)
    Media {
        sender: Option<u64>,
        #[serde(rename = "type")]
        kind: Option<String>,
        receiving: Option<bool>,
    },

    /// PeerConnection wurde abgebaut
    Hangup {
        sender: Option<u64>,
        reason: Option<String>,
    },

    /// Session ist serverseitig abgelaufen
    Timeout {
        session_id: Option<u64>,
    },

    /// Plugin-Handle wurde gelöst
    Detached {
        sender: Option<u64>,
    },
}

impl ServerMessage {
    /// Transaction-Id der Nachricht, falls vorhanden
    pub fn transaction(&self) -> Option<&str> {
        match self {
            ServerMessage::Ack { transaction }
            | ServerMessage::Success { transaction, .. }
            | ServerMessage::Error { transaction, .. }
            | ServerMessage::Event { transaction, .. } => transaction.as_deref(),
            _ => None,
        }
    }
}

// ============================================================================
// EVENT EXTRACTION
// ============================================================================

/// Entpacktes SIP-Plugin-Event
///
/// Der Event-Name steckt je nach Gateway-Version unter
/// `plugindata.data.result.event` oder `plugindata.data.event`.
#[derive(Debug, Clone)]
pub struct PluginEvent {
    pub event: String,
    pub result: Value,
    pub jsep: Option<Jsep>,
    pub sender: Option<u64>,
}

impl PluginEvent {
    /// Extrahiert das Plugin-Event aus einer `event`-Nachricht
    pub fn from_message(msg: &ServerMessage) -> Option<Self> {
        let ServerMessage::Event {
            plugindata,
            jsep,
            sender,
            ..
        } = msg
        else {
            return None;
        };

        let data = &plugindata.as_ref()?.data;
        let result = data.get("result").cloned().unwrap_or(Value::Null);
        let event = result
            .get("event")
            .or_else(|| data.get("event"))
            .and_then(Value::as_str)?
            .to_string();

        Some(Self {
            event,
            result,
            jsep: jsep.clone(),
            sender: *sender,
        })
    }

    /// Anrufer-Identität aus dem Result-Payload (username oder displayname)
    pub fn caller(&self) -> Option<String> {
        self.result
            .get("username")
            .or_else(|| self.result.get("displayname"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// Fehlercode aus dem Result-Payload (z.B. bei registration_failed)
    pub fn result_code(&self) -> Option<i64> {
        self.result.get("code").and_then(Value::as_i64)
    }

    /// Begründung aus dem Result-Payload
    pub fn result_reason(&self) -> Option<String> {
        self.result
            .get("reason")
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

// ============================================================================
// TESTS
// ============================================================================
