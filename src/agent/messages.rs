//! Message Types für das Voice-AI Protokoll
//!
//! Die Voice-AI-Session läuft über einen WebSocket, der JSON-Steuerframes
//! und rohe binäre Audio-Frames mischt; unterschieden wird über den
//! Frame-Typ (Text vs. Binary). Ausgehend gibt es genau eine
//! Settings-Nachricht pro Session, dazu KeepAlives und Inject-Frames.

use crate::config::AgentConfig;
use serde::{Deserialize, Serialize};

// ============================================================================
// CLIENT → AGENT MESSAGES
// ============================================================================

/// Audio-Format einer Richtung
#[derive(Debug, Clone, Serialize)]
pub struct AudioFormat {
    pub encoding: String,
    pub sample_rate: u32,
}

/// Audio-Format der Ausgaberichtung (raw PCM ohne Container)
#[derive(Debug, Clone, Serialize)]
pub struct AudioOutputFormat {
    pub encoding: String,
    pub sample_rate: u32,
    pub container: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct AudioSettings {
    pub input: AudioFormat,
    pub output: AudioOutputFormat,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListenProvider {
    #[serde(rename = "type")]
    pub provider_type: String,
    pub model: String,
    pub smart_format: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListenSettings {
    pub provider: ListenProvider,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThinkProvider {
    #[serde(rename = "type")]
    pub provider_type: String,
    pub model: String,
    pub temperature: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThinkSettings {
    pub provider: ThinkProvider,
    pub prompt: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpeakProvider {
    #[serde(rename = "type")]
    pub provider_type: String,
    pub model: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpeakSettings {
    pub provider: SpeakProvider,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentSettings {
    pub language: String,
    pub listen: ListenSettings,
    pub think: ThinkSettings,
    pub speak: SpeakSettings,
    pub greeting: String,
}

/// Die Settings-Nachricht konfiguriert die komplette Pipeline
/// (STT → Reasoning → TTS) und wird pro Session genau einmal gesendet.
#[derive(Debug, Clone, Serialize)]
pub struct SettingsMessage {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub audio: AudioSettings,
    pub agent: AgentSettings,
}

impl SettingsMessage {
    /// Baut die Settings aus dem unveränderlichen Konfigurations-Snapshot
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            msg_type: "Settings",
            audio: AudioSettings {
                input: AudioFormat {
                    encoding: config.encoding.clone(),
                    sample_rate: config.sample_rate,
                },
                output: AudioOutputFormat {
                    encoding: config.encoding.clone(),
                    sample_rate: config.sample_rate,
                    container: "none",
                },
            },
            agent: AgentSettings {
                language: config.language.clone(),
                listen: ListenSettings {
                    provider: ListenProvider {
                        provider_type: "deepgram".to_string(),
                        model: config.stt_model.clone(),
                        smart_format: true,
                    },
                },
                think: ThinkSettings {
                    provider: ThinkProvider {
                        provider_type: config.llm_provider.clone(),
                        model: config.llm_model.clone(),
                        temperature: 0.7,
                    },
                    prompt: config.system_prompt.clone(),
                },
                speak: SpeakSettings {
                    provider: SpeakProvider {
                        provider_type: "deepgram".to_string(),
                        model: config.tts_model.clone(),
                    },
                },
                greeting: config.greeting.clone(),
            },
        }
    }
}

/// Keep-Alive-Frame
#[derive(Debug, Clone, Serialize)]
pub struct KeepAliveMessage {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
}

impl KeepAliveMessage {
    pub fn new() -> Self {
        Self {
            msg_type: "KeepAlive",
        }
    }
}

impl Default for KeepAliveMessage {
    fn default() -> Self {
        Self::new()
    }
}

/// Injiziert Text, als hätte ihn der Anrufer gesprochen
#[derive(Debug, Clone, Serialize)]
pub struct InjectUserMessage {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub content: String,
}

impl InjectUserMessage {
    pub fn new(content: String) -> Self {
        Self {
            msg_type: "InjectUserMessage",
            content,
        }
    }
}

/// Injiziert eine Agent-Äußerung (wird zu Audio synthetisiert)
#[derive(Debug, Clone, Serialize)]
pub struct InjectAgentMessage {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub message: String,
}

impl InjectAgentMessage {
    pub fn new(message: String) -> Self {
        Self {
            msg_type: "InjectAgentMessage",
            message,
        }
    }
}

/// Aktualisiert den System-Prompt einer laufenden Session
#[derive(Debug, Clone, Serialize)]
pub struct UpdatePromptMessage {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub prompt: String,
}

impl UpdatePromptMessage {
    pub fn new(prompt: String) -> Self {
        Self {
            msg_type: "UpdatePrompt",
            prompt,
        }
    }
}

// ============================================================================
// AGENT → CLIENT MESSAGES
// ============================================================================

/// Alle JSON-Events, die die Voice-AI schicken kann
///
/// Binäre Frames (TTS-Audio) kommen nicht hier an, sondern werden von der
/// Read-Loop direkt als Audio weitergereicht.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum AgentMessage {
    /// Session steht
    Welcome { session_id: Option<String> },

    /// Settings wurden akzeptiert - ab jetzt darf Audio fließen
    SettingsApplied {},

    /// Gesprächstext mit Rolle (user = Transkript, assistant = Agent-Text)
    ConversationText { role: String, content: String },

    /// Der Anrufer hat angefangen zu sprechen (Barge-in-Signal)
    UserStartedSpeaking {},

    /// Das Reasoning-Modell arbeitet
    AgentThinking { content: Option<String> },

    /// Der Agent beginnt zu sprechen
    AgentStartedSpeaking {},

    /// Der Agent hat seine Antwort fertig gesprochen
    AgentAudioDone {},

    /// Fehler vom Provider
    Error {
        code: Option<String>,
        description: Option<String>,
    },

    /// Warnung vom Provider
    Warning { description: Option<String> },
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> AgentConfig {
        AgentConfig {
            ws_url: "wss://agent.example.com/agent".to_string(),
            api_key: "key".to_string(),
            language: "es".to_string(),
            stt_model: "nova-3".to_string(),
            llm_provider: "open_ai".to_string(),
            llm_model: "gpt-4o-mini".to_string(),
            tts_model: "aura-2-luna-es".to_string(),
            sample_rate: 16_000,
            encoding: "linear16".to_string(),
            system_prompt: "Sei hilfreich.".to_string(),
            greeting: "Hallo!".to_string(),
        }
    }

    #[test]
    fn test_settings_shape() {
        let settings = SettingsMessage::from_config(&test_config());
        let json = serde_json::to_value(&settings).unwrap();

        assert_eq!(json["type"], "Settings");
        assert_eq!(json["audio"]["input"]["encoding"], "linear16");
        assert_eq!(json["audio"]["output"]["container"], "none");
        assert_eq!(json["agent"]["listen"]["provider"]["model"], "nova-3");
        assert_eq!(json["agent"]["think"]["provider"]["type"], "open_ai");
        assert_eq!(json["agent"]["greeting"], "Hallo!");
    }

    #[test]
    fn test_inbound_event_parsing() {
        let raw = r#"{"type":"ConversationText","role":"user","content":"hola"}"#;
        let msg: AgentMessage = serde_json::from_str(raw).unwrap();

        match msg {
            AgentMessage::ConversationText { role, content } => {
                assert_eq!(role, "user");
                assert_eq!(content, "hola");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_inbound_error_parsing() {
        let raw = r#"{"type":"Error","code":"RATE_LIMIT","description":"slow down"}"#;
        let msg: AgentMessage = serde_json::from_str(raw).unwrap();

        match msg {
            AgentMessage::Error { code, description } => {
                assert_eq!(code.as_deref(), Some("RATE_LIMIT"));
                assert_eq!(description.as_deref(), Some("slow down"));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_inject_frames() {
        let user = serde_json::to_value(InjectUserMessage::new("hola".to_string())).unwrap();
        assert_eq!(user["type"], "InjectUserMessage");
        assert_eq!(user["content"], "hola");

        let agent = serde_json::to_value(InjectAgentMessage::new("buenas".to_string())).unwrap();
        assert_eq!(agent["type"], "InjectAgentMessage");
        assert_eq!(agent["message"], "buenas");
    }
}
