//! Service-Konfiguration
//!
//! Alle Einstellungen kommen aus der Umgebung (bzw. einer `.env`-Datei) und
//! werden einmalig beim Start in eine unveränderliche Struktur geladen. Der
//! Kern bekommt nur noch diese Snapshot-Struktur zu sehen.

use std::env;

// ============================================================================
// GATEWAY / SIP
// ============================================================================

/// Verbindung zum Janus Gateway
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub ws_url: String,
    pub api_secret: Option<String>,
}

/// SIP-Konto an der PBX
#[derive(Debug, Clone)]
pub struct SipConfig {
    pub host: String,
    pub port: u16,
    pub extension: String,
    pub password: String,
    pub display_name: String,
}

// ============================================================================
// VOICE AGENT
// ============================================================================

/// Konfigurations-Snapshot der Voice-AI-Session
///
/// Wird pro Anruf genau einmal als Settings-Nachricht übertragen und danach
/// nie mehr verändert.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub ws_url: String,
    pub api_key: String,
    pub language: String,
    pub stt_model: String,
    pub llm_provider: String,
    pub llm_model: String,
    pub tts_model: String,
    pub sample_rate: u32,
    pub encoding: String,
    pub system_prompt: String,
    pub greeting: String,
}

// ============================================================================
// SERVICE CONFIG
// ============================================================================

/// Gesamte Service-Konfiguration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub gateway: GatewayConfig,
    pub sip: SipConfig,
    pub agent: AgentConfig,
}

impl ServiceConfig {
    /// Lädt die Konfiguration aus der Umgebung
    ///
    /// Fehlende Variablen fallen auf Defaults zurück; Credentials sind
    /// bewusst leer statt erfunden.
    pub fn from_env() -> Self {
        Self {
            gateway: GatewayConfig {
                ws_url: var_or("JANUS_WS_URL", "ws://127.0.0.1:8188"),
                api_secret: env::var("JANUS_API_SECRET").ok().filter(|s| !s.is_empty()),
            },
            sip: SipConfig {
                host: var_or("UCM_HOST", "192.168.1.100"),
                port: parse_or("UCM_PORT", 5060),
                extension: var_or("SIP_EXTENSION", "9000"),
                password: var_or("SIP_PASSWORD", ""),
                display_name: var_or("SIP_DISPLAY_NAME", "Agente IA"),
            },
            agent: AgentConfig {
                ws_url: var_or("DEEPGRAM_AGENT_WS_URL", "wss://agent.deepgram.com/agent"),
                api_key: var_or("DEEPGRAM_API_KEY", ""),
                language: var_or("AGENT_LANGUAGE", "es"),
                stt_model: var_or("DEEPGRAM_STT_MODEL", "nova-3"),
                llm_provider: var_or("DEEPGRAM_LLM_PROVIDER", "open_ai"),
                llm_model: var_or("DEEPGRAM_LLM_MODEL", "gpt-4o-mini"),
                tts_model: var_or("DEEPGRAM_TTS_MODEL", "aura-2-luna-es"),
                sample_rate: parse_or("AUDIO_SAMPLE_RATE", 16_000),
                encoding: var_or("AUDIO_ENCODING", "linear16"),
                system_prompt: var_or(
                    "AGENT_SYSTEM_PROMPT",
                    "Eres un asistente virtual de atención telefónica. \
                     Responde en español de forma breve, clara y profesional.",
                ),
                greeting: var_or(
                    "AGENT_GREETING",
                    "Hola, bienvenido. Soy el asistente virtual. ¿En qué puedo ayudarle?",
                ),
            },
        }
    }
}

/// Umgebungsvariable mit Default
fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Numerische Umgebungsvariable mit Default
fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_env() {
        // Nur Variablen prüfen, die in der Testumgebung nicht gesetzt sind
        let cfg = ServiceConfig::from_env();

        assert_eq!(cfg.sip.port, 5060);
        assert_eq!(cfg.agent.sample_rate, 16_000);
        assert_eq!(cfg.agent.encoding, "linear16");
        assert_eq!(cfg.agent.ws_url, "wss://agent.deepgram.com/agent");
        assert!(cfg.gateway.api_secret.is_none());
    }

    #[test]
    fn test_parse_or_falls_back_on_garbage() {
        std::env::set_var("VOICELINK_TEST_PORT", "not-a-number");
        let port: u16 = parse_or("VOICELINK_TEST_PORT", 5060);
        std::env::remove_var("VOICELINK_TEST_PORT");

        assert_eq!(port, 5060);
    }
}
