//! WebSocket Client für die Voice-AI-Session
//!
//! Eine Session lebt genau so lange wie ein Anruf. Ablauf:
//! 1. Verbinden (Bearer-Header), Settings-Snapshot genau einmal senden
//! 2. Erst nach der Settings-Bestätigung gilt die Session als bereit
//! 3. Audio rein (binär, fire-and-forget), Audio und Events raus
//!
//! Frames vor der Bereitschaft werden verworfen statt gepuffert - Latenz
//! schlägt Vollständigkeit.

use crate::agent::messages::*;
use crate::config::AgentConfig;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use uuid::Uuid;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Intervall der KeepAlive-Frames
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Kapazität des Schreib-Channels
const OUTBOUND_CAPACITY: usize = 100;

/// Kapazität des Audio-Kanals Richtung Bridge
const AUDIO_CAPACITY: usize = 64;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum AgentError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to voice agent")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Settings not acknowledged within {0:?}")]
    SettingsNotApplied(Duration),

    #[error("Voice agent connection closed")]
    ConnectionClosed,
}

// ============================================================================
// AGENT EVENTS
// ============================================================================

/// Events, die die Session nach außen weitergibt
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// Settings bestätigt, Session bereit für Audio
    Ready,

    /// Transkript des Anrufers
    CallerTranscript { text: String },

    /// Textantwort des Agenten
    AgentText { text: String },

    /// Der Anrufer spricht (Barge-in)
    CallerStartedSpeaking,

    /// Das Reasoning-Modell arbeitet
    AgentThinking,

    /// Der Agent beginnt zu sprechen
    AgentStartedSpeaking,

    /// Der Agent hat seine Antwort fertig gesprochen
    AgentAudioDone,

    /// Fehler vom Provider
    ProviderError { code: String, description: String },

    /// Warnung vom Provider
    ProviderWarning { description: String },

    /// Verbindung wurde geschlossen
    Closed,
}

// ============================================================================
// AGENT SESSION
// ============================================================================

/// Eine Voice-AI-Session für genau einen Anruf
pub struct AgentSession {
    id: Uuid,
    out_tx: mpsc::Sender<Message>,
    ready_rx: watch::Receiver<bool>,
    event_tx: broadcast::Sender<AgentEvent>,
    audio_rx: parking_lot::Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    dropped_frames: Arc<AtomicU64>,
    closed: AtomicBool,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl AgentSession {
    /// Verbindet zur Voice-AI und überträgt den Settings-Snapshot
    ///
    /// Die Settings gehen genau einmal raus; bereit ist die Session erst,
    /// wenn die Bestätigung eingetroffen ist (`wait_ready`).
    pub async fn connect(config: &AgentConfig) -> Result<Self, AgentError> {
        let id = Uuid::new_v4();
        tracing::info!("Connecting to voice agent (session {})...", id);

        let mut request = config
            .ws_url
            .as_str()
            .into_client_request()
            .map_err(|e| AgentError::ConnectionFailed(e.to_string()))?;
        let auth = HeaderValue::from_str(&format!("Token {}", config.api_key))
            .map_err(|e| AgentError::ConnectionFailed(e.to_string()))?;
        request.headers_mut().insert("Authorization", auth);

        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|e| AgentError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        // Writer-Task
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(OUTBOUND_CAPACITY);
        let write_task = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if let Err(e) = write.send(msg).await {
                    tracing::error!("Failed to send to voice agent: {}", e);
                    break;
                }
            }
        });

        // Settings als allererstes Frame
        let settings = SettingsMessage::from_config(config);
        let text = serde_json::to_string(&settings)
            .map_err(|e| AgentError::SendFailed(e.to_string()))?;
        out_tx
            .send(Message::Text(text))
            .await
            .map_err(|_| AgentError::ConnectionClosed)?;
        tracing::info!(
            "Settings sent (STT={}, LLM={}, TTS={})",
            config.stt_model,
            config.llm_model,
            config.tts_model
        );

        let (ready_tx, ready_rx) = watch::channel(false);
        let (event_tx, _) = broadcast::channel(100);
        let (audio_tx, audio_rx) = mpsc::channel::<Vec<u8>>(AUDIO_CAPACITY);
        let dropped_frames = Arc::new(AtomicU64::new(0));

        // Read-Loop: Events klassifizieren, binäres Audio weiterreichen
        let event_tx_clone = event_tx.clone();
        let dropped_clone = Arc::clone(&dropped_frames);
        let read_task = tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Binary(data)) => {
                        if audio_tx.try_send(data).is_err() {
                            dropped_clone.fetch_add(1, Ordering::Relaxed);
                            tracing::debug!("Agent audio queue full, dropping frame");
                        }
                    }
                    Ok(Message::Text(text)) => {
                        Self::handle_event_frame(&text, &ready_tx, &event_tx_clone);
                    }
                    Ok(Message::Close(_)) => {
                        tracing::info!("Voice agent closed the WebSocket");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!("Voice agent WebSocket error: {}", e);
                        break;
                    }
                }
            }

            let _ = ready_tx.send(false);
            let _ = event_tx_clone.send(AgentEvent::Closed);
        });

        // KeepAlive-Task
        let keepalive_out = out_tx.clone();
        let keepalive_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(KEEPALIVE_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let frame = serde_json::to_string(&KeepAliveMessage::new()).unwrap();
                if keepalive_out.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            id,
            out_tx,
            ready_rx,
            event_tx,
            audio_rx: parking_lot::Mutex::new(Some(audio_rx)),
            dropped_frames,
            closed: AtomicBool::new(false),
            tasks: parking_lot::Mutex::new(vec![write_task, read_task, keepalive_task]),
        })
    }

    /// Session-Id (Korrelation in Logs)
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.event_tx.subscribe()
    }

    /// Nimmt den Audio-Stream des Agenten heraus (einmalig, für die Bridge)
    pub fn take_audio_stream(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.audio_rx.lock().take()
    }

    /// Prüft ob die Settings bestätigt wurden
    pub fn is_ready(&self) -> bool {
        *self.ready_rx.borrow()
    }

    /// Wartet bis die Session bereit ist
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), AgentError> {
        let mut rx = self.ready_rx.clone();
        let result = match tokio::time::timeout(timeout, rx.wait_for(|ready| *ready)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(AgentError::ConnectionClosed),
            Err(_) => Err(AgentError::SettingsNotApplied(timeout)),
        };
        result
    }

    /// Anzahl verworfener Audio-Frames (vor Bereitschaft oder bei Stau)
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Schickt einen Audio-Frame des Anrufers an die Voice-AI
    ///
    /// Fire-and-forget: vor der Settings-Bestätigung werden Frames
    /// verworfen und gezählt, damit sich keine Latenz aufbaut.
    pub fn send_audio(&self, frame: Vec<u8>) {
        if self.closed.load(Ordering::SeqCst) || !self.is_ready() {
            self.dropped_frames.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Voice agent not ready, dropping caller frame");
            return;
        }

        if self.out_tx.try_send(Message::Binary(frame)).is_err() {
            self.dropped_frames.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Voice agent send queue full, dropping caller frame");
        }
    }

    /// Injiziert eine synthetische Äußerung außerhalb des Audio-Pfads
    ///
    /// `as_user = true` verhält sich, als hätte der Anrufer den Text
    /// gesprochen; andernfalls spricht der Agent ihn aus.
    pub async fn inject(&self, text: &str, as_user: bool) -> Result<(), AgentError> {
        let frame = if as_user {
            serde_json::to_string(&InjectUserMessage::new(text.to_string()))
        } else {
            serde_json::to_string(&InjectAgentMessage::new(text.to_string()))
        }
        .map_err(|e| AgentError::SendFailed(e.to_string()))?;

        self.send_text(frame).await
    }

    /// Aktualisiert den System-Prompt der laufenden Session
    pub async fn update_prompt(&self, prompt: &str) -> Result<(), AgentError> {
        let frame = serde_json::to_string(&UpdatePromptMessage::new(prompt.to_string()))
            .map_err(|e| AgentError::SendFailed(e.to_string()))?;
        self.send_text(frame).await
    }

    async fn send_text(&self, frame: String) -> Result<(), AgentError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AgentError::NotConnected);
        }
        self.out_tx
            .send(Message::Text(frame))
            .await
            .map_err(|_| AgentError::ConnectionClosed)
    }

    /// Schließt die Session
    ///
    /// Idempotent. Bricht Read-Loop und KeepAlive ab und wartet auf deren
    /// Ende, bevor die Handles fallen - danach läuft kein Handler mehr
    /// gegen diese Session.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let _ = self.out_tx.try_send(Message::Close(None));

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }

        tracing::info!(
            "Voice agent session {} closed ({} dropped frames)",
            self.id,
            self.dropped_frames()
        );
    }

    // ========================================================================
    // INTERNAL
    // ========================================================================

    /// Klassifiziert ein JSON-Event und gibt es nach außen weiter
    fn handle_event_frame(
        text: &str,
        ready_tx: &watch::Sender<bool>,
        event_tx: &broadcast::Sender<AgentEvent>,
    ) {
        let msg = match serde_json::from_str::<AgentMessage>(text) {
            Ok(msg) => msg,
            Err(_) => {
                // Unbekannte Event-Typen sind kein Fehler
                tracing::debug!("Unhandled voice agent event: {}", text);
                return;
            }
        };

        match msg {
            AgentMessage::Welcome { session_id } => {
                tracing::info!("Voice agent welcome (session={:?})", session_id);
            }
            AgentMessage::SettingsApplied {} => {
                tracing::info!("Voice agent settings applied");
                let _ = ready_tx.send(true);
                let _ = event_tx.send(AgentEvent::Ready);
            }
            AgentMessage::ConversationText { role, content } => match role.as_str() {
                "user" => {
                    tracing::info!("[caller] {}", content);
                    let _ = event_tx.send(AgentEvent::CallerTranscript { text: content });
                }
                "assistant" => {
                    tracing::info!("[agent] {}", content);
                    let _ = event_tx.send(AgentEvent::AgentText { text: content });
                }
                other => {
                    tracing::debug!("Conversation text with role '{}' ignored", other);
                }
            },
            AgentMessage::UserStartedSpeaking {} => {
                let _ = event_tx.send(AgentEvent::CallerStartedSpeaking);
            }
            AgentMessage::AgentThinking { .. } => {
                let _ = event_tx.send(AgentEvent::AgentThinking);
            }
            AgentMessage::AgentStartedSpeaking {} => {
                let _ = event_tx.send(AgentEvent::AgentStartedSpeaking);
            }
            AgentMessage::AgentAudioDone {} => {
                let _ = event_tx.send(AgentEvent::AgentAudioDone);
            }
            AgentMessage::Error { code, description } => {
                let code = code.unwrap_or_default();
                let description = description.unwrap_or_else(|| "unknown error".to_string());
                tracing::error!("Voice agent error [{}]: {}", code, description);
                let _ = event_tx.send(AgentEvent::ProviderError { code, description });
            }
            AgentMessage::Warning { description } => {
                let description = description.unwrap_or_default();
                tracing::warn!("Voice agent warning: {}", description);
                let _ = event_tx.send(AgentEvent::ProviderWarning { description });
            }
        }
    }
}

impl std::fmt::Debug for AgentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSession")
            .field("id", &self.id)
            .field("ready", &self.is_ready())
            .field("dropped_frames", &self.dropped_frames())
            .finish()
    }
}
