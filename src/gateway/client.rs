//! WebSocket Client für das Janus Gateway
//!
//! Verwaltet die langlebige Verbindung zum Gateway:
//! - Session anlegen und SIP-Plugin anhängen
//! - Korrelierte Anfragen (register, call, accept, hangup, dtmf)
//! - Read-Loop mit Transaktionsauflösung und Event-Dispatch
//! - Periodisches Session-Keepalive
//!
//! Antworten und Events teilen sich denselben Stream: die Read-Loop prüft
//! zuerst die Transaktionstabelle und reicht alles Übrige an den
//! Event-Dispatcher weiter.

use crate::gateway::dispatch::{EventDispatcher, GatewayEvent};
use crate::gateway::messages::*;
use crate::gateway::transact::TransactionTable;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{connect_async, tungstenite::Message};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Timeout für Verbindungs-Requests (create, attach, keepalive, destroy)
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout für Plugin-Requests, die SIP-Verhandlung anstoßen
pub const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Intervall des Session-Keepalives (Janus räumt Sessions nach 60s ab)
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(25);

/// Kapazität des Schreib-Channels
const OUTBOUND_CAPACITY: usize = 100;

/// Kapazität des Media-Frame-Channels Richtung Gateway
const MEDIA_CAPACITY: usize = 64;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to gateway")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("No response from gateway within {0:?}")]
    Timeout(Duration),

    #[error("Gateway error {code}: {reason}")]
    Remote { code: i64, reason: String },

    #[error("Gateway connection closed")]
    ConnectionClosed,

    #[error("Protocol violation: {0}")]
    Protocol(String),
}

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ClientState {
    is_connected: bool,
    session_id: Option<u64>,
    handle_id: Option<u64>,
}

// ============================================================================
// GATEWAY CLIENT
// ============================================================================

/// WebSocket Client für die Gateway-Kommunikation
pub struct GatewayClient {
    ws_url: String,
    api_secret: Option<String>,
    state: Arc<RwLock<ClientState>>,
    out_tx: RwLock<Option<mpsc::Sender<Message>>>,
    media_tx: RwLock<Option<mpsc::Sender<Vec<u8>>>>,
    transactions: TransactionTable,
    dispatcher: Arc<EventDispatcher>,
    closed: AtomicBool,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl GatewayClient {
    /// Erstellt einen neuen GatewayClient
    pub fn new(
        ws_url: String,
        api_secret: Option<String>,
        dispatcher: Arc<EventDispatcher>,
    ) -> Self {
        Self {
            ws_url,
            api_secret,
            state: Arc::new(RwLock::new(ClientState::default())),
            out_tx: RwLock::new(None),
            media_tx: RwLock::new(None),
            transactions: TransactionTable::new(),
            dispatcher,
            closed: AtomicBool::new(false),
            tasks: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Prüft ob verbunden
    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    /// Gateway-Session-Id (falls verbunden)
    pub fn session_id(&self) -> Option<u64> {
        self.state.read().session_id
    }

    /// Plugin-Handle-Id (falls angehängt)
    pub fn handle_id(&self) -> Option<u64> {
        self.state.read().handle_id
    }

    /// Event-Dispatcher dieser Verbindung
    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    /// Verbindet zum Gateway und legt eine Session an
    ///
    /// Startet Writer-, Read-Loop- und Keepalive-Task. Gibt die Session-Id
    /// zurück.
    pub async fn connect(&self) -> Result<u64, GatewayError> {
        tracing::info!("Connecting to gateway: {}", self.ws_url);

        let mut request = self
            .ws_url
            .as_str()
            .into_client_request()
            .map_err(|e| GatewayError::ConnectionFailed(e.to_string()))?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static("janus-protocol"),
        );

        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|e| GatewayError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        // Writer-Task: serialisiert alle ausgehenden Frames
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(OUTBOUND_CAPACITY);
        *self.out_tx.write() = Some(out_tx.clone());

        let write_task = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if let Err(e) = write.send(msg).await {
                    tracing::error!("Failed to send gateway message: {}", e);
                    break;
                }
            }
        });

        // Media-Forwarder: binäre Frames Richtung Gateway
        let (media_tx, mut media_rx) = mpsc::channel::<Vec<u8>>(MEDIA_CAPACITY);
        *self.media_tx.write() = Some(media_tx);

        let media_out = out_tx.clone();
        let media_task = tokio::spawn(async move {
            while let Some(frame) = media_rx.recv().await {
                if media_out.send(Message::Binary(frame)).await.is_err() {
                    break;
                }
            }
        });

        {
            let mut state = self.state.write();
            state.is_connected = true;
        }

        // Read-Loop: Transaktionen zuerst, Rest an den Dispatcher
        let state_clone = Arc::clone(&self.state);
        let transactions = self.transactions.clone();
        let dispatcher = Arc::clone(&self.dispatcher);

        let read_task = tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => {
                        Self::handle_text_frame(&text, &transactions, &dispatcher);
                    }
                    Ok(Message::Binary(data)) => {
                        dispatcher.dispatch_binary(data);
                    }
                    Ok(Message::Close(_)) => {
                        tracing::info!("Gateway closed the WebSocket");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!("Gateway WebSocket error: {}", e);
                        break;
                    }
                }
            }

            {
                let mut state = state_clone.write();
                state.is_connected = false;
            }
            // Wartende Aufrufer sehen einen geschlossenen Kanal
            transactions.clear();
            dispatcher.dispatch(GatewayEvent::Closed);
        });

        self.tasks
            .lock()
            .extend([write_task, media_task, read_task]);

        // Session anlegen
        let session_id = match self
            .send_request(GatewayRequest::create, CONTROL_TIMEOUT)
            .await?
        {
            ServerMessage::Success {
                data: Some(data), ..
            } => data.id,
            other => {
                return Err(GatewayError::Protocol(format!(
                    "unexpected create response: {:?}",
                    other
                )))
            }
        };

        self.state.write().session_id = Some(session_id);
        tracing::info!("Gateway session created: {}", session_id);

        self.start_keepalive(session_id);

        Ok(session_id)
    }

    /// Hängt das SIP-Plugin an die Session an
    pub async fn attach_plugin(&self) -> Result<u64, GatewayError> {
        let session_id = self.session_id().ok_or(GatewayError::NotConnected)?;

        let handle_id = match self
            .send_request(
                move |tx| GatewayRequest::attach(tx, session_id),
                CONTROL_TIMEOUT,
            )
            .await?
        {
            ServerMessage::Success {
                data: Some(data), ..
            } => data.id,
            other => {
                return Err(GatewayError::Protocol(format!(
                    "unexpected attach response: {:?}",
                    other
                )))
            }
        };

        self.state.write().handle_id = Some(handle_id);
        tracing::info!("SIP plugin attached (handle={})", handle_id);
        Ok(handle_id)
    }

    // ========================================================================
    // SIP REQUESTS
    // ========================================================================

    /// Registriert die Extension an der PBX
    pub async fn register(
        &self,
        host: &str,
        port: u16,
        extension: &str,
        password: &str,
        display_name: &str,
    ) -> Result<(), GatewayError> {
        tracing::info!("Registering ext {} at {}:{}...", extension, host, port);
        let body = RegisterBody::new(host, port, extension, password, display_name);
        self.plugin_request(serde_json::to_value(body).unwrap(), None)
            .await?;
        Ok(())
    }

    /// Startet einen ausgehenden Anruf
    pub async fn call(&self, uri: String) -> Result<(), GatewayError> {
        tracing::info!("Calling {}...", uri);
        let body = CallBody::new(uri);
        self.plugin_request(serde_json::to_value(body).unwrap(), None)
            .await?;
        Ok(())
    }

    /// Nimmt einen eingehenden Anruf an (mit opakem SDP-Answer)
    pub async fn accept(&self, jsep: Option<Jsep>) -> Result<(), GatewayError> {
        let body = AcceptBody::new();
        self.plugin_request(serde_json::to_value(body).unwrap(), jsep)
            .await?;
        Ok(())
    }

    /// Beendet den aktuellen Anruf
    pub async fn hangup(&self) -> Result<(), GatewayError> {
        let body = HangupBody::new();
        self.plugin_request(serde_json::to_value(body).unwrap(), None)
            .await?;
        Ok(())
    }

    /// Weist einen eingehenden Anruf ab (486 Busy Here)
    ///
    /// Anders als `hangup` lässt das einen parallel laufenden Anruf
    /// unberührt.
    pub async fn decline(&self) -> Result<(), GatewayError> {
        let body = DeclineBody::new();
        self.plugin_request(serde_json::to_value(body).unwrap(), None)
            .await?;
        Ok(())
    }

    /// Sendet DTMF-Töne in den aktiven Anruf
    pub async fn send_dtmf(&self, tones: String) -> Result<(), GatewayError> {
        let body = DtmfBody::new(tones);
        self.plugin_request(serde_json::to_value(body).unwrap(), None)
            .await?;
        Ok(())
    }

    /// Sender für Media-Frames Richtung Anrufer
    ///
    /// Der Kanal schließt, wenn die Verbindung fällt - ein fehlgeschlagenes
    /// Senden ist für den Aufrufer das Signal, den Anruf abzubauen.
    pub fn media_sender(&self) -> Result<mpsc::Sender<Vec<u8>>, GatewayError> {
        self.media_tx
            .read()
            .clone()
            .ok_or(GatewayError::NotConnected)
    }

    // ========================================================================
    // INTERNAL
    // ========================================================================

    /// Verarbeitet einen Text-Frame der Read-Loop
    ///
    /// Nachrichten mit offener Transaktion lösen deren Slot auf; alles
    /// andere geht an den Dispatcher. Unlesbare Frames werden geloggt und
    /// verworfen, nie eskaliert.
    fn handle_text_frame(
        text: &str,
        transactions: &TransactionTable,
        dispatcher: &Arc<EventDispatcher>,
    ) {
        let msg = match serde_json::from_str::<ServerMessage>(text) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!("Malformed gateway message ({}): {}", e, text);
                return;
            }
        };

        if let Some(tx) = msg.transaction() {
            let tx = tx.to_string();
            if transactions.resolve(&tx, msg.clone()) {
                return;
            }
        }

        match msg {
            ServerMessage::Event { .. } => match PluginEvent::from_message(&msg) {
                Some(event) => dispatcher.dispatch(GatewayEvent::Plugin(event)),
                None => tracing::debug!("Gateway event without plugin payload, ignoring"),
            },
            ServerMessage::Webrtcup { .. } => dispatcher.dispatch(GatewayEvent::WebrtcUp),
            ServerMessage::Media {
                kind, receiving, ..
            } => dispatcher.dispatch(GatewayEvent::Media { kind, receiving }),
            ServerMessage::Hangup { reason, .. } => {
                dispatcher.dispatch(GatewayEvent::Hangup { reason })
            }
            ServerMessage::Timeout { session_id } => {
                tracing::warn!("Gateway session {:?} timed out", session_id);
            }
            ServerMessage::Detached { .. } => {
                tracing::debug!("SIP plugin handle detached");
            }
            other => {
                tracing::debug!("Unmatched gateway reply: {:?}", other);
            }
        }
    }

    /// Sendet eine korrelierte Anfrage und wartet auf die Antwort
    ///
    /// Der Transaktions-Slot wird vor dem Senden registriert. Bei Timeout
    /// wird er entfernt, damit eine verspätete Antwort nicht einer späteren
    /// Anfrage zugeordnet wird.
    async fn send_request<F>(
        &self,
        build: F,
        timeout: Duration,
    ) -> Result<ServerMessage, GatewayError>
    where
        F: FnOnce(String) -> GatewayRequest,
    {
        let out_tx = self
            .out_tx
            .read()
            .clone()
            .ok_or(GatewayError::NotConnected)?;

        let tx_id = self.transactions.next_id();
        let mut request = build(tx_id.clone());
        if request.apisecret.is_none() {
            request.apisecret = self.api_secret.clone();
        }

        let reply = self.transactions.register(tx_id.clone());

        let text = serde_json::to_string(&request)
            .map_err(|e| GatewayError::SendFailed(e.to_string()))?;
        if out_tx.send(Message::Text(text)).await.is_err() {
            self.transactions.forget(&tx_id);
            return Err(GatewayError::ConnectionClosed);
        }

        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(ServerMessage::Error { error, .. })) => Err(GatewayError::Remote {
                code: error.code,
                reason: error.reason,
            }),
            Ok(Ok(msg)) => Ok(msg),
            // Slot wurde beim Verbindungsabbau verworfen
            Ok(Err(_)) => Err(GatewayError::ConnectionClosed),
            Err(_) => {
                self.transactions.forget(&tx_id);
                Err(GatewayError::Timeout(timeout))
            }
        }
    }

    /// Sendet eine Plugin-Nachricht an das SIP-Plugin
    async fn plugin_request(
        &self,
        body: serde_json::Value,
        jsep: Option<Jsep>,
    ) -> Result<ServerMessage, GatewayError> {
        let (session_id, handle_id) = {
            let state = self.state.read();
            (
                state.session_id.ok_or(GatewayError::NotConnected)?,
                state.handle_id.ok_or(GatewayError::NotConnected)?,
            )
        };

        self.send_request(
            move |tx| GatewayRequest::plugin_message(tx, session_id, handle_id, body, jsep),
            NEGOTIATION_TIMEOUT,
        )
        .await
    }

    /// Startet den Keepalive-Task für die Session
    ///
    /// Sende-Fehler beenden den Task; der eigentliche Verbindungsverlust
    /// wird von der Read-Loop über das Close-Event erkannt.
    fn start_keepalive(&self, session_id: u64) {
        let out_tx = match self.out_tx.read().clone() {
            Some(tx) => tx,
            None => return,
        };
        let transactions = self.transactions.clone();
        let api_secret = self.api_secret.clone();
        let state = Arc::clone(&self.state);

        let keepalive_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(KEEPALIVE_INTERVAL);
            interval.tick().await; // erster Tick feuert sofort
            loop {
                interval.tick().await;

                if !state.read().is_connected {
                    break;
                }

                let tx_id = transactions.next_id();
                let mut request = GatewayRequest::keepalive(tx_id.clone(), session_id);
                request.apisecret = api_secret.clone();
                let reply = transactions.register(tx_id.clone());

                let text = match serde_json::to_string(&request) {
                    Ok(text) => text,
                    Err(_) => break,
                };
                if out_tx.send(Message::Text(text)).await.is_err() {
                    transactions.forget(&tx_id);
                    tracing::warn!("Keepalive send failed, stopping keepalive task");
                    break;
                }

                match tokio::time::timeout(CONTROL_TIMEOUT, reply).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(_)) => break,
                    Err(_) => {
                        transactions.forget(&tx_id);
                        tracing::warn!("Keepalive timed out");
                    }
                }
            }
        });

        self.tasks.lock().push(keepalive_task);
    }

    /// Baut die Verbindung ab
    ///
    /// Idempotent. Versucht noch ein `destroy` für die Session, bricht dann
    /// alle Tasks ab und wartet auf deren Ende, bevor die Handles fallen.
    pub async fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(session_id) = self.session_id() {
            if self.is_connected() {
                let _ = self
                    .send_request(
                        move |tx| GatewayRequest::destroy(tx, session_id),
                        CONTROL_TIMEOUT,
                    )
                    .await;
            }
        }

        {
            let mut state = self.state.write();
            state.is_connected = false;
            state.session_id = None;
            state.handle_id = None;
        }
        *self.out_tx.write() = None;
        *self.media_tx.write() = None;
        self.transactions.clear();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }

        tracing::info!("Disconnected from gateway");
    }
}

impl std::fmt::Debug for GatewayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayClient")
            .field("ws_url", &self.ws_url)
            .field("state", &*self.state.read())
            .field("transactions", &self.transactions)
            .finish()
    }
}
