//! Event Dispatcher für unaufgeforderte Gateway-Nachrichten
//!
//! Nachrichten ohne offene Transaktion werden hier anhand ihrer
//! Event-Diskriminante an registrierte Handler verteilt. Handler laufen
//! immer auf einem eigenen Task, damit die Read-Loop des Sockets nie auf
//! Handler-Arbeit wartet (ein langsamer Handler darf weder Keepalives noch
//! die Transaktionsauflösung aufhalten).
//!
//! Binäre Frames (Audio der Media-Strecke) gehen ohne JSON-Decoding an die
//! registrierte Audio-Senke.

use crate::gateway::messages::PluginEvent;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Events, die der Dispatcher an Handler verteilt
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// SIP-Plugin-Event (registered, incomingcall, hangup, ...)
    Plugin(PluginEvent),

    /// PeerConnection steht
    WebrtcUp,

    /// Media-Status der Verbindung
    Media {
        kind: Option<String>,
        receiving: Option<bool>,
    },

    /// Verbindungsseitiger Hangup (PeerConnection abgebaut)
    Hangup { reason: Option<String> },

    /// WebSocket zum Gateway wurde geschlossen
    Closed,
}

impl GatewayEvent {
    /// Schlüssel, unter dem der passende Handler registriert ist
    pub fn key(&self) -> &str {
        match self {
            GatewayEvent::Plugin(ev) => &ev.event,
            GatewayEvent::WebrtcUp => "webrtcup",
            GatewayEvent::Media { .. } => "media",
            GatewayEvent::Hangup { .. } => "hangup",
            GatewayEvent::Closed => "closed",
        }
    }
}

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type EventHandler = Arc<dyn Fn(GatewayEvent) -> BoxFuture + Send + Sync>;

/// Verteilt Gateway-Events an registrierte Handler
///
/// Die Handler-Tabelle wird beim Start befüllt und danach nur noch gelesen.
pub struct EventDispatcher {
    handlers: RwLock<HashMap<String, EventHandler>>,
    audio_sink: RwLock<Option<mpsc::Sender<Vec<u8>>>>,
    dropped_events: AtomicU64,
    dropped_frames: AtomicU64,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            audio_sink: RwLock::new(None),
            dropped_events: AtomicU64::new(0),
            dropped_frames: AtomicU64::new(0),
        }
    }

    /// Registriert einen Handler für einen Event-Typ
    ///
    /// Pro Event-Typ gibt es genau einen Handler; erneutes Registrieren
    /// ersetzt den alten.
    pub fn on_event<F, Fut>(&self, event: &str, handler: F)
    where
        F: Fn(GatewayEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: EventHandler = Arc::new(move |ev| Box::pin(handler(ev)));
        self.handlers.write().insert(event.to_string(), handler);
    }

    /// Registriert die Senke für binäre Audio-Frames
    pub fn set_audio_sink(&self, sink: mpsc::Sender<Vec<u8>>) {
        *self.audio_sink.write() = Some(sink);
    }

    /// Entfernt die Audio-Senke (Call-Teardown)
    pub fn clear_audio_sink(&self) {
        *self.audio_sink.write() = None;
    }

    /// Verteilt ein Event an seinen Handler
    ///
    /// Der Handler wird auf einem eigenen Task gestartet; dispatch kehrt
    /// sofort zurück. Events ohne registrierten Handler werden geloggt und
    /// verworfen - das ist kein Fehler.
    pub fn dispatch(&self, event: GatewayEvent) {
        let handler = self.handlers.read().get(event.key()).cloned();
        match handler {
            Some(handler) => {
                tokio::spawn(handler(event));
            }
            None => {
                self.dropped_events.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("No handler for gateway event '{}', dropping", event.key());
            }
        }
    }

    /// Leitet einen binären Frame an die Audio-Senke weiter
    ///
    /// try_send statt send: die Read-Loop darf nicht auf eine volle Senke
    /// warten, der Frame wird stattdessen verworfen.
    pub fn dispatch_binary(&self, frame: Vec<u8>) {
        let sink = self.audio_sink.read().clone();
        match sink {
            Some(sink) => {
                if sink.try_send(frame).is_err() {
                    self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!("Audio sink full or gone, dropping media frame");
                }
            }
            None => {
                self.dropped_frames.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Anzahl verworfener Events ohne Handler
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Anzahl verworfener Media-Frames
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("handlers", &self.handlers.read().len())
            .field("dropped_events", &self.dropped_events())
            .field("dropped_frames", &self.dropped_frames())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn plugin_event(name: &str) -> GatewayEvent {
        GatewayEvent::Plugin(PluginEvent {
            event: name.to_string(),
            result: Value::Null,
            jsep: None,
            sender: None,
        })
    }

    #[tokio::test]
    async fn test_dispatch_routes_by_key() {
        let dispatcher = EventDispatcher::new();
        let (tx, mut rx) = mpsc::channel::<String>(8);

        dispatcher.on_event("incomingcall", move |ev| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(ev.key().to_string()).await;
            }
        });

        dispatcher.dispatch(plugin_event("incomingcall"));

        let key = rx.recv().await.expect("handler ran");
        assert_eq!(key, "incomingcall");
    }

    #[tokio::test]
    async fn test_unregistered_event_is_dropped() {
        let dispatcher = EventDispatcher::new();

        dispatcher.dispatch(plugin_event("progress"));
        // Kein Handler: Event wird gezählt und verworfen
        assert_eq!(dispatcher.dropped_events(), 1);
    }

    #[tokio::test]
    async fn test_slow_handler_does_not_block_dispatch() {
        let dispatcher = EventDispatcher::new();
        let (tx, mut rx) = mpsc::channel::<&'static str>(8);

        dispatcher.on_event("media", move |_| {
            let tx = tx.clone();
            async move {
                tokio::time::sleep(std::time::Duration::from_secs(60)).await;
                let _ = tx.send("done").await;
            }
        });

        // dispatch darf nicht auf den schlafenden Handler warten
        let start = std::time::Instant::now();
        dispatcher.dispatch(GatewayEvent::Media {
            kind: Some("audio".to_string()),
            receiving: Some(true),
        });
        assert!(start.elapsed() < std::time::Duration::from_millis(100));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_binary_frames_reach_audio_sink() {
        let dispatcher = EventDispatcher::new();
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(4);
        dispatcher.set_audio_sink(tx);

        dispatcher.dispatch_binary(vec![1, 2, 3]);

        assert_eq!(rx.recv().await.unwrap(), vec![1, 2, 3]);
        assert_eq!(dispatcher.dropped_frames(), 0);
    }

    #[tokio::test]
    async fn test_binary_frames_without_sink_are_counted() {
        let dispatcher = EventDispatcher::new();

        dispatcher.dispatch_binary(vec![0; 160]);
        assert_eq!(dispatcher.dropped_frames(), 1);
    }

    #[tokio::test]
    async fn test_binary_frames_dropped_when_sink_full() {
        let dispatcher = EventDispatcher::new();
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(1);
        dispatcher.set_audio_sink(tx);

        dispatcher.dispatch_binary(vec![1]);
        dispatcher.dispatch_binary(vec![2]);

        assert_eq!(dispatcher.dropped_frames(), 1);
        assert_eq!(rx.recv().await.unwrap(), vec![1]);
    }
}
