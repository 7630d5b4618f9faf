//! Voicelink - SIP Voice Agent
//!
//! Ein headless Service, der Anrufe vom Janus Gateway entgegennimmt und
//! pro Anruf mit einer Cloud-Voice-AI-Session verbindet:
//! - SIP-Registrierung an der PBX über das Gateway
//! - Anrufannahme und Lebenszyklus über eine State Machine
//! - Vollduplex-Audio-Bridge zwischen Telefonie-Strecke und Voice-AI
//!
//! Die beiden WebSocket-Verbindungen entwickeln sich unabhängig; der
//! Service ist die Stelle, an der ihre Events zusammenlaufen.

pub mod agent;
pub mod call_engine;
pub mod config;
pub mod gateway;

use agent::{AgentEvent, AgentSession};
use call_engine::{
    select_transcoder, AgentAudioSink, AudioBridge, BridgeEvent, CallEngine, CallEngineError,
    CallState, Transcoder,
};
use config::ServiceConfig;
use gateway::{EventDispatcher, GatewayClient, GatewayEvent};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Wartezeit auf die Settings-Bestätigung der Voice-AI
const SETTINGS_TIMEOUT: Duration = Duration::from_secs(10);

/// Kapazität des Anrufer-Audio-Kanals Richtung Bridge
const CALLER_AUDIO_CAPACITY: usize = 64;

// ============================================================================
// SERVICE
// ============================================================================

/// Der Orchestrator: Gateway-Events → State Machine → Voice-AI-Session
pub struct Service {
    config: ServiceConfig,
    gateway: Arc<GatewayClient>,
    engine: Arc<CallEngine>,
    agent: RwLock<Option<Arc<AgentSession>>>,
    bridge: RwLock<Option<Arc<AudioBridge>>>,
    shutting_down: AtomicBool,
}

impl Service {
    /// Erstellt den Service mit seiner Konfiguration
    pub fn new(config: ServiceConfig) -> Arc<Self> {
        let dispatcher = Arc::new(EventDispatcher::new());
        let gateway = Arc::new(GatewayClient::new(
            config.gateway.ws_url.clone(),
            config.gateway.api_secret.clone(),
            dispatcher,
        ));

        Arc::new(Self {
            config,
            gateway,
            engine: Arc::new(CallEngine::new()),
            agent: RwLock::new(None),
            bridge: RwLock::new(None),
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Aktueller Anrufzustand
    pub fn call_state(&self) -> CallState {
        self.engine.state()
    }

    /// Gateway-Client (für Diagnose)
    pub fn gateway(&self) -> &Arc<GatewayClient> {
        &self.gateway
    }

    /// Startet den Service: verbinden, Plugin anhängen, registrieren
    ///
    /// Das Ergebnis der Registrierung kommt asynchron als Event; bis dahin
    /// steht die Maschine auf Registering.
    pub async fn start(self: Arc<Self>) -> anyhow::Result<()> {
        tracing::info!("Starting voice agent service");

        Arc::clone(&self).register_handlers();

        tracing::info!("[1/3] Connecting to gateway...");
        self.gateway.connect().await?;
        self.gateway.attach_plugin().await?;

        tracing::info!("[2/3] Registering ext {} at the PBX...", self.config.sip.extension);
        self.engine.begin_registration()?;
        let sip = &self.config.sip;
        self.gateway
            .register(
                &sip.host,
                sip.port,
                &sip.extension,
                &sip.password,
                &sip.display_name,
            )
            .await?;

        tracing::info!("[3/3] Waiting for calls...");
        Ok(())
    }

    /// Operator-Pfad aus dem degradierten Zustand heraus
    pub async fn re_register(&self) -> anyhow::Result<()> {
        self.engine.begin_registration()?;
        let sip = &self.config.sip;
        self.gateway
            .register(
                &sip.host,
                sip.port,
                &sip.extension,
                &sip.password,
                &sip.display_name,
            )
            .await?;
        Ok(())
    }

    // ========================================================================
    // PUBLIC CALL API
    // ========================================================================

    /// Startet einen ausgehenden Anruf
    pub async fn dial(&self, uri: String) -> anyhow::Result<()> {
        self.engine.outgoing_call(uri.clone())?;
        if let Err(e) = self.gateway.call(uri).await {
            self.teardown_call("dial failed").await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Beendet den aktuellen Anruf lokal
    pub async fn hangup(&self) -> anyhow::Result<()> {
        if !self.engine.state().in_call() {
            anyhow::bail!("no active call");
        }
        self.teardown_call("local hangup").await;
        Ok(())
    }

    /// Sendet DTMF-Töne in den aktiven Anruf
    pub async fn send_dtmf(&self, tones: String) -> anyhow::Result<()> {
        match self.engine.state() {
            CallState::Active { .. } => {}
            other => anyhow::bail!("cannot send DTMF in state {}", other.name()),
        }
        self.gateway.send_dtmf(tones).await?;
        Ok(())
    }

    /// Injiziert eine synthetische Äußerung in die laufende Session
    pub async fn inject(&self, text: &str, as_user: bool) -> anyhow::Result<()> {
        let agent = self.agent.read().clone();
        match agent {
            Some(agent) => {
                agent.inject(text, as_user).await?;
                Ok(())
            }
            None => anyhow::bail!("no active voice agent session"),
        }
    }

    /// Aktualisiert den System-Prompt der laufenden Session
    pub async fn update_prompt(&self, prompt: &str) -> anyhow::Result<()> {
        let agent = self.agent.read().clone();
        match agent {
            Some(agent) => {
                agent.update_prompt(prompt).await?;
                Ok(())
            }
            None => anyhow::bail!("no active voice agent session"),
        }
    }

    /// Fährt den Service geordnet herunter
    ///
    /// Erst Anruf-Ressourcen (Bridge, Voice-AI-Session), dann beide
    /// Protokollverbindungen.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Shutting down service...");

        if self.engine.state().in_call() {
            self.teardown_call("service shutdown").await;
        }
        self.gateway.disconnect().await;

        tracing::info!("Service stopped");
    }

    // ========================================================================
    // EVENT HANDLERS
    // ========================================================================

    /// Registriert die Handler-Tabelle am Dispatcher (einmalig beim Start)
    fn register_handlers(self: Arc<Self>) {
        let dispatcher = self.gateway.dispatcher();

        let svc = Arc::clone(&self);
        dispatcher.on_event("registered", move |ev| {
            let svc = Arc::clone(&svc);
            async move { svc.on_registered(ev) }
        });

        let svc = Arc::clone(&self);
        dispatcher.on_event("registration_failed", move |ev| {
            let svc = Arc::clone(&svc);
            async move { svc.on_registration_failed(ev) }
        });

        let svc = Arc::clone(&self);
        dispatcher.on_event("incomingcall", move |ev| {
            let svc = Arc::clone(&svc);
            async move { svc.on_incoming_call(ev).await }
        });

        let svc = Arc::clone(&self);
        dispatcher.on_event("accepted", move |ev| {
            let svc = Arc::clone(&svc);
            async move { svc.on_accepted(ev).await }
        });

        let svc = Arc::clone(&self);
        dispatcher.on_event("hangup", move |ev| {
            let svc = Arc::clone(&svc);
            async move { svc.on_hangup(ev).await }
        });

        let svc = Arc::clone(&self);
        dispatcher.on_event("closed", move |ev| {
            let svc = Arc::clone(&svc);
            async move { svc.on_gateway_closed(ev).await }
        });

        dispatcher.on_event("calling", |_| async {
            tracing::info!("Outbound call in progress...");
        });

        dispatcher.on_event("ringing", |_| async {
            tracing::info!("Remote end is ringing...");
        });

        dispatcher.on_event("webrtcup", |_| async {
            tracing::info!("WebRTC peer connection is up");
        });

        dispatcher.on_event("media", |ev| async move {
            if let GatewayEvent::Media { kind, receiving } = ev {
                tracing::debug!("Media {:?}: receiving={:?}", kind, receiving);
            }
        });
    }

    /// Registrierung an der PBX bestätigt
    fn on_registered(&self, ev: GatewayEvent) {
        let username = match &ev {
            GatewayEvent::Plugin(ev) => ev.caller(),
            _ => None,
        };
        match self.engine.registration_succeeded() {
            Ok(()) => {
                tracing::info!(
                    "Registered as {} at the PBX, ready for calls",
                    username.unwrap_or_else(|| self.config.sip.extension.clone())
                );
            }
            Err(e) => tracing::debug!("Spurious registered event: {}", e),
        }
    }

    /// Registrierung fehlgeschlagen - laut melden, kein stiller Retry
    fn on_registration_failed(&self, ev: GatewayEvent) {
        let (code, reason) = match &ev {
            GatewayEvent::Plugin(ev) => (
                ev.result_code(),
                ev.result_reason().unwrap_or_else(|| "unknown".to_string()),
            ),
            _ => (None, "unknown".to_string()),
        };

        if let Err(e) = self.engine.registration_failed(code, reason.clone()) {
            tracing::debug!("Spurious registration_failed event: {}", e);
            return;
        }

        tracing::error!("Registration FAILED: {:?} - {}", code, reason);
        tracing::error!(
            "Check extension, password and PBX address; \
             incoming calls are rejected until an operator re-registers"
        );
    }

    /// Eingehender Anruf
    async fn on_incoming_call(self: Arc<Self>, ev: GatewayEvent) {
        let GatewayEvent::Plugin(ev) = ev else { return };
        let caller = ev.caller().unwrap_or_else(|| "unknown".to_string());
        tracing::info!("Incoming call from {}", caller);

        match self.engine.incoming_call(caller.clone(), ev.jsep.clone()) {
            Ok(()) => {}
            Err(CallEngineError::AlreadyInCall) => {
                tracing::warn!("Call already in progress, declining {}", caller);
                if let Err(e) = self.gateway.decline().await {
                    tracing::warn!("Decline failed: {}", e);
                }
                return;
            }
            Err(e) => {
                tracing::warn!("Not ready for calls ({}), declining {}", e, caller);
                if let Err(e) = self.gateway.decline().await {
                    tracing::warn!("Decline failed: {}", e);
                }
                return;
            }
        }

        // Annahme ans Gateway; die Voice-AI-Session startet erst mit der
        // Bestätigung (accepted-Event)
        if let Err(e) = self.engine.begin_accept() {
            tracing::warn!("Could not accept call: {}", e);
            return;
        }
        if let Err(e) = self.gateway.accept(None).await {
            tracing::error!("Accept failed: {}", e);
            self.teardown_call("accept failed").await;
        }
    }

    /// Gateway hat die Annahme bestätigt (bzw. die Gegenseite angenommen)
    async fn on_accepted(self: Arc<Self>, _ev: GatewayEvent) {
        match self.engine.state() {
            CallState::Accepting { .. } => {}
            CallState::Ringing { .. } => {
                // Ausgehender Anruf: die Gegenseite hat angenommen
                if let Err(e) = self.engine.begin_accept() {
                    tracing::debug!("Ignoring accepted event: {}", e);
                    return;
                }
            }
            other => {
                tracing::debug!("accepted event in state {}, ignoring", other.name());
                return;
            }
        }

        self.establish_media().await;
    }

    /// Die Gegenseite hat aufgelegt
    async fn on_hangup(self: Arc<Self>, ev: GatewayEvent) {
        let reason = match ev {
            GatewayEvent::Plugin(ev) => ev.result_reason(),
            GatewayEvent::Hangup { reason } => reason,
            _ => None,
        }
        .unwrap_or_else(|| "unknown".to_string());

        if !self.engine.state().in_call() {
            tracing::debug!("Hangup event without call ({}), ignoring", reason);
            return;
        }

        tracing::info!("Call ended by peer: {}", reason);
        self.teardown_call(&format!("peer hangup: {}", reason)).await;
    }

    /// Die Gateway-Verbindung ist weg
    ///
    /// Keine Reconnect-Policy: ein laufender Anruf wird abgebaut, danach
    /// bleibt der Service degradiert, bis der Operator eingreift.
    async fn on_gateway_closed(self: Arc<Self>, _ev: GatewayEvent) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }

        tracing::error!("Gateway connection lost");
        if self.engine.state().in_call() {
            self.teardown_call("gateway connection lost").await;
        }
    }

    // ========================================================================
    // MEDIA SETUP / TEARDOWN
    // ========================================================================

    /// Baut Voice-AI-Session und Audio-Bridge auf und aktiviert den Anruf
    ///
    /// Schlägt hier irgendetwas fehl, wird der Anruf abgebaut statt ohne
    /// AI-Backend aktiv zu bleiben.
    async fn establish_media(self: Arc<Self>) {
        tracing::info!("Starting voice agent session...");

        let agent = match AgentSession::connect(&self.config.agent).await {
            Ok(agent) => Arc::new(agent),
            Err(e) => {
                tracing::error!("Voice agent connect failed: {}", e);
                self.teardown_call("voice agent connect failed").await;
                return;
            }
        };

        if let Err(e) = agent.wait_ready(SETTINGS_TIMEOUT).await {
            tracing::error!("Voice agent not ready: {}", e);
            agent.close().await;
            self.teardown_call("voice agent not ready").await;
            return;
        }

        // Audio-Pfade verdrahten
        let agent_rx = match agent.take_audio_stream() {
            Some(rx) => rx,
            None => {
                agent.close().await;
                self.teardown_call("voice agent audio stream unavailable")
                    .await;
                return;
            }
        };
        let media_tx = match self.gateway.media_sender() {
            Ok(tx) => tx,
            Err(e) => {
                tracing::error!("Gateway media path unavailable: {}", e);
                agent.close().await;
                self.teardown_call("gateway media path unavailable").await;
                return;
            }
        };

        let (caller_tx, caller_rx) = mpsc::channel(CALLER_AUDIO_CAPACITY);
        self.gateway.dispatcher().set_audio_sink(caller_tx);

        let transcoder: Arc<dyn Transcoder> = Arc::from(select_transcoder(
            &self.config.agent.encoding,
            self.config.agent.sample_rate,
        ));

        let bridge = Arc::new(AudioBridge::start(
            caller_rx,
            Arc::clone(&agent) as Arc<dyn AgentAudioSink>,
            agent_rx,
            media_tx,
            transcoder,
        ));

        // Bridge-Fehler sind fatal für den Anruf
        let mut bridge_events = bridge.subscribe();
        let svc = Arc::clone(&self);
        tokio::spawn(async move {
            while let Ok(event) = bridge_events.recv().await {
                match event {
                    BridgeEvent::Fault { direction, reason } => {
                        tracing::error!("Audio bridge fault ({:?}): {}", direction, reason);
                        svc.teardown_call("media fault").await;
                        break;
                    }
                }
            }
        });

        // Agent-Events: Barge-in relayen, Verbindungsverlust abbauen
        let mut agent_events = agent.subscribe();
        let svc = Arc::clone(&self);
        let event_bridge = Arc::clone(&bridge);
        tokio::spawn(async move {
            while let Ok(event) = agent_events.recv().await {
                match event {
                    AgentEvent::CallerStartedSpeaking => {
                        // Barge-in: gestaute Agent-Sprache verwerfen, bevor
                        // irgendetwas anderes passiert
                        event_bridge.interrupt();
                    }
                    AgentEvent::AgentAudioDone => {
                        tracing::debug!("Agent finished speaking");
                    }
                    AgentEvent::ProviderError { code, description } => {
                        tracing::error!("Voice agent error [{}]: {}", code, description);
                    }
                    AgentEvent::Closed => {
                        svc.teardown_call("voice agent connection closed").await;
                        break;
                    }
                    _ => {}
                }
            }
        });

        *self.agent.write() = Some(Arc::clone(&agent));
        *self.bridge.write() = Some(bridge);

        if let Err(e) = self.engine.activate() {
            // Zustand hat sich unter uns geändert (z.B. Peer-Hangup während
            // des Verbindungsaufbaus)
            tracing::warn!("Could not activate call: {}", e);
            self.teardown_call("activation failed").await;
            return;
        }

        let caller = self
            .engine
            .session()
            .map(|s| s.caller)
            .unwrap_or_else(|| "unknown".to_string());
        tracing::info!("Call active with {} - voice agent connected", caller);
    }

    /// Baut den aktuellen Anruf ab
    ///
    /// Reihenfolge: Bridge stoppen, Audio-Senke lösen, Voice-AI-Session
    /// schließen, dann Gateway-Hangup, dann Session-Slot räumen. Erst
    /// danach kann der nächste Anruf angenommen werden.
    async fn teardown_call(&self, reason: &str) {
        let began = self.engine.begin_hangup(reason).is_ok();

        let bridge = self.bridge.write().take();
        if let Some(bridge) = bridge {
            bridge.stop().await;
        }
        self.gateway.dispatcher().clear_audio_sink();

        let agent = self.agent.write().take();
        if let Some(agent) = agent {
            agent.close().await;
        }

        if !began {
            // Abbau lief bereits woanders; hier gab es nur Reste zu räumen
            return;
        }

        if self.gateway.is_connected() {
            if let Err(e) = self.gateway.hangup().await {
                tracing::warn!("Hangup request failed: {}", e);
            }
        }

        if let Err(e) = self.engine.finish_hangup() {
            tracing::debug!("finish_hangup: {}", e);
        }
        tracing::info!("Waiting for next call...");
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("call_state", &self.call_state())
            .field("gateway", &self.gateway)
            .finish()
    }
}
