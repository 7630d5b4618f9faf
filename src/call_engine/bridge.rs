//! Audio Bridge - Frame-Relay zwischen Telefonie-Strecke und Voice-AI
//!
//! Vollduplex mit begrenzter Latenz:
//! - Anrufer → Agent: Frames in Ankunftsreihenfolge; solange die Session
//!   nicht bereit ist, wird verworfen statt gepuffert
//! - Agent → Anrufer: Transkodierung, dann Auslieferung in Reihenfolge über
//!   einen begrenzten Ring-Puffer; bei Stau fällt der neueste Frame weg
//! - Barge-in: `interrupt()` verwirft alles, was noch Richtung Anrufer
//!   ansteht - gestaute Agent-Sprache darf nach dem Einsetzen des Anrufers
//!   nicht mehr ankommen
//! - Schreibfehler auf einem der Pfade sind fatal für den Anruf

use crate::call_engine::transcode::Transcoder;
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Kapazität des Warte-Puffers Richtung Anrufer (Frames, ~1s bei 20ms)
const PENDING_CAPACITY: usize = 50;

// ============================================================================
// AUDIO FRAME
// ============================================================================

/// Richtung eines Frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    CallerToAgent,
    AgentToCaller,
}

/// Ein unveränderlicher Audio-Frame mit Sequenznummer (Diagnose)
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub payload: Vec<u8>,
    pub direction: Direction,
    pub seq: u64,
}

// ============================================================================
// BRIDGE EVENTS
// ============================================================================

/// Events der Bridge Richtung Service
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    /// Schreibfehler - fatal für den laufenden Anruf
    Fault {
        direction: Direction,
        reason: String,
    },
}

/// Senke für Anrufer-Audio Richtung Voice-AI
///
/// Von der Session implementiert; Tests hängen hier eigene Senken ein.
pub trait AgentAudioSink: Send + Sync + 'static {
    fn send_audio(&self, frame: Vec<u8>);
}

impl AgentAudioSink for crate::agent::AgentSession {
    fn send_audio(&self, frame: Vec<u8>) {
        // Inherente Methode der Session, nicht der Trait
        crate::agent::AgentSession::send_audio(self, frame)
    }
}

// ============================================================================
// AUDIO BRIDGE
// ============================================================================

/// Vollduplex-Relay für genau einen Anruf
pub struct AudioBridge {
    generation: Arc<AtomicU64>,
    stopped: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    discarded: Arc<AtomicU64>,
    event_tx: broadcast::Sender<BridgeEvent>,
    notify: Arc<Notify>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AudioBridge {
    /// Startet beide Relay-Richtungen
    ///
    /// - `caller_rx`: Frames der Telefonie-Strecke (Ankunftsreihenfolge)
    /// - `agent_sink`: Audio-Eingang der Voice-AI-Session
    /// - `agent_rx`: TTS-Audio der Voice-AI
    /// - `media_tx`: Frames Richtung Anrufer; ein geschlossener Kanal gilt
    ///   als Schreibfehler
    pub fn start(
        mut caller_rx: mpsc::Receiver<Vec<u8>>,
        agent_sink: Arc<dyn AgentAudioSink>,
        mut agent_rx: mpsc::Receiver<Vec<u8>>,
        media_tx: mpsc::Sender<Vec<u8>>,
        transcoder: Arc<dyn Transcoder>,
    ) -> Self {
        let generation = Arc::new(AtomicU64::new(0));
        let stopped = Arc::new(AtomicBool::new(false));
        let dropped = Arc::new(AtomicU64::new(0));
        let discarded = Arc::new(AtomicU64::new(0));
        let (event_tx, _) = broadcast::channel(16);
        let notify = Arc::new(Notify::new());

        // Warte-Puffer Richtung Anrufer: (Generation, Frame)
        let pending: Arc<Mutex<HeapRb<(u64, AudioFrame)>>> =
            Arc::new(Mutex::new(HeapRb::new(PENDING_CAPACITY)));

        // ── Anrufer → Agent ─────────────────────────────────────────────
        let to_agent_transcoder = Arc::clone(&transcoder);
        let to_agent_stopped = Arc::clone(&stopped);
        let to_agent_events = event_tx.clone();
        let caller_seq = Arc::new(AtomicU64::new(0));

        let to_agent_task = tokio::spawn(async move {
            while let Some(payload) = caller_rx.recv().await {
                if to_agent_stopped.load(Ordering::SeqCst) {
                    break;
                }
                let seq = caller_seq.fetch_add(1, Ordering::Relaxed);
                tracing::trace!("caller frame #{} ({} bytes)", seq, payload.len());
                let frame = to_agent_transcoder.to_agent(&payload);
                agent_sink.send_audio(frame);
            }

            // Kanal zu, ohne dass die Bridge gestoppt wurde: Media-Pfad weg
            if !to_agent_stopped.load(Ordering::SeqCst) {
                let _ = to_agent_events.send(BridgeEvent::Fault {
                    direction: Direction::CallerToAgent,
                    reason: "media path closed".to_string(),
                });
            }
        });

        // ── Agent → Anrufer: Transkodieren und Einreihen ────────────────
        let enqueue_pending = Arc::clone(&pending);
        let enqueue_generation = Arc::clone(&generation);
        let enqueue_dropped = Arc::clone(&dropped);
        let enqueue_notify = Arc::clone(&notify);
        let agent_seq = Arc::new(AtomicU64::new(0));

        let enqueue_task = tokio::spawn(async move {
            while let Some(payload) = agent_rx.recv().await {
                let seq = agent_seq.fetch_add(1, Ordering::Relaxed);
                let frame = AudioFrame {
                    payload: transcoder.to_caller(&payload),
                    direction: Direction::AgentToCaller,
                    seq,
                };
                let generation = enqueue_generation.load(Ordering::SeqCst);

                // Voller Puffer: der neueste Frame fällt weg, nie der Stau
                if enqueue_pending.lock().try_push((generation, frame)).is_err() {
                    enqueue_dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!("pending buffer full, dropping agent frame #{}", seq);
                } else {
                    enqueue_notify.notify_one();
                }
            }
        });

        // ── Agent → Anrufer: Ausliefern ─────────────────────────────────
        let deliver_pending = Arc::clone(&pending);
        let deliver_generation = Arc::clone(&generation);
        let deliver_discarded = Arc::clone(&discarded);
        let deliver_notify = Arc::clone(&notify);
        let deliver_stopped = Arc::clone(&stopped);
        let deliver_events = event_tx.clone();

        let deliver_task = tokio::spawn(async move {
            'outer: loop {
                // Erst Sendekapazität reservieren, dann den nächsten Frame
                // ziehen: so wartet nie ein schon gezogener Frame im
                // Sendepfad und der Barge-in-Check passiert unmittelbar vor
                // der Übergabe
                let permit = match media_tx.reserve().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        let _ = deliver_events.send(BridgeEvent::Fault {
                            direction: Direction::AgentToCaller,
                            reason: "telephony write path closed".to_string(),
                        });
                        break;
                    }
                };

                loop {
                    let entry = deliver_pending.lock().try_pop();
                    match entry {
                        Some((frame_generation, frame)) => {
                            // Barge-in: Frames aus einer älteren Generation
                            // sind veraltet und erreichen den Anrufer nicht
                            if frame_generation < deliver_generation.load(Ordering::SeqCst) {
                                deliver_discarded.fetch_add(1, Ordering::Relaxed);
                                continue;
                            }
                            permit.send(frame.payload);
                            continue 'outer;
                        }
                        None => {
                            if deliver_stopped.load(Ordering::SeqCst) {
                                break 'outer;
                            }
                            deliver_notify.notified().await;
                        }
                    }
                }
            }
        });

        Self {
            generation,
            stopped,
            dropped,
            discarded,
            event_tx,
            notify,
            tasks: Mutex::new(vec![to_agent_task, enqueue_task, deliver_task]),
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.event_tx.subscribe()
    }

    /// Barge-in: verwirft alle Richtung Anrufer anstehenden Agent-Frames
    ///
    /// Alles, was vor diesem Aufruf eingereiht wurde, gilt als veraltet.
    pub fn interrupt(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        // Aufwecken, damit der Auslieferer veraltete Frames sofort räumt
        self.notify.notify_one();
        tracing::debug!("barge-in: flushed pending agent audio");
    }

    /// Anzahl wegen Stau verworfener Agent-Frames
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Anzahl durch Barge-in verworfener Agent-Frames
    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    /// Stoppt beide Richtungen
    ///
    /// Bricht die Relay-Tasks ab und wartet auf deren Ende; danach schreibt
    /// die Bridge garantiert auf keinen Pfad mehr.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.notify.notify_one();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }

        tracing::debug!(
            "audio bridge stopped ({} dropped, {} discarded)",
            self.dropped(),
            self.discarded()
        );
    }
}

impl std::fmt::Debug for AudioBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioBridge")
            .field("stopped", &self.stopped.load(Ordering::SeqCst))
            .field("dropped", &self.dropped())
            .field("discarded", &self.discarded())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_engine::transcode::Passthrough;
    use std::time::Duration;

    /// Test-Senke: sammelt Frames in einem Channel
    struct RecordingSink {
        tx: mpsc::UnboundedSender<Vec<u8>>,
    }

    impl AgentAudioSink for RecordingSink {
        fn send_audio(&self, frame: Vec<u8>) {
            let _ = self.tx.send(frame);
        }
    }

    struct TestBridge {
        bridge: AudioBridge,
        caller_tx: mpsc::Sender<Vec<u8>>,
        agent_tx: mpsc::Sender<Vec<u8>>,
        to_agent_rx: mpsc::UnboundedReceiver<Vec<u8>>,
        to_caller_rx: mpsc::Receiver<Vec<u8>>,
    }

    fn start_bridge(media_capacity: usize) -> TestBridge {
        let (caller_tx, caller_rx) = mpsc::channel(16);
        let (agent_tx, agent_rx) = mpsc::channel(64);
        let (media_tx, to_caller_rx) = mpsc::channel(media_capacity);
        let (sink_tx, to_agent_rx) = mpsc::unbounded_channel();

        let bridge = AudioBridge::start(
            caller_rx,
            Arc::new(RecordingSink { tx: sink_tx }),
            agent_rx,
            media_tx,
            Arc::new(Passthrough),
        );

        TestBridge {
            bridge,
            caller_tx,
            agent_tx,
            to_agent_rx,
            to_caller_rx,
        }
    }

    #[tokio::test]
    async fn test_caller_frames_forwarded_in_order() {
        let mut t = start_bridge(16);

        for frame in [vec![1u8], vec![2], vec![3]] {
            t.caller_tx.send(frame).await.unwrap();
        }

        assert_eq!(t.to_agent_rx.recv().await.unwrap(), vec![1]);
        assert_eq!(t.to_agent_rx.recv().await.unwrap(), vec![2]);
        assert_eq!(t.to_agent_rx.recv().await.unwrap(), vec![3]);

        t.bridge.stop().await;
    }

    #[tokio::test]
    async fn test_agent_frames_delivered_in_order() {
        let mut t = start_bridge(16);

        for frame in [vec![10u8], vec![20], vec![30]] {
            t.agent_tx.send(frame).await.unwrap();
        }

        assert_eq!(t.to_caller_rx.recv().await.unwrap(), vec![10]);
        assert_eq!(t.to_caller_rx.recv().await.unwrap(), vec![20]);
        assert_eq!(t.to_caller_rx.recv().await.unwrap(), vec![30]);

        t.bridge.stop().await;
    }

    #[tokio::test]
    async fn test_barge_in_discards_pending_audio() {
        // Kapazität 1 und kein Konsument: die Auslieferung staut sich,
        // weitere Frames bleiben im Warte-Puffer hängen
        let mut t = start_bridge(1);

        for i in 0..10u8 {
            t.agent_tx.send(vec![i]).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Barge-in, erst danach liest der Anrufer-Pfad wieder
        t.bridge.interrupt();
        t.agent_tx.send(vec![99]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Frame 0 steckte schon im Media-Kanal, alles Übrige aus der Zeit
        // vor dem Barge-in wurde verworfen
        let mut received = Vec::new();
        while let Ok(frame) =
            tokio::time::timeout(Duration::from_millis(200), t.to_caller_rx.recv()).await
        {
            match frame {
                Some(frame) => received.push(frame),
                None => break,
            }
            if received.last() == Some(&vec![99]) {
                break;
            }
        }

        assert_eq!(received.first(), Some(&vec![0]));
        assert_eq!(received.last(), Some(&vec![99]));
        // Zwischen dem in-flight Frame und dem Post-Barge-in-Frame darf
        // nichts Altes liegen
        assert_eq!(received.len(), 2);
        assert!(t.bridge.discarded() > 0);

        t.bridge.stop().await;
    }

    #[tokio::test]
    async fn test_backpressure_drops_newest() {
        // Kein Konsument und Kapazität 1: nach Puffer + Kanal ist voll,
        // der Rest fällt als neuester Frame weg
        let t = start_bridge(1);

        for i in 0..(PENDING_CAPACITY as u8 + 20) {
            t.agent_tx.send(vec![i]).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(t.bridge.dropped() > 0);

        t.bridge.stop().await;
        drop(t.to_caller_rx);
    }

    #[tokio::test]
    async fn test_write_failure_is_fatal() {
        let t = start_bridge(1);
        let mut events = t.bridge.subscribe();

        // Telefonie-Schreibpfad stirbt
        drop(t.to_caller_rx);
        t.agent_tx.send(vec![1]).await.unwrap();
        t.agent_tx.send(vec![2]).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("fault event")
            .expect("fault event");
        match event {
            BridgeEvent::Fault { direction, .. } => {
                assert_eq!(direction, Direction::AgentToCaller);
            }
        }

        t.bridge.stop().await;
    }

    #[tokio::test]
    async fn test_media_source_loss_is_fatal() {
        let t = start_bridge(4);
        let mut events = t.bridge.subscribe();

        // Telefonie-Lesepfad stirbt, ohne dass die Bridge gestoppt wurde
        drop(t.caller_tx);

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("fault event")
            .expect("fault event");
        match event {
            BridgeEvent::Fault { direction, .. } => {
                assert_eq!(direction, Direction::CallerToAgent);
            }
        }

        t.bridge.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_quiet() {
        let t = start_bridge(4);
        let mut events = t.bridge.subscribe();

        t.bridge.stop().await;

        // Regulärer Stopp erzeugt keinen Fault
        assert!(events.try_recv().is_err());
    }
}
