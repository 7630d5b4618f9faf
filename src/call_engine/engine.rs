//! Call State Machine
//!
//! Verwaltet den Lebenszyklus des einen aktiven Anrufs. Es gibt genau einen
//! CallSession-Slot im Prozess; ein zweiter eingehender Anruf wird an der
//! Transition abgewiesen, nicht über verstreute Flags. Alle Mutationen
//! laufen über die Methoden dieser Maschine (Single-Writer), Seiteneffekte
//! hängen an Zustandseintritten.
//!
//! Zustände:
//!   Idle → Registering → Registered → (Ringing | RegistrationFailed)
//!   Ringing → Accepting → Active → HangingUp → Idle
//!
//! HangingUp führt immer zurück nach Idle, egal wie es erreicht wurde
//! (Peer-Hangup, lokaler Hangup oder Fehler). RegistrationFailed ist ein
//! degradierter Endzustand: keine automatische Neuregistrierung, nur der
//! Operator-Pfad führt zurück nach Registering.

use crate::gateway::Jsep;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::broadcast;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum CallEngineError {
    #[error("Another call is already in progress")]
    AlreadyInCall,

    #[error("Not registered at the PBX")]
    NotRegistered,

    #[error("Invalid call state transition: {from} -> {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },

    #[error("No active call")]
    NoActiveCall,
}

// ============================================================================
// CALL STATE
// ============================================================================

/// Lebenszyklus-Zustand des Services bzw. des einen Anrufs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallState {
    /// Kein Anruf, noch nicht registriert
    Idle,
    /// Registrierung an der PBX läuft
    Registering,
    /// Registriert, wartet auf Anrufe
    Registered,
    /// Registrierung fehlgeschlagen - degradiert, keine Anrufannahme
    RegistrationFailed {
        code: Option<i64>,
        reason: String,
    },
    /// Eingehender (oder ausgehender) Anruf klingelt
    Ringing {
        caller: String,
    },
    /// Annahme an das Gateway geschickt, wartet auf Bestätigung
    Accepting {
        caller: String,
    },
    /// Anruf aktiv, Voice-AI-Session und Bridge laufen
    Active {
        caller: String,
    },
    /// Anruf wird abgebaut
    HangingUp {
        caller: String,
    },
}

impl CallState {
    /// Kurzname für Transitions-Fehler und Logs
    pub fn name(&self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::Registering => "registering",
            CallState::Registered => "registered",
            CallState::RegistrationFailed { .. } => "registration_failed",
            CallState::Ringing { .. } => "ringing",
            CallState::Accepting { .. } => "accepting",
            CallState::Active { .. } => "active",
            CallState::HangingUp { .. } => "hanging_up",
        }
    }

    /// Gibt es gerade einen nicht-terminalen Anruf?
    pub fn in_call(&self) -> bool {
        matches!(
            self,
            CallState::Ringing { .. }
                | CallState::Accepting { .. }
                | CallState::Active { .. }
                | CallState::HangingUp { .. }
        )
    }
}

/// Events der State Machine
#[derive(Debug, Clone)]
pub enum CallEvent {
    StateChanged(CallState),
}

// ============================================================================
// CALL SESSION
// ============================================================================

/// Metadaten des einen aktiven Anrufs
///
/// Wird beim incomingcall-Event angelegt und beim terminalen Hangup
/// abgeräumt. Das jsep ist der opake SDP-Blob des Anrufs.
#[derive(Debug, Clone)]
pub struct CallSession {
    pub caller: String,
    pub jsep: Option<Jsep>,
    pub started_at: DateTime<Utc>,
}

// ============================================================================
// CALL ENGINE
// ============================================================================

/// Die State Machine mit dem einen CallSession-Slot
pub struct CallEngine {
    state: Mutex<CallState>,
    session: Mutex<Option<CallSession>>,
    event_tx: broadcast::Sender<CallEvent>,
}

impl CallEngine {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            state: Mutex::new(CallState::Idle),
            session: Mutex::new(None),
            event_tx,
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.event_tx.subscribe()
    }

    /// Aktueller Zustand
    pub fn state(&self) -> CallState {
        self.state.lock().clone()
    }

    /// Snapshot der aktuellen Session
    pub fn session(&self) -> Option<CallSession> {
        self.session.lock().clone()
    }

    // ========================================================================
    // REGISTRATION
    // ========================================================================

    /// Registrierung beginnt (auch Operator-Neuregistrierung)
    pub fn begin_registration(&self) -> Result<(), CallEngineError> {
        self.transition(|state| match state {
            CallState::Idle | CallState::RegistrationFailed { .. } => Ok(CallState::Registering),
            other => Err(invalid(other, "registering")),
        })
    }

    /// Gateway hat die Registrierung bestätigt
    pub fn registration_succeeded(&self) -> Result<(), CallEngineError> {
        self.transition(|state| match state {
            CallState::Registering => Ok(CallState::Registered),
            other => Err(invalid(other, "registered")),
        })
    }

    /// Registrierung fehlgeschlagen - degradierter Endzustand
    pub fn registration_failed(
        &self,
        code: Option<i64>,
        reason: String,
    ) -> Result<(), CallEngineError> {
        self.transition(|state| match state {
            CallState::Registering => Ok(CallState::RegistrationFailed { code, reason }),
            other => Err(invalid(other, "registration_failed")),
        })
    }

    // ========================================================================
    // CALL LIFECYCLE
    // ========================================================================

    /// Eingehender Anruf
    ///
    /// Nur aus Registered heraus erlaubt. Läuft bereits ein Anruf, kommt
    /// `AlreadyInCall` zurück und der bestehende Zustand bleibt unberührt -
    /// der Aufrufer weist den neuen Anruf am Gateway ab.
    pub fn incoming_call(&self, caller: String, jsep: Option<Jsep>) -> Result<(), CallEngineError> {
        let mut state = self.state.lock();
        match &*state {
            CallState::Registered => {}
            s if s.in_call() => return Err(CallEngineError::AlreadyInCall),
            _ => return Err(CallEngineError::NotRegistered),
        }

        *self.session.lock() = Some(CallSession {
            caller: caller.clone(),
            jsep,
            started_at: Utc::now(),
        });
        *state = CallState::Ringing { caller };
        let _ = self.event_tx.send(CallEvent::StateChanged(state.clone()));
        Ok(())
    }

    /// Ausgehender Anruf (Gegenstelle klingelt)
    pub fn outgoing_call(&self, uri: String) -> Result<(), CallEngineError> {
        // Gleiche Exklusivität wie beim eingehenden Anruf
        self.incoming_call(uri, None)
    }

    /// Annahme geht an das Gateway raus
    pub fn begin_accept(&self) -> Result<String, CallEngineError> {
        let mut caller_out = None;
        self.transition(|state| match state {
            CallState::Ringing { caller } => {
                caller_out = Some(caller.clone());
                Ok(CallState::Accepting {
                    caller: caller.clone(),
                })
            }
            other => Err(invalid(other, "accepting")),
        })?;
        caller_out.ok_or(CallEngineError::NoActiveCall)
    }

    /// Anruf ist aktiv: Voice-AI-Session bereit, Bridge läuft
    ///
    /// Der Aufrufer garantiert, dass die Session die Settings bestätigt hat,
    /// bevor er diesen Eintritt auslöst.
    pub fn activate(&self) -> Result<(), CallEngineError> {
        self.transition(|state| match state {
            CallState::Accepting { caller } => Ok(CallState::Active {
                caller: caller.clone(),
            }),
            other => Err(invalid(other, "active")),
        })
    }

    /// Abbau beginnt (Peer-Hangup, lokaler Hangup oder Fehler)
    ///
    /// Aus jedem Anrufzustand erreichbar; wer nicht im Anruf ist, bekommt
    /// `NoActiveCall` - der Abbau läuft dann bereits oder es gibt nichts
    /// abzubauen.
    pub fn begin_hangup(&self, reason: &str) -> Result<String, CallEngineError> {
        let mut state = self.state.lock();
        let caller = match &*state {
            CallState::Ringing { caller }
            | CallState::Accepting { caller }
            | CallState::Active { caller } => caller.clone(),
            _ => return Err(CallEngineError::NoActiveCall),
        };

        tracing::info!("Hanging up call with {} ({})", caller, reason);
        *state = CallState::HangingUp {
            caller: caller.clone(),
        };
        let _ = self.event_tx.send(CallEvent::StateChanged(state.clone()));
        Ok(caller)
    }

    /// Abbau abgeschlossen: Session-Slot räumen, zurück in den Wartezustand
    ///
    /// Erst hiernach kann ein neuer Anruf den Zustand wieder herausbewegen -
    /// Bridge und Voice-AI-Session sind zu diesem Zeitpunkt bereits
    /// vollständig abgebaut.
    pub fn finish_hangup(&self) -> Result<(), CallEngineError> {
        let mut state = self.state.lock();
        match &*state {
            CallState::HangingUp { .. } => {}
            other => return Err(invalid(other, "registered")),
        }

        *self.session.lock() = None;
        // Nach dem Anruf ist der Service wieder registriert und wartet
        *state = CallState::Registered;
        let _ = self.event_tx.send(CallEvent::StateChanged(state.clone()));
        Ok(())
    }

    // ========================================================================
    // INTERNAL
    // ========================================================================

    /// Führt eine validierte Transition aus und sendet das Event
    fn transition<F>(&self, f: F) -> Result<(), CallEngineError>
    where
        F: FnOnce(&CallState) -> Result<CallState, CallEngineError>,
    {
        let mut state = self.state.lock();
        let next = f(&state)?;
        tracing::debug!("call state: {} -> {}", state.name(), next.name());
        *state = next;
        let _ = self.event_tx.send(CallEvent::StateChanged(state.clone()));
        Ok(())
    }
}

impl Default for CallEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn invalid(from: &CallState, to: &'static str) -> CallEngineError {
    CallEngineError::InvalidTransition {
        from: from.name(),
        to,
    }
}

impl std::fmt::Debug for CallEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallEngine")
            .field("state", &self.state())
            .field("session", &self.session())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn registered_engine() -> CallEngine {
        let engine = CallEngine::new();
        engine.begin_registration().unwrap();
        engine.registration_succeeded().unwrap();
        engine
    }

    #[test]
    fn test_happy_path_to_active_and_back() {
        let engine = registered_engine();

        engine
            .incoming_call("sip:100@pbx".to_string(), None)
            .unwrap();
        assert_eq!(engine.state().name(), "ringing");
        assert!(engine.session().is_some());

        let caller = engine.begin_accept().unwrap();
        assert_eq!(caller, "sip:100@pbx");

        engine.activate().unwrap();
        assert_eq!(engine.state().name(), "active");

        engine.begin_hangup("peer hangup").unwrap();
        assert_eq!(engine.state().name(), "hanging_up");

        engine.finish_hangup().unwrap();
        assert_eq!(engine.state(), CallState::Registered);
        assert!(engine.session().is_none());
    }

    #[test]
    fn test_second_call_rejected_state_unchanged() {
        let engine = registered_engine();
        engine
            .incoming_call("sip:100@pbx".to_string(), None)
            .unwrap();
        engine.begin_accept().unwrap();
        engine.activate().unwrap();

        let err = engine
            .incoming_call("sip:200@pbx".to_string(), None)
            .unwrap_err();
        assert!(matches!(err, CallEngineError::AlreadyInCall));

        // Der laufende Anruf bleibt unberührt
        assert_eq!(
            engine.state(),
            CallState::Active {
                caller: "sip:100@pbx".to_string()
            }
        );
        assert_eq!(engine.session().unwrap().caller, "sip:100@pbx");
    }

    #[test]
    fn test_call_rejected_during_teardown() {
        let engine = registered_engine();
        engine
            .incoming_call("sip:100@pbx".to_string(), None)
            .unwrap();
        engine.begin_accept().unwrap();
        engine.activate().unwrap();
        engine.begin_hangup("local").unwrap();

        // Solange der Abbau läuft, ist kein neuer Anruf möglich
        let err = engine
            .incoming_call("sip:200@pbx".to_string(), None)
            .unwrap_err();
        assert!(matches!(err, CallEngineError::AlreadyInCall));

        engine.finish_hangup().unwrap();
        engine
            .incoming_call("sip:200@pbx".to_string(), None)
            .unwrap();
    }

    #[test]
    fn test_registration_failed_blocks_calls() {
        let engine = CallEngine::new();
        engine.begin_registration().unwrap();
        engine
            .registration_failed(Some(401), "Unauthorized".to_string())
            .unwrap();

        let err = engine
            .incoming_call("sip:100@pbx".to_string(), None)
            .unwrap_err();
        assert!(matches!(err, CallEngineError::NotRegistered));
        assert_eq!(engine.state().name(), "registration_failed");
    }

    #[test]
    fn test_operator_reregistration() {
        let engine = CallEngine::new();
        engine.begin_registration().unwrap();
        engine
            .registration_failed(None, "timeout".to_string())
            .unwrap();

        // Operator-Pfad: zurück nach Registering
        engine.begin_registration().unwrap();
        engine.registration_succeeded().unwrap();
        assert_eq!(engine.state(), CallState::Registered);
    }

    #[test]
    fn test_hangup_from_accepting() {
        // Voice-AI-Connect schlägt fehl: Accepting → HangingUp → bereit
        let engine = registered_engine();
        engine
            .incoming_call("sip:100@pbx".to_string(), None)
            .unwrap();
        engine.begin_accept().unwrap();

        engine.begin_hangup("agent connect failed").unwrap();
        engine.finish_hangup().unwrap();

        assert_eq!(engine.state(), CallState::Registered);
        assert!(engine.session().is_none());
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let engine = CallEngine::new();

        // Ohne Registrierung weder aktivieren noch annehmen
        assert!(matches!(
            engine.activate().unwrap_err(),
            CallEngineError::InvalidTransition { .. }
        ));
        assert!(matches!(
            engine.begin_accept().unwrap_err(),
            CallEngineError::InvalidTransition { .. }
        ));
        assert!(matches!(
            engine.begin_hangup("x").unwrap_err(),
            CallEngineError::NoActiveCall
        ));

        // Doppelte Registrierungsbestätigung
        engine.begin_registration().unwrap();
        engine.registration_succeeded().unwrap();
        assert!(engine.registration_succeeded().is_err());
    }

    #[test]
    fn test_state_change_events_emitted() {
        let engine = CallEngine::new();
        let mut rx = engine.subscribe();

        engine.begin_registration().unwrap();
        engine.registration_succeeded().unwrap();

        match rx.try_recv().unwrap() {
            CallEvent::StateChanged(state) => assert_eq!(state, CallState::Registering),
        }
        match rx.try_recv().unwrap() {
            CallEvent::StateChanged(state) => assert_eq!(state, CallState::Registered),
        }
    }
}
