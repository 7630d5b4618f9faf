//! Korrelierte Request/Response-Verwaltung
//!
//! Auf dem Gateway-Socket teilen sich Antworten und unaufgeforderte Events
//! denselben Stream. Dieser Layer ordnet Antworten über die `transaction`-Id
//! den wartenden Anfragen zu:
//! - Slot wird VOR dem Senden registriert (keine Race mit schnellen Antworten)
//! - jeder Slot wird höchstens einmal aufgelöst
//! - bei Timeout wird der Slot entfernt, eine verspätete Antwort ist ein No-op

use crate::gateway::messages::ServerMessage;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Tabelle der offenen Transaktionen (transaction-id → Ergebnis-Slot)
#[derive(Clone, Default)]
pub struct TransactionTable {
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<ServerMessage>>>>,
}

impl TransactionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Vergibt eine frische Transaction-Id
    ///
    /// UUIDv4 im Simple-Format; Kollisionen unter gleichzeitig offenen
    /// Transaktionen sind damit praktisch ausgeschlossen.
    pub fn next_id(&self) -> String {
        Uuid::new_v4().simple().to_string()
    }

    /// Registriert einen Slot für die gegebene Transaction-Id
    ///
    /// Muss vor dem Senden der Anfrage passieren, damit die Antwort den Slot
    /// auch dann findet, wenn sie vor der Rückkehr des Sendens eintrifft.
    pub fn register(&self, transaction: String) -> oneshot::Receiver<ServerMessage> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(transaction, tx);
        rx
    }

    /// Löst den Slot zur Transaction-Id auf, falls einer offen ist
    ///
    /// Gibt `true` zurück, wenn die Nachricht einer offenen Transaktion
    /// zugeordnet wurde. Der Slot wird dabei entfernt, eine zweite Nachricht
    /// mit derselben Id fällt danach an den Event-Dispatcher durch.
    pub fn resolve(&self, transaction: &str, msg: ServerMessage) -> bool {
        let slot = self.pending.lock().remove(transaction);
        match slot {
            Some(tx) => {
                // Empfänger kann durch Timeout bereits weg sein
                let _ = tx.send(msg);
                true
            }
            None => false,
        }
    }

    /// Entfernt den Slot ohne ihn aufzulösen (Timeout-Pfad)
    pub fn forget(&self, transaction: &str) {
        self.pending.lock().remove(transaction);
    }

    /// Anzahl aktuell offener Transaktionen
    pub fn outstanding(&self) -> usize {
        self.pending.lock().len()
    }

    /// Verwirft alle offenen Slots (Verbindungsabbau)
    ///
    /// Wartende Aufrufer sehen dadurch einen geschlossenen Kanal statt eines
    /// Timeouts.
    pub fn clear(&self) {
        self.pending.lock().clear();
    }
}

impl std::fmt::Debug for TransactionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionTable")
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn ack(tx: &str) -> ServerMessage {
        ServerMessage::Ack {
            transaction: Some(tx.to_string()),
        }
    }

    #[test]
    fn test_ids_unique_while_outstanding() {
        let table = TransactionTable::new();
        let mut seen = std::collections::HashSet::new();

        for _ in 0..1000 {
            let id = table.next_id();
            assert!(seen.insert(id.clone()), "duplicate transaction id");
            let _rx = table.register(id);
        }

        assert_eq!(table.outstanding(), 1000);
    }

    #[tokio::test]
    async fn test_resolve_exactly_once() {
        let table = TransactionTable::new();
        let id = table.next_id();
        let rx = table.register(id.clone());

        assert!(table.resolve(&id, ack(&id)));
        // Zweite Auflösung findet keinen Slot mehr
        assert!(!table.resolve(&id, ack(&id)));

        let msg = rx.await.expect("slot resolved");
        assert_eq!(msg.transaction(), Some(id.as_str()));
        assert_eq!(table.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_late_reply_after_forget_is_noop() {
        let table = TransactionTable::new();
        let id = table.next_id();
        let rx = table.register(id.clone());

        // Timeout-Pfad: Slot wird entfernt, bevor die Antwort kommt
        table.forget(&id);
        drop(rx);

        assert!(!table.resolve(&id, ack(&id)));
        assert_eq!(table.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_resolve_with_dropped_receiver() {
        let table = TransactionTable::new();
        let id = table.next_id();
        let rx = table.register(id.clone());
        drop(rx);

        // Auflösung gegen einen weggeworfenen Empfänger darf nicht panicken
        assert!(table.resolve(&id, ack(&id)));
    }

    #[test]
    fn test_clear_drops_all_slots() {
        let table = TransactionTable::new();
        for _ in 0..5 {
            let id = table.next_id();
            let _rx = table.register(id);
        }

        table.clear();
        assert_eq!(table.outstanding(), 0);
    }
}
