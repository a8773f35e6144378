// Incident documents: one fixed-key document per incident kind.
//
// Raising an incident that is already active only refreshes its evidence and
// `lastCheckedAt`. Resolving flips `active` off and stamps `resolvedAt` once.

use std::sync::Arc;

use serde_json::Value;
use tether_common::paths::INCIDENTS;
use tether_common::types::{Incident, IncidentKind};
use tracing::{info, warn};

use crate::clock::SharedClock;
use crate::store::{encode, get_typed, DocumentStore, FilterOp, Query, StoreError, TxnWrite};

/// Result of raising an incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaiseOutcome {
    /// First detection: a new active document was written.
    Opened,
    /// Already active: evidence and `lastCheckedAt` refreshed.
    Refreshed,
}

pub struct IncidentLog<D> {
    store: Arc<D>,
    clock: SharedClock,
    instance_id: String,
}

impl<D: DocumentStore> IncidentLog<D> {
    pub fn new(store: Arc<D>, clock: SharedClock, instance_id: impl Into<String>) -> Self {
        Self { store, clock, instance_id: instance_id.into() }
    }

    pub async fn raise(&self, kind: IncidentKind, evidence: Value) -> Result<RaiseOutcome, StoreError> {
        let now = self.clock.now_ms();
        let instance_id = self.instance_id.clone();
        let doc_id = kind.doc_id();
        let id = doc_id.clone();

        let outcome = self
            .store
            .transact(INCIDENTS, &doc_id, move |current| {
                let existing: Option<Incident> = current
                    .map(serde_json::from_value)
                    .transpose()
                    .map_err(|e| StoreError::corrupt(INCIDENTS, &id, e))?;

                let (incident, outcome) = match existing {
                    Some(mut live) if live.active => {
                        live.last_checked_at = now;
                        live.evidence = evidence;
                        live.instance_id = instance_id;
                        (live, RaiseOutcome::Refreshed)
                    }
                    _ => (
                        Incident {
                            kind,
                            active: true,
                            first_detected_at: now,
                            last_checked_at: now,
                            resolved_at: None,
                            instance_id,
                            evidence,
                            instructions: kind.instructions().to_string(),
                        },
                        RaiseOutcome::Opened,
                    ),
                };
                Ok((TxnWrite::Put(encode(INCIDENTS, &id, &incident)?), outcome))
            })
            .await?;

        if outcome == RaiseOutcome::Opened {
            warn!(incident = kind.as_str(), "incident opened");
        }
        Ok(outcome)
    }

    /// Resolve an active incident. Returns `true` only for the call that
    /// actually flipped it.
    pub async fn resolve(&self, kind: IncidentKind) -> Result<bool, StoreError> {
        let now = self.clock.now_ms();
        let doc_id = kind.doc_id();
        let id = doc_id.clone();

        let resolved = self
            .store
            .transact(INCIDENTS, &doc_id, move |current| {
                let Some(raw) = current else {
                    return Ok((TxnWrite::Keep, false));
                };
                let mut incident: Incident = serde_json::from_value(raw)
                    .map_err(|e| StoreError::corrupt(INCIDENTS, &id, e))?;
                if !incident.active {
                    return Ok((TxnWrite::Keep, false));
                }
                incident.active = false;
                incident.resolved_at = Some(now);
                incident.last_checked_at = now;
                Ok((TxnWrite::Put(encode(INCIDENTS, &id, &incident)?), true))
            })
            .await?;

        if resolved {
            info!(incident = kind.as_str(), "incident resolved");
        }
        Ok(resolved)
    }

    pub async fn get(&self, kind: IncidentKind) -> Result<Option<Incident>, StoreError> {
        get_typed(self.store.as_ref(), INCIDENTS, &kind.doc_id()).await
    }

    pub async fn active(&self) -> Result<Vec<Incident>, StoreError> {
        let docs = self
            .store
            .query(INCIDENTS, Query::new().filter("active", FilterOp::Eq, true))
            .await?;
        docs.iter().map(|doc| doc.decode(INCIDENTS)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn log() -> (IncidentLog<MemoryStore>, Arc<ManualClock>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(1_000);
        (IncidentLog::new(store.clone(), clock.clone(), "i-1"), clock, store)
    }

    #[tokio::test]
    async fn repeated_raise_keeps_one_document() {
        let (log, clock, store) = log();
        let first = log.raise(IncidentKind::DisconnectStuck, json!({ "n": 1 })).await.unwrap();
        assert_eq!(first, RaiseOutcome::Opened);

        clock.advance(60_000);
        let second = log.raise(IncidentKind::DisconnectStuck, json!({ "n": 2 })).await.unwrap();
        assert_eq!(second, RaiseOutcome::Refreshed);

        assert_eq!(store.len(INCIDENTS), 1);
        let incident = log.get(IncidentKind::DisconnectStuck).await.unwrap().expect("incident");
        assert!(incident.active);
        assert_eq!(incident.first_detected_at, 1_000);
        assert_eq!(incident.last_checked_at, 61_000);
        assert_eq!(incident.evidence, json!({ "n": 2 }));
    }

    #[tokio::test]
    async fn resolve_flips_exactly_once() {
        let (log, clock, _) = log();
        log.raise(IncidentKind::StoreDegraded, Value::Null).await.unwrap();
        clock.advance(5_000);
        assert!(log.resolve(IncidentKind::StoreDegraded).await.unwrap());
        clock.advance(5_000);
        assert!(!log.resolve(IncidentKind::StoreDegraded).await.unwrap());

        let incident = log.get(IncidentKind::StoreDegraded).await.unwrap().expect("incident");
        assert!(!incident.active);
        assert_eq!(incident.resolved_at, Some(6_000));
    }

    #[tokio::test]
    async fn resolve_without_incident_is_noop() {
        let (log, _, store) = log();
        assert!(!log.resolve(IncidentKind::ReconnectLoop).await.unwrap());
        assert_eq!(store.len(INCIDENTS), 0);
    }

    #[tokio::test]
    async fn raise_after_resolve_opens_a_new_episode() {
        let (log, clock, _) = log();
        log.raise(IncidentKind::DisconnectStorm, Value::Null).await.unwrap();
        log.resolve(IncidentKind::DisconnectStorm).await.unwrap();
        clock.advance(1_000);
        let outcome = log.raise(IncidentKind::DisconnectStorm, Value::Null).await.unwrap();
        assert_eq!(outcome, RaiseOutcome::Opened);

        let incident = log.get(IncidentKind::DisconnectStorm).await.unwrap().expect("incident");
        assert_eq!(incident.first_detected_at, 2_000);
        assert!(incident.resolved_at.is_none());
    }

    #[tokio::test]
    async fn active_lists_only_live_incidents() {
        let (log, _, _) = log();
        log.raise(IncidentKind::PairingRequired, Value::Null).await.unwrap();
        log.raise(IncidentKind::StoreDegraded, Value::Null).await.unwrap();
        log.resolve(IncidentKind::StoreDegraded).await.unwrap();

        let active = log.active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].kind, IncidentKind::PairingRequired);
    }
}
