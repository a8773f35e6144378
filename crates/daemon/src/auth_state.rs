// Auth state adapter: persists the opaque credential/key blob of the session.
//
// Two documents: `auth/creds` holds `{ credentials, updatedAt }` and
// `auth/keys` holds `{ keys, updatedAt }`. The blob itself is never inspected
// beyond counting keys for status output.

use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tether_common::paths::{AUTH, AUTH_CREDS_ID, AUTH_KEYS_ID};
use tether_common::types::{AuthBlob, EpochMs};
use tracing::{debug, info};

use crate::clock::SharedClock;
use crate::store::{DocumentStore, StoreError};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthInfo {
    pub has_auth: bool,
    pub creds_updated_at: Option<EpochMs>,
    pub key_count: usize,
    pub last_auth_write_at: Option<EpochMs>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CredsDoc {
    credentials: Value,
    #[serde(default)]
    updated_at: Option<EpochMs>,
}

#[derive(Debug, Deserialize)]
struct KeysDoc {
    #[serde(default)]
    keys: Value,
}

pub struct AuthStateAdapter<D> {
    store: Arc<D>,
    clock: SharedClock,
    last_write_at: Mutex<Option<EpochMs>>,
}

impl<D: DocumentStore> AuthStateAdapter<D> {
    pub fn new(store: Arc<D>, clock: SharedClock) -> Self {
        Self { store, clock, last_write_at: Mutex::new(None) }
    }

    /// Load the stored blob, or a fresh one when nothing is stored yet.
    pub async fn load(&self) -> Result<AuthBlob, StoreError> {
        let creds = self.read_creds().await?;
        let keys = match self.store.get(AUTH, AUTH_KEYS_ID).await? {
            Some(raw) => {
                let doc: KeysDoc = serde_json::from_value(raw)
                    .map_err(|e| StoreError::corrupt(AUTH, AUTH_KEYS_ID, e))?;
                doc.keys
            }
            None => Value::Object(Default::default()),
        };

        match creds {
            Some(doc) => {
                let blob = AuthBlob { credentials: doc.credentials, keys };
                debug!(key_count = blob.key_count(), "loaded auth state");
                Ok(blob)
            }
            None => {
                info!("no stored credentials, starting with fresh auth state");
                Ok(AuthBlob { keys, ..AuthBlob::fresh() })
            }
        }
    }

    pub async fn save(&self, blob: &AuthBlob) -> Result<(), StoreError> {
        let now = self.clock.now_ms();
        self.store
            .set(AUTH, AUTH_CREDS_ID, json!({ "credentials": blob.credentials, "updatedAt": now }))
            .await?;
        self.store.set(AUTH, AUTH_KEYS_ID, json!({ "keys": blob.keys, "updatedAt": now })).await?;
        *self.last_write_at.lock().unwrap_or_else(PoisonError::into_inner) = Some(now);
        debug!(key_count = blob.key_count(), "saved auth state");
        Ok(())
    }

    /// Remove stored credentials and keys (after a logout).
    pub async fn clear(&self) -> Result<(), StoreError> {
        self.store.delete(AUTH, AUTH_CREDS_ID).await?;
        self.store.delete(AUTH, AUTH_KEYS_ID).await?;
        info!("auth state cleared");
        Ok(())
    }

    pub async fn has_auth(&self) -> Result<bool, StoreError> {
        Ok(self.read_creds().await?.is_some())
    }

    pub async fn info(&self) -> Result<AuthInfo, StoreError> {
        let creds = self.read_creds().await?;
        let key_count = match self.store.get(AUTH, AUTH_KEYS_ID).await? {
            Some(raw) => serde_json::from_value::<KeysDoc>(raw)
                .map(|doc| AuthBlob { credentials: Value::Null, keys: doc.keys }.key_count())
                .unwrap_or(0),
            None => 0,
        };
        Ok(AuthInfo {
            has_auth: creds.is_some(),
            creds_updated_at: creds.and_then(|doc| doc.updated_at),
            key_count,
            last_auth_write_at: self.last_write_at(),
        })
    }

    /// When this process last wrote the blob.
    pub fn last_write_at(&self) -> Option<EpochMs> {
        *self.last_write_at.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn read_creds(&self) -> Result<Option<CredsDoc>, StoreError> {
        match self.store.get(AUTH, AUTH_CREDS_ID).await? {
            Some(raw) => serde_json::from_value(raw)
                .map(Some)
                .map_err(|e| StoreError::corrupt(AUTH, AUTH_CREDS_ID, e)),
            None => Ok(None),
        }
    }
}
