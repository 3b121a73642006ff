//! Persistence adapters and the per-app record manager.
//!
//! A [`Persistence`] adapter is a namespaced key/value store for JSON
//! blobs. The [`PersistenceUserManager`] owns one record slot (the current
//! user, or the pending redirect user) for one app: it picks the adapter
//! to use from a caller-supplied hierarchy, migrates a stored record to a
//! better adapter when allowed, and forwards external change events to the
//! coordinator.

use crate::error::AuthError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

/// Record slot for the signed-in user.
pub const AUTH_USER_KEY: &str = "authUser";
/// Record slot for a user captured mid-redirect.
pub const REDIRECT_USER_KEY: &str = "redirectUser";

const KEY_NAMESPACE: &str = "firebase";

/// Durability class of an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistenceType {
    /// Survives process restarts.
    Local,
    /// Survives within one session only.
    Session,
    /// In-memory, lost on drop.
    None,
}

/// Callback invoked when a watched key changes underneath this process.
pub type StorageCallback = Arc<dyn Fn(Option<Value>) + Send + Sync>;

/// A place to keep one app's session records.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Durability class.
    fn persistence_type(&self) -> PersistenceType;

    /// Whether a record found elsewhere may be moved into this adapter.
    fn supports_migration(&self) -> bool;

    /// Whether the adapter works in the current environment.
    async fn is_available(&self) -> bool;

    /// Read a record.
    async fn get(&self, key: &str) -> Result<Option<Value>, AuthError>;

    /// Write a record.
    async fn set(&self, key: &str, value: Value) -> Result<(), AuthError>;

    /// Delete a record. Deleting a missing record is not an error.
    async fn remove(&self, key: &str) -> Result<(), AuthError>;

    /// Watch a key for changes made outside this process. Adapters with no
    /// external writers keep the default no-op.
    fn add_listener(&self, _key: &str, _callback: StorageCallback) -> Uuid {
        Uuid::new_v4()
    }

    /// Stop watching.
    fn remove_listener(&self, _key: &str, _handle: Uuid) {}
}

/// Non-durable adapter; the fallback when nothing in the hierarchy is
/// available. Also the workhorse of the test suite.
#[derive(Default)]
pub struct MemoryPersistence {
    records: Mutex<HashMap<String, Value>>,
    listeners: Mutex<HashMap<String, Vec<(Uuid, StorageCallback)>>>,
}

impl MemoryPersistence {
    /// Create an empty adapter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a change as if another process wrote it: the record is
    /// updated (or removed, for `None`) and listeners on the key fire.
    /// Embedders bridging an external store call this from their watcher.
    pub fn notify_external(&self, key: &str, value: Option<Value>) {
        {
            let mut records = self
                .records
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            match &value {
                Some(value) => {
                    records.insert(key.to_string(), value.clone());
                }
                None => {
                    records.remove(key);
                }
            }
        }
        let callbacks: Vec<StorageCallback> = {
            let listeners = self
                .listeners
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            listeners
                .get(key)
                .map(|l| l.iter().map(|(_, cb)| Arc::clone(cb)).collect())
                .unwrap_or_default()
        };
        for callback in callbacks {
            callback(value.clone());
        }
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    fn persistence_type(&self) -> PersistenceType {
        PersistenceType::None
    }

    fn supports_migration(&self) -> bool {
        true
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, AuthError> {
        Ok(self
            .records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), AuthError> {
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), AuthError> {
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(key);
        Ok(())
    }

    fn add_listener(&self, key: &str, callback: StorageCallback) -> Uuid {
        let handle = Uuid::new_v4();
        self.listeners
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .entry(key.to_string())
            .or_default()
            .push((handle, callback));
        handle
    }

    fn remove_listener(&self, key: &str, handle: Uuid) {
        let mut listeners = self
            .listeners
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(entries) = listeners.get_mut(key) {
            entries.retain(|(h, _)| *h != handle);
        }
    }
}

impl std::fmt::Debug for MemoryPersistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPersistence").finish_non_exhaustive()
    }
}

/// Owns one record slot across a persistence hierarchy.
pub struct PersistenceUserManager {
    persistence: RwLock<Arc<dyn Persistence>>,
    full_key: String,
    listener: Mutex<Option<(StorageCallback, Uuid)>>,
}

impl PersistenceUserManager {
    /// Namespaced storage key for one record slot of one app.
    pub fn full_key(api_key: &str, app_name: &str, key_name: &str) -> String {
        format!("{KEY_NAMESPACE}:{key_name}:{api_key}:{app_name}")
    }

    /// Pick an adapter from `hierarchy` and build the manager.
    ///
    /// Selection: the first adapter holding a record wins, even over
    /// earlier empty ones. If that adapter allows migration, the record
    /// instead moves to the first available migration-capable adapter and
    /// is removed everywhere else. An empty or fully unavailable hierarchy
    /// falls back to a fresh in-memory adapter.
    pub async fn create(
        hierarchy: Vec<Arc<dyn Persistence>>,
        api_key: &str,
        app_name: &str,
        key_name: &str,
    ) -> Self {
        let full_key = Self::full_key(api_key, app_name, key_name);
        if hierarchy.is_empty() {
            return Self::with_persistence(Arc::new(MemoryPersistence::new()), full_key);
        }

        let mut available: Vec<Arc<dyn Persistence>> = Vec::new();
        for persistence in &hierarchy {
            if persistence.is_available().await {
                available.push(Arc::clone(persistence));
            }
        }
        let Some(first_available) = available.first().cloned() else {
            return Self::with_persistence(Arc::new(MemoryPersistence::new()), full_key);
        };

        // First adapter that actually holds a record pins the selection,
        // whether or not it is in the available set.
        let mut selected = first_available;
        let mut record_to_migrate: Option<Value> = None;
        for persistence in &hierarchy {
            match persistence.get(&full_key).await {
                Ok(Some(record)) => {
                    if !Arc::ptr_eq(persistence, &selected) {
                        record_to_migrate = Some(record);
                    }
                    selected = Arc::clone(persistence);
                    break;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(%err, "persistence adapter failed during selection, skipping");
                }
            }
        }

        let migration_targets: Vec<Arc<dyn Persistence>> = available
            .iter()
            .filter(|p| p.supports_migration())
            .cloned()
            .collect();
        let record_to_migrate = match (selected.supports_migration(), record_to_migrate) {
            (true, Some(record)) => record,
            _ => return Self::with_persistence(selected, full_key),
        };
        let Some(target) = migration_targets.first().cloned() else {
            return Self::with_persistence(selected, full_key);
        };

        debug!(key = %full_key, "migrating stored record to preferred adapter");
        if let Err(err) = target.set(&full_key, record_to_migrate).await {
            warn!(%err, "record migration failed, keeping original adapter");
            return Self::with_persistence(selected, full_key);
        }
        for persistence in &hierarchy {
            if !Arc::ptr_eq(persistence, &target) {
                if let Err(err) = persistence.remove(&full_key).await {
                    warn!(%err, "failed to clear record from superseded adapter");
                }
            }
        }
        Self::with_persistence(target, full_key)
    }

    fn with_persistence(persistence: Arc<dyn Persistence>, full_key: String) -> Self {
        Self {
            persistence: RwLock::new(persistence),
            full_key,
            listener: Mutex::new(None),
        }
    }

    /// Read the stored record.
    pub async fn get_current_record(&self) -> Result<Option<Value>, AuthError> {
        let persistence = self.persistence.read().await;
        persistence.get(&self.full_key).await
    }

    /// Write the record.
    pub async fn set_current_record(&self, record: Value) -> Result<(), AuthError> {
        let persistence = self.persistence.read().await;
        persistence.set(&self.full_key, record).await
    }

    /// Delete the record.
    pub async fn remove_current_record(&self) -> Result<(), AuthError> {
        let persistence = self.persistence.read().await;
        persistence.remove(&self.full_key).await
    }

    /// Durability class of the adapter currently in use.
    pub async fn persistence_type(&self) -> PersistenceType {
        self.persistence.read().await.persistence_type()
    }

    /// Watch the record for external changes. Replaces any previous
    /// watcher.
    pub async fn set_listener(&self, callback: StorageCallback) {
        let persistence = self.persistence.read().await;
        let mut slot = self
            .listener
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some((_, handle)) = slot.take() {
            persistence.remove_listener(&self.full_key, handle);
        }
        let handle = persistence.add_listener(&self.full_key, Arc::clone(&callback));
        *slot = Some((callback, handle));
    }

    /// Swap the adapter, carrying the stored record and the watcher over.
    pub async fn set_persistence(&self, new_persistence: Arc<dyn Persistence>) -> Result<(), AuthError> {
        let mut current = self.persistence.write().await;
        if Arc::ptr_eq(&current, &new_persistence) {
            return Ok(());
        }

        let record = current.get(&self.full_key).await?;
        current.remove(&self.full_key).await?;
        if let Some(record) = record {
            new_persistence.set(&self.full_key, record).await?;
        }

        let mut slot = self
            .listener
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some((callback, handle)) = slot.take() {
            current.remove_listener(&self.full_key, handle);
            let handle = new_persistence.add_listener(&self.full_key, Arc::clone(&callback));
            *slot = Some((callback, handle));
        }
        drop(slot);

        *current = new_persistence;
        Ok(())
    }
}

impl std::fmt::Debug for PersistenceUserManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceUserManager")
            .field("full_key", &self.full_key)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Memory adapter with tweakable availability and migration flags.
    struct FakePersistence {
        inner: MemoryPersistence,
        persistence_type: PersistenceType,
        available: bool,
        allows_migration: bool,
    }

    impl FakePersistence {
        fn new(persistence_type: PersistenceType) -> Arc<Self> {
            Arc::new(Self {
                inner: MemoryPersistence::new(),
                persistence_type,
                available: true,
                allows_migration: true,
            })
        }

        fn unavailable(persistence_type: PersistenceType) -> Arc<Self> {
            Arc::new(Self {
                inner: MemoryPersistence::new(),
                persistence_type,
                available: false,
                allows_migration: true,
            })
        }

        fn no_migration(persistence_type: PersistenceType) -> Arc<Self> {
            Arc::new(Self {
                inner: MemoryPersistence::new(),
                persistence_type,
                available: true,
                allows_migration: false,
            })
        }
    }

    #[async_trait]
    impl Persistence for FakePersistence {
        fn persistence_type(&self) -> PersistenceType {
            self.persistence_type
        }
        fn supports_migration(&self) -> bool {
            self.allows_migration
        }
        async fn is_available(&self) -> bool {
            self.available
        }
        async fn get(&self, key: &str) -> Result<Option<Value>, AuthError> {
            self.inner.get(key).await
        }
        async fn set(&self, key: &str, value: Value) -> Result<(), AuthError> {
            self.inner.set(key, value).await
        }
        async fn remove(&self, key: &str) -> Result<(), AuthError> {
            self.inner.remove(key).await
        }
    }

    fn key() -> String {
        PersistenceUserManager::full_key("api-key", "[DEFAULT]", AUTH_USER_KEY)
    }

    #[test]
    fn test_key_format() {
        assert_eq!(key(), "firebase:authUser:api-key:[DEFAULT]");
        assert_eq!(
            PersistenceUserManager::full_key("k", "app", REDIRECT_USER_KEY),
            "firebase:redirectUser:k:app"
        );
    }

    #[tokio::test]
    async fn test_empty_hierarchy_falls_back_to_memory() {
        let manager =
            PersistenceUserManager::create(vec![], "api-key", "[DEFAULT]", AUTH_USER_KEY).await;
        assert_eq!(manager.persistence_type().await, PersistenceType::None);
        assert!(manager.get_current_record().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_selects_first_available_when_nothing_stored() {
        let session = FakePersistence::new(PersistenceType::Session);
        let local = FakePersistence::new(PersistenceType::Local);
        let manager = PersistenceUserManager::create(
            vec![session as _, local as _],
            "api-key",
            "[DEFAULT]",
            AUTH_USER_KEY,
        )
        .await;
        assert_eq!(manager.persistence_type().await, PersistenceType::Session);
    }

    #[tokio::test]
    async fn test_stored_record_migrates_to_preferred_adapter() {
        let preferred = FakePersistence::new(PersistenceType::Local);
        let holder = FakePersistence::new(PersistenceType::Session);
        holder.set(&key(), json!({"uid": "u1"})).await.unwrap();

        let manager = PersistenceUserManager::create(
            vec![Arc::clone(&preferred) as _, Arc::clone(&holder) as _],
            "api-key",
            "[DEFAULT]",
            AUTH_USER_KEY,
        )
        .await;

        assert_eq!(manager.persistence_type().await, PersistenceType::Local);
        assert_eq!(
            preferred.get(&key()).await.unwrap(),
            Some(json!({"uid": "u1"}))
        );
        assert!(holder.get(&key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_record_in_first_adapter_needs_no_migration() {
        let first = FakePersistence::new(PersistenceType::Local);
        let second = FakePersistence::new(PersistenceType::Session);
        first.set(&key(), json!({"uid": "u1"})).await.unwrap();

        let manager = PersistenceUserManager::create(
            vec![Arc::clone(&first) as _, second as _],
            "api-key",
            "[DEFAULT]",
            AUTH_USER_KEY,
        )
        .await;

        assert_eq!(manager.persistence_type().await, PersistenceType::Local);
        assert_eq!(first.get(&key()).await.unwrap(), Some(json!({"uid": "u1"})));
    }

    #[tokio::test]
    async fn test_no_migration_pins_the_holding_adapter() {
        let preferred = FakePersistence::new(PersistenceType::Local);
        let holder = FakePersistence::no_migration(PersistenceType::Session);
        holder.set(&key(), json!({"uid": "u1"})).await.unwrap();

        let manager = PersistenceUserManager::create(
            vec![Arc::clone(&preferred) as _, Arc::clone(&holder) as _],
            "api-key",
            "[DEFAULT]",
            AUTH_USER_KEY,
        )
        .await;

        assert_eq!(manager.persistence_type().await, PersistenceType::Session);
        assert_eq!(holder.get(&key()).await.unwrap(), Some(json!({"uid": "u1"})));
        assert!(preferred.get(&key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unavailable_hierarchy_falls_back_to_memory() {
        let manager = PersistenceUserManager::create(
            vec![
                FakePersistence::unavailable(PersistenceType::Local) as _,
                FakePersistence::unavailable(PersistenceType::Session) as _,
            ],
            "api-key",
            "[DEFAULT]",
            AUTH_USER_KEY,
        )
        .await;
        assert_eq!(manager.persistence_type().await, PersistenceType::None);
    }

    #[tokio::test]
    async fn test_set_persistence_carries_the_record() {
        let first = FakePersistence::new(PersistenceType::Session);
        let manager = PersistenceUserManager::create(
            vec![Arc::clone(&first) as _],
            "api-key",
            "[DEFAULT]",
            AUTH_USER_KEY,
        )
        .await;
        manager
            .set_current_record(json!({"uid": "u1"}))
            .await
            .unwrap();

        let second = FakePersistence::new(PersistenceType::Local);
        manager
            .set_persistence(Arc::clone(&second) as _)
            .await
            .unwrap();

        assert_eq!(manager.persistence_type().await, PersistenceType::Local);
        assert!(first.get(&key()).await.unwrap().is_none());
        assert_eq!(
            manager.get_current_record().await.unwrap(),
            Some(json!({"uid": "u1"}))
        );
    }

    #[tokio::test]
    async fn test_external_change_reaches_listener() {
        let memory = Arc::new(MemoryPersistence::new());
        let manager = PersistenceUserManager::create(
            vec![Arc::clone(&memory) as _],
            "api-key",
            "[DEFAULT]",
            AUTH_USER_KEY,
        )
        .await;

        let seen: Arc<Mutex<Vec<Option<Value>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        manager
            .set_listener(Arc::new(move |value| {
                sink.lock().unwrap().push(value);
            }))
            .await;

        memory.notify_external(&key(), Some(json!({"uid": "u2"})));
        memory.notify_external(&key(), None);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], Some(json!({"uid": "u2"})));
        assert_eq!(seen[1], None);
    }
}
