//! At most one [`ConnectionManager`] per database.

use super::connector::{Connector, ResourceKey};
use super::manager::ConnectionManager;
use crate::executor::acquire_lock;
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use tracing::debug;

/// Deduplicates connection managers by [`ResourceKey`].
///
/// Tables that address the same database through this registry share one
/// manager, and therefore one worker and one connection. Tests build their
/// own registry with [`ConnectionRegistry::new`]; application code usually
/// goes through [`global_registry`].
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    managers: Mutex<HashMap<ResourceKey, Arc<ConnectionManager>>>,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns the manager for the connector's database, creating it if needed.
    ///
    /// An existing manager is returned unchanged; use
    /// [`ConnectionManager::set_connector`] to reconfigure it.
    ///
    /// # Errors
    ///
    /// Returns an error if the connector's resource key cannot be resolved.
    pub fn get_or_create(self: &Arc<Self>, connector: Connector) -> Result<Arc<ConnectionManager>> {
        let key = connector.resource_key()?;
        let mut managers = acquire_lock(&self.managers);
        if let Some(existing) = managers.get(&key) {
            return Ok(Arc::clone(existing));
        }
        let manager = Arc::new(ConnectionManager::build(
            key.clone(),
            connector,
            Arc::downgrade(self),
        ));
        debug!(key = %key, "connection manager registered");
        managers.insert(key, Arc::clone(&manager));
        Ok(manager)
    }

    /// Returns the manager registered under `key`.
    pub fn get(&self, key: &ResourceKey) -> Option<Arc<ConnectionManager>> {
        acquire_lock(&self.managers).get(key).cloned()
    }

    /// Registered keys, in no particular order.
    pub fn keys(&self) -> Vec<ResourceKey> {
        acquire_lock(&self.managers).keys().cloned().collect()
    }

    /// Number of registered managers.
    pub fn len(&self) -> usize {
        acquire_lock(&self.managers).len()
    }

    /// Returns `true` when no manager is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes the entry for `key` if it still points at `manager`.
    pub(crate) fn deregister(&self, key: &ResourceKey, manager: &ConnectionManager) -> bool {
        let mut managers = acquire_lock(&self.managers);
        let owned = managers
            .get(key)
            .is_some_and(|entry| std::ptr::eq(Arc::as_ptr(entry), manager));
        if owned {
            managers.remove(key);
        }
        owned
    }

    /// Moves `manager` from `old` to `new`.
    ///
    /// A manager that is no longer registered under `old` is left alone.
    pub(crate) fn rekey(&self, old: &ResourceKey, new: &ResourceKey, manager: &ConnectionManager) -> Result<()> {
        let mut managers = acquire_lock(&self.managers);
        if managers.contains_key(new) {
            return Err(Error::InvalidInput(format!(
                "a connection manager for '{new}' already exists"
            )));
        }
        let owned = managers
            .get(old)
            .is_some_and(|entry| std::ptr::eq(Arc::as_ptr(entry), manager));
        if owned {
            if let Some(entry) = managers.remove(old) {
                managers.insert(new.clone(), entry);
            }
        }
        Ok(())
    }
}

static GLOBAL_REGISTRY: OnceLock<Arc<ConnectionRegistry>> = OnceLock::new();

/// Returns the process-wide registry, initializing it on first use.
#[must_use]
pub fn global_registry() -> &'static Arc<ConnectionRegistry> {
    GLOBAL_REGISTRY.get_or_init(ConnectionRegistry::new)
}
