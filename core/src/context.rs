use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};
use url::Url;

use crate::config::AssemblyConfig;
use crate::document::DocumentProvider;
use crate::error::{CoreError, CoreResult};
use crate::grants::{Grant, MemoryPermissionStore, PermissionFlags, PermissionStore};

/// Everything storage resolution needs: registered providers, persisted grants and
/// tuning. Cloning is cheap and clones share the same grant store.
#[derive(Clone)]
pub struct StorageContext {
    config: AssemblyConfig,
    providers: HashMap<String, Arc<dyn DocumentProvider>>,
    grants: Arc<Mutex<Box<dyn PermissionStore>>>,
}

impl StorageContext {
    pub fn new(config: AssemblyConfig) -> Self {
        Self {
            config,
            providers: HashMap::new(),
            grants: Arc::new(Mutex::new(Box::new(MemoryPermissionStore::default()))),
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn DocumentProvider>) -> Self {
        self.providers
            .insert(provider.authority().to_ascii_lowercase(), provider);
        self
    }

    pub fn with_grants(mut self, grants: Box<dyn PermissionStore>) -> Self {
        self.grants = Arc::new(Mutex::new(grants));
        self
    }

    pub fn config(&self) -> &AssemblyConfig {
        &self.config
    }

    pub fn provider(&self, uri: &Url) -> CoreResult<Arc<dyn DocumentProvider>> {
        let authority = uri
            .host_str()
            .ok_or_else(|| CoreError::Unsupported(format!("uri without authority: {}", uri)))?;
        self.providers
            .get(&authority.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| CoreError::Unsupported(format!("no document provider for {}", uri)))
    }

    /// Asks the provider to persist access to `uri` and records the grant.
    pub fn take_permission(&self, uri: &Url) -> CoreResult<()> {
        let provider = self.provider(uri)?;
        provider
            .take_persistable_permission(uri)
            .map_err(|err| CoreError::PermissionDenied(format!("{}: {}", uri, err)))?;
        let mut grants = self
            .grants
            .lock()
            .map_err(|_| CoreError::Storage("grant store lock poisoned".to_string()))?;
        grants.persist(&Grant::new(uri.as_str(), PermissionFlags::READ_WRITE))?;
        debug!(%uri, "persisted permission");
        Ok(())
    }

    pub fn release_permission(&self, uri: &Url) {
        match self.grants.lock() {
            Ok(mut grants) => {
                if let Err(err) = grants.release(uri.as_str()) {
                    warn!(%uri, "failed to release permission: {err}");
                }
            }
            Err(_) => warn!(%uri, "grant store lock poisoned"),
        }
    }

    pub fn persisted_grants(&self) -> CoreResult<Vec<Grant>> {
        let grants = self
            .grants
            .lock()
            .map_err(|_| CoreError::Storage("grant store lock poisoned".to_string()))?;
        grants.list()
    }
}

impl Default for StorageContext {
    fn default() -> Self {
        Self::new(AssemblyConfig::default())
    }
}
