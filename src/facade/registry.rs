//! Protocol to backend mapping

use crate::error::{GfsError, GfsResult};
use crate::fs::url::protocol_or_default;
use crate::fs::{builtin_file_systems, FileSystem, FsContext, FsDescriptor};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::debug;

/// Backend descriptors by protocol id, plus one lazily built instance per
/// protocol
pub struct Registry {
    ctx: FsContext,
    descriptors: RwLock<BTreeMap<String, FsDescriptor>>,
    instances: Mutex<HashMap<String, Arc<dyn FileSystem>>>,
}

impl Registry {
    /// Empty registry
    pub fn new(ctx: FsContext) -> Self {
        Self {
            ctx,
            descriptors: RwLock::new(BTreeMap::new()),
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// Registry holding every built-in backend
    pub fn with_builtins(ctx: FsContext) -> Self {
        let registry = Self::new(ctx);
        for descriptor in builtin_file_systems() {
            registry.register_fs(descriptor);
        }
        registry
    }

    pub fn context(&self) -> &FsContext {
        &self.ctx
    }

    /// Register `descriptor` for all of its ids, replacing earlier
    /// registrations and their instances
    pub fn register_fs(&self, descriptor: FsDescriptor) {
        let mut descriptors = self.descriptors.write().unwrap_or_else(PoisonError::into_inner);
        let mut instances = self.instances.lock().unwrap_or_else(PoisonError::into_inner);
        for id in descriptor.ids {
            let id = id.to_ascii_lowercase();
            instances.remove(&id);
            descriptors.insert(id, descriptor);
        }
        debug!("Registered filesystem for {:?}", descriptor.ids);
    }

    /// Registered protocol ids, sorted
    pub fn protocols(&self) -> Vec<String> {
        self.descriptors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Backend instance for `protocol`, built on first use
    pub fn get(&self, protocol: &str) -> GfsResult<Arc<dyn FileSystem>> {
        let protocol = protocol.to_ascii_lowercase();
        let descriptor = self
            .descriptors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&protocol)
            .copied()
            .ok_or_else(|| GfsError::UnknownProtocol(protocol.clone()))?;

        let mut instances = self.instances.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(fs) = instances.get(&protocol) {
            return Ok(fs.clone());
        }
        let fs = (descriptor.factory)(&self.ctx)?;
        debug!("Initialized {} filesystem", protocol);
        instances.insert(protocol, fs.clone());
        Ok(fs)
    }

    /// Backend for `path` and the path normalized by that backend.
    ///
    /// Paths without a scheme are local.
    pub fn resolve_fs(&self, path: &str) -> GfsResult<(Arc<dyn FileSystem>, String)> {
        let fs = self.get(&protocol_or_default(path))?;
        let normalized = fs.norm_url(path)?;
        Ok((fs, normalized))
    }
}
