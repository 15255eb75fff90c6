use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde_json::Value as JsonValue;

use crate::avm::{CallServiceData, CallServiceResult};
use crate::runtime_util::lock_unpoisoned;

/// Deliberate rejection of a service call by a local handler. Surfaced to
/// the interpreter as an error result, never to the particle awaiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceError {
    message: String,
}

impl ServiceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ServiceError {}

pub type ServiceHandler =
    Arc<dyn Fn(&CallServiceData) -> Result<JsonValue, ServiceError> + Send + Sync>;

/// In-process service handler registry: global handlers plus per-particle
/// scopes that shadow them. Per-particle entries are dropped when their
/// particle expires or completes.
#[derive(Default)]
pub struct ServiceRegistry {
    inner: Mutex<RegistryState>,
}

#[derive(Default)]
struct RegistryState {
    global: BTreeMap<(String, String), ServiceHandler>,
    scoped: BTreeMap<String, BTreeMap<(String, String), ServiceHandler>>,
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock_unpoisoned(&self.inner);
        f.debug_struct("ServiceRegistry")
            .field("global_handlers", &state.global.len())
            .field("particle_scopes", &state.scoped.len())
            .finish()
    }
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_global_handler(
        &self,
        service_id: impl Into<String>,
        function_name: impl Into<String>,
        handler: ServiceHandler,
    ) {
        let mut state = lock_unpoisoned(&self.inner);
        state
            .global
            .insert((service_id.into(), function_name.into()), handler);
    }

    pub fn register_particle_handler(
        &self,
        particle_id: impl Into<String>,
        service_id: impl Into<String>,
        function_name: impl Into<String>,
        handler: ServiceHandler,
    ) {
        let mut state = lock_unpoisoned(&self.inner);
        state
            .scoped
            .entry(particle_id.into())
            .or_default()
            .insert((service_id.into(), function_name.into()), handler);
    }

    pub fn remove_particle_handlers(&self, particle_id: &str) {
        let mut state = lock_unpoisoned(&self.inner);
        state.scoped.remove(particle_id);
    }

    pub fn has_particle_handlers(&self, particle_id: &str) -> bool {
        let state = lock_unpoisoned(&self.inner);
        state.scoped.contains_key(particle_id)
    }

    /// True if any function is registered under the service id, in the
    /// global map or any particle scope.
    pub fn has_service(&self, service_id: &str) -> bool {
        let state = lock_unpoisoned(&self.inner);
        state
            .global
            .keys()
            .any(|(registered, _)| registered == service_id)
            || state
                .scoped
                .values()
                .any(|scope| scope.keys().any(|(registered, _)| registered == service_id))
    }

    /// Dispatches a call: the particle scope shadows the global map. `None`
    /// means no handler matched and the caller should synthesize a
    /// "no service found" error.
    pub fn call_service(&self, request: &CallServiceData) -> Option<CallServiceResult> {
        let handler = {
            let state = lock_unpoisoned(&self.inner);
            let key = (request.service_id.clone(), request.function_name.clone());
            state
                .scoped
                .get(&request.particle.particle_id)
                .and_then(|scope| scope.get(&key))
                .or_else(|| state.global.get(&key))
                .cloned()
        };
        let handler = handler?;
        Some(match handler(request) {
            Ok(value) => CallServiceResult::ok(value),
            Err(err) => CallServiceResult::failure(err.message()),
        })
    }
}
