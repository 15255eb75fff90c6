use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value as JsonValue;

use crate::avm::{
    decode_avm_result, serialize_avm_args, AvmInvocation, InterpreterResult, AVM_AST_FUNCTION,
    AVM_INVOKE_FUNCTION, AVM_SERVICE_ID,
};
use crate::error::PeerError;
use crate::runtime_util::lock_unpoisoned;
use crate::services::ServiceError;

/// A hosted service instance. Implementations wrap a module living in the
/// WASM runtime; tests and embedders may install in-process modules.
/// Callers hold the module lock for the duration of a call, which is what
/// makes `&mut self` sound.
pub trait ServiceModule: Send {
    fn call(
        &mut self,
        function_name: &str,
        arguments: &[JsonValue],
    ) -> Result<JsonValue, ServiceError>;
}

/// Instantiates a service module from raw WASM bytes. The real loader is
/// supplied by the embedding runtime; the default reports it missing.
pub type ModuleLoader =
    Box<dyn Fn(&[u8], &str) -> Result<Box<dyn ServiceModule>, PeerError> + Send + Sync>;

/// Thin facade over the WASM service runtime. Keeps one module per service
/// id and serializes calls per service: no module ever observes two
/// concurrent invocations.
pub struct MarineHost {
    started: AtomicBool,
    services: Mutex<BTreeMap<String, Arc<Mutex<Box<dyn ServiceModule>>>>>,
    loader: ModuleLoader,
}

impl fmt::Debug for MarineHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MarineHost")
            .field("started", &self.started.load(Ordering::SeqCst))
            .field("services", &self.service_ids())
            .finish()
    }
}

impl Default for MarineHost {
    fn default() -> Self {
        Self::new()
    }
}

impl MarineHost {
    pub fn new() -> Self {
        Self::with_loader(Box::new(|_wasm, service_id| {
            Err(PeerError::Marine {
                reason: format!(
                    "no module loader configured, cannot instantiate service {}",
                    service_id
                ),
            })
        }))
    }

    pub fn with_loader(loader: ModuleLoader) -> Self {
        Self {
            started: AtomicBool::new(false),
            services: Mutex::new(BTreeMap::new()),
            loader,
        }
    }

    pub fn start(&self) -> Result<(), PeerError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(PeerError::AlreadyStarted {
                component: "marine host".to_string(),
            });
        }
        Ok(())
    }

    pub fn stop(&self) -> Result<(), PeerError> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Err(PeerError::NotInitialized {
                operation: "stop marine host".to_string(),
            });
        }
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Installs an in-process module under the given service id.
    pub fn register_module(
        &self,
        service_id: impl Into<String>,
        module: Box<dyn ServiceModule>,
    ) -> Result<(), PeerError> {
        let service_id = service_id.into();
        let mut services = lock_unpoisoned(&self.services);
        if services.contains_key(&service_id) {
            return Err(PeerError::Marine {
                reason: format!("service {} already exists", service_id),
            });
        }
        services.insert(service_id, Arc::new(Mutex::new(module)));
        Ok(())
    }

    pub fn create_service(&self, wasm_bytes: &[u8], service_id: &str) -> Result<(), PeerError> {
        let module = (self.loader)(wasm_bytes, service_id)?;
        self.register_module(service_id, module)
    }

    pub fn remove_service(&self, service_id: &str) -> Result<(), PeerError> {
        let mut services = lock_unpoisoned(&self.services);
        if services.remove(service_id).is_none() {
            return Err(PeerError::Marine {
                reason: format!("no such service: {}", service_id),
            });
        }
        Ok(())
    }

    pub fn has_service(&self, service_id: &str) -> bool {
        lock_unpoisoned(&self.services).contains_key(service_id)
    }

    pub fn service_ids(&self) -> Vec<String> {
        lock_unpoisoned(&self.services).keys().cloned().collect()
    }

    pub fn call_service(
        &self,
        service_id: &str,
        function_name: &str,
        arguments: &[JsonValue],
    ) -> Result<JsonValue, PeerError> {
        if !self.is_started() {
            return Err(PeerError::NotInitialized {
                operation: format!("call service {}", service_id),
            });
        }
        let module = {
            let services = lock_unpoisoned(&self.services);
            services.get(service_id).cloned()
        }
        .ok_or_else(|| PeerError::Marine {
            reason: format!("no such service: {}", service_id),
        })?;
        let mut module = lock_unpoisoned(&module);
        module
            .call(function_name, arguments)
            .map_err(|err| PeerError::Marine {
                reason: format!(
                    "service {}.{} failed: {}",
                    service_id,
                    function_name,
                    err.message()
                ),
            })
    }

    /// Runs one interpreter invocation through the mandated `avm` service.
    pub fn invoke_avm(&self, invocation: &AvmInvocation) -> Result<InterpreterResult, PeerError> {
        let arguments = serialize_avm_args(invocation)?;
        let value = self.call_service(AVM_SERVICE_ID, AVM_INVOKE_FUNCTION, &arguments)?;
        decode_avm_result(&value)
    }

    /// Validates an AIR script through `avm.ast`. The interpreter replies
    /// with either a JSON AST or a string starting with `"error"`.
    pub fn validate_script(&self, script: &str) -> Result<JsonValue, PeerError> {
        let value = self.call_service(
            AVM_SERVICE_ID,
            AVM_AST_FUNCTION,
            &[JsonValue::String(script.to_string())],
        )?;
        if let Some(text) = value.as_str() {
            if text.starts_with("error") {
                return Err(PeerError::InvalidParticle {
                    reason: format!("script rejected by interpreter: {}", text),
                });
            }
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    struct EchoModule;

    impl ServiceModule for EchoModule {
        fn call(
            &mut self,
            function_name: &str,
            arguments: &[JsonValue],
        ) -> Result<JsonValue, ServiceError> {
            match function_name {
                "echo" => Ok(arguments.first().cloned().unwrap_or(JsonValue::Null)),
                "reject" => Err(ServiceError::new("rejected on purpose")),
                other => Err(ServiceError::new(format!("unknown function {}", other))),
            }
        }
    }

    struct SlowCountingModule {
        active: Arc<AtomicBool>,
        overlapped: Arc<AtomicBool>,
    }

    impl ServiceModule for SlowCountingModule {
        fn call(
            &mut self,
            _function_name: &str,
            _arguments: &[JsonValue],
        ) -> Result<JsonValue, ServiceError> {
            if self.active.swap(true, Ordering::SeqCst) {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            std::thread::sleep(Duration::from_millis(20));
            self.active.store(false, Ordering::SeqCst);
            Ok(JsonValue::Null)
        }
    }

    fn started_host() -> MarineHost {
        let host = MarineHost::new();
        host.start().expect("start");
        host
    }

    #[test]
    fn calls_route_to_the_registered_module() {
        let host = started_host();
        host.register_module("echo", Box::new(EchoModule)).expect("register");

        let value = host
            .call_service("echo", "echo", &[json!("hello")])
            .expect("call");
        assert_eq!(value, json!("hello"));

        let err = host
            .call_service("echo", "reject", &[])
            .expect_err("rejection");
        assert!(matches!(err, PeerError::Marine { .. }));
    }

    #[test]
    fn calls_require_a_started_host_and_a_known_service() {
        let host = MarineHost::new();
        assert!(matches!(
            host.call_service("echo", "echo", &[]),
            Err(PeerError::NotInitialized { .. })
        ));

        host.start().expect("start");
        assert!(matches!(
            host.call_service("ghost", "echo", &[]),
            Err(PeerError::Marine { .. })
        ));
    }

    #[test]
    fn duplicate_service_ids_are_rejected() {
        let host = started_host();
        host.register_module("echo", Box::new(EchoModule)).expect("register");
        assert!(host.register_module("echo", Box::new(EchoModule)).is_err());

        host.remove_service("echo").expect("remove");
        assert!(!host.has_service("echo"));
        assert!(host.remove_service("echo").is_err());
    }

    #[test]
    fn default_loader_reports_the_runtime_missing() {
        let host = started_host();
        assert!(matches!(
            host.create_service(b"\0asm", "svc"),
            Err(PeerError::Marine { .. })
        ));
    }

    #[test]
    fn calls_on_one_service_never_overlap() {
        let host = Arc::new(started_host());
        let active = Arc::new(AtomicBool::new(false));
        let overlapped = Arc::new(AtomicBool::new(false));
        host.register_module(
            "slow",
            Box::new(SlowCountingModule {
                active: Arc::clone(&active),
                overlapped: Arc::clone(&overlapped),
            }),
        )
        .expect("register");

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let host = Arc::clone(&host);
                std::thread::spawn(move || {
                    host.call_service("slow", "run", &[]).expect("call");
                })
            })
            .collect();
        for worker in workers {
            worker.join().expect("join");
        }
        assert!(!overlapped.load(Ordering::SeqCst));
    }
}
