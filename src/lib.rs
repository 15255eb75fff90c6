//! Client peer for a particle-based p2p execution network.
//!
//! A particle is a signed, TTL-bounded message carrying an AIR script plus
//! accumulated interpreter data. The peer drives each particle through
//! repeated invocations of the interpreter hosted behind the Marine
//! facade, services the interpreter's call requests against Marine
//! services or local handlers, forwards resulting particles through the
//! relay connection, and returns final results to local awaiters.

use std::sync::Arc;

use libp2p::PeerId;
use serde_json::Value as JsonValue;

mod avm;
mod builtins;
mod call_function;
mod connection;
mod engine;
mod error;
mod keypair;
mod marine;
mod particle;
mod runtime_util;
mod services;

pub use avm::{
    decode_avm_result, deserialize_avm_args, encode_avm_result, serialize_avm_args, AvmInvocation,
    CallRequest, CallServiceData, CallServiceResult, InterpreterResult, ParticleContext,
    RunParameters, SecurityTetraplet, AVM_AST_FUNCTION, AVM_INVOKE_FUNCTION, AVM_SERVICE_ID,
    CALL_SERVICE_FAILURE, CALL_SERVICE_SUCCESS, KEY_FORMAT_ED25519,
};
pub use builtins::{
    default_security_guard, register_sig_service, register_srv_service, register_tracing_service,
    SecurityGuard, SIG_SERVICE_ID, SRV_SERVICE_ID, TRACING_SERVICE_ID,
};
pub use call_function::{
    CallFunctionParams, FunctionArg, CALLBACK_SERVICE_ID, ERROR_FUNCTION,
    ERROR_HANDLER_SERVICE_ID, GET_DATA_SERVICE_ID, RELAY_ARGUMENT, RESPONSE_FUNCTION,
};
pub use connection::{
    check_route, decode_particle, encode_particle, ParticleTransport, RelayConnection,
    RelayConnectionConfig, PARTICLE_PROTOCOL,
};
pub use engine::{CompletionHandle, ParticleEngine, ParticleQueueItem};
pub use error::PeerError;
pub use keypair::{public_key_from_peer_id, KeyPair};
pub use marine::{MarineHost, ModuleLoader, ServiceModule};
pub use particle::{signing_payload, Particle};
pub use services::{ServiceError, ServiceHandler, ServiceRegistry};

pub const DEFAULT_TTL_MS: u32 = 7000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub default_ttl_ms: u32,
    pub print_particle_id: bool,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: DEFAULT_TTL_MS,
            print_particle_id: false,
        }
    }
}

impl PeerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_ttl(mut self, ttl_ms: u32) -> Result<Self, PeerError> {
        if ttl_ms == 0 {
            return Err(PeerError::InvalidParticle {
                reason: "default ttl must be positive".to_string(),
            });
        }
        self.default_ttl_ms = ttl_ms;
        Ok(self)
    }

    pub fn with_print_particle_id(mut self, enabled: bool) -> Self {
        self.print_particle_id = enabled;
        self
    }
}

/// The assembled peer: identity, Marine host, local service registry,
/// transport and the particle engine, plus the call-function front door.
pub struct Peer {
    config: PeerConfig,
    keypair: Arc<KeyPair>,
    marine: Arc<MarineHost>,
    services: Arc<ServiceRegistry>,
    transport: Arc<dyn ParticleTransport>,
    engine: ParticleEngine,
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("peer_id", &self.keypair.peer_id())
            .field("running", &self.engine.is_running())
            .finish()
    }
}

impl Peer {
    pub fn new(
        config: PeerConfig,
        keypair: KeyPair,
        transport: Arc<dyn ParticleTransport>,
    ) -> Self {
        Self::with_marine(config, keypair, transport, MarineHost::new())
    }

    pub fn with_marine(
        config: PeerConfig,
        keypair: KeyPair,
        transport: Arc<dyn ParticleTransport>,
        marine: MarineHost,
    ) -> Self {
        let keypair = Arc::new(keypair);
        let marine = Arc::new(marine);
        let services = Arc::new(ServiceRegistry::new());
        let engine = ParticleEngine::new(
            Arc::clone(&marine),
            Arc::clone(&services),
            Arc::clone(&transport),
            &keypair,
            config.print_particle_id,
        );

        let local_peer_id = keypair.peer_id().to_string();
        builtins::register_sig_service(
            &services,
            Arc::clone(&keypair),
            builtins::SIG_SERVICE_ID,
            builtins::default_security_guard(local_peer_id),
        );
        builtins::register_srv_service(&services, Arc::clone(&marine));
        builtins::register_tracing_service(&services);

        Self {
            config,
            keypair,
            marine,
            services,
            transport,
            engine,
        }
    }

    pub fn start(&self) -> Result<(), PeerError> {
        self.engine.start()
    }

    pub fn stop(&self) -> Result<(), PeerError> {
        self.engine.stop()
    }

    pub fn is_running(&self) -> bool {
        self.engine.is_running()
    }

    pub fn peer_id(&self) -> PeerId {
        self.keypair.peer_id()
    }

    pub fn keypair(&self) -> &KeyPair {
        &self.keypair
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    pub fn marine(&self) -> &MarineHost {
        &self.marine
    }

    pub fn engine(&self) -> &ParticleEngine {
        &self.engine
    }

    pub fn default_ttl_ms(&self) -> u32 {
        self.config.default_ttl_ms
    }

    pub fn create_particle(
        &self,
        script: impl Into<String>,
        ttl: Option<u32>,
    ) -> Result<Particle, PeerError> {
        Particle::create(
            script,
            ttl.unwrap_or(self.config.default_ttl_ms),
            &self.keypair,
        )
    }

    /// Validates an AIR script through the interpreter's `ast` entry point.
    pub fn validate_script(&self, script: &str) -> Result<JsonValue, PeerError> {
        self.marine.validate_script(script)
    }

    /// Builds a particle for the script, surrounds it with the per-call
    /// reserved services and blocks until it completes or expires.
    pub fn call_function(&self, params: CallFunctionParams) -> Result<JsonValue, PeerError> {
        let particle = self.create_particle(params.script.as_str(), params.ttl)?;
        call_function::call_function(
            &self.engine,
            &self.services,
            self.transport.relay_peer_id(),
            particle,
            params.args,
            params.fire_and_forget,
        )
    }
}
