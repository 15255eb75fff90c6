use std::fmt;
use std::sync::{mpsc, Arc};
use std::time::Duration;

use libp2p::PeerId;
use serde_json::Value as JsonValue;

use crate::engine::{CompletionHandle, ParticleEngine};
use crate::error::PeerError;
use crate::particle::Particle;
use crate::services::{ServiceError, ServiceHandler, ServiceRegistry};

pub const GET_DATA_SERVICE_ID: &str = "getDataSrv";
pub const CALLBACK_SERVICE_ID: &str = "callbackSrv";
pub const ERROR_HANDLER_SERVICE_ID: &str = "errorHandlingSrv";
pub const RESPONSE_FUNCTION: &str = "response";
pub const ERROR_FUNCTION: &str = "error";
pub const RELAY_ARGUMENT: &str = "-relay-";

/// Slack on top of the particle TTL before the awaiter gives up; the
/// engine's watchdog normally reports expiration first.
const COMPLETION_GRACE: Duration = Duration::from_millis(500);

/// A named argument bound into the call: either a literal served through
/// `getDataSrv.<name>` or a callback exposed as `callbackSrv.<name>`.
pub enum FunctionArg {
    Value(JsonValue),
    Callback(ServiceHandler),
}

impl fmt::Debug for FunctionArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FunctionArg::Value(value) => f.debug_tuple("Value").field(value).finish(),
            FunctionArg::Callback(_) => f.debug_tuple("Callback").finish(),
        }
    }
}

#[derive(Debug)]
pub struct CallFunctionParams {
    pub script: String,
    pub ttl: Option<u32>,
    pub args: Vec<(String, FunctionArg)>,
    pub fire_and_forget: bool,
}

impl CallFunctionParams {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            ttl: None,
            args: Vec::new(),
            fire_and_forget: false,
        }
    }

    pub fn with_ttl(mut self, ttl: u32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_value_arg(mut self, name: impl Into<String>, value: JsonValue) -> Self {
        self.args.push((name.into(), FunctionArg::Value(value)));
        self
    }

    pub fn with_callback_arg(mut self, name: impl Into<String>, handler: ServiceHandler) -> Self {
        self.args.push((name.into(), FunctionArg::Callback(handler)));
        self
    }

    pub fn with_fire_and_forget(mut self, fire_and_forget: bool) -> Self {
        self.fire_and_forget = fire_and_forget;
        self
    }
}

/// Surrounds a freshly created particle with its per-call ephemeral
/// services, initiates it and blocks until the completion settles or the
/// TTL (plus grace) runs out.
pub(crate) fn call_function(
    engine: &ParticleEngine,
    services: &ServiceRegistry,
    relay_peer_id: Option<PeerId>,
    particle: Particle,
    args: Vec<(String, FunctionArg)>,
    fire_and_forget: bool,
) -> Result<JsonValue, PeerError> {
    let particle_id = particle.id.clone();
    let ttl = particle.ttl;

    let (outcome_tx, outcome_rx) = mpsc::channel();
    let completion = CompletionHandle::new(move |outcome| {
        let _ = outcome_tx.send(outcome);
    });

    for (name, arg) in args {
        match arg {
            FunctionArg::Callback(handler) => {
                services.register_particle_handler(&particle_id, CALLBACK_SERVICE_ID, name, handler);
            }
            FunctionArg::Value(value) => {
                let handler: ServiceHandler = Arc::new(move |_request| Ok(value.clone()));
                services.register_particle_handler(&particle_id, GET_DATA_SERVICE_ID, name, handler);
            }
        }
    }

    if !fire_and_forget {
        let response_completion = completion.clone();
        services.register_particle_handler(
            &particle_id,
            CALLBACK_SERVICE_ID,
            RESPONSE_FUNCTION,
            Arc::new(move |request| {
                let value = request.arguments.first().cloned().unwrap_or(JsonValue::Null);
                response_completion.succeed(value);
                Ok(JsonValue::Null)
            }),
        );
    }

    let error_completion = completion.clone();
    let error_particle_id = particle_id.clone();
    services.register_particle_handler(
        &particle_id,
        ERROR_HANDLER_SERVICE_ID,
        ERROR_FUNCTION,
        Arc::new(move |request| {
            // String payloads stay raw text; rendering through JSON would
            // wrap them in quotes.
            let message = request
                .arguments
                .first()
                .map(|value| match value.as_str() {
                    Some(text) => text.to_string(),
                    None => value.to_string(),
                })
                .unwrap_or_else(|| "unknown interpreter error".to_string());
            error_completion.fail(PeerError::Interpreter {
                particle_id: error_particle_id.clone(),
                message,
            });
            Ok(JsonValue::Null)
        }),
    );

    let relay = relay_peer_id.map(|peer| peer.to_string());
    services.register_particle_handler(
        &particle_id,
        GET_DATA_SERVICE_ID,
        RELAY_ARGUMENT,
        Arc::new(move |_request| match &relay {
            Some(peer) => Ok(JsonValue::String(peer.clone())),
            None => Err(ServiceError::new("no relay configured")),
        }),
    );

    if let Err(err) = engine.initiate_particle(particle, completion, fire_and_forget) {
        services.remove_particle_handlers(&particle_id);
        return Err(err);
    }

    let wait_timeout = Duration::from_millis(u64::from(ttl)) + COMPLETION_GRACE;
    match outcome_rx.recv_timeout(wait_timeout) {
        Ok(outcome) => outcome,
        Err(_) => {
            services.remove_particle_handlers(&particle_id);
            Err(PeerError::Expired { particle_id })
        }
    }
}
