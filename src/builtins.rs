use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{json, Value as JsonValue};

use crate::avm::CallServiceData;
use crate::keypair::KeyPair;
use crate::marine::MarineHost;
use crate::services::{ServiceError, ServiceRegistry};

pub const SIG_SERVICE_ID: &str = "sig";
pub const SRV_SERVICE_ID: &str = "srv";
pub const TRACING_SERVICE_ID: &str = "tracingSrv";
pub const TRACING_EVENT_FUNCTION: &str = "tracingEvent";

/// Predicate gating `sig.sign`. Rejections surface as
/// `{success: false, error: "forbidden"}` data, not as service failures.
pub type SecurityGuard = Arc<dyn Fn(&CallServiceData) -> bool + Send + Sync>;

/// Default guard: the particle must originate on this peer and the signed
/// data's first tetraplet must name this peer as its producer.
pub fn default_security_guard(local_peer_id: String) -> SecurityGuard {
    Arc::new(move |request| {
        if request.particle.init_peer_id != local_peer_id {
            return false;
        }
        let Some(tetraplet) = request
            .tetraplets
            .first()
            .and_then(|group| group.first())
        else {
            return false;
        };
        tetraplet.peer_pk == local_peer_id
    })
}

pub fn register_sig_service(
    registry: &ServiceRegistry,
    keypair: Arc<KeyPair>,
    service_id: &str,
    guard: SecurityGuard,
) {
    let peer_keypair = Arc::clone(&keypair);
    registry.register_global_handler(
        service_id,
        "get_peer_id",
        Arc::new(move |_request| Ok(json!(peer_keypair.peer_id().to_string()))),
    );

    let sign_keypair = Arc::clone(&keypair);
    registry.register_global_handler(
        service_id,
        "sign",
        Arc::new(move |request| {
            if !guard(request) {
                return Ok(json!({ "success": false, "error": "forbidden" }));
            }
            let data = request
                .arguments
                .first()
                .ok_or_else(|| ServiceError::new("sign requires a data argument"))?;
            let bytes = json_byte_array(data)?;
            Ok(json!({ "success": true, "signature": sign_keypair.sign(&bytes) }))
        }),
    );

    registry.register_global_handler(
        service_id,
        "verify",
        Arc::new(move |request| {
            let [signature, data] = request.arguments.as_slice() else {
                return Err(ServiceError::new("verify requires signature and data"));
            };
            let signature = json_byte_array(signature)?;
            let data = json_byte_array(data)?;
            Ok(json!(
                KeyPair::verify(&keypair.public_key(), &data, &signature).is_ok()
            ))
        }),
    );
}

pub fn register_srv_service(registry: &ServiceRegistry, marine: Arc<MarineHost>) {
    let create_marine = Arc::clone(&marine);
    registry.register_global_handler(
        SRV_SERVICE_ID,
        "create",
        Arc::new(move |request| {
            let encoded = request
                .arguments
                .first()
                .and_then(|value| value.as_str())
                .ok_or_else(|| ServiceError::new("create requires a base64 module argument"))?;
            let wasm = STANDARD
                .decode(encoded)
                .map_err(|err| ServiceError::new(format!("invalid base64 module: {}", err)))?;
            let service_id = uuid::Uuid::new_v4().to_string();
            match create_marine.create_service(&wasm, &service_id) {
                Ok(()) => Ok(json!({ "success": true, "service_id": service_id })),
                Err(err) => Ok(json!({ "success": false, "error": err.to_string() })),
            }
        }),
    );

    let remove_marine = Arc::clone(&marine);
    registry.register_global_handler(
        SRV_SERVICE_ID,
        "remove",
        Arc::new(move |request| {
            let service_id = request
                .arguments
                .first()
                .and_then(|value| value.as_str())
                .ok_or_else(|| ServiceError::new("remove requires a service id argument"))?;
            match remove_marine.remove_service(service_id) {
                Ok(()) => Ok(json!({ "success": true })),
                Err(err) => Ok(json!({ "success": false, "error": err.to_string() })),
            }
        }),
    );

    registry.register_global_handler(
        SRV_SERVICE_ID,
        "list",
        Arc::new(move |_request| Ok(json!(marine.service_ids()))),
    );
}

/// Interpreter span events are recorded straight into the log sink.
pub fn register_tracing_service(registry: &ServiceRegistry) {
    registry.register_global_handler(
        TRACING_SERVICE_ID,
        TRACING_EVENT_FUNCTION,
        Arc::new(|request| {
            for event in &request.arguments {
                tracing::debug!("interpreter span event: {event}");
            }
            Ok(JsonValue::Null)
        }),
    );
}

fn json_byte_array(value: &JsonValue) -> Result<Vec<u8>, ServiceError> {
    let items = value
        .as_array()
        .ok_or_else(|| ServiceError::new("expected a byte array"))?;
    items
        .iter()
        .map(|item| {
            item.as_u64()
                .and_then(|n| u8::try_from(n).ok())
                .ok_or_else(|| ServiceError::new("expected a byte array"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::avm::{ParticleContext, SecurityTetraplet};

    fn local_keypair() -> Arc<KeyPair> {
        Arc::new(KeyPair::from_seed([21; 32]).expect("keypair"))
    }

    fn sign_request(
        init_peer_id: &str,
        data_peer: &str,
        arguments: Vec<JsonValue>,
    ) -> CallServiceData {
        CallServiceData {
            service_id: SIG_SERVICE_ID.to_string(),
            function_name: "sign".to_string(),
            arguments,
            tetraplets: vec![vec![SecurityTetraplet::literal(data_peer)]],
            particle: ParticleContext {
                particle_id: "p-1".to_string(),
                init_peer_id: init_peer_id.to_string(),
                timestamp: 0,
                ttl: 7000,
                signature: Vec::new(),
            },
        }
    }

    fn registry_with_sig(keypair: Arc<KeyPair>) -> ServiceRegistry {
        let registry = ServiceRegistry::new();
        let local = keypair.peer_id().to_string();
        register_sig_service(
            &registry,
            keypair,
            SIG_SERVICE_ID,
            default_security_guard(local),
        );
        registry
    }

    #[test]
    fn sign_produces_a_signature_that_verify_accepts() {
        let keypair = local_keypair();
        let local = keypair.peer_id().to_string();
        let registry = registry_with_sig(Arc::clone(&keypair));

        let signed = registry
            .call_service(&sign_request(&local, &local, vec![json!([1, 2, 3])]))
            .expect("sign result");
        assert_eq!(signed.result["success"], json!(true));
        let signature = signed.result["signature"].clone();

        let mut verify = sign_request(&local, &local, vec![signature, json!([1, 2, 3])]);
        verify.function_name = "verify".to_string();
        let verified = registry.call_service(&verify).expect("verify result");
        assert_eq!(verified.result, json!(true));
    }

    #[test]
    fn sign_is_forbidden_for_foreign_particles() {
        let keypair = local_keypair();
        let local = keypair.peer_id().to_string();
        let foreign = KeyPair::from_seed([22; 32]).expect("keypair").peer_id().to_string();
        let registry = registry_with_sig(keypair);

        let rejected = registry
            .call_service(&sign_request(&foreign, &local, vec![json!([1, 2, 3])]))
            .expect("sign result");
        assert_eq!(
            rejected.result,
            json!({ "success": false, "error": "forbidden" })
        );
        assert_eq!(rejected.ret_code, crate::avm::CALL_SERVICE_SUCCESS);
    }

    #[test]
    fn sign_is_forbidden_when_the_data_is_not_local() {
        let keypair = local_keypair();
        let local = keypair.peer_id().to_string();
        let foreign = KeyPair::from_seed([23; 32]).expect("keypair").peer_id().to_string();
        let registry = registry_with_sig(keypair);

        let rejected = registry
            .call_service(&sign_request(&local, &foreign, vec![json!([1, 2, 3])]))
            .expect("sign result");
        assert_eq!(rejected.result["success"], json!(false));
    }

    #[test]
    fn get_peer_id_returns_the_local_identity() {
        let keypair = local_keypair();
        let local = keypair.peer_id().to_string();
        let registry = registry_with_sig(Arc::clone(&keypair));

        let mut request = sign_request(&local, &local, Vec::new());
        request.function_name = "get_peer_id".to_string();
        let result = registry.call_service(&request).expect("result");
        assert_eq!(result.result, json!(local));
    }

    #[test]
    fn srv_create_reports_loader_errors_as_data() {
        let registry = ServiceRegistry::new();
        let marine = Arc::new(MarineHost::new());
        marine.start().expect("start");
        register_srv_service(&registry, Arc::clone(&marine));

        let mut request = sign_request("peer", "peer", vec![json!(STANDARD.encode(b"\0asm"))]);
        request.service_id = SRV_SERVICE_ID.to_string();
        request.function_name = "create".to_string();
        let result = registry.call_service(&request).expect("result");
        assert_eq!(result.result["success"], json!(false));

        request.function_name = "list".to_string();
        let listed = registry.call_service(&request).expect("list");
        assert_eq!(listed.result, json!([]));
    }
}
