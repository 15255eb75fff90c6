use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::PeerError;
use crate::particle::Particle;

pub const AVM_SERVICE_ID: &str = "avm";
pub const AVM_INVOKE_FUNCTION: &str = "invoke";
pub const AVM_AST_FUNCTION: &str = "ast";

/// Key format tag the interpreter expects alongside the secret key bytes.
pub const KEY_FORMAT_ED25519: u8 = 0;

pub const CALL_SERVICE_SUCCESS: i32 = 0;
pub const CALL_SERVICE_FAILURE: i32 = 1;

/// Per-argument provenance: which peer, service, function and path produced
/// a value. Carried through service calls unchanged from the interpreter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityTetraplet {
    pub peer_pk: String,
    #[serde(default)]
    pub service_id: String,
    #[serde(default)]
    pub function_name: String,
    #[serde(default)]
    pub json_path: String,
}

impl SecurityTetraplet {
    /// Tetraplet of a literal originating on the given peer.
    pub fn literal(peer_pk: impl Into<String>) -> Self {
        Self {
            peer_pk: peer_pk.into(),
            service_id: String::new(),
            function_name: String::new(),
            json_path: String::new(),
        }
    }
}

/// An outbound service call requested by one interpreter invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
    pub service_id: String,
    pub function_name: String,
    #[serde(default)]
    pub arguments: Vec<JsonValue>,
    #[serde(default)]
    pub tetraplets: Vec<Vec<SecurityTetraplet>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterpreterResult {
    pub ret_code: i32,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub data: Vec<u8>,
    #[serde(default)]
    pub next_peer_pks: Vec<String>,
    #[serde(default)]
    pub call_requests: Vec<(u32, CallRequest)>,
}

impl InterpreterResult {
    pub fn success(
        data: Vec<u8>,
        next_peer_pks: Vec<String>,
        call_requests: Vec<(u32, CallRequest)>,
    ) -> Self {
        Self {
            ret_code: 0,
            error_message: String::new(),
            data,
            next_peer_pks,
            call_requests,
        }
    }

    pub fn error(ret_code: i32, error_message: impl Into<String>) -> Self {
        Self {
            ret_code,
            error_message: error_message.into(),
            data: Vec::new(),
            next_peer_pks: Vec::new(),
            call_requests: Vec::new(),
        }
    }
}

/// Identity and timing parameters threaded into every interpreter run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunParameters {
    pub init_peer_id: String,
    pub current_peer_id: String,
    pub timestamp: u64,
    pub ttl: u32,
    pub key_format: u8,
    pub particle_id: String,
    pub secret_key_bytes: Vec<u8>,
}

/// One interpreter invocation: the script, the run parameters, the group's
/// previous data, the particle's current data and the call results to merge.
#[derive(Debug, Clone, PartialEq)]
pub struct AvmInvocation {
    pub script: String,
    pub parameters: RunParameters,
    pub prev_data: Vec<u8>,
    pub data: Vec<u8>,
    pub call_results: Vec<(u32, CallServiceResult)>,
}

/// Marine calling convention: `invoke` takes a five-element JSON array of
/// script, run parameters, base64 prev data, base64 current data and the
/// keyed call results.
pub fn serialize_avm_args(invocation: &AvmInvocation) -> Result<Vec<JsonValue>, PeerError> {
    let parameters = serde_json::to_value(&invocation.parameters).map_err(|err| {
        PeerError::Marine {
            reason: format!("serialize avm run parameters failed: {}", err),
        }
    })?;
    let call_results =
        serde_json::to_value(&invocation.call_results).map_err(|err| PeerError::Marine {
            reason: format!("serialize avm call results failed: {}", err),
        })?;
    Ok(vec![
        JsonValue::String(invocation.script.clone()),
        parameters,
        JsonValue::String(STANDARD.encode(&invocation.prev_data)),
        JsonValue::String(STANDARD.encode(&invocation.data)),
        call_results,
    ])
}

/// Inverse of [`serialize_avm_args`], used by interpreter hosts.
pub fn deserialize_avm_args(arguments: &[JsonValue]) -> Result<AvmInvocation, PeerError> {
    let [script, parameters, prev_data, data, call_results] = arguments else {
        return Err(PeerError::Marine {
            reason: format!("avm invoke expects 5 arguments, got {}", arguments.len()),
        });
    };
    let script = script
        .as_str()
        .ok_or_else(|| PeerError::Marine {
            reason: "avm invoke script must be a string".to_string(),
        })?
        .to_string();
    let parameters: RunParameters =
        serde_json::from_value(parameters.clone()).map_err(|err| PeerError::Marine {
            reason: format!("decode avm run parameters failed: {}", err),
        })?;
    let call_results: Vec<(u32, CallServiceResult)> =
        serde_json::from_value(call_results.clone()).map_err(|err| PeerError::Marine {
            reason: format!("decode avm call results failed: {}", err),
        })?;
    Ok(AvmInvocation {
        script,
        parameters,
        prev_data: decode_base64_arg(prev_data, "prev data")?,
        data: decode_base64_arg(data, "data")?,
        call_results,
    })
}

fn decode_base64_arg(value: &JsonValue, label: &str) -> Result<Vec<u8>, PeerError> {
    let encoded = value.as_str().ok_or_else(|| PeerError::Marine {
        reason: format!("avm invoke {} must be a base64 string", label),
    })?;
    STANDARD.decode(encoded).map_err(|err| PeerError::Marine {
        reason: format!("avm invoke {} is not valid base64: {}", label, err),
    })
}

/// The `invoke` return value is an opaque byte buffer: CBOR-encoded
/// [`InterpreterResult`], carried through JSON as a base64 string.
pub fn encode_avm_result(result: &InterpreterResult) -> Result<JsonValue, PeerError> {
    let bytes = serde_cbor::to_vec(result).map_err(|err| PeerError::Marine {
        reason: format!("encode interpreter result failed: {}", err),
    })?;
    Ok(JsonValue::String(STANDARD.encode(bytes)))
}

pub fn decode_avm_result(value: &JsonValue) -> Result<InterpreterResult, PeerError> {
    let encoded = value.as_str().ok_or_else(|| PeerError::Marine {
        reason: "avm invoke returned a non-string result buffer".to_string(),
    })?;
    let bytes = STANDARD.decode(encoded).map_err(|err| PeerError::Marine {
        reason: format!("avm result buffer is not valid base64: {}", err),
    })?;
    serde_cbor::from_slice(&bytes).map_err(|err| PeerError::Marine {
        reason: format!("decode interpreter result failed: {}", err),
    })
}

/// Identity of the particle a service call belongs to, as seen by handlers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticleContext {
    pub particle_id: String,
    pub init_peer_id: String,
    pub timestamp: u64,
    pub ttl: u32,
    pub signature: Vec<u8>,
}

/// A fully-resolved service call handed to Marine or a local handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallServiceData {
    pub service_id: String,
    pub function_name: String,
    pub arguments: Vec<JsonValue>,
    pub tetraplets: Vec<Vec<SecurityTetraplet>>,
    pub particle: ParticleContext,
}

impl CallServiceData {
    pub fn from_request(request: &CallRequest, particle: &Particle) -> Self {
        Self {
            service_id: request.service_id.clone(),
            function_name: request.function_name.clone(),
            arguments: request.arguments.clone(),
            tetraplets: request.tetraplets.clone(),
            particle: ParticleContext {
                particle_id: particle.id.clone(),
                init_peer_id: particle.init_peer_id.clone(),
                timestamp: particle.timestamp,
                ttl: particle.ttl,
                signature: particle.signature.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallServiceResult {
    pub ret_code: i32,
    pub result: JsonValue,
}

impl CallServiceResult {
    pub fn ok(result: JsonValue) -> Self {
        Self {
            ret_code: CALL_SERVICE_SUCCESS,
            result,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            ret_code: CALL_SERVICE_FAILURE,
            result: JsonValue::String(message.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn invocation() -> AvmInvocation {
        AvmInvocation {
            script: "(null)".to_string(),
            parameters: RunParameters {
                init_peer_id: "12D3init".to_string(),
                current_peer_id: "12D3self".to_string(),
                timestamp: 1_700_000_000_000,
                ttl: 7000,
                key_format: KEY_FORMAT_ED25519,
                particle_id: "p-1".to_string(),
                secret_key_bytes: vec![7; 32],
            },
            prev_data: vec![1, 2],
            data: vec![3, 4, 5],
            call_results: vec![(2, CallServiceResult::ok(json!("fast")))],
        }
    }

    #[test]
    fn avm_args_round_trip() {
        let original = invocation();
        let args = serialize_avm_args(&original).expect("serialize");
        assert_eq!(args.len(), 5);
        let decoded = deserialize_avm_args(&args).expect("deserialize");
        assert_eq!(decoded, original);
    }

    #[test]
    fn avm_result_round_trips_through_the_buffer_encoding() {
        let result = InterpreterResult::success(
            vec![9, 9, 9],
            vec!["12D3relay".to_string()],
            vec![(
                1,
                CallRequest {
                    service_id: "print".to_string(),
                    function_name: "print".to_string(),
                    arguments: vec![json!("1")],
                    tetraplets: vec![vec![SecurityTetraplet::literal("12D3init")]],
                },
            )],
        );
        let encoded = encode_avm_result(&result).expect("encode");
        let decoded = decode_avm_result(&encoded).expect("decode");
        assert_eq!(decoded, result);
    }

    #[test]
    fn decode_rejects_malformed_buffers() {
        assert!(decode_avm_result(&json!(42)).is_err());
        assert!(decode_avm_result(&json!("not base64 !!!")).is_err());
        assert!(decode_avm_result(&json!(STANDARD.encode(b"not cbor"))).is_err());
    }

    #[test]
    fn call_service_data_carries_the_particle_context() {
        let keypair = crate::keypair::KeyPair::from_seed([1; 32]).expect("keypair");
        let particle = Particle::create("(null)", 500, &keypair).expect("particle");
        let request = CallRequest {
            service_id: "sig".to_string(),
            function_name: "sign".to_string(),
            arguments: vec![json!([1, 2, 3])],
            tetraplets: Vec::new(),
        };

        let data = CallServiceData::from_request(&request, &particle);
        assert_eq!(data.particle.particle_id, particle.id);
        assert_eq!(data.particle.init_peer_id, particle.init_peer_id);
        assert_eq!(data.particle.signature, particle.signature);
    }
}
