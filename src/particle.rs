use std::fmt;
use std::str::FromStr;

use libp2p::PeerId;

use crate::error::PeerError;
use crate::keypair::KeyPair;
use crate::runtime_util::now_unix_ms;

/// A signed, TTL-bounded execution unit carrying an AIR script and the
/// interpreter data accumulated so far. Particles are never mutated;
/// forwarding produces a new value via [`Particle::clone_with_data`].
#[derive(Clone, PartialEq, Eq)]
pub struct Particle {
    pub id: String,
    pub init_peer_id: String,
    pub timestamp: u64,
    pub ttl: u32,
    pub script: String,
    pub data: Vec<u8>,
    pub signature: Vec<u8>,
}

impl fmt::Debug for Particle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Particle")
            .field("id", &self.id)
            .field("init_peer_id", &self.init_peer_id)
            .field("timestamp", &self.timestamp)
            .field("ttl", &self.ttl)
            .field("script", &self.script)
            .field("data_len", &self.data.len())
            .field("signature", &hex::encode(&self.signature))
            .finish()
    }
}

impl Particle {
    pub fn create(
        script: impl Into<String>,
        ttl: u32,
        keypair: &KeyPair,
    ) -> Result<Self, PeerError> {
        let script = script.into();
        if script.trim().is_empty() {
            return Err(PeerError::InvalidParticle {
                reason: "script cannot be empty".to_string(),
            });
        }
        if ttl == 0 {
            return Err(PeerError::InvalidParticle {
                reason: "ttl must be positive".to_string(),
            });
        }
        let id = uuid::Uuid::new_v4().to_string();
        let timestamp = now_unix_ms();
        let signature = keypair.sign(&signing_payload(&id, timestamp, ttl, &script));
        Ok(Self {
            id,
            init_peer_id: keypair.peer_id().to_string(),
            timestamp,
            ttl,
            script,
            data: Vec::new(),
            signature,
        })
    }

    pub fn clone_with_data(&self, data: Vec<u8>) -> Self {
        Self {
            data,
            ..self.clone()
        }
    }

    pub fn deadline(&self) -> u64 {
        self.timestamp.saturating_add(u64::from(self.ttl))
    }

    pub fn has_expired(&self, now_ms: u64) -> bool {
        now_ms > self.deadline()
    }

    /// Remaining lifetime in milliseconds, zero once expired.
    pub fn remaining_ttl(&self, now_ms: u64) -> u32 {
        let remaining = self.deadline().saturating_sub(now_ms);
        u32::try_from(remaining).unwrap_or(u32::MAX)
    }

    /// Checks the particle signature against the public key embedded in
    /// `init_peer_id`.
    pub fn verify_signature(&self) -> Result<(), PeerError> {
        let init_peer_id =
            PeerId::from_str(&self.init_peer_id).map_err(|err| PeerError::InvalidParticle {
                reason: format!("malformed init peer id {}: {}", self.init_peer_id, err),
            })?;
        let payload = signing_payload(&self.id, self.timestamp, self.ttl, &self.script);
        KeyPair::verify_with_peer_id(&init_peer_id, &payload, &self.signature)
    }
}

/// Canonical signed encoding: `id || be64(timestamp) || be32(ttl) || script`.
pub fn signing_payload(id: &str, timestamp: u64, ttl: u32, script: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(id.len() + 12 + script.len());
    payload.extend_from_slice(id.as_bytes());
    payload.extend_from_slice(&timestamp.to_be_bytes());
    payload.extend_from_slice(&ttl.to_be_bytes());
    payload.extend_from_slice(script.as_bytes());
    payload
}
