use std::fmt;

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use libp2p::identity;
use libp2p::PeerId;
use rand::rngs::OsRng;

use crate::error::PeerError;

/// Ed25519 identity of the peer. The dalek signing key is the source of
/// truth; the libp2p keypair used by the relay connection is derived from
/// the same seed.
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
    peer_id: PeerId,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("peer_id", &self.peer_id)
            .field("public_key", &hex::encode(self.public_key()))
            .finish()
    }
}

impl KeyPair {
    pub fn generate() -> Result<Self, PeerError> {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    pub fn from_seed(seed: [u8; 32]) -> Result<Self, PeerError> {
        Self::from_signing_key(SigningKey::from_bytes(&seed))
    }

    fn from_signing_key(signing_key: SigningKey) -> Result<Self, PeerError> {
        let public = identity::ed25519::PublicKey::try_from_bytes(
            &signing_key.verifying_key().to_bytes(),
        )
        .map_err(|err| PeerError::Signature {
            reason: format!("derive peer id from ed25519 public key failed: {}", err),
        })?;
        let peer_id = PeerId::from_public_key(&identity::PublicKey::from(public));
        Ok(Self {
            signing_key,
            peer_id,
        })
    }

    /// Raw 32-byte seed, consumed by the AVM run parameters to prove the
    /// local identity to the interpreter.
    pub fn seed(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_bytes().to_vec()
    }

    /// Keypair for the libp2p transport, derived from the same seed.
    pub fn to_libp2p(&self) -> Result<identity::Keypair, PeerError> {
        identity::Keypair::ed25519_from_bytes(self.signing_key.to_bytes()).map_err(|err| {
            PeerError::Signature {
                reason: format!("derive libp2p keypair failed: {}", err),
            }
        })
    }

    pub fn verify(
        public_key: &[u8; 32],
        message: &[u8],
        signature: &[u8],
    ) -> Result<(), PeerError> {
        let verifying_key = VerifyingKey::from_bytes(public_key).map_err(|err| {
            PeerError::Signature {
                reason: format!("parse ed25519 public key failed: {}", err),
            }
        })?;
        let signature =
            ed25519_dalek::Signature::from_slice(signature).map_err(|err| PeerError::Signature {
                reason: format!("parse ed25519 signature failed: {}", err),
            })?;
        verifying_key
            .verify(message, &signature)
            .map_err(|err| PeerError::Signature {
                reason: format!("signature verification failed: {}", err),
            })
    }

    /// Verifies a signature against the public key embedded in a base58
    /// multihash peer id.
    pub fn verify_with_peer_id(
        peer_id: &PeerId,
        message: &[u8],
        signature: &[u8],
    ) -> Result<(), PeerError> {
        let public = public_key_from_peer_id(peer_id)?;
        if public.verify(message, signature) {
            Ok(())
        } else {
            Err(PeerError::Signature {
                reason: format!("signature does not verify under peer id {}", peer_id),
            })
        }
    }
}

pub fn public_key_from_peer_id(peer_id: &PeerId) -> Result<identity::PublicKey, PeerError> {
    let multihash =
        multihash::Multihash::<64>::from_bytes(&peer_id.to_bytes()).map_err(|err| {
            PeerError::Signature {
                reason: format!("decode peer id multihash failed: {}", err),
            }
        })?;
    identity::PublicKey::try_decode_protobuf(multihash.digest()).map_err(|err| {
        PeerError::Signature {
            reason: format!("peer id {} does not embed a public key: {}", peer_id, err),
        }
    })
}
