use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    InvalidParticle { reason: String },
    Expired { particle_id: String },
    Interpreter { particle_id: String, message: String },
    Send { particle_id: String, reason: String },
    UnsupportedRoute { targets: Vec<String>, relay: String },
    NotInitialized { operation: String },
    AlreadyStarted { component: String },
    Marine { reason: String },
    Connection { reason: String },
    Signature { reason: String },
}

impl fmt::Display for PeerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerError::InvalidParticle { reason } => {
                write!(f, "invalid particle: {}", reason)
            }
            PeerError::Expired { particle_id } => {
                write!(f, "particle {} expired", particle_id)
            }
            PeerError::Interpreter { particle_id, message } => {
                write!(f, "interpreter error for particle {}: {}", particle_id, message)
            }
            PeerError::Send { particle_id, reason } => {
                write!(f, "failed to send particle {}: {}", particle_id, reason)
            }
            PeerError::UnsupportedRoute { targets, relay } => {
                write!(
                    f,
                    "unsupported route: only the relay {} can be dialed, got {:?}",
                    relay, targets
                )
            }
            PeerError::NotInitialized { operation } => {
                write!(f, "peer is not initialized: {}", operation)
            }
            PeerError::AlreadyStarted { component } => {
                write!(f, "{} already started", component)
            }
            PeerError::Marine { reason } => write!(f, "marine host error: {}", reason),
            PeerError::Connection { reason } => write!(f, "relay connection error: {}", reason),
            PeerError::Signature { reason } => write!(f, "signature error: {}", reason),
        }
    }
}

impl std::error::Error for PeerError {}
