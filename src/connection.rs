use std::collections::HashMap;
use std::io;
use std::sync::mpsc as std_mpsc;
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::channel::mpsc;
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use futures::{FutureExt, StreamExt};
use libp2p::identity;
use libp2p::multiaddr::Protocol;
use libp2p::request_response::{self, OutboundRequestId, ProtocolSupport};
use libp2p::swarm::{Swarm, SwarmEvent};
use libp2p::{noise, Multiaddr, PeerId, StreamProtocol, Transport as _};
use serde::{Deserialize, Serialize};

use crate::error::PeerError;
use crate::keypair::KeyPair;
use crate::particle::Particle;
use crate::runtime_util::lock_unpoisoned;

pub const PARTICLE_PROTOCOL: &str = "/fluence/particle/2.0.0";

const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

/// Particle source/sink the engine drives. The relay implementation lives
/// below; tests install in-memory fakes behind the same seam.
pub trait ParticleTransport: Send + Sync {
    fn start(&self) -> Result<(), PeerError>;
    fn stop(&self) -> Result<(), PeerError>;
    /// The relay this transport forwards through, if any.
    fn relay_peer_id(&self) -> Option<PeerId>;
    fn send_particle(&self, next_peers: &[String], particle: &Particle) -> Result<(), PeerError>;
    /// Registers the sink incoming particles are pushed into. Must be
    /// called before `start`; the sender is dropped on `stop`.
    fn subscribe(&self, sink: std_mpsc::Sender<Particle>);
}

/// Relay policy: a client peer may only hand particles to its relay.
pub fn check_route(next_peers: &[String], relay: &PeerId) -> Result<(), PeerError> {
    let relay = relay.to_string();
    if next_peers.len() == 1 && next_peers[0] == relay {
        Ok(())
    } else {
        Err(PeerError::UnsupportedRoute {
            targets: next_peers.to_vec(),
            relay,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action")]
enum ParticleEnvelope {
    Particle(WireParticle),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct WireParticle {
    id: String,
    init_peer_id: String,
    timestamp: u64,
    ttl: u32,
    script: String,
    signature: String,
    data: String,
}

pub fn encode_particle(particle: &Particle) -> Result<Vec<u8>, PeerError> {
    let envelope = ParticleEnvelope::Particle(WireParticle {
        id: particle.id.clone(),
        init_peer_id: particle.init_peer_id.clone(),
        timestamp: particle.timestamp,
        ttl: particle.ttl,
        script: particle.script.clone(),
        signature: STANDARD.encode(&particle.signature),
        data: STANDARD.encode(&particle.data),
    });
    serde_json::to_vec(&envelope).map_err(|err| PeerError::Connection {
        reason: format!("encode particle envelope failed: {}", err),
    })
}

pub fn decode_particle(payload: &[u8]) -> Result<Particle, PeerError> {
    let ParticleEnvelope::Particle(wire) =
        serde_json::from_slice(payload).map_err(|err| PeerError::Connection {
            reason: format!("decode particle envelope failed: {}", err),
        })?;
    let signature = STANDARD
        .decode(&wire.signature)
        .map_err(|err| PeerError::Connection {
            reason: format!("particle signature is not valid base64: {}", err),
        })?;
    let data = STANDARD
        .decode(&wire.data)
        .map_err(|err| PeerError::Connection {
            reason: format!("particle data is not valid base64: {}", err),
        })?;
    Ok(Particle {
        id: wire.id,
        init_peer_id: wire.init_peer_id,
        timestamp: wire.timestamp,
        ttl: wire.ttl,
        script: wire.script,
        data,
        signature,
    })
}

#[derive(Debug, Clone)]
pub struct RelayConnectionConfig {
    pub relay_address: Multiaddr,
    pub dial_timeout: Duration,
    pub skip_connection_check: bool,
    pub check_connection_timeout: Duration,
}

impl RelayConnectionConfig {
    pub fn new(relay_address: Multiaddr) -> Result<Self, PeerError> {
        if peer_id_of(&relay_address).is_none() {
            return Err(PeerError::Connection {
                reason: format!(
                    "relay address must include a /p2p/ component: {}",
                    relay_address
                ),
            });
        }
        Ok(Self {
            relay_address,
            dial_timeout: Duration::from_secs(10),
            skip_connection_check: false,
            check_connection_timeout: Duration::from_secs(10),
        })
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Result<Self, PeerError> {
        if timeout.is_zero() {
            return Err(PeerError::Connection {
                reason: "dial timeout must be positive".to_string(),
            });
        }
        self.dial_timeout = timeout;
        Ok(self)
    }

    pub fn with_skip_connection_check(mut self, skip: bool) -> Self {
        self.skip_connection_check = skip;
        self
    }

    pub fn with_check_connection_timeout(mut self, timeout: Duration) -> Result<Self, PeerError> {
        if timeout.is_zero() {
            return Err(PeerError::Connection {
                reason: "connection check timeout must be positive".to_string(),
            });
        }
        self.check_connection_timeout = timeout;
        Ok(self)
    }
}

fn peer_id_of(address: &Multiaddr) -> Option<PeerId> {
    address.iter().find_map(|protocol| match protocol {
        Protocol::P2p(peer_id) => Some(peer_id),
        _ => None,
    })
}

fn strip_peer_component(address: &Multiaddr) -> Multiaddr {
    address
        .iter()
        .filter(|protocol| !matches!(protocol, Protocol::P2p(_)))
        .collect()
}

enum Command {
    SendParticle {
        payload: Vec<u8>,
        result_tx: std_mpsc::Sender<Result<(), String>>,
    },
    Shutdown,
}

/// Particle transport over a single relay: a libp2p swarm driven on a
/// background thread, a command channel in, decoded particles out.
pub struct RelayConnection {
    relay_peer: PeerId,
    config: RelayConnectionConfig,
    keypair: identity::Keypair,
    state: Mutex<ConnectionState>,
}

#[derive(Default)]
struct ConnectionState {
    command_tx: Option<mpsc::UnboundedSender<Command>>,
    worker: Option<JoinHandle<()>>,
    subscriber: Option<std_mpsc::Sender<Particle>>,
}

impl RelayConnection {
    pub fn new(keypair: &KeyPair, config: RelayConnectionConfig) -> Result<Self, PeerError> {
        let relay_peer = peer_id_of(&config.relay_address).ok_or_else(|| PeerError::Connection {
            reason: format!(
                "relay address must include a /p2p/ component: {}",
                config.relay_address
            ),
        })?;
        Ok(Self {
            relay_peer,
            config,
            keypair: keypair.to_libp2p()?,
            state: Mutex::new(ConnectionState::default()),
        })
    }
}

impl ParticleTransport for RelayConnection {
    fn start(&self) -> Result<(), PeerError> {
        let established_rx;
        {
            let mut state = lock_unpoisoned(&self.state);
            if state.command_tx.is_some() {
                return Err(PeerError::AlreadyStarted {
                    component: "relay connection".to_string(),
                });
            }
            let (command_tx, command_rx) = mpsc::unbounded();
            let (established_tx, rx) = std_mpsc::channel();
            established_rx = rx;
            let keypair = self.keypair.clone();
            let relay_peer = self.relay_peer;
            let relay_address = self.config.relay_address.clone();
            let subscriber = state.subscriber.clone();
            let worker = thread::Builder::new()
                .name("relay-connection".to_string())
                .spawn(move || {
                    run_swarm_loop(
                        keypair,
                        relay_peer,
                        relay_address,
                        command_rx,
                        established_tx,
                        subscriber,
                    );
                })
                .map_err(|err| PeerError::Connection {
                    reason: format!("spawn relay connection thread failed: {}", err),
                })?;
            state.command_tx = Some(command_tx);
            state.worker = Some(worker);
        }
        if !self.config.skip_connection_check
            && established_rx
                .recv_timeout(self.config.check_connection_timeout)
                .is_err()
        {
            let mut state = lock_unpoisoned(&self.state);
            if let Some(command_tx) = state.command_tx.take() {
                let _ = command_tx.unbounded_send(Command::Shutdown);
            }
            if let Some(worker) = state.worker.take() {
                let _ = worker.join();
            }
            return Err(PeerError::Connection {
                reason: format!(
                    "relay {} unreachable within {:?}",
                    self.relay_peer, self.config.check_connection_timeout
                ),
            });
        }
        Ok(())
    }

    fn stop(&self) -> Result<(), PeerError> {
        let mut state = lock_unpoisoned(&self.state);
        let Some(command_tx) = state.command_tx.take() else {
            return Err(PeerError::NotInitialized {
                operation: "stop relay connection".to_string(),
            });
        };
        let _ = command_tx.unbounded_send(Command::Shutdown);
        if let Some(worker) = state.worker.take() {
            let _ = worker.join();
        }
        state.subscriber = None;
        Ok(())
    }

    fn relay_peer_id(&self) -> Option<PeerId> {
        Some(self.relay_peer)
    }

    fn send_particle(&self, next_peers: &[String], particle: &Particle) -> Result<(), PeerError> {
        check_route(next_peers, &self.relay_peer)?;
        let payload = encode_particle(particle)?;
        let command_tx = {
            let state = lock_unpoisoned(&self.state);
            state.command_tx.clone()
        }
        .ok_or_else(|| PeerError::NotInitialized {
            operation: "send particle".to_string(),
        })?;
        let (result_tx, result_rx) = std_mpsc::channel();
        command_tx
            .unbounded_send(Command::SendParticle { payload, result_tx })
            .map_err(|_| PeerError::Send {
                particle_id: particle.id.clone(),
                reason: "relay connection closed".to_string(),
            })?;
        match result_rx.recv_timeout(self.config.dial_timeout) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(PeerError::Send {
                particle_id: particle.id.clone(),
                reason,
            }),
            Err(_) => Err(PeerError::Send {
                particle_id: particle.id.clone(),
                reason: format!("relay send timed out after {:?}", self.config.dial_timeout),
            }),
        }
    }

    fn subscribe(&self, sink: std_mpsc::Sender<Particle>) {
        let mut state = lock_unpoisoned(&self.state);
        state.subscriber = Some(sink);
    }
}

impl Drop for RelayConnection {
    fn drop(&mut self) {
        let mut state = lock_unpoisoned(&self.state);
        if let Some(command_tx) = state.command_tx.take() {
            let _ = command_tx.unbounded_send(Command::Shutdown);
        }
        if let Some(worker) = state.worker.take() {
            let _ = worker.join();
        }
    }
}

fn run_swarm_loop(
    keypair: identity::Keypair,
    relay_peer: PeerId,
    relay_address: Multiaddr,
    command_rx: mpsc::UnboundedReceiver<Command>,
    established_tx: std_mpsc::Sender<()>,
    subscriber: Option<std_mpsc::Sender<Particle>>,
) {
    let mut swarm = match build_swarm(&keypair) {
        Ok(swarm) => swarm,
        Err(reason) => {
            tracing::warn!("relay connection failed to build swarm: {reason}");
            return;
        }
    };
    swarm.add_peer_address(relay_peer, strip_peer_component(&relay_address));
    if let Err(err) = swarm.dial(relay_address) {
        tracing::warn!("relay dial failed: {err}");
    }

    let mut pending: HashMap<OutboundRequestId, std_mpsc::Sender<Result<(), String>>> =
        HashMap::new();
    let mut announced = false;

    async_std::task::block_on(async move {
        let mut command_rx = command_rx;
        loop {
            futures::select! {
                command = command_rx.next().fuse() => match command {
                    Some(Command::SendParticle { payload, result_tx }) => {
                        let request_id = swarm.behaviour_mut().send_request(&relay_peer, payload);
                        pending.insert(request_id, result_tx);
                    }
                    Some(Command::Shutdown) | None => break,
                },
                event = swarm.select_next_some().fuse() => match event {
                    SwarmEvent::ConnectionEstablished { peer_id, .. } if peer_id == relay_peer => {
                        if !announced {
                            announced = true;
                            let _ = established_tx.send(());
                        }
                    }
                    SwarmEvent::Behaviour(request_response::Event::Message { message, .. }) => {
                        match message {
                            request_response::Message::Request { request, channel, .. } => {
                                match decode_particle(&request) {
                                    Ok(particle) => {
                                        if let Some(sink) = &subscriber {
                                            let _ = sink.send(particle);
                                        }
                                    }
                                    Err(err) => {
                                        tracing::warn!("dropping malformed incoming particle: {err}");
                                    }
                                }
                                let _ = swarm.behaviour_mut().send_response(channel, ());
                            }
                            request_response::Message::Response { request_id, .. } => {
                                if let Some(result_tx) = pending.remove(&request_id) {
                                    let _ = result_tx.send(Ok(()));
                                }
                            }
                        }
                    }
                    SwarmEvent::Behaviour(request_response::Event::OutboundFailure {
                        request_id,
                        error,
                        ..
                    }) => {
                        if let Some(result_tx) = pending.remove(&request_id) {
                            let _ = result_tx.send(Err(error.to_string()));
                        }
                    }
                    _ => {}
                },
            }
        }
    });
}

fn build_swarm(
    keypair: &identity::Keypair,
) -> Result<Swarm<request_response::Behaviour<ParticleCodec>>, String> {
    let swarm_config = libp2p::swarm::Config::with_async_std_executor()
        .with_idle_connection_timeout(Duration::from_secs(30));
    let peer_id = PeerId::from(keypair.public());
    let behaviour = request_response::Behaviour::with_codec(
        ParticleCodec,
        [(
            StreamProtocol::new(PARTICLE_PROTOCOL),
            ProtocolSupport::Full,
        )],
        request_response::Config::default(),
    );
    let transport = libp2p::tcp::async_io::Transport::new(libp2p::tcp::Config::default())
        .upgrade(libp2p::core::upgrade::Version::V1)
        .authenticate(noise::Config::new(keypair).map_err(|err| format!("noise config: {err}"))?)
        .multiplex(libp2p::yamux::Config::default())
        .boxed();
    Ok(Swarm::new(transport, behaviour, peer_id, swarm_config))
}

/// Frames are u32-big-endian length prefixed UTF-8 JSON envelopes. The
/// response side of the exchange is an empty delivery ack.
#[derive(Debug, Clone, Default)]
struct ParticleCodec;

#[async_trait]
impl request_response::Codec for ParticleCodec {
    type Protocol = StreamProtocol;
    type Request = Vec<u8>;
    type Response = ();

    async fn read_request<T>(
        &mut self,
        _protocol: &StreamProtocol,
        io: &mut T,
    ) -> io::Result<Self::Request>
    where
        T: AsyncRead + Unpin + Send,
    {
        let mut length_bytes = [0u8; 4];
        io.read_exact(&mut length_bytes).await?;
        let length = u32::from_be_bytes(length_bytes);
        if length > MAX_FRAME_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "particle frame too large",
            ));
        }
        let mut payload = vec![0u8; length as usize];
        io.read_exact(&mut payload).await?;
        Ok(payload)
    }

    async fn read_response<T>(
        &mut self,
        _protocol: &StreamProtocol,
        _io: &mut T,
    ) -> io::Result<Self::Response>
    where
        T: AsyncRead + Unpin + Send,
    {
        Ok(())
    }

    async fn write_request<T>(
        &mut self,
        _protocol: &StreamProtocol,
        io: &mut T,
        request: Self::Request,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        let length = u32::try_from(request.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "particle frame too large"))?;
        if length > MAX_FRAME_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "particle frame too large",
            ));
        }
        io.write_all(&length.to_be_bytes()).await?;
        io.write_all(&request).await
    }

    async fn write_response<T>(
        &mut self,
        _protocol: &StreamProtocol,
        _io: &mut T,
        _response: Self::Response,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        Ok(())
    }
}
