use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde_json::Value as JsonValue;

use crate::avm::{
    AvmInvocation, CallServiceData, CallServiceResult, InterpreterResult, RunParameters,
    AVM_SERVICE_ID, KEY_FORMAT_ED25519,
};
use crate::call_function::{CALLBACK_SERVICE_ID, RESPONSE_FUNCTION};
use crate::connection::ParticleTransport;
use crate::error::PeerError;
use crate::keypair::KeyPair;
use crate::marine::MarineHost;
use crate::particle::Particle;
use crate::runtime_util::{lock_unpoisoned, now_unix_ms};
use crate::services::ServiceRegistry;

type CompletionFn = Box<dyn FnOnce(Result<JsonValue, PeerError>) + Send>;

/// At-most-once completion cell shared between the engine, the per-call
/// reserved services and the awaiter. The first `succeed`/`fail` wins;
/// later settlements are no-ops.
#[derive(Clone)]
pub struct CompletionHandle {
    slot: Arc<Mutex<Option<CompletionFn>>>,
}

impl fmt::Debug for CompletionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("settled", &self.is_settled())
            .finish()
    }
}

impl CompletionHandle {
    pub fn new(callback: impl FnOnce(Result<JsonValue, PeerError>) + Send + 'static) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(Box::new(callback)))),
        }
    }

    pub fn noop() -> Self {
        Self::new(|_outcome| {})
    }

    pub fn succeed(&self, value: JsonValue) {
        self.settle(Ok(value));
    }

    pub fn fail(&self, error: PeerError) {
        self.settle(Err(error));
    }

    pub fn is_settled(&self) -> bool {
        lock_unpoisoned(&self.slot).is_none()
    }

    fn settle(&self, outcome: Result<JsonValue, PeerError>) {
        let callback = lock_unpoisoned(&self.slot).take();
        if let Some(callback) = callback {
            callback(outcome);
        }
    }
}

/// One unit of pipeline work: a particle plus the call results to merge
/// into its next interpreter invocation.
pub struct ParticleQueueItem {
    pub particle: Particle,
    pub call_results: Vec<(u32, CallServiceResult)>,
    pub completion: CompletionHandle,
    /// Set for locally initiated void particles: the engine resolves the
    /// completion with null once the interpreter reports no further work.
    pub auto_resolve: bool,
}

enum EngineCommand {
    Item(ParticleQueueItem),
    RemoveGroup { signature: Vec<u8> },
    // Workers and call-request threads hold queue senders, so the channel
    // never closes by itself; shutdown is an explicit command.
    Shutdown,
}

/// The particle pipeline. Items are routed by particle signature to group
/// workers; each worker owns its group's `prev_data` and invokes the
/// interpreter strictly serially, so one lineage never observes concurrent
/// state. Distinct groups run in parallel.
pub struct ParticleEngine {
    context: WorkerSeed,
    running: Arc<AtomicBool>,
    print_particle_id: bool,
    state: Mutex<EngineState>,
}

#[derive(Default)]
struct EngineState {
    queue_tx: Option<mpsc::Sender<EngineCommand>>,
    dispatcher: Option<JoinHandle<()>>,
    inbox_bridge: Option<JoinHandle<()>>,
}

/// Everything a worker needs, minus the queue sender created at start.
#[derive(Clone)]
struct WorkerSeed {
    marine: Arc<MarineHost>,
    services: Arc<ServiceRegistry>,
    transport: Arc<dyn ParticleTransport>,
    current_peer_id: String,
    secret_key: [u8; 32],
}

#[derive(Clone)]
struct WorkerContext {
    seed: WorkerSeed,
    running: Arc<AtomicBool>,
    queue_tx: mpsc::Sender<EngineCommand>,
}

impl fmt::Debug for ParticleEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParticleEngine")
            .field("peer_id", &self.context.current_peer_id)
            .field("running", &self.is_running())
            .finish()
    }
}

impl ParticleEngine {
    pub fn new(
        marine: Arc<MarineHost>,
        services: Arc<ServiceRegistry>,
        transport: Arc<dyn ParticleTransport>,
        keypair: &KeyPair,
        print_particle_id: bool,
    ) -> Self {
        Self {
            context: WorkerSeed {
                marine,
                services,
                transport,
                current_peer_id: keypair.peer_id().to_string(),
                secret_key: keypair.seed(),
            },
            running: Arc::new(AtomicBool::new(false)),
            print_particle_id,
            state: Mutex::new(EngineState::default()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn start(&self) -> Result<(), PeerError> {
        let mut state = lock_unpoisoned(&self.state);
        if state.queue_tx.is_some() {
            return Err(PeerError::AlreadyStarted {
                component: "particle engine".to_string(),
            });
        }

        self.context.marine.start()?;
        if !self.context.marine.has_service(AVM_SERVICE_ID) {
            let _ = self.context.marine.stop();
            return Err(PeerError::Marine {
                reason: format!("interpreter service {:?} is not registered", AVM_SERVICE_ID),
            });
        }

        let (incoming_tx, incoming_rx) = mpsc::channel::<Particle>();
        self.context.transport.subscribe(incoming_tx);
        if let Err(err) = self.context.transport.start() {
            let _ = self.context.marine.stop();
            return Err(err);
        }

        let (queue_tx, queue_rx) = mpsc::channel::<EngineCommand>();
        let context = WorkerContext {
            seed: self.context.clone(),
            running: Arc::clone(&self.running),
            queue_tx: queue_tx.clone(),
        };
        let dispatcher = match thread::Builder::new()
            .name("particle-dispatcher".to_string())
            .spawn(move || run_dispatcher(context, queue_rx))
        {
            Ok(dispatcher) => dispatcher,
            Err(err) => {
                let _ = self.context.transport.stop();
                let _ = self.context.marine.stop();
                return Err(PeerError::Connection {
                    reason: format!("spawn particle dispatcher failed: {}", err),
                });
            }
        };

        let bridge_tx = queue_tx.clone();
        let inbox_bridge = match thread::Builder::new()
            .name("particle-inbox".to_string())
            .spawn(move || {
                for particle in incoming_rx {
                    let item = ParticleQueueItem {
                        particle,
                        call_results: Vec::new(),
                        completion: CompletionHandle::noop(),
                        auto_resolve: false,
                    };
                    if bridge_tx.send(EngineCommand::Item(item)).is_err() {
                        break;
                    }
                }
            }) {
            Ok(bridge) => bridge,
            Err(err) => {
                let _ = queue_tx.send(EngineCommand::Shutdown);
                let _ = dispatcher.join();
                let _ = self.context.transport.stop();
                let _ = self.context.marine.stop();
                return Err(PeerError::Connection {
                    reason: format!("spawn particle inbox bridge failed: {}", err),
                });
            }
        };

        state.queue_tx = Some(queue_tx);
        state.dispatcher = Some(dispatcher);
        state.inbox_bridge = Some(inbox_bridge);
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn stop(&self) -> Result<(), PeerError> {
        let mut state = lock_unpoisoned(&self.state);
        let Some(queue_tx) = state.queue_tx.take() else {
            return Err(PeerError::NotInitialized {
                operation: "stop particle engine".to_string(),
            });
        };
        self.running.store(false, Ordering::SeqCst);
        let _ = queue_tx.send(EngineCommand::Shutdown);
        drop(queue_tx);
        if let Some(dispatcher) = state.dispatcher.take() {
            let _ = dispatcher.join();
        }
        self.context.transport.stop()?;
        if let Some(bridge) = state.inbox_bridge.take() {
            let _ = bridge.join();
        }
        self.context.marine.stop()?;
        Ok(())
    }

    /// Enqueues a locally initiated particle. Exactly one settlement of
    /// `completion` fires: a result, an interpreter/send error, or
    /// expiration once the TTL watchdog triggers.
    pub fn initiate_particle(
        &self,
        particle: Particle,
        completion: CompletionHandle,
        fire_and_forget: bool,
    ) -> Result<(), PeerError> {
        if !self.is_running() {
            return Err(PeerError::NotInitialized {
                operation: "initiate particle".to_string(),
            });
        }
        if self.print_particle_id {
            tracing::info!("initiating particle {}", particle.id);
        }
        let queue_tx = {
            let state = lock_unpoisoned(&self.state);
            state.queue_tx.clone()
        }
        .ok_or_else(|| PeerError::NotInitialized {
            operation: "initiate particle".to_string(),
        })?;
        queue_tx
            .send(EngineCommand::Item(ParticleQueueItem {
                particle,
                call_results: Vec::new(),
                completion,
                auto_resolve: fire_and_forget,
            }))
            .map_err(|_| PeerError::NotInitialized {
                operation: "initiate particle".to_string(),
            })
    }
}

impl Drop for ParticleEngine {
    fn drop(&mut self) {
        if !self.is_running() {
            return;
        }
        let _ = self.stop();
    }
}

struct GroupHandle {
    tx: mpsc::Sender<ParticleQueueItem>,
    worker: JoinHandle<()>,
}

fn run_dispatcher(context: WorkerContext, queue_rx: mpsc::Receiver<EngineCommand>) {
    let mut groups: HashMap<Vec<u8>, GroupHandle> = HashMap::new();
    let mut retired: Vec<JoinHandle<()>> = Vec::new();

    for command in queue_rx {
        match command {
            EngineCommand::Item(item) => {
                trace_item(&item);
                let signature = item.particle.signature.clone();
                let group = groups.entry(signature).or_insert_with(|| {
                    let (tx, rx) = mpsc::channel();
                    let context = context.clone();
                    let worker = thread::spawn(move || run_group_worker(context, rx));
                    GroupHandle { tx, worker }
                });
                if group.tx.send(item).is_err() {
                    tracing::warn!("signature group worker is gone, dropping item");
                }
            }
            EngineCommand::RemoveGroup { signature } => {
                if let Some(group) = groups.remove(&signature) {
                    drop(group.tx);
                    retired.push(group.worker);
                }
            }
            EngineCommand::Shutdown => break,
        }
    }

    for (_, group) in groups {
        drop(group.tx);
        retired.push(group.worker);
    }
    for worker in retired {
        let _ = worker.join();
    }
}

fn trace_item(item: &ParticleQueueItem) {
    let snippet: String = item.particle.script.chars().take(64).collect();
    tracing::debug!(
        "queue item: particle {} ts={} ttl={} results={} script={:?}",
        item.particle.id,
        item.particle.timestamp,
        item.particle.ttl,
        item.call_results.len(),
        snippet
    );
}

/// One-shot watchdog: fires the expiration path unless stopped first.
struct TtlWatchdog {
    stop_tx: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl TtlWatchdog {
    fn arm(ttl: Duration, on_expire: impl FnOnce() + Send + 'static) -> Self {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let thread = thread::spawn(move || {
            if stop_rx.recv_timeout(ttl) == Err(mpsc::RecvTimeoutError::Timeout) {
                on_expire();
            }
        });
        Self {
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        }
    }
}

impl Drop for TtlWatchdog {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn run_group_worker(context: WorkerContext, rx: mpsc::Receiver<ParticleQueueItem>) {
    let mut prev_data: Vec<u8> = Vec::new();
    let mut watchdog: Option<TtlWatchdog> = None;

    for item in rx {
        if !context.running.load(Ordering::SeqCst) {
            continue;
        }
        if watchdog.is_none() {
            watchdog = Some(arm_group_watchdog(&context, &item));
        }
        if item.particle.has_expired(now_unix_ms()) {
            expire_item(&context, &item);
            continue;
        }

        let invocation = AvmInvocation {
            script: item.particle.script.clone(),
            parameters: RunParameters {
                init_peer_id: item.particle.init_peer_id.clone(),
                current_peer_id: context.seed.current_peer_id.clone(),
                timestamp: item.particle.timestamp,
                ttl: item.particle.ttl,
                key_format: KEY_FORMAT_ED25519,
                particle_id: item.particle.id.clone(),
                secret_key_bytes: context.seed.secret_key.to_vec(),
            },
            prev_data: prev_data.clone(),
            data: item.particle.data.clone(),
            call_results: item.call_results.clone(),
        };

        let result = match context.seed.marine.invoke_avm(&invocation) {
            Ok(result) => result,
            Err(err) => {
                item.completion.fail(PeerError::Interpreter {
                    particle_id: item.particle.id.clone(),
                    message: err.to_string(),
                });
                context.seed.services.remove_particle_handlers(&item.particle.id);
                continue;
            }
        };

        // prev_data progression is an interpreter-internal invariant: it
        // advances on every successful invocation even if the particle
        // turns out to be expired below.
        if result.ret_code == 0 {
            prev_data = result.data.clone();
        }
        if item.particle.has_expired(now_unix_ms()) {
            expire_item(&context, &item);
            continue;
        }

        dispatch_interpreter_result(&context, &item, result);
    }
}

fn arm_group_watchdog(context: &WorkerContext, item: &ParticleQueueItem) -> TtlWatchdog {
    let ttl = Duration::from_millis(u64::from(item.particle.remaining_ttl(now_unix_ms())));
    let services = Arc::clone(&context.seed.services);
    let queue_tx = context.queue_tx.clone();
    let completion = item.completion.clone();
    let particle_id = item.particle.id.clone();
    let signature = item.particle.signature.clone();
    TtlWatchdog::arm(ttl, move || {
        completion.fail(PeerError::Expired {
            particle_id: particle_id.clone(),
        });
        services.remove_particle_handlers(&particle_id);
        let _ = queue_tx.send(EngineCommand::RemoveGroup { signature });
    })
}

fn expire_item(context: &WorkerContext, item: &ParticleQueueItem) {
    tracing::debug!("particle {} expired in the pipeline", item.particle.id);
    item.completion.fail(PeerError::Expired {
        particle_id: item.particle.id.clone(),
    });
    context.seed.services.remove_particle_handlers(&item.particle.id);
}

fn dispatch_interpreter_result(
    context: &WorkerContext,
    item: &ParticleQueueItem,
    result: InterpreterResult,
) {
    if result.ret_code != 0 {
        item.completion.fail(PeerError::Interpreter {
            particle_id: item.particle.id.clone(),
            message: result.error_message,
        });
        context.seed.services.remove_particle_handlers(&item.particle.id);
        return;
    }

    if !result.next_peer_pks.is_empty() {
        let forwarded = item.particle.clone_with_data(result.data.clone());
        match context
            .seed
            .transport
            .send_particle(&result.next_peer_pks, &forwarded)
        {
            Ok(()) => {
                tracing::debug!(
                    "particle {} forwarded to {:?}",
                    item.particle.id,
                    result.next_peer_pks
                );
            }
            Err(err) => {
                item.completion.fail(err);
                context.seed.services.remove_particle_handlers(&item.particle.id);
                return;
            }
        }
    }

    if result.call_requests.is_empty() {
        if item.auto_resolve {
            item.completion.succeed(JsonValue::Null);
            context.seed.services.remove_particle_handlers(&item.particle.id);
        }
        return;
    }

    // Call requests fan out without a join: every result re-enters the
    // queue as its own item and the interpreter merges them in arrival
    // order.
    for (key, request) in result.call_requests {
        let context = context.clone();
        let particle = item.particle.clone();
        let completion = item.completion.clone();
        let auto_resolve = item.auto_resolve;
        thread::spawn(move || {
            let data = CallServiceData::from_request(&request, &particle);
            let call_result = exec_single_call_request(&context, &data);
            if request.service_id == CALLBACK_SERVICE_ID
                && request.function_name == RESPONSE_FUNCTION
            {
                // Terminal: the response handler has already delivered the
                // result to the awaiter.
                context.seed.services.remove_particle_handlers(&particle.id);
                return;
            }
            let item = ParticleQueueItem {
                particle: particle.clone_with_data(Vec::new()),
                call_results: vec![(key, call_result)],
                completion,
                auto_resolve,
            };
            let _ = context.queue_tx.send(EngineCommand::Item(item));
        });
    }
}

fn exec_single_call_request(context: &WorkerContext, request: &CallServiceData) -> CallServiceResult {
    if context.seed.marine.has_service(&request.service_id) {
        return match context.seed.marine.call_service(
            &request.service_id,
            &request.function_name,
            &request.arguments,
        ) {
            Ok(value) => CallServiceResult::ok(value),
            Err(err) => CallServiceResult::failure(format!(
                "Service call failed. fnName={} serviceId={} error: {}",
                request.function_name, request.service_id, err
            )),
        };
    }
    match context.seed.services.call_service(request) {
        Some(result) => result,
        None => CallServiceResult::failure(format!(
            "No service found for serviceId='{}', fnName='{}' args='{}'",
            request.service_id,
            request.function_name,
            JsonValue::Array(request.arguments.clone())
        )),
    }
}
