use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::FutureExt;
use snafu::{ResultExt, Snafu};
use tokio::sync::{mpsc, oneshot};

use crate::engine::EngineFactory;
use crate::error::EngineError;
use crate::message::PromptMessage;
use crate::model::ModelConfig;
use crate::slot::{EngineSlot, OperationOutcome, ProgressUpdate};

pub type CallId = u64;
pub type BridgeResult<T> = Result<T, BridgeError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum BridgeError {
    #[snafu(display("engine worker is unavailable"))]
    Unavailable { stage: &'static str },
    #[snafu(display("{message}"))]
    Rejected {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("engine worker answered call {call_id} with an unexpected reply"))]
    UnexpectedReply { stage: &'static str, call_id: CallId },
    #[snafu(display("failed to spawn engine worker thread"))]
    WorkerSpawn {
        stage: &'static str,
        source: std::io::Error,
    },
}

/// Requests crossing into the worker context.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerRequest {
    Init {
        call_id: CallId,
        config: ModelConfig,
    },
    Unload {
        call_id: CallId,
    },
    Completion {
        call_id: CallId,
        messages: Vec<PromptMessage>,
        rag_result: Vec<String>,
    },
    /// Aborts the in-flight completion registered under `call_id`.
    Cancel {
        call_id: CallId,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallReply {
    Outcome(OperationOutcome),
    Completion(String),
}

/// Tagged events flowing back to the host for one call.
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    Progress(ProgressUpdate),
    Token { step: usize, text: String },
    Resolved(CallReply),
    Rejected(String),
}

impl CallEvent {
    fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved(_) | Self::Rejected(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerEnvelope {
    pub call_id: CallId,
    pub event: CallEvent,
}

/// Both ends of a worker as seen from the host.
pub struct WorkerChannel {
    pub requests: mpsc::UnboundedSender<WorkerRequest>,
    pub events: mpsc::UnboundedReceiver<WorkerEnvelope>,
}

/// The isolated execution context: a dedicated thread with its own runtime that owns
/// the [`EngineSlot`]. Nothing but channel messages crosses its boundary.
pub struct EngineWorker;

impl EngineWorker {
    pub fn spawn(factory: Arc<dyn EngineFactory>) -> BridgeResult<WorkerChannel> {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        std::thread::Builder::new()
            .name("hearth-engine-worker".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(error) => {
                        tracing::error!(error = %error, "failed to build engine worker runtime");
                        return;
                    }
                };
                let slot = Arc::new(EngineSlot::new(factory));
                runtime.block_on(serve(slot, request_rx, event_tx));
                tracing::debug!("engine worker stopped");
            })
            .context(WorkerSpawnSnafu {
                stage: "spawn-engine-worker",
            })?;

        Ok(WorkerChannel {
            requests: request_tx,
            events: event_rx,
        })
    }
}

type Cancellations = Arc<Mutex<HashMap<CallId, oneshot::Sender<()>>>>;

/// Worker loop. Each request runs as its own task so that lifecycle rejections
/// (init while loading, generate while busy) answer immediately instead of queuing.
pub async fn serve(
    slot: Arc<EngineSlot>,
    mut requests: mpsc::UnboundedReceiver<WorkerRequest>,
    events: mpsc::UnboundedSender<WorkerEnvelope>,
) {
    let cancellations: Cancellations = Arc::new(Mutex::new(HashMap::new()));

    while let Some(request) = requests.recv().await {
        match request {
            WorkerRequest::Init { call_id, config } => {
                let slot = slot.clone();
                let events = events.clone();
                tokio::spawn(async move {
                    let progress_events = events.clone();
                    let init = async move {
                        let outcome = slot
                            .init(config, move |update| {
                                let _ = progress_events.send(WorkerEnvelope {
                                    call_id,
                                    event: CallEvent::Progress(update),
                                });
                            })
                            .await;
                        CallEvent::Resolved(CallReply::Outcome(outcome))
                    };
                    settle(call_id, "init", &events, init).await;
                });
            }
            WorkerRequest::Unload { call_id } => {
                let slot = slot.clone();
                let events = events.clone();
                tokio::spawn(async move {
                    let unload = async move {
                        CallEvent::Resolved(CallReply::Outcome(slot.unload().await))
                    };
                    settle(call_id, "unload", &events, unload).await;
                });
            }
            WorkerRequest::Completion {
                call_id,
                messages,
                rag_result,
            } => {
                let (cancel_tx, cancel_rx) = oneshot::channel();
                lock_cancellations(&cancellations).insert(call_id, cancel_tx);
                let slot = slot.clone();
                let events = events.clone();
                let cancellations = cancellations.clone();
                tokio::spawn(async move {
                    let completion =
                        run_completion(slot, call_id, messages, rag_result, events.clone(), cancel_rx);
                    settle(call_id, "completion", &events, completion).await;
                    lock_cancellations(&cancellations).remove(&call_id);
                });
            }
            WorkerRequest::Cancel { call_id } => {
                if let Some(cancel_tx) = lock_cancellations(&cancellations).remove(&call_id) {
                    let _ = cancel_tx.send(());
                }
            }
        }
    }
}

async fn run_completion(
    slot: Arc<EngineSlot>,
    call_id: CallId,
    messages: Vec<PromptMessage>,
    rag_result: Vec<String>,
    events: mpsc::UnboundedSender<WorkerEnvelope>,
    cancel_rx: oneshot::Receiver<()>,
) -> CallEvent {
    let generation = slot.completion(
        messages,
        rag_result,
        Box::new(move |step, text| {
            let _ = events.send(WorkerEnvelope {
                call_id,
                event: CallEvent::Token {
                    step,
                    text: text.to_string(),
                },
            });
        }),
    );

    tokio::select! {
        result = generation => match result {
            Ok(reply) => CallEvent::Resolved(CallReply::Completion(reply)),
            Err(error) => {
                tracing::warn!(call_id, error = %error, "completion failed");
                CallEvent::Rejected(error.to_string())
            }
        },
        _ = cancel_rx => {
            tracing::debug!(call_id, "completion cancelled");
            CallEvent::Rejected(EngineError::Cancelled { stage: "completion-cancel" }.to_string())
        }
    }
}

/// Runs one call to its terminal event and sends it. An engine panic becomes a rejection.
async fn settle<F>(
    call_id: CallId,
    operation: &'static str,
    events: &mpsc::UnboundedSender<WorkerEnvelope>,
    work: F,
) where
    F: Future<Output = CallEvent>,
{
    let event = match AssertUnwindSafe(work).catch_unwind().await {
        Ok(event) => event,
        Err(payload) => {
            let detail = panic_detail(payload.as_ref());
            tracing::error!(call_id, operation, detail = %detail, "engine panicked");
            CallEvent::Rejected(
                EngineError::Panicked {
                    stage: operation,
                    detail,
                }
                .to_string(),
            )
        }
    };
    let _ = events.send(WorkerEnvelope { call_id, event });
}

fn panic_detail(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn lock_cancellations(
    cancellations: &Cancellations,
) -> MutexGuard<'_, HashMap<CallId, oneshot::Sender<()>>> {
    match cancellations.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Default)]
struct RegistryInner {
    calls: HashMap<CallId, mpsc::UnboundedSender<CallEvent>>,
    closed: bool,
}

/// Host-side table of in-flight calls keyed by call id.
#[derive(Default)]
pub struct CallbackRegistry {
    next_call_id: AtomicU64,
    inner: Mutex<RegistryInner>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self) -> BridgeResult<(CallId, mpsc::UnboundedReceiver<CallEvent>)> {
        let mut inner = self.lock();
        if inner.closed {
            return UnavailableSnafu {
                stage: "registry-register",
            }
            .fail();
        }

        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        inner.calls.insert(call_id, event_tx);
        Ok((call_id, event_rx))
    }

    pub fn route(&self, envelope: WorkerEnvelope) {
        let mut inner = self.lock();
        let terminal = envelope.event.is_terminal();
        let delivered = match inner.calls.get(&envelope.call_id) {
            Some(event_tx) => event_tx.send(envelope.event).is_ok(),
            None => false,
        };

        if terminal || !delivered {
            inner.calls.remove(&envelope.call_id);
        }
    }

    pub fn forget(&self, call_id: CallId) {
        self.lock().calls.remove(&call_id);
    }

    /// Drops every pending call; their streams observe the worker as unavailable.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.calls.clear();
    }

    pub fn pending_calls(&self) -> usize {
        self.lock().calls.len()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

struct Connection {
    requests: mpsc::UnboundedSender<WorkerRequest>,
    registry: Arc<CallbackRegistry>,
}

impl Connection {
    fn establish(channel: WorkerChannel) -> BridgeResult<Self> {
        let WorkerChannel {
            requests,
            mut events,
        } = channel;
        let registry = Arc::new(CallbackRegistry::new());
        let router_registry = registry.clone();

        std::thread::Builder::new()
            .name("hearth-bridge-router".to_string())
            .spawn(move || {
                while let Some(envelope) = events.blocking_recv() {
                    router_registry.route(envelope);
                }
                tracing::warn!("engine worker channel closed; rejecting pending calls");
                router_registry.close();
            })
            .context(WorkerSpawnSnafu {
                stage: "spawn-bridge-router",
            })?;

        Ok(Self { requests, registry })
    }
}

enum Link {
    Pending(Arc<dyn EngineFactory>),
    Detached(Option<WorkerChannel>),
    Live(Arc<Connection>),
}

/// Host handle on the remote engine. Calls look local but each one is a request
/// message plus a subscription to the events tagged with its call id.
///
/// The worker channel is opened on the first call and kept for the handle's lifetime.
pub struct RemoteEngine {
    link: Mutex<Link>,
}

impl RemoteEngine {
    /// Defers spawning a worker for `factory` until the first call.
    pub fn wrap(factory: Arc<dyn EngineFactory>) -> Self {
        Self {
            link: Mutex::new(Link::Pending(factory)),
        }
    }

    /// Talks to an already running worker.
    pub fn from_channel(channel: WorkerChannel) -> Self {
        Self {
            link: Mutex::new(Link::Detached(Some(channel))),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(*self.lock_link(), Link::Live(_))
    }

    /// Detaches this handle and rejects its pending calls. The worker thread exits once
    /// every outstanding [`CallStream`] and [`CallCanceller`] has been dropped too.
    pub fn terminate(&self) {
        let mut link = self.lock_link();
        if let Link::Live(connection) = &*link {
            connection.registry.close();
        }
        *link = Link::Detached(None);
    }

    pub async fn init<F>(&self, config: ModelConfig, mut on_progress: F) -> BridgeResult<OperationOutcome>
    where
        F: FnMut(ProgressUpdate),
    {
        let mut stream = self.call(|call_id| WorkerRequest::Init { call_id, config })?;
        loop {
            match stream.next().await? {
                CallEvent::Progress(update) => on_progress(update),
                CallEvent::Resolved(CallReply::Outcome(outcome)) => return Ok(outcome),
                CallEvent::Rejected(message) => {
                    return RejectedSnafu {
                        stage: "init-rejected",
                        message,
                    }
                    .fail();
                }
                CallEvent::Token { .. } | CallEvent::Resolved(CallReply::Completion(_)) => {
                    return UnexpectedReplySnafu {
                        stage: "init-reply",
                        call_id: stream.call_id(),
                    }
                    .fail();
                }
            }
        }
    }

    pub async fn unload(&self) -> BridgeResult<OperationOutcome> {
        let mut stream = self.call(|call_id| WorkerRequest::Unload { call_id })?;
        match stream.next().await? {
            CallEvent::Resolved(CallReply::Outcome(outcome)) => Ok(outcome),
            CallEvent::Rejected(message) => RejectedSnafu {
                stage: "unload-rejected",
                message,
            }
            .fail(),
            _ => UnexpectedReplySnafu {
                stage: "unload-reply",
                call_id: stream.call_id(),
            }
            .fail(),
        }
    }

    /// Starts a completion and hands back its event subscription.
    pub fn start_completion(
        &self,
        messages: Vec<PromptMessage>,
        rag_result: Vec<String>,
    ) -> BridgeResult<CallStream> {
        self.call(|call_id| WorkerRequest::Completion {
            call_id,
            messages,
            rag_result,
        })
    }

    pub async fn completion<F>(
        &self,
        messages: Vec<PromptMessage>,
        rag_result: Vec<String>,
        mut on_token: F,
    ) -> BridgeResult<String>
    where
        F: FnMut(usize, &str),
    {
        let mut stream = self.start_completion(messages, rag_result)?;
        loop {
            match stream.next().await? {
                CallEvent::Token { step, text } => on_token(step, &text),
                CallEvent::Resolved(CallReply::Completion(reply)) => return Ok(reply),
                CallEvent::Rejected(message) => {
                    return RejectedSnafu {
                        stage: "completion-rejected",
                        message,
                    }
                    .fail();
                }
                CallEvent::Progress(_) | CallEvent::Resolved(CallReply::Outcome(_)) => {
                    return UnexpectedReplySnafu {
                        stage: "completion-reply",
                        call_id: stream.call_id(),
                    }
                    .fail();
                }
            }
        }
    }

    fn call(&self, build: impl FnOnce(CallId) -> WorkerRequest) -> BridgeResult<CallStream> {
        let connection = self.connection()?;
        let (call_id, events) = connection.registry.register()?;

        if connection.requests.send(build(call_id)).is_err() {
            connection.registry.forget(call_id);
            return UnavailableSnafu {
                stage: "send-request",
            }
            .fail();
        }

        Ok(CallStream {
            call_id,
            events,
            requests: connection.requests.clone(),
            registry: connection.registry.clone(),
            finished: false,
        })
    }

    fn connection(&self) -> BridgeResult<Arc<Connection>> {
        let mut link = self.lock_link();
        let channel = match &mut *link {
            Link::Live(connection) => return Ok(connection.clone()),
            Link::Pending(factory) => EngineWorker::spawn(factory.clone())?,
            Link::Detached(channel) => match channel.take() {
                Some(channel) => channel,
                None => {
                    return UnavailableSnafu {
                        stage: "connect-terminated",
                    }
                    .fail();
                }
            },
        };

        let connection = Arc::new(Connection::establish(channel)?);
        tracing::debug!("engine bridge connected");
        *link = Link::Live(connection.clone());
        Ok(connection)
    }

    fn lock_link(&self) -> MutexGuard<'_, Link> {
        match self.link.lock() {
            Ok(link) => link,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Ordered events of one call. Ends after the terminal event.
pub struct CallStream {
    call_id: CallId,
    events: mpsc::UnboundedReceiver<CallEvent>,
    requests: mpsc::UnboundedSender<WorkerRequest>,
    registry: Arc<CallbackRegistry>,
    finished: bool,
}

impl CallStream {
    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    /// Next event, or `Unavailable` when the worker went away before answering.
    pub async fn next(&mut self) -> BridgeResult<CallEvent> {
        if self.finished {
            return UnavailableSnafu {
                stage: "stream-finished",
            }
            .fail();
        }

        match self.events.recv().await {
            Some(event) => {
                self.finished = event.is_terminal();
                Ok(event)
            }
            None => {
                self.finished = true;
                UnavailableSnafu {
                    stage: "stream-disconnected",
                }
                .fail()
            }
        }
    }

    /// Asks the worker to abort this call. The stream still ends with a terminal event.
    pub fn cancel(&self) -> bool {
        !self.finished
            && self
                .requests
                .send(WorkerRequest::Cancel {
                    call_id: self.call_id,
                })
                .is_ok()
    }

    pub fn canceller(&self) -> CallCanceller {
        CallCanceller {
            call_id: self.call_id,
            requests: self.requests.clone(),
        }
    }
}

impl Drop for CallStream {
    fn drop(&mut self) {
        self.registry.forget(self.call_id);
    }
}

/// Detached cancel capability for a call whose stream is owned elsewhere.
#[derive(Debug, Clone)]
pub struct CallCanceller {
    call_id: CallId,
    requests: mpsc::UnboundedSender<WorkerRequest>,
}

impl CallCanceller {
    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    pub fn cancel(&self) -> bool {
        self.requests
            .send(WorkerRequest::Cancel {
                call_id: self.call_id,
            })
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use tokio::sync::Notify;

    use super::*;
    use crate::testing::{Script, ScriptedFactory};

    fn config() -> ModelConfig {
        ModelConfig::new("local-model", "https://weights.example/", "https://lib.example/k.wasm")
    }

    fn chat() -> Vec<PromptMessage> {
        vec![PromptMessage::system("S"), PromptMessage::user("Q")]
    }

    #[test]
    fn registry_drops_calls_after_terminal_event() {
        let registry = CallbackRegistry::new();
        let (call_id, mut events) = registry.register().expect("register");

        registry.route(WorkerEnvelope {
            call_id,
            event: CallEvent::Token {
                step: 0,
                text: "a".to_string(),
            },
        });
        assert_eq!(registry.pending_calls(), 1);

        registry.route(WorkerEnvelope {
            call_id,
            event: CallEvent::Resolved(CallReply::Completion("a".to_string())),
        });
        assert_eq!(registry.pending_calls(), 0);
        assert!(matches!(events.try_recv(), Ok(CallEvent::Token { step: 0, .. })));
        assert!(matches!(events.try_recv(), Ok(CallEvent::Resolved(_))));
    }

    #[test]
    fn closed_registry_refuses_new_calls() {
        let registry = CallbackRegistry::new();
        let (_, mut events) = registry.register().expect("register");

        registry.close();

        assert!(matches!(
            registry.register(),
            Err(BridgeError::Unavailable { .. })
        ));
        assert!(matches!(
            events.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn worker_is_spawned_on_first_call() {
        let factory = Arc::new(ScriptedFactory::new(Script {
            progress: vec![0.2, 0.2, 0.7, 1.0],
            ..Script::default()
        }));
        let remote = RemoteEngine::wrap(factory.clone());
        assert!(!remote.is_connected());

        let mut percents = Vec::new();
        let outcome = remote
            .init(config(), |update| percents.push(update.percent))
            .await
            .expect("bridge");

        assert!(remote.is_connected());
        assert!(outcome.success);
        assert_eq!(percents, vec![20, 70, 100]);
        assert_eq!(factory.created(), 1);
    }

    #[tokio::test]
    async fn completion_streams_tokens_in_order() {
        let factory = Arc::new(ScriptedFactory::new(Script {
            tokens: vec!["one", " two", " three"],
            ..Script::default()
        }));
        let remote = RemoteEngine::wrap(factory);
        assert!(remote.init(config(), |_| {}).await.expect("bridge").success);

        let mut steps = Vec::new();
        let reply = remote
            .completion(chat(), Vec::new(), |step, text| steps.push((step, text.to_string())))
            .await
            .expect("reply");

        assert_eq!(reply, "one two three");
        assert_eq!(
            steps,
            vec![
                (0, "one".to_string()),
                (1, "one two".to_string()),
                (2, "one two three".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn lifecycle_violations_come_back_as_rejections() {
        let remote = RemoteEngine::wrap(Arc::new(ScriptedFactory::new(Script::default())));

        let error = remote
            .completion(chat(), Vec::new(), |_, _| {})
            .await
            .unwrap_err();
        assert!(matches!(error, BridgeError::Rejected { .. }));
        assert_eq!(
            error.to_string(),
            "cannot generate while the engine is uninitialized"
        );

        let outcome = remote.unload().await.expect("bridge");
        assert!(!outcome.success);
    }

    #[tokio::test]
    async fn concurrent_init_over_the_bridge_builds_one_instance() {
        let gate = Arc::new(Notify::new());
        let factory = Arc::new(ScriptedFactory::new(Script {
            load_gate: Some(gate.clone()),
            ..Script::default()
        }));
        let remote = RemoteEngine::wrap(factory.clone());

        let first = remote.init(config(), |_| {});
        let second = async {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            let outcome = remote.init(config(), |_| {}).await;
            gate.notify_one();
            outcome
        };
        let (first, second) = tokio::join!(first, second);

        assert!(first.expect("bridge").success);
        assert!(!second.expect("bridge").success);
        assert_eq!(factory.created(), 1);
    }

    #[tokio::test]
    async fn cancel_aborts_generation() {
        let gate = Arc::new(Notify::new());
        let factory = Arc::new(ScriptedFactory::new(Script {
            tokens: vec!["never"],
            generate_gate: Some(gate),
            ..Script::default()
        }));
        let remote = RemoteEngine::wrap(factory);
        assert!(remote.init(config(), |_| {}).await.expect("bridge").success);

        let mut stream = remote.start_completion(chat(), Vec::new()).expect("start");
        assert!(stream.cancel());

        let event = stream.next().await.expect("terminal event");
        assert_eq!(
            event,
            CallEvent::Rejected("generation was cancelled".to_string())
        );

        // The engine is free again once the cancelled call released it.
        let next = remote.start_completion(chat(), Vec::new()).expect("start");
        assert!(next.cancel());
    }

    #[tokio::test]
    async fn terminated_worker_rejects_pending_and_new_calls() {
        let gate = Arc::new(Notify::new());
        let factory = Arc::new(ScriptedFactory::new(Script {
            load_gate: Some(gate),
            ..Script::default()
        }));
        let remote = Arc::new(RemoteEngine::wrap(factory));

        let pending = {
            let remote = remote.clone();
            tokio::spawn(async move { remote.init(config(), |_| {}).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        remote.terminate();

        let result = pending.await.expect("join");
        assert!(matches!(result, Err(BridgeError::Unavailable { .. })));
        assert!(matches!(
            remote.unload().await,
            Err(BridgeError::Unavailable { .. })
        ));
    }

    #[tokio::test]
    async fn dropped_worker_channel_rejects_calls() {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<WorkerEnvelope>();
        drop(request_rx);
        drop(event_tx);

        let remote = RemoteEngine::from_channel(WorkerChannel {
            requests: request_tx,
            events: event_rx,
        });
        let seen = StdMutex::new(0);
        let result = remote
            .init(config(), |_| *seen.lock().expect("seen") += 1)
            .await;

        assert!(matches!(result, Err(BridgeError::Unavailable { .. })));
        assert_eq!(*seen.lock().expect("seen"), 0);
    }

    #[tokio::test]
    async fn panicking_generation_is_rejected_and_frees_the_engine() {
        let factory = Arc::new(ScriptedFactory::new(Script {
            generate_panic: Some("kernel fault"),
            ..Script::default()
        }));
        let remote = RemoteEngine::wrap(factory);
        assert!(remote.init(config(), |_| {}).await.expect("bridge").success);

        for _ in 0..2 {
            let error = tokio::time::timeout(
                std::time::Duration::from_secs(3),
                remote.completion(chat(), Vec::new(), |_, _| {}),
            )
            .await
            .expect("completion settles")
            .unwrap_err();
            assert_eq!(
                error.to_string(),
                "engine panicked during completion: kernel fault"
            );
        }
    }

    #[tokio::test]
    async fn panicking_load_is_rejected_and_can_be_retried() {
        let factory = Arc::new(ScriptedFactory::new(Script {
            reload_panic: Some("bad weights"),
            ..Script::default()
        }));
        let remote = RemoteEngine::wrap(factory.clone());

        for _ in 0..2 {
            let error = tokio::time::timeout(
                std::time::Duration::from_secs(3),
                remote.init(config(), |_| {}),
            )
            .await
            .expect("init settles")
            .unwrap_err();
            assert!(matches!(error, BridgeError::Rejected { .. }));
            assert_eq!(error.to_string(), "engine panicked during init: bad weights");
        }
        assert_eq!(factory.created(), 2);
    }
}
