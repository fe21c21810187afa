//! Run lifecycle: launch or attach, source selection, observer fan-out.
//!
//! A single monitor task per run owns the [`Reconciler`] and whichever source
//! is active. Sources and the controller's own commands reach it through one
//! `mpsc` channel, so transcript and status are only ever mutated from that
//! task. Observers read the latest [`RunSnapshot`] from a `watch` channel or
//! register callbacks with [`RunController::on_snapshot_changed`].

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cancel::CancellationCoordinator;
use crate::client::RunApiClient;
use crate::config::{DEFAULT_POLL_INTERVAL_MS, MonitorConfig};
use crate::error::MonitorError;
use crate::poll::{PollFallback, PollHandle};
use crate::source::{ControlCommand, MonitorInput, SignalSink, SourceSignal};
use crate::status::{CoarseStatus, ConnectionState};
use crate::stream::{StreamConsumer, StreamHandle};
use crate::transcript::Reconciler;
use crate::transport::RunTransport;
use crate::types::{RunId, RunRequest, RunSnapshot};

const DEFAULT_CHANNEL_CAPACITY: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerOptions {
    pub poll_interval: Duration,
    pub channel_capacity: usize,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl ControllerOptions {
    pub fn from_config(config: &MonitorConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type SnapshotCallback = Arc<dyn Fn(&RunSnapshot) + Send + Sync>;

struct Shared {
    snapshot: watch::Sender<RunSnapshot>,
    subscribers: Mutex<Vec<(SubscriptionId, SnapshotCallback)>>,
    next_subscription: AtomicU64,
    disposed: AtomicBool,
}

impl Shared {
    fn new() -> Self {
        let (snapshot, _) = watch::channel(RunSnapshot::default());
        Self {
            snapshot,
            subscribers: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
            disposed: AtomicBool::new(false),
        }
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn current(&self) -> RunSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Stores `next` and notifies callbacks when it differs from the current
    /// snapshot. Nothing is published once the controller is disposed.
    fn publish(&self, next: RunSnapshot) {
        if self.is_disposed() || !self.store(&next) {
            return;
        }

        let callbacks: Vec<SnapshotCallback> = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in callbacks {
            if self.is_disposed() {
                break;
            }
            callback(&next);
        }
    }

    /// Last frame written during shutdown; watch receivers see it, callbacks
    /// do not.
    fn publish_final(&self, next: RunSnapshot) {
        self.store(&next);
    }

    fn store(&self, next: &RunSnapshot) -> bool {
        self.snapshot.send_if_modified(|current| {
            if current == next {
                return false;
            }
            *current = next.clone();
            true
        })
    }
}

struct MonitorHandle {
    inbox: mpsc::Sender<MonitorInput>,
    task: JoinHandle<()>,
}

/// Owns exactly one run from launch (or attach) until it closes.
pub struct RunController {
    transport: Arc<dyn RunTransport>,
    options: ControllerOptions,
    coordinator: CancellationCoordinator,
    shared: Arc<Shared>,
    monitor: tokio::sync::Mutex<Option<MonitorHandle>>,
}

impl RunController {
    pub fn new(transport: Arc<dyn RunTransport>, options: ControllerOptions) -> Self {
        Self {
            coordinator: CancellationCoordinator::new(Arc::clone(&transport)),
            transport,
            options,
            shared: Arc::new(Shared::new()),
            monitor: tokio::sync::Mutex::new(None),
        }
    }

    /// Builds a controller backed by the HTTP client.
    pub fn from_config(config: &MonitorConfig) -> Result<Self, MonitorError> {
        let client = RunApiClient::new(config)?;
        Ok(Self::new(
            Arc::new(client),
            ControllerOptions::from_config(config),
        ))
    }

    /// Starts a run and begins streaming its events.
    ///
    /// On failure the snapshot moves to `Failed` with the error text and the
    /// error is returned. Only an idle controller can launch.
    pub async fn launch(&self, request: RunRequest) -> Result<RunId, MonitorError> {
        let mut slot = self.monitor.lock().await;
        self.ensure_idle(slot.as_ref())?;

        let mut reconciler = Reconciler::new(Some(request.instruction.clone()));
        let launched = self
            .transport
            .launch(&request)
            .await
            .and_then(|response| RunId::new(response.run_id));
        let run_id = match launched {
            Ok(run_id) => run_id,
            Err(error) => {
                warn!(executor = %request.executor_name, error = %error, "run launch failed");
                reconciler.fail(error.to_string());
                self.shared
                    .publish(snapshot_of(None, &reconciler, ConnectionState::Closed));
                return Err(error);
            }
        };

        reconciler.set_local_status(CoarseStatus::Initiating);
        reconciler.seed_prompt();
        info!(
            run_id = %run_id,
            kind = ?request.kind,
            executor = %request.executor_name,
            "run launched"
        );
        self.shared.publish(snapshot_of(
            Some(&run_id),
            &reconciler,
            ConnectionState::Disconnected,
        ));

        if self.shared.is_disposed() {
            return Err(MonitorError::Disposed);
        }
        *slot = Some(self.spawn_monitor(run_id.clone(), reconciler));
        Ok(run_id)
    }

    /// Resumes observation of an existing run from one fetched snapshot.
    ///
    /// A fetch failure leaves the controller idle so the call can be retried.
    pub async fn attach(&self, run_id: RunId) -> Result<(), MonitorError> {
        let mut slot = self.monitor.lock().await;
        self.ensure_idle(slot.as_ref())?;

        let payload = self.transport.fetch_snapshot(&run_id).await?;
        let mut reconciler = Reconciler::new(None);
        reconciler.apply_snapshot(payload);

        if reconciler.status().is_terminal() {
            info!(run_id = %run_id, status = %reconciler.status(), "attached to finished run");
            self.shared
                .publish(snapshot_of(Some(&run_id), &reconciler, ConnectionState::Closed));
            return Ok(());
        }

        info!(run_id = %run_id, status = %reconciler.status(), "attached to run");
        self.shared.publish(snapshot_of(
            Some(&run_id),
            &reconciler,
            ConnectionState::Disconnected,
        ));
        if self.shared.is_disposed() {
            return Err(MonitorError::Disposed);
        }
        *slot = Some(self.spawn_monitor(run_id, reconciler));
        Ok(())
    }

    /// Marks the run `Cancelling` and asks the remote to stop it.
    ///
    /// No-op when there is no live run, the run is terminal, or a cancel is
    /// already pending. The remote's answer is not awaited beyond the request
    /// itself; the run resolves through a later status.
    pub async fn cancel(&self) {
        let snapshot = self.shared.current();
        let Some(run_id) = snapshot.run_id else {
            return;
        };
        if snapshot.status.is_terminal()
            || snapshot.status == CoarseStatus::Cancelling
            || self.shared.is_disposed()
        {
            return;
        }

        let inbox = match self.monitor.lock().await.as_ref() {
            Some(handle) => handle.inbox.clone(),
            None => return,
        };
        let (ack, marked) = oneshot::channel();
        let command = MonitorInput::Control(ControlCommand::MarkCancelling { ack });
        if inbox.send(command).await.is_err() {
            return;
        }
        if !marked.await.unwrap_or(false) {
            return;
        }

        let _ = self.coordinator.request_cancel(&run_id).await;
    }

    pub fn current_snapshot(&self) -> RunSnapshot {
        self.shared.current()
    }

    pub fn run_id(&self) -> Option<RunId> {
        self.shared.snapshot.borrow().run_id.clone()
    }

    /// Receiver that always holds the latest snapshot.
    pub fn watch(&self) -> watch::Receiver<RunSnapshot> {
        self.shared.snapshot.subscribe()
    }

    /// Waits until the connection is closed and returns the final snapshot.
    pub async fn wait_until_closed(&self) -> RunSnapshot {
        let mut receiver = self.watch();
        match receiver
            .wait_for(|snapshot| snapshot.connection == ConnectionState::Closed)
            .await
        {
            Ok(snapshot) => snapshot.clone(),
            Err(_) => self.shared.current(),
        }
    }

    pub fn on_snapshot_changed<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&RunSnapshot) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.shared.next_subscription.fetch_add(1, Ordering::SeqCst));
        self.shared
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(callback)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self
            .shared
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|(existing, _)| *existing != id);
        subscribers.len() != before
    }

    /// Stops the active source and waits for the monitor task to exit. No
    /// callback fires once this has started; watch receivers see one final
    /// `Closed` frame and nothing after it.
    pub async fn dispose(&self) {
        self.shared.disposed.store(true, Ordering::SeqCst);
        let handle = self.monitor.lock().await.take();
        let Some(MonitorHandle { inbox, task }) = handle else {
            return;
        };
        if inbox
            .send(MonitorInput::Control(ControlCommand::Shutdown))
            .await
            .is_err()
        {
            task.abort();
        }
        let _ = task.await;
        debug!("run controller disposed");
    }

    fn ensure_idle(&self, monitor: Option<&MonitorHandle>) -> Result<(), MonitorError> {
        if self.shared.is_disposed() {
            return Err(MonitorError::Disposed);
        }
        let status = self.shared.snapshot.borrow().status;
        if monitor.is_some() || status != CoarseStatus::Idle {
            return Err(MonitorError::invalid_state(format!(
                "controller already owns a run ({status})"
            )));
        }
        Ok(())
    }

    fn spawn_monitor(&self, run_id: RunId, reconciler: Reconciler) -> MonitorHandle {
        let (inbox, receiver) = mpsc::channel(self.options.channel_capacity.max(1));
        let state = MonitorState {
            run_id,
            transport: Arc::clone(&self.transport),
            shared: Arc::clone(&self.shared),
            reconciler,
            connection: ConnectionState::Disconnected,
            generation: 0,
            source: ActiveSource::None,
            inbox: inbox.clone(),
            poll_interval: self.options.poll_interval,
        };
        MonitorHandle {
            inbox,
            task: tokio::spawn(state.run(receiver)),
        }
    }
}

impl Drop for RunController {
    fn drop(&mut self) {
        self.shared.disposed.store(true, Ordering::SeqCst);
        if let Some(handle) = self.monitor.get_mut().take() {
            handle.task.abort();
        }
    }
}

fn snapshot_of(
    run_id: Option<&RunId>,
    reconciler: &Reconciler,
    connection: ConnectionState,
) -> RunSnapshot {
    RunSnapshot {
        run_id: run_id.cloned(),
        status: reconciler.status(),
        connection,
        transcript: reconciler.transcript().events().to_vec(),
        result: reconciler.result().map(str::to_string),
        error: reconciler.error().map(str::to_string),
    }
}

enum ActiveSource {
    None,
    Stream(StreamHandle),
    Poll(PollHandle),
}

struct MonitorState {
    run_id: RunId,
    transport: Arc<dyn RunTransport>,
    shared: Arc<Shared>,
    reconciler: Reconciler,
    connection: ConnectionState,
    generation: u64,
    source: ActiveSource,
    inbox: mpsc::Sender<MonitorInput>,
    poll_interval: Duration,
}

impl MonitorState {
    async fn run(mut self, mut receiver: mpsc::Receiver<MonitorInput>) {
        self.start_stream();

        while let Some(input) = receiver.recv().await {
            let flow = match input {
                MonitorInput::Control(ControlCommand::Shutdown) => {
                    self.stop_source().await;
                    self.connection = ConnectionState::Closed;
                    self.shared.publish_final(snapshot_of(
                        Some(&self.run_id),
                        &self.reconciler,
                        self.connection,
                    ));
                    ControlFlow::Break(())
                }
                MonitorInput::Control(ControlCommand::MarkCancelling { ack }) => {
                    let marked = self.reconciler.set_local_status(CoarseStatus::Cancelling);
                    if marked {
                        info!(run_id = %self.run_id, "run cancelling");
                        self.publish();
                    }
                    let _ = ack.send(marked);
                    ControlFlow::Continue(())
                }
                MonitorInput::Source { generation, signal } if generation == self.generation => {
                    self.handle_signal(signal).await
                }
                MonitorInput::Source { generation, .. } => {
                    debug!(
                        run_id = %self.run_id,
                        generation,
                        current = self.generation,
                        "dropping signal from retired source"
                    );
                    ControlFlow::Continue(())
                }
            };
            if flow.is_break() {
                break;
            }
        }
        debug!(run_id = %self.run_id, status = %self.reconciler.status(), "run monitor stopped");
    }

    async fn handle_signal(&mut self, signal: SourceSignal) -> ControlFlow<()> {
        match signal {
            SourceSignal::Event(event) => {
                let applied = self.reconciler.apply_event(event);
                if self.reconciler.status().is_terminal() {
                    self.close().await;
                    self.fill_outcome().await;
                    return ControlFlow::Break(());
                }
                if applied.any() {
                    self.publish();
                }
                ControlFlow::Continue(())
            }
            SourceSignal::StreamFailed { reason } => {
                if !matches!(self.source, ActiveSource::Stream(_)) {
                    return ControlFlow::Continue(());
                }
                info!(run_id = %self.run_id, reason = %reason, "stream unavailable, polling run snapshots");
                self.stop_source().await;
                self.start_poll();
                ControlFlow::Continue(())
            }
            SourceSignal::Snapshot(payload) => {
                let applied = self.reconciler.apply_snapshot(*payload);
                if self.reconciler.status().is_terminal() {
                    self.close().await;
                    return ControlFlow::Break(());
                }
                if applied.any() {
                    self.publish();
                }
                ControlFlow::Continue(())
            }
            SourceSignal::PollTerminal => {
                self.close().await;
                ControlFlow::Break(())
            }
        }
    }

    fn start_stream(&mut self) {
        self.generation += 1;
        let sink = SignalSink::new(self.generation, self.inbox.clone());
        let handle = StreamConsumer::open(Arc::clone(&self.transport), self.run_id.clone(), sink);
        self.source = ActiveSource::Stream(handle);
        self.connection = ConnectionState::Streaming;
        debug!(run_id = %self.run_id, generation = self.generation, "run stream attached");
        self.publish();
    }

    fn start_poll(&mut self) {
        self.generation += 1;
        let sink = SignalSink::new(self.generation, self.inbox.clone());
        let handle = PollFallback::start(
            Arc::clone(&self.transport),
            self.run_id.clone(),
            self.poll_interval,
            sink,
        );
        self.source = ActiveSource::Poll(handle);
        self.connection = ConnectionState::Polling;
        debug!(run_id = %self.run_id, generation = self.generation, "run poll attached");
        self.publish();
    }

    async fn stop_source(&mut self) {
        match std::mem::replace(&mut self.source, ActiveSource::None) {
            ActiveSource::Stream(mut handle) => handle.close().await,
            ActiveSource::Poll(mut handle) => handle.stop().await,
            ActiveSource::None => {}
        }
        self.generation += 1;
    }

    async fn close(&mut self) {
        self.stop_source().await;
        self.connection = ConnectionState::Closed;
        info!(run_id = %self.run_id, status = %self.reconciler.status(), "run closed");
        self.publish();
    }

    /// The stream carries status but not the run's result or error text.
    async fn fill_outcome(&mut self) {
        match self.transport.fetch_snapshot(&self.run_id).await {
            Ok(payload) => {
                if self.reconciler.apply_outcome(payload).any() {
                    self.publish();
                }
            }
            Err(error) => {
                debug!(run_id = %self.run_id, error = %error, "final run snapshot unavailable");
            }
        }
    }

    fn publish(&self) {
        self.shared
            .publish(snapshot_of(Some(&self.run_id), &self.reconciler, self.connection));
    }
}
