//! The agent loop: a listener parked in the driver and a processor that
//! drives snapshot sessions.
//!
//! The listener owns one adapter channel and keeps a `Requested` IOCTL
//! pending inside the driver; each completion is pushed onto the queue and
//! the IOCTL re-armed. The processor drains the queue in FIFO order and
//! runs one session at a time. Because the driver admits a single
//! outstanding IOCTL per handle, every status report and the shutdown
//! discard go out on fresh channels.
//!
//! Stopping is cooperative by pre-emption: setting the flag alone leaves
//! the listener parked, so `stop` issues a discard on another channel to
//! release it; the listener's final wakeup then lets the processor exit.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use pdvss_core::coordinator::Coordinator;
use pdvss_core::platform::{Adapter, DiskTopology, GateEvents};
use pdvss_core::resolver::resolve_volumes;
use pdvss_proto::identity::gate_event_name;
use pdvss_proto::wire::{ProceedStatus, SnapshotTarget};
use pdvss_proto::PdResult;

use crate::events::emit_outcome;
use crate::session::SnapshotSession;

/// Long-lived agent state shared by the listener and the processor.
pub struct AgentService {
    adapter: Arc<dyn Adapter>,
    topology: Arc<dyn DiskTopology>,
    gates: Arc<dyn GateEvents>,
    coordinator: Arc<dyn Coordinator>,
    queue: Mutex<VecDeque<SnapshotTarget>>,
    wake: AtomicBool,
    stopping: AtomicBool,
    notify: Notify,
}

/// Join handles for the two running workers.
pub struct AgentHandle {
    listener: JoinHandle<()>,
    processor: JoinHandle<()>,
}

impl AgentService {
    pub fn new(
        adapter: Arc<dyn Adapter>,
        topology: Arc<dyn DiskTopology>,
        gates: Arc<dyn GateEvents>,
        coordinator: Arc<dyn Coordinator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            adapter,
            topology,
            gates,
            coordinator,
            queue: Mutex::new(VecDeque::new()),
            wake: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    /// Start the agent: clear any stale pending request left behind by an
    /// unclean previous exit, then launch the listener and the processor.
    pub fn start(self: &Arc<Self>) -> PdResult<AgentHandle> {
        // A failing discard here means there is no working persistent-disk
        // device; the agent declines to start.
        self.adapter.open_channel()?.discard()?;

        let listener = {
            let service = self.clone();
            tokio::task::spawn_blocking(move || service.listen())
        };
        let processor = {
            let service = self.clone();
            tokio::spawn(async move { service.process().await })
        };
        info!("agent started");
        Ok(AgentHandle {
            listener,
            processor,
        })
    }

    /// Stop the agent and join both workers.
    pub async fn stop(&self, handle: AgentHandle) {
        debug!("agent stopping");
        self.stopping.store(true, Ordering::SeqCst);
        // Release the listener's pending request. Its own channel already
        // holds an outstanding IOCTL, so the discard needs a new one.
        if let Err(e) = self
            .adapter
            .open_channel()
            .and_then(|channel| channel.discard())
        {
            warn!(error = %e, "discard on stop failed");
        }
        if handle.listener.await.is_err() {
            warn!("listener worker panicked");
        }
        if handle.processor.await.is_err() {
            warn!("processor worker panicked");
        }
        info!("agent stopped");
    }

    /// Listener body: keep a request pending in the driver, queue each
    /// completion for the processor.
    fn listen(&self) {
        let channel = match self.adapter.open_channel() {
            Ok(channel) => channel,
            Err(e) => {
                warn!(error = %e, "listener could not open an adapter channel");
                self.final_wakeup();
                return;
            }
        };
        while !self.stopping.load(Ordering::SeqCst) {
            debug!("waiting for a host snapshot request");
            let result = channel.wait_request();
            if self.stopping.load(Ordering::SeqCst) {
                debug!("listener exiting");
                break;
            }
            match result {
                Ok(st) => {
                    {
                        let mut queue = self.queue();
                        queue.push_back(st);
                        self.wake.store(true, Ordering::SeqCst);
                    }
                    self.notify.notify_one();
                    info!(%st, "snapshot requested");
                }
                Err(e) => {
                    // Transient; the host retries.
                    warn!(error = %e, "snapshot request wait failed");
                }
            }
        }
        self.final_wakeup();
    }

    /// Wake the processor one last time so it can observe `stopping`.
    fn final_wakeup(&self) {
        self.wake.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<SnapshotTarget>> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Processor body: drain queued targets in FIFO order and run each
    /// snapshot to completion.
    async fn process(self: Arc<Self>) {
        while !self.stopping.load(Ordering::SeqCst) {
            self.notify.notified().await;
            if !self.wake.swap(false, Ordering::SeqCst) {
                continue;
            }
            let batch: Vec<SnapshotTarget> = self.queue().drain(..).collect();
            debug!(count = batch.len(), "processor woke up");
            for st in batch {
                self.handle_target(st).await;
            }
        }
        debug!("processor exiting");
    }

    /// Run one host request end to end. Failures are reported to the host
    /// and logged; they never take the loop down.
    async fn handle_target(&self, st: SnapshotTarget) {
        let volumes = match resolve_volumes(
            self.topology.as_ref(),
            self.adapter.port_number(),
            st,
        ) {
            Ok(volumes) => volumes,
            Err(e) => {
                warn!(%st, error = %e, "volume resolution failed");
                return;
            }
        };

        if volumes.is_empty() {
            info!(%st, "snapshot requested for a disk which has no volumes");
            self.report(st, ProceedStatus::PrepareComplete);
            emit_outcome(true, st, &volumes);
            return;
        }

        // The gate the provider checks to recognise this request as ours.
        // Held for the whole session, closed when this scope ends.
        let gate_name = gate_event_name(st.target, st.lun);
        let _gate = match self.gates.create(&gate_name) {
            Ok(gate) => gate,
            Err(e) => {
                warn!(%st, error = %e, "could not create the gate event");
                return;
            }
        };

        let mut session = match SnapshotSession::new(
            self.coordinator.as_ref(),
            self.topology.clone(),
        ) {
            Ok(session) => session,
            Err(e) => {
                warn!(%st, error = %e, "coordinator session unavailable");
                self.report(st, ProceedStatus::PrepareError);
                emit_outcome(false, st, &volumes);
                return;
            }
        };

        let prepared = self.prepare(&mut session, &volumes).await;
        let mut succeeded = false;
        match prepared {
            Err(e) => {
                warn!(%st, error = %e, "prepare failed");
                self.report(st, ProceedStatus::PrepareError);
            }
            Ok(()) => match session.do_snapshot_set().await {
                Err(e) => {
                    warn!(%st, error = %e, "snapshot set failed");
                    self.report(st, ProceedStatus::Error);
                }
                Ok(()) => {
                    self.report(st, ProceedStatus::Complete);
                    succeeded = true;
                }
            },
        }

        if let Err(e) = session.finish(succeeded).await {
            warn!(%st, error = %e, "finishing the backup failed");
            succeeded = false;
        }
        emit_outcome(succeeded, st, &volumes);
    }

    async fn prepare(
        &self,
        session: &mut SnapshotSession,
        volumes: &[String],
    ) -> PdResult<()> {
        session.gather_writer_metadata().await?;
        session.prepare_snapshot_set(volumes).await
    }

    /// Report a status on a fresh channel; the listener's channel still
    /// holds its pending request.
    fn report(&self, st: SnapshotTarget, status: ProceedStatus) {
        let result = self
            .adapter
            .open_channel()
            .and_then(|channel| channel.report(st, status));
        if let Err(e) = result {
            warn!(%st, error = %e, "failed to report snapshot status");
        }
    }
}
