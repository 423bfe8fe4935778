//! Multi-request Scheduler
//!
//! One worker task drives every active transfer cooperatively. Consumers
//! never touch the transfer multiplexing directly: they post commands to
//! the worker's input channel and observe results through their own request
//! slot. The worker is reference counted; it spins up when the first
//! consumer acquires it and is joined when the last consumer releases.
//!
//! Within one worker cycle removals are processed before starts, so a slot
//! cancelled before its transfer ran never reaches the transport.

// Layer 1: Standard library imports
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

// Layer 2: Third-party crate imports
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

// Layer 3: Internal module imports
use crate::error::{SourceError, SourceResult};
use crate::slot::{ConnectionStatus, RequestSlot};
use crate::transport::{TransferEnd, TransportHandle};

/// How long the worker sleeps between housekeeping sweeps while transfers
/// are active and no event arrives.
const SWEEP_TICK: Duration = Duration::from_secs(1);

pub(crate) enum Command {
    /// Add a slot and its built transport handle to the queue
    Enqueue {
        slot: Arc<RequestSlot>,
        handle: TransportHandle,
    },
    /// Wake the worker so it notices a slot marked for removal
    Cancel { slot: Arc<RequestSlot> },
    /// Last reference released; drain and exit
    Shutdown,
}

/// Explicit, process-wide home for the shared scheduler.
///
/// Hand a clone to every source element at construction. The worker task
/// exists exactly while at least one element holds an un-released
/// [`SchedulerRef`].
///
/// # Examples
///
/// ```rust
/// use rivulet_httpsrc::scheduler::SchedulerRegistry;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let registry = SchedulerRegistry::new();
/// let scheduler = registry.acquire();
/// assert!(registry.is_running());
/// scheduler.release().await;
/// assert!(!registry.is_running());
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct SchedulerRegistry {
    core: Arc<Mutex<Option<SchedulerCore>>>,
}

#[derive(Debug)]
struct SchedulerCore {
    refcount: usize,
    cmd_tx: mpsc::UnboundedSender<Command>,
    worker: Option<JoinHandle<()>>,
}

impl SchedulerRegistry {
    /// Create an empty registry; no worker runs until the first acquire.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<SchedulerCore>> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take a reference on the shared worker, starting it on the first
    /// acquire.
    ///
    /// Spawning requires a running tokio runtime; on a shut-down runtime
    /// this is the unrecoverable startup failure of the design and the
    /// spawn itself panics.
    pub fn acquire(&self) -> SchedulerRef {
        let mut core = self.lock();
        if let Some(existing) = core.as_mut() {
            existing.refcount += 1;
            debug!(refcount = existing.refcount, "Joined existing scheduler worker");
            return SchedulerRef {
                registry: self.clone(),
                cmd_tx: existing.cmd_tx.clone(),
            };
        }
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(multi_worker(cmd_rx));
        info!("Scheduler worker initialised");
        *core = Some(SchedulerCore {
            refcount: 1,
            cmd_tx: cmd_tx.clone(),
            worker: Some(worker),
        });
        SchedulerRef {
            registry: self.clone(),
            cmd_tx,
        }
    }

    /// Number of outstanding references, for lifecycle assertions.
    pub fn refcount(&self) -> usize {
        self.lock().as_ref().map_or(0, |core| core.refcount)
    }

    /// Whether the worker task currently exists.
    pub fn is_running(&self) -> bool {
        self.lock().is_some()
    }
}

/// One consumer's handle on the shared scheduler.
#[derive(Debug)]
pub struct SchedulerRef {
    registry: SchedulerRegistry,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl SchedulerRef {
    /// Queue a slot with its built transport handle and wake the worker.
    ///
    /// The slot is marked connected here; a duplicate enqueue is detected
    /// by the worker and surfaces as `BadRequest` on the slot.
    pub(crate) fn enqueue(
        &self,
        slot: Arc<RequestSlot>,
        handle: TransportHandle,
    ) -> SourceResult<()> {
        slot.set_connected();
        self.cmd_tx
            .send(Command::Enqueue { slot, handle })
            .map_err(|_| SourceError::internal("scheduler worker is gone"))
    }

    /// Ask the worker to detach a slot's transfer on its next sweep.
    pub(crate) fn request_removal(&self, slot: &Arc<RequestSlot>) {
        slot.request_removal();
        // A send failure means the worker already exited and dropped the
        // queue; the slot is as removed as it will ever be.
        let _ = self.cmd_tx.send(Command::Cancel {
            slot: Arc::clone(slot),
        });
    }

    /// Block until the worker no longer references the slot.
    pub(crate) async fn await_removed(&self, slot: &RequestSlot) {
        slot.await_not_connected().await;
    }

    /// Drop this reference; the last release stops and joins the worker.
    pub async fn release(self) {
        let worker = {
            let mut core = self.registry.lock();
            let mut finished = None;
            let mut drained = false;
            if let Some(existing) = core.as_mut() {
                existing.refcount -= 1;
                info!(refcount = existing.refcount, "Closing scheduler reference");
                if existing.refcount == 0 {
                    let _ = existing.cmd_tx.send(Command::Shutdown);
                    finished = existing.worker.take();
                    drained = true;
                }
            }
            if drained {
                *core = None;
            }
            finished
        };
        if let Some(worker) = worker {
            debug!("Joining scheduler worker");
            if let Err(e) = worker.await {
                warn!(error = %e, "Scheduler worker ended abnormally");
            }
            debug!("Scheduler worker cleanup complete");
        }
    }
}

struct QueueEntry {
    slot: Arc<RequestSlot>,
    handle: Option<TransportHandle>,
    started: bool,
    cancel: CancellationToken,
}

type RunningTransfer = BoxFuture<'static, (Arc<RequestSlot>, TransferEnd)>;

/// The worker loop. Owns the queue and is the only code that starts,
/// polls, or detaches transfers.
async fn multi_worker(mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
    let mut queue: Vec<QueueEntry> = Vec::new();
    let mut transfers: FuturesUnordered<RunningTransfer> = FuturesUnordered::new();

    loop {
        // Sweep: removals strictly before starts.
        queue.retain(|entry| {
            if entry.slot.connection_status() == ConnectionStatus::WantRemoval {
                debug!("Detaching transfer marked for removal");
                entry.cancel.cancel();
                entry.slot.mark_removed();
                false
            } else {
                true
            }
        });
        for entry in queue.iter_mut() {
            if !entry.started && entry.slot.connection_status() == ConnectionStatus::Connected {
                entry.started = true;
                if let Some(handle) = entry.handle.take() {
                    trace!("Adding transfer to the multiplexer");
                    let slot = Arc::clone(&entry.slot);
                    let cancel = entry.cancel.clone();
                    transfers.push(
                        async move {
                            let end = handle.run(cancel).await;
                            (slot, end)
                        }
                        .boxed(),
                    );
                }
            }
        }

        tokio::select! {
            command = cmd_rx.recv() => match command {
                Some(Command::Enqueue { slot, handle }) => {
                    let duplicate = queue.iter().any(|entry| Arc::ptr_eq(&entry.slot, &slot));
                    if duplicate {
                        warn!("Slot enqueued twice, refusing");
                        slot.mark_bad_request();
                    } else {
                        queue.push(QueueEntry {
                            slot,
                            handle: Some(handle),
                            started: false,
                            cancel: CancellationToken::new(),
                        });
                    }
                }
                Some(Command::Cancel { slot }) => {
                    // The slot already carries WantRemoval; the sweep at the
                    // top of the loop performs the detach.
                    trace!(status = ?slot.connection_status(), "Woken for a removal request");
                }
                Some(Command::Shutdown) | None => {
                    info!("Got instruction to shut down");
                    break;
                }
            },
            Some((slot, end)) = transfers.next(), if !transfers.is_empty() => {
                let position = queue.iter().position(|entry| Arc::ptr_eq(&entry.slot, &slot));
                match end {
                    TransferEnd::Cancelled => {
                        // Already detached by the sweep that cancelled it.
                        trace!("Transfer future ended after cancellation");
                    }
                    TransferEnd::Completed(result) => match position {
                        Some(index) => {
                            queue.remove(index);
                            slot.complete_transfer(result);
                        }
                        // Completion for a slot no longer queued; observed
                        // with racing cancellations and harmless to skip.
                        None => debug!("Completion for an unqueued slot, skipping"),
                    },
                }
            },
            _ = tokio::time::sleep(SWEEP_TICK), if !queue.is_empty() => {
                trace!("Housekeeping sweep");
            }
        }
    }

    // Wake anything still parked on these slots before the queue drops.
    for entry in queue.drain(..) {
        entry.cancel.cancel();
        entry.slot.mark_removed();
    }
}
