//! Per-partition single-writer dispatch lanes.
//!
//! A swimlane preserves FIFO order within one partition while letting
//! different partitions run concurrently. The queue, the `running` flag
//! and the `stopped` flag all live under one mutex: popping the next
//! message and deciding to park (`running = false`) happen in the same
//! critical section, which closes the race where a producer enqueues
//! between the worker's empty read and its exit.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ShutdownMode;
use crate::consumer::HandlerFuture;
use crate::message::Message;

/// Per-message consumer callback invoked by the lane worker.
pub type LaneConsumer = Arc<dyn Fn(Message) -> HandlerFuture + Send + Sync>;

/// Completion callback fired with the handler outcome.
///
/// Never fired for messages abandoned by shutdown, so their offsets are
/// never committed.
pub type Completion = Box<dyn FnOnce(Result<(), tower::BoxError>) + Send>;

struct QueuedMessage {
    message: Message,
    consumer: LaneConsumer,
    completion: Completion,
}

/// Dispatch attempt against a stopped lane.
#[derive(Debug)]
pub struct LaneClosed;

impl std::fmt::Display for LaneClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "swimlane is stopped")
    }
}

impl std::error::Error for LaneClosed {}

struct LaneShared {
    state: Mutex<LaneState>,
    cancel: CancellationToken,
}

impl LaneShared {
    fn lock(&self) -> MutexGuard<'_, LaneState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct LaneState {
    queue: VecDeque<QueuedMessage>,
    running: bool,
    stopped: bool,
    worker: Option<JoinHandle<()>>,
}

/// A single swimlane: FIFO queue plus at most one worker task.
#[derive(Clone)]
pub struct SwimlaneDispatcher {
    shared: Arc<LaneShared>,
}

impl Default for SwimlaneDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl SwimlaneDispatcher {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(LaneShared {
                state: Mutex::new(LaneState {
                    queue: VecDeque::new(),
                    running: false,
                    stopped: false,
                    worker: None,
                }),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Token handed to handlers running on this lane.
    pub fn cancellation(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    /// Enqueue a message; starts a worker if the lane is idle.
    pub fn dispatch(
        &self,
        message: Message,
        consumer: LaneConsumer,
        completion: Completion,
    ) -> Result<(), LaneClosed> {
        let mut state = self.shared.lock();
        if state.stopped {
            return Err(LaneClosed);
        }
        state.queue.push_back(QueuedMessage {
            message,
            consumer,
            completion,
        });
        if !state.running {
            state.running = true;
            let shared = Arc::clone(&self.shared);
            state.worker = Some(tokio::spawn(worker_loop(shared)));
        }
        Ok(())
    }

    /// Stop the lane and wait for its worker.
    ///
    /// Queued-but-unstarted messages are abandoned in both modes. Only
    /// cancel-current interrupts the in-flight handler; idempotent after
    /// the first call.
    pub async fn stop(&self, mode: ShutdownMode) {
        let worker = {
            let mut state = self.shared.lock();
            if state.stopped {
                None
            } else {
                state.stopped = true;
                state.queue.clear();
                if mode == ShutdownMode::CancelCurrent {
                    self.shared.cancel.cancel();
                }
                state.worker.take()
            }
        };
        if let Some(worker) = worker
            && worker.await.is_err()
        {
            tracing::debug!("swimlane worker ended abnormally");
        }
    }
}

async fn worker_loop(shared: Arc<LaneShared>) {
    loop {
        let next = {
            let mut state = shared.lock();
            match state.queue.pop_front() {
                Some(task) => task,
                None => {
                    // pop and park share the lock, so no enqueue can slip
                    // between the empty check and running = false
                    state.running = false;
                    return;
                }
            }
        };

        if shared.cancel.is_cancelled() {
            // abandoned without completion: the offset stays uncommitted
            shared.lock().running = false;
            return;
        }

        let result = (next.consumer)(next.message).await;
        let failed = result.is_err();
        if let Err(error) = &result {
            tracing::error!(error = %error, "handler failed, parking swimlane");
        }
        (next.completion)(result);

        if failed {
            shared.lock().running = false;
            return;
        }
    }
}

/// Lazily-populated partition → lane map owned by one subscription.
#[derive(Default)]
pub struct SwimlaneMap {
    lanes: Mutex<HashMap<i32, SwimlaneDispatcher>>,
}

impl SwimlaneMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lane for `partition`, created on first use.
    pub fn lane(&self, partition: i32) -> SwimlaneDispatcher {
        self.lanes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(partition)
            .or_default()
            .clone()
    }

    /// Stop every lane, sequentially.
    pub async fn stop_all(&self, mode: ShutdownMode) {
        let lanes: Vec<SwimlaneDispatcher> = self
            .lanes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        for lane in lanes {
            lane.stop(mode).await;
        }
    }
}
