use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use braid_graph::NodeStat;
use braid_store::JobState;
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::calc::ProgressStrategy;
use crate::error::ProgressError;
use crate::sink::{ProgressEvent, ProgressLevel, ProgressSink};

/// Throttle and queue settings.
#[derive(Debug, Clone, Copy)]
pub struct ProgressConfig {
  /// Minimum time between two emissions.
  pub throttle: Duration,
  /// Reports that may wait for the worker. Past this, the oldest waiting
  /// report is coalesced away.
  pub backlog: usize,
}

impl Default for ProgressConfig {
  fn default() -> Self {
    Self {
      throttle: Duration::from_millis(1000),
      backlog: 64,
    }
  }
}

/// Job-level fields attached to a report.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
  pub status: JobState,
  pub error: Option<String>,
}

impl ProgressUpdate {
  pub fn status(status: JobState) -> Self {
    Self {
      status,
      error: None,
    }
  }

  pub fn failed(error: impl Into<String>) -> Self {
    Self {
      status: JobState::Failed,
      error: Some(error.into()),
    }
  }
}

/// What happened to a single report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressOutcome {
  /// The report was emitted.
  Sent,
  /// A newer report replaced it before it could be emitted.
  Coalesced,
}

type Reply = oneshot::Sender<Result<ProgressOutcome, ProgressError>>;

struct Request {
  event: ProgressEvent,
  reply: Reply,
}

impl Request {
  fn coalesce(self) {
    let _ = self.reply.send(Ok(ProgressOutcome::Coalesced));
  }
}

#[derive(Default)]
struct Queue {
  waiting: VecDeque<Request>,
  closed: bool,
}

/// Reports waiting for the worker.
struct Shared {
  queue: Mutex<Queue>,
  wake: Notify,
}

impl Shared {
  fn lock(&self) -> MutexGuard<'_, Queue> {
    self.queue.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

/// Resolves with the outcome of one report.
///
/// Dropping the ticket is fine; the report is still processed.
#[derive(Debug)]
pub struct ProgressTicket(oneshot::Receiver<Result<ProgressOutcome, ProgressError>>);

impl ProgressTicket {
  pub async fn wait(self) -> Result<ProgressOutcome, ProgressError> {
    self.0.await.unwrap_or(Err(ProgressError::Closed))
  }
}

/// Computes and emits progress for one job.
pub struct ProgressManager {
  job_id: String,
  strategy: ProgressStrategy,
  current_progress: f64,
  backlog: usize,
  shared: Arc<Shared>,
  worker: JoinHandle<()>,
}

impl ProgressManager {
  /// Create a manager and spawn its emission worker.
  ///
  /// Must be called from within a tokio runtime.
  pub fn new(
    job_id: impl Into<String>,
    strategy: ProgressStrategy,
    sink: Arc<dyn ProgressSink>,
    config: ProgressConfig,
  ) -> Self {
    let job_id = job_id.into();
    let shared = Arc::new(Shared {
      queue: Mutex::new(Queue::default()),
      wake: Notify::new(),
    });
    let worker = tokio::spawn(run_worker(
      job_id.clone(),
      shared.clone(),
      sink,
      config.throttle,
    ));

    Self {
      job_id,
      strategy,
      current_progress: 0.0,
      backlog: config.backlog.max(1),
      shared,
      worker,
    }
  }

  /// Progress computed by the most recent report.
  pub fn current_progress(&self) -> f64 {
    self.current_progress
  }

  /// Compute progress from `stats` and queue an emission.
  ///
  /// Never blocks. When the backlog is full the oldest waiting report is
  /// dropped with [`ProgressOutcome::Coalesced`], so the latest state
  /// always reaches the sink.
  pub fn report(
    &mut self,
    level: ProgressLevel,
    stats: &[NodeStat],
    update: ProgressUpdate,
  ) -> ProgressTicket {
    let calc = self.strategy.calculate(stats);
    self.current_progress = calc.progress;

    let event = ProgressEvent {
      job_id: self.job_id.clone(),
      level,
      status: update.status,
      error: update.error,
      progress: calc.progress,
      details: calc.details,
      states: calc.states,
    };

    let (reply, receiver) = oneshot::channel();
    if self.worker.is_finished() {
      let _ = reply.send(Err(ProgressError::Closed));
      return ProgressTicket(receiver);
    }

    let mut queue = self.shared.lock();
    if queue.waiting.len() >= self.backlog
      && let Some(oldest) = queue.waiting.pop_front()
    {
      debug!(job_id = %self.job_id, capacity = self.backlog, "progress_backlog_full");
      oldest.coalesce();
    }
    queue.waiting.push_back(Request { event, reply });
    drop(queue);
    self.shared.wake.notify_one();
    ProgressTicket(receiver)
  }

  pub fn trace(&mut self, stats: &[NodeStat], update: ProgressUpdate) -> ProgressTicket {
    self.report(ProgressLevel::Trace, stats, update)
  }

  pub fn debug(&mut self, stats: &[NodeStat], update: ProgressUpdate) -> ProgressTicket {
    self.report(ProgressLevel::Debug, stats, update)
  }

  pub fn info(&mut self, stats: &[NodeStat], update: ProgressUpdate) -> ProgressTicket {
    self.report(ProgressLevel::Info, stats, update)
  }

  pub fn warning(&mut self, stats: &[NodeStat], update: ProgressUpdate) -> ProgressTicket {
    self.report(ProgressLevel::Warning, stats, update)
  }

  pub fn error(&mut self, stats: &[NodeStat], update: ProgressUpdate) -> ProgressTicket {
    self.report(ProgressLevel::Error, stats, update)
  }

  pub fn critical(&mut self, stats: &[NodeStat], update: ProgressUpdate) -> ProgressTicket {
    self.report(ProgressLevel::Critical, stats, update)
  }

  /// Stop accepting reports, flush the latest waiting report and wait for
  /// the worker to exit.
  pub async fn close(self) {
    self.shared.lock().closed = true;
    self.shared.wake.notify_one();
    if let Err(e) = self.worker.await {
      warn!(job_id = %self.job_id, error = %e, "progress_worker_panicked");
    }
  }
}

/// The next report to emit, or `None` once closed and drained.
///
/// Outside a throttle window the oldest waiting report goes out (leading
/// edge). Inside one, the worker waits for the window to end and emits the
/// newest report, coalescing everything queued before it (trailing edge).
async fn next_request(shared: &Shared, window_end: Option<Instant>) -> Option<Request> {
  loop {
    let (empty, closed) = {
      let queue = shared.lock();
      (queue.waiting.is_empty(), queue.closed)
    };
    if empty {
      if closed {
        return None;
      }
      shared.wake.notified().await;
      continue;
    }

    let throttled = window_end.filter(|end| !closed && Instant::now() < *end);
    if let Some(end) = throttled {
      tokio::select! {
        biased;
        _ = tokio::time::sleep_until(end) => {}
        _ = shared.wake.notified() => continue,
      }
    }

    let mut queue = shared.lock();
    if throttled.is_none() && !closed {
      return queue.waiting.pop_front();
    }
    let latest = queue.waiting.pop_back();
    for stale in queue.waiting.drain(..) {
      stale.coalesce();
    }
    return latest;
  }
}

async fn run_worker(
  job_id: String,
  shared: Arc<Shared>,
  sink: Arc<dyn ProgressSink>,
  throttle: Duration,
) {
  let mut last_sent: Option<Instant> = None;
  while let Some(request) = next_request(&shared, last_sent.map(|at| at + throttle)).await {
    emit(&job_id, sink.as_ref(), request).await;
    last_sent = Some(Instant::now());
  }
}

async fn emit(job_id: &str, sink: &dyn ProgressSink, request: Request) {
  let progress = request.event.progress;
  let result = sink.send(request.event).await;
  match &result {
    Ok(()) => debug!(job_id = %job_id, progress, "progress_sent"),
    Err(e) => warn!(job_id = %job_id, error = %e, "progress_send_failed"),
  }
  let _ = request.reply.send(result.map(|()| ProgressOutcome::Sent));
}
