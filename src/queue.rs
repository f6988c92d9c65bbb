//! Ordered, retrying delivery of xAPI requests.
//!
//! The [`DeliveryQueue`] owns a backlog of [`QueueEntry`] values that a single
//! worker task processes strictly in submission order. Each entry moves
//! through `Pending -> InFlight -> {Succeeded | Pending (retry) |
//! FailedPermanent}`. A head entry waiting out its backoff blocks everything
//! behind it, which keeps statements reaching the LRS in the order they were
//! submitted.
//!
//! The backlog lives in memory only. Entries still queued or in flight when
//! the process exits are lost.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{DeliveryFailure, Result, XapiError};
use crate::request::RequestDescriptor;
use crate::transport::{LrsResponse, Outcome, Transport};

/// Default base delay for exponential backoff (in milliseconds).
const DEFAULT_BASE_DELAY_MS: u64 = 500;

/// Maximum delay between retries (in milliseconds).
const MAX_RETRY_DELAY_MS: u64 = 30_000;

/// Default jitter as a fraction of the computed delay.
const DEFAULT_JITTER_FACTOR: f64 = 0.25;

/// Jitter above one third could make a later delay shorter than an earlier one.
const MAX_JITTER_FACTOR: f64 = 0.3;

/// Exponential backoff with symmetric jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay (0.0..=0.3) added or removed at random
    pub jitter_factor: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(MAX_RETRY_DELAY_MS),
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }
}

impl Backoff {
    /// Delay before the retry that follows `attempt` failed attempts.
    ///
    /// delay = min(base * 2^attempt * (1 ± jitter), max_delay)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponential = self.base_delay.saturating_mul(1u32 << attempt.min(16));

        let jitter = self.jitter_factor.clamp(0.0, MAX_JITTER_FACTOR);
        let jittered = if jitter > 0.0 {
            let offset = rand::thread_rng().gen_range(-jitter..=jitter);
            exponential.mul_f64(1.0 + offset)
        } else {
            exponential
        };

        jittered.min(self.max_delay)
    }

    /// Backoff delay, lengthened to honour a server `Retry-After`.
    ///
    /// A long hint can exceed the plain delay of the following attempt;
    /// [`QueueEntry::record_outcome`] keeps an entry's delays non-decreasing.
    pub fn delay_with_hint(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let delay = self.delay(attempt);
        match retry_after {
            Some(hint) => delay.max(hint).min(self.max_delay),
            None => delay,
        }
    }
}

/// Lifecycle state of a queued request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Pending,
    InFlight,
    Succeeded,
    FailedPermanent,
}

/// Result of a successfully delivered request.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub entry_id: Uuid,
    pub operation: &'static str,
    /// Attempts it took, including the successful one
    pub attempts: u32,
    pub statement_ids: Vec<Uuid>,
    pub response: LrsResponse,
}

/// What the worker does next with an entry after an attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Delivered(LrsResponse),
    Retry(Duration),
    GiveUp(XapiError),
}

/// One pending request and its delivery bookkeeping.
#[derive(Debug)]
pub struct QueueEntry {
    pub id: Uuid,
    pub request: Arc<RequestDescriptor>,
    pub attempt_count: u32,
    pub next_eligible: Instant,
    pub status: EntryStatus,
    pub last_failure: Option<DeliveryFailure>,
    /// Delay chosen after the previous failed attempt; the next one never drops below it
    last_delay: Duration,
    cancel_requested: bool,
    responder: Option<oneshot::Sender<Result<Delivery>>>,
}

impl QueueEntry {
    pub fn new(request: RequestDescriptor) -> Self {
        Self {
            id: Uuid::new_v4(),
            request: Arc::new(request),
            attempt_count: 0,
            next_eligible: Instant::now(),
            status: EntryStatus::Pending,
            last_failure: None,
            last_delay: Duration::ZERO,
            cancel_requested: false,
            responder: None,
        }
    }

    fn begin_attempt(&mut self) {
        self.status = EntryStatus::InFlight;
        self.attempt_count += 1;
    }

    /// Apply the outcome of the attempt in flight.
    pub fn record_outcome(&mut self, outcome: Outcome, backoff: &Backoff, now: Instant) -> Step {
        match outcome {
            Outcome::Success(response) => {
                self.status = EntryStatus::Succeeded;
                Step::Delivered(response)
            }
            Outcome::Fatal(failure) => {
                self.status = EntryStatus::FailedPermanent;
                self.last_failure = Some(failure.clone());
                Step::GiveUp(XapiError::FatalDelivery {
                    attempts: self.attempt_count,
                    failure,
                })
            }
            Outcome::Retryable { failure, retry_after } => {
                self.last_failure = Some(failure.clone());
                if self.attempt_count < self.request.max_attempts {
                    let delay = backoff
                        .delay_with_hint(self.attempt_count, retry_after)
                        .max(self.last_delay);
                    self.last_delay = delay;
                    self.next_eligible = now + delay;
                    self.status = EntryStatus::Pending;
                    Step::Retry(delay)
                } else {
                    self.status = EntryStatus::FailedPermanent;
                    Step::GiveUp(XapiError::TransientDelivery {
                        attempts: self.attempt_count,
                        failure,
                    })
                }
            }
        }
    }
}

/// Delivery counters published by the worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Entries not yet resolved, including the one in flight
    pub pending: usize,
    pub in_flight: bool,
    pub delivered: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub retries: u64,
}

enum Command {
    Enqueue(QueueEntry),
    Cancel(Uuid),
}

/// Caller's handle on a queued request.
///
/// Await it for the [`Delivery`] or the classified error.
#[derive(Debug)]
pub struct DeliveryHandle {
    id: Uuid,
    operation: &'static str,
    statement_ids: Vec<Uuid>,
    receiver: oneshot::Receiver<Result<Delivery>>,
    commands: mpsc::UnboundedSender<Command>,
}

impl DeliveryHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn operation(&self) -> &'static str {
        self.operation
    }

    /// Ids of the statements this request carries.
    pub fn statement_ids(&self) -> &[Uuid] {
        &self.statement_ids
    }

    /// Ask the queue to drop this request.
    ///
    /// A pending request resolves as `XapiError::Cancelled`. A request
    /// already in flight may still reach the LRS; it is only prevented from
    /// being retried.
    pub fn cancel(&self) {
        let _ = self.commands.send(Command::Cancel(self.id));
    }
}

impl Future for DeliveryHandle {
    type Output = Result<Delivery>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.receiver)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(XapiError::QueueClosed)))
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Enqueue(entry) => write!(f, "Enqueue({})", entry.id),
            Command::Cancel(id) => write!(f, "Cancel({})", id),
        }
    }
}

/// Ordered delivery queue with a single background worker.
///
/// The worker is spawned on the first enqueue, so a queue can be created
/// outside a tokio runtime.
pub struct DeliveryQueue {
    transport: Arc<dyn Transport>,
    backoff: Backoff,
    sender: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    stats: Arc<watch::Sender<QueueStats>>,
}

impl DeliveryQueue {
    pub fn new(transport: Arc<dyn Transport>, backoff: Backoff) -> Self {
        let (stats, _) = watch::channel(QueueStats::default());
        Self {
            transport,
            backoff,
            sender: Mutex::new(None),
            stats: Arc::new(stats),
        }
    }

    /// Append a request to the backlog.
    ///
    /// # Errors
    ///
    /// Returns `XapiError::Runtime` when called outside a tokio runtime.
    pub fn enqueue(&self, request: RequestDescriptor) -> Result<DeliveryHandle> {
        let sender = self.worker_sender()?;

        let (tx, rx) = oneshot::channel();
        let mut entry = QueueEntry::new(request);
        entry.responder = Some(tx);

        let handle = DeliveryHandle {
            id: entry.id,
            operation: entry.request.operation,
            statement_ids: entry.request.statement_ids.clone(),
            receiver: rx,
            commands: sender.clone(),
        };

        debug!(
            entry_id = %entry.id,
            operation = entry.request.operation,
            "Enqueued request"
        );

        self.stats.send_modify(|s| s.pending += 1);
        if sender.send(Command::Enqueue(entry)).is_err() {
            self.stats.send_modify(|s| s.pending = s.pending.saturating_sub(1));
            return Err(XapiError::QueueClosed);
        }

        Ok(handle)
    }

    /// Number of requests not yet resolved.
    pub fn len(&self) -> usize {
        self.stats.borrow().pending
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        self.stats.borrow().clone()
    }

    /// Wait until every queued request has resolved.
    pub async fn drain(&self) {
        let mut rx = self.stats.subscribe();
        let _ = rx.wait_for(|s| s.pending == 0).await;
    }

    fn worker_sender(&self) -> Result<mpsc::UnboundedSender<Command>> {
        let mut guard = match self.sender.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(sender) = guard.as_ref().filter(|s| !s.is_closed()) {
            return Ok(sender.clone());
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| XapiError::Runtime(e.to_string()))?;

        // Anything counted against a worker that is gone will never resolve
        self.stats.send_modify(|s| {
            s.pending = 0;
            s.in_flight = false;
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Worker {
            backlog: VecDeque::new(),
            commands: rx,
            open: true,
            transport: Arc::clone(&self.transport),
            backoff: self.backoff.clone(),
            stats: Arc::clone(&self.stats),
        };
        runtime.spawn(worker.run());
        debug!("Delivery worker started");

        *guard = Some(tx.clone());
        Ok(tx)
    }
}

struct Worker {
    backlog: VecDeque<QueueEntry>,
    commands: mpsc::UnboundedReceiver<Command>,
    /// False once every sender is gone; the backlog is still drained
    open: bool,
    transport: Arc<dyn Transport>,
    backoff: Backoff,
    stats: Arc<watch::Sender<QueueStats>>,
}

impl Worker {
    async fn run(mut self) {
        loop {
            self.absorb_commands();

            let Some(eligible_at) = self.backlog.front().map(|e| e.next_eligible) else {
                if !self.open {
                    break;
                }
                match self.commands.recv().await {
                    Some(command) => self.handle_command(command),
                    None => self.open = false,
                }
                continue;
            };

            if eligible_at > Instant::now() {
                if self.open {
                    let received = tokio::select! {
                        command = self.commands.recv() => Some(command),
                        _ = sleep_until(eligible_at) => None,
                    };
                    match received {
                        Some(Some(command)) => self.handle_command(command),
                        Some(None) => self.open = false,
                        None => {}
                    }
                } else {
                    sleep_until(eligible_at).await;
                }
                continue;
            }

            self.attempt_head().await;
        }
        debug!("Delivery worker stopped");
    }

    fn absorb_commands(&mut self) {
        while self.open {
            match self.commands.try_recv() {
                Ok(command) => self.handle_command(command),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => self.open = false,
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Enqueue(entry) => self.backlog.push_back(entry),
            Command::Cancel(id) => {
                let Some(index) = self.backlog.iter().position(|e| e.id == id) else {
                    return;
                };
                if self.backlog[index].status == EntryStatus::InFlight {
                    debug!(entry_id = %id, "Cancel requested for in-flight request");
                    self.backlog[index].cancel_requested = true;
                } else {
                    info!(entry_id = %id, "Cancelled pending request");
                    self.finish(index, Err(XapiError::Cancelled));
                }
            }
        }
    }

    async fn attempt_head(&mut self) {
        let Some(head) = self.backlog.front_mut() else {
            return;
        };
        head.begin_attempt();
        let request = Arc::clone(&head.request);
        let entry_id = head.id;
        let attempt = head.attempt_count;
        self.stats.send_modify(|s| s.in_flight = true);

        debug!(
            entry_id = %entry_id,
            operation = request.operation,
            attempt = attempt,
            max_attempts = request.max_attempts,
            "Sending request to LRS"
        );

        let outcome = self.transport.execute(&request).await;

        // Cancels that arrived while in flight only flag the entry
        self.absorb_commands();

        let Some(head) = self.backlog.front_mut() else {
            return;
        };
        match head.record_outcome(outcome, &self.backoff, Instant::now()) {
            Step::Delivered(response) => {
                info!(
                    entry_id = %entry_id,
                    operation = request.operation,
                    attempts = attempt,
                    status = response.status,
                    "Request delivered"
                );
                let delivery = Delivery {
                    entry_id,
                    operation: request.operation,
                    attempts: attempt,
                    statement_ids: request.statement_ids.clone(),
                    response,
                };
                self.finish(0, Ok(delivery));
            }
            Step::Retry(_) if head.cancel_requested => {
                info!(entry_id = %entry_id, attempts = attempt, "Cancelled request after failed attempt");
                self.finish(0, Err(XapiError::Cancelled));
            }
            Step::Retry(delay) => {
                warn!(
                    entry_id = %entry_id,
                    operation = request.operation,
                    error = ?head.last_failure,
                    attempt = attempt,
                    max_attempts = request.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Request failed, will retry"
                );
                self.stats.send_modify(|s| {
                    s.in_flight = false;
                    s.retries += 1;
                });
            }
            Step::GiveUp(err) => {
                error!(
                    entry_id = %entry_id,
                    operation = request.operation,
                    error = %err,
                    attempts = attempt,
                    "Request failed permanently"
                );
                self.finish(0, Err(err));
            }
        }
    }

    /// Remove a resolved entry and notify its caller.
    fn finish(&mut self, index: usize, result: Result<Delivery>) {
        let Some(mut entry) = self.backlog.remove(index) else {
            return;
        };

        self.stats.send_modify(|s| {
            s.pending = s.pending.saturating_sub(1);
            if index == 0 {
                s.in_flight = false;
            }
            match &result {
                Ok(_) => s.delivered += 1,
                Err(XapiError::Cancelled) => s.cancelled += 1,
                Err(_) => s.failed += 1,
            }
        });

        if let Some(responder) = entry.responder.take() {
            // The caller may have dropped its handle; delivery still happened
            let _ = responder.send(result);
        }
    }
}
