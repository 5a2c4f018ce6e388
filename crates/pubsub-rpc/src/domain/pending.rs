//! Correlation table - binds each outstanding request to its waiter.
//!
//! Flow:
//! 1. `send` calls `reserve()` to get a fresh correlation id and a waiter
//! 2. `send` publishes the request carrying that id
//! 3. The response listener calls `complete()` from the subscriber task
//! 4. `send` awaits the waiter (optionally bounded) and finally `release()`s the id
//!
//! The waiter's sender is taken out of the record on first completion, so a
//! record is completed at most once. Map shard guards are never held across
//! a publish or a wait.

use crate::domain::correlation::CorrelationId;
use crate::error::{ChannelError, MessageError};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// Outcome of an RPC as reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageStatus {
    Success,
    Error,
    NotSubscribersChannel,
}

/// Result of one `send`.
#[derive(Debug)]
pub struct RpcResponse<T> {
    pub status: MessageStatus,
    pub response: Option<T>,
    pub error: Option<MessageError>,
}

impl<T> RpcResponse<T> {
    pub fn success(response: T) -> Self {
        Self {
            status: MessageStatus::Success,
            response: Some(response),
            error: None,
        }
    }

    pub fn error(error: MessageError) -> Self {
        Self {
            status: MessageStatus::Error,
            response: None,
            error: Some(error),
        }
    }

    pub fn not_subscribers() -> Self {
        Self {
            status: MessageStatus::NotSubscribersChannel,
            response: None,
            error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == MessageStatus::Success
    }
}

/// A settled response as seen by the waiter.
#[derive(Debug)]
pub enum Completion<T> {
    Success(T),
    Error(MessageError),
}

impl<T> From<Completion<T>> for RpcResponse<T> {
    fn from(completion: Completion<T>) -> Self {
        match completion {
            Completion::Success(response) => Self::success(response),
            Completion::Error(error) => Self::error(error),
        }
    }
}

/// What the subscriber task hands to a waiter: a completion, or an
/// exceptional failure (empty response, undecodable payload).
pub type Outcome<T> = Result<Completion<T>, ChannelError>;

/// Single-shot receiving half of a pending record.
pub type Waiter<T> = oneshot::Receiver<Outcome<T>>;

/// A pending record waiting for its response
struct PendingRecord<T> {
    /// Taken on first completion
    waiter: Option<oneshot::Sender<Outcome<T>>>,
    /// When the id was reserved
    reserved_at: Instant,
}

/// Statistics for the correlation table
#[derive(Debug, Default)]
pub struct TableStats {
    /// Total ids reserved
    pub total_reserved: AtomicU64,
    /// Total records completed (first completion only)
    pub total_completed: AtomicU64,
    /// Total records released
    pub total_released: AtomicU64,
    /// Completions for ids that were not (or no longer) pending
    pub total_orphaned: AtomicU64,
}

/// Sender-local mapping from correlation id to pending record.
pub struct CorrelationTable<T> {
    pending: DashMap<CorrelationId, PendingRecord<T>>,
    stats: TableStats,
}

impl<T: Send + 'static> CorrelationTable<T> {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
            stats: TableStats::default(),
        }
    }

    /// Insert a fresh record under a new unique id.
    ///
    /// Regenerates the id on collision; the vacancy check and the insert are
    /// one atomic step on the owning shard.
    pub fn reserve(&self) -> (CorrelationId, Waiter<T>) {
        let (tx, rx) = oneshot::channel();
        let record = PendingRecord {
            waiter: Some(tx),
            reserved_at: Instant::now(),
        };

        loop {
            let correlation_id = CorrelationId::new();
            match self.pending.entry(correlation_id) {
                Entry::Occupied(_) => {
                    debug!(
                        correlation_id = %correlation_id,
                        "Correlation id collision, regenerating"
                    );
                }
                Entry::Vacant(slot) => {
                    slot.insert(record);
                    self.stats.total_reserved.fetch_add(1, Ordering::Relaxed);
                    trace!(correlation_id = %correlation_id, "Reserved correlation id");
                    return (correlation_id, rx);
                }
            }
        }
    }

    /// Settle the record for `correlation_id`.
    ///
    /// Returns true only for the first completion of a pending id. Unknown,
    /// released or already completed ids are a no-op.
    pub fn complete(&self, correlation_id: CorrelationId, outcome: Outcome<T>) -> bool {
        let taken = match self.pending.get_mut(&correlation_id) {
            Some(mut record) => record
                .waiter
                .take()
                .map(|waiter| (waiter, record.reserved_at.elapsed())),
            None => {
                self.note_orphan(correlation_id);
                return false;
            }
        };

        let Some((waiter, elapsed)) = taken else {
            debug!(correlation_id = %correlation_id, "Duplicate completion ignored");
            return false;
        };

        self.stats.total_completed.fetch_add(1, Ordering::Relaxed);
        if waiter.send(outcome).is_err() {
            // Caller stopped waiting (local timeout or cancelled send)
            debug!(correlation_id = %correlation_id, "Waiter gone before completion");
        } else {
            trace!(
                correlation_id = %correlation_id,
                response_time_ms = elapsed.as_millis() as u64,
                "Completed pending record"
            );
        }
        true
    }

    /// Count a response whose id is unknown or already released.
    pub fn note_orphan(&self, correlation_id: CorrelationId) {
        self.stats.total_orphaned.fetch_add(1, Ordering::Relaxed);
        debug!(
            correlation_id = %correlation_id,
            "Response for unknown or released correlation id"
        );
    }

    /// Remove the record unconditionally.
    pub fn release(&self, correlation_id: CorrelationId) -> bool {
        let removed = self.pending.remove(&correlation_id).is_some();
        if removed {
            self.stats.total_released.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Fail every waiter still pending with `ChannelError::Shutdown`.
    ///
    /// Records stay in the table; their senders release them as usual.
    pub fn abort_pending(&self) -> usize {
        self.abort_pending_with(|| ChannelError::Shutdown)
    }

    /// Fail every waiter still pending with the error built by `reason`.
    pub fn abort_pending_with(&self, reason: impl Fn() -> ChannelError) -> usize {
        let mut aborted = 0;
        for mut record in self.pending.iter_mut() {
            if let Some(waiter) = record.waiter.take() {
                let _ = waiter.send(Err(reason()));
                aborted += 1;
            }
        }
        if aborted > 0 {
            debug!(aborted, "Aborted pending records");
        }
        aborted
    }

    /// Check if a correlation id is pending
    pub fn is_pending(&self, correlation_id: &CorrelationId) -> bool {
        self.pending.contains_key(correlation_id)
    }

    /// Number of records currently held
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> &TableStats {
        &self.stats
    }
}

impl<T: Send + 'static> Default for CorrelationTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Releases a reserved id when dropped, covering every exit path of `send`
/// including cancellation of the `send` future itself.
pub(crate) struct ReleaseGuard<'a, T: Send + 'static> {
    table: &'a CorrelationTable<T>,
    correlation_id: CorrelationId,
}

impl<'a, T: Send + 'static> ReleaseGuard<'a, T> {
    pub(crate) fn new(table: &'a CorrelationTable<T>, correlation_id: CorrelationId) -> Self {
        Self {
            table,
            correlation_id,
        }
    }
}

impl<T: Send + 'static> Drop for ReleaseGuard<'_, T> {
    fn drop(&mut self) {
        self.table.release(self.correlation_id);
    }
}
