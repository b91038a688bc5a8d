//! Batch request primitives.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::{timeout, Instant};
use uuid::Uuid;

use crate::errors::{CoreError, Result};

/// Priority levels for batched operations.
///
/// Buckets drain in descending order, so a steady stream of `Urgent` work can
/// starve `Low` — intentionally; callers relying on lower priorities must
/// budget capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum BatchPriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl BatchPriority {
    /// All priorities, highest first — the bucket drain order
    pub const DESCENDING: [BatchPriority; 4] = [
        BatchPriority::Urgent,
        BatchPriority::High,
        BatchPriority::Normal,
        BatchPriority::Low,
    ];

    /// Bucket index for this priority
    pub(crate) fn bucket(self) -> usize {
        match self {
            BatchPriority::Urgent => 0,
            BatchPriority::High => 1,
            BatchPriority::Normal => 2,
            BatchPriority::Low => 3,
        }
    }
}

/// One pending operation owned by the batcher until dispatch
pub(crate) struct PendingRequest<T, R> {
    pub id: Uuid,
    pub payload: T,
    pub priority: BatchPriority,
    pub enqueued_at: Instant,
    pub tx: oneshot::Sender<Result<R>>,
}

/// Completion handle returned by `submit`.
///
/// Awaiting runs under the request's deadline; on expiry the request is
/// abandoned and the dispatcher's eventual result for its slot is dropped.
/// The request is never double-resolved.
#[derive(Debug)]
pub struct CompletionHandle<R> {
    pub(crate) id: Uuid,
    pub(crate) rx: oneshot::Receiver<Result<R>>,
    pub(crate) deadline: Duration,
    pub(crate) timeouts: Arc<AtomicU64>,
}

impl<R> CompletionHandle<R> {
    /// Request id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wait for the result under the request's deadline
    pub async fn await_result(self) -> Result<R> {
        match timeout(self.deadline, self.rx).await {
            Ok(Ok(result)) => result,
            // Sender dropped without resolving: the batcher shut down
            Ok(Err(_)) => Err(CoreError::system("shutdown").with_code("SHUTDOWN")),
            Err(_) => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                Err(CoreError::network("request timed out waiting for batch dispatch")
                    .with_code("BATCH_TIMEOUT")
                    .with_detail("request_id", self.id.to_string()))
            }
        }
    }
}
