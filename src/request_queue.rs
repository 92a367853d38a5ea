//! The RequestQueue coordinator (§4.E): at-most-one-delivery scheduling
//! over a durable [`crate::storage::RequestQueueClient`], with an
//! in-memory `queueHead`, `inProgress` tracking, forefront insertion, and
//! stall auto-reset.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::errors::QueueError;
use crate::request::{QueueOperationInfo, Request, RequestId};
use crate::storage::RequestQueueClient;

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// `{ startedAt, attempt }` for one in-progress request.
#[derive(Debug, Clone)]
struct InProgressEntry {
    started_at: i64,
    /// Present only when `experiments.requestLocking` is enabled (§9
    /// open question 4): `(lessee, expires_at)`.
    lease: Option<(String, i64)>,
}

#[derive(Debug, Clone, Copy)]
pub struct RequestQueueOptions {
    /// `CRAWLEE_INTERNAL_TIMEOUT`: how long `fetchNextRequest` may return
    /// `null` with a non-empty `inProgress` before the stall auto-reset
    /// sweep clears it.
    pub internal_timeout_millis: i64,
    /// How many requests `refill` pulls from durable storage at once.
    pub batch_size: usize,
    /// §9 open question 4: a stronger leasing mode with conditional
    /// renewal for multi-instance scaling.
    pub request_locking: bool,
    pub lease_duration_millis: i64,
}

impl Default for RequestQueueOptions {
    fn default() -> Self {
        RequestQueueOptions {
            internal_timeout_millis: 30_000,
            batch_size: 100,
            request_locking: false,
            lease_duration_millis: 30_000,
        }
    }
}

struct State {
    queue_head: VecDeque<RequestId>,
    in_progress: HashMap<RequestId, InProgressEntry>,
    /// Consecutive `fetchNextRequest` calls that returned `null` while
    /// `inProgress` was non-empty; reset to 0 on any successful fetch.
    consecutive_null_fetches_since: Option<i64>,
}

/// The durable, deduplicated, ordered collection of [`Request`]s.
pub struct RequestQueue {
    client: Arc<dyn RequestQueueClient>,
    options: RequestQueueOptions,
    state: Mutex<State>,
    instance_id: String,
}

impl RequestQueue {
    pub fn new(client: Arc<dyn RequestQueueClient>, options: RequestQueueOptions) -> Self {
        RequestQueue {
            client,
            options,
            state: Mutex::new(State {
                queue_head: VecDeque::new(),
                in_progress: HashMap::new(),
                consecutive_null_fetches_since: None,
            }),
            instance_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// `addRequest(req, { forefront })`. Deduplicated by `uniqueKey`.
    pub async fn add_request(
        &self,
        request: Request,
        forefront: bool,
    ) -> Result<QueueOperationInfo, QueueError> {
        let info = self.client.add_request(request, forefront).await?;
        if !info.was_already_present && !info.was_already_handled {
            let mut state = self.state.lock().await;
            if forefront {
                state.queue_head.push_front(info.request_id.clone());
            } else {
                state.queue_head.push_back(info.request_id.clone());
            }
        }
        Ok(info)
    }

    /// `addRequests(batch, { forefront })`. Preserves order; returns
    /// per-item results.
    pub async fn add_requests(
        &self,
        requests: Vec<Request>,
        forefront: bool,
    ) -> Result<Vec<QueueOperationInfo>, QueueError> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            results.push(self.add_request(request, forefront).await?);
        }
        Ok(results)
    }

    /// Refills the in-memory `queueHead` from durable storage when it
    /// runs dry.
    async fn refill(&self, state: &mut State) -> Result<(), QueueError> {
        if !state.queue_head.is_empty() {
            return Ok(());
        }
        let batch = self.client.list_head(self.options.batch_size).await?;
        for request in batch {
            if !state.in_progress.contains_key(&request.id) {
                state.queue_head.push_back(request.id);
            }
        }
        Ok(())
    }

    /// Stall detection: when fetches keep returning `null` but
    /// `inProgress` is non-empty beyond `internal_timeout_millis`, clears
    /// `inProgress` and forces a refetch of the head. Recovers from
    /// worker crashes and concurrency-zero deadlocks.
    async fn maybe_auto_reset(&self, state: &mut State) {
        if state.in_progress.is_empty() {
            state.consecutive_null_fetches_since = None;
            return;
        }
        let stalled_since = match state.consecutive_null_fetches_since {
            Some(t) => t,
            None => {
                state.consecutive_null_fetches_since = Some(now_millis());
                return;
            }
        };
        if now_millis() - stalled_since >= self.options.internal_timeout_millis {
            warn!(
                stalled_ids = state.in_progress.len(),
                "request queue stalled; auto-resetting in-progress set"
            );
            state.in_progress.clear();
            state.consecutive_null_fetches_since = None;
        }
    }

    /// `fetchNextRequest()`: next pending request not in `inProgress`;
    /// marks it in-progress; returns `None` when the queue appears empty
    /// (after attempting a refill and the stall auto-reset).
    pub async fn fetch_next_request(&self) -> Result<Option<Request>, QueueError> {
        let mut state = self.state.lock().await;
        self.refill(&mut state).await?;

        while let Some(id) = state.queue_head.pop_front() {
            if state.in_progress.contains_key(&id) {
                continue;
            }
            let Some(request) = self.client.get_request(&id).await? else {
                continue;
            };
            if request.is_handled() {
                continue;
            }
            let lease = if self.options.request_locking {
                Some((
                    self.instance_id.clone(),
                    now_millis() + self.options.lease_duration_millis,
                ))
            } else {
                None
            };
            state.in_progress.insert(
                id,
                InProgressEntry {
                    started_at: now_millis(),
                    lease,
                },
            );
            state.consecutive_null_fetches_since = None;
            return Ok(Some(request));
        }

        self.maybe_auto_reset(&mut state).await;
        Ok(None)
    }

    /// `markRequestHandled(req)`: moves out of `inProgress`, sets
    /// `handledAt`, persists.
    pub async fn mark_request_handled(&self, mut request: Request) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.in_progress.remove(&request.id);
        drop(state);
        request.handled_at = Some(now_millis());
        debug!(request_id = %request.id, "request handled");
        self.client.update_request(request).await
    }

    /// `reclaimRequest(req, { forefront })`: returns to pending (head if
    /// forefront) and clears from `inProgress`. §9 open question 3: a
    /// forefront reclaim pushes to the *front* of `queueHead`, so the most
    /// recently reclaimed forefront request is drained first (LIFO at the
    /// head).
    pub async fn reclaim_request(&self, request: Request, forefront: bool) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.in_progress.remove(&request.id);
        if forefront {
            state.queue_head.push_front(request.id.clone());
        } else {
            state.queue_head.push_back(request.id.clone());
        }
        drop(state);
        self.client.update_request(request).await
    }

    pub async fn is_empty(&self) -> Result<bool, QueueError> {
        let state = self.state.lock().await;
        if !state.queue_head.is_empty() || !state.in_progress.is_empty() {
            return Ok(false);
        }
        drop(state);
        self.client.is_empty().await
    }

    /// `isFinished()`: empty and nothing in flight. Distinct from
    /// `isEmpty` only in name for this in-process queue, since there is no
    /// separate "has more work coming" signal here.
    pub async fn is_finished(&self) -> Result<bool, QueueError> {
        self.is_empty().await
    }

    pub async fn in_progress_count(&self) -> usize {
        self.state.lock().await.in_progress.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStore;

    fn queue() -> RequestQueue {
        RequestQueue::new(InMemoryStore::new(), RequestQueueOptions::default())
    }

    #[tokio::test]
    async fn add_request_is_idempotent_by_unique_key() {
        let q = queue();
        let req = Request::new("https://example.com/a");
        let first = q.add_request(req.clone(), false).await.unwrap();
        let second = q.add_request(req, false).await.unwrap();
        assert_eq!(first.request_id, second.request_id);
        assert!(!first.was_already_present);
        assert!(second.was_already_present);
    }

    #[tokio::test]
    async fn fetch_next_request_returns_in_enqueue_order() {
        let q = queue();
        q.add_request(Request::new("https://example.com/1"), false)
            .await
            .unwrap();
        q.add_request(Request::new("https://example.com/2"), false)
            .await
            .unwrap();
        let r1 = q.fetch_next_request().await.unwrap().unwrap();
        let r2 = q.fetch_next_request().await.unwrap().unwrap();
        assert_eq!(r1.url, "https://example.com/1");
        assert_eq!(r2.url, "https://example.com/2");
    }

    #[tokio::test]
    async fn forefront_insertion_is_dequeued_first() {
        let q = queue();
        q.add_request(Request::new("https://example.com/1"), false)
            .await
            .unwrap();
        q.add_request(Request::new("https://example.com/2"), true)
            .await
            .unwrap();
        let first = q.fetch_next_request().await.unwrap().unwrap();
        assert_eq!(first.url, "https://example.com/2");
    }

    #[tokio::test]
    async fn fetch_next_request_marks_in_progress() {
        let q = queue();
        q.add_request(Request::new("https://example.com/1"), false)
            .await
            .unwrap();
        q.fetch_next_request().await.unwrap();
        assert_eq!(q.in_progress_count().await, 1);
    }

    #[tokio::test]
    async fn mark_request_handled_clears_in_progress_and_sets_handled_at() {
        let q = queue();
        q.add_request(Request::new("https://example.com/1"), false)
            .await
            .unwrap();
        let req = q.fetch_next_request().await.unwrap().unwrap();
        q.mark_request_handled(req.clone()).await.unwrap();
        assert_eq!(q.in_progress_count().await, 0);
        assert!(q.is_finished().await.unwrap());
    }

    #[tokio::test]
    async fn marking_handled_twice_is_a_noop() {
        let q = queue();
        q.add_request(Request::new("https://example.com/1"), false)
            .await
            .unwrap();
        let req = q.fetch_next_request().await.unwrap().unwrap();
        q.mark_request_handled(req.clone()).await.unwrap();
        q.mark_request_handled(req).await.unwrap();
        assert!(q.is_finished().await.unwrap());
    }

    #[tokio::test]
    async fn reclaim_request_returns_to_pending() {
        let q = queue();
        q.add_request(Request::new("https://example.com/1"), false)
            .await
            .unwrap();
        let req = q.fetch_next_request().await.unwrap().unwrap();
        q.reclaim_request(req, false).await.unwrap();
        assert_eq!(q.in_progress_count().await, 0);
        assert!(!q.is_finished().await.unwrap());
        let refetched = q.fetch_next_request().await.unwrap();
        assert!(refetched.is_some());
    }

    #[tokio::test]
    async fn reclaim_forefront_is_drained_before_older_forefront_entries() {
        let q = queue();
        q.add_request(Request::new("https://example.com/1"), false)
            .await
            .unwrap();
        q.add_request(Request::new("https://example.com/2"), true)
            .await
            .unwrap();
        let req1 = q.fetch_next_request().await.unwrap().unwrap(); // "/2" (forefront)
        assert_eq!(req1.url, "https://example.com/2");
        q.reclaim_request(req1.clone(), true).await.unwrap();
        let next = q.fetch_next_request().await.unwrap().unwrap();
        assert_eq!(next.url, "https://example.com/2");
    }

    #[tokio::test]
    async fn is_empty_false_while_in_progress() {
        let q = queue();
        q.add_request(Request::new("https://example.com/1"), false)
            .await
            .unwrap();
        q.fetch_next_request().await.unwrap();
        assert!(!q.is_empty().await.unwrap());
    }

    /// S5 — stall recovery: an id is stranded in `inProgress` with no
    /// corresponding worker; after `internal_timeout_millis` the auto-reset
    /// sweep clears it and the request becomes fetchable again.
    #[tokio::test]
    async fn stall_auto_reset_clears_stale_in_progress_entries() {
        let q = RequestQueue::new(
            InMemoryStore::new(),
            RequestQueueOptions {
                internal_timeout_millis: 10,
                ..Default::default()
            },
        );
        q.add_request(Request::new("https://example.com/1"), false)
            .await
            .unwrap();
        let req = q.fetch_next_request().await.unwrap().unwrap();
        // Simulate a crashed worker: the entry is stuck in `inProgress`
        // and nothing ever calls mark_request_handled/reclaim_request.
        let _ = req;
        assert_eq!(q.in_progress_count().await, 1);

        // First null fetch (queue head empty, nothing handled) starts the
        // stall clock; wait past the timeout, then the second null fetch
        // should trigger the reset.
        assert!(q.fetch_next_request().await.unwrap().is_none());
        tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
        assert!(q.fetch_next_request().await.unwrap().is_none());
        assert_eq!(q.in_progress_count().await, 0);
    }
}
