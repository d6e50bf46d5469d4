use std::{collections::VecDeque, fmt, sync::Arc};

use proto::Status;
use rustc_hash::FxHashSet;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::trace;

use crate::mutex::Mutex;

/// Application-chosen identifier of an asynchronous operation
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Tag(pub u64);

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tag {}", self.0)
    }
}

/// Completion of one tagged operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Tag the operation was started with
    pub tag: Tag,
    /// Whether the operation itself succeeded
    ///
    /// A call that ran to completion succeeds even if its status is not OK.
    pub success: bool,
    /// Final status, for call operations
    pub status: Option<Status>,
}

/// Queue through which asynchronous operations report completion
///
/// Every tag handed to [`begin`](Self::begin) is delivered exactly once. Clones refer to the
/// same queue.
#[derive(Clone)]
pub struct CompletionQueue(Arc<Shared>);

struct Shared {
    state: Mutex<QueueState>,
    notify: Notify,
}

#[derive(Default)]
struct QueueState {
    outstanding: FxHashSet<Tag>,
    ready: VecDeque<Event>,
    shutdown: bool,
}

impl CompletionQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self(Arc::new(Shared {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }))
    }

    /// Reserve `tag` for an operation that is about to start
    ///
    /// The returned guard must be used to report the outcome; dropping it reports failure.
    pub fn begin(&self, tag: Tag) -> Result<Completion, CompletionError> {
        let mut state = self.0.state.lock("begin");
        if state.shutdown {
            return Err(CompletionError::Shutdown);
        }
        if !state.outstanding.insert(tag) {
            return Err(CompletionError::TagInUse(tag));
        }
        Ok(Completion {
            queue: self.clone(),
            tag,
            delivered: false,
        })
    }

    /// Wait for the next event
    ///
    /// Returns `None` once the queue is shut down and every outstanding tag was delivered.
    pub async fn next(&self) -> Option<Event> {
        loop {
            let notified = self.0.notify.notified();
            {
                let mut state = self.0.state.lock("next");
                if let Some(event) = state.ready.pop_front() {
                    return Some(event);
                }
                if state.shutdown && state.outstanding.is_empty() {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Refuse new tags; [`next`](Self::next) ends after draining outstanding ones
    pub fn shutdown(&self) {
        self.0.state.lock("shutdown").shutdown = true;
        self.0.notify.notify_waiters();
    }

    fn deliver(&self, event: Event) {
        {
            let mut state = self.0.state.lock("deliver");
            state.outstanding.remove(&event.tag);
            trace!(tag = event.tag.0, success = event.success, "completion");
            state.ready.push_back(event);
        }
        self.0.notify.notify_one();
        // Consumers waiting for shutdown to finish must see the last delivery
        self.0.notify.notify_waiters();
    }
}

impl Default for CompletionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CompletionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.0.state.lock("debug");
        f.debug_struct("CompletionQueue")
            .field("outstanding", &state.outstanding.len())
            .field("ready", &state.ready.len())
            .field("shutdown", &state.shutdown)
            .finish()
    }
}

/// Obligation to deliver the event for one tag
#[must_use = "dropping a completion reports the operation as failed"]
pub struct Completion {
    queue: CompletionQueue,
    tag: Tag,
    delivered: bool,
}

impl Completion {
    /// Deliver the outcome
    pub fn complete(mut self, success: bool, status: Option<Status>) {
        self.deliver(success, status);
    }

    /// Tag being completed
    pub fn tag(&self) -> Tag {
        self.tag
    }

    fn deliver(&mut self, success: bool, status: Option<Status>) {
        if self.delivered {
            return;
        }
        self.delivered = true;
        self.queue.deliver(Event {
            tag: self.tag,
            success,
            status,
        });
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.deliver(false, None);
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion").field("tag", &self.tag).finish()
    }
}

/// Errors starting a tagged operation
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CompletionError {
    /// The tag already belongs to an operation that has not completed
    #[error("{0} is already in use")]
    TagInUse(Tag),
    /// The queue has been shut down
    #[error("completion queue is shut down")]
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_each_tag_once() {
        let cq = CompletionQueue::new();
        let a = cq.begin(Tag(1)).unwrap();
        assert_eq!(
            cq.begin(Tag(1)).unwrap_err(),
            CompletionError::TagInUse(Tag(1))
        );
        let b = cq.begin(Tag(2)).unwrap();
        b.complete(true, Some(Status::ok()));
        drop(a);
        let first = cq.next().await.unwrap();
        assert_eq!(first.tag, Tag(2));
        assert!(first.success);
        let second = cq.next().await.unwrap();
        assert_eq!(
            second,
            Event {
                tag: Tag(1),
                success: false,
                status: None
            }
        );
        // Delivered tags may be reused
        cq.begin(Tag(1)).unwrap().complete(true, None);
        assert_eq!(cq.next().await.unwrap().tag, Tag(1));
    }

    #[tokio::test]
    async fn shutdown_drains_outstanding() {
        let cq = CompletionQueue::new();
        let pending = cq.begin(Tag(7)).unwrap();
        cq.shutdown();
        assert_eq!(cq.begin(Tag(8)).unwrap_err(), CompletionError::Shutdown);
        let consumer = {
            let cq = cq.clone();
            tokio::spawn(async move {
                let mut tags = Vec::new();
                while let Some(event) = cq.next().await {
                    tags.push(event.tag);
                }
                tags
            })
        };
        tokio::task::yield_now().await;
        pending.complete(true, None);
        assert_eq!(consumer.await.unwrap(), [Tag(7)]);
    }
}
