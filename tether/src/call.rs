use std::{fmt, future, mem, sync::Arc};

use proto::{ErrorCode, PropagationMask, Reservation, Status, StreamId, TraceContext};
use thiserror::Error;
use tokio::{
    sync::oneshot,
    time::{sleep_until, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, trace, Instrument};

use crate::{
    channel::ChannelInner,
    completion::{Completion, CompletionError, CompletionQueue, Tag},
    connection::{ConnectionRef, Request},
    server::ServerCall,
};

/// Connections tried for one call before it fails
///
/// A connection can be lost between being picked and carrying the call's stream; one retry
/// lets the call move to its replacement.
const PICK_ATTEMPTS: usize = 2;

/// One RPC created from a [`Channel`](crate::Channel)
///
/// Created inert; [`start`](Self::start) dispatches it, after which exactly one event for the
/// given tag is delivered on the call's completion queue, carrying the final [`Status`].
///
/// Dropping a call that has not finished cancels it.
pub struct Call {
    channel: Arc<ChannelInner>,
    cq: CompletionQueue,
    method: Arc<str>,
    authority: Option<Arc<str>>,
    deadline: Option<Instant>,
    trace: TraceContext,
    cancel: CancellationToken,
    reservation: Option<Reservation>,
    started: bool,
}

impl Call {
    pub(crate) fn new(
        channel: Arc<ChannelInner>,
        parent: Option<&ServerCall>,
        mask: PropagationMask,
        cq: CompletionQueue,
        method: Arc<str>,
        authority: Option<Arc<str>>,
        mut deadline: Option<Instant>,
    ) -> Self {
        let mut rng = rand::thread_rng();
        let mut trace = None;
        let mut cancel = None;
        if let Some(parent) = parent {
            if mask.contains(PropagationMask::DEADLINE) {
                deadline = match (deadline, parent.deadline()) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
            }
            if mask.contains(PropagationMask::CANCELLATION) {
                cancel = Some(parent.cancel_token().child_token());
            }
            if mask.contains(PropagationMask::CENSUS_TRACING) {
                trace = parent.trace().map(|x| x.child(&mut rng));
            }
            // CENSUS_STATS has no collector to forward to
        }
        let reservation = channel.allocator.reserve(channel.call_size.get());
        Self {
            cq,
            method,
            authority,
            deadline,
            trace: trace.unwrap_or_else(|| TraceContext::root(&mut rng)),
            cancel: cancel.unwrap_or_else(CancellationToken::new),
            reservation: Some(reservation),
            started: false,
            channel,
        }
    }

    /// Dispatch the call, reporting its outcome under `tag`
    ///
    /// Must be called within a tokio runtime. Fails without side effects if the call was
    /// already started or `tag` cannot be used.
    pub fn start(&mut self, tag: Tag) -> Result<(), CallError> {
        if self.started {
            return Err(CallError::AlreadyStarted);
        }
        let completion = self.cq.begin(tag)?;
        self.started = true;
        let task = CallTask {
            channel: self.channel.clone(),
            method: self.method.clone(),
            authority: self.authority.clone(),
            deadline: self.deadline,
            trace: self.trace,
            cancel: self.cancel.clone(),
            _reservation: self.reservation.take(),
        };
        let span = info_span!("call", method = %self.method, tag = completion.tag().0);
        tokio::spawn(task.run(completion).instrument(span));
        Ok(())
    }

    /// Abandon the call
    ///
    /// A started call finishes with `CANCELLED` unless it already finished.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Method path
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Authority override
    pub fn authority(&self) -> Option<&str> {
        self.authority.as_deref()
    }

    /// Effective deadline, after propagation from the parent
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Trace membership sent with the call
    pub fn trace(&self) -> &TraceContext {
        &self.trace
    }

    /// Whether the call was cancelled, directly or through its parent
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for Call {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("target", &self.channel.target())
            .field("method", &self.method)
            .field("authority", &self.authority)
            .field("deadline", &self.deadline)
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}

struct CallTask {
    channel: Arc<ChannelInner>,
    method: Arc<str>,
    authority: Option<Arc<str>>,
    deadline: Option<Instant>,
    trace: TraceContext,
    cancel: CancellationToken,
    /// Released when the call finishes
    _reservation: Option<Reservation>,
}

impl CallTask {
    async fn run(self, completion: Completion) {
        self.channel.channelz.record_call_started(crate::now());
        let status = self.exchange().await;
        debug!(%status, "call finished");
        if status.is_ok() {
            self.channel.channelz.record_call_succeeded();
        } else {
            self.channel.channelz.record_call_failed();
        }
        self.channel.call_size.update(self.footprint());
        completion.complete(true, Some(status));
    }

    async fn exchange(&self) -> Status {
        let deadline = async {
            match self.deadline {
                Some(x) => sleep_until(x).await,
                None => future::pending().await,
            }
        };
        tokio::pin!(deadline);

        let (conn, stream, done) = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Status::cancelled("call cancelled"),
            _ = &mut deadline => return Status::deadline_exceeded(),
            x = self.open() => match x {
                Ok(x) => x,
                Err(status) => return status,
            },
        };
        trace!(stream = stream.0, conn = conn.id(), "stream open");

        tokio::select! {
            biased;
            x = done => x.unwrap_or_else(|_| Status::unavailable("stream abandoned by connection")),
            _ = &mut deadline => {
                conn.cancel_stream(stream, ErrorCode::CANCEL);
                Status::deadline_exceeded()
            }
            _ = self.cancel.cancelled() => {
                conn.cancel_stream(stream, ErrorCode::CANCEL);
                Status::cancelled("call cancelled")
            }
        }
    }

    /// Open the call's stream on a connection picked by the channel
    async fn open(&self) -> Result<(ConnectionRef, StreamId, oneshot::Receiver<Status>), Status> {
        let mut attempt = 1;
        loop {
            let conn = self.channel.pick().await?;
            let request = Request {
                path: self.method.clone(),
                authority: self.authority.clone(),
                deadline: self.deadline.map(Instant::into_std),
                trace: Some(self.trace),
            };
            match conn.open_stream(request) {
                Ok((stream, done)) => return Ok((conn, stream, done)),
                Err(e) if attempt < PICK_ATTEMPTS => {
                    debug!(error = %e, attempt, "picked connection is gone, retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Memory attributed to this call, for the channel's estimate
    fn footprint(&self) -> usize {
        mem::size_of::<Self>() + self.method.len() + self.authority.as_ref().map_or(0, |x| x.len())
    }
}

/// Errors starting a [`Call`]
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CallError {
    /// [`Call::start`] was already called
    #[error("call already started")]
    AlreadyStarted,
    /// The completion tag could not be reserved
    #[error(transparent)]
    Completion(#[from] CompletionError),
}
