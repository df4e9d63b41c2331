//! Per-call context
//!
//! The server creates one [`CallContext`] for every call it accepts. It carries
//! the metadata sent by the client, the address of the peer if the transport
//! knows it, the deadline of the call and its cancellation state.
use std::{error, fmt, sync::Arc, time::Duration};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    metadata::Metadata,
    status::{Classify, Code},
    transport::RemoteAddr,
};

/// Context of a single call
#[derive(Debug, Clone)]
pub struct CallContext {
    metadata: Arc<Metadata>,
    peer: Option<RemoteAddr>,
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl CallContext {
    /// Create a new context that is cancelled only by its deadline or by [`CallContext::cancel`].
    pub fn new(metadata: Metadata, peer: Option<RemoteAddr>, deadline: Option<Instant>) -> Self {
        Self {
            metadata: Arc::new(metadata),
            peer,
            deadline,
            cancel: CancellationToken::new(),
        }
    }

    /// Replace the cancellation token, e.g. with a child token of a server wide token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Metadata sent by the client
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Address of the peer, if known
    pub fn peer(&self) -> Option<&RemoteAddr> {
        self.peer.as_ref()
    }

    /// Deadline of the call, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline. `Some(Duration::ZERO)` once it has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Cancel the call
    pub fn cancel(&self) {
        self.cancel.cancel()
    }

    /// The error the call has ended with, or `None` if it is still live.
    pub fn err(&self) -> Option<ContextError> {
        if self.cancel.is_cancelled() {
            Some(ContextError::Cancelled)
        } else if self.remaining() == Some(Duration::ZERO) {
            Some(ContextError::DeadlineExceeded)
        } else {
            None
        }
    }

    /// Wait until the deadline passes or the call is cancelled.
    ///
    /// Never completes for a call without deadline that is not cancelled.
    pub async fn done(&self) -> ContextError {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => ContextError::DeadlineExceeded,
                    _ = self.cancel.cancelled() => ContextError::Cancelled,
                }
            }
            None => {
                self.cancel.cancelled().await;
                ContextError::Cancelled
            }
        }
    }
}

/// Why a call context is done
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextError {
    /// The deadline of the call has passed
    DeadlineExceeded,
    /// The call was cancelled
    Cancelled,
}

impl fmt::Display for ContextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextError::DeadlineExceeded => write!(f, "context deadline exceeded"),
            ContextError::Cancelled => write!(f, "context canceled"),
        }
    }
}

impl error::Error for ContextError {}

impl Classify for ContextError {
    fn code(&self) -> Code {
        match self {
            ContextError::DeadlineExceeded => Code::DeadlineExceeded,
            ContextError::Cancelled => Code::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn deadline_expires() {
        let ctx = CallContext::new(
            Metadata::new(),
            None,
            Some(Instant::now() + Duration::from_secs(1)),
        );
        assert_eq!(ctx.err(), None);
        assert_eq!(ctx.done().await, ContextError::DeadlineExceeded);
        assert_eq!(ctx.remaining(), Some(Duration::ZERO));
        assert_eq!(ctx.err(), Some(ContextError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn parent_cancellation_reaches_call() {
        let parent = CancellationToken::new();
        let ctx = CallContext::new(Metadata::new(), None, None).with_cancellation(parent.child_token());
        let waiter = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.done().await })
        };
        parent.cancel();
        assert_eq!(waiter.await.unwrap(), ContextError::Cancelled);
        assert_eq!(ctx.err(), Some(ContextError::Cancelled));
        assert_eq!(ctx.err().unwrap().code(), Code::Cancelled);
    }
}
