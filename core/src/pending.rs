//! Pending handles returned by bridge commands
//!
//! A command is validated synchronously and then answered through a
//! [`PendingHandle`], a future that completes exactly once when the matching
//! hardware event or timeout is processed on the event loop.

use crate::error::BridgeError;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::trace;

/// Create a connected responder/handle pair
pub fn pending<T>() -> (Responder<T>, PendingHandle<T>) {
    let (tx, rx) = oneshot::channel();
    (Responder { tx }, PendingHandle { rx })
}

/// Sending half, owned by the event loop
#[derive(Debug)]
pub struct Responder<T> {
    tx: oneshot::Sender<Result<T, BridgeError>>,
}

impl<T> Responder<T> {
    /// Deliver the terminal outcome. Consumes the responder, so an outcome can
    /// only be delivered once.
    pub fn resolve(self, result: Result<T, BridgeError>) {
        if self.tx.send(result).is_err() {
            trace!("Pending handle dropped before resolution");
        }
    }

    /// Whether the caller still holds the handle
    pub fn is_waiting(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Receiving half, returned to the caller
#[derive(Debug)]
pub struct PendingHandle<T> {
    rx: oneshot::Receiver<Result<T, BridgeError>>,
}

impl<T> PendingHandle<T> {
    /// Non-blocking check for an outcome; `None` while still pending
    pub fn try_result(&mut self) -> Option<Result<T, BridgeError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(BridgeError::Closed)),
        }
    }
}

impl<T> Future for PendingHandle<T> {
    type Output = Result<T, BridgeError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // Responder dropped without an answer: the loop is gone
            Poll::Ready(Err(_)) => Poll::Ready(Err(BridgeError::Closed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready_eq, task};

    #[test]
    fn test_handle_pending_until_resolved() {
        let (responder, handle) = pending::<u32>();
        let mut handle = task::spawn(handle);
        assert_pending!(handle.poll());

        responder.resolve(Ok(7));
        assert!(handle.is_woken());
        assert_ready_eq!(handle.poll(), Ok(7));
    }

    #[test]
    fn test_dropped_responder_reports_closed() {
        let (responder, mut handle) = pending::<()>();
        drop(responder);
        assert_eq!(handle.try_result(), Some(Err(BridgeError::Closed)));
    }

    #[test]
    fn test_try_result_empty() {
        let (responder, mut handle) = pending::<()>();
        assert!(handle.try_result().is_none());
        assert!(responder.is_waiting());
        drop(handle);
    }

    #[test]
    fn test_resolve_after_caller_gone_is_silent() {
        let (responder, handle) = pending::<()>();
        drop(handle);
        assert!(!responder.is_waiting());
        responder.resolve(Err(BridgeError::Closed));
    }
}
