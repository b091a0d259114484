//! Readiness waiters.
//!
//! Callers awaiting "connected" park a oneshot receiver here. A flush hands
//! every queued waiter the same result, oldest first, and empties the queue.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::channel::oneshot;

use crate::error::LinkError;

type Waiter = oneshot::Sender<Result<(), LinkError>>;

/// FIFO of pending readiness waiters.
#[derive(Debug, Default)]
pub struct ReadinessQueue {
    waiters: VecDeque<Waiter>,
}

impl ReadinessQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a new waiter.
    pub fn enqueue(&mut self) -> Ready {
        let (tx, rx) = oneshot::channel();
        self.waiters.push_back(tx);
        Ready::waiting(rx)
    }

    /// Resolve every waiter successfully. Returns how many were resolved.
    pub fn flush_ok(&mut self) -> usize {
        self.flush(Ok(()))
    }

    /// Fail every waiter with `error`. Returns how many were resolved.
    pub fn flush_err(&mut self, error: LinkError) -> usize {
        self.flush(Err(error))
    }

    fn flush(&mut self, result: Result<(), LinkError>) -> usize {
        let mut count = 0;
        while let Some(waiter) = self.waiters.pop_front() {
            // A dropped receiver just means the caller stopped waiting
            let _ = waiter.send(result.clone());
            count += 1;
        }
        count
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

/// Future returned by `connect()` and `ready()`.
///
/// Either already resolved at creation time or waiting on the next flush.
#[derive(Debug)]
#[must_use = "futures do nothing unless awaited"]
pub struct Ready {
    inner: ReadyInner,
}

#[derive(Debug)]
enum ReadyInner {
    Done(Option<Result<(), LinkError>>),
    Waiting(oneshot::Receiver<Result<(), LinkError>>),
}

impl Ready {
    pub fn resolved(result: Result<(), LinkError>) -> Self {
        Self {
            inner: ReadyInner::Done(Some(result)),
        }
    }

    fn waiting(rx: oneshot::Receiver<Result<(), LinkError>>) -> Self {
        Self {
            inner: ReadyInner::Waiting(rx),
        }
    }
}

impl Future for Ready {
    type Output = Result<(), LinkError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.inner {
            ReadyInner::Done(result) => {
                Poll::Ready(result.take().unwrap_or(Err(LinkError::Destroyed)))
            }
            // Sender dropped without a flush: the owner went away
            ReadyInner::Waiting(rx) => Pin::new(rx)
                .poll(cx)
                .map(|r| r.unwrap_or(Err(LinkError::Destroyed))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[test]
    fn test_resolved_ready() {
        assert_eq!(Ready::resolved(Ok(())).now_or_never(), Some(Ok(())));
        assert_eq!(
            Ready::resolved(Err(LinkError::NotConnecting)).now_or_never(),
            Some(Err(LinkError::NotConnecting))
        );
    }

    #[test]
    fn test_waiter_pends_until_flush() {
        let mut queue = ReadinessQueue::new();
        let mut ready = queue.enqueue();

        assert!((&mut ready).now_or_never().is_none());
        assert_eq!(queue.flush_ok(), 1);
        assert_eq!(ready.now_or_never(), Some(Ok(())));
    }

    #[test]
    fn test_flush_ok_resolves_all_and_clears() {
        let mut queue = ReadinessQueue::new();
        let waiters: Vec<_> = (0..5).map(|_| queue.enqueue()).collect();
        assert_eq!(queue.len(), 5);

        assert_eq!(queue.flush_ok(), 5);
        assert!(queue.is_empty());

        for ready in waiters {
            assert_eq!(ready.now_or_never(), Some(Ok(())));
        }

        // A second flush has nobody left to resolve
        assert_eq!(queue.flush_err(LinkError::Destroyed), 0);
    }

    #[test]
    fn test_flush_err_delivers_same_error_to_everyone() {
        let mut queue = ReadinessQueue::new();
        let waiters: Vec<_> = (0..3).map(|_| queue.enqueue()).collect();
        let error = LinkError::Rejected { status: 403 };

        assert_eq!(queue.flush_err(error.clone()), 3);

        for ready in waiters {
            assert_eq!(ready.now_or_never(), Some(Err(error.clone())));
        }
    }

    #[test]
    fn test_waiters_enqueued_after_flush_wait_for_next_flush() {
        let mut queue = ReadinessQueue::new();
        let first = queue.enqueue();
        queue.flush_ok();

        let mut second = queue.enqueue();
        assert_eq!(first.now_or_never(), Some(Ok(())));
        assert!((&mut second).now_or_never().is_none());

        queue.flush_err(LinkError::Exhausted { attempts: 2 });
        assert_eq!(
            second.now_or_never(),
            Some(Err(LinkError::Exhausted { attempts: 2 }))
        );
    }

    #[test]
    fn test_dropped_queue_fails_waiters() {
        let mut queue = ReadinessQueue::new();
        let ready = queue.enqueue();
        drop(queue);
        assert_eq!(ready.now_or_never(), Some(Err(LinkError::Destroyed)));
    }

    #[test]
    fn test_abandoned_waiter_does_not_break_flush() {
        let mut queue = ReadinessQueue::new();
        let abandoned = queue.enqueue();
        let kept = queue.enqueue();
        drop(abandoned);

        assert_eq!(queue.flush_ok(), 2);
        assert_eq!(kept.now_or_never(), Some(Ok(())));
    }
}
