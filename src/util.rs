//! Utilities shared by the actors and mapper drivers in this crate.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use tokio::task::{AbortHandle, JoinHandle};
use tracing::trace;

/// A join handle that owns the task it is running, and aborts it when dropped.
#[derive(Debug)]
pub(crate) struct AbortingJoinHandle<T> {
    handle: JoinHandle<T>,
}

impl<T> AbortingJoinHandle<T> {
    pub(crate) fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl<T> From<JoinHandle<T>> for AbortingJoinHandle<T> {
    fn from(handle: JoinHandle<T>) -> Self {
        AbortingJoinHandle { handle }
    }
}

impl<T> Future for AbortingJoinHandle<T> {
    type Output = std::result::Result<T, tokio::task::JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.handle).poll(cx)
    }
}

impl<T> Drop for AbortingJoinHandle<T> {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Holds an [`AbortHandle`] to a task and aborts the task when dropped.
///
/// Used to tie the lifetime of a spawned actor to the last client handle
/// referencing it.
#[derive(Debug)]
pub(crate) struct CancelOnDrop {
    task_name: &'static str,
    handle: AbortHandle,
}

impl CancelOnDrop {
    pub(crate) fn new(task_name: &'static str, handle: AbortHandle) -> Self {
        CancelOnDrop { task_name, handle }
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.handle.abort();
        trace!("{} cancelled", self.task_name);
    }
}

/// Stays pending while the inner future is `None`, so optional tasks can
/// sit in a `select!` arm.
#[derive(Debug)]
pub(crate) struct MaybeFuture<T> {
    /// Future to be polled.
    pub inner: Option<T>,
}

// hand-written so `T: Default` is not required
impl<T> Default for MaybeFuture<T> {
    fn default() -> Self {
        MaybeFuture { inner: None }
    }
}

impl<T: Future + Unpin> Future for MaybeFuture<T> {
    type Output = T::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.inner {
            Some(ref mut t) => Pin::new(t).poll(cx),
            None => Poll::Pending,
        }
    }
}

/// Retransmission schedule for requests over lossy UDP.
///
/// Follows the retransmission policy of [RFC 6887 section 8.1.1]: an initial
/// timeout that doubles on every miss, capped, with a bounded number of
/// attempts before the gateway is abandoned.
///
/// [RFC 6887 section 8.1.1]: https://datatracker.ietf.org/doc/html/rfc6887#section-8.1.1
#[derive(Debug, Clone)]
pub(crate) struct RetrySchedule {
    next: Duration,
    cap: Duration,
    remaining: usize,
}

impl RetrySchedule {
    pub(crate) fn new(initial: Duration, cap: Duration, attempts: usize) -> Self {
        RetrySchedule {
            next: initial,
            cap,
            remaining: attempts,
        }
    }
}

impl Iterator for RetrySchedule {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let wait = self.next;
        self.next = (self.next * 2).min(self.cap);
        Some(wait)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_schedule_doubles_up_to_cap() {
        let schedule = RetrySchedule::new(
            Duration::from_secs(3),
            Duration::from_secs(1024),
            crate::defaults::MAX_REQUEST_ATTEMPTS,
        );
        let waits: Vec<_> = schedule.collect();
        assert_eq!(waits.len(), crate::defaults::MAX_REQUEST_ATTEMPTS);
        assert_eq!(waits[0], Duration::from_secs(3));
        assert_eq!(waits[1], Duration::from_secs(6));
        assert_eq!(waits[8], Duration::from_secs(768));
    }

    #[test]
    fn retry_schedule_caps() {
        let mut schedule =
            RetrySchedule::new(Duration::from_secs(512), Duration::from_secs(1024), 4);
        assert_eq!(schedule.next(), Some(Duration::from_secs(512)));
        assert_eq!(schedule.next(), Some(Duration::from_secs(1024)));
        assert_eq!(schedule.next(), Some(Duration::from_secs(1024)));
    }
}
