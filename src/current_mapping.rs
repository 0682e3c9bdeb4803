//! State of the service's active mapping.
//!
//! [`CurrentMapping`] owns the mapping the service currently holds and the
//! timers derived from its lifetime. It is polled as a stream by the
//! service loop: an [`Event::Renew`] fires at half-lifetime, an
//! [`Event::Expired`] when the granted lifetime ran out without a renewal
//! landing.

use std::{
    future::Future,
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
};

use futures::Stream;
use tokio::{
    sync::watch,
    time::{sleep_until, Instant, Sleep},
};
use tracing::trace;

use crate::mapping::MappedPort;

/// An event in the life of the active mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Event {
    /// Half the lifetime has passed, the mapping should be refreshed.
    Renew {
        /// The mapping due for renewal.
        mapping: MappedPort,
    },
    /// The granted lifetime has passed, the mapping is gone on the gateway.
    Expired {
        /// The mapping that ran out.
        mapping: MappedPort,
    },
}

#[derive(Debug)]
enum DeadlineKind {
    Renew,
    Expire,
}

#[derive(Debug)]
struct Deadline {
    sleep: Pin<Box<Sleep>>,
    kind: DeadlineKind,
}

/// Holds the currently active mapping and notifies watchers of changes to
/// the external address.
#[derive(Debug)]
pub(crate) struct CurrentMapping {
    mapping: Option<MappedPort>,
    address_tx: watch::Sender<Option<SocketAddr>>,
    deadline: Option<Deadline>,
}

impl CurrentMapping {
    pub(crate) fn new() -> (Self, watch::Receiver<Option<SocketAddr>>) {
        let (address_tx, watcher) = watch::channel(None);
        let current = CurrentMapping {
            mapping: None,
            address_tx,
            deadline: None,
        };
        (current, watcher)
    }

    /// Replaces the active mapping, returning the previous one.
    ///
    /// Setting a mapping schedules its renewal at half-lifetime; clearing
    /// cancels the timers. Watchers see the new external address.
    pub(crate) fn update(&mut self, mapping: Option<MappedPort>) -> Option<MappedPort> {
        trace!("new mapping: {mapping:?}");
        let old = std::mem::replace(&mut self.mapping, mapping);
        match &self.mapping {
            Some(mapping) => {
                let renew_at = Instant::now() + mapping.half_lifetime();
                self.deadline = Some(Deadline {
                    sleep: Box::pin(sleep_until(renew_at)),
                    kind: DeadlineKind::Renew,
                });
                self.address_tx.send_if_modified(|addr| {
                    let new = Some(SocketAddr::new(
                        mapping.external_address,
                        mapping.external_port,
                    ));
                    let modified = *addr != new;
                    *addr = new;
                    modified
                });
            }
            None => {
                self.deadline = None;
                self.address_tx.send_if_modified(|addr| {
                    let modified = addr.is_some();
                    *addr = None;
                    modified
                });
            }
        }
        old
    }

    /// The external side of the active mapping.
    pub(crate) fn external(&self) -> Option<&MappedPort> {
        self.mapping.as_ref()
    }
}

impl Stream for CurrentMapping {
    type Item = Event;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(deadline) = this.deadline.as_mut() else {
            return Poll::Pending;
        };
        match deadline.sleep.as_mut().poll(cx) {
            Poll::Ready(()) => {}
            Poll::Pending => return Poll::Pending,
        }
        let kind = std::mem::replace(&mut deadline.kind, DeadlineKind::Expire);
        let mapping = this.mapping.clone().expect("deadline implies a mapping");
        match kind {
            DeadlineKind::Renew => {
                // if the renewal does not land, the remaining half of the
                // lifetime runs out and the mapping expires
                let expire_at = Instant::now() + mapping.half_lifetime();
                this.deadline = Some(Deadline {
                    sleep: Box::pin(sleep_until(expire_at)),
                    kind: DeadlineKind::Expire,
                });
                Poll::Ready(Some(Event::Renew { mapping }))
            }
            DeadlineKind::Expire => {
                this.update(None);
                Poll::Ready(Some(Event::Expired { mapping }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{net::IpAddr, num::NonZeroU16, time::Duration};

    use futures::StreamExt;

    use crate::mapping::{PortType, ProtocolTag};

    use super::*;

    fn mapping(lifetime_seconds: u32) -> MappedPort {
        MappedPort {
            port_type: PortType::Udp,
            internal_port: NonZeroU16::new(5000).unwrap(),
            external_port: 6000,
            external_address: IpAddr::from([203, 0, 113, 1]),
            lifetime_seconds,
            protocol: ProtocolTag::Pcp,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_renew_then_expire() {
        let start = Instant::now();
        let (mut current, watcher) = CurrentMapping::new();
        current.update(Some(mapping(4)));
        assert_eq!(
            *watcher.borrow(),
            Some(SocketAddr::new(IpAddr::from([203, 0, 113, 1]), 6000))
        );

        // renewal due at half-lifetime
        let event = current.next().await.unwrap();
        assert_eq!(event, Event::Renew { mapping: mapping(4) });
        assert!(start.elapsed() >= Duration::from_secs(2));

        // with no renewal landing, the mapping expires at full lifetime
        let event = current.next().await.unwrap();
        assert_eq!(event, Event::Expired { mapping: mapping(4) });
        assert_eq!(*watcher.borrow(), None);
        assert!(current.external().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_cancels_timers() {
        let (mut current, _watcher) = CurrentMapping::new();
        current.update(Some(mapping(4)));
        current.update(None);
        tokio::select! {
            _ = current.next() => panic!("no event expected after clearing"),
            _ = tokio::time::sleep(Duration::from_secs(10)) => {}
        }
    }
}
