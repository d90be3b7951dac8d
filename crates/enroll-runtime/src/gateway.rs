//! Pump from a session subscription to a remote observer.

use async_trait::async_trait;
use enroll_core::events::Event;
use enroll_core::ids::SessionId;
use thiserror::Error;
use tracing::debug;

use crate::bus::EventBus;
use crate::errors::RuntimeError;

/// Failure pushing to a remote observer. Local to that observer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The observer went away.
    #[error("observer disconnected: {0}")]
    Disconnected(String),
}

/// One remote observer's outbound side.
#[async_trait]
pub trait TransportGateway: Send {
    /// Deliver one event.
    async fn push(&mut self, event: &Event) -> Result<(), TransportError>;
}

/// Why [`forward`] returned. Both carry the last delivered sequence number
/// so the observer can resume from it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForwardEnd {
    /// The session was destroyed.
    TopicClosed {
        /// Last delivered sequence number.
        last_seq: u64,
    },
    /// The gateway reported a disconnect.
    Disconnected {
        /// Last delivered sequence number.
        last_seq: u64,
    },
}

/// Push every event after `after_seq` through `gateway` until the topic
/// closes or the gateway disconnects.
pub async fn forward<G>(
    bus: &EventBus,
    session_id: &SessionId,
    after_seq: u64,
    gateway: &mut G,
) -> Result<ForwardEnd, RuntimeError>
where
    G: TransportGateway + ?Sized,
{
    let mut subscription = bus.subscribe(session_id, after_seq)?;
    let mut last_seq = after_seq;

    while let Some(event) = subscription.next().await {
        if let Err(e) = gateway.push(&event).await {
            debug!(session_id = %session_id, last_seq, error = %e, "gateway disconnected");
            return Ok(ForwardEnd::Disconnected { last_seq });
        }
        last_seq = event.seq;
    }
    Ok(ForwardEnd::TopicClosed { last_seq })
}

#[cfg(test)]
mod tests {
    use super::*;
    use enroll_core::events::{EventDraft, EventKind};

    struct Recorder {
        seen: Vec<u64>,
        fail_after: Option<usize>,
    }

    #[async_trait]
    impl TransportGateway for Recorder {
        async fn push(&mut self, event: &Event) -> Result<(), TransportError> {
            if self.fail_after.is_some_and(|n| self.seen.len() >= n) {
                return Err(TransportError::Disconnected("socket closed".into()));
            }
            self.seen.push(event.seq);
            Ok(())
        }
    }

    fn publish_n(bus: &EventBus, id: &SessionId, n: usize) {
        for _ in 0..n {
            let _ = bus.publish(id, EventDraft::info(EventKind::AttemptStarted, "attempt"));
        }
    }

    #[tokio::test]
    async fn disconnect_reports_last_delivered() {
        let bus = EventBus::new(100, 100);
        let id = SessionId::new();
        bus.open(&id);
        publish_n(&bus, &id, 5);

        let mut observer = Recorder {
            seen: vec![],
            fail_after: Some(3),
        };
        let end = forward(&bus, &id, 0, &mut observer).await.unwrap();
        assert_eq!(end, ForwardEnd::Disconnected { last_seq: 3 });
        assert_eq!(observer.seen, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn closed_topic_rejects_forward() {
        let bus = EventBus::new(100, 100);
        let id = SessionId::new();
        bus.open(&id);
        bus.close(&id);
        let mut observer = Recorder {
            seen: vec![],
            fail_after: None,
        };
        assert!(matches!(
            forward(&bus, &id, 0, &mut observer).await,
            Err(RuntimeError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn forwards_until_topic_closes() {
        let bus = EventBus::new(100, 100);
        let id = SessionId::new();
        bus.open(&id);
        publish_n(&bus, &id, 4);

        let mut first = Recorder {
            seen: vec![],
            fail_after: Some(2),
        };
        let end = forward(&bus, &id, 0, &mut first).await.unwrap();
        assert_eq!(end, ForwardEnd::Disconnected { last_seq: 2 });

        let mut second = Recorder {
            seen: vec![],
            fail_after: None,
        };
        let pump = forward(&bus, &id, 2, &mut second);
        let closer = async {
            tokio::task::yield_now().await;
            publish_n(&bus, &id, 1);
            bus.close(&id);
        };
        let (end, ()) = tokio::join!(pump, closer);
        assert_eq!(end.unwrap(), ForwardEnd::TopicClosed { last_seq: 5 });
        assert_eq!(second.seen, vec![3, 4, 5]);
    }
}
