use async_trait::async_trait;
use std::fmt;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::orchestration::events::{EngineEvent, EngineEventPublisher};

/// In-process fan-out of engine events. Publishing never blocks on slow
/// subscribers; a lagging receiver observes `RecvError::Lagged` instead.
pub struct InProcEventBus {
    sender: broadcast::Sender<EngineEvent>,
    capacity: usize,
}

impl fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl InProcEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, capacity }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl EngineEventPublisher for InProcEventBus {
    async fn publish(&self, event: EngineEvent) -> Result<()> {
        tracing::trace!(target: "scan::events", payload = ?event.payload, "event");
        let _ = self.sender.send(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::events::EngineEventPayload;
    use vigil_model::{ModuleId, ScanId};

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let bus = InProcEventBus::new(4);
        let event = EngineEvent::new(EngineEventPayload::ScanStarted {
            scan_id: ScanId::new(),
            module_id: ModuleId::new("ping"),
        });
        assert!(bus.publish(event).await.is_ok());
    }

    #[tokio::test]
    async fn subscribers_receive_events_in_order() {
        let bus = InProcEventBus::new(4);
        let mut rx = bus.subscribe();
        let first = ScanId::new();
        let second = ScanId::new();
        for scan_id in [first, second] {
            bus.publish(EngineEvent::new(EngineEventPayload::ScanStarted {
                scan_id,
                module_id: ModuleId::new("ping"),
            }))
            .await
            .unwrap();
        }
        for expected in [first, second] {
            match rx.recv().await.unwrap().payload {
                EngineEventPayload::ScanStarted { scan_id, .. } => assert_eq!(scan_id, expected),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }
}
