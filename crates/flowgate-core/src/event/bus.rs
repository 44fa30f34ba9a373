//! Broadcast bus for `WorkflowEvent`.
//!
//! Every engine owns one bus. Approval notifiers, dashboards and tests
//! subscribe either to everything or to a single run via [`EventBus::subscribe_run`].

use flowgate_types::event::WorkflowEvent;
use tokio::sync::broadcast::{self, error::RecvError};
use uuid::Uuid;

/// Multi-producer, multi-consumer run event channel.
///
/// Cloning shares the underlying sender.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    /// `capacity` is clamped to at least 1.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }

    /// Receive only the events of `run_id`.
    pub fn subscribe_run(&self, run_id: Uuid) -> RunEvents {
        RunEvents {
            run_id,
            receiver: self.sender.subscribe(),
        }
    }

    /// Dropped silently when nobody listens.
    pub fn publish(&self, event: WorkflowEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Event stream filtered to one run.
pub struct RunEvents {
    run_id: Uuid,
    receiver: broadcast::Receiver<WorkflowEvent>,
}

impl RunEvents {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Next event of this run, or `None` once the bus is gone.
    ///
    /// A lagging receiver skips the overwritten events and keeps going.
    pub async fn next(&mut self) -> Option<WorkflowEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.run_id() == self.run_id => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(run_id = %self.run_id, skipped, "run event subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}
