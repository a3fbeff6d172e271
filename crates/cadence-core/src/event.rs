use crate::types::{FlowId, NodeKind, RunId, TriggerKind};

/// Engine lifecycle event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum FlowEvent {
    /// A run was created and entered its trigger node.
    RunStarted { run_id: RunId, flow_id: FlowId },
    /// A node finished executing.
    NodeExecuted {
        run_id: RunId,
        node_id: String,
        kind: NodeKind,
    },
    /// A run parked itself (wait_reply, long delay, or admin pause).
    RunPaused { run_id: RunId },
    /// A paused run re-entered the execution loop.
    RunResumed { run_id: RunId },
    /// A run reached a node with no outgoing edge.
    RunCompleted { run_id: RunId, flow_id: FlowId },
    /// A node execution raised an error.
    RunFailed {
        run_id: RunId,
        flow_id: FlowId,
        error: String,
    },
    /// A run was administratively cancelled.
    RunCancelled { run_id: RunId },
    /// An external event matched a flow's trigger.
    TriggerMatched { flow_id: FlowId, kind: TriggerKind },
    /// A human_handoff node asked for the conversation to be reassigned.
    HandoffRequested {
        run_id: RunId,
        conversation_id: Option<String>,
        reason: String,
    },
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<FlowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: FlowEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<FlowEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
