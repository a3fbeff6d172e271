use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use cadence_core::error::Result;
use cadence_core::event::{EventBus, FlowEvent};
use cadence_core::traits::FlowStore;
use cadence_core::types::{Flow, FlowId, FlowRun, RunId, TriggerKind};

use crate::engine::FlowEngine;

/// Fans external events out to the flows whose trigger matches.
///
/// Each matched flow starts its own independent run; one flow failing to
/// start is logged and never blocks the others.
pub struct TriggerManager {
    store: Arc<dyn FlowStore>,
    engine: Arc<FlowEngine>,
    events: Arc<EventBus>,
}

impl TriggerManager {
    pub fn new(store: Arc<dyn FlowStore>, engine: Arc<FlowEngine>, events: Arc<EventBus>) -> Self {
        Self {
            store,
            engine,
            events,
        }
    }

    /// Evaluate an external event against all active flows of its trigger
    /// kind and start a run per match. Returns the ids of the started runs.
    pub async fn check_triggers(
        &self,
        kind: TriggerKind,
        data: &HashMap<String, serde_json::Value>,
    ) -> Result<Vec<RunId>> {
        let flows = self.store.list_active_by_trigger(kind).await?;
        debug!(kind = %kind, candidates = flows.len(), "Checking triggers");

        let mut started = Vec::new();
        for flow in flows {
            if !matches_trigger(&flow, data) {
                continue;
            }

            self.events.publish(FlowEvent::TriggerMatched {
                flow_id: flow.id.clone(),
                kind,
            });

            let conversation_id = get_str(data, "conversationId");
            let contact_id = get_str(data, "contactId");

            match self
                .engine
                .start_flow(&flow.id, conversation_id, contact_id, data.clone())
                .await
            {
                Ok(run) => {
                    info!(flow_id = %flow.id, run_id = %run.id, kind = %kind, "Trigger started run");
                    started.push(run.id);
                }
                Err(e) => {
                    // Per-flow isolation: one bad automation must not block
                    // the rest from firing on the same event.
                    warn!(flow_id = %flow.id, error = %e, "Flow failed to start for trigger event");
                }
            }
        }

        Ok(started)
    }

    /// Start one flow directly (dashboard action).
    pub async fn manual_trigger(
        &self,
        flow_id: &FlowId,
        conversation_id: Option<String>,
        contact_id: Option<String>,
        data: HashMap<String, serde_json::Value>,
    ) -> Result<FlowRun> {
        self.engine
            .start_flow(flow_id, conversation_id, contact_id, data)
            .await
    }

    /// Entry point for inbound webhook deliveries.
    pub async fn handle_webhook_trigger(
        &self,
        webhook_id: &str,
        mut payload: HashMap<String, serde_json::Value>,
    ) -> Result<Vec<RunId>> {
        payload.insert(
            "webhookId".to_string(),
            serde_json::Value::String(webhook_id.to_string()),
        );
        self.check_triggers(TriggerKind::Webhook, &payload).await
    }
}

/// Whether an event payload matches a flow's trigger configuration.
///
/// The flow's trigger kind already equals the event kind here; this decides
/// the kind-specific payload match.
fn matches_trigger(flow: &Flow, data: &HashMap<String, serde_json::Value>) -> bool {
    match flow.trigger_kind {
        TriggerKind::Keyword => {
            let message = get_str(data, "message").unwrap_or_default().to_lowercase();
            if message.is_empty() {
                return false;
            }
            flow.trigger_config
                .get("keywords")
                .and_then(|v| v.as_array())
                .is_some_and(|keywords| {
                    keywords
                        .iter()
                        .filter_map(|k| k.as_str())
                        .filter(|k| !k.is_empty())
                        .any(|k| message.contains(&k.to_lowercase()))
                })
        }
        TriggerKind::Webhook => match (
            flow.trigger_config.get("webhookId").and_then(|v| v.as_str()),
            data.get("webhookId").and_then(|v| v.as_str()),
        ) {
            (Some(configured), Some(delivered)) => configured == delivered,
            _ => false,
        },
        // Schedule flows are started by the time-based scheduler, never by
        // the event path.
        TriggerKind::Schedule => false,
        TriggerKind::MessageReceived | TriggerKind::NewContact | TriggerKind::Manual => true,
    }
}

fn get_str(data: &HashMap<String, serde_json::Value>, key: &str) -> Option<String> {
    data.get(key).and_then(|v| v.as_str()).map(str::to_string)
}
