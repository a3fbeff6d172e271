use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use cadence_core::config::EngineConfig;
use cadence_core::context::RunContext;
use cadence_core::error::{FlowError, Result};
use cadence_core::event::{EventBus, FlowEvent};
use cadence_core::traits::{
    AgentInvoker, Clock, ContactTagger, FlowStore, HttpFetcher, MessageSender, StatusChange,
};
use cadence_core::types::{
    Flow, FlowEdge, FlowId, FlowNode, FlowRun, HttpOutcome, RunId, RunOutcome, RunStatus,
};

use crate::condition::ConditionEvaluator;
use crate::node::NodeAction;

/// The side-effect capabilities a node executor may call.
///
/// All four are injected as trait objects so the engine's dependencies are
/// total and type-checked; there are no optional callbacks to probe at
/// runtime.
#[derive(Clone)]
pub struct Capabilities {
    pub messages: Arc<dyn MessageSender>,
    pub agents: Arc<dyn AgentInvoker>,
    pub contacts: Arc<dyn ContactTagger>,
    pub http: Arc<dyn HttpFetcher>,
}

/// What a single node execution asks the loop to do next.
#[derive(Debug, Default)]
struct NodeOutcome {
    /// Output handle for branching nodes (`yes`/`no`, `open`/`closed`).
    handle: Option<&'static str>,
    /// Suspension request, if any.
    pause: Option<Pause>,
}

#[derive(Debug)]
enum Pause {
    /// Wait indefinitely for an inbound reply event.
    WaitReply,
    /// Park until the scheduler wakes the run at or after this time.
    Until(chrono::DateTime<chrono::Utc>),
}

/// Interprets a flow graph as a per-run state machine.
///
/// Each run walks the graph strictly sequentially: position and context are
/// persisted before a node's side effect is attempted, so a crash leaves
/// the run re-enterable at the next node without re-sending the current
/// node's effect. Side effects are therefore at-most-once per node across
/// crashes, not exactly-once.
pub struct FlowEngine {
    store: Arc<dyn FlowStore>,
    caps: Capabilities,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,
    evaluator: ConditionEvaluator,
    config: EngineConfig,
}

impl FlowEngine {
    pub fn new(
        store: Arc<dyn FlowStore>,
        caps: Capabilities,
        clock: Arc<dyn Clock>,
        events: Arc<EventBus>,
        config: EngineConfig,
    ) -> Self {
        let evaluator = ConditionEvaluator::new(clock.clone());
        Self {
            store,
            caps,
            clock,
            events,
            evaluator,
            config,
        }
    }

    /// Start a new run of a flow.
    ///
    /// Fails synchronously (without creating a run) when the flow is
    /// missing, inactive, or has no trigger node. Node-level failures do
    /// not fail this call; they are recorded on the returned run.
    pub async fn start_flow(
        &self,
        flow_id: &FlowId,
        conversation_id: Option<String>,
        contact_id: Option<String>,
        trigger_data: HashMap<String, serde_json::Value>,
    ) -> Result<FlowRun> {
        let flow = self
            .store
            .get_flow(flow_id)
            .await?
            .ok_or_else(|| FlowError::FlowNotFound(flow_id.to_string()))?;

        if !flow.active {
            return Err(FlowError::FlowInactive(flow_id.to_string()));
        }

        let trigger = flow
            .trigger_node()
            .ok_or_else(|| FlowError::MissingTrigger(flow_id.to_string()))?;

        let mut context = RunContext::from_map(trigger_data);
        if let Some(conv) = &conversation_id {
            context.set_str("conversationId", conv.clone());
        }
        if let Some(contact) = &contact_id {
            context.set_str("contactId", contact.clone());
        }

        let run = FlowRun::new(
            flow.id.clone(),
            conversation_id,
            contact_id,
            &trigger.id,
            context,
            self.clock.now(),
        );

        self.store.create_run(&run).await?;
        self.store
            .increment_stats(&flow.id, RunOutcome::Started)
            .await?;

        info!(run_id = %run.id, flow_id = %flow.id, flow = %flow.name, "Flow run started");
        self.events.publish(FlowEvent::RunStarted {
            run_id: run.id.clone(),
            flow_id: flow.id.clone(),
        });

        let entry = trigger.id.clone();
        self.advance(&flow, run, &entry).await
    }

    /// Resume a paused run, merging additional data into its context.
    ///
    /// Safe to call more than once for the same external event: a run that
    /// is not paused is returned unchanged, and the paused→running flip is
    /// a compare-and-set, so a redelivered event cannot re-enter a run a
    /// first delivery is already walking.
    pub async fn resume_flow(
        &self,
        run_id: &RunId,
        additional_context: HashMap<String, serde_json::Value>,
    ) -> Result<FlowRun> {
        let mut run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| FlowError::RunNotFound(run_id.to_string()))?;

        if run.status != RunStatus::Paused {
            debug!(run_id = %run_id, status = %run.status, "Resume ignored, run not paused");
            return Ok(run);
        }

        // Load the flow before flipping the status so a missing definition
        // leaves the run paused instead of stranded in running. In-flight
        // runs are otherwise snapshots: a flow deactivated after this run
        // started still finishes.
        let flow = self
            .store
            .get_flow(&run.flow_id)
            .await?
            .ok_or_else(|| FlowError::FlowNotFound(run.flow_id.to_string()))?;

        let applied = self
            .store
            .transition_status(
                run_id,
                &[RunStatus::Paused],
                RunStatus::Running,
                StatusChange::default(),
            )
            .await?;
        if !applied {
            return Ok(self.store.get_run(run_id).await?.unwrap_or(run));
        }
        run.status = RunStatus::Running;
        run.resume_at = None;

        run.context.merge(&additional_context);

        info!(run_id = %run.id, node_id = %run.current_node_id, "Flow run resumed");
        self.events.publish(FlowEvent::RunResumed {
            run_id: run.id.clone(),
        });

        // The persisted node has already done its work (suspension points
        // complete by being resumed), so continue from the edge after it.
        if flow.node(&run.current_node_id).is_none() {
            let message = format!("Node '{}' not found in flow", run.current_node_id);
            return self.fail_run(&flow, run, message).await;
        }
        match next_edge(&flow, &run.current_node_id, None) {
            Some(edge) => {
                let next = edge.target.clone();
                self.advance(&flow, run, &next).await
            }
            None => {
                // No node left to walk, so the merged context must be
                // persisted here before the run finishes.
                self.save_progress(&run).await?;
                self.complete_run(&flow, run).await
            }
        }
    }

    /// Administratively pause a running run without touching its context.
    pub async fn pause_flow(&self, run_id: &RunId) -> Result<FlowRun> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| FlowError::RunNotFound(run_id.to_string()))?;

        let applied = self
            .store
            .transition_status(
                run_id,
                &[RunStatus::Running],
                RunStatus::Paused,
                StatusChange::default(),
            )
            .await?;

        if applied {
            info!(run_id = %run_id, "Flow run paused");
            self.events.publish(FlowEvent::RunPaused {
                run_id: run_id.clone(),
            });
            Ok(self.store.get_run(run_id).await?.unwrap_or(run))
        } else {
            Ok(run)
        }
    }

    /// Cancel a running or paused run. Idempotent: repeated calls observe
    /// the same failed/"Cancelled" state.
    pub async fn cancel_flow(&self, run_id: &RunId) -> Result<FlowRun> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| FlowError::RunNotFound(run_id.to_string()))?;

        let applied = self
            .store
            .transition_status(
                run_id,
                &[RunStatus::Running, RunStatus::Paused],
                RunStatus::Failed,
                StatusChange {
                    error: Some("Cancelled".to_string()),
                    completed_at: Some(self.clock.now()),
                    resume_at: None,
                },
            )
            .await?;

        if applied {
            info!(run_id = %run_id, "Flow run cancelled");
            self.events.publish(FlowEvent::RunCancelled {
                run_id: run_id.clone(),
            });
            Ok(self.store.get_run(run_id).await?.unwrap_or(run))
        } else {
            Ok(run)
        }
    }

    /// Walk the graph from `entry` until the run completes, fails, or
    /// pauses. Iterative with a step budget: a malformed graph with an edge
    /// cycle fails the run instead of recursing forever.
    async fn advance(&self, flow: &Flow, mut run: FlowRun, entry: &str) -> Result<FlowRun> {
        let mut current_id = entry.to_string();
        let mut steps = 0usize;

        loop {
            steps += 1;
            if steps > self.config.max_steps {
                let message = FlowError::StepLimitExceeded(self.config.max_steps).to_string();
                warn!(run_id = %run.id, max_steps = self.config.max_steps, "Step budget exhausted");
                return self.fail_run(flow, run, message).await;
            }

            let node = match flow.node(&current_id) {
                Some(n) => n,
                None => {
                    let message = format!("Node '{}' not found in flow", current_id);
                    return self.fail_run(flow, run, message).await;
                }
            };
            run.current_node_id = node.id.clone();

            // Persist position and context before this node's side effect;
            // a replay after a crash re-enters at the next node.
            if !self.save_progress(&run).await? {
                // A concurrent pause or cancel won the status race.
                debug!(run_id = %run.id, node_id = %node.id, "Run no longer running, stopping walk");
                return Ok(self.store.get_run(&run.id).await?.unwrap_or(run));
            }

            debug!(run_id = %run.id, node_id = %node.id, kind = %node.kind, "Executing node");
            let outcome = match self.dispatch(node, &mut run).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(run_id = %run.id, node_id = %node.id, error = %e, "Node failed");
                    return self.fail_run(flow, run, e.to_string()).await;
                }
            };

            self.events.publish(FlowEvent::NodeExecuted {
                run_id: run.id.clone(),
                node_id: node.id.clone(),
                kind: node.kind,
            });

            if let Some(pause) = outcome.pause {
                return self.pause_run(run, pause).await;
            }

            match next_edge(flow, &node.id, outcome.handle) {
                Some(edge) => current_id = edge.target.clone(),
                None => {
                    // Persist this node's context writes before finishing.
                    self.save_progress(&run).await?;
                    return self.complete_run(flow, run).await;
                }
            }
        }
    }

    /// Execute one node, mutating the run context in place.
    async fn dispatch(&self, node: &FlowNode, run: &mut FlowRun) -> Result<NodeOutcome> {
        let action = NodeAction::parse(node).map_err(|e| FlowError::NodeExecution {
            node: node.id.clone(),
            message: e.to_string(),
        })?;

        match action {
            NodeAction::Trigger => Ok(NodeOutcome::default()),

            NodeAction::SendMessage { text } => {
                let conversation = self.conversation_id(run).ok_or_else(|| {
                    FlowError::NodeExecution {
                        node: node.id.clone(),
                        message: "send_message without a conversation".to_string(),
                    }
                })?;
                self.caps.messages.send(&conversation, &text).await?;
                Ok(NodeOutcome::default())
            }

            NodeAction::AiAgent { agent_id } => {
                let conversation = self.conversation_id(run).unwrap_or_default();
                let last_message = run
                    .context
                    .get_str("message")
                    .or_else(|| run.context.get_str("lastMessage"))
                    .unwrap_or_default()
                    .to_string();
                let response = self
                    .caps
                    .agents
                    .invoke(&agent_id, &last_message, &conversation)
                    .await?;
                run.context.set_str("aiResponse", response);
                Ok(NodeOutcome::default())
            }

            NodeAction::WaitReply => Ok(NodeOutcome {
                pause: Some(Pause::WaitReply),
                ..Default::default()
            }),

            NodeAction::Delay { duration } => {
                let inline_max =
                    chrono::Duration::seconds(self.config.inline_delay_max_secs as i64);
                if duration <= inline_max {
                    // Short intra-step pacing only; long delays never hold
                    // a worker.
                    let std_duration = duration.to_std().unwrap_or_default();
                    tokio::time::sleep(std_duration).await;
                    Ok(NodeOutcome::default())
                } else {
                    Ok(NodeOutcome {
                        pause: Some(Pause::Until(self.clock.now() + duration)),
                        ..Default::default()
                    })
                }
            }

            NodeAction::Condition { expression } => {
                let verdict = self.evaluator.evaluate(&expression, &run.context);
                debug!(node_id = %node.id, expression = %expression, verdict, "Condition evaluated");
                Ok(NodeOutcome {
                    handle: Some(if verdict { "yes" } else { "no" }),
                    ..Default::default()
                })
            }

            NodeAction::HumanHandoff { reason } => {
                let reason = reason.unwrap_or_else(|| "human_handoff".to_string());
                run.context.set("handoff", serde_json::Value::Bool(true));
                run.context.set_str("handoffReason", reason.clone());
                self.events.publish(FlowEvent::HandoffRequested {
                    run_id: run.id.clone(),
                    conversation_id: self.conversation_id(run),
                    reason,
                });
                Ok(NodeOutcome::default())
            }

            NodeAction::Tag { tags } => {
                let contact = run
                    .contact_id
                    .clone()
                    .or_else(|| run.context.get_str("contactId").map(str::to_string))
                    .ok_or_else(|| FlowError::NodeExecution {
                        node: node.id.clone(),
                        message: "tag node without a contact".to_string(),
                    })?;
                self.caps.contacts.apply_tags(&contact, &tags).await?;
                Ok(NodeOutcome::default())
            }

            NodeAction::HttpRequest(request) => {
                // Transport failure is flow data, not a run failure:
                // downstream condition nodes branch on httpError.
                match self.caps.http.fetch(request).await {
                    HttpOutcome::Response { status, body } => {
                        run.context
                            .set("httpStatus", serde_json::Value::from(status));
                        let parsed = serde_json::from_str::<serde_json::Value>(&body)
                            .unwrap_or(serde_json::Value::String(body));
                        run.context.set("httpResponse", parsed);
                    }
                    HttpOutcome::Error(message) => {
                        warn!(node_id = %node.id, error = %message, "HTTP request failed");
                        run.context.set_str("httpError", message);
                    }
                }
                Ok(NodeOutcome::default())
            }

            NodeAction::Close => {
                run.context.set("closed", serde_json::Value::Bool(true));
                Ok(NodeOutcome::default())
            }

            NodeAction::TransferAgent { agent_id } => {
                run.context.set_str("transferToAgent", agent_id);
                Ok(NodeOutcome::default())
            }

            NodeAction::CheckWindow => Ok(NodeOutcome {
                handle: Some(if run.context.truthy("windowOpen") {
                    "open"
                } else {
                    "closed"
                }),
                ..Default::default()
            }),
        }
    }

    fn conversation_id(&self, run: &FlowRun) -> Option<String> {
        run.conversation_id
            .clone()
            .or_else(|| run.context.get_str("conversationId").map(str::to_string))
    }

    async fn save_progress(&self, run: &FlowRun) -> Result<bool> {
        self.store
            .save_progress(&run.id, &run.current_node_id, &run.context)
            .await
    }

    async fn pause_run(&self, mut run: FlowRun, pause: Pause) -> Result<FlowRun> {
        // Persist context mutations made by the suspending node first.
        self.save_progress(&run).await?;

        let resume_at = match pause {
            Pause::WaitReply => None,
            Pause::Until(at) => Some(at),
        };
        let applied = self
            .store
            .transition_status(
                &run.id,
                &[RunStatus::Running],
                RunStatus::Paused,
                StatusChange {
                    resume_at,
                    ..Default::default()
                },
            )
            .await?;
        if !applied {
            return Ok(self.store.get_run(&run.id).await?.unwrap_or(run));
        }

        run.status = RunStatus::Paused;
        run.resume_at = resume_at;
        info!(run_id = %run.id, node_id = %run.current_node_id, resume_at = ?resume_at, "Flow run paused");
        self.events.publish(FlowEvent::RunPaused {
            run_id: run.id.clone(),
        });
        Ok(run)
    }

    async fn complete_run(&self, flow: &Flow, mut run: FlowRun) -> Result<FlowRun> {
        let completed_at = self.clock.now();
        let applied = self
            .store
            .transition_status(
                &run.id,
                &[RunStatus::Running],
                RunStatus::Completed,
                StatusChange {
                    completed_at: Some(completed_at),
                    ..Default::default()
                },
            )
            .await?;
        if !applied {
            return Ok(self.store.get_run(&run.id).await?.unwrap_or(run));
        }

        run.status = RunStatus::Completed;
        run.completed_at = Some(completed_at);
        self.store
            .increment_stats(&flow.id, RunOutcome::Succeeded)
            .await?;

        info!(run_id = %run.id, flow_id = %flow.id, "Flow run completed");
        self.events.publish(FlowEvent::RunCompleted {
            run_id: run.id.clone(),
            flow_id: flow.id.clone(),
        });
        Ok(run)
    }

    async fn fail_run(&self, flow: &Flow, mut run: FlowRun, message: String) -> Result<FlowRun> {
        let completed_at = self.clock.now();
        let applied = self
            .store
            .transition_status(
                &run.id,
                &[RunStatus::Running],
                RunStatus::Failed,
                StatusChange {
                    error: Some(message.clone()),
                    completed_at: Some(completed_at),
                    resume_at: None,
                },
            )
            .await?;
        if !applied {
            return Ok(self.store.get_run(&run.id).await?.unwrap_or(run));
        }

        run.status = RunStatus::Failed;
        run.error = Some(message.clone());
        run.completed_at = Some(completed_at);
        self.store
            .increment_stats(&flow.id, RunOutcome::Failed)
            .await?;

        error!(run_id = %run.id, flow_id = %flow.id, error = %message, "Flow run failed");
        self.events.publish(FlowEvent::RunFailed {
            run_id: run.id.clone(),
            flow_id: flow.id.clone(),
            error: message,
        });
        Ok(run)
    }
}

/// Resolve the edge to follow out of a node.
///
/// Branching nodes emit a handle and must match it exactly; everything else
/// takes the first outgoing edge. Save-time validation rejects ambiguous
/// fan-out, so "first" is unique for validated definitions.
fn next_edge<'a>(flow: &'a Flow, node_id: &'a str, handle: Option<&str>) -> Option<&'a FlowEdge> {
    match handle {
        Some(h) => flow
            .outgoing(node_id)
            .find(|e| e.source_handle.as_deref() == Some(h)),
        None => flow.outgoing(node_id).next(),
    }
}
