use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use crate::context::RunContext;
use crate::error::Result;
use crate::types::*;

/// Fields of a status transition that terminate or park a run.
#[derive(Debug, Clone, Default)]
pub struct StatusChange {
    pub error: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub resume_at: Option<DateTime<Utc>>,
}

/// Flow store — persistence backend for flow definitions and run state.
pub trait FlowStore: Send + Sync + 'static {
    /// Load a flow definition by id.
    fn get_flow(&self, id: &FlowId) -> BoxFuture<'_, Result<Option<Flow>>>;

    /// Create or replace a flow definition.
    fn put_flow(&self, flow: &Flow) -> BoxFuture<'_, Result<()>>;

    /// All active flows with the given trigger kind.
    fn list_active_by_trigger(&self, kind: TriggerKind) -> BoxFuture<'_, Result<Vec<Flow>>>;

    /// Persist a freshly created run.
    fn create_run(&self, run: &FlowRun) -> BoxFuture<'_, Result<()>>;

    /// Load a run by id.
    fn get_run(&self, id: &RunId) -> BoxFuture<'_, Result<Option<FlowRun>>>;

    /// Persist (current_node_id, context) for a run. Effective only while
    /// the run is still `running`; returns false when a concurrent
    /// pause/cancel already moved it, so the caller stops walking.
    fn save_progress(
        &self,
        id: &RunId,
        node_id: &str,
        context: &RunContext,
    ) -> BoxFuture<'_, Result<bool>>;

    /// Compare-and-set status transition. Applies only when the current
    /// status is one of `from`; returns whether the update took effect.
    /// Cancel vs. concurrent completion races resolve through this.
    fn transition_status(
        &self,
        id: &RunId,
        from: &[RunStatus],
        to: RunStatus,
        change: StatusChange,
    ) -> BoxFuture<'_, Result<bool>>;

    /// Bump a flow's lifetime counters.
    fn increment_stats(&self, flow: &FlowId, outcome: RunOutcome) -> BoxFuture<'_, Result<()>>;

    /// Paused runs whose resume_at is at or before `now`.
    fn due_runs(&self, now: DateTime<Utc>) -> BoxFuture<'_, Result<Vec<RunId>>>;
}

/// Message capability — delivers outbound text on a conversation's channel.
pub trait MessageSender: Send + Sync + 'static {
    fn send(&self, conversation_id: &str, text: &str) -> BoxFuture<'_, Result<()>>;
}

/// AI-agent capability — invokes a configured agent and returns its reply.
pub trait AgentInvoker: Send + Sync + 'static {
    fn invoke(
        &self,
        agent_id: &str,
        last_message: &str,
        conversation_id: &str,
    ) -> BoxFuture<'_, Result<String>>;
}

/// Contact-update capability — applies tags to a contact record.
pub trait ContactTagger: Send + Sync + 'static {
    fn apply_tags(&self, contact_id: &str, tags: &[String]) -> BoxFuture<'_, Result<()>>;
}

/// HTTP capability for the `http_request` node.
///
/// Deliberately infallible: transport failure comes back as
/// `HttpOutcome::Error` and lands in the run context, never in the run's
/// error field.
pub trait HttpFetcher: Send + Sync + 'static {
    fn fetch(&self, request: HttpRequest) -> BoxFuture<'_, HttpOutcome>;
}

/// Injectable time source for `timeOfDay` conditions and delay arithmetic.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
