use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::RunContext;

/// Unique flow identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowId(pub String);

impl FlowId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for FlowId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for FlowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Event class that starts runs of a flow.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    MessageReceived,
    NewContact,
    Keyword,
    Webhook,
    Schedule,
    Manual,
}

impl TriggerKind {
    /// Storage/wire name, matching the serde rename.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MessageReceived => "message_received",
            Self::NewContact => "new_contact",
            Self::Keyword => "keyword",
            Self::Webhook => "webhook",
            Self::Schedule => "schedule",
            Self::Manual => "manual",
        }
    }
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The fixed set of node types a flow graph may contain.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Trigger,
    SendMessage,
    AiAgent,
    WaitReply,
    Delay,
    Condition,
    HumanHandoff,
    Tag,
    HttpRequest,
    Close,
    TransferAgent,
    CheckWindow,
}

impl NodeKind {
    /// Branching nodes route by output handle instead of a single edge.
    pub fn is_branching(&self) -> bool {
        matches!(self, Self::Condition | Self::CheckWindow)
    }

    /// The output handles a branching node may emit.
    pub fn handles(&self) -> &'static [&'static str] {
        match self {
            Self::Condition => &["yes", "no"],
            Self::CheckWindow => &["open", "closed"],
            _ => &[],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trigger => "trigger",
            Self::SendMessage => "send_message",
            Self::AiAgent => "ai_agent",
            Self::WaitReply => "wait_reply",
            Self::Delay => "delay",
            Self::Condition => "condition",
            Self::HumanHandoff => "human_handoff",
            Self::Tag => "tag",
            Self::HttpRequest => "http_request",
            Self::Close => "close",
            Self::TransferAgent => "transfer_agent",
            Self::CheckWindow => "check_window",
        }
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed step in a flow graph.
///
/// `data` holds the node-type-specific configuration (message text, HTTP
/// method/url, delay amount, condition expression, ...). It is parsed into
/// a typed action at dispatch time; visual editor fields are ignored here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowNode {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
}

impl FlowNode {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            data: HashMap::new(),
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }
}

/// A directed connection between two nodes.
///
/// `source_handle` discriminates the outputs of a branching node
/// (`yes`/`no`, `open`/`closed`); `label` is display-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowEdge {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub source_handle: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
}

impl FlowEdge {
    pub fn new(id: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            source_handle: None,
            label: None,
        }
    }

    pub fn with_handle(mut self, handle: impl Into<String>) -> Self {
        self.source_handle = Some(handle.into());
        self
    }
}

/// Lifetime run counters for a flow.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct FlowStats {
    pub runs: u64,
    pub succeeded: u64,
    pub failed: u64,
}

/// An automation definition: a graph of typed nodes with one trigger entry
/// point. Node/edge lists are read-only snapshots for the duration of a run;
/// editing a flow never affects in-flight runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flow {
    pub id: FlowId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "triggerType")]
    pub trigger_kind: TriggerKind,
    #[serde(default)]
    pub trigger_config: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub nodes: Vec<FlowNode>,
    #[serde(default)]
    pub edges: Vec<FlowEdge>,
    pub active: bool,
    #[serde(default)]
    pub stats: FlowStats,
}

impl Flow {
    pub fn new(name: impl Into<String>, trigger_kind: TriggerKind) -> Self {
        Self {
            id: FlowId::new(),
            name: name.into(),
            description: None,
            trigger_kind,
            trigger_config: HashMap::new(),
            nodes: Vec::new(),
            edges: Vec::new(),
            active: true,
            stats: FlowStats::default(),
        }
    }

    pub fn node(&self, id: &str) -> Option<&FlowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// The sole entry point of an active flow.
    pub fn trigger_node(&self) -> Option<&FlowNode> {
        self.nodes.iter().find(|n| n.kind == NodeKind::Trigger)
    }

    /// Outgoing edges of a node, in definition order.
    pub fn outgoing<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a FlowEdge> + 'a {
        self.edges.iter().filter(move |e| e.source == node_id)
    }
}

/// Run lifecycle state.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Paused,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome bucket for flow stats increments.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum RunOutcome {
    Started,
    Succeeded,
    Failed,
}

/// One execution instance of a flow.
///
/// `resume_at` is set when a long delay parks the run; an external
/// scheduler tick resumes it at or after that time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowRun {
    pub id: RunId,
    pub flow_id: FlowId,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub contact_id: Option<String>,
    pub status: RunStatus,
    pub current_node_id: String,
    #[serde(default)]
    pub context: RunContext,
    #[serde(default)]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resume_at: Option<DateTime<Utc>>,
}

impl FlowRun {
    pub fn new(
        flow_id: FlowId,
        conversation_id: Option<String>,
        contact_id: Option<String>,
        entry_node_id: impl Into<String>,
        context: RunContext,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: RunId::new(),
            flow_id,
            conversation_id,
            contact_id,
            status: RunStatus::Running,
            current_node_id: entry_node_id.into(),
            context,
            error: None,
            started_at,
            completed_at: None,
            resume_at: None,
        }
    }
}

/// Request shape for the `http_request` node capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
}

/// Outcome of an outbound HTTP call.
///
/// Transport failure is a value, never an error — flows branch on it
/// downstream via the context (`httpError`).
#[derive(Debug, Clone)]
pub enum HttpOutcome {
    Response { status: u16, body: String },
    Error(String),
}
