use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::future::BoxFuture;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cadence_core::config::AppConfig;
use cadence_core::error::Result as FlowResult;
use cadence_core::event::EventBus;
use cadence_core::traits::{AgentInvoker, ContactTagger, FlowStore, MessageSender, SystemClock};
use cadence_core::types::Flow;
use cadence_flow::{flow_issues, Capabilities, FlowEngine, ReqwestHttpFetcher, TriggerManager};
use cadence_store::SqliteFlowStore;

#[derive(Parser)]
#[command(name = "cadence", version, about = "Automation flow engine for customer conversations")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "cadence.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a flow definition for structural problems
    Validate {
        /// Flow definition JSON file
        file: PathBuf,
    },
    /// Run a flow end-to-end with logging stand-ins for side effects
    Simulate {
        /// Flow definition JSON file
        file: PathBuf,
        /// Inbound message to seed the run context with
        #[arg(short, long)]
        message: Option<String>,
        /// Conversation id for messaging nodes
        #[arg(long, default_value = "sim-conversation")]
        conversation: String,
        /// Contact id for tagging nodes
        #[arg(long, default_value = "sim-contact")]
        contact: String,
    },
    /// Show the resolved configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = if cli.config.exists() {
        AppConfig::load(&cli.config)?
    } else {
        AppConfig::default()
    };

    match cli.command {
        Commands::Validate { file } => validate(&file),
        Commands::Simulate {
            file,
            message,
            conversation,
            contact,
        } => simulate(&config, &file, message, conversation, contact).await,
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn load_flow(file: &PathBuf) -> anyhow::Result<Flow> {
    let raw = std::fs::read_to_string(file)?;
    Ok(serde_json::from_str(&raw)?)
}

fn validate(file: &PathBuf) -> anyhow::Result<()> {
    let flow = load_flow(file)?;
    let issues = flow_issues(&flow);
    if issues.is_empty() {
        println!(
            "{}: ok ({} nodes, {} edges)",
            flow.name,
            flow.nodes.len(),
            flow.edges.len()
        );
        Ok(())
    } else {
        for issue in &issues {
            println!("error: {}", issue);
        }
        anyhow::bail!("{} validation issue(s) in '{}'", issues.len(), flow.name);
    }
}

async fn simulate(
    config: &AppConfig,
    file: &PathBuf,
    message: Option<String>,
    conversation: String,
    contact: String,
) -> anyhow::Result<()> {
    let flow = load_flow(file)?;
    let issues = flow_issues(&flow);
    if !issues.is_empty() {
        anyhow::bail!("flow '{}' is invalid: {}", flow.name, issues.join("; "));
    }

    // Simulations never touch the configured database
    let store = Arc::new(SqliteFlowStore::in_memory()?);
    store.put_flow(&flow).await?;

    let events = Arc::new(EventBus::default());
    let caps = Capabilities {
        messages: Arc::new(ConsoleSender),
        agents: Arc::new(ConsoleAgent),
        contacts: Arc::new(ConsoleTagger),
        http: Arc::new(ReqwestHttpFetcher::new()),
    };
    let engine = Arc::new(FlowEngine::new(
        store.clone(),
        caps,
        Arc::new(SystemClock),
        events.clone(),
        config.engine.clone(),
    ));
    let triggers = TriggerManager::new(store, engine, events);

    let mut data = HashMap::new();
    if let Some(message) = message {
        data.insert("message".to_string(), serde_json::Value::String(message));
    }

    let run = triggers
        .manual_trigger(&flow.id, Some(conversation), Some(contact), data)
        .await?;

    println!("run {} finished: {}", run.id, run.status);
    if let Some(error) = &run.error {
        println!("error: {}", error);
    }
    println!(
        "context: {}",
        serde_json::to_string_pretty(run.context.data())?
    );
    Ok(())
}

/// Logging stand-ins for the injected capabilities, so a simulation shows
/// what a deployment would have done without sending anything.
struct ConsoleSender;

impl MessageSender for ConsoleSender {
    fn send(&self, conversation_id: &str, text: &str) -> BoxFuture<'_, FlowResult<()>> {
        let conversation_id = conversation_id.to_string();
        let text = text.to_string();
        Box::pin(async move {
            info!(conversation_id = %conversation_id, text = %text, "send_message (simulated)");
            Ok(())
        })
    }
}

struct ConsoleAgent;

impl AgentInvoker for ConsoleAgent {
    fn invoke(
        &self,
        agent_id: &str,
        last_message: &str,
        _conversation_id: &str,
    ) -> BoxFuture<'_, FlowResult<String>> {
        let agent_id = agent_id.to_string();
        let last_message = last_message.to_string();
        Box::pin(async move {
            info!(agent_id = %agent_id, last_message = %last_message, "ai_agent (simulated)");
            Ok(format!("[simulated reply from agent {}]", agent_id))
        })
    }
}

struct ConsoleTagger;

impl ContactTagger for ConsoleTagger {
    fn apply_tags(&self, contact_id: &str, tags: &[String]) -> BoxFuture<'_, FlowResult<()>> {
        let contact_id = contact_id.to_string();
        let tags = tags.to_vec();
        Box::pin(async move {
            info!(contact_id = %contact_id, tags = ?tags, "tag (simulated)");
            Ok(())
        })
    }
}
