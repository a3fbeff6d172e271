pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use config::{AppConfig, EngineConfig};
pub use context::RunContext;
pub use error::{FlowError, Result};
pub use event::EventBus;
pub use types::*;
