pub mod condition;
pub mod engine;
pub mod http;
pub mod node;
pub mod scheduler;
pub mod trigger;
pub mod validate;

pub use condition::ConditionEvaluator;
pub use engine::{Capabilities, FlowEngine};
pub use http::ReqwestHttpFetcher;
pub use node::NodeAction;
pub use scheduler::FlowScheduler;
pub use trigger::TriggerManager;
pub use validate::{flow_issues, validate_flow};
