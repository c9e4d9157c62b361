//! LLM-driven browser agent that unsubscribes a user from mailing lists,
//! plus a loopback harness of simulated unsubscribe sites to score it.

pub mod agent;
pub mod brain;
pub mod config;
pub mod dom;
pub mod errors;
pub mod eyes;
pub mod hands;
pub mod render;
pub mod simulation;
pub mod transcript;
pub mod types;

pub use agent::{AgentFailure, UnsubAgent};
pub use errors::{UnsubError, UnsubResult};
pub use types::{AgentStatus, Conversation, SimulationStatus};
