use std::fs::OpenOptions;
use std::io::BufReader;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::errors::UnsubResult;
use crate::types::{AgentStatus, Conversation, SimulationStatus};

/// A run against a real link. Exactly one of `status` / `error` is set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunRecord {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    pub user_email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<AgentStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation: Option<Conversation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One simulated trial.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialRecord {
    pub agent_status: AgentStatus,
    pub sim_status: SimulationStatus,
    pub conversation: Conversation,
}

pub fn save_json<T: Serialize>(path: &Path, value: &T) -> UnsubResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    serde_json::to_writer(file, value)?;
    tracing::debug!(path = %path.display(), "record saved");
    Ok(())
}

pub fn load_json<T: DeserializeOwned>(path: &Path) -> UnsubResult<T> {
    let file = std::fs::File::open(path)?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}
