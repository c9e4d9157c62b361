use serde::{Deserialize, Serialize};

use crate::types::{AgentStatus, SimulationStatus};

/// Agent verdict versus simulated ground truth. "Positive" means the agent
/// claimed success.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scoreboard {
    pub true_positives: u32,
    pub true_negatives: u32,
    pub false_positives: u32,
    pub false_negatives: u32,
}

impl Scoreboard {
    pub fn record(&mut self, agent: AgentStatus, actual: SimulationStatus) {
        let claimed = agent == AgentStatus::Success;
        let real = actual == SimulationStatus::Success;
        match (claimed, real) {
            (true, true) => self.true_positives += 1,
            (true, false) => self.false_positives += 1,
            (false, true) => self.false_negatives += 1,
            (false, false) => self.true_negatives += 1,
        }
    }

    pub fn trials(&self) -> u32 {
        self.true_positives + self.true_negatives + self.false_positives + self.false_negatives
    }

    pub fn summary(&self) -> String {
        format!(
            "success_rate={}/{} (tn={} fp={} fn={})",
            self.true_positives,
            self.trials(),
            self.true_negatives,
            self.false_positives,
            self.false_negatives
        )
    }
}
