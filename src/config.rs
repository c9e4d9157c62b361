use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{UnsubError, UnsubResult};

pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o";

/// Knobs for the agent loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub max_turns: usize,
    /// Byte budget for print() output echoed back to the model.
    pub max_output_len: usize,
    #[serde(with = "millis")]
    pub turn_delay: Duration,
    /// Pages with larger HTML skip the first-turn description call.
    pub html_description_max_len: usize,
    pub html_chunk_len: usize,
    pub html_chunk_overlap: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_turns: 10,
            max_output_len: 512,
            turn_delay: Duration::from_secs(1),
            html_description_max_len: 65536,
            html_chunk_len: 8192,
            html_chunk_overlap: 128,
        }
    }
}

/// Bounded exponential backoff for rate-limited model calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    #[serde(with = "millis")]
    pub initial_delay: Duration,
    #[serde(with = "millis")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 8,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based), without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub api_base: String,
    pub api_key: String,
    pub model: String,
    pub retry: RetryPolicy,
}

impl GatewayConfig {
    /// Reads `OPENAI_API_KEY`, `OPENAI_BASE_URL` and `UNSUB_MODEL`.
    /// Call `dotenvy::dotenv()` first if a `.env` file should be honored.
    pub fn from_env() -> UnsubResult<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| UnsubError::Config("OPENAI_API_KEY not set in environment".into()))?;
        let api_base = std::env::var("OPENAI_BASE_URL")
            .unwrap_or_else(|_| DEFAULT_API_BASE.to_string())
            .trim_end_matches('/')
            .to_string();
        let model = std::env::var("UNSUB_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        tracing::debug!(api_base = %api_base, model = %model, "gateway config loaded");
        Ok(Self {
            api_base,
            api_key,
            model,
            retry: RetryPolicy::default(),
        })
    }
}

/// Root of the static pages served by simulations.
pub fn default_asset_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("UNSUB_ASSET_DIR") {
        return PathBuf::from(dir);
    }
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("assets")
        .join("simulations")
}

/// `~/.local/share/unsub/<leaf>` or the platform equivalent,
/// falling back to `./<leaf>`.
pub fn data_dir_or_cwd(leaf: &str) -> PathBuf {
    match dirs::data_local_dir() {
        Some(base) => base.join("unsub").join(leaf),
        None => PathBuf::from(leaf),
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
