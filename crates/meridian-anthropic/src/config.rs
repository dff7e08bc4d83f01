//! Environment-driven configuration for the Anthropic transport (SPEC_FULL
//! §10.4: `CLAUDE_MODEL`/`CLAUDE_MAX_TOKENS`), in the shape of the teacher's
//! provider config structs (`crates/providers/anthropic/src/lib.rs`).

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

fn default_base_url() -> String {
    "https://api.anthropic.com/v1/".to_string()
}

fn default_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_anthropic_version() -> String {
    "2023-06-01".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub struct AnthropicConfig {
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_anthropic_version")]
    pub anthropic_version: String,
    pub timeout_seconds: Option<u64>,
}

impl AnthropicConfig {
    /// Reads `ANTHROPIC_API_KEY` (required), `CLAUDE_MODEL`, and
    /// `CLAUDE_MAX_TOKENS` (both optional, falling back to the defaults
    /// above) the way the teacher's provider factories read their
    /// env-sourced settings.
    pub fn from_env() -> Result<Self, String> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| "ANTHROPIC_API_KEY is not set".to_string())?;
        let model = std::env::var("CLAUDE_MODEL").unwrap_or_else(|_| default_model());
        let max_tokens = std::env::var("CLAUDE_MAX_TOKENS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_max_tokens);
        Ok(AnthropicConfig {
            api_key,
            model,
            max_tokens,
            base_url: default_base_url(),
            anthropic_version: default_anthropic_version(),
            timeout_seconds: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_applied_when_fields_are_absent() {
        let config: AnthropicConfig =
            serde_json::from_str(r#"{"api_key": "sk-test"}"#).unwrap();
        assert_eq!(config.model, default_model());
        assert_eq!(config.max_tokens, default_max_tokens());
        assert_eq!(config.base_url, default_base_url());
    }
}
