//! Environment-driven configuration for the orchestration core (spec §6,
//! §10.4). Read once at process start and threaded explicitly into
//! constructors — no global mutable state.

#[derive(Debug, Clone)]
pub struct Config {
    pub max_orchestration_iterations: usize,
    pub code_exec_timeout_ms: u64,
    pub max_mcp_calls_per_execution: u32,
    pub max_downstream_calls_per_request: u32,
    pub default_downstream_per_mcp_call: u32,
    pub max_mcp_response_size_bytes: u64,
    pub claude_model: String,
    pub claude_max_tokens: u32,
    pub admin_rate_limit_window_ms: u64,
    pub admin_rate_limit_max: u32,
    pub default_org: String,
    pub discovery_timeout_ms: u64,
    pub invocation_timeout_ms: u64,
    pub history_capacity: usize,
    pub history_llm_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_orchestration_iterations: 10,
            code_exec_timeout_ms: 30_000,
            max_mcp_calls_per_execution: 10,
            max_downstream_calls_per_request: 120,
            default_downstream_per_mcp_call: 12,
            max_mcp_response_size_bytes: 1_048_576,
            claude_model: "claude-sonnet-4-20250514".to_string(),
            claude_max_tokens: 4096,
            admin_rate_limit_window_ms: 60_000,
            admin_rate_limit_max: 100,
            default_org: "default".to_string(),
            discovery_timeout_ms: 10_000,
            invocation_timeout_ms: 30_000,
            history_capacity: 50,
            history_llm_capacity: 5,
        }
    }
}

impl Config {
    /// Reads every knob enumerated in spec §6 from the environment, falling
    /// back to its stated default rather than panicking when absent or
    /// unparseable.
    pub fn from_env() -> Self {
        let defaults = Config::default();
        Config {
            max_orchestration_iterations: env_usize("MAX_ORCHESTRATION_ITERATIONS", defaults.max_orchestration_iterations),
            code_exec_timeout_ms: env_u64("CODE_EXEC_TIMEOUT_MS", defaults.code_exec_timeout_ms),
            max_mcp_calls_per_execution: env_u32("MAX_MCP_CALLS_PER_EXECUTION", defaults.max_mcp_calls_per_execution),
            max_downstream_calls_per_request: env_u32(
                "MAX_DOWNSTREAM_CALLS_PER_REQUEST",
                defaults.max_downstream_calls_per_request,
            ),
            default_downstream_per_mcp_call: env_u32(
                "DEFAULT_DOWNSTREAM_PER_MCP_CALL",
                defaults.default_downstream_per_mcp_call,
            ),
            max_mcp_response_size_bytes: env_u64("MAX_MCP_RESPONSE_SIZE_BYTES", defaults.max_mcp_response_size_bytes),
            claude_model: std::env::var("CLAUDE_MODEL").unwrap_or(defaults.claude_model),
            claude_max_tokens: env_u32("CLAUDE_MAX_TOKENS", defaults.claude_max_tokens),
            admin_rate_limit_window_ms: env_u64("ADMIN_RATE_LIMIT_WINDOW_MS", defaults.admin_rate_limit_window_ms),
            admin_rate_limit_max: env_u32("ADMIN_RATE_LIMIT_MAX", defaults.admin_rate_limit_max),
            default_org: std::env::var("DEFAULT_ORG").unwrap_or(defaults.default_org),
            ..defaults
        }
    }
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_values() {
        let config = Config::default();
        assert_eq!(config.max_orchestration_iterations, 10);
        assert_eq!(config.code_exec_timeout_ms, 30_000);
        assert_eq!(config.max_mcp_response_size_bytes, 1_048_576);
        assert_eq!(config.claude_max_tokens, 4096);
    }
}
