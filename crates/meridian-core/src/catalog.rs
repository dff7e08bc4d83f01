//! Catalog Builder (spec §4.2): merges per-server tool manifests into one
//! ordered, de-duplicated catalog.

use std::collections::HashMap;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::OnceLock;

/// Per-organization tool-server configuration entry (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    pub enabled: bool,
    pub priority: i32,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
}

fn server_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("valid regex"))
}

impl ServerConfig {
    /// Validates the server-id shape required by spec §8 boundary behaviors.
    pub fn has_valid_id(&self) -> bool {
        self.id.len() <= 64 && server_id_pattern().is_match(&self.id)
    }

    pub fn has_valid_url(&self) -> bool {
        self.url.starts_with("http://") || self.url.starts_with("https://")
    }
}

/// A tool's raw definition as discovered from `tools/list` on one server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolManifestEntry {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Result of discovering one server's tools, success or failure (spec §4.2:
/// "a failed discovery contributes zero tools and an `error` string").
#[derive(Debug, Clone)]
pub struct DiscoveryResult {
    pub server_id: String,
    pub tools: Vec<ToolManifestEntry>,
    pub error: Option<String>,
}

/// One entry in the merged catalog (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogTool {
    /// The name published to the LM: bare, unless a collision forced the
    /// `{server_id}_{name}` prefix.
    pub name: String,
    /// The tool's name as known to its own server — what `tools/call`
    /// must be invoked with, regardless of how the name was published.
    pub remote_name: String,
    pub description: String,
    pub input_schema: Value,
    pub server_id: String,
    pub server_url: String,
}

/// The merged, de-duplicated catalog built for one request.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    tools: Vec<CatalogTool>,
    servers: HashMap<String, ServerConfig>,
}

impl Catalog {
    /// Builds a catalog from discovery results, iterated in the servers'
    /// configured priority order (spec §4.2 name-collision rules).
    pub fn build(servers: &[ServerConfig], discoveries: &[DiscoveryResult]) -> Catalog {
        let mut ordered_servers: Vec<&ServerConfig> = servers.iter().filter(|s| s.enabled).collect();
        ordered_servers.sort_by_key(|s| s.priority);

        let mut by_server: HashMap<&str, &DiscoveryResult> = HashMap::new();
        for d in discoveries {
            by_server.insert(d.server_id.as_str(), d);
        }

        let mut used_names: std::collections::HashSet<String> = std::collections::HashSet::new();
        let mut tools = Vec::new();
        let mut server_map = HashMap::new();

        for server in ordered_servers {
            server_map.insert(server.id.clone(), server.clone());
            let Some(discovery) = by_server.get(server.id.as_str()) else {
                continue;
            };
            for entry in &discovery.tools {
                if !server.allowed_tools.is_empty() && !server.allowed_tools.contains(&entry.name) {
                    continue;
                }
                let published_name = if used_names.contains(&entry.name) {
                    let prefixed = format!("{}_{}", server.id, entry.name);
                    if used_names.contains(&prefixed) {
                        tracing::warn!(
                            server_id = %server.id,
                            tool = %entry.name,
                            "dropping tool: both bare and prefixed names collide"
                        );
                        continue;
                    }
                    prefixed
                } else {
                    entry.name.clone()
                };
                used_names.insert(published_name.clone());
                tools.push(CatalogTool {
                    name: published_name,
                    remote_name: entry.name.clone(),
                    description: entry.description.clone(),
                    input_schema: entry.input_schema.clone(),
                    server_id: server.id.clone(),
                    server_url: server.url.clone(),
                });
            }
        }

        Catalog {
            tools,
            servers: server_map,
        }
    }

    pub fn find_tool(&self, name: &str) -> Option<&CatalogTool> {
        self.tools.iter().find(|t| t.name == name)
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name.as_str()).collect()
    }

    /// Returns `name -> input_schema`, silently skipping unknown names and
    /// de-duplicating repeated requests (spec §8 idempotence law).
    pub fn tool_definitions(&self, names: &[String]) -> HashMap<String, Value> {
        let mut out = HashMap::new();
        for name in names {
            if let Some(tool) = self.find_tool(name) {
                out.insert(tool.name.clone(), tool.input_schema.clone());
            }
        }
        out
    }

    pub fn server(&self, id: &str) -> Option<&ServerConfig> {
        self.servers.get(id)
    }

    pub fn tools(&self) -> &[CatalogTool] {
        &self.tools
    }

    /// A short human-readable summary for the LM's system prompt (spec
    /// §4.2, §8 boundary behavior): descriptions truncated at the first
    /// period or 80 chars at a word boundary, with markdown-sensitive
    /// characters escaped so catalog text can't inject formatting.
    pub fn render_catalog_summary(&self) -> String {
        let mut lines = Vec::with_capacity(self.tools.len());
        for tool in &self.tools {
            let truncated = truncate_description(&tool.description);
            let escaped = escape_markdown(&truncated);
            lines.push(format!("- {}: {}", tool.name, escaped));
        }
        lines.join("\n")
    }
}

fn truncate_description(description: &str) -> String {
    if let Some(period_idx) = description.find('.') {
        if period_idx <= 80 {
            return description[..period_idx].to_string();
        }
    }
    if description.len() <= 80 {
        return description.to_string();
    }
    let mut cut = 80;
    while cut > 0 && !description.is_char_boundary(cut) {
        cut -= 1;
    }
    let slice = &description[..cut];
    match slice.rfind(char::is_whitespace) {
        Some(word_boundary) if word_boundary > 0 => slice[..word_boundary].to_string(),
        _ => slice.to_string(),
    }
}

fn escape_markdown(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '*' | '_' | '`' | '[' | ']' | '<' | '>' => format!("\\{c}"),
            other => other.to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(id: &str, priority: i32) -> ServerConfig {
        ServerConfig {
            id: id.to_string(),
            name: id.to_string(),
            url: format!("https://{id}.example/rpc"),
            auth_token: None,
            enabled: true,
            priority,
            allowed_tools: vec![],
        }
    }

    fn manifest(name: &str) -> ToolManifestEntry {
        ToolManifestEntry {
            name: name.to_string(),
            description: "does a thing".to_string(),
            input_schema: Value::Null,
        }
    }

    #[test]
    fn bare_name_kept_on_first_occurrence() {
        let servers = vec![server("s1", 0), server("s2", 1)];
        let discoveries = vec![
            DiscoveryResult { server_id: "s1".into(), tools: vec![manifest("search")], error: None },
            DiscoveryResult { server_id: "s2".into(), tools: vec![manifest("search")], error: None },
        ];
        let catalog = Catalog::build(&servers, &discoveries);
        assert!(catalog.find_tool("search").is_some());
        assert_eq!(catalog.find_tool("search").unwrap().server_id, "s1");
        assert!(catalog.find_tool("s2_search").is_some());
    }

    #[test]
    fn priority_order_is_deterministic_regardless_of_discovery_order() {
        let servers = vec![server("low", 5), server("high", 0)];
        let discoveries = vec![
            DiscoveryResult { server_id: "low".into(), tools: vec![manifest("x")], error: None },
            DiscoveryResult { server_id: "high".into(), tools: vec![manifest("x")], error: None },
        ];
        let catalog = Catalog::build(&servers, &discoveries);
        assert_eq!(catalog.find_tool("x").unwrap().server_id, "high");
        assert_eq!(catalog.find_tool("low_x").unwrap().server_id, "low");
    }

    #[test]
    fn double_collision_drops_the_tool() {
        let servers = vec![server("a", 0), server("b", 1), server("a_dup", 2)];
        // "a_dup" publishes both "x" (colliding bare) and would collide as "a_dup_x" too
        let discoveries = vec![
            DiscoveryResult { server_id: "a".into(), tools: vec![manifest("x")], error: None },
            DiscoveryResult { server_id: "b".into(), tools: vec![manifest("x")], error: None },
            DiscoveryResult {
                server_id: "a_dup".into(),
                tools: vec![manifest("b_x")],
                error: None,
            },
        ];
        let catalog = Catalog::build(&servers, &discoveries);
        assert!(catalog.find_tool("x").is_some());
        assert!(catalog.find_tool("b_x").is_some());
        // third manifest's "b_x" collides with the prefixed form already taken by "b"'s "x"
        assert_eq!(catalog.tools().len(), 2);
    }

    #[test]
    fn allowed_tools_filters_by_original_name() {
        let mut s = server("s1", 0);
        s.allowed_tools = vec!["keep".to_string()];
        let discoveries = vec![DiscoveryResult {
            server_id: "s1".into(),
            tools: vec![manifest("keep"), manifest("drop")],
            error: None,
        }];
        let catalog = Catalog::build(&[s], &discoveries);
        assert!(catalog.find_tool("keep").is_some());
        assert!(catalog.find_tool("drop").is_none());
    }

    #[test]
    fn failed_discovery_still_builds_from_remaining_servers() {
        let servers = vec![server("down", 0), server("up", 1)];
        let discoveries = vec![
            DiscoveryResult { server_id: "down".into(), tools: vec![], error: Some("timeout".into()) },
            DiscoveryResult { server_id: "up".into(), tools: vec![manifest("ping")], error: None },
        ];
        let catalog = Catalog::build(&servers, &discoveries);
        assert!(catalog.find_tool("ping").is_some());
        assert_eq!(catalog.tools().len(), 1);
    }

    #[test]
    fn tool_definitions_deduplicates_repeated_names() {
        let servers = vec![server("s1", 0)];
        let discoveries = vec![DiscoveryResult {
            server_id: "s1".into(),
            tools: vec![manifest("search")],
            error: None,
        }];
        let catalog = Catalog::build(&servers, &discoveries);
        let once = catalog.tool_definitions(&["search".to_string()]);
        let twice = catalog.tool_definitions(&["search".to_string(), "search".to_string()]);
        assert_eq!(once, twice);
    }

    #[test]
    fn tool_definitions_skips_unknown_names() {
        let catalog = Catalog::build(&[], &[]);
        let defs = catalog.tool_definitions(&["nope".to_string()]);
        assert!(defs.is_empty());
    }

    #[test]
    fn description_truncated_at_first_period() {
        let truncated = truncate_description("Searches the web. Extra detail that should be cut.");
        assert_eq!(truncated, "Searches the web");
    }

    #[test]
    fn description_truncated_at_word_boundary_when_long() {
        let long = "a".repeat(40) + " " + &"b".repeat(60);
        let truncated = truncate_description(&long);
        assert!(truncated.len() <= 80);
        assert!(!truncated.ends_with(' '));
    }

    #[test]
    fn markdown_sensitive_characters_are_escaped() {
        let escaped = escape_markdown("click [here](javascript:x) *now*");
        assert!(!escaped.contains("[here]"));
        assert!(escaped.contains("\\["));
    }

    #[test]
    fn server_id_validation_matches_boundary_rules() {
        let mut s = server("valid-id_123", 0);
        assert!(s.has_valid_id());
        s.id = "bad id!".to_string();
        assert!(!s.has_valid_id());
        s.id = "a".repeat(65);
        assert!(!s.has_valid_id());
    }

    #[test]
    fn server_url_must_be_http_or_https() {
        let mut s = server("s1", 0);
        assert!(s.has_valid_url());
        s.url = "ftp://example.com".to_string();
        assert!(!s.has_valid_url());
    }
}
