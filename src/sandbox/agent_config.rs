//! Configuration document handed to the coding agent at launch.
//!
//! Permission rule maps are matched last-rule-wins by the agent. Keys
//! serialize in sorted order, so the `*` catch-all always precedes the
//! specific denials.

use serde_json::{Map, Value, json};

use crate::sandbox::types::LlmProviderConfig;

const CONFIG_SCHEMA: &str = "https://opencode.ai/config.json";
const THINKING_BUDGET_TOKENS: u64 = 16_000;

/// Environment variable the agent reads its inline config from.
pub const CONFIG_CONTENT_ENV: &str = "OPENCODE_CONFIG_CONTENT";

const DENIED_SHELL_COMMANDS: &[&str] = &[
    "rm", "ssh", "scp", "sftp", "ftp", "telnet", "nc", "netcat", "tac", "nl", "od", "xxd",
    "hexdump", "strings", "base64",
];

/// Directories outside the workspace the agent may touch.
#[derive(Debug, Clone)]
pub enum ExternalDirectories {
    Any,
    Only(Vec<String>),
}

fn reasoning_options(provider: &str) -> Option<Value> {
    match provider {
        "openai" | "azure" => Some(json!({ "reasoningEffort": "high" })),
        "anthropic" | "bedrock" => Some(json!({
            "thinking": { "type": "enabled", "budgetTokens": THINKING_BUDGET_TOKENS }
        })),
        "google" => Some(json!({
            "thinking_budget": THINKING_BUDGET_TOKENS,
            "thinking_level": "high"
        })),
        _ => None,
    }
}

fn protect_config_file() -> Value {
    json!({
        "*": "allow",
        "opencode.json": "deny",
        "**/opencode.json": "deny",
    })
}

/// Build the agent's configuration document.
pub fn build_agent_config(
    llm: &LlmProviderConfig,
    disabled_tools: &[String],
    external: &ExternalDirectories,
) -> Value {
    let mut provider = Map::new();
    if let Some(key) = llm.api_key.as_deref().filter(|k| !k.is_empty()) {
        provider.insert("options".into(), json!({ "apiKey": key }));
    }
    if let Some(base) = llm.api_base.as_deref().filter(|b| !b.is_empty()) {
        provider.insert("api".into(), json!(base));
    }
    if let Some(options) = reasoning_options(&llm.provider) {
        let mut models = Map::new();
        models.insert(llm.model_name.clone(), json!({ "options": options }));
        provider.insert("models".into(), Value::Object(models));
    }

    let mut bash = Map::new();
    bash.insert("*".into(), json!("allow"));
    for cmd in DENIED_SHELL_COMMANDS {
        bash.insert((*cmd).into(), json!("deny"));
    }

    let external_directory = match external {
        ExternalDirectories::Any => json!("allow"),
        ExternalDirectories::Only(dirs) => {
            let mut rules = Map::new();
            rules.insert("*".into(), json!("deny"));
            for dir in dirs {
                rules.insert(dir.clone(), json!("allow"));
                rules.insert(format!("{dir}/**"), json!("allow"));
            }
            Value::Object(rules)
        }
    };

    let mut permission = Map::new();
    permission.insert("bash".into(), Value::Object(bash));
    for tool in ["edit", "write", "read", "grep", "glob"] {
        permission.insert(tool.into(), protect_config_file());
    }
    for tool in ["list", "lsp", "patch", "skill", "question", "webfetch"] {
        permission.insert(tool.into(), json!("allow"));
    }
    permission.insert("external_directory".into(), external_directory);
    for tool in disabled_tools {
        permission.insert(tool.clone(), json!("deny"));
    }

    let mut providers = Map::new();
    providers.insert(llm.provider.clone(), Value::Object(provider));

    json!({
        "$schema": CONFIG_SCHEMA,
        "model": format!("{}/{}", llm.provider, llm.model_name),
        "provider": Value::Object(providers),
        "permission": Value::Object(permission),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anthropic() -> LlmProviderConfig {
        let mut llm = LlmProviderConfig::new("anthropic", "claude-sonnet-4-5");
        llm.api_key = Some("sk-test".into());
        llm
    }

    #[test]
    fn model_and_provider() {
        let cfg = build_agent_config(&anthropic(), &[], &ExternalDirectories::Any);
        assert_eq!(cfg["model"], "anthropic/claude-sonnet-4-5");
        assert_eq!(cfg["$schema"], CONFIG_SCHEMA);
        let provider = &cfg["provider"]["anthropic"];
        assert_eq!(provider["options"]["apiKey"], "sk-test");
        assert_eq!(
            provider["models"]["claude-sonnet-4-5"]["options"]["thinking"]["budgetTokens"],
            16_000
        );
    }

    #[test]
    fn reasoning_options_per_provider() {
        let openai = build_agent_config(
            &LlmProviderConfig::new("openai", "gpt-5"),
            &[],
            &ExternalDirectories::Any,
        );
        assert_eq!(
            openai["provider"]["openai"]["models"]["gpt-5"]["options"]["reasoningEffort"],
            "high"
        );

        let other = build_agent_config(
            &LlmProviderConfig::new("ollama", "llama3"),
            &[],
            &ExternalDirectories::Any,
        );
        assert!(other["provider"]["ollama"].get("models").is_none());
        assert!(other["provider"]["ollama"].get("options").is_none());
    }

    #[test]
    fn disabled_tools_are_denied() {
        let cfg = build_agent_config(
            &anthropic(),
            &["question".to_string(), "webfetch".to_string()],
            &ExternalDirectories::Any,
        );
        assert_eq!(cfg["permission"]["question"], "deny");
        assert_eq!(cfg["permission"]["webfetch"], "deny");
        assert_eq!(cfg["permission"]["list"], "allow");
    }

    #[test]
    fn shell_denials_follow_catch_all() {
        let cfg = build_agent_config(&anthropic(), &[], &ExternalDirectories::Any);
        assert_eq!(cfg["permission"]["bash"]["rm"], "deny");
        let text = cfg["permission"]["bash"].to_string();
        let star = text.find("\"*\"").unwrap();
        let rm = text.find("\"rm\"").unwrap();
        assert!(star < rm);
    }

    #[test]
    fn external_directories_whitelist() {
        let cfg = build_agent_config(
            &anthropic(),
            &[],
            &ExternalDirectories::Only(vec!["/workspace/files".into()]),
        );
        let ext = &cfg["permission"]["external_directory"];
        assert_eq!(ext["*"], "deny");
        assert_eq!(ext["/workspace/files"], "allow");
        assert_eq!(ext["/workspace/files/**"], "allow");
    }
}
