use std::collections::HashMap;

use anyhow::Result;

/// Full application configuration loaded from environment / .env file.
#[derive(Debug, Clone)]
pub struct Config {
    // Source host
    pub github_token: String,

    // LLM collaborators
    pub gemini_api_key: String,
    pub gemini_model: String,
    /// OpenAI-compatible base URL of the local code model (LM Studio style).
    pub code_model_url: String,
    pub code_model: String,

    // Results delivery
    pub results_webhook_url: String,

    // Ingress
    pub bind: String,
    pub port: u16,

    // Subprocess bounds
    pub command_timeout_s: u64,
    pub test_timeout_s: u64,
}

fn parse_dotenv() -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(".env") else {
        return map;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    map
}

fn get(key: &str, dotenv: &HashMap<String, String>) -> Option<String> {
    std::env::var(key).ok().or_else(|| dotenv.get(key).cloned())
}

fn get_str(key: &str, dotenv: &HashMap<String, String>, default: &str) -> String {
    get(key, dotenv).unwrap_or_else(|| default.to_string())
}

fn get_u16(key: &str, dotenv: &HashMap<String, String>, default: u16) -> u16 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_u64(key: &str, dotenv: &HashMap<String, String>, default: u64) -> u64 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let dotenv = parse_dotenv();

        Ok(Config {
            github_token: get_str("GITHUB_TOKEN", &dotenv, ""),
            gemini_api_key: get_str("GEMINI_API_KEY", &dotenv, ""),
            gemini_model: get_str("GEMINI_MODEL", &dotenv, "gemini-2.5-flash"),
            code_model_url: get_str("LM_STUDIO_URL", &dotenv, "http://localhost:1234/v1"),
            code_model: get_str("CODERM_MODEL", &dotenv, "microsoft/CodeRM-8B-instruct"),
            results_webhook_url: get_str("PIPELINE_RESULTS_WEBHOOK_URL", &dotenv, ""),
            bind: get_str("BIND", &dotenv, "0.0.0.0"),
            port: get_u16("PORT", &dotenv, 8000),
            command_timeout_s: get_u64("COMMAND_TIMEOUT_S", &dotenv, 300),
            test_timeout_s: get_u64("TEST_TIMEOUT_S", &dotenv, 30),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_env() {
        // Only checks defaults for keys that are unset in CI environments.
        let dotenv = HashMap::new();
        assert_eq!(
            get_str("HACKADEMIA_MISSING_KEY", &dotenv, "fallback"),
            "fallback"
        );
        assert_eq!(get_u16("HACKADEMIA_MISSING_PORT", &dotenv, 8000), 8000);
        assert_eq!(get_u64("HACKADEMIA_MISSING_T", &dotenv, 300), 300);
    }

    #[test]
    fn dotenv_value_used_when_env_absent() {
        let mut dotenv = HashMap::new();
        dotenv.insert("HACKADEMIA_ONLY_DOTENV".to_string(), "42".to_string());
        assert_eq!(get_u64("HACKADEMIA_ONLY_DOTENV", &dotenv, 0), 42);
    }
}
