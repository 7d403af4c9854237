use indexmap::IndexMap;
use secrecy::SecretString;
use serde::Deserialize;
use url::Url;

use crate::chat::ChatConfig;

/// Top-level LLM configuration
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LlmConfig {
    /// Conversation turn settings
    #[serde(default)]
    pub chat: ChatConfig,
    /// LLM provider configurations keyed by name
    #[serde(default)]
    pub providers: IndexMap<String, LlmProviderConfig>,
}

/// Configuration for a single LLM provider
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LlmProviderConfig {
    /// Provider protocol type
    #[serde(rename = "type")]
    pub provider_type: LlmProviderType,
    /// API key for authentication
    #[serde(default)]
    pub api_key: Option<SecretString>,
    /// Base URL override
    #[serde(default)]
    pub base_url: Option<Url>,
    /// Override for how the response body is framed
    #[serde(default)]
    pub framing: Option<StreamFraming>,
    /// Static headers added to every upstream request
    #[serde(default)]
    pub headers: IndexMap<String, String>,
}

/// Supported LLM provider protocols
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProviderType {
    /// OpenAI-compatible chat completions API
    Openai,
    /// Anthropic Messages API
    Anthropic,
    /// Google Generative Language API
    Google,
}

/// Wire framing of a streamed response body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamFraming {
    /// Standard server-sent events (`event:` / `data:` lines)
    Sse,
    /// Complete JSON objects separated by blank lines
    JsonBlocks,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_table_keeps_declaration_order() {
        let config: LlmConfig = toml::from_str(
            r#"
            [providers.zeta]
            type = "openai"

            [providers.alpha]
            type = "anthropic"
            framing = "json_blocks"
            "#,
        )
        .unwrap();

        let names: Vec<_> = config.providers.keys().cloned().collect();
        assert_eq!(names, ["zeta", "alpha"]);
        assert_eq!(config.providers["alpha"].framing, Some(StreamFraming::JsonBlocks));
        assert_eq!(config.providers["zeta"].provider_type, LlmProviderType::Openai);
    }

    #[test]
    fn unknown_provider_type_is_rejected() {
        let result: Result<LlmConfig, _> = toml::from_str(
            r#"
            [providers.x]
            type = "bedrock"
            "#,
        );
        assert!(result.is_err());
    }
}
