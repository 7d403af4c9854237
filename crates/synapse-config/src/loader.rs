use std::path::Path;

use secrecy::ExposeSecret;

use crate::{Config, LlmProviderType};

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Reads the file, expands `{{ env.VAR }}` placeholders, then
    /// deserializes and validates the result.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, a placeholder cannot be
    /// expanded, the TOML is malformed, or validation fails
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", path.display()))?;

        Self::from_toml(&raw)
    }

    /// Parse and validate configuration from TOML text
    ///
    /// # Errors
    ///
    /// Returns an error if expansion, parsing, or validation fails
    pub fn from_toml(raw: &str) -> anyhow::Result<Self> {
        let expanded =
            crate::env::expand_env(raw).map_err(|e| anyhow::anyhow!("config variable expansion failed: {e}"))?;

        let config: Self = toml::from_str(&expanded).map_err(|e| anyhow::anyhow!("failed to parse config: {e}"))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate that the configuration is internally consistent
    ///
    /// # Errors
    ///
    /// Returns an error if no provider is configured, a provider is
    /// unusable, or the conversation settings are out of range
    pub fn validate(&self) -> anyhow::Result<()> {
        self.validate_providers()?;
        self.validate_chat()?;
        Ok(())
    }

    fn validate_providers(&self) -> anyhow::Result<()> {
        if self.llm.providers.is_empty() {
            anyhow::bail!("at least one LLM provider must be configured under [llm.providers]");
        }

        for (name, provider) in &self.llm.providers {
            // Hosted APIs require a key unless pointed at a custom endpoint
            let has_key = provider
                .api_key
                .as_ref()
                .is_some_and(|k| !k.expose_secret().is_empty());

            if !has_key && provider.base_url.is_none() {
                anyhow::bail!("LLM provider '{name}' needs an api_key or a base_url");
            }

            if provider.provider_type == LlmProviderType::Anthropic && !has_key {
                tracing::warn!(provider = %name, "anthropic provider configured without an api_key");
            }

            for header in provider.headers.keys() {
                http::HeaderName::from_bytes(header.as_bytes())
                    .map_err(|e| anyhow::anyhow!("invalid header name '{header}' for provider '{name}': {e}"))?;
            }
        }

        Ok(())
    }

    fn validate_chat(&self) -> anyhow::Result<()> {
        let chat = &self.llm.chat;

        if chat.request_timeout()?.is_zero() {
            anyhow::bail!("llm.chat.request_timeout must be greater than 0");
        }

        if chat.max_iterations == 0 {
            anyhow::bail!("llm.chat.max_iterations must be greater than 0");
        }

        if chat.event_buffer == 0 {
            anyhow::bail!("llm.chat.event_buffer must be greater than 0");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{Config, LogFormat};

    #[test]
    fn minimal_config_loads() {
        let config = Config::from_toml(
            r#"
            [llm.providers.openai]
            type = "openai"
            api_key = "sk-test"
            "#,
        )
        .unwrap();

        assert_eq!(config.llm.providers.len(), 1);
        assert_eq!(config.llm.chat.max_iterations, 10);
        assert!(config.telemetry.is_none());
    }

    #[test]
    fn full_config_loads() {
        let config = Config::from_toml(
            r#"
            [telemetry]
            log_filter = "debug"
            format = "json"

            [llm.chat]
            request_timeout = "30s"
            max_iterations = 3
            event_buffer = 16

            [llm.providers.local]
            type = "openai"
            base_url = "http://localhost:11434/v1"
            framing = "json_blocks"

            [llm.providers.local.headers]
            x-tenant = "acme"
            "#,
        )
        .unwrap();

        let telemetry = config.telemetry.unwrap();
        assert_eq!(telemetry.format, LogFormat::Json);
        assert_eq!(config.llm.chat.max_iterations, 3);
        assert_eq!(config.llm.providers["local"].headers["x-tenant"], "acme");
    }

    #[test]
    fn empty_provider_table_is_rejected() {
        let err = Config::from_toml("").unwrap_err();
        assert!(err.to_string().contains("at least one LLM provider"));
    }

    #[test]
    fn provider_without_key_or_url_is_rejected() {
        let err = Config::from_toml(
            r#"
            [llm.providers.openai]
            type = "openai"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("api_key or a base_url"));
    }

    #[test]
    fn zero_iterations_is_rejected() {
        let err = Config::from_toml(
            r#"
            [llm.chat]
            max_iterations = 0

            [llm.providers.openai]
            type = "openai"
            api_key = "sk"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("max_iterations"));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let err = Config::from_toml(
            r#"
            [llm.chat]
            request_timeout = "0s"

            [llm.providers.openai]
            type = "openai"
            api_key = "sk"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("request_timeout"));
    }

    #[test]
    fn unknown_top_level_key_is_rejected() {
        let err = Config::from_toml(
            r#"
            [server]
            listen_address = "0.0.0.0:80"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("failed to parse config"));
    }

    #[test]
    fn env_placeholders_are_expanded_before_parsing() {
        temp_env::with_var("SYN_LOADER_KEY", Some("sk-env"), || {
            let config = Config::from_toml(
                r#"
                [llm.providers.anthropic]
                type = "anthropic"
                api_key = "{{ env.SYN_LOADER_KEY }}"
                "#,
            )
            .unwrap();
            assert!(config.llm.providers["anthropic"].api_key.is_some());
        });
    }
}
