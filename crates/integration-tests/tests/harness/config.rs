//! Configuration builder for integration tests
//!
//! Produces TOML text and loads it through the regular config loader, so
//! the tests exercise the same parsing and validation as the binary.

use std::fmt::Write as _;

use synapse_config::Config;

/// Builder for constructing test configurations
pub struct ConfigBuilder {
    chat: Vec<String>,
    providers: String,
}

impl ConfigBuilder {
    /// Create a builder with default chat settings and no providers
    pub fn new() -> Self {
        Self {
            chat: Vec::new(),
            providers: String::new(),
        }
    }

    /// Add an OpenAI-compatible provider pointed at a mock backend
    pub fn with_openai_provider(self, name: &str, base_url: &str) -> Self {
        self.with_provider(name, "openai", base_url)
    }

    /// Add an Anthropic provider pointed at a mock backend
    pub fn with_anthropic_provider(self, name: &str, base_url: &str) -> Self {
        self.with_provider(name, "anthropic", base_url)
    }

    fn with_provider(mut self, name: &str, kind: &str, base_url: &str) -> Self {
        let _ = write!(
            self.providers,
            "\n[llm.providers.{name}]\ntype = \"{kind}\"\napi_key = \"test-key\"\nbase_url = \"{base_url}\"\n"
        );
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.chat.push(format!("max_iterations = {max_iterations}"));
        self
    }

    /// Set the per-call timeout as a duration string, e.g. `"200ms"`
    pub fn with_request_timeout(mut self, timeout: &str) -> Self {
        self.chat.push(format!("request_timeout = \"{timeout}\""));
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Config {
        let mut toml = String::from("[llm.chat]\n");
        for line in &self.chat {
            toml.push_str(line);
            toml.push('\n');
        }
        toml.push_str(&self.providers);

        Config::from_toml(&toml).expect("test configuration is valid")
    }
}
