//! Resolved runtime settings shared across crates.
//!
//! These mirror the keys of the JSON-with-comments configuration document.
//! Every field carries a serde default so a sparse or partially-broken
//! document still resolves; the loader in the application crate owns the
//! warn-once-and-fall-back policy.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::event::TokenKind;

/// Which model backend serves this process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiProvider {
    #[default]
    Gemini,
    #[serde(rename = "openai")]
    OpenAi,
}

impl ApiProvider {
    /// Environment variable holding this backend's API key.
    ///
    /// Secrets never live in the config document.
    #[must_use]
    pub const fn env_var(self) -> &'static str {
        match self {
            Self::Gemini => "GEMINI_API_KEY",
            Self::OpenAi => "OPENAI_API_KEY",
        }
    }

    #[must_use]
    pub const fn display_name(self) -> &'static str {
        match self {
            Self::Gemini => "Gemini",
            Self::OpenAi => "OpenAI",
        }
    }
}

/// How the model is asked to return edits.
///
/// `Full` expects complete file bodies in `<change>` records; `Block`
/// expects block bodies keyed by navigational path in `<file_update>`
/// records, and the composer advertises the available paths.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodeChangeStrategy {
    #[default]
    Full,
    Block,
}

/// System-prompt file per strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptPaths {
    #[serde(default)]
    pub full: Option<PathBuf>,
    #[serde(default)]
    pub block: Option<PathBuf>,
}

impl PromptPaths {
    #[must_use]
    pub fn for_strategy(&self, strategy: CodeChangeStrategy) -> Option<&PathBuf> {
        match strategy {
            CodeChangeStrategy::Full => self.full.as_ref(),
            CodeChangeStrategy::Block => self.block.as_ref(),
        }
    }
}

/// Whether and which token counters the client wants surfaced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenDisplay {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_display_types")]
    pub display_types: Vec<TokenKind>,
}

fn default_display_types() -> Vec<TokenKind> {
    vec![TokenKind::Prompt, TokenKind::Output, TokenKind::Total]
}

impl Default for TokenDisplay {
    fn default() -> Self {
        Self {
            enabled: false,
            display_types: default_display_types(),
        }
    }
}

/// Gemini backend parameters (`modelParameters` in the config document).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiParams {
    #[serde(default = "default_gemini_model")]
    pub model: String,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub top_k: Option<u32>,
    #[serde(default)]
    pub prompts: PromptPaths,
}

fn default_gemini_model() -> String {
    "gemini-2.5-flash".to_string()
}

impl Default for GeminiParams {
    fn default() -> Self {
        Self {
            model: default_gemini_model(),
            temperature: None,
            top_p: None,
            top_k: None,
            prompts: PromptPaths::default(),
        }
    }
}

/// OpenAI backend parameters (`openaiParameters` in the config document).
///
/// `base_url` allows OpenAI-compatible servers; the default targets the
/// hosted API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenAiParams {
    #[serde(rename = "baseURL", default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default = "default_openai_model")]
    pub model: String,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub prompts: PromptPaths,
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_openai_model() -> String {
    "gpt-4o-mini".to_string()
}

impl Default for OpenAiParams {
    fn default() -> Self {
        Self {
            base_url: default_openai_base_url(),
            model: default_openai_model(),
            temperature: None,
            top_p: None,
            prompts: PromptPaths::default(),
        }
    }
}

/// The full resolved configuration surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub api_provider: ApiProvider,
    pub code_change_strategy: CodeChangeStrategy,
    pub optimize_code_context: bool,
    /// Window over user turns kept in the prompt: `-1` unbounded, `0` none.
    pub max_context_history_turns: i64,
    pub enable_streaming: bool,
    pub display_token_consumption: TokenDisplay,
    pub model_parameters: GeminiParams,
    pub openai_parameters: OpenAiParams,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_provider: ApiProvider::default(),
            code_change_strategy: CodeChangeStrategy::default(),
            optimize_code_context: true,
            max_context_history_turns: -1,
            enable_streaming: true,
            display_token_consumption: TokenDisplay::default(),
            model_parameters: GeminiParams::default(),
            openai_parameters: OpenAiParams::default(),
        }
    }
}

impl Settings {
    /// The system-prompt path selected by `(apiProvider, strategy)`.
    #[must_use]
    pub fn system_prompt_path(&self) -> Option<&PathBuf> {
        let strategy = self.code_change_strategy;
        match self.api_provider {
            ApiProvider::Gemini => self.model_parameters.prompts.for_strategy(strategy),
            ApiProvider::OpenAi => self.openai_parameters.prompts.for_strategy(strategy),
        }
    }
}
