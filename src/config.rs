//! Configuration loading.
//!
//! The configuration surface is one JSON-with-comments document. `//` and
//! `/* */` comments are stripped (string-aware) before `serde_json` parses
//! the rest; unknown keys are tolerated and missing keys take their
//! documented defaults. A broken or absent document falls back to the full
//! defaults with a single logged warning — configuration problems never
//! stop the process. API keys come from the environment, never from this
//! file.

use std::path::Path;

use atelier_types::Settings;

/// Default config file name, looked up in the workspace root.
pub const CONFIG_FILE_NAME: &str = "atelier.jsonc";

/// Load settings from the given document path.
pub fn load_settings(path: &Path) -> Settings {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) => {
            if err.kind() == std::io::ErrorKind::NotFound {
                tracing::info!(path = %path.display(), "No config file; using defaults");
            } else {
                tracing::warn!(path = %path.display(), "Failed to read config ({err}); using defaults");
            }
            return Settings::default();
        }
    };
    parse_settings(&text).unwrap_or_else(|err| {
        tracing::warn!(path = %path.display(), "Failed to parse config ({err}); using defaults");
        Settings::default()
    })
}

/// Parse a JSON-with-comments settings document.
pub fn parse_settings(text: &str) -> Result<Settings, serde_json::Error> {
    serde_json::from_str(&strip_jsonc_comments(text))
}

/// Remove `//` line comments and `/* */` block comments, leaving string
/// literals untouched. Comment bytes become spaces so byte offsets in
/// parse errors still point into the original document.
fn strip_jsonc_comments(text: &str) -> String {
    #[derive(Clone, Copy, PartialEq)]
    enum State {
        Code,
        InString,
        Escaped,
        LineComment,
        BlockComment,
    }

    let mut out = String::with_capacity(text.len());
    let mut state = State::Code;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match state {
            State::Code => match c {
                '"' => {
                    state = State::InString;
                    out.push(c);
                }
                '/' if chars.peek() == Some(&'/') => {
                    chars.next();
                    out.push_str("  ");
                    state = State::LineComment;
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    out.push_str("  ");
                    state = State::BlockComment;
                }
                _ => out.push(c),
            },
            State::InString => {
                out.push(c);
                match c {
                    '\\' => state = State::Escaped,
                    '"' => state = State::Code,
                    _ => {}
                }
            }
            State::Escaped => {
                out.push(c);
                state = State::InString;
            }
            State::LineComment => {
                if c == '\n' {
                    out.push(c);
                    state = State::Code;
                } else {
                    out.push(' ');
                }
            }
            State::BlockComment => {
                if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    out.push_str("  ");
                    state = State::Code;
                } else if c == '\n' {
                    out.push(c);
                } else {
                    out.push(' ');
                }
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use atelier_types::{ApiProvider, CodeChangeStrategy, TokenKind};

    use super::*;

    #[test]
    fn strips_comments_outside_strings_only() {
        let text = r#"{
  // line comment
  "a": "keep // this",
  /* block
     comment */
  "b": "and /* this */"
}"#;
        let stripped = strip_jsonc_comments(text);
        let value: serde_json::Value = serde_json::from_str(&stripped).unwrap();
        assert_eq!(value["a"], "keep // this");
        assert_eq!(value["b"], "and /* this */");
    }

    #[test]
    fn parses_the_documented_surface() {
        let text = r#"{
  // which backend serves this process
  "apiProvider": "openai",
  "codeChangeStrategy": "block",
  "optimizeCodeContext": true,
  "maxContextHistoryTurns": 4,
  "enableStreaming": true,
  "displayTokenConsumption": { "enabled": true, "displayTypes": ["prompt", "total"] },
  "modelParameters": {
    "model": "gemini-2.5-pro",
    "temperature": 0.4,
    "topP": 0.95,
    "topK": 64,
    "prompts": { "full": "prompts/full.md", "block": "prompts/block.md" }
  },
  "openaiParameters": {
    "baseURL": "http://localhost:11434/v1",
    "model": "qwen3-coder",
    "temperature": 0.2
  }
}"#;
        let settings = parse_settings(text).unwrap();
        assert_eq!(settings.api_provider, ApiProvider::OpenAi);
        assert_eq!(settings.code_change_strategy, CodeChangeStrategy::Block);
        assert_eq!(settings.max_context_history_turns, 4);
        assert_eq!(
            settings.display_token_consumption.display_types,
            vec![TokenKind::Prompt, TokenKind::Total]
        );
        assert_eq!(settings.model_parameters.top_k, Some(64));
        assert_eq!(settings.openai_parameters.base_url, "http://localhost:11434/v1");
        assert_eq!(settings.openai_parameters.model, "qwen3-coder");
    }

    #[test]
    fn sparse_document_takes_defaults() {
        let settings = parse_settings("{ \"apiProvider\": \"gemini\" }").unwrap();
        assert_eq!(settings.api_provider, ApiProvider::Gemini);
        assert_eq!(settings.max_context_history_turns, -1);
        assert!(settings.enable_streaming);
    }

    #[test]
    fn unknown_keys_are_tolerated() {
        let settings = parse_settings("{ \"futureKey\": 1 }").unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let settings = load_settings(Path::new("/no/such/config.jsonc"));
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn broken_document_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(load_settings(&path), Settings::default());
    }
}
