//! Model context-window tables and token estimation.
//!
//! Limits are matched by case-insensitive substring on the model name.
//! Cloud (Claude) families default high; local families default to a
//! conservative 4096 because an oversized guess makes auto-compaction
//! fire too late.

/// Context limit for cloud (Claude) model names.
pub fn cloud_context_limit(model: &str) -> u64 {
    let model = model.to_lowercase();
    if model.contains("opus") || model.contains("sonnet") || model.contains("haiku") {
        200_000
    } else {
        // Newer Claude models all carry 200K contexts.
        200_000
    }
}

/// Context limit for local model names (Ollama-style).
pub fn local_context_limit(model: &str) -> u64 {
    let model = model.to_lowercase();
    if model.contains("mixtral") {
        32_768
    } else if model.contains("codellama") {
        16_384
    } else if model.contains("llama3") {
        8_192
    } else if model.contains("llama2") {
        4_096
    } else if model.contains("mistral") || model.contains("gemma") {
        8_192
    } else if model.contains("phi") {
        2_048
    } else {
        4_096
    }
}

/// Convert a full model name to a Claude CLI alias.
pub fn normalize_cli_model(model: &str) -> &'static str {
    let model = model.to_lowercase();
    if model.contains("opus") {
        "opus"
    } else if model.contains("haiku") {
        "haiku"
    } else {
        "sonnet"
    }
}

/// Rough token estimate for backends that do not report counts:
/// one token per four characters, rounded up.
pub fn estimate_tokens(s: &str) -> u64 {
    ((s.len() + 3) / 4) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cloud_limits() {
        assert_eq!(cloud_context_limit("claude-3-opus-20240229"), 200_000);
        assert_eq!(cloud_context_limit("claude-sonnet-4-20250514"), 200_000);
        assert_eq!(cloud_context_limit("claude-3-haiku-20240307"), 200_000);
        assert_eq!(cloud_context_limit("anything-else"), 200_000);
    }

    #[test]
    fn test_local_limits() {
        assert_eq!(local_context_limit("llama3.2"), 8_192);
        assert_eq!(local_context_limit("llama2:13b"), 4_096);
        assert_eq!(local_context_limit("mistral-nemo"), 8_192);
        assert_eq!(local_context_limit("mixtral:8x7b"), 32_768);
        assert_eq!(local_context_limit("codellama:34b"), 16_384);
        assert_eq!(local_context_limit("phi3"), 2_048);
        assert_eq!(local_context_limit("gemma2"), 8_192);
        assert_eq!(local_context_limit("qwen2.5"), 4_096);
    }

    #[test]
    fn test_normalize_cli_model() {
        assert_eq!(normalize_cli_model("claude-3-OPUS-20240229"), "opus");
        assert_eq!(normalize_cli_model("claude-3-haiku-20240307"), "haiku");
        assert_eq!(normalize_cli_model("claude-sonnet-4"), "sonnet");
        assert_eq!(normalize_cli_model("gpt-4"), "sonnet");
    }

    #[test]
    fn test_estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("a"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        assert_eq!(estimate_tokens(&"x".repeat(400)), 100);
    }
}
