//! Maps raw executor error text onto client error codes.
//!
//! Rules are checked in order and the first match wins, so a message that
//! mentions both an auth failure and a timeout is reported as auth. Auth
//! rules only match provider credential failures; a local "permission
//! denied" from a tool is retryable.

use std::sync::LazyLock;

use regex::Regex;

use crate::session::ErrorCode;

struct ErrorRule {
    code: ErrorCode,
    regex: Regex,
}

static RULES: LazyLock<Vec<ErrorRule>> = LazyLock::new(|| {
    [
        (
            ErrorCode::AuthenticationError,
            r"(?i)(authentication[\s_-]*(error|failed)|unauthori[sz]ed|invalid[\s_-]*(x-)?api[\s_-]*key|(missing|no|expired)[\s_-]*api[\s_-]*key|api[\s_-]*key[\s_-]*(is[\s_-]*)?(invalid|missing|expired|not[\s_-]*set)|\b401\b|invalid[\s_-]*bearer|oauth[\s_-]*token[\s_-]*(has[\s_-]*)?expired)",
        ),
        (
            ErrorCode::RateLimitError,
            r"(?i)(rate[\s_-]*limit|too many requests|\b429\b|overloaded|quota)",
        ),
        (
            ErrorCode::ContextOverflow,
            r"(?i)(context[\s_-]*(length|window|overflow)|prompt is too long|too many tokens|maximum context|token limit)",
        ),
        (
            ErrorCode::Timeout,
            r"(?i)(timed?[\s_-]*out|timeout|deadline exceeded)",
        ),
        (ErrorCode::McpError, r"(?i)(\bmcp\b|model context protocol)"),
        (
            ErrorCode::ToolError,
            r"(?i)(\btool\b.*(error|fail)|tool_use|tool execution)",
        ),
    ]
    .into_iter()
    .filter_map(|(code, pattern)| {
        Regex::new(pattern)
            .ok()
            .map(|regex| ErrorRule { code, regex })
    })
    .collect()
});

/// Classify an error message. Unmatched text is `INTERNAL_ERROR`.
pub fn classify(message: &str) -> ErrorCode {
    RULES
        .iter()
        .find(|rule| rule.regex.is_match(message))
        .map(|rule| rule.code)
        .unwrap_or(ErrorCode::InternalError)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_table() {
        let cases = [
            ("Invalid API key provided", ErrorCode::AuthenticationError),
            ("HTTP 401 Unauthorized", ErrorCode::AuthenticationError),
            ("Missing API key", ErrorCode::AuthenticationError),
            ("authentication_error: OAuth token has expired", ErrorCode::AuthenticationError),
            ("429 Too Many Requests", ErrorCode::RateLimitError),
            ("rate_limit_error: slow down", ErrorCode::RateLimitError),
            ("Overloaded", ErrorCode::RateLimitError),
            ("prompt is too long: 210000 tokens", ErrorCode::ContextOverflow),
            ("context window exceeded", ErrorCode::ContextOverflow),
            ("Request timed out", ErrorCode::Timeout),
            ("Agent timed out after 30s", ErrorCode::Timeout),
            ("MCP server github failed to start", ErrorCode::McpError),
            ("tool Bash failed with exit code 2", ErrorCode::ToolError),
            ("segmentation fault", ErrorCode::InternalError),
            ("bash: ./deploy.sh: Permission denied", ErrorCode::InternalError),
            ("tool Bash failed: permission denied", ErrorCode::ToolError),
            ("wrote API key docs to README.md", ErrorCode::InternalError),
            ("", ErrorCode::InternalError),
        ];

        for (message, expected) in cases {
            assert_eq!(classify(message), expected, "message: {message:?}");
        }
    }

    #[test]
    fn first_match_wins() {
        assert_eq!(
            classify("authentication failed: request timed out"),
            ErrorCode::AuthenticationError
        );
        assert_eq!(classify("MCP tool call timed out"), ErrorCode::Timeout);
    }

    #[test]
    fn all_rules_compile() {
        assert_eq!(RULES.len(), 6);
    }
}
