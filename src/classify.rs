//! Maps extractor stderr to a message a user can act on.

/// Message used when none of the known failure signatures match.
pub const GENERIC_FAILURE: &str = "Extraction failed. The source may be private or geo-blocked.";

/// One known failure signature. Rules are checked in table order.
pub struct FailureRule {
    pub name: &'static str,
    pub matches: fn(&str) -> bool,
    pub message: &'static str,
}

/// Ordered signature table. The platform-specific rule sits first because
/// its signature is a superset of the generic 403 / no-formats rules.
pub const FAILURE_RULES: &[FailureRule] = &[
    FailureRule {
        name: "platform-block",
        matches: |stderr| {
            stderr.to_lowercase().contains("dailymotion")
                && (stderr.contains("403") || stderr.contains("No video formats"))
        },
        message: "Dailymotion blocks server downloads. Try YouTube instead.",
    },
    FailureRule {
        name: "no-media",
        matches: |stderr| stderr.contains("No video could be found"),
        message: "This URL has no downloadable video (image-only tweet?).",
    },
    FailureRule {
        name: "forbidden",
        matches: |stderr| stderr.contains("403") || stderr.contains("Forbidden"),
        message: "Site blocked the request (403). Try a direct URL.",
    },
    FailureRule {
        name: "no-formats",
        matches: |stderr| {
            stderr.contains("No video formats") || stderr.contains("Unable to extract")
        },
        message: "No downloadable formats found at this URL.",
    },
    FailureRule {
        name: "bot-check",
        matches: looks_like_bot_check,
        message: "Rate limited or login required. Wait a moment and retry.",
    },
    FailureRule {
        name: "bad-url",
        matches: |stderr| {
            stderr.contains("is not a valid URL") || stderr.contains("Unsupported URL")
        },
        message: "Invalid or unsupported URL.",
    },
];

/// Returns the rule that matches `stderr`, if any.
pub fn matching_rule(stderr: &str) -> Option<&'static FailureRule> {
    FAILURE_RULES.iter().find(|rule| (rule.matches)(stderr))
}

pub fn classify_failure(stderr: &str) -> &'static str {
    matching_rule(stderr)
        .map(|rule| rule.message)
        .unwrap_or(GENERIC_FAILURE)
}

pub fn looks_like_bot_check(stderr: &str) -> bool {
    stderr.contains("Sign in") || stderr.contains("bot") || stderr.contains("429")
}
