//! Subject naming rules
//!
//! Subjects are dot-separated `<aggregate>.<verb>` tokens. Stream patterns use
//! NATS wildcards: `*` matches exactly one token, `>` one or more.

use crate::{BusError, BusResult};

const DURABLE_SUFFIX: &str = "-processor";

/// Check if a concrete subject matches a subscription or stream pattern
///
/// # Examples
/// - `user.>` matches `user.profile.updated`
/// - `user.*` matches `user.created`
/// - `user.*` does NOT match `user.profile.updated` (too many tokens)
pub fn matches_pattern(subject: &str, pattern: &str) -> bool {
    let mut subject_tokens = subject.split('.');
    let mut pattern_tokens = pattern.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Reject subjects that cannot name a durable consumer
pub fn validate_subject(subject: &str) -> BusResult<()> {
    if subject.is_empty() {
        return Err(BusError::InvalidSubject("subject cannot be empty".to_string()));
    }
    if subject
        .chars()
        .any(|c| c == '*' || c == '>' || c.is_whitespace())
    {
        return Err(BusError::InvalidSubject(format!(
            "{} must be a concrete subject without wildcards or whitespace",
            subject
        )));
    }
    if subject.split('.').any(str::is_empty) {
        return Err(BusError::InvalidSubject(format!(
            "{} contains an empty token",
            subject
        )));
    }
    Ok(())
}

/// Durable consumer name for a subject: `user.created` → `user-created-processor`
///
/// Deterministic, so a restarted process reattaches to the same cursor.
pub fn durable_name(subject: &str) -> String {
    format!("{}{}", subject.replace('.', "-"), DURABLE_SUFFIX)
}
