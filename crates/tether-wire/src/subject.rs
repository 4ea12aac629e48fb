// Subject validation and wildcard matching.
use crate::{Error, Result};

/// True when every dot-separated token is non-empty and free of whitespace.
pub fn is_valid(subject: &str) -> bool {
    !subject.is_empty()
        && subject
            .split('.')
            .all(|token| !token.is_empty() && !token.contains([' ', '\t', '\r', '\n']))
}

/// A publish subject additionally excludes the `*` and `>` wildcards.
pub fn is_valid_publish(subject: &str) -> bool {
    is_valid(subject)
        && subject
            .split('.')
            .all(|token| token != "*" && token != ">")
}

pub fn ensure(subject: &str) -> Result<()> {
    if is_valid(subject) {
        Ok(())
    } else {
        Err(Error::BadSubject(subject.to_string()))
    }
}

pub fn ensure_publish(subject: &str) -> Result<()> {
    if is_valid_publish(subject) {
        Ok(())
    } else {
        Err(Error::BadSubject(subject.to_string()))
    }
}

/// Wildcard match: `*` spans one token, `>` the remaining tail.
pub fn matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (None, None) => return true,
            (Some(">"), _) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_tokens() {
        assert!(is_valid("orders.new"));
        assert!(is_valid("$JS.API.STREAM.INFO.ORDERS"));
        assert!(!is_valid(""));
        assert!(!is_valid("orders..new"));
        assert!(!is_valid("orders. new"));
        assert!(!is_valid(".orders"));
    }

    #[test]
    fn publish_subjects_reject_wildcards() {
        assert!(is_valid_publish("orders.new"));
        assert!(!is_valid_publish("orders.*"));
        assert!(!is_valid_publish("orders.>"));
    }

    #[test]
    fn wildcard_matching() {
        assert!(matches("orders.*", "orders.new"));
        assert!(!matches("orders.*", "orders.new.eu"));
        assert!(matches("orders.>", "orders.new.eu"));
        assert!(matches(">", "anything.at.all"));
        assert!(!matches("orders.new", "orders.old"));
        assert!(!matches("orders.new.eu", "orders.new"));
    }
}
