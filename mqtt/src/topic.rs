//! Topic names and topic filters.
//!
//! - `+` matches exactly one topic level
//! - `#` matches any number of remaining levels, including none (must be last)
//! - filters starting with a wildcard never match topics starting with `$`

use crate::error::{Error, Result};

/// Maximum length of a topic name or filter on the wire.
pub const MAX_TOPIC_LEN: usize = 65535;

/// Validate a topic name used for publishing.
pub fn validate_topic(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(Error::InvalidTopic("empty topic".to_string()));
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(Error::InvalidTopic(format!("topic of {} bytes", topic.len())));
    }
    if topic.contains(['+', '#']) {
        return Err(Error::InvalidTopic(format!("wildcard in topic {:?}", topic)));
    }
    if topic.contains('\0') {
        return Err(Error::InvalidTopic("NUL character in topic".to_string()));
    }
    Ok(())
}

/// Validate a topic filter used for subscribing.
pub fn validate_filter(filter: &str) -> Result<()> {
    if filter.is_empty() {
        return Err(Error::InvalidTopicFilter("empty filter".to_string()));
    }
    if filter.len() > MAX_TOPIC_LEN {
        return Err(Error::InvalidTopicFilter(format!("filter of {} bytes", filter.len())));
    }
    if filter.contains('\0') {
        return Err(Error::InvalidTopicFilter("NUL character in filter".to_string()));
    }

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        match level {
            "#" if levels.peek().is_some() => {
                return Err(Error::InvalidTopicFilter(format!(
                    "# must be the last level in {:?}",
                    filter
                )));
            }
            "#" | "+" => {}
            _ if level.contains(['+', '#']) => {
                return Err(Error::InvalidTopicFilter(format!(
                    "wildcard must occupy a whole level in {:?}",
                    filter
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Check whether `topic` matches `filter` by the MQTT matching rule.
///
/// Both arguments are assumed valid; see [`validate_topic`] and
/// [`validate_filter`].
pub fn matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && filter.starts_with(['+', '#']) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_topic() {
        assert!(validate_topic("test/topic").is_ok());
        assert!(validate_topic("/leading/slash").is_ok());
        assert!(validate_topic("$SYS/broker").is_ok());
        assert!(validate_topic("").is_err());
        assert!(validate_topic("a/+/b").is_err());
        assert!(validate_topic("a/#").is_err());
    }

    #[test]
    fn test_validate_filter() {
        for ok in ["#", "+", "a/#", "a/+/b", "+/+", "/", "a//b", "$SYS/#"] {
            assert!(validate_filter(ok).is_ok(), "{} should be valid", ok);
        }
        for bad in ["", "a/#/b", "a#", "a/b+", "+a/b", "#/"] {
            assert!(validate_filter(bad).is_err(), "{} should be invalid", bad);
        }
    }

    #[test]
    fn test_single_level_wildcard() {
        assert!(matches("device/+/state", "device/gear-001/state"));
        assert!(matches("device/+/state", "device//state"));
        assert!(!matches("device/+/state", "device/state"));
        assert!(!matches("device/+/state", "device/a/b/state"));
        assert!(matches("+", "a"));
        assert!(!matches("+", "a/b"));
        assert!(matches("+/+", "/a"));
    }

    #[test]
    fn test_multi_level_wildcard() {
        assert!(matches("device/#", "device"));
        assert!(matches("device/#", "device/a"));
        assert!(matches("device/#", "device/a/b/c"));
        assert!(!matches("device/#", "devices/a"));
        assert!(matches("#", "a/b/c"));
        assert!(matches("device/+/events/#", "device/x/events"));
        assert!(!matches("device/+/events/#", "device/events/click"));
    }

    #[test]
    fn test_dollar_topics() {
        assert!(!matches("#", "$SYS/uptime"));
        assert!(!matches("+/uptime", "$SYS/uptime"));
        assert!(matches("$SYS/#", "$SYS/uptime"));
    }

    #[test]
    fn test_exact_match() {
        assert!(matches("test/topic", "test/topic"));
        assert!(!matches("test/topic", "test/topic/more"));
        assert!(!matches("test/topic/more", "test/topic"));
        assert!(!matches("Test/topic", "test/topic"));
    }
}
