//! Object interests
//!
//! Declarative lookups over property dictionaries: "the node whose
//! `object.id` is 42", "any device with `device.api = bluez5`".  Used by the
//! graph mirror and the session item arena alike.

use crate::properties::Properties;

/// A single check against one property key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Constraint {
    Equals(String, String),
    NotEquals(String, String),
    /// Glob match, see [`pattern_matches`]
    Matches(String, String),
    InList(String, Vec<String>),
    IsPresent(String),
    IsAbsent(String),
}

impl Constraint {
    pub fn matches(&self, props: &Properties) -> bool {
        match self {
            Constraint::Equals(key, value) => props.get(key) == Some(value.as_str()),
            Constraint::NotEquals(key, value) => props.get(key) != Some(value.as_str()),
            Constraint::Matches(key, pattern) => props
                .get(key)
                .map(|v| pattern_matches(pattern, v))
                .unwrap_or(false),
            Constraint::InList(key, values) => props
                .get(key)
                .map(|v| values.iter().any(|c| c == v))
                .unwrap_or(false),
            Constraint::IsPresent(key) => props.contains_key(key),
            Constraint::IsAbsent(key) => !props.contains_key(key),
        }
    }
}

/// A conjunction of constraints. An interest without constraints matches
/// everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectInterest {
    constraints: Vec<Constraint>,
}

impl ObjectInterest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    pub fn equals(self, key: &str, value: impl ToString) -> Self {
        self.with(Constraint::Equals(key.to_string(), value.to_string()))
    }

    pub fn matches_glob(self, key: &str, pattern: &str) -> Self {
        self.with(Constraint::Matches(key.to_string(), pattern.to_string()))
    }

    pub fn present(self, key: &str) -> Self {
        self.with(Constraint::IsPresent(key.to_string()))
    }

    pub fn absent(self, key: &str) -> Self {
        self.with(Constraint::IsAbsent(key.to_string()))
    }

    pub fn matches(&self, props: &Properties) -> bool {
        self.constraints.iter().all(|c| c.matches(props))
    }
}

/// Glob matching with wildcards.
/// Supports:
/// - `*` matches any sequence of characters
/// - `?` matches any single character
/// - Plain strings: exact match only
pub fn pattern_matches(pattern: &str, text: &str) -> bool {
    if pattern == "*" {
        return true;
    }

    if !pattern.contains('*') && !pattern.contains('?') {
        return text == pattern;
    }

    let pattern_bytes = pattern.as_bytes();
    let text_bytes = text.as_bytes();
    let m = pattern_bytes.len();
    let n = text_bytes.len();

    let mut dp = vec![vec![false; n + 1]; m + 1];
    dp[0][0] = true;

    for i in 1..=m {
        if pattern_bytes[i - 1] == b'*' {
            dp[i][0] = dp[i - 1][0];
        }
    }

    for i in 1..=m {
        for j in 1..=n {
            if pattern_bytes[i - 1] == b'*' {
                dp[i][j] = dp[i - 1][j] || dp[i][j - 1];
            } else if pattern_bytes[i - 1] == b'?' || pattern_bytes[i - 1] == text_bytes[j - 1] {
                dp[i][j] = dp[i - 1][j - 1];
            }
        }
    }

    dp[m][n]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::properties;

    #[test]
    fn test_pattern_matching() {
        assert!(pattern_matches("bluez_card.*", "bluez_card.00_11_22"));
        assert!(pattern_matches("*", "anything"));
        assert!(pattern_matches("a?sa*", "alsa_output"));
        assert!(pattern_matches("alsa_output", "alsa_output"));
        assert!(!pattern_matches("alsa", "alsa_output"));
        assert!(!pattern_matches("bluez*", "alsa_output"));
    }

    #[test]
    fn test_interest_constraints() {
        let props = properties! {
            "device.api" => "bluez5",
            "device.name" => "bluez_card.00_11",
            "object.id" => 42,
        };

        assert!(ObjectInterest::new().matches(&props));
        assert!(ObjectInterest::new().equals("object.id", 42).matches(&props));
        assert!(!ObjectInterest::new().equals("object.id", 43).matches(&props));
        assert!(
            ObjectInterest::new()
                .equals("device.api", "bluez5")
                .matches_glob("device.name", "bluez_card.*")
                .absent("media.class")
                .matches(&props)
        );
        assert!(!ObjectInterest::new().present("media.class").matches(&props));
        assert!(
            ObjectInterest::new()
                .with(Constraint::InList(
                    "device.api".into(),
                    vec!["alsa".into(), "bluez5".into()]
                ))
                .matches(&props)
        );
        assert!(
            ObjectInterest::new()
                .with(Constraint::NotEquals("device.api".into(), "alsa".into()))
                .matches(&props)
        );
    }
}
