//! String property dictionaries
//!
//! Mirrors the `spa_dict` key/value maps the media server attaches to every
//! global. Ordered so debug output and exported descriptions are stable.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Build a [`Properties`] map from `key => value` pairs.
///
/// ```
/// let props = sessionbay::properties! {
///     "node.name" => "alsa_output.pci",
///     "priority" => 1000,
/// };
/// assert_eq!(props.get("priority"), Some("1000"));
/// ```
#[macro_export]
macro_rules! properties {
    () => { $crate::Properties::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut props = $crate::Properties::new();
        $( props.set($key, $value.to_string()); )+
        props
    }};
}

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Properties {
    map: BTreeMap<String, String>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.map.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.map.remove(key)
    }

    /// Merge `other` into `self`, overwriting existing keys.
    pub fn update(&mut self, other: &Properties) {
        for (k, v) in &other.map {
            self.map.insert(k.clone(), v.clone());
        }
    }

    /// Copy only `keys` from `other`, skipping the ones it doesn't have.
    pub fn update_keys(&mut self, other: &Properties, keys: &[&str]) {
        for key in keys {
            if let Some(v) = other.get(key) {
                self.set(*key, v);
            }
        }
    }

    /// Parse a value, logging when it is present but malformed.
    pub fn parse<T: FromStr>(&self, key: &str) -> Option<T> {
        let raw = self.get(key)?;
        match raw.trim().parse() {
            Ok(v) => Some(v),
            Err(_) => {
                log::warn!("Property {key}: cannot parse {raw:?}");
                None
            }
        }
    }

    /// PipeWire booleans: "true" or "1".
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key)
            .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl fmt::Debug for Properties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.map.iter()).finish()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Properties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            map: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_and_update_keys() {
        let mut a = properties! { "a" => "1", "b" => "2" };
        let b = properties! { "b" => "3", "c" => "4" };
        a.update(&b);
        assert_eq!(a.get("b"), Some("3"));
        assert_eq!(a.get("c"), Some("4"));

        let mut c = Properties::new();
        c.update_keys(&a, &["a", "missing"]);
        assert_eq!(c.len(), 1);
        assert_eq!(c.get("a"), Some("1"));
    }

    #[test]
    fn test_parse_and_bool() {
        let props = properties! {
            "rate" => 48000,
            "bad" => "forty",
            "on" => "true",
            "one" => "1",
            "off" => "false",
        };
        assert_eq!(props.parse::<u32>("rate"), Some(48000));
        assert_eq!(props.parse::<u32>("bad"), None);
        assert_eq!(props.parse::<u32>("missing"), None);
        assert_eq!(props.get_bool("on"), Some(true));
        assert_eq!(props.get_bool("one"), Some(true));
        assert_eq!(props.get_bool("off"), Some(false));
        assert_eq!(props.get_bool("missing"), None);
    }

    #[test]
    fn test_serde_transparent() {
        let props = properties! { "media.class" => "Audio/Sink" };
        let json = serde_json::to_string(&props).unwrap();
        assert_eq!(json, r#"{"media.class":"Audio/Sink"}"#);
        let back: Properties = serde_json::from_str(&json).unwrap();
        assert_eq!(back, props);
    }
}
