// THEORY:
// Every trigger stage is configured by a short string of the form
//
//     name;key=value;key=value
//
// so that a whole stage can be swapped remotely with a single value. The
// parser is deliberately forgiving: unknown keys are kept but ignored by the
// stages, and a value that does not parse as the requested type falls back to
// the caller's default with a warning. Parsing itself never fails.
//
// Multi-step stages (precalibration) chain several configs with `->`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerConfig {
    name: String,
    options: BTreeMap<String, String>,
}

impl TriggerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: BTreeMap::new(),
        }
    }

    pub fn parse(raw: &str) -> Self {
        let mut parts = raw.split(';').map(str::trim).filter(|p| !p.is_empty());
        let name = match parts.next() {
            // Accept an explicit `name=foo` as the leading item too.
            Some(first) => first
                .strip_prefix("name=")
                .unwrap_or(first)
                .to_ascii_lowercase(),
            None => String::new(),
        };
        let mut options = BTreeMap::new();
        for part in parts {
            match part.split_once('=') {
                Some((key, value)) => {
                    options.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
                }
                None => log::warn!("ignoring malformed trigger option '{}' in '{}'", part, raw),
            }
        }
        Self { name, options }
    }

    /// Parses `a;k=v -> b;k=v` into its steps.
    pub fn parse_list(raw: &str) -> Vec<Self> {
        raw.split("->")
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Self::parse)
            .collect()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    pub fn get_f64(&self, key: &str, default: f64) -> f64 {
        self.get_parsed(key, default)
    }

    pub fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.get_parsed(key, default)
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get_str(key).map(str::to_ascii_lowercase).as_deref() {
            None => default,
            Some("true" | "1" | "yes" | "on") => true,
            Some("false" | "0" | "no" | "off") => false,
            Some(other) => {
                log::warn!(
                    "{}: invalid boolean '{}' for '{}', using {}",
                    self.name,
                    other,
                    key,
                    default
                );
                default
            }
        }
    }

    /// Returns a copy with `key` set to `value`.
    pub fn with_option(mut self, key: &str, value: impl ToString) -> Self {
        self.options
            .insert(key.to_ascii_lowercase(), value.to_string());
        self
    }

    fn get_parsed<T: FromStr + fmt::Display + Copy>(&self, key: &str, default: T) -> T {
        match self.get_str(key) {
            None => default,
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                log::warn!(
                    "{}: invalid value '{}' for '{}', using {}",
                    self.name,
                    raw,
                    key,
                    default
                );
                default
            }),
        }
    }
}

impl fmt::Display for TriggerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for (key, value) in &self.options {
            write!(f, ";{}={}", key, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_name_and_options() {
        let config = TriggerConfig::parse("maxn; npix=25 ;Extra=yes");
        assert_eq!(config.name(), "maxn");
        assert_eq!(config.get_u64("npix", 500), 25);
        assert!(config.get_bool("extra", false));
        assert_eq!(config.get_u64("missing", 7), 7);
    }

    #[test]
    fn malformed_numbers_fall_back_to_default() {
        let config = TriggerConfig::parse("default;prescale=abc;windowsize=-3;flag=maybe");
        assert_eq!(config.get_f64("prescale", 0.001), 0.001);
        assert_eq!(config.get_u64("windowsize", 10), 10);
        assert!(config.get_bool("flag", true));
    }

    #[test]
    fn display_round_trips_through_parse() {
        let config = TriggerConfig::parse("facedown;orient=10;mean=12")
            .with_option("std", 30);
        let again = TriggerConfig::parse(&config.to_string());
        assert_eq!(config, again);
        assert_eq!(config.to_string(), "facedown;mean=12;orient=10;std=30");
    }

    #[test]
    fn splits_step_lists() {
        let steps = TriggerConfig::parse_list("hotcell;maxframes=100 -> weighting;maxframes=50");
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1].name(), "weighting");
        assert_eq!(steps[1].get_u64("maxframes", 0), 50);
    }

    #[test]
    fn empty_string_parses_to_nameless_config() {
        let config = TriggerConfig::parse("");
        assert_eq!(config.name(), "");
        assert_eq!(config.get_f64("anything", 1.5), 1.5);
    }
}
