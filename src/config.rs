use std::{env, path::PathBuf, str::FromStr, time::Duration};

use tracing::warn;

use crate::refine::DEFAULT_LEARNING_RATE;

/// Runtime settings, read from the environment (and `.env`) at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub model_dir: PathBuf,
    pub learning_rate: f32,
    pub stream_buffer: usize,
    pub max_iterations: usize,
    pub max_run_duration: Option<Duration>,
    pub serialize_decode: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: 8000,
            model_dir: PathBuf::from("./models/latent_decoder"),
            learning_rate: DEFAULT_LEARNING_RATE,
            stream_buffer: 16,
            max_iterations: 10_000,
            max_run_duration: None,
            serialize_decode: false,
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds settings from any key lookup; malformed values fall back to the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            port: parse_or(&lookup, "PORT", defaults.port),
            model_dir: lookup("MODEL_DIR").map(PathBuf::from).unwrap_or(defaults.model_dir),
            learning_rate: parse_or(&lookup, "LEARNING_RATE", defaults.learning_rate),
            stream_buffer: parse_or(&lookup, "STREAM_BUFFER", defaults.stream_buffer).max(1),
            max_iterations: parse_or(&lookup, "MAX_ITERATIONS", defaults.max_iterations).max(1),
            max_run_duration: lookup("MAX_RUN_SECS")
                .and_then(|raw| parse_value::<u64>("MAX_RUN_SECS", &raw))
                .map(Duration::from_secs),
            serialize_decode: parse_or(&lookup, "SERIALIZE_DECODE", defaults.serialize_decode),
        }
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Option<T> {
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("⚠️ Ignoring malformed {}={:?}", key, raw);
            None
        }
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key).and_then(|raw| parse_value(key, &raw)).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(pairs: &[(&str, &str)]) -> Settings {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Settings::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let s = settings(&[]);
        assert_eq!(s.port, 8000);
        assert_eq!(s.learning_rate, 0.1);
        assert_eq!(s.stream_buffer, 16);
        assert!(s.max_run_duration.is_none());
        assert!(!s.serialize_decode);
    }

    #[test]
    fn reads_and_sanitizes_values() {
        let s = settings(&[
            ("PORT", "9001"),
            ("MODEL_DIR", "/srv/model"),
            ("STREAM_BUFFER", "0"),
            ("MAX_RUN_SECS", "30"),
            ("SERIALIZE_DECODE", "true"),
            ("LEARNING_RATE", "fast"),
        ]);
        assert_eq!(s.port, 9001);
        assert_eq!(s.model_dir, PathBuf::from("/srv/model"));
        assert_eq!(s.stream_buffer, 1);
        assert_eq!(s.max_run_duration, Some(Duration::from_secs(30)));
        assert!(s.serialize_decode);
        assert_eq!(s.learning_rate, 0.1);
    }
}
