// knndb-core/src/config.rs
// Process-wide configuration

use std::path::PathBuf;

/// Hard cap on live documents per storage segment unless overridden.
pub const DEFAULT_MAX_STORAGE_ELEMENTS: usize = 50_000;

/// String spellings accepted as `true` in request parameters and CLI flags.
const TRUE_WRITINGS: [&str; 7] = ["true", "True", "1", "yes", "Yes", "on", "On"];

/// Process-wide settings.
///
/// `api_port` and `api_address` are carried for the HTTP layer embedding
/// this crate; the core itself only consumes `data_path` and
/// `max_storage_elements`.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_path: PathBuf,
    pub api_port: u16,
    pub api_address: String,
    pub max_storage_elements: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_path: PathBuf::from("./data"),
            api_port: 3399,
            api_address: "127.0.0.1".to_string(),
            max_storage_elements: DEFAULT_MAX_STORAGE_ELEMENTS,
        }
    }
}

impl Config {
    pub fn with_data_path(data_path: impl Into<PathBuf>) -> Self {
        Config {
            data_path: data_path.into(),
            ..Config::default()
        }
    }
}

/// True iff `s` is one of the accepted truthy spellings.
pub fn is_truthy(s: &str) -> bool {
    TRUE_WRITINGS.contains(&s)
}
