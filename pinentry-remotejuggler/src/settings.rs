use std::path::PathBuf;

use pinentry_hsm::LIBRARY_ENV;
use pinentry_service::cli::{CLI_ENV, DEFAULT_CLI};
use pinentry_service::fallback::FALLBACK_ENV;

pub const DEBUG_ENV: &str = "PINENTRY_REMOTEJUGGLER_DEBUG";

/// Process settings, read once from the environment at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub debug: bool,
    /// Fallback pinentry override; detected when unset.
    pub fallback: Option<String>,
    pub cli_binary: String,
    /// HSM library override; searched for when unset.
    pub hsm_library: Option<PathBuf>,
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| get(key).filter(|value| !value.is_empty());
        Self {
            debug: non_empty(DEBUG_ENV).is_some_and(|value| is_truthy(&value)),
            fallback: non_empty(FALLBACK_ENV),
            cli_binary: non_empty(CLI_ENV).unwrap_or_else(|| DEFAULT_CLI.to_string()),
            hsm_library: non_empty(LIBRARY_ENV).map(PathBuf::from),
        }
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}
