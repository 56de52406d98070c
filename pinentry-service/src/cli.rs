//! The `remote-juggler` identity CLI as an [`IdentityCli`].

use std::time::Duration;

use pinentry_core::identity::plausible_identity_name;
use pinentry_core::{IdentityCli, Pin};

use crate::process::run_with_timeout;

/// Environment variable overriding the CLI binary.
pub const CLI_ENV: &str = "REMOTE_JUGGLER_BIN";

pub const DEFAULT_CLI: &str = "remote-juggler";

pub struct JugglerCli {
    binary: String,
    lookup_timeout: Duration,
    unseal_timeout: Duration,
}

impl JugglerCli {
    pub const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);
    pub const UNSEAL_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            lookup_timeout: Self::LOOKUP_TIMEOUT,
            unseal_timeout: Self::UNSEAL_TIMEOUT,
        }
    }

    pub fn with_timeouts(mut self, lookup: Duration, unseal: Duration) -> Self {
        self.lookup_timeout = lookup;
        self.unseal_timeout = unseal;
        self
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }
}

#[async_trait::async_trait]
impl IdentityCli for JugglerCli {
    async fn keygrip_to_identity(&self, keygrip: &str) -> Option<String> {
        let output = match run_with_timeout(
            &self.binary,
            &["gpg", "keygrip-to-identity", keygrip],
            None,
            self.lookup_timeout,
        )
        .await
        {
            Ok(output) => output,
            Err(e) => {
                tracing::debug!("identity lookup via CLI failed: {e}");
                return None;
            }
        };
        if !output.success() {
            tracing::debug!(status = %output.status, "CLI could not map {keygrip}");
            return None;
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let name = plausible_identity_name(&stdout).map(str::to_string);
        if name.is_none() {
            tracing::debug!("CLI output for {keygrip} is not an identity name");
        }
        name
    }

    async fn unseal_pin(&self, identity: &str) -> Option<Pin> {
        let output = match run_with_timeout(
            &self.binary,
            &["unseal-pin", identity],
            None,
            self.unseal_timeout,
        )
        .await
        {
            Ok(output) => output,
            Err(e) => {
                tracing::debug!(identity, "CLI unseal failed: {e}");
                return None;
            }
        };
        if !output.success() {
            tracing::debug!(identity, status = %output.status, "CLI unseal refused");
            return None;
        }
        // Borrow, never copy, the raw output: only the trimmed PIN is owned.
        let pin = std::str::from_utf8(&output.stdout).ok()?.trim();
        if pin.is_empty() {
            tracing::debug!(identity, "CLI unseal returned nothing");
            return None;
        }
        Some(Pin::new(pin.to_string()))
    }
}
