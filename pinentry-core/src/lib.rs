use std::fmt;

use zeroize::Zeroizing;

pub mod assuan;
pub mod config;
pub mod identity;
pub mod state;

pub use config::{Config, Identity, SecurityMode};
pub use identity::{IdentityCache, IdentityResolver};
pub use state::SessionState;

/// Crate-wide mutex used by tests that mutate `XDG_CONFIG_HOME` / `HOME`.
#[cfg(test)]
pub(crate) static TEST_ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());

// ---------------------------------------------------------------------------
// PIN
// ---------------------------------------------------------------------------

/// A PIN on its way from exactly one source to the agent.
///
/// Intentionally neither `Clone` nor `Serialize`: a `Pin` has one owner at a
/// time and is scrubbed from memory when that owner drops it.
pub struct Pin(Zeroizing<String>);

impl Pin {
    pub fn new(pin: String) -> Self {
        Self(Zeroizing::new(pin))
    }

    /// Wrap an already-zeroizing buffer (avoids a plain copy).
    pub fn from_zeroizing(pin: Zeroizing<String>) -> Self {
        Self(pin)
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Pin([redacted])")
    }
}

// ---------------------------------------------------------------------------
// HSM capability model
// ---------------------------------------------------------------------------

/// Hardware backing detected by the native library (`hsm_method_t`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HsmMethod {
    #[default]
    None,
    Tpm,
    SecureEnclave,
    Keychain,
}

impl HsmMethod {
    /// Map the raw `hsm_available()` return value. Unknown values are `None`.
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            1 => Self::Tpm,
            2 => Self::SecureEnclave,
            3 => Self::Keychain,
            _ => Self::None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Tpm => "TPM 2.0",
            Self::SecureEnclave => "Secure Enclave",
            Self::Keychain => "Software Keychain",
        }
    }
}

impl fmt::Display for HsmMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Failure codes of the native HSM library (`hsm_error_t`).
///
/// The display strings form the static message table used whenever the
/// native library cannot supply its own text.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HsmError {
    #[error("HSM hardware not available")]
    NotAvailable,
    #[error("HSM not initialized")]
    NotInitialized,
    #[error("Invalid identity name")]
    InvalidIdentity,
    #[error("Failed to seal/encrypt PIN")]
    SealFailed,
    #[error("Failed to unseal/decrypt PIN")]
    UnsealFailed,
    #[error("No PIN stored for identity")]
    NotFound,
    #[error("Authentication/authorization failed")]
    AuthFailed,
    #[error("TPM PCR values changed (boot state)")]
    PcrMismatch,
    #[error("Memory allocation failed")]
    Memory,
    #[error("I/O error")]
    Io,
    #[error("Permission denied")]
    Permission,
    #[error("Operation timed out")]
    Timeout,
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Internal error")]
    Internal,
    #[error("Unknown error ({0})")]
    Unknown(i32),
}

impl HsmError {
    /// Translate a native return code. `0` is success and yields `None`.
    pub fn from_code(code: i32) -> Option<Self> {
        let err = match code {
            0 => return None,
            1 => Self::NotAvailable,
            2 => Self::NotInitialized,
            3 => Self::InvalidIdentity,
            4 => Self::SealFailed,
            5 => Self::UnsealFailed,
            6 => Self::NotFound,
            7 => Self::AuthFailed,
            8 => Self::PcrMismatch,
            9 => Self::Memory,
            10 => Self::Io,
            11 => Self::Permission,
            12 => Self::Timeout,
            13 => Self::Cancelled,
            99 => Self::Internal,
            other => Self::Unknown(other),
        };
        Some(err)
    }

    pub fn code(self) -> i32 {
        match self {
            Self::NotAvailable => 1,
            Self::NotInitialized => 2,
            Self::InvalidIdentity => 3,
            Self::SealFailed => 4,
            Self::UnsealFailed => 5,
            Self::NotFound => 6,
            Self::AuthFailed => 7,
            Self::PcrMismatch => 8,
            Self::Memory => 9,
            Self::Io => 10,
            Self::Permission => 11,
            Self::Timeout => 12,
            Self::Cancelled => 13,
            Self::Internal => 99,
            Self::Unknown(code) => code,
        }
    }

    /// The binding can never succeed again in this process.
    pub fn is_permanent(self) -> bool {
        matches!(self, Self::NotAvailable | Self::NotInitialized)
    }
}

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// Hardware-backed PIN store.
///
/// The implementation owns the unsafe native boundary; callers only ever see
/// owned values. A binding that failed to load reports `available() == false`
/// and answers every other call with [`HsmError::NotAvailable`] without
/// touching native code.
pub trait HsmBackend {
    fn available(&self) -> bool;

    fn method(&self) -> HsmMethod;

    /// Whether a sealed PIN exists for `identity`. Any failure reads as `false`.
    fn pin_exists(&self, identity: &str) -> bool;

    /// Release the sealed PIN for `identity`. The returned value must be
    /// handed to exactly one consumer and never logged.
    fn unseal_pin(&self, identity: &str) -> Result<Pin, HsmError>;

    /// Human-readable text for `err`, preferring the native message table.
    fn error_message(&self, err: HsmError) -> String {
        err.to_string()
    }
}

/// The identity-management CLI, used as a last-resort resolver and as the
/// second unseal strategy.
#[async_trait::async_trait]
pub trait IdentityCli: Send + Sync {
    /// `<cli> gpg keygrip-to-identity <keygrip>`; `None` unless the CLI exits
    /// zero with a plausible identity name on stdout.
    async fn keygrip_to_identity(&self, keygrip: &str) -> Option<String>;

    /// `<cli> unseal-pin <identity>`; `None` unless the CLI exits zero with a
    /// non-empty PIN on stdout.
    async fn unseal_pin(&self, identity: &str) -> Option<Pin>;
}

/// The interactive prompt the session falls back to.
///
/// Every method replays `state` to the prompt first. Failures of any kind are
/// reported as cancellation.
#[async_trait::async_trait]
pub trait PromptDelegate: Send + Sync {
    async fn get_pin(&self, state: &SessionState) -> Option<Pin>;

    async fn confirm(&self, state: &SessionState) -> bool;

    async fn message(&self, state: &SessionState);
}
