//! pinentry-remotejuggler: a pinentry for gpg-agent that answers `GETPIN`
//! from a TPM / Secure Enclave / keychain sealed PIN when the key belongs to
//! a trusted-workstation identity, and otherwise hands the dialog to the
//! system pinentry.
//!
//! # gpg-agent configuration
//!
//! ```text
//! # ~/.gnupg/gpg-agent.conf
//! pinentry-program /usr/local/bin/pinentry-remotejuggler
//! ```
//!
//! # Environment
//!
//! - `PINENTRY_REMOTEJUGGLER_DEBUG=1`: debug logging, also to stderr.
//! - `PINENTRY_REMOTEJUGGLER_FALLBACK`: pinentry to delegate to.
//! - `REMOTE_JUGGLER_BIN`: identity CLI (default `remote-juggler` on `PATH`).
//! - `HSM_LIBRARY_PATH`: explicit `libhsm_remotejuggler` location.

mod bootstrap;
mod logging;
mod settings;

use std::io;

use anyhow::{Context as _, Result};
use pinentry_core::config::default_config_path;
use pinentry_core::{Config, HsmBackend as _};
use pinentry_hsm::HsmLibrary;
use pinentry_service::{JugglerCli, Session, SystemPinentry, detect_fallback_program};
use tokio::io::BufReader;

use crate::settings::Settings;

const EXIT_OK: i32 = 0;
const EXIT_FAILURE: i32 = 1;

fn main() -> ! {
    let code = match run() {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e:#}");
            EXIT_FAILURE
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let settings = Settings::from_env();
    logging::init(settings.debug);
    bootstrap::secure_bootstrap();
    tracing::debug!(pid = std::process::id(), "pinentry-remotejuggler starting");

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    let result = rt.block_on(serve(settings));
    // The stdin reader may still be parked on a blocking read.
    rt.shutdown_background();
    result
}

async fn serve(settings: Settings) -> Result<i32> {
    let config = match default_config_path() {
        Some(path) => Config::load_or_default(&path),
        None => Config::default(),
    };

    let hsm = HsmLibrary::discover(settings.hsm_library.as_deref());
    if hsm.available() {
        tracing::debug!(method = %hsm.method(), path = ?hsm.path(), "HSM available");
    } else {
        tracing::debug!(
            reason = hsm.unavailable_reason().unwrap_or("no supported hardware"),
            "HSM not available"
        );
    }

    let fallback = settings
        .fallback
        .clone()
        .unwrap_or_else(detect_fallback_program);
    tracing::debug!(%fallback, cli = %settings.cli_binary, "collaborators");

    let mut session = Session::new(
        config,
        Box::new(hsm),
        Box::new(JugglerCli::new(settings.cli_binary)),
        Box::new(SystemPinentry::new(fallback)),
    );

    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    tokio::select! {
        result = session.run(stdin, stdout) => match result {
            Ok(()) => Ok(EXIT_OK),
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                tracing::debug!("agent pipe closed");
                Ok(EXIT_OK)
            }
            Err(e) => Err(e).context("agent connection failed"),
        },
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted");
            Ok(EXIT_FAILURE)
        }
    }
}
