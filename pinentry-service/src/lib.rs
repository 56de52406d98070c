//! The pinentry engine: Assuan session, unseal chain and fallback delegation.

pub mod cli;
pub mod fallback;
pub mod process;
pub mod session;

pub use cli::JugglerCli;
pub use fallback::{SystemPinentry, detect_fallback_program};
pub use session::Session;
