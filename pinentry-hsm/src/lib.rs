//! Binding to the remote-juggler HSM library (`libhsm_remotejuggler`).
//!
//! The library is optional: when it cannot be found or loaded the binding is
//! [`HsmLibrary::unavailable`] and every operation fails fast with
//! [`HsmError::NotAvailable`](pinentry_core::HsmError::NotAvailable).

mod library;
mod native;

pub use library::{HsmLibrary, LIBRARY_ENV, candidate_paths};
pub use native::LoadError;
