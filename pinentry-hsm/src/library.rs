use std::cell::Cell;
use std::ffi::{CString, c_int};
use std::path::{Path, PathBuf};

use pinentry_core::{HsmBackend, HsmError, HsmMethod, Pin};

use crate::native::{NativeLibrary, PinSlot};

/// Environment variable naming an explicit library path.
pub const LIBRARY_ENV: &str = "HSM_LIBRARY_PATH";

const LIBRARY_STEM: &str = "libhsm_remotejuggler";

/// The HSM binding for this process.
pub struct HsmLibrary {
    binding: Binding,
}

enum Binding {
    Loaded(Loaded),
    Unavailable { reason: String },
}

struct Loaded {
    native: NativeLibrary,
    path: PathBuf,
    method: HsmMethod,
    /// `hsm_initialize` has succeeded once; it is idempotent natively but
    /// there is no reason to repeat it per request.
    initialized: Cell<bool>,
}

impl HsmLibrary {
    /// Load the library at `path` and query its capability.
    ///
    /// Load failures are not errors: they produce an unavailable binding.
    pub fn load(path: &Path) -> Self {
        match NativeLibrary::open(path) {
            Ok(native) => {
                let method = HsmMethod::from_raw(native.available());
                tracing::debug!(path = %path.display(), %method, "loaded HSM library");
                Self {
                    binding: Binding::Loaded(Loaded {
                        native,
                        path: path.to_path_buf(),
                        method,
                        initialized: Cell::new(false),
                    }),
                }
            }
            Err(e) => {
                tracing::debug!("HSM library unusable: {e}");
                Self::unavailable(e.to_string())
            }
        }
    }

    /// Load from `explicit` when given, otherwise from the first existing
    /// entry of [`candidate_paths`].
    pub fn discover(explicit: Option<&Path>) -> Self {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match candidate_paths().into_iter().find(|p| p.exists()) {
            Some(path) => Self::load(&path),
            None => {
                tracing::debug!("no HSM library found in search path");
                Self::unavailable("HSM library not found")
            }
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            binding: Binding::Unavailable {
                reason: reason.into(),
            },
        }
    }

    /// Path of the loaded library, if any.
    pub fn path(&self) -> Option<&Path> {
        match &self.binding {
            Binding::Loaded(lib) => Some(&lib.path),
            Binding::Unavailable { .. } => None,
        }
    }

    /// Why the library is not loaded, if it is not.
    pub fn unavailable_reason(&self) -> Option<&str> {
        match &self.binding {
            Binding::Loaded(_) => None,
            Binding::Unavailable { reason } => Some(reason),
        }
    }

    fn loaded(&self) -> Result<&Loaded, HsmError> {
        match &self.binding {
            Binding::Loaded(lib) if lib.method != HsmMethod::None => Ok(lib),
            _ => Err(HsmError::NotAvailable),
        }
    }
}

impl Loaded {
    fn ensure_initialized(&self) -> Result<(), HsmError> {
        if self.initialized.get() {
            return Ok(());
        }
        if let Some(err) = HsmError::from_code(self.native.initialize()) {
            return Err(err);
        }
        self.initialized.set(true);
        Ok(())
    }
}

impl HsmBackend for HsmLibrary {
    fn available(&self) -> bool {
        self.loaded().is_ok()
    }

    fn method(&self) -> HsmMethod {
        match &self.binding {
            Binding::Loaded(lib) => lib.method,
            Binding::Unavailable { .. } => HsmMethod::None,
        }
    }

    fn pin_exists(&self, identity: &str) -> bool {
        let Ok(lib) = self.loaded() else {
            return false;
        };
        let Ok(identity) = CString::new(identity) else {
            return false;
        };
        lib.native.pin_exists(&identity) == 1
    }

    fn unseal_pin(&self, identity: &str) -> Result<Pin, HsmError> {
        let lib = self.loaded()?;
        let identity = CString::new(identity).map_err(|_| HsmError::InvalidIdentity)?;
        lib.ensure_initialized()?;

        let (rc, slot) = lib.native.unseal_pin(&identity);
        finish_unseal(rc, slot)
    }

    fn error_message(&self, err: HsmError) -> String {
        let native = match &self.binding {
            Binding::Loaded(lib) => lib.native.error_message(err.code()),
            Binding::Unavailable { .. } => None,
        };
        native.unwrap_or_else(|| err.to_string())
    }
}

/// Map the return code of `hsm_unseal_pin` and what its callback captured.
///
/// A native error wins over anything delivered (which is scrubbed on drop).
/// Success still requires exactly one clean, non-empty delivery.
fn finish_unseal(rc: c_int, mut slot: PinSlot) -> Result<Pin, HsmError> {
    if let Some(err) = HsmError::from_code(rc) {
        return Err(err);
    }
    if slot.failed {
        return Err(HsmError::Internal);
    }
    match slot.take() {
        Some(pin) if !pin.is_empty() => Ok(Pin::from_zeroizing(pin)),
        _ => Err(HsmError::UnsealFailed),
    }
}

/// Locations searched for the library, in order.
pub fn candidate_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Ok(exe) = std::env::current_exe()
        && let Some(dir) = exe.parent()
    {
        paths.push(dir.join(format!("{LIBRARY_STEM}.so")));
        paths.push(dir.join(format!("{LIBRARY_STEM}.dylib")));
    }
    paths.push(PathBuf::from(format!("/usr/local/lib/{LIBRARY_STEM}.so")));
    paths.push(PathBuf::from(format!("/usr/local/lib/{LIBRARY_STEM}.dylib")));
    if let Some(home) = std::env::var_os("HOME") {
        let lib = PathBuf::from(home).join(".local/lib");
        paths.push(lib.join(format!("{LIBRARY_STEM}.so")));
        paths.push(lib.join(format!("{LIBRARY_STEM}.dylib")));
    }
    paths.push(PathBuf::from(format!("/usr/lib/{LIBRARY_STEM}.so")));
    paths.push(PathBuf::from(format!("/usr/lib64/{LIBRARY_STEM}.so")));
    paths
}
