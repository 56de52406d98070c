//! Raw `dlopen` binding to `libhsm_remotejuggler`.
//!
//! C contract (`hsm.h`):
//! ```c
//! typedef int (*hsm_pin_callback_t)(const uint8_t* pin, size_t pin_len, void* user_data);
//! hsm_method_t hsm_available(void);
//! hsm_error_t  hsm_initialize(void);
//! int          hsm_pin_exists(const char* identity);          /* 1, 0 or -1 */
//! hsm_error_t  hsm_unseal_pin(const char* identity, hsm_pin_callback_t cb, void* user_data);
//! const char*  hsm_error_message(hsm_error_t error);
//! ```
//! The library clears its copy of the PIN as soon as the callback returns, so
//! the callback copies it into a zeroizing buffer owned by Rust first.

use std::ffi::{CStr, CString, c_char, c_int, c_void};
use std::os::unix::ffi::OsStrExt as _;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use zeroize::Zeroizing;

type PinCallback = unsafe extern "C" fn(*const u8, usize, *mut c_void) -> c_int;
type AvailableFn = unsafe extern "C" fn() -> c_int;
type InitializeFn = unsafe extern "C" fn() -> c_int;
type PinExistsFn = unsafe extern "C" fn(*const c_char) -> c_int;
type UnsealPinFn = unsafe extern "C" fn(*const c_char, PinCallback, *mut c_void) -> c_int;
type ErrorMessageFn = unsafe extern "C" fn(c_int) -> *const c_char;

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("library path contains a NUL byte: {0}")]
    InvalidPath(PathBuf),
    #[error("dlopen {path}: {reason}")]
    Open { path: PathBuf, reason: String },
    #[error("{path} does not export {symbol}")]
    MissingSymbol { path: PathBuf, symbol: String },
}

/// A `dlopen` handle, closed on drop.
struct Handle(NonNull<c_void>);

impl Drop for Handle {
    fn drop(&mut self) {
        // SAFETY: the handle came from a successful dlopen and is closed once.
        unsafe {
            libc::dlclose(self.0.as_ptr());
        }
    }
}

/// Entry points resolved from a loaded library.
///
/// The function pointers stay valid for as long as `_handle` is open, which
/// is the lifetime of this value.
pub(crate) struct NativeLibrary {
    available: AvailableFn,
    initialize: InitializeFn,
    pin_exists: PinExistsFn,
    unseal_pin: UnsealPinFn,
    error_message: ErrorMessageFn,
    _handle: Handle,
}

impl NativeLibrary {
    pub(crate) fn open(path: &Path) -> Result<Self, LoadError> {
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| LoadError::InvalidPath(path.to_path_buf()))?;

        // SAFETY: c_path is NUL-terminated and outlives the call.
        let raw = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
        let handle = NonNull::new(raw).map(Handle).ok_or_else(|| LoadError::Open {
            path: path.to_path_buf(),
            reason: last_dl_error(),
        })?;

        // SAFETY: each type alias matches the prototype in hsm.h.
        unsafe {
            Ok(Self {
                available: symbol(&handle, path, c"hsm_available")?,
                initialize: symbol(&handle, path, c"hsm_initialize")?,
                pin_exists: symbol(&handle, path, c"hsm_pin_exists")?,
                unseal_pin: symbol(&handle, path, c"hsm_unseal_pin")?,
                error_message: symbol(&handle, path, c"hsm_error_message")?,
                _handle: handle,
            })
        }
    }

    pub(crate) fn available(&self) -> c_int {
        // SAFETY: no arguments; resolved from the open library.
        unsafe { (self.available)() }
    }

    pub(crate) fn initialize(&self) -> c_int {
        // SAFETY: no arguments; resolved from the open library.
        unsafe { (self.initialize)() }
    }

    pub(crate) fn pin_exists(&self, identity: &CStr) -> c_int {
        // SAFETY: identity is a valid NUL-terminated string for the whole call.
        unsafe { (self.pin_exists)(identity.as_ptr()) }
    }

    /// Returns the native error code and whatever the callback captured.
    pub(crate) fn unseal_pin(&self, identity: &CStr) -> (c_int, PinSlot) {
        let mut slot = PinSlot::default();
        let user_data: *mut PinSlot = &mut slot;
        // SAFETY: `slot` outlives the call and is only reached through
        // `user_data` until it returns; the library invokes the callback
        // synchronously.
        let rc = unsafe { (self.unseal_pin)(identity.as_ptr(), receive_pin, user_data.cast()) };
        (rc, slot)
    }

    /// The library's own message for `code`, if it has a usable one.
    pub(crate) fn error_message(&self, code: c_int) -> Option<String> {
        // SAFETY: returns a pointer to a static string or NULL.
        let ptr = unsafe { (self.error_message)(code) };
        // SAFETY: non-null pointers from hsm_error_message are static C strings.
        unsafe { usable_message(ptr) }
    }
}

/// `ptr` as an owned message, unless it is NULL, not UTF-8, empty, or the
/// library's generic `"Unknown error"`.
///
/// # Safety
///
/// `ptr` must be NULL or point to a NUL-terminated string.
unsafe fn usable_message(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    // SAFETY: guaranteed by the caller.
    let message = unsafe { CStr::from_ptr(ptr) }.to_str().ok()?;
    (!message.is_empty() && message != "Unknown error").then(|| message.to_string())
}

/// Resolve `name` from `handle` as a function pointer of type `F`.
///
/// # Safety
///
/// `F` must be an `extern "C"` function pointer type matching the symbol's
/// real prototype.
unsafe fn symbol<F: Copy>(handle: &Handle, path: &Path, name: &CStr) -> Result<F, LoadError> {
    debug_assert_eq!(size_of::<F>(), size_of::<*mut c_void>());
    // SAFETY: handle is open and name is NUL-terminated.
    let ptr = unsafe { libc::dlsym(handle.0.as_ptr(), name.as_ptr()) };
    if ptr.is_null() {
        return Err(LoadError::MissingSymbol {
            path: path.to_path_buf(),
            symbol: name.to_string_lossy().into_owned(),
        });
    }
    // SAFETY: guaranteed by the caller; sizes are asserted above.
    Ok(unsafe { std::mem::transmute_copy::<*mut c_void, F>(&ptr) })
}

fn last_dl_error() -> String {
    // SAFETY: dlerror returns NULL or a thread-local C string.
    let ptr = unsafe { libc::dlerror() };
    if ptr.is_null() {
        return "unknown dlopen failure".to_string();
    }
    // SAFETY: checked non-null above.
    unsafe { CStr::from_ptr(ptr) }
        .to_string_lossy()
        .into_owned()
}

// ---------------------------------------------------------------------------
// PIN callback
// ---------------------------------------------------------------------------

/// Receives the PIN from one `hsm_unseal_pin` call.
#[derive(Default)]
pub(crate) struct PinSlot {
    pin: Option<Zeroizing<String>>,
    calls: u32,
    /// The callback was handed a PIN it could not take (null or not UTF-8).
    pub(crate) failed: bool,
}

impl PinSlot {
    pub(crate) fn take(&mut self) -> Option<Zeroizing<String>> {
        self.pin.take()
    }

    /// A slot as the callback leaves it after one delivery of `bytes`.
    #[cfg(test)]
    pub(crate) fn delivered(bytes: &[u8]) -> Self {
        let mut slot = Self::default();
        // SAFETY: bytes is a live slice of bytes.len() bytes.
        unsafe { slot.accept(bytes.as_ptr(), bytes.len()) };
        slot
    }

    /// # Safety
    ///
    /// `pin` must be null or point to `pin_len` readable bytes.
    unsafe fn accept(&mut self, pin: *const u8, pin_len: usize) -> c_int {
        self.calls += 1;
        if self.calls > 1 {
            return -1;
        }
        if pin.is_null() {
            self.failed = true;
            return -1;
        }

        // Copy before returning: the library scrubs its buffer afterwards.
        // SAFETY: guaranteed by the caller.
        let bytes = Zeroizing::new(unsafe { std::slice::from_raw_parts(pin, pin_len) }.to_vec());
        match std::str::from_utf8(&bytes) {
            Ok(text) => {
                self.pin = Some(Zeroizing::new(text.to_owned()));
                0
            }
            Err(_) => {
                self.failed = true;
                -1
            }
        }
    }
}

/// `hsm_pin_callback_t` implementation. `user_data` is a `*mut PinSlot`.
///
/// Never unwinds into the caller: any panic is reported as callback failure.
unsafe extern "C" fn receive_pin(pin: *const u8, pin_len: usize, user_data: *mut c_void) -> c_int {
    std::panic::catch_unwind(AssertUnwindSafe(|| {
        let Some(mut slot) = NonNull::new(user_data.cast::<PinSlot>()) else {
            return -1;
        };
        // SAFETY: user_data is the PinSlot handed to hsm_unseal_pin, and the
        // native side passes a buffer of pin_len bytes.
        unsafe { slot.as_mut().accept(pin, pin_len) }
    }))
    .unwrap_or(-1)
}
