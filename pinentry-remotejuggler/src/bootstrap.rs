/// Keep secrets out of core dumps. Called first thing in `main()`, before
/// any PIN is handled. Best-effort: failures are logged and ignored.
///
/// 1. **`PR_SET_DUMPABLE 0`** (Linux): no core dumps and no `/proc/<pid>/mem`
///    access for other processes of the same user.
/// 2. **`RLIMIT_CORE = 0`**: no core file on crash on any unix.
///
/// Memory is not locked: `mlockall(MCL_FUTURE)` makes allocations fail once
/// `RLIMIT_MEMLOCK` is reached.
pub fn secure_bootstrap() {
    #[cfg(target_os = "linux")]
    set_not_dumpable();
    disable_core_dumps();
}

#[cfg(target_os = "linux")]
fn set_not_dumpable() {
    // SAFETY: prctl is safe to call with PR_SET_DUMPABLE and a plain integer arg.
    let ret = unsafe { libc::prctl(libc::PR_SET_DUMPABLE, 0i64, 0i64, 0i64, 0i64) };
    if ret == 0 {
        tracing::debug!("PR_SET_DUMPABLE=0");
    } else {
        let err = std::io::Error::last_os_error();
        tracing::warn!("PR_SET_DUMPABLE=0 failed (non-fatal): {err}");
    }
}

fn disable_core_dumps() {
    let limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: setrlimit only reads the struct we pass by reference.
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_CORE, &limit) };
    if ret == 0 {
        tracing::debug!("RLIMIT_CORE=0");
    } else {
        let err = std::io::Error::last_os_error();
        tracing::warn!("setrlimit(RLIMIT_CORE, 0) failed (non-fatal): {err}");
    }
}
