//! Bounded subprocess execution.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::process::Command;
use zeroize::Zeroizing;

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("I/O with {program} failed: {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} did not finish within {timeout:?}")]
    TimedOut { program: String, timeout: Duration },
}

/// Exit status and captured stdout of a finished child.
///
/// stdout may carry a PIN and is scrubbed on drop. stderr is discarded.
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Zeroizing<Vec<u8>>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// Run `program` with `args`, optionally feeding `stdin`, and collect its
/// output. The child is killed if it has not exited after `timeout`.
pub async fn run_with_timeout(
    program: &str,
    args: &[&str],
    stdin: Option<&[u8]>,
    timeout: Duration,
) -> Result<CommandOutput, ProcessError> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ProcessError::Spawn {
            program: program.to_string(),
            source,
        })?;

    let mut input = child.stdin.take();
    let mut output = child.stdout.take();

    let exchange = async {
        if let (Some(mut pipe), Some(bytes)) = (input.take(), stdin) {
            // A child may exit without draining its input; its output still counts.
            match pipe.write_all(bytes).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {}
                Err(e) => return Err(e),
            }
            // Dropping the pipe sends EOF.
        }
        let mut stdout = Zeroizing::new(Vec::new());
        if let Some(pipe) = output.as_mut() {
            pipe.read_to_end(&mut stdout).await?;
        }
        let status = child.wait().await?;
        Ok((status, stdout))
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(Ok((status, stdout))) => Ok(CommandOutput { status, stdout }),
        Ok(Err(source)) => Err(ProcessError::Io {
            program: program.to_string(),
            source,
        }),
        Err(_) => {
            if let Err(e) = child.kill().await {
                tracing::debug!(program, "failed to kill timed-out child: {e}");
            }
            Err(ProcessError::TimedOut {
                program: program.to_string(),
                timeout,
            })
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::{Path, PathBuf};

    /// A unique scratch directory under the system temp dir, removed on drop.
    pub(crate) struct ScratchDir(PathBuf);

    impl ScratchDir {
        pub(crate) fn new(tag: &str) -> Self {
            use std::sync::atomic::{AtomicU32, Ordering};
            static NEXT: AtomicU32 = AtomicU32::new(0);
            let dir = std::env::temp_dir().join(format!(
                "pinentry-{tag}-{}-{}",
                std::process::id(),
                NEXT.fetch_add(1, Ordering::Relaxed)
            ));
            std::fs::create_dir_all(&dir).unwrap();
            Self(dir)
        }

        pub(crate) fn path(&self) -> &Path {
            &self.0
        }

        /// Write an executable `/bin/sh` script and return its path.
        pub(crate) fn script(&self, name: &str, body: &str) -> String {
            use std::os::unix::fs::PermissionsExt as _;
            let path = self.0.join(name);
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path.to_string_lossy().into_owned()
        }
    }

    impl Drop for ScratchDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::ScratchDir;
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_status() {
        let out = run_with_timeout("/bin/sh", &["-c", "echo hello; exit 3"], None, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!out.success());
        assert_eq!(out.status.code(), Some(3));
        assert_eq!(out.stdout.as_slice(), b"hello\n");
    }

    #[tokio::test]
    async fn feeds_stdin() {
        let out = run_with_timeout("/bin/cat", &[], Some(b"line one\nline two\n"), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.as_slice(), b"line one\nline two\n");
    }

    #[tokio::test]
    async fn child_ignoring_stdin_still_reports() {
        let scratch = ScratchDir::new("process");
        let script = scratch.script("ignore", "echo done");
        let input = vec![b'x'; 256 * 1024];
        let out = run_with_timeout(&script, &[], Some(&input), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.stdout.as_slice(), b"done\n");
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let err = run_with_timeout("/nonexistent/remote-juggler", &[], None, Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ProcessError::Spawn { .. }));
    }

    #[tokio::test]
    async fn slow_child_is_killed() {
        let scratch = ScratchDir::new("process");
        let script = scratch.script("slow", "exec sleep 30");
        let started = std::time::Instant::now();
        let err = run_with_timeout(&script, &[], None, Duration::from_millis(200))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ProcessError::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(scratch.path().exists());
    }
}
