//! Delegation to the system pinentry.
//!
//! The accumulated session is replayed into a fresh pinentry process in one
//! batch (`SETxxx`/`OPTION` lines, the action, `BYE`) and its whole reply is
//! read back once the process exits.

use std::path::Path;
use std::time::Duration;

use pinentry_core::assuan::{ReplyLine, percent_decode};
use pinentry_core::{Pin, PromptDelegate, SessionState};
use zeroize::Zeroizing;

use crate::process::run_with_timeout;

/// Environment variable overriding the fallback program.
pub const FALLBACK_ENV: &str = "PINENTRY_REMOTEJUGGLER_FALLBACK";

const CANDIDATES: &[&str] = &[
    "/usr/local/bin/pinentry-mac",
    "/opt/homebrew/bin/pinentry-mac",
    "/usr/bin/pinentry-gnome3",
    "/usr/bin/pinentry-qt",
    "/usr/bin/pinentry-gtk-2",
    "/usr/bin/pinentry-curses",
    "/usr/bin/pinentry-tty",
    "/usr/bin/pinentry",
];

/// First installed pinentry from the platform candidate list, or
/// `/usr/bin/pinentry` when none is.
pub fn detect_fallback_program() -> String {
    CANDIDATES
        .iter()
        .copied()
        .find(|candidate| is_executable(Path::new(candidate)))
        .unwrap_or("/usr/bin/pinentry")
        .to_string()
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt as _;
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

pub struct SystemPinentry {
    program: String,
    timeout: Duration,
}

impl SystemPinentry {
    pub const TIMEOUT: Duration = Duration::from_secs(300);

    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            timeout: Self::TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Run one batch ending in `action`. Returns the raw reply and the
    /// number of commands sent, or `None` if the program could not be run
    /// to completion.
    async fn exchange(
        &self,
        state: &SessionState,
        action: &str,
    ) -> Option<(Zeroizing<Vec<u8>>, usize)> {
        let (script, sent) = build_script(state, action);
        tracing::debug!(program = %self.program, action, commands = sent, "delegating to fallback pinentry");
        match run_with_timeout(&self.program, &[], Some(script.as_bytes()), self.timeout).await {
            Ok(output) => {
                if !output.success() {
                    tracing::debug!(status = %output.status, "fallback pinentry exited unsuccessfully");
                }
                Some((output.stdout, sent))
            }
            Err(e) => {
                tracing::warn!("fallback pinentry failed: {e}");
                None
            }
        }
    }
}

#[async_trait::async_trait]
impl PromptDelegate for SystemPinentry {
    async fn get_pin(&self, state: &SessionState) -> Option<Pin> {
        let (reply, _) = self.exchange(state, "GETPIN").await?;
        let pin = extract_pin(&reply);
        if pin.is_none() {
            tracing::debug!("fallback pinentry returned no PIN");
        }
        pin
    }

    async fn confirm(&self, state: &SessionState) -> bool {
        self.exchange(state, "CONFIRM")
            .await
            .is_some_and(|(reply, sent)| confirm_outcome(&reply, sent))
    }

    async fn message(&self, state: &SessionState) {
        let _ = self.exchange(state, "MESSAGE").await;
    }
}

/// Newline-terminated replay of `state`, then `action` and `BYE`.
fn build_script(state: &SessionState, action: &str) -> (String, usize) {
    let mut commands = state.replay_commands();
    commands.push(action.to_string());
    commands.push("BYE".to_string());

    let mut script = String::new();
    for command in &commands {
        script.push_str(command);
        script.push('\n');
    }
    (script, commands.len())
}

fn reply_lines(reply: &[u8]) -> impl Iterator<Item = &[u8]> {
    reply
        .split(|b| *b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
}

/// The first run of consecutive `D` lines, decoded and joined.
fn extract_pin(reply: &[u8]) -> Option<Pin> {
    let mut pin = Zeroizing::new(Vec::new());
    let mut found = false;
    for line in reply_lines(reply) {
        if let Some(payload) = line.strip_prefix(b"D ") {
            pin.extend_from_slice(&Zeroizing::new(percent_decode(payload)));
            found = true;
        } else if found {
            break;
        }
    }
    if !found || pin.is_empty() {
        return None;
    }
    match String::from_utf8(std::mem::take(&mut *pin)) {
        Ok(text) => Some(Pin::new(text)),
        Err(e) => {
            drop(Zeroizing::new(e.into_bytes()));
            tracing::debug!("fallback pinentry returned a non-UTF-8 PIN");
            None
        }
    }
}

/// Whether the reply to the action command (second to last of `sent`) was
/// `OK`. Terminal replies are the greeting plus one per command, so the
/// action's answer is terminal reply number `sent - 1`. A reply that stops
/// before answering the action counts as cancellation.
fn confirm_outcome(reply: &[u8], sent: usize) -> bool {
    let Ok(text) = std::str::from_utf8(reply) else {
        return false;
    };
    text.lines()
        .map(ReplyLine::parse)
        .filter(ReplyLine::is_terminal)
        .nth(sent.saturating_sub(1))
        .is_some_and(|line| matches!(line, ReplyLine::Ok(_)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::test_support::ScratchDir;

    /// Answers every command like a real pinentry; `CONFIRM` gets `$CONFIRM_REPLY`.
    const INTERACTIVE: &str = r#"
echo "OK Pleased to meet you"
while read -r line; do
  case "$line" in
    CONFIRM*) echo "$CONFIRM_REPLY" ;;
    BYE*) echo "OK closing connection"; exit 0 ;;
    *) echo "OK" ;;
  esac
done
"#;

    fn state() -> SessionState {
        let mut state = SessionState {
            description: "Please enter the PIN".to_string(),
            keyinfo: "n/AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA".to_string(),
            ..SessionState::default()
        };
        state.set_option("ttyname=/dev/pts/1");
        state
    }

    #[test]
    fn script_replays_state_then_action() {
        let (script, sent) = build_script(&state(), "GETPIN");
        assert_eq!(
            script,
            "OPTION ttyname=/dev/pts/1\n\
             SETDESC Please enter the PIN\n\
             SETKEYINFO n/AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA\n\
             GETPIN\n\
             BYE\n"
        );
        assert_eq!(sent, 5);
    }

    #[test]
    fn pin_is_first_data_block() {
        let reply = b"OK Pleased to meet you\r\nOK\nD 12%2534\nD 56\nOK\nD other\nOK\n";
        assert_eq!(extract_pin(reply).unwrap().expose(), "12%3456");
    }

    #[test]
    fn no_data_means_no_pin() {
        assert!(extract_pin(b"OK Pleased to meet you\nERR 83886179 Operation cancelled\n").is_none());
        assert!(extract_pin(b"OK\nD \nOK\n").is_none());
        assert!(extract_pin(b"").is_none());
    }

    #[test]
    fn confirm_reads_the_action_reply() {
        // greeting, SETDESC, CONFIRM, BYE
        assert!(confirm_outcome(b"OK hi\nOK\nOK\nOK closing connection\n", 3));
        assert!(!confirm_outcome(
            b"OK hi\nOK\nERR 83886179 Operation cancelled\nOK closing connection\n",
            3
        ));
        // Status lines are not replies.
        assert!(confirm_outcome(b"OK hi\nS PROGRESS\nOK\nOK\n", 3));
        // Stopped before answering CONFIRM.
        assert!(!confirm_outcome(b"OK hi\nOK\n", 3));
    }

    #[tokio::test]
    async fn get_pin_from_script() {
        let scratch = ScratchDir::new("fallback");
        let received = scratch.path().join("received");
        let program = scratch.script(
            "pinentry",
            &format!(
                "cat > '{}'\nprintf 'OK Pleased to meet you\\nOK\\nD 123456\\nOK\\n'",
                received.display()
            ),
        );
        let fallback = SystemPinentry::new(program);

        let pin = fallback.get_pin(&state()).await.unwrap();
        assert_eq!(pin.expose(), "123456");
        let sent = std::fs::read_to_string(&received).unwrap();
        assert!(sent.starts_with("OPTION ttyname=/dev/pts/1\n"));
        assert!(sent.ends_with("GETPIN\nBYE\n"));
    }

    #[tokio::test]
    async fn confirm_against_interactive_script() {
        let scratch = ScratchDir::new("fallback");
        let accept = SystemPinentry::new(scratch.script(
            "accept",
            &format!("CONFIRM_REPLY=OK\n{INTERACTIVE}"),
        ));
        let refuse = SystemPinentry::new(scratch.script(
            "refuse",
            &format!("CONFIRM_REPLY='ERR 83886179 Operation cancelled'\n{INTERACTIVE}"),
        ));

        assert!(accept.confirm(&state()).await);
        assert!(!refuse.confirm(&state()).await);
        // Informational dialogs never fail.
        refuse.message(&state()).await;
    }

    #[tokio::test]
    async fn timed_out_fallback_is_cancellation() {
        let scratch = ScratchDir::new("fallback");
        let fallback = SystemPinentry::new(scratch.script("hang", "exec sleep 30"))
            .with_timeout(Duration::from_millis(200));
        assert!(fallback.get_pin(&state()).await.is_none());
        assert!(!fallback.confirm(&state()).await);
    }

    #[tokio::test]
    async fn missing_program_is_cancellation() {
        let fallback = SystemPinentry::new("/nonexistent/pinentry");
        assert!(fallback.get_pin(&state()).await.is_none());
    }

    #[test]
    fn detected_program_is_a_known_pinentry() {
        let program = detect_fallback_program();
        assert!(CANDIDATES.contains(&program.as_str()));
    }
}
