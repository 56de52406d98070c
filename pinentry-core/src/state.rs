use indexmap::IndexMap;

/// Value of an `OPTION name[=value]` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    /// `OPTION name`
    Flag,
    /// `OPTION name=value`
    Value(String),
}

/// Everything the agent has told this pinentry since start-up or the last
/// `RESET`. Arguments are kept exactly as received (still percent-encoded)
/// so they can be replayed verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    pub description: String,
    pub prompt: String,
    pub title: String,
    pub error: String,
    pub ok_button: String,
    pub cancel_button: String,
    pub notok_button: String,
    /// Seconds; `0` means no timeout.
    pub timeout: u32,
    pub keyinfo: String,
    /// `Some` once `SETREPEAT` was sent, carrying its (possibly empty) label.
    pub repeat: Option<String>,
    pub quality_bar: bool,
    pub gen_pin: bool,
    pub options: IndexMap<String, OptionValue>,
}

impl SessionState {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Apply `SETTIMEOUT`. Unparsable values leave the timeout unchanged.
    pub fn set_timeout(&mut self, args: &str) {
        if let Ok(secs) = args.trim().parse() {
            self.timeout = secs;
        }
    }

    /// Apply `OPTION name[=value]`.
    pub fn set_option(&mut self, args: &str) {
        let (name, value) = match args.split_once('=') {
            Some((name, value)) => (name.trim(), OptionValue::Value(value.trim().to_string())),
            None => (args.trim(), OptionValue::Flag),
        };
        if !name.is_empty() {
            self.options.insert(name.to_string(), value);
        }
    }

    /// Protocol lines that rebuild this state in another pinentry, skipping
    /// unset fields.
    ///
    /// `SETQUALITYBAR` and `SETGENPIN` are left out: both make the receiving
    /// pinentry send `INQUIRE`s that a one-shot replay cannot answer.
    pub fn replay_commands(&self) -> Vec<String> {
        let mut commands = Vec::new();
        for (name, value) in &self.options {
            match value {
                OptionValue::Flag => commands.push(format!("OPTION {name}")),
                OptionValue::Value(v) => commands.push(format!("OPTION {name}={v}")),
            }
        }

        let texts = [
            ("SETTITLE", &self.title),
            ("SETDESC", &self.description),
            ("SETPROMPT", &self.prompt),
            ("SETERROR", &self.error),
            ("SETOK", &self.ok_button),
            ("SETCANCEL", &self.cancel_button),
            ("SETNOTOK", &self.notok_button),
        ];
        for (command, value) in texts {
            if !value.is_empty() {
                commands.push(format!("{command} {value}"));
            }
        }
        if self.timeout > 0 {
            commands.push(format!("SETTIMEOUT {}", self.timeout));
        }
        if !self.keyinfo.is_empty() {
            commands.push(format!("SETKEYINFO {}", self.keyinfo));
        }
        match self.repeat.as_deref() {
            Some("") => commands.push("SETREPEAT".to_string()),
            Some(label) => commands.push(format!("SETREPEAT {label}")),
            None => {}
        }
        commands
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populated() -> SessionState {
        let mut state = SessionState {
            description: "Please enter the PIN".to_string(),
            prompt: "PIN:".to_string(),
            title: "Unlock".to_string(),
            error: "Bad PIN".to_string(),
            ok_button: "_OK".to_string(),
            cancel_button: "_Cancel".to_string(),
            notok_button: "_No".to_string(),
            keyinfo: "n/ABCDEF".to_string(),
            repeat: Some("Repeat:".to_string()),
            quality_bar: true,
            gen_pin: true,
            ..SessionState::default()
        };
        state.set_timeout("30");
        state.set_option("ttyname=/dev/pts/3");
        state.set_option("no-grab");
        state
    }

    #[test]
    fn reset_restores_fresh_state() {
        let mut state = populated();
        assert_ne!(state, SessionState::default());
        state.reset();
        assert_eq!(state, SessionState::default());
        assert!(state.options.is_empty());
        assert_eq!(state.timeout, 0);
        assert_eq!(state.repeat, None);
    }

    #[test]
    fn timeout_ignores_garbage() {
        let mut state = SessionState::default();
        state.set_timeout("45");
        state.set_timeout("soon");
        assert_eq!(state.timeout, 45);
    }

    #[test]
    fn options_split_on_first_equals() {
        let mut state = SessionState::default();
        state.set_option("display=:0=1");
        state.set_option("allow-external-password-cache");
        state.set_option("");
        assert_eq!(
            state.options.get("display"),
            Some(&OptionValue::Value(":0=1".to_string()))
        );
        assert_eq!(
            state.options.get("allow-external-password-cache"),
            Some(&OptionValue::Flag)
        );
        assert_eq!(state.options.len(), 2);
    }

    #[test]
    fn replay_skips_unset_fields() {
        let mut state = SessionState::default();
        assert!(state.replay_commands().is_empty());

        state.description = "Enter PIN".to_string();
        state.repeat = Some(String::new());
        assert_eq!(
            state.replay_commands(),
            vec!["SETDESC Enter PIN".to_string(), "SETREPEAT".to_string()]
        );
    }

    #[test]
    fn replay_covers_every_field() {
        let commands = populated().replay_commands();
        assert_eq!(
            commands,
            vec![
                "OPTION ttyname=/dev/pts/3",
                "OPTION no-grab",
                "SETTITLE Unlock",
                "SETDESC Please enter the PIN",
                "SETPROMPT PIN:",
                "SETERROR Bad PIN",
                "SETOK _OK",
                "SETCANCEL _Cancel",
                "SETNOTOK _No",
                "SETTIMEOUT 30",
                "SETKEYINFO n/ABCDEF",
                "SETREPEAT Repeat:",
            ]
        );
    }
}
