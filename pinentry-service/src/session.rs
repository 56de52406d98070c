//! The pinentry session: reads agent commands one at a time and answers each
//! before reading the next.

use std::io;

use pinentry_core::assuan::{
    AssuanWriter, Command, ERR_LINE_TOO_LONG, ERR_UNKNOWN_COMMAND, GREETING, MAX_LINE_LEN,
    Response, parse_line,
};
use pinentry_core::{
    Config, HsmBackend, HsmError, IdentityCache, IdentityCli, IdentityResolver, Pin,
    PromptDelegate, SecurityMode, SessionState,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt as _, AsyncReadExt as _, AsyncWrite};

enum Flow {
    Continue,
    Close,
}

pub struct Session {
    state: SessionState,
    config: Config,
    cache: IdentityCache,
    hsm: Box<dyn HsmBackend>,
    cli: Box<dyn IdentityCli>,
    fallback: Box<dyn PromptDelegate>,
    /// Set once the HSM reported it can never work in this process.
    hsm_disabled: bool,
}

impl Session {
    pub fn new(
        config: Config,
        hsm: Box<dyn HsmBackend>,
        cli: Box<dyn IdentityCli>,
        fallback: Box<dyn PromptDelegate>,
    ) -> Self {
        let cache = IdentityCache::from_config(&config);
        tracing::debug!(entries = cache.len(), "identity cache primed from config");
        Self {
            state: SessionState::default(),
            config,
            cache,
            hsm,
            cli,
            fallback,
            hsm_disabled: false,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Greet the agent, then serve commands until `BYE` or end of input.
    ///
    /// Only I/O errors on the agent's pipes are returned.
    pub async fn run<R, W>(&mut self, mut reader: R, writer: W) -> io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut writer = AssuanWriter::new(writer);
        writer.ok_with(GREETING).await?;

        let mut buf = Vec::new();
        loop {
            buf.clear();
            if read_line(&mut reader, &mut buf).await? == 0 {
                tracing::debug!("agent closed the connection");
                return Ok(());
            }
            if buf.len() == MAX_LINE_LEN && !buf.ends_with(b"\n") {
                tracing::debug!("discarding over-long line");
                discard_rest_of_line(&mut reader).await?;
                writer.err(ERR_LINE_TOO_LONG, "Line too long").await?;
                continue;
            }
            let line = String::from_utf8_lossy(&buf);
            if let Flow::Close = self.handle_line(&line, &mut writer).await? {
                return Ok(());
            }
        }
    }

    async fn handle_line<W>(&mut self, line: &str, writer: &mut AssuanWriter<W>) -> io::Result<Flow>
    where
        W: AsyncWrite + Unpin,
    {
        let Some(request) = parse_line(line) else {
            return Ok(Flow::Continue);
        };
        tracing::debug!("> {}", line.trim_end());

        let args = request.args;
        match request.command {
            Command::SetDesc => self.state.description = args.to_string(),
            Command::SetPrompt => self.state.prompt = args.to_string(),
            Command::SetTitle => self.state.title = args.to_string(),
            Command::SetError => self.state.error = args.to_string(),
            Command::SetOk => self.state.ok_button = args.to_string(),
            Command::SetCancel => self.state.cancel_button = args.to_string(),
            Command::SetNotOk => self.state.notok_button = args.to_string(),
            Command::SetTimeout => self.state.set_timeout(args),
            Command::SetKeyInfo => self.state.keyinfo = args.to_string(),
            Command::SetRepeat => self.state.repeat = Some(args.to_string()),
            Command::SetQualityBar => self.state.quality_bar = true,
            Command::SetGenPin => self.state.gen_pin = true,
            Command::Option => self.state.set_option(args),
            Command::GetPin => {
                self.get_pin(writer).await?;
                return Ok(Flow::Continue);
            }
            Command::Confirm => {
                if self.fallback.confirm(&self.state).await {
                    writer.ok().await?;
                } else {
                    writer.send(&Response::cancelled()).await?;
                }
                return Ok(Flow::Continue);
            }
            Command::Message => self.fallback.message(&self.state).await,
            Command::GetInfo => {
                match get_info(args) {
                    Some(value) => {
                        writer.data(value.as_bytes()).await?;
                        writer.ok().await?;
                    }
                    None => {
                        writer
                            .err(ERR_UNKNOWN_COMMAND, &format!("Unknown GETINFO option: {args}"))
                            .await?
                    }
                }
                return Ok(Flow::Continue);
            }
            Command::Reset => self.state.reset(),
            // Nothing is cached and nothing runs in the background.
            Command::ClearPassphrase | Command::Nop | Command::Cancel => {}
            Command::Bye => {
                writer.ok_with("closing connection").await?;
                return Ok(Flow::Close);
            }
            Command::Unknown(keyword) => {
                tracing::debug!("unknown command {keyword}");
                writer
                    .err(ERR_UNKNOWN_COMMAND, &format!("Unknown IPC command: {keyword}"))
                    .await?;
                return Ok(Flow::Continue);
            }
        }
        writer.ok().await?;
        Ok(Flow::Continue)
    }

    /// Answer `GETPIN` from exactly one source: HSM, CLI, then the fallback.
    async fn get_pin<W>(&mut self, writer: &mut AssuanWriter<W>) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let pin = match self.auto_unseal().await {
            Some(pin) => Some(pin),
            None => self.fallback.get_pin(&self.state).await,
        };
        match pin {
            Some(pin) => {
                writer.data(pin.expose().as_bytes()).await?;
                drop(pin);
                writer.ok().await
            }
            None => {
                tracing::info!("no PIN obtained; reporting cancellation");
                writer.send(&Response::cancelled()).await
            }
        }
    }

    /// Unseal without prompting, if the key belongs to a trusted-workstation
    /// identity.
    async fn auto_unseal(&mut self) -> Option<Pin> {
        let identity = {
            let mut resolver = IdentityResolver::new(&self.config, &mut self.cache, &*self.cli);
            resolver.resolve(&self.state).await
        };
        let Some(identity) = identity else {
            tracing::debug!("key not mapped to an identity; using fallback");
            return None;
        };

        match self.config.identity(&identity).map(|i| i.security_mode) {
            Some(SecurityMode::TrustedWorkstation) => {}
            Some(mode) => {
                tracing::info!(%identity, mode = mode.as_str(), "auto-unseal not permitted; using fallback");
                return None;
            }
            None => {
                tracing::debug!(%identity, "identity is not configured; using fallback");
                return None;
            }
        }

        if let Some(pin) = self.hsm_unseal(&identity) {
            tracing::info!(%identity, method = %self.hsm.method(), "PIN unsealed from HSM");
            return Some(pin);
        }
        if let Some(pin) = self.cli.unseal_pin(&identity).await {
            tracing::info!(%identity, "PIN unsealed via CLI");
            return Some(pin);
        }
        tracing::debug!(%identity, "auto-unseal failed; using fallback");
        None
    }

    fn hsm_unseal(&mut self, identity: &str) -> Option<Pin> {
        if self.hsm_disabled {
            return None;
        }
        if !self.hsm.available() {
            tracing::debug!("HSM not available");
            self.hsm_disabled = true;
            return None;
        }
        if !self.hsm.pin_exists(identity) {
            tracing::debug!(identity, "no PIN sealed in HSM");
            return None;
        }
        match self.hsm.unseal_pin(identity) {
            Ok(pin) => Some(pin),
            Err(err) => {
                self.log_hsm_failure(identity, err);
                if err.is_permanent() {
                    self.hsm_disabled = true;
                }
                None
            }
        }
    }

    fn log_hsm_failure(&self, identity: &str, err: HsmError) {
        let message = self.hsm.error_message(err);
        match err {
            HsmError::NotAvailable | HsmError::NotInitialized => {
                tracing::debug!(identity, "HSM unavailable: {message}")
            }
            HsmError::NotFound => tracing::debug!(identity, "no PIN sealed in HSM"),
            HsmError::InvalidIdentity => tracing::info!(identity, "HSM rejected identity: {message}"),
            HsmError::AuthFailed => tracing::warn!(identity, "HSM authentication failed: {message}"),
            HsmError::PcrMismatch => tracing::warn!(
                identity,
                "{message}. Re-seal PIN after verifying system integrity: \
                 remote-juggler pin store {identity}"
            ),
            _ => tracing::debug!(identity, code = err.code(), "HSM unseal failed: {message}"),
        }
    }
}

/// Read one line of at most [`MAX_LINE_LEN`] bytes into `buf`.
async fn read_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    reader
        .take(MAX_LINE_LEN as u64)
        .read_until(b'\n', buf)
        .await
}

async fn discard_rest_of_line<R>(reader: &mut R) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut chunk = Vec::with_capacity(MAX_LINE_LEN);
    loop {
        chunk.clear();
        if read_line(reader, &mut chunk).await? == 0 || chunk.ends_with(b"\n") {
            return Ok(());
        }
    }
}

fn get_info(key: &str) -> Option<String> {
    match key {
        "pid" => Some(std::process::id().to_string()),
        "version" => Some(env!("CARGO_PKG_VERSION").to_string()),
        "flavor" => Some("remotejuggler".to_string()),
        "ttyinfo" => {
            let tty = std::env::var("GPG_TTY").unwrap_or_default();
            let term = std::env::var("TERM").unwrap_or_default();
            Some(format!("{tty} {term}"))
        }
        _ => None,
    }
}
