//! Line codec for the Assuan dialect spoken between `gpg-agent` and pinentry
//! programs.
//!
//! Requests are `KEYWORD [args]` lines. Replies are `OK [msg]`,
//! `ERR <code> <msg>` and `D <data>`, where data is percent-encoded so that
//! `%`, CR and LF never appear literally on the wire.

use std::fmt;
use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use zeroize::Zeroizing;

/// `GPG_ERR_ASS_UNKNOWN_CMD`.
pub const ERR_UNKNOWN_COMMAND: u32 = 275;

/// `GPG_ERR_ASS_LINE_TOO_LONG`.
pub const ERR_LINE_TOO_LONG: u32 = 263;

/// `GPG_ERR_CANCELED` with the pinentry error source.
pub const ERR_CANCELED: u32 = 83_886_179;

/// Maximum length of a protocol line, including the trailing newline.
pub const MAX_LINE_LEN: usize = 1000;

pub const GREETING: &str = "Pleased to meet you, I am pinentry-remotejuggler";

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SetDesc,
    SetPrompt,
    SetTitle,
    SetError,
    SetOk,
    SetCancel,
    SetNotOk,
    SetTimeout,
    SetKeyInfo,
    SetRepeat,
    SetQualityBar,
    SetGenPin,
    Option,
    GetPin,
    Confirm,
    Message,
    GetInfo,
    ClearPassphrase,
    Reset,
    Bye,
    Nop,
    Cancel,
    /// Anything else, upper-cased. Answered with [`ERR_UNKNOWN_COMMAND`].
    Unknown(String),
}

impl Command {
    /// Case-insensitive keyword lookup.
    pub fn from_keyword(keyword: &str) -> Self {
        match keyword.to_ascii_uppercase().as_str() {
            "SETDESC" => Self::SetDesc,
            "SETPROMPT" => Self::SetPrompt,
            "SETTITLE" => Self::SetTitle,
            "SETERROR" => Self::SetError,
            "SETOK" => Self::SetOk,
            "SETCANCEL" => Self::SetCancel,
            "SETNOTOK" => Self::SetNotOk,
            "SETTIMEOUT" => Self::SetTimeout,
            "SETKEYINFO" => Self::SetKeyInfo,
            "SETREPEAT" => Self::SetRepeat,
            "SETQUALITYBAR" => Self::SetQualityBar,
            "SETGENPIN" => Self::SetGenPin,
            "OPTION" => Self::Option,
            "GETPIN" => Self::GetPin,
            "CONFIRM" => Self::Confirm,
            "MESSAGE" => Self::Message,
            "GETINFO" => Self::GetInfo,
            "CLEARPASSPHRASE" => Self::ClearPassphrase,
            "RESET" => Self::Reset,
            "BYE" => Self::Bye,
            "NOP" => Self::Nop,
            "CANCEL" => Self::Cancel,
            other => Self::Unknown(other.to_string()),
        }
    }
}

/// One parsed request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request<'a> {
    pub command: Command,
    /// Everything after the keyword, with surrounding whitespace removed.
    /// Empty when the command carries no argument.
    pub args: &'a str,
}

/// Parse one request line. Blank lines and `#` comments yield `None`.
pub fn parse_line(line: &str) -> Option<Request<'_>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let (keyword, args) = match line.split_once(char::is_whitespace) {
        Some((keyword, rest)) => (keyword, rest.trim_start()),
        None => (line, ""),
    };
    Some(Request {
        command: Command::from_keyword(keyword),
        args,
    })
}

// ---------------------------------------------------------------------------
// Replies
// ---------------------------------------------------------------------------

/// A status reply. Data replies go through [`encode_data_lines`] instead so
/// that their buffers can be scrubbed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ok(Option<String>),
    Err { code: u32, message: String },
}

impl Response {
    pub fn ok() -> Self {
        Self::Ok(None)
    }

    pub fn ok_with(message: impl Into<String>) -> Self {
        Self::Ok(Some(message.into()))
    }

    pub fn err(code: u32, message: impl Into<String>) -> Self {
        Self::Err {
            code,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::err(ERR_CANCELED, "Operation cancelled")
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok(None) => f.write_str("OK"),
            Self::Ok(Some(message)) => write!(f, "OK {message}"),
            Self::Err { code, message } => write!(f, "ERR {code} {message}"),
        }
    }
}

/// Classification of a line read back from another pinentry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyLine<'a> {
    Ok(&'a str),
    Err(&'a str),
    /// Still percent-encoded.
    Data(&'a str),
    /// Status (`S`), comment or anything unrecognised.
    Other,
}

impl<'a> ReplyLine<'a> {
    pub fn parse(line: &'a str) -> Self {
        let line = line.trim_end_matches(['\r', '\n']);
        if let Some(data) = line.strip_prefix("D ") {
            Self::Data(data)
        } else if line.starts_with("OK") && is_keyword_end(line, 2) {
            Self::Ok(line[2..].trim_start())
        } else if line.starts_with("ERR") && is_keyword_end(line, 3) {
            Self::Err(line[3..].trim_start())
        } else {
            Self::Other
        }
    }

    /// `OK` or `ERR`: the line that completes a command.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ok(_) | Self::Err(_))
    }
}

fn is_keyword_end(line: &str, at: usize) -> bool {
    line.as_bytes().get(at).is_none_or(|b| *b == b' ')
}

// ---------------------------------------------------------------------------
// Percent encoding
// ---------------------------------------------------------------------------

fn escape(byte: u8) -> Option<&'static [u8; 3]> {
    match byte {
        b'%' => Some(b"%25"),
        b'\r' => Some(b"%0D"),
        b'\n' => Some(b"%0A"),
        _ => None,
    }
}

/// Escape `%`, CR and LF; every other byte passes through unchanged.
pub fn percent_encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for &byte in data {
        match escape(byte) {
            Some(escaped) => out.extend_from_slice(escaped),
            None => out.push(byte),
        }
    }
    out
}

/// Inverse of [`percent_encode`], accepting any `%XX` escape. A `%` that is
/// not followed by two hex digits (including one at the end of the input) is
/// kept literally.
pub fn percent_decode(encoded: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(encoded.len());
    let mut i = 0;
    while i < encoded.len() {
        if encoded[i] == b'%'
            && let Some(byte) = encoded
                .get(i + 1..i + 3)
                .and_then(|hex| std::str::from_utf8(hex).ok())
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
        {
            out.push(byte);
            i += 3;
        } else {
            out.push(encoded[i]);
            i += 1;
        }
    }
    out
}

/// Render `data` as one or more `D` lines, each at most [`MAX_LINE_LEN`]
/// bytes including the newline. Escape sequences are never split.
pub fn encode_data_lines(data: &[u8]) -> Zeroizing<Vec<u8>> {
    const PREFIX: &[u8] = b"D ";
    let max_payload = MAX_LINE_LEN - PREFIX.len() - 1;

    let mut out = Zeroizing::new(Vec::with_capacity(data.len() + 4));
    out.extend_from_slice(PREFIX);
    let mut payload_len = 0;
    for &byte in data {
        let width = if escape(byte).is_some() { 3 } else { 1 };
        if payload_len + width > max_payload {
            out.push(b'\n');
            out.extend_from_slice(PREFIX);
            payload_len = 0;
        }
        match escape(byte) {
            Some(escaped) => out.extend_from_slice(escaped),
            None => out.push(byte),
        }
        payload_len += width;
    }
    out.push(b'\n');
    out
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Writes replies to the agent, flushing after each one.
pub struct AssuanWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> AssuanWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    pub async fn send(&mut self, response: &Response) -> io::Result<()> {
        let line = response.to_string();
        tracing::debug!("< {line}");
        self.inner.write_all(line.as_bytes()).await?;
        self.inner.write_all(b"\n").await?;
        self.inner.flush().await
    }

    pub async fn ok(&mut self) -> io::Result<()> {
        self.send(&Response::ok()).await
    }

    pub async fn ok_with(&mut self, message: &str) -> io::Result<()> {
        self.send(&Response::ok_with(message)).await
    }

    pub async fn err(&mut self, code: u32, message: &str) -> io::Result<()> {
        self.send(&Response::err(code, message)).await
    }

    /// Send `payload` as `D` line(s). The payload is never logged.
    pub async fn data(&mut self, payload: &[u8]) -> io::Result<()> {
        let lines = encode_data_lines(payload);
        tracing::debug!("< D [redacted]");
        self.inner.write_all(&lines).await?;
        self.inner.flush().await
    }
}
