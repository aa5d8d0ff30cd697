//! Control-channel protocol layer for the FTP connection pool SDK
//!
//! This module frames outbound command lines and parses single- and
//! multi-line server replies. Only the handful of commands the pool core
//! drives (greeting, AUTH, login, post-login configuration, NOOP, QUIT,
//! CWD/PWD) are modeled; data-channel commands belong to the host's
//! transfer collaborators.

use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Longest reply line accepted before the parser gives up
///
/// Guards against a misbehaving server streaming an unterminated line.
pub const MAX_REPLY_LINE: usize = 4096;

/// A command sent on the control channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `USER <name>` — begin login
    User(String),
    /// `PASS <password>` — complete login
    Pass(String),
    /// `AUTH TLS` — request explicit TLS negotiation
    AuthTls,
    /// `TYPE <code>` — set the transfer type
    Type(char),
    /// `OPTS UTF8 ON` — enable UTF-8 on the control channel
    OptsUtf8On,
    /// `NOOP` — liveness / keep-alive probe
    Noop,
    /// `QUIT` — graceful session end
    Quit,
    /// `CWD <path>` — change the working directory
    Cwd(String),
    /// `PWD` — query the working directory
    Pwd,
}

impl Command {
    /// Renders the wire form of the command, without the trailing CRLF
    pub fn line(&self) -> String {
        match self {
            Command::User(name) => format!("USER {}", name),
            Command::Pass(password) => format!("PASS {}", password),
            Command::AuthTls => "AUTH TLS".to_string(),
            Command::Type(code) => format!("TYPE {}", code),
            Command::OptsUtf8On => "OPTS UTF8 ON".to_string(),
            Command::Noop => "NOOP".to_string(),
            Command::Quit => "QUIT".to_string(),
            Command::Cwd(path) => format!("CWD {}", path),
            Command::Pwd => "PWD".to_string(),
        }
    }

    /// Renders the command for logging, with secrets masked
    pub fn redacted(&self) -> String {
        match self {
            Command::Pass(_) => "PASS ***".to_string(),
            other => other.line(),
        }
    }

    /// The command verb, used as operation context in classified errors
    pub fn verb(&self) -> &'static str {
        match self {
            Command::User(_) => "USER",
            Command::Pass(_) => "PASS",
            Command::AuthTls => "AUTH",
            Command::Type(_) => "TYPE",
            Command::OptsUtf8On => "OPTS",
            Command::Noop => "NOOP",
            Command::Quit => "QUIT",
            Command::Cwd(_) => "CWD",
            Command::Pwd => "PWD",
        }
    }
}

/// A parsed server reply
///
/// Multi-line replies (`NNN-...` continuation) are collapsed into one
/// `Reply` whose `lines` hold the text of each line with the code prefix
/// stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Three-digit reply code
    pub code: u32,
    /// Reply text, one entry per line
    pub lines: Vec<String>,
}

impl Reply {
    /// The full reply text joined with newlines
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    /// The first line of the reply text
    pub fn first_line(&self) -> &str {
        self.lines.first().map(String::as_str).unwrap_or("")
    }

    /// 1xx — positive preliminary
    pub fn is_positive_preliminary(&self) -> bool {
        (100..200).contains(&self.code)
    }

    /// 2xx — positive completion
    pub fn is_positive_completion(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// 3xx — positive intermediate (more input expected)
    pub fn is_positive_intermediate(&self) -> bool {
        (300..400).contains(&self.code)
    }

    /// 4xx — transient negative completion
    pub fn is_transient_negative(&self) -> bool {
        (400..500).contains(&self.code)
    }

    /// 5xx — permanent negative completion
    pub fn is_permanent_negative(&self) -> bool {
        (500..600).contains(&self.code)
    }

    /// Any negative completion
    pub fn is_failure(&self) -> bool {
        self.code >= 400
    }
}

fn malformed(line: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("malformed FTP reply line: {:?}", line),
    )
}

/// Parses the reply code of a single line, returning the code and whether
/// this line opens a multi-line reply
fn parse_head(line: &str) -> io::Result<(u32, bool)> {
    if line.len() < 3 || !line.as_bytes()[..3].iter().all(u8::is_ascii_digit) {
        return Err(malformed(line));
    }
    let code: u32 = line[..3].parse().map_err(|_| malformed(line))?;
    let continues = line.as_bytes().get(3) == Some(&b'-');
    Ok((code, continues))
}

async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> io::Result<String> {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "control channel closed by peer",
        ));
    }
    if line.len() > MAX_REPLY_LINE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "FTP reply line exceeds maximum length",
        ));
    }
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(line)
}

/// Reads one complete (possibly multi-line) reply from the control channel
pub async fn read_reply<R: AsyncBufRead + Unpin>(reader: &mut R) -> io::Result<Reply> {
    let first = read_line(reader).await?;
    let (code, continues) = parse_head(&first)?;

    let mut lines = vec![strip_prefix(&first)];
    if continues {
        let terminator = format!("{:03} ", code);
        loop {
            let line = read_line(reader).await?;
            let done = line.starts_with(&terminator);
            lines.push(strip_prefix(&line));
            if done {
                break;
            }
        }
    }

    Ok(Reply { code, lines })
}

/// Writes one command line followed by CRLF and flushes
pub async fn write_command<W: AsyncWrite + Unpin>(
    writer: &mut W,
    command: &Command,
) -> io::Result<()> {
    let mut line = command.line();
    line.push_str("\r\n");
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

// "230 Logged in" -> "Logged in"; intermediate lines keep any free text.
fn strip_prefix(line: &str) -> String {
    let bytes = line.as_bytes();
    if bytes.len() >= 4
        && bytes[..3].iter().all(u8::is_ascii_digit)
        && (bytes[3] == b' ' || bytes[3] == b'-')
    {
        line[4..].to_string()
    } else if bytes.len() == 3 && bytes.iter().all(u8::is_ascii_digit) {
        String::new()
    } else {
        line.to_string()
    }
}
