//! Framing and parsing for Tor's control protocol.
//!
//! See control-spec.txt section 2.  Replies look like
//!
//! ```text
//! 250-status/circuit-established=1
//! 250+config-text=
//! SocksPort 9050
//! .
//! 250 OK
//! ```
//!
//! where the character after the status code says whether this is a middle
//! line (`-`), the start of a data block (`+`), or the last line (` `).

use std::collections::HashMap;
use std::fmt;

use crate::err::ControlError;

/// Status code of asynchronous event notifications.
pub(crate) const ASYNC_EVENT: u16 = 650;
/// Status code of a successful command.
pub(crate) const OK: u16 = 250;
/// Status code Tor uses when authentication fails.
pub(crate) const AUTHENTICATION_REQUIRED: u16 = 515;

/// One logical line of a reply, with its data block if it had one.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct ReplyLine {
    /// Text after the status code and separator.
    pub(crate) text: String,
    /// Lines of a `+` data block, dot-unstuffed, joined with `\n`.
    pub(crate) data: Option<String>,
}

/// A complete reply (or asynchronous event) from Tor.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Reply {
    /// The status code shared by all lines.
    pub(crate) code: u16,
    /// The lines of this reply, in order.
    pub(crate) lines: Vec<ReplyLine>,
}

impl Reply {
    /// Return true if this is an asynchronous event rather than a reply to a command.
    pub(crate) fn is_event(&self) -> bool {
        self.code == ASYNC_EVENT
    }

    /// Return true if this reply indicates success.
    pub(crate) fn is_ok(&self) -> bool {
        self.code == OK
    }

    /// Text of the last line, which carries the human-readable status.
    pub(crate) fn message(&self) -> &str {
        self.lines.last().map(|l| l.text.as_str()).unwrap_or("")
    }

    /// Turn a non-250 reply into an error.
    pub(crate) fn into_result(self, command: &str) -> Result<Reply, ControlError> {
        if self.is_ok() {
            Ok(self)
        } else {
            Err(ControlError::Rejected {
                command: command.into(),
                code: self.code,
                message: self.message().into(),
            })
        }
    }

    /// Extract `key=value` pairs from a `GETINFO` reply.
    ///
    /// Values in data blocks are returned verbatim.
    pub(crate) fn info_values(&self) -> HashMap<String, String> {
        let mut ret = HashMap::new();
        for line in &self.lines {
            let Some((key, value)) = line.text.split_once('=') else {
                continue;
            };
            let value = match &line.data {
                Some(data) => data.clone(),
                None => value.to_owned(),
            };
            ret.insert(key.to_owned(), value);
        }
        ret
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.message())
    }
}

/// What we're in the middle of reading.
#[derive(Debug)]
enum State {
    /// Waiting for a status line.
    Lines,
    /// Inside a `+` data block; lines are collected until a lone `.`.
    Data(Vec<String>),
}

/// Accumulates raw lines from Tor into complete [`Reply`] values.
#[derive(Debug)]
pub(crate) struct ReplyAssembler {
    /// Status code of the reply in progress, if any.
    code: Option<u16>,
    /// Lines of the reply in progress.
    lines: Vec<ReplyLine>,
    /// Where we are in the current line.
    state: State,
}

impl Default for ReplyAssembler {
    fn default() -> Self {
        ReplyAssembler {
            code: None,
            lines: Vec::new(),
            state: State::Lines,
        }
    }
}

impl ReplyAssembler {
    /// Feed one line (without its line ending) to the assembler.
    ///
    /// Returns a reply once its final line has been seen.
    pub(crate) fn push_line(&mut self, line: &str) -> Result<Option<Reply>, ControlError> {
        if let State::Data(data) = &mut self.state {
            if line == "." {
                let data = std::mem::take(data).join("\n");
                self.state = State::Lines;
                match self.lines.last_mut() {
                    Some(last) => last.data = Some(data),
                    None => return Err(ControlError::Protocol("data block with no header".into())),
                }
            } else {
                // Leading dots are doubled inside data blocks.
                let line = if line.starts_with("..") { &line[1..] } else { line };
                data.push(line.to_owned());
            }
            return Ok(None);
        }

        if line.len() < 4 || !line.is_char_boundary(3) {
            return Err(ControlError::Protocol(format!("line too short: {:?}", line)));
        }
        let (code, rest) = line.split_at(3);
        let code: u16 = code
            .parse()
            .map_err(|_| ControlError::Protocol(format!("bad status code in {:?}", line)))?;
        let mut chars = rest.chars();
        let sep = chars.next();
        let text = chars.as_str().to_owned();

        match self.code {
            Some(c) if c != code => {
                return Err(ControlError::Protocol(format!(
                    "status code changed from {} to {} mid-reply",
                    c, code
                )));
            }
            _ => self.code = Some(code),
        }

        self.lines.push(ReplyLine { text, data: None });
        match sep {
            Some('-') => Ok(None),
            Some('+') => {
                self.state = State::Data(Vec::new());
                Ok(None)
            }
            Some(' ') => {
                self.code = None;
                Ok(Some(Reply {
                    code,
                    lines: std::mem::take(&mut self.lines),
                }))
            }
            _ => Err(ControlError::Protocol(format!("bad separator in {:?}", line))),
        }
    }
}

/// Parse a value (something on the RHS of an =), which could be a CString as defined by
/// control-spec.txt §2. Returns (value, unparsed rest of string).
pub(crate) fn parse_one_value(from: &str) -> Result<(String, &str), &'static str> {
    let Some(rest) = from.strip_prefix('"') else {
        let space = from.find(' ').unwrap_or(from.len());
        return Ok((from[..space].into(), &from[space..]));
    };
    let mut ret = String::new();
    let mut chars = rest.chars();
    loop {
        let ch = chars.next().ok_or("ran out of input parsing CString")?;
        match ch {
            '\\' => match chars
                .next()
                .ok_or("encountered trailing backslash in CString")?
            {
                'n' => ret.push('\n'),
                'r' => ret.push('\r'),
                't' => ret.push('\t'),
                '0'..='7' => return Err("octal escapes are not supported"),
                other => ret.push(other),
            },
            '"' => break,
            _ => ret.push(ch),
        }
    }
    Ok((ret, chars.as_str()))
}

/// Split a string of `KEY=VALUE` arguments, where values may be quoted.
///
/// Words without an `=` are returned separately, in order.
pub(crate) fn parse_arguments(
    mut s: &str,
) -> Result<(Vec<String>, HashMap<String, String>), &'static str> {
    let mut words = Vec::new();
    let mut args = HashMap::new();
    loop {
        s = s.trim_start_matches(' ');
        if s.is_empty() {
            break;
        }
        let word_end = s.find([' ', '=']).unwrap_or(s.len());
        if s[word_end..].starts_with('=') {
            let key = &s[..word_end];
            let (value, rest) = parse_one_value(&s[word_end + 1..])?;
            args.insert(key.to_owned(), value);
            s = rest;
        } else {
            words.push(s[..word_end].to_owned());
            s = &s[word_end..];
        }
    }
    Ok((words, args))
}

/// Quote `s` as a control-protocol CString if it needs it.
pub(crate) fn quote(s: &str) -> String {
    if !s.is_empty() && !s.contains([' ', '"', '\\', '\r', '\n', '\t']) {
        return s.to_owned();
    }
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}
