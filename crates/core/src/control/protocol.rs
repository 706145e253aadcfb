/// Control protocol reply framing
///
/// Tor answers every command with one or more lines of the form
/// `<status><sep><text>`, where `sep` is `-` for a mid-reply line, `+`
/// for a line followed by a dot-terminated data block, and a space for
/// the final line. Asynchronous events use the same framing with
/// status 650.

use super::ControlError;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Status code Tor uses for asynchronous event notifications
pub const ASYNC_EVENT_STATUS: u16 = 650;

/// A single reply line, with its data block if it had one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyLine {
    pub status: u16,
    pub separator: char,
    pub text: String,
    pub data: Option<String>,
}

/// A complete reply: every line up to and including the final one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub lines: Vec<ReplyLine>,
}

impl Reply {
    /// Status of the final line
    pub fn status(&self) -> u16 {
        self.lines.last().map(|line| line.status).unwrap_or(0)
    }

    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.status())
    }

    pub fn is_async_event(&self) -> bool {
        self.lines
            .first()
            .map(|line| line.status == ASYNC_EVENT_STATUS)
            .unwrap_or(false)
    }

    /// Text of the first line, which carries the event keyword for 650 replies
    pub fn first_text(&self) -> &str {
        self.lines.first().map(|line| line.text.as_str()).unwrap_or("")
    }

    /// Turn a non-2xx reply into `ControlError::Rejected`
    pub fn into_result(self) -> Result<Self, ControlError> {
        if self.is_ok() {
            Ok(self)
        } else {
            let message = self
                .lines
                .iter()
                .map(|line| line.text.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            Err(ControlError::Rejected {
                status: self.status(),
                message,
            })
        }
    }

    /// `key=value` pairs from GETINFO/GETCONF replies; data blocks become the value
    pub fn key_values(&self) -> Vec<(String, String)> {
        self.lines
            .iter()
            .filter_map(|line| {
                let (key, inline) = line.text.split_once('=')?;
                let value = match &line.data {
                    Some(data) => data.clone(),
                    None => inline.to_string(),
                };
                Some((key.to_string(), value))
            })
            .collect()
    }

    pub fn value_for(&self, key: &str) -> Option<String> {
        self.key_values()
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }
}

/// Split one raw line into status, separator and text
pub fn parse_line(raw: &str) -> Result<(u16, char, String), ControlError> {
    let line = raw.trim_end_matches(['\r', '\n']);
    if line.len() < 4 || !line.is_char_boundary(3) {
        return Err(ControlError::Protocol(format!("short reply line: {:?}", line)));
    }

    let status = line[..3]
        .parse::<u16>()
        .map_err(|_| ControlError::Protocol(format!("bad status code in {:?}", line)))?;
    let separator = line[3..].chars().next().unwrap_or(' ');
    if !matches!(separator, ' ' | '-' | '+') {
        return Err(ControlError::Protocol(format!(
            "bad separator {:?} in {:?}",
            separator, line
        )));
    }

    Ok((status, separator, line[4..].to_string()))
}

/// Read one complete reply. Returns `Ok(None)` on a clean EOF between replies.
pub async fn read_reply<R>(reader: &mut R) -> Result<Option<Reply>, ControlError>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = Vec::new();

    loop {
        let mut raw = String::new();
        let read = reader.read_line(&mut raw).await?;
        if read == 0 {
            if lines.is_empty() {
                return Ok(None);
            }
            return Err(ControlError::ConnectionClosed);
        }
        if raw.trim().is_empty() {
            continue;
        }

        let (status, separator, text) = parse_line(&raw)?;
        let data = if separator == '+' {
            Some(read_data_block(reader).await?)
        } else {
            None
        };

        lines.push(ReplyLine {
            status,
            separator,
            text,
            data,
        });

        if separator == ' ' {
            return Ok(Some(Reply { lines }));
        }
    }
}

/// Read a dot-terminated data block, undoing leading-dot escaping
async fn read_data_block<R>(reader: &mut R) -> Result<String, ControlError>
where
    R: AsyncBufRead + Unpin,
{
    let mut body: Vec<String> = Vec::new();

    loop {
        let mut raw = String::new();
        if reader.read_line(&mut raw).await? == 0 {
            return Err(ControlError::ConnectionClosed);
        }
        let line = raw.trim_end_matches(['\r', '\n']);
        if line == "." {
            return Ok(body.join("\n"));
        }
        let unescaped = line.strip_prefix('.').filter(|rest| rest.starts_with('.'));
        body.push(unescaped.unwrap_or(line).to_string());
    }
}
