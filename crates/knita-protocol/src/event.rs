use crate::ProtocolError;
use serde::{Deserialize, Serialize};
use std::io::BufRead;

/// One element of an exec event stream.
///
/// Serialized externally tagged, one JSON document per line:
/// `"start"`, `{"stdout":{"data":"<base64>"}}`, `{"stderr":{"data":"<base64>"}}`,
/// `{"end":{"exit_code":0,"error":""}}`. Unknown variants fail to decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecEvent {
    /// The command was accepted and is running.
    Start,
    Stdout {
        #[serde(with = "crate::b64")]
        data: Vec<u8>,
    },
    Stderr {
        #[serde(with = "crate::b64")]
        data: Vec<u8>,
    },
    /// Terminal element. A non-empty `error` means the command could not be run.
    End {
        exit_code: i32,
        #[serde(default)]
        error: String,
    },
}

impl ExecEvent {
    pub fn stdout(data: impl Into<Vec<u8>>) -> Self {
        Self::Stdout { data: data.into() }
    }

    pub fn stderr(data: impl Into<Vec<u8>>) -> Self {
        Self::Stderr { data: data.into() }
    }

    pub fn exited(exit_code: i32) -> Self {
        Self::End {
            exit_code,
            error: String::new(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self::End {
            exit_code: -1,
            error: error.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stdout { .. } => "stdout",
            Self::Stderr { .. } => "stderr",
            Self::End { .. } => "end",
        }
    }

    pub fn is_end(&self) -> bool {
        matches!(self, Self::End { .. })
    }
}

/// Encode one event as a newline-terminated JSON line.
pub fn encode_event(event: &ExecEvent) -> Vec<u8> {
    // Serializing a plain enum of strings and byte vectors cannot fail.
    let mut line = serde_json::to_vec(event).unwrap_or_default();
    line.push(b'\n');
    line
}

pub fn decode_event(line: &str) -> Result<ExecEvent, ProtocolError> {
    serde_json::from_str(line)
        .map_err(|e| ProtocolError::Malformed(format!("invalid exec event: {e}")))
}

/// Iterator over the events of a newline-delimited stream, in arrival order.
///
/// Blank lines are skipped. End of input ends the iteration; it does not
/// imply the stream was complete.
pub struct EventReader<R> {
    reader: R,
    line: Vec<u8>,
}

impl<R: BufRead> EventReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: Vec::new(),
        }
    }
}

impl<R: BufRead> Iterator for EventReader<R> {
    type Item = Result<ExecEvent, ProtocolError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.line.clear();
            match self.reader.read_until(b'\n', &mut self.line) {
                Ok(0) => return None,
                Ok(_) => {
                    let Ok(text) = std::str::from_utf8(&self.line) else {
                        return Some(Err(ProtocolError::Malformed(
                            "exec event is not valid UTF-8".to_owned(),
                        )));
                    };
                    let trimmed = text.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    return Some(decode_event(trimmed));
                }
                Err(e) => return Some(Err(ProtocolError::Io(e))),
            }
        }
    }
}
