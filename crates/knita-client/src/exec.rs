use crate::Error;
use knita_protocol::{ExecEvent, ProtocolError};
use std::io::Write;
use tracing::debug;

/// Where a command's output goes. A `None` sink discards that stream.
#[derive(Default)]
pub struct ExecSinks<'a> {
    pub stdout: Option<&'a mut dyn Write>,
    pub stderr: Option<&'a mut dyn Write>,
}

impl<'a> ExecSinks<'a> {
    pub fn new(stdout: &'a mut dyn Write, stderr: &'a mut dyn Write) -> Self {
        Self {
            stdout: Some(stdout),
            stderr: Some(stderr),
        }
    }

    pub fn discard() -> Self {
        Self::default()
    }
}

/// Result of a command that ran to completion with exit code zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecOutcome {
    pub exit_code: i32,
    pub stdout_bytes: u64,
    pub stderr_bytes: u64,
}

/// Captured output of a command, whatever its exit code.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Consume an exec event stream, forwarding output to `sinks` as it arrives.
///
/// Elements are handled strictly in order and each chunk is written before
/// the next element is pulled. The stream must end with exactly one `End`;
/// anything else is reported as an error.
pub fn demux<I>(events: I, sinks: &mut ExecSinks<'_>) -> Result<ExecOutcome, Error>
where
    I: IntoIterator<Item = Result<ExecEvent, ProtocolError>>,
{
    let mut events = events.into_iter();
    let mut started = false;
    let mut outcome = ExecOutcome::default();

    while let Some(next) = events.next() {
        let event = match next {
            Ok(event) => event,
            Err(ProtocolError::Io(e)) => {
                return Err(Error::RemoteExecution(format!("exec stream aborted: {e}")));
            }
            Err(ProtocolError::Malformed(msg)) => return Err(Error::ProtocolViolation(msg)),
        };
        match event {
            ExecEvent::Start => {
                if started {
                    return Err(Error::ProtocolViolation(
                        "duplicate start event".to_owned(),
                    ));
                }
                started = true;
            }
            ExecEvent::Stdout { data } => {
                if let Some(sink) = sinks.stdout.as_deref_mut() {
                    sink.write_all(&data)?;
                }
                outcome.stdout_bytes += data.len() as u64;
            }
            ExecEvent::Stderr { data } => {
                if let Some(sink) = sinks.stderr.as_deref_mut() {
                    sink.write_all(&data)?;
                }
                outcome.stderr_bytes += data.len() as u64;
            }
            ExecEvent::End { exit_code, error } => {
                if let Some(extra) = events.next() {
                    let kind = extra.as_ref().map_or("undecodable", ExecEvent::kind);
                    return Err(Error::ProtocolViolation(format!(
                        "{kind} element after exec end"
                    )));
                }
                flush(sinks)?;
                debug!(
                    "exec end: code={exit_code} stdout={}B stderr={}B",
                    outcome.stdout_bytes, outcome.stderr_bytes
                );
                if !error.is_empty() {
                    return Err(Error::RemoteExecution(error));
                }
                if exit_code != 0 {
                    return Err(Error::ExecExit { exit_code });
                }
                outcome.exit_code = exit_code;
                return Ok(outcome);
            }
        }
    }

    Err(Error::ProtocolViolation(
        "stream closed before exec end".to_owned(),
    ))
}

fn flush(sinks: &mut ExecSinks<'_>) -> std::io::Result<()> {
    if let Some(sink) = sinks.stdout.as_deref_mut() {
        sink.flush()?;
    }
    if let Some(sink) = sinks.stderr.as_deref_mut() {
        sink.flush()?;
    }
    Ok(())
}
