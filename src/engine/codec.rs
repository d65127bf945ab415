//! Attach stream codec.
//!
//! The engine multiplexes stdout and stderr over the hijacked attach stream
//! using framed records; with a TTY the stream is raw bytes. The transport
//! layer already splits the stream into [`LogOutput`] records, so this module
//! routes them to the right writer and implements the guest agent PID
//! pre-read that precedes the first payload byte.

use bollard::container::LogOutput;
use futures::stream::StreamExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::warn;

use super::client::OutputStream;
use super::{EngineError, Result};

/// Read the process ID announced by the guest agent before it hands the
/// stream over to the requested program.
///
/// The agent writes the PID as a 4-byte little-endian integer as the very
/// first stdout payload. With a TTY the stream is raw, so the four bytes are
/// accumulated directly; without one, the first record must be a stdout
/// record of at least four payload bytes. A stderr record in that position
/// means the agent is not talking - most likely it is not installed in the
/// guest image.
///
/// Returns the PID and any payload bytes that followed it; those belong to
/// the program's stdout and must be forwarded unaltered.
pub(crate) async fn read_pid(output: &mut OutputStream, tty: bool) -> Result<(i64, Vec<u8>)> {
    if tty {
        let mut buffer: Vec<u8> = Vec::with_capacity(8);
        while buffer.len() < 4 {
            match output.next().await {
                None => {
                    return Err(EngineError::PidRead(
                        "stream closed before the process ID arrived".to_string(),
                    ));
                }
                Some(Err(err)) => return Err(EngineError::Api(err)),
                Some(Ok(LogOutput::StdErr { message })) => {
                    return Err(EngineError::AgentRead(
                        String::from_utf8_lossy(&message).into_owned(),
                    ));
                }
                Some(Ok(record)) => buffer.extend_from_slice(&record.into_bytes()),
            }
        }
        let pid = u32::from_le_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]);
        Ok((i64::from(pid), buffer.split_off(4)))
    } else {
        let record = match output.next().await {
            None => {
                return Err(EngineError::PidRead(
                    "stream closed before the process ID arrived".to_string(),
                ));
            }
            Some(Err(err)) => return Err(EngineError::Api(err)),
            Some(Ok(LogOutput::StdErr { message })) => {
                return Err(EngineError::AgentRead(
                    String::from_utf8_lossy(&message).into_owned(),
                ));
            }
            Some(Ok(record)) => record,
        };
        let payload = record.into_bytes();
        if payload.len() < 4 {
            return Err(EngineError::PidRead(format!(
                "short process ID record ({} bytes)",
                payload.len()
            )));
        }
        let pid = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        Ok((i64::from(pid), payload[4..].to_vec()))
    }
}

/// Copy the attach stream to the session until EOF.
///
/// With a TTY everything is raw program output and goes to `stdout`; without
/// one, stderr records are routed to `stderr` and the rest to `stdout`.
/// `leftover` is written first: it holds stdout bytes the PID pre-read
/// already pulled off the stream.
pub(crate) async fn pump_output<O, E>(
    mut output: OutputStream,
    leftover: Vec<u8>,
    mut stdout: O,
    mut stderr: E,
    tty: bool,
) where
    O: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    if !leftover.is_empty() {
        if let Err(err) = stdout.write_all(&leftover).await {
            warn!("failed to stream output ({})", err);
            return;
        }
    }
    while let Some(record) = output.next().await {
        let result = match record {
            Ok(LogOutput::StdErr { message }) if !tty => stderr.write_all(&message).await,
            Ok(record) => stdout.write_all(&record.into_bytes()).await,
            Err(err) => {
                warn!("failed to stream output ({})", err);
                break;
            }
        };
        if let Err(err) = result {
            warn!("failed to stream output ({})", err);
            break;
        }
        let _ = stdout.flush().await;
        let _ = stderr.flush().await;
    }
    let _ = stdout.flush().await;
    let _ = stderr.flush().await;
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn stream_of(records: Vec<LogOutput>) -> OutputStream {
        Box::pin(futures::stream::iter(records.into_iter().map(Ok)))
    }

    fn stdout_record(bytes: &[u8]) -> LogOutput {
        LogOutput::StdOut {
            message: Bytes::copy_from_slice(bytes),
        }
    }

    fn console_record(bytes: &[u8]) -> LogOutput {
        LogOutput::Console {
            message: Bytes::copy_from_slice(bytes),
        }
    }

    fn stderr_record(bytes: &[u8]) -> LogOutput {
        LogOutput::StdErr {
            message: Bytes::copy_from_slice(bytes),
        }
    }

    #[tokio::test]
    async fn test_pid_pre_read_framed() {
        let mut output = stream_of(vec![stdout_record(&[42, 0, 0, 0])]);
        let (pid, leftover) = read_pid(&mut output, false).await.unwrap();
        assert_eq!(pid, 42);
        assert!(leftover.is_empty());
    }

    #[tokio::test]
    async fn test_pid_pre_read_forwards_remainder() {
        let mut output = stream_of(vec![stdout_record(b"\x39\x05\x00\x00hello")]);
        let (pid, leftover) = read_pid(&mut output, false).await.unwrap();
        assert_eq!(pid, 1337);
        assert_eq!(leftover, b"hello");
    }

    #[tokio::test]
    async fn test_pid_pre_read_rejects_stderr() {
        let mut output = stream_of(vec![stderr_record(b"agent: not found")]);
        let err = read_pid(&mut output, false).await.unwrap_err();
        assert!(matches!(err, EngineError::AgentRead(_)));
    }

    #[tokio::test]
    async fn test_pid_pre_read_rejects_short_record() {
        let mut output = stream_of(vec![stdout_record(&[1, 2])]);
        let err = read_pid(&mut output, false).await.unwrap_err();
        assert!(matches!(err, EngineError::PidRead(_)));
    }

    #[tokio::test]
    async fn test_pid_pre_read_rejects_closed_stream() {
        let mut output = stream_of(Vec::new());
        let err = read_pid(&mut output, false).await.unwrap_err();
        assert!(matches!(err, EngineError::PidRead(_)));
    }

    #[tokio::test]
    async fn test_pid_pre_read_tty_accumulates_chunks() {
        let mut output = stream_of(vec![
            console_record(&[42, 0]),
            console_record(&[0, 0]),
            console_record(b"prompt$ "),
        ]);
        let (pid, leftover) = read_pid(&mut output, true).await.unwrap();
        assert_eq!(pid, 42);
        assert!(leftover.is_empty());

        let mut output = stream_of(vec![console_record(b"\x07\x00\x00\x00$ ")]);
        let (pid, leftover) = read_pid(&mut output, true).await.unwrap();
        assert_eq!(pid, 7);
        assert_eq!(leftover, b"$ ");
    }

    #[tokio::test]
    async fn test_pump_demultiplexes_streams() {
        let output = stream_of(vec![
            stdout_record(b"out1"),
            stderr_record(b"err1"),
            stdout_record(b"out2"),
        ]);
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        pump_output(output, Vec::new(), &mut stdout, &mut stderr, false).await;
        assert_eq!(stdout, b"out1out2");
        assert_eq!(stderr, b"err1");
    }

    #[tokio::test]
    async fn test_pump_tty_sends_everything_to_stdout() {
        let output = stream_of(vec![console_record(b"all"), stderr_record(b"mixed")]);
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        pump_output(output, Vec::new(), &mut stdout, &mut stderr, true).await;
        assert_eq!(stdout, b"allmixed");
        assert!(stderr.is_empty());
    }

    #[tokio::test]
    async fn test_pump_writes_leftover_first() {
        let output = stream_of(vec![stdout_record(b" world")]);
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        pump_output(output, b"hello".to_vec(), &mut stdout, &mut stderr, false).await;
        assert_eq!(stdout, b"hello world");
    }

    #[tokio::test]
    async fn test_pre_read_then_pump_round_trips_appended_bytes() {
        let payload = b"\x2a\x00\x00\x00first chunk";
        let mut output = stream_of(vec![
            stdout_record(payload),
            stdout_record(b", second chunk"),
        ]);
        let (pid, leftover) = read_pid(&mut output, false).await.unwrap();
        assert_eq!(pid, 42);
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        pump_output(output, leftover, &mut stdout, &mut stderr, false).await;
        assert_eq!(stdout, b"first chunk, second chunk");
    }
}
