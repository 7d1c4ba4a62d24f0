//! Blocking message pump
//!
//! [`EventPump`] is the only scheduling construct in the crate: a single
//! thread that reads one complete bulk command from the OUT endpoint, runs
//! it through the [`CcidReader`](crate::CcidReader), writes the response
//! frame(s) to the IN endpoint and repeats. CCID exchanges are one-in-flight
//! per endpoint pair, so nothing more parallel is needed; a long card call
//! simply blocks the loop and the host waits (or aborts).
//!
//! Decode failures never terminate the loop, they are answered in-band.
//! Endpoint I/O failures do, surfacing as [`Error::Transport`].

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::error::Error;
use crate::message::HEADER_LEN;
use crate::reader::CcidReader;

/// Remote control for a running pump.
///
/// Cheap to clone and send to another thread. Stopping is observed between
/// messages: the pump checks the flag before each blocking read, so a stop
/// takes effect once the current command (and whatever read is pending)
/// completes. Closing the command endpoint is the way to interrupt a pump
/// that might otherwise block forever.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    stop: Arc<AtomicBool>,
}

impl StopHandle {
    /// Ask the pump to terminate before the next message.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }
}

/// The blocking read/dispatch/write loop driving one reader.
#[derive(Debug)]
pub struct EventPump<R, W> {
    reader: CcidReader,
    command_endpoint: R,
    response_endpoint: W,
    stop: StopHandle,
}

impl<R: Read, W: Write> EventPump<R, W> {
    /// Build a pump over already-open endpoint handles: `command_endpoint`
    /// is the host-to-device bulk OUT stream, `response_endpoint` the
    /// device-to-host bulk IN stream.
    pub fn new(reader: CcidReader, command_endpoint: R, response_endpoint: W) -> Self {
        Self {
            reader,
            command_endpoint,
            response_endpoint,
            stop: StopHandle::default(),
        }
    }

    /// Handle for stopping this pump from another thread.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Drive the reader until the transport closes, fails, or a stop is
    /// requested.
    ///
    /// A clean close of the command endpoint at a message boundary returns
    /// `Ok(())`; a close mid-message or any other I/O failure returns
    /// [`Error::Transport`].
    pub fn run(&mut self) -> Result<(), Error> {
        debug!(slots = self.reader.slot_count(), "event pump started");
        loop {
            if self.stop.is_stopped() {
                debug!("event pump stopped on request");
                return Ok(());
            }
            let Some(message) = self.read_message()? else {
                debug!("command endpoint closed, event pump exiting");
                return Ok(());
            };
            trace!(message = %hex::encode(&message), "bulk command received");
            for frame in self.reader.handle(&message) {
                self.response_endpoint.write_all(&frame)?;
            }
            self.response_endpoint.flush()?;
        }
    }

    /// Read one complete bulk message: the fixed header, then the declared
    /// payload.
    ///
    /// Returns `Ok(None)` on a clean end-of-stream. A declared payload
    /// beyond the negotiated ceiling is drained from the stream so framing
    /// stays synchronized, and only the header is handed on; decoding it
    /// produces the in-band error response.
    fn read_message(&mut self) -> Result<Option<Vec<u8>>, Error> {
        let mut header = [0u8; HEADER_LEN];
        let mut filled = 0;
        while filled < HEADER_LEN {
            match self.command_endpoint.read(&mut header[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => {
                    return Err(Error::Transport(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "command endpoint closed mid-header",
                    )))
                }
                Ok(read) => filled += read,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) => return Err(error.into()),
            }
        }

        let declared = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
        let max_payload = self.reader.max_message_len() - HEADER_LEN;
        if declared > max_payload {
            warn!(declared, max_payload, "draining oversized bulk message");
            self.drain(declared)?;
            return Ok(Some(header.to_vec()));
        }

        let mut message = vec![0u8; HEADER_LEN + declared];
        message[..HEADER_LEN].copy_from_slice(&header);
        self.command_endpoint
            .read_exact(&mut message[HEADER_LEN..])
            .map_err(|error| {
                Error::Transport(io::Error::new(
                    error.kind(),
                    "command endpoint closed mid-payload",
                ))
            })?;
        Ok(Some(message))
    }

    /// Discard `remaining` payload bytes of a message we refuse to buffer.
    fn drain(&mut self, mut remaining: usize) -> Result<(), Error> {
        let mut scratch = [0u8; 4096];
        while remaining > 0 {
            let want = remaining.min(scratch.len());
            self.command_endpoint
                .read_exact(&mut scratch[..want])
                .map_err(Error::Transport)?;
            remaining -= want;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card::test_support::MockCard;
    use crate::message::{error_code, request, ResponseMessage, DEFAULT_MAX_MESSAGE_LEN};
    use crate::reader::ReaderConfig;
    use std::io::Cursor;

    fn frame(message_type: u8, slot: u8, seq: u8, params: [u8; 3], payload: &[u8]) -> Vec<u8> {
        let mut raw = vec![message_type];
        raw.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        raw.push(slot);
        raw.push(seq);
        raw.extend_from_slice(&params);
        raw.extend_from_slice(payload);
        raw
    }

    fn decode_all(mut raw: &[u8]) -> Vec<ResponseMessage> {
        let mut responses = Vec::new();
        while !raw.is_empty() {
            let declared =
                u32::from_le_bytes([raw[1], raw[2], raw[3], raw[4]]) as usize + HEADER_LEN;
            responses.push(ResponseMessage::decode(&raw[..declared]).unwrap());
            raw = &raw[declared..];
        }
        responses
    }

    fn pump_session(reader: CcidReader, commands: &[Vec<u8>]) -> Vec<ResponseMessage> {
        let input: Vec<u8> = commands.concat();
        let mut output = Vec::new();
        let mut pump = EventPump::new(reader, Cursor::new(input), &mut output);
        pump.run().unwrap();
        drop(pump);
        decode_all(&output)
    }

    #[test]
    fn processes_commands_until_clean_eof() {
        let reader = CcidReader::new(ReaderConfig::default());
        reader
            .slot(0)
            .unwrap()
            .insert(Box::new(MockCard::with_response(&[0x90, 0x00])))
            .unwrap();
        let responses = pump_session(
            reader,
            &[
                frame(request::POWER_ON, 0, 1, [0; 3], &[]),
                frame(request::XFR_BLOCK, 0, 2, [0; 3], &[0x00, 0xa4, 0x04, 0x00]),
                frame(request::POWER_OFF, 0, 3, [0; 3], &[]),
            ],
        );
        assert_eq!(responses.len(), 3);
        assert!(responses.iter().all(ResponseMessage::is_ok));
        assert_eq!(responses[0].seq, 1);
        assert_eq!(responses[1].payload.as_ref(), &[0x90, 0x00]);
        assert_eq!(responses[2].seq, 3);
    }

    #[test]
    fn oversized_message_is_drained_and_answered() {
        let reader = CcidReader::new(ReaderConfig::default());
        reader
            .slot(0)
            .unwrap()
            .insert(Box::new(MockCard::default()))
            .unwrap();
        let oversized_payload = vec![0u8; DEFAULT_MAX_MESSAGE_LEN - HEADER_LEN + 1];
        let responses = pump_session(
            reader,
            &[
                frame(request::XFR_BLOCK, 0, 1, [0; 3], &oversized_payload),
                // Framing must survive: the next command still parses.
                frame(request::GET_SLOT_STATUS, 0, 2, [0; 3], &[]),
            ],
        );
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].error, error_code::BAD_LENGTH);
        assert_eq!(responses[0].seq, 1);
        assert!(responses[1].is_ok());
        assert_eq!(responses[1].seq, 2);
    }

    #[test]
    fn truncated_message_is_a_transport_error() {
        let reader = CcidReader::new(ReaderConfig::default());
        let mut truncated = frame(request::XFR_BLOCK, 0, 1, [0; 3], &[0x01, 0x02]);
        truncated.pop();
        let mut output = Vec::new();
        let mut pump = EventPump::new(reader, Cursor::new(truncated), &mut output);
        assert!(matches!(pump.run(), Err(Error::Transport(_))));
    }

    #[test]
    fn stop_handle_halts_before_next_read() {
        let reader = CcidReader::new(ReaderConfig::default());
        let mut output = Vec::new();
        // Endless zero stream; without the stop request this would spin on
        // malformed messages forever.
        let mut pump = EventPump::new(reader, std::io::repeat(0), &mut output);
        pump.stop_handle().stop();
        pump.run().unwrap();
        assert!(output.is_empty());
    }
}
