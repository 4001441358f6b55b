use crate::protocol::{
    self, Command, CommandSequence, COMMAND_IN_ENDPOINT, COMMAND_OUT_ENDPOINT,
    RESPONSE_COMPLETE_LENGTH, RESPONSE_COMPLETE_MAGIC,
};
use crate::{Kinect2Error, Result};
use rusb::{DeviceHandle, UsbContext};
use std::time::Duration;

/// Default timeout of each command write and read.
pub const COMMAND_TIMEOUT: Duration = Duration::from_millis(1000);

/// Synchronous bulk pipe the command protocol runs over.
///
/// Implemented by [`rusb::DeviceHandle`]; tests substitute a scripted pipe.
pub trait CommandPipe {
    fn write_bulk(&self, endpoint: u8, data: &[u8], timeout: Duration) -> rusb::Result<usize>;
    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize>;
}

impl<T: UsbContext> CommandPipe for DeviceHandle<T> {
    fn write_bulk(&self, endpoint: u8, data: &[u8], timeout: Duration) -> rusb::Result<usize> {
        DeviceHandle::write_bulk(self, endpoint, data, timeout)
    }

    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize> {
        DeviceHandle::read_bulk(self, endpoint, buf, timeout)
    }
}

/// How long to wait for a status bit before giving up softly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            attempts: 50,
            interval: Duration::from_millis(100),
        }
    }
}

/// Outcome of [`CommandTransaction::poll_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusPoll {
    /// Ready bit seen; carries the status word.
    Ready(u32),
    /// Attempts exhausted; carries the last status word.
    TimedOut(u32),
}

/// Request/response exchange on the command endpoints.
///
/// One command is outstanding at a time. Callers serialize access and
/// supply sequence numbers from their session's [`CommandSequence`].
#[derive(Debug, Clone)]
pub struct CommandTransaction {
    in_endpoint: u8,
    out_endpoint: u8,
    timeout: Duration,
}

impl Default for CommandTransaction {
    fn default() -> Self {
        Self::new(COMMAND_IN_ENDPOINT, COMMAND_OUT_ENDPOINT, COMMAND_TIMEOUT)
    }
}

impl CommandTransaction {
    pub fn new(in_endpoint: u8, out_endpoint: u8, timeout: Duration) -> Self {
        Self {
            in_endpoint,
            out_endpoint,
            timeout,
        }
    }

    /// Send `command` and return its response payload.
    ///
    /// Commands with a zero maximum response length get only the
    /// response-complete trailer back, so the payload is empty.
    pub fn execute<P: CommandPipe + ?Sized>(&self, pipe: &P, command: &Command) -> Result<Vec<u8>> {
        let request = command.to_bytes();
        let sent = pipe
            .write_bulk(self.out_endpoint, &request, self.timeout)
            .map_err(|e| {
                log::error!("command {:?} write failed: {}", command.opcode, e);
                e
            })?;
        if sent != request.len() {
            log::error!("command {:?}: sent {} of {} bytes", command.opcode, sent, request.len());
            return Err(Kinect2Error::ShortWrite {
                sent,
                expected: request.len(),
            });
        }

        let mut payload = Vec::new();
        if command.max_response_length > 0 {
            payload = vec![0u8; command.max_response_length as usize];
            let received = pipe.read_bulk(self.in_endpoint, &mut payload, self.timeout)?;
            payload.truncate(received);

            if protocol::is_response_complete(&payload) {
                log::error!("command {:?}: premature response complete", command.opcode);
                return Err(Kinect2Error::PrematureComplete);
            }
        }

        let mut trailer = [0u8; RESPONSE_COMPLETE_LENGTH];
        let received = pipe.read_bulk(self.in_endpoint, &mut trailer, self.timeout)?;
        let Some(complete) = protocol::parse_response_complete(&trailer[..received]) else {
            log::error!(
                "command {:?}: missing response complete ({} bytes)",
                command.opcode,
                received
            );
            return Err(Kinect2Error::MissingComplete(received));
        };
        if complete.magic != RESPONSE_COMPLETE_MAGIC {
            log::error!(
                "command {:?}: bad response complete magic 0x{:08x}",
                command.opcode,
                complete.magic
            );
            return Err(Kinect2Error::BadMagic {
                expected: RESPONSE_COMPLETE_MAGIC,
                actual: complete.magic,
            });
        }
        if complete.sequence != command.sequence {
            log::error!(
                "command {:?}: response complete with wrong sequence number (expected {}, got {})",
                command.opcode,
                command.sequence,
                complete.sequence
            );
            return Err(Kinect2Error::SequenceMismatch {
                expected: command.sequence,
                actual: complete.sequence,
            });
        }

        log::trace!(
            "command {:?} seq {} -> {} bytes",
            command.opcode,
            command.sequence,
            payload.len()
        );
        Ok(payload)
    }

    /// Poll status register 0x090000 until bit 0 is set.
    ///
    /// Exhausting the attempts is not an error: the caller decides
    /// whether to carry on with [`StatusPoll::TimedOut`].
    pub fn poll_status<P: CommandPipe + ?Sized>(
        &self,
        pipe: &P,
        sequence: &mut CommandSequence,
        policy: PollPolicy,
    ) -> Result<StatusPoll> {
        let mut last = 0;
        for _ in 0..policy.attempts {
            let response = self.execute(pipe, &Command::read_status(sequence.next()))?;
            let status = protocol::parse_status(&response)?;
            if status != last {
                log::debug!("status 0x090000: {}", status);
            }
            if status & 1 != 0 {
                return Ok(StatusPoll::Ready(status));
            }
            last = status;
            std::thread::sleep(policy.interval);
        }
        log::debug!("status 0x090000: timeout");
        Ok(StatusPoll::TimedOut(last))
    }
}

/// A transaction plus the sequence counter of one device session.
#[derive(Debug)]
pub struct CommandSession {
    transaction: CommandTransaction,
    sequence: CommandSequence,
}

impl CommandSession {
    pub fn new(transaction: CommandTransaction) -> Self {
        Self {
            transaction,
            sequence: CommandSequence::new(),
        }
    }

    /// Build a command with the next sequence number and run it.
    pub fn execute<P, F>(&mut self, pipe: &P, build: F) -> Result<Vec<u8>>
    where
        P: CommandPipe + ?Sized,
        F: FnOnce(u32) -> Command,
    {
        let command = build(self.sequence.next());
        self.transaction.execute(pipe, &command)
    }

    pub fn poll_status<P: CommandPipe + ?Sized>(
        &mut self,
        pipe: &P,
        policy: PollPolicy,
    ) -> Result<StatusPoll> {
        self.transaction.poll_status(pipe, &mut self.sequence, policy)
    }

    /// Sequence number of the next command.
    pub fn next_sequence(&self) -> u32 {
        self.sequence.peek()
    }
}
