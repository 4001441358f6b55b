/// Errors that can occur when talking to the Kinect v2.
#[derive(Debug, thiserror::Error)]
pub enum Kinect2Error {
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    #[error("Device not found (VID=045E PID=02D8/02C4)")]
    DeviceNotFound,

    #[error("Device {0} is already open")]
    AlreadyOpen(String),

    #[error("Invalid device state: expected {expected}, was {actual}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Sent {sent} of {expected} command bytes")]
    ShortWrite { sent: usize, expected: usize },

    #[error("Received response complete before the response payload")]
    PrematureComplete,

    #[error("Missing response complete (got {0} bytes)")]
    MissingComplete(usize),

    #[error("Invalid response magic: expected 0x{expected:08x}, got 0x{actual:08x}")]
    BadMagic { expected: u32, actual: u32 },

    #[error("Response sequence mismatch: expected {expected}, got {actual}")]
    SequenceMismatch { expected: u32, actual: u32 },

    #[error("Response too short: expected {expected} bytes, got {actual}")]
    ResponseTooShort { expected: usize, actual: usize },

    #[error("IR max iso packet size too small: expected at least 0x{expected:x}, got 0x{actual:x}")]
    IsoPacketSizeTooSmall { expected: usize, actual: usize },

    #[error("Transfer submission disabled")]
    SubmissionDisabled,

    #[error("Transfer pool is not allocated")]
    NotAllocated,

    #[error("{0} transfer(s) still in flight")]
    TransfersInFlight(usize),

    #[error("Timed out waiting for {pending} transfer(s) to cancel")]
    CancelTimeout { pending: usize },

    #[error("Timed out waiting for data")]
    Timeout,

    #[error("Stream stopped")]
    StreamStopped,

    #[error("Failed to spawn thread: {0}")]
    Thread(String),
}
