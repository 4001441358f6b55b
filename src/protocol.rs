use crate::types::{ColorCameraParams, IrCameraParams};
use crate::{Kinect2Error, Result};

// -- USB identifiers --
pub const VENDOR_ID: u16 = 0x045E;
pub const PRODUCT_ID: u16 = 0x02D8;
pub const PRODUCT_ID_PREVIEW: u16 = 0x02C4;

// -- Interfaces and endpoints --
pub const CONTROL_AND_RGB_INTERFACE: u8 = 0;
pub const IR_INTERFACE: u8 = 1;
pub const COMMAND_IN_ENDPOINT: u8 = 0x81;
pub const COMMAND_OUT_ENDPOINT: u8 = 0x02;
pub const RGB_ENDPOINT: u8 = 0x83;
pub const IR_ENDPOINT: u8 = 0x84;

/// Smallest IR isochronous packet size the depth stream works with.
pub const MIN_IR_ISO_PACKET_SIZE: usize = 0x8400;

// -- Command framing --
pub const COMMAND_MAGIC: u32 = 0x0602_2009;
pub const RESPONSE_COMPLETE_MAGIC: u32 = 0x0A6F_E000;
pub const RESPONSE_COMPLETE_LENGTH: usize = 16;
pub const COMMAND_HEADER_LENGTH: usize = 20;
pub const MAX_COMMAND_PARAMS: usize = 4;

/// Command opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Opcode {
    Shutdown = 0x00,
    ReadFirmwareVersions = 0x02,
    InitStreams = 0x09,
    Stop = 0x0A,
    ReadHardwareInfo = 0x14,
    ReadStatus = 0x16,
    ReadDataPage = 0x22,
    SetStreaming = 0x2B,
    SetMode = 0x4B,
}

/// Pages readable with [`Opcode::ReadDataPage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DataPage {
    SerialNumber = 0x01,
    P0Tables = 0x02,
    DepthCameraParams = 0x03,
    ColorCameraParams = 0x04,
}

/// Status register polled while the sensor settles.
pub const STATUS_0X090000: u32 = 0x09_0000;

const CALIBRATION_PAGE_LENGTH: u32 = 0x1C_0000;

/// Per-session command sequence counter.
///
/// Sequence numbers start at zero and increase by one for every command
/// built from the counter, including ones that later fail.
#[derive(Debug, Default)]
pub struct CommandSequence {
    next: u32,
}

impl CommandSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&mut self) -> u32 {
        let sequence = self.next;
        self.next = self.next.wrapping_add(1);
        sequence
    }

    /// The sequence number the next command will carry.
    pub fn peek(&self) -> u32 {
        self.next
    }
}

/// One request on the command pipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub opcode: Opcode,
    pub sequence: u32,
    pub max_response_length: u32,
    pub params: Vec<u32>,
}

impl Command {
    pub fn new(opcode: Opcode, sequence: u32, max_response_length: u32, params: &[u32]) -> Self {
        debug_assert!(params.len() <= MAX_COMMAND_PARAMS);
        Self {
            opcode,
            sequence,
            max_response_length,
            params: params.to_vec(),
        }
    }

    pub fn read_firmware_versions(sequence: u32) -> Self {
        Self::new(Opcode::ReadFirmwareVersions, sequence, 0x200, &[])
    }

    pub fn read_hardware_info(sequence: u32) -> Self {
        Self::new(Opcode::ReadHardwareInfo, sequence, 0x5C, &[])
    }

    pub fn read_serial_number(sequence: u32) -> Self {
        Self::new(
            Opcode::ReadDataPage,
            sequence,
            0x80,
            &[DataPage::SerialNumber as u32],
        )
    }

    pub fn read_p0_tables(sequence: u32) -> Self {
        Self::read_calibration_page(sequence, DataPage::P0Tables)
    }

    pub fn read_depth_camera_params(sequence: u32) -> Self {
        Self::read_calibration_page(sequence, DataPage::DepthCameraParams)
    }

    pub fn read_color_camera_params(sequence: u32) -> Self {
        Self::read_calibration_page(sequence, DataPage::ColorCameraParams)
    }

    fn read_calibration_page(sequence: u32, page: DataPage) -> Self {
        Self::new(
            Opcode::ReadDataPage,
            sequence,
            CALIBRATION_PAGE_LENGTH,
            &[page as u32],
        )
    }

    pub fn read_status(sequence: u32) -> Self {
        Self::new(Opcode::ReadStatus, sequence, 4, &[STATUS_0X090000])
    }

    pub fn init_streams(sequence: u32) -> Self {
        Self::new(Opcode::InitStreams, sequence, 0, &[])
    }

    pub fn set_streaming(sequence: u32, enabled: bool) -> Self {
        Self::new(Opcode::SetStreaming, sequence, 0, &[enabled as u32])
    }

    pub fn set_mode(sequence: u32, enabled: bool) -> Self {
        Self::new(Opcode::SetMode, sequence, 0, &[enabled as u32, 0, 0, 0])
    }

    /// Mode enable carrying the 0x00640064 argument sent around stream setup.
    pub fn set_mode_0x00640064(sequence: u32) -> Self {
        Self::new(Opcode::SetMode, sequence, 0, &[1, 0x0064_0064, 0, 0])
    }

    pub fn stop(sequence: u32) -> Self {
        Self::new(Opcode::Stop, sequence, 0, &[])
    }

    /// Reboots the device; it re-enumerates a few seconds later.
    pub fn shutdown(sequence: u32) -> Self {
        Self::new(Opcode::Shutdown, sequence, 0, &[])
    }

    /// Serialize as little-endian words:
    /// `[magic, sequence, max_response_length, opcode, 0, params...]`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(COMMAND_HEADER_LENGTH + 4 * self.params.len());
        for word in [
            COMMAND_MAGIC,
            self.sequence,
            self.max_response_length,
            self.opcode as u32,
            0,
        ] {
            buf.extend_from_slice(&word.to_le_bytes());
        }
        for param in &self.params {
            buf.extend_from_slice(&param.to_le_bytes());
        }
        buf
    }
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&data[offset..offset + 4]);
    u32::from_le_bytes(word)
}

fn read_f32(data: &[u8], offset: usize) -> f32 {
    f32::from_bits(read_u32(data, offset))
}

fn require_len(data: &[u8], expected: usize) -> Result<()> {
    if data.len() < expected {
        return Err(Kinect2Error::ResponseTooShort {
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

/// Decoded response-complete trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseComplete {
    pub magic: u32,
    pub sequence: u32,
    pub result: u32,
}

/// Interpret `data` as a response-complete trailer, if it is one.
pub fn parse_response_complete(data: &[u8]) -> Option<ResponseComplete> {
    if data.len() != RESPONSE_COMPLETE_LENGTH {
        return None;
    }
    Some(ResponseComplete {
        magic: read_u32(data, 0),
        sequence: read_u32(data, 4),
        result: read_u32(data, 8),
    })
}

/// True when `data` looks exactly like a response-complete trailer.
pub fn is_response_complete(data: &[u8]) -> bool {
    parse_response_complete(data).is_some_and(|r| r.magic == RESPONSE_COMPLETE_MAGIC)
}

const FIRMWARE_RECORD_LENGTH: usize = 16;

fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

/// Version of one firmware subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareVersion {
    pub major: u16,
    pub minor: u16,
    pub build: u16,
    pub revision: u16,
}

impl std::fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}.{}", self.major, self.minor, self.build, self.revision)
    }
}

/// Parse the firmware-versions response. Each 16-byte record holds u16
/// minor, major, build and revision followed by reserved words.
pub fn parse_firmware_versions(data: &[u8]) -> Vec<FirmwareVersion> {
    data.chunks_exact(FIRMWARE_RECORD_LENGTH)
        .map(|record| FirmwareVersion {
            minor: read_u16(record, 0),
            major: read_u16(record, 2),
            build: read_u16(record, 4),
            revision: read_u16(record, 6),
        })
        .collect()
}

/// All subsystem versions, space separated.
pub fn firmware_version_string(data: &[u8]) -> String {
    parse_firmware_versions(data)
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Serial number page: UTF-16LE, NUL terminated. Only the low byte of each
/// code unit is significant.
pub fn parse_serial_number(data: &[u8]) -> String {
    data.chunks_exact(2)
        .map(|unit| unit[0])
        .take_while(|&c| c != 0)
        .map(char::from)
        .collect()
}

/// Single little-endian status word.
pub fn parse_status(data: &[u8]) -> Result<u32> {
    require_len(data, 4)?;
    Ok(read_u32(data, 0))
}

const DEPTH_PARAMS_LENGTH: usize = 10 * 4;

/// IR intrinsics from the depth camera parameter page.
pub fn parse_ir_camera_params(data: &[u8]) -> Result<IrCameraParams> {
    require_len(data, DEPTH_PARAMS_LENGTH)?;
    Ok(IrCameraParams {
        fx: read_f32(data, 0),
        fy: read_f32(data, 4),
        cx: read_f32(data, 12),
        cy: read_f32(data, 16),
        k1: read_f32(data, 20),
        k2: read_f32(data, 24),
        p1: read_f32(data, 28),
        p2: read_f32(data, 32),
        k3: read_f32(data, 36),
    })
}

/// Table id byte, five scalars, then two rows of ten coefficients.
pub const COLOR_PARAMS_LENGTH: usize = 1 + 4 * (5 + 10 + 10);

/// Colour intrinsics and depth-to-colour mapping polynomial.
pub fn parse_color_camera_params(data: &[u8]) -> Result<ColorCameraParams> {
    require_len(data, COLOR_PARAMS_LENGTH)?;
    let f = |index: usize| read_f32(data, 1 + 4 * index);
    let mx: [f32; 10] = std::array::from_fn(|i| f(5 + i));
    let my: [f32; 10] = std::array::from_fn(|i| f(15 + i));

    Ok(ColorCameraParams {
        table_id: data[0],
        fx: f(0),
        fy: f(0),
        cx: f(1),
        cy: f(2),
        shift_d: f(3),
        shift_m: f(4),
        mx,
        my,
    })
}

/// Space-separated hex bytes, 16 per line.
pub fn hex_dump(data: &[u8]) -> String {
    data.chunks(16)
        .map(|line| {
            line.iter()
                .map(|b| format!("{:02x}", b))
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect::<Vec<_>>()
        .join("\n")
}
