/// Intrinsics of the IR / depth camera, read from the device at start.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct IrCameraParams {
    /// Focal length x (pixels).
    pub fx: f32,
    /// Focal length y (pixels).
    pub fy: f32,
    /// Principal point x (pixels).
    pub cx: f32,
    /// Principal point y (pixels).
    pub cy: f32,
    /// Radial distortion coefficients.
    pub k1: f32,
    pub k2: f32,
    pub k3: f32,
    /// Tangential distortion coefficients.
    pub p1: f32,
    pub p2: f32,
}

/// Intrinsics of the colour camera plus the depth-to-colour mapping.
///
/// `mx`/`my` hold the mapping polynomial coefficients in the order
/// x³y⁰, x⁰y³, x²y¹, x¹y², x²y⁰, x⁰y², x¹y¹, x¹y⁰, x⁰y¹, x⁰y⁰.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ColorCameraParams {
    pub table_id: u8,
    pub fx: f32,
    pub fy: f32,
    pub cx: f32,
    pub cy: f32,
    pub shift_d: f32,
    pub shift_m: f32,
    pub mx: [f32; 10],
    pub my: [f32; 10],
}

/// A Kinect v2 found on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// USB serial string descriptor.
    pub serial: String,
    pub bus_number: u8,
    pub address: u8,
    pub product_id: u16,
}

impl DeviceInfo {
    /// Preview units report a different product id.
    pub fn is_preview(&self) -> bool {
        self.product_id == crate::protocol::PRODUCT_ID_PREVIEW
    }
}

bitflags::bitflags! {
    /// Streams to enable when starting a device.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Streams: u8 {
        const COLOR = 1 << 0;
        const DEPTH = 1 << 1;
    }
}

/// Lifecycle of a device session.
///
/// `Created -> Open -> Streaming -> Open -> ... -> Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Created,
    Open,
    Streaming,
    Closed,
}

impl DeviceState {
    pub fn name(&self) -> &'static str {
        match self {
            DeviceState::Created => "created",
            DeviceState::Open => "open",
            DeviceState::Streaming => "streaming",
            DeviceState::Closed => "closed",
        }
    }
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
