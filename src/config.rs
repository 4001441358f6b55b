use crate::transaction::{PollPolicy, COMMAND_TIMEOUT};
use std::time::Duration;

pub const ENV_RGB_TRANSFER_SIZE: &str = "KINECT2_RGB_TRANSFER_SIZE";
pub const ENV_RGB_TRANSFERS: &str = "KINECT2_RGB_TRANSFERS";
pub const ENV_IR_PACKETS: &str = "KINECT2_IR_PACKETS";
pub const ENV_IR_TRANSFERS: &str = "KINECT2_IR_TRANSFERS";

/// Sizes of the two streaming pools.
///
/// The IR packet size is not configurable: it is the endpoint's maximum
/// isochronous packet size, queried when the device opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub rgb_transfer_size: usize,
    pub rgb_transfers: usize,
    pub ir_packets_per_transfer: usize,
    pub ir_transfers: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::platform_default()
    }
}

impl PoolConfig {
    /// Sizes tuned per OS. Windows uses few large colour transfers to stay
    /// under its per-process handle limit with several devices.
    pub fn platform_default() -> Self {
        if cfg!(target_os = "macos") {
            Self {
                rgb_transfer_size: 0x4000,
                rgb_transfers: 20,
                ir_packets_per_transfer: 128,
                ir_transfers: 8,
            }
        } else if cfg!(target_os = "windows") {
            Self {
                rgb_transfer_size: 1_048_576,
                rgb_transfers: 3,
                ir_packets_per_transfer: 64,
                ir_transfers: 8,
            }
        } else if cfg!(target_os = "linux") {
            Self {
                rgb_transfer_size: 0x4000,
                rgb_transfers: 8,
                ir_packets_per_transfer: 64,
                ir_transfers: 5,
            }
        } else {
            Self::generic()
        }
    }

    pub fn generic() -> Self {
        Self {
            rgb_transfer_size: 0x4000,
            rgb_transfers: 20,
            ir_packets_per_transfer: 8,
            ir_transfers: 60,
        }
    }

    /// Platform defaults overridden by `KINECT2_*` environment variables.
    pub fn from_env() -> Self {
        Self::platform_default().with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup`. Unparseable or zero values are
    /// ignored with a warning.
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let fields = [
            (ENV_RGB_TRANSFER_SIZE, &mut self.rgb_transfer_size),
            (ENV_RGB_TRANSFERS, &mut self.rgb_transfers),
            (ENV_IR_PACKETS, &mut self.ir_packets_per_transfer),
            (ENV_IR_TRANSFERS, &mut self.ir_transfers),
        ];
        for (name, field) in fields {
            if let Some(value) = read_usize(&lookup, name) {
                *field = value;
            }
        }
        self
    }
}

fn read_usize<F>(lookup: &F, name: &str) -> Option<usize>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(name)?;
    match raw.trim().parse::<usize>() {
        Ok(value) if value > 0 => Some(value),
        _ => {
            log::warn!("ignoring {}={:?}: expected a positive integer", name, raw);
            None
        }
    }
}

/// Everything a device session needs besides the USB handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub pools: PoolConfig,
    /// Timeout of each command pipe and control transfer.
    pub command_timeout: Duration,
    /// Status register poll while the sensor warms up.
    pub status_poll: PollPolicy,
    pub open_attempts: u32,
    pub open_retry_delay: Duration,
    /// Port-reset the device before claiming it.
    pub reset_on_open: bool,
    /// Deadline for in-flight transfers to report cancellation.
    /// `None` waits indefinitely.
    pub cancel_timeout: Option<Duration>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            pools: PoolConfig::default(),
            command_timeout: COMMAND_TIMEOUT,
            status_poll: PollPolicy::default(),
            open_attempts: 10,
            open_retry_delay: Duration::from_millis(100),
            reset_on_open: true,
            cancel_timeout: Some(Duration::from_secs(10)),
        }
    }
}

impl DeviceConfig {
    /// Defaults with pool sizes taken from the environment.
    pub fn from_env() -> Self {
        Self {
            pools: PoolConfig::from_env(),
            ..Self::default()
        }
    }
}
