//! # kinect2 - user-space USB driver for the Kinect v2 depth camera
//!
//! Built on libusb via `rusb`. Provides:
//! - Device discovery, open with reset/retry, and the command protocol
//!   that reads firmware, serial number, and calibration data
//! - Transfer pools that keep bulk (colour) and isochronous (IR/depth)
//!   transfers continuously in flight
//! - Packet delivery through callbacks or bounded channels
//!
//! ## Quick Start
//! ```no_run
//! use kinect2::{DeviceConfig, Driver};
//! use std::time::Duration;
//!
//! let driver = Driver::new().unwrap();
//! let mut device = driver.open_first(DeviceConfig::from_env()).unwrap();
//! let ir = device.ir_stream(256).unwrap();
//! device.start().unwrap();
//! println!("firmware: {}", device.firmware_version());
//!
//! for _ in 0..100 {
//!     let packet = ir.recv_timeout(Duration::from_secs(1)).unwrap();
//!     println!("{} bytes", packet.data.len());
//! }
//! device.close().unwrap();
//! ```

pub mod config;
pub mod control;
pub mod device;
pub mod error;
pub mod event_loop;
pub mod native;
pub mod pool;
pub mod protocol;
pub mod queue;
pub mod stream;
pub mod transaction;
pub mod transfer;
pub mod types;

pub use config::{DeviceConfig, PoolConfig};
pub use device::{Device, DeviceCommand, Driver};
pub use error::Kinect2Error;
pub use event_loop::EventLoop;
pub use pool::{PoolStats, TransferPool, TransferState};
pub use queue::SyncQueue;
pub use stream::{Packet, PacketStream};
pub use transaction::{CommandPipe, CommandSession, CommandTransaction, PollPolicy, StatusPoll};
pub use transfer::{Buffer, DataCallback, TransferKind};
pub use types::*;

/// Result type alias for kinect2 operations.
pub type Result<T> = std::result::Result<T, Kinect2Error>;
