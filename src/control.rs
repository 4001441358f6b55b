//! Standard USB control requests issued while opening and starting a device.

use crate::native;
use crate::protocol::{CONTROL_AND_RGB_INTERFACE, IR_ENDPOINT, IR_INTERFACE};
use crate::Result;
use rusb::{request_type, DeviceHandle, Direction, Recipient, RequestType, UsbContext};
use std::time::Duration;

const REQUEST_SET_FEATURE: u8 = 0x03;
const REQUEST_SET_ISOCH_DELAY: u8 = 0x31;

const FEATURE_FUNCTION_SUSPEND: u16 = 0;
const FEATURE_U1_ENABLE: u16 = 48;
const FEATURE_U2_ENABLE: u16 = 49;

/// Isochronous delay reported to the device, in nanoseconds.
const ISOCH_DELAY_NS: u16 = 40;

const CONFIGURATION: u8 = 1;

/// `wIndex` of the FUNCTION_SUSPEND request on the control interface.
///
/// The high byte carries the suspend options: bit 0 requests suspend,
/// bit 1 enables remote wake. Both are set together.
pub fn function_suspend_index(suspend: bool) -> u16 {
    let options: u16 = if suspend { 0x01 | 0x02 } else { 0 };
    (options << 8) | CONTROL_AND_RGB_INTERFACE as u16
}

/// Control-pipe requests needed around streaming.
#[derive(Debug, Clone)]
pub struct UsbControl {
    timeout: Duration,
}

impl Default for UsbControl {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000))
    }
}

impl UsbControl {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Select configuration 1 unless it is already active.
    pub fn set_configuration<T: UsbContext>(&self, handle: &DeviceHandle<T>) -> Result<()> {
        let current = handle.active_configuration()?;
        if current != CONFIGURATION {
            log::debug!("switching configuration {} -> {}", current, CONFIGURATION);
            native::set_configuration(handle, CONFIGURATION)?;
        }
        Ok(())
    }

    pub fn claim_interfaces<T: UsbContext>(&self, handle: &DeviceHandle<T>) -> Result<()> {
        native::claim_interface(handle, CONTROL_AND_RGB_INTERFACE)?;
        if let Err(e) = native::claim_interface(handle, IR_INTERFACE) {
            let _ = native::release_interface(handle, CONTROL_AND_RGB_INTERFACE);
            return Err(e);
        }
        Ok(())
    }

    pub fn release_interfaces<T: UsbContext>(&self, handle: &DeviceHandle<T>) -> Result<()> {
        let rgb = native::release_interface(handle, CONTROL_AND_RGB_INTERFACE);
        let ir = native::release_interface(handle, IR_INTERFACE);
        rgb?;
        ir?;
        Ok(())
    }

    pub fn set_isochronous_delay<T: UsbContext>(&self, handle: &DeviceHandle<T>) -> Result<()> {
        handle.write_control(
            request_type(Direction::Out, RequestType::Standard, Recipient::Device),
            REQUEST_SET_ISOCH_DELAY,
            ISOCH_DELAY_NS,
            0,
            &[],
            self.timeout,
        )?;
        Ok(())
    }

    /// Allow the U1 and U2 link power states.
    pub fn enable_power_states<T: UsbContext>(&self, handle: &DeviceHandle<T>) -> Result<()> {
        for feature in [FEATURE_U1_ENABLE, FEATURE_U2_ENABLE] {
            self.set_feature(handle, Recipient::Device, feature, 0)?;
        }
        Ok(())
    }

    /// Suspend or resume the video transfer function on interface 0.
    pub fn set_video_transfer_function_state<T: UsbContext>(
        &self,
        handle: &DeviceHandle<T>,
        enabled: bool,
    ) -> Result<()> {
        self.set_feature(
            handle,
            Recipient::Interface,
            FEATURE_FUNCTION_SUSPEND,
            function_suspend_index(!enabled),
        )
    }

    /// Alternate setting 1 of the IR interface carries the isochronous stream.
    pub fn set_ir_interface_state<T: UsbContext>(
        &self,
        handle: &DeviceHandle<T>,
        enabled: bool,
    ) -> Result<()> {
        native::set_alternate_setting(handle, IR_INTERFACE, enabled as u8)
    }

    pub fn ir_max_iso_packet_size<T: UsbContext>(&self, handle: &DeviceHandle<T>) -> Result<usize> {
        native::max_iso_packet_size(&handle.device(), IR_ENDPOINT)
    }

    fn set_feature<T: UsbContext>(
        &self,
        handle: &DeviceHandle<T>,
        recipient: Recipient,
        feature: u16,
        index: u16,
    ) -> Result<()> {
        handle.write_control(
            request_type(Direction::Out, RequestType::Standard, recipient),
            REQUEST_SET_FEATURE,
            feature,
            index,
            &[],
            self.timeout,
        )?;
        Ok(())
    }
}
