//! libusb asynchronous transfers behind the pool's [`NativeTransfers`] seam.

use crate::pool::{CompletionSink, NativeTransfers};
use crate::queue::lock;
use crate::transfer::{Buffer, Completion, PacketStatus, TransferKind, TransferStatus};
use crate::{Kinect2Error, Result};
use rusb::ffi::{self, libusb_iso_packet_descriptor, libusb_transfer};
use rusb::{DeviceHandle, UsbContext};
use std::os::raw::{c_int, c_uint, c_void};
use std::ptr::{self, NonNull};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Timeout applied to every streaming transfer.
pub const STREAM_TRANSFER_TIMEOUT: Duration = Duration::from_millis(1000);

/// Map a negative libusb return code to [`rusb::Error`].
pub(crate) fn from_libusb(err: c_int) -> rusb::Error {
    use rusb::ffi::constants::*;

    match err {
        LIBUSB_ERROR_IO => rusb::Error::Io,
        LIBUSB_ERROR_INVALID_PARAM => rusb::Error::InvalidParam,
        LIBUSB_ERROR_ACCESS => rusb::Error::Access,
        LIBUSB_ERROR_NO_DEVICE => rusb::Error::NoDevice,
        LIBUSB_ERROR_NOT_FOUND => rusb::Error::NotFound,
        LIBUSB_ERROR_BUSY => rusb::Error::Busy,
        LIBUSB_ERROR_TIMEOUT => rusb::Error::Timeout,
        LIBUSB_ERROR_OVERFLOW => rusb::Error::Overflow,
        LIBUSB_ERROR_PIPE => rusb::Error::Pipe,
        LIBUSB_ERROR_INTERRUPTED => rusb::Error::Interrupted,
        LIBUSB_ERROR_NO_MEM => rusb::Error::NoMem,
        LIBUSB_ERROR_NOT_SUPPORTED => rusb::Error::NotSupported,
        _ => rusb::Error::Other,
    }
}

fn transfer_status(status: c_int) -> TransferStatus {
    use rusb::ffi::constants::*;

    match status {
        LIBUSB_TRANSFER_COMPLETED => TransferStatus::Completed,
        LIBUSB_TRANSFER_TIMED_OUT => TransferStatus::TimedOut,
        LIBUSB_TRANSFER_CANCELLED => TransferStatus::Cancelled,
        LIBUSB_TRANSFER_STALL => TransferStatus::Stall,
        LIBUSB_TRANSFER_NO_DEVICE => TransferStatus::NoDevice,
        LIBUSB_TRANSFER_OVERFLOW => TransferStatus::Overflow,
        _ => TransferStatus::Error,
    }
}

fn check(rc: c_int) -> Result<()> {
    if rc < 0 {
        return Err(Kinect2Error::Usb(from_libusb(rc)));
    }
    Ok(())
}

/// Largest isochronous packet the device accepts on `endpoint`.
pub fn max_iso_packet_size<T: UsbContext>(device: &rusb::Device<T>, endpoint: u8) -> Result<usize> {
    let size = unsafe { ffi::libusb_get_max_iso_packet_size(device.as_raw(), endpoint) };
    check(size)?;
    Ok(size as usize)
}

// rusb only exposes the calls below on `&mut DeviceHandle`, but the handle
// is shared with the transfer pools for the whole session.

/// Port-reset a device through a shared handle.
pub fn reset_device<T: UsbContext>(handle: &DeviceHandle<T>) -> Result<()> {
    check(unsafe { ffi::libusb_reset_device(handle.as_raw()) })
}

pub fn set_configuration<T: UsbContext>(handle: &DeviceHandle<T>, config: u8) -> Result<()> {
    check(unsafe { ffi::libusb_set_configuration(handle.as_raw(), config as c_int) })
}

pub fn claim_interface<T: UsbContext>(handle: &DeviceHandle<T>, interface: u8) -> Result<()> {
    check(unsafe { ffi::libusb_claim_interface(handle.as_raw(), interface as c_int) })
}

pub fn release_interface<T: UsbContext>(handle: &DeviceHandle<T>, interface: u8) -> Result<()> {
    check(unsafe { ffi::libusb_release_interface(handle.as_raw(), interface as c_int) })
}

pub fn set_alternate_setting<T: UsbContext>(
    handle: &DeviceHandle<T>,
    interface: u8,
    setting: u8,
) -> Result<()> {
    check(unsafe {
        ffi::libusb_set_interface_alt_setting(
            handle.as_raw(),
            interface as c_int,
            setting as c_int,
        )
    })
}

/// Borrowed view of a finished libusb transfer, valid during the callback.
struct LibusbCompletion {
    transfer: *mut libusb_transfer,
}

impl LibusbCompletion {
    fn descriptor(&self, index: usize) -> Option<libusb_iso_packet_descriptor> {
        unsafe {
            let count = (*self.transfer).num_iso_packets.max(0) as usize;
            if index >= count {
                return None;
            }
            let first = ptr::addr_of!((*self.transfer).iso_packet_desc)
                as *const libusb_iso_packet_descriptor;
            Some(ptr::read(first.add(index)))
        }
    }
}

impl Completion for LibusbCompletion {
    fn status(&self) -> TransferStatus {
        transfer_status(unsafe { (*self.transfer).status })
    }

    fn actual_length(&self) -> usize {
        unsafe { (*self.transfer).actual_length.max(0) as usize }
    }

    fn packet(&self, index: usize) -> PacketStatus {
        match self.descriptor(index) {
            Some(desc) => PacketStatus {
                status: transfer_status(desc.status),
                actual_length: desc.actual_length as usize,
            },
            None => PacketStatus {
                status: TransferStatus::Error,
                actual_length: 0,
            },
        }
    }
}

struct CallbackContext {
    sink: Arc<dyn CompletionSink>,
    slot: usize,
}

extern "system" fn transfer_callback(transfer: *mut libusb_transfer) {
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let context = unsafe { &*((*transfer).user_data as *const CallbackContext) };
        let completion = LibusbCompletion { transfer };
        context.sink.on_transfer_complete(context.slot, &completion);
    }));
    if result.is_err() {
        log::error!("panic in transfer completion callback");
    }
}

struct NativeTransfer {
    transfer: NonNull<libusb_transfer>,
    context: NonNull<CallbackContext>,
}

// The raw transfer is only touched under the owning mutex or by libusb's
// completion, which hands it back through the sink.
unsafe impl Send for NativeTransfer {}

/// Transfers on one endpoint of an open device.
///
/// Native memory is released only by [`deallocate`](NativeTransfers::deallocate),
/// which the pool calls once every transfer is stopped. Dropping without it
/// leaks the transfers rather than freeing memory libusb may still write.
pub struct LibusbTransfers<T: UsbContext> {
    handle: Arc<DeviceHandle<T>>,
    endpoint: u8,
    timeout: Duration,
    transfers: Mutex<Vec<NativeTransfer>>,
}

impl<T: UsbContext> LibusbTransfers<T> {
    pub fn new(handle: Arc<DeviceHandle<T>>, endpoint: u8) -> Self {
        Self {
            handle,
            endpoint,
            timeout: STREAM_TRANSFER_TIMEOUT,
            transfers: Mutex::new(Vec::new()),
        }
    }

    pub fn endpoint(&self) -> u8 {
        self.endpoint
    }
}

impl<T: UsbContext + 'static> NativeTransfers for LibusbTransfers<T> {
    fn allocate(
        &self,
        kind: TransferKind,
        count: usize,
        sink: Arc<dyn CompletionSink>,
    ) -> Result<()> {
        use rusb::ffi::constants::*;

        let mut transfers = lock(&self.transfers);
        if !transfers.is_empty() {
            return Err(Kinect2Error::InvalidState {
                expected: "unallocated",
                actual: "allocated",
            });
        }

        let (transfer_type, iso_packets, packet_size) = match kind {
            TransferKind::Bulk { .. } => (LIBUSB_TRANSFER_TYPE_BULK, 0, 0),
            TransferKind::Isochronous {
                num_packets,
                packet_size,
            } => (LIBUSB_TRANSFER_TYPE_ISOCHRONOUS, num_packets, packet_size),
        };

        for slot in 0..count {
            let raw = unsafe { ffi::libusb_alloc_transfer(iso_packets as c_int) };
            let Some(transfer) = NonNull::new(raw) else {
                drop(transfers);
                self.deallocate();
                return Err(Kinect2Error::Usb(rusb::Error::NoMem));
            };
            let context = Box::new(CallbackContext {
                sink: sink.clone(),
                slot,
            });
            let context = NonNull::from(Box::leak(context));

            unsafe {
                let t = transfer.as_ptr();
                (*t).dev_handle = self.handle.as_raw();
                (*t).endpoint = self.endpoint;
                (*t).transfer_type = transfer_type;
                (*t).timeout = self.timeout.as_millis() as c_uint;
                (*t).callback = transfer_callback;
                (*t).user_data = context.as_ptr() as *mut c_void;
                (*t).num_iso_packets = iso_packets as c_int;
                let first = ptr::addr_of_mut!((*t).iso_packet_desc)
                    as *mut libusb_iso_packet_descriptor;
                for index in 0..iso_packets {
                    (*first.add(index)).length = packet_size as c_uint;
                }
            }
            transfers.push(NativeTransfer { transfer, context });
        }

        log::debug!(
            "endpoint 0x{:02x}: allocated {} native {} transfers",
            self.endpoint,
            count,
            kind.name()
        );
        Ok(())
    }

    fn submit(&self, slot: usize, buffer: &mut Buffer) -> Result<()> {
        let transfers = lock(&self.transfers);
        let native = transfers.get(slot).ok_or(Kinect2Error::NotAllocated)?;
        let rc = unsafe {
            let t = native.transfer.as_ptr();
            (*t).buffer = buffer.data_mut().as_mut_ptr();
            (*t).length = buffer.len() as c_int;
            ffi::libusb_submit_transfer(t)
        };
        if rc < 0 {
            return Err(Kinect2Error::Usb(from_libusb(rc)));
        }
        Ok(())
    }

    fn cancel(&self, slot: usize) -> Result<()> {
        let transfers = lock(&self.transfers);
        let Some(native) = transfers.get(slot) else {
            return Ok(());
        };
        let rc = unsafe { ffi::libusb_cancel_transfer(native.transfer.as_ptr()) };
        match rc {
            0 | ffi::constants::LIBUSB_ERROR_NOT_FOUND => Ok(()),
            rc => Err(Kinect2Error::Usb(from_libusb(rc))),
        }
    }

    fn deallocate(&self) {
        let mut transfers = lock(&self.transfers);
        for native in transfers.drain(..) {
            unsafe {
                ffi::libusb_free_transfer(native.transfer.as_ptr());
                drop(Box::from_raw(native.context.as_ptr()));
            }
        }
    }
}
