use crate::config::DeviceConfig;
use crate::control::UsbControl;
use crate::event_loop::EventLoop;
use crate::native::{self, LibusbTransfers};
use crate::pool::{NativeTransfers, PoolStats, TransferPool};
use crate::protocol::{
    self, Command, IR_ENDPOINT, MIN_IR_ISO_PACKET_SIZE, PRODUCT_ID,
    PRODUCT_ID_PREVIEW, RGB_ENDPOINT, VENDOR_ID,
};
use crate::queue::lock;
use crate::stream::{self, PacketStream};
use crate::transaction::{CommandPipe, CommandSession, CommandTransaction, PollPolicy, StatusPoll};
use crate::transfer::DataCallback;
use crate::types::{ColorCameraParams, DeviceInfo, DeviceState, IrCameraParams, Streams};
use crate::{Kinect2Error, Result};
use crossbeam_channel::Receiver;
use rusb::{Context, DeviceHandle, UsbContext};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

type StreamPool = TransferPool<LibusbTransfers<Context>>;
type OpenRegistry = Arc<Mutex<HashSet<(u8, u8)>>>;

/// Wait after a reset that made the device re-enumerate.
const REENUMERATION_DELAY: Duration = Duration::from_millis(1000);

/// The device disappears this long after a shutdown command.
#[cfg(target_os = "macos")]
const SHUTDOWN_DELAY: Duration = Duration::from_secs(4);

fn is_kinect2(desc: &rusb::DeviceDescriptor) -> bool {
    desc.vendor_id() == VENDOR_ID
        && (desc.product_id() == PRODUCT_ID || desc.product_id() == PRODUCT_ID_PREVIEW)
}

/// Entry point: owns the USB context and the event thread shared by all
/// devices opened through it.
pub struct Driver {
    context: Context,
    event_loop: Arc<EventLoop>,
    open_devices: OpenRegistry,
}

impl Driver {
    pub fn new() -> Result<Driver> {
        let context = Context::new()?;
        let event_loop = Arc::new(EventLoop::new());
        event_loop.start(context.clone())?;
        Ok(Driver {
            context,
            event_loop,
            open_devices: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    /// List connected Kinect v2 devices with their serial numbers.
    ///
    /// Devices that cannot be opened to read the serial are skipped with
    /// an error log.
    pub fn list_devices(&self) -> Result<Vec<DeviceInfo>> {
        let devices = self.context.devices()?;
        log::info!("{} usb devices connected", devices.len());

        let mut found = Vec::new();
        for device in devices.iter() {
            let Ok(desc) = device.device_descriptor() else {
                continue;
            };
            if !is_kinect2(&desc) {
                continue;
            }
            let location = format!("{}@{}", device.bus_number(), device.address());

            let serial = match device
                .open()
                .and_then(|handle| handle.read_serial_number_string_ascii(&desc))
            {
                Ok(serial) => serial,
                Err(e) => {
                    log::error!("failed to read serial number of Kinect v2 {}: {}", location, e);
                    continue;
                }
            };

            log::info!("found valid Kinect v2 {} with serial {}", location, serial);
            found.push(DeviceInfo {
                serial,
                bus_number: device.bus_number(),
                address: device.address(),
                product_id: desc.product_id(),
            });
        }

        log::info!("found {} devices", found.len());
        Ok(found)
    }

    /// Open the first Kinect v2 on the bus.
    pub fn open_first(&self, config: DeviceConfig) -> Result<Device> {
        let info = self
            .list_devices()?
            .into_iter()
            .next()
            .ok_or(Kinect2Error::DeviceNotFound)?;
        self.open(&info, config)
    }

    pub fn open_serial(&self, serial: &str, config: DeviceConfig) -> Result<Device> {
        let info = self
            .list_devices()?
            .into_iter()
            .find(|d| d.serial == serial)
            .ok_or(Kinect2Error::DeviceNotFound)?;
        self.open(&info, config)
    }

    /// Open `info`, optionally resetting it first, and bring it to
    /// [`DeviceState::Open`].
    pub fn open(&self, info: &DeviceInfo, config: DeviceConfig) -> Result<Device> {
        self.open_with_reset(info, config, true)
    }

    fn open_with_reset(
        &self,
        info: &DeviceInfo,
        config: DeviceConfig,
        attempting_reset: bool,
    ) -> Result<Device> {
        let key = (info.bus_number, info.address);
        if lock(&self.open_devices).contains(&key) {
            log::warn!("device {}@{} is already open", info.bus_number, info.address);
            return Err(Kinect2Error::AlreadyOpen(info.serial.clone()));
        }

        let device = self.find_usb_device(info)?;
        let mut handle = self.open_handle(&device, &config)?;

        if attempting_reset && config.reset_on_open {
            match handle.reset() {
                Ok(()) => log::info!("attempt reset complete"),
                Err(rusb::Error::NotFound) => {
                    // The handle is stale once the device re-enumerates.
                    drop(handle);
                    std::thread::sleep(REENUMERATION_DELAY);
                    log::info!("re-enumerating devices after reset");
                    let info = self
                        .list_devices()?
                        .into_iter()
                        .find(|d| d.serial == info.serial)
                        .ok_or(Kinect2Error::DeviceNotFound)?;
                    return self.open_with_reset(&info, config, false);
                }
                Err(e) => {
                    log::error!(
                        "failed to reset Kinect v2 {}@{}: {}",
                        info.bus_number,
                        info.address,
                        e
                    );
                    return Err(e.into());
                }
            }
        }

        lock(&self.open_devices).insert(key);
        let mut device = Device::new(
            Arc::new(handle),
            info.clone(),
            config,
            self.event_loop.clone(),
            self.open_devices.clone(),
        );
        if let Err(e) = device.open() {
            log::error!(
                "failed to open Kinect v2 {}@{}: {}",
                info.bus_number,
                info.address,
                e
            );
            return Err(e);
        }
        Ok(device)
    }

    fn find_usb_device(&self, info: &DeviceInfo) -> Result<rusb::Device<Context>> {
        self.context
            .devices()?
            .iter()
            .find(|d| d.bus_number() == info.bus_number && d.address() == info.address)
            .ok_or(Kinect2Error::DeviceNotFound)
    }

    fn open_handle(
        &self,
        device: &rusb::Device<Context>,
        config: &DeviceConfig,
    ) -> Result<DeviceHandle<Context>> {
        let attempts = config.open_attempts.max(1);
        let mut last_error = rusb::Error::Other;
        for attempt in 1..=attempts {
            match device.open() {
                Ok(handle) => return Ok(handle),
                Err(e) => {
                    log::info!("device unavailable right now, retrying (attempt {}): {}", attempt, e);
                    last_error = e;
                    std::thread::sleep(config.open_retry_delay);
                }
            }
        }
        log::error!(
            "failed to open Kinect v2 {}@{} after {} attempts",
            device.bus_number(),
            device.address(),
            attempts
        );
        Err(last_error.into())
    }
}

/// Control commands for [`Device::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCommand {
    /// Stop streaming, keep the device open.
    Pause,
    /// Start streaming again after a pause.
    Resume,
    /// Stop streaming and close the device.
    Shutdown,
}

/// What [`Device::run`] does with a command in a given state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
    Start,
    Stop,
    Close,
    Ignore,
}

pub fn next_action(state: DeviceState, command: DeviceCommand) -> SessionAction {
    match (state, command) {
        (_, DeviceCommand::Shutdown) => SessionAction::Close,
        (DeviceState::Streaming, DeviceCommand::Pause) => SessionAction::Stop,
        (DeviceState::Open, DeviceCommand::Resume) => SessionAction::Start,
        _ => SessionAction::Ignore,
    }
}

/// An opened Kinect v2 session.
pub struct Device {
    state: DeviceState,
    info: DeviceInfo,
    config: DeviceConfig,
    rgb_pool: Option<StreamPool>,
    ir_pool: Option<StreamPool>,
    handle: Option<Arc<DeviceHandle<Context>>>,
    control: UsbControl,
    commands: CommandSession,
    has_interfaces: bool,
    firmware: String,
    ir_params: IrCameraParams,
    color_params: ColorCameraParams,
    p0_tables: Vec<u8>,
    open_devices: OpenRegistry,
    /// Dropped last: completions must keep firing until the pools are gone.
    _event_loop: Arc<EventLoop>,
}

impl Device {
    fn new(
        handle: Arc<DeviceHandle<Context>>,
        info: DeviceInfo,
        config: DeviceConfig,
        event_loop: Arc<EventLoop>,
        open_devices: OpenRegistry,
    ) -> Device {
        Device {
            state: DeviceState::Created,
            info,
            control: UsbControl::new(config.command_timeout),
            commands: CommandSession::new(CommandTransaction::new(
                protocol::COMMAND_IN_ENDPOINT,
                protocol::COMMAND_OUT_ENDPOINT,
                config.command_timeout,
            )),
            config,
            rgb_pool: None,
            ir_pool: None,
            handle: Some(handle),
            has_interfaces: false,
            firmware: "<unknown>".into(),
            ir_params: IrCameraParams::default(),
            color_params: ColorCameraParams::default(),
            p0_tables: Vec::new(),
            open_devices,
            _event_loop: event_loop,
        }
    }

    fn handle(&self) -> Result<&DeviceHandle<Context>> {
        live_handle(&self.handle)
    }

    fn require_state(&self, expected: DeviceState) -> Result<()> {
        if self.state != expected {
            return Err(Kinect2Error::InvalidState {
                expected: expected.name(),
                actual: self.state.name(),
            });
        }
        Ok(())
    }

    /// Configure USB and allocate the streaming pools.
    fn open(&mut self) -> Result<()> {
        log::info!("opening...");
        self.require_state(DeviceState::Created)?;

        let handle = self.handle()?;
        self.control.set_configuration(handle)?;
        if !self.has_interfaces {
            self.control.claim_interfaces(handle)?;
            self.has_interfaces = true;
        }
        let handle = self.handle()?;
        self.control.set_isochronous_delay(handle)?;
        self.control.set_ir_interface_state(handle, false)?;
        self.control.enable_power_states(handle)?;
        self.control.set_video_transfer_function_state(handle, false)?;

        let max_iso_packet_size = self.control.ir_max_iso_packet_size(handle)?;
        if max_iso_packet_size < MIN_IR_ISO_PACKET_SIZE {
            log::error!(
                "max iso packet size for endpoint 0x{:02x} too small! (expected: 0x{:x} got: 0x{:x})",
                IR_ENDPOINT,
                MIN_IR_ISO_PACKET_SIZE,
                max_iso_packet_size
            );
            return Err(Kinect2Error::IsoPacketSizeTooSmall {
                expected: MIN_IR_ISO_PACKET_SIZE,
                actual: max_iso_packet_size,
            });
        }

        let sizes = self.config.pools;
        log::info!(
            "transfer pool sizes rgb: {}*{} ir: {}*{}*{}",
            sizes.rgb_transfers,
            sizes.rgb_transfer_size,
            sizes.ir_transfers,
            sizes.ir_packets_per_transfer,
            max_iso_packet_size
        );

        let shared_handle = self
            .handle
            .clone()
            .ok_or(Kinect2Error::NotAllocated)?;
        let mut rgb_pool = TransferPool::bulk(
            LibusbTransfers::new(shared_handle.clone(), RGB_ENDPOINT),
            sizes.rgb_transfers,
            sizes.rgb_transfer_size,
        )?;
        let mut ir_pool = TransferPool::isochronous(
            LibusbTransfers::new(shared_handle, IR_ENDPOINT),
            sizes.ir_transfers,
            sizes.ir_packets_per_transfer,
            max_iso_packet_size,
        )?;
        rgb_pool.set_cancel_timeout(self.config.cancel_timeout);
        ir_pool.set_cancel_timeout(self.config.cancel_timeout);
        self.rgb_pool = Some(rgb_pool);
        self.ir_pool = Some(ir_pool);

        self.state = DeviceState::Open;
        log::info!("opened");
        Ok(())
    }

    /// Start colour and depth streaming.
    pub fn start(&mut self) -> Result<()> {
        self.start_streams(Streams::COLOR | Streams::DEPTH)
    }

    /// Read device info and calibration, then start the selected streams.
    pub fn start_streams(&mut self, streams: Streams) -> Result<()> {
        log::info!("starting...");
        self.require_state(DeviceState::Open)?;

        let handle = live_handle(&self.handle)?;
        self.control.set_video_transfer_function_state(handle, true)?;

        let calibration = read_calibration(&mut self.commands, handle)?;
        if calibration.serial != self.info.serial {
            log::warn!(
                "serial number reported by libusb {} differs from serial number {} in device protocol!",
                self.info.serial,
                calibration.serial
            );
        }
        self.firmware = calibration.firmware;
        self.ir_params = calibration.ir_params;
        self.color_params = calibration.color_params;
        self.p0_tables = calibration.p0_tables;

        if let StatusPoll::TimedOut(last) =
            prepare_streaming(&mut self.commands, handle, self.config.status_poll)?
        {
            log::warn!("sensor not ready (status 0x090000: {}), continuing", last);
        }
        self.control.set_ir_interface_state(handle, true)?;
        let status = begin_streaming(&mut self.commands, handle)?;
        log::debug!("status 0x090000: {}", status);

        submit_streams(&mut self.rgb_pool, &mut self.ir_pool, streams, || {
            native::reset_device(handle)
        })?;

        self.state = DeviceState::Streaming;
        log::info!("started");
        Ok(())
    }

    /// Cancel streaming and return the device to [`DeviceState::Open`].
    pub fn stop(&mut self) -> Result<()> {
        log::info!("stopping...");
        if self.state != DeviceState::Streaming {
            log::info!("already stopped, doing nothing");
            return Err(Kinect2Error::InvalidState {
                expected: DeviceState::Streaming.name(),
                actual: self.state.name(),
            });
        }

        let handle = live_handle(&self.handle)?;
        let rgb = cancel_pool(self.rgb_pool.as_mut(), "rgb", || native::reset_device(handle));
        let ir = cancel_pool(self.ir_pool.as_mut(), "depth", || native::reset_device(handle));
        rgb?;
        ir?;

        self.control.set_ir_interface_state(handle, false)?;
        stop_streaming(&mut self.commands, handle)?;
        self.control.set_video_transfer_function_state(handle, false)?;

        self.state = DeviceState::Open;
        log::info!("stopped");
        Ok(())
    }

    /// Stop if streaming, release the interfaces, free the pools, and
    /// close the USB handle. Closing twice is a no-op.
    pub fn close(&mut self) -> Result<()> {
        log::info!("closing...");
        if self.state == DeviceState::Closed {
            log::info!("already closed, doing nothing");
            return Ok(());
        }

        if self.state == DeviceState::Streaming {
            if let Err(e) = self.stop() {
                log::warn!("stop during close failed: {}", e);
            }
        }

        if self.state != DeviceState::Created {
            if let Ok(handle) = live_handle(&self.handle) {
                if let Err(e) = close_commands(&mut self.commands, handle) {
                    log::warn!("close command failed: {}", e);
                }

                #[cfg(target_os = "macos")]
                {
                    // The device drops off the bus on close regardless; shut it down
                    // explicitly and give it time to go.
                    if let Err(e) = self.commands.execute(handle, Command::shutdown) {
                        log::warn!("shutdown command failed: {}", e);
                    }
                    std::thread::sleep(SHUTDOWN_DELAY);
                }
            }
        }

        for pool in [self.rgb_pool.as_ref(), self.ir_pool.as_ref()]
            .into_iter()
            .flatten()
        {
            if let Err(e) = pool.clear_callback() {
                log::warn!("failed to clear callback: {}", e);
            }
        }

        if self.has_interfaces {
            log::info!("releasing usb interfaces...");
            if let Err(e) = self.control.release_interfaces(self.handle()?) {
                log::warn!("failed to release interfaces: {}", e);
            }
            self.has_interfaces = false;
        }

        log::info!("deallocating usb transfer pools...");
        for mut pool in [self.rgb_pool.take(), self.ir_pool.take()]
            .into_iter()
            .flatten()
        {
            if let Err(e) = pool.deallocate() {
                // Leave the native transfers alive; dropping the pool will not
                // free memory libusb may still write into.
                log::error!("failed to deallocate {} pool: {}", pool.kind().name(), e);
            }
        }

        log::info!("closing usb device...");
        self.handle = None;
        lock(&self.open_devices).remove(&(self.info.bus_number, self.info.address));

        self.state = DeviceState::Closed;
        log::info!("closed");
        Ok(())
    }

    /// Start the selected streams, then follow `commands` until a
    /// [`DeviceCommand::Shutdown`] arrives or the sender is dropped.
    pub fn run(&mut self, streams: Streams, commands: &Receiver<DeviceCommand>) -> Result<()> {
        self.start_streams(streams)?;
        loop {
            let command = commands.recv().unwrap_or_else(|_| {
                log::info!("command channel closed, shutting down");
                DeviceCommand::Shutdown
            });
            match next_action(self.state, command) {
                SessionAction::Start => self.start_streams(streams)?,
                SessionAction::Stop => self.stop()?,
                SessionAction::Close => return self.close(),
                SessionAction::Ignore => {
                    log::debug!("ignoring {:?} while {}", command, self.state);
                }
            }
        }
    }

    /// Register the sink for colour (JPEG) transfer data.
    pub fn set_color_callback<C: DataCallback + 'static>(&self, callback: C) -> Result<()> {
        pool_ref(&self.rgb_pool)?.set_callback(callback)
    }

    /// Register the sink for IR/depth packet data.
    pub fn set_ir_callback<C: DataCallback + 'static>(&self, callback: C) -> Result<()> {
        pool_ref(&self.ir_pool)?.set_callback(callback)
    }

    /// Route colour data into a bounded channel.
    pub fn color_stream(&self, capacity: usize) -> Result<PacketStream> {
        let (sink, stream) = stream::channel(capacity);
        self.set_color_callback(sink)?;
        Ok(stream)
    }

    /// Route IR/depth data into a bounded channel.
    pub fn ir_stream(&self, capacity: usize) -> Result<PacketStream> {
        let (sink, stream) = stream::channel(capacity);
        self.set_ir_callback(sink)?;
        Ok(stream)
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn serial_number(&self) -> &str {
        &self.info.serial
    }

    pub fn firmware_version(&self) -> &str {
        &self.firmware
    }

    pub fn ir_camera_params(&self) -> IrCameraParams {
        self.ir_params
    }

    pub fn set_ir_camera_params(&mut self, params: IrCameraParams) {
        self.ir_params = params;
    }

    pub fn color_camera_params(&self) -> ColorCameraParams {
        self.color_params
    }

    pub fn set_color_camera_params(&mut self, params: ColorCameraParams) {
        self.color_params = params;
    }

    /// Raw P0 phase tables for the depth decoder.
    pub fn p0_tables(&self) -> &[u8] {
        &self.p0_tables
    }

    pub fn color_pool_stats(&self) -> Option<PoolStats> {
        self.rgb_pool.as_ref().map(TransferPool::stats)
    }

    pub fn ir_pool_stats(&self) -> Option<PoolStats> {
        self.ir_pool.as_ref().map(TransferPool::stats)
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::error!("close on drop failed: {}", e);
        }
    }
}

fn live_handle(handle: &Option<Arc<DeviceHandle<Context>>>) -> Result<&DeviceHandle<Context>> {
    handle.as_deref().ok_or(Kinect2Error::InvalidState {
        expected: "open",
        actual: "closed",
    })
}

fn pool_ref(pool: &Option<StreamPool>) -> Result<&StreamPool> {
    pool.as_ref().ok_or(Kinect2Error::NotAllocated)
}

fn submit_pool<N: NativeTransfers>(pool: &mut Option<TransferPool<N>>) -> Result<()> {
    let pool = pool.as_mut().ok_or(Kinect2Error::NotAllocated)?;
    pool.enable_submission();
    pool.submit()
}

/// Submit the pools selected by `streams`. On failure, any pool already
/// submitted is cancelled again so nothing streams behind an `Open` device.
fn submit_streams<N, R>(
    rgb: &mut Option<TransferPool<N>>,
    ir: &mut Option<TransferPool<N>>,
    streams: Streams,
    reset: R,
) -> Result<()>
where
    N: NativeTransfers,
    R: Fn() -> Result<()>,
{
    let mut result = Ok(());
    if streams.contains(Streams::COLOR) {
        log::info!("submitting rgb transfers...");
        result = submit_pool(rgb);
    }
    if result.is_ok() && streams.contains(Streams::DEPTH) {
        log::info!("submitting depth transfers...");
        result = submit_pool(ir);
    }

    if let Err(e) = result {
        log::error!("failed to submit transfers: {}", e);
        for (pool, name) in [(rgb.as_mut(), "rgb"), (ir.as_mut(), "depth")] {
            if let Err(cancel) = cancel_pool(pool, name, &reset) {
                log::warn!("failed to cancel {} transfers: {}", name, cancel);
            }
        }
        return Err(e);
    }
    Ok(())
}

/// Cancel a pool that was streaming. A pool whose transfers never report
/// cancellation gets one more chance after `reset`.
fn cancel_pool<N, R>(pool: Option<&mut TransferPool<N>>, name: &str, reset: R) -> Result<()>
where
    N: NativeTransfers,
    R: FnOnce() -> Result<()>,
{
    let Some(pool) = pool else {
        return Ok(());
    };
    if !pool.is_enabled() && !pool.is_streaming() {
        return Ok(());
    }

    log::info!("canceling {} transfers...", name);
    pool.disable_submission();
    match pool.cancel() {
        Err(Kinect2Error::CancelTimeout { pending }) => {
            log::warn!(
                "{} {} transfer(s) stuck after cancel; resetting device",
                pending,
                name
            );
            if let Err(e) = reset() {
                log::warn!("reset failed: {}", e);
            }
            pool.cancel()
        }
        other => other,
    }
}

/// Identity and calibration read when streaming starts.
#[derive(Debug, Clone, Default)]
struct Calibration {
    firmware: String,
    serial: String,
    ir_params: IrCameraParams,
    color_params: ColorCameraParams,
    p0_tables: Vec<u8>,
}

fn read_calibration<P: CommandPipe + ?Sized>(
    commands: &mut CommandSession,
    pipe: &P,
) -> Result<Calibration> {
    let firmware = commands.execute(pipe, Command::read_firmware_versions)?;
    let firmware = protocol::firmware_version_string(&firmware);

    // Hardware info only selects an IR normalization table.
    let hardware = commands.execute(pipe, Command::read_hardware_info)?;
    log::trace!("hardware info:\n{}", protocol::hex_dump(&hardware));

    let serial = commands.execute(pipe, Command::read_serial_number)?;
    let serial = protocol::parse_serial_number(&serial);

    let depth = commands.execute(pipe, Command::read_depth_camera_params)?;
    let ir_params = protocol::parse_ir_camera_params(&depth)?;

    let p0_tables = commands.execute(pipe, Command::read_p0_tables)?;

    let color = commands.execute(pipe, Command::read_color_camera_params)?;
    let color_params = protocol::parse_color_camera_params(&color)?;

    Ok(Calibration {
        firmware,
        serial,
        ir_params,
        color_params,
        p0_tables,
    })
}

/// Mode toggle, wait for the sensor, then initialise the streams.
fn prepare_streaming<P: CommandPipe + ?Sized>(
    commands: &mut CommandSession,
    pipe: &P,
    policy: PollPolicy,
) -> Result<StatusPoll> {
    commands.execute(pipe, Command::set_mode_0x00640064)?;
    commands.execute(pipe, |seq| Command::set_mode(seq, false))?;
    let poll = commands.poll_status(pipe, policy)?;
    commands.execute(pipe, Command::init_streams)?;
    Ok(poll)
}

/// Runs once the IR interface is enabled. Returns the status word.
fn begin_streaming<P: CommandPipe + ?Sized>(
    commands: &mut CommandSession,
    pipe: &P,
) -> Result<u32> {
    let status = commands.execute(pipe, Command::read_status)?;
    let status = protocol::parse_status(&status)?;
    commands.execute(pipe, |seq| Command::set_streaming(seq, true))?;
    Ok(status)
}

fn stop_streaming<P: CommandPipe + ?Sized>(commands: &mut CommandSession, pipe: &P) -> Result<()> {
    commands.execute(pipe, Command::set_mode_0x00640064)?;
    commands.execute(pipe, |seq| Command::set_mode(seq, false))?;
    commands.execute(pipe, Command::stop)?;
    commands.execute(pipe, |seq| Command::set_streaming(seq, false))?;
    for _ in 0..2 {
        commands.execute(pipe, |seq| Command::set_mode(seq, true))?;
        commands.execute(pipe, |seq| Command::set_mode(seq, false))?;
    }
    Ok(())
}

/// Both close commands are sent even if the first fails.
fn close_commands<P: CommandPipe + ?Sized>(commands: &mut CommandSession, pipe: &P) -> Result<()> {
    let first = commands.execute(pipe, Command::set_mode_0x00640064);
    let second = commands.execute(pipe, |seq| Command::set_mode(seq, false));
    first?;
    second?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::tests::SyntheticTransfers;
    use crate::protocol::{DataPage, Opcode, RESPONSE_COMPLETE_MAGIC};
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Sent {
        opcode: u32,
        sequence: u32,
        params: Vec<u32>,
    }

    /// Answers every command the way the sensor does: payload (if one was
    /// asked for), then a response-complete echoing the sequence number.
    struct SimulatedSensor {
        serial: String,
        status: u32,
        sent: RefCell<Vec<Sent>>,
        reads: RefCell<VecDeque<Vec<u8>>>,
    }

    impl SimulatedSensor {
        fn new(serial: &str, status: u32) -> Self {
            Self {
                serial: serial.into(),
                status,
                sent: RefCell::new(Vec::new()),
                reads: RefCell::new(VecDeque::new()),
            }
        }

        fn payload(&self, opcode: u32, params: &[u32]) -> Vec<u8> {
            let floats = |values: &[f32]| -> Vec<u8> {
                values.iter().flat_map(|v| v.to_le_bytes()).collect()
            };
            match opcode {
                op if op == Opcode::ReadFirmwareVersions as u32 => [3u16, 2, 16, 7, 0, 0, 0, 0]
                    .iter()
                    .flat_map(|v| v.to_le_bytes())
                    .collect(),
                op if op == Opcode::ReadHardwareInfo as u32 => vec![0x11; 0x5C],
                op if op == Opcode::ReadStatus as u32 => self.status.to_le_bytes().to_vec(),
                op if op == Opcode::ReadDataPage as u32 => match params.first().copied() {
                    Some(page) if page == DataPage::SerialNumber as u32 => {
                        let mut data: Vec<u8> = self
                            .serial
                            .encode_utf16()
                            .flat_map(|u| u.to_le_bytes())
                            .collect();
                        data.extend_from_slice(&[0, 0]);
                        data
                    }
                    Some(page) if page == DataPage::DepthCameraParams as u32 => {
                        floats(&[365.0, 365.0, 0.0, 256.0, 212.0, 0.1, -0.2, 0.0, 0.0, 0.05])
                    }
                    Some(page) if page == DataPage::ColorCameraParams as u32 => {
                        let mut data = vec![2u8];
                        data.extend(floats(&[1081.0; 25]));
                        data
                    }
                    _ => vec![0xAB; 64],
                },
                _ => Vec::new(),
            }
        }

        fn opcodes(&self) -> Vec<u32> {
            self.sent.borrow().iter().map(|s| s.opcode).collect()
        }

        fn sequences(&self) -> Vec<u32> {
            self.sent.borrow().iter().map(|s| s.sequence).collect()
        }
    }

    impl CommandPipe for SimulatedSensor {
        fn write_bulk(&self, _endpoint: u8, data: &[u8], _timeout: Duration) -> rusb::Result<usize> {
            let word = |i: usize| u32::from_le_bytes(data[4 * i..4 * i + 4].try_into().unwrap());
            let (sequence, max_response_length, opcode) = (word(1), word(2), word(3));
            let params: Vec<u32> = (5..data.len() / 4).map(word).collect();

            let mut reads = self.reads.borrow_mut();
            if max_response_length > 0 {
                reads.push_back(self.payload(opcode, &params));
            }
            reads.push_back(
                [RESPONSE_COMPLETE_MAGIC, sequence, 0, 0]
                    .iter()
                    .flat_map(|w| w.to_le_bytes())
                    .collect(),
            );
            self.sent.borrow_mut().push(Sent {
                opcode,
                sequence,
                params,
            });
            Ok(data.len())
        }

        fn read_bulk(&self, _endpoint: u8, buf: &mut [u8], _timeout: Duration) -> rusb::Result<usize> {
            let next = self.reads.borrow_mut().pop_front().ok_or(rusb::Error::Timeout)?;
            let len = next.len().min(buf.len());
            buf[..len].copy_from_slice(&next[..len]);
            Ok(len)
        }
    }

    fn session() -> CommandSession {
        CommandSession::new(CommandTransaction::default())
    }

    #[test]
    fn test_start_stop_close_command_order() {
        let sensor = SimulatedSensor::new("012345678912", 1);
        let mut commands = session();

        let calibration = read_calibration(&mut commands, &sensor).unwrap();
        assert_eq!(calibration.firmware, "2.3.16.7");
        assert_eq!(calibration.serial, "012345678912");
        assert_eq!(calibration.ir_params.cx, 256.0);
        assert_eq!(calibration.color_params.table_id, 2);
        assert_eq!(calibration.p0_tables, vec![0xAB; 64]);

        let poll = prepare_streaming(&mut commands, &sensor, PollPolicy::default()).unwrap();
        assert_eq!(poll, StatusPoll::Ready(1));
        assert_eq!(begin_streaming(&mut commands, &sensor).unwrap(), 1);
        stop_streaming(&mut commands, &sensor).unwrap();
        close_commands(&mut commands, &sensor).unwrap();

        let op = |o: Opcode| o as u32;
        let expected = vec![
            op(Opcode::ReadFirmwareVersions),
            op(Opcode::ReadHardwareInfo),
            op(Opcode::ReadDataPage),
            op(Opcode::ReadDataPage),
            op(Opcode::ReadDataPage),
            op(Opcode::ReadDataPage),
            op(Opcode::SetMode),
            op(Opcode::SetMode),
            op(Opcode::ReadStatus),
            op(Opcode::InitStreams),
            op(Opcode::ReadStatus),
            op(Opcode::SetStreaming),
            // stop
            op(Opcode::SetMode),
            op(Opcode::SetMode),
            op(Opcode::Stop),
            op(Opcode::SetStreaming),
            op(Opcode::SetMode),
            op(Opcode::SetMode),
            op(Opcode::SetMode),
            op(Opcode::SetMode),
            // close
            op(Opcode::SetMode),
            op(Opcode::SetMode),
        ];
        assert_eq!(sensor.opcodes(), expected);
        assert_eq!(sensor.sequences(), (0..expected.len() as u32).collect::<Vec<_>>());
        assert_eq!(commands.next_sequence(), expected.len() as u32);

        let sent = sensor.sent.borrow();
        let pages: Vec<u32> = sent[2..6].iter().map(|s| s.params[0]).collect();
        assert_eq!(
            pages,
            vec![
                DataPage::SerialNumber as u32,
                DataPage::DepthCameraParams as u32,
                DataPage::P0Tables as u32,
                DataPage::ColorCameraParams as u32,
            ]
        );
        assert_eq!(sent[6].params, vec![1, 0x0064_0064, 0, 0]);
        assert_eq!(sent[7].params, vec![0, 0, 0, 0]);
        assert_eq!(sent[11].params, vec![1]);
        assert_eq!(sent[15].params, vec![0]);
        assert_eq!(sent[16].params, vec![1, 0, 0, 0]);
    }

    #[test]
    fn test_start_continues_after_status_poll_timeout() {
        let sensor = SimulatedSensor::new("012345678912", 0);
        let mut commands = session();
        let policy = PollPolicy {
            attempts: 3,
            interval: Duration::from_millis(1),
        };

        let poll = prepare_streaming(&mut commands, &sensor, policy).unwrap();
        assert_eq!(poll, StatusPoll::TimedOut(0));

        let op = |o: Opcode| o as u32;
        assert_eq!(
            sensor.opcodes(),
            vec![
                op(Opcode::SetMode),
                op(Opcode::SetMode),
                op(Opcode::ReadStatus),
                op(Opcode::ReadStatus),
                op(Opcode::ReadStatus),
                op(Opcode::InitStreams),
            ]
        );
        assert_eq!(sensor.sequences(), (0..6).collect::<Vec<_>>());
    }

    #[test]
    fn test_protocol_serial_is_reported_for_cross_check() {
        let sensor = SimulatedSensor::new("999999999999", 1);
        let calibration = read_calibration(&mut session(), &sensor).unwrap();
        assert_eq!(calibration.serial, "999999999999");
        assert_ne!(calibration.serial, "012345678912");
    }

    #[test]
    fn test_failed_depth_submit_cancels_colour_pool() {
        let mut rgb = Some(TransferPool::bulk(SyntheticTransfers::new(), 2, 64).unwrap());
        let mut ir: Option<TransferPool<SyntheticTransfers>> = None;
        let resets = AtomicUsize::new(0);

        let result = submit_streams(&mut rgb, &mut ir, Streams::COLOR | Streams::DEPTH, || {
            resets.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert!(matches!(result, Err(Kinect2Error::NotAllocated)));

        let rgb = rgb.as_ref().unwrap();
        assert!(!rgb.is_streaming());
        assert!(!rgb.is_enabled());
        assert!(rgb.all_stopped());
        assert_eq!(resets.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_submit_streams_selects_pools() {
        let mut rgb = Some(TransferPool::bulk(SyntheticTransfers::new(), 1, 64).unwrap());
        let mut ir = Some(TransferPool::bulk(SyntheticTransfers::new(), 1, 64).unwrap());
        submit_streams(&mut rgb, &mut ir, Streams::DEPTH, || Ok(())).unwrap();
        assert!(!rgb.as_ref().unwrap().is_streaming());
        assert!(ir.as_ref().unwrap().is_streaming());

        cancel_pool(ir.as_mut(), "depth", || Ok(())).unwrap();
        assert!(!ir.as_ref().unwrap().is_streaming());
    }

    #[test]
    fn test_stuck_cancel_resets_once() {
        let mut pool = TransferPool::bulk(SyntheticTransfers::deaf_to_cancel(), 1, 64).unwrap();
        pool.set_cancel_timeout(Some(Duration::from_millis(150)));
        pool.enable_submission();
        pool.submit().unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while pool.stats().submitted < 1 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }

        let resets = AtomicUsize::new(0);
        let result = cancel_pool(Some(&mut pool), "rgb", || {
            resets.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert!(matches!(result, Err(Kinect2Error::CancelTimeout { pending: 1 })));
        assert_eq!(resets.load(Ordering::SeqCst), 1);
        // Keep the cancel on drop short.
        pool.set_cancel_timeout(Some(Duration::from_millis(1)));
    }

    #[test]
    fn test_pause_resume_transitions() {
        assert_eq!(
            next_action(DeviceState::Streaming, DeviceCommand::Pause),
            SessionAction::Stop
        );
        assert_eq!(
            next_action(DeviceState::Open, DeviceCommand::Resume),
            SessionAction::Start
        );
        assert_eq!(
            next_action(DeviceState::Open, DeviceCommand::Pause),
            SessionAction::Ignore
        );
        assert_eq!(
            next_action(DeviceState::Streaming, DeviceCommand::Resume),
            SessionAction::Ignore
        );
    }

    #[test]
    fn test_shutdown_always_closes() {
        for state in [
            DeviceState::Created,
            DeviceState::Open,
            DeviceState::Streaming,
            DeviceState::Closed,
        ] {
            assert_eq!(next_action(state, DeviceCommand::Shutdown), SessionAction::Close);
        }
    }

    #[test]
    fn test_product_match() {
        assert_ne!(PRODUCT_ID, PRODUCT_ID_PREVIEW);
        let info = DeviceInfo {
            serial: "000000000000".into(),
            bus_number: 1,
            address: 2,
            product_id: PRODUCT_ID_PREVIEW,
        };
        assert!(info.is_preview());
    }
}
