//! Perpetually-submitted USB transfer pools.
//!
//! A pool owns a fixed set of transfer slots and a larger set of buffers
//! that rotate through three queues:
//!
//! ```text
//! to-submit -> (native, in flight) -> to-process -> available -> to-submit
//! ```
//!
//! The submit thread binds an available buffer to each queued transfer and
//! hands it to the native layer. The native completion (fired on the USB
//! event thread) detaches the buffer, queues it for processing, and queues
//! the transfer for resubmission. The process thread forwards completed
//! segments to the registered [`DataCallback`] and recycles the buffer.

use crate::queue::{lock, SyncQueue};
use crate::transfer::{Buffer, Completion, DataCallback, TransferKind, TransferStatus};
use crate::{Kinect2Error, Result};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Spare buffers allocated per transfer.
pub const BUFFERS_PER_TRANSFER: usize = 10;

/// How long a worker blocks on its queue before rechecking the run flag.
const WORKER_POLL: Duration = Duration::from_millis(100);

/// Sleep between checks while waiting for cancellations to land.
const CANCEL_POLL: Duration = Duration::from_millis(100);

/// Native side of a pool: allocates, submits, and cancels the real transfers.
///
/// Slot indices are stable for the pool's lifetime. Completions must be
/// reported to the sink passed to [`allocate`](Self::allocate) exactly once
/// per successful submission.
pub trait NativeTransfers: Send + Sync + 'static {
    fn allocate(
        &self,
        kind: TransferKind,
        count: usize,
        sink: Arc<dyn CompletionSink>,
    ) -> Result<()>;

    /// Submit slot `slot` reading into `buffer`. The buffer memory stays
    /// bound to the slot until its completion is reported.
    fn submit(&self, slot: usize, buffer: &mut Buffer) -> Result<()>;

    /// Request cancellation. Succeeds if the transfer is not in flight.
    fn cancel(&self, slot: usize) -> Result<()>;

    /// Free every native transfer. Only called once all slots are stopped.
    fn deallocate(&self);
}

/// Receiver of native completions.
pub trait CompletionSink: Send + Sync {
    fn on_transfer_complete(&self, slot: usize, completion: &dyn Completion);
}

/// Where a transfer currently is in the submit/complete cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// Not submitted and not queued; cannot complete.
    Stopped,
    /// Waiting in the to-submit queue.
    Queued,
    /// Handed to the native layer.
    Submitted,
}

impl TransferState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => TransferState::Queued,
            2 => TransferState::Submitted,
            _ => TransferState::Stopped,
        }
    }
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub transfers: usize,
    pub submitted: usize,
    pub queued: usize,
    pub stopped: usize,
    pub buffers_allocated: usize,
    pub buffers_available: usize,
    pub buffers_processing: usize,
    pub buffers_in_flight: usize,
    pub submit_failures: usize,
    pub threads_running: bool,
}

type SharedCallback = Arc<Mutex<Option<Box<dyn DataCallback>>>>;

struct TransferSlot {
    state: AtomicU8,
    buffer: Mutex<Option<Buffer>>,
}

impl TransferSlot {
    fn state(&self) -> TransferState {
        TransferState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: TransferState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

struct PoolShared {
    name: &'static str,
    kind: TransferKind,
    slots: Box<[TransferSlot]>,
    to_submit: SyncQueue<usize>,
    to_process: SyncQueue<Buffer>,
    available: SyncQueue<Buffer>,
    submission_enabled: AtomicBool,
    threads_running: AtomicBool,
    buffers_allocated: AtomicUsize,
    submit_failures: AtomicUsize,
    callback: SharedCallback,
}

impl PoolShared {
    fn allocate_buffer(&self) -> Buffer {
        let id = self.buffers_allocated.fetch_add(1, Ordering::AcqRel);
        self.kind.allocate_buffer(id)
    }

    fn pending_transfers(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.state() != TransferState::Stopped)
            .count()
    }
}

impl CompletionSink for PoolShared {
    fn on_transfer_complete(&self, slot: usize, completion: &dyn Completion) {
        let Some(transfer) = self.slots.get(slot) else {
            log::error!("{}: completion for unknown transfer {}", self.name, slot);
            return;
        };

        let Some(mut buffer) = lock(&transfer.buffer).take() else {
            log::warn!("{}: completion for unbound transfer {}", self.name, slot);
            transfer.set_state(TransferState::Stopped);
            return;
        };

        if completion.status() == TransferStatus::Cancelled {
            transfer.set_state(TransferState::Stopped);
            self.available.push(buffer);
            log::debug!("{}: transfer {} cancelled", self.name, slot);
            return;
        }

        self.kind.decode(completion, &mut buffer);
        self.to_process.push(buffer);

        if self.submission_enabled.load(Ordering::Acquire) {
            transfer.set_state(TransferState::Queued);
            self.to_submit.push(slot);
        } else {
            transfer.set_state(TransferState::Stopped);
        }
    }
}

/// A pool of `N` transfers kept continuously in flight while enabled.
pub struct TransferPool<N: NativeTransfers> {
    native: Arc<N>,
    shared: Arc<PoolShared>,
    cancel_timeout: Option<Duration>,
    deallocated: bool,
    submit_thread: Option<JoinHandle<()>>,
    process_thread: Option<JoinHandle<()>>,
}

impl<N: NativeTransfers> TransferPool<N> {
    /// Allocate a bulk pool of `num_transfers` transfers of `transfer_size` bytes.
    pub fn bulk(native: N, num_transfers: usize, transfer_size: usize) -> Result<Self> {
        Self::allocate(native, TransferKind::Bulk { transfer_size }, num_transfers)
    }

    /// Allocate an isochronous pool of `num_transfers` transfers, each
    /// `num_packets` packets of `packet_size` bytes.
    pub fn isochronous(
        native: N,
        num_transfers: usize,
        num_packets: usize,
        packet_size: usize,
    ) -> Result<Self> {
        Self::allocate(
            native,
            TransferKind::Isochronous {
                num_packets,
                packet_size,
            },
            num_transfers,
        )
    }

    /// Allocate `num_transfers` native transfers of shape `kind` plus
    /// [`BUFFERS_PER_TRANSFER`] spare buffers per transfer.
    pub fn allocate(native: N, kind: TransferKind, num_transfers: usize) -> Result<Self> {
        kind.validate()?;
        if num_transfers == 0 {
            return Err(Kinect2Error::InvalidArgument(
                "transfer pool needs at least one transfer".into(),
            ));
        }

        let slots = (0..num_transfers)
            .map(|_| TransferSlot {
                state: AtomicU8::new(TransferState::Stopped as u8),
                buffer: Mutex::new(None),
            })
            .collect();

        let buffer_count = BUFFERS_PER_TRANSFER * num_transfers;
        let shared = Arc::new(PoolShared {
            name: kind.name(),
            kind,
            slots,
            to_submit: SyncQueue::with_capacity(num_transfers),
            to_process: SyncQueue::with_capacity(buffer_count),
            available: SyncQueue::with_capacity(buffer_count),
            submission_enabled: AtomicBool::new(false),
            threads_running: AtomicBool::new(false),
            buffers_allocated: AtomicUsize::new(0),
            submit_failures: AtomicUsize::new(0),
            callback: Arc::new(Mutex::new(None)),
        });

        for _ in 0..buffer_count {
            let buffer = shared.allocate_buffer();
            shared.available.push(buffer);
        }

        native.allocate(kind, num_transfers, shared.clone())?;

        log::debug!(
            "{}: allocated {} transfers of {} bytes, {} buffers",
            shared.name,
            num_transfers,
            kind.buffer_len(),
            buffer_count
        );

        Ok(Self {
            native: Arc::new(native),
            shared,
            cancel_timeout: None,
            deallocated: false,
            submit_thread: None,
            process_thread: None,
        })
    }

    pub fn kind(&self) -> TransferKind {
        self.shared.kind
    }

    /// Bound the wait in [`cancel`](Self::cancel). `None` waits forever.
    pub fn set_cancel_timeout(&mut self, timeout: Option<Duration>) {
        self.cancel_timeout = timeout;
    }

    pub fn enable_submission(&self) {
        self.shared.submission_enabled.store(true, Ordering::Release);
    }

    pub fn disable_submission(&self) {
        self.shared.submission_enabled.store(false, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.submission_enabled.load(Ordering::Acquire)
    }

    pub fn is_streaming(&self) -> bool {
        self.shared.threads_running.load(Ordering::Acquire)
    }

    /// Register the segment sink. Only allowed while not streaming.
    pub fn set_callback<C: DataCallback + 'static>(&self, callback: C) -> Result<()> {
        self.replace_callback(Some(Box::new(callback)))
    }

    pub fn clear_callback(&self) -> Result<()> {
        self.replace_callback(None)
    }

    fn replace_callback(&self, callback: Option<Box<dyn DataCallback>>) -> Result<()> {
        if self.is_streaming() {
            return Err(Kinect2Error::InvalidState {
                expected: "not streaming",
                actual: "streaming",
            });
        }
        *lock(&self.shared.callback) = callback;
        Ok(())
    }

    /// Queue every stopped transfer for submission and start the workers.
    ///
    /// Native submission happens asynchronously on the submit thread.
    pub fn submit(&mut self) -> Result<()> {
        if self.deallocated {
            return Err(Kinect2Error::NotAllocated);
        }
        if !self.is_enabled() {
            log::warn!("{}: transfer submission disabled", self.shared.name);
            return Err(Kinect2Error::SubmissionDisabled);
        }

        self.shared.submit_failures.store(0, Ordering::Release);
        self.start_threads()?;

        for (index, slot) in self.shared.slots.iter().enumerate() {
            if slot.state() == TransferState::Stopped {
                slot.set_state(TransferState::Queued);
                self.shared.to_submit.push(index);
            }
        }
        Ok(())
    }

    fn start_threads(&mut self) -> Result<()> {
        if self.shared.threads_running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let name = self.shared.name;
        let shared = self.shared.clone();
        let native = self.native.clone();
        let submit = std::thread::Builder::new()
            .name(format!("kinect2-{}-submit", name))
            .spawn(move || submit_loop(shared, native));

        let shared = self.shared.clone();
        let process = std::thread::Builder::new()
            .name(format!("kinect2-{}-process", name))
            .spawn(move || process_loop(shared));

        match (submit, process) {
            (Ok(submit), Ok(process)) => {
                self.submit_thread = Some(submit);
                self.process_thread = Some(process);
                Ok(())
            }
            (submit, process) => {
                self.shared.threads_running.store(false, Ordering::Release);
                let mut message = String::new();
                for result in [submit, process] {
                    match result {
                        Ok(thread) => {
                            let _ = thread.join();
                        }
                        Err(e) => message = e.to_string(),
                    }
                }
                Err(Kinect2Error::Thread(message))
            }
        }
    }

    /// Stop streaming: cancel every in-flight transfer, wait until all of
    /// them report stopped, and join both workers.
    ///
    /// Idempotent. Buffers that were waiting for processing are returned
    /// to the available queue unprocessed.
    pub fn cancel(&mut self) -> Result<()> {
        let shared = self.shared.clone();
        shared.submission_enabled.store(false, Ordering::Release);
        shared.threads_running.store(false, Ordering::Release);

        self.cancel_submitted(true);

        let started = Instant::now();
        let outcome = loop {
            // Transfers parked in to-submit never reach the native layer again.
            while let Some(slot) = shared.to_submit.try_pop() {
                shared.slots[slot].set_state(TransferState::Stopped);
            }

            let pending = shared.pending_transfers();
            if pending == 0 {
                break Ok(());
            }
            if let Some(limit) = self.cancel_timeout {
                if started.elapsed() >= limit {
                    log::error!(
                        "{}: {} transfer(s) did not report cancellation within {:?}",
                        shared.name,
                        pending,
                        limit
                    );
                    break Err(Kinect2Error::CancelTimeout { pending });
                }
            }

            log::info!("{}: waiting for {} transfer cancellation(s)", shared.name, pending);
            std::thread::sleep(CANCEL_POLL);
            // A transfer may have been submitted after the first pass.
            self.cancel_submitted(false);
        };

        self.join_threads();

        for buffer in shared.to_process.drain() {
            shared.available.push(buffer);
        }

        if outcome.is_ok() {
            log::info!("{}: transfer cancellation complete", shared.name);
        }
        outcome
    }

    fn cancel_submitted(&self, report: bool) {
        for (index, slot) in self.shared.slots.iter().enumerate() {
            if slot.state() != TransferState::Submitted {
                continue;
            }
            if let Err(e) = self.native.cancel(index) {
                if report {
                    log::error!("{}: failed to cancel transfer {}: {}", self.shared.name, index, e);
                }
            }
        }
    }

    fn join_threads(&mut self) {
        for thread in [self.submit_thread.take(), self.process_thread.take()]
            .into_iter()
            .flatten()
        {
            if thread.join().is_err() {
                log::error!("{}: worker thread panicked", self.shared.name);
            }
        }
    }

    /// Free the native transfers and every buffer.
    ///
    /// Refused while streaming or while any transfer is still in flight;
    /// in the latter case the native memory is left alive on purpose.
    pub fn deallocate(&mut self) -> Result<()> {
        if self.deallocated {
            return Ok(());
        }
        if self.is_streaming() {
            return Err(Kinect2Error::InvalidState {
                expected: "not streaming",
                actual: "streaming",
            });
        }
        let pending = self.shared.pending_transfers();
        if pending > 0 {
            return Err(Kinect2Error::TransfersInFlight(pending));
        }

        self.native.deallocate();
        self.shared.to_submit.clear();
        self.shared.to_process.clear();
        self.shared.available.clear();
        for slot in self.shared.slots.iter() {
            lock(&slot.buffer).take();
        }
        self.deallocated = true;
        log::debug!("{}: deallocated", self.shared.name);
        Ok(())
    }

    pub fn transfer_states(&self) -> Vec<TransferState> {
        self.shared.slots.iter().map(TransferSlot::state).collect()
    }

    /// True when every transfer reports [`TransferState::Stopped`].
    pub fn all_stopped(&self) -> bool {
        self.shared.pending_transfers() == 0
    }

    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            transfers: self.shared.slots.len(),
            submitted: 0,
            queued: 0,
            stopped: 0,
            buffers_allocated: self.shared.buffers_allocated.load(Ordering::Acquire),
            buffers_available: self.shared.available.len(),
            buffers_processing: self.shared.to_process.len(),
            buffers_in_flight: 0,
            submit_failures: self.shared.submit_failures.load(Ordering::Acquire),
            threads_running: self.is_streaming(),
        };
        for slot in self.shared.slots.iter() {
            match slot.state() {
                TransferState::Stopped => stats.stopped += 1,
                TransferState::Queued => stats.queued += 1,
                TransferState::Submitted => stats.submitted += 1,
            }
            if lock(&slot.buffer).is_some() {
                stats.buffers_in_flight += 1;
            }
        }
        stats
    }
}

impl<N: NativeTransfers> Drop for TransferPool<N> {
    fn drop(&mut self) {
        if self.is_streaming() || !self.all_stopped() {
            if let Err(e) = self.cancel() {
                log::error!("{}: cancel on drop failed: {}", self.shared.name, e);
            }
        }
        if let Err(e) = self.deallocate() {
            log::error!("{}: deallocate on drop failed: {}", self.shared.name, e);
        }
    }
}

fn submit_loop<N: NativeTransfers>(shared: Arc<PoolShared>, native: Arc<N>) {
    let total = shared.slots.len();
    log::debug!("{}: submit thread started", shared.name);

    while shared.threads_running.load(Ordering::Acquire) {
        let Some(index) = shared.to_submit.pop_timeout(WORKER_POLL) else {
            continue;
        };
        let slot = &shared.slots[index];

        if !shared.submission_enabled.load(Ordering::Acquire) {
            slot.set_state(TransferState::Stopped);
            log::info!("{}: transfer {} stopped, submission disabled", shared.name, index);
            continue;
        }

        let mut buffer = match shared.available.try_pop() {
            Some(buffer) => buffer,
            None => {
                log::warn!(
                    "{}: no spare buffer, allocating another (processing is falling behind)",
                    shared.name
                );
                shared.allocate_buffer()
            }
        };
        buffer.reset_segments();

        let mut bound = lock(&slot.buffer);
        let buffer = bound.insert(buffer);
        slot.set_state(TransferState::Submitted);

        if let Err(e) = native.submit(index, buffer) {
            log::error!("{}: failed to submit transfer {}: {}", shared.name, index, e);
            slot.set_state(TransferState::Stopped);
            if let Some(buffer) = bound.take() {
                shared.available.push(buffer);
            }
            let failures = shared.submit_failures.fetch_add(1, Ordering::AcqRel) + 1;
            if failures == total {
                log::error!(
                    "{}: all {} submissions failed; try LIBUSB_DEBUG=3",
                    shared.name,
                    total
                );
            }
        }
    }

    log::debug!("{}: submit thread stopped", shared.name);
}

fn process_loop(shared: Arc<PoolShared>) {
    log::debug!("{}: process thread started", shared.name);

    while shared.threads_running.load(Ordering::Acquire) {
        let Some(buffer) = shared.to_process.pop_timeout(WORKER_POLL) else {
            continue;
        };

        {
            let mut callback = lock(&shared.callback);
            if let Some(callback) = callback.as_mut() {
                for (_, data) in buffer.completed_segments() {
                    callback.on_data_received(data);
                }
            }
        }

        shared.available.push(buffer);
    }

    log::debug!("{}: process thread stopped", shared.name);
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::transfer::PacketStatus;
    use std::collections::{HashSet, VecDeque};
    use std::sync::Condvar;

    struct SyntheticCompletion {
        status: TransferStatus,
        actual_length: usize,
        packets: Vec<PacketStatus>,
    }

    impl Completion for SyntheticCompletion {
        fn status(&self) -> TransferStatus {
            self.status
        }
        fn actual_length(&self) -> usize {
            self.actual_length
        }
        fn packet(&self, index: usize) -> PacketStatus {
            self.packets[index]
        }
    }

    #[derive(Default)]
    struct SyntheticState {
        in_flight: VecDeque<usize>,
        bound_ids: HashSet<usize>,
        slot_ids: Vec<Option<usize>>,
        submissions: usize,
        duplicate_binds: usize,
    }

    /// In-memory native layer. Submissions are parked until the test
    /// completes them from its own thread, standing in for the USB event loop.
    pub(crate) struct SyntheticTransfers {
        state: Mutex<SyntheticState>,
        submitted: Condvar,
        sink: Mutex<Option<Arc<dyn CompletionSink>>>,
        fail_submit: bool,
        ignore_cancel: bool,
    }

    impl SyntheticTransfers {
        pub(crate) fn new() -> Self {
            Self {
                state: Mutex::new(SyntheticState::default()),
                submitted: Condvar::new(),
                sink: Mutex::new(None),
                fail_submit: false,
                ignore_cancel: false,
            }
        }

        fn failing() -> Self {
            Self {
                fail_submit: true,
                ..Self::new()
            }
        }

        pub(crate) fn deaf_to_cancel() -> Self {
            Self {
                ignore_cancel: true,
                ..Self::new()
            }
        }

        /// Wait for the next in-flight transfer and take it.
        fn take_submitted(&self, timeout: Duration) -> Option<usize> {
            let deadline = Instant::now() + timeout;
            let mut state = lock(&self.state);
            loop {
                if let Some(slot) = state.in_flight.pop_front() {
                    let id = state.slot_ids[slot].take();
                    if let Some(id) = id {
                        state.bound_ids.remove(&id);
                    }
                    return Some(slot);
                }
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return None;
                }
                state = self.submitted.wait_timeout(state, remaining).unwrap().0;
            }
        }

        fn complete(&self, slot: usize, completion: &dyn Completion) {
            let sink = lock(&self.sink).clone().unwrap();
            sink.on_transfer_complete(slot, completion);
        }

        fn in_flight(&self) -> usize {
            lock(&self.state).in_flight.len()
        }

        fn submissions(&self) -> usize {
            lock(&self.state).submissions
        }

        fn duplicate_binds(&self) -> usize {
            lock(&self.state).duplicate_binds
        }
    }

    impl NativeTransfers for SyntheticTransfers {
        fn allocate(
            &self,
            _kind: TransferKind,
            count: usize,
            sink: Arc<dyn CompletionSink>,
        ) -> Result<()> {
            lock(&self.state).slot_ids = vec![None; count];
            *lock(&self.sink) = Some(sink);
            Ok(())
        }

        fn submit(&self, slot: usize, buffer: &mut Buffer) -> Result<()> {
            if self.fail_submit {
                return Err(Kinect2Error::Usb(rusb::Error::Io));
            }
            // Tag every segment with its index so offsets are checkable.
            let segment_size = buffer.segment_size();
            for (index, chunk) in buffer.data_mut().chunks_mut(segment_size).enumerate() {
                chunk.fill(index as u8);
            }
            let mut state = lock(&self.state);
            if !state.bound_ids.insert(buffer.id()) {
                state.duplicate_binds += 1;
            }
            state.slot_ids[slot] = Some(buffer.id());
            state.in_flight.push_back(slot);
            state.submissions += 1;
            drop(state);
            self.submitted.notify_all();
            Ok(())
        }

        fn cancel(&self, slot: usize) -> Result<()> {
            if self.ignore_cancel {
                return Ok(());
            }
            let was_in_flight = {
                let mut state = lock(&self.state);
                let before = state.in_flight.len();
                state.in_flight.retain(|&s| s != slot);
                if let Some(id) = state.slot_ids[slot].take() {
                    state.bound_ids.remove(&id);
                }
                before != state.in_flight.len()
            };
            if was_in_flight {
                self.complete(
                    slot,
                    &SyntheticCompletion {
                        status: TransferStatus::Cancelled,
                        actual_length: 0,
                        packets: vec![],
                    },
                );
            }
            Ok(())
        }

        fn deallocate(&self) {
            lock(&self.sink).take();
        }
    }

    impl NativeTransfers for Arc<SyntheticTransfers> {
        fn allocate(
            &self,
            kind: TransferKind,
            count: usize,
            sink: Arc<dyn CompletionSink>,
        ) -> Result<()> {
            (**self).allocate(kind, count, sink)
        }
        fn submit(&self, slot: usize, buffer: &mut Buffer) -> Result<()> {
            (**self).submit(slot, buffer)
        }
        fn cancel(&self, slot: usize) -> Result<()> {
            (**self).cancel(slot)
        }
        fn deallocate(&self) {
            (**self).deallocate()
        }
    }

    fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    /// Every buffer is accounted for once the workers are idle.
    fn conserved<N: NativeTransfers>(pool: &TransferPool<N>) -> bool {
        let stats = pool.stats();
        stats.buffers_available + stats.buffers_processing + stats.buffers_in_flight
            == stats.buffers_allocated
    }

    fn assert_conserved<N: NativeTransfers>(pool: &TransferPool<N>) {
        assert!(
            wait_until(Duration::from_secs(2), || conserved(pool)),
            "{:?}",
            pool.stats()
        );
    }

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn test_allocate_preprovisions_buffers() {
        let pool = TransferPool::bulk(SyntheticTransfers::new(), 4, 1024).unwrap();
        let stats = pool.stats();
        assert_eq!(stats.transfers, 4);
        assert_eq!(stats.buffers_allocated, 40);
        assert_eq!(stats.buffers_available, 40);
        assert_eq!(stats.stopped, 4);
        assert!(!stats.threads_running);
    }

    #[test]
    fn test_allocate_rejects_empty_pool() {
        assert!(TransferPool::bulk(SyntheticTransfers::new(), 0, 1024).is_err());
        assert!(TransferPool::isochronous(SyntheticTransfers::new(), 2, 8, 0).is_err());
    }

    #[test]
    fn test_submit_requires_enabled_submission() {
        let mut pool = TransferPool::bulk(SyntheticTransfers::new(), 2, 64).unwrap();
        assert!(matches!(pool.submit(), Err(Kinect2Error::SubmissionDisabled)));
        assert!(!pool.is_streaming());
    }

    #[test]
    fn test_every_transfer_gets_submitted() {
        init_logger();
        let native = Arc::new(SyntheticTransfers::new());
        let mut pool = TransferPool::bulk(native.clone(), 5, 256).unwrap();
        pool.enable_submission();
        pool.submit().unwrap();

        assert!(wait_until(Duration::from_secs(2), || native.in_flight() == 5));
        assert!(pool
            .transfer_states()
            .iter()
            .all(|s| *s == TransferState::Submitted));
        assert_conserved(&pool);

        pool.cancel().unwrap();
        assert!(pool.all_stopped());
    }

    #[test]
    fn test_bulk_end_to_end() {
        init_logger();
        let native = Arc::new(SyntheticTransfers::new());
        let mut pool = TransferPool::bulk(native.clone(), 4, 16 * 1024).unwrap();

        let lengths = Arc::new(Mutex::new(Vec::new()));
        {
            let lengths = lengths.clone();
            pool.set_callback(move |data: &[u8]| lengths.lock().unwrap().push(data.len()))
                .unwrap();
        }

        pool.enable_submission();
        pool.submit().unwrap();

        for _ in 0..10 {
            let slot = native.take_submitted(Duration::from_secs(2)).unwrap();
            native.complete(
                slot,
                &SyntheticCompletion {
                    status: TransferStatus::Completed,
                    actual_length: 16 * 1024,
                    packets: vec![],
                },
            );
        }

        assert!(wait_until(Duration::from_secs(2), || lengths.lock().unwrap().len() == 10));
        assert!(wait_until(Duration::from_secs(2), || native.in_flight() == 4));
        assert_eq!(*lengths.lock().unwrap(), vec![16384; 10]);
        assert_eq!(native.duplicate_binds(), 0);
        assert!(native.submissions() >= 14);
        assert_conserved(&pool);

        pool.cancel().unwrap();
        assert!(pool.all_stopped());
        assert!(!pool.is_streaming());
        assert_conserved(&pool);
    }

    #[test]
    fn test_iso_partial_completion_delivery() {
        init_logger();
        let native = Arc::new(SyntheticTransfers::new());
        let mut pool = TransferPool::isochronous(native.clone(), 1, 8, 32).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            pool.set_callback(move |data: &[u8]| seen.lock().unwrap().push((data[0], data.len())))
                .unwrap();
        }
        pool.enable_submission();
        pool.submit().unwrap();

        let slot = native.take_submitted(Duration::from_secs(2)).unwrap();
        let packets = (0..8)
            .map(|i| PacketStatus {
                status: if [1, 3, 5].contains(&i) {
                    TransferStatus::Error
                } else {
                    TransferStatus::Completed
                },
                actual_length: 32,
            })
            .collect();
        native.complete(
            slot,
            &SyntheticCompletion {
                status: TransferStatus::Completed,
                actual_length: 0,
                packets,
            },
        );

        assert!(wait_until(Duration::from_secs(2), || seen.lock().unwrap().len() == 5));
        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen, vec![(0, 32), (2, 32), (4, 32), (6, 32), (7, 32)]);

        pool.cancel().unwrap();
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let native = Arc::new(SyntheticTransfers::new());
        let mut pool = TransferPool::bulk(native.clone(), 3, 64).unwrap();
        pool.enable_submission();
        pool.submit().unwrap();
        assert!(wait_until(Duration::from_secs(2), || native.in_flight() == 3));

        pool.disable_submission();
        pool.disable_submission();
        pool.cancel().unwrap();
        pool.cancel().unwrap();

        let stats = pool.stats();
        assert_eq!(stats.stopped, 3);
        assert_eq!(stats.buffers_in_flight, 0);
        assert_eq!(stats.buffers_available, stats.buffers_allocated);
        assert!(!stats.threads_running);

        pool.deallocate().unwrap();
        pool.deallocate().unwrap();
        assert!(matches!(pool.submit(), Err(Kinect2Error::NotAllocated)));
    }

    #[test]
    fn test_restart_after_cancel() {
        let native = Arc::new(SyntheticTransfers::new());
        let mut pool = TransferPool::bulk(native.clone(), 2, 64).unwrap();
        pool.enable_submission();
        pool.submit().unwrap();
        assert!(wait_until(Duration::from_secs(2), || native.in_flight() == 2));
        pool.cancel().unwrap();

        pool.enable_submission();
        pool.submit().unwrap();
        assert!(wait_until(Duration::from_secs(2), || native.in_flight() == 2));
        assert_eq!(pool.stats().buffers_allocated, 20);
        pool.cancel().unwrap();
    }

    #[test]
    fn test_callback_locked_while_streaming() {
        let native = Arc::new(SyntheticTransfers::new());
        let mut pool = TransferPool::bulk(native.clone(), 1, 64).unwrap();
        pool.enable_submission();
        pool.submit().unwrap();
        assert!(pool.set_callback(|_: &[u8]| {}).is_err());
        pool.cancel().unwrap();
        assert!(pool.set_callback(|_: &[u8]| {}).is_ok());
        assert!(pool.clear_callback().is_ok());
    }

    #[test]
    fn test_all_submissions_failing_leaves_pool_stopped() {
        init_logger();
        let mut pool = TransferPool::bulk(SyntheticTransfers::failing(), 3, 64).unwrap();
        pool.enable_submission();
        pool.submit().unwrap();

        assert!(wait_until(Duration::from_secs(2), || pool.stats().submit_failures == 3));
        assert!(pool.all_stopped());
        assert_conserved(&pool);
        pool.cancel().unwrap();
    }

    #[test]
    fn test_cancel_deadline_and_refused_deallocate() {
        init_logger();
        let native = Arc::new(SyntheticTransfers::deaf_to_cancel());
        let mut pool = TransferPool::bulk(native.clone(), 2, 64).unwrap();
        pool.set_cancel_timeout(Some(Duration::from_millis(250)));
        pool.enable_submission();
        pool.submit().unwrap();
        assert!(wait_until(Duration::from_secs(2), || native.in_flight() == 2));

        let result = pool.cancel();
        assert!(matches!(result, Err(Kinect2Error::CancelTimeout { pending: 2 })));
        assert!(!pool.is_streaming());
        assert!(matches!(pool.deallocate(), Err(Kinect2Error::TransfersInFlight(2))));

        // The device finally delivers the cancellations.
        while let Some(slot) = native.take_submitted(Duration::from_millis(10)) {
            native.complete(
                slot,
                &SyntheticCompletion {
                    status: TransferStatus::Cancelled,
                    actual_length: 0,
                    packets: vec![],
                },
            );
        }
        assert!(pool.all_stopped());
        pool.deallocate().unwrap();
    }

    #[test]
    fn test_missing_spare_buffer_is_allocated() {
        let native = Arc::new(SyntheticTransfers::new());
        let mut pool = TransferPool::bulk(native.clone(), 1, 64).unwrap();
        // Starve the available queue.
        let hoard = pool.shared.available.drain();
        assert_eq!(hoard.len(), 10);

        pool.enable_submission();
        pool.submit().unwrap();
        assert!(wait_until(Duration::from_secs(2), || native.in_flight() == 1));
        assert_eq!(pool.stats().buffers_allocated, 11);

        pool.cancel().unwrap();
        for buffer in hoard {
            pool.shared.available.push(buffer);
        }
        assert_conserved(&pool);
    }
}
