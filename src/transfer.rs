//! Transfer shapes, buffers, and completion decoding.

/// Final status of a native transfer or of one isochronous packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    Error,
    TimedOut,
    Cancelled,
    Stall,
    NoDevice,
    Overflow,
}

/// Status and received length of a single isochronous packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketStatus {
    pub status: TransferStatus,
    pub actual_length: usize,
}

/// Read-only view of a finished native transfer.
///
/// Implemented by the libusb trampoline and by synthetic transfers in tests.
pub trait Completion {
    fn status(&self) -> TransferStatus;

    /// Bytes transferred for the whole transfer.
    fn actual_length(&self) -> usize;

    /// Descriptor of isochronous packet `index`.
    fn packet(&self, index: usize) -> PacketStatus;
}

/// Sink for completed segments.
///
/// Called on the pool's process thread once per completed segment. The
/// slice is only valid for the duration of the call.
pub trait DataCallback: Send {
    fn on_data_received(&mut self, data: &[u8]);
}

impl<F> DataCallback for F
where
    F: FnMut(&[u8]) + Send,
{
    fn on_data_received(&mut self, data: &[u8]) {
        self(data)
    }
}

/// Shape of the transfers in one pool, fixed at allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    /// One segment per transfer.
    Bulk { transfer_size: usize },
    /// `num_packets` fixed-size segments per transfer.
    Isochronous {
        num_packets: usize,
        packet_size: usize,
    },
}

impl TransferKind {
    pub fn num_segments(&self) -> usize {
        match *self {
            TransferKind::Bulk { .. } => 1,
            TransferKind::Isochronous { num_packets, .. } => num_packets,
        }
    }

    pub fn segment_size(&self) -> usize {
        match *self {
            TransferKind::Bulk { transfer_size } => transfer_size,
            TransferKind::Isochronous { packet_size, .. } => packet_size,
        }
    }

    /// Total bytes of one transfer buffer.
    pub fn buffer_len(&self) -> usize {
        self.num_segments() * self.segment_size()
    }

    pub fn name(&self) -> &'static str {
        match self {
            TransferKind::Bulk { .. } => "bulk",
            TransferKind::Isochronous { .. } => "iso",
        }
    }

    pub(crate) fn validate(&self) -> crate::Result<()> {
        if self.num_segments() == 0 || self.segment_size() == 0 {
            return Err(crate::Kinect2Error::InvalidArgument(format!(
                "{} transfer shape must be non-empty: {:?}",
                self.name(),
                self
            )));
        }
        Ok(())
    }

    pub fn allocate_buffer(&self, id: usize) -> Buffer {
        Buffer {
            id,
            data: vec![0u8; self.buffer_len()].into_boxed_slice(),
            segment_size: self.segment_size(),
            segments: vec![Segment::default(); self.num_segments()].into_boxed_slice(),
        }
    }

    /// Record per-segment completion of `completion` into `buffer`.
    pub fn decode(&self, completion: &dyn Completion, buffer: &mut Buffer) {
        match *self {
            TransferKind::Bulk { .. } => {
                buffer.segments[0] = Segment {
                    completed: completion.status() == TransferStatus::Completed,
                    actual_length: completion.actual_length(),
                };
            }
            TransferKind::Isochronous { num_packets, .. } => {
                for (index, segment) in buffer.segments.iter_mut().enumerate().take(num_packets) {
                    let packet = completion.packet(index);
                    *segment = Segment {
                        completed: packet.status == TransferStatus::Completed,
                        actual_length: packet.actual_length,
                    };
                }
            }
        }
    }
}

/// Completion record of one buffer segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Segment {
    pub completed: bool,
    pub actual_length: usize,
}

/// Fixed-size transfer memory plus per-segment completion records.
///
/// A buffer is owned by exactly one place at a time: a transfer slot while
/// in flight, the process queue, or the available queue.
#[derive(Debug)]
pub struct Buffer {
    id: usize,
    data: Box<[u8]>,
    segment_size: usize,
    segments: Box<[Segment]>,
}

impl Buffer {
    /// Stable identity, unique within one pool.
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Forget the previous completion before the buffer is resubmitted.
    pub(crate) fn reset_segments(&mut self) {
        self.segments.fill(Segment::default());
    }

    /// Completed segments as `(offset, data)`, in packet order.
    ///
    /// Offsets advance by the segment size whether or not a segment
    /// completed, so failed packets never shift their successors.
    pub fn completed_segments(&self) -> impl Iterator<Item = (usize, &[u8])> + '_ {
        self.segments
            .iter()
            .enumerate()
            .filter(|(_, segment)| segment.completed)
            .map(move |(index, segment)| {
                let offset = index * self.segment_size;
                let len = segment.actual_length.min(self.segment_size);
                (offset, &self.data[offset..offset + len])
            })
    }
}
