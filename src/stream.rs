use crate::transfer::DataCallback;
use crate::{Kinect2Error, Result};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default number of packets buffered per stream.
pub const DEFAULT_CAPACITY: usize = 256;

/// One completed transfer segment, copied out of the pool's buffer.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Position in the stream, counting dropped packets.
    pub index: u64,
    /// Host time the segment was handed over.
    pub received_at: Instant,
    pub data: Vec<u8>,
}

/// Create a bounded packet channel. The sink goes to a transfer pool,
/// the stream to the consumer.
pub fn channel(capacity: usize) -> (ChannelSink, PacketStream) {
    let (sender, receiver) = crossbeam_channel::bounded(capacity);
    let dropped = Arc::new(AtomicU64::new(0));
    (
        ChannelSink {
            sender,
            next_index: 0,
            dropped: dropped.clone(),
        },
        PacketStream { receiver, dropped },
    )
}

/// [`DataCallback`] forwarding segments into a channel.
///
/// Never blocks the pool's process thread: when the consumer falls
/// behind, packets are dropped and counted.
pub struct ChannelSink {
    sender: Sender<Packet>,
    next_index: u64,
    dropped: Arc<AtomicU64>,
}

impl DataCallback for ChannelSink {
    fn on_data_received(&mut self, data: &[u8]) {
        let packet = Packet {
            index: self.next_index,
            received_at: Instant::now(),
            data: data.to_vec(),
        };
        self.next_index += 1;

        if let Err(e) = self.sender.try_send(packet) {
            match e {
                TrySendError::Full(_) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    log::trace!("packet channel full, dropping packet");
                }
                TrySendError::Disconnected(_) => {
                    log::trace!("packet channel disconnected");
                }
            }
        }
    }
}

/// Receiving end of a device stream.
pub struct PacketStream {
    receiver: Receiver<Packet>,
    dropped: Arc<AtomicU64>,
}

impl PacketStream {
    /// Receive the next packet (blocks until available).
    pub fn recv(&self) -> Result<Packet> {
        self.receiver.recv().map_err(|_| Kinect2Error::StreamStopped)
    }

    pub fn try_recv(&self) -> Option<Packet> {
        self.receiver.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Packet> {
        self.receiver.recv_timeout(timeout).map_err(|e| match e {
            crossbeam_channel::RecvTimeoutError::Timeout => Kinect2Error::Timeout,
            crossbeam_channel::RecvTimeoutError::Disconnected => Kinect2Error::StreamStopped,
        })
    }

    /// Packets dropped because the channel was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}
