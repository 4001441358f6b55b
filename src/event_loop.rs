//! Background thread that pumps USB events so transfer completions fire.

use crate::queue::lock;
use crate::{Kinect2Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Timeout of each event-handling pass.
pub const EVENT_TIMEOUT: Duration = Duration::from_millis(10);

/// Anything that can process pending USB events for a bounded time.
pub trait EventSource: Send + 'static {
    fn handle_events_timeout(&self, timeout: Duration) -> rusb::Result<()>;
}

impl<T: rusb::UsbContext + 'static> EventSource for T {
    fn handle_events_timeout(&self, timeout: Duration) -> rusb::Result<()> {
        self.handle_events(Some(timeout))
    }
}

/// Single event-pumping thread shared by every device of one driver.
///
/// Must outlive every transfer pool that relies on it: completion
/// callbacks only fire while the loop runs.
pub struct EventLoop {
    shutdown: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl EventLoop {
    pub fn new() -> Self {
        Self {
            shutdown: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        }
    }

    /// Spawn the event thread. Starting a running loop is a no-op.
    pub fn start<S: EventSource>(&self, source: S) -> Result<()> {
        let mut thread = lock(&self.thread);
        if thread.is_some() {
            return Ok(());
        }
        self.shutdown.store(false, Ordering::Release);

        let shutdown = self.shutdown.clone();
        let handle = std::thread::Builder::new()
            .name("kinect2-usb-events".into())
            .spawn(move || run(source, shutdown))
            .map_err(|e| Kinect2Error::Thread(format!("usb event thread: {}", e)))?;
        *thread = Some(handle);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        lock(&self.thread).is_some()
    }

    /// Signal the thread and wait for its current pass to finish.
    pub fn stop(&self) {
        let Some(thread) = lock(&self.thread).take() else {
            return;
        };
        self.shutdown.store(true, Ordering::Release);
        if thread.join().is_err() {
            log::error!("USB event thread panicked");
        }
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run<S: EventSource>(source: S, shutdown: Arc<AtomicBool>) {
    log::info!("USB event thread started");

    while !shutdown.load(Ordering::Acquire) {
        match source.handle_events_timeout(EVENT_TIMEOUT) {
            Ok(()) => {}
            Err(rusb::Error::Interrupted) => {
                log::debug!("USB event handling interrupted");
            }
            Err(e) => {
                log::warn!("Error handling USB events: {}", e);
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }

    log::info!("USB event thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingSource {
        passes: Arc<AtomicUsize>,
        fail_first: bool,
    }

    impl EventSource for CountingSource {
        fn handle_events_timeout(&self, timeout: Duration) -> rusb::Result<()> {
            let pass = self.passes.fetch_add(1, Ordering::AcqRel);
            if self.fail_first && pass == 0 {
                return Err(rusb::Error::Io);
            }
            std::thread::sleep(timeout);
            Ok(())
        }
    }

    #[test]
    fn test_pumps_until_stopped() {
        let passes = Arc::new(AtomicUsize::new(0));
        let event_loop = EventLoop::new();
        event_loop
            .start(CountingSource {
                passes: passes.clone(),
                fail_first: false,
            })
            .unwrap();
        assert!(event_loop.is_running());

        std::thread::sleep(Duration::from_millis(100));
        event_loop.stop();
        assert!(!event_loop.is_running());

        let seen = passes.load(Ordering::Acquire);
        assert!(seen >= 2, "only {} passes", seen);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(passes.load(Ordering::Acquire), seen);
    }

    #[test]
    fn test_start_twice_keeps_one_thread() {
        let passes = Arc::new(AtomicUsize::new(0));
        let event_loop = EventLoop::new();
        for _ in 0..2 {
            event_loop
                .start(CountingSource {
                    passes: passes.clone(),
                    fail_first: false,
                })
                .unwrap();
        }
        event_loop.stop();
        event_loop.stop();
    }

    #[test]
    fn test_survives_event_errors() {
        let passes = Arc::new(AtomicUsize::new(0));
        let event_loop = EventLoop::new();
        event_loop
            .start(CountingSource {
                passes: passes.clone(),
                fail_first: true,
            })
            .unwrap();
        std::thread::sleep(Duration::from_millis(250));
        drop(event_loop);
        assert!(passes.load(Ordering::Acquire) >= 2);
    }
}
