//! Source device: exclusive access and the read loop

use std::collections::VecDeque;
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use evdev::raw_stream::RawDevice;
use evdev::{EventType, InputEvent};
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use tokio::io::unix::AsyncFd;

use crate::error::DaemonError;
use crate::sync::{SourceEvent, SyncTracker};

/// Something the daemon can pull input events from.
#[allow(async_fn_in_trait)]
pub trait EventSource {
    /// Wait for the next event.
    ///
    /// Must be cancel-safe: dropping the future before it completes may not
    /// lose an event.
    async fn next_event(&mut self) -> Result<SourceEvent, DaemonError>;

    /// When `event` arrived, on the monotonic clock.
    ///
    /// `now` is when the daemon picked it up.
    fn event_time(&self, _event: &InputEvent, now: Instant) -> Instant {
        now
    }
}

/// How far back a kernel timestamp may place an event.
///
/// Larger gaps mean the wall clock moved, not that the event waited.
const MAX_READ_LAG: Duration = Duration::from_millis(100);

/// The physical input device the daemon remaps.
///
/// The grab (if taken) is released when this is dropped, on every exit path.
pub struct DeviceSource {
    path: PathBuf,
    name: String,
    device: AsyncFd<RawDevice>,
    tracker: SyncTracker,
    pending: VecDeque<SourceEvent>,
    grabbed: bool,
}

impl DeviceSource {
    /// Open the device at `path` without grabbing it.
    pub fn open(path: &Path) -> Result<Self, DaemonError> {
        let unavailable = |source: io::Error| DaemonError::UnavailableDevice {
            path: path.to_path_buf(),
            source,
        };

        let device = RawDevice::open(path).map_err(unavailable)?;
        let name = device.name().unwrap_or("Unknown").to_string();

        if !device.supported_events().contains(EventType::KEY) {
            tracing::warn!(
                "Device '{}' at {} does not report key events, nothing will be remapped",
                name,
                path.display()
            );
        }

        let keys = device.get_key_state().map_err(unavailable)?;
        set_nonblocking(&device).map_err(unavailable)?;
        let device = AsyncFd::new(device).map_err(unavailable)?;

        tracing::debug!("Opened device '{}' at {}", name, path.display());

        Ok(Self {
            path: path.to_path_buf(),
            name,
            device,
            tracker: SyncTracker::new(keys),
            pending: VecDeque::new(),
            grabbed: false,
        })
    }

    /// Device name as reported by the kernel
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The underlying device, used as the template for the virtual device
    pub fn device(&self) -> &RawDevice {
        self.device.get_ref()
    }

    /// Grab the device for exclusive access.
    ///
    /// Call this only once the virtual device exists: from here on the daemon
    /// is the only consumer of this keyboard.
    pub fn grab(&mut self) -> Result<(), DaemonError> {
        self.device
            .get_mut()
            .grab()
            .map_err(|source| DaemonError::GrabDenied {
                path: self.path.clone(),
                source,
            })?;
        self.grabbed = true;

        tracing::info!("Grabbed device '{}' at {}", self.name, self.path.display());
        Ok(())
    }
}

impl EventSource for DeviceSource {
    async fn next_event(&mut self) -> Result<SourceEvent, DaemonError> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(event);
            }

            let batch = read_batch(&mut self.device)
                .await
                .map_err(DaemonError::ReadFailed)?;

            let device = self.device.get_ref();
            for event in batch {
                self.tracker
                    .feed(event, || device.get_key_state(), &mut self.pending)
                    .map_err(DaemonError::ReadFailed)?;
            }
        }
    }

    fn event_time(&self, event: &InputEvent, now: Instant) -> Instant {
        arrival_time(now, SystemTime::now(), event.timestamp())
    }
}

/// Shift `now` back by how long ago the kernel stamped the event.
fn arrival_time(now: Instant, wall_now: SystemTime, stamp: SystemTime) -> Instant {
    let lag = wall_now
        .duration_since(stamp)
        .unwrap_or(Duration::ZERO)
        .min(MAX_READ_LAG);
    now.checked_sub(lag).unwrap_or(now)
}

impl Drop for DeviceSource {
    fn drop(&mut self) {
        if !self.grabbed {
            return;
        }

        match self.device.get_mut().ungrab() {
            Ok(()) => tracing::info!("Released device '{}'", self.name),
            Err(e) => tracing::warn!(
                "Failed to release device '{}' at {}: {}",
                self.name,
                self.path.display(),
                e
            ),
        }
    }
}

/// Wait until the device is readable and read everything available.
///
/// The events are only taken out of the kernel once the read succeeds, so
/// dropping this future never loses input.
async fn read_batch(device: &mut AsyncFd<RawDevice>) -> io::Result<Vec<InputEvent>> {
    loop {
        let mut guard = device.readable_mut().await?;

        match guard.try_io(|inner| {
            inner
                .get_mut()
                .fetch_events()
                .map(|events| events.collect::<Vec<_>>())
        }) {
            Ok(result) => return result,
            // Spurious wakeup, readiness was cleared
            Err(_would_block) => continue,
        }
    }
}

fn set_nonblocking(device: &RawDevice) -> io::Result<()> {
    let fd = device.as_raw_fd();
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}
