//! Recovery from kernel buffer overflows (`SYN_DROPPED`)
//!
//! When the evdev client buffer overflows the kernel queues a `SYN_DROPPED`.
//! Everything after it up to and including the next `SYN_REPORT` belongs to an
//! incomplete frame and must be discarded. The client then queries the real
//! device state and reconciles it with what it last saw.
//!
//! [`SyncTracker`] does this for key state. Each changed key becomes a
//! [`SourceEvent::Synthetic`] event, and the batch is framed by
//! [`SourceEvent::OutOfSync`] and [`SourceEvent::Resynced`]:
//!
//! ```text
//! ... Event  Event  OutOfSync  Synthetic* Resynced  Event  Event ...
//! ```

use std::collections::VecDeque;
use std::io;

use evdev::{AttributeSet, EventType, InputEvent, Key, Synchronization};
use tapmod_config::key_state_changes;

use crate::remapper::{event_value, key_event};

/// One item read from the source device.
#[derive(Debug, Clone, Copy)]
pub enum SourceEvent {
    /// A regular event, in kernel order
    Event(InputEvent),
    /// Events were dropped; a resync batch follows
    OutOfSync,
    /// Corrects the state of one key after a drop. Not new user input.
    Synthetic(InputEvent),
    /// End of the resync batch
    Resynced,
}

/// Tracks key state and turns `SYN_DROPPED` into a bounded resync batch.
pub struct SyncTracker {
    keys: AttributeSet<Key>,
    dropping: bool,
}

impl SyncTracker {
    /// Start tracking from the key state the device reported when opened.
    pub fn new(keys: AttributeSet<Key>) -> Self {
        Self {
            keys,
            dropping: false,
        }
    }

    /// Feed one raw event and queue what the consumer should see.
    ///
    /// `query_keys` reads the device's current key state. It is only called
    /// when a drop has been fully drained.
    pub fn feed<F>(
        &mut self,
        event: InputEvent,
        query_keys: F,
        out: &mut VecDeque<SourceEvent>,
    ) -> io::Result<()>
    where
        F: FnOnce() -> io::Result<AttributeSet<Key>>,
    {
        let is_syn = event.event_type() == EventType::SYNCHRONIZATION;

        if self.dropping {
            if is_syn && event.code() == Synchronization::SYN_REPORT.0 {
                let current = query_keys()?;
                self.resync(current, out);
                self.dropping = false;
            } else {
                tracing::trace!(
                    "Discarding event from incomplete frame: type {:?} code {} value {}",
                    event.event_type(),
                    event.code(),
                    event.value()
                );
            }
            return Ok(());
        }

        if is_syn && event.code() == Synchronization::SYN_DROPPED.0 {
            self.dropping = true;
            out.push_back(SourceEvent::OutOfSync);
            return Ok(());
        }

        if event.event_type() == EventType::KEY {
            let key = Key::new(event.code());
            match event.value() {
                event_value::PRESS => {
                    self.keys.insert(key);
                }
                event_value::RELEASE => {
                    self.keys.remove(key);
                }
                _ => {}
            }
        }

        out.push_back(SourceEvent::Event(event));
        Ok(())
    }

    fn resync(&mut self, current: AttributeSet<Key>, out: &mut VecDeque<SourceEvent>) {
        let changes = key_state_changes(&self.keys, &current);

        tracing::debug!("Resync found {} key change(s)", changes.len());

        out.extend(
            changes
                .into_iter()
                .map(|(key, value)| SourceEvent::Synthetic(key_event(key, value))),
        );
        out.push_back(SourceEvent::Resynced);
        self.keys = current;
    }
}
