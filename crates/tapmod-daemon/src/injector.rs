//! Virtual device injection via uinput
//!
//! Remapped events leave the daemon through a [`VirtualDevice`] built from the
//! grabbed keyboard. Events are written one frame at a time: every `emit`
//! call ends with the `SYN_REPORT` evdev appends, so readers of the virtual
//! device never see a key event without the marker that closes its frame.

use std::io;

use evdev::raw_stream::RawDevice;
use evdev::uinput::VirtualDeviceBuilder;
use evdev::{AttributeSet, InputEvent, Key};
use tapmod_config::Config;

use crate::error::DaemonError;
use crate::remapper::key_event;

/// Something the daemon can write remapped events to.
pub trait EventSink {
    /// Write one key event and its `SYN_REPORT` as a single unit.
    ///
    /// Non-key events queued by [`EventSink::forward`] go first, in the same
    /// frame.
    fn emit_key(&mut self, key: Key, value: i32) -> Result<(), DaemonError>;

    /// Queue a non-key event, unchanged, for the current frame.
    fn forward(&mut self, event: InputEvent) -> Result<(), DaemonError>;

    /// End the current frame. Writes queued non-key events, if any.
    fn sync(&mut self) -> Result<(), DaemonError>;
}

/// A virtual input device for injecting events
pub struct VirtualDevice {
    device: evdev::uinput::VirtualDevice,
    name: String,
    frame: Frame,
}

/// Events of the frame being assembled, without the closing `SYN_REPORT`.
#[derive(Debug, Default)]
struct Frame {
    events: Vec<InputEvent>,
}

impl Frame {
    fn queue(&mut self, event: InputEvent) {
        self.events.push(event);
    }

    /// Close the frame with a key event.
    fn with_key(&mut self, key: Key, value: i32) -> Vec<InputEvent> {
        self.events.push(key_event(key, value));
        std::mem::take(&mut self.events)
    }

    /// Close the frame if anything was queued.
    fn flush(&mut self) -> Option<Vec<InputEvent>> {
        if self.events.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.events))
        }
    }
}

impl VirtualDevice {
    /// Create a virtual keyboard modelled on `source`.
    ///
    /// It copies the source's input id, its key, misc, relative axis and
    /// switch capabilities, and adds every key the configuration can emit.
    /// The kernel drops events of any type a uinput device did not declare.
    pub fn from_template(source: &RawDevice, config: &Config) -> Result<Self, DaemonError> {
        let mut keys = AttributeSet::<Key>::new();

        if let Some(supported) = source.supported_keys() {
            for key in supported.iter() {
                keys.insert(key);
            }
        }
        for key in config.output_keys() {
            keys.insert(key);
        }

        let name = format!(
            "{}{}",
            source.name().unwrap_or("Unknown"),
            config.virtual_device_suffix
        );

        let device = build(&name, source, &keys).map_err(DaemonError::SinkCreationFailed)?;

        tracing::info!("Created virtual device '{}'", name);

        Ok(Self {
            device,
            name,
            frame: Frame::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn write(&mut self, events: &[InputEvent]) -> Result<(), DaemonError> {
        self.device.emit(events).map_err(DaemonError::SinkWriteFailed)
    }
}

fn build(
    name: &str,
    source: &RawDevice,
    keys: &AttributeSet<Key>,
) -> io::Result<evdev::uinput::VirtualDevice> {
    let mut builder = VirtualDeviceBuilder::new()?
        .name(name)
        .input_id(source.input_id())
        .with_keys(keys)?;

    if let Some(misc) = source.misc_properties() {
        builder = builder.with_msc(misc)?;
    }
    if let Some(axes) = source.supported_relative_axes() {
        builder = builder.with_relative_axes(axes)?;
    }
    if let Some(switches) = source.supported_switches() {
        builder = builder.with_switches(switches)?;
    }

    builder.build()
}

impl EventSink for VirtualDevice {
    fn emit_key(&mut self, key: Key, value: i32) -> Result<(), DaemonError> {
        let events = self.frame.with_key(key, value);
        self.write(&events)
    }

    fn forward(&mut self, event: InputEvent) -> Result<(), DaemonError> {
        self.frame.queue(event);
        Ok(())
    }

    fn sync(&mut self) -> Result<(), DaemonError> {
        match self.frame.flush() {
            Some(events) => self.write(&events),
            None => Ok(()),
        }
    }
}

impl Drop for VirtualDevice {
    fn drop(&mut self) {
        tracing::debug!("Destroying virtual device '{}'", self.name);
    }
}
