//! tapmod CLI
//!
//! Diagnostic tool for tapmod: find the keyboard to remap, inspect what it
//! reports and watch its raw events.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::{Parser, Subcommand};
use evdev::raw_stream::RawDevice;
use evdev::{AttributeSet, EventType, InputEvent, InputEventKind, Key, Synchronization};
use miette::IntoDiagnostic;
use serde::Serialize;
use tapmod_config::keys::{key_state_changes, KEY_PRESSED, KEY_RELEASED};

#[derive(Parser, Debug)]
#[command(name = "tapmod")]
#[command(about = "Diagnostic tool for the tapmod key remapper")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List available input devices
    Devices,

    /// Show what an input device supports
    Info {
        /// Device path (e.g. /dev/input/event3)
        path: PathBuf,
    },

    /// Print events from an input device as they arrive
    Events {
        /// Device path (e.g. /dev/input/event3)
        path: PathBuf,

        /// Grab the device so no other client sees its events
        #[arg(long)]
        grab: bool,

        /// Print one JSON object per line instead of text
        #[arg(long)]
        json: bool,
    },

    /// Show the built-in remapping configuration
    Config,
}

fn main() -> miette::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Devices => cmd_devices(),
        Commands::Info { path } => cmd_info(&path),
        Commands::Events { path, grab, json } => cmd_events(&path, grab, json),
        Commands::Config => cmd_config(),
    }
}

fn cmd_devices() -> miette::Result<()> {
    println!("Available input devices:\n");

    let mut paths: Vec<PathBuf> = std::fs::read_dir("/dev/input")
        .into_diagnostic()?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("event"))
                .unwrap_or(false)
        })
        .collect();
    paths.sort_by_key(|path| event_number(path));

    for path in paths {
        match RawDevice::open(&path) {
            Ok(device) => {
                let name = device.name().unwrap_or("Unknown");
                let id = device.input_id();
                let vendor_product = format!("{:04x}:{:04x}", id.vendor(), id.product());

                let device_type = if is_keyboard(&device) { "keyboard" } else { "other" };

                println!("  {} [{}]", name, device_type);
                println!("    Path: {}", path.display());
                println!("    ID: {}", vendor_product);
                println!();
            }
            Err(e) => {
                tracing::debug!("Skipping {}: {}", path.display(), e);
            }
        }
    }

    Ok(())
}

fn cmd_info(path: &Path) -> miette::Result<()> {
    let device = open(path)?;
    let id = device.input_id();
    let (major, minor, patch) = device.driver_version();

    println!("Input driver version is {}.{}.{}", major, minor, patch);
    println!(
        "Input device ID: bus {:?} vendor {:#06x} product {:#06x} version {:#06x}",
        id.bus_type(),
        id.vendor(),
        id.product(),
        id.version()
    );
    println!("Input device name: \"{}\"", device.name().unwrap_or("Unknown"));
    println!("Phys location: {}", device.physical_path().unwrap_or("-"));
    println!("Uniq identifier: {}", device.unique_name().unwrap_or("-"));

    println!("Supported events:");
    for event_type in device.supported_events().iter() {
        println!("  Event type {} ({})", event_type.0, type_name(event_type));

        match event_type {
            EventType::KEY => {
                if let Some(keys) = device.supported_keys() {
                    for key in keys.iter() {
                        println!("    Event code {} ({:?})", key.code(), key);
                    }
                }
            }
            EventType::RELATIVE => {
                if let Some(axes) = device.supported_relative_axes() {
                    for axis in axes.iter() {
                        println!("    Event code {} ({:?})", axis.0, axis);
                    }
                }
            }
            EventType::ABSOLUTE => {
                if let Some(axes) = device.supported_absolute_axes() {
                    let state = device.get_abs_state().into_diagnostic()?;
                    for axis in axes.iter() {
                        println!("    Event code {} ({:?})", axis.0, axis);
                        let info = &state[axis.0 as usize];
                        println!("      Value {:6}", info.value);
                        println!("      Min   {:6}", info.minimum);
                        println!("      Max   {:6}", info.maximum);
                        if info.fuzz != 0 {
                            println!("      Fuzz  {:6}", info.fuzz);
                        }
                        if info.flat != 0 {
                            println!("      Flat  {:6}", info.flat);
                        }
                        if info.resolution != 0 {
                            println!("      Resolution {:6}", info.resolution);
                        }
                    }
                }
            }
            EventType::LED => {
                if let Some(leds) = device.supported_leds() {
                    for led in leds.iter() {
                        println!("    Event code {} ({:?})", led.0, led);
                    }
                }
            }
            _ => {}
        }
    }

    println!("Properties:");
    for prop in device.properties().iter() {
        println!("  Property type {} ({:?})", prop.0, prop);
    }

    Ok(())
}

/// One line of `events --json` output.
#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum EventRecord {
    Event {
        sec: u64,
        usec: u32,
        #[serde(rename = "type")]
        event_type: u16,
        type_name: &'static str,
        code: u16,
        code_name: String,
        value: i32,
    },
    /// The kernel dropped events; what follows until `resynced` is synthetic
    Dropped { sec: u64, usec: u32 },
    /// A key whose state changed while events were dropped
    Sync { code: u16, code_name: String, value: i32 },
    Resynced,
}

fn cmd_events(path: &Path, grab: bool, json: bool) -> miette::Result<()> {
    let mut device = open(path)?;
    let mut keys = device.get_key_state().into_diagnostic()?;

    if grab {
        device.grab().into_diagnostic()?;
        tracing::info!("Grabbed {}", path.display());
    }

    if !json {
        println!(
            "Input device name: \"{}\"",
            device.name().unwrap_or("Unknown")
        );
        println!("Testing ... (interrupt to exit)");
    }

    let mut dropping = false;
    loop {
        let events: Vec<InputEvent> = device.fetch_events().into_diagnostic()?.collect();

        for event in events {
            let is_syn = event.event_type() == EventType::SYNCHRONIZATION;

            if dropping {
                if is_syn && event.code() == Synchronization::SYN_REPORT.0 {
                    let current = device.get_key_state().into_diagnostic()?;
                    print_resync(&keys, &current, json)?;
                    keys = current;
                    dropping = false;
                }
                continue;
            }

            if is_syn && event.code() == Synchronization::SYN_DROPPED.0 {
                let (sec, usec) = timestamp(&event);
                if json {
                    print_json(&EventRecord::Dropped { sec, usec })?;
                } else {
                    println!(
                        "Event: time {}.{:06}, ++++++++++++++++++++ SYN_DROPPED, re-syncing ++++++++++++++++++++",
                        sec, usec
                    );
                }
                dropping = true;
                continue;
            }

            if let InputEventKind::Key(key) = event.kind() {
                match event.value() {
                    KEY_PRESSED => {
                        keys.insert(key);
                    }
                    KEY_RELEASED => {
                        keys.remove(key);
                    }
                    _ => {}
                }
            }

            print_event(&event, json)?;
        }
    }
}

fn cmd_config() -> miette::Result<()> {
    let config = tapmod_config::Config::default();
    config.validate()?;

    println!("Key mappings (first match wins):");
    for mapping in &config.mappings {
        println!("  {}", mapping);
    }

    println!("\nDual-function keys:");
    for key in &config.dual_function_keys {
        println!("  {}", key);
    }

    println!("\nVirtual device name suffix: \"{}\"", config.virtual_device_suffix);
    println!("Startup delay: {}ms", config.startup_delay.as_millis());

    Ok(())
}

fn open(path: &Path) -> miette::Result<RawDevice> {
    RawDevice::open(path)
        .into_diagnostic()
        .map_err(|e| e.wrap_err(format!("Failed to open {}", path.display())))
}

fn is_keyboard(device: &RawDevice) -> bool {
    device.supported_events().contains(EventType::KEY)
        && device
            .supported_keys()
            .map(|keys| keys.contains(Key::KEY_A))
            .unwrap_or(false)
}

/// `/dev/input/event12` sorts after `event2`
fn event_number(path: &Path) -> u32 {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.strip_prefix("event"))
        .and_then(|n| n.parse().ok())
        .unwrap_or(u32::MAX)
}

fn print_event(event: &InputEvent, json: bool) -> miette::Result<()> {
    let (sec, usec) = timestamp(event);

    if json {
        return print_json(&EventRecord::Event {
            sec,
            usec,
            event_type: event.event_type().0,
            type_name: type_name(event.event_type()),
            code: event.code(),
            code_name: code_name(event),
            value: event.value(),
        });
    }

    if event.event_type() == EventType::SYNCHRONIZATION {
        println!(
            "Event: time {}.{:06}, -------------- {} ------------",
            sec,
            usec,
            code_name(event)
        );
    } else {
        println!(
            "Event: time {}.{:06}, type {} ({}), code {} ({}), value {}",
            sec,
            usec,
            event.event_type().0,
            type_name(event.event_type()),
            event.code(),
            code_name(event),
            event.value()
        );
    }
    Ok(())
}

fn print_resync(
    before: &AttributeSet<Key>,
    after: &AttributeSet<Key>,
    json: bool,
) -> miette::Result<()> {
    for (key, value) in key_state_changes(before, after) {
        if json {
            print_json(&EventRecord::Sync {
                code: key.code(),
                code_name: format!("{:?}", key),
                value,
            })?;
        } else {
            println!(
                "SYNC: type 1 (EV_KEY), code {} ({:?}), value {}",
                key.code(),
                key,
                value
            );
        }
    }

    if json {
        print_json(&EventRecord::Resynced)
    } else {
        println!("++++++++++++++++++++ re-synced ++++++++++++++++++++");
        Ok(())
    }
}

fn print_json(record: &EventRecord) -> miette::Result<()> {
    println!("{}", serde_json::to_string(record).into_diagnostic()?);
    Ok(())
}

fn timestamp(event: &InputEvent) -> (u64, u32) {
    split_time(event.timestamp())
}

fn split_time(time: SystemTime) -> (u64, u32) {
    time.duration_since(UNIX_EPOCH)
        .map(|d| (d.as_secs(), d.subsec_micros()))
        .unwrap_or((0, 0))
}

fn type_name(event_type: EventType) -> &'static str {
    match event_type {
        EventType::SYNCHRONIZATION => "EV_SYN",
        EventType::KEY => "EV_KEY",
        EventType::RELATIVE => "EV_REL",
        EventType::ABSOLUTE => "EV_ABS",
        EventType::MISC => "EV_MSC",
        EventType::SWITCH => "EV_SW",
        EventType::LED => "EV_LED",
        EventType::SOUND => "EV_SND",
        EventType::REPEAT => "EV_REP",
        EventType::FORCEFEEDBACK => "EV_FF",
        EventType::POWER => "EV_PWR",
        EventType::FORCEFEEDBACKSTATUS => "EV_FF_STATUS",
        _ => "?",
    }
}

fn code_name(event: &InputEvent) -> String {
    match event.kind() {
        InputEventKind::Synchronization(code) => format!("{:?}", code),
        InputEventKind::Key(key) => format!("{:?}", key),
        InputEventKind::RelAxis(axis) => format!("{:?}", axis),
        InputEventKind::AbsAxis(axis) => format!("{:?}", axis),
        InputEventKind::Misc(misc) => format!("{:?}", misc),
        InputEventKind::Switch(switch) => format!("{:?}", switch),
        InputEventKind::Led(led) => format!("{:?}", led),
        InputEventKind::Sound(sound) => format!("{:?}", sound),
        _ => "?".to_string(),
    }
}
