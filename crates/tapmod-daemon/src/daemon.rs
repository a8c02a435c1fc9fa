//! The event loop
//!
//! [`Daemon`] pulls events from the source, runs key events through the
//! [`Remapper`] and writes the result to the sink. It waits on three things at
//! once, and when several are ready it takes them in this order:
//!
//! - the shutdown signal,
//! - the next event from the source, so input that arrived before a hold
//!   deadline is judged against the time it arrived,
//! - the earliest hold deadline of a pending dual-function key, so a held key
//!   resolves even when no further input arrives.
//!
//! Key events are written one per frame. Other events are queued into the
//! current frame and go out with the next key, or at the source's
//! `SYN_REPORT`.
//!
//! After a buffer overflow the source replays the device's real key state.
//! Those synthetic events go through [`Remapper::resync`]: they are not
//! translated and never start a dual-function gesture, since they describe
//! state rather than new key presses.

use std::future::Future;
use std::time::Instant;

use evdev::{EventType, InputEvent, Key, Synchronization};
use tapmod_config::{key_name, Config};

use crate::device::EventSource;
use crate::dual::DualState;
use crate::error::DaemonError;
use crate::injector::EventSink;
use crate::remapper::Remapper;
use crate::sync::SourceEvent;

pub struct Daemon<S, K> {
    source: S,
    sink: K,
    remapper: Remapper,
    /// Synthetic events applied so far in the current resync batch
    resync_batch: Option<usize>,
}

impl<S: EventSource, K: EventSink> Daemon<S, K> {
    pub fn new(source: S, sink: K, config: &Config) -> Self {
        Self {
            source,
            sink,
            remapper: Remapper::new(config),
            resync_batch: None,
        }
    }

    /// Run until `shutdown` completes or a fatal error occurs.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<(), DaemonError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        tracing::info!("Remapping started");

        loop {
            let deadline = self.remapper.next_deadline();

            tokio::select! {
                biased;

                () = &mut shutdown => {
                    tracing::info!("Shutting down...");
                    return Ok(());
                }

                event = self.source.next_event() => {
                    self.handle(event?)?;
                }

                deadline = wait_until(deadline) => {
                    // The timer may wake a little late, never early
                    let events = self.remapper.expire(now().max(deadline));
                    self.emit_all(&events)?;
                }
            }
        }
    }

    fn handle(&mut self, event: SourceEvent) -> Result<(), DaemonError> {
        match event {
            SourceEvent::Event(event) => {
                if event.event_type() == EventType::SYNCHRONIZATION {
                    if event.code() == Synchronization::SYN_REPORT.0 {
                        self.sink.sync()?;
                    }
                    return Ok(());
                }

                let at = self.source.event_time(&event, now());
                let events = self.remapper.process(event, at);
                self.emit_all(&events)?;
            }
            SourceEvent::OutOfSync => {
                tracing::warn!("Input events were dropped by the kernel, resynchronizing");
                self.resync_batch = Some(0);
            }
            SourceEvent::Synthetic(event) => {
                let key = Key::new(event.code());

                if let Some(state) = self.remapper.dual_function_keys().state(key) {
                    if state != DualState::Idle {
                        tracing::warn!(
                            "Resync changed dual-function key {} in the middle of a gesture",
                            key_name(key)
                        );
                    }
                }

                tracing::debug!("Resync: {} value {}", key_name(key), event.value());
                let events = self.remapper.resync(event);
                self.emit_all(&events)?;
                if let Some(count) = self.resync_batch.as_mut() {
                    *count += 1;
                }
            }
            SourceEvent::Resynced => {
                let count = self.resync_batch.take().unwrap_or(0);
                tracing::info!("Re-synced with device state ({} key(s) corrected)", count);
            }
        }
        Ok(())
    }

    fn emit_all(&mut self, events: &[InputEvent]) -> Result<(), DaemonError> {
        for event in events {
            if event.event_type() == EventType::KEY {
                tracing::trace!("Emit {} value {}", key_name(Key::new(event.code())), event.value());
                self.sink.emit_key(Key::new(event.code()), event.value())?;
            } else {
                self.sink.forward(*event)?;
            }
        }
        Ok(())
    }

    #[cfg(test)]
    fn sink(&self) -> &K {
        &self.sink
    }
}

/// Monotonic "now", taken from tokio's clock so it can be paused in tests.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// Sleep until `deadline` and return it; never completes without one.
async fn wait_until(deadline: Option<Instant>) -> Instant {
    match deadline {
        Some(deadline) => {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
            deadline
        }
        None => std::future::pending().await,
    }
}
