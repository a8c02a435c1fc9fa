//! Dual-function (tap/hold) keys
//!
//! A dual-function key is a physical key that produces its `tap` key when
//! tapped and its `hold` key when held. A key-down alone never says which
//! gesture is coming, so every dual-function key runs a small state machine.
//!
//! ## States
//!
//! ```text
//!  ┌───────┐   press    ┌───────────────────────┐
//!  │ IDLE  │ ─────────► │ PENDING { pressed_at } │
//!  └───────┘            └──────────┬────────────┘
//!      ▲                           │
//!      │  release before threshold │  threshold elapsed, or
//!      │  emit tap down + tap up   │  another key pressed (chord)
//!      ├───────────────────────────┤  emit hold down
//!      │                           ▼
//!      │                      ┌────────┐
//!      └───────────────────── │  HELD  │
//!         release             └────────┘
//!         emit hold up
//! ```
//!
//! A tap is only reported once the key is released: the press/release pair is
//! emitted back to back at release time.
//!
//! ## Resolution rules
//!
//! 1. **Timeout**: a pending key resolves to held once `hold_threshold` has
//!    elapsed since the press. [`DualFunctionKeys::next_deadline`] tells the
//!    event loop when to wake up for this; [`DualFunctionKeys::expire`] does the
//!    transition. Expiry is also checked lazily before every event.
//! 2. **Chord**: any other key-down while a key is pending resolves it to held
//!    immediately, before the other key is forwarded.
//! 3. **Repeat**: autorepeat of a pending key resolves nothing and emits nothing.
//!    Autorepeat of a held key repeats the `hold` key.
//! 4. **Two dual-function keys**: when B is pressed while A is down, A resolves
//!    by the chord rule and B, seeing A down, is resolved held straight away.
//!
//! All timestamps are monotonic [`Instant`]s marking when the event arrived.

use std::time::Instant;

use evdev::{InputEvent, Key};
use tapmod_config::{key_name, DualFunctionKey};

use crate::remapper::{event_value, key_event};

/// Runtime state of one dual-function key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DualState {
    /// Key is up
    Idle,
    /// Key is down and it is not yet known whether this is a tap or a hold
    Pending { pressed_at: Instant },
    /// Key is down and acting as its `hold` key (which has been pressed)
    Held,
}

/// Whether [`DualFunctionKeys::process`] consumed the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    /// The event belonged to a dual-function key; its output (if any) was produced
    Consumed,
    /// Not a dual-function key; the caller must forward the event itself
    NotDualFunction,
}

#[derive(Debug, Clone)]
struct DualKey {
    def: DualFunctionKey,
    state: DualState,
}

impl DualKey {
    fn is_down(&self) -> bool {
        self.state != DualState::Idle
    }

    fn deadline(&self) -> Option<Instant> {
        match self.state {
            DualState::Pending { pressed_at } => Some(pressed_at + self.def.hold_threshold),
            _ => None,
        }
    }

    fn resolve_hold(&mut self, reason: &str, out: &mut Vec<InputEvent>) {
        tracing::debug!(
            "{} resolved as hold ({}) by {}",
            key_name(self.def.key),
            key_name(self.def.hold),
            reason
        );
        out.push(key_event(self.def.hold, event_value::PRESS));
        self.state = DualState::Held;
    }
}

/// State machines for every configured dual-function key.
#[derive(Debug, Clone)]
pub struct DualFunctionKeys {
    keys: Vec<DualKey>,
}

impl DualFunctionKeys {
    /// All keys start idle.
    pub fn new(defs: &[DualFunctionKey]) -> Self {
        Self {
            keys: defs
                .iter()
                .map(|def| DualKey {
                    def: *def,
                    state: DualState::Idle,
                })
                .collect(),
        }
    }

    /// Current state of a dual-function key, `None` if it is not configured.
    pub fn state(&self, key: Key) -> Option<DualState> {
        self.keys.iter().find(|k| k.def.key == key).map(|k| k.state)
    }

    /// Whether `key` is a configured dual-function key.
    pub fn is_dual_function(&self, key: Key) -> bool {
        self.state(key).is_some()
    }

    /// Drop the gesture of `key` without resolving it.
    ///
    /// Used when the key's real state comes from a resync. A held key releases
    /// its `hold` key; a pending key emits nothing, as its press never did.
    pub fn cancel(&mut self, key: Key, out: &mut Vec<InputEvent>) {
        let Some(dual) = self.keys.iter_mut().find(|k| k.def.key == key) else {
            return;
        };

        match dual.state {
            DualState::Idle => {}
            DualState::Pending { .. } => {
                tracing::debug!("{} gesture discarded", key_name(key));
            }
            DualState::Held => {
                out.push(key_event(dual.def.hold, event_value::RELEASE));
            }
        }
        dual.state = DualState::Idle;
    }

    /// Earliest instant at which a pending key will resolve to held.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.keys.iter().filter_map(DualKey::deadline).min()
    }

    /// Resolve every pending key whose threshold has elapsed by `now`.
    pub fn expire(&mut self, now: Instant, out: &mut Vec<InputEvent>) {
        for index in self.pending_in_press_order() {
            let key = &mut self.keys[index];
            if key.deadline().is_some_and(|deadline| now >= deadline) {
                key.resolve_hold("timeout", out);
            }
        }
    }

    /// Feed one key event through the state machines.
    ///
    /// Emitted events are appended to `out`. For keys that are not
    /// dual-function, a press still resolves pending keys (chord rule) and the
    /// caller is left to forward the event after whatever was appended.
    pub fn process(
        &mut self,
        key: Key,
        value: i32,
        now: Instant,
        out: &mut Vec<InputEvent>,
    ) -> Handled {
        self.expire(now, out);

        let Some(index) = self.keys.iter().position(|k| k.def.key == key) else {
            if value == event_value::PRESS {
                self.resolve_chord(None, key, out);
            }
            return Handled::NotDualFunction;
        };

        match value {
            event_value::PRESS => self.press(index, now, out),
            event_value::RELEASE => self.release(index, out),
            event_value::REPEAT => {
                let dual = &self.keys[index];
                if dual.state == DualState::Held {
                    out.push(key_event(dual.def.hold, event_value::REPEAT));
                }
            }
            other => {
                tracing::trace!("Ignoring key value {} for {}", other, key_name(key));
            }
        }

        Handled::Consumed
    }

    fn press(&mut self, index: usize, now: Instant, out: &mut Vec<InputEvent>) {
        // A press while already down means a release was lost (e.g. across a
        // resync). Close the old gesture so the hold key stays paired.
        let dual = &mut self.keys[index];
        match dual.state {
            DualState::Idle => {}
            DualState::Pending { .. } => {
                tracing::debug!("{} pressed while pending, restarting", key_name(dual.def.key));
                dual.state = DualState::Idle;
            }
            DualState::Held => {
                tracing::debug!("{} pressed while held, releasing hold first", key_name(dual.def.key));
                out.push(key_event(dual.def.hold, event_value::RELEASE));
                dual.state = DualState::Idle;
            }
        }

        let pressed = self.keys[index].def.key;
        self.resolve_chord(Some(index), pressed, out);

        let other_down = self
            .keys
            .iter()
            .enumerate()
            .any(|(i, k)| i != index && k.is_down());

        let dual = &mut self.keys[index];
        if other_down {
            dual.resolve_hold("another dual-function key being down", out);
        } else {
            dual.state = DualState::Pending { pressed_at: now };
        }
    }

    fn release(&mut self, index: usize, out: &mut Vec<InputEvent>) {
        let dual = &mut self.keys[index];
        match dual.state {
            DualState::Idle => {
                // Pressed before we grabbed the device, nothing was emitted
                tracing::trace!("Release of idle key {}", key_name(dual.def.key));
            }
            DualState::Pending { .. } => {
                tracing::debug!(
                    "{} resolved as tap ({})",
                    key_name(dual.def.key),
                    key_name(dual.def.tap)
                );
                out.push(key_event(dual.def.tap, event_value::PRESS));
                out.push(key_event(dual.def.tap, event_value::RELEASE));
            }
            DualState::Held => {
                out.push(key_event(dual.def.hold, event_value::RELEASE));
            }
        }
        dual.state = DualState::Idle;
    }

    /// Chord rule: every pending key other than `skip` resolves to held.
    fn resolve_chord(&mut self, skip: Option<usize>, pressed: Key, out: &mut Vec<InputEvent>) {
        let reason = format!("chord with {}", key_name(pressed));
        for index in self.pending_in_press_order() {
            if Some(index) != skip {
                self.keys[index].resolve_hold(&reason, out);
            }
        }
    }

    fn pending_in_press_order(&self) -> Vec<usize> {
        let mut pending: Vec<(Instant, usize)> = self
            .keys
            .iter()
            .enumerate()
            .filter_map(|(i, k)| match k.state {
                DualState::Pending { pressed_at } => Some((pressed_at, i)),
                _ => None,
            })
            .collect();
        pending.sort();
        pending.into_iter().map(|(_, i)| i).collect()
    }
}
