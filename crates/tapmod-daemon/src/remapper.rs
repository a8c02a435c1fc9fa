//! Key remapping logic
//!
//! [`Remapper`] combines the static [`TranslationTable`] with the
//! dual-function state machines from [`crate::dual`]. It is pure: it takes an
//! event plus the time it was read and returns the key events to emit.
//!
//! Routing for a key event:
//!
//! 1. Pending dual-function keys whose threshold has passed are resolved first.
//! 2. A dual-function key goes through its state machine and nothing else.
//! 3. Any other key press resolves pending dual-function keys (chord rule),
//!    then the key goes through the translation table.
//!
//! Events emitted by a dual-function key (`tap` / `hold`) are final and are
//! not translated again.
//!
//! Each physical key remembers the code it was pressed as, so its release and
//! repeats follow that code. Everything then passes through [`OutputKeys`],
//! which keeps each output code strictly alternating between down and up even
//! when two physical keys share it.

use std::collections::HashMap;
use std::time::Instant;

use evdev::{EventType, InputEvent, Key};
use tapmod_config::{key_name, Config, KeyMapping};

use crate::dual::{DualFunctionKeys, Handled};

/// Event value constants for key events.
pub mod event_value {
    /// Key release event value
    pub const RELEASE: i32 = 0;
    /// Key press event value
    pub const PRESS: i32 = 1;
    /// Key repeat event value (autorepeat)
    pub const REPEAT: i32 = 2;
}

/// Build an `EV_KEY` event.
pub fn key_event(key: Key, value: i32) -> InputEvent {
    InputEvent::new(EventType::KEY, key.code(), value)
}

/// Ordered 1:1 key translation.
///
/// Entries are scanned in declaration order and the first matching `from`
/// wins, so a later entry for the same key is shadowed. Keys without an entry
/// translate to themselves.
#[derive(Debug, Clone, Default)]
pub struct TranslationTable {
    entries: Vec<KeyMapping>,
}

impl TranslationTable {
    pub fn new(entries: &[KeyMapping]) -> Self {
        Self {
            entries: entries.to_vec(),
        }
    }

    pub fn translate(&self, key: Key) -> Key {
        self.entries
            .iter()
            .find(|mapping| mapping.from == key)
            .map_or(key, |mapping| mapping.to)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Output codes currently held down on the virtual device.
///
/// Several physical keys can produce the same output code (a mapping and a
/// `hold` key, say). Only the first holder's press and the last holder's
/// release reach the device, so every code alternates down and up.
#[derive(Debug, Clone, Default)]
pub struct OutputKeys {
    holders: HashMap<Key, usize>,
}

impl OutputKeys {
    /// Pass `event` to `out` if it changes what the device shows.
    pub fn apply(&mut self, event: InputEvent, out: &mut Vec<InputEvent>) {
        let key = Key::new(event.code());

        match event.value() {
            event_value::PRESS => {
                let holders = self.holders.entry(key).or_insert(0);
                *holders += 1;
                if *holders == 1 {
                    out.push(event);
                } else {
                    tracing::trace!("{} already down ({} holders)", key_name(key), holders);
                }
            }
            event_value::RELEASE => match self.holders.get_mut(&key) {
                Some(holders) if *holders > 1 => {
                    *holders -= 1;
                    tracing::trace!("{} still held ({} holders)", key_name(key), holders);
                }
                Some(_) => {
                    self.holders.remove(&key);
                    out.push(event);
                }
                None => {
                    tracing::trace!("Dropping release of {}, it is not down", key_name(key));
                }
            },
            _ => {
                if self.holders.contains_key(&key) {
                    out.push(event);
                }
            }
        }
    }
}

/// Remapper handles translating input events according to the configuration
#[derive(Debug, Clone)]
pub struct Remapper {
    table: TranslationTable,
    dual: DualFunctionKeys,
    /// Output code each physical key pressed outside a dual-function gesture holds
    pressed: HashMap<Key, Key>,
    output: OutputKeys,
}

impl Remapper {
    /// Create a new remapper from the configuration
    pub fn new(config: &Config) -> Self {
        let table = TranslationTable::new(&config.mappings);
        let dual = DualFunctionKeys::new(&config.dual_function_keys);

        tracing::debug!(
            "Remapper ready: {} mapping(s), {} dual-function key(s)",
            table.len(),
            config.dual_function_keys.len()
        );

        Self {
            table,
            dual,
            pressed: HashMap::new(),
            output: OutputKeys::default(),
        }
    }

    /// Process an input event read at `now`, returning the event(s) to emit.
    ///
    /// Non-key events are returned unchanged. Key event values are preserved
    /// through translation:
    /// - `0` = key release
    /// - `1` = key press
    /// - `2` = key repeat (autorepeat)
    ///
    /// The result may be empty (a dual-function press is held back until it
    /// resolves) or hold several events (a resolved hold followed by the key
    /// that triggered it, or a tap's press/release pair).
    pub fn process(&mut self, event: InputEvent, now: Instant) -> Vec<InputEvent> {
        // Only process key events
        if event.event_type() != EventType::KEY {
            return vec![event];
        }

        let key = Key::new(event.code());
        let value = event.value();
        let mut produced = Vec::new();

        if self.dual.is_dual_function(key) && self.pressed.contains_key(&key) {
            // Went down during a resync and holds its own code, outside the
            // state machine
            self.dual.expire(now, &mut produced);
            self.follow_pressed(key, value, &mut produced);
            if value == event_value::PRESS {
                self.dual.process(key, value, now, &mut produced);
            }
            return self.settle(produced);
        }

        match self.dual.process(key, value, now, &mut produced) {
            Handled::Consumed => {}
            Handled::NotDualFunction => {
                self.follow_pressed(key, value, &mut produced);
                if value == event_value::PRESS {
                    let to = self.table.translate(key);
                    self.pressed.insert(key, to);
                    produced.push(key_event(to, value));
                }
            }
        }

        self.settle(produced)
    }

    /// Apply one key correction from a resync batch.
    ///
    /// The key is neither translated nor run through the dual-function timing:
    /// it describes state the device already has. A release frees whatever
    /// output code the key was holding, so nothing is left down.
    pub fn resync(&mut self, event: InputEvent) -> Vec<InputEvent> {
        let key = Key::new(event.code());
        let mut produced = Vec::new();

        self.dual.cancel(key, &mut produced);

        match event.value() {
            event_value::PRESS => {
                self.release_pressed(key, &mut produced);
                self.pressed.insert(key, key);
                produced.push(key_event(key, event_value::PRESS));
            }
            event_value::RELEASE => self.release_pressed(key, &mut produced),
            other => {
                tracing::trace!("Ignoring resync value {} for {}", other, key_name(key));
            }
        }

        self.settle(produced)
    }

    /// Resolve dual-function keys whose hold threshold elapsed by `now`.
    pub fn expire(&mut self, now: Instant) -> Vec<InputEvent> {
        let mut produced = Vec::new();
        self.dual.expire(now, &mut produced);
        self.settle(produced)
    }

    /// When the event loop must wake up next even if no input arrives.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.dual.next_deadline()
    }

    /// The dual-function key states, for inspection.
    pub fn dual_function_keys(&self) -> &DualFunctionKeys {
        &self.dual
    }

    fn release_pressed(&mut self, key: Key, produced: &mut Vec<InputEvent>) {
        if let Some(to) = self.pressed.remove(&key) {
            produced.push(key_event(to, event_value::RELEASE));
        }
    }

    /// Carry `value` over to the code `key` was pressed as.
    ///
    /// A press of a key that is still down means its release was lost, so the
    /// old code is released first. Keys pressed before the grab hold nothing.
    fn follow_pressed(&mut self, key: Key, value: i32, produced: &mut Vec<InputEvent>) {
        match value {
            event_value::PRESS | event_value::RELEASE => self.release_pressed(key, produced),
            _ => {
                if let Some(to) = self.pressed.get(&key) {
                    produced.push(key_event(*to, value));
                }
            }
        }
    }

    fn settle(&mut self, produced: Vec<InputEvent>) -> Vec<InputEvent> {
        let mut out = Vec::with_capacity(produced.len());
        for event in produced {
            self.output.apply(event, &mut out);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tapmod_config::DualFunctionKey;

    use super::*;

    const KEY_RELEASE: i32 = 0;
    const KEY_PRESS: i32 = 1;
    const KEY_REPEAT: i32 = 2;

    fn remapper_with(mappings: Vec<KeyMapping>, dual: Vec<DualFunctionKey>) -> Remapper {
        let config = Config {
            mappings,
            dual_function_keys: dual,
            ..Config::default()
        };
        Remapper::new(&config)
    }

    fn pairs(events: &[InputEvent]) -> Vec<(Key, i32)> {
        events.iter().map(|e| (Key::new(e.code()), e.value())).collect()
    }

    fn caps_dual() -> DualFunctionKey {
        DualFunctionKey::new(
            Key::KEY_CAPSLOCK,
            Key::KEY_ESC,
            Key::KEY_LEFTMETA,
            Duration::from_millis(300),
        )
    }

    #[test]
    fn test_translate_identity_for_unmapped_keys() {
        let table = TranslationTable::new(&[KeyMapping::new(Key::KEY_A, Key::KEY_B)]);

        for code in 1..256u16 {
            let key = Key::new(code);
            if key != Key::KEY_A {
                assert_eq!(table.translate(key), key, "Unmapped code {} must not change", code);
            }
        }
    }

    #[test]
    fn test_translate_declared_mappings() {
        let config = Config::default();
        let table = TranslationTable::new(&config.mappings);

        for mapping in &config.mappings {
            assert_eq!(table.translate(mapping.from), mapping.to);
        }
    }

    #[test]
    fn test_translate_first_match_wins() {
        let table = TranslationTable::new(&[
            KeyMapping::new(Key::KEY_A, Key::KEY_B),
            KeyMapping::new(Key::KEY_A, Key::KEY_C),
        ]);
        assert_eq!(table.translate(Key::KEY_A), Key::KEY_B);
    }

    #[test]
    fn test_translate_is_not_transitive() {
        // LeftMeta -> LeftAlt and LeftAlt -> LeftCtrl must not chain
        let table = TranslationTable::new(&Config::default().mappings);
        assert_eq!(table.translate(Key::KEY_LEFTMETA), Key::KEY_LEFTALT);
        assert_eq!(table.translate(Key::KEY_LEFTALT), Key::KEY_LEFTCTRL);
    }

    #[test]
    fn test_remap_press_event() {
        let mut remapper = remapper_with(
            vec![KeyMapping::new(Key::KEY_LEFTCTRL, Key::KEY_LEFTMETA)],
            vec![],
        );

        let press_event = key_event(Key::KEY_LEFTCTRL, KEY_PRESS);
        let result = remapper.process(press_event, Instant::now());

        assert_eq!(result.len(), 1);
        assert_eq!(result[0].code(), Key::KEY_LEFTMETA.code(), "LeftCtrl should become LeftMeta");
        assert_eq!(result[0].value(), KEY_PRESS, "Press event value (1) should be preserved");
        assert_eq!(result[0].event_type(), EventType::KEY, "Event type should remain KEY");
    }

    #[test]
    fn test_passthrough_unmapped_key() {
        let mut remapper = remapper_with(
            vec![KeyMapping::new(Key::KEY_LEFTCTRL, Key::KEY_LEFTMETA)],
            vec![],
        );
        let now = Instant::now();

        let result = remapper.process(key_event(Key::KEY_A, KEY_PRESS), now);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].code(), Key::KEY_A.code(), "Unmapped key should pass through unchanged");
        assert_eq!(result[0].value(), KEY_PRESS);

        let result = remapper.process(key_event(Key::KEY_A, KEY_RELEASE), now);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].code(), Key::KEY_A.code());
        assert_eq!(result[0].value(), KEY_RELEASE);
    }

    #[test]
    fn test_event_value_preservation() {
        let mut remapper = remapper_with(vec![KeyMapping::new(Key::KEY_A, Key::KEY_B)], vec![]);
        let now = Instant::now();

        for value in [KEY_PRESS, KEY_REPEAT, KEY_RELEASE] {
            let result = remapper.process(key_event(Key::KEY_A, value), now);
            assert_eq!(result.len(), 1);
            assert_eq!(result[0].code(), Key::KEY_B.code(), "Key should be remapped from A to B");
            assert_eq!(result[0].value(), value, "Event value {} should be preserved", value);
        }
    }

    #[test]
    fn test_non_key_events_pass_through() {
        let mut remapper = remapper_with(vec![KeyMapping::new(Key::KEY_A, Key::KEY_B)], vec![]);

        // MSC_SCAN carrying a scancode that happens to equal KEY_A's code
        let msc = InputEvent::new(EventType::MISC, 4, Key::KEY_A.code() as i32);
        let result = remapper.process(msc, Instant::now());

        assert_eq!(result.len(), 1);
        assert_eq!(result[0].event_type(), EventType::MISC);
        assert_eq!(result[0].code(), 4);
        assert_eq!(result[0].value(), Key::KEY_A.code() as i32);
    }

    #[test]
    fn test_dual_function_key_bypasses_table() {
        // A mapping for CapsLock is ignored once CapsLock is dual-function,
        // and the hold key is emitted untranslated even if it has a mapping
        let mut remapper = remapper_with(
            vec![
                KeyMapping::new(Key::KEY_CAPSLOCK, Key::KEY_A),
                KeyMapping::new(Key::KEY_LEFTMETA, Key::KEY_LEFTALT),
            ],
            vec![caps_dual()],
        );
        let t0 = Instant::now();

        assert!(remapper.process(key_event(Key::KEY_CAPSLOCK, KEY_PRESS), t0).is_empty());
        let out = remapper.expire(t0 + Duration::from_millis(300));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].code(), Key::KEY_LEFTMETA.code());
        assert_eq!(out[0].value(), KEY_PRESS);
    }

    #[test]
    fn test_chord_emits_hold_then_translated_key() {
        let mut remapper = remapper_with(
            vec![KeyMapping::new(Key::KEY_J, Key::KEY_K)],
            vec![caps_dual()],
        );
        let t0 = Instant::now();

        remapper.process(key_event(Key::KEY_CAPSLOCK, KEY_PRESS), t0);
        let out = remapper.process(key_event(Key::KEY_J, KEY_PRESS), t0 + Duration::from_millis(10));

        let pairs: Vec<_> = out.iter().map(|e| (e.code(), e.value())).collect();
        assert_eq!(
            pairs,
            vec![(Key::KEY_LEFTMETA.code(), KEY_PRESS), (Key::KEY_K.code(), KEY_PRESS)]
        );
        assert_eq!(remapper.next_deadline(), None);
    }

    #[test]
    fn test_expired_hold_precedes_late_event() {
        // The timer did not fire before the next event arrived
        let mut remapper = remapper_with(vec![], vec![caps_dual()]);
        let t0 = Instant::now();

        remapper.process(key_event(Key::KEY_CAPSLOCK, KEY_PRESS), t0);
        let out = remapper.process(key_event(Key::KEY_A, KEY_PRESS), t0 + Duration::from_millis(350));

        assert_eq!(
            pairs(&out),
            vec![(Key::KEY_LEFTMETA, KEY_PRESS), (Key::KEY_A, KEY_PRESS)]
        );
    }

    #[test]
    fn test_shared_output_code_stays_paired() {
        // LeftCtrl is mapped to LeftMeta, which is also CapsLock's hold key
        let mut remapper = Remapper::new(&Config::default());
        let t0 = Instant::now();

        remapper.process(key_event(Key::KEY_CAPSLOCK, KEY_PRESS), t0);
        assert_eq!(
            pairs(&remapper.expire(t0 + Duration::from_millis(300))),
            vec![(Key::KEY_LEFTMETA, KEY_PRESS)]
        );

        let at = |ms| t0 + Duration::from_millis(ms);
        assert!(remapper.process(key_event(Key::KEY_LEFTCTRL, KEY_PRESS), at(400)).is_empty());
        assert_eq!(
            pairs(&remapper.process(key_event(Key::KEY_LEFTCTRL, KEY_REPEAT), at(420))),
            vec![(Key::KEY_LEFTMETA, KEY_REPEAT)]
        );
        assert!(
            remapper.process(key_event(Key::KEY_LEFTCTRL, KEY_RELEASE), at(450)).is_empty(),
            "LeftMeta is still held by CapsLock"
        );
        assert_eq!(
            pairs(&remapper.process(key_event(Key::KEY_CAPSLOCK, KEY_RELEASE), at(500))),
            vec![(Key::KEY_LEFTMETA, KEY_RELEASE)]
        );
    }

    #[test]
    fn test_release_of_key_pressed_before_grab_emits_nothing() {
        let mut remapper = Remapper::new(&Config::default());
        let now = Instant::now();

        assert!(remapper.process(key_event(Key::KEY_A, KEY_RELEASE), now).is_empty());
        assert!(remapper.process(key_event(Key::KEY_A, KEY_REPEAT), now).is_empty());
    }

    #[test]
    fn test_release_follows_code_key_was_pressed_as() {
        let mut remapper = remapper_with(vec![KeyMapping::new(Key::KEY_J, Key::KEY_K)], vec![]);
        let now = Instant::now();

        remapper.process(key_event(Key::KEY_J, KEY_PRESS), now);
        // Lost release: the second press closes the first one
        assert_eq!(
            pairs(&remapper.process(key_event(Key::KEY_J, KEY_PRESS), now)),
            vec![(Key::KEY_K, KEY_RELEASE), (Key::KEY_K, KEY_PRESS)]
        );
        assert_eq!(
            pairs(&remapper.process(key_event(Key::KEY_J, KEY_RELEASE), now)),
            vec![(Key::KEY_K, KEY_RELEASE)]
        );
    }

    #[test]
    fn test_resync_release_frees_translated_code() {
        let mut remapper = remapper_with(vec![KeyMapping::new(Key::KEY_J, Key::KEY_K)], vec![]);
        let now = Instant::now();

        remapper.process(key_event(Key::KEY_J, KEY_PRESS), now);
        assert_eq!(
            pairs(&remapper.resync(key_event(Key::KEY_J, KEY_RELEASE))),
            vec![(Key::KEY_K, KEY_RELEASE)]
        );
        assert!(remapper.process(key_event(Key::KEY_J, KEY_RELEASE), now).is_empty());
    }

    #[test]
    fn test_resync_press_is_untranslated_and_paired_with_real_release() {
        let mut remapper = remapper_with(
            vec![KeyMapping::new(Key::KEY_LEFTMETA, Key::KEY_LEFTALT)],
            vec![caps_dual()],
        );
        let t0 = Instant::now();

        assert_eq!(
            pairs(&remapper.resync(key_event(Key::KEY_CAPSLOCK, KEY_PRESS))),
            vec![(Key::KEY_CAPSLOCK, KEY_PRESS)]
        );
        assert_eq!(
            pairs(&remapper.resync(key_event(Key::KEY_LEFTMETA, KEY_PRESS))),
            vec![(Key::KEY_LEFTMETA, KEY_PRESS)]
        );
        assert_eq!(remapper.next_deadline(), None, "No gesture starts from a resync");

        let at = |ms| t0 + Duration::from_millis(ms);
        assert_eq!(
            pairs(&remapper.process(key_event(Key::KEY_CAPSLOCK, KEY_RELEASE), at(10))),
            vec![(Key::KEY_CAPSLOCK, KEY_RELEASE)]
        );
        assert_eq!(
            pairs(&remapper.process(key_event(Key::KEY_LEFTMETA, KEY_RELEASE), at(20))),
            vec![(Key::KEY_LEFTMETA, KEY_RELEASE)]
        );

        // The next gesture is a normal tap again
        remapper.process(key_event(Key::KEY_CAPSLOCK, KEY_PRESS), at(30));
        assert_eq!(
            pairs(&remapper.process(key_event(Key::KEY_CAPSLOCK, KEY_RELEASE), at(60))),
            vec![(Key::KEY_ESC, KEY_PRESS), (Key::KEY_ESC, KEY_RELEASE)]
        );
    }

    #[test]
    fn test_resync_release_of_held_dual_key_releases_hold() {
        let mut remapper = remapper_with(vec![], vec![caps_dual()]);
        let t0 = Instant::now();

        remapper.process(key_event(Key::KEY_CAPSLOCK, KEY_PRESS), t0);
        remapper.expire(t0 + Duration::from_millis(300));

        assert_eq!(
            pairs(&remapper.resync(key_event(Key::KEY_CAPSLOCK, KEY_RELEASE))),
            vec![(Key::KEY_LEFTMETA, KEY_RELEASE)]
        );
        assert_eq!(
            remapper.dual_function_keys().state(Key::KEY_CAPSLOCK),
            Some(crate::dual::DualState::Idle)
        );
    }
}
