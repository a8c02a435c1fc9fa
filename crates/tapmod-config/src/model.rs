//! Configuration data model

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use evdev::Key;

use crate::error::ConfigError;

/// Default hold threshold for dual-function keys, in milliseconds.
pub const DEFAULT_HOLD_THRESHOLD_MS: u64 = 300;

/// Root configuration structure.
///
/// Built once at startup and shared by reference; nothing mutates it afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Appended to the source device name to name the virtual device
    pub virtual_device_suffix: String,
    /// Pause before grabbing, so the key that launched the daemon can be released
    pub startup_delay: Duration,
    /// Static 1:1 remaps, scanned in order (first match wins)
    pub mappings: Vec<KeyMapping>,
    /// Keys that act as one key when tapped and another when held
    pub dual_function_keys: Vec<DualFunctionKey>,
}

impl Default for Config {
    fn default() -> Self {
        let threshold = Duration::from_millis(DEFAULT_HOLD_THRESHOLD_MS);

        Self {
            virtual_device_suffix: " (tapmod)".to_string(),
            startup_delay: Duration::from_millis(500),
            mappings: vec![
                KeyMapping::new(Key::KEY_LEFTMETA, Key::KEY_LEFTALT),
                KeyMapping::new(Key::KEY_RIGHTMETA, Key::KEY_RIGHTALT),
                KeyMapping::new(Key::KEY_LEFTALT, Key::KEY_LEFTCTRL),
                KeyMapping::new(Key::KEY_RIGHTALT, Key::KEY_RIGHTCTRL),
                KeyMapping::new(Key::KEY_LEFTCTRL, Key::KEY_LEFTMETA),
                KeyMapping::new(Key::KEY_COMPOSE, Key::KEY_RIGHTMETA),
            ],
            dual_function_keys: vec![
                DualFunctionKey::new(Key::KEY_CAPSLOCK, Key::KEY_ESC, Key::KEY_LEFTMETA, threshold),
                DualFunctionKey::new(Key::KEY_ENTER, Key::KEY_ENTER, Key::KEY_RIGHTMETA, threshold),
            ],
        }
    }
}

impl Config {
    /// Check the configuration for entries the remapper cannot honour.
    ///
    /// Duplicate `from` keys in [`Config::mappings`] are accepted: the first
    /// entry wins and later ones are shadowed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for mapping in &self.mappings {
            if mapping.from == Key::KEY_RESERVED || mapping.to == Key::KEY_RESERVED {
                return Err(ConfigError::ReservedKey {
                    context: format!("mapping {}", mapping),
                });
            }
        }

        let mut seen_mappings = HashSet::new();
        for mapping in &self.mappings {
            if !seen_mappings.insert(mapping.from) {
                tracing::debug!(
                    "Mapping {} is shadowed by an earlier entry for {}",
                    mapping,
                    key_name(mapping.from)
                );
            }
        }

        let mut seen_dual = HashSet::new();
        for dual in &self.dual_function_keys {
            if [dual.key, dual.tap, dual.hold].contains(&Key::KEY_RESERVED) {
                return Err(ConfigError::ReservedKey {
                    context: format!("dual-function key {}", dual),
                });
            }

            if dual.hold_threshold.is_zero() {
                return Err(ConfigError::ZeroThreshold {
                    key: key_name(dual.key),
                });
            }

            if !seen_dual.insert(dual.key) {
                return Err(ConfigError::DuplicateDualFunction {
                    key: key_name(dual.key),
                });
            }
        }

        Ok(())
    }

    /// Every key code the remapper may emit besides pass-through keys.
    ///
    /// The virtual device must advertise these on top of the source device's keys.
    pub fn output_keys(&self) -> impl Iterator<Item = Key> + '_ {
        self.mappings.iter().map(|m| m.to).chain(
            self.dual_function_keys
                .iter()
                .flat_map(|d| [d.tap, d.hold]),
        )
    }
}

/// A single 1:1 remap entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyMapping {
    pub from: Key,
    pub to: Key,
}

impl KeyMapping {
    pub fn new(from: Key, to: Key) -> Self {
        Self { from, to }
    }
}

impl fmt::Display for KeyMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", key_name(self.from), key_name(self.to))
    }
}

/// A physical key with a tap identity and a hold identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DualFunctionKey {
    /// The physical key
    pub key: Key,
    /// Emitted as a press/release pair when the key is tapped
    pub tap: Key,
    /// Held down for as long as the physical key when it acts as a modifier
    pub hold: Key,
    /// Holding longer than this resolves the key as `hold`
    pub hold_threshold: Duration,
}

impl DualFunctionKey {
    pub fn new(key: Key, tap: Key, hold: Key, hold_threshold: Duration) -> Self {
        Self {
            key,
            tap,
            hold,
            hold_threshold,
        }
    }
}

impl fmt::Display for DualFunctionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (tap: {}, hold: {} after {}ms)",
            key_name(self.key),
            key_name(self.tap),
            key_name(self.hold),
            self.hold_threshold.as_millis()
        )
    }
}

/// Human-readable key name with the `KEY_` prefix stripped (e.g. "CAPSLOCK").
pub fn key_name(key: Key) -> String {
    let name = format!("{:?}", key);
    match name.strip_prefix("KEY_") {
        Some(stripped) => stripped.to_string(),
        None => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.mappings.len(), 6);
        assert_eq!(config.dual_function_keys.len(), 2);
    }

    #[test]
    fn test_default_capslock_is_escape_and_meta() {
        let config = Config::default();
        let caps = config
            .dual_function_keys
            .iter()
            .find(|d| d.key == Key::KEY_CAPSLOCK)
            .expect("CapsLock should be dual-function by default");

        assert_eq!(caps.tap, Key::KEY_ESC);
        assert_eq!(caps.hold, Key::KEY_LEFTMETA);
        assert_eq!(caps.hold_threshold, Duration::from_millis(300));
    }

    #[test]
    fn test_shadowed_mapping_is_accepted() {
        let mut config = Config::default();
        config.mappings.push(KeyMapping::new(Key::KEY_LEFTMETA, Key::KEY_A));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_duplicate_dual_function_rejected() {
        let mut config = Config::default();
        config.dual_function_keys.push(DualFunctionKey::new(
            Key::KEY_CAPSLOCK,
            Key::KEY_A,
            Key::KEY_LEFTCTRL,
            Duration::from_millis(200),
        ));

        match config.validate() {
            Err(ConfigError::DuplicateDualFunction { key }) => assert_eq!(key, "CAPSLOCK"),
            other => panic!("expected DuplicateDualFunction, got {:?}", other),
        }
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let config = Config {
            dual_function_keys: vec![DualFunctionKey::new(
                Key::KEY_TAB,
                Key::KEY_TAB,
                Key::KEY_LEFTSHIFT,
                Duration::ZERO,
            )],
            ..Config::default()
        };

        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroThreshold { .. })
        ));
    }

    #[test]
    fn test_reserved_key_rejected() {
        let config = Config {
            mappings: vec![KeyMapping::new(Key::KEY_A, Key::KEY_RESERVED)],
            ..Config::default()
        };

        assert!(matches!(
            config.validate(),
            Err(ConfigError::ReservedKey { .. })
        ));
    }

    #[test]
    fn test_output_keys_cover_mappings_and_dual_keys() {
        let config = Config::default();
        let outputs: HashSet<Key> = config.output_keys().collect();

        assert!(outputs.contains(&Key::KEY_LEFTALT));
        assert!(outputs.contains(&Key::KEY_ESC));
        assert!(outputs.contains(&Key::KEY_LEFTMETA));
        assert!(outputs.contains(&Key::KEY_RIGHTMETA));
        assert!(!outputs.contains(&Key::KEY_CAPSLOCK));
    }

    #[test]
    fn test_key_name_strips_prefix() {
        assert_eq!(key_name(Key::KEY_CAPSLOCK), "CAPSLOCK");
        assert_eq!(key_name(Key::KEY_LEFTMETA), "LEFTMETA");
    }

    #[test]
    fn test_display_formats() {
        let mapping = KeyMapping::new(Key::KEY_LEFTCTRL, Key::KEY_LEFTMETA);
        assert_eq!(mapping.to_string(), "LEFTCTRL -> LEFTMETA");

        let dual = DualFunctionKey::new(
            Key::KEY_CAPSLOCK,
            Key::KEY_ESC,
            Key::KEY_LEFTMETA,
            Duration::from_millis(300),
        );
        assert_eq!(dual.to_string(), "CAPSLOCK (tap: ESC, hold: LEFTMETA after 300ms)");
    }
}
