//! Key state helpers shared by the daemon and the CLI

use evdev::{AttributeSet, Key};

/// Key value of a release in a [`key_state_changes`] entry.
pub const KEY_RELEASED: i32 = 0;
/// Key value of a press in a [`key_state_changes`] entry.
pub const KEY_PRESSED: i32 = 1;

/// Events that turn key state `before` into `after`, in ascending code order.
///
/// Used after a kernel buffer overflow (`SYN_DROPPED`) to reconcile the last
/// known state with what the device reports now.
pub fn key_state_changes(before: &AttributeSet<Key>, after: &AttributeSet<Key>) -> Vec<(Key, i32)> {
    let mut changes: Vec<(Key, i32)> = before
        .iter()
        .filter(|key| !after.contains(*key))
        .map(|key| (key, KEY_RELEASED))
        .chain(
            after
                .iter()
                .filter(|key| !before.contains(*key))
                .map(|key| (key, KEY_PRESSED)),
        )
        .collect();
    changes.sort_by_key(|(key, _)| key.code());
    changes
}
