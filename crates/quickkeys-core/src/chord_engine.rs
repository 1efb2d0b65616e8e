use crate::types::KeyIndex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

pub const DEFAULT_SHIFT_TIMEOUT: Duration = Duration::from_millis(2000);

/// Result of feeding a key-up to the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpOutcome {
    /// The key was released after being used in a `CLEAR::` chord.
    Suppressed,
    /// Proceed with command resolution.
    Resolve { held_secs: u64 },
}

/// Held keys plus the one-shot clear set.
#[derive(Debug, Default)]
pub struct ChordTracker {
    // Kept as pressed; duplicates from a stuck key are folded at read time.
    held: Vec<KeyIndex>,
    clear_set: Vec<KeyIndex>,
    down_ts: HashMap<KeyIndex, Instant>,
}

impl ChordTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_down(&mut self, key: KeyIndex, now: Instant) {
        self.held.push(key);
        self.down_ts.insert(key, now);
        debug!("Key down:{} Chord:{:?}", key, self.held);
    }

    pub fn on_up(&mut self, key: KeyIndex, now: Instant) -> UpOutcome {
        self.held.retain(|k| *k != key);
        let held_secs = self
            .down_ts
            .remove(&key)
            .map(|t| now.saturating_duration_since(t).as_secs())
            .unwrap_or(0);

        if let Some(pos) = self.clear_set.iter().position(|k| *k == key) {
            self.clear_set.remove(pos);
            debug!("Key up:{} suppressed (cleared)", key);
            return UpOutcome::Suppressed;
        }

        debug!("Key up:{} Chord:{:?}", key, self.held);
        UpOutcome::Resolve { held_secs }
    }

    /// Currently held keys, sorted and unique.
    pub fn chord(&self) -> Vec<KeyIndex> {
        let mut chord = self.held.clone();
        chord.sort_unstable();
        chord.dedup();
        chord
    }

    /// Marks every held key so that its next release is swallowed.
    pub fn clear_on_release(&mut self) {
        self.clear_set = self.chord();
    }

    pub fn clear_set(&self) -> &[KeyIndex] {
        &self.clear_set
    }

    pub fn is_idle(&self) -> bool {
        self.held.is_empty()
    }
}

/// Timed secondary binding layer.
#[derive(Debug)]
pub struct ShiftLayer {
    level: u32,
    activated_at: Option<Instant>,
    timeout: Duration,
}

impl Default for ShiftLayer {
    fn default() -> Self {
        Self::new(DEFAULT_SHIFT_TIMEOUT)
    }
}

impl ShiftLayer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            level: 0,
            activated_at: None,
            timeout,
        }
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn is_active(&self) -> bool {
        self.level > 0
    }

    /// First activation seeds `key * 10 + 1`; repeats count upward.
    pub fn activate(&mut self, key: KeyIndex, now: Instant) -> u32 {
        if self.level == 0 {
            self.level = u32::from(key.get()) * 10 + 1;
        } else {
            self.level += 1;
        }
        self.activated_at = Some(now);
        debug!("Shift activated: level={}", self.level);
        self.level
    }

    /// Drops a stale layer. Returns true when it reset.
    pub fn expire(&mut self, now: Instant) -> bool {
        let Some(at) = self.activated_at else {
            return false;
        };
        if self.level > 0 && at + self.timeout < now {
            self.level = 0;
            debug!("Shift reset");
            return true;
        }
        false
    }

    pub fn consume(&mut self) {
        self.level = 0;
    }
}
