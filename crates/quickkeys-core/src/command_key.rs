//! Structured command lookup keys.
//!
//! A binding is addressed by the chord held at release time, the active
//! shift level and an optional hold-duration bucket. In configuration files
//! the same key is written as `command[_k1_k2..][_s<level>][_d<secs>]`.

use crate::types::KeyIndex;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const PREFIX: &str = "command";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct CommandKey {
    /// Held keys, sorted ascending and unique.
    pub chord: Vec<KeyIndex>,
    /// 0 = shift inactive.
    pub shift: u32,
    /// Hold-duration bucket in whole seconds.
    pub duration: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid command key `{key}`: {reason}")]
pub struct ParseCommandKeyError {
    pub key: String,
    pub reason: &'static str,
}

impl CommandKey {
    /// Builds the base key for a chord. Order of `chord` does not matter.
    pub fn new(chord: impl IntoIterator<Item = KeyIndex>, shift: u32) -> Self {
        let mut chord: Vec<KeyIndex> = chord.into_iter().collect();
        chord.sort_unstable();
        chord.dedup();
        Self {
            chord,
            shift,
            duration: None,
        }
    }

    pub fn with_duration(&self, secs: u64) -> Self {
        Self {
            duration: Some(secs),
            ..self.clone()
        }
    }
}

impl fmt::Display for CommandKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(PREFIX)?;
        for k in &self.chord {
            write!(f, "_{}", k)?;
        }
        if self.shift > 0 {
            write!(f, "_s{}", self.shift)?;
        }
        if let Some(d) = self.duration {
            write!(f, "_d{}", d)?;
        }
        Ok(())
    }
}

impl FromStr for CommandKey {
    type Err = ParseCommandKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason| ParseCommandKeyError {
            key: s.to_string(),
            reason,
        };

        let mut parts = s.split('_');
        if parts.next() != Some(PREFIX) {
            return Err(err("must start with `command`"));
        }

        let mut chord = Vec::new();
        let mut shift = 0;
        let mut duration = None;

        for part in parts {
            if let Some(level) = part.strip_prefix('s') {
                if shift != 0 || duration.is_some() {
                    return Err(err("shift must appear once, before the duration"));
                }
                shift = level.parse().map_err(|_| err("bad shift level"))?;
                if shift == 0 {
                    return Err(err("shift level must be non-zero"));
                }
            } else if let Some(secs) = part.strip_prefix('d') {
                if duration.is_some() {
                    return Err(err("duration must appear once"));
                }
                duration = Some(secs.parse().map_err(|_| err("bad duration"))?);
            } else {
                if shift != 0 || duration.is_some() {
                    return Err(err("chord keys must come before shift and duration"));
                }
                let k: u8 = part.parse().map_err(|_| err("bad key index"))?;
                chord.push(KeyIndex(k));
            }
        }

        let mut key = CommandKey::new(chord, shift);
        key.duration = duration;
        Ok(key)
    }
}

/// Picks the duration variant for a release after `elapsed_secs`.
///
/// Tries `_d<n>`, then `_d<n+1>` (n > 0), then `_d<n-1>` (n > 1), and falls
/// back to `base` when none is bound.
pub fn resolve_duration(
    base: &CommandKey,
    elapsed_secs: u64,
    is_bound: impl Fn(&CommandKey) -> bool,
) -> CommandKey {
    let mut candidates = vec![elapsed_secs];
    if elapsed_secs > 0 {
        candidates.push(elapsed_secs + 1);
    }
    if elapsed_secs > 1 {
        candidates.push(elapsed_secs - 1);
    }

    candidates
        .into_iter()
        .map(|secs| base.with_duration(secs))
        .find(|candidate| is_bound(candidate))
        .unwrap_or_else(|| base.clone())
}
