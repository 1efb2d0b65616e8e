use serde::Deserialize;
use std::fmt;

/// Highest button index that carries a text label on the device.
pub const MAX_LABELLED_KEY: u8 = 7;

/// Physical button identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyIndex(pub u8);

impl KeyIndex {
    pub const fn get(self) -> u8 {
        self.0
    }

    pub const fn has_label(self) -> bool {
        self.0 <= MAX_LABELLED_KEY
    }
}

impl fmt::Display for KeyIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WheelDirection {
    Left,
    Right,
}

impl WheelDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            WheelDirection::Left => "left",
            WheelDirection::Right => "right",
        }
    }
}

impl fmt::Display for WheelDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event delivered by the device transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Down(KeyIndex),
    Up(KeyIndex),
    Wheel(WheelDirection),
    /// Battery charge in percent (0..=100).
    Battery(u8),
    /// Transport-level failure. The session is not recoverable.
    Error(String),
    Disconnected,
}

/// Message pushed from outside the device (watcher or control channel).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub message: String,
    /// Seconds to keep the overlay on screen.
    pub duration: Option<u32>,
}

impl Notification {
    pub const DEFAULT_DURATION: u32 = 2;

    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            duration: None,
        }
    }

    pub fn with_duration(mut self, secs: u32) -> Self {
        self.duration = Some(secs);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    Notify(Notification),
    Reload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    Rotate0,
    Rotate90,
    Rotate180,
    Rotate270,
}

impl Orientation {
    pub fn from_degrees(deg: u16) -> Option<Self> {
        match deg {
            0 => Some(Self::Rotate0),
            90 => Some(Self::Rotate90),
            180 => Some(Self::Rotate180),
            270 => Some(Self::Rotate270),
            _ => None,
        }
    }

    pub fn degrees(self) -> u16 {
        match self {
            Self::Rotate0 => 0,
            Self::Rotate90 => 90,
            Self::Rotate180 => 180,
            Self::Rotate270 => 270,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WheelSpeed {
    Slowest,
    Slower,
    Normal,
    Faster,
    Fastest,
}

impl WheelSpeed {
    /// Maps the config's `wheel_step` (1 = slowest .. 5 = fastest).
    pub fn from_step(step: u8) -> Option<Self> {
        match step {
            1 => Some(Self::Slowest),
            2 => Some(Self::Slower),
            3 => Some(Self::Normal),
            4 => Some(Self::Faster),
            5 => Some(Self::Fastest),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Slowest => "slowest",
            Self::Slower => "slower",
            Self::Normal => "normal",
            Self::Faster => "faster",
            Self::Fastest => "fastest",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(from = "[u8; 3]")]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const RED: Rgb = Rgb::new(255, 0, 0);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

impl From<[u8; 3]> for Rgb {
    fn from(c: [u8; 3]) -> Self {
        Self::new(c[0], c[1], c[2])
    }
}
