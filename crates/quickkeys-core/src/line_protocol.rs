//! Plain-text device transport.
//!
//! A bridge process talks to the physical remote and exchanges one event or
//! command per line with us: events arrive as `down 3`, `up 3`,
//! `wheel left`, `battery 75`, `error <msg>` or `disconnect`, and control
//! lines `notify [<secs>] <text>` / `reload` may be mixed in. Display calls
//! go out as `overlay <secs> <text>`, `key_text <k> <text>` and so on.

use crate::device::Device;
use crate::error::DeviceError;
use crate::types::{
    ControlEvent, DeviceEvent, KeyIndex, Notification, Orientation, Rgb, WheelDirection,
    WheelSpeed,
};
use crossbeam_channel::Sender;
use std::io::{BufRead, Write};
use std::thread::JoinHandle;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputLine {
    Device(DeviceEvent),
    Control(ControlEvent),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("bad input line `{line}`: {reason}")]
pub struct LineError {
    pub line: String,
    pub reason: &'static str,
}

/// Parses one line. Blank lines and `#` comments yield `None`.
pub fn parse_line(line: &str) -> Result<Option<InputLine>, LineError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let err = |reason| LineError {
        line: line.to_string(),
        reason,
    };
    let (verb, rest) = match line.split_once(char::is_whitespace) {
        Some((v, r)) => (v, r.trim()),
        None => (line, ""),
    };

    let key = |s: &str| s.parse::<u8>().map(KeyIndex).map_err(|_| err("bad key index"));

    let parsed = match verb {
        "down" => InputLine::Device(DeviceEvent::Down(key(rest)?)),
        "up" => InputLine::Device(DeviceEvent::Up(key(rest)?)),
        "wheel" => {
            let dir = match rest {
                "left" => WheelDirection::Left,
                "right" => WheelDirection::Right,
                _ => return Err(err("wheel direction must be left or right")),
            };
            InputLine::Device(DeviceEvent::Wheel(dir))
        }
        "battery" => {
            let level: u8 = rest.parse().map_err(|_| err("bad battery level"))?;
            if level > 100 {
                return Err(err("battery level above 100"));
            }
            InputLine::Device(DeviceEvent::Battery(level))
        }
        "error" => InputLine::Device(DeviceEvent::Error(rest.to_string())),
        "disconnect" => InputLine::Device(DeviceEvent::Disconnected),
        "reload" => InputLine::Control(ControlEvent::Reload),
        "notify" => {
            if rest.is_empty() {
                return Err(err("notify needs a message"));
            }
            let timed = rest
                .split_once(char::is_whitespace)
                .and_then(|(secs, text)| Some((secs.parse::<u32>().ok()?, text.trim())));
            let notification = match timed {
                Some((secs, text)) => Notification::new(text).with_duration(secs),
                None => Notification::new(rest),
            };
            InputLine::Control(ControlEvent::Notify(notification))
        }
        _ => return Err(err("unknown verb")),
    };

    Ok(Some(parsed))
}

/// Reads lines on a background thread until EOF, which counts as a disconnect.
pub fn spawn_reader<R>(reader: R, tx: Sender<InputLine>) -> JoinHandle<()>
where
    R: BufRead + Send + 'static,
{
    std::thread::spawn(move || {
        for line in reader.lines() {
            let line = match line {
                Ok(l) => l,
                Err(e) => {
                    let _ = tx.send(InputLine::Device(DeviceEvent::Error(e.to_string())));
                    return;
                }
            };
            match parse_line(&line) {
                Ok(Some(input)) => {
                    if tx.send(input).is_err() {
                        return;
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("{}", e),
            }
        }
        info!("Device stream closed");
        let _ = tx.send(InputLine::Device(DeviceEvent::Disconnected));
    })
}

/// Writes display calls as protocol lines.
pub struct LineDevice<W: Write> {
    out: W,
}

impl<W: Write> LineDevice<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn emit(&mut self, line: std::fmt::Arguments<'_>) -> Result<(), DeviceError> {
        self.out.write_fmt(line)?;
        self.out.write_all(b"\n")?;
        self.out.flush()?;
        Ok(())
    }
}

fn one_line(text: &str) -> String {
    text.replace(&['\r', '\n'][..], " ")
}

impl<W: Write> Device for LineDevice<W> {
    fn show_overlay_text(&mut self, duration_secs: u32, text: &str) -> Result<(), DeviceError> {
        self.emit(format_args!("overlay {} {}", duration_secs, one_line(text)))
    }

    fn set_key_text(&mut self, key: KeyIndex, text: &str) -> Result<(), DeviceError> {
        self.emit(format_args!("key_text {} {}", key, one_line(text)))
    }

    fn set_wheel_color(&mut self, color: Rgb) -> Result<(), DeviceError> {
        self.emit(format_args!(
            "wheel_color {} {} {}",
            color.r, color.g, color.b
        ))
    }

    fn set_display_orientation(&mut self, orientation: Orientation) -> Result<(), DeviceError> {
        self.emit(format_args!("orientation {}", orientation.degrees()))
    }

    fn set_wheel_speed(&mut self, speed: WheelSpeed) -> Result<(), DeviceError> {
        self.emit(format_args!("wheel_speed {}", speed.as_str()))
    }

    fn set_sleep_timeout(&mut self, timeout: u32) -> Result<(), DeviceError> {
        self.emit(format_args!("sleep_timeout {}", timeout))
    }
}
