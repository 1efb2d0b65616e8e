//! In-memory stand-ins for the device, shell and config file.

use crate::config::{Config, ConfigSource};
use crate::device::Device;
use crate::error::{CommandError, ConfigError, DeviceError};
use crate::executor::{run_inline, CommandRunner, Executor, Finished, Job};
use crate::types::{KeyIndex, Orientation, Rgb, WheelSpeed};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCall {
    Overlay(u32, String),
    KeyText(KeyIndex, String),
    WheelColor(Rgb),
    Orientation(Orientation),
    WheelSpeed(WheelSpeed),
    SleepTimeout(u32),
}

#[derive(Debug, Default)]
pub struct RecordingDevice {
    pub calls: Vec<DeviceCall>,
    pub fail_overlays: bool,
}

impl RecordingDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn overlays(&self) -> Vec<(u32, String)> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                DeviceCall::Overlay(secs, text) => Some((*secs, text.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn last_overlay(&self) -> Option<String> {
        self.overlays().pop().map(|(_, text)| text)
    }

    pub fn clear(&mut self) {
        self.calls.clear();
    }
}

impl Device for RecordingDevice {
    fn show_overlay_text(&mut self, duration_secs: u32, text: &str) -> Result<(), DeviceError> {
        if self.fail_overlays {
            return Err(DeviceError("display unavailable".into()));
        }
        self.calls
            .push(DeviceCall::Overlay(duration_secs, text.to_string()));
        Ok(())
    }

    fn set_key_text(&mut self, key: KeyIndex, text: &str) -> Result<(), DeviceError> {
        self.calls.push(DeviceCall::KeyText(key, text.to_string()));
        Ok(())
    }

    fn set_wheel_color(&mut self, color: Rgb) -> Result<(), DeviceError> {
        self.calls.push(DeviceCall::WheelColor(color));
        Ok(())
    }

    fn set_display_orientation(&mut self, orientation: Orientation) -> Result<(), DeviceError> {
        self.calls.push(DeviceCall::Orientation(orientation));
        Ok(())
    }

    fn set_wheel_speed(&mut self, speed: WheelSpeed) -> Result<(), DeviceError> {
        self.calls.push(DeviceCall::WheelSpeed(speed));
        Ok(())
    }

    fn set_sleep_timeout(&mut self, timeout: u32) -> Result<(), DeviceError> {
        self.calls.push(DeviceCall::SleepTimeout(timeout));
        Ok(())
    }
}

/// Answers commands from a table; unknown commands print nothing.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    pub responses: HashMap<String, Result<String, String>>,
    pub executed: Vec<String>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(mut self, command: &str, output: &str) -> Self {
        self.responses
            .insert(command.to_string(), Ok(output.to_string()));
        self
    }

    pub fn fail(mut self, command: &str, stderr: &str) -> Self {
        self.responses
            .insert(command.to_string(), Err(stderr.to_string()));
        self
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&mut self, command: &str) -> Result<String, CommandError> {
        self.executed.push(command.to_string());
        match self.responses.get(command) {
            Some(Ok(out)) => Ok(out.trim().to_string()),
            Some(Err(stderr)) => Err(CommandError::Failed {
                command: command.to_string(),
                status: "exit status: 1".to_string(),
                stderr: stderr.clone(),
            }),
            None => Ok(String::new()),
        }
    }
}

/// Runs jobs on the spot so results are visible right after the event.
impl Executor for ScriptedRunner {
    fn submit(&mut self, job: Job) -> Vec<Finished> {
        run_inline(self, job)
    }
}

/// Serves configs from memory. A successful switch sticks, as on disk.
#[derive(Debug, Default)]
pub struct StaticConfigSource {
    pub default: Config,
    pub by_path: HashMap<PathBuf, Config>,
    pub current: Option<PathBuf>,
    pub reads: usize,
}

impl StaticConfigSource {
    pub fn new(default: Config) -> Self {
        Self {
            default,
            ..Self::default()
        }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>, config: Config) -> Self {
        self.by_path.insert(path.into(), config);
        self
    }
}

impl ConfigSource for StaticConfigSource {
    fn read_config(&mut self, path: Option<&Path>) -> Result<Config, ConfigError> {
        self.reads += 1;
        let target = path.map(Path::to_path_buf).or_else(|| self.current.clone());
        let config = match &target {
            None => self.default.clone(),
            Some(p) => self.by_path.get(p).cloned().ok_or_else(|| ConfigError::Io {
                path: p.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such config"),
            })?,
        };
        self.current = target;
        Ok(config)
    }
}
