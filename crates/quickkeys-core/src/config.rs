use crate::command_key::CommandKey;
use crate::error::ConfigError;
use crate::types::{KeyIndex, Orientation, Rgb, WheelDirection, WheelSpeed};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const CONFIG_ENV_VAR: &str = "QUICKKEYS_CONFIG";

const FLASH_SUFFIX: &str = "_flash";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub sleep_timeout: Option<u32>,
    #[serde(default)]
    pub wheel_step: Option<u8>,
    #[serde(default)]
    pub orientation: Option<u16>,
    #[serde(default)]
    pub welcome_text: String,
    #[serde(default)]
    pub notification_path: Option<PathBuf>,
    /// Milliseconds.
    #[serde(default)]
    pub shift_time_out: Option<u64>,
}

impl Settings {
    pub fn wheel_speed(&self) -> Option<WheelSpeed> {
        self.wheel_step.and_then(WheelSpeed::from_step)
    }

    pub fn display_orientation(&self) -> Option<Orientation> {
        self.orientation.and_then(Orientation::from_degrees)
    }

    pub fn shift_timeout(&self) -> Option<Duration> {
        self.shift_time_out.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PressOverlay {
    #[serde(default)]
    pub text: String,
    /// Seconds.
    #[serde(default = "default_overlay_duration")]
    pub duration: u32,
}

fn default_overlay_duration() -> u32 {
    1
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ButtonBinding {
    pub text: Option<String>,
    pub commands: HashMap<CommandKey, String>,
    pub flashes: HashMap<CommandKey, String>,
    pub press_overlay: Option<PressOverlay>,
}

impl ButtonBinding {
    pub fn command(&self, key: &CommandKey) -> Option<&str> {
        self.commands.get(key).map(String::as_str)
    }

    pub fn is_bound(&self, key: &CommandKey) -> bool {
        self.commands.contains_key(key)
    }

    pub fn flash(&self, key: &CommandKey) -> Option<&str> {
        self.flashes.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum WheelCommand {
    Single(String),
    Sequence(Vec<String>),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WheelBinding {
    pub commands: HashMap<CommandKey, WheelCommand>,
    pub press_overlay: Option<PressOverlay>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WheelConfig {
    pub color: Option<Rgb>,
    pub directions: HashMap<WheelDirection, WheelBinding>,
}

/// Validated controller configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    pub settings: Settings,
    pub wheel: WheelConfig,
    pub buttons: BTreeMap<KeyIndex, ButtonBinding>,
}

#[derive(Deserialize)]
struct RawConfig {
    #[serde(default)]
    settings: Settings,
    #[serde(default)]
    wheel: RawWheel,
    #[serde(default)]
    buttons: BTreeMap<String, Map<String, Value>>,
}

#[derive(Default, Deserialize)]
struct RawWheel {
    #[serde(default)]
    color: Option<Rgb>,
    #[serde(flatten)]
    directions: BTreeMap<String, Value>,
}

impl Config {
    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_json::from_str(content)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        validate_settings(&raw.settings)?;

        let mut buttons = BTreeMap::new();
        for (name, entries) in raw.buttons {
            let index: u8 = name
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("button `{}` is not a key index", name)))?;
            buttons.insert(KeyIndex(index), parse_button(&name, entries)?);
        }

        let mut directions = HashMap::new();
        for (name, value) in raw.wheel.directions {
            let direction = match name.as_str() {
                "left" => WheelDirection::Left,
                "right" => WheelDirection::Right,
                _ => {
                    warn!("Ignoring unknown wheel entry `{}`", name);
                    continue;
                }
            };
            let Value::Object(entries) = value else {
                return Err(ConfigError::Invalid(format!(
                    "wheel.{} must be an object",
                    name
                )));
            };
            directions.insert(direction, parse_wheel(&name, entries)?);
        }

        Ok(Self {
            settings: raw.settings,
            wheel: WheelConfig {
                color: raw.wheel.color,
                directions,
            },
            buttons,
        })
    }

    pub fn button(&self, key: KeyIndex) -> Option<&ButtonBinding> {
        self.buttons.get(&key)
    }

    pub fn wheel(&self, direction: WheelDirection) -> Option<&WheelBinding> {
        self.wheel.directions.get(&direction)
    }
}

fn validate_settings(settings: &Settings) -> Result<(), ConfigError> {
    if let Some(step) = settings.wheel_step {
        if WheelSpeed::from_step(step).is_none() {
            return Err(ConfigError::Invalid(format!(
                "wheel_step must be 1..=5, got {}",
                step
            )));
        }
    }
    if let Some(deg) = settings.orientation {
        if Orientation::from_degrees(deg).is_none() {
            return Err(ConfigError::Invalid(format!(
                "orientation must be 0, 90, 180 or 270, got {}",
                deg
            )));
        }
    }
    Ok(())
}

fn parse_button(name: &str, entries: Map<String, Value>) -> Result<ButtonBinding, ConfigError> {
    let mut binding = ButtonBinding::default();

    for (field, value) in entries {
        match field.as_str() {
            "text" => binding.text = Some(expect_string(name, &field, value)?),
            "press_overlay" => binding.press_overlay = Some(serde_json::from_value(value)?),
            f if f.starts_with("command") => {
                if let Some(stem) = f.strip_suffix(FLASH_SUFFIX) {
                    let key: CommandKey = stem.parse()?;
                    binding.flashes.insert(key, expect_string(name, f, value)?);
                } else {
                    let key: CommandKey = f.parse()?;
                    binding.commands.insert(key, expect_string(name, f, value)?);
                }
            }
            _ => warn!("Ignoring unknown field `{}` on button {}", field, name),
        }
    }

    Ok(binding)
}

fn parse_wheel(name: &str, entries: Map<String, Value>) -> Result<WheelBinding, ConfigError> {
    let mut binding = WheelBinding::default();

    for (field, value) in entries {
        match field.as_str() {
            "press_overlay" => binding.press_overlay = Some(serde_json::from_value(value)?),
            f if f.starts_with("command") => {
                let key: CommandKey = f.parse()?;
                binding.commands.insert(key, serde_json::from_value(value)?);
            }
            _ => warn!("Ignoring unknown field `{}` on wheel.{}", field, name),
        }
    }

    Ok(binding)
}

fn expect_string(owner: &str, field: &str, value: Value) -> Result<String, ConfigError> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(ConfigError::Invalid(format!(
            "buttons.{}.{} must be a string, got {}",
            owner, field, other
        ))),
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let raw = std::fs::read(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let text = decode_config_bytes(&raw)?;
    let config = Config::from_json_str(&text)?;
    info!(
        "Config loaded from {} ({} buttons)",
        path.display(),
        config.buttons.len()
    );
    Ok(config)
}

fn decode_config_bytes(raw: &[u8]) -> Result<Cow<'_, str>, ConfigError> {
    if let Some((enc, bom_len)) = encoding_rs::Encoding::for_bom(raw) {
        debug!("Decoded config using BOM: {}", enc.name());
        let (cow, _, had_errors) = enc.decode(&raw[bom_len..]);
        if had_errors {
            warn!("Config decode had errors (replacement characters used)");
        }
        return Ok(cow);
    }

    std::str::from_utf8(raw)
        .map(Cow::Borrowed)
        .map_err(|e| ConfigError::Invalid(format!("config is not valid UTF-8: {}", e)))
}

/// `$QUICKKEYS_CONFIG`, else `<config dir>/quickkeys/config.json`.
pub fn default_config_path() -> Option<PathBuf> {
    if let Some(p) = std::env::var_os(CONFIG_ENV_VAR) {
        return Some(PathBuf::from(p));
    }
    dirs::config_dir().map(|d| d.join("quickkeys").join("config.json"))
}

/// Where configuration comes from.
pub trait ConfigSource {
    /// Reads the current configuration, or switches to `path` first.
    fn read_config(&mut self, path: Option<&Path>) -> Result<Config, ConfigError>;
}

/// Reads JSON files from disk. A successful switch via `config=` sticks for
/// later reloads.
#[derive(Debug, Clone)]
pub struct FileConfigSource {
    path: Option<PathBuf>,
}

impl FileConfigSource {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path: path.or_else(default_config_path),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl ConfigSource for FileConfigSource {
    fn read_config(&mut self, path: Option<&Path>) -> Result<Config, ConfigError> {
        let target = path
            .map(Path::to_path_buf)
            .or_else(|| self.path.clone())
            .ok_or(ConfigError::NoPath)?;
        let config = load_config(&target)?;
        self.path = Some(target);
        Ok(config)
    }
}
