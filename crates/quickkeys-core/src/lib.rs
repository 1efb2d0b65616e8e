pub mod chord_engine;
pub mod command_key;
pub mod config;
pub mod device;
pub mod directive;
pub mod engine;
pub mod error;
pub mod error_log;
pub mod executor;
pub mod line_protocol;
pub mod notification;
pub mod overlay;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod types;

pub use command_key::CommandKey;
pub use config::{Config, ConfigSource, FileConfigSource};
pub use engine::{Engine, Flow, Resolution};
pub use error::{Error, Result};
pub use types::{ControlEvent, DeviceEvent, KeyIndex, Notification, WheelDirection};
