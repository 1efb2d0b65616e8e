use crate::error::DeviceError;
use crate::types::{KeyIndex, Orientation, Rgb, WheelSpeed};

/// Output side of the device transport.
pub trait Device {
    /// Shows `text` on the display for `duration_secs` seconds.
    fn show_overlay_text(&mut self, duration_secs: u32, text: &str) -> Result<(), DeviceError>;

    fn set_key_text(&mut self, key: KeyIndex, text: &str) -> Result<(), DeviceError>;

    fn set_wheel_color(&mut self, color: Rgb) -> Result<(), DeviceError>;

    fn set_display_orientation(&mut self, orientation: Orientation) -> Result<(), DeviceError>;

    fn set_wheel_speed(&mut self, speed: WheelSpeed) -> Result<(), DeviceError>;

    fn set_sleep_timeout(&mut self, timeout: u32) -> Result<(), DeviceError>;
}

impl<D: Device + ?Sized> Device for Box<D> {
    fn show_overlay_text(&mut self, duration_secs: u32, text: &str) -> Result<(), DeviceError> {
        (**self).show_overlay_text(duration_secs, text)
    }

    fn set_key_text(&mut self, key: KeyIndex, text: &str) -> Result<(), DeviceError> {
        (**self).set_key_text(key, text)
    }

    fn set_wheel_color(&mut self, color: Rgb) -> Result<(), DeviceError> {
        (**self).set_wheel_color(color)
    }

    fn set_display_orientation(&mut self, orientation: Orientation) -> Result<(), DeviceError> {
        (**self).set_display_orientation(orientation)
    }

    fn set_wheel_speed(&mut self, speed: WheelSpeed) -> Result<(), DeviceError> {
        (**self).set_wheel_speed(speed)
    }

    fn set_sleep_timeout(&mut self, timeout: u32) -> Result<(), DeviceError> {
        (**self).set_sleep_timeout(timeout)
    }
}
