use crate::chord_engine::{ChordTracker, ShiftLayer, UpOutcome, DEFAULT_SHIFT_TIMEOUT};
use crate::command_key::{resolve_duration, CommandKey};
use crate::config::{Config, ConfigSource, WheelCommand};
use crate::device::Device;
use crate::directive::{self, Action, Directive};
use crate::error::{ConfigError, DeviceError, Error};
use crate::error_log::ErrorLog;
use crate::executor::{Executor, Finished, FollowUp, Job};
use crate::overlay::{format_overlay, truncate_label, wheel_overlay};
use crate::types::{DeviceEvent, KeyIndex, Notification, Rgb, WheelDirection};
use std::collections::VecDeque;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

pub const RELOAD_MESSAGE: &str = "Reloading Config";
pub const DEFAULT_FLASH_INTERVAL: Duration = Duration::from_millis(200);

/// Shell no-op run when the wheel has no binding for the current chord.
const NOOP_COMMAND: &str = ":";
const SHORT_OVERLAY_SECS: u32 = 1;
const BATTERY_OVERLAY_SECS: u32 = 4;
const LOW_BATTERY_LEVEL: u8 = 10;
const BATTERY_MILESTONES: [u8; 4] = [90, 75, 50, 25];

/// What a single button release or wheel step ended up doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Release swallowed by a previous `CLEAR::` binding.
    Suppressed,
    /// No (or an empty) command bound for the key.
    Unbound(CommandKey),
    /// A bare `CLEAR::` binding.
    Cleared(CommandKey),
    Reloaded,
    ShiftActivated(u32),
    /// Handed to a background executor; see [`Engine::on_finished`].
    Dispatched(CommandKey),
    Executed { key: CommandKey, output: String },
    Failed(String),
}

/// How the event loop should continue after a device event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Disconnected,
    Fatal(String),
}

/// Owns the session: device, configuration and all chord/shift state.
///
/// Key state is settled before a command leaves through the [`Executor`], so
/// the next event sees it even while the command is still running.
pub struct Engine<D, X> {
    device: D,
    executor: X,
    source: Box<dyn ConfigSource>,
    config: Config,
    chords: ChordTracker,
    shift: ShiftLayer,
    battery: Option<u8>,
    error_log: ErrorLog,
    flash_interval: Duration,
    color_steps: VecDeque<Rgb>,
    next_color_at: Option<Instant>,
}

impl<D: Device, X: Executor> Engine<D, X> {
    /// Reads the initial configuration. Device settings are applied by [`Engine::start`].
    pub fn new(
        device: D,
        executor: X,
        mut source: Box<dyn ConfigSource>,
        error_log: ErrorLog,
    ) -> Result<Self, ConfigError> {
        let config = source.read_config(None)?;
        let mut engine = Self {
            device,
            executor,
            source,
            config: Config::default(),
            chords: ChordTracker::new(),
            shift: ShiftLayer::default(),
            battery: None,
            error_log,
            flash_interval: DEFAULT_FLASH_INTERVAL,
            color_steps: VecDeque::new(),
            next_color_at: None,
        };
        engine.install(config);
        Ok(engine)
    }

    pub fn with_flash_interval(mut self, interval: Duration) -> Self {
        self.flash_interval = interval;
        self
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn executor(&self) -> &X {
        &self.executor
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn shift_level(&self) -> u32 {
        self.shift.level()
    }

    pub fn chord(&self) -> Vec<KeyIndex> {
        self.chords.chord()
    }

    pub fn clear_set(&self) -> &[KeyIndex] {
        self.chords.clear_set()
    }

    pub fn battery(&self) -> Option<u8> {
        self.battery
    }

    /// Pushes the initial settings to the device. Failure here ends the session.
    pub fn start(&mut self) -> Result<(), DeviceError> {
        info!("Session started");
        self.apply_settings(None)
    }

    pub fn handle(&mut self, event: DeviceEvent, now: Instant) -> Flow {
        match event {
            DeviceEvent::Down(key) => self.on_down(key, now),
            DeviceEvent::Up(key) => {
                self.on_up(key, now);
            }
            DeviceEvent::Wheel(direction) => {
                self.on_wheel(direction);
            }
            DeviceEvent::Battery(level) => self.on_battery(level),
            DeviceEvent::Error(msg) => {
                error!("Device error: {}", msg);
                return Flow::Fatal(msg);
            }
            DeviceEvent::Disconnected => {
                info!("Device disconnected");
                return Flow::Disconnected;
            }
        }
        Flow::Continue
    }

    pub fn on_down(&mut self, key: KeyIndex, now: Instant) {
        self.chords.on_down(key, now);
    }

    pub fn on_up(&mut self, key: KeyIndex, now: Instant) -> Resolution {
        self.shift.expire(now);

        let held_secs = match self.chords.on_up(key, now) {
            UpOutcome::Suppressed => return Resolution::Suppressed,
            UpOutcome::Resolve { held_secs } => held_secs,
        };

        match self.resolve_up(key, held_secs, now) {
            Ok(resolution) => resolution,
            Err(e) => {
                self.report(&e);
                Resolution::Failed(e.to_string())
            }
        }
    }

    fn resolve_up(
        &mut self,
        key: KeyIndex,
        held_secs: u64,
        now: Instant,
    ) -> Result<Resolution, Error> {
        let base = CommandKey::new(self.chords.chord(), self.shift.level());
        let Some(binding) = self.config.button(key) else {
            debug!("No binding for key {}", key);
            return Ok(Resolution::Unbound(base));
        };

        let command_key = resolve_duration(&base, held_secs, |k| binding.is_bound(k));
        debug!("commID = {} Delay={}", command_key, held_secs);

        let raw = match binding.command(&command_key) {
            Some(cmd) if !cmd.is_empty() => cmd.to_string(),
            _ => return Ok(Resolution::Unbound(command_key)),
        };
        let follow_up = match binding.flash(&command_key) {
            Some(text) => FollowUp::Flash(text.to_string()),
            None => match binding.press_overlay.as_ref().filter(|o| !o.text.is_empty()) {
                Some(o) => FollowUp::PressOverlay {
                    template: o.text.clone(),
                    duration: o.duration,
                },
                None => FollowUp::None,
            },
        };

        let directive = Directive::parse(&raw);
        if directive.clear {
            self.chords.clear_on_release();
        }
        debug!("commID={} cmd search :: {:?}", command_key, directive.action);

        let Some(action) = directive.action else {
            return Ok(Resolution::Cleared(command_key));
        };

        let command = match action {
            Action::ReloadConfig => {
                self.reload_from(None, Some(RELOAD_MESSAGE))?;
                return Ok(Resolution::Reloaded);
            }
            Action::SwitchConfig(path) => {
                self.reload_from(Some(&path), Some(RELOAD_MESSAGE))?;
                return Ok(Resolution::Reloaded);
            }
            Action::Shift => {
                let level = self.shift.activate(key, now);
                self.device
                    .show_overlay_text(SHORT_OVERLAY_SECS, &format!("Shift{}", level))?;
                return Ok(Resolution::ShiftActivated(level));
            }
            Action::Run(command) => command,
        };

        // Shift is spent once the command leaves, whether or not it succeeds.
        self.shift.consume();
        let finished = self.executor.submit(Job {
            key: command_key.clone(),
            commands: vec![command],
            follow_up,
        });

        Ok(self
            .settle(finished)
            .pop()
            .unwrap_or(Resolution::Dispatched(command_key)))
    }

    /// Runs the wheel binding for the held chord. One resolution per command
    /// that has already completed.
    pub fn on_wheel(&mut self, direction: WheelDirection) -> Vec<Resolution> {
        let key = CommandKey::new(self.chords.chord(), 0);
        let (bound, press_overlay) = match self.config.wheel(direction) {
            Some(b) => (b.commands.get(&key).cloned(), b.press_overlay.clone()),
            None => (None, None),
        };
        debug!("Wheel {} commID = {}", direction, key);

        let bound = bound.unwrap_or_else(|| WheelCommand::Single(NOOP_COMMAND.to_string()));
        let raw = match bound {
            WheelCommand::Single(raw) => vec![raw],
            WheelCommand::Sequence(items) => items,
        };

        let mut clear = false;
        let mut commands = Vec::with_capacity(raw.len());
        for item in &raw {
            let (cleared, command) = directive::strip_clear(item);
            clear |= cleared;
            if !command.is_empty() {
                commands.push(command.to_string());
            }
        }
        if clear {
            self.chords.clear_on_release();
        }
        if commands.is_empty() {
            return vec![if clear {
                Resolution::Cleared(key)
            } else {
                Resolution::Unbound(key)
            }];
        }

        let follow_up = match press_overlay {
            Some(o) => FollowUp::WheelOverlay {
                text: o.text,
                duration: o.duration,
            },
            None => FollowUp::None,
        };
        let finished = self.executor.submit(Job {
            key: key.clone(),
            commands,
            follow_up,
        });

        if finished.is_empty() {
            return vec![Resolution::Dispatched(key)];
        }
        self.settle(finished)
    }

    fn settle(&mut self, finished: Vec<Finished>) -> Vec<Resolution> {
        finished.into_iter().map(|f| self.on_finished(f)).collect()
    }

    /// Shows the overlay for a completed command, or records its failure.
    pub fn on_finished(&mut self, finished: Finished) -> Resolution {
        let Finished {
            key,
            command,
            follow_up,
            result,
        } = finished;

        let output = match result {
            Ok(output) => output,
            Err(e) => {
                let e = Error::from(e);
                self.report(&e);
                return Resolution::Failed(e.to_string());
            }
        };
        debug!("OUTPUT={} ({})", output, command);

        if let Err(e) = self.show_follow_up(&follow_up, &output) {
            let e = Error::from(e);
            self.report(&e);
            return Resolution::Failed(e.to_string());
        }
        Resolution::Executed { key, output }
    }

    fn show_follow_up(&mut self, follow_up: &FollowUp, output: &str) -> Result<(), DeviceError> {
        match follow_up {
            FollowUp::None => Ok(()),
            FollowUp::Flash(text) => self.device.show_overlay_text(SHORT_OVERLAY_SECS, text),
            FollowUp::PressOverlay { template, duration } => self
                .device
                .show_overlay_text(*duration, &format_overlay(template, output)),
            FollowUp::WheelOverlay { text, duration } => self
                .device
                .show_overlay_text(*duration, &wheel_overlay(text, output)),
        }
    }

    pub fn on_battery(&mut self, level: u8) {
        self.battery = Some(level);
        debug!("Current Battery: {}", level);

        let res = if level <= LOW_BATTERY_LEVEL {
            self.device
                .show_overlay_text(BATTERY_OVERLAY_SECS, &format!("Battery is low: {}%", level))
        } else if BATTERY_MILESTONES.contains(&level) {
            info!("Battery level is {}%", level);
            self.device
                .show_overlay_text(BATTERY_OVERLAY_SECS, &format!("Battery level is {}%", level))
        } else {
            Ok(())
        };

        if let Err(e) = res {
            self.report(&Error::from(e));
        }
    }

    pub fn on_notification(&mut self, notification: &Notification) {
        let secs = notification
            .duration
            .unwrap_or(Notification::DEFAULT_DURATION);
        info!("Notification: {}", notification.message);
        if let Err(e) = self.device.show_overlay_text(secs, &notification.message) {
            self.report(&Error::from(e));
        }
    }

    /// Re-reads the current configuration file and reapplies device settings.
    pub fn reload(&mut self) {
        info!("Reloading Settings");
        if let Err(e) = self.reload_from(None, None) {
            self.report(&e);
        }
    }

    fn reload_from(&mut self, path: Option<&Path>, message: Option<&str>) -> Result<(), Error> {
        let config = self.source.read_config(path)?;
        self.install(config);
        self.apply_settings(message)?;
        Ok(())
    }

    fn install(&mut self, config: Config) {
        let timeout = config
            .settings
            .shift_timeout()
            .unwrap_or(DEFAULT_SHIFT_TIMEOUT);
        if timeout != DEFAULT_SHIFT_TIMEOUT {
            info!("CONF Set shiftTimeOut={}", timeout.as_millis());
        }
        self.shift.set_timeout(timeout);
        self.config = config;
    }

    /// Sleep timeout, wheel speed, orientation, colour flash, welcome text and
    /// key labels, in that order. Colour steps after the first are left to
    /// [`Engine::on_tick`] unless the flash interval is zero.
    pub fn apply_settings(&mut self, custom_message: Option<&str>) -> Result<(), DeviceError> {
        let settings = &self.config.settings;

        if let Some(timeout) = settings.sleep_timeout {
            self.device.set_sleep_timeout(timeout)?;
        }
        if let Some(speed) = settings.wheel_speed() {
            self.device.set_wheel_speed(speed)?;
        }
        if let Some(orientation) = settings.display_orientation() {
            self.device.set_display_orientation(orientation)?;
        }
        if let Some(color) = self.config.wheel.color {
            self.flash_wheel(color, Instant::now())?;
        }

        let mut welcome = custom_message
            .map(str::to_owned)
            .unwrap_or_else(|| self.config.settings.welcome_text.clone());
        if let Some(level) = self.battery {
            welcome = format!("{} - Battery: {}%", welcome, level);
        }
        self.device.show_overlay_text(SHORT_OVERLAY_SECS, &welcome)?;

        for (key, binding) in &self.config.buttons {
            if !key.has_label() {
                warn!("Button {} has no display, skipping its label", key);
                break;
            }
            if let Some(text) = &binding.text {
                self.device.set_key_text(*key, &truncate_label(key, text))?;
            }
        }

        Ok(())
    }

    /// Alternates red and the configured colour so the user sees the reload.
    fn flash_wheel(&mut self, color: Rgb, now: Instant) -> Result<(), DeviceError> {
        self.color_steps = VecDeque::from([Rgb::RED, color, Rgb::RED, color, Rgb::RED, color]);
        self.next_color_at = None;

        if self.flash_interval.is_zero() {
            while let Some(step) = self.color_steps.pop_front() {
                self.device.set_wheel_color(step)?;
            }
            return Ok(());
        }

        if let Some(step) = self.color_steps.pop_front() {
            self.device.set_wheel_color(step)?;
        }
        if !self.color_steps.is_empty() {
            self.next_color_at = Some(now + self.flash_interval);
        }
        Ok(())
    }

    /// When [`Engine::on_tick`] has pending work.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.next_color_at
    }

    /// Applies a scheduled colour step once it is due.
    pub fn on_tick(&mut self, now: Instant) {
        match self.next_color_at {
            Some(at) if at <= now => {}
            _ => return,
        }

        self.next_color_at = None;
        let Some(step) = self.color_steps.pop_front() else {
            return;
        };
        if let Err(e) = self.device.set_wheel_color(step) {
            self.color_steps.clear();
            self.report(&Error::from(e));
            return;
        }
        if !self.color_steps.is_empty() {
            self.next_color_at = Some(now + self.flash_interval);
        }
    }

    fn report(&self, e: &Error) {
        let msg = e.to_string();
        error!("{}", msg);
        self.error_log.record(&msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ButtonBinding, PressOverlay, WheelBinding};
    use crate::error::CommandError;
    use crate::executor::{CommandRunner, CommandWorker};
    use crate::testing::{DeviceCall, RecordingDevice, ScriptedRunner, StaticConfigSource};
    use crate::types::{Orientation, WheelSpeed};

    type TestEngine = Engine<RecordingDevice, ScriptedRunner>;

    fn k(i: u8) -> KeyIndex {
        KeyIndex(i)
    }

    fn key(s: &str) -> CommandKey {
        s.parse().unwrap()
    }

    fn button(entries: &[(&str, &str)]) -> ButtonBinding {
        let mut b = ButtonBinding::default();
        for (name, cmd) in entries {
            if let Some(stem) = name.strip_suffix("_flash") {
                b.flashes.insert(key(stem), cmd.to_string());
            } else {
                b.commands.insert(key(name), cmd.to_string());
            }
        }
        b
    }

    fn overlay(text: &str, duration: u32) -> Option<PressOverlay> {
        Some(PressOverlay {
            text: text.to_string(),
            duration,
        })
    }

    fn make_engine(config: Config, runner: ScriptedRunner) -> TestEngine {
        Engine::new(
            RecordingDevice::new(),
            runner,
            Box::new(StaticConfigSource::new(config)),
            ErrorLog::disabled(),
        )
        .unwrap()
        .with_flash_interval(Duration::ZERO)
    }

    fn press<X: Executor>(
        engine: &mut Engine<RecordingDevice, X>,
        key: u8,
        t: Instant,
        held: Duration,
    ) -> Resolution {
        engine.on_down(k(key), t);
        engine.on_up(k(key), t + held)
    }

    #[test]
    fn test_single_press_runs_command_and_overlay() {
        let mut config = Config::default();
        let mut b = button(&[("command", "echo 42")]);
        b.press_overlay = overlay("Result: %output%", 3);
        config.buttons.insert(k(1), b);
        let mut engine = make_engine(config, ScriptedRunner::new().respond("echo 42", "42\n"));

        let res = press(&mut engine, 1, Instant::now(), Duration::from_millis(100));

        assert_eq!(
            res,
            Resolution::Executed {
                key: key("command"),
                output: "42".into()
            }
        );
        assert_eq!(engine.executor().executed, vec!["echo 42"]);
        assert_eq!(engine.device().overlays(), vec![(3, "Result: 42".to_string())]);
    }

    #[test]
    fn test_chord_uses_held_keys_sorted() {
        let mut config = Config::default();
        config
            .buttons
            .insert(k(7), button(&[("command", "plain"), ("command_2_5", "chorded")]));
        let mut engine = make_engine(config, ScriptedRunner::new());
        let t0 = Instant::now();

        engine.on_down(k(5), t0);
        engine.on_down(k(2), t0);
        engine.on_down(k(7), t0);
        let res = engine.on_up(k(7), t0);

        assert!(matches!(res, Resolution::Executed { ref key, .. } if key.to_string() == "command_2_5"));
        assert_eq!(engine.executor().executed, vec!["chorded"]);
        assert_eq!(engine.chord(), vec![k(2), k(5)]);
    }

    #[test]
    fn test_undefined_key_is_silent_and_keeps_shift() {
        let mut config = Config::default();
        config.buttons.insert(k(0), button(&[("command", "shift")]));
        config.buttons.insert(k(1), button(&[("command", "only plain")]));
        let mut engine = make_engine(config, ScriptedRunner::new());
        let t0 = Instant::now();

        press(&mut engine, 0, t0, Duration::ZERO);
        assert_eq!(engine.shift_level(), 1);
        engine.device_mut().clear();

        // Key 1 has no `command_s1` binding.
        let res = press(&mut engine, 1, t0 + Duration::from_millis(100), Duration::ZERO);
        assert_eq!(res, Resolution::Unbound(key("command_s1")));
        assert!(engine.executor().executed.is_empty());
        assert!(engine.device().calls.is_empty());
        assert_eq!(engine.shift_level(), 1);
    }

    #[test]
    fn test_unconfigured_button_is_unbound() {
        let mut engine = make_engine(Config::default(), ScriptedRunner::new());
        let res = press(&mut engine, 4, Instant::now(), Duration::ZERO);
        assert_eq!(res, Resolution::Unbound(key("command")));
    }

    #[test]
    fn test_empty_command_is_noop() {
        let mut config = Config::default();
        config.buttons.insert(k(1), button(&[("command", "")]));
        let mut engine = make_engine(config, ScriptedRunner::new());
        let res = press(&mut engine, 1, Instant::now(), Duration::ZERO);
        assert_eq!(res, Resolution::Unbound(key("command")));
        assert!(engine.executor().executed.is_empty());
    }

    #[test]
    fn test_shift_layer_selects_shifted_binding_then_consumes() {
        let mut config = Config::default();
        config.buttons.insert(k(2), button(&[("command", "shift")]));
        config.buttons.insert(
            k(4),
            button(&[("command", "normal"), ("command_s21", "shifted")]),
        );
        let mut engine = make_engine(config, ScriptedRunner::new());
        let t0 = Instant::now();

        let res = press(&mut engine, 2, t0, Duration::ZERO);
        assert_eq!(res, Resolution::ShiftActivated(21));
        assert_eq!(engine.device().last_overlay().as_deref(), Some("Shift21"));

        press(&mut engine, 4, t0 + Duration::from_millis(500), Duration::ZERO);
        assert_eq!(engine.executor().executed, vec!["shifted"]);
        assert_eq!(engine.shift_level(), 0);

        press(&mut engine, 4, t0 + Duration::from_millis(600), Duration::ZERO);
        assert_eq!(engine.executor().executed, vec!["shifted", "normal"]);
    }

    #[test]
    fn test_repeated_shift_counts_up() {
        let mut config = Config::default();
        config.buttons.insert(k(2), button(&[("command", "shift")]));
        config
            .buttons
            .insert(k(6), button(&[("command_s21", "shift"), ("command_s22", "twice")]));
        let mut engine = make_engine(config, ScriptedRunner::new());
        let t0 = Instant::now();

        press(&mut engine, 2, t0, Duration::ZERO);
        assert_eq!(
            press(&mut engine, 6, t0 + Duration::from_millis(300), Duration::ZERO),
            Resolution::ShiftActivated(22)
        );
        press(&mut engine, 6, t0 + Duration::from_millis(600), Duration::ZERO);
        assert_eq!(engine.executor().executed, vec!["twice"]);
    }

    #[test]
    fn test_shift_expires_lazily() {
        let mut config = Config::default();
        config.buttons.insert(k(2), button(&[("command", "shift")]));
        config.buttons.insert(
            k(4),
            button(&[("command", "normal"), ("command_s21", "shifted")]),
        );
        let mut engine = make_engine(config, ScriptedRunner::new());
        let t0 = Instant::now();

        press(&mut engine, 2, t0, Duration::ZERO);
        assert_eq!(engine.shift_level(), 21);

        // Nothing fires until the next release.
        let later = t0 + DEFAULT_SHIFT_TIMEOUT + Duration::from_millis(10);
        assert_eq!(engine.shift_level(), 21);
        press(&mut engine, 4, later, Duration::ZERO);
        assert_eq!(engine.executor().executed, vec!["normal"]);
        assert_eq!(engine.shift_level(), 0);
    }

    #[test]
    fn test_shift_timeout_from_settings() {
        let mut config = Config::default();
        config.settings.shift_time_out = Some(5000);
        config.buttons.insert(k(1), button(&[("command", "shift")]));
        config
            .buttons
            .insert(k(3), button(&[("command", "normal"), ("command_s11", "shifted")]));
        let mut engine = make_engine(config, ScriptedRunner::new());
        let t0 = Instant::now();

        press(&mut engine, 1, t0, Duration::ZERO);
        press(&mut engine, 3, t0 + Duration::from_secs(4), Duration::ZERO);
        assert_eq!(engine.executor().executed, vec!["shifted"]);
    }

    #[test]
    fn test_duration_variant_selected() {
        let mut config = Config::default();
        config
            .buttons
            .insert(k(1), button(&[("command", "tap"), ("command_d3", "hold")]));
        let mut engine = make_engine(config, ScriptedRunner::new());
        let t0 = Instant::now();

        press(&mut engine, 1, t0, Duration::from_millis(2500));
        press(&mut engine, 1, t0 + Duration::from_secs(5), Duration::from_millis(200));
        assert_eq!(engine.executor().executed, vec!["hold", "tap"]);
    }

    #[test]
    fn test_clear_directive_suppresses_chord_releases_once() {
        let mut config = Config::default();
        config
            .buttons
            .insert(k(7), button(&[("command_3_5", "CLEAR::echo chord")]));
        config.buttons.insert(k(3), button(&[("command", "three")]));
        config.buttons.insert(k(5), button(&[("command", "five")]));
        let mut engine = make_engine(config, ScriptedRunner::new());
        let t0 = Instant::now();

        engine.on_down(k(3), t0);
        engine.on_down(k(5), t0);
        press(&mut engine, 7, t0, Duration::ZERO);
        assert_eq!(engine.executor().executed, vec!["echo chord"]);
        assert_eq!(engine.clear_set(), &[k(3), k(5)]);

        assert_eq!(engine.on_up(k(3), t0), Resolution::Suppressed);
        assert_eq!(engine.on_up(k(5), t0), Resolution::Suppressed);
        assert!(engine.clear_set().is_empty());

        press(&mut engine, 3, t0, Duration::ZERO);
        assert_eq!(engine.executor().executed, vec!["echo chord", "three"]);
    }

    #[test]
    fn test_bare_clear_only_marks_keys() {
        let mut config = Config::default();
        config.buttons.insert(k(2), button(&[("command_1", "CLEAR::")]));
        let mut engine = make_engine(config, ScriptedRunner::new());
        let t0 = Instant::now();

        engine.on_down(k(1), t0);
        let res = press(&mut engine, 2, t0, Duration::ZERO);
        assert_eq!(res, Resolution::Cleared(key("command_1")));
        assert_eq!(engine.clear_set(), &[k(1)]);
        assert!(engine.executor().executed.is_empty());
    }

    #[test]
    fn test_flash_override_wins_over_overlay() {
        let mut config = Config::default();
        let mut b = button(&[("command", "play"), ("command_flash", "Playing")]);
        b.press_overlay = overlay("Out: %output%", 2);
        config.buttons.insert(k(0), b);
        let mut engine = make_engine(config, ScriptedRunner::new().respond("play", "ok"));

        press(&mut engine, 0, Instant::now(), Duration::ZERO);
        assert_eq!(engine.device().overlays(), vec![(1, "Playing".to_string())]);
    }

    #[test]
    fn test_command_failure_is_logged_and_session_continues() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("error.log");

        let mut config = Config::default();
        config.buttons.insert(k(0), button(&[("command_s21", "boom")]));
        config.buttons.insert(k(1), button(&[("command", "fine")]));
        config.buttons.insert(k(2), button(&[("command", "shift")]));
        let mut engine = Engine::new(
            RecordingDevice::new(),
            ScriptedRunner::new().fail("boom", "no such thing"),
            Box::new(StaticConfigSource::new(config)),
            ErrorLog::new(&log_path),
        )
        .unwrap();
        let t0 = Instant::now();

        press(&mut engine, 2, t0, Duration::ZERO);
        let res = press(&mut engine, 0, t0, Duration::ZERO);
        assert!(matches!(res, Resolution::Failed(ref msg) if msg.contains("no such thing")));
        // The shifted binding was used up even though it failed.
        assert_eq!(engine.shift_level(), 0);

        let logged = std::fs::read_to_string(&log_path).unwrap();
        assert_eq!(logged.lines().count(), 1);
        assert!(logged.contains("no such thing"));

        press(&mut engine, 1, t0 + Duration::from_secs(3), Duration::ZERO);
        assert_eq!(engine.executor().executed, vec!["boom", "fine"]);
    }

    #[test]
    fn test_display_failure_is_caught() {
        let mut config = Config::default();
        let mut b = button(&[("command", "run")]);
        b.press_overlay = overlay("done", 1);
        config.buttons.insert(k(0), b);
        let mut engine = make_engine(config, ScriptedRunner::new());
        engine.device_mut().fail_overlays = true;

        let res = press(&mut engine, 0, Instant::now(), Duration::ZERO);
        assert!(matches!(res, Resolution::Failed(_)));
        assert!(engine.chord().is_empty());
    }

    #[test]
    fn test_reload_config_builtin() {
        let mut first = Config::default();
        first.buttons.insert(k(0), button(&[("command", "reload_config")]));
        let mut engine = make_engine(first, ScriptedRunner::new());

        let res = press(&mut engine, 0, Instant::now(), Duration::ZERO);
        assert_eq!(res, Resolution::Reloaded);
        assert_eq!(engine.device().last_overlay().as_deref(), Some(RELOAD_MESSAGE));
    }

    #[test]
    fn test_config_switch_builtin() {
        let mut first = Config::default();
        first
            .buttons
            .insert(k(0), button(&[("command", "config=/etc/qk/alt.json")]));
        let mut alt = Config::default();
        alt.buttons.insert(k(0), button(&[("command", "alt")]));
        alt.buttons.get_mut(&k(0)).unwrap().text = Some("Alternative".into());

        let source = StaticConfigSource::new(first).with_path("/etc/qk/alt.json", alt);
        let mut engine = Engine::new(
            RecordingDevice::new(),
            ScriptedRunner::new(),
            Box::new(source),
            ErrorLog::disabled(),
        )
        .unwrap()
        .with_flash_interval(Duration::ZERO);
        let t0 = Instant::now();

        assert_eq!(press(&mut engine, 0, t0, Duration::ZERO), Resolution::Reloaded);
        assert!(engine
            .device()
            .calls
            .contains(&DeviceCall::KeyText(k(0), "Alternat".into())));

        press(&mut engine, 0, t0, Duration::ZERO);
        assert_eq!(engine.executor().executed, vec!["alt"]);

        // A plain reload keeps reading the switched file.
        engine.reload();
        assert_eq!(engine.config().button(k(0)).unwrap().command(&key("command")), Some("alt"));
    }

    #[test]
    fn test_failed_switch_keeps_old_config() {
        let mut first = Config::default();
        first
            .buttons
            .insert(k(0), button(&[("command", "config=/missing.json")]));
        let mut engine = make_engine(first.clone(), ScriptedRunner::new());

        let res = press(&mut engine, 0, Instant::now(), Duration::ZERO);
        assert!(matches!(res, Resolution::Failed(_)));
        assert_eq!(engine.config(), &first);
    }

    #[test]
    fn test_wheel_sequence_runs_in_order() {
        let mut config = Config::default();
        let mut wheel = WheelBinding::default();
        wheel.commands.insert(
            key("command"),
            WheelCommand::Sequence(vec!["cmd1".into(), "cmd2".into()]),
        );
        wheel.press_overlay = overlay("Vol", 1);
        config.wheel.directions.insert(WheelDirection::Left, wheel);
        let mut engine = make_engine(
            config,
            ScriptedRunner::new().respond("cmd1", "10%").respond("cmd2", ""),
        );

        let res = engine.on_wheel(WheelDirection::Left);
        assert_eq!(res.len(), 2);
        assert_eq!(engine.executor().executed, vec!["cmd1", "cmd2"]);
        assert_eq!(
            engine.device().overlays(),
            vec![(1, "Vol 10%".to_string()), (1, "Vol".to_string())]
        );
    }

    #[test]
    fn test_wheel_is_chord_aware_but_ignores_shift() {
        let mut config = Config::default();
        config.buttons.insert(k(2), button(&[("command", "shift")]));
        let mut wheel = WheelBinding::default();
        wheel
            .commands
            .insert(key("command"), WheelCommand::Single("plain".into()));
        wheel
            .commands
            .insert(key("command_3"), WheelCommand::Single("CLEAR::held".into()));
        config.wheel.directions.insert(WheelDirection::Right, wheel);
        let mut engine = make_engine(config, ScriptedRunner::new());
        let t0 = Instant::now();

        press(&mut engine, 2, t0, Duration::ZERO);
        engine.on_wheel(WheelDirection::Right);
        assert_eq!(engine.shift_level(), 21);

        engine.on_down(k(3), t0);
        engine.on_wheel(WheelDirection::Right);
        assert_eq!(engine.executor().executed, vec!["plain", "held"]);
        assert_eq!(engine.clear_set(), &[k(3)]);
        assert_eq!(engine.on_up(k(3), t0), Resolution::Suppressed);
    }

    #[test]
    fn test_unbound_wheel_runs_noop() {
        let mut engine = make_engine(Config::default(), ScriptedRunner::new());
        let res = engine.on_wheel(WheelDirection::Left);
        assert_eq!(engine.executor().executed, vec![NOOP_COMMAND]);
        assert_eq!(res.len(), 1);
        assert!(engine.device().calls.is_empty());
    }

    #[test]
    fn test_wheel_failure_does_not_stop_sequence() {
        let mut config = Config::default();
        let mut wheel = WheelBinding::default();
        wheel.commands.insert(
            key("command"),
            WheelCommand::Sequence(vec!["bad".into(), "good".into()]),
        );
        config.wheel.directions.insert(WheelDirection::Left, wheel);
        let mut engine = make_engine(config, ScriptedRunner::new().fail("bad", "nope"));

        let res = engine.on_wheel(WheelDirection::Left);
        assert!(matches!(res[0], Resolution::Failed(_)));
        assert!(matches!(res[1], Resolution::Executed { .. }));
    }

    #[test]
    fn test_apply_settings_order() {
        let mut config = Config::default();
        config.settings.sleep_timeout = Some(30);
        config.settings.wheel_step = Some(4);
        config.settings.orientation = Some(90);
        config.settings.welcome_text = "Hello".into();
        config.wheel.color = Some(Rgb::new(0, 0, 255));
        let mut b = ButtonBinding::default();
        b.text = Some("Screenshot".into());
        config.buttons.insert(k(0), b);
        let mut hidden = ButtonBinding::default();
        hidden.text = Some("Hidden".into());
        config.buttons.insert(k(8), hidden);

        let mut engine = make_engine(config, ScriptedRunner::new());
        engine.start().unwrap();

        let blue = Rgb::new(0, 0, 255);
        assert_eq!(
            engine.device().calls,
            vec![
                DeviceCall::SleepTimeout(30),
                DeviceCall::WheelSpeed(WheelSpeed::Faster),
                DeviceCall::Orientation(Orientation::Rotate90),
                DeviceCall::WheelColor(Rgb::RED),
                DeviceCall::WheelColor(blue),
                DeviceCall::WheelColor(Rgb::RED),
                DeviceCall::WheelColor(blue),
                DeviceCall::WheelColor(Rgb::RED),
                DeviceCall::WheelColor(blue),
                DeviceCall::Overlay(1, "Hello".into()),
                DeviceCall::KeyText(k(0), "Screensh".into()),
            ]
        );
    }

    #[test]
    fn test_battery_levels() {
        let mut engine = make_engine(Config::default(), ScriptedRunner::new());
        engine.on_battery(80);
        assert!(engine.device().calls.is_empty());
        engine.on_battery(75);
        engine.on_battery(8);
        assert_eq!(
            engine.device().overlays(),
            vec![
                (4, "Battery level is 75%".to_string()),
                (4, "Battery is low: 8%".to_string())
            ]
        );
        assert_eq!(engine.battery(), Some(8));
    }

    #[test]
    fn test_welcome_includes_known_battery() {
        let mut config = Config::default();
        config.settings.welcome_text = "Hi".into();
        let mut engine = make_engine(config, ScriptedRunner::new());
        engine.on_battery(60);
        engine.reload();
        assert_eq!(
            engine.device().last_overlay().as_deref(),
            Some("Hi - Battery: 60%")
        );
    }

    #[test]
    fn test_notification_default_duration() {
        let mut engine = make_engine(Config::default(), ScriptedRunner::new());
        engine.on_notification(&Notification::new("Mail"));
        engine.on_notification(&Notification::new("Build").with_duration(6));
        assert_eq!(
            engine.device().overlays(),
            vec![(2, "Mail".to_string()), (6, "Build".to_string())]
        );
    }

    #[test]
    fn test_handle_flow() {
        let mut engine = make_engine(Config::default(), ScriptedRunner::new());
        let t0 = Instant::now();
        assert_eq!(engine.handle(DeviceEvent::Down(k(1)), t0), Flow::Continue);
        assert_eq!(engine.chord(), vec![k(1)]);
        assert_eq!(engine.handle(DeviceEvent::Up(k(1)), t0), Flow::Continue);
        assert_eq!(
            engine.handle(DeviceEvent::Error("usb".into()), t0),
            Flow::Fatal("usb".into())
        );
        assert_eq!(engine.handle(DeviceEvent::Disconnected, t0), Flow::Disconnected);
    }

    #[test]
    fn test_hold_time_is_measured_per_key() {
        let mut config = Config::default();
        config.buttons.insert(
            k(1),
            button(&[("command_2", "short"), ("command_2_d2", "long")]),
        );
        let mut engine = make_engine(config, ScriptedRunner::new());
        let t0 = Instant::now();

        // Key 1 is held 2.5s, but key 2 went down only 0.5s before the release.
        engine.on_down(k(1), t0);
        engine.on_down(k(2), t0 + Duration::from_secs(2));
        engine.on_up(k(1), t0 + Duration::from_millis(2500));
        assert_eq!(engine.executor().executed, vec!["long"]);
    }

    #[test]
    fn test_wheel_sequence_items_strip_clear() {
        let mut config = Config::default();
        let mut wheel = WheelBinding::default();
        wheel.commands.insert(
            key("command_3"),
            WheelCommand::Sequence(vec!["CLEAR::first".into(), "second".into()]),
        );
        config.wheel.directions.insert(WheelDirection::Left, wheel);
        let mut engine = make_engine(config, ScriptedRunner::new());
        let t0 = Instant::now();

        engine.on_down(k(3), t0);
        let res = engine.on_wheel(WheelDirection::Left);
        assert_eq!(res.len(), 2);
        assert_eq!(engine.executor().executed, vec!["first", "second"]);
        assert_eq!(engine.clear_set(), &[k(3)]);
    }

    #[test]
    fn test_wheel_colour_flash_is_scheduled() {
        let blue = Rgb::new(0, 0, 255);
        let mut config = Config::default();
        config.settings.welcome_text = "Hi".into();
        config.wheel.color = Some(blue);
        let mut engine = make_engine(config, ScriptedRunner::new())
            .with_flash_interval(Duration::from_millis(200));

        let colors = |engine: &TestEngine| -> Vec<Rgb> {
            engine
                .device()
                .calls
                .iter()
                .filter_map(|c| match c {
                    DeviceCall::WheelColor(rgb) => Some(*rgb),
                    _ => None,
                })
                .collect()
        };

        engine.start().unwrap();
        assert_eq!(colors(&engine), vec![Rgb::RED]);
        assert_eq!(engine.device().last_overlay().as_deref(), Some("Hi"));

        let first = engine.next_deadline().unwrap();
        engine.on_tick(first - Duration::from_millis(1));
        assert_eq!(colors(&engine).len(), 1);

        while let Some(due) = engine.next_deadline() {
            engine.on_tick(due);
        }
        assert_eq!(
            colors(&engine),
            vec![Rgb::RED, blue, Rgb::RED, blue, Rgb::RED, blue]
        );
    }

    /// Blocks on `slow` until the gate opens.
    #[derive(Clone)]
    struct GatedRunner {
        gate: crossbeam_channel::Receiver<()>,
    }

    impl CommandRunner for GatedRunner {
        fn run(&mut self, command: &str) -> Result<String, CommandError> {
            if command == "slow" {
                let _ = self.gate.recv();
            }
            Ok(format!("{} ok", command))
        }
    }

    #[test]
    fn test_events_are_resolved_while_a_command_runs() {
        let mut config = Config::default();
        config.buttons.insert(k(3), button(&[("command", "shift")]));
        let mut slow = button(&[("command_s31", "slow")]);
        slow.press_overlay = overlay("%output%", 1);
        config.buttons.insert(k(1), slow);
        let mut fast = button(&[("command", "fast")]);
        fast.press_overlay = overlay("%output%", 1);
        config.buttons.insert(k(2), fast);

        let (open, gate) = crossbeam_channel::unbounded();
        let worker = CommandWorker::new(GatedRunner { gate });
        let completions = worker.completions();
        let mut engine = Engine::new(
            RecordingDevice::new(),
            worker,
            Box::new(StaticConfigSource::new(config)),
            ErrorLog::disabled(),
        )
        .unwrap()
        .with_flash_interval(Duration::ZERO);
        let t0 = Instant::now();

        press(&mut engine, 3, t0, Duration::ZERO);
        assert_eq!(
            press(&mut engine, 1, t0, Duration::ZERO),
            Resolution::Dispatched(key("command_s31"))
        );
        // Shift is already spent although `slow` has not returned.
        assert_eq!(engine.shift_level(), 0);

        assert_eq!(
            press(&mut engine, 2, t0, Duration::ZERO),
            Resolution::Dispatched(key("command"))
        );
        let done = completions.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(done.command, "fast");
        assert_eq!(
            engine.on_finished(done),
            Resolution::Executed {
                key: key("command"),
                output: "fast ok".into()
            }
        );
        assert_eq!(engine.device().last_overlay().as_deref(), Some("fast ok"));

        open.send(()).unwrap();
        let done = completions.recv_timeout(Duration::from_secs(5)).unwrap();
        engine.on_finished(done);
        assert_eq!(engine.device().last_overlay().as_deref(), Some("slow ok"));
    }

    #[cfg(unix)]
    #[test]
    fn test_backgrounded_shell_command_returns_immediately() {
        use crate::executor::ShellRunner;

        let mut config = Config::default();
        config.buttons.insert(k(1), button(&[("command", "sleep 3 &")]));
        let mut engine = Engine::new(
            RecordingDevice::new(),
            CommandWorker::new(ShellRunner::default()),
            Box::new(StaticConfigSource::new(config)),
            ErrorLog::disabled(),
        )
        .unwrap();

        let started = Instant::now();
        let res = press(&mut engine, 1, started, Duration::ZERO);
        assert_eq!(res, Resolution::Dispatched(key("command")));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
