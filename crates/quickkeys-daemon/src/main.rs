use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::{at, never, select, unbounded, Sender};
use quickkeys_core::config::FileConfigSource;
use quickkeys_core::error_log::ErrorLog;
use quickkeys_core::executor::{CommandRunner, CommandWorker, ShellRunner};
use quickkeys_core::line_protocol::{spawn_reader, InputLine, LineDevice};
use quickkeys_core::notification::DirectoryWatcher;
use quickkeys_core::{ControlEvent, Engine, Flow};
use std::fs::File;
use std::io::{BufRead, BufReader, ErrorKind, Stdout};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const NO_DEVICE_MESSAGE: &str = "No device found. Is it powered on?";
const DEVICE_GRACE: Duration = Duration::from_millis(200);
const DEVICE_POLL: Duration = Duration::from_millis(20);
const NOTIFY_SCRIPT: &str = "scripts/notify-send.sh";

type Daemon = Engine<LineDevice<Stdout>, CommandWorker<ShellRunner>>;

/// Maps QuickKeys remote buttons and wheel to shell commands.
///
/// Device events are read as lines (`down 3`, `up 3`, `wheel left`, ...)
/// and display updates are written to stdout.
#[derive(Parser, Debug)]
#[command(name = "quickkeysd", version)]
struct Cli {
    /// Configuration file. Defaults to $QUICKKEYS_CONFIG, then the user config dir
    #[arg(long)]
    config: Option<PathBuf>,

    /// Device event stream (file or FIFO). Reads stdin when omitted
    #[arg(long)]
    device: Option<PathBuf>,

    /// Where failed actions are appended. Defaults to error.log next to the binary
    #[arg(long)]
    error_log: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `quickkeys_core=trace`. Overrides RUST_LOG
    #[arg(long)]
    log_level: Option<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    // stdout carries device output.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(cli: Cli) -> Result<ExitCode> {
    let error_log = cli
        .error_log
        .map(ErrorLog::new)
        .unwrap_or_else(ErrorLog::beside_executable);
    if let Some(path) = error_log.path() {
        info!("Error log: {}", path.display());
    }

    info!("Looking for connected device...");
    let Some(reader) = open_device(cli.device.as_deref())? else {
        return Ok(no_device(&error_log));
    };

    let source = FileConfigSource::new(cli.config);
    match source.path() {
        Some(path) => info!("Using config {}", path.display()),
        None => warn!("No config path; set --config or QUICKKEYS_CONFIG"),
    }

    // Commands run on worker threads; their overlays come back here.
    let worker = CommandWorker::new(ShellRunner::default());
    let completions = worker.completions();
    let device = LineDevice::new(std::io::stdout());
    let mut engine = Engine::new(
        device,
        worker,
        Box::new(source),
        error_log.clone(),
    )
    .context("failed to load configuration")?;

    let hook = notify_script();
    run_hook(hook.as_deref(), "QuickKeys Connected!");

    engine.start().context("failed to apply device settings")?;

    let (input_tx, input_rx) = unbounded();
    let _reader = spawn_reader(reader, input_tx);

    let (control_tx, control_rx) = unbounded();
    let mut feed = NotificationFeed::default();
    feed.sync(&engine, &control_tx);

    loop {
        let tick = engine.next_deadline().map(at).unwrap_or_else(never);
        let flow = select! {
            recv(input_rx) -> msg => match msg {
                Ok(InputLine::Device(event)) => engine.handle(event, Instant::now()),
                Ok(InputLine::Control(control)) => {
                    apply_control(&mut engine, control);
                    Flow::Continue
                }
                Err(_) => Flow::Disconnected,
            },
            recv(control_rx) -> msg => {
                if let Ok(control) = msg {
                    apply_control(&mut engine, control);
                }
                Flow::Continue
            }
            recv(completions) -> msg => {
                if let Ok(finished) = msg {
                    engine.on_finished(finished);
                }
                Flow::Continue
            }
            recv(tick) -> _ => {
                engine.on_tick(Instant::now());
                Flow::Continue
            }
        };

        match flow {
            Flow::Continue => feed.sync(&engine, &control_tx),
            Flow::Disconnected => {
                run_hook(hook.as_deref(), "QuickKeys Disconnected");
                info!("Device disconnected, exiting");
                return Ok(ExitCode::SUCCESS);
            }
            Flow::Fatal(msg) => {
                error_log.record(&msg);
                return Ok(ExitCode::FAILURE);
            }
        }
    }
}

/// Same status as a clean shutdown: nothing went wrong, there is just no device.
fn no_device(error_log: &ErrorLog) -> ExitCode {
    error!("{}", NO_DEVICE_MESSAGE);
    error_log.record(NO_DEVICE_MESSAGE);
    ExitCode::SUCCESS
}

/// Opens the event stream, giving a device node a short grace period to appear.
fn open_device(path: Option<&Path>) -> Result<Option<Box<dyn BufRead + Send>>> {
    let Some(path) = path else {
        return Ok(Some(Box::new(BufReader::new(std::io::stdin()))));
    };

    let deadline = Instant::now() + DEVICE_GRACE;
    loop {
        match File::open(path) {
            Ok(file) => {
                info!("Device stream {}", path.display());
                return Ok(Some(Box::new(BufReader::new(file))));
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if Instant::now() >= deadline {
                    return Ok(None);
                }
                std::thread::sleep(DEVICE_POLL);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to open {}", path.display()));
            }
        }
    }
}

fn apply_control(engine: &mut Daemon, control: ControlEvent) {
    match control {
        ControlEvent::Notify(notification) => engine.on_notification(&notification),
        ControlEvent::Reload => engine.reload(),
    }
}

/// Follows `settings.notification_path` across reloads.
#[derive(Default)]
struct NotificationFeed {
    dir: Option<PathBuf>,
    _watcher: Option<DirectoryWatcher>,
}

impl NotificationFeed {
    fn sync(&mut self, engine: &Daemon, tx: &Sender<ControlEvent>) {
        let wanted = engine.config().settings.notification_path.as_deref();
        if self.dir.as_deref() == wanted {
            return;
        }

        self.dir = wanted.map(Path::to_path_buf);
        self._watcher = None;
        if let Some(dir) = wanted {
            match DirectoryWatcher::start(dir, tx.clone()) {
                Ok(w) => self._watcher = Some(w),
                Err(e) => warn!("Cannot watch {}: {:#}", dir.display(), e),
            }
        }
    }
}

fn notify_script() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let script = exe.parent()?.join("..").join(NOTIFY_SCRIPT);
    script.is_file().then_some(script)
}

fn run_hook(script: Option<&Path>, message: &str) {
    let Some(script) = script else {
        return;
    };
    let command = format!("'{}' 'QuickKeys' '{}'", script.display(), message);
    if let Err(e) = ShellRunner::default().run(&command) {
        warn!("Notification hook failed: {}", e);
    }
}
