use crate::command_key::CommandKey;
use crate::error::CommandError;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::process::Command;
use tracing::debug;

/// Runs a bound command and hands back what it printed.
pub trait CommandRunner {
    /// Returns trimmed stdout. Non-zero exit is an error.
    fn run(&mut self, command: &str) -> Result<String, CommandError>;
}

/// Runs commands through `sh -c`.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: String,
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }
}

impl ShellRunner {
    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl CommandRunner for ShellRunner {
    fn run(&mut self, command: &str) -> Result<String, CommandError> {
        debug!("Running `{}`", command);
        let output = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .output()
            .map_err(|source| CommandError::Spawn {
                command: command.to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(CommandError::Failed {
                command: command.to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// What to show once a command has printed its output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowUp {
    None,
    /// `<commandKey>_flash` text, shown for one second.
    Flash(String),
    /// Button `press_overlay` template.
    PressOverlay { template: String, duration: u32 },
    /// Wheel `press_overlay` text, followed by the output.
    WheelOverlay { text: String, duration: u32 },
}

/// Commands resolved from one event. They run in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub key: CommandKey,
    pub commands: Vec<String>,
    pub follow_up: FollowUp,
}

/// Outcome of a single command of a [`Job`].
#[derive(Debug)]
pub struct Finished {
    pub key: CommandKey,
    pub command: String,
    pub follow_up: FollowUp,
    pub result: Result<String, CommandError>,
}

/// Takes resolved jobs off the event loop.
pub trait Executor {
    /// Starts `job`. Returns the results that are already known; an executor
    /// running in the background returns none and delivers them later.
    fn submit(&mut self, job: Job) -> Vec<Finished>;
}

/// Runs every command of `job` on the calling thread.
pub fn run_inline<R: CommandRunner + ?Sized>(runner: &mut R, job: Job) -> Vec<Finished> {
    let Job {
        key,
        commands,
        follow_up,
    } = job;
    commands
        .into_iter()
        .map(|command| {
            let result = runner.run(&command);
            Finished {
                key: key.clone(),
                command,
                follow_up: follow_up.clone(),
                result,
            }
        })
        .collect()
}

/// One thread per job; results come back on [`CommandWorker::completions`].
///
/// Jobs are independent of each other, so a command that never returns only
/// holds back its own overlay.
pub struct CommandWorker<R> {
    runner: R,
    tx: Sender<Finished>,
    rx: Receiver<Finished>,
}

impl<R> CommandWorker<R>
where
    R: CommandRunner + Clone + Send + 'static,
{
    pub fn new(runner: R) -> Self {
        let (tx, rx) = unbounded();
        Self { runner, tx, rx }
    }

    pub fn completions(&self) -> Receiver<Finished> {
        self.rx.clone()
    }
}

impl<R> Executor for CommandWorker<R>
where
    R: CommandRunner + Clone + Send + 'static,
{
    fn submit(&mut self, job: Job) -> Vec<Finished> {
        let mut runner = self.runner.clone();
        let tx = self.tx.clone();
        debug!("Dispatching {} ({} commands)", job.key, job.commands.len());
        std::thread::spawn(move || {
            let Job {
                key,
                commands,
                follow_up,
            } = job;
            // Each result goes out as soon as its command returns.
            for command in commands {
                let result = runner.run(&command);
                let finished = Finished {
                    key: key.clone(),
                    command,
                    follow_up: follow_up.clone(),
                    result,
                };
                if tx.send(finished).is_err() {
                    return;
                }
            }
        });
        Vec::new()
    }
}
