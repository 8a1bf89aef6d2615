#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results
)]
#![warn(unreachable_pub)]

//! Ties `config`, `registry`, and `dispatch` together into the
//! single-threaded event loop described by `spec.md` §5: one thread owns
//! the registry and dispatcher; tasks arrive over a channel, commands
//! (`StopAll`) arrive over another, and completions are drained on a
//! fixed tick. Building the actual current-thread Tokio runtime is left
//! to the binary crate (`cli`), the same way `tokio::main` is applied at
//! the edge rather than inside a library.

use std::time::Duration;

use context::Context;
use dispatch::Dispatcher;
use registry::Registry;
use task::Task;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// How often the event loop drains completion channels when neither a
/// command nor a task is immediately available.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// All the errors that can occur when running the engine.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Loading or resolving the configuration file failed.
    #[error("configuration error: {0}")]
    Config(#[from] config::Error),

    /// Sending a command to a running engine failed (its loop has
    /// already exited).
    #[error("command '{command}' could not be delivered: {error}")]
    Command {
        /// The command that failed to send.
        command: &'static str,
        /// The underlying channel error.
        error: String,
    },

    /// Dispatching a task to a running engine failed (its loop has
    /// already exited).
    #[error("task {task_id} could not be delivered: {error}")]
    Task {
        /// The task that failed to send.
        task_id: u16,
        /// The underlying channel error.
        error: String,
    },
}

/// Methods the engine calls at the edges of its run. Mirrors the
/// teacher crate's `Observer`: synchronous, best-effort, never on the
/// critical dispatch path.
pub trait Observer: Send {
    /// Called once the registry has been checked and the event loop is
    /// about to start polling.
    fn on_started(&self) {}
    /// Called after every instance has been torn down, just before
    /// `run` returns.
    fn on_stopped(&self) {}
}

/// Commands the engine accepts from outside its own thread.
#[derive(Debug)]
#[non_exhaustive]
pub enum Command {
    /// Tears every output instance down and stops the event loop.
    StopAll,
}

impl Command {
    /// The command's name, for logging and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Command::StopAll => "stop_all",
        }
    }
}

/// A cheap, cloneable handle used to send [`Command`]s into a running
/// engine from another task or thread.
#[derive(Clone)]
pub struct CommandHandler {
    sender: mpsc::Sender<Command>,
}

impl CommandHandler {
    /// Wraps a command channel's sender half.
    pub fn new(sender: mpsc::Sender<Command>) -> Self {
        Self { sender }
    }

    /// Sends a command to the engine, failing if its loop has already
    /// exited.
    pub fn send(&self, command: Command) -> Result<(), Error> {
        let command_name = command.name();
        self.sender.try_send(command).map_err(|err| Error::Command {
            command: command_name,
            error: err.to_string(),
        })
    }
}

/// A cheap, cloneable handle used to deliver [`Task`]s into a running
/// engine's dispatcher.
#[derive(Clone)]
pub struct TaskHandle {
    sender: mpsc::UnboundedSender<Task>,
}

impl TaskHandle {
    /// Wraps a task channel's sender half.
    pub fn new(sender: mpsc::UnboundedSender<Task>) -> Self {
        Self { sender }
    }

    /// Delivers `task` to the engine for dispatch, failing if its loop
    /// has already exited.
    pub fn dispatch(&self, task: Task) -> Result<(), Error> {
        let task_id = task.id;
        self.sender.send(task).map_err(|err| Error::Task {
            task_id,
            error: err.to_string(),
        })
    }
}

/// Builds the three channels a caller needs to drive an [`Engine`]:
/// a `(Sender, Receiver)` pair for commands, and for tasks.
pub fn channels() -> (
    CommandHandler,
    mpsc::Receiver<Command>,
    TaskHandle,
    mpsc::UnboundedReceiver<Task>,
) {
    let (command_tx, command_rx) = mpsc::channel(8);
    let (task_tx, task_rx) = mpsc::unbounded_channel();
    (CommandHandler::new(command_tx), command_rx, TaskHandle::new(task_tx), task_rx)
}

/// Owns the registry and dispatcher for the lifetime of one run of the
/// event loop.
pub struct Engine {
    registry: Registry,
    process_id: String,
    context: Context,
}

impl Engine {
    /// Creates an engine around an already-populated registry (typically
    /// built with `config::load_into`) and the process-wide `context`
    /// every instance's `init` will be able to read.
    pub fn new(registry: Registry, process_id: impl Into<String>, context: Context) -> Self {
        Self {
            registry,
            process_id: process_id.into(),
            context,
        }
    }

    /// Mutable access to the registry before the event loop starts
    /// (property overrides, programmatic instance creation).
    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    /// Runs the single-threaded event loop to completion: checks every
    /// instance's `init`, then alternates between accepting tasks,
    /// accepting commands, and draining completions, until
    /// [`Command::StopAll`] is received or every task channel closes.
    /// Every instance is torn down before this returns.
    pub async fn run(
        self,
        mut command_receiver: mpsc::Receiver<Command>,
        mut task_receiver: mpsc::UnboundedReceiver<Task>,
        observer: Option<Box<dyn Observer>>,
    ) -> Result<(), Error> {
        let Self { mut registry, process_id, context } = self;

        let failures = registry.check(&process_id, &context).await;
        if failures > 0 {
            warn!(process_id = %process_id, failures, "some output instances failed to initialize");
        }

        let mut dispatcher = Dispatcher::new(registry, process_id.clone());
        if let Some(observer) = &observer {
            observer.on_started();
        }
        info!(process_id = %process_id, "engine started");

        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        loop {
            tokio::select! {
                biased;

                Some(command) = command_receiver.recv() => {
                    match command {
                        Command::StopAll => {
                            debug!(process_id = %process_id, "stop_all received");
                            break;
                        }
                    }
                }

                maybe_task = task_receiver.recv() => {
                    match maybe_task {
                        Some(task) => dispatcher.dispatch(task),
                        None => {
                            debug!(process_id = %process_id, "task channel closed, stopping");
                            break;
                        }
                    }
                }

                _ = ticker.tick() => {
                    for (task_id, outcome) in dispatcher.poll_completions() {
                        trace!(task_id, ?outcome, "task outcome applied");
                    }
                }
            }
        }

        // Drain any completions already in flight before tearing instances
        // down, so metrics reflect everything that actually finished.
        for (task_id, outcome) in dispatcher.poll_completions() {
            trace!(task_id, ?outcome, "task outcome applied during drain");
        }

        let instance_ids: Vec<u32> = dispatcher.registry().instances().iter().map(|i| i.id).collect();
        for instance_id in instance_ids {
            match dispatcher.registry_mut().destroy(instance_id, &process_id).await {
                Ok(active_contexts) => dispatcher.cancel_instance(instance_id, active_contexts),
                Err(err) => warn!(process_id = %process_id, instance_id, error = %err, "instance teardown failed"),
            }
        }

        if let Some(observer) = &observer {
            observer.on_stopped();
        }
        info!(process_id = %process_id, "engine stopped");
        Ok(())
    }
}
