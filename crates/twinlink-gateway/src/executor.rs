use std::any::Any;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::thread::JoinHandle;

use tokio::sync::oneshot;

use tracing::{debug, error, info};

use crate::accumulator::NotificationAccumulator;
use crate::authorizer::Authorizer;
use crate::bus::NotificationBus;
use crate::command::CommandContext;
use crate::config::GatewayConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::twin::DigitalTwin;

/// A command run on the gateway thread.
pub type BoxedCommand<T> = Box<dyn FnOnce(&mut CommandContext<'_>) -> Result<T> + Send>;

type Job = Box<dyn FnOnce(&mut Engine) + Send>;

enum WorkItem {
    Run(Job),
    Stop,
}

// The state owned by the gateway thread.
pub(crate) struct Engine {
    twin: DigitalTwin,
    bus: Arc<NotificationBus>,
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown cause")
}

impl Engine {
    pub(crate) const fn new(twin: DigitalTwin, bus: Arc<NotificationBus>) -> Self {
        Self { twin, bus }
    }

    // Changes are not rolled back when a command fails, so its
    // notifications are published in any case.
    fn execute<T, F>(&mut self, authorizer: &dyn Authorizer, command: F) -> Result<T>
    where
        F: FnOnce(&mut CommandContext<'_>) -> Result<T>,
    {
        let mut events = NotificationAccumulator::new();

        let result = catch_unwind(AssertUnwindSafe(|| {
            command(&mut CommandContext::new(
                &mut self.twin,
                authorizer,
                &mut events,
            ))
        }))
        .unwrap_or_else(|panic| {
            let message = panic_message(panic.as_ref());
            error!("A command panicked: {message}");
            Err(Error::new(
                ErrorKind::Command,
                format!("The command panicked: {message}"),
            ))
        });

        if let Err(e) = &result {
            debug!("Command failed: {e}");
        }

        if !events.is_empty() {
            self.bus.publish(events.into_notifications());
        }

        result
    }
}

fn run(receiver: flume::Receiver<WorkItem>, mut engine: Engine) {
    info!("Gateway thread started");
    while let Ok(item) = receiver.recv() {
        match item {
            WorkItem::Run(job) => job(&mut engine),
            WorkItem::Stop => break,
        }
    }
    info!("Gateway thread stopped, {} pending commands dropped", receiver.len());
}

enum State<T> {
    Pending(oneshot::Receiver<Result<T>>),
    Failed(Option<Error>),
}

/// The outcome of a submitted command.
///
/// It resolves exactly once, with either the command output or a single
/// error. Dropping it does not cancel the command.
#[must_use = "a command future does nothing unless awaited"]
pub struct CommandFuture<T> {
    state: State<T>,
}

impl<T> std::fmt::Debug for CommandFuture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &self.state {
            State::Pending(_) => "pending",
            State::Failed(_) => "failed",
        };
        f.debug_struct("CommandFuture").field("state", &state).finish()
    }
}

impl<T> CommandFuture<T> {
    pub(crate) const fn failed(error: Error) -> Self {
        Self {
            state: State::Failed(Some(error)),
        }
    }

    const fn pending(receiver: oneshot::Receiver<Result<T>>) -> Self {
        Self {
            state: State::Pending(receiver),
        }
    }

    /// Blocks the current thread until the command has completed.
    ///
    /// # Panics
    ///
    /// Panics when called from an asynchronous context.
    ///
    /// # Errors
    ///
    /// Returns the command error.
    pub fn blocking_wait(self) -> Result<T> {
        match self.state {
            State::Pending(receiver) => receiver
                .blocking_recv()
                .unwrap_or_else(|_| Err(Error::closed())),
            State::Failed(error) => Err(error.unwrap_or_else(Error::closed)),
        }
    }
}

impl<T> Future for CommandFuture<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            State::Pending(receiver) => Pin::new(receiver)
                .poll(cx)
                .map(|result| result.unwrap_or_else(|_| Err(Error::closed()))),
            State::Failed(error) => Poll::Ready(Err(error.take().unwrap_or_else(Error::closed))),
        }
    }
}

/// Runs the commands one at a time, in submission order, on a dedicated
/// thread.
///
/// The thread is the only owner of the twin. Submitting never blocks: a full
/// bounded queue fails the command with [`ErrorKind::Busy`].
///
/// A command must not wait for another command, it would wait forever.
pub(crate) struct CommandExecutor {
    sender: flume::Sender<WorkItem>,
    closed: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CommandExecutor {
    pub(crate) fn start(config: &GatewayConfig, engine: Engine) -> Result<Self> {
        let (sender, receiver) = match config.queue_capacity {
            Some(capacity) => flume::bounded(capacity),
            None => flume::unbounded(),
        };

        let thread = std::thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || run(receiver, engine))
            .map_err(|e| {
                Error::new(
                    ErrorKind::Closed,
                    format!("Impossible to start the gateway thread: {e}"),
                )
            })?;

        Ok(Self {
            sender,
            closed: AtomicBool::new(false),
            thread: Mutex::new(Some(thread)),
        })
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn submit<T, F>(
        &self,
        authorizer: Arc<dyn Authorizer>,
        command: F,
    ) -> CommandFuture<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut CommandContext<'_>) -> Result<T> + Send + 'static,
    {
        if self.is_closed() {
            return CommandFuture::failed(Error::closed());
        }

        let (sender, receiver) = oneshot::channel();
        let job: Job = Box::new(move |engine: &mut Engine| {
            let result = engine.execute(authorizer.as_ref(), command);
            // The caller may have stopped waiting.
            let _ = sender.send(result);
        });

        match self.sender.try_send(WorkItem::Run(job)) {
            Ok(()) => CommandFuture::pending(receiver),
            Err(flume::TrySendError::Full(_)) => CommandFuture::failed(Error::new(
                ErrorKind::Busy,
                "The gateway queue is full",
            )),
            Err(flume::TrySendError::Disconnected(_)) => CommandFuture::failed(Error::closed()),
        }
    }

    pub(crate) fn submit_batch<T>(
        &self,
        authorizer: &Arc<dyn Authorizer>,
        commands: Vec<BoxedCommand<T>>,
    ) -> Vec<CommandFuture<T>>
    where
        T: Send + 'static,
    {
        commands
            .into_iter()
            .map(|command| self.submit(Arc::clone(authorizer), command))
            .collect()
    }

    // Commands submitted before still run. Commands submitted after fail
    // with a `Closed` error.
    pub(crate) async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let sender = self.sender.clone();
        let thread = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let joined = tokio::task::spawn_blocking(move || {
            // The stop marker waits for room in a bounded queue.
            if sender.send(WorkItem::Stop).is_err() {
                debug!("The gateway thread has already stopped");
            }
            thread.map(JoinHandle::join)
        })
        .await;

        match joined {
            Ok(Some(Err(_))) => error!("The gateway thread panicked"),
            Err(e) => error!("Impossible to join the gateway thread: {e}"),
            Ok(_) => {}
        }
    }
}
