use std::collections::HashMap;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::VehicleError;

/// Lifecycle of one in-flight command. Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl CommandStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommandStatus::Completed
                | CommandStatus::Failed
                | CommandStatus::Cancelled
                | CommandStatus::TimedOut
        )
    }
}

/// Final outcome of a command, delivered to every awaiter.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub command: &'static str,
    pub status: CommandStatus,
    pub duration: Duration,
    /// Last progress map the driver published.
    pub details: HashMap<String, Value>,
    pub error: Option<VehicleError>,
}

impl CommandResult {
    pub fn succeeded(&self) -> bool {
        self.status == CommandStatus::Completed
    }

    /// Treat any non-completed outcome as an error, surfacing the typed
    /// cause when the driver recorded one.
    pub fn require_success(&self) -> Result<(), VehicleError> {
        if self.succeeded() {
            return Ok(());
        }
        Err(self.error.clone().unwrap_or(VehicleError::Cancelled {
            command: self.command,
        }))
    }
}

#[derive(Default)]
struct HandleState {
    progress: HashMap<String, Value>,
    error: Option<VehicleError>,
    result: Option<CommandResult>,
}

struct HandleInner {
    command: &'static str,
    created: Instant,
    timeout: Option<Duration>,
    continuous: bool,
    status: watch::Sender<CommandStatus>,
    state: Mutex<HandleState>,
    cancel_requested: AtomicBool,
    cancel_action: AtomicBool,
}

/// Observable, cancellable, awaitable view of one outstanding command.
///
/// The vehicle core owns the driving task; user code holds clones of this
/// handle. Awaiting the handle (or calling [`result`](Self::result))
/// suspends until a terminal state and yields the [`CommandResult`].
#[derive(Clone)]
pub struct CommandHandle {
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for CommandHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandHandle")
            .field("command", &self.inner.command)
            .field("status", &self.status())
            .finish()
    }
}

impl CommandHandle {
    pub(crate) fn new(command: &'static str, timeout: Option<Duration>, continuous: bool) -> Self {
        let (status, _) = watch::channel(CommandStatus::Pending);
        Self {
            inner: Arc::new(HandleInner {
                command,
                created: Instant::now(),
                timeout,
                continuous,
                status,
                state: Mutex::new(HandleState::default()),
                cancel_requested: AtomicBool::new(false),
                cancel_action: AtomicBool::new(true),
            }),
        }
    }

    pub fn command(&self) -> &'static str {
        self.inner.command
    }

    pub fn status(&self) -> CommandStatus {
        *self.inner.status.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.status() == CommandStatus::Running
    }

    pub fn is_complete(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn succeeded(&self) -> bool {
        self.status() == CommandStatus::Completed
    }

    pub fn was_cancelled(&self) -> bool {
        self.status() == CommandStatus::Cancelled
    }

    pub fn timed_out(&self) -> bool {
        self.status() == CommandStatus::TimedOut
    }

    /// A command that never self-terminates (continuous velocity); it is
    /// superseded rather than rejected when a new command arrives.
    pub fn is_continuous(&self) -> bool {
        self.inner.continuous
    }

    /// Wall time since the command was created, frozen at completion.
    pub fn elapsed_time(&self) -> Duration {
        let state = self.inner.state.lock().unwrap();
        match &state.result {
            Some(result) => result.duration,
            None => self.inner.created.elapsed(),
        }
    }

    /// Time until the command's deadline, if it has one.
    pub fn time_remaining(&self) -> Option<Duration> {
        let timeout = self.inner.timeout?;
        Some(timeout.saturating_sub(self.inner.created.elapsed()))
    }

    /// Command-specific progress map, updated by the driver while running.
    pub fn progress(&self) -> HashMap<String, Value> {
        self.inner.state.lock().unwrap().progress.clone()
    }

    pub fn error(&self) -> Option<VehicleError> {
        self.inner.state.lock().unwrap().error.clone()
    }

    /// Request cancellation and wait for the driver to acknowledge by
    /// reaching a terminal state. Idempotent; returns false when the
    /// command is already terminal.
    pub async fn cancel(&self, execute_cancel_action: bool) -> bool {
        if self.status().is_terminal() {
            return false;
        }
        self.request_cancel(execute_cancel_action);
        let mut rx = self.inner.status.subscribe();
        while !rx.borrow_and_update().is_terminal() {
            if rx.changed().await.is_err() {
                break;
            }
        }
        true
    }

    /// Raise the cancel flag without waiting for acknowledgement. Used when
    /// a superseding command must not block on the old driver.
    pub(crate) fn request_cancel(&self, execute_cancel_action: bool) {
        self.inner
            .cancel_action
            .store(execute_cancel_action, Ordering::SeqCst);
        self.inner.cancel_requested.store(true, Ordering::SeqCst);
    }

    /// Suspend until terminal, or until `timeout` elapses. Returns `None`
    /// when the wait itself timed out (the command keeps running).
    pub async fn wait(&self, timeout: Option<Duration>) -> Option<CommandResult> {
        match timeout {
            None => Some(self.result().await),
            Some(t) => tokio::time::timeout(t, self.result()).await.ok(),
        }
    }

    /// Suspend until the command reaches a terminal state.
    pub async fn result(&self) -> CommandResult {
        let mut rx = self.inner.status.subscribe();
        while !rx.borrow_and_update().is_terminal() {
            if rx.changed().await.is_err() {
                break;
            }
        }
        self.inner
            .state
            .lock()
            .unwrap()
            .result
            .clone()
            .expect("terminal command has a result")
    }

    pub(crate) fn same_as(&self, other: &CommandHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // Driver-side API.

    pub(crate) fn mark_running(&self) {
        self.inner.status.send_if_modified(|status| {
            if *status == CommandStatus::Pending {
                *status = CommandStatus::Running;
                true
            } else {
                false
            }
        });
    }

    pub(crate) fn cancel_requested(&self) -> bool {
        self.inner.cancel_requested.load(Ordering::SeqCst)
    }

    pub(crate) fn cancel_action_requested(&self) -> bool {
        self.inner.cancel_action.load(Ordering::SeqCst)
    }

    pub(crate) fn deadline_exceeded(&self) -> bool {
        match self.inner.timeout {
            Some(timeout) => self.inner.created.elapsed() > timeout,
            None => false,
        }
    }

    pub(crate) fn timeout(&self) -> Option<Duration> {
        self.inner.timeout
    }

    pub(crate) fn set_progress<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (&'static str, Value)>,
    {
        let mut state = self.inner.state.lock().unwrap();
        for (key, value) in entries {
            state.progress.insert(key.to_string(), value);
        }
    }

    /// Move to a terminal state. First writer wins; later calls are no-ops,
    /// which is what makes cancellation racing natural completion safe.
    pub(crate) fn finish(&self, status: CommandStatus, error: Option<VehicleError>) {
        debug_assert!(status.is_terminal());
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.result.is_some() {
                return;
            }
            state.error = error.clone();
            state.result = Some(CommandResult {
                command: self.inner.command,
                status,
                duration: self.inner.created.elapsed(),
                details: state.progress.clone(),
                error,
            });
        }
        self.inner.status.send_replace(status);
    }
}

impl IntoFuture for CommandHandle {
    type Output = CommandResult;
    type IntoFuture = Pin<Box<dyn Future<Output = CommandResult> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.result().await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_flow_and_observations() {
        let handle = CommandHandle::new("goto", Some(Duration::from_secs(300)), false);
        assert_eq!(handle.status(), CommandStatus::Pending);
        assert!(!handle.is_running());
        assert!(!handle.is_complete());

        handle.mark_running();
        assert!(handle.is_running());
        assert!(handle.time_remaining().unwrap() <= Duration::from_secs(300));

        handle.set_progress([("distance", Value::from(42.0))]);
        handle.finish(CommandStatus::Completed, None);
        assert!(handle.is_complete());
        assert!(handle.succeeded());
        assert!(!handle.is_running());
        assert!(handle.error().is_none());
    }

    #[test]
    fn terminal_status_is_absorbing() {
        let handle = CommandHandle::new("land", None, false);
        handle.mark_running();
        handle.finish(CommandStatus::Cancelled, None);
        // A racing natural completion must not overwrite the outcome.
        handle.finish(CommandStatus::Completed, None);
        assert!(handle.was_cancelled());
        assert!(!handle.succeeded());
        // mark_running on a terminal handle is also a no-op.
        handle.mark_running();
        assert!(handle.was_cancelled());
    }

    #[tokio::test]
    async fn await_resolves_with_result() {
        let handle = CommandHandle::new("takeoff", None, false);
        let driver = handle.clone();
        tokio::spawn(async move {
            driver.mark_running();
            driver.set_progress([("target_altitude", Value::from(10.0))]);
            tokio::time::sleep(Duration::from_millis(20)).await;
            driver.finish(CommandStatus::Completed, None);
        });
        let result = handle.await;
        assert_eq!(result.status, CommandStatus::Completed);
        assert_eq!(result.command, "takeoff");
        assert_eq!(result.details["target_altitude"], Value::from(10.0));
        assert!(result.require_success().is_ok());
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let handle = CommandHandle::new("goto", None, false);
        let driver = handle.clone();
        tokio::spawn(async move {
            driver.mark_running();
            loop {
                if driver.cancel_requested() {
                    driver.finish(CommandStatus::Cancelled, None);
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        assert!(handle.cancel(true).await);
        assert!(handle.was_cancelled());
        // Second cancel: already terminal.
        assert!(!handle.cancel(true).await);
        assert!(handle.was_cancelled());
        let result = handle.result().await;
        assert_eq!(result.status, CommandStatus::Cancelled);
        assert!(matches!(
            result.require_success(),
            Err(VehicleError::Cancelled { command: "goto" })
        ));
    }

    #[tokio::test]
    async fn wait_with_timeout_returns_none_while_running() {
        let handle = CommandHandle::new("orbit", None, false);
        handle.mark_running();
        assert!(handle.wait(Some(Duration::from_millis(30))).await.is_none());
        assert!(handle.is_running());
        handle.finish(CommandStatus::TimedOut, Some(VehicleError::CommandTimeout {
            command: "orbit",
            timeout: Duration::from_secs(60),
        }));
        let result = handle.wait(Some(Duration::from_millis(30))).await.unwrap();
        assert!(handle.timed_out());
        assert!(matches!(
            result.error,
            Some(VehicleError::CommandTimeout { .. })
        ));
    }
}
