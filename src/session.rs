//! Sessions multiplexed over a connection, and the task that starts them.

use crate::{
    error::ConnectionError,
    transport::{Channel, ChannelCloser},
};
use tokio::sync::{mpsc, oneshot};

/// A single-shot completion.
pub type Promise<T> = oneshot::Sender<T>;

pub(crate) fn fulfill<T>(promise: Promise<T>, value: T) {
    // the caller may have stopped waiting
    let _ = promise.send(value);
}

/// What a session is given when it is attached to a fresh channel.
#[derive(Debug)]
pub struct SessionContext {
    pub channel: Channel,

    /// Resolved once the sub-protocol is ready, or has failed to become so.
    pub promise: Promise<Result<(), ConnectionError>>,
}

/// A sub-protocol running on its own channel.
///
/// `start` must resolve the context's promise exactly once. The connection
/// races it against the start timeout and closes the channel when the
/// timeout wins.
pub trait Session: Send + 'static {
    fn start(self: Box<Self>, context: SessionContext);
}

// ==== starting task ====

#[derive(Debug)]
enum TaskState {
    Initialized,
    Cancelled,
    Launching(ChannelCloser),
    Cancelling(ChannelCloser),
    Ended,
}

#[derive(Debug)]
pub(crate) enum TaskEvent {
    Cancel,
    Launching(ChannelCloser),
    Ended,
    Failed,
}

#[derive(Debug)]
pub(crate) enum TaskAction {
    None,
    End(ChannelCloser),
}

/// Tracks whether a session being started has been cancelled, so that a
/// cancellation arriving before the channel exists is still honoured.
#[derive(Debug)]
pub(crate) struct StartingTaskStateMachine {
    state: TaskState,
}

impl StartingTaskStateMachine {
    pub(crate) fn new() -> Self {
        Self {
            state: TaskState::Initialized,
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        matches!(self.state, TaskState::Ended)
    }

    pub(crate) fn handle(&mut self, event: TaskEvent) -> TaskAction {
        let state = std::mem::replace(&mut self.state, TaskState::Ended);
        let (state, action) = match (state, event) {
            (TaskState::Initialized, TaskEvent::Cancel) => (TaskState::Cancelled, TaskAction::None),
            (TaskState::Initialized, TaskEvent::Launching(closer)) => {
                (TaskState::Launching(closer), TaskAction::None)
            }
            (TaskState::Initialized, TaskEvent::Ended | TaskEvent::Failed) => {
                (TaskState::Ended, TaskAction::None)
            }

            (TaskState::Cancelled, TaskEvent::Cancel) => (TaskState::Cancelled, TaskAction::None),
            (TaskState::Cancelled, TaskEvent::Launching(closer)) => {
                (TaskState::Cancelling(closer.clone()), TaskAction::End(closer))
            }
            (TaskState::Cancelled, TaskEvent::Ended | TaskEvent::Failed) => {
                (TaskState::Ended, TaskAction::None)
            }

            (TaskState::Launching(closer), TaskEvent::Cancel) => {
                (TaskState::Cancelling(closer.clone()), TaskAction::End(closer))
            }
            (TaskState::Launching(_), TaskEvent::Ended | TaskEvent::Failed) => {
                (TaskState::Ended, TaskAction::None)
            }

            (TaskState::Cancelling(closer), TaskEvent::Cancel) => {
                (TaskState::Cancelling(closer), TaskAction::None)
            }
            (TaskState::Cancelling(_), TaskEvent::Ended | TaskEvent::Failed) => {
                (TaskState::Ended, TaskAction::None)
            }

            (TaskState::Ended, _) => (TaskState::Ended, TaskAction::None),

            (state @ TaskState::Launching(..), TaskEvent::Launching(..))
            | (state @ TaskState::Cancelling(..), TaskEvent::Launching(..)) => {
                tracing::warn!(?state, "starting task launched twice");
                (state, TaskAction::None)
            }
        };
        self.state = state;
        action
    }
}

/// A cloneable handle to a session start that may be cancelled.
#[derive(Debug, Clone)]
pub(crate) struct StartingTask {
    mailbox: mpsc::UnboundedSender<TaskEvent>,
}

impl StartingTask {
    /// Spawn the task actor. It exits once the start has ended.
    pub(crate) fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut machine = StartingTaskStateMachine::new();
            while let Some(event) = rx.recv().await {
                if let TaskAction::End(closer) = machine.handle(event) {
                    tracing::debug!("closing the channel of a cancelled session");
                    closer.close();
                }
                if machine.is_finished() {
                    break;
                }
            }
        });
        Self { mailbox: tx }
    }

    pub(crate) fn cancel(&self) {
        let _ = self.mailbox.send(TaskEvent::Cancel);
    }

    pub(crate) fn did_launch(&self, closer: ChannelCloser) {
        if self.mailbox.send(TaskEvent::Launching(closer.clone())).is_err() {
            // already ended; nothing will ever cancel it
            tracing::trace!(?closer, "launch reported after the task ended");
        }
    }

    pub(crate) fn did_end(&self, succeeded: bool) {
        let event = if succeeded {
            TaskEvent::Ended
        } else {
            TaskEvent::Failed
        };
        let _ = self.mailbox.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelCommand;

    #[test]
    fn cancel_before_launch_closes_on_launch() {
        let (channel, mut peer) = Channel::pair();
        let mut machine = StartingTaskStateMachine::new();

        assert!(matches!(machine.handle(TaskEvent::Cancel), TaskAction::None));
        match machine.handle(TaskEvent::Launching(channel.closer())) {
            TaskAction::End(closer) => closer.close(),
            action => panic!("unexpected action: {:?}", action),
        }
        assert_eq!(peer.try_next_command(), Some(ChannelCommand::Close));

        assert!(matches!(machine.handle(TaskEvent::Failed), TaskAction::None));
        assert!(machine.is_finished());
    }

    #[test]
    fn cancel_after_launch_ends_once() {
        let (channel, _peer) = Channel::pair();
        let mut machine = StartingTaskStateMachine::new();

        machine.handle(TaskEvent::Launching(channel.closer()));
        assert!(matches!(machine.handle(TaskEvent::Cancel), TaskAction::End(..)));
        assert!(matches!(machine.handle(TaskEvent::Cancel), TaskAction::None));
    }

    #[test]
    fn cancel_after_end_is_noop() {
        let (channel, _peer) = Channel::pair();
        let mut machine = StartingTaskStateMachine::new();

        machine.handle(TaskEvent::Launching(channel.closer()));
        machine.handle(TaskEvent::Ended);
        assert!(matches!(machine.handle(TaskEvent::Cancel), TaskAction::None));
        assert!(machine.is_finished());
    }

    #[tokio::test]
    async fn spawned_task_closes_late_launch() {
        let (channel, mut peer) = Channel::pair();
        let task = StartingTask::spawn();

        task.cancel();
        task.did_launch(channel.closer());

        assert_eq!(peer.next_command().await, Some(ChannelCommand::Close));
    }
}
