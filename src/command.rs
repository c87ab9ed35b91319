//! One-shot remote command execution.

use crate::{
    error::ConnectionError,
    session::{fulfill, Promise, Session, SessionContext, StartingTask},
    transport::{Channel, ChannelEvent, ChannelRequest},
};
use bytes::Bytes;
use futures::{ready, stream::Stream};
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::sync::{mpsc, oneshot};
use tracing::Instrument;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SshCommand {
    command: String,
}

impl SshCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.command
    }
}

impl From<&str> for SshCommand {
    fn from(command: &str) -> Self {
        Self::new(command)
    }
}

impl From<String> for SshCommand {
    fn from(command: String) -> Self {
        Self::new(command)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandStatus {
    pub exit_status: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandChannel {
    Standard,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandChunk {
    pub channel: CommandChannel,
    pub data: Bytes,
}

/// A piece of output from a running command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutput {
    Chunk(CommandChunk),
    Status(CommandStatus),
}

/// Everything a finished command produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandCapture {
    pub command: SshCommand,
    pub standard_output: Vec<u8>,
    pub error_output: Vec<u8>,
    pub status: Option<CommandStatus>,
}

impl CommandCapture {
    pub(crate) fn new(command: SshCommand) -> Self {
        Self {
            command,
            standard_output: vec![],
            error_output: vec![],
            status: None,
        }
    }

    pub(crate) fn push(&mut self, output: CommandOutput) {
        match output {
            CommandOutput::Chunk(CommandChunk {
                channel: CommandChannel::Standard,
                data,
            }) => self.standard_output.extend_from_slice(&data),
            CommandOutput::Chunk(CommandChunk {
                channel: CommandChannel::Error,
                data,
            }) => self.error_output.extend_from_slice(&data),
            CommandOutput::Status(status) => self.status = Some(status),
        }
    }
}

// ==== state machine ====

#[derive(Debug)]
pub(crate) enum CommandEvent {
    Start(Promise<Result<(), ConnectionError>>),
    RequestFailed,
    Acknowledged,
    Rejected,
    Data(Bytes),
    ExtendedData(Bytes),
    ExitStatus(u32),
    Eof,
    Closed,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum CommandAction {
    None,
    SendExec,
    Forward(CommandOutput),
    Close,
}

#[derive(Debug)]
enum State {
    Idle,
    AwaitingAck(Promise<Result<(), ConnectionError>>),
    Running,
    Ended,
}

#[derive(Debug)]
pub(crate) struct CommandStateMachine {
    state: State,
    status: Option<CommandStatus>,
    remote_eof: bool,
    end: Option<Promise<Result<(), ConnectionError>>>,
}

impl CommandStateMachine {
    pub(crate) fn new(end: Promise<Result<(), ConnectionError>>) -> Self {
        Self {
            state: State::Idle,
            status: None,
            remote_eof: false,
            end: Some(end),
        }
    }

    pub(crate) fn is_ended(&self) -> bool {
        matches!(self.state, State::Ended)
    }

    fn finish(&mut self, result: Result<(), ConnectionError>) {
        self.state = State::Ended;
        if let Some(end) = self.end.take() {
            fulfill(end, result);
        }
    }

    pub(crate) fn handle(&mut self, event: CommandEvent) -> CommandAction {
        match (std::mem::replace(&mut self.state, State::Ended), event) {
            (State::Idle, CommandEvent::Start(promise)) => {
                self.state = State::AwaitingAck(promise);
                CommandAction::SendExec
            }

            (State::AwaitingAck(promise), CommandEvent::Acknowledged) => {
                self.state = State::Running;
                fulfill(promise, Ok(()));
                CommandAction::None
            }
            (State::AwaitingAck(promise), CommandEvent::Rejected)
            | (State::AwaitingAck(promise), CommandEvent::RequestFailed) => {
                fulfill(promise, Err(ConnectionError::Unknown));
                self.finish(Err(ConnectionError::Unknown));
                CommandAction::Close
            }
            (State::AwaitingAck(promise), CommandEvent::Closed) => {
                fulfill(promise, Err(ConnectionError::Unknown));
                self.finish(Err(ConnectionError::Unknown));
                CommandAction::None
            }

            (state @ State::AwaitingAck(..), event) | (state @ State::Running, event) => {
                self.state = state;
                self.running(event)
            }

            (State::Idle, CommandEvent::Closed) => {
                self.finish(Err(ConnectionError::Unknown));
                CommandAction::None
            }
            (State::Ended, _) => CommandAction::None,
            (state, event) => {
                tracing::warn!(?state, ?event, "unexpected command event");
                self.state = state;
                CommandAction::None
            }
        }
    }

    fn running(&mut self, event: CommandEvent) -> CommandAction {
        match event {
            CommandEvent::Data(data) => CommandAction::Forward(CommandOutput::Chunk(CommandChunk {
                channel: CommandChannel::Standard,
                data,
            })),
            CommandEvent::ExtendedData(data) => {
                CommandAction::Forward(CommandOutput::Chunk(CommandChunk {
                    channel: CommandChannel::Error,
                    data,
                }))
            }
            CommandEvent::ExitStatus(exit_status) => {
                if self.status.is_some() {
                    return CommandAction::None;
                }
                let status = CommandStatus { exit_status };
                self.status = Some(status);
                CommandAction::Forward(CommandOutput::Status(status))
            }
            CommandEvent::Eof => {
                self.remote_eof = true;
                CommandAction::Close
            }
            CommandEvent::Closed => {
                // a close without an exit status is only clean after the remote EOF
                let result = if self.status.is_some() || self.remote_eof {
                    Ok(())
                } else {
                    Err(ConnectionError::Unknown)
                };
                self.finish(result);
                CommandAction::None
            }
            event => {
                tracing::warn!(?event, "unexpected event on a running command");
                CommandAction::None
            }
        }
    }
}

// ==== session ====

/// The session side of a command, attached to its channel by the connection.
#[derive(Debug)]
pub(crate) struct CommandSession {
    command: SshCommand,
    outputs: mpsc::UnboundedSender<CommandOutput>,
    end: Promise<Result<(), ConnectionError>>,
}

impl CommandSession {
    pub(crate) fn new(command: SshCommand, task: StartingTask) -> (Self, CommandStream) {
        let (outputs_tx, outputs_rx) = mpsc::unbounded_channel();
        let (end_tx, end_rx) = oneshot::channel();
        let session = Self {
            command,
            outputs: outputs_tx,
            end: end_tx,
        };
        let stream = CommandStream {
            outputs: outputs_rx,
            end: end_rx,
            task,
            finished: false,
            cancelled: false,
        };
        (session, stream)
    }
}

impl Session for CommandSession {
    fn start(self: Box<Self>, context: SessionContext) {
        let CommandSession {
            command,
            outputs,
            end,
        } = *self;
        let driver = CommandDriver {
            command,
            channel: context.channel,
            outputs,
            machine: CommandStateMachine::new(end),
        };
        let span = tracing::debug_span!("exec", command = %driver.command.as_str());
        tokio::spawn(driver.run(context.promise).instrument(span));
    }
}

struct CommandDriver {
    command: SshCommand,
    channel: Channel,
    outputs: mpsc::UnboundedSender<CommandOutput>,
    machine: CommandStateMachine,
}

impl CommandDriver {
    async fn run(mut self, start: Promise<Result<(), ConnectionError>>) {
        self.trigger(CommandEvent::Start(start));

        while !self.machine.is_ended() {
            let event = match self.channel.next_event().await {
                ChannelEvent::Data(data) => CommandEvent::Data(data),
                ChannelEvent::ExtendedData(data) => CommandEvent::ExtendedData(data),
                ChannelEvent::ExitStatus(status) => CommandEvent::ExitStatus(status),
                ChannelEvent::Success => CommandEvent::Acknowledged,
                ChannelEvent::Failure => CommandEvent::Rejected,
                ChannelEvent::Eof => CommandEvent::Eof,
                ChannelEvent::Closed => CommandEvent::Closed,
            };
            self.trigger(event);
        }
        tracing::debug!("command ended");
    }

    fn trigger(&mut self, event: CommandEvent) {
        let mut next = Some(event);
        while let Some(event) = next.take() {
            match self.machine.handle(event) {
                CommandAction::None => {}
                CommandAction::SendExec => {
                    let request = ChannelRequest::Exec {
                        command: self.command.as_str().to_owned(),
                        want_reply: true,
                    };
                    if let Err(err) = self.channel.request(request) {
                        tracing::debug!(?err, "failed to send the exec request");
                        next = Some(CommandEvent::RequestFailed);
                    }
                }
                CommandAction::Forward(output) => {
                    // the receiver may be gone; the command still runs to its end
                    let _ = self.outputs.send(output);
                }
                CommandAction::Close => self.channel.close(),
            }
        }
    }
}

// ==== stream ====

/// Output of a running command, ending once the command does.
///
/// Yields a final `Err` if the command did not end cleanly. Dropping the
/// stream before that cancels the command.
#[derive(Debug)]
pub struct CommandStream {
    outputs: mpsc::UnboundedReceiver<CommandOutput>,
    end: oneshot::Receiver<Result<(), ConnectionError>>,
    task: StartingTask,
    finished: bool,
    cancelled: bool,
}

impl CommandStream {
    /// Close the command's channel. The stream then ends with `Cancelled`.
    pub fn cancel(&mut self) {
        if !self.finished {
            self.cancelled = true;
            self.task.cancel();
        }
    }

    pub(crate) fn abandon(mut self) {
        self.finished = true;
        self.task.did_end(false);
    }
}

impl Stream for CommandStream {
    type Item = Result<CommandOutput, ConnectionError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let me = self.get_mut();
        if me.finished {
            return Poll::Ready(None);
        }

        if let Some(output) = ready!(me.outputs.poll_recv(cx)) {
            return Poll::Ready(Some(Ok(output)));
        }

        let result = ready!(Pin::new(&mut me.end).poll(cx)).unwrap_or(Err(ConnectionError::Unknown));
        me.finished = true;
        me.task.did_end(result.is_ok());

        match result {
            Ok(()) => Poll::Ready(None),
            Err(..) if me.cancelled => Poll::Ready(Some(Err(ConnectionError::Cancelled))),
            Err(err) => Poll::Ready(Some(Err(err))),
        }
    }
}

impl Drop for CommandStream {
    fn drop(&mut self) {
        if !self.finished {
            self.task.cancel();
        }
    }
}
