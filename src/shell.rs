//! Interactive shell sessions.

use crate::{
    error::ConnectionError,
    observer::{ObserverHolder, ObserverToken},
    session::{fulfill, Promise, Session, SessionContext},
    transport::{Channel, ChannelEvent, ChannelRequest},
};
use bytes::Bytes;
use futures::stream::Stream;
use std::{
    pin::Pin,
    task::{Context, Poll},
};
use tokio::sync::{mpsc, oneshot, watch};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShellError {
    #[error("the shell is not running")]
    RequireConnection,

    #[error("unknown shell failure")]
    Unknown,

    #[error("errored in the connection")]
    Connection(
        #[from]
        #[source]
        ConnectionError,
    ),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellState {
    Idle,
    Starting,
    Ready,
    Closing,
    Closed,
    Failed(ShellError),
}

type Completion = Promise<Result<(), ShellError>>;

#[derive(Debug)]
pub(crate) enum ShellEvent {
    RequestStart(Promise<Result<(), ConnectionError>>),
    RequestWrite(Bytes, Completion),
    RequestClose(Completion),
    Started,
    StartFailed,
    Read(Bytes),
    Closed,
}

#[derive(Debug)]
pub(crate) enum ShellAction {
    None,
    SendShellRequest,
    Write(Bytes, Completion),
    Close,
    DataAvailable(Bytes),
}

#[derive(Debug)]
enum State {
    Idle,
    Starting(Promise<Result<(), ConnectionError>>),
    Ready,
    Closing(Vec<Completion>),
    Closed,
    Failed(ShellError),
}

#[derive(Debug)]
pub(crate) struct ShellStateMachine {
    state: State,
}

impl ShellStateMachine {
    pub(crate) fn new() -> Self {
        Self { state: State::Idle }
    }

    pub(crate) fn state(&self) -> ShellState {
        match &self.state {
            State::Idle => ShellState::Idle,
            State::Starting(..) => ShellState::Starting,
            State::Ready => ShellState::Ready,
            State::Closing(..) => ShellState::Closing,
            State::Closed => ShellState::Closed,
            State::Failed(err) => ShellState::Failed(err.clone()),
        }
    }

    pub(crate) fn is_terminal(&self) -> bool {
        matches!(self.state, State::Closed | State::Failed(..))
    }

    pub(crate) fn handle(&mut self, event: ShellEvent) -> ShellAction {
        match (std::mem::replace(&mut self.state, State::Closed), event) {
            (State::Idle, ShellEvent::RequestStart(promise)) => {
                self.state = State::Starting(promise);
                ShellAction::SendShellRequest
            }
            (State::Starting(promise), ShellEvent::Started) => {
                self.state = State::Ready;
                fulfill(promise, Ok(()));
                ShellAction::None
            }
            (State::Starting(promise), ShellEvent::StartFailed) => {
                self.state = State::Failed(ShellError::Unknown);
                fulfill(promise, Err(ConnectionError::Unknown));
                ShellAction::Close
            }
            (State::Starting(promise), ShellEvent::Closed) => {
                self.state = State::Failed(ShellError::Unknown);
                fulfill(promise, Err(ConnectionError::Unknown));
                ShellAction::None
            }
            (State::Starting(promise), ShellEvent::RequestClose(completion)) => {
                fulfill(promise, Err(ConnectionError::Cancelled));
                self.state = State::Closing(vec![completion]);
                ShellAction::Close
            }

            (State::Ready, ShellEvent::RequestWrite(data, completion)) => {
                self.state = State::Ready;
                ShellAction::Write(data, completion)
            }
            (State::Ready, ShellEvent::Read(data)) => {
                self.state = State::Ready;
                ShellAction::DataAvailable(data)
            }
            (State::Ready, ShellEvent::RequestClose(completion)) => {
                self.state = State::Closing(vec![completion]);
                ShellAction::Close
            }
            (State::Ready, ShellEvent::Closed) => {
                self.state = State::Failed(ShellError::Unknown);
                ShellAction::None
            }

            (State::Closing(mut completions), ShellEvent::RequestClose(completion)) => {
                completions.push(completion);
                self.state = State::Closing(completions);
                ShellAction::None
            }
            (State::Closing(completions), ShellEvent::Closed) => {
                for completion in completions {
                    fulfill(completion, Ok(()));
                }
                self.state = State::Closed;
                ShellAction::None
            }

            (state @ State::Closed, ShellEvent::RequestClose(completion))
            | (state @ State::Failed(..), ShellEvent::RequestClose(completion)) => {
                self.state = state;
                fulfill(completion, Ok(()));
                ShellAction::None
            }
            (State::Idle, ShellEvent::RequestClose(completion)) => {
                self.state = State::Idle;
                fulfill(completion, Err(ShellError::RequireConnection));
                ShellAction::None
            }

            (State::Failed(err), ShellEvent::RequestWrite(_, completion)) => {
                fulfill(completion, Err(err.clone()));
                self.state = State::Failed(err);
                ShellAction::None
            }
            (state, ShellEvent::RequestWrite(_, completion)) => {
                self.state = state;
                fulfill(completion, Err(ShellError::RequireConnection));
                ShellAction::None
            }

            // reads are only delivered while ready
            (state, ShellEvent::Read(_)) => {
                self.state = state;
                ShellAction::None
            }

            (state, event) => {
                tracing::warn!(?state, ?event, "unexpected shell event");
                self.state = state;
                ShellAction::None
            }
        }
    }
}

// ==== session ====

type StateCallback = Box<dyn FnMut(&ShellState) + Send>;

enum Command {
    Write(Bytes, Completion),
    Close(Completion),
    AddObserver(StateCallback, oneshot::Sender<ObserverToken>),
    RemoveObserver(ObserverToken),
    AttachReader(mpsc::UnboundedSender<Bytes>),
}

pub(crate) struct ShellSession {
    mailbox: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<ShellState>,
}

impl ShellSession {
    pub(crate) fn new() -> (Self, SshShell) {
        let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ShellState::Idle);
        let session = Self {
            mailbox: mailbox_rx,
            state: state_tx,
        };
        let shell = SshShell {
            mailbox: mailbox_tx,
            state: state_rx,
            reader_taken: false,
        };
        (session, shell)
    }
}

impl Session for ShellSession {
    fn start(self: Box<Self>, context: SessionContext) {
        let ShellSession { mailbox, state } = *self;
        let driver = ShellDriver {
            channel: context.channel,
            machine: ShellStateMachine::new(),
            mailbox,
            mailbox_closed: false,
            reads: None,
            state,
            observers: ObserverHolder::default(),
        };
        tokio::spawn(driver.run(context.promise));
    }
}

struct ShellDriver {
    channel: Channel,
    machine: ShellStateMachine,
    mailbox: mpsc::UnboundedReceiver<Command>,
    mailbox_closed: bool,
    /// Output is discarded until a reader is attached.
    reads: Option<mpsc::UnboundedSender<Bytes>>,
    state: watch::Sender<ShellState>,
    observers: ObserverHolder<ShellState>,
}

impl ShellDriver {
    async fn run(mut self, start: Promise<Result<(), ConnectionError>>) {
        self.trigger(ShellEvent::RequestStart(start));

        while !self.machine.is_terminal() {
            tokio::select! {
                command = self.mailbox.recv(), if !self.mailbox_closed => match command {
                    Some(Command::Write(data, completion)) => {
                        self.trigger(ShellEvent::RequestWrite(data, completion))
                    }
                    Some(Command::Close(completion)) => self.trigger(ShellEvent::RequestClose(completion)),
                    Some(Command::AddObserver(callback, reply)) => {
                        let _ = reply.send(self.observers.add(callback));
                    }
                    Some(Command::RemoveObserver(token)) => {
                        self.observers.remove(token);
                    }
                    Some(Command::AttachReader(reads)) => self.reads = Some(reads),
                    None => {
                        tracing::debug!("shell handle dropped, closing the channel");
                        self.mailbox_closed = true;
                        let (completion, _) = oneshot::channel();
                        self.trigger(ShellEvent::RequestClose(completion));
                    }
                },
                event = self.channel.next_event() => match event {
                    ChannelEvent::Success => self.trigger(ShellEvent::Started),
                    ChannelEvent::Failure => self.trigger(ShellEvent::StartFailed),
                    ChannelEvent::Data(data) | ChannelEvent::ExtendedData(data) => {
                        self.trigger(ShellEvent::Read(data))
                    }
                    ChannelEvent::Closed => self.trigger(ShellEvent::Closed),
                    event => tracing::trace!(?event, "ignoring shell channel event"),
                },
            }
        }
    }

    fn trigger(&mut self, event: ShellEvent) {
        let before = self.machine.state();
        let mut next = Some(event);
        while let Some(event) = next.take() {
            match self.machine.handle(event) {
                ShellAction::None => {}
                ShellAction::SendShellRequest => {
                    if let Err(err) = self.channel.request(ChannelRequest::Shell { want_reply: true }) {
                        tracing::debug!(?err, "failed to send the shell request");
                        next = Some(ShellEvent::StartFailed);
                    }
                }
                ShellAction::Write(data, completion) => {
                    let result = self
                        .channel
                        .send(data)
                        .map_err(|_| ShellError::Unknown);
                    fulfill(completion, result);
                }
                ShellAction::Close => self.channel.close(),
                ShellAction::DataAvailable(data) => match &self.reads {
                    Some(reads) => {
                        let _ = reads.send(data);
                    }
                    None => tracing::trace!(len = data.len(), "no reader attached, dropping shell output"),
                },
            }
        }

        let after = self.machine.state();
        if before != after {
            tracing::debug!(from = ?before, to = ?after, "shell state changed");
            self.state.send_replace(after.clone());
            self.observers.notify(&after);
        }
    }
}

// ==== handle ====

/// A running interactive shell.
///
/// Dropping the handle closes the shell.
#[derive(Debug)]
pub struct SshShell {
    mailbox: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ShellState>,
    reader_taken: bool,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Write(data, _) => f.debug_tuple("Write").field(&data.len()).finish(),
            Command::Close(..) => f.write_str("Close"),
            Command::AddObserver(..) => f.write_str("AddObserver"),
            Command::RemoveObserver(token) => f.debug_tuple("RemoveObserver").field(token).finish(),
            Command::AttachReader(..) => f.write_str("AttachReader"),
        }
    }
}

impl SshShell {
    pub fn state(&self) -> ShellState {
        self.state.borrow().clone()
    }

    /// Take the stream of data written by the remote shell.
    ///
    /// Output that arrives before the reader is taken is discarded. Returns
    /// `None` after the first call.
    pub fn take_reader(&mut self) -> Option<ShellReader> {
        if self.reader_taken {
            return None;
        }
        self.reader_taken = true;
        let (tx, rx) = mpsc::unbounded_channel();
        // an ended shell drops `tx` with the command, so the reader ends at once
        let _ = self.mailbox.send(Command::AttachReader(tx));
        Some(ShellReader { inner: rx })
    }

    /// Write to the shell's input. Fails once the shell has ended.
    pub async fn write(&self, data: impl Into<Bytes>) -> Result<(), ShellError> {
        let (tx, rx) = oneshot::channel();
        if self.mailbox.send(Command::Write(data.into(), tx)).is_err() {
            return Err(self.ended_error());
        }
        rx.await.unwrap_or_else(|_| Err(self.ended_error()))
    }

    // the driver is gone once the shell is terminal
    fn ended_error(&self) -> ShellError {
        match self.state() {
            ShellState::Failed(err) => err,
            _ => ShellError::RequireConnection,
        }
    }

    /// Close the shell. Succeeds immediately if it has already ended.
    pub async fn close(&self) -> Result<(), ShellError> {
        let (tx, rx) = oneshot::channel();
        if self.mailbox.send(Command::Close(tx)).is_err() {
            // the driver only exits once the shell has ended
            return Ok(());
        }
        rx.await.unwrap_or(Ok(()))
    }

    pub async fn add_state_observer<F>(&self, observer: F) -> Result<ObserverToken, ShellError>
    where
        F: FnMut(&ShellState) + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.mailbox
            .send(Command::AddObserver(Box::new(observer), tx))
            .map_err(|_| ShellError::RequireConnection)?;
        rx.await.map_err(|_| ShellError::RequireConnection)
    }

    pub fn remove_state_observer(&self, token: ObserverToken) {
        let _ = self.mailbox.send(Command::RemoveObserver(token));
    }
}

/// Data written by the remote shell. Ends when the shell does.
#[derive(Debug)]
pub struct ShellReader {
    inner: mpsc::UnboundedReceiver<Bytes>,
}

impl Stream for ShellReader {
    type Item = Bytes;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        self.get_mut().inner.poll_recv(cx)
    }
}
