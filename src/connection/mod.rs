//! The connection facade and the actor driving its lifecycle.

mod state;

pub use self::state::ConnectionState;

use self::state::{
    AttemptId, ConnectionAction, ConnectionEvent, ConnectionStateMachine, SessionRequest,
};
use crate::{
    command::{CommandCapture, CommandSession, CommandStream, SshCommand},
    error::ConnectionError,
    observer::{ObserverHolder, ObserverToken},
    session::{fulfill, Session, SessionContext, StartingTask},
    sftp::{SftpClient, SftpConfig, SftpSession},
    shell::{ShellSession, SshShell},
    transport::{Authentication, Channel, Transport, TransportConfig, TransportLink},
};
use futures::StreamExt;
use std::{fmt, sync::Arc, time::Duration};
use tracing::Instrument;
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::{self, Instant},
};

type StateCallback = Box<dyn FnMut(&ConnectionState) + Send>;

enum Command {
    Event(ConnectionEvent),
    AddObserver(StateCallback, oneshot::Sender<ObserverToken>),
    RemoveObserver(ObserverToken),
}

/// A client connection to an SSH server, multiplexing shell, exec and SFTP
/// sessions over a single authenticated transport.
///
/// Handles are cheap to clone. The link is torn down once every handle has
/// been dropped.
#[derive(Clone)]
pub struct SshConnection {
    host: Arc<str>,
    port: u16,
    mailbox: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl fmt::Debug for SshConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshConnection")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl SshConnection {
    /// Create a connection in the idle state.
    ///
    /// Must be called from within a tokio runtime; the lifecycle actor is
    /// spawned onto it.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        authentication: Authentication,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let host: String = host.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);

        let actor = ConnectionActor {
            host: host.clone(),
            port,
            authentication,
            transport,
            machine: ConnectionStateMachine::new(),
            observers: ObserverHolder::default(),
            state: state_tx,
            mailbox: rx,
            notifier: tx.downgrade(),
        };
        tokio::spawn(actor.run());

        Self {
            host: host.into(),
            port,
            mailbox: tx,
            state: state_rx,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Connect and authenticate, bounded by `timeout`.
    ///
    /// Concurrent calls share a single attempt; calling it on a ready
    /// connection succeeds immediately.
    pub async fn start(&self, timeout: Duration) -> Result<(), ConnectionError> {
        self.submit(|promise| ConnectionEvent::RequestConnection(timeout, promise))
            .await
    }

    /// Disconnect. Always succeeds; pending connects fail with `Cancelled`.
    pub async fn cancel(&self) {
        if let Err(err) = self
            .submit(ConnectionEvent::RequestDisconnection)
            .await
        {
            tracing::debug!(?err, "disconnection did not complete cleanly");
        }
    }

    /// Register a callback invoked on every state change.
    ///
    /// The callback runs on the connection actor and must not block.
    pub async fn add_state_observer<F>(&self, observer: F) -> Result<ObserverToken, ConnectionError>
    where
        F: FnMut(&ConnectionState) + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.mailbox
            .send(Command::AddObserver(Box::new(observer), tx))
            .map_err(|_| ConnectionError::ConnectionClosed)?;
        rx.await.map_err(|_| ConnectionError::ConnectionClosed)
    }

    pub fn remove_state_observer(&self, token: ObserverToken) {
        let _ = self.mailbox.send(Command::RemoveObserver(token));
    }

    /// Start an interactive shell.
    pub async fn request_shell(&self, timeout: Duration) -> Result<SshShell, ConnectionError> {
        let (session, shell) = ShellSession::new();
        self.start_session(Box::new(session), timeout, None).await?;
        Ok(shell)
    }

    /// Start an SFTP session with the default configuration.
    pub async fn request_sftp_client(
        &self,
        timeout: Duration,
    ) -> Result<SftpClient, ConnectionError> {
        self.request_sftp_client_with(SftpConfig::default(), timeout)
            .await
    }

    pub async fn request_sftp_client_with(
        &self,
        config: SftpConfig,
        timeout: Duration,
    ) -> Result<SftpClient, ConnectionError> {
        let (session, client) = SftpSession::new(config);
        self.start_session(Box::new(session), timeout, None).await?;
        client.await.map_err(|_| ConnectionError::Unknown)
    }

    /// Run a command to completion and collect its output.
    ///
    /// `timeout` bounds opening the channel and the acknowledgement of the
    /// exec request, not the command itself.
    pub async fn execute(
        &self,
        command: impl Into<SshCommand>,
        timeout: Duration,
    ) -> Result<CommandCapture, ConnectionError> {
        let command = command.into();
        let mut stream = self.stream(command.clone(), timeout).await?;

        let mut capture = CommandCapture::new(command);
        while let Some(output) = stream.next().await {
            capture.push(output?);
        }
        Ok(capture)
    }

    /// Run a command and stream its output as it arrives.
    ///
    /// Dropping the returned stream before it ends cancels the command.
    pub async fn stream(
        &self,
        command: impl Into<SshCommand>,
        timeout: Duration,
    ) -> Result<CommandStream, ConnectionError> {
        let task = StartingTask::spawn();
        let (session, stream) = CommandSession::new(command.into(), task.clone());
        match self.start_session(Box::new(session), timeout, Some(task)).await {
            Ok(()) => Ok(stream),
            Err(err) => {
                stream.abandon();
                Err(err)
            }
        }
    }

    async fn start_session(
        &self,
        session: Box<dyn Session>,
        timeout: Duration,
        task: Option<StartingTask>,
    ) -> Result<(), ConnectionError> {
        self.submit(|promise| {
            ConnectionEvent::RequestSession(SessionRequest {
                session,
                timeout,
                promise,
                task,
            })
        })
        .await
    }

    async fn submit<F>(&self, f: F) -> Result<(), ConnectionError>
    where
        F: FnOnce(oneshot::Sender<Result<(), ConnectionError>>) -> ConnectionEvent,
    {
        let (tx, rx) = oneshot::channel();
        self.mailbox
            .send(Command::Event(f(tx)))
            .map_err(|_| ConnectionError::ConnectionClosed)?;
        rx.await.unwrap_or(Err(ConnectionError::Unknown))
    }
}

// ==== actor ====

struct ConnectionActor {
    host: String,
    port: u16,
    authentication: Authentication,
    transport: Arc<dyn Transport>,
    machine: ConnectionStateMachine,
    observers: ObserverHolder<ConnectionState>,
    state: watch::Sender<ConnectionState>,
    mailbox: mpsc::UnboundedReceiver<Command>,
    // helper tasks must not keep the actor alive once every handle is gone
    notifier: mpsc::WeakUnboundedSender<Command>,
}

impl ConnectionActor {
    async fn run(mut self) {
        while let Some(command) = self.mailbox.recv().await {
            match command {
                Command::Event(event) => self.trigger(event),
                Command::AddObserver(callback, reply) => {
                    let _ = reply.send(self.observers.add(callback));
                }
                Command::RemoveObserver(token) => {
                    self.observers.remove(token);
                }
            }
        }

        if let Some(link) = self.machine.link() {
            tracing::debug!(host = %self.host, "all handles dropped, closing the link");
            link.close();
        }
    }

    fn trigger(&mut self, event: ConnectionEvent) {
        let before = self.machine.state();
        let action = self.machine.handle(event);
        let after = self.machine.state();

        if before != after {
            tracing::debug!(host = %self.host, from = ?before, to = ?after, "connection state changed");
            self.state.send_replace(after.clone());
            self.observers.notify(&after);
        }

        self.perform(action);
    }

    fn perform(&mut self, action: ConnectionAction) {
        match action {
            ConnectionAction::None => {}
            ConnectionAction::Connect(attempt, timeout) => {
                let config =
                    TransportConfig::new(&self.host, self.port, &self.authentication, timeout);
                let span = tracing::debug_span!("establish", host = %self.host, port = self.port, attempt);
                tokio::spawn(
                    establish(
                        self.transport.clone(),
                        config,
                        attempt,
                        timeout,
                        self.notifier.clone(),
                    )
                    .instrument(span),
                );
            }
            ConnectionAction::Disconnect(link) | ConnectionAction::Discard(link) => link.close(),
            ConnectionAction::StartSession(link, request) => {
                tokio::spawn(start_session(link, request));
            }
        }
    }
}

fn notify(notifier: &mpsc::WeakUnboundedSender<Command>, event: ConnectionEvent) -> bool {
    match notifier.upgrade() {
        Some(mailbox) => mailbox.send(Command::Event(event)).is_ok(),
        None => false,
    }
}

/// Connect and authenticate one attempt, reporting each step to the actor.
async fn establish(
    transport: Arc<dyn Transport>,
    config: TransportConfig,
    attempt: AttemptId,
    timeout: Duration,
    notifier: mpsc::WeakUnboundedSender<Command>,
) {
    let deadline = Instant::now() + timeout;

    let link = match time::timeout_at(deadline, transport.connect(config)).await {
        Ok(Ok(link)) => link,
        Ok(Err(err)) => {
            notify(&notifier, ConnectionEvent::Error(attempt, err.into()));
            return;
        }
        Err(..) => {
            notify(&notifier, ConnectionEvent::Error(attempt, ConnectionError::Timeout));
            return;
        }
    };

    if !notify(&notifier, ConnectionEvent::Connected(attempt, link.clone())) {
        link.close();
        return;
    }

    let outcome = tokio::select! {
        result = time::timeout_at(deadline, link.authenticate()) => match result {
            Ok(Ok(())) => ConnectionEvent::Authenticated(attempt),
            Ok(Err(err)) => ConnectionEvent::Error(attempt, err.into()),
            Err(..) => ConnectionEvent::Error(attempt, ConnectionError::Timeout),
        },
        // torn down before authentication finished
        _ = link.closed() => {
            notify(&notifier, ConnectionEvent::Disconnected(attempt));
            return;
        }
    };
    tracing::debug!(?outcome, "authentication finished");
    notify(&notifier, outcome);

    // reported after the authentication outcome so the actor sees them in order
    link.closed().await;
    notify(&notifier, ConnectionEvent::Disconnected(attempt));
}

async fn start_session(link: Arc<dyn TransportLink>, request: SessionRequest) {
    let SessionRequest {
        session,
        timeout,
        promise,
        task,
    } = request;

    let deadline = Instant::now() + timeout;
    let result = launch(link, session, deadline, task.as_ref()).await;
    if let Err(err) = &result {
        tracing::debug!(?err, "session failed to start");
    }
    fulfill(promise, result);
}

async fn launch(
    link: Arc<dyn TransportLink>,
    session: Box<dyn Session>,
    deadline: Instant,
    task: Option<&StartingTask>,
) -> Result<(), ConnectionError> {
    let channel = open_channel(link, deadline).await?;
    let closer = channel.closer();
    if let Some(task) = task {
        task.did_launch(closer.clone());
    }

    let (promise, started) = oneshot::channel();
    session.start(SessionContext { channel, promise });

    let result = match time::timeout_at(deadline, started).await {
        Ok(Ok(result)) => result,
        Ok(Err(..)) => Err(ConnectionError::Unknown),
        Err(..) => Err(ConnectionError::Timeout),
    };
    if result.is_err() {
        closer.close();
    }
    result
}

/// Open a channel before `deadline`. A channel opened after the deadline is closed.
async fn open_channel(
    link: Arc<dyn TransportLink>,
    deadline: Instant,
) -> Result<Channel, ConnectionError> {
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let result = link.open_channel().await;
        if let Err(Ok(channel)) = tx.send(result) {
            tracing::debug!("channel opened after its deadline, closing it");
            channel.close();
        }
    });

    match time::timeout_at(deadline, rx).await {
        Ok(Ok(result)) => result.map_err(ConnectionError::from),
        Ok(Err(..)) => Err(ConnectionError::Unknown),
        Err(..) => Err(ConnectionError::Timeout),
    }
}
