//! The SFTP engine: a driver task owning the channel and the state machine,
//! and a handle issuing one request per SFTP verb.

use super::{
    attrs::{DirEntry, FileAttributes, OpenFlags},
    client::SftpClient,
    error::SftpError,
    request_id::MonotonicRequestIdAllocator,
    state::{Completion, Extensions, Reply, SftpAction, SftpEvent, SftpState, SftpStateMachine},
    wire::{FrameDecoder, Message, RequestId, Status, StatusCode},
    SftpConfig,
};
use crate::{
    error::ConnectionError,
    session::{fulfill, Promise, SessionContext},
    transport::{Channel, ChannelEvent, ChannelRequest},
};
use bytes::Bytes;
use tokio::sync::{
    mpsc,
    oneshot::{self, error::TryRecvError},
    watch,
};
use tracing::Instrument;

type BuildMessage = Box<dyn FnOnce(RequestId) -> Message + Send>;

pub(crate) enum Command {
    Request { build: BuildMessage, reply: Reply },
    Disconnect(Completion),
}

/// A handle to the engine. Requests are sent in submission order.
#[derive(Debug, Clone)]
pub(crate) struct SftpChannel {
    mailbox: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SftpState>,
}

impl SftpChannel {
    pub(crate) fn state(&self) -> SftpState {
        self.state.borrow().clone()
    }

    pub(crate) async fn disconnect(&self) -> Result<(), SftpError> {
        let (tx, rx) = oneshot::channel();
        if self.mailbox.send(Command::Disconnect(tx)).is_err() {
            // the driver is already gone
            return Ok(());
        }
        rx.await.unwrap_or(Ok(()))
    }

    async fn request<F>(&self, build: F) -> Result<Message, SftpError>
    where
        F: FnOnce(RequestId) -> Message + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.mailbox
            .send(Command::Request {
                build: Box::new(build),
                reply: tx,
            })
            .map_err(|_| SftpError::ConnectionClosed)?;
        rx.await.map_err(|_| SftpError::ConnectionClosed)?
    }

    pub(crate) async fn open(
        &self,
        filename: Bytes,
        pflags: OpenFlags,
        attrs: FileAttributes,
    ) -> Result<Bytes, SftpError> {
        let response = self
            .request(move |id| Message::Open {
                id,
                filename,
                pflags,
                attrs,
            })
            .await?;

        match response {
            Message::Handle { handle, .. } => Ok(handle),
            response => Err(unexpected(response)),
        }
    }

    /// Close `handle` without waiting for the outcome.
    pub(crate) fn release(&self, handle: Bytes) {
        let (reply, _) = oneshot::channel();
        let _ = self.mailbox.send(Command::Request {
            build: Box::new(move |id| Message::Close { id, handle }),
            reply,
        });
    }

    pub(crate) async fn close(&self, handle: Bytes) -> Result<(), SftpError> {
        let response = self.request(move |id| Message::Close { id, handle }).await?;
        expect_status(response)
    }

    /// An empty buffer means end of file.
    pub(crate) async fn read(&self, handle: Bytes, offset: u64, len: u32) -> Result<Bytes, SftpError> {
        let response = self
            .request(move |id| Message::Read {
                id,
                handle,
                offset,
                len,
            })
            .await?;

        match response {
            Message::Data { data, .. } => Ok(data),
            Message::Status { status, .. } if status.code == StatusCode::Eof => Ok(Bytes::new()),
            response => Err(unexpected(response)),
        }
    }

    pub(crate) async fn write(&self, handle: Bytes, offset: u64, data: Bytes) -> Result<(), SftpError> {
        let response = self
            .request(move |id| Message::Write {
                id,
                handle,
                offset,
                data,
            })
            .await?;
        expect_status(response)
    }

    pub(crate) async fn lstat(&self, path: Bytes) -> Result<FileAttributes, SftpError> {
        let response = self.request(move |id| Message::Lstat { id, path }).await?;
        expect_attrs(response)
    }

    pub(crate) async fn fstat(&self, handle: Bytes) -> Result<FileAttributes, SftpError> {
        let response = self.request(move |id| Message::Fstat { id, handle }).await?;
        expect_attrs(response)
    }

    pub(crate) async fn stat(&self, path: Bytes) -> Result<FileAttributes, SftpError> {
        let response = self.request(move |id| Message::Stat { id, path }).await?;
        expect_attrs(response)
    }

    pub(crate) async fn setstat(&self, path: Bytes, attrs: FileAttributes) -> Result<(), SftpError> {
        let response = self
            .request(move |id| Message::Setstat { id, path, attrs })
            .await?;
        expect_status(response)
    }

    pub(crate) async fn fsetstat(&self, handle: Bytes, attrs: FileAttributes) -> Result<(), SftpError> {
        let response = self
            .request(move |id| Message::Fsetstat { id, handle, attrs })
            .await?;
        expect_status(response)
    }

    pub(crate) async fn opendir(&self, path: Bytes) -> Result<Bytes, SftpError> {
        let response = self.request(move |id| Message::Opendir { id, path }).await?;
        match response {
            Message::Handle { handle, .. } => Ok(handle),
            response => Err(unexpected(response)),
        }
    }

    /// `None` once the listing is exhausted.
    pub(crate) async fn readdir(&self, handle: Bytes) -> Result<Option<Vec<DirEntry>>, SftpError> {
        let response = self.request(move |id| Message::Readdir { id, handle }).await?;
        match response {
            Message::Name { entries, .. } => Ok(Some(entries)),
            Message::Status { status, .. } if status.code == StatusCode::Eof => Ok(None),
            response => Err(unexpected(response)),
        }
    }

    pub(crate) async fn remove(&self, filename: Bytes) -> Result<(), SftpError> {
        let response = self.request(move |id| Message::Remove { id, filename }).await?;
        expect_status(response)
    }

    pub(crate) async fn mkdir(&self, path: Bytes, attrs: FileAttributes) -> Result<(), SftpError> {
        let response = self
            .request(move |id| Message::Mkdir { id, path, attrs })
            .await?;
        expect_status(response)
    }

    pub(crate) async fn rmdir(&self, path: Bytes) -> Result<(), SftpError> {
        let response = self.request(move |id| Message::Rmdir { id, path }).await?;
        expect_status(response)
    }

    pub(crate) async fn realpath(&self, path: Bytes) -> Result<Bytes, SftpError> {
        let response = self.request(move |id| Message::Realpath { id, path }).await?;
        expect_single_name(response)
    }

    pub(crate) async fn rename(&self, oldpath: Bytes, newpath: Bytes) -> Result<(), SftpError> {
        let response = self
            .request(move |id| Message::Rename {
                id,
                oldpath,
                newpath,
            })
            .await?;
        expect_status(response)
    }

    pub(crate) async fn readlink(&self, path: Bytes) -> Result<Bytes, SftpError> {
        let response = self.request(move |id| Message::Readlink { id, path }).await?;
        expect_single_name(response)
    }

    /// Arguments are sent in the given order.
    pub(crate) async fn symlink(&self, first: Bytes, second: Bytes) -> Result<(), SftpError> {
        let response = self
            .request(move |id| Message::Symlink {
                id,
                linkpath: first,
                targetpath: second,
            })
            .await?;
        expect_status(response)
    }
}

fn is_success(status: &Status) -> bool {
    matches!(status.code, StatusCode::Ok | StatusCode::Eof)
}

/// Map a response of the wrong shape to an error.
fn unexpected(response: Message) -> SftpError {
    match response {
        Message::Status { status, .. } if !is_success(&status) => SftpError::Status(status.into()),
        _ => SftpError::InvalidResponse,
    }
}

fn expect_status(response: Message) -> Result<(), SftpError> {
    match response {
        Message::Status { status, .. } if is_success(&status) => Ok(()),
        response => Err(unexpected(response)),
    }
}

fn expect_attrs(response: Message) -> Result<FileAttributes, SftpError> {
    match response {
        Message::Attrs { attrs, .. } => Ok(attrs),
        response => Err(unexpected(response)),
    }
}

fn expect_single_name(response: Message) -> Result<Bytes, SftpError> {
    match response {
        Message::Name { entries, .. } => entries
            .into_iter()
            .next()
            .map(|entry| entry.filename)
            .ok_or(SftpError::MissingResponse),
        response => Err(unexpected(response)),
    }
}

// ==== driver ====

/// Attach an SFTP engine to a fresh channel.
///
/// The client is handed over before the start promise resolves.
pub(crate) fn spawn(context: SessionContext, config: SftpConfig, client: oneshot::Sender<SftpClient>) {
    let SessionContext { channel, promise } = context;
    let (tx, rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(SftpState::Idle);

    let handle = SftpChannel {
        mailbox: tx,
        state: state_rx,
    };
    let driver = SftpDriver {
        channel,
        machine: SftpStateMachine::new(),
        decoder: FrameDecoder::default(),
        allocator: MonotonicRequestIdAllocator::default(),
        mailbox: rx,
        state: state_tx,
    };

    let span = tracing::debug_span!("sftp");
    tokio::spawn(driver.run(config, handle, promise, client).instrument(span));
}

struct SftpDriver {
    channel: Channel,
    machine: SftpStateMachine,
    decoder: FrameDecoder,
    allocator: MonotonicRequestIdAllocator,
    mailbox: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<SftpState>,
}

impl SftpDriver {
    async fn run(
        mut self,
        config: SftpConfig,
        handle: SftpChannel,
        promise: Promise<Result<(), ConnectionError>>,
        client: oneshot::Sender<SftpClient>,
    ) {
        let extensions = match self.handshake(config.extensions.clone()).await {
            Ok(extensions) => extensions,
            Err(err) => {
                tracing::debug!(?err, "SFTP session failed to start");
                self.channel.close();
                fulfill(promise, Err(ConnectionError::session_start(err)));
                return;
            }
        };
        tracing::debug!(?extensions, "SFTP session is ready");

        if client.send(SftpClient::new(handle, config, extensions)).is_err() {
            tracing::debug!("the SFTP client was not claimed");
        }
        fulfill(promise, Ok(()));

        self.serve().await;
    }

    async fn handshake(&mut self, extensions: Extensions) -> Result<Extensions, SftpError> {
        self.request_subsystem().await?;

        let (tx, mut rx) = oneshot::channel();
        self.trigger(SftpEvent::Start {
            extensions,
            promise: tx,
        });

        loop {
            match rx.try_recv() {
                Ok(result) => return result,
                Err(TryRecvError::Closed) => return Err(SftpError::ConnectionClosed),
                Err(TryRecvError::Empty) => {}
            }
            let event = self.channel.next_event().await;
            self.on_channel_event(event);
        }
    }

    async fn request_subsystem(&mut self) -> Result<(), SftpError> {
        self.channel
            .request(ChannelRequest::Subsystem {
                name: "sftp".into(),
                want_reply: true,
            })
            .map_err(|err| SftpError::Connection(err.into()))?;

        loop {
            match self.channel.next_event().await {
                ChannelEvent::Success => return Ok(()),
                ChannelEvent::Failure => {
                    return Err(SftpError::protocol("sftp subsystem request was rejected"))
                }
                ChannelEvent::Closed => return Err(SftpError::ConnectionClosed),
                event => tracing::trace!(?event, "ignoring event before the subsystem starts"),
            }
        }
    }

    async fn serve(mut self) {
        let mut mailbox_closed = false;
        while !self.machine.is_terminal() {
            tokio::select! {
                command = self.mailbox.recv(), if !mailbox_closed => match command {
                    Some(command) => self.on_command(command),
                    None => {
                        mailbox_closed = true;
                        tracing::debug!("all SFTP handles dropped, closing the session");
                        let (tx, _rx) = oneshot::channel();
                        self.trigger(SftpEvent::RequestDisconnection(tx));
                    }
                },
                event = self.channel.next_event() => self.on_channel_event(event),
            }
        }

        // whatever is still queued fails against the terminal state
        self.mailbox.close();
        while let Ok(command) = self.mailbox.try_recv() {
            self.on_command(command);
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Request { build, reply } => {
                let machine = &self.machine;
                match self.allocator.allocate(|id| machine.is_in_flight(id)) {
                    Some(id) => self.trigger(SftpEvent::RequestMessage(build(id), reply)),
                    None => fulfill(reply, Err(SftpError::protocol("no request ID available"))),
                }
            }
            Command::Disconnect(completion) => {
                self.trigger(SftpEvent::RequestDisconnection(completion))
            }
        }
    }

    fn on_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Data(data) => {
                self.decoder.extend(&data);
                loop {
                    let next = self
                        .decoder
                        .next_frame()
                        .and_then(|frame| frame.map(Message::decode).transpose());
                    match next {
                        Ok(Some(message)) => self.trigger(SftpEvent::Inbound(message)),
                        Ok(None) => break,
                        Err(err) => {
                            self.trigger(SftpEvent::ProtocolError(err));
                            break;
                        }
                    }
                }
            }
            ChannelEvent::ExtendedData(data) => {
                tracing::debug!(stderr = %String::from_utf8_lossy(&data), "SFTP server diagnostics");
            }
            ChannelEvent::Closed => self.trigger(SftpEvent::Disconnected),
            event => tracing::trace!(?event, "ignoring channel event"),
        }
    }

    fn trigger(&mut self, event: SftpEvent) {
        let before = self.machine.state();
        let action = self.machine.handle(event);
        let after = self.machine.state();

        if before != after {
            tracing::debug!(from = ?before, to = ?after, "SFTP state changed");
            self.state.send_replace(after);
        }

        self.perform(action);
    }

    fn perform(&mut self, action: SftpAction) {
        match action {
            SftpAction::None => {}
            SftpAction::Send(message) => {
                let id = message.request_id();
                tracing::trace!(?id, "sending SFTP message");
                if let Err(err) = self.channel.send(message.to_frame()) {
                    tracing::debug!(?err, "failed to send SFTP message");
                    if let Some(id) = id {
                        self.trigger(SftpEvent::MessageFailed(id));
                    }
                }
            }
            SftpAction::Disconnect => self.channel.close(),
        }
    }
}
