//! The boundary between the session layer and an SSH transport engine.
//!
//! Key exchange, host key algorithms and the user authentication exchange are
//! carried out by the engine. This module only describes what the session
//! layer needs from it: an authenticated link that can open channels, and
//! channels that carry requests and data.

use crate::cipher::TransportProtectionScheme;
use async_trait::async_trait;
use bytes::Bytes;
use std::{borrow::Cow, fmt, sync::Arc, time::Duration};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransportErrorKind {
    ConnectionRefused,
    Timeout,
    HostKeyRejected,
    AuthenticationFailed,
    ChannelOpenFailed,
    Closed,
    Other,
}

/// An error reported by the transport engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct TransportError {
    kind: TransportErrorKind,
    message: Cow<'static, str>,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub(crate) fn closed() -> Self {
        Self::new(TransportErrorKind::Closed, "channel has been closed")
    }
}

// ==== channels ====

/// A channel request sent to the remote side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRequest {
    Exec { command: String, want_reply: bool },
    Shell { want_reply: bool },
    Subsystem { name: String, want_reply: bool },
}

/// Something that happened on a channel, reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Data on the standard stream.
    Data(Bytes),

    /// Data on the extended (stderr) stream.
    ExtendedData(Bytes),

    /// The `exit-status` request of the remote command.
    ExitStatus(u32),

    /// Positive reply to a request sent with `want_reply`.
    Success,

    /// Negative reply to a request sent with `want_reply`.
    Failure,

    /// The remote side will send no more data.
    Eof,

    /// The channel is gone. No event follows.
    Closed,
}

/// Something a session asks the engine to do with its channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelCommand {
    Request(ChannelRequest),
    Data(Bytes),
    Close,
}

/// The session side of an open channel.
///
/// Dropping the receiving half of the events is observed by the engine as
/// the session having gone away.
#[derive(Debug)]
pub struct Channel {
    outbound: mpsc::UnboundedSender<ChannelCommand>,
    inbound: mpsc::UnboundedReceiver<ChannelEvent>,
}

/// The engine side of an open channel, created together with [`Channel`].
#[derive(Debug)]
pub struct ChannelPeer {
    commands: mpsc::UnboundedReceiver<ChannelCommand>,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl Channel {
    /// Create a connected pair of channel ends.
    pub fn pair() -> (Channel, ChannelPeer) {
        let (outbound, commands) = mpsc::unbounded_channel();
        let (events, inbound) = mpsc::unbounded_channel();
        (
            Channel { outbound, inbound },
            ChannelPeer { commands, events },
        )
    }

    pub fn send(&self, data: Bytes) -> Result<(), TransportError> {
        self.outbound
            .send(ChannelCommand::Data(data))
            .map_err(|_| TransportError::closed())
    }

    pub fn request(&self, request: ChannelRequest) -> Result<(), TransportError> {
        self.outbound
            .send(ChannelCommand::Request(request))
            .map_err(|_| TransportError::closed())
    }

    pub fn close(&self) {
        let _ = self.outbound.send(ChannelCommand::Close);
    }

    pub fn closer(&self) -> ChannelCloser {
        ChannelCloser {
            outbound: self.outbound.clone(),
        }
    }

    /// Receive the next event, mapping a vanished engine to `Closed`.
    pub async fn next_event(&mut self) -> ChannelEvent {
        self.inbound.recv().await.unwrap_or(ChannelEvent::Closed)
    }
}

impl ChannelPeer {
    pub async fn next_command(&mut self) -> Option<ChannelCommand> {
        self.commands.recv().await
    }

    pub fn try_next_command(&mut self) -> Option<ChannelCommand> {
        self.commands.try_recv().ok()
    }

    /// Deliver an event to the session. Returns `false` once the session is gone.
    pub fn emit(&self, event: ChannelEvent) -> bool {
        self.events.send(event).is_ok()
    }
}

/// A handle that can only close its channel.
#[derive(Debug, Clone)]
pub struct ChannelCloser {
    outbound: mpsc::UnboundedSender<ChannelCommand>,
}

impl ChannelCloser {
    pub fn close(&self) {
        let _ = self.outbound.send(ChannelCommand::Close);
    }
}

// ==== authentication ====

bitflags::bitflags! {
    /// User authentication methods the server is willing to continue with.
    pub struct AvailableMethods: u8 {
        const PUBLIC_KEY = 0b0001;
        const PASSWORD = 0b0010;
        const HOST_BASED = 0b0100;
    }
}

#[derive(Clone, PartialEq, Eq)]
pub enum AuthOffer {
    None { username: String },
    Password { username: String, password: String },
}

impl fmt::Debug for AuthOffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthOffer::None { username } => {
                f.debug_struct("None").field("username", username).finish()
            }
            AuthOffer::Password { username, .. } => f
                .debug_struct("Password")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

/// Supplies user authentication offers to the engine.
///
/// Returning `Ok(None)` means there is nothing left to try.
pub trait UserAuthDelegate: Send + Sync + fmt::Debug {
    fn next_offer(&self, available: AvailableMethods)
        -> Result<Option<AuthOffer>, TransportError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKey {
    pub algorithm: String,
    pub blob: Bytes,
}

pub trait HostKeyValidator: Send + Sync + fmt::Debug {
    fn validate(&self, key: &HostKey) -> Result<(), TransportError>;
}

#[derive(Clone)]
pub enum AuthMethod {
    None,
    Password(String),
    Custom(Arc<dyn UserAuthDelegate>),
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::None => f.write_str("None"),
            AuthMethod::Password(..) => f.write_str("Password(<redacted>)"),
            AuthMethod::Custom(delegate) => f.debug_tuple("Custom").field(delegate).finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum HostKeyValidation {
    AcceptAll,
    Custom(Arc<dyn HostKeyValidator>),
}

/// Credentials and negotiation preferences used to authenticate a connection.
#[derive(Debug, Clone)]
pub struct Authentication {
    username: String,
    method: AuthMethod,
    host_key_validation: HostKeyValidation,
    transport_protection: Vec<TransportProtectionScheme>,
}

impl Authentication {
    pub fn new(username: impl Into<String>, method: AuthMethod) -> Self {
        Self {
            username: username.into(),
            method,
            host_key_validation: HostKeyValidation::AcceptAll,
            transport_protection: vec![TransportProtectionScheme::Bundled],
        }
    }

    pub fn password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::new(username, AuthMethod::Password(password.into()))
    }

    pub fn host_key_validation(&mut self, validation: HostKeyValidation) -> &mut Self {
        self.host_key_validation = validation;
        self
    }

    /// Replace the transport protection schemes offered to the engine, in order of preference.
    pub fn transport_protection(&mut self, schemes: Vec<TransportProtectionScheme>) -> &mut Self {
        self.transport_protection = schemes;
        self
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn transport_protection_schemes(&self) -> &[TransportProtectionScheme] {
        &self.transport_protection
    }

    pub fn user_auth_delegate(&self) -> Arc<dyn UserAuthDelegate> {
        match &self.method {
            AuthMethod::Custom(delegate) => delegate.clone(),
            method => Arc::new(BuiltInUserAuth {
                username: self.username.clone(),
                method: method.clone(),
            }),
        }
    }

    pub fn host_key_validator(&self) -> Arc<dyn HostKeyValidator> {
        match &self.host_key_validation {
            HostKeyValidation::AcceptAll => Arc::new(AcceptAnyHostKey),
            HostKeyValidation::Custom(validator) => validator.clone(),
        }
    }
}

#[derive(Debug)]
struct BuiltInUserAuth {
    username: String,
    method: AuthMethod,
}

impl UserAuthDelegate for BuiltInUserAuth {
    fn next_offer(
        &self,
        available: AvailableMethods,
    ) -> Result<Option<AuthOffer>, TransportError> {
        match &self.method {
            AuthMethod::None => Ok(Some(AuthOffer::None {
                username: self.username.clone(),
            })),
            AuthMethod::Password(password) => {
                if !available.contains(AvailableMethods::PASSWORD) {
                    return Err(TransportError::new(
                        TransportErrorKind::AuthenticationFailed,
                        "server does not accept password authentication",
                    ));
                }
                Ok(Some(AuthOffer::Password {
                    username: self.username.clone(),
                    password: password.clone(),
                }))
            }
            AuthMethod::Custom(delegate) => delegate.next_offer(available),
        }
    }
}

#[derive(Debug)]
struct AcceptAnyHostKey;

impl HostKeyValidator for AcceptAnyHostKey {
    fn validate(&self, _: &HostKey) -> Result<(), TransportError> {
        Ok(())
    }
}

// ==== engine ====

/// Everything the engine needs to establish and authenticate a link.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub user_auth: Arc<dyn UserAuthDelegate>,
    pub host_key_validator: Arc<dyn HostKeyValidator>,
    pub protection_schemes: Vec<TransportProtectionScheme>,
    pub timeout: Duration,
}

impl TransportConfig {
    pub fn new(host: &str, port: u16, authentication: &Authentication, timeout: Duration) -> Self {
        Self {
            host: host.to_owned(),
            port,
            username: authentication.username().to_owned(),
            user_auth: authentication.user_auth_delegate(),
            host_key_validator: authentication.host_key_validator(),
            protection_schemes: authentication.transport_protection_schemes().to_vec(),
            timeout,
        }
    }
}

/// An SSH transport engine able to reach a server.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self, config: TransportConfig)
        -> Result<Arc<dyn TransportLink>, TransportError>;
}

/// A connected transport, owned by a single connection.
#[async_trait]
pub trait TransportLink: Send + Sync + 'static {
    /// Run the user authentication exchange.
    async fn authenticate(&self) -> Result<(), TransportError>;

    async fn open_channel(&self) -> Result<Channel, TransportError>;

    /// Start tearing the link down. [`closed`](Self::closed) resolves once it is gone.
    fn close(&self);

    async fn closed(&self);
}

impl fmt::Debug for dyn TransportLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TransportLink")
    }
}
