//! SFTP v3 client sessions.

mod attrs;
mod channel;
mod client;
mod error;
mod file;
mod request_id;
mod state;
mod wire;

pub use self::{
    attrs::{AccessModificationTime, AttrFlags, DirEntry, FileAttributes, OpenFlags, UserGroupId},
    client::SftpClient,
    error::{SftpError, StatusError},
    file::SftpFile,
    state::SftpState,
    wire::{Message, RequestId, Status, StatusCode},
};

use crate::session::{Session, SessionContext};
use tokio::sync::oneshot;

const DEFAULT_WRITE_SLICE_LENGTH: usize = 32_000;

/// Settings of an SFTP session.
#[derive(Debug, Clone)]
pub struct SftpConfig {
    reverse_symlink_arguments: bool,
    extensions: Vec<(String, String)>,
    write_slice_length: usize,
}

impl Default for SftpConfig {
    fn default() -> Self {
        Self {
            reverse_symlink_arguments: true,
            extensions: vec![],
            write_slice_length: DEFAULT_WRITE_SLICE_LENGTH,
        }
    }
}

impl SftpConfig {
    /// Reverse the order of arguments in symlink requests.
    ///
    /// For historical reasons, OpenSSH's `sftp-server` expects the arguments
    /// of `SSH_FXP_SYMLINK` in the opposite order to the RFC draft. Enabled
    /// by default, as most servers run OpenSSH's implementation.
    pub fn reverse_symlink_arguments(&mut self, enabled: bool) -> &mut Self {
        self.reverse_symlink_arguments = enabled;
        self
    }

    /// Announce an extension pair in the init message.
    pub fn extension(&mut self, name: impl Into<String>, data: impl Into<String>) -> &mut Self {
        self.extensions.push((name.into(), data.into()));
        self
    }

    /// Largest payload of a single write request. At least one byte.
    pub fn write_slice_length(&mut self, len: usize) -> &mut Self {
        self.write_slice_length = len.max(1);
        self
    }
}

/// The session attaching an SFTP engine to a channel.
pub(crate) struct SftpSession {
    config: SftpConfig,
    client: oneshot::Sender<SftpClient>,
}

impl SftpSession {
    /// The receiver yields the client once the session is ready.
    pub(crate) fn new(config: SftpConfig) -> (Self, oneshot::Receiver<SftpClient>) {
        let (tx, rx) = oneshot::channel();
        (Self { config, client: tx }, rx)
    }
}

impl Session for SftpSession {
    fn start(self: Box<Self>, context: SessionContext) {
        let SftpSession { config, client } = *self;
        channel::spawn(context, config, client);
    }
}
