//! Multiplexed SSH client sessions.
//!
//! An [`SshConnection`] drives one authenticated transport link and hands out
//! interactive shells, command executions and SFTP v3 clients, each running
//! on its own channel. The SSH transport itself is pluggable through the
//! [`transport`] traits; the [`cipher`] module provides the
//! `aes128-ctr` / `hmac-sha2-256` packet protection such engines register.

pub mod cipher;
pub mod command;
pub mod connection;
pub mod error;
pub mod observer;
pub mod session;
pub mod sftp;
pub mod shell;
pub mod transport;

pub use crate::{
    command::{CommandCapture, CommandChannel, CommandChunk, CommandOutput, CommandStatus, CommandStream, SshCommand},
    connection::{ConnectionState, SshConnection},
    error::ConnectionError,
    observer::ObserverToken,
    sftp::{SftpClient, SftpConfig, SftpError, SftpFile},
    shell::{ShellError, ShellState, SshShell},
};
