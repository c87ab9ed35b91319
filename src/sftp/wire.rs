//! SFTP v3 messages and their framing.

// Refs:
// * https://tools.ietf.org/html/draft-ietf-secsh-filexfer-02
// * https://tools.ietf.org/html/rfc4251

use super::{
    attrs::{DirEntry, FileAttributes, OpenFlags},
    error::SftpError,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::mem;

pub(crate) const SFTP_PROTOCOL_VERSION: u32 = 3;

// larger frames are rejected before they are buffered
const MAX_FRAME_LENGTH: usize = 4 * 1024 * 1024;

// defined in https://tools.ietf.org/html/draft-ietf-secsh-filexfer-02#section-3
const SSH_FXP_INIT: u8 = 1;
const SSH_FXP_VERSION: u8 = 2;
const SSH_FXP_OPEN: u8 = 3;
const SSH_FXP_CLOSE: u8 = 4;
const SSH_FXP_READ: u8 = 5;
const SSH_FXP_WRITE: u8 = 6;
const SSH_FXP_LSTAT: u8 = 7;
const SSH_FXP_FSTAT: u8 = 8;
const SSH_FXP_SETSTAT: u8 = 9;
const SSH_FXP_FSETSTAT: u8 = 10;
const SSH_FXP_OPENDIR: u8 = 11;
const SSH_FXP_READDIR: u8 = 12;
const SSH_FXP_REMOVE: u8 = 13;
const SSH_FXP_MKDIR: u8 = 14;
const SSH_FXP_RMDIR: u8 = 15;
const SSH_FXP_REALPATH: u8 = 16;
const SSH_FXP_STAT: u8 = 17;
const SSH_FXP_RENAME: u8 = 18;
const SSH_FXP_READLINK: u8 = 19;
const SSH_FXP_SYMLINK: u8 = 20;
const SSH_FXP_STATUS: u8 = 101;
const SSH_FXP_HANDLE: u8 = 102;
const SSH_FXP_DATA: u8 = 103;
const SSH_FXP_NAME: u8 = 104;
const SSH_FXP_ATTRS: u8 = 105;

// defined in https://tools.ietf.org/html/draft-ietf-secsh-filexfer-02#section-7
const SSH_FX_OK: u32 = 0;
const SSH_FX_EOF: u32 = 1;
const SSH_FX_NO_SUCH_FILE: u32 = 2;
const SSH_FX_PERMISSION_DENIED: u32 = 3;
const SSH_FX_FAILURE: u32 = 4;
const SSH_FX_BAD_MESSAGE: u32 = 5;
const SSH_FX_NO_CONNECTION: u32 = 6;
const SSH_FX_CONNECTION_LOST: u32 = 7;
const SSH_FX_OP_UNSUPPORTED: u32 = 8;

pub type RequestId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    Eof,
    NoSuchFile,
    PermissionDenied,
    Failure,
    BadMessage,
    NoConnection,
    ConnectionLost,
    OpUnsupported,
    Other(u32),
}

impl From<u32> for StatusCode {
    fn from(code: u32) -> Self {
        match code {
            SSH_FX_OK => StatusCode::Ok,
            SSH_FX_EOF => StatusCode::Eof,
            SSH_FX_NO_SUCH_FILE => StatusCode::NoSuchFile,
            SSH_FX_PERMISSION_DENIED => StatusCode::PermissionDenied,
            SSH_FX_FAILURE => StatusCode::Failure,
            SSH_FX_BAD_MESSAGE => StatusCode::BadMessage,
            SSH_FX_NO_CONNECTION => StatusCode::NoConnection,
            SSH_FX_CONNECTION_LOST => StatusCode::ConnectionLost,
            SSH_FX_OP_UNSUPPORTED => StatusCode::OpUnsupported,
            code => StatusCode::Other(code),
        }
    }
}

impl From<StatusCode> for u32 {
    fn from(code: StatusCode) -> Self {
        match code {
            StatusCode::Ok => SSH_FX_OK,
            StatusCode::Eof => SSH_FX_EOF,
            StatusCode::NoSuchFile => SSH_FX_NO_SUCH_FILE,
            StatusCode::PermissionDenied => SSH_FX_PERMISSION_DENIED,
            StatusCode::Failure => SSH_FX_FAILURE,
            StatusCode::BadMessage => SSH_FX_BAD_MESSAGE,
            StatusCode::NoConnection => SSH_FX_NO_CONNECTION,
            StatusCode::ConnectionLost => SSH_FX_CONNECTION_LOST,
            StatusCode::OpUnsupported => SSH_FX_OP_UNSUPPORTED,
            StatusCode::Other(code) => code,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub code: StatusCode,
    pub message: String,
    pub language_tag: String,
}

impl Status {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            language_tag: String::new(),
        }
    }
}

/// An SFTP v3 message, in either direction.
///
/// Every variant but `Init` and `Version` carries the ID of the request it
/// belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Init {
        version: u32,
        extensions: Vec<(String, String)>,
    },
    Version {
        version: u32,
        extensions: Vec<(String, String)>,
    },
    Open {
        id: RequestId,
        filename: Bytes,
        pflags: OpenFlags,
        attrs: FileAttributes,
    },
    Close {
        id: RequestId,
        handle: Bytes,
    },
    Read {
        id: RequestId,
        handle: Bytes,
        offset: u64,
        len: u32,
    },
    Write {
        id: RequestId,
        handle: Bytes,
        offset: u64,
        data: Bytes,
    },
    Lstat {
        id: RequestId,
        path: Bytes,
    },
    Fstat {
        id: RequestId,
        handle: Bytes,
    },
    Setstat {
        id: RequestId,
        path: Bytes,
        attrs: FileAttributes,
    },
    Fsetstat {
        id: RequestId,
        handle: Bytes,
        attrs: FileAttributes,
    },
    Opendir {
        id: RequestId,
        path: Bytes,
    },
    Readdir {
        id: RequestId,
        handle: Bytes,
    },
    Remove {
        id: RequestId,
        filename: Bytes,
    },
    Mkdir {
        id: RequestId,
        path: Bytes,
        attrs: FileAttributes,
    },
    Rmdir {
        id: RequestId,
        path: Bytes,
    },
    Realpath {
        id: RequestId,
        path: Bytes,
    },
    Stat {
        id: RequestId,
        path: Bytes,
    },
    Rename {
        id: RequestId,
        oldpath: Bytes,
        newpath: Bytes,
    },
    Readlink {
        id: RequestId,
        path: Bytes,
    },
    /// Arguments are encoded in the given order; see `SftpConfig::reverse_symlink_arguments`.
    Symlink {
        id: RequestId,
        linkpath: Bytes,
        targetpath: Bytes,
    },
    Status {
        id: RequestId,
        status: Status,
    },
    Handle {
        id: RequestId,
        handle: Bytes,
    },
    Data {
        id: RequestId,
        data: Bytes,
    },
    Name {
        id: RequestId,
        entries: Vec<DirEntry>,
    },
    Attrs {
        id: RequestId,
        attrs: FileAttributes,
    },
}

impl Message {
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Message::Init { .. } | Message::Version { .. } => None,
            Message::Open { id, .. }
            | Message::Close { id, .. }
            | Message::Read { id, .. }
            | Message::Write { id, .. }
            | Message::Lstat { id, .. }
            | Message::Fstat { id, .. }
            | Message::Setstat { id, .. }
            | Message::Fsetstat { id, .. }
            | Message::Opendir { id, .. }
            | Message::Readdir { id, .. }
            | Message::Remove { id, .. }
            | Message::Mkdir { id, .. }
            | Message::Rmdir { id, .. }
            | Message::Realpath { id, .. }
            | Message::Stat { id, .. }
            | Message::Rename { id, .. }
            | Message::Readlink { id, .. }
            | Message::Symlink { id, .. }
            | Message::Status { id, .. }
            | Message::Handle { id, .. }
            | Message::Data { id, .. }
            | Message::Name { id, .. }
            | Message::Attrs { id, .. } => Some(*id),
        }
    }

    /// Encode the message body, without the length prefix.
    pub fn encode<B>(&self, mut b: B)
    where
        B: BufMut,
    {
        match self {
            Message::Init {
                version,
                extensions,
            } => {
                b.put_u8(SSH_FXP_INIT);
                b.put_u32(*version);
                put_extensions(&mut b, extensions);
            }
            Message::Version {
                version,
                extensions,
            } => {
                b.put_u8(SSH_FXP_VERSION);
                b.put_u32(*version);
                put_extensions(&mut b, extensions);
            }
            Message::Open {
                id,
                filename,
                pflags,
                attrs,
            } => {
                put_header(&mut b, SSH_FXP_OPEN, *id);
                put_string(&mut b, filename);
                b.put_u32(pflags.bits());
                attrs.encode(&mut b);
            }
            Message::Close { id, handle } => {
                put_header(&mut b, SSH_FXP_CLOSE, *id);
                put_string(&mut b, handle);
            }
            Message::Read {
                id,
                handle,
                offset,
                len,
            } => {
                put_header(&mut b, SSH_FXP_READ, *id);
                put_string(&mut b, handle);
                b.put_u64(*offset);
                b.put_u32(*len);
            }
            Message::Write {
                id,
                handle,
                offset,
                data,
            } => {
                put_header(&mut b, SSH_FXP_WRITE, *id);
                put_string(&mut b, handle);
                b.put_u64(*offset);
                put_string(&mut b, data);
            }
            Message::Lstat { id, path } => {
                put_header(&mut b, SSH_FXP_LSTAT, *id);
                put_string(&mut b, path);
            }
            Message::Fstat { id, handle } => {
                put_header(&mut b, SSH_FXP_FSTAT, *id);
                put_string(&mut b, handle);
            }
            Message::Setstat { id, path, attrs } => {
                put_header(&mut b, SSH_FXP_SETSTAT, *id);
                put_string(&mut b, path);
                attrs.encode(&mut b);
            }
            Message::Fsetstat { id, handle, attrs } => {
                put_header(&mut b, SSH_FXP_FSETSTAT, *id);
                put_string(&mut b, handle);
                attrs.encode(&mut b);
            }
            Message::Opendir { id, path } => {
                put_header(&mut b, SSH_FXP_OPENDIR, *id);
                put_string(&mut b, path);
            }
            Message::Readdir { id, handle } => {
                put_header(&mut b, SSH_FXP_READDIR, *id);
                put_string(&mut b, handle);
            }
            Message::Remove { id, filename } => {
                put_header(&mut b, SSH_FXP_REMOVE, *id);
                put_string(&mut b, filename);
            }
            Message::Mkdir { id, path, attrs } => {
                put_header(&mut b, SSH_FXP_MKDIR, *id);
                put_string(&mut b, path);
                attrs.encode(&mut b);
            }
            Message::Rmdir { id, path } => {
                put_header(&mut b, SSH_FXP_RMDIR, *id);
                put_string(&mut b, path);
            }
            Message::Realpath { id, path } => {
                put_header(&mut b, SSH_FXP_REALPATH, *id);
                put_string(&mut b, path);
            }
            Message::Stat { id, path } => {
                put_header(&mut b, SSH_FXP_STAT, *id);
                put_string(&mut b, path);
            }
            Message::Rename {
                id,
                oldpath,
                newpath,
            } => {
                put_header(&mut b, SSH_FXP_RENAME, *id);
                put_string(&mut b, oldpath);
                put_string(&mut b, newpath);
            }
            Message::Readlink { id, path } => {
                put_header(&mut b, SSH_FXP_READLINK, *id);
                put_string(&mut b, path);
            }
            Message::Symlink {
                id,
                linkpath,
                targetpath,
            } => {
                put_header(&mut b, SSH_FXP_SYMLINK, *id);
                put_string(&mut b, linkpath);
                put_string(&mut b, targetpath);
            }
            Message::Status { id, status } => {
                put_header(&mut b, SSH_FXP_STATUS, *id);
                b.put_u32(status.code.into());
                put_string(&mut b, status.message.as_bytes());
                put_string(&mut b, status.language_tag.as_bytes());
            }
            Message::Handle { id, handle } => {
                put_header(&mut b, SSH_FXP_HANDLE, *id);
                put_string(&mut b, handle);
            }
            Message::Data { id, data } => {
                put_header(&mut b, SSH_FXP_DATA, *id);
                put_string(&mut b, data);
            }
            Message::Name { id, entries } => {
                put_header(&mut b, SSH_FXP_NAME, *id);
                b.put_u32(entries.len() as u32);
                for entry in entries {
                    put_string(&mut b, &entry.filename);
                    put_string(&mut b, entry.longname.as_bytes());
                    entry.attrs.encode(&mut b);
                }
            }
            Message::Attrs { id, attrs } => {
                put_header(&mut b, SSH_FXP_ATTRS, *id);
                attrs.encode(&mut b);
            }
        }
    }

    /// Encode the message with its length prefix.
    pub fn to_frame(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u32(0);
        self.encode(&mut buf);
        let length = (buf.len() - mem::size_of::<u32>()) as u32;
        buf[..4].copy_from_slice(&length.to_be_bytes());
        buf.freeze()
    }

    /// Decode a message body, without its length prefix.
    pub fn decode(mut packet: Bytes) -> Result<Self, SftpError> {
        let typ = read_u8(&mut packet)?;

        let message = match typ {
            SSH_FXP_INIT => {
                let version = read_u32(&mut packet)?;
                let extensions = read_extensions(&mut packet)?;
                Message::Init {
                    version,
                    extensions,
                }
            }
            SSH_FXP_VERSION => {
                let version = read_u32(&mut packet)?;
                let extensions = read_extensions(&mut packet)?;
                Message::Version {
                    version,
                    extensions,
                }
            }
            typ => {
                let id = read_u32(&mut packet)?;
                decode_request_body(typ, id, &mut packet)?
            }
        };

        if packet.has_remaining() {
            return Err(SftpError::protocol("trailing bytes in packet"));
        }

        Ok(message)
    }
}

fn decode_request_body(typ: u8, id: RequestId, packet: &mut Bytes) -> Result<Message, SftpError> {
    let message = match typ {
        SSH_FXP_OPEN => Message::Open {
            id,
            filename: read_bytes(&mut *packet)?,
            pflags: OpenFlags::from_bits_truncate(read_u32(&mut *packet)?),
            attrs: FileAttributes::decode(&mut *packet)?,
        },
        SSH_FXP_CLOSE => Message::Close {
            id,
            handle: read_bytes(&mut *packet)?,
        },
        SSH_FXP_READ => Message::Read {
            id,
            handle: read_bytes(&mut *packet)?,
            offset: read_u64(&mut *packet)?,
            len: read_u32(&mut *packet)?,
        },
        SSH_FXP_WRITE => Message::Write {
            id,
            handle: read_bytes(&mut *packet)?,
            offset: read_u64(&mut *packet)?,
            data: read_bytes(&mut *packet)?,
        },
        SSH_FXP_LSTAT => Message::Lstat {
            id,
            path: read_bytes(&mut *packet)?,
        },
        SSH_FXP_FSTAT => Message::Fstat {
            id,
            handle: read_bytes(&mut *packet)?,
        },
        SSH_FXP_SETSTAT => Message::Setstat {
            id,
            path: read_bytes(&mut *packet)?,
            attrs: FileAttributes::decode(&mut *packet)?,
        },
        SSH_FXP_FSETSTAT => Message::Fsetstat {
            id,
            handle: read_bytes(&mut *packet)?,
            attrs: FileAttributes::decode(&mut *packet)?,
        },
        SSH_FXP_OPENDIR => Message::Opendir {
            id,
            path: read_bytes(&mut *packet)?,
        },
        SSH_FXP_READDIR => Message::Readdir {
            id,
            handle: read_bytes(&mut *packet)?,
        },
        SSH_FXP_REMOVE => Message::Remove {
            id,
            filename: read_bytes(&mut *packet)?,
        },
        SSH_FXP_MKDIR => Message::Mkdir {
            id,
            path: read_bytes(&mut *packet)?,
            attrs: FileAttributes::decode(&mut *packet)?,
        },
        SSH_FXP_RMDIR => Message::Rmdir {
            id,
            path: read_bytes(&mut *packet)?,
        },
        SSH_FXP_REALPATH => Message::Realpath {
            id,
            path: read_bytes(&mut *packet)?,
        },
        SSH_FXP_STAT => Message::Stat {
            id,
            path: read_bytes(&mut *packet)?,
        },
        SSH_FXP_RENAME => Message::Rename {
            id,
            oldpath: read_bytes(&mut *packet)?,
            newpath: read_bytes(&mut *packet)?,
        },
        SSH_FXP_READLINK => Message::Readlink {
            id,
            path: read_bytes(&mut *packet)?,
        },
        SSH_FXP_SYMLINK => Message::Symlink {
            id,
            linkpath: read_bytes(&mut *packet)?,
            targetpath: read_bytes(&mut *packet)?,
        },
        SSH_FXP_STATUS => {
            let code = StatusCode::from(read_u32(&mut *packet)?);
            let message = read_string(&mut *packet)?;
            let language_tag = read_string(&mut *packet)?;
            Message::Status {
                id,
                status: Status {
                    code,
                    message,
                    language_tag,
                },
            }
        }
        SSH_FXP_HANDLE => Message::Handle {
            id,
            handle: read_bytes(&mut *packet)?,
        },
        SSH_FXP_DATA => Message::Data {
            id,
            data: read_bytes(&mut *packet)?,
        },
        SSH_FXP_NAME => {
            let count = read_u32(&mut *packet)?;
            // filename, longname and attribute flags at the very least
            ensure_buf_remaining(&*packet, (count as usize).saturating_mul(12))?;
            let mut entries = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let filename = read_bytes(&mut *packet)?;
                let longname = read_string(&mut *packet)?;
                let attrs = FileAttributes::decode(&mut *packet)?;
                entries.push(DirEntry {
                    filename,
                    longname,
                    attrs,
                });
            }
            Message::Name { id, entries }
        }
        SSH_FXP_ATTRS => Message::Attrs {
            id,
            attrs: FileAttributes::decode(&mut *packet)?,
        },
        typ => {
            return Err(SftpError::protocol(format!("unknown message type {}", typ)));
        }
    };
    Ok(message)
}

/// Splits a byte stream into SFTP frames.
#[derive(Debug, Default)]
pub(crate) struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub(crate) fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// The next complete frame body, if one has been buffered.
    pub(crate) fn next_frame(&mut self) -> Result<Option<Bytes>, SftpError> {
        if self.buf.len() < mem::size_of::<u32>() {
            return Ok(None);
        }

        let length = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if length == 0 || length > MAX_FRAME_LENGTH {
            return Err(SftpError::protocol(format!("invalid frame length {}", length)));
        }

        let total = mem::size_of::<u32>() + length;
        if self.buf.len() < total {
            self.buf.reserve(total - self.buf.len());
            return Ok(None);
        }

        self.buf.advance(mem::size_of::<u32>());
        Ok(Some(self.buf.split_to(length).freeze()))
    }
}

// ==== misc ====

#[inline]
fn put_header<B>(mut b: B, typ: u8, id: RequestId)
where
    B: BufMut,
{
    b.put_u8(typ);
    b.put_u32(id);
}

#[inline]
pub(crate) fn put_string<B>(mut b: B, s: &[u8])
where
    B: BufMut,
{
    b.put_u32(s.len() as u32);
    b.put(s);
}

fn put_extensions<B>(mut b: B, extensions: &[(String, String)])
where
    B: BufMut,
{
    for (name, data) in extensions {
        put_string(&mut b, name.as_bytes());
        put_string(&mut b, data.as_bytes());
    }
}

#[inline]
pub(crate) fn ensure_buf_remaining(b: &impl Buf, n: usize) -> Result<(), SftpError> {
    if b.remaining() >= n {
        Ok(())
    } else {
        Err(SftpError::protocol("too short data"))
    }
}

fn read_u8<B>(mut b: B) -> Result<u8, SftpError>
where
    B: Buf,
{
    ensure_buf_remaining(&b, mem::size_of::<u8>())?;
    Ok(b.get_u8())
}

pub(crate) fn read_u32<B>(mut b: B) -> Result<u32, SftpError>
where
    B: Buf,
{
    ensure_buf_remaining(&b, mem::size_of::<u32>())?;
    Ok(b.get_u32())
}

pub(crate) fn read_u64<B>(mut b: B) -> Result<u64, SftpError>
where
    B: Buf,
{
    ensure_buf_remaining(&b, mem::size_of::<u64>())?;
    Ok(b.get_u64())
}

fn read_bytes<B>(mut b: B) -> Result<Bytes, SftpError>
where
    B: Buf,
{
    let len = read_u32(&mut b)? as usize;
    ensure_buf_remaining(&b, len)?;
    Ok(b.copy_to_bytes(len))
}

/// Text on the wire is not guaranteed to be UTF-8; invalid sequences are replaced.
///
/// Paths are kept as raw bytes instead, so that they round-trip.
pub(crate) fn read_string<B>(b: B) -> Result<String, SftpError>
where
    B: Buf,
{
    let bytes = read_bytes(b)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn read_extensions<B>(mut b: B) -> Result<Vec<(String, String)>, SftpError>
where
    B: Buf,
{
    let mut extensions = vec![];
    while b.has_remaining() {
        let name = read_string(&mut b)?;
        let data = read_string(&mut b)?;
        extensions.push((name, data));
    }
    Ok(extensions)
}
