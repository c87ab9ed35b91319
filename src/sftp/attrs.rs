use super::{
    error::SftpError,
    wire::{ensure_buf_remaining, put_string, read_string, read_u32, read_u64},
};
use bytes::{Buf, BufMut, Bytes};
use std::borrow::Cow;

// defined in https://tools.ietf.org/html/draft-ietf-secsh-filexfer-02#section-5
const SSH_FILEXFER_ATTR_SIZE: u32 = 0x00000001;
const SSH_FILEXFER_ATTR_UIDGID: u32 = 0x00000002;
const SSH_FILEXFER_ATTR_PERMISSIONS: u32 = 0x00000004;
const SSH_FILEXFER_ATTR_ACMODTIME: u32 = 0x00000008;
const SSH_FILEXFER_ATTR_EXTENDED: u32 = 0x80000000;

// defined in https://tools.ietf.org/html/draft-ietf-secsh-filexfer-02#section-6.3
const SSH_FXF_READ: u32 = 0x00000001;
const SSH_FXF_WRITE: u32 = 0x00000002;
const SSH_FXF_APPEND: u32 = 0x00000004;
const SSH_FXF_CREAT: u32 = 0x00000008;
const SSH_FXF_TRUNC: u32 = 0x00000010;
const SSH_FXF_EXCL: u32 = 0x00000020;

bitflags::bitflags! {
    /// Which optional fields of [`FileAttributes`] are present on the wire.
    #[repr(transparent)]
    pub struct AttrFlags: u32 {
        const SIZE = SSH_FILEXFER_ATTR_SIZE;
        const UIDGID = SSH_FILEXFER_ATTR_UIDGID;
        const PERMISSIONS = SSH_FILEXFER_ATTR_PERMISSIONS;
        const ACMODTIME = SSH_FILEXFER_ATTR_ACMODTIME;
        const EXTENDED = SSH_FILEXFER_ATTR_EXTENDED;
    }
}

bitflags::bitflags! {
    /// Open file flags.
    #[repr(transparent)]
    pub struct OpenFlags: u32 {
        /// Open the file for reading.
        const READ = SSH_FXF_READ;

        /// Open the file for writing.
        const WRITE = SSH_FXF_WRITE;

        /// Force all writes to append data at the end of the file.
        const APPEND = SSH_FXF_APPEND;

        /// A new file will be created if one does not already exist.
        const CREATE = SSH_FXF_CREAT;

        /// Truncate an existing file to zero length.
        ///
        /// This flag MUST be specified with [`CREATE`](Self::CREATE) if
        /// it is used.
        const TRUNCATE = SSH_FXF_TRUNC;

        /// Causes the request to fail if the named file already exists.
        ///
        /// This flag MUST be specified with [`CREATE`](Self::CREATE) if
        /// it is used.
        const EXCLUSIVE = SSH_FXF_EXCL;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserGroupId {
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessModificationTime {
    pub atime: u32,
    pub mtime: u32,
}

/// File attributes. Every field is optional; only present fields are sent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileAttributes {
    pub size: Option<u64>,
    pub uid_gid: Option<UserGroupId>,
    pub permissions: Option<u32>,
    pub access_modification_time: Option<AccessModificationTime>,
    /// `Some(vec![])` still sets the extended flag and a zero count.
    pub extended: Option<Vec<(String, String)>>,
}

impl FileAttributes {
    pub fn flags(&self) -> AttrFlags {
        let mut flags = AttrFlags::empty();
        flags.set(AttrFlags::SIZE, self.size.is_some());
        flags.set(AttrFlags::UIDGID, self.uid_gid.is_some());
        flags.set(AttrFlags::PERMISSIONS, self.permissions.is_some());
        flags.set(AttrFlags::ACMODTIME, self.access_modification_time.is_some());
        flags.set(AttrFlags::EXTENDED, self.extended.is_some());
        flags
    }

    pub(crate) fn encode<B>(&self, mut b: B)
    where
        B: BufMut,
    {
        b.put_u32(self.flags().bits());
        if let Some(size) = self.size {
            b.put_u64(size);
        }
        if let Some(UserGroupId { uid, gid }) = self.uid_gid {
            b.put_u32(uid);
            b.put_u32(gid);
        }
        if let Some(perm) = self.permissions {
            b.put_u32(perm);
        }
        if let Some(AccessModificationTime { atime, mtime }) = self.access_modification_time {
            b.put_u32(atime);
            b.put_u32(mtime);
        }
        if let Some(extended) = &self.extended {
            b.put_u32(extended.len() as u32);
            for (typ, data) in extended {
                put_string(&mut b, typ.as_bytes());
                put_string(&mut b, data.as_bytes());
            }
        }
    }

    pub(crate) fn decode<B>(mut b: B) -> Result<Self, SftpError>
    where
        B: Buf,
    {
        let flags = AttrFlags::from_bits_truncate(read_u32(&mut b)?);

        let size = if flags.contains(AttrFlags::SIZE) {
            Some(read_u64(&mut b)?)
        } else {
            None
        };

        let uid_gid = if flags.contains(AttrFlags::UIDGID) {
            let uid = read_u32(&mut b)?;
            let gid = read_u32(&mut b)?;
            Some(UserGroupId { uid, gid })
        } else {
            None
        };

        let permissions = if flags.contains(AttrFlags::PERMISSIONS) {
            Some(read_u32(&mut b)?)
        } else {
            None
        };

        let access_modification_time = if flags.contains(AttrFlags::ACMODTIME) {
            let atime = read_u32(&mut b)?;
            let mtime = read_u32(&mut b)?;
            Some(AccessModificationTime { atime, mtime })
        } else {
            None
        };

        let extended = if flags.contains(AttrFlags::EXTENDED) {
            let count = read_u32(&mut b)?;
            // each pair takes at least two length prefixes
            ensure_buf_remaining(&b, (count as usize).saturating_mul(8))?;
            let mut extended = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let ex_type = read_string(&mut b)?;
                let ex_data = read_string(&mut b)?;
                extended.push((ex_type, ex_data));
            }
            Some(extended)
        } else {
            None
        };

        Ok(Self {
            size,
            uid_gid,
            permissions,
            access_modification_time,
            extended,
        })
    }
}

/// An entry of a `Name` response.
///
/// `filename` holds the name exactly as the server sent it, which need not be
/// UTF-8. It can be passed back to any path argument unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub filename: Bytes,
    pub longname: String,
    pub attrs: FileAttributes,
}

impl DirEntry {
    /// The file name for display, with invalid UTF-8 replaced.
    pub fn filename_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.filename)
    }
}
