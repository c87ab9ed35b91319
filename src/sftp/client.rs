use super::{
    attrs::{DirEntry, FileAttributes, OpenFlags},
    channel::SftpChannel,
    error::SftpError,
    file::SftpFile,
    state::SftpState,
    SftpConfig,
};
use bytes::Bytes;
use futures::future::BoxFuture;
use std::sync::Arc;

// a path that keeps resolving to something new is followed at most this far
const MAX_PATH_RESOLUTIONS: usize = 16;

fn raw(path: impl AsRef<[u8]>) -> Bytes {
    Bytes::copy_from_slice(path.as_ref())
}

/// A handle to an SFTP session.
///
/// Paths are byte strings, as on the wire: `&str`, `String` and the raw
/// [`DirEntry::filename`] of a listing are all accepted.
///
/// Clones share the session; it is closed once every handle and every file
/// opened through it has been dropped, or explicitly with [`close`](Self::close).
#[derive(Debug, Clone)]
pub struct SftpClient {
    channel: SftpChannel,
    config: Arc<SftpConfig>,
    extensions: Arc<[(String, String)]>,
}

impl SftpClient {
    pub(crate) fn new(
        channel: SftpChannel,
        config: SftpConfig,
        extensions: Vec<(String, String)>,
    ) -> Self {
        Self {
            channel,
            config: Arc::new(config),
            extensions: extensions.into(),
        }
    }

    pub fn state(&self) -> SftpState {
        self.channel.state()
    }

    /// Extension pairs announced by the server.
    pub fn extensions(&self) -> &[(String, String)] {
        &self.extensions
    }

    /// Open a file. The returned file must be [closed](SftpFile::close).
    pub async fn open_file(
        &self,
        path: impl AsRef<[u8]>,
        flags: OpenFlags,
        attrs: FileAttributes,
    ) -> Result<SftpFile, SftpError> {
        let path = raw(path);
        let handle = self.channel.open(path.clone(), flags, attrs).await?;
        let path = String::from_utf8_lossy(&path).into_owned();
        tracing::debug!(%path, "opened remote file");
        Ok(SftpFile::new(
            self.channel.clone(),
            path,
            handle,
            self.config.write_slice_length,
        ))
    }

    /// Open a file, run `f` on it, and close it afterwards whatever `f` returned.
    ///
    /// An error from `f` takes precedence over an error while closing.
    pub async fn with_file<F, T>(
        &self,
        path: impl AsRef<[u8]>,
        flags: OpenFlags,
        attrs: FileAttributes,
        f: F,
    ) -> Result<T, SftpError>
    where
        F: for<'a> FnOnce(&'a SftpFile) -> BoxFuture<'a, Result<T, SftpError>>,
    {
        let file = self.open_file(path, flags, attrs).await?;
        let result = f(&file).await;
        let closed = file.close().await;
        let value = result?;
        closed?;
        Ok(value)
    }

    /// List a directory, following the path until it resolves to itself.
    pub async fn list_directory(&self, path: impl AsRef<[u8]>) -> Result<Vec<DirEntry>, SftpError> {
        let mut current = raw(path);
        for _ in 0..MAX_PATH_RESOLUTIONS {
            let resolved = self.channel.realpath(current.clone()).await?;
            if resolved == current {
                break;
            }
            current = resolved;
        }

        let handle = self.channel.opendir(current.clone()).await?;
        let mut entries = vec![];
        let listed = loop {
            match self.channel.readdir(handle.clone()).await {
                Ok(Some(page)) => entries.extend(page),
                Ok(None) => break Ok(()),
                Err(err) => break Err(err),
            }
        };
        let closed = self.channel.close(handle).await;

        listed?;
        closed?;
        tracing::debug!(path = %String::from_utf8_lossy(&current), entries = entries.len(), "listed remote directory");
        Ok(entries)
    }

    /// Attributes of the file at `path`, following symbolic links.
    pub async fn get_attributes(&self, path: impl AsRef<[u8]>) -> Result<FileAttributes, SftpError> {
        self.channel.stat(raw(path)).await
    }

    /// Attributes of the file at `path`, without following symbolic links.
    pub async fn lstat(&self, path: impl AsRef<[u8]>) -> Result<FileAttributes, SftpError> {
        self.channel.lstat(raw(path)).await
    }

    pub async fn set_attributes(
        &self,
        path: impl AsRef<[u8]>,
        attrs: FileAttributes,
    ) -> Result<(), SftpError> {
        self.channel.setstat(raw(path), attrs).await
    }

    pub async fn create_directory(
        &self,
        path: impl AsRef<[u8]>,
        attrs: FileAttributes,
    ) -> Result<(), SftpError> {
        self.channel.mkdir(raw(path), attrs).await
    }

    pub async fn move_item(
        &self,
        from: impl AsRef<[u8]>,
        to: impl AsRef<[u8]>,
    ) -> Result<(), SftpError> {
        self.channel.rename(raw(from), raw(to)).await
    }

    pub async fn remove_directory(&self, path: impl AsRef<[u8]>) -> Result<(), SftpError> {
        self.channel.rmdir(raw(path)).await
    }

    pub async fn remove_file(&self, path: impl AsRef<[u8]>) -> Result<(), SftpError> {
        self.channel.remove(raw(path)).await
    }

    /// The canonical form of `path`, as the server spells it.
    pub async fn real_path(&self, path: impl AsRef<[u8]>) -> Result<Bytes, SftpError> {
        self.channel.realpath(raw(path)).await
    }

    pub async fn read_link(&self, path: impl AsRef<[u8]>) -> Result<Bytes, SftpError> {
        self.channel.readlink(raw(path)).await
    }

    /// Create a symbolic link at `linkpath` pointing to `targetpath`.
    pub async fn create_symlink(
        &self,
        linkpath: impl AsRef<[u8]>,
        targetpath: impl AsRef<[u8]>,
    ) -> Result<(), SftpError> {
        let (linkpath, targetpath) = (raw(linkpath), raw(targetpath));
        if self.config.reverse_symlink_arguments {
            self.channel.symlink(targetpath, linkpath).await
        } else {
            self.channel.symlink(linkpath, targetpath).await
        }
    }

    /// Close the session. Pending requests fail with `ConnectionClosed`.
    pub async fn close(&self) -> Result<(), SftpError> {
        self.channel.disconnect().await
    }
}
