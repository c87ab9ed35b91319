use super::{attrs::FileAttributes, channel::SftpChannel, error::SftpError};
use bytes::Bytes;

const READ_CHUNK_LENGTH: u32 = 32 * 1024;

/// A remote file opened through [`SftpClient::open_file`](super::SftpClient::open_file).
///
/// Should be closed with [`close`](Self::close), which reports whether the
/// server released the handle. A file dropped while open is logged as an
/// error and its handle is closed in the background.
#[derive(Debug)]
pub struct SftpFile {
    channel: SftpChannel,
    path: String,
    handle: Bytes,
    write_slice_length: usize,
    open: bool,
}

impl SftpFile {
    pub(crate) fn new(
        channel: SftpChannel,
        path: String,
        handle: Bytes,
        write_slice_length: usize,
    ) -> Self {
        Self {
            channel,
            path,
            handle,
            write_slice_length,
            open: true,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Read at most `len` bytes from `offset`. Empty at end of file.
    pub async fn read(&self, offset: u64, len: u32) -> Result<Bytes, SftpError> {
        self.channel.read(self.handle.clone(), offset, len).await
    }

    /// Read from `offset` until end of file.
    pub async fn read_to_end(&self, mut offset: u64) -> Result<Vec<u8>, SftpError> {
        let mut content = vec![];
        loop {
            let chunk = self.read(offset, READ_CHUNK_LENGTH).await?;
            if chunk.is_empty() {
                return Ok(content);
            }
            offset += chunk.len() as u64;
            content.extend_from_slice(&chunk);
        }
    }

    /// Write `data` at `offset`.
    ///
    /// Large buffers are written as consecutive slices, one request at a time.
    /// Writing nothing sends nothing.
    pub async fn write(&self, data: impl Into<Bytes>, offset: u64) -> Result<(), SftpError> {
        let data = data.into();
        let mut written = 0;
        while written < data.len() {
            let end = data.len().min(written + self.write_slice_length);
            let slice = data.slice(written..end);
            self.channel
                .write(self.handle.clone(), offset + written as u64, slice)
                .await?;
            written = end;
        }
        Ok(())
    }

    pub async fn read_attributes(&self) -> Result<FileAttributes, SftpError> {
        self.channel.fstat(self.handle.clone()).await
    }

    pub async fn set_attributes(&self, attrs: FileAttributes) -> Result<(), SftpError> {
        self.channel.fsetstat(self.handle.clone(), attrs).await
    }

    /// Close the file. The handle is released even if the request fails.
    pub async fn close(mut self) -> Result<(), SftpError> {
        self.open = false;
        let result = self.channel.close(self.handle.clone()).await;
        tracing::debug!(path = %self.path, ?result, "closed remote file");
        result
    }
}

impl Drop for SftpFile {
    fn drop(&mut self) {
        if self.open {
            tracing::error!(path = %self.path, "SftpFile dropped without being closed");
            self.channel.release(self.handle.clone());
        }
    }
}
