use std::io::{self, SeekFrom};
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};

use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, ReadBuf, Take};

use crate::TransferError;

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// PartReader
// ---------------------------------------------------------------------------

/// Reads exactly one byte range of a file through its own file handle.
///
/// Each reader owns an independent handle, so concurrent part uploads never
/// share a seek cursor. The handle is closed when the reader is dropped.
pub struct PartReader {
    inner: Take<File>,
}

impl AsyncRead for PartReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

/// Opens `path` and positions a reader over `[offset, offset + size)`.
///
/// Fails if the range extends past the end of the file.
pub async fn open_part(path: &Path, offset: u64, size: u64) -> Result<PartReader, TransferError> {
    let mut file = File::open(path).await?;
    let file_size = file.metadata().await?.len();
    let end = offset
        .checked_add(size)
        .ok_or_else(|| TransferError::InvalidPlan(format!("range overflow at offset {offset}")))?;
    if end > file_size {
        return Err(TransferError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("range {offset}..{end} exceeds file size {file_size}"),
        )));
    }

    file.seek(SeekFrom::Start(offset)).await?;
    Ok(PartReader {
        inner: file.take(size),
    })
}
