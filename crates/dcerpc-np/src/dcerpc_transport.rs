//! Fragment framing over an open named pipe
//!
//! The pipe is a plain byte stream from this layer's point of view. Each
//! fragment is self-delimiting: read the 16-byte common header, then the
//! `frag_length - 16` bytes it announces.

use crate::dcerpc::PduHeader;
use crate::error::ProtocolError;
use bytes::{Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Largest fragment accepted from the pipe
pub const DEFAULT_MAX_PDU_SIZE: usize = 65536;

/// Reads and writes whole fragments on an already-open pipe
#[derive(Debug)]
pub struct DceRpcTransport<T> {
    inner: T,
    max_pdu_size: usize,
}

impl<T> DceRpcTransport<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            max_pdu_size: DEFAULT_MAX_PDU_SIZE,
        }
    }

    pub fn with_max_pdu_size(mut self, max_size: usize) -> Self {
        self.max_pdu_size = max_size;
        self
    }

    pub fn max_pdu_size(&self) -> usize {
        self.max_pdu_size
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

impl<T: AsyncRead + Unpin> DceRpcTransport<T> {
    /// Read one fragment, header included.
    ///
    /// Generic over the caller's error type so bind and call paths can each
    /// surface I/O and framing failures in their own error enum.
    pub async fn read_fragment<E>(&mut self) -> Result<(PduHeader, Bytes), E>
    where
        E: From<io::Error> + From<ProtocolError>,
    {
        let mut header_buf = [0u8; PduHeader::SIZE];
        self.inner.read_exact(&mut header_buf).await?;
        let header = PduHeader::decode(&header_buf)?;

        let frag_length = header.frag_length as usize;
        if frag_length > self.max_pdu_size {
            return Err(ProtocolError::PduTooLarge {
                size: frag_length,
                max: self.max_pdu_size,
            }
            .into());
        }

        let mut fragment = BytesMut::zeroed(frag_length);
        fragment[..PduHeader::SIZE].copy_from_slice(&header_buf);
        self.inner
            .read_exact(&mut fragment[PduHeader::SIZE..])
            .await?;

        trace!(
            "Read fragment: ptype={}, call_id={}, frag_length={}, flags=0x{:02x}",
            header.packet_type.name(),
            header.call_id,
            frag_length,
            header.packet_flags.as_u8()
        );
        Ok((header, fragment.freeze()))
    }
}

impl<T: AsyncWrite + Unpin> DceRpcTransport<T> {
    /// Write one encoded fragment and flush it.
    pub async fn write_fragment(&mut self, data: &[u8]) -> io::Result<()> {
        self.inner.write_all(data).await?;
        self.inner.flush().await?;
        trace!("Wrote fragment: len={}", data.len());
        Ok(())
    }
}
