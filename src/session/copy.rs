//! COPY FROM STDIN ingest strategies.
//!
//! Both strategies write the fixed binary-format preamble before the user
//! payload, so callers supply only the tuple stream. The engine never leaves
//! a copy open: every error path fails the in-progress copy before the error
//! propagates, and the session loop rolls the transaction back afterwards.

use bytes::{Buf, Bytes};
use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::debug;

use crate::error::{Error, Result};

use super::work::CopySource;
use super::SessionConnection;

/// The fixed header of a PostgreSQL binary COPY stream: the 11-byte
/// signature, a zero flags field and a zero-length header extension.
pub const BINARY_PREAMBLE: [u8; 19] = [
    b'P', b'G', b'C', b'O', b'P', b'Y', b'\n', 0xFF, b'\r', b'\n', 0x00, // signature
    0x00, 0x00, 0x00, 0x00, // flags
    0x00, 0x00, 0x00, 0x00, // header extension length
];

/// Drive one COPY IN to completion, returning the server-reported row count.
pub(crate) async fn run<C>(conn: &mut C, sql: &str, source: CopySource) -> Result<u64>
where
    C: SessionConnection + ?Sized,
{
    match source {
        CopySource::Buffered(data) => {
            // Logical concatenation; the preamble is never copied in front
            // of the payload in memory.
            let mut input = Bytes::from_static(&BINARY_PREAMBLE).chain(data);
            conn.copy_in_buffered(sql, &mut input).await
        }
        CopySource::Streaming(mut stream) => {
            conn.copy_begin(sql).await?;
            match feed(conn, &mut stream).await {
                Ok(()) => {
                    debug!("closing copy stream");
                    conn.copy_end().await
                }
                Err(err) => {
                    if let Err(fail_err) = conn.copy_fail("copy aborted by client").await {
                        debug!(error = %fail_err, "failed to abort copy cleanly");
                    }
                    Err(err)
                }
            }
        }
    }
}

/// Write the preamble and then every source buffer into the open copy. Each
/// buffer is written out completely and dropped before the next one is
/// requested from the source.
async fn feed<C>(conn: &mut C, stream: &mut BoxStream<'static, std::io::Result<bytes::Bytes>>) -> Result<()>
where
    C: SessionConnection + ?Sized,
{
    conn.copy_write(&BINARY_PREAMBLE).await?;
    while let Some(buffer) = stream.next().await {
        let buffer = buffer.map_err(|e| Error::CopySource(e.to_string()))?;
        conn.copy_write(&buffer).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preamble_layout() {
        assert_eq!(BINARY_PREAMBLE.len(), 19);
        assert_eq!(&BINARY_PREAMBLE[..11], b"PGCOPY\n\xff\r\n\0");
        assert!(BINARY_PREAMBLE[11..].iter().all(|&b| b == 0));
    }

    #[test]
    fn preamble_chains_ahead_of_payload() {
        let payload = Bytes::from_static(&[0x00, 0x03, 0xAA]);
        let mut chained = Bytes::from_static(&BINARY_PREAMBLE).chain(payload);

        let mut all = Vec::new();
        while chained.has_remaining() {
            let chunk = chained.chunk();
            all.extend_from_slice(chunk);
            let n = chunk.len();
            chained.advance(n);
        }
        assert_eq!(&all[..19], &BINARY_PREAMBLE[..]);
        assert_eq!(&all[19..], &[0x00, 0x03, 0xAA]);
    }
}
