//! Lazy reader over a single segment
//!
//! Pairs the parsed yEnc header with the decoded body. A live stream borrows
//! its pooled connection until drained; dropping it early poisons the
//! connection so the pool replaces it instead of reusing a session with a
//! half-read body on the wire.

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::types::YencHeader;

use super::pool::PooledConnection;

/// `(YencHeader, byte source)` with an explicit close obligation
pub struct SegmentStream {
    header: YencHeader,
    source: Source,
}

enum Source {
    /// Decoded bytes already in memory (tests, cache hits)
    Buffered { data: Bytes, consumed: bool },
    /// Body still arriving on a pooled connection
    Live {
        conn: Option<PooledConnection>,
        finished: bool,
    },
}

impl SegmentStream {
    /// Stream over an open body on a pooled connection
    pub(crate) fn live(header: YencHeader, conn: PooledConnection) -> Self {
        Self {
            header,
            source: Source::Live {
                conn: Some(conn),
                finished: false,
            },
        }
    }

    /// Stream over fully decoded bytes
    pub fn from_bytes(header: YencHeader, data: Bytes) -> Self {
        Self {
            header,
            source: Source::Buffered {
                data,
                consumed: false,
            },
        }
    }

    /// The segment's yEnc header, available before any body byte
    pub fn header(&self) -> &YencHeader {
        &self.header
    }

    /// Next decoded chunk; `None` at end of segment
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        match &mut self.source {
            Source::Buffered { data, consumed } => {
                if *consumed || data.is_empty() {
                    Ok(None)
                } else {
                    *consumed = true;
                    Ok(Some(data.clone()))
                }
            }
            Source::Live { conn, finished } => {
                if *finished {
                    return Ok(None);
                }
                let Some(pooled) = conn.as_mut() else {
                    return Ok(None);
                };
                match pooled.conn().next_chunk().await {
                    Ok(Some(chunk)) => Ok(Some(chunk)),
                    Ok(None) => {
                        *finished = true;
                        // Drained cleanly: returning the connection idle
                        drop(conn.take());
                        Ok(None)
                    }
                    Err(e) => {
                        *finished = true;
                        if let Some(mut pooled) = conn.take() {
                            pooled.mark_broken();
                            pooled.pool().record_failure(&e);
                        }
                        Err(e)
                    }
                }
            }
        }
    }

    /// Read the remaining body into one buffer
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.header.part_size as usize);
        while let Some(chunk) = self.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        if out.len() as u64 != self.header.part_size {
            return Err(Error::Protocol(format!(
                "segment produced {} bytes, header declared {}",
                out.len(),
                self.header.part_size
            )));
        }
        Ok(out)
    }

    /// Abandon the stream, poisoning a live connection
    pub fn abort(&mut self) {
        if let Source::Live { conn, finished } = &mut self.source {
            *finished = true;
            if let Some(mut pooled) = conn.take() {
                pooled.mark_broken();
            }
        }
    }
}

impl Drop for SegmentStream {
    fn drop(&mut self) {
        // An unfinished live stream leaves body bytes on the wire; the
        // connection must not be reused
        if let Source::Live {
            conn,
            finished: false,
        } = &mut self.source
            && let Some(mut pooled) = conn.take()
        {
            pooled.mark_broken();
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn header(size: u64) -> YencHeader {
        YencHeader {
            file_name: "f.bin".to_string(),
            part_number: Some(1),
            part_offset: 0,
            part_size: size,
            total_size: size,
            crc32: None,
        }
    }

    #[tokio::test]
    async fn buffered_stream_yields_once() {
        let mut stream = SegmentStream::from_bytes(header(5), Bytes::from_static(b"hello"));
        assert_eq!(stream.header().part_size, 5);
        assert_eq!(stream.next_chunk().await.unwrap().unwrap(), "hello");
        assert!(stream.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn read_to_end_checks_declared_size() {
        let mut stream = SegmentStream::from_bytes(header(5), Bytes::from_static(b"hello"));
        assert_eq!(stream.read_to_end().await.unwrap(), b"hello");

        let mut short = SegmentStream::from_bytes(header(9), Bytes::from_static(b"hello"));
        assert!(matches!(
            short.read_to_end().await,
            Err(Error::Protocol(_))
        ));
    }
}
