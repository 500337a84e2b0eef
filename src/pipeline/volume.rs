//! Random-access reads over a volume's decoded byte run
//!
//! Archive descriptor passes seek through volumes reading only header bytes;
//! this reader fetches just the segments that cover each requested range and
//! keeps the most recent one decoded, so walking headers costs a handful of
//! segment fetches rather than the whole volume.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::nntp::SegmentFetcher;
use crate::types::SegmentRef;

pub(crate) struct VolumeReader<'a> {
    fetcher: &'a Arc<dyn SegmentFetcher>,
    cancel: &'a CancellationToken,
    segments: &'a [SegmentRef],
    size: u64,
    cached: Option<(usize, Vec<u8>)>,
}

impl<'a> VolumeReader<'a> {
    pub(crate) fn new(
        fetcher: &'a Arc<dyn SegmentFetcher>,
        cancel: &'a CancellationToken,
        segments: &'a [SegmentRef],
    ) -> Self {
        let size = segments
            .last()
            .map(|s| s.part_offset + s.part_size)
            .unwrap_or(0);
        Self {
            fetcher,
            cancel,
            segments,
            size,
            cached: None,
        }
    }

    /// Decoded size of the volume
    pub(crate) fn len(&self) -> u64 {
        self.size
    }

    /// Read exactly `len` bytes at `offset`
    pub(crate) async fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let end = offset + len as u64;
        if end > self.size {
            return Err(Error::Validation(format!(
                "read [{offset}, {end}) beyond volume of {} bytes",
                self.size
            )));
        }
        let mut out = Vec::with_capacity(len);
        let mut cursor = offset;
        while cursor < end {
            let idx = self
                .segments
                .iter()
                .position(|s| s.part_offset <= cursor && cursor < s.part_offset + s.part_size)
                .ok_or_else(|| {
                    Error::Validation(format!("no segment covers volume offset {cursor}"))
                })?;
            let seg_offset = self.segments[idx].part_offset;
            let data = self.segment_bytes(idx).await?;
            let from = (cursor - seg_offset) as usize;
            let to = ((end - seg_offset) as usize).min(data.len());
            out.extend_from_slice(&data[from..to]);
            cursor = seg_offset + to as u64;
        }
        Ok(out)
    }

    /// Read up to `len` bytes at `offset`, clamped at the volume end
    pub(crate) async fn read_at_most(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        if offset >= self.size {
            return Ok(Vec::new());
        }
        let clamped = ((self.size - offset) as usize).min(len);
        self.read_at(offset, clamped).await
    }

    async fn segment_bytes(&mut self, idx: usize) -> Result<&[u8]> {
        let cached_idx = self.cached.as_ref().map(|(i, _)| *i);
        if cached_idx != Some(idx) {
            let segment = &self.segments[idx];
            let mut stream = self
                .fetcher
                .fetch_segment(&segment.message_id, self.cancel)
                .await?;
            let data = stream.read_to_end().await?;
            self.cached = Some((idx, data));
        }
        Ok(self
            .cached
            .as_ref()
            .map(|(_, d)| d.as_slice())
            .unwrap_or_else(|| unreachable!("cache filled above")))
    }
}
