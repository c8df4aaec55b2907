use std::fmt;

use crate::error::{CoreError, CoreResult};
use crate::stream::{Capabilities, StorageStream};
use crate::writer::ProgressReport;

pub const DEFAULT_REPORT_INTERVAL: u64 = 256 * 1024;

/// Read-only view over `[start, end)` of another stream, used to re-read a segment that
/// was already written.
pub struct SegmentReader {
    source: Box<dyn StorageStream>,
    start: u64,
    length: u64,
    position: u64,
    progress: Option<Box<dyn ProgressReport>>,
    report_interval: u64,
    unreported: u64,
}

impl SegmentReader {
    /// Positions `source` at `start`. The source is closed when the range is empty or the
    /// source is shorter than `end`.
    pub fn new(mut source: Box<dyn StorageStream>, start: u64, end: u64) -> CoreResult<Self> {
        if end <= start {
            source.close();
            return Err(CoreError::InvalidRange(format!(
                "segment {}..{} is empty",
                start, end
            )));
        }
        let available = match source.length() {
            Ok(length) => length,
            Err(err) => {
                source.close();
                return Err(err);
            }
        };
        if available < end {
            source.close();
            return Err(CoreError::InvalidRange(format!(
                "segment {}..{} exceeds the {} bytes available",
                start, end, available
            )));
        }
        if let Err(err) = source.seek(start) {
            source.close();
            return Err(err);
        }

        Ok(Self {
            source,
            start,
            length: end - start,
            position: 0,
            progress: None,
            report_interval: DEFAULT_REPORT_INTERVAL,
            unreported: 0,
        })
    }

    pub fn with_report_interval(mut self, interval: u64) -> Self {
        self.report_interval = interval.max(1);
        self
    }

    pub fn set_progress(&mut self, report: impl ProgressReport + 'static) {
        self.progress = Some(Box::new(report));
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn remaining(&self) -> u64 {
        self.length - self.position
    }

    fn advance(&mut self, amount: u64) {
        self.position += amount;
        let Some(progress) = self.progress.as_mut() else {
            return;
        };
        self.unreported += amount;
        if self.unreported >= self.report_interval {
            self.unreported = 0;
            progress.report(self.position);
        }
    }
}

impl StorageStream for SegmentReader {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            read: true,
            write: false,
            seek: false,
            set_length: false,
            rewind: self.source.can_rewind(),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> CoreResult<usize> {
        let remaining = self.remaining();
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let wanted = (buf.len() as u64).min(remaining) as usize;
        let read = self.source.read(&mut buf[..wanted])?;
        self.advance(read as u64);
        Ok(read)
    }

    fn skip(&mut self, amount: u64) -> CoreResult<u64> {
        let target = self.position.saturating_add(amount).min(self.length);
        let skipped = target - self.position;
        if skipped == 0 {
            return Ok(0);
        }
        self.source.seek(self.start + target)?;
        self.position = target;
        Ok(skipped)
    }

    fn available(&mut self) -> CoreResult<u64> {
        Ok(self.remaining())
    }

    fn write(&mut self, _buf: &[u8]) -> CoreResult<()> {
        Ok(())
    }

    fn rewind(&mut self) -> CoreResult<()> {
        if !self.source.can_rewind() {
            return Err(CoreError::Unsupported("source cannot rewind".to_string()));
        }
        self.source.seek(self.start)?;
        self.position = 0;
        self.unreported = 0;
        Ok(())
    }

    fn length(&mut self) -> CoreResult<u64> {
        Ok(self.length)
    }

    fn close(&mut self) {
        self.source.close();
    }

    fn is_closed(&self) -> bool {
        self.source.is_closed()
    }
}

impl fmt::Debug for SegmentReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentReader")
            .field("start", &self.start)
            .field("length", &self.length)
            .field("position", &self.position)
            .finish()
    }
}
