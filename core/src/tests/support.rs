use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{CoreError, CoreResult};
use crate::stream::{Capabilities, StorageStream};

/// In-memory stream whose bytes and close state stay observable after it is boxed.
#[derive(Clone, Default)]
pub struct MemoryStream {
    pub data: Arc<Mutex<Vec<u8>>>,
    pub closed: Arc<AtomicBool>,
    /// Number of upcoming writes that fail before writes succeed again.
    pub failing_writes: Arc<AtomicUsize>,
    pub cursor: u64,
    pub no_rewind: bool,
}

impl MemoryStream {
    pub fn with_bytes(bytes: Vec<u8>) -> Self {
        Self {
            data: Arc::new(Mutex::new(bytes)),
            ..Self::default()
        }
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }

    pub fn was_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }
}

impl StorageStream for MemoryStream {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            rewind: !self.no_rewind,
            ..Capabilities::random_access()
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> CoreResult<usize> {
        let data = self.data.lock().unwrap();
        let start = (self.cursor as usize).min(data.len());
        let count = buf.len().min(data.len() - start);
        buf[..count].copy_from_slice(&data[start..start + count]);
        drop(data);
        self.cursor += count as u64;
        Ok(count)
    }

    fn skip(&mut self, amount: u64) -> CoreResult<u64> {
        let length = self.data.lock().unwrap().len() as u64;
        let skipped = amount.min(length.saturating_sub(self.cursor));
        self.cursor += skipped;
        Ok(skipped)
    }

    fn available(&mut self) -> CoreResult<u64> {
        let length = self.data.lock().unwrap().len() as u64;
        Ok(length.saturating_sub(self.cursor))
    }

    fn write(&mut self, buf: &[u8]) -> CoreResult<()> {
        let pending = self.failing_writes.load(Ordering::SeqCst);
        if pending > 0 {
            self.failing_writes.store(pending - 1, Ordering::SeqCst);
            return Err(CoreError::Io("injected write failure".to_string()));
        }
        let mut data = self.data.lock().unwrap();
        let start = self.cursor as usize;
        let end = start + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        self.cursor = end as u64;
        Ok(())
    }

    fn seek(&mut self, offset: u64) -> CoreResult<()> {
        self.cursor = offset;
        Ok(())
    }

    fn rewind(&mut self) -> CoreResult<()> {
        if self.no_rewind {
            return Err(CoreError::Unsupported("rewind".to_string()));
        }
        self.cursor = 0;
        Ok(())
    }

    fn set_length(&mut self, length: u64) -> CoreResult<()> {
        self.data.lock().unwrap().resize(length as usize, 0);
        Ok(())
    }

    fn length(&mut self) -> CoreResult<u64> {
        Ok(self.data.lock().unwrap().len() as u64)
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Deterministic bytes for content checks. `seed` tells segments apart.
pub fn pattern(length: usize, seed: u8) -> Vec<u8> {
    (0..length)
        .map(|index| ((index % 251) as u8).wrapping_add(seed))
        .collect()
}
