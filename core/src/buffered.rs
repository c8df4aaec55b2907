use tracing::warn;

use crate::error::{CoreError, CoreResult};
use crate::stream::StorageStream;

/// Called when a write to a backing stream fails. Returning `true` retries the same
/// write, `false` gives up and propagates the error.
pub trait WriteErrorHandler: Send {
    fn handle(&mut self, err: &CoreError) -> bool;
}

impl<F> WriteErrorHandler for F
where
    F: FnMut(&CoreError) -> bool + Send,
{
    fn handle(&mut self, err: &CoreError) -> bool {
        self(err)
    }
}

pub(crate) type ErrorHook = Option<Box<dyn WriteErrorHandler>>;

/// One backing stream of the reorder buffer with a small write queue in front of it.
///
/// `offset` is where the queue lands once flushed; `length` is the high-water mark of
/// everything ever written through this target.
pub(crate) struct BufferedTarget {
    pub(crate) target: Box<dyn StorageStream>,
    pub(crate) offset: u64,
    pub(crate) length: u64,
    queue: Vec<u8>,
    queued: usize,
}

#[derive(Debug, Clone)]
pub(crate) struct TargetState {
    offset: u64,
    length: u64,
    queue: Vec<u8>,
}

impl BufferedTarget {
    pub(crate) fn new(target: Box<dyn StorageStream>, queue_size: usize) -> Self {
        Self {
            target,
            offset: 0,
            length: 0,
            queue: vec![0u8; queue_size.max(1)],
            queued: 0,
        }
    }

    /// Absolute position of the next byte written through this target.
    pub(crate) fn position(&self) -> u64 {
        self.offset + self.queued as u64
    }

    pub(crate) fn write(&mut self, mut data: &[u8], hook: &mut ErrorHook) -> CoreResult<()> {
        while !data.is_empty() {
            if self.queued == self.queue.len() {
                self.flush(hook)?;
            }
            let take = data.len().min(self.queue.len() - self.queued);
            self.queue[self.queued..self.queued + take].copy_from_slice(&data[..take]);
            self.queued += take;
            data = &data[take..];
        }
        self.length = self.length.max(self.position());
        Ok(())
    }

    pub(crate) fn flush(&mut self, hook: &mut ErrorHook) -> CoreResult<()> {
        if self.queued == 0 {
            return Ok(());
        }
        write_proof(&mut self.target, self.offset, &self.queue[..self.queued], hook)?;
        self.offset += self.queued as u64;
        self.queued = 0;
        Ok(())
    }

    /// Moves the flush position. The queue must already be empty.
    pub(crate) fn seek(&mut self, absolute: u64) -> CoreResult<()> {
        if self.queued != 0 {
            return Err(CoreError::InvalidState(format!(
                "seek with {} queued bytes",
                self.queued
            )));
        }
        if absolute == self.offset {
            return Ok(());
        }
        self.target.seek(absolute)?;
        self.offset = absolute;
        Ok(())
    }

    pub(crate) fn reset(&mut self) -> CoreResult<()> {
        self.offset = 0;
        self.length = 0;
        self.queued = 0;
        self.target.seek(0)
    }

    /// Fills `buf` from the backing stream at `at`, bypassing the queue.
    pub(crate) fn read_exact_at(&mut self, at: u64, buf: &mut [u8]) -> CoreResult<()> {
        self.target.seek(at)?;
        let mut filled = 0;
        while filled < buf.len() {
            let read = self.target.read(&mut buf[filled..])?;
            if read == 0 {
                return Err(CoreError::Storage(format!(
                    "backing stream ended at {} while {} bytes were expected",
                    at + filled as u64,
                    buf.len() - filled
                )));
            }
            filled += read;
        }
        Ok(())
    }

    pub(crate) fn checkpoint(&self) -> TargetState {
        TargetState {
            offset: self.offset,
            length: self.length,
            queue: self.queue[..self.queued].to_vec(),
        }
    }

    pub(crate) fn restore(&mut self, state: TargetState) {
        self.offset = state.offset;
        self.length = state.length;
        self.queued = state.queue.len();
        self.queue[..self.queued].copy_from_slice(&state.queue);
    }

    pub(crate) fn close(&mut self) {
        self.queued = 0;
        self.target.close();
    }
}

/// Writes `data` at `at`, consulting `hook` after each failure.
pub(crate) fn write_proof(
    target: &mut Box<dyn StorageStream>,
    at: u64,
    data: &[u8],
    hook: &mut ErrorHook,
) -> CoreResult<()> {
    loop {
        let attempt = target.seek(at).and_then(|_| target.write(data));
        let err = match attempt {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        let retry = hook.as_mut().map(|handler| handler.handle(&err)).unwrap_or(false);
        if !retry {
            return Err(err);
        }
        warn!(offset = at, bytes = data.len(), "retrying failed write: {err}");
    }
}

impl std::fmt::Debug for BufferedTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedTarget")
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("queued", &self.queued)
            .finish()
    }
}
