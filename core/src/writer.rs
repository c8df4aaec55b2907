//! Reorder buffer that assembles out-of-order segment writes into one file.
//!
//! Bytes the caller is not yet allowed to commit to the destination are parked in a
//! scratch file and drained into the destination once the offset checker reports that the
//! region before them is complete. One writer assembles one destination file and expects
//! its calls to be serialized by the owner.

use std::path::{Path, PathBuf};

use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::buffered::{write_proof, BufferedTarget, ErrorHook, TargetState, WriteErrorHandler};
use crate::config::AssemblyConfig;
use crate::error::{CoreError, CoreResult};
use crate::file_stream::FileStream;
use crate::stream::{Capabilities, StorageStream};

/// Reports how far it is currently safe to write into the destination.
///
/// `Some(offset)` is the absolute offset where direct writes must stop; `None` means the
/// whole file may be written directly.
pub trait OffsetChecker: Send {
    fn check(&mut self) -> Option<u64>;
}

impl<F> OffsetChecker for F
where
    F: FnMut() -> Option<u64> + Send,
{
    fn check(&mut self) -> Option<u64> {
        self()
    }
}

pub trait ProgressReport: Send {
    fn report(&mut self, position: u64);
}

impl<F> ProgressReport for F
where
    F: FnMut(u64) + Send,
{
    fn report(&mut self, position: u64) {
        self(position)
    }
}

/// Fresh scratch file path inside `dir`, unique per writer.
pub fn scratch_path_in(dir: &Path) -> PathBuf {
    dir.join(format!("spool-{}.tmp", Uuid::new_v4()))
}

struct Targets {
    out: BufferedTarget,
    aux: BufferedTarget,
}

struct Snapshot {
    out: TargetState,
    aux: TargetState,
    report_position: u64,
    max_length_known: u64,
}

/// Write-only stream that accepts bytes in any order the offset checker allows and
/// commits them to the destination in order.
///
/// A failed `write` leaves the bookkeeping exactly as it was before the call. Bytes
/// already overwritten in place on the backing files are not restored. If compacting the
/// scratch file fails after a drain was committed, the writer is marked failed and refuses
/// every further operation except `close`.
pub struct SequentialWriter {
    targets: Option<Targets>,
    checker: Box<dyn OffsetChecker>,
    progress: Option<Box<dyn ProgressReport>>,
    write_error: ErrorHook,
    report_position: u64,
    max_length_known: u64,
    config: AssemblyConfig,
    scratch_path: PathBuf,
    final_length: Option<u64>,
    failed: Option<String>,
}

impl SequentialWriter {
    pub fn new(
        target: Box<dyn StorageStream>,
        scratch: impl AsRef<Path>,
        checker: impl OffsetChecker + 'static,
    ) -> CoreResult<Self> {
        Self::with_config(target, scratch, checker, AssemblyConfig::default())
    }

    pub fn with_config(
        mut target: Box<dyn StorageStream>,
        scratch: impl AsRef<Path>,
        checker: impl OffsetChecker + 'static,
        config: AssemblyConfig,
    ) -> CoreResult<Self> {
        if !target.can_seek() || !target.can_write() {
            target.close();
            return Err(CoreError::Unsupported(
                "destination stream must be writable and seekable".to_string(),
            ));
        }
        let scratch_path = scratch.as_ref().to_path_buf();
        let scratch = match FileStream::create(&scratch_path) {
            Ok(stream) => stream,
            Err(err) => {
                target.close();
                return Err(err);
            }
        };
        Ok(Self::from_streams(target, Box::new(scratch), scratch_path, checker, config))
    }

    /// Builds a writer over an already opened scratch stream.
    pub(crate) fn from_streams(
        target: Box<dyn StorageStream>,
        scratch: Box<dyn StorageStream>,
        scratch_path: PathBuf,
        checker: impl OffsetChecker + 'static,
        config: AssemblyConfig,
    ) -> Self {
        debug!(scratch = %scratch_path.display(), "reorder buffer opened");
        Self {
            targets: Some(Targets {
                out: BufferedTarget::new(target, config.queue_buffer_size),
                aux: BufferedTarget::new(scratch, config.queue_buffer_size),
            }),
            checker: Box::new(checker),
            progress: None,
            write_error: None,
            report_position: config.progress_interval_bytes,
            max_length_known: 0,
            config,
            scratch_path,
            final_length: None,
            failed: None,
        }
    }

    pub fn set_progress(&mut self, report: impl ProgressReport + 'static) {
        self.progress = Some(Box::new(report));
    }

    pub fn set_write_error_handler(&mut self, handler: impl WriteErrorHandler + 'static) {
        self.write_error = Some(Box::new(handler));
    }

    pub fn scratch_path(&self) -> &Path {
        &self.scratch_path
    }

    fn targets(&mut self) -> CoreResult<&mut Targets> {
        self.ensure_usable()?;
        self.targets.as_mut().ok_or(CoreError::Closed)
    }

    fn ensure_usable(&self) -> CoreResult<()> {
        match &self.failed {
            Some(reason) => Err(CoreError::InvalidState(format!(
                "reorder buffer failed earlier: {}",
                reason
            ))),
            None => Ok(()),
        }
    }

    fn position(&self) -> u64 {
        self.targets
            .as_ref()
            .map(|t| t.out.position() + t.aux.position())
            .unwrap_or(0)
    }

    fn checkpoint(&self) -> CoreResult<Snapshot> {
        let targets = self.targets.as_ref().ok_or(CoreError::Closed)?;
        Ok(Snapshot {
            out: targets.out.checkpoint(),
            aux: targets.aux.checkpoint(),
            report_position: self.report_position,
            max_length_known: self.max_length_known,
        })
    }

    fn restore(&mut self, snapshot: Snapshot) {
        if let Some(targets) = self.targets.as_mut() {
            targets.out.restore(snapshot.out);
            targets.aux.restore(snapshot.aux);
        }
        self.report_position = snapshot.report_position;
        self.max_length_known = snapshot.max_length_known;
    }

    /// Runs `op`, rolling the bookkeeping back if it fails. A writer that failed for good
    /// keeps its state since the backing files no longer match the snapshot.
    fn transact<T>(&mut self, op: impl FnOnce(&mut Self) -> CoreResult<T>) -> CoreResult<T> {
        self.ensure_usable()?;
        let snapshot = self.checkpoint()?;
        match op(self) {
            Ok(value) => Ok(value),
            Err(err) if self.failed.is_some() => Err(err),
            Err(err) => {
                trace!("rolling back reorder buffer state: {err}");
                self.restore(snapshot);
                Err(err)
            }
        }
    }

    fn write_queued(&mut self, data: &[u8]) -> CoreResult<()> {
        let end = self.checker.check();
        let threshold = self.config.aux_threshold_bytes;
        let Targets { out, aux } = self.targets.as_mut().ok_or(CoreError::Closed)?;
        let hook = &mut self.write_error;

        let out_position = out.position();
        let aux_position = aux.position();
        let mut available = match end {
            None => u64::MAX,
            Some(end) if end < out_position => {
                return Err(CoreError::InvalidOffset(format!(
                    "reported offset {} is behind the committed offset {}",
                    end, out_position
                )))
            }
            Some(end) => end - out_position,
        };

        let using_aux = aux.length > 0 && out_position >= out.length;
        let underflow = aux_position < aux.length || out_position < out.length;

        if using_aux {
            let prospective = aux.length.max(aux_position + data.len() as u64);
            aux.write(data, hook)?;
            if prospective >= threshold && prospective <= available {
                self.flush_auxiliary(available)?;
            }
            return Ok(());
        }

        if underflow {
            available = out.length - out_position;
        }
        let direct = (data.len() as u64).min(available) as usize;
        out.write(&data[..direct], hook)?;
        if direct < data.len() {
            aux.write(&data[direct..], hook)?;
        }
        Ok(())
    }

    /// Moves up to `amount` bytes from the front of the scratch file to the end of the
    /// committed region, then compacts what is left to the front of the scratch file.
    ///
    /// The drain is committed as soon as the bytes are in the destination. A failure while
    /// compacting marks the writer failed.
    pub(crate) fn flush_auxiliary(&mut self, amount: u64) -> CoreResult<()> {
        self.ensure_usable()?;
        let Some((amount, cursor)) = self.drain_auxiliary(amount)? else {
            return Ok(());
        };
        if let Err(err) = self.compact_auxiliary(amount, cursor) {
            warn!(drained = amount, "scratch compaction failed, writer unusable: {err}");
            self.failed = Some(err.to_string());
            return Err(err);
        }
        Ok(())
    }

    /// Copies the first `amount` scratch bytes behind the committed region. Returns the
    /// amount copied and the logical cursor before the copy.
    fn drain_auxiliary(&mut self, amount: u64) -> CoreResult<Option<(u64, u64)>> {
        let chunk_size = self.config.copy_buffer_size.max(1);
        let Targets { out, aux } = self.targets.as_mut().ok_or(CoreError::Closed)?;
        let hook = &mut self.write_error;

        if aux.length == 0 {
            return Ok(None);
        }
        out.flush(hook)?;
        aux.flush(hook)?;

        let amount = amount.min(aux.length);
        let cursor = out.offset + aux.offset;
        let mut buffer = vec![0u8; chunk_size];

        let mut copied = 0u64;
        while copied < amount {
            let chunk = (amount - copied).min(chunk_size as u64) as usize;
            aux.read_exact_at(copied, &mut buffer[..chunk])?;
            write_proof(&mut out.target, out.length + copied, &buffer[..chunk], hook)?;
            copied += chunk as u64;
        }
        out.length += amount;
        self.max_length_known = self.max_length_known.max(out.length);
        Ok(Some((amount, cursor)))
    }

    /// Shifts the scratch bytes after `amount` to the front and repositions both targets.
    fn compact_auxiliary(&mut self, amount: u64, cursor: u64) -> CoreResult<()> {
        let chunk_size = self.config.copy_buffer_size.max(1);
        let threshold = self.config.aux_threshold_bytes;
        let Targets { out, aux } = self.targets.as_mut().ok_or(CoreError::Closed)?;
        let hook = &mut self.write_error;

        let rest = aux.length - amount;
        let mut buffer = vec![0u8; rest.min(chunk_size as u64) as usize];
        let mut moved = 0u64;
        while moved < rest {
            let chunk = (rest - moved).min(chunk_size as u64) as usize;
            aux.read_exact_at(amount + moved, &mut buffer[..chunk])?;
            write_proof(&mut aux.target, moved, &buffer[..chunk], hook)?;
            moved += chunk as u64;
        }
        aux.length = rest;

        if rest <= threshold && aux.target.length()? > threshold {
            aux.target.set_length(threshold)?;
        }

        if cursor <= out.length {
            out.offset = cursor;
            aux.offset = 0;
        } else {
            out.offset = out.length;
            aux.offset = cursor - out.length;
        }
        out.target.seek(out.offset)?;
        aux.target.seek(aux.offset)?;
        if rest == 0 {
            aux.reset()?;
        }

        debug!(
            drained = amount,
            remaining = rest,
            committed = out.length,
            "drained scratch file"
        );
        Ok(())
    }

    /// Drains the scratch file, fixes the destination length and closes both streams.
    ///
    /// Only call this once every byte of the file has been written. Calling it again
    /// returns the same length.
    pub fn finalize(&mut self) -> CoreResult<u64> {
        if let Some(length) = self.final_length {
            return Ok(length);
        }
        let pending = self.targets()?.aux.length;
        self.flush_auxiliary(pending)?;

        let max_length_known = self.max_length_known;
        let Targets { out, .. } = self.targets.as_mut().ok_or(CoreError::Closed)?;
        out.flush(&mut self.write_error)?;
        let length = max_length_known.max(out.length);
        if out.target.length()? != length {
            out.target.set_length(length)?;
        }

        self.close();
        self.final_length = Some(length);
        debug!(length, "reorder buffer finalized");
        Ok(length)
    }

    fn report(&mut self) {
        let position = self.position();
        if let Some(progress) = self.progress.as_mut() {
            if position > self.report_position {
                self.report_position = position + self.config.progress_interval_bytes;
                progress.report(position);
            }
        }
    }
}

impl StorageStream for SequentialWriter {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            read: false,
            write: true,
            seek: true,
            set_length: false,
            rewind: true,
        }
    }

    fn read(&mut self, _buf: &mut [u8]) -> CoreResult<usize> {
        Err(CoreError::Unsupported("write-only".to_string()))
    }

    fn skip(&mut self, amount: u64) -> CoreResult<u64> {
        let position = self.position();
        let target = position.checked_add(amount).ok_or_else(|| {
            CoreError::SeekOutOfRange(format!("skipping {} from {} overflows", amount, position))
        })?;
        self.seek(target)?;
        Ok(amount)
    }

    fn available(&mut self) -> CoreResult<u64> {
        Err(CoreError::Unsupported("write-only".to_string()))
    }

    fn write(&mut self, buf: &[u8]) -> CoreResult<()> {
        if buf.is_empty() {
            return Ok(());
        }
        self.transact(|writer| writer.write_queued(buf))?;
        self.report();
        Ok(())
    }

    fn flush(&mut self) -> CoreResult<()> {
        self.ensure_usable()?;
        let Targets { out, aux } = self.targets.as_mut().ok_or(CoreError::Closed)?;
        aux.flush(&mut self.write_error)?;
        out.flush(&mut self.write_error)?;
        self.max_length_known = self.max_length_known.max(out.length + aux.length);
        Ok(())
    }

    fn seek(&mut self, offset: u64) -> CoreResult<()> {
        let (total, position) = {
            let targets = self.targets()?;
            (
                targets.out.length + targets.aux.length,
                targets.out.position() + targets.aux.position(),
            )
        };
        if offset == total && position == total {
            return Ok(());
        }

        self.flush()?;
        if offset > total {
            return Err(CoreError::SeekOutOfRange(format!(
                "offset {} is outside of 0..={}",
                offset, total
            )));
        }
        let Targets { out, aux } = self.targets()?;
        if offset > out.length {
            let committed = out.length;
            out.seek(committed)?;
            aux.seek(offset - committed)?;
        } else {
            out.seek(offset)?;
            aux.seek(0)?;
        }
        Ok(())
    }

    fn rewind(&mut self) -> CoreResult<()> {
        self.ensure_usable()?;
        if let Some(progress) = self.progress.as_mut() {
            progress.report(0);
        }
        self.seek(0)?;
        self.report_position = self.config.progress_interval_bytes;
        Ok(())
    }

    fn length(&mut self) -> CoreResult<u64> {
        let targets = self.targets()?;
        Ok(targets.out.length + targets.aux.length)
    }

    fn close(&mut self) {
        if let Some(mut targets) = self.targets.take() {
            targets.out.close();
            targets.aux.close();
        }
    }

    fn is_closed(&self) -> bool {
        self.targets.is_none()
    }
}

impl std::fmt::Debug for SequentialWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("SequentialWriter");
        if let Some(targets) = &self.targets {
            debug.field("out", &targets.out).field("aux", &targets.aux);
        }
        debug
            .field("max_length_known", &self.max_length_known)
            .field("scratch", &self.scratch_path)
            .finish()
    }
}
