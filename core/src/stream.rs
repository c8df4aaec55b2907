use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub read: bool,
    pub write: bool,
    pub seek: bool,
    pub set_length: bool,
    pub rewind: bool,
}

impl Capabilities {
    pub fn random_access() -> Self {
        Self {
            read: true,
            write: true,
            seek: true,
            set_length: true,
            rewind: true,
        }
    }
}

/// Byte-addressable storage with an implicit cursor.
///
/// `read` returns `Ok(0)` when nothing is available at the cursor. `write` either
/// writes the whole buffer or fails. `close` releases the backing resource and may be
/// called any number of times.
pub trait StorageStream: Send {
    fn capabilities(&self) -> Capabilities;

    fn read(&mut self, buf: &mut [u8]) -> CoreResult<usize>;

    fn read_byte(&mut self) -> CoreResult<Option<u8>> {
        let mut byte = [0u8; 1];
        match self.read(&mut byte)? {
            0 => Ok(None),
            _ => Ok(Some(byte[0])),
        }
    }

    fn skip(&mut self, amount: u64) -> CoreResult<u64>;

    fn available(&mut self) -> CoreResult<u64>;

    fn write(&mut self, buf: &[u8]) -> CoreResult<()>;

    fn write_byte(&mut self, byte: u8) -> CoreResult<()> {
        self.write(&[byte])
    }

    fn flush(&mut self) -> CoreResult<()> {
        Ok(())
    }

    fn seek(&mut self, _offset: u64) -> CoreResult<()> {
        Err(CoreError::Unsupported("seek".to_string()))
    }

    fn rewind(&mut self) -> CoreResult<()> {
        Err(CoreError::Unsupported("rewind".to_string()))
    }

    fn set_length(&mut self, _length: u64) -> CoreResult<()> {
        Err(CoreError::Unsupported("set length".to_string()))
    }

    fn length(&mut self) -> CoreResult<u64> {
        Err(CoreError::Unsupported("length".to_string()))
    }

    fn close(&mut self);

    fn is_closed(&self) -> bool;

    fn can_read(&self) -> bool {
        self.capabilities().read
    }

    fn can_write(&self) -> bool {
        self.capabilities().write
    }

    fn can_seek(&self) -> bool {
        self.capabilities().seek
    }

    fn can_set_length(&self) -> bool {
        self.capabilities().set_length
    }

    fn can_rewind(&self) -> bool {
        self.capabilities().rewind
    }
}

impl StorageStream for Box<dyn StorageStream> {
    fn capabilities(&self) -> Capabilities {
        (**self).capabilities()
    }

    fn read(&mut self, buf: &mut [u8]) -> CoreResult<usize> {
        (**self).read(buf)
    }

    fn skip(&mut self, amount: u64) -> CoreResult<u64> {
        (**self).skip(amount)
    }

    fn available(&mut self) -> CoreResult<u64> {
        (**self).available()
    }

    fn write(&mut self, buf: &[u8]) -> CoreResult<()> {
        (**self).write(buf)
    }

    fn flush(&mut self) -> CoreResult<()> {
        (**self).flush()
    }

    fn seek(&mut self, offset: u64) -> CoreResult<()> {
        (**self).seek(offset)
    }

    fn rewind(&mut self) -> CoreResult<()> {
        (**self).rewind()
    }

    fn set_length(&mut self, length: u64) -> CoreResult<()> {
        (**self).set_length(length)
    }

    fn length(&mut self) -> CoreResult<u64> {
        (**self).length()
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn is_closed(&self) -> bool {
        (**self).is_closed()
    }
}
