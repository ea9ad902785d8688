//! Streaming sector-encrypting writer.
//!
//! Wraps an [`EncryptionContext`] as an `io::Write` sink: plaintext goes in
//! at any granularity, ciphertext comes out one whole sector at a time, in
//! strict stream order. The final short sector is zero-padded on `finish`.

use std::io::{self, Write};

use crate::cipher::EncryptionContext;
use crate::error::Error;

pub struct SectorWriter<W: Write> {
    context: EncryptionContext,
    sink: W,
    buf: Vec<u8>,
    finished: bool,
}

impl<W: Write> SectorWriter<W> {
    pub fn new(context: EncryptionContext, sink: W) -> Self {
        let sector = context.sector_size();
        Self {
            context,
            sink,
            buf: Vec::with_capacity(sector),
            finished: false,
        }
    }

    /// Encrypt and emit any buffered tail, zero-padded to a full sector.
    /// Further writes (and a second `finish`) fail with `DoubleClose`.
    pub fn finish(&mut self) -> Result<(), Error> {
        if self.finished {
            return Err(Error::DoubleClose);
        }
        self.finished = true;
        if !self.buf.is_empty() {
            self.buf.resize(self.context.sector_size(), 0);
            self.emit_buffered()?;
        }
        self.sink.flush()?;
        Ok(())
    }

    /// Hand back the sink, e.g. to keep appending past the encrypted region.
    pub fn into_inner(self) -> W {
        self.sink
    }

    fn emit_buffered(&mut self) -> Result<(), Error> {
        self.context.encrypt_next_sector(&mut self.buf)?;
        self.sink.write_all(&self.buf)?;
        self.buf.clear();
        Ok(())
    }
}

impl<W: Write> Write for SectorWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.finished {
            return Err(Error::DoubleClose.into_io());
        }

        let sector = self.context.sector_size();
        let mut rest = data;
        while !rest.is_empty() {
            let take = (sector - self.buf.len()).min(rest.len());
            self.buf.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.buf.len() == sector {
                self.emit_buffered().map_err(Error::into_io)?;
            }
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        // A partial sector cannot be emitted mid-stream; only pass the
        // flush down.
        self.sink.flush()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
