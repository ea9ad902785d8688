//! Bounded in-memory byte pipe.
//!
//! One producer, one consumer, back-pressure by channel capacity: the
//! producer blocks when the consumer stops reading, the consumer blocks when
//! the producer falls behind. Dropping the reader cancels the producer at
//! its next write.

use std::io::{self, Read, Write};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};

use crate::error::Error;

enum Chunk {
    Data(Vec<u8>),
    Failed(io::Error),
}

pub(crate) struct PipeWriter {
    tx: SyncSender<Chunk>,
}

pub(crate) struct PipeReader {
    rx: Receiver<Chunk>,
    current: Vec<u8>,
    pos: usize,
    done: bool,
}

/// A pipe holding at most `capacity` in-flight write chunks.
pub(crate) fn pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let (tx, rx) = sync_channel(capacity);
    (
        PipeWriter { tx },
        PipeReader {
            rx,
            current: Vec::new(),
            pos: 0,
            done: false,
        },
    )
}

impl PipeWriter {
    /// Close the pipe with an error; the reader observes it after draining
    /// the chunks already queued.
    pub(crate) fn abort(self, err: Error) {
        let _ = self.tx.send(Chunk::Failed(err.into_io()));
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .send(Chunk::Data(buf.to_vec()))
            .map_err(|_| Error::Cancelled.into_io())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.pos < self.current.len() {
                let n = buf.len().min(self.current.len() - self.pos);
                buf[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            if self.done || buf.is_empty() {
                return Ok(0);
            }
            match self.rx.recv() {
                Ok(Chunk::Data(data)) => {
                    self.current = data;
                    self.pos = 0;
                }
                Ok(Chunk::Failed(err)) => {
                    self.done = true;
                    return Err(err);
                }
                // Writer dropped: clean end of stream.
                Err(_) => {
                    self.done = true;
                    return Ok(0);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
