//! Lazy delta application.
//!
//! [`apply::apply_delta`](super::apply::apply_delta) materializes the whole
//! target object up front. [`DeltaReader`] instead walks the instruction
//! stream on demand as its caller pulls bytes through [`std::io::Read`],
//! seeking into the base only for the copy spans actually consumed so far.

use std::io::{self, Cursor, Read, Seek, SeekFrom};

use super::parse_delta_header;

/// Reads the target object of a delta, instruction by instruction, against
/// a seekable base reader.
pub struct DeltaReader<R> {
    base: R,
    delta: Vec<u8>,
    pos: usize,
    source_size: usize,
    target_size: usize,
    pending: Cursor<Vec<u8>>,
}

impl<R: Read + Seek> DeltaReader<R> {
    /// Build a reader over `delta`'s instruction stream, applying copies
    /// against `base`.
    pub fn new(base: R, delta: Vec<u8>) -> Result<Self, crate::PackError> {
        let (source_size, target_size, pos) = parse_delta_header(&delta)?;
        Ok(Self {
            base,
            delta,
            pos,
            source_size,
            target_size,
            pending: Cursor::new(Vec::new()),
        })
    }

    /// Size the base object this delta expects, per its header.
    pub fn source_size(&self) -> usize {
        self.source_size
    }

    /// Expanded size of the target object, known from the header alone —
    /// no instructions need to be read to answer this.
    pub fn size(&self) -> usize {
        self.target_size
    }

    fn pending_exhausted(&self) -> bool {
        self.pending.position() >= self.pending.get_ref().len() as u64
    }

    fn advance(&mut self) -> io::Result<()> {
        let cmd = self.delta[self.pos];
        self.pos += 1;

        if cmd & 0x80 != 0 {
            let mut offset: u64 = 0;
            let mut size: usize = 0;
            for (mask, shift) in [(0x01u8, 0u32), (0x02, 8), (0x04, 16), (0x08, 24)] {
                if cmd & mask != 0 {
                    let byte = *self.delta.get(self.pos).ok_or_else(truncated)?;
                    offset |= (byte as u64) << shift;
                    self.pos += 1;
                }
            }
            for (mask, shift) in [(0x10u8, 0u32), (0x20, 8), (0x40, 16)] {
                if cmd & mask != 0 {
                    let byte = *self.delta.get(self.pos).ok_or_else(truncated)?;
                    size |= (byte as usize) << shift;
                    self.pos += 1;
                }
            }
            if size == 0 {
                size = 0x10000;
            }
            if offset + size as u64 > self.source_size as u64 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("copy out of bounds: offset={offset}, size={size}, source_size={}", self.source_size),
                ));
            }

            self.base.seek(SeekFrom::Start(offset))?;
            let mut buf = vec![0u8; size];
            self.base.read_exact(&mut buf)?;
            self.pending = Cursor::new(buf);
        } else if cmd != 0 {
            let n = cmd as usize;
            if self.pos + n > self.delta.len() {
                return Err(truncated());
            }
            let buf = self.delta[self.pos..self.pos + n].to_vec();
            self.pos += n;
            self.pending = Cursor::new(buf);
        } else {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "unexpected delta opcode 0"));
        }
        Ok(())
    }
}

fn truncated() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "truncated delta instruction")
}

impl<R: Read + Seek> Read for DeltaReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if !self.pending_exhausted() {
                return self.pending.read(buf);
            }
            if self.pos >= self.delta.len() {
                return Ok(0);
            }
            self.advance()?;
        }
    }
}
