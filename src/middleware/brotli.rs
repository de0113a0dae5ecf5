//! Streaming body encoders for the compression middleware.
//!
//! Both encoders write into a shared byte sink so compressed output can be
//! drained chunk-by-chunk while the response streams.

use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use std::io::{self, Write};
use std::sync::Arc;

/// Default brotli quality, balancing ratio and CPU for proxy workloads.
pub const DEFAULT_BROTLI_QUALITY: u32 = 6;

const BROTLI_BUFFER_SIZE: usize = 4096;
const BROTLI_LGWIN: u32 = 22;

/// A clonable byte sink encoders write into.
#[derive(Clone, Default)]
pub struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    /// Drain everything produced so far.
    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.0.lock())
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A streaming content encoder.
pub enum Encoder {
    Brotli {
        writer: brotli::CompressorWriter<SharedBuf>,
        sink: SharedBuf,
    },
    Gzip {
        writer: GzEncoder<SharedBuf>,
        sink: SharedBuf,
    },
}

impl Encoder {
    pub fn brotli(quality: u32) -> Self {
        let sink = SharedBuf::default();
        Self::Brotli {
            writer: brotli::CompressorWriter::new(
                sink.clone(),
                BROTLI_BUFFER_SIZE,
                quality,
                BROTLI_LGWIN,
            ),
            sink,
        }
    }

    pub fn gzip() -> Self {
        let sink = SharedBuf::default();
        Self::Gzip {
            writer: GzEncoder::new(sink.clone(), Compression::default()),
            sink,
        }
    }

    /// Value for the `Content-Encoding` header.
    pub fn encoding(&self) -> &'static str {
        match self {
            Self::Brotli { .. } => "br",
            Self::Gzip { .. } => "gzip",
        }
    }

    /// Compress a chunk and drain whatever output is ready.
    pub fn write(&mut self, data: &[u8]) -> io::Result<Vec<u8>> {
        match self {
            Self::Brotli { writer, sink } => {
                writer.write_all(data)?;
                Ok(sink.take())
            }
            Self::Gzip { writer, sink } => {
                writer.write_all(data)?;
                Ok(sink.take())
            }
        }
    }

    /// Flush the encoder state and drain the produced bytes.
    pub fn flush(&mut self) -> io::Result<Vec<u8>> {
        match self {
            Self::Brotli { writer, sink } => {
                writer.flush()?;
                Ok(sink.take())
            }
            Self::Gzip { writer, sink } => {
                writer.flush()?;
                Ok(sink.take())
            }
        }
    }

    /// Finalize the stream and return the terminal bytes.
    pub fn finish(self) -> io::Result<Vec<u8>> {
        match self {
            Self::Brotli { writer, sink } => {
                // Dropping the writer terminates the brotli stream into the
                // sink.
                drop(writer);
                Ok(sink.take())
            }
            Self::Gzip { writer, sink } => {
                writer.finish()?;
                Ok(sink.take())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn brotli_decode(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        brotli::Decompressor::new(data, 4096)
            .read_to_end(&mut out)
            .unwrap();
        out
    }

    fn gzip_decode(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        flate2::read::GzDecoder::new(data)
            .read_to_end(&mut out)
            .unwrap();
        out
    }

    #[test]
    fn test_brotli_round_trip() {
        let payload = vec![b'x'; 8192];
        let mut encoder = Encoder::brotli(DEFAULT_BROTLI_QUALITY);

        let mut compressed = encoder.write(&payload[..4096]).unwrap();
        compressed.extend(encoder.write(&payload[4096..]).unwrap());
        compressed.extend(encoder.finish().unwrap());

        assert_eq!(brotli_decode(&compressed), payload);
    }

    #[test]
    fn test_gzip_round_trip() {
        let payload = b"the quick brown fox jumps over the lazy dog".repeat(100);
        let mut encoder = Encoder::gzip();

        let mut compressed = encoder.write(&payload).unwrap();
        compressed.extend(encoder.finish().unwrap());

        assert_eq!(gzip_decode(&compressed), payload);
    }

    #[test]
    fn test_flush_forces_output_before_finish() {
        let payload = b"streaming chunk one ".repeat(200);
        let mut encoder = Encoder::brotli(DEFAULT_BROTLI_QUALITY);

        let mut compressed = encoder.write(&payload).unwrap();
        compressed.extend(encoder.flush().unwrap());
        // The flush must have pushed the whole input out of the encoder.
        assert!(!compressed.is_empty());

        compressed.extend(encoder.finish().unwrap());
        assert_eq!(brotli_decode(&compressed), payload);
    }
}
