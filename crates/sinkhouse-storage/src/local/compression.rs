//! Compression codecs of slice files
//!
//! | Type | Crate    | Extension |
//! |------|----------|-----------|
//! | none | -        |           |
//! | gzip | `flate2` | `.gz`     |
//! | zstd | `zstd`   | `.zst`    |
//!
//! Encoders keep access to the underlying writer, so the disk sync can
//! flush the codec buffers and then fsync the file below them.

use sinkhouse_core::{CompressionConfig, CompressionType};
use std::io::{self, BufReader, Read, Write};

pub enum Encoder<W: Write> {
    None(W),
    Gzip(flate2::write::GzEncoder<W>),
    Zstd(zstd::stream::write::Encoder<'static, W>),
}

impl<W: Write> Encoder<W> {
    pub fn new(config: &CompressionConfig, inner: W) -> io::Result<Self> {
        Ok(match config.kind {
            CompressionType::None => Encoder::None(inner),
            CompressionType::Gzip => Encoder::Gzip(flate2::write::GzEncoder::new(
                inner,
                flate2::Compression::new(config.level),
            )),
            CompressionType::Zstd => {
                Encoder::Zstd(zstd::stream::write::Encoder::new(inner, config.level as i32)?)
            }
        })
    }

    pub fn get_mut(&mut self) -> &mut W {
        match self {
            Encoder::None(w) => w,
            Encoder::Gzip(e) => e.get_mut(),
            Encoder::Zstd(e) => e.get_mut(),
        }
    }

    /// Writes the codec trailer and returns the underlying writer.
    pub fn finish(self) -> io::Result<W> {
        match self {
            Encoder::None(w) => Ok(w),
            Encoder::Gzip(e) => e.finish(),
            Encoder::Zstd(e) => e.finish(),
        }
    }
}

impl<W: Write> Write for Encoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Encoder::None(w) => w.write(buf),
            Encoder::Gzip(e) => e.write(buf),
            Encoder::Zstd(e) => e.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Encoder::None(w) => w.flush(),
            Encoder::Gzip(e) => e.flush(),
            Encoder::Zstd(e) => e.flush(),
        }
    }
}

pub enum Decoder<R: Read> {
    None(R),
    // Multi-member, a gzip flush may end a member.
    Gzip(flate2::read::MultiGzDecoder<R>),
    Zstd(zstd::stream::read::Decoder<'static, BufReader<R>>),
}

impl<R: Read> Decoder<R> {
    pub fn new(kind: CompressionType, inner: R) -> io::Result<Self> {
        Ok(match kind {
            CompressionType::None => Decoder::None(inner),
            CompressionType::Gzip => Decoder::Gzip(flate2::read::MultiGzDecoder::new(inner)),
            CompressionType::Zstd => Decoder::Zstd(zstd::stream::read::Decoder::new(inner)?),
        })
    }
}

impl<R: Read> Read for Decoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Decoder::None(r) => r.read(buf),
            Decoder::Gzip(d) => d.read(buf),
            Decoder::Zstd(d) => d.read(buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compress(config: &CompressionConfig, chunks: &[&str]) -> Vec<u8> {
        let mut encoder = Encoder::new(config, Vec::new()).unwrap();
        for chunk in chunks {
            encoder.write_all(chunk.as_bytes()).unwrap();
            // Flushing between chunks must not break the stream.
            encoder.flush().unwrap();
        }
        encoder.finish().unwrap()
    }

    fn decompress(kind: CompressionType, data: &[u8]) -> String {
        let mut out = String::new();
        Decoder::new(kind, data)
            .unwrap()
            .read_to_string(&mut out)
            .unwrap();
        out
    }

    #[test]
    fn test_codecs() {
        let chunks = ["1,foo\n", "2,bar\n", "3,baz\n"];
        for config in [
            CompressionConfig::none(),
            CompressionConfig::gzip(),
            CompressionConfig::zstd(),
        ] {
            let data = compress(&config, &chunks);
            assert_eq!(decompress(config.kind, &data), chunks.concat(), "{config:?}");
        }
    }

    #[test]
    fn test_compression_reduces_repetitive_data() {
        let row = "123,some repeated value\n".repeat(1000);
        let gzip = compress(&CompressionConfig::gzip(), &[&row]);
        let zstd = compress(&CompressionConfig::zstd(), &[&row]);
        assert!(gzip.len() < row.len() / 10);
        assert!(zstd.len() < row.len() / 10);
    }
}
