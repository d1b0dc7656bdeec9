//! Streaming content decoders for gzip and deflate.
//!
//! Compressed bytes are pushed in as they arrive off the wire and decoded
//! bytes come back out; `finish` flushes the tail and catches truncated
//! streams. Servers disagree about whether `deflate` means a zlib stream
//! or a raw one, so the first chunk is sniffed for a zlib header.

use bytes::Bytes;
use flate2::write::{DeflateDecoder, GzDecoder, ZlibDecoder};
use std::io::Write;

use crate::{
    error::{self, Error},
    header::{HeaderMap, name},
};

pub(crate) enum Decoder {
    Gzip(GzDecoder<Vec<u8>>),
    Deflate(Option<DeflateFlavor>),
}

pub(crate) enum DeflateFlavor {
    Zlib(ZlibDecoder<Vec<u8>>),
    Raw(DeflateDecoder<Vec<u8>>),
}

impl Decoder {
    pub(crate) fn gzip() -> Decoder {
        Decoder::Gzip(GzDecoder::new(Vec::new()))
    }

    pub(crate) fn deflate() -> Decoder {
        Decoder::Deflate(None)
    }

    /// Pick a decoder from `Content-Encoding`. Identity and unknown
    /// encodings pass through undecoded.
    pub(crate) fn from_headers(headers: &HeaderMap) -> Option<Decoder> {
        match headers.get(name::CONTENT_ENCODING).map(str::trim) {
            Some(value) if value.eq_ignore_ascii_case("gzip") => Some(Decoder::gzip()),
            Some(value) if value.eq_ignore_ascii_case("deflate") => Some(Decoder::deflate()),
            _ => None,
        }
    }

    /// Push a compressed chunk, returning whatever decoded so far.
    pub(crate) fn feed(&mut self, chunk: &[u8]) -> Result<Bytes, Error> {
        match self {
            Decoder::Gzip(decoder) => {
                decoder.write_all(chunk).map_err(error::decode)?;
                Ok(take_output(decoder.get_mut()))
            }
            Decoder::Deflate(flavor) => {
                let flavor = flavor.get_or_insert_with(|| sniff_deflate(chunk));
                match flavor {
                    DeflateFlavor::Zlib(decoder) => {
                        decoder.write_all(chunk).map_err(error::decode)?;
                        Ok(take_output(decoder.get_mut()))
                    }
                    DeflateFlavor::Raw(decoder) => {
                        decoder.write_all(chunk).map_err(error::decode)?;
                        Ok(take_output(decoder.get_mut()))
                    }
                }
            }
        }
    }

    /// Flush at end of stream. A stream that was cut off mid-member
    /// fails here.
    pub(crate) fn finish(&mut self) -> Result<Bytes, Error> {
        match self {
            Decoder::Gzip(decoder) => {
                decoder.try_finish().map_err(error::decode)?;
                Ok(take_output(decoder.get_mut()))
            }
            Decoder::Deflate(flavor) => match flavor {
                // empty body: nothing was ever fed
                None => Ok(Bytes::new()),
                Some(DeflateFlavor::Zlib(decoder)) => {
                    decoder.try_finish().map_err(error::decode)?;
                    Ok(take_output(decoder.get_mut()))
                }
                Some(DeflateFlavor::Raw(decoder)) => {
                    decoder.try_finish().map_err(error::decode)?;
                    Ok(take_output(decoder.get_mut()))
                }
            },
        }
    }
}

fn take_output(out: &mut Vec<u8>) -> Bytes {
    Bytes::from(std::mem::take(out))
}

/// A zlib stream opens with a CMF/FLG pair: low nibble 8 and the pair a
/// multiple of 31.
fn sniff_deflate(first_chunk: &[u8]) -> DeflateFlavor {
    let looks_zlib = match first_chunk {
        [cmf, flg, ..] => cmf & 0x0f == 8 && (u16::from(*cmf) << 8 | u16::from(*flg)) % 31 == 0,
        _ => false,
    };
    if looks_zlib {
        DeflateFlavor::Zlib(ZlibDecoder::new(Vec::new()))
    } else {
        DeflateFlavor::Raw(DeflateDecoder::new(Vec::new()))
    }
}

#[cfg(test)]
mod tests {
    use flate2::{
        Compression,
        write::{DeflateEncoder, GzEncoder, ZlibEncoder},
    };

    use super::*;

    fn gzip_bytes(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn gzip_roundtrip_in_pieces() {
        let compressed = gzip_bytes(b"hello compressed world");
        let mut decoder = Decoder::gzip();
        let mut out = Vec::new();
        for piece in compressed.chunks(3) {
            out.extend_from_slice(&decoder.feed(piece).unwrap());
        }
        out.extend_from_slice(&decoder.finish().unwrap());
        assert_eq!(out, b"hello compressed world");
    }

    #[test]
    fn truncated_gzip_fails_on_finish() {
        let compressed = gzip_bytes(b"some longer payload that compresses");
        let mut decoder = Decoder::gzip();
        let cut = &compressed[..compressed.len() - 6];
        let mut out = Vec::new();
        let mut failed = false;
        for piece in cut.chunks(7) {
            match decoder.feed(piece) {
                Ok(bytes) => out.extend_from_slice(&bytes),
                Err(e) => {
                    assert!(e.is_decode());
                    failed = true;
                    break;
                }
            }
        }
        if !failed {
            assert!(decoder.finish().unwrap_err().is_decode());
        }
    }

    #[test]
    fn garbage_gzip_fails() {
        let mut decoder = Decoder::gzip();
        let result = decoder
            .feed(b"definitely not a gzip stream, not even close")
            .and_then(|_| decoder.finish());
        assert!(result.unwrap_err().is_decode());
    }

    #[test]
    fn deflate_sniffs_zlib() {
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"zlib flavored deflate").unwrap();
        let compressed = enc.finish().unwrap();

        let mut decoder = Decoder::deflate();
        let mut out = decoder.feed(&compressed).unwrap().to_vec();
        out.extend_from_slice(&decoder.finish().unwrap());
        assert_eq!(out, b"zlib flavored deflate");
    }

    #[test]
    fn deflate_sniffs_raw() {
        let mut enc = DeflateEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"raw deflate stream").unwrap();
        let compressed = enc.finish().unwrap();

        let mut decoder = Decoder::deflate();
        let mut out = decoder.feed(&compressed).unwrap().to_vec();
        out.extend_from_slice(&decoder.finish().unwrap());
        assert_eq!(out, b"raw deflate stream");
    }

    #[test]
    fn selection_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("Content-Encoding", "gzip");
        assert!(matches!(
            Decoder::from_headers(&headers),
            Some(Decoder::Gzip(_))
        ));

        headers.insert("Content-Encoding", "br");
        assert!(Decoder::from_headers(&headers).is_none());

        headers.remove("Content-Encoding");
        assert!(Decoder::from_headers(&headers).is_none());
    }
}
