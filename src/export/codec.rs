use std::io::{Read, Write};

use anyhow::{bail, Context, Result};

/// Compression algorithms accepted by the HTTP exporter.
pub const COMPRESSION_ALGORITHMS: [&str; 5] = ["none", "gzip", "zstd", "zlib", "snappy"];

/// Compresses data using the specified algorithm.
pub fn compress(data: &[u8], algorithm: &str) -> Result<Vec<u8>> {
    match algorithm {
        "none" | "" => Ok(data.to_vec()),
        "gzip" => compress_gzip(data),
        "zstd" => compress_zstd(data),
        "zlib" => compress_zlib(data),
        "snappy" => compress_snappy(data),
        other => bail!("unsupported compression: {other}"),
    }
}

/// Returns the Content-Encoding header value for the algorithm.
pub fn content_encoding(algorithm: &str) -> Option<&'static str> {
    match algorithm {
        "gzip" => Some("gzip"),
        "zstd" => Some("zstd"),
        "zlib" => Some("deflate"),
        "snappy" => Some("snappy"),
        _ => None,
    }
}

/// Reverses [`compress`] for a request carrying `encoding` as its
/// Content-Encoding header.
pub fn decompress(data: &[u8], encoding: Option<&str>) -> Result<Vec<u8>> {
    match encoding.map(str::trim) {
        None | Some("") | Some("identity") => Ok(data.to_vec()),
        Some("gzip") => {
            let mut out = Vec::new();
            flate2::read::GzDecoder::new(data)
                .read_to_end(&mut out)
                .context("gzip decode")?;
            Ok(out)
        }
        Some("deflate") => {
            let mut out = Vec::new();
            flate2::read::ZlibDecoder::new(data)
                .read_to_end(&mut out)
                .context("zlib decode")?;
            Ok(out)
        }
        Some("zstd") => zstd::decode_all(data).context("zstd decode"),
        Some("snappy") => snap::raw::Decoder::new()
            .decompress_vec(data)
            .context("snappy decode"),
        Some(other) => bail!("unsupported content encoding: {other}"),
    }
}

fn compress_gzip(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).context("gzip write")?;
    encoder.finish().context("gzip finish")
}

fn compress_zstd(data: &[u8]) -> Result<Vec<u8>> {
    zstd::encode_all(data, 0).context("zstd encode")
}

fn compress_zlib(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::write::ZlibEncoder;
    use flate2::Compression;

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).context("zlib write")?;
    encoder.finish().context("zlib finish")
}

fn compress_snappy(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = snap::raw::Encoder::new();
    encoder.compress_vec(data).context("snappy encode")
}
