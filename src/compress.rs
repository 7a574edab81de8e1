// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

use crate::error::{Error, ErrorKind};

/// Handshake header advertising the algorithms a client accepts;
/// the server echoes its selection in the response.
pub const COMPRESSION_HEADER: &str = "spacetimedb-compression";

/// Default minimum frame size worth compressing, 1 KiB.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024;

/// Frame compression algorithm.
///
/// The numeric value doubles as the single-byte discriminator carried on
/// every binary frame envelope.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum CompressionAlgorithm {
    None = 0,
    Brotli = 1,
    Gzip = 2,
}

impl CompressionAlgorithm {
    /// Envelope tag byte of this algorithm.
    #[must_use]
    pub const fn tag(self) -> u8 {
        self as u8
    }

    /// Parse an envelope tag byte.
    ///
    /// # Errors
    ///
    /// Returns error on an unknown tag.
    pub fn from_tag(tag: u8) -> Result<Self, Error> {
        match tag {
            0 => Ok(Self::None),
            1 => Ok(Self::Brotli),
            2 => Ok(Self::Gzip),
            other => Err(Error::from_string(
                ErrorKind::DecodeError,
                format!("Unknown compression tag: {other}"),
            )),
        }
    }

    /// Content-coding token used in handshake headers.
    #[must_use]
    pub const fn token(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Brotli => "br",
            Self::Gzip => "gzip",
        }
    }

    /// Parse a content-coding token from a handshake header.
    #[must_use]
    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim() {
            "none" => Some(Self::None),
            "br" | "brotli" => Some(Self::Brotli),
            "gzip" => Some(Self::Gzip),
            _ => None,
        }
    }
}

/// Effort the compressor spends per frame.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum CompressionLevel {
    Fast,
    Default,
    Best,
}

impl CompressionLevel {
    const fn gzip_level(self) -> u32 {
        match self {
            Self::Fast => 1,
            Self::Default => 6,
            Self::Best => 9,
        }
    }

    const fn brotli_quality(self) -> u32 {
        match self {
            Self::Fast => 1,
            Self::Default => 6,
            Self::Best => 11,
        }
    }
}

/// Client-side compression settings.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CompressionConfig {
    pub enabled: bool,

    /// Frames below this many bytes are sent verbatim.
    pub threshold: usize,

    pub level: CompressionLevel,

    /// Advertised algorithms, most preferred first.
    pub preferred: Vec<CompressionAlgorithm>,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: DEFAULT_COMPRESSION_THRESHOLD,
            level: CompressionLevel::Default,
            preferred: vec![CompressionAlgorithm::Brotli, CompressionAlgorithm::Gzip],
        }
    }
}

impl CompressionConfig {
    /// Header value advertising the preferred algorithms.
    #[must_use]
    pub fn advertise_value(&self) -> String {
        if !self.enabled || self.preferred.is_empty() {
            return CompressionAlgorithm::None.token().to_string();
        }
        self.preferred
            .iter()
            .map(|algo| algo.token())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Algorithm the server selected, from its echo header.
    #[must_use]
    pub fn parse_selection(&self, header_value: Option<&str>) -> CompressionAlgorithm {
        if !self.enabled {
            return CompressionAlgorithm::None;
        }
        header_value
            .and_then(CompressionAlgorithm::from_token)
            .filter(|algo| {
                *algo == CompressionAlgorithm::None || self.preferred.contains(algo)
            })
            .unwrap_or(CompressionAlgorithm::None)
    }
}

/// Read-only counters describing compression activity.
#[derive(Clone, Copy, Debug, Default)]
pub struct CompressionMetrics {
    pub messages_compressed: u64,
    pub messages_decompressed: u64,
    pub bytes_in_pre_compress: u64,
    pub bytes_out_post_compress: u64,
    pub bytes_in_pre_decompress: u64,
    pub bytes_out_post_decompress: u64,
}

impl CompressionMetrics {
    /// Cumulative compressed/uncompressed ratio for outbound frames.
    #[must_use]
    pub fn ratio(&self) -> f64 {
        if self.bytes_in_pre_compress == 0 {
            1.0
        } else {
            self.bytes_out_post_compress as f64 / self.bytes_in_pre_compress as f64
        }
    }

    /// Cumulative bytes saved on outbound frames.
    #[must_use]
    pub const fn saved_bytes(&self) -> u64 {
        self.bytes_in_pre_compress.saturating_sub(self.bytes_out_post_compress)
    }
}

/// Wrap `payload` in a compression envelope.
///
/// The frame is compressed iff an algorithm is negotiated and the payload
/// meets the configured threshold; otherwise the envelope carries the
/// verbatim bytes under the none tag.
///
/// # Errors
///
/// Returns error if the compressor itself fails.
pub fn compress_frame(
    negotiated: CompressionAlgorithm,
    config: &CompressionConfig,
    payload: &[u8],
    metrics: &mut CompressionMetrics,
) -> Result<Vec<u8>, Error> {
    let algo = if config.enabled
        && negotiated != CompressionAlgorithm::None
        && payload.len() >= config.threshold
    {
        negotiated
    } else {
        CompressionAlgorithm::None
    };

    let mut frame = Vec::with_capacity(payload.len() + 1);
    frame.push(algo.tag());
    match algo {
        CompressionAlgorithm::None => frame.extend_from_slice(payload),
        CompressionAlgorithm::Gzip => {
            let mut encoder = flate2::write::GzEncoder::new(
                &mut frame,
                flate2::Compression::new(config.level.gzip_level()),
            );
            encoder.write_all(payload)?;
            encoder.finish()?;
            metrics.messages_compressed += 1;
            metrics.bytes_in_pre_compress += payload.len() as u64;
        }
        CompressionAlgorithm::Brotli => {
            {
                let mut encoder = brotli::CompressorWriter::new(
                    &mut frame,
                    4096,
                    config.level.brotli_quality(),
                    22,
                );
                encoder.write_all(payload)?;
            }
            metrics.messages_compressed += 1;
            metrics.bytes_in_pre_compress += payload.len() as u64;
        }
    }
    if algo != CompressionAlgorithm::None {
        metrics.bytes_out_post_compress += frame.len() as u64;
    }
    Ok(frame)
}

/// Unwrap a compression envelope.
///
/// The tag byte on the frame is authoritative; a failure to decompress is
/// fatal for the connection and surfaced as a decode error.
///
/// # Errors
///
/// Returns error on an unknown tag, a truncated frame or corrupt
/// compressed bytes.
pub fn decompress_frame(
    frame: &[u8],
    metrics: &mut CompressionMetrics,
) -> Result<Vec<u8>, Error> {
    let Some((&tag, body)) = frame.split_first() else {
        return Err(Error::new(ErrorKind::DecodeError, "Empty frame"));
    };
    let algo = CompressionAlgorithm::from_tag(tag)?;
    match algo {
        CompressionAlgorithm::None => Ok(body.to_vec()),
        CompressionAlgorithm::Gzip => {
            let mut payload = Vec::new();
            flate2::read::GzDecoder::new(body)
                .read_to_end(&mut payload)
                .map_err(|err| {
                    Error::from_string(
                        ErrorKind::DecodeError,
                        format!("Gzip decompression failed: {err}"),
                    )
                })?;
            metrics.messages_decompressed += 1;
            metrics.bytes_in_pre_decompress += body.len() as u64;
            metrics.bytes_out_post_decompress += payload.len() as u64;
            Ok(payload)
        }
        CompressionAlgorithm::Brotli => {
            let mut payload = Vec::new();
            brotli::Decompressor::new(body, 4096)
                .read_to_end(&mut payload)
                .map_err(|err| {
                    Error::from_string(
                        ErrorKind::DecodeError,
                        format!("Brotli decompression failed: {err}"),
                    )
                })?;
            metrics.messages_decompressed += 1;
            metrics.bytes_in_pre_decompress += body.len() as u64;
            metrics.bytes_out_post_decompress += payload.len() as u64;
            Ok(payload)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_frame_not_compressed() {
        let config = CompressionConfig::default();
        let mut metrics = CompressionMetrics::default();
        let payload = vec![7_u8; 512];
        let frame =
            compress_frame(CompressionAlgorithm::Gzip, &config, &payload, &mut metrics).unwrap();
        assert_eq!(frame[0], 0);
        assert_eq!(&frame[1..], &payload[..]);
        assert_eq!(metrics.messages_compressed, 0);
    }

    #[test]
    fn test_large_frame_gzip_round_trip() {
        let config = CompressionConfig::default();
        let mut metrics = CompressionMetrics::default();
        let payload: Vec<u8> = (0..4096_u32).map(|i| (i % 7) as u8).collect();
        let frame =
            compress_frame(CompressionAlgorithm::Gzip, &config, &payload, &mut metrics).unwrap();
        assert_eq!(frame[0], 2);
        assert!(frame.len() < payload.len());
        let restored = decompress_frame(&frame, &mut metrics).unwrap();
        assert_eq!(restored, payload);
        assert_eq!(metrics.messages_compressed, 1);
        assert_eq!(metrics.messages_decompressed, 1);
        assert!(metrics.saved_bytes() > 0);
        assert!(metrics.ratio() < 1.0);
    }

    #[test]
    fn test_large_frame_brotli_round_trip() {
        let config = CompressionConfig::default();
        let mut metrics = CompressionMetrics::default();
        let payload: Vec<u8> = (0..8192_u32).map(|i| (i % 11) as u8).collect();
        let frame =
            compress_frame(CompressionAlgorithm::Brotli, &config, &payload, &mut metrics)
                .unwrap();
        assert_eq!(frame[0], 1);
        let restored = decompress_frame(&frame, &mut metrics).unwrap();
        assert_eq!(restored, payload);
    }

    #[test]
    fn test_no_negotiation_sends_verbatim() {
        let config = CompressionConfig::default();
        let mut metrics = CompressionMetrics::default();
        let payload = vec![1_u8; 4096];
        let frame =
            compress_frame(CompressionAlgorithm::None, &config, &payload, &mut metrics).unwrap();
        assert_eq!(frame[0], 0);
        assert_eq!(frame.len(), payload.len() + 1);
    }

    #[test]
    fn test_corrupt_frame_is_fatal() {
        let mut metrics = CompressionMetrics::default();
        let frame = [2_u8, 0xde, 0xad, 0xbe, 0xef];
        assert!(decompress_frame(&frame, &mut metrics).is_err());
        let unknown_tag = [9_u8, 1, 2];
        assert!(decompress_frame(&unknown_tag, &mut metrics).is_err());
    }

    #[test]
    fn test_negotiation_parsing() {
        let config = CompressionConfig::default();
        assert_eq!(config.advertise_value(), "br, gzip");
        assert_eq!(
            config.parse_selection(Some("gzip")),
            CompressionAlgorithm::Gzip
        );
        assert_eq!(
            config.parse_selection(Some("br")),
            CompressionAlgorithm::Brotli
        );
        assert_eq!(config.parse_selection(None), CompressionAlgorithm::None);
        assert_eq!(
            config.parse_selection(Some("zstd")),
            CompressionAlgorithm::None
        );

        let disabled = CompressionConfig {
            enabled: false,
            ..CompressionConfig::default()
        };
        assert_eq!(disabled.advertise_value(), "none");
        assert_eq!(
            disabled.parse_selection(Some("gzip")),
            CompressionAlgorithm::None
        );
    }
}
