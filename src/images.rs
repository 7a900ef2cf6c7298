//! Image download, validation and re-encoding.
//!
//! [`ImageProcessor::process`] never fails loudly: every rejection is logged
//! and reported as `None`, and callers fall back to the placeholder image.
//!
//! Checks, cheapest first:
//! 1. URL heuristics (logos, icons, sprites, placeholders)
//! 2. declared `Content-Length` against the byte ceiling, then a capped body read
//! 3. declared MIME type against the allow-list, and sniffed format
//! 4. full decode, minimum dimensions, small-square logo rejection
//!
//! Accepted images are resized to fit 1920x1080 and re-encoded as JPEG.

use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

const ALLOWED_MIME: &[&str] = &["image/jpeg", "image/jpg", "image/pjpeg", "image/png", "image/webp"];

const MIN_WIDTH: u32 = 300;
const MIN_HEIGHT: u32 = 150;
/// Squares below this side are almost always logos or avatars.
const MIN_SQUARE_SIDE: u32 = 500;

static LOGO_PATTERNS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(logo|favicon|sprite|icon[s_-]|/icons?/|placeholder|default[-_]image|avatar|blank\.gif|pixel\.gif|\.svg(\?|$))",
    )
    .expect("static regex")
});
static DIMENSIONS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d{2,4})x(\d{2,4})").expect("static regex"));

/// Why an image was not accepted.
#[derive(Debug, Error, PartialEq)]
pub enum ImageRejection {
    #[error("url looks like a logo or icon")]
    LooksLikeLogo,

    #[error("download failed: {0}")]
    Download(String),

    #[error("payload of {bytes} bytes exceeds the {limit} byte ceiling")]
    TooLarge { bytes: u64, limit: u64 },

    #[error("content type {0} is not allowed")]
    Mime(String),

    #[error("image could not be decoded: {0}")]
    Corrupt(String),

    #[error("image is {width}x{height}, below the minimum size")]
    TooSmall { width: u32, height: u32 },

    #[error("image is a {0}px square, likely a logo")]
    SmallSquare(u32),

    #[error("could not re-encode image: {0}")]
    Encode(String),
}

/// Raw download result.
#[derive(Debug, Clone)]
pub struct Downloaded {
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// A validated, re-encoded JPEG ready for upload.
#[derive(Clone, PartialEq)]
pub struct ProcessedImage {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub source_url: String,
    /// Hex SHA-256 of `bytes`.
    pub hash: String,
}

impl ProcessedImage {
    pub const CONTENT_TYPE: &'static str = "image/jpeg";
}

impl fmt::Debug for ProcessedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessedImage")
            .field("bytes", &self.bytes.len())
            .field("width", &self.width)
            .field("height", &self.height)
            .field("source_url", &self.source_url)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ImageSettings {
    pub max_bytes: u64,
    pub quality: u8,
    pub max_width: u32,
    pub max_height: u32,
}

impl Default for ImageSettings {
    fn default() -> Self {
        Self {
            max_bytes: 8 * 1024 * 1024,
            quality: 85,
            max_width: 1920,
            max_height: 1080,
        }
    }
}

/// Heuristic pre-filter on the URL alone, applied before any download.
pub fn is_probably_logo(url: &str) -> bool {
    if LOGO_PATTERNS.is_match(url) {
        return true;
    }
    if let Some(caps) = DIMENSIONS.captures(url) {
        let width: u32 = caps[1].parse().unwrap_or(0);
        let height: u32 = caps[2].parse().unwrap_or(0);
        if (width == height && width < 300) || width.max(height) < 200 {
            return true;
        }
    }
    false
}

#[async_trait]
pub trait ImageSource: Send + Sync {
    /// Download at most `max_bytes`; larger payloads are rejected.
    async fn download(&self, url: &str, max_bytes: u64) -> Result<Downloaded, ImageRejection>;
}

#[derive(Debug, Clone)]
pub struct HttpImageSource {
    http: reqwest::Client,
    timeout: Duration,
}

impl HttpImageSource {
    pub fn new(http: reqwest::Client, timeout: Duration) -> Self {
        Self { http, timeout }
    }
}

#[async_trait]
impl ImageSource for HttpImageSource {
    async fn download(&self, url: &str, max_bytes: u64) -> Result<Downloaded, ImageRejection> {
        let download_err = |e: reqwest::Error| ImageRejection::Download(e.to_string());

        let mut response = self
            .http
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(download_err)?;
        if !response.status().is_success() {
            return Err(ImageRejection::Download(format!(
                "status {}",
                response.status().as_u16()
            )));
        }
        if let Some(declared) = response.content_length()
            && declared > max_bytes
        {
            return Err(ImageRejection::TooLarge {
                bytes: declared,
                limit: max_bytes,
            });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(download_err)? {
            bytes.extend_from_slice(&chunk);
            if bytes.len() as u64 > max_bytes {
                return Err(ImageRejection::TooLarge {
                    bytes: bytes.len() as u64,
                    limit: max_bytes,
                });
            }
        }
        Ok(Downloaded {
            content_type,
            bytes,
        })
    }
}

fn sniffed_allowed(bytes: &[u8]) -> Result<ImageFormat, ImageRejection> {
    match image::guess_format(bytes) {
        Ok(fmt @ (ImageFormat::Jpeg | ImageFormat::Png | ImageFormat::WebP)) => Ok(fmt),
        Ok(other) => Err(ImageRejection::Mime(format!("{other:?}"))),
        Err(e) => Err(ImageRejection::Corrupt(e.to_string())),
    }
}

/// Validate and normalize downloaded bytes. Pure; no I/O.
pub fn validate_bytes(
    source_url: &str,
    downloaded: &Downloaded,
    settings: &ImageSettings,
) -> Result<ProcessedImage, ImageRejection> {
    if downloaded.bytes.len() as u64 > settings.max_bytes {
        return Err(ImageRejection::TooLarge {
            bytes: downloaded.bytes.len() as u64,
            limit: settings.max_bytes,
        });
    }
    if let Some(declared) = &downloaded.content_type {
        let mime = declared
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if !ALLOWED_MIME.contains(&mime.as_str()) {
            return Err(ImageRejection::Mime(mime));
        }
    }

    let format = sniffed_allowed(&downloaded.bytes)?;
    let decoded = image::load_from_memory_with_format(&downloaded.bytes, format)
        .map_err(|e| ImageRejection::Corrupt(e.to_string()))?;

    let (width, height) = (decoded.width(), decoded.height());
    if width < MIN_WIDTH || height < MIN_HEIGHT {
        return Err(ImageRejection::TooSmall { width, height });
    }
    if width == height && width < MIN_SQUARE_SIDE {
        return Err(ImageRejection::SmallSquare(width));
    }

    let resized = if width > settings.max_width || height > settings.max_height {
        decoded.resize(settings.max_width, settings.max_height, FilterType::Lanczos3)
    } else {
        decoded
    };
    let bytes = encode_jpeg(&resized, settings.quality)?;

    Ok(ProcessedImage {
        hash: format!("{:x}", Sha256::digest(&bytes)),
        width: resized.width(),
        height: resized.height(),
        source_url: source_url.to_string(),
        bytes,
    })
}

fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<Vec<u8>, ImageRejection> {
    let rgb = img.to_rgb8();
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
        .encode_image(&rgb)
        .map_err(|e| ImageRejection::Encode(e.to_string()))?;
    Ok(out)
}

#[derive(Clone)]
pub struct ImageProcessor {
    source: Arc<dyn ImageSource>,
    settings: ImageSettings,
}

impl fmt::Debug for ImageProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageProcessor")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl ImageProcessor {
    pub fn new(source: Arc<dyn ImageSource>, settings: ImageSettings) -> Self {
        Self { source, settings }
    }

    /// Download and validate `url`, or `None` if it is unusable for any reason.
    #[instrument(level = "info", skip_all, fields(%url))]
    pub async fn process(&self, url: &str) -> Option<ProcessedImage> {
        match self.try_process(url).await {
            Ok(image) => {
                info!(width = image.width, height = image.height, bytes = image.bytes.len(), "Image accepted");
                Some(image)
            }
            Err(reason @ ImageRejection::LooksLikeLogo) => {
                debug!(%reason, "Image rejected");
                None
            }
            Err(reason) => {
                warn!(%reason, "Image rejected");
                None
            }
        }
    }

    pub async fn try_process(&self, url: &str) -> Result<ProcessedImage, ImageRejection> {
        if is_probably_logo(url) {
            return Err(ImageRejection::LooksLikeLogo);
        }
        let downloaded = self.source.download(url, self.settings.max_bytes).await?;
        let settings = self.settings.clone();
        let url = url.to_string();
        // decode and resize are CPU bound
        tokio::task::spawn_blocking(move || validate_bytes(&url, &downloaded, &settings))
            .await
            .map_err(|e| ImageRejection::Encode(e.to_string()))?
    }

    /// First candidate that passes validation, in the given order.
    pub async fn first_usable(&self, candidates: &[String]) -> Option<ProcessedImage> {
        for url in candidates {
            if let Some(image) = self.process(url).await {
                return Some(image);
            }
        }
        None
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{FakeImageSource, png};
    use super::*;

    fn downloaded(content_type: &str, bytes: Vec<u8>) -> Downloaded {
        Downloaded {
            content_type: Some(content_type.to_string()),
            bytes,
        }
    }

    #[test]
    fn test_logo_urls_are_filtered() {
        assert!(is_probably_logo("https://www.clarin.com/img/logo-clarin.png"));
        assert!(is_probably_logo("https://site/static/favicon.ico"));
        assert!(is_probably_logo("https://site/img/placeholder.jpg"));
        assert!(is_probably_logo("https://site/resizer/100x100/foto.jpg"));
        assert!(!is_probably_logo("https://site/resizer/1200x675/foto-principal.jpg"));
        assert!(!is_probably_logo("https://img.clarin.com/2025/11/16/dolar-blue.jpg"));
    }

    #[test]
    fn test_valid_image_is_reencoded_as_jpeg() {
        let result = validate_bytes(
            "https://site/a.png",
            &downloaded("image/png", png(800, 450)),
            &ImageSettings::default(),
        )
        .unwrap();
        assert_eq!((result.width, result.height), (800, 450));
        assert_eq!(image::guess_format(&result.bytes).unwrap(), ImageFormat::Jpeg);
        assert_eq!(result.hash.len(), 64);
    }

    #[test]
    fn test_large_image_is_resized_to_fit() {
        let result = validate_bytes(
            "https://site/big.png",
            &downloaded("image/png", png(3840, 1600)),
            &ImageSettings::default(),
        )
        .unwrap();
        assert_eq!(result.width, 1920);
        assert!(result.height <= 1080);
    }

    #[test]
    fn test_rejections() {
        let settings = ImageSettings::default();
        assert_eq!(
            validate_bytes("u", &downloaded("image/png", png(200, 100)), &settings),
            Err(ImageRejection::TooSmall {
                width: 200,
                height: 100
            })
        );
        assert_eq!(
            validate_bytes("u", &downloaded("image/png", png(400, 400)), &settings),
            Err(ImageRejection::SmallSquare(400))
        );
        assert_eq!(
            validate_bytes("u", &downloaded("text/html; charset=utf-8", png(800, 450)), &settings),
            Err(ImageRejection::Mime("text/html".to_string()))
        );
        assert!(matches!(
            validate_bytes("u", &downloaded("image/jpeg", b"not really a jpeg".to_vec()), &settings),
            Err(ImageRejection::Corrupt(_))
        ));

        let mut truncated = png(800, 450);
        truncated.truncate(truncated.len() / 2);
        assert!(matches!(
            validate_bytes("u", &downloaded("image/png", truncated), &settings),
            Err(ImageRejection::Corrupt(_))
        ));
    }

    #[test]
    fn test_oversized_payload_is_rejected() {
        let settings = ImageSettings {
            max_bytes: 100,
            ..ImageSettings::default()
        };
        assert!(matches!(
            validate_bytes("u", &downloaded("image/png", png(800, 450)), &settings),
            Err(ImageRejection::TooLarge { limit: 100, .. })
        ));
    }

    #[tokio::test]
    async fn test_process_returns_none_instead_of_failing() {
        let source = FakeImageSource::default()
            .with("https://site/ok.png", "image/png", png(800, 450))
            .with("https://site/tiny.png", "image/png", png(50, 50));
        let processor = ImageProcessor::new(Arc::new(source), ImageSettings::default());

        assert!(processor.process("https://site/ok.png").await.is_some());
        assert!(processor.process("https://site/tiny.png").await.is_none());
        assert!(processor.process("https://site/missing.png").await.is_none());
        assert!(processor.process("https://site/logo.png").await.is_none());
    }

    #[tokio::test]
    async fn test_first_usable_candidate_wins() {
        let source = FakeImageSource::default()
            .with("https://site/second.png", "image/png", png(640, 360));
        let processor = ImageProcessor::new(Arc::new(source), ImageSettings::default());

        let image = processor
            .first_usable(&[
                "https://site/first.png".to_string(),
                "https://site/second.png".to_string(),
            ])
            .await
            .unwrap();
        assert_eq!(image.source_url, "https://site/second.png");
    }
}
