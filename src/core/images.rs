use std::time::Duration;

use log::{debug, trace};
use rayon::prelude::*;

use crate::errors::FetchError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedImage {
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
}

/// Retrieves the bytes behind an `%image%` URL.
pub trait ImageFetcher: Send + Sync {
    fn fetch(&self, url: &str, timeout: Duration) -> Result<FetchedImage, FetchError>;
}

/// Refuses every fetch; each `%image%` marker becomes a [`FetchError::Disabled`].
#[derive(Debug, Clone, Copy, Default)]
pub struct NoImageFetcher;

impl ImageFetcher for NoImageFetcher {
    fn fetch(&self, url: &str, _timeout: Duration) -> Result<FetchedImage, FetchError> {
        Err(FetchError::Disabled { url: url.to_string() })
    }
}

/// Blocking HTTP(S) fetcher.
#[cfg(feature = "http")]
#[derive(Debug, Clone, Default)]
pub struct HttpImageFetcher {
    client: reqwest::blocking::Client,
}

#[cfg(feature = "http")]
impl HttpImageFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::blocking::Client) -> Self {
        Self { client }
    }
}

#[cfg(feature = "http")]
impl ImageFetcher for HttpImageFetcher {
    fn fetch(&self, url: &str, timeout: Duration) -> Result<FetchedImage, FetchError> {
        let network = |e: reqwest::Error| {
            if e.is_timeout() {
                FetchError::Timeout { url: url.to_string() }
            } else {
                FetchError::Network { url: url.to_string(), message: e.to_string() }
            }
        };

        let response = self.client.get(url).timeout(timeout).send().map_err(network)?;
        if let Err(err) = response.error_for_status_ref() {
            let status = err.status().map_or(0, |s| s.as_u16());
            return Err(FetchError::Status { url: url.to_string(), status });
        }
        let bytes = response.bytes().map_err(network)?.to_vec();
        to_image(url, bytes)
    }
}

/// Checks the magic bytes and wraps `bytes` as an image.
pub fn to_image(url: &str, bytes: Vec<u8>) -> Result<FetchedImage, FetchError> {
    match sniff_content_type(&bytes) {
        Some(content_type) => Ok(FetchedImage { bytes, content_type }),
        None => Err(FetchError::NotAnImage { url: url.to_string() }),
    }
}

pub fn sniff_content_type(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        Some("image/png")
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg")
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        Some("image/gif")
    } else if bytes.starts_with(b"BM") && bytes.len() > 14 {
        Some("image/bmp")
    } else if bytes.len() >= 12 && bytes.starts_with(b"RIFF") && &bytes[8..12] == b"WEBP" {
        Some("image/webp")
    } else {
        None
    }
}

/// Fetches every URL on rayon's pool. Results come back in input order.
pub fn fetch_all<F: ImageFetcher + ?Sized>(
    fetcher: &F,
    urls: &[String],
    timeout: Duration,
) -> Vec<Result<FetchedImage, FetchError>> {
    debug!("Fetching {} images", urls.len());
    urls.par_iter()
        .map(|url| {
            trace!("Fetching image {}", url);
            fetcher.fetch(url, timeout)
        })
        .collect()
}
