//! Image acquisition: turn a CLI argument into a decoded RGB image.

use image::RgbImage;
use std::fmt;
use std::io::Read;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to fetch image: {0}")]
    Fetch(#[from] reqwest::Error),
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
}

/// Where an image comes from, resolved to pixels before analysis.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageSource {
    /// Encoded image bytes already in memory (stdin).
    Bytes(Vec<u8>),
    /// Local file, given as a path or `file://` URI.
    Path(PathBuf),
    /// `http://` or `https://` URL.
    RemoteUrl(String),
}

impl ImageSource {
    /// Interpret a CLI argument. `-` reads encoded bytes from stdin.
    pub fn from_arg(arg: &str) -> Result<Self, SourceError> {
        if arg == "-" {
            let mut bytes = Vec::new();
            std::io::stdin()
                .read_to_end(&mut bytes)
                .map_err(|source| SourceError::Io {
                    path: "<stdin>".into(),
                    source,
                })?;
            return Ok(ImageSource::Bytes(bytes));
        }
        Ok(Self::parse(arg))
    }

    fn parse(arg: &str) -> Self {
        if arg.starts_with("http://") || arg.starts_with("https://") {
            ImageSource::RemoteUrl(arg.to_string())
        } else if let Some(path) = arg.strip_prefix("file://") {
            ImageSource::Path(PathBuf::from(path))
        } else {
            ImageSource::Path(PathBuf::from(arg))
        }
    }

    /// Short name used for reports and output file names.
    pub fn stem(&self) -> String {
        let raw = match self {
            ImageSource::Bytes(_) => return "stdin".to_string(),
            ImageSource::Path(path) => path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
            ImageSource::RemoteUrl(url) => url
                .split(['?', '#'])
                .next()
                .and_then(|u| u.trim_end_matches('/').rsplit('/').next())
                .map(|name| name.split('.').next().unwrap_or(name).to_string())
                .unwrap_or_default(),
        };
        if raw.is_empty() {
            "image".to_string()
        } else {
            raw
        }
    }

    /// Fetch or read the encoded bytes and decode them to RGB.
    pub async fn resolve(self, client: &reqwest::Client) -> Result<RgbImage, SourceError> {
        let bytes = match self {
            ImageSource::Bytes(bytes) => bytes,
            ImageSource::Path(path) => tokio::fs::read(&path).await.map_err(|source| SourceError::Io {
                path: path.display().to_string(),
                source,
            })?,
            ImageSource::RemoteUrl(url) => {
                let response = client.get(&url).send().await?;
                let status = response.status();
                if !status.is_success() {
                    return Err(SourceError::Status {
                        url,
                        status: status.as_u16(),
                    });
                }
                response.bytes().await?.to_vec()
            }
        };
        decode(&bytes)
    }
}

impl fmt::Display for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageSource::Bytes(bytes) => write!(f, "<stdin: {} bytes>", bytes.len()),
            ImageSource::Path(path) => write!(f, "{}", path.display()),
            ImageSource::RemoteUrl(url) => f.write_str(url),
        }
    }
}

/// Decode any format the `image` crate understands into RGB8.
pub fn decode(bytes: &[u8]) -> Result<RgbImage, SourceError> {
    Ok(image::load_from_memory(bytes)?.to_rgb8())
}
