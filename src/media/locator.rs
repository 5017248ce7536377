use std::path::{Path, PathBuf};
use url::Url;

/// URL schemes of live network sources
const LIVE_SCHEMES: &[&str] = &[
    "rtsp", "rtsps", "rtmp", "rtmps", "rtp", "udp", "tcp", "http", "https", "srt",
];

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum LocatorError {
    #[error("source locator is empty")]
    Empty,
    #[error("invalid source locator {0}: {1}")]
    Invalid(String, String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    File(PathBuf),
    Url(Url),
}

/// Where a pipeline reads from: a local file path or a network URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocator {
    raw: String,
    target: Target,
}

impl SourceLocator {
    pub fn parse(raw: &str) -> Result<Self, LocatorError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(LocatorError::Empty);
        }

        let target = match Url::parse(raw) {
            Ok(url) if url.scheme() == "file" => {
                let path = url
                    .to_file_path()
                    .map_err(|_| LocatorError::Invalid(raw.to_string(), "not a file path".into()))?;
                Target::File(path)
            }
            // single letter schemes are Windows drive letters
            Ok(url) if url.scheme().len() > 1 => Target::Url(url),
            Ok(_) | Err(url::ParseError::RelativeUrlWithoutBase) => Target::File(PathBuf::from(raw)),
            Err(e) => return Err(LocatorError::Invalid(raw.to_string(), e.to_string())),
        };

        Ok(Self {
            raw: raw.to_string(),
            target,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Lowercase URL scheme, `None` for local paths
    pub fn scheme(&self) -> Option<&str> {
        match &self.target {
            Target::Url(url) => Some(url.scheme()),
            Target::File(_) => None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.target {
            Target::File(path) => Some(path),
            Target::Url(_) => None,
        }
    }

    pub fn url(&self) -> Option<&Url> {
        match &self.target {
            Target::Url(url) => Some(url),
            Target::File(_) => None,
        }
    }

    /// `host:port` of network sources that carry both
    pub fn authority(&self) -> Option<String> {
        let url = self.url()?;
        let host = url.host_str()?;
        let port = url.port_or_known_default()?;
        Some(format!("{}:{}", host, port))
    }

    /// Live sources get open retries and an explicit playback start
    pub fn is_live(&self) -> bool {
        self.scheme().is_some_and(|scheme| LIVE_SCHEMES.contains(&scheme))
    }

    /// Credentials stripped, safe to log
    pub fn redacted(&self) -> String {
        match &self.target {
            Target::Url(url) if !url.username().is_empty() || url.password().is_some() => {
                let mut url = url.clone();
                let _ = url.set_username("");
                let _ = url.set_password(None);
                url.to_string()
            }
            _ => self.raw.clone(),
        }
    }
}

impl std::fmt::Display for SourceLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.redacted())
    }
}

impl std::str::FromStr for SourceLocator {
    type Err = LocatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
