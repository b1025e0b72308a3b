//! Downloading query and catalog images.

use std::io::Read;
use std::thread::sleep;
use std::time::Duration;

use crate::config::FetchConfig;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FetchError {
    #[error("invalid image url '{0}'")]
    InvalidUrl(String),

    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("unexpected status {0}")]
    Status(u16),

    #[error("request failed: {0}")]
    Request(String),

    #[error("image larger than {0} bytes")]
    TooLarge(u64),

    #[error("response is not an image")]
    NotAnImage,
}

impl FetchError {
    /// Worth retrying: the same request may succeed a moment later.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Timeout | FetchError::Connect(_) => true,
            FetchError::Status(code) => *code == 429 || *code >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else if err.is_connect() {
            FetchError::Connect(err.to_string())
        } else if let Some(status) = err.status() {
            FetchError::Status(status.as_u16())
        } else {
            FetchError::Request(err.to_string())
        }
    }
}

pub trait ImageFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

/// Blocking HTTP fetcher with per-request timeout and bounded retries.
pub struct HttpImageFetcher {
    client: reqwest::blocking::Client,
    max_retries: u8,
    max_bytes: u64,
}

impl HttpImageFetcher {
    pub fn new(config: &FetchConfig) -> Result<Self, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| FetchError::Request(e.to_string()))?;

        Ok(Self {
            client,
            max_retries: config.max_retries,
            max_bytes: config.max_image_bytes,
        })
    }

    fn fetch_once(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self.client.get(url).send()?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        if response.content_length().is_some_and(|len| len > self.max_bytes) {
            return Err(FetchError::TooLarge(self.max_bytes));
        }

        let mut bytes = Vec::new();
        response
            .take(self.max_bytes + 1)
            .read_to_end(&mut bytes)
            .map_err(|e| FetchError::Request(e.to_string()))?;

        if bytes.len() as u64 > self.max_bytes {
            return Err(FetchError::TooLarge(self.max_bytes));
        }

        if !infer::is_image(&bytes) {
            return Err(FetchError::NotAnImage);
        }

        Ok(bytes)
    }
}

impl ImageFetcher for HttpImageFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        validate_url(url)?;

        let mut attempt = 0u8;
        loop {
            match self.fetch_once(url) {
                Err(err) if err.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    let delay = backoff(attempt);
                    log::info!(
                        "retrying {url} (attempt {attempt}/{}) after error: {err}, backoff {}ms",
                        self.max_retries,
                        delay.as_millis()
                    );
                    sleep(delay);
                }
                result => return result,
            }
        }
    }
}

pub fn validate_url(url: &str) -> Result<url::Url, FetchError> {
    match url::Url::parse(url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(parsed),
        _ => Err(FetchError::InvalidUrl(url.to_string())),
    }
}

/// 250ms, 500ms, 1s, ... plus up to 100ms jitter.
fn backoff(attempt: u8) -> Duration {
    let base = 2u64
        .saturating_pow(attempt.saturating_sub(1) as u32)
        .saturating_mul(250);
    Duration::from_millis(base.saturating_add(rand::random::<u64>() % 100))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(FetchError::Timeout.is_transient());
        assert!(FetchError::Connect("refused".into()).is_transient());
        assert!(FetchError::Status(503).is_transient());
        assert!(FetchError::Status(429).is_transient());
        assert!(!FetchError::Status(404).is_transient());
        assert!(!FetchError::NotAnImage.is_transient());
        assert!(!FetchError::InvalidUrl("x".into()).is_transient());
    }

    #[test]
    fn test_validate_url() {
        assert!(validate_url("https://i.pinimg.com/736x/ab/cd.jpg").is_ok());
        assert!(validate_url("http://localhost:9000/a.png").is_ok());
        assert!(validate_url("ftp://example.com/a.png").is_err());
        assert!(validate_url("not a url").is_err());
    }

    #[test]
    fn test_backoff_grows() {
        assert!(backoff(1) < Duration::from_millis(350));
        assert!(backoff(3) >= Duration::from_millis(1000));
        assert!(backoff(u8::MAX) >= backoff(3));
    }

    #[test]
    fn test_invalid_url_is_not_requested() {
        let fetcher = HttpImageFetcher::new(&FetchConfig::default()).unwrap();
        assert_eq!(
            fetcher.fetch("file:///etc/passwd"),
            Err(FetchError::InvalidUrl("file:///etc/passwd".to_string()))
        );
    }
}
