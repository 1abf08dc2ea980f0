//! Chunk fetching (§4.4): resolve `(url, offset, size)` to bytes, with
//! bounded exponential-backoff retry and an optional cancellation signal.

pub use crate::error::FetchError;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::config::global_config;

/// A cooperative cancellation signal. Cloning shares the same underlying flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// Create a fresh, not-yet-cancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation. Pending retries observe this promptly (§5).
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// True if [`Self::cancel`] has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Resolves `(url, offset, size)` triples to bytes.
///
/// Implementations issue one HTTP range GET (or local file read) per
/// attempt; [`fetch_with_retry`] wraps any [`RangeFetcher`] with the §4.4
/// bounded exponential-backoff retry law.
pub trait RangeFetcher: Send + Sync {
    /// Fetch exactly `size` bytes starting at `offset` in `url`. A single
    /// attempt: implementations should not retry internally.
    ///
    /// # Errors
    /// Returns [`FetchError`] on I/O failure, HTTP failure, or a length
    /// mismatch between `size` and the bytes actually returned.
    fn fetch_once(&self, url: &str, offset: u64, size: u64) -> Result<Vec<u8>, FetchError>;
}

/// Fetches `file://` URLs and bare local paths by seeking and reading.
#[derive(Debug, Default)]
pub struct FileRangeFetcher;

impl FileRangeFetcher {
    fn path_for(url: &str) -> &str {
        url.strip_prefix("file://").unwrap_or(url)
    }
}

impl RangeFetcher for FileRangeFetcher {
    fn fetch_once(&self, url: &str, offset: u64, size: u64) -> Result<Vec<u8>, FetchError> {
        use std::io::{Read, Seek, SeekFrom};
        let path = Self::path_for(url);
        let mut file = std::fs::File::open(Path::new(path))?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; usize::try_from(size).unwrap()];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// Fetches `http(s)://` URLs with a `Range` GET, using a process-wide
/// lazily-created `reqwest::blocking::Client` (§5 "process-wide singleton").
#[cfg(feature = "http")]
#[derive(Debug, Clone)]
pub struct HttpRangeFetcher {
    client: reqwest::blocking::Client,
}

#[cfg(feature = "http")]
impl HttpRangeFetcher {
    /// Build a fetcher over a shared blocking client.
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: shared_http_client().clone(),
        }
    }
}

#[cfg(feature = "http")]
impl Default for HttpRangeFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "http")]
fn shared_http_client() -> &'static reqwest::blocking::Client {
    static CLIENT: std::sync::OnceLock<reqwest::blocking::Client> = std::sync::OnceLock::new();
    CLIENT.get_or_init(|| {
        reqwest::blocking::Client::builder()
            .build()
            .expect("failed to build the shared HTTP client")
    })
}

#[cfg(feature = "http")]
impl RangeFetcher for HttpRangeFetcher {
    fn fetch_once(&self, url: &str, offset: u64, size: u64) -> Result<Vec<u8>, FetchError> {
        use reqwest::header::{CONTENT_LENGTH, RANGE};

        let range = format!("bytes={offset}-{}", offset + size - 1);
        let response = self
            .client
            .get(url)
            .header(RANGE, range)
            .send()?
            .error_for_status()?;

        let declared_len = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        let bytes = response.bytes()?;
        let actual = bytes.len() as u64;
        if let Some(declared_len) = declared_len {
            if declared_len != actual {
                log::warn!(
                    "content-length header ({declared_len}) disagreed with body length ({actual}) for {url}"
                );
            }
        }
        if actual != size {
            return Err(FetchError::SizeMismatch {
                url: url.to_string(),
                requested: size,
                actual,
            });
        }
        Ok(bytes.to_vec())
    }
}

/// Dispatches to [`FileRangeFetcher`] or [`HttpRangeFetcher`] by URL scheme.
#[derive(Debug, Default, Clone)]
pub struct DefaultRangeFetcher {
    #[cfg(feature = "http")]
    http: HttpRangeFetcher,
}

impl DefaultRangeFetcher {
    /// Build the default fetcher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl RangeFetcher for DefaultRangeFetcher {
    fn fetch_once(&self, url: &str, offset: u64, size: u64) -> Result<Vec<u8>, FetchError> {
        if url.starts_with("http://") || url.starts_with("https://") {
            #[cfg(feature = "http")]
            {
                return self.http.fetch_once(url, offset, size);
            }
            #[cfg(not(feature = "http"))]
            {
                return Err(FetchError::UnsupportedScheme(url.to_string()));
            }
        }
        FileRangeFetcher.fetch_once(url, offset, size)
    }
}

/// Fetch `(url, offset, size)` with the §4.4 retry law: bounded exponential
/// backoff starting at the configured base delay, capped at the configured
/// max delay, for at most the configured number of attempts.
///
/// # Errors
/// Returns [`FetchError::Cancelled`] if `cancel` fires between attempts, or
/// [`FetchError::RetriesExhausted`] once attempts are exhausted.
pub fn fetch_with_retry(
    fetcher: &dyn RangeFetcher,
    url: &str,
    offset: u64,
    size: u64,
    cancel: Option<&CancellationToken>,
) -> Result<Vec<u8>, FetchError> {
    let (max_attempts, base_delay, max_delay) = {
        let config = global_config();
        (
            config.fetch_retry_max_attempts,
            config.fetch_retry_base_delay,
            config.fetch_retry_max_delay,
        )
    };

    let mut attempt = 0u32;
    let mut delay = base_delay;
    loop {
        attempt += 1;
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(FetchError::Cancelled);
        }
        match fetcher.fetch_once(url, offset, size) {
            Ok(bytes) => return Ok(bytes),
            Err(err) if is_transient(&err) && attempt < max_attempts => {
                log::warn!("fetch attempt {attempt}/{max_attempts} for {url} failed: {err}; retrying in {delay:?}");
                sleep_cancellable(delay, cancel);
                delay = std::cmp::min(delay * 2, max_delay);
            }
            Err(err) => {
                return Err(FetchError::RetriesExhausted {
                    url: url.to_string(),
                    offset,
                    size,
                    attempts: attempt,
                    source: Box::new(err),
                });
            }
        }
    }
}

fn sleep_cancellable(delay: Duration, cancel: Option<&CancellationToken>) {
    // Poll in short slices so a cancellation is observed promptly (§5).
    const SLICE: Duration = Duration::from_millis(50);
    let mut remaining = delay;
    while remaining > Duration::ZERO {
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return;
        }
        let step = std::cmp::min(remaining, SLICE);
        thread::sleep(step);
        remaining -= step;
    }
}

fn is_transient(err: &FetchError) -> bool {
    !matches!(
        err,
        FetchError::UnsupportedScheme(_) | FetchError::Cancelled
    )
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::{FetchError, RangeFetcher};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// A fetcher that fails `fail_times` times before succeeding, recording every attempt.
    pub struct FlakyFetcher {
        pub fail_times: AtomicUsize,
        pub calls: Mutex<Vec<(String, u64, u64)>>,
        pub payload: Vec<u8>,
    }

    impl FlakyFetcher {
        pub fn new(fail_times: usize, payload: Vec<u8>) -> Self {
            Self {
                fail_times: AtomicUsize::new(fail_times),
                calls: Mutex::new(Vec::new()),
                payload,
            }
        }
    }

    impl RangeFetcher for FlakyFetcher {
        fn fetch_once(&self, url: &str, offset: u64, size: u64) -> Result<Vec<u8>, FetchError> {
            self.calls
                .lock()
                .unwrap()
                .push((url.to_string(), offset, size));
            if self.fail_times.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n > 0 { Some(n - 1) } else { None }
            }).is_ok() {
                return Err(FetchError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "simulated transient failure",
                )));
            }
            Ok(self.payload.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_util::FlakyFetcher;
    use super::*;
    use std::time::Duration;

    fn with_fast_retry_config<T>(f: impl FnOnce() -> T) -> T {
        let mut config = global_config();
        config.fetch_retry_base_delay = Duration::from_millis(1);
        config.fetch_retry_max_delay = Duration::from_millis(2);
        drop(config);
        f()
    }

    #[test]
    fn succeeds_after_transient_failures() {
        with_fast_retry_config(|| {
            let fetcher = FlakyFetcher::new(2, vec![1, 2, 3]);
            let out = fetch_with_retry(&fetcher, "file:///x", 0, 3, None).unwrap();
            assert_eq!(out, vec![1, 2, 3]);
            assert_eq!(fetcher.calls.lock().unwrap().len(), 3);
        });
    }

    #[test]
    fn exhausts_after_max_attempts() {
        with_fast_retry_config(|| {
            let fetcher = FlakyFetcher::new(100, vec![]);
            let max_attempts = global_config().fetch_retry_max_attempts;
            let err = fetch_with_retry(&fetcher, "file:///x", 0, 0, None).unwrap_err();
            assert!(matches!(err, FetchError::RetriesExhausted { attempts, .. } if attempts == max_attempts));
            assert_eq!(
                fetcher.calls.lock().unwrap().len(),
                max_attempts as usize
            );
        });
    }

    #[test]
    fn cancellation_short_circuits() {
        let fetcher = FlakyFetcher::new(100, vec![]);
        let token = CancellationToken::new();
        token.cancel();
        let err = fetch_with_retry(&fetcher, "file:///x", 0, 0, Some(&token)).unwrap_err();
        assert!(matches!(err, FetchError::Cancelled));
    }

    #[test]
    fn file_fetcher_reads_range() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        use std::io::Write;
        file.write_all(b"0123456789").unwrap();
        let path = file.path().to_str().unwrap().to_string();
        let out = FileRangeFetcher.fetch_once(&path, 2, 3).unwrap();
        assert_eq!(out, b"234");
    }
}
