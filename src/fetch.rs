//! Retrieve delegated stats files.
use std::fmt;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use reqwest::header::ETAG;
use reqwest::header::IF_MODIFIED_SINCE;
use reqwest::header::IF_NONE_MATCH;
use reqwest::header::LAST_MODIFIED;
use reqwest::header::HeaderMap;
use reqwest::header::HeaderName;
use reqwest::StatusCode;
use sha2::Digest;
use sha2::Sha256;
use crate::delegations::Registry;


//------------ SourceLocation ------------------------------------------------

/// Where a registry's stats are found.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SourceLocation {
    Http(String),

    /// A local mirror, given as `file:/path` or `file:///path`.
    File(PathBuf),
}

impl FromStr for SourceLocation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.starts_with("http://") || s.starts_with("https://") {
            Ok(SourceLocation::Http(s.to_string()))
        } else if let Some(path) = s.strip_prefix("file:") {
            let path = path.strip_prefix("//").unwrap_or(path);
            if path.is_empty() {
                Err(format!("empty path in {}", s))
            } else {
                Ok(SourceLocation::File(PathBuf::from(path)))
            }
        } else {
            Err(format!("unsupported source location: {}", s))
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SourceLocation::Http(url) => f.write_str(url),
            SourceLocation::File(path) => write!(f, "file://{}", path.display()),
        }
    }
}


//------------ Validators ----------------------------------------------------

/// What is known about the last payload fetched from a source.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Validators {
    etag: Option<String>,
    last_modified: Option<String>,
    checksum: Option<String>,
}

impl Validators {
    pub fn etag(&self) -> Option<&str> { self.etag.as_deref() }
    pub fn last_modified(&self) -> Option<&str> { self.last_modified.as_deref() }
    pub fn checksum(&self) -> Option<&str> { self.checksum.as_deref() }

    fn from_headers(headers: &HeaderMap) -> Self {
        let header = |name: HeaderName| {
            headers.get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        Validators {
            etag: header(ETAG),
            last_modified: header(LAST_MODIFIED),
            checksum: None
        }
    }
}


//------------ Payload -------------------------------------------------------

/// A freshly fetched stats file.
#[derive(Clone, Debug)]
pub struct Payload {
    text: String,
    validators: Validators,
}

impl Payload {
    fn new(text: String, mut validators: Validators) -> Self {
        validators.checksum = Some(hex::encode(Sha256::digest(text.as_bytes())));
        Payload { text, validators }
    }

    pub fn text(&self) -> &str { &self.text }
    pub fn validators(&self) -> &Validators { &self.validators }

    pub fn into_parts(self) -> (String, Validators) {
        (self.text, self.validators)
    }
}


//------------ FetchOutcome --------------------------------------------------

#[derive(Clone, Debug)]
pub enum FetchOutcome {
    Fresh(Payload),

    /// The source still serves the payload we have.
    Unchanged,
}


//------------ RetryPolicy ---------------------------------------------------

/// Bounded exponential backoff.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        RetryPolicy { max_attempts: max_attempts.max(1), initial_delay, max_delay }
    }

    pub fn max_attempts(&self) -> u32 { self.max_attempts }

    /// The delay before the next try after `failures` failed attempts.
    pub fn delay(&self, failures: u32) -> Duration {
        let factor = 2u32.checked_pow(failures.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::new(4, Duration::from_secs(2), Duration::from_secs(60))
    }
}


//------------ Fetcher -------------------------------------------------------

#[derive(Clone, Debug)]
pub struct Fetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl Fetcher {
    pub fn new(
        request_timeout: Duration,
        retry: RetryPolicy
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("rirstats/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Fetcher { client, retry })
    }

    /// Fetches the stats for one registry, retrying transient failures.
    ///
    /// Returns `Unchanged` when the source says so in response to the known
    /// validators, or when the payload has the known checksum.
    pub async fn fetch(
        &self,
        registry: Registry,
        location: &SourceLocation,
        known: &Validators
    ) -> Result<FetchOutcome, FetchError> {
        info!("fetching {} stats from {}", registry, location);

        let mut failures = 0;
        let payload = loop {
            let res = match location {
                SourceLocation::Http(url) => self.get(registry, url, known).await,
                SourceLocation::File(path) => Self::read(registry, path).await,
            };

            match res {
                Ok(Some(payload)) => break payload,
                Ok(None) => {
                    info!("{} stats not modified", registry);
                    return Ok(FetchOutcome::Unchanged)
                }
                Err(err) => {
                    failures += 1;
                    if !err.is_transient() || failures >= self.retry.max_attempts {
                        return Err(err)
                    }
                    let delay = self.retry.delay(failures);
                    warn!(
                        "{}; retrying in {:?} ({}/{})",
                        err, delay, failures, self.retry.max_attempts
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        };

        if payload.validators.checksum.is_some()
            && payload.validators.checksum == known.checksum
        {
            info!("{} stats unchanged", registry);
            return Ok(FetchOutcome::Unchanged)
        }

        info!("fetched {} bytes of {} stats", payload.text.len(), registry);
        Ok(FetchOutcome::Fresh(payload))
    }

    async fn get(
        &self,
        registry: Registry,
        url: &str,
        known: &Validators
    ) -> Result<Option<Payload>, FetchError> {
        let mut request = self.client.get(url);
        if let Some(etag) = known.etag() {
            request = request.header(IF_NONE_MATCH, etag);
        }
        if let Some(last_modified) = known.last_modified() {
            request = request.header(IF_MODIFIED_SINCE, last_modified);
        }

        let response = request.send().await
            .map_err(|e| FetchError::network(registry, e))?;

        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            return Ok(None)
        }
        if !status.is_success() {
            return Err(FetchError::new(registry, FetchErrorKind::Status(status.as_u16())))
        }

        let validators = Validators::from_headers(response.headers());
        let text = response.text().await
            .map_err(|e| FetchError::network(registry, e))?;

        Ok(Some(Payload::new(text, validators)))
    }

    async fn read(
        registry: Registry,
        path: &Path
    ) -> Result<Option<Payload>, FetchError> {
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            FetchError::new(registry, FetchErrorKind::Io(e.to_string()))
        })?;
        Ok(Some(Payload::new(text, Validators::default())))
    }
}


//------------ FetchError ----------------------------------------------------

#[derive(Clone, Debug, Display, Eq, PartialEq)]
#[display(fmt = "cannot fetch {} stats: {}", registry, kind)]
pub struct FetchError {
    pub registry: Registry,
    pub kind: FetchErrorKind,
}

#[derive(Clone, Debug, Display, Eq, PartialEq)]
pub enum FetchErrorKind {
    #[display(fmt = "HTTP status {}", _0)]
    Status(u16),

    #[display(fmt = "{}", _0)]
    Network(String),

    #[display(fmt = "{}", _0)]
    Io(String),
}

impl FetchError {
    pub fn new(registry: Registry, kind: FetchErrorKind) -> Self {
        FetchError { registry, kind }
    }

    fn network(registry: Registry, err: reqwest::Error) -> Self {
        Self::new(registry, FetchErrorKind::Network(err.to_string()))
    }

    /// Whether trying again later may help.
    pub fn is_transient(&self) -> bool {
        match self.kind {
            FetchErrorKind::Status(status) => status >= 500 || status == 429,
            FetchErrorKind::Network(_) => true,
            FetchErrorKind::Io(_) => false,
        }
    }
}

impl std::error::Error for FetchError {}


//------------ Tests --------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use tokio::io::AsyncReadExt;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    const STATS: &str = "2|apnic|1|0|00000000|20230516|+1000\n";

    fn fetcher(max_attempts: u32) -> Fetcher {
        let retry = RetryPolicy::new(
            max_attempts, Duration::from_millis(1), Duration::from_millis(5)
        );
        Fetcher::new(Duration::from_secs(5), retry).unwrap()
    }

    /// Serves the given raw HTTP responses, one per connection, and counts
    /// the requests.
    async fn serve(responses: Vec<String>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/stats", listener.local_addr().unwrap());
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();

        tokio::spawn(async move {
            for response in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = vec![0u8; 4096];
                let _ = socket.read(&mut buf).await.unwrap();
                counter.fetch_add(1, Ordering::SeqCst);
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.unwrap();
            }
        });

        (url, count)
    }

    fn response(status: &str, headers: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n{}\r\n{}",
            status, body.len(), headers, body
        )
    }

    #[test]
    fn should_parse_locations() {
        assert_eq!(
            Ok(SourceLocation::Http("https://ftp.ripe.net/x".to_string())),
            SourceLocation::from_str("https://ftp.ripe.net/x")
        );
        assert_eq!(
            Ok(SourceLocation::File(PathBuf::from("/tmp/stats"))),
            SourceLocation::from_str("file:///tmp/stats")
        );
        assert_eq!(
            Ok(SourceLocation::File(PathBuf::from("test/stats"))),
            SourceLocation::from_str("file:test/stats")
        );
        assert!(SourceLocation::from_str("ftp://ftp.ripe.net/x").is_err());
        assert!(SourceLocation::from_str("file:").is_err());
    }

    #[test]
    fn should_back_off_exponentially_up_to_max() {
        let retry = RetryPolicy::new(
            10, Duration::from_secs(2), Duration::from_secs(60)
        );
        assert_eq!(Duration::from_secs(2), retry.delay(1));
        assert_eq!(Duration::from_secs(4), retry.delay(2));
        assert_eq!(Duration::from_secs(8), retry.delay(3));
        assert_eq!(Duration::from_secs(32), retry.delay(5));
        assert_eq!(Duration::from_secs(60), retry.delay(6));
        assert_eq!(Duration::from_secs(60), retry.delay(40));
    }

    #[test]
    fn should_classify_transient_errors() {
        let err = |kind| FetchError::new(Registry::Arin, kind);
        assert!(err(FetchErrorKind::Status(503)).is_transient());
        assert!(err(FetchErrorKind::Status(429)).is_transient());
        assert!(err(FetchErrorKind::Network("reset".to_string())).is_transient());
        assert!(!err(FetchErrorKind::Status(404)).is_transient());
        assert!(!err(FetchErrorKind::Io("not found".to_string())).is_transient());
    }

    #[tokio::test]
    async fn should_read_file_and_detect_unchanged_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.txt");
        std::fs::write(&path, STATS).unwrap();
        let location = SourceLocation::File(path.clone());
        let fetcher = fetcher(1);

        let payload = match fetcher
            .fetch(Registry::Apnic, &location, &Validators::default())
            .await
            .unwrap()
        {
            FetchOutcome::Fresh(payload) => payload,
            FetchOutcome::Unchanged => panic!("expected fresh payload")
        };
        assert_eq!(STATS, payload.text());
        assert!(payload.validators().checksum().is_some());

        let outcome = fetcher
            .fetch(Registry::Apnic, &location, payload.validators())
            .await
            .unwrap();
        assert!(matches!(outcome, FetchOutcome::Unchanged));

        std::fs::write(&path, format!("{}# changed\n", STATS)).unwrap();
        let outcome = fetcher
            .fetch(Registry::Apnic, &location, payload.validators())
            .await
            .unwrap();
        assert!(matches!(outcome, FetchOutcome::Fresh(_)));
    }

    #[tokio::test]
    async fn should_fail_missing_file_without_retry() {
        let location = SourceLocation::File(PathBuf::from("test/does-not-exist"));
        let err = fetcher(3)
            .fetch(Registry::Lacnic, &location, &Validators::default())
            .await
            .unwrap_err();
        assert_eq!(Registry::Lacnic, err.registry);
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn should_retry_server_errors() {
        let (url, count) = serve(vec![
            response("503 Service Unavailable", "", ""),
            response("200 OK", "ETag: \"v1\"\r\n", STATS),
        ]).await;

        let outcome = fetcher(3)
            .fetch(Registry::Apnic, &SourceLocation::Http(url), &Validators::default())
            .await
            .unwrap();

        match outcome {
            FetchOutcome::Fresh(payload) => {
                assert_eq!(STATS, payload.text());
                assert_eq!(Some("\"v1\""), payload.validators().etag());
            }
            FetchOutcome::Unchanged => panic!("expected fresh payload")
        }
        assert_eq!(2, count.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn should_give_up_after_max_attempts() {
        let (url, count) = serve(vec![
            response("502 Bad Gateway", "", ""),
            response("502 Bad Gateway", "", ""),
        ]).await;

        let err = fetcher(2)
            .fetch(Registry::Afrinic, &SourceLocation::Http(url), &Validators::default())
            .await
            .unwrap_err();

        assert_eq!(FetchErrorKind::Status(502), err.kind);
        assert_eq!(Registry::Afrinic, err.registry);
        assert_eq!(2, count.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn should_not_retry_client_errors() {
        let (url, count) = serve(vec![response("404 Not Found", "", "")]).await;

        let err = fetcher(3)
            .fetch(Registry::Arin, &SourceLocation::Http(url), &Validators::default())
            .await
            .unwrap_err();

        assert_eq!(FetchErrorKind::Status(404), err.kind);
        assert_eq!(1, count.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn should_report_not_modified() {
        let (url, _) = serve(vec![response("304 Not Modified", "", "")]).await;
        let known = Validators {
            etag: Some("\"v1\"".to_string()),
            last_modified: None,
            checksum: Some("abc".to_string())
        };

        let outcome = fetcher(1)
            .fetch(Registry::RipeNcc, &SourceLocation::Http(url), &known)
            .await
            .unwrap();
        assert!(matches!(outcome, FetchOutcome::Unchanged));
    }
}
