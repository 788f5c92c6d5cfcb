use super::{NextRequest, RequestSource};
use crate::error::{ConfigError, SourceError};
use crate::request::Request;
use regex::Regex;
use reqwest::header::{HeaderValue, USER_AGENT};
use reqwest::Method;
use std::path::Path;
use std::sync::LazyLock;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tracing::debug;

/// nginx `combined` format, optionally followed by a quoted `$host`.
static COMBINED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"^\S+ \S+ \S+ \[[^\]]+\] "(?P<request>[^"]*)" \d{3} \S+(?: "(?:[^"\\]|\\.)*" "(?P<agent>(?:[^"\\]|\\.)*)")?(?: "(?P<host>[^"]*)")?"#,
    )
    .expect("access log pattern is valid")
});

type LineReader = Lines<BufReader<Box<dyn AsyncRead + Send + Unpin>>>;

/// Replays the requests of an nginx access log in file order.
///
/// Lines that are not access-log entries are skipped; an I/O error ends the
/// source with an error.
pub struct LogReplaySource {
    lines: LineReader,
    line_no: u64,
    skipped: u64,
}

impl LogReplaySource {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self::from_reader(file))
    }

    pub fn from_reader(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(reader);
        Self {
            lines: BufReader::new(reader).lines(),
            line_no: 0,
            skipped: 0,
        }
    }

    /// Number of lines that did not parse as a request so far.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    async fn next_entry(&mut self) -> Result<Option<Request>, SourceError> {
        while let Some(line) = self.lines.next_line().await? {
            self.line_no += 1;
            match parse_line(&line) {
                Some(req) => return Ok(Some(req)),
                None => {
                    self.skipped += 1;
                    debug!(line = self.line_no, "skipping unparsable access log line");
                }
            }
        }
        Ok(None)
    }
}

impl RequestSource for LogReplaySource {
    fn name(&self) -> &'static str {
        "nginxlog"
    }

    fn next_request(&mut self) -> NextRequest<'_> {
        Box::pin(self.next_entry())
    }
}

fn parse_line(line: &str) -> Option<Request> {
    let caps = COMBINED.captures(line)?;

    let mut parts = caps.name("request")?.as_str().split_whitespace();
    let method = Method::from_bytes(parts.next()?.as_bytes()).ok()?;
    let uri = parts.next()?;
    let _proto = parts.next()?;
    if parts.next().is_some() || !uri.starts_with('/') {
        return None;
    }

    let mut req = Request::new(method, uri);
    if let Some(agent) = caps.name("agent").map(|m| m.as_str()) {
        if agent != "-" {
            if let Ok(value) = HeaderValue::from_str(agent) {
                req.headers.insert(USER_AGENT, value);
            }
        }
    }
    if let Some(host) = caps.name("host").map(|m| m.as_str()) {
        if !host.is_empty() && host != "-" {
            req.host = Some(host.to_string());
        }
    }
    Some(req)
}
