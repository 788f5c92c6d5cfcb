use super::{NextRequest, RequestSource};
use crate::error::SourceError;
use crate::request::Request;
use reqwest::header::{HeaderName, HeaderValue, HOST};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};

/// One request as written by an external producer, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestDescriptor {
    #[serde(default = "default_method", alias = "Method")]
    pub method: String,
    #[serde(alias = "URI", alias = "url", alias = "path")]
    pub uri: String,
    #[serde(default, alias = "Header", alias = "headers")]
    pub header: BTreeMap<String, HeaderValues>,
    #[serde(default, alias = "Body", skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, alias = "Host", skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

/// Header values may be given as a single string or a list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValues {
    One(String),
    Many(Vec<String>),
}

impl HeaderValues {
    fn iter(&self) -> impl Iterator<Item = &str> {
        let values: &[String] = match self {
            Self::One(v) => std::slice::from_ref(v),
            Self::Many(vs) => vs,
        };
        values.iter().map(String::as_str)
    }
}

fn default_method() -> String {
    "GET".to_string()
}

impl RequestDescriptor {
    pub fn into_request(self) -> Result<Request, String> {
        let method = Method::from_bytes(self.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| format!("invalid method {:?}", self.method))?;
        if self.uri.is_empty() {
            return Err("empty uri".to_string());
        }

        let mut req = Request::new(method, self.uri);
        let mut header_host = None;
        for (name, values) in &self.header {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| format!("invalid header name {name:?}"))?;
            // Host travels as the request's host, never as a header entry.
            if name == HOST {
                header_host = values.iter().next().map(str::to_string);
                continue;
            }
            for value in values.iter() {
                let value = HeaderValue::from_str(value)
                    .map_err(|_| format!("invalid value for header {name}"))?;
                req.headers.append(name.clone(), value);
            }
        }
        if let Some(body) = self.body {
            req = req.with_body(body);
        }
        req.host = self.host.or(header_host).filter(|h| !h.is_empty());
        Ok(req)
    }
}

type LineReader = Lines<BufReader<Box<dyn AsyncRead + Send + Unpin>>>;

/// Decodes newline-delimited JSON request descriptors from a byte stream.
///
/// A malformed entry is fatal to the source.
pub struct StreamSource {
    lines: LineReader,
    line_no: u64,
    failed: bool,
}

impl StreamSource {
    pub fn stdin() -> Self {
        Self::from_reader(tokio::io::stdin())
    }

    pub fn from_reader(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(reader);
        Self {
            lines: BufReader::new(reader).lines(),
            line_no: 0,
            failed: false,
        }
    }

    async fn next_entry(&mut self) -> Result<Option<Request>, SourceError> {
        if self.failed {
            return Ok(None);
        }
        let result = self.decode_next().await;
        if result.is_err() {
            self.failed = true;
        }
        result
    }

    async fn decode_next(&mut self) -> Result<Option<Request>, SourceError> {
        while let Some(line) = self.lines.next_line().await? {
            self.line_no += 1;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let desc: RequestDescriptor =
                serde_json::from_str(line).map_err(|source| SourceError::Decode {
                    line: self.line_no,
                    source,
                })?;
            let req = desc
                .into_request()
                .map_err(|reason| SourceError::InvalidRequest {
                    line: self.line_no,
                    reason,
                })?;
            return Ok(Some(req));
        }
        Ok(None)
    }
}

impl RequestSource for StreamSource {
    fn name(&self) -> &'static str {
        "stream"
    }

    fn next_request(&mut self) -> NextRequest<'_> {
        Box::pin(self.next_entry())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::ACCEPT;

    #[tokio::test]
    async fn test_decodes_entries_in_order() {
        let input = concat!(
            r#"{"method":"GET","uri":"/ipfs/a","header":{"Accept":["application/vnd.ipld.raw"]}}"#,
            "\n\n",
            r#"{"URI":"/ipfs/b","Host":"dweb.link"}"#,
            "\n",
            r#"{"method":"post","path":"/api/v0/add","headers":{"X-Test":"1"},"body":"hello"}"#,
            "\n",
        );
        let mut source = StreamSource::from_reader(input.as_bytes());

        let a = source.next_request().await.unwrap().unwrap();
        assert_eq!(a.method, Method::GET);
        assert_eq!(a.uri, "/ipfs/a");
        assert_eq!(a.headers.get(ACCEPT).unwrap(), "application/vnd.ipld.raw");

        let b = source.next_request().await.unwrap().unwrap();
        assert_eq!(b.method, Method::GET);
        assert_eq!(b.host.as_deref(), Some("dweb.link"));

        let c = source.next_request().await.unwrap().unwrap();
        assert_eq!(c.method, Method::POST);
        assert_eq!(c.headers.get("x-test").unwrap(), "1");
        assert_eq!(c.body.as_deref(), Some(&b"hello"[..]));

        assert!(source.next_request().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_entry_is_fatal() {
        let input = "{\"uri\":\"/ok\"}\n{not json\n{\"uri\":\"/never\"}\n";
        let mut source = StreamSource::from_reader(input.as_bytes());

        assert!(source.next_request().await.unwrap().is_some());

        let err = source.next_request().await.unwrap_err();
        assert!(matches!(err, SourceError::Decode { line: 2, .. }), "{err}");

        // The source does not resume after the bad entry.
        assert!(source.next_request().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalid_header_is_fatal() {
        let input = r#"{"uri":"/x","header":{"bad name":"v"}}"#;
        let mut source = StreamSource::from_reader(input.as_bytes());
        let err = source.next_request().await.unwrap_err();
        assert!(matches!(err, SourceError::InvalidRequest { line: 1, .. }));
    }

    #[test]
    fn test_host_header_becomes_request_host() {
        let desc: RequestDescriptor = serde_json::from_str(
            r#"{"uri":"/x","header":{"Host":"from-header.example","Accept":"*/*"}}"#,
        )
        .unwrap();
        let req = desc.into_request().unwrap();
        assert_eq!(req.host.as_deref(), Some("from-header.example"));
        assert!(req.headers.get(HOST).is_none());
        assert_eq!(req.headers.len(), 1);

        let desc: RequestDescriptor = serde_json::from_str(
            r#"{"uri":"/x","host":"field.example","header":{"host":["from-header.example"]}}"#,
        )
        .unwrap();
        let req = desc.into_request().unwrap();
        assert_eq!(req.host.as_deref(), Some("field.example"));
        assert!(req.headers.is_empty());
    }

    #[test]
    fn test_descriptor_defaults() {
        let desc: RequestDescriptor = serde_json::from_str(r#"{"uri":"/x"}"#).unwrap();
        assert_eq!(desc.method, "GET");
        assert!(desc.header.is_empty());
        assert!(desc.body.is_none());
    }
}
