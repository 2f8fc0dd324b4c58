//! Remote inference endpoint.
//!
//! The encoded image is POSTed as `application/octet-stream`; the response
//! body is JSON. A boolean is a presence flag, an array is a finding list,
//! `null` means nothing found and a non-empty object is a single finding.

use std::io::Read;
use std::time::Duration;

use anyhow::{anyhow, Context};
use serde_json::Value;
use url::Url;

use crate::detect::backend::{DetectionOutcome, DetectionService};
use crate::error::{PipelineError, Result};

const MAX_RESPONSE_BYTES: u64 = 4 * 1024 * 1024;

pub struct HttpDetectionService {
    endpoint: String,
    agent: ureq::Agent,
}

impl HttpDetectionService {
    pub fn new(endpoint: &str, timeout: Duration) -> anyhow::Result<Self> {
        let url = Url::parse(endpoint).context("parse detection endpoint")?;
        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(anyhow!(
                    "unsupported detection endpoint scheme '{}'; expected http(s)",
                    other
                ))
            }
        }
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Ok(Self {
            endpoint: url.to_string(),
            agent,
        })
    }
}

impl DetectionService for HttpDetectionService {
    fn name(&self) -> &str {
        &self.endpoint
    }

    fn detect(&self, image: &[u8]) -> Result<DetectionOutcome> {
        let response = self
            .agent
            .post(&self.endpoint)
            .set("Content-Type", "application/octet-stream")
            .send_bytes(image)
            .map_err(classify_error)?;

        let mut body = String::new();
        response
            .into_reader()
            .take(MAX_RESPONSE_BYTES)
            .read_to_string(&mut body)
            .map_err(|err| PipelineError::DetectionService {
                message: format!("read response from {}: {}", self.endpoint, err),
                permanent: false,
            })?;

        let value: Value =
            serde_json::from_str(&body).map_err(|err| PipelineError::DetectionService {
                message: format!("decode response from {}: {}", self.endpoint, err),
                permanent: true,
            })?;
        parse_outcome(value)
    }
}

/// 4xx means the provider rejected this input, except request timeout and
/// throttling. Everything else may succeed on redelivery.
fn classify_error(err: ureq::Error) -> PipelineError {
    match err {
        ureq::Error::Status(code, response) => PipelineError::DetectionService {
            message: format!("{} returned HTTP {}", response.get_url(), code),
            permanent: is_permanent_status(code),
        },
        ureq::Error::Transport(transport) => PipelineError::DetectionService {
            message: format!("transport: {}", transport),
            permanent: false,
        },
    }
}

fn is_permanent_status(code: u16) -> bool {
    (400..500).contains(&code) && code != 408 && code != 429
}

fn parse_outcome(value: Value) -> Result<DetectionOutcome> {
    match value {
        Value::Bool(flag) => Ok(DetectionOutcome::Flag(flag)),
        Value::Array(findings) => Ok(DetectionOutcome::Findings(findings)),
        Value::Null => Ok(DetectionOutcome::Findings(Vec::new())),
        Value::Object(map) if map.is_empty() => Ok(DetectionOutcome::Findings(Vec::new())),
        Value::Object(map) => Ok(DetectionOutcome::Findings(vec![Value::Object(map)])),
        other => Err(PipelineError::DetectionService {
            message: format!("unexpected detection response: {}", other),
            permanent: true,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_codes_classify() {
        assert!(is_permanent_status(400));
        assert!(is_permanent_status(415));
        assert!(!is_permanent_status(408));
        assert!(!is_permanent_status(429));
        assert!(!is_permanent_status(503));
    }

    #[test]
    fn response_shapes() {
        assert_eq!(
            parse_outcome(json!(true)).unwrap(),
            DetectionOutcome::Flag(true)
        );
        assert_eq!(
            parse_outcome(json!(null)).unwrap(),
            DetectionOutcome::Findings(vec![])
        );
        assert_eq!(
            parse_outcome(json!({"label": "car"})).unwrap(),
            DetectionOutcome::Findings(vec![json!({"label": "car"})])
        );
        let err = parse_outcome(json!("car")).unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn rejects_non_http_endpoints() {
        assert!(HttpDetectionService::new("ftp://host/detect", Duration::from_secs(1)).is_err());
        assert!(HttpDetectionService::new("http://127.0.0.1:9/detect", Duration::from_secs(1)).is_ok());
    }

    /// Answer exactly one request on a loopback port.
    fn serve_once(status: &'static str, body: &'static str) -> String {
        use std::io::{BufRead, BufReader, Read, Write};
        use std::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream);
            let mut content_length = 0usize;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                let line = line.trim_end();
                if line.is_empty() {
                    break;
                }
                if let Some((name, value)) = line.split_once(':') {
                    if name.eq_ignore_ascii_case("content-length") {
                        content_length = value.trim().parse().unwrap();
                    }
                }
            }
            let mut request_body = vec![0u8; content_length];
            reader.read_exact(&mut request_body).unwrap();
            let mut stream = reader.into_inner();
            write!(
                stream,
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            )
            .unwrap();
        });
        format!("http://{}/detect", addr)
    }

    #[test]
    fn posts_image_and_parses_findings() {
        let url = serve_once("200 OK", r#"[{"label":"person","score":0.93}]"#);
        let service = HttpDetectionService::new(&url, Duration::from_secs(5)).unwrap();
        let outcome = service.detect(b"\xff\xd8\xff").unwrap();
        assert_eq!(
            outcome,
            DetectionOutcome::Findings(vec![json!({"label": "person", "score": 0.93})])
        );
    }

    #[test]
    fn client_error_is_permanent() {
        let url = serve_once("415 Unsupported Media Type", "{}");
        let service = HttpDetectionService::new(&url, Duration::from_secs(5)).unwrap();
        let err = service.detect(b"not an image").unwrap_err();
        assert!(!err.is_retryable(), "{}", err);
    }

    #[test]
    fn server_error_is_transient() {
        let url = serve_once("503 Service Unavailable", "{}");
        let service = HttpDetectionService::new(&url, Duration::from_secs(5)).unwrap();
        let err = service.detect(b"jpeg").unwrap_err();
        assert!(err.is_retryable(), "{}", err);
    }

    #[test]
    fn unreachable_endpoint_is_transient() {
        // Port 9 (discard) is closed on test hosts; connection refused.
        let service =
            HttpDetectionService::new("http://127.0.0.1:9/detect", Duration::from_secs(2)).unwrap();
        let err = service.detect(b"jpeg").unwrap_err();
        assert!(err.is_retryable(), "{}", err);
    }
}
