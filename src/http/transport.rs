use async_trait::async_trait;
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::config::{Metrics, ScanConfig};
use crate::core::error::{EngineError, Result, TransportError};

use super::response::Response;
use super::target::{PreparedRequest, Target};

/// Transport attempts per request; backoff grows 0.9s * 2.1^n plus jitter.
const MAX_ATTEMPTS: u32 = 5;
const BACKOFF_BASE: f64 = 0.9;
const BACKOFF_FACTOR: f64 = 2.1;
const JITTER_MAX: f64 = 0.7;

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64; rv:124.0) Gecko/20100101 Firefox/124.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Edg/120.0.2210.91",
];

/// Black-box send contract. The engine never opens sockets itself; tests
/// substitute a scripted implementation.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &PreparedRequest) -> std::result::Result<Response, TransportError>;
}

/// Production transport backed by reqwest.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: &ScanConfig) -> Result<Self> {
        let timeout = config.effective_timeout();
        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs_f64(timeout))
            .connect_timeout(Duration::from_secs_f64(timeout / 2.0))
            .redirect(if config.follow_redirects {
                reqwest::redirect::Policy::limited(5)
            } else {
                reqwest::redirect::Policy::none()
            })
            .danger_accept_invalid_certs(true);
        if let Some(proxy) = &config.proxy {
            builder = builder.proxy(
                reqwest::Proxy::all(proxy)
                    .map_err(|e| EngineError::Config(format!("invalid proxy url: {}", e)))?,
            );
        }
        let client = builder
            .build()
            .map_err(|e| EngineError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    fn classify(err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            return TransportError::Timeout(0.0);
        }
        let text = err.to_string();
        if err.is_connect() {
            if text.contains("refused") {
                return TransportError::ConnectionRefused;
            }
            return TransportError::Network(text);
        }
        if text.contains("reset") {
            return TransportError::ConnectionReset;
        }
        TransportError::Network(text)
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &PreparedRequest) -> std::result::Result<Response, TransportError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .unwrap_or(reqwest::Method::GET);
        let mut builder = self.client.request(method, &request.url);
        for (k, v) in &request.headers {
            builder = builder.header(k.as_str(), v.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let start = Instant::now();
        let resp = builder.send().await.map_err(Self::classify)?;
        let status = resp.status();
        let redirected = status.is_redirection();
        let headers: Vec<(String, String)> = resp
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
            .collect();
        let body = resp.text().await.map_err(Self::classify)?;
        let elapsed = start.elapsed().as_secs_f64();

        Ok(Response::new(
            status.as_u16(),
            status.canonical_reason().unwrap_or(""),
            headers,
            body,
            elapsed,
            redirected,
        ))
    }
}

/// Retry, pacing and status policy around a [`Transport`]. Every probe in the
/// engine goes through here, so the request counter and the retry budget are
/// enforced in one place.
pub struct Requester {
    transport: Arc<dyn Transport>,
    config: Arc<ScanConfig>,
    metrics: Arc<Metrics>,
    ignore_codes: HashSet<u16>,
    user_agent: &'static str,
}

impl Requester {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: Arc<ScanConfig>,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let ignore_codes = config.parsed_ignore_codes()?;
        let user_agent = USER_AGENTS[rand::thread_rng().gen_range(0..USER_AGENTS.len())];
        Ok(Self { transport, config, metrics, ignore_codes, user_agent })
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Send the target's request with `expression` injected (or unmodified
    /// when `None`), applying pacing, retries and the 401 policy.
    pub async fn send(&self, target: &Target, expression: Option<&str>) -> Result<Response> {
        let mut prepared = target.prepare(expression);
        if !prepared.headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("user-agent")) {
            prepared.headers.push(("User-Agent".to_string(), self.user_agent.to_string()));
        }

        if self.config.delay > 0.0 {
            let jitter: f64 = rand::thread_rng().gen_range(0.0..JITTER_MAX);
            tokio::time::sleep(Duration::from_secs_f64(self.config.delay + jitter)).await;
        }

        let seq = self.metrics.next_request();
        tracing::debug!(request = seq, url = %prepared.url, "sending request");

        let mut last_err = TransportError::Network("no attempt made".into());
        for attempt in 1..=MAX_ATTEMPTS {
            match self.transport.send(&prepared).await {
                Ok(response) => {
                    if response.status == 401 && !self.ignore_codes.contains(&401) {
                        return Err(EngineError::AuthRequired);
                    }
                    return Ok(response);
                }
                Err(err) => {
                    if matches!(err, TransportError::Timeout(_)) {
                        self.metrics.note_read_timeout();
                    }
                    tracing::warn!(
                        attempt,
                        max = MAX_ATTEMPTS,
                        "transport failure: {}",
                        err
                    );
                    last_err = err;
                    if attempt < MAX_ATTEMPTS {
                        self.metrics.note_retry();
                        let backoff = BACKOFF_BASE * BACKOFF_FACTOR.powi(attempt as i32 - 1);
                        let jitter: f64 = rand::thread_rng().gen_range(0.0..JITTER_MAX);
                        tokio::time::sleep(Duration::from_secs_f64(backoff + jitter)).await;
                    }
                }
            }
        }
        Err(EngineError::TargetUnreachable(last_err))
    }

    /// 5xx on a previously healthy endpoint indicates a catastrophic break
    /// unless the user opted to continue.
    pub fn check_http_break(&self, baseline: &Response, response: &Response) -> Result<()> {
        if response.status >= 500
            && baseline.ok()
            && !self.config.continue_on_http_error
            && !self.ignore_codes.contains(&response.status)
        {
            return Err(EngineError::HttpBreak { status: response.status });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::target::{ParamLocation, Parameter};

    fn target(url: &str) -> Target {
        let param = Parameter::new("id", "1", ParamLocation::Get).unwrap();
        Target::new(url, "GET", param).unwrap()
    }

    fn requester(config: ScanConfig) -> Requester {
        let config = Arc::new(config);
        let transport = Arc::new(ReqwestTransport::new(&config).unwrap());
        Requester::new(transport, config, Arc::new(Metrics::new())).unwrap()
    }

    #[tokio::test]
    async fn sends_and_measures() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", mockito::Matcher::Any)
            .with_status(200)
            .with_body("hello")
            .create_async()
            .await;

        let req = requester(ScanConfig::default());
        let resp = req
            .send(&target(&format!("{}/page?id=1", server.url())), None)
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, "hello");
        assert!(resp.response_time >= 0.0);
    }

    #[tokio::test]
    async fn unignored_401_is_fatal() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", mockito::Matcher::Any)
            .with_status(401)
            .create_async()
            .await;

        let req = requester(ScanConfig::default());
        let err = req
            .send(&target(&format!("{}/page?id=1", server.url())), None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::AuthRequired));
    }

    #[tokio::test]
    async fn ignored_401_passes_through() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", mockito::Matcher::Any)
            .with_status(401)
            .with_body("denied")
            .create_async()
            .await;

        let req = requester(ScanConfig { ignore_code: "*".into(), ..Default::default() });
        let resp = req
            .send(&target(&format!("{}/page?id=1", server.url())), None)
            .await
            .unwrap();
        assert_eq!(resp.status, 401);
    }

    #[test]
    fn http_break_requires_healthy_baseline() {
        let req = requester(ScanConfig::default());
        let baseline = Response::new(200, "OK", vec![], "ok", 0.1, false);
        let broken = Response::new(500, "Internal Server Error", vec![], "", 0.1, false);
        assert!(req.check_http_break(&baseline, &broken).is_err());

        let bad_baseline = Response::new(404, "Not Found", vec![], "", 0.1, false);
        assert!(req.check_http_break(&bad_baseline, &broken).is_ok());
    }
}
