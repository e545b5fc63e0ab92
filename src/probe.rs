use std::{fmt, future::Future, pin::Pin, time::Duration};

use reqwest::{
    Proxy,
    header::{ACCEPT, ACCEPT_LANGUAGE, HeaderMap, HeaderValue},
};
use tokio::time::Instant;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const CHROME_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/110.0.0.0 Safari/537.36";

pub type ProbeFuture<'a> = Pin<Box<dyn Future<Output = Result<u32, ProbeError>> + Send + 'a>>;

/// One HTTP request through a local proxy. `Ok` carries the latency in
/// milliseconds and is only returned for 2xx responses.
pub trait ProbeClient: Send + Sync {
    fn probe<'a>(
        &'a self,
        proxy_url: &'a str,
        target_url: &'a str,
        timeout: Duration,
    ) -> ProbeFuture<'a>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    InvalidProxy { message: String },
    Client { message: String },
    Timeout,
    Transport { message: String },
    Status { status: u16 },
}

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidProxy { message } => write!(f, "invalid proxy: {message}"),
            Self::Client { message } => write!(f, "build http client: {message}"),
            Self::Timeout => write!(f, "timed out"),
            Self::Transport { message } => write!(f, "request failed: {message}"),
            Self::Status { status } => write!(f, "unexpected status {status}"),
        }
    }
}

impl std::error::Error for ProbeError {}

/// `socks5h://127.0.0.1:<port>`; the proxy resolves target hostnames.
pub fn local_socks_url(port: u16) -> String {
    format!("socks5h://127.0.0.1:{port}")
}

/// reqwest-backed probe that presents itself as desktop Chrome.
#[derive(Debug, Clone)]
pub struct HttpProbeClient {
    connect_timeout: Duration,
}

impl Default for HttpProbeClient {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl HttpProbeClient {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    fn build_client(
        &self,
        proxy_url: &str,
        timeout: Duration,
    ) -> Result<reqwest::Client, ProbeError> {
        let proxy = Proxy::all(proxy_url).map_err(|e| ProbeError::InvalidProxy {
            message: e.to_string(),
        })?;

        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            ),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));

        reqwest::Client::builder()
            .proxy(proxy)
            .user_agent(CHROME_USER_AGENT)
            .default_headers(headers)
            .connect_timeout(self.connect_timeout.min(timeout))
            .timeout(timeout)
            .build()
            .map_err(|e| ProbeError::Client {
                message: e.to_string(),
            })
    }
}

impl ProbeClient for HttpProbeClient {
    fn probe<'a>(
        &'a self,
        proxy_url: &'a str,
        target_url: &'a str,
        timeout: Duration,
    ) -> ProbeFuture<'a> {
        Box::pin(async move {
            let client = self.build_client(proxy_url, timeout)?;

            let t0 = Instant::now();
            let resp = client.get(target_url).send().await.map_err(|e| {
                if e.is_timeout() {
                    ProbeError::Timeout
                } else {
                    ProbeError::Transport {
                        message: e.to_string(),
                    }
                }
            })?;
            let elapsed_ms = t0.elapsed().as_millis().min(u128::from(u32::MAX)) as u32;

            let status = resp.status();
            if !status.is_success() {
                return Err(ProbeError::Status {
                    status: status.as_u16(),
                });
            }
            Ok(elapsed_ms)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_socks_url_uses_remote_dns() {
        assert_eq!(local_socks_url(10808), "socks5h://127.0.0.1:10808");
    }

    #[tokio::test]
    async fn invalid_proxy_url_is_reported() {
        let client = HttpProbeClient::default();
        let err = client
            .probe("::not a url::", "https://example.com", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::InvalidProxy { .. }));
    }

    #[tokio::test]
    async fn closed_proxy_port_is_a_transport_failure() {
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let client = HttpProbeClient::new(Duration::from_millis(500));
        let err = client
            .probe(
                &local_socks_url(port),
                "http://example.invalid/",
                Duration::from_secs(2),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProbeError::Transport { .. } | ProbeError::Timeout
        ));
    }
}
