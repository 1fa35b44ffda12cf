//! reqwest-backed [`HttpTransport`] used by webhook steps, action dispatch
//! and status sync callbacks.

use std::collections::HashMap;

use futures_util::StreamExt;
use tenure_core::workflow::collaborators::{
    BoxFuture, CollaboratorError, HttpRequest, HttpResponse, HttpTransport,
};
use tenure_types::workflow::HttpMethod;

/// Response bodies larger than this are rejected.
const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to build HTTP client: {0}")]
    Build(#[from] reqwest::Error),

    #[error("response body exceeds {0} bytes")]
    BodyTooLarge(usize),
}

impl From<TransportError> for CollaboratorError {
    fn from(err: TransportError) -> Self {
        CollaboratorError::Transport(err.to_string())
    }
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("tenure/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, CollaboratorError> {
        let timeout_ms = request.timeout.as_millis() as u64;
        let mut builder = self
            .client
            .request(to_reqwest_method(request.method), &request.url)
            .timeout(request.timeout);

        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, timeout_ms))?;

        let status = response.status().as_u16();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    v.to_str().unwrap_or("<binary>").to_string(),
                )
            })
            .collect();

        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| map_reqwest_error(e, timeout_ms))?;
            if body.len() + chunk.len() > MAX_BODY_BYTES {
                return Err(TransportError::BodyTooLarge(MAX_BODY_BYTES).into());
            }
            body.extend_from_slice(&chunk);
        }

        tracing::debug!(url = request.url.as_str(), status, bytes = body.len(), "HTTP request completed");

        Ok(HttpResponse {
            status,
            headers,
            body: String::from_utf8_lossy(&body).into_owned(),
        })
    }
}

impl HttpTransport for ReqwestTransport {
    fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, CollaboratorError>> {
        Box::pin(self.execute(request))
    }
}

fn to_reqwest_method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Patch => reqwest::Method::PATCH,
        HttpMethod::Delete => reqwest::Method::DELETE,
    }
}

fn map_reqwest_error(err: reqwest::Error, timeout_ms: u64) -> CollaboratorError {
    if err.is_timeout() {
        CollaboratorError::Timeout(timeout_ms)
    } else {
        CollaboratorError::Transport(err.to_string())
    }
}
