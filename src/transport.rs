use std::time::Duration;

use axum::{
    body::Body,
    extract::Request,
    http::{header, HeaderMap, HeaderValue, StatusCode},
};
use hyper::body::Incoming;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::ProxyError;

/// Talks to the upstream and decorates successful responses.
#[derive(Clone)]
pub struct Interceptor {
    client: Client<HttpConnector, Body>,
    link: Option<HeaderValue>,
    timeout: Duration,
}

impl Interceptor {
    pub fn new(link: Option<HeaderValue>, timeout: Duration) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self {
            client,
            link,
            timeout,
        }
    }

    /// Sends a request that already targets the upstream. Transport failures
    /// and timeouts come back as errors for this request only.
    pub async fn round_trip(&self, req: Request) -> Result<hyper::Response<Incoming>, ProxyError> {
        let uri = req.uri().clone();
        debug!(target: "rebase_proxy::transport", method = %req.method(), %uri, "Forwarding request");

        let mut response = match timeout(self.timeout, self.client.request(req)).await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                warn!(target: "rebase_proxy::transport", %uri, error = %err, "Upstream request failed");
                return Err(ProxyError::Upstream(err));
            }
            Err(_) => {
                warn!(target: "rebase_proxy::transport", %uri, timeout = ?self.timeout, "Upstream timed out");
                return Err(ProxyError::Timeout(self.timeout));
            }
        };

        let status = response.status();
        decorate_response(status, response.headers_mut(), self.link.as_ref());
        Ok(response)
    }
}

/// Header edits for upstream responses. Anything above 299 is left alone.
pub fn decorate_response(status: StatusCode, headers: &mut HeaderMap, link: Option<&HeaderValue>) {
    if status.as_u16() > 299 {
        info!(target: "rebase_proxy::transport", %status, "Unexpected response, headers untouched");
        return;
    }

    if let Some(link) = link {
        headers.append(header::LINK, link.clone());
    }
    // The body may be rewritten to a different length downstream.
    headers.remove(header::CONTENT_LENGTH);
    headers.append(
        header::ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static("Link"),
    );
}
