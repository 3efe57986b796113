use std::time::Duration;

use axum::{
    body::Body,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Errors raised while resolving the startup configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("unsupported upstream scheme {0:?} (expected http or https)")]
    Scheme(String),

    #[error("bind path {0:?} must start with '/'")]
    BindPath(String),

    #[error("JSON-LD context {0:?} cannot be used in a Link header")]
    ContextUri(String),

    #[error("the rewrite content-type list is empty")]
    NoRewriteTypes,

    #[error("upstream timeout must be greater than zero")]
    Timeout,
}

/// Per-request failures. Each one ends only the request that produced it.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("no route for {0}")]
    NotRouted(String),

    #[error("invalid upstream uri {uri}: {source}")]
    InvalidUri {
        uri: String,
        #[source]
        source: axum::http::uri::InvalidUri,
    },

    #[error("upstream request failed: {0}")]
    Upstream(#[from] hyper_util::client::legacy::Error),

    #[error("upstream did not answer within {0:?}")]
    Timeout(Duration),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::NotRouted(_) => StatusCode::NOT_FOUND,
            ProxyError::InvalidUri { .. } => StatusCode::BAD_REQUEST,
            ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = format!("{}\n", status.canonical_reason().unwrap_or("error"));
        (
            status,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            Body::from(body),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_failures_map_to_5xx() {
        let err = ProxyError::Timeout(Duration::from_secs(3));
        assert_eq!(err.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(err.into_response().status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn unrouted_paths_are_not_found() {
        let err = ProxyError::NotRouted("/elsewhere".into());
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }
}
