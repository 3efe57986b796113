use std::{net::SocketAddr, sync::Arc};

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode, Version},
    response::{IntoResponse, Response},
    Router,
};
use tracing::{debug, info, instrument};

use crate::{
    config::ProxyConfig,
    error::{ConfigError, ProxyError},
    rewrite::{matches_bind_path, rewrite_path, RewriteBody, SubstitutionPair},
    transport::Interceptor,
};

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Headers that describe a single connection and must not be forwarded.
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ProxyConfig>,
    pub substitution: Arc<SubstitutionPair>,
    pub interceptor: Interceptor,
}

impl AppState {
    pub fn new(config: ProxyConfig) -> Result<Self, ConfigError> {
        let interceptor = Interceptor::new(config.link_header()?, config.upstream_timeout);
        Ok(Self {
            substitution: Arc::new(config.substitution()),
            config: Arc::new(config),
            interceptor,
        })
    }
}

/// Every path goes through the proxy handler; routing against the bind
/// path happens there.
pub fn app(state: AppState) -> Router {
    Router::new().fallback(proxy_handler).with_state(state)
}

#[instrument(skip_all, fields(method = %req.method(), path = %req.uri().path()))]
pub async fn proxy_handler(
    State(state): State<AppState>,
    client: Option<ConnectInfo<SocketAddr>>,
    mut req: Request,
) -> Result<Response, ProxyError> {
    let config = &state.config;
    let path = req.uri().path().to_string();
    let query = req
        .uri()
        .query()
        .map(|q| format!("?{}", q))
        .unwrap_or_default();

    if !matches_bind_path(&path, &config.bind_path) {
        if config.bind_path.ends_with('/') && format!("{}/", path) == config.bind_path {
            let location = format!("{}{}", config.bind_path, query);
            debug!(target: "rebase_proxy::proxy", %location, "Redirecting to bind path");
            return Ok((StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, location)]).into_response());
        }
        return Err(ProxyError::NotRouted(path));
    }

    let upstream_path = rewrite_path(&path, &config.bind_path, &config.upstream_path);
    let target = format!(
        "{}://{}{}{}",
        config.upstream_scheme, config.upstream_host, upstream_path, query
    );
    info!(target: "rebase_proxy::proxy", from = %req.uri(), to = %target, "Proxying");

    *req.uri_mut() = target
        .parse()
        .map_err(|source| ProxyError::InvalidUri { uri: target.clone(), source })?;
    *req.version_mut() = Version::HTTP_11;
    prepare_request_headers(req.headers_mut(), client.map(|ConnectInfo(addr)| addr), config);

    let response = state.interceptor.round_trip(req).await?;
    let (mut parts, body) = response.into_parts();
    strip_hop_by_hop(&mut parts.headers);

    let content_type = parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    // A surviving Content-Length (non-2xx) must stay truthful, so that body is not touched.
    let rewrite = config.rewrites(content_type) && !parts.headers.contains_key(header::CONTENT_LENGTH);
    debug!(
        target: "rebase_proxy::proxy",
        status = %parts.status,
        content_type,
        rewrite,
        "Upstream responded"
    );

    let body = if rewrite {
        RewriteBody::rewriting(body, state.substitution.clone(), config.max_line_bytes)
    } else {
        RewriteBody::passthrough(body)
    };
    Ok(Response::from_parts(parts, Body::new(body)))
}

fn prepare_request_headers(headers: &mut HeaderMap, client: Option<SocketAddr>, config: &ProxyConfig) {
    let wants_trailers = headers
        .get_all(header::TE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("trailers"));

    strip_hop_by_hop(headers);

    if wants_trailers {
        headers.insert(header::TE, HeaderValue::from_static("trailers"));
    }

    // Compressed bodies cannot be rewritten line by line.
    headers.remove(header::ACCEPT_ENCODING);

    if let Some(addr) = client {
        let ip = addr.ip().to_string();
        let forwarded = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(prior) => format!("{}, {}", prior, ip),
            None => ip,
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded) {
            headers.insert(X_FORWARDED_FOR, value);
        }
    }

    // Without the flag the client's Host is kept; the client fills it in
    // from the target URI when the request carried none.
    if config.rewrite_host {
        if let Ok(host) = HeaderValue::from_str(&config.upstream_host) {
            headers.insert(header::HOST, host);
        }
    }
}

/// Removes hop-by-hop headers plus any header named by `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect();

    for name in HOP_BY_HOP.iter().copied().chain(named.iter().map(String::as_str)) {
        headers.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_tokens_are_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, X-Trace"));
        headers.insert("x-trace", HeaderValue::from_static("1"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("text/turtle"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert_eq!(headers[header::ACCEPT], "text/turtle");
    }

    #[test]
    fn forwarded_for_is_appended() {
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("10.0.0.1"));
        let client: SocketAddr = "192.168.1.7:51000".parse().unwrap();

        prepare_request_headers(&mut headers, Some(client), &ProxyConfig::default());

        assert_eq!(headers[X_FORWARDED_FOR], "10.0.0.1, 192.168.1.7");
        assert!(headers.get(header::HOST).is_none());
    }

    #[test]
    fn host_is_rewritten_on_request() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("public.example:8090"));
        let config = ProxyConfig {
            rewrite_host: true,
            upstream_host: "backend:8080".into(),
            ..ProxyConfig::default()
        };

        prepare_request_headers(&mut headers, None, &config);

        assert_eq!(headers[header::HOST], "backend:8080");
        assert!(headers.get(X_FORWARDED_FOR).is_none());
    }

    #[test]
    fn accept_encoding_is_not_forwarded() {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip, br"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("text/turtle"));

        prepare_request_headers(&mut headers, None, &ProxyConfig::default());

        assert!(headers.get(header::ACCEPT_ENCODING).is_none());
        assert_eq!(headers[header::ACCEPT], "text/turtle");
    }

    #[test]
    fn te_trailers_survives_hop_by_hop_removal() {
        let mut headers = HeaderMap::new();
        headers.insert(header::TE, HeaderValue::from_static("gzip, Trailers"));
        prepare_request_headers(&mut headers, None, &ProxyConfig::default());
        assert_eq!(headers[header::TE], "trailers");

        let mut headers = HeaderMap::new();
        headers.insert(header::TE, HeaderValue::from_static("deflate"));
        prepare_request_headers(&mut headers, None, &ProxyConfig::default());
        assert!(headers.get(header::TE).is_none());
    }
}
