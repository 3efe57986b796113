use std::{collections::HashSet, path::PathBuf, time::Duration};

use axum::http::HeaderValue;
use clap::Parser;
use serde::Deserialize;
use tracing::info;

use crate::{error::ConfigError, rewrite::SubstitutionPair};

pub const DEFAULT_BIND_ADDR: &str = ":8090";
pub const DEFAULT_BIND_PATH: &str = "/";
pub const DEFAULT_PROXY_HOST: &str = "127.0.0.1:8080";
pub const DEFAULT_PROXY_PATH: &str = "/";
pub const DEFAULT_PROXY_SCHEME: &str = "http";
pub const DEFAULT_REWRITE_TYPES: [&str; 2] = ["text/turtle", "text/html"];
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
/// Same ceiling as a default line scanner token.
pub const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024;

const JSON_LD_CONTEXT_REL: &str = "http://www.w3.org/ns/json-ld#context";

/// Command line. Each setting falls back to its environment variable, then
/// to the config file, then to the built-in default.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Reverse proxy that rebases URIs in response bodies", long_about = None)]
pub struct Args {
    /// TOML config file
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Bind address [ip:port]; an empty ip listens on all interfaces
    #[arg(long = "ba", env = "BIND_ADDR")]
    pub bind_addr: Option<String>,

    /// Bind path; incoming requests to this path will be proxied
    #[arg(long = "bp", env = "BIND_PATH")]
    pub bind_path: Option<String>,

    /// Proxy host; requests will be proxied to this host
    #[arg(long = "ph", env = "PROXY_ADDR")]
    pub proxy_host: Option<String>,

    /// Proxy path; requests will be proxied to this path
    #[arg(long = "pp", env = "PROXY_PATH")]
    pub proxy_path: Option<String>,

    /// Proxy scheme (http or https)
    #[arg(long = "ps", env = "PROXY_SCHEME")]
    pub proxy_scheme: Option<String>,

    /// Rewrite the Host header to the proxy host
    #[arg(short = 'r', long = "rewrite-host", overrides_with = "no_rewrite_host")]
    pub rewrite_host: bool,

    /// Keep the client's Host header even when the config file rewrites it
    #[arg(long = "no-rewrite-host", overrides_with = "rewrite_host")]
    pub no_rewrite_host: bool,

    /// JSON-LD context location, advertised in a Link header on success
    #[arg(long = "ctx", env = "PROXY_LDCONTEXT")]
    pub context: Option<String>,

    /// Content-Type whose body is rewritten (repeatable, replaces the defaults)
    #[arg(long = "rewrite-type")]
    pub rewrite_types: Vec<String>,

    /// Seconds to wait for upstream response headers
    #[arg(long = "timeout")]
    pub timeout_secs: Option<u64>,

    /// Longest partial line held back before it is flushed
    #[arg(long = "max-line-bytes")]
    pub max_line_bytes: Option<usize>,
}

/// On-disk form; every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub bind_addr: Option<String>,
    pub bind_path: Option<String>,
    pub proxy_host: Option<String>,
    pub proxy_path: Option<String>,
    pub proxy_scheme: Option<String>,
    pub rewrite_host: Option<bool>,
    pub context: Option<String>,
    pub rewrite_types: Option<Vec<String>>,
    pub upstream_timeout_secs: Option<u64>,
    pub max_line_bytes: Option<usize>,
}

impl FileConfig {
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: display,
            source,
        })
    }
}

/// Resolved, validated settings. Built once at startup and shared read-only.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub bind_addr: String,
    pub bind_path: String,
    pub upstream_host: String,
    pub upstream_path: String,
    pub upstream_scheme: String,
    pub rewrite_host: bool,
    /// Empty disables Link injection.
    pub context_uri: String,
    pub rewrite_types: HashSet<String>,
    pub upstream_timeout: Duration,
    pub max_line_bytes: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            bind_path: DEFAULT_BIND_PATH.to_string(),
            upstream_host: DEFAULT_PROXY_HOST.to_string(),
            upstream_path: DEFAULT_PROXY_PATH.to_string(),
            upstream_scheme: DEFAULT_PROXY_SCHEME.to_string(),
            rewrite_host: false,
            context_uri: String::new(),
            rewrite_types: DEFAULT_REWRITE_TYPES.iter().map(|t| t.to_string()).collect(),
            upstream_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

impl ProxyConfig {
    /// Merges parsed arguments (flags and env already applied by clap) over
    /// the optional config file and the defaults, then validates.
    pub fn from_args(args: Args) -> Result<Self, ConfigError> {
        let file = match &args.config {
            Some(path) => FileConfig::from_file(path)?,
            None => FileConfig::default(),
        };
        let defaults = Self::default();

        let rewrite_types = if !args.rewrite_types.is_empty() {
            args.rewrite_types.into_iter().collect()
        } else if let Some(types) = file.rewrite_types {
            types.into_iter().collect()
        } else {
            defaults.rewrite_types
        };

        let timeout_secs = args
            .timeout_secs
            .or(file.upstream_timeout_secs)
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        let config = Self {
            bind_addr: args.bind_addr.or(file.bind_addr).unwrap_or(defaults.bind_addr),
            bind_path: args.bind_path.or(file.bind_path).unwrap_or(defaults.bind_path),
            upstream_host: args
                .proxy_host
                .or(file.proxy_host)
                .unwrap_or(defaults.upstream_host),
            upstream_path: args
                .proxy_path
                .or(file.proxy_path)
                .unwrap_or(defaults.upstream_path),
            upstream_scheme: args
                .proxy_scheme
                .or(file.proxy_scheme)
                .unwrap_or(defaults.upstream_scheme),
            rewrite_host: match (args.rewrite_host, args.no_rewrite_host) {
                (true, _) => true,
                (false, true) => false,
                (false, false) => file.rewrite_host.unwrap_or(false),
            },
            context_uri: args.context.or(file.context).unwrap_or_default(),
            rewrite_types,
            upstream_timeout: Duration::from_secs(timeout_secs),
            max_line_bytes: args
                .max_line_bytes
                .or(file.max_line_bytes)
                .unwrap_or(defaults.max_line_bytes),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upstream_scheme != "http" && self.upstream_scheme != "https" {
            return Err(ConfigError::Scheme(self.upstream_scheme.clone()));
        }
        if !self.bind_path.starts_with('/') {
            return Err(ConfigError::BindPath(self.bind_path.clone()));
        }
        if self.rewrite_types.is_empty() {
            return Err(ConfigError::NoRewriteTypes);
        }
        if self.upstream_timeout.is_zero() {
            return Err(ConfigError::Timeout);
        }
        self.link_header()?;
        Ok(())
    }

    /// Socket address to listen on. A bare `:port` means every interface.
    pub fn listen_addr(&self) -> String {
        if self.bind_addr.starts_with(':') {
            format!("0.0.0.0{}", self.bind_addr)
        } else {
            self.bind_addr.clone()
        }
    }

    /// Internal base is what the upstream emits, external base is what
    /// clients should see.
    pub fn substitution(&self) -> SubstitutionPair {
        SubstitutionPair::new(
            format!("{}{}", self.bind_addr, self.upstream_path),
            format!("{}{}", self.bind_addr, self.bind_path),
        )
    }

    pub fn link_header(&self) -> Result<Option<HeaderValue>, ConfigError> {
        if self.context_uri.is_empty() {
            return Ok(None);
        }
        let value = format!(
            "<{}>; rel=\"{}\"; type=\"application/ld+json\"",
            self.context_uri, JSON_LD_CONTEXT_REL
        );
        HeaderValue::from_str(&value)
            .map(Some)
            .map_err(|_| ConfigError::ContextUri(self.context_uri.clone()))
    }

    /// Exact match only; `text/html; charset=utf-8` is not `text/html`.
    pub fn rewrites(&self, content_type: &str) -> bool {
        self.rewrite_types.contains(content_type)
    }

    pub fn print(&self) {
        info!(target: "rebase_proxy::config", bind = %self.bind_addr, path = %self.bind_path, "Listening");
        info!(
            target: "rebase_proxy::config",
            upstream = %format!("{}://{}", self.upstream_scheme, self.upstream_host),
            path = %self.upstream_path,
            rewrite_host = self.rewrite_host,
            "Proxying"
        );
        if !self.context_uri.is_empty() {
            info!(target: "rebase_proxy::config", context = %self.context_uri, "Advertising JSON-LD context");
        }
        let mut types: Vec<&str> = self.rewrite_types.iter().map(String::as_str).collect();
        types.sort_unstable();
        info!(target: "rebase_proxy::config", types = ?types, "Rewriting bodies");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("rebase-proxy").chain(argv.iter().copied()))
            .expect("args parse")
    }

    #[test]
    fn defaults_apply_without_flags() {
        let config = ProxyConfig::default();
        assert_eq!(config.bind_addr, ":8090");
        assert_eq!(config.upstream_host, "127.0.0.1:8080");
        assert!(config.rewrites("text/turtle"));
        assert!(config.rewrites("text/html"));
        assert!(!config.rewrites("text/html; charset=utf-8"));
        assert!(config.link_header().unwrap().is_none());
    }

    #[test]
    fn flags_override_file_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "proxy_host = \"backend:9000\"\nproxy_path = \"/fcrepo/\"\nrewrite_types = [\"application/n-triples\"]"
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let config =
            ProxyConfig::from_args(parse(&["-c", path.as_str(), "--pp", "/data/", "-r"])).unwrap();

        assert_eq!(config.upstream_host, "backend:9000");
        assert_eq!(config.upstream_path, "/data/");
        assert!(config.rewrite_host);
        assert!(config.rewrites("application/n-triples"));
        assert!(!config.rewrites("text/turtle"));
    }

    #[test]
    fn host_rewrite_from_file_can_be_switched_off() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "rewrite_host = true").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let from_file = ProxyConfig::from_args(parse(&["-c", path.as_str()])).unwrap();
        assert!(from_file.rewrite_host);

        let overridden =
            ProxyConfig::from_args(parse(&["-c", path.as_str(), "--no-rewrite-host"])).unwrap();
        assert!(!overridden.rewrite_host);

        let last_wins =
            ProxyConfig::from_args(parse(&["--no-rewrite-host", "-r"])).unwrap();
        assert!(last_wins.rewrite_host);
    }

    #[test]
    fn substitution_pair_is_derived_from_bind_address() {
        let config = ProxyConfig {
            upstream_path: "/data/".into(),
            ..ProxyConfig::default()
        };
        let pair = config.substitution();
        assert_eq!(pair.internal(), b":8090/data/");
        assert_eq!(pair.external(), b":8090/");
    }

    #[test]
    fn link_header_carries_context() {
        let config = ProxyConfig {
            context_uri: "http://example.org/ctx.jsonld".into(),
            ..ProxyConfig::default()
        };
        let link = config.link_header().unwrap().unwrap();
        assert_eq!(
            link,
            "<http://example.org/ctx.jsonld>; rel=\"http://www.w3.org/ns/json-ld#context\"; type=\"application/ld+json\""
        );
    }

    #[test]
    fn rejects_unknown_scheme() {
        let config = ProxyConfig {
            upstream_scheme: "ftp".into(),
            ..ProxyConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Scheme(_))));
    }

    #[test]
    fn rejects_relative_bind_path() {
        let config = ProxyConfig {
            bind_path: "data/".into(),
            ..ProxyConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::BindPath(_))));
    }

    #[test]
    fn empty_host_listens_everywhere() {
        assert_eq!(ProxyConfig::default().listen_addr(), "0.0.0.0:8090");
        let config = ProxyConfig {
            bind_addr: "127.0.0.1:9000".into(),
            ..ProxyConfig::default()
        };
        assert_eq!(config.listen_addr(), "127.0.0.1:9000");
    }
}
