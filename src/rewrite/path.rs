/// Replaces the first occurrence of `bind_path` in `path` with
/// `upstream_path`. Paths without an occurrence come back unchanged.
///
/// `/foo/bar` with bind path `/` and upstream path `/data/` becomes
/// `/data/foo/bar`.
pub fn rewrite_path(path: &str, bind_path: &str, upstream_path: &str) -> String {
    if bind_path.is_empty() {
        return format!("{upstream_path}{path}");
    }
    path.replacen(bind_path, upstream_path, 1)
}

/// Whether a request path is served under `bind_path`: a trailing slash
/// claims the whole subtree, otherwise only the exact path matches.
pub fn matches_bind_path(path: &str, bind_path: &str) -> bool {
    if bind_path.ends_with('/') {
        path.starts_with(bind_path)
    } else {
        path == bind_path
    }
}
