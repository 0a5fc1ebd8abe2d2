/// Turn a stored avatar path into a URL the client can load.
/// Absolute URLs pass through untouched.
pub fn normalize_url(url: Option<&str>, public_path: &str) -> Option<String> {
    match url {
        Some("") | None => None,
        Some(u) if !u.contains("://") => Some(format!(
            "{}/{}",
            public_path.trim_end_matches('/'),
            u.trim_start_matches('/')
        )),
        Some(u) => Some(u.to_string()),
    }
}
