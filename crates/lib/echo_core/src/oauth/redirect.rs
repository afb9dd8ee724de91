//! redirect_uri allow-list matching.

use url::Url;

/// Whether `redirect_uri` may receive codes for an app with `allowed` callbacks.
///
/// `http://localhost` on any port is always accepted for local development.
/// Everything else must match an allow-list entry exactly, ignoring a single
/// trailing slash on either side.
pub fn is_authorized_redirect(redirect_uri: &str, allowed: &[String]) -> bool {
    if is_localhost_dev_uri(redirect_uri) {
        return true;
    }
    let wanted = normalize(redirect_uri);
    allowed.iter().any(|candidate| normalize(candidate) == wanted)
}

fn is_localhost_dev_uri(redirect_uri: &str) -> bool {
    match Url::parse(redirect_uri) {
        Ok(url) => url.scheme() == "http" && url.host_str() == Some("localhost"),
        Err(_) => false,
    }
}

fn normalize(uri: &str) -> &str {
    uri.strip_suffix('/').unwrap_or(uri)
}
