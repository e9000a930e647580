use crate::utils::error::{ProxyError, Result};

/// Default port for plain HTTP origins.
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// Methods the parser recognises as HTTP at all. Anything else in the
/// request line is treated as a malformed request rather than an
/// unimplemented one.
pub const KNOWN_METHODS: &[&str] = &["GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS"];

/// Borrowed view of the request head: request line plus the Host header.
/// All fields point into the buffer the request was read into, so the
/// parser allocates nothing per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedRequest<'a> {
    pub method: &'a str,
    pub target: &'a str,
    pub version: &'a str,
    /// Raw Host header value, whitespace-trimmed; may carry an explicit port.
    pub host: &'a str,
}

impl<'a> ParsedRequest<'a> {
    /// Split the Host header into hostname and port (default 80).
    pub fn host_port(&self) -> Result<(&'a str, u16)> {
        split_host_port(self.host)
    }

    /// The path to send upstream, reduced to origin-form.
    pub fn origin_path(&self) -> &'a str {
        origin_form(self.target)
    }
}

/// Split a `host[:port]` string. A missing port defaults to 80; an
/// explicit port must parse as a non-zero u16.
pub fn split_host_port(host: &str) -> Result<(&str, u16)> {
    match host.rfind(':') {
        Some(idx) => {
            let name = &host[..idx];
            let port = host[idx + 1..]
                .parse::<u16>()
                .ok()
                .filter(|p| *p > 0)
                .ok_or_else(|| {
                    ProxyError::BadRequest(format!("invalid port in Host header: {}", host))
                })?;
            if name.is_empty() {
                return Err(ProxyError::BadRequest("empty host in Host header".to_string()));
            }
            Ok((name, port))
        }
        None => {
            if host.is_empty() {
                return Err(ProxyError::BadRequest("empty Host header".to_string()));
            }
            Ok((host, DEFAULT_HTTP_PORT))
        }
    }
}

/// Reduce a request target to origin-form. Absolute URLs
/// (`http://host/path`) lose their scheme and authority; targets that are
/// neither absolute nor rooted fall back to `/`.
pub fn origin_form(target: &str) -> &str {
    if let Some(rest) = target.strip_prefix("http://") {
        match rest.find('/') {
            Some(idx) => &rest[idx..],
            None => "/",
        }
    } else if target.starts_with('/') {
        target
    } else {
        "/"
    }
}
