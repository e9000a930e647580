use super::types::{ParsedRequest, KNOWN_METHODS};
use crate::utils::error::{ProxyError, Result};
use tracing::trace;

/// Terminator between the request head and any body.
pub const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Position just past the `\r\n\r\n` terminator, if present.
pub fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEAD_TERMINATOR.len())
        .position(|w| w == HEAD_TERMINATOR)
        .map(|idx| idx + HEAD_TERMINATOR.len())
}

/// Parse the request line and locate the Host header in a complete
/// request head. The returned view borrows from `buf`.
pub fn parse_request(buf: &[u8]) -> Result<ParsedRequest<'_>> {
    let head = std::str::from_utf8(buf)
        .map_err(|_| ProxyError::BadRequest("request head is not valid UTF-8".to_string()))?;

    let mut lines = head.split("\r\n");
    let request_line = lines
        .next()
        .filter(|l| !l.is_empty())
        .ok_or_else(|| ProxyError::BadRequest("empty request line".to_string()))?;

    trace!("Request line: {}", request_line);

    let mut parts = request_line.split(' ').filter(|p| !p.is_empty());
    let method = parts
        .next()
        .ok_or_else(|| ProxyError::BadRequest("missing method".to_string()))?;
    let target = parts
        .next()
        .ok_or_else(|| ProxyError::BadRequest("missing request target".to_string()))?;
    let version = parts
        .next()
        .ok_or_else(|| ProxyError::BadRequest("missing HTTP version".to_string()))?;

    if parts.next().is_some() {
        return Err(ProxyError::BadRequest(
            "malformed request line".to_string(),
        ));
    }

    if !KNOWN_METHODS.contains(&method) {
        return Err(ProxyError::BadRequest(format!(
            "unrecognised method: {}",
            method
        )));
    }

    if method != "GET" {
        return Err(ProxyError::NotImplemented(method.to_string()));
    }

    if version != "HTTP/1.0" && version != "HTTP/1.1" {
        return Err(ProxyError::VersionNotSupported(version.to_string()));
    }

    let host = header_value(head, "Host")
        .ok_or_else(|| ProxyError::BadRequest("missing Host header".to_string()))?;

    Ok(ParsedRequest {
        method,
        target,
        version,
        host,
    })
}

/// Case-insensitive lookup of a header value within a request or response
/// head. The value is trimmed of surrounding whitespace; header lines
/// after the first blank line are not examined.
pub fn header_value<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    for line in head.split("\r\n").skip(1) {
        if line.is_empty() {
            break;
        }

        let Some((field, value)) = line.split_once(':') else {
            continue;
        };

        if field.trim().eq_ignore_ascii_case(name) {
            return Some(value.trim());
        }
    }

    None
}

/// Whether an origin response permits keeping the upstream socket alive.
/// Only the Connection header inside the head is consulted, so a matching
/// byte sequence in the body cannot fake a keep-alive.
pub fn response_allows_keep_alive(response: &[u8]) -> bool {
    let head_len = match find_head_end(response) {
        Some(len) => len,
        None => return false,
    };

    let Ok(head) = std::str::from_utf8(&response[..head_len]) else {
        return false;
    };

    match header_value(head, "Connection") {
        Some(value) => value.eq_ignore_ascii_case("keep-alive"),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQ: &[u8] = b"GET /index.html HTTP/1.1\r\nHost: example.com\r\nUser-Agent: curl\r\n\r\n";

    #[test]
    fn parses_request_line_and_host() {
        let req = parse_request(REQ).unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.target, "/index.html");
        assert_eq!(req.version, "HTTP/1.1");
        assert_eq!(req.host, "example.com");
    }

    #[test]
    fn host_header_name_is_case_insensitive() {
        let req =
            parse_request(b"GET / HTTP/1.0\r\nhOsT:   example.com:8080  \r\n\r\n").unwrap();
        assert_eq!(req.host, "example.com:8080");
        assert_eq!(req.host_port().unwrap(), ("example.com", 8080));
    }

    #[test]
    fn missing_host_is_bad_request() {
        let err = parse_request(b"GET / HTTP/1.1\r\nAccept: */*\r\n\r\n").unwrap_err();
        assert!(matches!(err, ProxyError::BadRequest(_)));
    }

    #[test]
    fn post_is_not_implemented() {
        let err =
            parse_request(b"POST /x HTTP/1.1\r\nHost: example.com\r\n\r\n").unwrap_err();
        assert!(matches!(err, ProxyError::NotImplemented(_)));
    }

    #[test]
    fn garbage_method_is_bad_request() {
        let err =
            parse_request(b"BREW /pot HTTP/1.1\r\nHost: example.com\r\n\r\n").unwrap_err();
        assert!(matches!(err, ProxyError::BadRequest(_)));
    }

    #[test]
    fn old_versions_are_rejected() {
        let err =
            parse_request(b"GET / HTTP/0.9\r\nHost: example.com\r\n\r\n").unwrap_err();
        assert!(matches!(err, ProxyError::VersionNotSupported(_)));
    }

    #[test]
    fn head_end_is_located() {
        assert_eq!(find_head_end(REQ), Some(REQ.len()));
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\nHost: a"), None);
        let with_body = b"HTTP/1.1 200 OK\r\n\r\nbody";
        assert_eq!(find_head_end(with_body), Some(19));
    }

    #[test]
    fn keep_alive_detection_reads_the_head_only() {
        assert!(response_allows_keep_alive(
            b"HTTP/1.1 200 OK\r\nConnection: Keep-Alive\r\n\r\nOK"
        ));
        assert!(!response_allows_keep_alive(
            b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\nOK"
        ));
        assert!(!response_allows_keep_alive(b"HTTP/1.1 200 OK\r\n\r\nOK"));
        // The body must not be able to fake a keep-alive.
        assert!(!response_allows_keep_alive(
            b"HTTP/1.1 200 OK\r\n\r\nConnection: keep-alive"
        ));
    }
}
