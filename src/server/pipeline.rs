use crate::cache::{InsertOutcome, ResponseCache};
use crate::http::{find_head_end, parse_request, response_allows_keep_alive};
use crate::server::upstream::{UpstreamConn, UpstreamPool};
use crate::utils::error::{ProxyError, Result};
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

const READ_CHUNK: usize = 16 * 1024;

/// Shared services and limits handed to every request.
pub struct RequestContext {
    pub cache: Arc<ResponseCache>,
    pub upstreams: Arc<UpstreamPool>,
    pub max_request_bytes: usize,
    pub max_response_bytes: usize,
    pub recv_timeout: Duration,
    pub user_agent: String,
}

/// Drive one accepted client socket through receive, parse, cache lookup,
/// origin fetch, and response. Failures with an HTTP mapping get a status
/// response before the socket closes; silent abandons and raw I/O errors
/// just close it.
pub async fn service_client(
    mut stream: TcpStream,
    peer: SocketAddr,
    ctx: &RequestContext,
) -> Result<()> {
    match run(&mut stream, peer, ctx).await {
        Ok(()) => Ok(()),
        Err(e) => {
            if let Some((code, reason)) = e.status() {
                write_error_response(&mut stream, code, reason).await;
            }
            Err(e)
        }
    }
}

async fn run(stream: &mut TcpStream, peer: SocketAddr, ctx: &RequestContext) -> Result<()> {
    let head = read_request_head(stream, ctx.max_request_bytes).await?;
    let request = parse_request(&head)?;

    let (host, port) = request.host_port()?;
    let host = host.to_ascii_lowercase();
    let path = request.origin_path();

    // Canonical key: method + absolute URL, so identical requests hit
    // regardless of the client headers that came with them.
    let key = format!("{} http://{}:{}{}", request.method, host, port, path);

    if let Some(payload) = ctx.cache.get(&key) {
        debug!(%peer, %host, path, "Serving cached response");
        stream.write_all(&payload).await?;
        return Ok(());
    }

    let wire_request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: {}\r\nConnection: close\r\n\r\n",
        path, host, ctx.user_agent
    );

    let mut upstream = match ctx.upstreams.checkout(&host, port) {
        Some(conn) => conn,
        None => dial(ctx, &host, port).await?,
    };

    let response = match exchange(&mut upstream.stream, wire_request.as_bytes(), ctx).await {
        Ok(response) => response,
        Err(e) => {
            let was_pooled = upstream.is_pooled();
            ctx.upstreams.checkin(upstream, &host, port, false);
            if !was_pooled {
                return Err(e);
            }
            // The pooled socket went stale under us; retry over a fresh dial.
            debug!(%host, port, error = %e, "Pooled upstream failed, redialling");
            upstream = dial(ctx, &host, port).await?;
            exchange(&mut upstream.stream, wire_request.as_bytes(), ctx).await?
        }
    };

    debug!(%peer, %host, port, bytes = response.len(), "Relaying origin response");

    let keep_alive = response_allows_keep_alive(&response);
    let client_write = stream.write_all(&response).await;

    // Best-effort caching: an oversize or duplicate response is simply not
    // stored, and the request still succeeds.
    match ctx.cache.insert(&key, response.clone()) {
        InsertOutcome::Inserted => trace!(key = %key, "Response cached"),
        InsertOutcome::AlreadyCached => trace!(key = %key, "Response already cached"),
        InsertOutcome::TooLarge => trace!(key = %key, "Response too large to cache"),
    }

    ctx.upstreams.checkin(upstream, &host, port, keep_alive);

    client_write?;
    Ok(())
}

async fn dial(ctx: &RequestContext, host: &str, port: u16) -> Result<UpstreamConn> {
    ctx.upstreams.connect(host, port).await.map_err(|e| {
        ProxyError::BadGateway(format!("failed to connect to {}:{}: {}", host, port, e))
    })
}

/// Accumulate the request head until the blank line, bounded by `cap`.
/// The cap counts the head including its terminator, so a request whose
/// `\r\n\r\n` lands exactly on the cap is still accepted.
async fn read_request_head(stream: &mut TcpStream, cap: usize) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(1024.min(cap));

    loop {
        if let Some(end) = find_head_end(&buf) {
            buf.truncate(end);
            return Ok(buf.freeze());
        }

        if buf.len() >= cap {
            return Err(ProxyError::BadRequest(format!(
                "request head exceeds {} bytes",
                cap
            )));
        }

        buf.reserve((cap - buf.len()).min(READ_CHUNK));
        match stream.read_buf(&mut buf).await {
            // Peer went away before finishing the request: abandon silently.
            Ok(0) => return Err(ProxyError::ConnectionClosed),
            Ok(_) => {
                if buf.len() > cap {
                    buf.truncate(cap);
                }
            }
            Err(e) => return Err(ProxyError::Io(e)),
        }
    }
}

/// Send the rewritten request and collect the origin's answer until EOF,
/// the byte cap, or a receive timeout. Partial data gathered before a
/// timeout or reset is still a usable response.
async fn exchange(stream: &mut TcpStream, request: &[u8], ctx: &RequestContext) -> Result<Bytes> {
    stream.write_all(request).await.map_err(|e| {
        ProxyError::BadGateway(format!("failed to send request upstream: {}", e))
    })?;

    let cap = ctx.max_response_bytes;
    let mut buf = BytesMut::with_capacity(READ_CHUNK.min(cap));

    while buf.len() < cap {
        buf.reserve((cap - buf.len()).min(READ_CHUNK));
        match timeout(ctx.recv_timeout, stream.read_buf(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                if buf.is_empty() {
                    return Err(ProxyError::BadGateway(format!(
                        "error receiving from upstream: {}",
                        e
                    )));
                }
                warn!(error = %e, received = buf.len(), "Upstream read failed, relaying partial response");
                break;
            }
            Err(_) => {
                if buf.is_empty() {
                    return Err(ProxyError::GatewayTimeout);
                }
                warn!(received = buf.len(), "Upstream receive timed out, relaying partial response");
                break;
            }
        }
    }

    if buf.is_empty() {
        return Err(ProxyError::BadGateway(
            "no response bytes from upstream".to_string(),
        ));
    }

    buf.truncate(cap);
    Ok(buf.freeze())
}

/// Fixed-form error response: status line, empty body, connection close.
pub async fn write_error_response(stream: &mut TcpStream, code: u16, reason: &str) {
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        code, reason
    );

    if let Err(e) = stream.write_all(response.as_bytes()).await {
        trace!(code, "Failed to write error response: {}", e);
    }
    let _ = stream.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheSettings, UpstreamSettings};
    use tokio::net::TcpListener;

    fn test_ctx() -> RequestContext {
        RequestContext {
            cache: Arc::new(ResponseCache::new(&CacheSettings::default())),
            upstreams: Arc::new(UpstreamPool::new(&UpstreamSettings::default())),
            max_request_bytes: 8192,
            max_response_bytes: 1024 * 1024,
            recv_timeout: Duration::from_millis(500),
            user_agent: "memproxy/test".to_string(),
        }
    }

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn request_head_is_read_through_terminator() {
        let (mut client, mut server) = connected_pair().await;
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: a\r\n\r\ntrailing")
            .await
            .unwrap();

        let head = read_request_head(&mut server, 8192).await.unwrap();
        assert!(head.ends_with(b"\r\n\r\n"));
        assert_eq!(&head[..], b"GET / HTTP/1.1\r\nHost: a\r\n\r\n");
    }

    #[tokio::test]
    async fn oversized_head_is_rejected() {
        let (mut client, mut server) = connected_pair().await;

        let big = vec![b'a'; 9000];
        client.write_all(b"GET /").await.unwrap();
        client.write_all(&big).await.unwrap();

        let err = read_request_head(&mut server, 8192).await.unwrap_err();
        assert!(matches!(err, ProxyError::BadRequest(_)));
    }

    #[tokio::test]
    async fn terminator_on_the_cap_boundary_is_accepted() {
        let (mut client, mut server) = connected_pair().await;

        // Head that is exactly `cap` bytes long, terminator included.
        let cap = 256;
        let mut head = b"GET / HTTP/1.1\r\nHost: a\r\nX-Pad: ".to_vec();
        let pad = cap - head.len() - 4;
        head.extend(std::iter::repeat(b'p').take(pad));
        head.extend_from_slice(b"\r\n\r\n");
        assert_eq!(head.len(), cap);

        client.write_all(&head).await.unwrap();
        let got = read_request_head(&mut server, cap).await.unwrap();
        assert_eq!(got.len(), cap);
    }

    #[tokio::test]
    async fn early_close_is_a_silent_abandon() {
        let (client, mut server) = connected_pair().await;
        drop(client);

        let err = read_request_head(&mut server, 8192).await.unwrap_err();
        assert!(matches!(err, ProxyError::ConnectionClosed));
    }

    #[tokio::test]
    async fn exchange_reports_timeout_when_origin_sends_nothing() {
        let ctx = test_ctx();
        let (mut proxy_side, _origin_side) = connected_pair().await;

        let err = exchange(&mut proxy_side, b"GET / HTTP/1.1\r\n\r\n", &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::GatewayTimeout));
    }

    #[tokio::test]
    async fn exchange_caps_the_response_size() {
        let mut ctx = test_ctx();
        ctx.max_response_bytes = 64;
        let (mut proxy_side, mut origin_side) = connected_pair().await;

        tokio::spawn(async move {
            let mut sink = [0u8; 64];
            let _ = origin_side.read(&mut sink).await;
            let _ = origin_side.write_all(&[b'x'; 500]).await;
            let _ = origin_side.shutdown().await;
        });

        let response = exchange(&mut proxy_side, b"GET / HTTP/1.1\r\n\r\n", &ctx)
            .await
            .unwrap();
        assert_eq!(response.len(), 64);
    }
}
