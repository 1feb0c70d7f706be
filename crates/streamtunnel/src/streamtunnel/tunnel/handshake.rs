use std::{sync::Arc, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};

use crate::streamtunnel::tunnel::{
    error::TunnelError,
    mux::{BoxedStream, MuxConfig, MuxSession, YamuxSession},
    wait::{self, WaitError},
};

pub const CONTROL_PATH: &str = "/_controlPath/";
pub const IDENTIFIER_HEADER: &str = "X-KTunnel-Identifier";
/// Status text that marks an accepted CONNECT, in addition to a plain 200.
pub const CONNECTED: &str = "200 Connected to Tunnel";

pub const HANDSHAKE_REQUEST: &[u8; 16] = b"controlHandshake";
pub const HANDSHAKE_RESPONSE: &[u8; 9] = b"controlOk";

/// How long the first stream open may take before the handshake is abandoned.
pub const OPEN_TIMEOUT: Duration = Duration::from_secs(10);

const MAX_RESPONSE_HEAD_BYTES: usize = 16 * 1024;
const MAX_REJECT_BODY_BYTES: u64 = 64 * 1024;
const MAX_CHUNK_LINE_BYTES: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectResponse {
    pub code: u16,
    pub reason: String,
    pub content_length: Option<u64>,
    pub chunked: bool,
}

impl ConnectResponse {
    /// Status as `"<code> <reason>"`, without the protocol version.
    pub fn status(&self) -> String {
        format!("{} {}", self.code, self.reason).trim_end().to_string()
    }

    /// Either condition is enough.
    pub fn is_accepted(&self) -> bool {
        self.code == 200 || self.status() == CONNECTED
    }
}

pub fn connect_request(host: &str, identifier: &str) -> Vec<u8> {
    format!(
        "CONNECT {CONTROL_PATH} HTTP/1.1\r\n\
         Host: {host}\r\n\
         User-Agent: streamtunnel/{}\r\n\
         {IDENTIFIER_HEADER}: {identifier}\r\n\
         \r\n",
        env!("CARGO_PKG_VERSION"),
    )
    .into_bytes()
}

/// Reads one response head, stopping right after the blank line.
///
/// Reads a byte at a time: whatever follows the head belongs to the multiplexer and
/// must stay in the socket.
pub async fn read_response_head<R: AsyncRead + Unpin>(r: &mut R) -> Result<ConnectResponse, TunnelError> {
    let mut head = Vec::with_capacity(256);
    loop {
        let b = r
            .read_u8()
            .await
            .map_err(|err| TunnelError::Connect(format!("read response {err}")))?;
        head.push(b);
        if head.ends_with(b"\r\n\r\n") || head.ends_with(b"\n\n") {
            break;
        }
        if head.len() > MAX_RESPONSE_HEAD_BYTES {
            return Err(TunnelError::Connect(format!(
                "read response: head exceeds {MAX_RESPONSE_HEAD_BYTES} bytes"
            )));
        }
    }
    parse_response_head(&String::from_utf8_lossy(&head))
}

fn parse_response_head(head: &str) -> Result<ConnectResponse, TunnelError> {
    let bad = |what: &str| TunnelError::Connect(format!("read response: malformed {what}"));

    let mut lines = head.lines();
    let status_line = lines.next().ok_or_else(|| bad("status line"))?;
    let (proto, rest) = status_line.split_once(' ').ok_or_else(|| bad("status line"))?;
    if !proto.starts_with("HTTP/") {
        return Err(bad("status line"));
    }
    let rest = rest.trim_start();
    let (code, reason) = rest.split_once(' ').unwrap_or((rest, ""));
    let code: u16 = code.parse().map_err(|_| bad("status code"))?;

    let mut content_length = None;
    let mut chunked = false;
    for line in lines {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(bad("header"));
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            let n = value.trim().parse().map_err(|_| bad("content-length"))?;
            content_length = Some(n);
        } else if name.trim().eq_ignore_ascii_case("transfer-encoding") {
            chunked = value
                .split(',')
                .next_back()
                .is_some_and(|v| v.trim().eq_ignore_ascii_case("chunked"));
        }
    }

    Ok(ConnectResponse {
        code,
        reason: reason.trim().to_string(),
        content_length,
        chunked,
    })
}

/// Reads the body of a rejected response, keeping at most `MAX_REJECT_BODY_BYTES`.
///
/// Chunked bodies end at the last-chunk marker, so a server that keeps the
/// connection open does not stall the caller. Without any framing the body runs
/// until EOF.
async fn read_reject_body<R: AsyncRead + Unpin>(r: &mut R, resp: &ConnectResponse) -> std::io::Result<String> {
    let mut body = Vec::new();
    if resp.chunked {
        read_chunked_body(r, &mut body).await?;
    } else {
        let limit = resp.content_length.unwrap_or(u64::MAX).min(MAX_REJECT_BODY_BYTES);
        r.take(limit).read_to_end(&mut body).await?;
    }
    Ok(String::from_utf8_lossy(&body).into_owned())
}

async fn read_chunked_body<R: AsyncRead + Unpin>(r: &mut R, body: &mut Vec<u8>) -> std::io::Result<()> {
    let invalid = |what: &str| std::io::Error::new(std::io::ErrorKind::InvalidData, format!("chunked body: {what}"));

    loop {
        let line = read_crlf_line(r).await?;
        let size = line.split(';').next().unwrap_or_default().trim();
        let size = u64::from_str_radix(size, 16).map_err(|_| invalid("bad chunk size"))?;
        if size == 0 {
            // Trailers are not needed; the rest of the connection is discarded.
            return Ok(());
        }

        let room = MAX_REJECT_BODY_BYTES.saturating_sub(body.len() as u64);
        if room == 0 {
            return Ok(());
        }
        let want = size.min(room);
        let got = (&mut *r).take(want).read_to_end(body).await? as u64;
        if got < want {
            return Err(invalid("truncated chunk"));
        }
        if want < size {
            return Ok(());
        }
        if !read_crlf_line(r).await?.is_empty() {
            return Err(invalid("missing chunk terminator"));
        }
    }
}

/// Reads one line terminated by `\n`, without the line ending.
async fn read_crlf_line<R: AsyncRead + Unpin>(r: &mut R) -> std::io::Result<String> {
    let mut line = Vec::new();
    loop {
        let b = r.read_u8().await?;
        if b == b'\n' {
            break;
        }
        line.push(b);
        if line.len() > MAX_CHUNK_LINE_BYTES {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "chunked body: line too long",
            ));
        }
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}

/// Dials the tunnel server, performs the CONNECT exchange and promotes the
/// connection into a client-role multiplexed session.
pub async fn connect(server_addr: &str, identifier: &str, cfg: &MuxConfig) -> Result<Arc<dyn MuxSession>, TunnelError> {
    let mut c = TcpStream::connect(server_addr).await.map_err(|err| TunnelError::Dial {
        addr: server_addr.to_string(),
        err,
    })?;

    let host = c
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| server_addr.to_string());
    c.write_all(&connect_request(&host, identifier))
        .await
        .map_err(|err| TunnelError::Connect(err.to_string()))?;

    let resp = read_response_head(&mut c).await?;
    if !resp.is_accepted() {
        let body = read_reject_body(&mut c, &resp).await?;
        return Err(TunnelError::Rejected {
            status: resp.status(),
            body,
        });
    }

    // A 2xx answer to CONNECT has no body; any Content-Length is ignored and the
    // next byte already belongs to the multiplexer.
    tracing::debug!(server=%host, status=%resp.status(), "handshake: CONNECT accepted");

    let sess = YamuxSession::client(c, cfg)?;
    Ok(Arc::new(sess))
}

/// Opens the first stream on `session` within `limit` and validates it with the
/// token exchange. The returned stream is the control channel.
pub async fn open_control(session: Arc<dyn MuxSession>, limit: Duration) -> Result<BoxedStream, TunnelError> {
    let opened = wait::bounded(
        limit,
        async move { session.open_stream().await },
        |late| async move {
            if let Ok(mut st) = late {
                let _ = st.shutdown().await;
            }
        },
    )
    .await;

    let mut st = match opened {
        Ok(Ok(st)) => st,
        Ok(Err(err)) => {
            tracing::error!(err=%err, "handshake: session open failed");
            return Err(TunnelError::Open(err));
        }
        Err(WaitError::Elapsed(d)) => return Err(TunnelError::OpenTimeout(d)),
        Err(WaitError::Join(err)) => return Err(TunnelError::Open(err.into())),
    };

    exchange_tokens(&mut st).await?;
    Ok(st)
}

pub async fn exchange_tokens<S: AsyncRead + AsyncWrite + Unpin>(st: &mut S) -> Result<(), TunnelError> {
    st.write_all(HANDSHAKE_REQUEST).await?;
    st.flush().await?;

    let mut buf = [0u8; HANDSHAKE_RESPONSE.len()];
    st.read_exact(&mut buf).await?;
    if &buf != HANDSHAKE_RESPONSE {
        return Err(TunnelError::Handshake {
            got: String::from_utf8_lossy(&buf).into_owned(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures_util::StreamExt;
    use tokio::net::TcpListener;

    use crate::streamtunnel::tunnel::mux::testing::PipeSession;

    /// Accepts one connection and consumes the CONNECT request head.
    async fn accept_connect(ln: TcpListener) -> TcpStream {
        let (mut s, _) = ln.accept().await.unwrap();
        let mut head = Vec::new();
        while !head.ends_with(b"\r\n\r\n") {
            head.push(s.read_u8().await.unwrap());
        }
        s
    }

    #[test]
    fn connect_request_targets_control_path_with_identifier() {
        let req = String::from_utf8(connect_request("10.0.0.1:80", "id-1")).unwrap();
        assert!(req.starts_with("CONNECT /_controlPath/ HTTP/1.1\r\n"));
        assert!(req.contains("\r\nHost: 10.0.0.1:80\r\n"));
        assert!(req.contains("\r\nX-KTunnel-Identifier: id-1\r\n"));
        assert!(req.ends_with("\r\n\r\n"));
    }

    #[test]
    fn acceptance_is_code_200_or_connected_text() {
        let parse = |s: &str| parse_response_head(s).unwrap();

        assert!(parse("HTTP/1.1 200 OK\r\n\r\n").is_accepted());
        assert!(parse("HTTP/1.0 200 Connected to Tunnel\r\n\r\n").is_accepted());
        assert!(parse("HTTP/1.1 200\r\n\r\n").is_accepted());

        let rejected = parse("HTTP/1.1 403 Forbidden\r\nContent-Length: 3\r\n\r\n");
        assert!(!rejected.is_accepted());
        assert_eq!(rejected.status(), "403 Forbidden");
        assert_eq!(rejected.content_length, Some(3));

        assert!(!parse("HTTP/1.1 502 Connected to Tunnel\r\n\r\n").is_accepted());

        let chunked = parse("HTTP/1.1 403 Forbidden\r\nTransfer-Encoding: gzip, chunked\r\n\r\n");
        assert!(chunked.chunked);
        assert!(!parse("HTTP/1.1 403 Forbidden\r\n\r\n").chunked);
    }

    #[test]
    fn malformed_heads_are_rejected() {
        assert!(parse_response_head("SSH-2.0-OpenSSH\r\n\r\n").is_err());
        assert!(parse_response_head("HTTP/1.1 abc OK\r\n\r\n").is_err());
        assert!(parse_response_head("HTTP/1.1 200 OK\r\nbroken\r\n\r\n").is_err());
    }

    #[tokio::test]
    async fn head_reader_leaves_following_bytes_unread() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(b"HTTP/1.1 200 Connected to Tunnel\r\n\r\nYAMUX").await.unwrap();
        drop(a);

        let resp = read_response_head(&mut b).await.unwrap();
        assert_eq!(resp.code, 200);
        assert_eq!(resp.reason, "Connected to Tunnel");

        let mut rest = Vec::new();
        b.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"YAMUX");
    }

    #[tokio::test]
    async fn head_reader_bounds_header_size() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let _ = a.write_all(b"HTTP/1.1 200 OK\r\n").await;
            let _ = a.write_all(&vec![b'x'; MAX_RESPONSE_HEAD_BYTES + 1]).await;
        });
        assert!(matches!(read_response_head(&mut b).await, Err(TunnelError::Connect(_))));
    }

    #[tokio::test]
    async fn token_exchange_accepts_matching_response() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let srv = tokio::spawn(async move {
            let mut req = [0u8; 16];
            server.read_exact(&mut req).await.unwrap();
            assert_eq!(&req, HANDSHAKE_REQUEST);
            server.write_all(HANDSHAKE_RESPONSE).await.unwrap();
        });

        exchange_tokens(&mut client).await.unwrap();
        srv.await.unwrap();
    }

    #[tokio::test]
    async fn token_exchange_rejects_mismatch() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let mut req = [0u8; 16];
            server.read_exact(&mut req).await.unwrap();
            server.write_all(b"controlNo").await.unwrap();
        });

        match exchange_tokens(&mut client).await {
            Err(TunnelError::Handshake { got }) => assert_eq!(got, "controlNo"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    struct NeverOpens;

    #[async_trait]
    impl MuxSession for NeverOpens {
        async fn open_stream(&self) -> anyhow::Result<BoxedStream> {
            std::future::pending().await
        }

        async fn close(&self) {}

        fn remote_addr(&self) -> Option<std::net::SocketAddr> {
            None
        }
    }

    #[tokio::test]
    async fn first_open_is_bounded() {
        let limit = Duration::from_millis(50);
        match open_control(Arc::new(NeverOpens), limit).await {
            Err(TunnelError::OpenTimeout(d)) => assert_eq!(d, limit),
            Err(other) => panic!("unexpected: {other:?}"),
            Ok(_) => panic!("expected timeout"),
        }
    }

    #[tokio::test]
    async fn rejected_connect_reports_status_and_body() {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();

        let srv = tokio::spawn(async move {
            let (mut s, _) = ln.accept().await.unwrap();
            let mut head = Vec::new();
            while !head.ends_with(b"\r\n\r\n") {
                head.push(s.read_u8().await.unwrap());
            }
            let head = String::from_utf8(head).unwrap();
            assert!(head.contains("X-KTunnel-Identifier: nobody\r\n"));
            s.write_all(b"HTTP/1.1 403 Forbidden\r\nContent-Length: 11\r\n\r\nbad client!")
                .await
                .unwrap();
        });

        let err = match connect(&addr.to_string(), "nobody", &MuxConfig::default()).await {
            Err(err) => err,
            Ok(_) => panic!("expected rejection"),
        };
        srv.await.unwrap();

        match &err {
            TunnelError::Rejected { status, body } => {
                assert_eq!(status, "403 Forbidden");
                assert_eq!(body, "bad client!");
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(err.to_string(), "proxy server: 403 Forbidden. err: bad client!");
    }

    #[tokio::test]
    async fn dial_failure_is_reported() {
        // Bind then drop to get a port nothing listens on.
        let addr = {
            let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
            ln.local_addr().unwrap()
        };
        let res = connect(&addr.to_string(), "id", &MuxConfig::default()).await;
        assert!(matches!(res, Err(TunnelError::Dial { .. })));
    }

    #[tokio::test]
    async fn chunked_reject_body_is_decoded() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(b"4;ext=1\r\nbad \r\n7\r\nclient!\r\n0\r\nX-Trailer: t\r\n\r\n")
            .await
            .unwrap();
        // The writer stays open: the last chunk alone must end the body.
        let resp = parse_response_head("HTTP/1.1 403 Forbidden\r\nTransfer-Encoding: chunked\r\n\r\n").unwrap();
        let body = tokio::time::timeout(Duration::from_secs(2), read_reject_body(&mut b, &resp))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(body, "bad client!");
        drop(a);
    }

    #[tokio::test]
    async fn chunked_reject_body_is_capped() {
        let (mut a, mut b) = tokio::io::duplex(256 * 1024);
        let size = MAX_REJECT_BODY_BYTES as usize + 10;
        tokio::spawn(async move {
            let _ = a.write_all(format!("{size:x}\r\n").as_bytes()).await;
            let _ = a.write_all(&vec![b'x'; size]).await;
            std::future::pending::<()>().await;
        });

        let resp = parse_response_head("HTTP/1.1 500 Oops\r\nTransfer-Encoding: chunked\r\n\r\n").unwrap();
        let body = tokio::time::timeout(Duration::from_secs(2), read_reject_body(&mut b, &resp))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(body.len() as u64, MAX_REJECT_BODY_BYTES);
    }

    #[tokio::test]
    async fn chunked_reject_on_open_connection_fails_start() {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();

        tokio::spawn(async move {
            let mut s = accept_connect(ln).await;
            s.write_all(b"HTTP/1.1 403 Forbidden\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nbad\r\n0\r\n\r\n")
                .await
                .unwrap();
            // Keep the socket open until the client is done.
            let _ = done_rx.await;
        });

        let res = tokio::time::timeout(
            Duration::from_secs(5),
            connect(&addr.to_string(), "id", &MuxConfig::default()),
        )
        .await
        .unwrap();
        let _ = done_tx.send(());

        match res {
            Err(err) => assert_eq!(err.to_string(), "proxy server: 403 Forbidden. err: bad"),
            Ok(_) => panic!("expected rejection"),
        }
    }

    #[tokio::test]
    async fn accepted_connect_ignores_content_length() {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();

        let srv = tokio::spawn(async move {
            let mut s = accept_connect(ln).await;
            s.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 12\r\n\r\n").await.unwrap();

            let mut sess = tokio_yamux::Session::new_server(s, tokio_yamux::Config::default());
            let mut ctrl = sess.next().await.unwrap().unwrap();
            tokio::spawn(async move { while sess.next().await.is_some() {} });

            let mut req = [0u8; HANDSHAKE_REQUEST.len()];
            ctrl.read_exact(&mut req).await.unwrap();
            assert_eq!(&req, HANDSHAKE_REQUEST);
            ctrl.write_all(HANDSHAKE_RESPONSE).await.unwrap();
            ctrl
        });

        let session = tokio::time::timeout(
            Duration::from_secs(5),
            connect(&addr.to_string(), "id", &MuxConfig::default()),
        )
        .await
        .unwrap()
        .unwrap();
        let _ctrl = tokio::time::timeout(Duration::from_secs(5), open_control(session.clone(), OPEN_TIMEOUT))
            .await
            .unwrap()
            .unwrap();
        let _srv_ctrl = srv.await.unwrap();
        session.close().await;
    }

    #[tokio::test]
    async fn stream_opened_after_deadline_is_closed() {
        let (sess, mut peers, release) = PipeSession::gated();

        match open_control(sess.clone(), Duration::from_millis(50)).await {
            Err(TunnelError::OpenTimeout(_)) => {}
            Err(other) => panic!("unexpected: {other:?}"),
            Ok(_) => panic!("expected timeout"),
        }

        release.send(()).unwrap();
        let mut peer = tokio::time::timeout(Duration::from_secs(2), peers.recv())
            .await
            .unwrap()
            .unwrap();

        // The late stream is shut down without ever carrying the handshake token.
        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), peer.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert!(rest.is_empty());
        assert_eq!(sess.opened.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
