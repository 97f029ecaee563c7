//! Helpers for exercising process supervision in tests.
//!
//! Registries and managers under test spawn real child processes; these
//! helpers materialize tiny shell scripts that stand in for the encoder
//! binary (accepting and ignoring any argument vector).

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

static STUB_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Write an executable stub encoder that runs `script` (a shell fragment),
/// returning its path. Arguments passed by the supervisor are ignored.
pub fn stub_encoder_script(dir: &Path, script: &str) -> String {
    let n = STUB_COUNTER.fetch_add(1, Ordering::SeqCst);
    let path = dir.join(format!("stub-encoder-{n}.sh"));
    std::fs::write(&path, format!("#!/bin/sh\n{script}")).unwrap();

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    path.display().to_string()
}

/// A long-running stub encoder (terminates on SIGTERM like the real one).
pub fn stub_encoder(dir: &Path) -> String {
    stub_encoder_script(dir, "exec sleep 30\n")
}

/// Publish onto `path` on the embedded RTSP server the way an ingest
/// encoder would (ANNOUNCE → SETUP → RECORD), standing in for ffmpeg.
/// Keep the returned socket alive for as long as the stream should exist.
pub async fn fake_publisher(
    addr: std::net::SocketAddr,
    path: &str,
) -> tokio::net::TcpStream {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut sock = tokio::net::TcpStream::connect(addr).await.unwrap();
    let sdp = b"v=0\r\nm=video 0 RTP/AVP 96\r\n";

    let mut cseq = 0u32;
    for (method, uri_suffix, body) in [
        ("ANNOUNCE", String::new(), &sdp[..]),
        ("SETUP", "/streamid=0".to_string(), &[][..]),
        ("RECORD", String::new(), &[][..]),
    ] {
        cseq += 1;
        let mut req = format!(
            "{method} rtsp://127.0.0.1/{path}{uri_suffix} RTSP/1.0\r\nCSeq: {cseq}\r\n"
        );
        if method == "SETUP" {
            req.push_str("Transport: RTP/AVP/TCP;unicast;interleaved=0-1;mode=record\r\n");
        }
        if !body.is_empty() {
            req.push_str(&format!("Content-Length: {}\r\n", body.len()));
        }
        req.push_str("\r\n");
        sock.write_all(req.as_bytes()).await.unwrap();
        sock.write_all(body).await.unwrap();

        // Drain the response headers (no bodies come back here).
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        while !buf.ends_with(b"\r\n\r\n") {
            let n = sock.read(&mut byte).await.unwrap();
            assert!(n > 0, "server closed during {method}");
            buf.push(byte[0]);
        }
        let head = String::from_utf8_lossy(&buf);
        assert!(head.starts_with("RTSP/1.0 200"), "{method} failed: {head}");
    }
    sock
}
