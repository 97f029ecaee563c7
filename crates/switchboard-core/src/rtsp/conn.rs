//! Per-connection RTSP session handling.
//!
//! One task per TCP connection. The connection starts in a request/response
//! handshake phase and then settles into one of two long-lived roles:
//! publisher (after `RECORD` — interleaved frames flow in and are fanned
//! out) or reader (after `PLAY` — frames flow out, keep-alives flow in).
//! Only TCP-interleaved transport is spoken; every encoder leg the
//! supervisor spawns uses `-rtsp_transport tcp`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

use super::stream::StreamEntry;
use super::RtspServer;

const SERVER_NAME: &str = "switchboard-rtsp";
const PUBLIC_METHODS: &str =
    "OPTIONS, DESCRIBE, ANNOUNCE, SETUP, PLAY, RECORD, TEARDOWN, GET_PARAMETER";

/// A parsed RTSP request.
struct Request {
    method: String,
    uri: String,
    /// Header names lowercased.
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl Request {
    fn cseq(&self) -> &str {
        self.headers.get("cseq").map(String::as_str).unwrap_or("0")
    }
}

/// One unit read off the wire.
enum Message {
    Request(Request),
    /// A complete interleaved frame, 4-byte `$`-header included.
    Interleaved(Bytes),
}

/// What the handshake phase resolved this connection into.
enum Phase {
    Closed,
    Publish(Arc<StreamEntry>),
    Play {
        entry: Arc<StreamEntry>,
        reader_id: u64,
        rx: mpsc::Receiver<Bytes>,
    },
}

/// Entry point: run one connection to completion.
pub(super) async fn serve(
    server: Arc<RtspServer>,
    conn_id: u64,
    socket: TcpStream,
    peer: SocketAddr,
    shutdown: watch::Receiver<bool>,
) {
    let mut announced: Option<Arc<StreamEntry>> = None;
    if let Err(e) = run(&server, conn_id, socket, shutdown, &mut announced).await {
        tracing::debug!(conn = conn_id, %peer, error = %e, "rtsp connection error");
    }
    // A publisher that goes away takes its path with it (unless a newer
    // publisher already replaced it); its readers see end-of-stream.
    if let Some(entry) = announced {
        server.retire_publisher(&entry);
    }
    tracing::debug!(conn = conn_id, %peer, "rtsp connection closed");
}

async fn run(
    server: &Arc<RtspServer>,
    conn_id: u64,
    socket: TcpStream,
    mut shutdown: watch::Receiver<bool>,
    announced: &mut Option<Arc<StreamEntry>>,
) -> std::io::Result<()> {
    let (rd, mut writer) = socket.into_split();
    let mut reader = BufReader::new(rd);
    let session_id = format!("{conn_id:016x}");

    let phase = handshake(
        server,
        conn_id,
        &session_id,
        &mut reader,
        &mut writer,
        &mut shutdown,
        announced,
    )
    .await?;

    match phase {
        Phase::Closed => Ok(()),
        Phase::Publish(entry) => {
            publish_loop(&entry, &mut reader, &mut writer, &mut shutdown).await
        }
        Phase::Play {
            entry,
            reader_id,
            rx,
        } => {
            let result = play_loop(&entry, rx, &mut reader, writer, &mut shutdown).await;
            entry.remove_reader(reader_id);
            result
        }
    }
}

/// Request/response phase: everything up to RECORD or PLAY.
#[allow(clippy::too_many_arguments)]
async fn handshake(
    server: &Arc<RtspServer>,
    conn_id: u64,
    session_id: &str,
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    shutdown: &mut watch::Receiver<bool>,
    announced: &mut Option<Arc<StreamEntry>>,
) -> std::io::Result<Phase> {
    loop {
        let msg = tokio::select! {
            msg = read_message(reader) => msg?,
            _ = shutdown.changed() => return Ok(Phase::Closed),
        };
        let Some(msg) = msg else {
            return Ok(Phase::Closed);
        };
        let req = match msg {
            // Stray frames before RECORD (or RTCP during setup) are ignored.
            Message::Interleaved(_) => continue,
            Message::Request(req) => req,
        };
        let cseq = req.cseq().to_string();
        let path = path_from_uri(&req.uri);

        match req.method.as_str() {
            "OPTIONS" => {
                write_response(
                    writer,
                    &cseq,
                    200,
                    "OK",
                    &[("Public", PUBLIC_METHODS.into())],
                    &[],
                )
                .await?;
            }
            "ANNOUNCE" => {
                let entry = server.publish(&path, req.body, conn_id);
                *announced = Some(entry);
                tracing::info!(conn = conn_id, path = %path, "publisher announced");
                write_response(writer, &cseq, 200, "OK", &[], &[]).await?;
            }
            "DESCRIBE" => match server.lookup(&path) {
                Some(entry) => {
                    let base = format!("{}/", req.uri.trim_end_matches('/'));
                    write_response(
                        writer,
                        &cseq,
                        200,
                        "OK",
                        &[
                            ("Content-Base", base),
                            ("Content-Type", "application/sdp".into()),
                        ],
                        &entry.sdp,
                    )
                    .await?;
                }
                None => {
                    write_response(writer, &cseq, 404, "Not Found", &[], &[]).await?;
                }
            },
            "SETUP" => {
                // Echo the client's interleaved transport back; there is no
                // UDP path to negotiate.
                let transport = req
                    .headers
                    .get("transport")
                    .cloned()
                    .unwrap_or_else(|| "RTP/AVP/TCP;unicast;interleaved=0-1".into());
                write_response(
                    writer,
                    &cseq,
                    200,
                    "OK",
                    &[
                        ("Transport", transport),
                        ("Session", session_id.to_string()),
                    ],
                    &[],
                )
                .await?;
            }
            "RECORD" => {
                let Some(entry) = announced.clone() else {
                    write_response(
                        writer,
                        &cseq,
                        455,
                        "Method Not Valid in This State",
                        &[],
                        &[],
                    )
                    .await?;
                    continue;
                };
                // Ready must be observable no later than the RECORD response.
                entry.set_ready();
                write_response(
                    writer,
                    &cseq,
                    200,
                    "OK",
                    &[("Session", session_id.to_string())],
                    &[],
                )
                .await?;
                tracing::info!(conn = conn_id, path = %entry.path, "publisher recording");
                return Ok(Phase::Publish(entry));
            }
            "PLAY" => match server.lookup(&path) {
                Some(entry) => {
                    let (reader_id, rx) = entry.add_reader();
                    write_response(
                        writer,
                        &cseq,
                        200,
                        "OK",
                        &[("Session", session_id.to_string())],
                        &[],
                    )
                    .await?;
                    tracing::debug!(conn = conn_id, path = %path, "reader playing");
                    return Ok(Phase::Play {
                        entry,
                        reader_id,
                        rx,
                    });
                }
                None => {
                    write_response(writer, &cseq, 404, "Not Found", &[], &[]).await?;
                }
            },
            "TEARDOWN" => {
                write_response(writer, &cseq, 200, "OK", &[], &[]).await?;
                return Ok(Phase::Closed);
            }
            "GET_PARAMETER" => {
                write_response(writer, &cseq, 200, "OK", &[], &[]).await?;
            }
            other => {
                tracing::debug!(conn = conn_id, method = %other, "unimplemented rtsp method");
                write_response(writer, &cseq, 501, "Not Implemented", &[], &[]).await?;
            }
        }
    }
}

/// Publisher steady state: relay interleaved frames into the fan-out until
/// the publisher leaves, is evicted, or the server shuts down.
async fn publish_loop(
    entry: &Arc<StreamEntry>,
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    shutdown: &mut watch::Receiver<bool>,
) -> std::io::Result<()> {
    let mut evicted = entry.evicted();
    loop {
        tokio::select! {
            msg = read_message(reader) => {
                match msg? {
                    None => return Ok(()),
                    Some(Message::Interleaved(frame)) => entry.broadcast(frame),
                    Some(Message::Request(req)) => {
                        let cseq = req.cseq().to_string();
                        match req.method.as_str() {
                            "TEARDOWN" => {
                                write_response(writer, &cseq, 200, "OK", &[], &[]).await?;
                                return Ok(());
                            }
                            // Keep-alives.
                            _ => write_response(writer, &cseq, 200, "OK", &[], &[]).await?,
                        }
                    }
                }
            }
            _ = evicted.changed() => {
                if *evicted.borrow() {
                    tracing::info!(path = %entry.path, "publisher evicted by newer announce");
                    return Ok(());
                }
            }
            _ = shutdown.changed() => return Ok(()),
        }
    }
}

/// Reader steady state. Packet forwarding runs on its own task so the
/// request reader never races a partially-written frame; keep-alive
/// responses are funnelled through the same writer task.
async fn play_loop(
    entry: &Arc<StreamEntry>,
    mut rx: mpsc::Receiver<Bytes>,
    reader: &mut BufReader<OwnedReadHalf>,
    mut writer: OwnedWriteHalf,
    shutdown: &mut watch::Receiver<bool>,
) -> std::io::Result<()> {
    let (ctl_tx, mut ctl_rx) = mpsc::channel::<Vec<u8>>(4);

    let write_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                pkt = rx.recv() => match pkt {
                    Some(frame) => {
                        if writer.write_all(&frame).await.is_err() {
                            break;
                        }
                    }
                    // Publisher went away: end of stream for this reader.
                    None => break,
                },
                ctl = ctl_rx.recv() => match ctl {
                    Some(resp) => {
                        if writer.write_all(&resp).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    });

    let result = loop {
        tokio::select! {
            msg = read_message(reader) => {
                match msg {
                    Err(e) => break Err(e),
                    Ok(None) => break Ok(()),
                    // RTCP receiver reports on the interleaved channels.
                    Ok(Some(Message::Interleaved(_))) => {}
                    Ok(Some(Message::Request(req))) => {
                        let resp = render_response(req.cseq(), 200, "OK", &[], &[]);
                        let _ = ctl_tx.send(resp).await;
                        if req.method == "TEARDOWN" {
                            break Ok(());
                        }
                    }
                }
            }
            _ = stream_closed(entry) => break Ok(()),
            _ = shutdown.changed() => break Ok(()),
        }
    };
    drop(ctl_tx);
    write_task.abort();
    let _ = write_task.await;
    result
}

/// Resolves when this reader's stream has lost its publisher, so the play
/// loop closes instead of holding the socket open forever.
async fn stream_closed(entry: &Arc<StreamEntry>) {
    let mut evicted = entry.evicted();
    loop {
        if *evicted.borrow_and_update() {
            return;
        }
        if evicted.changed().await.is_err() {
            return;
        }
    }
}

// ── Wire reading/writing ────────────────────────────────────────────

/// Read one message: either an interleaved `$` frame or an RTSP request.
/// `Ok(None)` on clean EOF.
async fn read_message(
    reader: &mut BufReader<OwnedReadHalf>,
) -> std::io::Result<Option<Message>> {
    let first = match reader.read_u8().await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };

    if first == b'$' {
        let channel = reader.read_u8().await?;
        let len = reader.read_u16().await?;
        let mut frame = BytesMut::with_capacity(4 + len as usize);
        frame.put_u8(b'$');
        frame.put_u8(channel);
        frame.put_u16(len);
        frame.resize(4 + len as usize, 0);
        reader.read_exact(&mut frame[4..]).await?;
        return Ok(Some(Message::Interleaved(frame.freeze())));
    }

    // Request line, with the already-consumed first byte restored.
    let mut line = String::new();
    line.push(first as char);
    read_line(reader, &mut line).await?;
    let mut parts = line.trim().splitn(3, ' ');
    let method = parts.next().unwrap_or_default().to_string();
    let uri = parts.next().unwrap_or_default().to_string();
    if method.is_empty() || uri.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("malformed rtsp request line: {line:?}"),
        ));
    }

    let mut headers = HashMap::new();
    loop {
        let mut header = String::new();
        read_line(reader, &mut header).await?;
        let header = header.trim();
        if header.is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    let content_length = headers
        .get("content-length")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = vec![0u8; content_length];
    if content_length > 0 {
        reader.read_exact(&mut body).await?;
    }

    Ok(Some(Message::Request(Request {
        method,
        uri,
        headers,
        body,
    })))
}

/// Append one CRLF-terminated line (sans terminator) to `buf`.
async fn read_line(
    reader: &mut BufReader<OwnedReadHalf>,
    buf: &mut String,
) -> std::io::Result<()> {
    let mut raw = Vec::new();
    // Lines here are short header lines; this cap only guards malice.
    while raw.len() < 8192 {
        let b = reader.read_u8().await?;
        if b == b'\n' {
            if raw.last() == Some(&b'\r') {
                raw.pop();
            }
            buf.push_str(&String::from_utf8_lossy(&raw));
            return Ok(());
        }
        raw.push(b);
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        "rtsp header line too long",
    ))
}

fn render_response(
    cseq: &str,
    status: u16,
    reason: &str,
    extra: &[(&str, String)],
    body: &[u8],
) -> Vec<u8> {
    let mut out = format!(
        "RTSP/1.0 {status} {reason}\r\nCSeq: {cseq}\r\nServer: {SERVER_NAME}\r\n"
    );
    for (name, value) in extra {
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    if !body.is_empty() {
        out.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    out.push_str("\r\n");
    let mut bytes = out.into_bytes();
    bytes.extend_from_slice(body);
    bytes
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    cseq: &str,
    status: u16,
    reason: &str,
    extra: &[(&str, String)],
    body: &[u8],
) -> std::io::Result<()> {
    writer
        .write_all(&render_response(cseq, status, reason, extra, body))
        .await
}

/// Extract the stream path from a request URI, dropping the scheme,
/// authority, and any per-track suffix ffmpeg appends on SETUP.
fn path_from_uri(uri: &str) -> String {
    let rest = uri
        .strip_prefix("rtsp://")
        .or_else(|| uri.strip_prefix("rtsps://"))
        .unwrap_or(uri);
    let path = match rest.find('/') {
        Some(idx) => &rest[idx + 1..],
        None => "",
    };
    let path = path.trim_end_matches('/');
    // ffmpeg addresses tracks as <path>/streamid=N (or trackID=N).
    if let Some(idx) = path.rfind('/') {
        let last = &path[idx + 1..];
        if last.starts_with("streamid=") || last.starts_with("trackID=") {
            return path[..idx].to_string();
        }
    }
    path.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_extraction() {
        assert_eq!(path_from_uri("rtsp://127.0.0.1:8554/relay/cam"), "relay/cam");
        assert_eq!(path_from_uri("rtsp://h:1/relay/cam/"), "relay/cam");
        assert_eq!(
            path_from_uri("rtsp://h:1/relay/cam/streamid=0"),
            "relay/cam"
        );
        assert_eq!(path_from_uri("rtsp://h:1/relay/cam/trackID=1"), "relay/cam");
        assert_eq!(path_from_uri("rtsp://hostonly"), "");
    }

    #[test]
    fn response_rendering() {
        let resp = render_response("7", 404, "Not Found", &[], &[]);
        let text = String::from_utf8(resp).unwrap();
        assert!(text.starts_with("RTSP/1.0 404 Not Found\r\n"));
        assert!(text.contains("CSeq: 7\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn response_with_body_has_content_length() {
        let resp = render_response("1", 200, "OK", &[], b"v=0\r\n");
        let text = String::from_utf8(resp).unwrap();
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.ends_with("v=0\r\n"));
    }
}
