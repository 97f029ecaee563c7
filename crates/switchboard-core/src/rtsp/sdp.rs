//! Minimal SDP inspection for announced streams.
//!
//! The republisher relays interleaved frames verbatim, so it never needs a
//! full SDP model — just enough to describe each announced track (media
//! kind, payload type, rtpmap codec) for status reporting and logging.
//! Parsing is tolerant: unknown lines are skipped, a malformed body yields
//! an empty track list rather than an error.

use serde::Serialize;

/// One `m=` section of an announced SDP body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackInfo {
    /// Media kind: "video", "audio", "application", ...
    pub kind: String,
    /// First RTP payload type of the section, when numeric.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_type: Option<u8>,
    /// Encoding name from the matching `a=rtpmap:` line (e.g. "H264").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codec: Option<String>,
    /// Clock rate from the rtpmap, when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clock_rate: Option<u32>,
}

impl TrackInfo {
    /// Compact display form for status output: `video/H264@90000`.
    pub fn label(&self) -> String {
        match (&self.codec, self.clock_rate) {
            (Some(codec), Some(rate)) => format!("{}/{}@{}", self.kind, codec, rate),
            (Some(codec), None) => format!("{}/{}", self.kind, codec),
            _ => self.kind.clone(),
        }
    }
}

/// Extract per-track info from an SDP body.
pub fn parse_tracks(sdp: &[u8]) -> Vec<TrackInfo> {
    let text = String::from_utf8_lossy(sdp);
    let mut tracks: Vec<TrackInfo> = Vec::new();

    for line in text.lines() {
        let line = line.trim();
        if let Some(media) = line.strip_prefix("m=") {
            // m=<media> <port> <proto> <fmt> ...
            let mut parts = media.split_whitespace();
            let kind = parts.next().unwrap_or("unknown").to_string();
            let payload_type = parts.nth(2).and_then(|fmt| fmt.parse::<u8>().ok());
            tracks.push(TrackInfo {
                kind,
                payload_type,
                codec: None,
                clock_rate: None,
            });
        } else if let Some(rtpmap) = line.strip_prefix("a=rtpmap:") {
            // a=rtpmap:<payload-type> <encoding>/<clock-rate>[/<params>]
            let Some(current) = tracks.last_mut() else {
                continue;
            };
            let Some((pt, encoding)) = rtpmap.split_once(' ') else {
                continue;
            };
            // Only the section's primary payload type describes the track.
            if let (Some(track_pt), Ok(map_pt)) = (current.payload_type, pt.parse::<u8>())
            {
                if track_pt != map_pt {
                    continue;
                }
            }
            let mut encoding_parts = encoding.split('/');
            current.codec = encoding_parts
                .next()
                .filter(|c| !c.is_empty())
                .map(str::to_string);
            current.clock_rate = encoding_parts.next().and_then(|r| r.parse().ok());
        }
    }
    tracks
}
