use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::{ReadEnd, SourceError, SourceEvent};

const SOI: u8 = 0xD8;
const EOI: u8 = 0xD9;
const SOS: u8 = 0xDA;
const TEM: u8 = 0x01;
const RST0: u8 = 0xD0;
const RST7: u8 = 0xD7;
const MARKER: u8 = 0xFF;

/// Give up on a frame that has not ended after this many bytes and resync
/// on the next start-of-image marker.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Parse state for the byte stream.
enum ParseState {
    /// Looking for a start-of-image marker `FF D8`.
    SeekingStart,
    /// Inside an image. `pos` is where parsing resumes; `entropy` is set
    /// while inside scan data, where only a real marker ends the run.
    CollectingJpeg { pos: usize, entropy: bool },
}

/// Cuts a raw MJPEG byte stream into individual JPEG images.
///
/// Works on anything that carries concatenated JPEGs: multipart HTTP
/// responses (boundaries and part headers are skipped as junk between
/// images) and `ffmpeg -f image2pipe` output alike. Chunk boundaries may
/// fall anywhere, including between the two bytes of a marker.
///
/// Marker segments are stepped over by their length field, so whatever an
/// APPn segment carries (EXIF thumbnails, ICC profiles) cannot end or nest
/// the image.
pub struct MjpegSplitter {
    buffer: BytesMut,
    state: ParseState,
}

impl MjpegSplitter {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(256 * 1024),
            state: ParseState::SeekingStart,
        }
    }

    /// Feed a chunk and return every image it completed, in stream order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            match self.state {
                ParseState::SeekingStart => match find_marker(&self.buffer, 0, SOI) {
                    Some(pos) => {
                        let _ = self.buffer.split_to(pos);
                        self.state = ParseState::CollectingJpeg {
                            pos: 2,
                            entropy: false,
                        };
                    }
                    None => {
                        // Keep a trailing 0xFF, it may start the next marker.
                        let keep = usize::from(self.buffer.last() == Some(&MARKER));
                        let _ = self.buffer.split_to(self.buffer.len() - keep);
                        break;
                    }
                },
                ParseState::CollectingJpeg { pos, entropy } => match walk(&self.buffer, pos, entropy) {
                    Walk::Complete(end) => {
                        frames.push(self.buffer.split_to(end).freeze());
                        self.state = ParseState::SeekingStart;
                    }
                    Walk::Partial { pos, entropy } => {
                        if self.buffer.len() > MAX_FRAME_BYTES {
                            warn!(bytes = self.buffer.len(), "jpeg never ended, resyncing");
                            let _ = self.buffer.split_to(2);
                            self.state = ParseState::SeekingStart;
                            continue;
                        }
                        self.state = ParseState::CollectingJpeg { pos, entropy };
                        break;
                    }
                },
            }
        }
        frames
    }

    /// Bytes held back waiting for more input.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for MjpegSplitter {
    fn default() -> Self {
        Self::new()
    }
}

enum Walk {
    /// The image ends just before this offset.
    Complete(usize),
    Partial { pos: usize, entropy: bool },
}

/// Step through the image's segments from `pos` until its EOI marker.
///
/// Outside scan data every marker either stands alone or is followed by a
/// big-endian length covering the segment. Scan data is searched for the
/// next marker that is not a stuffed `FF 00` or a restart marker. A
/// position that does not hold a marker is treated as scan data, so a
/// damaged segment costs at most the rest of its image.
fn walk(buf: &[u8], mut pos: usize, mut entropy: bool) -> Walk {
    loop {
        if entropy {
            match next_marker(buf, pos) {
                Ok(at) => {
                    pos = at;
                    entropy = false;
                }
                Err(resume) => return Walk::Partial { pos: resume, entropy: true },
            }
        }

        if pos + 1 >= buf.len() {
            return Walk::Partial { pos, entropy: false };
        }
        if buf[pos] != MARKER {
            entropy = true;
            continue;
        }
        match buf[pos + 1] {
            // Fill byte before a marker.
            MARKER => pos += 1,
            EOI => return Walk::Complete(pos + 2),
            SOI | TEM | RST0..=RST7 => pos += 2,
            code => {
                if pos + 4 > buf.len() {
                    return Walk::Partial { pos, entropy: false };
                }
                let length = usize::from(u16::from_be_bytes([buf[pos + 2], buf[pos + 3]]));
                if length < 2 {
                    pos += 2;
                    entropy = true;
                    continue;
                }
                pos += 2 + length;
                entropy = code == SOS;
            }
        }
    }
}

/// Offset of the next marker in scan data, or where to resume once more
/// bytes arrive.
fn next_marker(buf: &[u8], from: usize) -> Result<usize, usize> {
    let mut i = from;
    while i + 1 < buf.len() {
        if buf[i] == MARKER {
            match buf[i + 1] {
                0x00 | RST0..=RST7 => {
                    i += 2;
                    continue;
                }
                MARKER => {
                    i += 1;
                    continue;
                }
                _ => return Ok(i),
            }
        }
        i += 1;
    }
    Err(i)
}

fn find_marker(buf: &[u8], from: usize, code: u8) -> Option<usize> {
    buf.get(from..)?
        .windows(2)
        .position(|w| w[0] == MARKER && w[1] == code)
        .map(|pos| from + pos)
}

/// Stream an MJPEG-over-HTTP response into `events` until it ends, fails or
/// nobody is listening any more.
pub async fn read_stream(
    url: &str,
    events: &mpsc::Sender<SourceEvent>,
) -> Result<ReadEnd, SourceError> {
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(SourceError::HttpConnect)?;
    let response = client
        .get(url)
        .send()
        .await
        .map_err(SourceError::HttpConnect)?;

    if !response.status().is_success() {
        return Err(SourceError::HttpStatus(response.status().as_u16()));
    }

    info!(url, status = %response.status(), "connected to MJPEG stream");

    let mut byte_stream = response.bytes_stream();
    while let Some(chunk) = byte_stream.next().await {
        let chunk = chunk.map_err(SourceError::HttpStream)?;
        if events.send(SourceEvent::Data(chunk)).await.is_err() {
            return Ok(ReadEnd::Closed);
        }
    }
    Ok(ReadEnd::Finished)
}
