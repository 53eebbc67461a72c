use std::process::Stdio;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{ReadEnd, SourceError, SourceEvent};

const READ_CHUNK: usize = 64 * 1024;
/// How much of ffmpeg's stderr is kept for the exit error.
const STDERR_TAIL: usize = 4 * 1024;

/// What ffmpeg should open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input<'a> {
    /// A network stream, read as fast as it arrives.
    Rtsp(&'a str),
    /// A local video, played back in real time.
    File(&'a str),
}

/// Arguments that make ffmpeg emit one JPEG every `interval` seconds on
/// stdout as a concatenated MJPEG stream.
pub fn arguments(input: Input<'_>, interval: f64) -> Vec<String> {
    let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-nostdin"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let location = match input {
        Input::Rtsp(url) => {
            args.extend(["-rtsp_transport".into(), "tcp".into()]);
            url
        }
        Input::File(path) => {
            args.push("-re".into());
            path
        }
    };
    args.extend([
        "-i".into(),
        location.to_string(),
        "-vf".into(),
        format!("fps=1/{interval}"),
        "-f".into(),
        "image2pipe".into(),
        "-c:v".into(),
        "mjpeg".into(),
        "-q:v".into(),
        "2".into(),
        "pipe:1".into(),
    ]);
    args
}

/// Run one ffmpeg process and forward its stdout into `events`.
///
/// The child is killed when this future is dropped, so cancelling the read
/// (source stopped) does not leak the process.
pub async fn read_process(
    ffmpeg_path: &str,
    input: Input<'_>,
    interval: f64,
    events: &mpsc::Sender<SourceEvent>,
) -> Result<ReadEnd, SourceError> {
    let args = arguments(input, interval);
    debug!(ffmpeg = ffmpeg_path, ?args, "spawning ffmpeg");

    let mut child = Command::new(ffmpeg_path)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| SourceError::Spawn(e.to_string()))?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| SourceError::Spawn("could not get stdout handle".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| SourceError::Spawn("could not get stderr handle".into()))?;
    // ffmpeg blocks once the stderr pipe is full, so it is drained alongside
    // stdout rather than after exit.
    let stderr_tail = drain_tail(stderr);

    info!(ffmpeg = ffmpeg_path, ?input, "ffmpeg reader started");

    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = stdout.read(&mut buf).await.map_err(SourceError::Io)?;
        if n == 0 {
            break;
        }
        if events
            .send(SourceEvent::Data(Bytes::copy_from_slice(&buf[..n])))
            .await
            .is_err()
        {
            return Ok(ReadEnd::Closed);
        }
    }

    let status = child.wait().await.map_err(SourceError::Io)?;
    if !status.success() {
        let stderr = stderr_tail.await.unwrap_or_default();
        let stderr = String::from_utf8_lossy(&stderr).trim().to_string();
        warn!(status = %status, stderr = %stderr, "ffmpeg exited with error");
        return Err(SourceError::Exited {
            status: status.to_string(),
            stderr,
        });
    }
    Ok(ReadEnd::Finished)
}

/// Read `pipe` to the end, keeping only its last [`STDERR_TAIL`] bytes.
fn drain_tail<R>(mut pipe: R) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut tail = Vec::with_capacity(STDERR_TAIL);
        let mut buf = [0u8; 1024];
        loop {
            match pipe.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    tail.extend_from_slice(&buf[..n]);
                    if tail.len() > STDERR_TAIL {
                        tail.drain(..tail.len() - STDERR_TAIL);
                    }
                }
            }
        }
        tail
    })
}
