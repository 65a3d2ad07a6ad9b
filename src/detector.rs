//! External detection/tracking model interface
//!
//! The pre-trained model runs out of process. A dedicated worker thread owns
//! the child and speaks a small protocol over its pipes: the child prints
//! `READY`, then each request is a u32-LE length prefix plus JPEG bytes on
//! stdin and each response one JSON line on stdout. Detection, tracking, NMS
//! and inference all live on the far side of that pipe.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::process::{ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::config::DetectorConfig;

/// Bounding box in pixel coordinates of the submitted image
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

/// Single detection reported by the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub class: String,
    pub confidence: f32,
    /// Tracking ID; absent in plain detection mode or for unconfirmed tracks
    #[serde(default)]
    pub track_id: Option<u64>,
    pub bbox: BBox,
}

/// Model output for one image
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectionResult {
    pub width: Option<u32>,
    pub height: Option<u32>,
    #[serde(default)]
    pub detections: Vec<Detection>,
    #[serde(default)]
    pub error: Option<String>,
}

enum DetectorRequest {
    /// Live frame: result lands in the shared last-result slot
    Frame(Vec<u8>),
    /// Uploaded image: result goes back through the reply channel
    RoundTrip(Vec<u8>, Sender<DetectionResult>),
    Shutdown,
}

/// Handle to the model worker thread
pub struct DetectorHandle {
    request_tx: Sender<DetectorRequest>,
    last_result: Arc<Mutex<DetectionResult>>,
    alive: Arc<AtomicBool>,
    _worker: thread::JoinHandle<()>,
}

impl DetectorHandle {
    /// Spawn the model subprocess and its worker thread
    pub fn spawn(config: DetectorConfig) -> Result<Self> {
        let (request_tx, request_rx) = mpsc::channel::<DetectorRequest>();
        let last_result = Arc::new(Mutex::new(DetectionResult::default()));
        let alive = Arc::new(AtomicBool::new(true));

        let result_slot = last_result.clone();
        let alive_flag = alive.clone();
        let worker = thread::spawn(move || {
            if let Err(e) = worker_loop(&config, request_rx, result_slot) {
                tracing::error!("detector worker died: {e:#}");
            }
            alive_flag.store(false, Ordering::Relaxed);
        });

        Ok(Self {
            request_tx,
            last_result,
            alive,
            _worker: worker,
        })
    }

    /// Queue a live frame without waiting for the result
    pub fn submit(&self, jpeg: Vec<u8>) -> Result<()> {
        self.request_tx
            .send(DetectorRequest::Frame(jpeg))
            .context("detector worker is gone")?;
        Ok(())
    }

    /// Most recent result the worker produced
    pub fn last_result(&self) -> DetectionResult {
        self.last_result.lock().clone()
    }

    /// Blocking round trip for a single image. Call off the async runtime.
    pub fn detect(&self, jpeg: Vec<u8>, timeout: Duration) -> Result<DetectionResult> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.request_tx
            .send(DetectorRequest::RoundTrip(jpeg, reply_tx))
            .context("detector worker is gone")?;
        reply_rx
            .recv_timeout(timeout)
            .context("detector did not respond in time")
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }
}

impl Drop for DetectorHandle {
    fn drop(&mut self) {
        let _ = self.request_tx.send(DetectorRequest::Shutdown);
    }
}

fn worker_loop(
    config: &DetectorConfig,
    request_rx: Receiver<DetectorRequest>,
    last_result: Arc<Mutex<DetectionResult>>,
) -> Result<()> {
    let (program, args) = config
        .command
        .split_first()
        .context("detector command is empty")?;
    tracing::info!("starting detector: {}", config.command.join(" "));

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .with_context(|| format!("failed to spawn detector {program}"))?;

    let mut stdin = child.stdin.take().context("no detector stdin")?;
    let stdout = child.stdout.take().context("no detector stdout")?;
    let mut reader = BufReader::new(stdout);

    let mut ready_line = String::new();
    reader.read_line(&mut ready_line)?;
    if ready_line.trim() != "READY" {
        let _ = child.kill();
        anyhow::bail!("detector did not signal READY, got {ready_line:?}");
    }
    tracing::info!("detector ready");

    for request in request_rx {
        match request {
            DetectorRequest::Frame(jpeg) => match run_request(&mut stdin, &mut reader, &jpeg) {
                Ok(result) => *last_result.lock() = result,
                Err(e) => {
                    tracing::error!("detector request failed: {e:#}");
                    *last_result.lock() = DetectionResult {
                        error: Some(e.to_string()),
                        ..Default::default()
                    };
                    break;
                }
            },
            DetectorRequest::RoundTrip(jpeg, reply_tx) => {
                match run_request(&mut stdin, &mut reader, &jpeg) {
                    Ok(result) => {
                        // caller may have timed out already
                        let _ = reply_tx.send(result);
                    }
                    Err(e) => {
                        tracing::error!("detector request failed: {e:#}");
                        let _ = reply_tx.send(DetectionResult {
                            error: Some(e.to_string()),
                            ..Default::default()
                        });
                        break;
                    }
                }
            }
            DetectorRequest::Shutdown => {
                tracing::info!("detector shutdown requested");
                break;
            }
        }
    }

    let _ = child.kill();
    let _ = child.wait();
    tracing::info!("detector stopped");

    Ok(())
}

fn run_request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    jpeg: &[u8],
) -> Result<DetectionResult> {
    let len = jpeg.len() as u32;
    stdin
        .write_all(&len.to_le_bytes())
        .context("failed to write length prefix")?;
    stdin.write_all(jpeg).context("failed to write frame")?;
    stdin.flush().context("failed to flush detector stdin")?;

    let mut line = String::new();
    let n = reader
        .read_line(&mut line)
        .context("failed to read detector response")?;
    if n == 0 {
        anyhow::bail!("detector closed its stdout");
    }
    Ok(parse_result_line(&line))
}

/// A malformed line becomes an error result instead of killing the worker
pub(crate) fn parse_result_line(line: &str) -> DetectionResult {
    match serde_json::from_str::<DetectionResult>(line.trim()) {
        Ok(result) => result,
        Err(e) => {
            tracing::warn!("malformed detector response: {e}");
            DetectionResult {
                error: Some(format!("malformed detector response: {e}")),
                ..Default::default()
            }
        }
    }
}

/// Drop detections below the confidence threshold. The only post-filtering
/// done on this side of the pipe.
pub fn retain_confident(result: &mut DetectionResult, min_confidence: f32) {
    result.detections.retain(|d| d.confidence >= min_confidence);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(class: &str, confidence: f32, track_id: Option<u64>) -> Detection {
        Detection {
            class: class.to_string(),
            confidence,
            track_id,
            bbox: BBox {
                x1: 0,
                y1: 0,
                x2: 10,
                y2: 10,
            },
        }
    }

    #[test]
    fn parses_tracked_detection() {
        let line = r#"{"width":640,"height":480,"detections":[
            {"class":"person","confidence":0.91,"track_id":7,
             "bbox":{"x1":10,"y1":20,"x2":110,"y2":220}}],"error":null}"#;
        let result = parse_result_line(line);
        assert_eq!(result.width, Some(640));
        assert_eq!(result.detections.len(), 1);
        assert_eq!(result.detections[0].track_id, Some(7));
        assert!(result.error.is_none());
    }

    #[test]
    fn missing_track_id_is_none() {
        let line = r#"{"width":320,"height":240,"detections":[
            {"class":"dog","confidence":0.5,"bbox":{"x1":1,"y1":2,"x2":3,"y2":4}}]}"#;
        let result = parse_result_line(line);
        assert_eq!(result.detections[0].track_id, None);
    }

    #[test]
    fn malformed_line_becomes_error_result() {
        let result = parse_result_line("definitely not json");
        assert!(result.error.is_some());
        assert!(result.detections.is_empty());
    }

    #[test]
    fn model_error_passes_through() {
        let result = parse_result_line(r#"{"error":"model exploded"}"#);
        assert_eq!(result.error.as_deref(), Some("model exploded"));
    }

    #[test]
    fn retain_confident_filters_below_threshold() {
        let mut result = DetectionResult {
            detections: vec![
                det("person", 0.9, Some(1)),
                det("person", 0.2, Some(2)),
                det("cat", 0.25, None),
            ],
            ..Default::default()
        };
        retain_confident(&mut result, 0.25);
        assert_eq!(result.detections.len(), 2);
        assert!(result.detections.iter().all(|d| d.confidence >= 0.25));
    }
}
