//! V4L2 webcam capture via the v4l2-ctl tool
//!
//! One frame per invocation, streamed to a rotating temp file, then converted
//! from packed YUYV 4:2:2 to RGB with integer math.

use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use std::fs;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::CameraConfig;

static FRAME_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Frame source for a single V4L2 device
pub struct FrameCapture {
    config: CameraConfig,
}

impl FrameCapture {
    pub fn with_config(config: CameraConfig) -> Result<Self> {
        fs::create_dir_all(&config.temp_dir)
            .with_context(|| format!("failed to create temp dir {}", config.temp_dir.display()))?;
        Ok(Self { config })
    }

    /// Ask the device for YUYV at the configured geometry. The device may
    /// already be configured (or refuse), so failure is only a warning.
    pub fn configure_device(&self) -> Result<()> {
        let output = Command::new("v4l2-ctl")
            .args([
                "-d",
                &self.config.device,
                "--set-fmt-video",
                &format!(
                    "width={},height={},pixelformat=YUYV",
                    self.config.width, self.config.height
                ),
            ])
            .output()
            .context("failed to run v4l2-ctl")?;

        if !output.status.success() {
            tracing::warn!(
                "could not set capture format on {}: {}",
                self.config.device,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        } else {
            tracing::info!(
                "camera {} configured for {}x{} YUYV",
                self.config.device,
                self.config.width,
                self.config.height
            );
        }
        Ok(())
    }

    fn capture_raw_frame(&self) -> Result<Vec<u8>> {
        let frame_num = FRAME_COUNTER.fetch_add(1, Ordering::Relaxed);
        let raw_path = self.config.temp_dir.join(format!("frame_{}.raw", frame_num % 4));

        let output = Command::new("v4l2-ctl")
            .args([
                "-d",
                &self.config.device,
                "--stream-mmap=4",
                "--stream-skip=1",
                "--stream-count=1",
                &format!("--stream-to={}", raw_path.display()),
            ])
            .stderr(Stdio::null())
            .output()
            .context("failed to run v4l2-ctl capture")?;

        if !output.status.success() {
            anyhow::bail!("v4l2-ctl capture failed on {}", self.config.device);
        }

        let raw_data = fs::read(&raw_path).context("failed to read raw frame")?;
        let _ = fs::remove_file(&raw_path);

        Ok(raw_data)
    }

    /// Capture one frame and return it as RGB
    pub fn capture_rgb_frame(&self) -> Result<RgbImage> {
        let raw = self.capture_raw_frame()?;
        yuyv_to_rgb(&raw, self.config.width, self.config.height)
    }
}

impl Drop for FrameCapture {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.config.temp_dir);
        tracing::info!("capture stopped");
    }
}

/// Convert packed YUYV 4:2:2 to RGB8 (BT.601, 8-bit fixed point).
///
/// The buffer may be longer than one frame (drivers pad); shorter is an error.
pub fn yuyv_to_rgb(raw: &[u8], width: u32, height: u32) -> Result<RgbImage> {
    let expected = width as usize * height as usize * 2;
    if raw.len() < expected {
        anyhow::bail!(
            "raw frame too short: got {} bytes, expected {} for {}x{} YUYV",
            raw.len(),
            expected,
            width,
            height
        );
    }

    let mut rgb = Vec::with_capacity(width as usize * height as usize * 3);
    for group in raw[..expected].chunks_exact(4) {
        let y0 = group[0] as i32;
        let u = group[1] as i32 - 128;
        let y1 = group[2] as i32;
        let v = group[3] as i32 - 128;
        push_rgb(&mut rgb, y0, u, v);
        push_rgb(&mut rgb, y1, u, v);
    }

    RgbImage::from_raw(width, height, rgb).context("failed to build RGB image")
}

#[inline]
fn push_rgb(out: &mut Vec<u8>, y: i32, u: i32, v: i32) {
    let r = y + ((359 * v) >> 8);
    let g = y - ((88 * u + 183 * v) >> 8);
    let b = y + ((454 * u) >> 8);
    out.push(r.clamp(0, 255) as u8);
    out.push(g.clamp(0, 255) as u8);
    out.push(b.clamp(0, 255) as u8);
}

/// Encode an RGB frame as JPEG at the given quality
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut jpeg = Vec::with_capacity(256 * 1024);
    let mut encoder = JpegEncoder::new_with_quality(&mut jpeg, quality);
    encoder
        .encode(
            image.as_raw(),
            image.width(),
            image.height(),
            image::ExtendedColorType::Rgb8,
        )
        .context("failed to encode JPEG")?;
    Ok(jpeg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neutral_chroma_is_grayscale() {
        // y0=64, y1=200 with u=v=128 must come out gray
        let raw = [64u8, 128, 200, 128];
        let img = yuyv_to_rgb(&raw, 2, 1).unwrap();
        assert_eq!(img.get_pixel(0, 0).0, [64, 64, 64]);
        assert_eq!(img.get_pixel(1, 0).0, [200, 200, 200]);
    }

    #[test]
    fn strong_v_pushes_red() {
        // y=0, u neutral, v=255: r = (359 * 127) >> 8 = 178, g clamps at 0
        let raw = [0u8, 128, 0, 255];
        let img = yuyv_to_rgb(&raw, 2, 1).unwrap();
        assert_eq!(img.get_pixel(0, 0).0, [178, 0, 0]);
    }

    #[test]
    fn short_buffer_is_an_error() {
        let raw = vec![0u8; 10];
        assert!(yuyv_to_rgb(&raw, 4, 4).is_err());
    }

    #[test]
    fn oversized_buffer_is_tolerated() {
        let mut raw = vec![128u8; 2 * 2 * 2];
        raw.extend_from_slice(&[0u8; 64]);
        let img = yuyv_to_rgb(&raw, 2, 2).unwrap();
        assert_eq!(img.dimensions(), (2, 2));
    }

    #[test]
    fn encode_produces_jpeg_magic() {
        let img = RgbImage::from_pixel(8, 8, image::Rgb([10, 20, 30]));
        let jpeg = encode_jpeg(&img, 80).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }
}
