/// 输入流拉流解码器
/// Pulls RTMP/RTSP input through the FFmpeg libraries and feeds RGB24 frames to the detector
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver};
use ez_ffmpeg::core::context::null_output::create_null_output;
use ez_ffmpeg::filter::frame_pipeline_builder::FramePipelineBuilder;
use ez_ffmpeg::{AVMediaType, FfmpegContext, Input};
use tracing::{info, warn};

use super::decode_filter::{CaptureStats, DecodeFilter, DecodedFrame};
use super::CaptureError;
use crate::config::CaptureConfig;

/// 解码线程句柄
pub struct Decoder {
    url: String,
    frames: Receiver<DecodedFrame>,
    stats: Arc<CaptureStats>,
    handle: Option<JoinHandle<Result<(), CaptureError>>>,
}

impl Decoder {
    /// 启动解码线程; 流结束或 shutdown 置位后 frames 通道关闭
    pub fn spawn(
        url: &str,
        capture: &CaptureConfig,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self, CaptureError> {
        let (tx, rx) = bounded(capture.queue_size.max(1));
        let stats = Arc::new(CaptureStats::default());
        let filter = DecodeFilter::new(tx, shutdown.clone(), stats.clone(), capture.drop_when_busy);

        let thread_url = url.to_string();
        let transport = capture.rtsp_transport.clone();
        let handle = thread::Builder::new()
            .name("decoder".to_string())
            .spawn(move || decode(&thread_url, &transport, filter, &shutdown))
            .map_err(|e| CaptureError::Other(e.into()))?;

        info!("📹 stream: {}", url);
        Ok(Self {
            url: url.to_string(),
            frames: rx,
            stats,
            handle: Some(handle),
        })
    }

    pub fn frames(&self) -> &Receiver<DecodedFrame> {
        &self.frames
    }

    pub fn stats(&self) -> &CaptureStats {
        &self.stats
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// 断开帧通道并等待解码线程退出
    ///
    /// 网络阻塞时解码线程可能迟迟不退出, 超时后不再等待
    pub fn stop(self, timeout: Duration) -> Result<(), CaptureError> {
        let Self { frames, handle, .. } = self;
        drop(frames);
        let Some(handle) = handle else {
            return Ok(());
        };
        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                warn!("decoder thread did not exit within {:?}, detaching", timeout);
                return Ok(());
            }
            thread::sleep(Duration::from_millis(20));
        }
        match handle.join() {
            Ok(result) => result,
            Err(_) => Err(CaptureError::Other(anyhow::anyhow!("decoder thread panicked"))),
        }
    }
}

/// 按协议选择拉流参数
fn build_input(url: &str, transport: &str) -> Input {
    if is_rtsp(url) {
        Input::new(url).set_input_opts(
            [
                ("rtsp_transport", transport),
                ("buffer_size", "67108864"),
                ("fflags", "nobuffer"),
                ("flags", "low_delay"),
            ]
            .into(),
        )
    } else {
        Input::new(url).set_input_opts([("fflags", "nobuffer"), ("flags", "low_delay")].into())
    }
}

pub fn is_rtsp(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    lower.starts_with("rtsp://") || lower.starts_with("rtsps://")
}

fn decode(
    url: &str,
    transport: &str,
    filter: DecodeFilter,
    shutdown: &AtomicBool,
) -> Result<(), CaptureError> {
    let pipe: FramePipelineBuilder = AVMediaType::AVMEDIA_TYPE_VIDEO.into();
    let pipe = pipe.filter("decode", Box::new(filter));
    let out = create_null_output().add_frame_pipeline(pipe);

    let ctx = FfmpegContext::builder()
        .input(build_input(url, transport))
        .filter_desc("format=rgb24")
        .output(out)
        .build()
        .map_err(|e| CaptureError::Open {
            uri: url.to_string(),
            message: e.to_string(),
        })?;

    let sch = ctx.start().map_err(|e| CaptureError::Open {
        uri: url.to_string(),
        message: e.to_string(),
    })?;

    let result = sch.wait();
    if shutdown.load(Ordering::Relaxed) {
        info!("decoder stopped");
        return Ok(());
    }
    match result {
        Ok(_) => {
            info!("stream ended: {}", url);
            Ok(())
        }
        Err(e) => {
            warn!("decoder exited with error: {}", e);
            Err(CaptureError::Stream {
                uri: url.to_string(),
                message: e.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_rtsp_urls() {
        assert!(is_rtsp("rtsp://cam/1"));
        assert!(is_rtsp("RTSPS://cam/1"));
        assert!(!is_rtsp("rtmp://localhost:1935/obs/stream"));
        assert!(!is_rtsp("video.mp4"));
    }
}
