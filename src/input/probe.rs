//! ffprobe 流信息探测

use std::path::Path;
use std::process::{Child, Command, Output, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::{debug, warn};

use super::decoder::is_rtsp;
use super::CaptureError;

/// 输入流的视频参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    /// 0 表示未知
    pub fps: f64,
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: String,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
}

/// 用 ffprobe 读取第一个视频流的尺寸与帧率
///
/// 输入端尚未推流时 ffprobe 会一直等待, 超时或 shutdown 置位时终止进程
pub fn probe_stream(
    ffprobe: &Path,
    url: &str,
    timeout: Duration,
    shutdown: &AtomicBool,
) -> Result<StreamInfo, CaptureError> {
    let probe_err = |message: String| CaptureError::Probe {
        uri: url.to_string(),
        message,
    };

    let child = Command::new(ffprobe)
        .args(probe_args(url, timeout))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| probe_err(e.to_string()))?;

    let output = wait_with_deadline(child, timeout, shutdown)
        .map_err(|e| probe_err(e.to_string()))?
        .ok_or_else(|| probe_err(format!("no answer within {:?}", timeout)))?;

    if !output.status.success() {
        return Err(probe_err(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }

    parse_probe_output(&output.stdout).ok_or_else(|| probe_err("no video stream found".to_string()))
}

/// ffprobe 参数; 只输出第一个视频流的必要字段
fn probe_args(url: &str, timeout: Duration) -> Vec<String> {
    let micros = timeout.as_micros().to_string();
    let mut args: Vec<String> = [
        "-v",
        "error",
        "-print_format",
        "json",
        "-select_streams",
        "v:0",
        "-show_entries",
        "stream=codec_type,width,height,r_frame_rate,avg_frame_rate",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    // 套接字读写超时 (微秒)
    if is_rtsp(url) {
        args.extend(["-rtsp_transport".to_string(), "tcp".to_string()]);
        args.extend(["-timeout".to_string(), micros]);
    } else {
        args.extend(["-rw_timeout".to_string(), micros]);
    }
    args.push(url.to_string());
    args
}

/// 等待子进程退出, 超时或 shutdown 时杀掉进程并返回 None
fn wait_with_deadline(
    mut child: Child,
    timeout: Duration,
    shutdown: &AtomicBool,
) -> std::io::Result<Option<Output>> {
    let deadline = Instant::now() + timeout;
    loop {
        if child.try_wait()?.is_some() {
            return child.wait_with_output().map(Some);
        }
        if Instant::now() >= deadline || shutdown.load(Ordering::Relaxed) {
            warn!("ffprobe did not finish, killing it");
            child.kill()?;
            child.wait()?;
            return Ok(None);
        }
        thread::sleep(Duration::from_millis(50));
    }
}

fn parse_probe_output(json: &[u8]) -> Option<StreamInfo> {
    let probe: FfprobeOutput = match serde_json::from_slice(json) {
        Ok(probe) => probe,
        Err(e) => {
            debug!("ffprobe output is not valid json: {e}");
            return None;
        }
    };
    let video = probe.streams.iter().find(|s| s.codec_type == "video")?;

    // avg_frame_rate 在直播流中常为 0/0, 回退到 r_frame_rate
    let fps = [&video.avg_frame_rate, &video.r_frame_rate]
        .into_iter()
        .flatten()
        .filter_map(|r| parse_frame_rate(r))
        .find(|fps| *fps > 0.0)
        .unwrap_or(0.0);

    Some(StreamInfo {
        width: video.width.unwrap_or(0),
        height: video.height.unwrap_or(0),
        fps,
    })
}

/// 解析 "30000/1001" 或 "25" 形式的帧率
pub fn parse_frame_rate(rate: &str) -> Option<f64> {
    let rate = rate.trim();
    match rate.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                None
            } else {
                Some(num / den)
            }
        }
        None => rate.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fractional_rates() {
        assert_eq!(parse_frame_rate("25/1"), Some(25.0));
        assert!((parse_frame_rate("30000/1001").unwrap() - 29.97).abs() < 0.01);
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate("15"), Some(15.0));
        assert_eq!(parse_frame_rate("abc"), None);
    }

    #[test]
    fn picks_first_video_stream() {
        let json = br#"{"streams": [
            {"codec_type": "audio", "r_frame_rate": "0/0"},
            {"codec_type": "video", "width": 1280, "height": 720,
             "avg_frame_rate": "0/0", "r_frame_rate": "30/1"}
        ]}"#;
        let info = parse_probe_output(json).unwrap();
        assert_eq!(info.width, 1280);
        assert_eq!(info.height, 720);
        assert_eq!(info.fps, 30.0);
    }

    #[test]
    fn unknown_rate_is_zero() {
        let json = br#"{"streams": [{"codec_type": "video", "width": 640, "height": 480}]}"#;
        assert_eq!(parse_probe_output(json).unwrap().fps, 0.0);
    }

    #[test]
    fn rtsp_ffprobe_uses_tcp_in_any_case() {
        let args = probe_args("RTSP://cam/1", Duration::from_secs(5));
        assert!(args.windows(2).any(|w| w == ["-rtsp_transport", "tcp"]));
        assert!(args.windows(2).any(|w| w == ["-timeout", "5000000"]));
        assert_eq!(args.last().map(String::as_str), Some("RTSP://cam/1"));
    }

    #[test]
    fn rtmp_ffprobe_has_read_timeout() {
        let args = probe_args("rtmp://localhost/live", Duration::from_millis(1500));
        assert!(args.windows(2).any(|w| w == ["-rw_timeout", "1500000"]));
        assert!(!args.iter().any(|a| a == "-rtsp_transport"));
    }

    #[cfg(unix)]
    #[test]
    fn hung_ffprobe_is_killed_at_deadline() {
        let child = Command::new("sleep")
            .arg("30")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();
        let started = Instant::now();
        let shutdown = AtomicBool::new(false);
        let output = wait_with_deadline(child, Duration::from_millis(200), &shutdown).unwrap();
        assert!(output.is_none());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[test]
    fn shutdown_stops_waiting_for_ffprobe() {
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let shutdown = AtomicBool::new(true);
        let output = wait_with_deadline(child, Duration::from_secs(30), &shutdown).unwrap();
        assert!(output.is_none());
    }

    #[cfg(unix)]
    #[test]
    fn finished_ffprobe_returns_output() {
        let child = Command::new("sh")
            .args(["-c", "echo '{}'"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();
        let shutdown = AtomicBool::new(false);
        let output = wait_with_deadline(child, Duration::from_secs(10), &shutdown)
            .unwrap()
            .unwrap();
        assert!(output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "{}");
    }

    #[test]
    fn audio_only_has_no_info() {
        let json = br#"{"streams": [{"codec_type": "audio"}]}"#;
        assert!(parse_probe_output(json).is_none());
        assert!(parse_probe_output(b"garbage").is_none());
    }
}
