//! ffmpeg 子进程推流
//!
//! 原始 RGB24 帧写入 ffmpeg 的 stdin, 由 ffmpeg 编码为 H.264 并推送到输出地址

use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::EncoderConfig;

/// 写入管道的像素格式
pub const PIPE_PIX_FMT: &str = "rgb24";

#[derive(Debug, Error)]
pub enum EncoderError {
    #[error("failed to start encoder {program:?}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("frame has {got} bytes, encoder expects {expected}")]
    FrameSize { expected: usize, got: usize },
    #[error("encoder process exited ({status})")]
    Exited { status: String },
    #[error("encoder pipe is closed")]
    Closed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// 输出封装格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputContainer {
    /// rtmp:// → flv
    Flv,
    /// rtsp:// → rtsp (tcp)
    Rtsp,
    /// srt:// udp:// → mpegts
    MpegTs,
    /// 由输出文件扩展名推断
    Auto,
}

impl OutputContainer {
    pub fn for_url(url: &str) -> Self {
        let lower = url.to_ascii_lowercase();
        let scheme = lower.split("://").next().unwrap_or_default();
        if !lower.contains("://") {
            return OutputContainer::Auto;
        }
        match scheme {
            "rtmp" | "rtmps" => OutputContainer::Flv,
            "rtsp" | "rtsps" => OutputContainer::Rtsp,
            "srt" | "udp" | "tcp" => OutputContainer::MpegTs,
            _ => OutputContainer::Auto,
        }
    }

    fn args(&self) -> &'static [&'static str] {
        match self {
            OutputContainer::Flv => &["-f", "flv"],
            OutputContainer::Rtsp => &["-rtsp_transport", "tcp", "-f", "rtsp"],
            OutputContainer::MpegTs => &["-f", "mpegts"],
            OutputContainer::Auto => &[],
        }
    }
}

/// ffmpeg 推流命令
#[derive(Debug, Clone)]
pub struct EncoderCommand {
    pub program: PathBuf,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub output: String,
    pub options: EncoderConfig,
}

impl EncoderCommand {
    pub fn new(
        program: impl AsRef<Path>,
        width: u32,
        height: u32,
        fps: f64,
        output: &str,
        options: &EncoderConfig,
    ) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            width,
            height,
            fps,
            output: output.to_string(),
            options: options.clone(),
        }
    }

    pub fn container(&self) -> OutputContainer {
        OutputContainer::for_url(&self.output)
    }

    pub fn frame_bytes(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }

    /// 完整参数列表 (不含程序名)
    pub fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            self.options.loglevel.clone(),
            "-y".into(),
            "-an".into(),
            // 输入: stdin 原始帧
            "-f".into(),
            "rawvideo".into(),
            "-vcodec".into(),
            "rawvideo".into(),
            "-pix_fmt".into(),
            PIPE_PIX_FMT.into(),
            "-s".into(),
            format!("{}x{}", self.width, self.height),
            "-r".into(),
            format_fps(self.fps),
            "-i".into(),
            "-".into(),
            // 输出: H.264
            "-tune".into(),
            self.options.tune.clone(),
            "-c:v".into(),
            self.options.codec.clone(),
            "-pix_fmt".into(),
            self.options.output_pix_fmt.clone(),
            "-preset".into(),
            self.options.preset.clone(),
        ];
        args.extend(self.container().args().iter().map(|s| s.to_string()));
        args.push(self.output.clone());
        args
    }

    pub fn spawn(&self) -> Result<FfmpegEncoder, EncoderError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.args());
        info!(
            "encoder: {} {}x{}@{} → {}",
            self.program.display(),
            self.width,
            self.height,
            format_fps(self.fps),
            self.output
        );
        debug!("encoder args: {:?}", self.args());
        FfmpegEncoder::from_command(cmd, self.width, self.height).map_err(|e| match e {
            EncoderError::Io(source) => EncoderError::Spawn {
                program: self.program.clone(),
                source,
            },
            other => other,
        })
    }
}

/// "25", "29.97"
fn format_fps(fps: f64) -> String {
    let s = format!("{:.3}", fps);
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}

/// 运行中的推流进程
pub struct FfmpegEncoder {
    child: Child,
    stdin: Option<ChildStdin>,
    width: u32,
    height: u32,
    frame_bytes: usize,
    frames_written: u64,
}

impl FfmpegEncoder {
    pub fn from_command(mut cmd: Command, width: u32, height: u32) -> Result<Self, EncoderError> {
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()?;
        let stdin = child.stdin.take().ok_or(EncoderError::Closed)?;
        Ok(Self {
            child,
            stdin: Some(stdin),
            width,
            height,
            frame_bytes: width as usize * height as usize * 3,
            frames_written: 0,
        })
    }

    /// 推流尺寸 (宽, 高)
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// 写入一帧 (长度必须为 W*H*3)
    pub fn write_frame(&mut self, frame: &[u8]) -> Result<(), EncoderError> {
        if frame.len() != self.frame_bytes {
            return Err(EncoderError::FrameSize {
                expected: self.frame_bytes,
                got: frame.len(),
            });
        }
        let stdin = self.stdin.as_mut().ok_or(EncoderError::Closed)?;
        match stdin.write_all(frame) {
            Ok(()) => {
                self.frames_written += 1;
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                self.stdin = None;
                Err(self.exit_error())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn exit_error(&mut self) -> EncoderError {
        let status = match self.child.wait() {
            Ok(status) => describe(status),
            Err(e) => e.to_string(),
        };
        EncoderError::Exited { status }
    }

    /// 关闭 stdin 并等待进程退出, 超时则强制结束
    pub fn finish(mut self, timeout: Duration) -> Result<(), EncoderError> {
        self.stdin = None;
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.child.try_wait()? {
                info!(
                    "encoder exited ({}) after {} frames",
                    describe(status),
                    self.frames_written
                );
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!("encoder did not exit within {:?}, killing it", timeout);
                self.child.kill()?;
                self.child.wait()?;
                return Ok(());
            }
            thread::sleep(Duration::from_millis(50));
        }
    }
}

impl Drop for FfmpegEncoder {
    fn drop(&mut self) {
        self.stdin = None;
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

fn describe(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit code {code}"),
        None => status.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(output: &str) -> EncoderCommand {
        EncoderCommand::new("ffmpeg", 1280, 720, 25.0, output, &EncoderConfig::default())
    }

    #[test]
    fn rtmp_output_uses_flv() {
        let args = command("rtmp://localhost:1935/output/stream").args();
        let tail: Vec<&str> = args.iter().rev().take(3).map(|s| s.as_str()).collect();
        assert_eq!(tail, vec!["rtmp://localhost:1935/output/stream", "flv", "-f"]);
        assert!(args.windows(2).any(|w| w[0] == "-s" && w[1] == "1280x720"));
        assert!(args.windows(2).any(|w| w[0] == "-r" && w[1] == "25"));
        assert!(args.windows(2).any(|w| w[0] == "-pix_fmt" && w[1] == "rgb24"));
        assert!(args.windows(2).any(|w| w[0] == "-c:v" && w[1] == "libx264"));
        assert!(args.windows(2).any(|w| w[0] == "-preset" && w[1] == "ultrafast"));
        assert!(args.windows(2).any(|w| w[0] == "-tune" && w[1] == "zerolatency"));
    }

    #[test]
    fn rtsp_output_forces_tcp() {
        let args = command("rtsp://localhost:8554/out").args();
        let n = args.len();
        assert_eq!(
            &args[n - 5..],
            &["-rtsp_transport", "tcp", "-f", "rtsp", "rtsp://localhost:8554/out"]
        );
    }

    #[test]
    fn container_by_scheme() {
        assert_eq!(OutputContainer::for_url("RTMP://a/b"), OutputContainer::Flv);
        assert_eq!(OutputContainer::for_url("srt://a:9000"), OutputContainer::MpegTs);
        assert_eq!(OutputContainer::for_url("out.mp4"), OutputContainer::Auto);
        assert_eq!(OutputContainer::for_url("/tmp/out.flv"), OutputContainer::Auto);
    }

    #[test]
    fn file_output_has_no_format_flag() {
        let args = command("out.mp4").args();
        assert_eq!(args.last().map(String::as_str), Some("out.mp4"));
        assert_ne!(args[args.len() - 2], "flv");
    }

    #[test]
    fn fractional_fps_is_kept() {
        assert_eq!(format_fps(29.97002997), "29.97");
        assert_eq!(format_fps(30.0), "30");
        assert_eq!(format_fps(12.5), "12.5");
    }

    #[test]
    fn frame_bytes_is_rgb24() {
        assert_eq!(command("x.mp4").frame_bytes(), 1280 * 720 * 3);
    }

    #[cfg(unix)]
    #[test]
    fn writes_frames_to_child_stdin() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "cat > /dev/null"]);
        let mut encoder = FfmpegEncoder::from_command(cmd, 2, 1).unwrap();
        encoder.write_frame(&[0; 6]).unwrap();
        encoder.write_frame(&[1; 6]).unwrap();
        assert_eq!(encoder.frames_written(), 2);
        assert!(matches!(
            encoder.write_frame(&[0; 5]),
            Err(EncoderError::FrameSize { expected: 6, got: 5 })
        ));
        encoder.finish(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn missing_program_fails_to_spawn() {
        let mut cmd = command("out.mp4");
        cmd.program = PathBuf::from("/no/such/ffmpeg");
        assert!(matches!(cmd.spawn(), Err(EncoderError::Spawn { .. })));
    }
}
