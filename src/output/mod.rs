/// 输出 (Output)
///
/// - encoder: ffmpeg 子进程推流 (RTMP/RTSP/SRT/文件)
/// - detection_log: 检测结果 CSV
pub mod detection_log;
pub mod encoder;

pub use detection_log::{format_percent, frame_timecode, DetectionLog};
pub use encoder::{EncoderCommand, EncoderError, FfmpegEncoder, OutputContainer};
