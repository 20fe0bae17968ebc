/// 视频输入 (Video Input)
///
/// 独立工作线程, 负责输入流解码
/// - probe: ffprobe 探测尺寸与帧率
/// - Decoder: RTMP/RTSP 拉流解码线程
/// - DecodeFilter: 帧拷贝与投递 (队列满时丢帧或阻塞)
pub mod decode_filter;
pub mod decoder;
pub mod probe;

pub use decode_filter::{CaptureStats, DecodeFilter, DecodedFrame};
pub use decoder::Decoder;
pub use probe::{parse_frame_rate, probe_stream, StreamInfo};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}: {message}")]
    Open { uri: String, message: String },
    #[error("video source {uri:?} failed: {message}")]
    Stream { uri: String, message: String },
    #[error("failed to probe {uri:?}: {message}")]
    Probe { uri: String, message: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
