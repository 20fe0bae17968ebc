/// FFmpeg解码过滤器模块
/// FFmpeg decode filter module
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{Sender, TrySendError};
use ez_ffmpeg::filter::frame_filter::FrameFilter;
use ez_ffmpeg::filter::frame_filter_context::FrameFilterContext;
use ez_ffmpeg::{AVMediaType, Frame};
use tracing::{debug, info, warn};

/// 解码后的一帧 (packed RGB24, 无行填充)
#[derive(Clone, Debug)]
pub struct DecodedFrame {
    pub rgb_data: Arc<Vec<u8>>,
    pub width: u32,
    pub height: u32,
    /// 从 1 开始的帧序号
    pub frame_id: u64,
    pub decode_fps: f64,
}

/// 解码线程与检测线程共享的计数
#[derive(Debug, Default)]
pub struct CaptureStats {
    pub decoded: AtomicU64,
    /// 队列满时丢弃的帧
    pub dropped: AtomicU64,
    /// 空帧/损坏帧
    pub corrupt: AtomicU64,
}

impl CaptureStats {
    pub fn decoded(&self) -> u64 {
        self.decoded.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn corrupt(&self) -> u64 {
        self.corrupt.load(Ordering::Relaxed)
    }
}

/// FFmpeg解码过滤器: 输入流 → RGB24帧 → 检测队列
pub struct DecodeFilter {
    tx: Sender<DecodedFrame>,
    shutdown: Arc<AtomicBool>,
    stats: Arc<CaptureStats>,
    /// true: 队列满时丢帧; false: 阻塞等待检测线程
    drop_when_busy: bool,
    frame_id: u64,
    count: usize,
    last: Instant,
    current_fps: f64,
}

impl DecodeFilter {
    pub fn new(
        tx: Sender<DecodedFrame>,
        shutdown: Arc<AtomicBool>,
        stats: Arc<CaptureStats>,
        drop_when_busy: bool,
    ) -> Self {
        Self {
            tx,
            shutdown,
            stats,
            drop_when_busy,
            frame_id: 0,
            count: 0,
            last: Instant::now(),
            current_fps: 0.0,
        }
    }

    fn update_fps(&mut self) {
        self.count += 1;
        let elapsed = self.last.elapsed().as_secs_f64();
        if elapsed >= 1.0 {
            self.current_fps = self.count as f64 / elapsed;
            debug!(
                "decode: {:.1}fps total={} dropped={}",
                self.current_fps,
                self.stats.decoded(),
                self.stats.dropped()
            );
            self.last = Instant::now();
            self.count = 0;
        }
    }

    /// 投递到检测队列, 返回 false 表示消费端已退出
    fn deliver(&self, decoded: DecodedFrame) -> bool {
        if self.drop_when_busy {
            match self.tx.try_send(decoded) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    true
                }
                Err(TrySendError::Disconnected(_)) => false,
            }
        } else {
            self.tx.send(decoded).is_ok()
        }
    }
}

/// 按行拷贝, 去掉 linesize 带来的行尾填充
pub fn copy_packed_rows(
    src: &[u8],
    stride: usize,
    row_bytes: usize,
    height: usize,
) -> Option<Vec<u8>> {
    if stride < row_bytes || src.len() < stride * height.saturating_sub(1) + row_bytes {
        return None;
    }
    let mut out = Vec::with_capacity(row_bytes * height);
    for row in src.chunks(stride).take(height) {
        out.extend_from_slice(&row[..row_bytes]);
    }
    Some(out)
}

impl FrameFilter for DecodeFilter {
    fn media_type(&self) -> AVMediaType {
        AVMediaType::AVMEDIA_TYPE_VIDEO
    }

    fn init(&mut self, _ctx: &FrameFilterContext) -> Result<(), String> {
        info!("decode thread started");
        Ok(())
    }

    fn filter_frame(
        &mut self,
        frame: Frame,
        _ctx: &FrameFilterContext,
    ) -> Result<Option<Frame>, String> {
        if self.shutdown.load(Ordering::Relaxed) {
            return Err("shutdown requested".to_string());
        }

        // SAFETY: 仅读取 frame 自身持有的指针与字段
        if unsafe { frame.as_ptr().is_null() || frame.is_empty() } || frame.is_corrupt() {
            self.stats.corrupt.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        // SAFETY: 指针非空, 且在 filter_frame 期间由 frame 持有
        let (width, height, plane, stride) = unsafe {
            let raw = &*frame.as_ptr();
            (raw.width, raw.height, raw.data[0], raw.linesize[0])
        };
        if width <= 0 || height <= 0 || plane.is_null() || stride <= 0 {
            self.stats.corrupt.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        let (w, h, stride) = (width as usize, height as usize, stride as usize);
        let row_bytes = w * 3;
        // SAFETY: format=rgb24 时第 0 平面共 h 行, 行间距 stride
        let src = unsafe { std::slice::from_raw_parts(plane, stride * (h - 1) + row_bytes) };
        let rgb = match copy_packed_rows(src, stride, row_bytes, h) {
            Some(rgb) => rgb,
            None => {
                warn!("unexpected frame layout {}x{} stride {}", w, h, stride);
                self.stats.corrupt.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
        };

        self.frame_id += 1;
        self.stats.decoded.fetch_add(1, Ordering::Relaxed);
        self.update_fps();

        let decoded = DecodedFrame {
            rgb_data: Arc::new(rgb),
            width: width as u32,
            height: height as u32,
            frame_id: self.frame_id,
            decode_fps: self.current_fps,
        };

        if !self.deliver(decoded) {
            return Err("frame consumer disconnected".to_string());
        }

        Ok(Some(frame))
    }

    fn uninit(&mut self, _ctx: &FrameFilterContext) {
        info!(
            "decode thread exited: decoded={} dropped={} corrupt={}",
            self.stats.decoded(),
            self.stats.dropped(),
            self.stats.corrupt()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    #[test]
    fn strips_row_padding() {
        // 2x2 rgb, stride 8 (2 bytes padding)
        let src = [
            1, 2, 3, 4, 5, 6, 0, 0, //
            7, 8, 9, 10, 11, 12, 0, 0,
        ];
        let out = copy_packed_rows(&src, 8, 6, 2).unwrap();
        assert_eq!(out, vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]);
    }

    #[test]
    fn rejects_short_buffers() {
        assert!(copy_packed_rows(&[0; 10], 8, 6, 2).is_none());
        assert!(copy_packed_rows(&[0; 16], 4, 6, 2).is_none());
    }

    #[test]
    fn last_row_may_omit_padding() {
        let src = [1, 2, 3, 0, 4, 5, 6];
        assert_eq!(copy_packed_rows(&src, 4, 3, 2).unwrap(), vec![1, 2, 3, 4, 5, 6]);
    }

    fn frame(id: u64) -> DecodedFrame {
        DecodedFrame {
            rgb_data: Arc::new(vec![0; 3]),
            width: 1,
            height: 1,
            frame_id: id,
            decode_fps: 0.0,
        }
    }

    #[test]
    fn full_queue_counts_drops() {
        let (tx, rx) = bounded(1);
        let stats = Arc::new(CaptureStats::default());
        let filter = DecodeFilter::new(tx, Arc::new(AtomicBool::new(false)), stats.clone(), true);
        assert!(filter.deliver(frame(1)));
        assert!(filter.deliver(frame(2)));
        assert_eq!(stats.dropped(), 1);
        assert_eq!(rx.try_recv().unwrap().frame_id, 1);
    }

    #[test]
    fn disconnected_consumer_stops_delivery() {
        let (tx, rx) = bounded(1);
        drop(rx);
        let filter = DecodeFilter::new(
            tx,
            Arc::new(AtomicBool::new(false)),
            Arc::new(CaptureStats::default()),
            false,
        );
        assert!(!filter.deliver(frame(1)));
    }
}
