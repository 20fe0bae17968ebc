/// 视频处理流水线 (Video Processing Pipeline)
///
/// 两线程架构, 通过有界通道通信:
/// - Decoder: 拉流解码 (独立线程)
/// - Relay:   检测 → 绘制 → CSV → 推流 (调用线程)
///
/// 预览窗口 (可选) 通过容量为 1 的通道只取最新帧
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{RecvTimeoutError, Sender, TrySendError};
use image::{imageops, DynamicImage, RgbImage};
use tracing::{debug, info, warn};

use crate::annotate::Annotator;
use crate::config::{check_model_path, resolve_executable, resolve_ffmpeg_path};
use crate::input::{probe_stream, DecodedFrame, Decoder};
use crate::output::{frame_timecode, DetectionLog, EncoderCommand, FfmpegEncoder};
use crate::{check_font, DetectionResult, Model, RelayArgs, RelayConfig, YOLOv8};

/// 解码线程退出的最长等待时间
const DECODER_JOIN_TIMEOUT: Duration = Duration::from_secs(3);

/// 发往预览窗口的帧 (RGBA)
#[derive(Clone, Debug)]
pub struct PreviewFrame {
    pub rgba: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub detections: usize,
}

/// 运行结束后的统计
#[derive(Debug, Clone, Default)]
pub struct RelaySummary {
    pub frames: u64,
    pub detections: u64,
    pub dropped: u64,
}

/// 拉流 → 检测 → 推流
pub struct Relay {
    args: RelayArgs,
    config: RelayConfig,
    ffmpeg: PathBuf,
    model: YOLOv8,
    annotator: Annotator,
}

impl Relay {
    /// 检查路径并加载模型与字体
    pub fn new(args: RelayArgs, config: RelayConfig) -> Result<Self> {
        let ffmpeg = resolve_ffmpeg_path(&args.ffmpeg_path)?;
        check_model_path(&args.yolo_model_path)?;

        let model = YOLOv8::new(args.model_args())?;
        model.summary();

        let label_map = match args.model_name.as_deref() {
            Some(name) => match config.label_map(name) {
                Some(map) => Some(map.clone()),
                None => {
                    warn!("no label map for model '{}', using class names", name);
                    None
                }
            },
            None => None,
        };

        let font = check_font(args.font.as_deref(), "Arial.ttf")?;
        let annotator = Annotator::new(model.names(), label_map, font);

        Ok(Self {
            args,
            config,
            ffmpeg,
            model,
            annotator,
        })
    }

    /// 主循环, 直到流结束、shutdown 置位或推流失败
    pub fn run(
        &mut self,
        shutdown: Arc<AtomicBool>,
        preview: Option<Sender<PreviewFrame>>,
    ) -> Result<RelaySummary> {
        let fps = self.output_fps(&shutdown);
        info!("output fps: {}", fps);
        if shutdown.load(Ordering::Relaxed) {
            info!("shutdown requested before start");
            return Ok(RelaySummary::default());
        }

        let mut log = if self.args.write_csv {
            Some(DetectionLog::create(&self.args.csv_path)?)
        } else {
            None
        };

        let decoder = Decoder::spawn(&self.args.input_stream, &self.config.capture, shutdown.clone())
            .map_err(anyhow::Error::from)?;

        let mut state = RunState {
            fps,
            encoder: None,
            preview,
            summary: RelaySummary::default(),
            stats_count: 0,
            stats_infer: Duration::ZERO,
            stats_last: Instant::now(),
        };
        let result = self.relay_frames(&decoder, &shutdown, &mut state, log.as_mut());

        // 清理: 解码 → 推流 → CSV
        shutdown.store(true, Ordering::Relaxed);
        state.summary.dropped = decoder.stats().dropped();
        info!("stopping decoder: {}", decoder.url());
        let decoded = decoder.stop(DECODER_JOIN_TIMEOUT);
        if let Some(encoder) = state.encoder.take() {
            let timeout = Duration::from_millis(self.config.encoder.shutdown_timeout_ms);
            if let Err(e) = encoder.finish(timeout) {
                warn!("encoder shutdown: {}", e);
            }
        }
        if let Some(log) = log.take() {
            log.finish()?;
        }

        result?;
        decoded?;
        info!(
            "relay finished: frames={} detections={} dropped={}",
            state.summary.frames, state.summary.detections, state.summary.dropped
        );
        Ok(state.summary)
    }

    /// 输出帧率: --fps > ffprobe > 配置默认值
    fn output_fps(&self, shutdown: &AtomicBool) -> f64 {
        if let Some(fps) = self.args.fps.filter(|fps| *fps > 0.0) {
            return fps;
        }
        resolve_fps(None, self.probe_fps(shutdown), self.config.capture.default_fps)
    }

    fn probe_fps(&self, shutdown: &AtomicBool) -> Option<f64> {
        let ffprobe = match resolve_executable(&self.config.capture.ffprobe_path, "ffprobe") {
            Ok(path) => path,
            Err(e) => {
                warn!("ffprobe unavailable: {e:#}");
                return None;
            }
        };
        let timeout = Duration::from_millis(self.config.capture.probe_timeout_ms);
        match probe_stream(&ffprobe, &self.args.input_stream, timeout, shutdown) {
            Ok(info) => {
                info!("probed input: {}x{} @ {:.2}fps", info.width, info.height, info.fps);
                Some(info.fps)
            }
            Err(e) => {
                warn!("{}", e);
                None
            }
        }
    }

    fn relay_frames(
        &mut self,
        decoder: &Decoder,
        shutdown: &AtomicBool,
        state: &mut RunState,
        mut log: Option<&mut DetectionLog>,
    ) -> Result<()> {
        loop {
            if shutdown.load(Ordering::Relaxed) {
                info!("shutdown requested");
                return Ok(());
            }
            let frame = match decoder.frames().recv_timeout(Duration::from_millis(200)) {
                Ok(frame) => frame,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    info!("stream ended");
                    return Ok(());
                }
            };
            self.relay_frame(frame, state, log.as_deref_mut())?;
            state.report(decoder);
        }
    }

    fn relay_frame(
        &mut self,
        frame: DecodedFrame,
        state: &mut RunState,
        log: Option<&mut DetectionLog>,
    ) -> Result<()> {
        let frame_id = frame.frame_id;
        let mut img = frame_to_image(frame)?;

        // 首帧: 按帧尺寸启动推流
        if state.encoder.is_none() {
            info!("model loaded, starting detection ({}x{})", img.width(), img.height());
            let cmd = EncoderCommand::new(
                &self.ffmpeg,
                img.width(),
                img.height(),
                state.fps,
                &self.args.output_stream,
                &self.config.encoder,
            );
            state.encoder = Some(cmd.spawn()?);
        }
        let encoder = state
            .encoder
            .as_mut()
            .ok_or_else(|| anyhow!("encoder is not running"))?;

        // 中途分辨率变化时缩放回推流尺寸
        let (ew, eh) = encoder.size();
        if (img.width(), img.height()) != (ew, eh) {
            debug!("frame {} resized {}x{} → {}x{}", frame_id, img.width(), img.height(), ew, eh);
            img = imageops::resize(&img, ew, eh, imageops::FilterType::Triangle);
        }

        // 推理
        let t = Instant::now();
        let xs0 = [DynamicImage::ImageRgb8(img)];
        let xs = self.model.preprocess(&xs0)?;
        let t_pre = t.elapsed();
        let t = Instant::now();
        let ys = self.model.run(xs)?;
        let t_run = t.elapsed();
        let t = Instant::now();
        let detections = self
            .model
            .postprocess(ys, &xs0)?
            .into_iter()
            .next()
            .unwrap_or_default();
        let t_post = t.elapsed();
        if self.args.profile {
            info!(
                "[frame {}] pre: {:?} infer: {:?} post: {:?}",
                frame_id, t_pre, t_run, t_post
            );
        }
        state.stats_infer += t_pre + t_run + t_post;

        let [x0] = xs0;
        let mut img = x0.into_rgb8();

        // CSV 时间码按已处理帧数计算
        state.summary.frames += 1;
        state.summary.detections += detections.len() as u64;
        if let Some(log) = log {
            let timestamp = frame_timecode(state.summary.frames, state.fps);
            log.log_detections(&timestamp, detections.bboxes(), self.model.names())?;
        }
        log_detections(frame_id, &detections, &self.annotator);

        self.annotator.annotate(&mut img, &detections);

        encoder
            .write_frame(img.as_raw())
            .context("failed to write frame to encoder")?;

        state.send_preview(&img, detections.len());
        Ok(())
    }
}

struct RunState {
    fps: f64,
    encoder: Option<FfmpegEncoder>,
    preview: Option<Sender<PreviewFrame>>,
    summary: RelaySummary,
    stats_count: u32,
    stats_infer: Duration,
    stats_last: Instant,
}

impl RunState {
    /// 每秒一次吞吐统计
    fn report(&mut self, decoder: &Decoder) {
        self.stats_count += 1;
        let elapsed = self.stats_last.elapsed();
        if elapsed >= Duration::from_secs(1) {
            let fps = self.stats_count as f64 / elapsed.as_secs_f64();
            let infer_ms = self.stats_infer.as_secs_f64() * 1000.0 / self.stats_count as f64;
            info!(
                "relay: {:.1}fps | infer {:.1}ms | decoded {} | dropped {} | pushed {}",
                fps,
                infer_ms,
                decoder.stats().decoded(),
                decoder.stats().dropped(),
                self.encoder.as_ref().map_or(0, FfmpegEncoder::frames_written)
            );
            self.stats_count = 0;
            self.stats_infer = Duration::ZERO;
            self.stats_last = Instant::now();
        }
    }

    /// 只保留最新一帧, 窗口关闭后停止发送
    fn send_preview(&mut self, img: &RgbImage, detections: usize) {
        let Some(tx) = self.preview.as_ref() else {
            return;
        };
        let frame = PreviewFrame {
            rgba: DynamicImage::ImageRgb8(img.clone()).into_rgba8().into_raw(),
            width: img.width(),
            height: img.height(),
            fps: self.fps,
            detections,
        };
        if let Err(TrySendError::Disconnected(_)) = tx.try_send(frame) {
            debug!("preview closed");
            self.preview = None;
        }
    }
}

fn log_detections(frame_id: u64, detections: &DetectionResult, annotator: &Annotator) {
    for bbox in detections.bboxes() {
        debug!(
            "[frame {}] {} {:?}",
            frame_id,
            annotator.labels().label_text(bbox),
            bbox.xyxy_i32()
        );
    }
}

/// 解码帧 → RgbImage, 独占时不拷贝
pub fn frame_to_image(frame: DecodedFrame) -> Result<RgbImage> {
    let (width, height) = (frame.width, frame.height);
    let data = Arc::try_unwrap(frame.rgb_data).unwrap_or_else(|shared| (*shared).clone());
    RgbImage::from_raw(width, height, data)
        .ok_or_else(|| anyhow!("frame buffer does not match {}x{} rgb24", width, height))
}

/// 帧率优先级: 命令行 > 探测值 > 默认值; 非正数视为缺失
pub fn resolve_fps(cli: Option<f64>, probed: Option<f64>, default: f64) -> f64 {
    [cli, probed]
        .into_iter()
        .flatten()
        .find(|fps| fps.is_finite() && *fps > 0.0)
        .unwrap_or(if default > 0.0 { default } else { 25.0 })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoded(data: Vec<u8>, width: u32, height: u32) -> DecodedFrame {
        DecodedFrame {
            rgb_data: Arc::new(data),
            width,
            height,
            frame_id: 1,
            decode_fps: 25.0,
        }
    }

    #[test]
    fn frame_buffer_becomes_image() {
        let img = frame_to_image(decoded(vec![1, 2, 3, 4, 5, 6], 2, 1)).unwrap();
        assert_eq!(img.dimensions(), (2, 1));
        assert_eq!(img.get_pixel(1, 0).0, [4, 5, 6]);
    }

    #[test]
    fn shared_frame_buffer_is_copied() {
        let frame = decoded(vec![9; 12], 2, 2);
        let keep = frame.rgb_data.clone();
        let img = frame_to_image(frame).unwrap();
        assert_eq!(img.as_raw(), keep.as_ref());
    }

    #[test]
    fn short_frame_buffer_is_rejected() {
        assert!(frame_to_image(decoded(vec![0; 5], 2, 1)).is_err());
    }

    #[test]
    fn fps_priority() {
        assert_eq!(resolve_fps(Some(30.0), Some(25.0), 25.0), 30.0);
        assert_eq!(resolve_fps(None, Some(29.97), 25.0), 29.97);
        assert_eq!(resolve_fps(Some(0.0), Some(0.0), 25.0), 25.0);
        assert_eq!(resolve_fps(None, None, 0.0), 25.0);
    }
}
