//! 命令行参数与 JSON 配置

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::models::ModelArgs;

/// 拉流检测推流参数
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Video Stream Processing with YOLO", long_about = None)]
pub struct RelayArgs {
    /// 输入流地址 (RTMP/RTSP)
    #[arg(long, default_value = "rtmp://localhost:1935/obs/stream")]
    pub input_stream: String,

    /// 输出流地址 (RTMP/RTSP)
    #[arg(long, default_value = "rtmp://localhost:1935/output/stream")]
    pub output_stream: String,

    /// ffmpeg 可执行文件路径, 不存在时回退到 PATH 中的 ffmpeg
    #[arg(long, default_value = "ffmpeg")]
    pub ffmpeg_path: String,

    /// ONNX 模型路径
    #[arg(long, default_value = "yolo-train/train/weights/best.onnx")]
    pub yolo_model_path: String,

    /// 是否将检测结果写入CSV
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub write_csv: bool,

    /// CSV 文件路径
    #[arg(long, default_value = "output.csv")]
    pub csv_path: String,

    /// 标签翻译表中的模型名 (见配置文件 label_maps)
    #[arg(long)]
    pub model_name: Option<String>,

    /// JSON 配置文件
    #[arg(long, default_value = "relay.json")]
    pub config: String,

    /// 标签字体 (TTF)
    #[arg(long)]
    pub font: Option<String>,

    /// 覆盖输出帧率
    #[arg(long)]
    pub fps: Option<f64>,

    /// 本地预览窗口
    #[arg(long)]
    pub preview: bool,

    /// 置信度阈值
    #[arg(long, default_value_t = 0.25)]
    pub conf: f32,

    /// NMS IoU 阈值
    #[arg(long, default_value_t = 0.45)]
    pub iou: f32,

    /// 设备ID
    #[arg(long, default_value_t = 0)]
    pub device_id: i32,

    /// 使用 CUDA 执行提供者
    #[arg(long)]
    pub cuda: bool,

    /// 使用 TensorRT 执行提供者
    #[arg(long)]
    pub trt: bool,

    /// TensorRT FP16
    #[arg(long)]
    pub fp16: bool,

    /// 模型输入宽度 (动态输入时)
    #[arg(long)]
    pub width: Option<u32>,

    /// 模型输入高度 (动态输入时)
    #[arg(long)]
    pub height: Option<u32>,

    /// 类别数量 (元数据缺失时)
    #[arg(long)]
    pub nc: Option<u32>,

    /// 打印各阶段耗时
    #[arg(long)]
    pub profile: bool,
}

impl RelayArgs {
    pub fn model_args(&self) -> ModelArgs {
        ModelArgs {
            model: self.yolo_model_path.clone(),
            // 以模型元数据为准, 非检测模型在构建时被拒绝
            task: None,
            device_id: self.device_id,
            trt: self.trt,
            cuda: self.cuda,
            fp16: self.fp16,
            width: self.width,
            height: self.height,
            nc: self.nc,
            conf: self.conf,
            iou: self.iou,
            profile: self.profile,
        }
    }
}

/// 编码推流参数
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EncoderConfig {
    pub codec: String,
    pub preset: String,
    pub tune: String,
    pub output_pix_fmt: String,
    pub loglevel: String,
    /// 关闭推流进程时的等待时间
    pub shutdown_timeout_ms: u64,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            codec: "libx264".to_string(),
            preset: "ultrafast".to_string(),
            tune: "zerolatency".to_string(),
            output_pix_fmt: "yuv420p".to_string(),
            loglevel: "error".to_string(),
            shutdown_timeout_ms: 3000,
        }
    }
}

/// 拉流解码参数
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CaptureConfig {
    /// 解码 → 检测 队列长度
    pub queue_size: usize,
    /// 检测跟不上时丢弃新帧 (直播); false 时阻塞解码 (不丢帧)
    pub drop_when_busy: bool,
    pub rtsp_transport: String,
    /// 探测不到帧率时使用
    pub default_fps: f64,
    pub ffprobe_path: String,
    /// ffprobe 最长等待时间, 超时后使用 default_fps
    pub probe_timeout_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            queue_size: 4,
            drop_when_busy: true,
            rtsp_transport: "tcp".to_string(),
            default_fps: 25.0,
            ffprobe_path: "ffprobe".to_string(),
            probe_timeout_ms: 5000,
        }
    }
}

/// JSON 配置文件
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    pub encoder: EncoderConfig,
    pub capture: CaptureConfig,
    /// 模型名 → (类别名 → 显示名)
    pub label_maps: HashMap<String, HashMap<String, String>>,
}

impl RelayConfig {
    /// 从JSON文件加载配置
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(json) => match serde_json::from_str(&json) {
                Ok(config) => {
                    info!("配置已从 {} 加载", path.display());
                    config
                }
                Err(e) => {
                    warn!("配置文件解析失败: {}, 使用默认值", e);
                    Self::default()
                }
            },
            Err(_) => {
                info!("配置文件不存在,创建默认配置: {}", path.display());
                let config = Self::default();
                if let Err(e) = config.save(path) {
                    warn!("保存默认配置失败: {e:#}");
                }
                config
            }
        }
    }

    /// 保存配置到JSON文件
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path.as_ref(), json)?;
        Ok(())
    }

    pub fn label_map(&self, model_name: &str) -> Option<&HashMap<String, String>> {
        self.label_maps.get(model_name)
    }
}

/// ffmpeg 路径: 指定路径不存在时回退到 PATH
pub fn resolve_ffmpeg_path(configured: &str) -> Result<PathBuf> {
    resolve_executable(configured, "ffmpeg")
}

pub fn resolve_executable(configured: &str, fallback: &str) -> Result<PathBuf> {
    let path = Path::new(configured);
    if path.is_file() {
        return Ok(path.to_path_buf());
    }
    if let Ok(found) = which::which(configured) {
        return Ok(found);
    }
    if configured != fallback {
        warn!(
            "Specified path '{}' not found. Using '{}' instead.",
            configured, fallback
        );
    }
    match which::which(fallback) {
        Ok(found) => Ok(found),
        Err(_) => bail!("'{}' not found and '{}' is not on PATH", configured, fallback),
    }
}

/// 模型文件必须存在
pub fn check_model_path(path: &str) -> Result<()> {
    if !Path::new(path).is_file() {
        bail!("YOLO model path '{}' not found.", path);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_stock_command() {
        let args = RelayArgs::parse_from(["yolov8-relay"]);
        assert_eq!(args.input_stream, "rtmp://localhost:1935/obs/stream");
        assert_eq!(args.output_stream, "rtmp://localhost:1935/output/stream");
        assert!(args.write_csv);
        assert_eq!(args.csv_path, "output.csv");
        assert!(!args.preview);
    }

    #[test]
    fn model_task_comes_from_metadata() {
        let args = RelayArgs::parse_from(["yolov8-relay", "--conf", "0.4"]);
        let model_args = args.model_args();
        assert_eq!(model_args.task, None);
        assert_eq!(model_args.conf, 0.4);
        assert_eq!(model_args.model, args.yolo_model_path);
    }

    #[test]
    fn write_csv_can_be_disabled() {
        let args = RelayArgs::parse_from(["yolov8-relay", "--write-csv", "false"]);
        assert!(!args.write_csv);
    }

    #[test]
    fn missing_config_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.json");
        let config = RelayConfig::load(&path);
        assert_eq!(config, RelayConfig::default());
        assert!(path.exists());
    }

    #[test]
    fn partial_config_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.json");
        fs::write(
            &path,
            r#"{"encoder": {"preset": "veryfast"}, "label_maps": {"site-v1": {"person": "工人"}}}"#,
        )
        .unwrap();
        let config = RelayConfig::load(&path);
        assert_eq!(config.encoder.preset, "veryfast");
        assert_eq!(config.encoder.codec, "libx264");
        assert_eq!(config.capture.default_fps, 25.0);
        assert_eq!(config.capture.probe_timeout_ms, 5000);
        assert_eq!(
            config.label_map("site-v1").and_then(|m| m.get("person")),
            Some(&"工人".to_string())
        );
        assert!(config.label_map("other").is_none());
    }

    #[test]
    fn broken_config_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.json");
        fs::write(&path, "{ not json").unwrap();
        assert_eq!(RelayConfig::load(&path), RelayConfig::default());
    }

    #[test]
    fn existing_file_is_used_as_executable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("my-ffmpeg");
        fs::write(&path, b"").unwrap();
        let resolved = resolve_executable(path.to_str().unwrap(), "ffmpeg").unwrap();
        assert_eq!(resolved, path);
    }

    #[test]
    fn missing_executable_without_fallback_errors() {
        let result = resolve_executable(
            "/no/such/encoder-binary",
            "definitely-not-a-real-binary-name",
        );
        assert!(result.is_err());
    }

    #[test]
    fn missing_model_is_fatal() {
        assert!(check_model_path("/no/such/model.onnx").is_err());
    }
}
