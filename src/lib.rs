#![allow(clippy::type_complexity)]
// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
pub mod annotate; // 检测框绘制
pub mod config; // 命令行与JSON配置
pub mod detection; // 检测结果数据结构
pub mod input; // 拉流解码
pub mod models; // 模型接口与具体实现
pub mod ort_backend; // ONNX Runtime 推理后端
pub mod output; // 推流编码 + CSV记录
pub mod pipeline; // 拉流 → 检测 → 推流 主循环
pub mod plot; // 离线结果绘制
#[cfg(feature = "preview")]
pub mod renderer; // 本地预览窗口

use std::io::{Read, Write};
use std::path::PathBuf;

use ab_glyph::FontArc;
use anyhow::{anyhow, Context, Result};
use tracing::info;

pub use crate::config::{RelayArgs, RelayConfig};
pub use crate::detection::{Bbox, DetectionResult};
pub use crate::models::{Model, ModelArgs, YOLOv8};
pub use crate::ort_backend::{Batch, OrtBackend, OrtConfig, OrtEP, YOLOTask};
pub use crate::pipeline::Relay;

const FONT_URL: &str = "https://ultralytics.com/assets/Arial.ttf";

/// 贪心NMS: 按置信度降序, 与已保留框 IoU 超过阈值的丢弃
pub fn non_max_suppression(xs: &mut Vec<Bbox>, iou_threshold: f32) {
    xs.sort_by(|b1, b2| b2.confidence().total_cmp(&b1.confidence()));

    let mut current_index = 0;
    for index in 0..xs.len() {
        let mut drop = false;
        for prev_index in 0..current_index {
            let iou = xs[prev_index].iou(&xs[index]);
            if iou > iou_threshold {
                drop = true;
                break;
            }
        }
        if !drop {
            xs.swap(current_index, index);
            current_index += 1;
        }
    }
    xs.truncate(current_index);
}

/// 当前毫秒时间戳, 用作结果文件名
pub fn gen_time_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// 检查并加载字体
///
/// 查找顺序: 显式路径 → Ultralytics 配置目录 → 当前目录 → 下载到当前目录
pub fn check_font(explicit: Option<&str>, font: &str) -> Result<FontArc> {
    let font_path = match explicit {
        Some(path) => PathBuf::from(path),
        None => locate_or_download_font(font)?,
    };

    let buffer = std::fs::read(&font_path)
        .with_context(|| format!("failed to read font {}", font_path.display()))?;
    FontArc::try_from_vec(buffer).map_err(|e| anyhow!("invalid font {}: {e}", font_path.display()))
}

fn locate_or_download_font(font: &str) -> Result<PathBuf> {
    let font_path_config = dirs::config_dir().map(|mut d| {
        d.push("Ultralytics");
        d.push(font);
        d
    });
    if let Some(path) = font_path_config.filter(|p| p.exists()) {
        return Ok(path);
    }

    let font_path_current = PathBuf::from(font);
    if font_path_current.exists() {
        return Ok(font_path_current);
    }

    info!("Downloading font from {FONT_URL}...");
    let resp = ureq::get(FONT_URL)
        .timeout(std::time::Duration::from_secs(500))
        .call()
        .with_context(|| format!("failed to download font: {FONT_URL}"))?;

    let mut buffer = vec![];
    resp.into_reader()
        .take(50 * 1024 * 1024)
        .read_to_end(&mut buffer)?;

    let file = std::fs::File::create(&font_path_current)?;
    let mut writer = std::io::BufWriter::new(file);
    writer.write_all(&buffer)?;
    writer.flush()?;
    info!("Font saved at: {}", font_path_current.display());
    Ok(font_path_current)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nms_keeps_highest_confidence_of_overlapping_boxes() {
        let mut xs = vec![
            Bbox::new(10.0, 10.0, 100.0, 100.0, 0, 0.6),
            Bbox::new(12.0, 12.0, 100.0, 100.0, 0, 0.9),
            Bbox::new(300.0, 300.0, 50.0, 50.0, 1, 0.5),
        ];
        non_max_suppression(&mut xs, 0.45);

        assert_eq!(xs.len(), 2);
        assert_eq!(xs[0].confidence(), 0.9);
        assert_eq!(xs[1].id(), 1);
    }

    #[test]
    fn nms_keeps_disjoint_boxes() {
        let mut xs = vec![
            Bbox::new(0.0, 0.0, 10.0, 10.0, 0, 0.3),
            Bbox::new(100.0, 100.0, 10.0, 10.0, 0, 0.4),
        ];
        non_max_suppression(&mut xs, 0.1);
        assert_eq!(xs.len(), 2);
    }

    #[test]
    fn explicit_missing_font_is_an_error() {
        assert!(check_font(Some("/definitely/not/here.ttf"), "Arial.ttf").is_err());
    }
}
