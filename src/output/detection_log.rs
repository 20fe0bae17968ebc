//! 检测结果 CSV 记录

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

use crate::Bbox;

pub const CSV_HEADER: [&str; 4] = ["Timestamp", "Class", "Coordinates", "Confidence"];

/// 每个检测框一行: 时间码, 类别, 坐标, 置信度
pub struct DetectionLog {
    writer: BufWriter<File>,
    path: PathBuf,
    rows: u64,
}

impl DetectionLog {
    /// 创建 (覆盖) CSV 文件并写入表头
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)
            .with_context(|| format!("failed to create csv file {}", path.display()))?;
        let mut log = Self {
            writer: BufWriter::new(file),
            path,
            rows: 0,
        };
        log.write_record(&CSV_HEADER)?;
        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// 记录一帧中的全部检测框
    pub fn log_detections(&mut self, timestamp: &str, bboxes: &[Bbox], names: &[String]) -> Result<()> {
        for bbox in bboxes {
            let class = names
                .get(bbox.id())
                .map(String::as_str)
                .unwrap_or("unknown");
            self.write_detection(timestamp, class, bbox.xyxy_i32(), bbox.confidence())?;
        }
        Ok(())
    }

    pub fn write_detection(
        &mut self,
        timestamp: &str,
        class: &str,
        xyxy: [i32; 4],
        confidence: f32,
    ) -> Result<()> {
        let coords = format!("[{}, {}, {}, {}]", xyxy[0], xyxy[1], xyxy[2], xyxy[3]);
        let conf = format_percent(confidence);
        self.write_record(&[timestamp, class, &coords, &conf])?;
        self.rows += 1;
        Ok(())
    }

    fn write_record(&mut self, fields: &[&str]) -> Result<()> {
        let line = fields
            .iter()
            .map(|f| quote_field(f))
            .collect::<Vec<_>>()
            .join(",");
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\r\n")?;
        Ok(())
    }

    /// 刷新到磁盘
    pub fn finish(mut self) -> Result<()> {
        self.writer.flush()?;
        info!(
            "Detection results saved to {} ({} rows)",
            self.path.display(),
            self.rows
        );
        Ok(())
    }
}

/// 置信度 → 百分比, 两位小数 (0.876 → "87.60%")
pub fn format_percent(confidence: f32) -> String {
    format!("{:.2}%", confidence * 100.0)
}

/// 含分隔符/引号/换行的字段加双引号, 内部引号重复
fn quote_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// 帧序号 → `HH:MM:SS:FF`
///
/// 各分量按浮点取模后截断, 非整数帧率时与播放器显示一致
pub fn frame_timecode(frame_count: u64, fps: f64) -> String {
    if fps <= 0.0 || !fps.is_finite() {
        return "00:00:00:00".to_string();
    }
    let fc = frame_count as f64;
    let hours = (fc / (fps * 3600.0)) as u64;
    let minutes = ((fc % (fps * 3600.0)) / (fps * 60.0)) as u64;
    let seconds = ((fc % (fps * 60.0)) / fps) as u64;
    let frames = (fc % fps) as u64;
    format!("{:02}:{:02}:{:02}:{:02}", hours, minutes, seconds, frames)
}
