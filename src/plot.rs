// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 离线绘制: 按检测服务返回的 JSON 在原图上画框, 结果保存到 result/<毫秒>.jpg

use std::fs;
use std::path::{Path, PathBuf};

use ab_glyph::{FontArc, PxScale};
use anyhow::{Context, Result};
use image::{ImageFormat, Rgb};
use serde::Deserialize;
use tracing::{error, info};

use crate::annotate::{line_thickness, plot_one_box, BoxLabel, ColorPalette};
use crate::{check_font, gen_time_millis};

/// 失败时返回的提示
pub const FAILURE_MSG: &str = "请查看日志进行解决   测试失败";

/// 未指定 --font 时使用的字体
pub const DEFAULT_FONT: &str = "Arial.ttf";

/// 标签字号 (px)
const LABEL_SIZE: f32 = 20.0;

#[derive(Debug, Clone, Deserialize)]
pub struct PlotResponse {
    pub code: i64,
    pub msg: String,
    #[serde(default)]
    pub data: Vec<PlotItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlotItem {
    #[serde(rename = "Box")]
    pub bbox: PlotBox,
    #[serde(rename = "Score")]
    pub score: f64,
    pub inspect_object_type_name: String,
    pub defect_type_name: String,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PlotBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl PlotBox {
    pub fn xyxy_i32(&self) -> [i32; 4] {
        [self.x1 as i32, self.y1 as i32, self.x2 as i32, self.y2 as i32]
    }
}

impl PlotItem {
    /// "<检测对象>-<缺陷类型>"
    pub fn label(&self) -> String {
        format!("{}-{}", self.inspect_object_type_name, self.defect_type_name)
    }
}

/// 绘制并保存, 返回 (保存路径, code, msg)
///
/// 任一步骤失败 (含字体加载) 时返回 (原图路径, -1, 失败提示), 错误写入日志
pub fn plot(img: &Path, response: &Path, font: Option<&str>, save_dir: &Path) -> (PathBuf, i64, String) {
    match try_plot(img, response, font, save_dir) {
        Ok(result) => result,
        Err(e) => {
            error!("plot failed: {e:#}");
            (img.to_path_buf(), -1, FAILURE_MSG.to_string())
        }
    }
}

fn try_plot(
    img: &Path,
    response: &Path,
    font: Option<&str>,
    save_dir: &Path,
) -> Result<(PathBuf, i64, String)> {
    let json = fs::read_to_string(response)
        .with_context(|| format!("failed to read {}", response.display()))?;
    let response: PlotResponse = serde_json::from_str(&json)
        .with_context(|| format!("invalid response json {}", response.display()))?;

    let mut canvas = image::open(img)
        .with_context(|| format!("failed to open image {}", img.display()))?
        .into_rgb8();

    fs::create_dir_all(save_dir)?;
    let save_path = save_dir.join(format!("{}.jpg", gen_time_millis()));

    // 有框时才需要字体
    let font: Option<FontArc> = if response.data.is_empty() {
        None
    } else {
        Some(check_font(font, DEFAULT_FONT)?)
    };

    let labels: Vec<String> = response.data.iter().map(PlotItem::label).collect();
    let mut palette = ColorPalette::new(labels.as_slice());
    let tl = line_thickness(canvas.height(), canvas.width());

    for (item, label) in response.data.iter().zip(&labels) {
        let text = format!("{} {:.2}", label, item.score);
        let color = palette.color(label);
        plot_one_box(
            &mut canvas,
            item.bbox.xyxy_i32(),
            color,
            font.as_ref().map(|font| BoxLabel {
                font,
                text: &text,
                scale: PxScale::from(LABEL_SIZE),
                color: Rgb([255, 255, 255]),
            }),
            tl,
        );
    }

    canvas
        .save_with_format(&save_path, ImageFormat::Jpeg)
        .with_context(|| format!("failed to save {}", save_path.display()))?;
    info!("The image with the result is saved in: {}", save_path.display());

    Ok((save_path, response.code, response.msg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    const RESPONSE: &str = r#"{
        "code": 200,
        "msg": "ok",
        "data": [
            {"Box": {"x1": 10, "y1": 20.5, "x2": 110, "y2": 80},
             "Score": 0.912,
             "inspect_object_type_name": "绝缘子",
             "defect_type_name": "破损"}
        ]
    }"#;

    #[test]
    fn parses_detection_response() {
        let response: PlotResponse = serde_json::from_str(RESPONSE).unwrap();
        assert_eq!(response.code, 200);
        assert_eq!(response.msg, "ok");
        assert_eq!(response.data.len(), 1);
        let item = &response.data[0];
        assert_eq!(item.label(), "绝缘子-破损");
        assert_eq!(item.bbox.xyxy_i32(), [10, 20, 110, 80]);
        assert!((item.score - 0.912).abs() < 1e-9);
    }

    #[test]
    fn missing_data_is_empty() {
        let response: PlotResponse =
            serde_json::from_str(r#"{"code": 500, "msg": "no result"}"#).unwrap();
        assert!(response.data.is_empty());
    }

    fn write_image(dir: &Path) -> PathBuf {
        let path = dir.join("input.png");
        RgbImage::from_pixel(64, 48, Rgb([10, 20, 30])).save(&path).unwrap();
        path
    }

    #[test]
    fn saves_result_image_with_response_status() {
        let dir = tempfile::tempdir().unwrap();
        let img = write_image(dir.path());
        let response = dir.path().join("response.json");
        fs::write(&response, r#"{"code": 200, "msg": "无缺陷", "data": []}"#).unwrap();
        let save_dir = dir.path().join("result");

        let (path, code, msg) = plot(&img, &response, None, &save_dir);
        assert_eq!(code, 200);
        assert_eq!(msg, "无缺陷");
        assert_eq!(path.parent(), Some(save_dir.as_path()));
        assert_eq!(path.extension().and_then(|e| e.to_str()), Some("jpg"));
        let saved = image::open(&path).unwrap();
        assert_eq!((saved.width(), saved.height()), (64, 48));
    }

    #[test]
    fn missing_image_returns_failure() {
        let dir = tempfile::tempdir().unwrap();
        let img = dir.path().join("missing.jpg");
        let response = dir.path().join("response.json");
        fs::write(&response, r#"{"code": 200, "msg": "ok", "data": []}"#).unwrap();

        let (path, code, msg) = plot(&img, &response, None, &dir.path().join("result"));
        assert_eq!((path, code, msg.as_str()), (img, -1, FAILURE_MSG));
    }

    #[test]
    fn broken_json_returns_failure() {
        let dir = tempfile::tempdir().unwrap();
        let img = write_image(dir.path());
        let response = dir.path().join("response.json");
        fs::write(&response, "{ not json").unwrap();

        let (path, code, msg) = plot(&img, &response, None, &dir.path().join("result"));
        assert_eq!((path, code, msg.as_str()), (img, -1, FAILURE_MSG));
    }

    #[test]
    fn unreadable_font_returns_failure() {
        let dir = tempfile::tempdir().unwrap();
        let img = write_image(dir.path());
        let response = dir.path().join("response.json");
        fs::write(&response, RESPONSE).unwrap();
        let font = dir.path().join("no-such-font.ttf");

        let (path, code, msg) =
            plot(&img, &response, font.to_str(), &dir.path().join("result"));
        assert_eq!((path, code, msg.as_str()), (img, -1, FAILURE_MSG));
        assert!(!dir.path().join("result").read_dir().unwrap().any(|e| e.is_ok()));
    }

    #[test]
    fn malformed_response_is_rejected() {
        assert!(serde_json::from_str::<PlotResponse>(r#"{"code": "x"}"#).is_err());
    }
}
