// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 检测框绘制
// 线宽随分辨率变化, 标签画在框左上角上方, 底色与框同色

use std::collections::HashMap;

use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use rand::{thread_rng, Rng};

use crate::output::format_percent;
use crate::{Bbox, DetectionResult};

/// 标签文字颜色 (近白)
pub const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 225]);

/// 类别名 → 随机颜色, 首次出现时生成
#[derive(Debug, Clone, Default)]
pub struct ColorPalette {
    colors: HashMap<String, Rgb<u8>>,
}

impl ColorPalette {
    pub fn new<S: AsRef<str>>(names: &[S]) -> Self {
        let mut palette = Self::default();
        for name in names {
            palette.color(name.as_ref());
        }
        palette
    }

    pub fn color(&mut self, name: &str) -> Rgb<u8> {
        *self
            .colors
            .entry(name.to_string())
            .or_insert_with(random_color)
    }

    pub fn get(&self, name: &str) -> Option<Rgb<u8>> {
        self.colors.get(name).copied()
    }
}

fn random_color() -> Rgb<u8> {
    let mut rng = thread_rng();
    Rgb([
        rng.gen_range(0..=255),
        rng.gen_range(0..=255),
        rng.gen_range(0..=255),
    ])
}

/// 线宽: 高度/250, 小图时按 0.002 * 平均边长 + 1
pub fn line_thickness(height: u32, width: u32) -> u32 {
    let tl = height / 250;
    if tl >= 1 {
        tl
    } else {
        (0.002 * (height + width) as f32 / 2.0).round() as u32 + 1
    }
}

/// 标签字号 (px)
pub fn label_scale(tl: u32) -> PxScale {
    PxScale::from((tl as f32 / 3.0 * 30.0).max(12.0))
}

/// 框上方的文字标签
#[derive(Clone, Copy)]
pub struct BoxLabel<'a> {
    pub font: &'a FontArc,
    pub text: &'a str,
    pub scale: PxScale,
    pub color: Rgb<u8>,
}

/// 在 [x1, y1, x2, y2] 处画一个线宽为 tl 的框, 可选带标签
pub fn plot_one_box(
    img: &mut RgbImage,
    xyxy: [i32; 4],
    color: Rgb<u8>,
    label: Option<BoxLabel<'_>>,
    tl: u32,
) {
    let [x1, y1, x2, y2] = xyxy;
    let tl = tl.max(1) as i32;

    // 以框线为中心向内外加粗
    for i in 0..tl {
        let offset = i - tl / 2;
        let w = x2 - x1 - 2 * offset;
        let h = y2 - y1 - 2 * offset;
        if w > 0 && h > 0 {
            draw_hollow_rect_mut(
                img,
                Rect::at(x1 + offset, y1 + offset).of_size(w as u32, h as u32),
                color,
            );
        }
    }

    let Some(label) = label else {
        return;
    };
    if label.text.is_empty() {
        return;
    }
    let (tw, th) = text_size(label.scale, label.font, label.text);
    let bg_h = th + 3;
    if tw > 0 {
        draw_filled_rect_mut(
            img,
            Rect::at(x1, y1 - bg_h as i32).of_size(tw, bg_h),
            color,
        );
    }
    draw_text_mut(
        img,
        label.color,
        x1,
        y1 - 2 - th as i32,
        label.scale,
        label.font,
        label.text,
    );
}

/// 类别名与显示名
#[derive(Debug, Clone, Default)]
pub struct ClassLabels {
    names: Vec<String>,
    /// 类别名 → 显示名
    label_map: HashMap<String, String>,
}

impl ClassLabels {
    pub fn new(names: &[String], label_map: Option<HashMap<String, String>>) -> Self {
        Self {
            names: names.to_vec(),
            label_map: label_map.unwrap_or_default(),
        }
    }

    /// 类别 id → 原始类别名
    pub fn class_name(&self, id: usize) -> &str {
        self.names.get(id).map(String::as_str).unwrap_or("unknown")
    }

    /// 类别 id → 显示名 (翻译表缺失时用原始名)
    pub fn display_name(&self, id: usize) -> &str {
        let name = self.class_name(id);
        self.label_map.get(name).map(String::as_str).unwrap_or(name)
    }

    /// 框上的标签: "<显示名> <置信度百分比>"
    pub fn label_text(&self, bbox: &Bbox) -> String {
        format!("{} {}", self.display_name(bbox.id()), format_percent(bbox.confidence()))
    }
}

/// 检测结果绘制器
pub struct Annotator {
    font: FontArc,
    labels: ClassLabels,
    palette: ColorPalette,
}

impl Annotator {
    pub fn new(names: &[String], label_map: Option<HashMap<String, String>>, font: FontArc) -> Self {
        Self {
            font,
            labels: ClassLabels::new(names, label_map),
            palette: ColorPalette::new(names),
        }
    }

    pub fn labels(&self) -> &ClassLabels {
        &self.labels
    }

    pub fn color(&self, id: usize) -> Rgb<u8> {
        self.palette
            .get(self.labels.class_name(id))
            .unwrap_or(Rgb([128, 128, 128]))
    }

    /// 在帧上绘制全部检测框
    pub fn annotate(&self, img: &mut RgbImage, detections: &DetectionResult) {
        let tl = line_thickness(img.height(), img.width());
        for bbox in detections.bboxes() {
            let text = self.labels.label_text(bbox);
            let label = BoxLabel {
                font: &self.font,
                text: &text,
                scale: label_scale(tl),
                color: TEXT_COLOR,
            };
            plot_one_box(img, bbox.xyxy_i32(), self.color(bbox.id()), Some(label), tl);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thickness_scales_with_height() {
        assert_eq!(line_thickness(1080, 1920), 4);
        assert_eq!(line_thickness(720, 1280), 2);
        // 小于 250 时: round(0.002 * 400 / 2) + 1 = 1
        assert_eq!(line_thickness(100, 300), 1);
        // round(0.002 * 2000 / 2) + 1 = 3
        assert_eq!(line_thickness(200, 1800), 3);
    }

    #[test]
    fn palette_is_stable_per_name() {
        let mut palette = ColorPalette::new(&["person", "car"][..]);
        let c = palette.color("person");
        assert_eq!(palette.color("person"), c);
        assert_eq!(palette.get("person"), Some(c));
        assert!(palette.get("bus").is_none());
    }

    #[test]
    fn label_shows_display_name_and_percent() {
        let names = vec!["person".to_string(), "helmet".to_string()];
        let map = HashMap::from([("helmet".to_string(), "安全帽".to_string())]);
        let labels = ClassLabels::new(&names, Some(map));

        assert_eq!(labels.label_text(&Bbox::new(0.0, 0.0, 5.0, 5.0, 0, 0.876)), "person 87.60%");
        assert_eq!(labels.label_text(&Bbox::new(0.0, 0.0, 5.0, 5.0, 1, 0.5)), "安全帽 50.00%");
        assert_eq!(labels.class_name(1), "helmet");
        assert_eq!(labels.display_name(9), "unknown");
    }

    #[test]
    fn box_outline_has_requested_thickness() {
        let mut img = RgbImage::new(100, 100);
        let red = Rgb([255, 0, 0]);
        plot_one_box(&mut img, [20, 20, 80, 80], red, None, 3);
        // 外扩 1px, 内收 1px
        assert_eq!(*img.get_pixel(19, 50), red);
        assert_eq!(*img.get_pixel(20, 50), red);
        assert_eq!(*img.get_pixel(21, 50), red);
        assert_eq!(*img.get_pixel(22, 50), Rgb([0, 0, 0]));
        assert_eq!(*img.get_pixel(50, 50), Rgb([0, 0, 0]));
    }

    #[test]
    fn degenerate_box_does_not_panic() {
        let mut img = RgbImage::new(10, 10);
        plot_one_box(&mut img, [5, 5, 5, 5], Rgb([1, 2, 3]), None, 4);
        plot_one_box(&mut img, [-20, -20, 50, 50], Rgb([1, 2, 3]), None, 2);
    }
}
