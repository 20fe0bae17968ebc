/// 模型统一接口与实现
///
/// ## Model Trait
/// 统一的模型接口，定义标准流程: preprocess → run → postprocess
///
/// ```text
/// 原始帧 → preprocess → ndarray张量
///        ↓
///   推理引擎 run
///        ↓
///   原始输出 → postprocess → 检测结果
/// ```
use anyhow::Result;
use image::DynamicImage;
use ndarray::{Array, IxDyn};

use crate::{DetectionResult, YOLOTask};

pub mod yolov8; // YOLOv8 检测模型

pub use yolov8::YOLOv8;

/// 模型构建参数 (与命令行解耦)
#[derive(Debug, Clone)]
pub struct ModelArgs {
    pub model: String,
    pub task: Option<YOLOTask>,
    pub device_id: i32,
    pub trt: bool,
    pub cuda: bool,
    pub fp16: bool,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub nc: Option<u32>,
    pub conf: f32,
    pub iou: f32,
    pub profile: bool,
}

impl Default for ModelArgs {
    fn default() -> Self {
        Self {
            model: String::new(),
            task: None,
            device_id: 0,
            trt: false,
            cuda: false,
            fp16: false,
            width: None,
            height: None,
            nc: None,
            conf: 0.25,
            iou: 0.45,
            profile: false,
        }
    }
}

/// 统一的检测模型接口
pub trait Model {
    /// 预处理: 图片 → NCHW 张量
    fn preprocess(&mut self, images: &[DynamicImage]) -> Result<Array<f32, IxDyn>>;

    /// 推理: 执行模型前向传播, 返回原始输出
    fn run(&mut self, xs: Array<f32, IxDyn>) -> Result<Vec<Array<f32, IxDyn>>>;

    /// 后处理: 原始输出 → 检测结果 (坐标还原到原图)
    fn postprocess(
        &self,
        xs: Vec<Array<f32, IxDyn>>,
        xs0: &[DynamicImage],
    ) -> Result<Vec<DetectionResult>>;

    /// 完整的推理流程: preprocess → run → postprocess
    fn forward(&mut self, images: &[DynamicImage]) -> Result<Vec<DetectionResult>> {
        let xs = self.preprocess(images)?;
        let ys = self.run(xs)?;
        self.postprocess(ys, images)
    }

    /// 类别名 (下标即类别id)
    fn names(&self) -> &[String];

    /// 打印模型信息
    fn summary(&self);
}
