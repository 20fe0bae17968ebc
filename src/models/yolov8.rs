// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// YOLOv8 检测模型
// 包含: 模型加载、预处理、推理、后处理

use anyhow::{anyhow, bail, Result};
use image::{DynamicImage, GenericImageView};
use ndarray::{s, Array, Axis, IxDyn};
use tracing::info;

use super::{Model, ModelArgs};
use crate::{
    non_max_suppression, Batch, Bbox, DetectionResult, OrtBackend, OrtConfig, OrtEP, YOLOTask,
};

const CXYWH_OFFSET: usize = 4;

/// 预处理填充值
const PAD_VALUE: f32 = 144.0 / 255.0;

pub struct YOLOv8 {
    engine: OrtBackend,
    nc: u32,
    height: u32,
    width: u32,
    batch: u32,
    conf: f32,
    iou: f32,
    names: Vec<String>,
    profile: bool,
}

impl YOLOv8 {
    pub fn new(config: ModelArgs) -> Result<Self> {
        // execution provider
        let ep = if config.trt {
            OrtEP::Trt(config.device_id)
        } else if config.cuda {
            OrtEP::CUDA(config.device_id)
        } else {
            OrtEP::CPU
        };

        let ort_args = OrtConfig {
            ep,
            batch: Batch::default(),
            f: config.model,
            task: config.task,
            trt_fp16: config.fp16,
            image_size: (config.height, config.width),
        };
        let engine = OrtBackend::build(ort_args)?;

        if engine.task() != YOLOTask::Detect {
            bail!(
                "unsupported task {:?}, only detection models can be relayed",
                engine.task()
            );
        }

        let (batch, height, width) = (engine.batch(), engine.height(), engine.width());
        let nc = engine
            .nc()
            .or(config.nc)
            .ok_or_else(|| anyhow!("Failed to get num_classes, make it explicit with `--nc`"))?;

        // class names, 元数据缺失时用编号占位
        let names = match engine.names() {
            Some(names) if names.len() == nc as usize => names,
            _ => (0..nc).map(|i| format!("class{i}")).collect(),
        };

        Ok(Self {
            engine,
            nc,
            height,
            width,
            batch,
            conf: config.conf,
            iou: config.iou,
            names,
            profile: config.profile,
        })
    }

    pub fn nc(&self) -> u32 {
        self.nc
    }

    pub fn batch(&self) -> u32 {
        self.batch
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn conf(&self) -> f32 {
        self.conf
    }

    pub fn iou(&self) -> f32 {
        self.iou
    }
}

impl Model for YOLOv8 {
    fn preprocess(&mut self, xs: &[DynamicImage]) -> Result<Array<f32, IxDyn>> {
        Ok(letterbox_tensor(xs, self.width, self.height))
    }

    fn run(&mut self, xs: Array<f32, IxDyn>) -> Result<Vec<Array<f32, IxDyn>>> {
        self.engine.run(xs, self.profile)
    }

    fn postprocess(
        &self,
        xs: Vec<Array<f32, IxDyn>>,
        xs0: &[DynamicImage],
    ) -> Result<Vec<DetectionResult>> {
        let preds = xs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        decode_detections(
            preds,
            xs0,
            (self.width, self.height),
            self.nc as usize,
            self.conf,
            self.iou,
        )
    }

    fn names(&self) -> &[String] {
        &self.names
    }

    fn summary(&self) {
        info!(
            "Summary: task=Detect{} ep={:?} dtype={:?} batch={} input={}x{} nc={} conf={} iou={}",
            match self.engine.author().zip(self.engine.version()) {
                Some((author, ver)) => format!(" ({} {})", author, ver),
                None => String::new(),
            },
            self.engine.ep(),
            self.engine.dtype(),
            self.batch,
            self.width,
            self.height,
            self.nc,
            self.conf,
            self.iou,
        );
    }
}

/// 等比缩放系数及缩放后尺寸
pub fn scale_wh(w0: f32, h0: f32, w1: f32, h1: f32) -> (f32, f32, f32) {
    let r = (w1 / w0).min(h1 / h0);
    (r, (w0 * r).round(), (h0 * r).round())
}

/// 等比缩放后贴到画布左上角, 其余区域填充 144/255, 输出 NCHW
pub fn letterbox_tensor(xs: &[DynamicImage], width: u32, height: u32) -> Array<f32, IxDyn> {
    let mut ys = Array::from_elem((xs.len(), 3, height as usize, width as usize), PAD_VALUE)
        .into_dyn();
    for (idx, x) in xs.iter().enumerate() {
        let (w0, h0) = x.dimensions();
        let (_, w_new, h_new) = scale_wh(w0 as f32, h0 as f32, width as f32, height as f32);
        let img = x.resize_exact(
            (w_new as u32).clamp(1, width),
            (h_new as u32).clamp(1, height),
            image::imageops::FilterType::Triangle,
        );
        for (x, y, rgb) in img.pixels() {
            let x = x as usize;
            let y = y as usize;
            let [r, g, b, _] = rgb.0;
            ys[[idx, 0, y, x]] = (r as f32) / 255.0;
            ys[[idx, 1, y, x]] = (g as f32) / 255.0;
            ys[[idx, 2, y, x]] = (b as f32) / 255.0;
        }
    }
    ys
}

/// 解码检测头输出 [batch, 4 + nc, anchors]
pub fn decode_detections(
    preds: &Array<f32, IxDyn>,
    xs0: &[DynamicImage],
    input_wh: (u32, u32),
    nc: usize,
    conf: f32,
    iou: f32,
) -> Result<Vec<DetectionResult>> {
    if preds.ndim() != 3 || preds.shape()[1] < CXYWH_OFFSET + nc {
        bail!(
            "unexpected detection output shape {:?} for {} classes",
            preds.shape(),
            nc
        );
    }

    let mut ys = Vec::with_capacity(xs0.len());
    for (idx, anchor) in preds.axis_iter(Axis(0)).enumerate() {
        let x0 = xs0
            .get(idx)
            .ok_or_else(|| anyhow!("missing source image for batch index {idx}"))?;
        let width_original = x0.width() as f32;
        let height_original = x0.height() as f32;
        let ratio = (input_wh.0 as f32 / width_original).min(input_wh.1 as f32 / height_original);

        let mut data: Vec<Bbox> = Vec::new();
        for pred in anchor.axis_iter(Axis(1)) {
            let bbox = pred.slice(s![0..CXYWH_OFFSET]);
            let clss = pred.slice(s![CXYWH_OFFSET..CXYWH_OFFSET + nc]);

            let (id, &confidence) = match clss
                .into_iter()
                .enumerate()
                .reduce(|max, x| if x.1 > max.1 { x } else { max })
            {
                Some(best) => best,
                None => continue,
            };

            if confidence < conf {
                continue;
            }

            let cx = bbox[0] / ratio;
            let cy = bbox[1] / ratio;
            let w = bbox[2] / ratio;
            let h = bbox[3] / ratio;
            let x = cx - w / 2.;
            let y = cy - h / 2.;
            data.push(Bbox::new(
                x.max(0.0f32).min(width_original),
                y.max(0.0f32).min(height_original),
                w,
                h,
                id,
                confidence,
            ));
        }

        non_max_suppression(&mut data, iou);
        ys.push(DetectionResult::new(data));
    }

    Ok(ys)
}
