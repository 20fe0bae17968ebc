// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// ONNX Runtime 推理后端
// 负责: 会话构建、执行提供者选择、输入输出形状与模型元数据解析

use anyhow::{anyhow, bail, Context, Result};
use ndarray::{Array, IxDyn};
use ort::{
    CPUExecutionProvider, CUDAExecutionProvider, ExecutionProvider, GraphOptimizationLevel,
    Session, TensorElementType, TensorRTExecutionProvider, ValueType,
};
use regex::Regex;
use tracing::{info, warn};

/// 默认输入尺寸 (动态维度时使用)
const DEFAULT_IMAGE_SIZE: u32 = 640;

#[derive(clap::ValueEnum, Copy, Clone, Debug, PartialEq, Eq)]
pub enum YOLOTask {
    // YOLO tasks
    Classify,
    Detect,
    Pose,
    Segment,
}

impl YOLOTask {
    /// 从 Ultralytics 导出元数据中的 `task` 字段解析
    pub fn from_metadata(s: &str) -> Option<Self> {
        match s.trim() {
            "classify" => Some(YOLOTask::Classify),
            "detect" => Some(YOLOTask::Detect),
            "pose" => Some(YOLOTask::Pose),
            "segment" => Some(YOLOTask::Segment),
            _ => None,
        }
    }
}

/// task: 显式参数 > 模型元数据 > 默认检测
pub fn resolve_task(explicit: Option<YOLOTask>, metadata: Option<&str>) -> YOLOTask {
    explicit
        .or_else(|| metadata.and_then(YOLOTask::from_metadata))
        .unwrap_or(YOLOTask::Detect)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrtEP {
    // ONNXRuntime execution provider
    CPU,
    CUDA(i32),
    Trt(i32),
}

#[derive(Debug, Clone)]
pub struct Batch {
    pub opt: u32,
    pub min: u32,
    pub max: u32,
}

impl Default for Batch {
    fn default() -> Self {
        Self {
            opt: 1,
            min: 1,
            max: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrtConfig {
    // ORT config
    pub f: String,
    pub task: Option<YOLOTask>,
    pub ep: OrtEP,
    pub trt_fp16: bool,
    pub batch: Batch,
    pub image_size: (Option<u32>, Option<u32>),
}

pub struct OrtBackend {
    // ORT engine
    session: Session,
    task: YOLOTask,
    ep: OrtEP,
    batch: Batch,
    inputs: OrtInputs,
    output_names: Vec<String>,
    output_dims: Vec<i64>,
}

#[derive(Debug)]
struct OrtInputs {
    name: String,
    dtype: TensorElementType,
    height: u32,
    width: u32,
}

impl OrtBackend {
    pub fn build(args: OrtConfig) -> Result<Self> {
        let ep = Self::resolve_ep(&args)?;
        let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;
        let builder = match &ep {
            OrtEP::Trt(device_id) => {
                let trt = TensorRTExecutionProvider::default()
                    .with_device_id(*device_id)
                    .with_fp16(args.trt_fp16)
                    .with_engine_cache(true)
                    .with_engine_cache_path("./trt_cache");
                builder.with_execution_providers([trt.build()])?
            }
            OrtEP::CUDA(device_id) => {
                let cuda = CUDAExecutionProvider::default().with_device_id(*device_id);
                builder.with_execution_providers([cuda.build()])?
            }
            OrtEP::CPU => builder.with_execution_providers([CPUExecutionProvider::default().build()])?,
        };
        let session = builder
            .commit_from_file(&args.f)
            .with_context(|| format!("failed to load onnx model {}", args.f))?;

        // inputs
        let input = session
            .inputs
            .first()
            .ok_or_else(|| anyhow!("model {} has no inputs", args.f))?;
        let (dtype, mut dims) = match &input.input_type {
            ValueType::Tensor { ty, dimensions, .. } => (*ty, dimensions.clone()),
            other => bail!("unsupported model input type: {other:?}"),
        };
        if dims.len() != 4 {
            bail!("expected NCHW input, got dims {dims:?}");
        }

        // batch
        let mut batch = args.batch;
        if dims[0] > 0 {
            batch.opt = dims[0] as u32;
        } else {
            dims[0] = batch.opt as i64;
        }

        // height & width
        let height = Self::fill_dim(&mut dims[2], args.image_size.0);
        let width = Self::fill_dim(&mut dims[3], args.image_size.1);

        // outputs
        let output_names: Vec<String> = session.outputs.iter().map(|o| o.name.clone()).collect();
        let output_dims = match session.outputs.first().map(|o| &o.output_type) {
            Some(ValueType::Tensor { dimensions, .. }) => dimensions.clone(),
            _ => Vec::new(),
        };

        let inputs = OrtInputs {
            name: input.name.clone(),
            dtype,
            height,
            width,
        };

        let mut backend = Self {
            session,
            task: YOLOTask::Detect,
            ep,
            batch,
            inputs,
            output_names,
            output_dims,
        };

        let metadata_task = backend.fetch_from_metadata("task");
        backend.task = resolve_task(args.task, metadata_task.as_deref());

        Ok(backend)
    }

    fn resolve_ep(args: &OrtConfig) -> Result<OrtEP> {
        let ep = match args.ep {
            OrtEP::Trt(device_id) => {
                if TensorRTExecutionProvider::default().is_available()? {
                    OrtEP::Trt(device_id)
                } else {
                    warn!("TensorRT is not available, falling back to CUDA");
                    OrtEP::CUDA(device_id)
                }
            }
            ref ep => ep.clone(),
        };
        let ep = match ep {
            OrtEP::CUDA(device_id) => {
                if CUDAExecutionProvider::default().is_available()? {
                    OrtEP::CUDA(device_id)
                } else {
                    warn!("CUDA is not available, falling back to CPU");
                    OrtEP::CPU
                }
            }
            ep => ep,
        };
        Ok(ep)
    }

    fn fill_dim(dim: &mut i64, configured: Option<u32>) -> u32 {
        if *dim > 0 {
            if let Some(v) = configured {
                if v as i64 != *dim {
                    warn!("model has a fixed input size {}, ignoring {}", dim, v);
                }
            }
            *dim as u32
        } else {
            let v = configured.unwrap_or(DEFAULT_IMAGE_SIZE);
            *dim = v as i64;
            v
        }
    }

    pub fn run(&mut self, xs: Array<f32, IxDyn>, profile: bool) -> Result<Vec<Array<f32, IxDyn>>> {
        let t = std::time::Instant::now();
        let ys = match self.inputs.dtype {
            TensorElementType::Float32 => {
                let outputs = self
                    .session
                    .run(ort::inputs![self.inputs.name.as_str() => xs.view()]?)?;
                let mut ys = Vec::with_capacity(self.output_names.len());
                for name in &self.output_names {
                    let y = outputs[name.as_str()].try_extract_tensor::<f32>()?;
                    ys.push(y.into_owned());
                }
                ys
            }
            TensorElementType::Float16 => {
                let xs = xs.mapv(half::f16::from_f32);
                let outputs = self
                    .session
                    .run(ort::inputs![self.inputs.name.as_str() => xs.view()]?)?;
                let mut ys = Vec::with_capacity(self.output_names.len());
                for name in &self.output_names {
                    let y = outputs[name.as_str()].try_extract_tensor::<half::f16>()?;
                    ys.push(y.mapv(f32::from));
                }
                ys
            }
            other => bail!("unsupported model input dtype: {other:?}"),
        };
        if profile {
            info!("[ORT {:?} Execution]: {:?}", self.ep, t.elapsed());
        }
        Ok(ys)
    }

    /// 类别数: 优先元数据中的 names, 否则由输出形状 [batch, 4 + nc, anchors] 推断
    pub fn nc(&self) -> Option<u32> {
        match self.names() {
            Some(names) if !names.is_empty() => Some(names.len() as u32),
            _ => match self.task {
                YOLOTask::Detect if self.output_dims.len() == 3 && self.output_dims[1] > 4 => {
                    Some(self.output_dims[1] as u32 - 4)
                }
                _ => None,
            },
        }
    }

    pub fn names(&self) -> Option<Vec<String>> {
        self.fetch_from_metadata("names")
            .map(|names| parse_names(&names))
    }

    pub fn author(&self) -> Option<String> {
        self.fetch_from_metadata("author")
    }

    pub fn version(&self) -> Option<String> {
        self.fetch_from_metadata("version")
    }

    fn fetch_from_metadata(&self, key: &str) -> Option<String> {
        // fetch value from onnx model file by key
        match self.session.metadata() {
            Ok(metadata) => match metadata.custom(key) {
                Ok(value) => value,
                Err(_) => None,
            },
            Err(_) => None,
        }
    }

    pub fn task(&self) -> YOLOTask {
        self.task
    }

    pub fn ep(&self) -> &OrtEP {
        &self.ep
    }

    pub fn dtype(&self) -> TensorElementType {
        self.inputs.dtype
    }

    pub fn batch(&self) -> u32 {
        self.batch.opt
    }

    pub fn height(&self) -> u32 {
        self.inputs.height
    }

    pub fn width(&self) -> u32 {
        self.inputs.width
    }
}

/// 解析 Ultralytics 元数据中的类别名
///
/// 格式: `{0: 'person', 1: 'bicycle', 2: 'sports ball', 133: "teddy bear"}`
pub fn parse_names(names: &str) -> Vec<String> {
    let re = match Regex::new(r#"(\d+)\s*:\s*(['"])(.*?)(['"])\s*(?:,|\})"#) {
        Ok(re) => re,
        Err(_) => return Vec::new(),
    };
    let mut indexed: Vec<(usize, String)> = re
        .captures_iter(names)
        .filter_map(|c| {
            let idx = c.get(1)?.as_str().parse::<usize>().ok()?;
            Some((idx, c.get(3)?.as_str().to_string()))
        })
        .collect();
    indexed.sort_by_key(|(idx, _)| *idx);
    indexed.into_iter().map(|(_, name)| name).collect()
}
