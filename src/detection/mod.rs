/// 检测结果 (Detection results)
///
/// 推理线程输出的检测框及其几何运算
pub mod types;

pub use types::{Bbox, DetectionResult};
