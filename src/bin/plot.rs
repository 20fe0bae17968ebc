// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 离线绘制检测结果
// cargo run --bin yolov8-plot -- --img data/00041.jpg --response data/00041.json

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use yolov8_relay::plot::plot;

#[derive(Parser, Debug)]
#[command(author, version, about = "Plot detection results on an image", long_about = None)]
struct PlotArgs {
    /// 原图
    #[arg(long)]
    img: PathBuf,

    /// 检测服务返回的 JSON
    #[arg(long)]
    response: PathBuf,

    /// 标签字体, 中文标签需要 CJK 字体 (如 fonts/wqy-zenhei.ttc)
    #[arg(long)]
    font: Option<String>,

    /// 输出目录
    #[arg(long, default_value = "result")]
    save_dir: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let args = PlotArgs::parse();
    let (save_path, code, msg) = plot(&args.img, &args.response, args.font.as_deref(), &args.save_dir);
    info!("save_path={} code={} msg={}", save_path.display(), code, msg);
    Ok(())
}
