// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 拉流 → YOLOv8 检测 → 推流
// cargo run --bin yolov8-relay --release -- --input-stream rtmp://... --output-stream rtmp://...

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use yolov8_relay::{Relay, RelayArgs, RelayConfig};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let args = RelayArgs::parse();
    let config = RelayConfig::load(&args.config);

    let shutdown = Arc::new(AtomicBool::new(false));
    if let Err(err) = ctrlc::set_handler({
        let shutdown = shutdown.clone();
        move || {
            shutdown.store(true, Ordering::SeqCst);
        }
    }) {
        warn!("Failed to install Ctrl+C handler: {err}");
    }

    info!("input: {} → output: {}", args.input_stream, args.output_stream);
    let preview = args.preview;
    let mut relay = Relay::new(args, config)?;

    if preview {
        return run_with_preview(relay, shutdown);
    }
    relay.run(shutdown, None)?;
    Ok(())
}

/// 预览窗口占用主线程, 流水线在工作线程运行
#[cfg(feature = "preview")]
fn run_with_preview(mut relay: Relay, shutdown: Arc<AtomicBool>) -> Result<()> {
    let (tx, rx) = crossbeam_channel::bounded(1);
    let worker = std::thread::Builder::new()
        .name("relay".to_string())
        .spawn({
            let shutdown = shutdown.clone();
            move || relay.run(shutdown, Some(tx))
        })?;

    yolov8_relay::renderer::run_preview(rx, shutdown, "YOLOv8 Relay");

    match worker.join() {
        Ok(result) => result.map(|_| ()),
        Err(_) => Err(anyhow::anyhow!("relay thread panicked")),
    }
}

#[cfg(not(feature = "preview"))]
fn run_with_preview(mut relay: Relay, shutdown: Arc<AtomicBool>) -> Result<()> {
    warn!("built without the `preview` feature, running headless");
    relay.run(shutdown, None)?;
    Ok(())
}
