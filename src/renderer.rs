/// 本地预览窗口 (macroquad)
///
/// 只显示最新一帧; Q/Esc 或关闭窗口时请求退出,
/// 等流水线收尾 (发送端断开) 后再关闭窗口
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, TryRecvError};
use macroquad::prelude::*;
use tracing::info;

use crate::pipeline::PreviewFrame;

struct Preview {
    rx: Receiver<PreviewFrame>,
    shutdown: Arc<AtomicBool>,
    texture: Option<Texture2D>,
    detections: usize,
    stream_fps: f64,
}

impl Preview {
    /// 取最新帧更新纹理, 返回 false 表示流水线已结束
    fn update(&mut self) -> bool {
        let mut latest = None;
        loop {
            match self.rx.try_recv() {
                Ok(frame) => latest = Some(frame),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
        let Some(frame) = latest else {
            return true;
        };

        self.detections = frame.detections;
        self.stream_fps = frame.fps;

        // 只在分辨率变化时重建纹理
        let needs_rebuild = match &self.texture {
            Some(tex) => tex.width() != frame.width as f32 || tex.height() != frame.height as f32,
            None => true,
        };
        if needs_rebuild {
            let texture = Texture2D::from_rgba8(frame.width as u16, frame.height as u16, &frame.rgba);
            texture.set_filter(FilterMode::Linear);
            self.texture = Some(texture);
        } else if let Some(tex) = &self.texture {
            tex.update(&Image {
                bytes: frame.rgba,
                width: frame.width as u16,
                height: frame.height as u16,
            });
        }
        true
    }

    fn handle_input(&self) {
        if is_key_pressed(KeyCode::Q) || is_key_pressed(KeyCode::Escape) || is_quit_requested() {
            if !self.shutdown.swap(true, Ordering::Relaxed) {
                info!("preview: quit requested");
            }
        }
    }

    fn draw(&self) {
        clear_background(BLACK);

        if let Some(texture) = &self.texture {
            // 等比缩放居中
            let scale = (screen_width() / texture.width()).min(screen_height() / texture.height());
            let (w, h) = (texture.width() * scale, texture.height() * scale);
            draw_texture_ex(
                texture,
                (screen_width() - w) / 2.0,
                (screen_height() - h) / 2.0,
                WHITE,
                DrawTextureParams {
                    dest_size: Some(vec2(w, h)),
                    ..Default::default()
                },
            );
        }

        let status = if self.shutdown.load(Ordering::Relaxed) {
            "stopping...".to_string()
        } else {
            format!(
                "stream {:.1}fps | view {}fps | {} objects | Q to quit",
                self.stream_fps,
                get_fps(),
                self.detections
            )
        };
        draw_text(&status, 10.0, 24.0, 24.0, GREEN);
    }
}

/// 在当前 (主) 线程打开预览窗口, 直到发送端断开
pub fn run_preview(rx: Receiver<PreviewFrame>, shutdown: Arc<AtomicBool>, title: &str) {
    let conf = Conf {
        window_title: title.to_string(),
        window_width: 1280,
        window_height: 720,
        high_dpi: true,
        ..Default::default()
    };
    let mut preview = Preview {
        rx,
        shutdown,
        texture: None,
        detections: 0,
        stream_fps: 0.0,
    };
    macroquad::Window::from_config(conf, async move {
        prevent_quit();
        while preview.update() {
            preview.handle_input();
            preview.draw();
            next_frame().await;
        }
        info!("preview closed");
    });
}
