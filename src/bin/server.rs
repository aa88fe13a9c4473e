//! Relay server: accepts camera frames over TCP, runs them through the
//! processor pool, and streams typed results back to connected clients.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use percept_relay::config::{build_context, Config};
use percept_relay::frame::ImageData;
use percept_relay::recognizer::{FaceRecognizer, FaceResult, PoseEstimator, PoseResult};
use percept_relay::server::{
    ConnectionHandler, ReceiveHandler, SendHandler, ThreadedServer,
};

/// Stand-in backends for deployments where the real recognizers run in a
/// separate process. They always report zero detections.
struct NullFace;

impl FaceRecognizer for NullFace {
    fn recognize(&self, image: &ImageData) -> anyhow::Result<FaceResult> {
        Ok(FaceResult {
            ids: vec![],
            boxes: vec![],
            width: image.width,
            height: image.height,
        })
    }
}

struct NullPose;

impl PoseEstimator for NullPose {
    fn find_pose(&self, _image: &ImageData) -> anyhow::Result<PoseResult> {
        Ok(PoseResult::empty())
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    log::info!("Percept Relay ({})", env!("GIT_VERSION"));

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "relay_server.toml".to_string());
    let config =
        Config::load(&config_path).with_context(|| format!("failed to read {config_path}"))?;
    log::info!(
        "[config] receive={}, send={}, workers={}, queue_depth={}",
        config.server.listen_receive,
        config.server.listen_send,
        config.server.workers,
        config.server.queue_depth
    );

    let wants = |name: &str| config.processor.iter().any(|p| p.capability == name);
    let face: Option<Arc<dyn FaceRecognizer>> = if wants("face_recognition") {
        log::warn!("face_recognition: no recognizer wired in, using null backend");
        Some(Arc::new(NullFace))
    } else {
        None
    };
    let pose: Option<Arc<dyn PoseEstimator>> = if wants("openpose") {
        log::warn!("openpose: no estimator wired in, using null backend");
        Some(Arc::new(NullPose))
    } else {
        None
    };

    let ctx = build_context(&config, face, pose)?;
    log::info!(
        "[context] {} processor(s), {} camera(s)",
        ctx.processors.len(),
        ctx.cameras.len()
    );

    let recv_ctx = Arc::clone(&ctx);
    let mut receive = ThreadedServer::bind(
        &config.server.listen_receive,
        "receive",
        Arc::new(move |s, peer| {
            Box::new(ReceiveHandler::new(s, peer, Arc::clone(&recv_ctx)))
                as Box<dyn ConnectionHandler>
        }),
    )?;
    let send_ctx = Arc::clone(&ctx);
    let mut send = ThreadedServer::bind(
        &config.server.listen_send,
        "send",
        Arc::new(move |s, peer| {
            Box::new(SendHandler::new(s, peer, Arc::clone(&send_ctx)))
                as Box<dyn ConnectionHandler>
        }),
    )?;

    // SIGINT/SIGTERM → orderly shutdown
    let term = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&term))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&term))?;
    while !term.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(200));
    }

    log::info!("shutting down");
    receive.shutdown();
    send.shutdown();
    Ok(())
}
