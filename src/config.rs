use anyhow::Result;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use nalgebra::{Point3, Vector3};

use crate::camera::Camera;
use crate::error::ConfigError;
use crate::geometry::{DEFAULT_TOLERANCE1, DEFAULT_TOLERANCE2};
use crate::pool::WorkerPool;
use crate::processor::{Capability, PositionBackend, PositionSettings, Processor};
use crate::recognizer::{FaceRecognizer, PoseEstimator};
use crate::registry::ServerContext;

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub processor: Vec<ProcessorConfig>,
    #[serde(default)]
    pub camera: Vec<CameraConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// フレーム受信用のリッスンアドレス
    #[serde(default = "default_listen_receive")]
    pub listen_receive: String,
    /// 結果送信用のリッスンアドレス
    #[serde(default = "default_listen_send")]
    pub listen_send: String,
    /// 推論ワーカースレッド数
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// ワーカー待ち行列の深さ（超過フレームは破棄）
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProcessorConfig {
    /// "face_recognition" / "openpose" / "position"
    pub capability: String,
    /// 同一プロセッサの最小起動間隔（ミリ秒）
    #[serde(default = "default_process_interval_ms")]
    pub process_interval_ms: u64,
    /// position用: 検出元 ("openpose" / "face_recognition")
    #[serde(default = "default_backend")]
    pub backend: String,
    /// position用: カメラ1台のときにレイを打ち切る距離
    #[serde(default = "default_single_camera_distance")]
    pub single_camera_distance: f64,
    #[serde(default = "default_tolerance1")]
    pub tolerance1: f64,
    #[serde(default = "default_tolerance2")]
    pub tolerance2: f64,
    /// position用: 全カメラの結果待ちの上限（ミリ秒）
    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CameraConfig {
    pub id: String,
    /// ワールド座標での設置位置 [x, y, z]
    pub position: [f64; 3],
    /// 光軸方向ベクトル
    pub forward: [f64; 3],
    /// 画像x軸のワールド方向（forward と直交であること）
    pub axis_x: [f64; 3],
    /// 垂直視野角（度）
    pub theta_deg: Option<f64>,
    /// 水平視野角（度）
    pub phi_deg: Option<f64>,
    /// 画像の幅/高さ比
    pub whratio: Option<f64>,
}

fn default_listen_receive() -> String { "0.0.0.0:8388".to_string() }
fn default_listen_send() -> String { "0.0.0.0:8389".to_string() }
fn default_workers() -> usize { 4 }
fn default_queue_depth() -> usize { 16 }
fn default_process_interval_ms() -> u64 { 100 }
fn default_backend() -> String { "openpose".to_string() }
fn default_single_camera_distance() -> f64 { 5.0 }
fn default_tolerance1() -> f64 { DEFAULT_TOLERANCE1 }
fn default_tolerance2() -> f64 { DEFAULT_TOLERANCE2 }
fn default_wait_timeout_ms() -> u64 { 1000 }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_receive: default_listen_receive(),
            listen_send: default_listen_send(),
            workers: default_workers(),
            queue_depth: default_queue_depth(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

impl CameraConfig {
    fn build(&self) -> Result<Camera, ConfigError> {
        Camera::new(
            Point3::from(self.position),
            Vector3::from(self.forward),
            Vector3::from(self.axis_x),
            self.theta_deg.map(f64::to_radians),
            self.phi_deg.map(f64::to_radians),
            self.whratio,
        )
    }
}

/// 設定から共有コンテキストを組み立てる。認識器は外から注入する
/// （ここではプロセスに実体を持たせない）。
pub fn build_context(
    config: &Config,
    face: Option<Arc<dyn FaceRecognizer>>,
    pose: Option<Arc<dyn PoseEstimator>>,
) -> Result<Arc<ServerContext>, ConfigError> {
    let mut cameras = BTreeMap::new();
    for cam in &config.camera {
        cameras.insert(cam.id.clone(), cam.build()?);
    }

    let mut processors: Vec<Arc<Processor>> = Vec::new();
    for proc in &config.processor {
        let capability = Capability::from_name(&proc.capability)?;
        if processors.iter().any(|p| p.capability() == capability) {
            return Err(ConfigError::DuplicateCapability(proc.capability.clone()));
        }
        let interval = Duration::from_millis(proc.process_interval_ms);
        let processor = match capability {
            Capability::FaceRecognition => {
                let face = face
                    .clone()
                    .ok_or(ConfigError::MissingRecognizer("face_recognition"))?;
                Processor::face(face, interval)
            }
            Capability::OpenPose => {
                let pose = pose
                    .clone()
                    .ok_or(ConfigError::MissingRecognizer("openpose"))?;
                Processor::pose(pose, interval)
            }
            Capability::Position => {
                if cameras.is_empty() {
                    return Err(ConfigError::NoCameras);
                }
                Processor::position(
                    PositionSettings {
                        backend: PositionBackend::from_name(&proc.backend)?,
                        single_camera_distance: proc.single_camera_distance,
                        tolerance1: proc.tolerance1,
                        tolerance2: proc.tolerance2,
                        wait_timeout: Duration::from_millis(proc.wait_timeout_ms),
                    },
                    interval,
                )
            }
        };
        processors.push(Arc::new(processor));
    }

    let pool = WorkerPool::new(config.server.workers, config.server.queue_depth);
    Ok(Arc::new(ServerContext::new(processors, cameras, pool)))
}
