//! Processor pool: one named processor per recognition capability, a state
//! machine per processor, and the dispatch path that feeds frames to them.
//!
//! State machine: `Available → Processing(client) → Pending(client) →
//! Available`. The `claim` flag is the per-processor lock: every transition
//! out of Available happens with the claim held, and the claim is released
//! on every exit path so a processor can never get stuck.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use nalgebra::{Point3, Vector3};

use crate::camera::Camera;
use crate::error::{ConfigError, ProcessError, ProtocolError};
use crate::frame::Frame;
use crate::geometry::calc_position;
use crate::protocol::FramedChannel;
use crate::recognizer::{
    FaceRecognizer, FaceResult, PoseEstimator, PoseResult, KP_MID_HIP, KP_NECK, KP_NOSE,
};
use crate::registry::ServerContext;

// ===========================================================================
// Capabilities
// ===========================================================================

/// The closed set of recognition capabilities this server can host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    FaceRecognition,
    OpenPose,
    Position,
}

impl Capability {
    pub fn name(&self) -> &'static str {
        match self {
            Capability::FaceRecognition => "face_recognition",
            Capability::OpenPose => "openpose",
            Capability::Position => "position",
        }
    }

    pub fn from_name(name: &str) -> Result<Self, ConfigError> {
        match name {
            "face_recognition" => Ok(Capability::FaceRecognition),
            "openpose" => Ok(Capability::OpenPose),
            "position" => Ok(Capability::Position),
            other => Err(ConfigError::UnknownCapability(other.to_string())),
        }
    }
}

/// Upstream capability the position processor reads its detections from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionBackend {
    OpenPose,
    FaceRecognition,
}

impl PositionBackend {
    pub fn from_name(name: &str) -> Result<Self, ConfigError> {
        match name {
            "openpose" => Ok(PositionBackend::OpenPose),
            "face_recognition" => Ok(PositionBackend::FaceRecognition),
            other => Err(ConfigError::UnknownBackend(other.to_string())),
        }
    }

    fn capability(&self) -> Capability {
        match self {
            PositionBackend::OpenPose => Capability::OpenPose,
            PositionBackend::FaceRecognition => Capability::FaceRecognition,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PositionSettings {
    pub backend: PositionBackend,
    /// Distance along the ray used when only one camera is configured and
    /// triangulation is impossible.
    pub single_camera_distance: f64,
    pub tolerance1: f64,
    pub tolerance2: f64,
    /// Bound on waiting for every camera to publish a fresh result.
    pub wait_timeout: Duration,
}

// ===========================================================================
// Processor state
// ===========================================================================

/// Client ids are the peer IP of the connection that sent the frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessorState {
    Available,
    Processing(String),
    Pending(String),
}

/// One completed invocation, kept until the send loop drains it.
#[derive(Debug, Clone)]
pub enum ProcResult {
    Faces(FaceResult),
    Poses(PoseResult),
    Positions {
        timestamp: i64,
        estimates: Vec<Point3<f64>>,
    },
}

struct Slot {
    state: ProcessorState,
    current: Option<Frame>,
    result: Option<ProcResult>,
}

enum Logic {
    Face(Arc<dyn FaceRecognizer>),
    Pose(Arc<dyn PoseEstimator>),
    Position {
        settings: PositionSettings,
        /// "backend never enabled" is reported once, then a standing no-op.
        reported_missing: AtomicBool,
    },
}

pub struct Processor {
    capability: Capability,
    min_interval: Duration,
    claim: AtomicBool,
    slot: Mutex<Slot>,
    last_invocation: Mutex<Option<Instant>>,
    logic: Logic,
}

impl Processor {
    fn new(capability: Capability, min_interval: Duration, logic: Logic) -> Self {
        Self {
            capability,
            min_interval,
            claim: AtomicBool::new(false),
            slot: Mutex::new(Slot {
                state: ProcessorState::Available,
                current: None,
                result: None,
            }),
            last_invocation: Mutex::new(None),
            logic,
        }
    }

    pub fn face(recognizer: Arc<dyn FaceRecognizer>, min_interval: Duration) -> Self {
        Self::new(Capability::FaceRecognition, min_interval, Logic::Face(recognizer))
    }

    pub fn pose(estimator: Arc<dyn PoseEstimator>, min_interval: Duration) -> Self {
        Self::new(Capability::OpenPose, min_interval, Logic::Pose(estimator))
    }

    pub fn position(settings: PositionSettings, min_interval: Duration) -> Self {
        Self::new(
            Capability::Position,
            min_interval,
            Logic::Position {
                settings,
                reported_missing: AtomicBool::new(false),
            },
        )
    }

    pub fn capability(&self) -> Capability {
        self.capability
    }

    /// Snapshot of the state label. Only trustworthy for dispatch decisions
    /// while the claim is held; the send loop uses it to find Pending work.
    pub fn state(&self) -> ProcessorState {
        self.slot.lock().unwrap().state.clone()
    }

    pub fn is_pending_for(&self, client: &str) -> bool {
        matches!(&self.slot.lock().unwrap().state,
                 ProcessorState::Pending(c) if c == client)
    }

    /// Non-blocking claim; exactly one dispatcher wins a free processor.
    pub fn try_claim(&self) -> bool {
        self.claim
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn release(&self) {
        self.claim.store(false, Ordering::Release);
    }

    /// Minimum inter-invocation interval. Frames arriving faster are dropped
    /// for this processor without error.
    fn rate_limited(&self) -> bool {
        let mut last = self.last_invocation.lock().unwrap();
        let now = Instant::now();
        match *last {
            Some(t) if now.duration_since(t) < self.min_interval => true,
            _ => {
                *last = Some(now);
                false
            }
        }
    }

    /// Transition Available → Processing(client) and snapshot the frame.
    /// Caller must hold the claim.
    pub(crate) fn begin(&self, client: &str, frame: Frame) {
        let mut slot = self.slot.lock().unwrap();
        slot.state = ProcessorState::Processing(client.to_string());
        slot.current = Some(frame);
    }

    /// Undo `begin` when the job could not be queued. Caller holds the claim.
    pub(crate) fn rollback(&self) {
        let mut slot = self.slot.lock().unwrap();
        slot.state = ProcessorState::Available;
        slot.current = None;
    }

    /// Worker-side execution: run the capability logic, transition to
    /// Pending on success or back to Available on failure, then release
    /// the claim.
    pub(crate) fn run(&self, ctx: &ServerContext) {
        let frame = self.slot.lock().unwrap().current.clone();
        let outcome = match frame {
            Some(frame) => self.process(&frame, ctx),
            None => Err(ProcessError::MissingProperty("frame")),
        };

        {
            let mut slot = self.slot.lock().unwrap();
            match outcome {
                Ok(result) => {
                    let client = match &slot.state {
                        ProcessorState::Processing(c) => c.clone(),
                        // Connection already torn down; nothing to deliver to.
                        _ => {
                            slot.state = ProcessorState::Available;
                            slot.current = None;
                            self.release();
                            return;
                        }
                    };
                    slot.result = Some(result);
                    slot.state = ProcessorState::Pending(client);
                }
                Err(e) => {
                    log::warn!("{} processing failed: {e}", self.capability.name());
                    slot.state = ProcessorState::Available;
                    slot.current = None;
                    slot.result = None;
                }
            }
        }
        ctx.pending.notify();
        self.release();
    }

    /// Drain the result and return to Available. Called by the send loop
    /// after emission, regardless of send outcome.
    pub fn reset_available(&self) {
        let mut slot = self.slot.lock().unwrap();
        slot.state = ProcessorState::Available;
        slot.current = None;
        slot.result = None;
    }

    // -----------------------------------------------------------------------
    // Capability logic
    // -----------------------------------------------------------------------

    fn process(&self, frame: &Frame, ctx: &ServerContext) -> Result<ProcResult, ProcessError> {
        let camera_id = frame
            .camera_id()
            .ok_or(ProcessError::MissingProperty("camera_id"))?;
        match &self.logic {
            Logic::Face(recognizer) => {
                let image = frame.image.drop_alpha();
                let result = recognizer.recognize(&image)?;
                log::debug!("found {} face(s) in frame from {camera_id}", result.len());
                ctx.face_results.publish(&camera_id, result.clone());
                Ok(ProcResult::Faces(result))
            }
            Logic::Pose(estimator) => {
                let image = frame.image.drop_alpha();
                let result = estimator.find_pose(&image)?;
                log::debug!(
                    "found {} person(s) in frame from {camera_id}",
                    result.person_count()
                );
                ctx.pose_results.publish(&camera_id, result.clone());
                Ok(ProcResult::Poses(result))
            }
            Logic::Position {
                settings,
                reported_missing,
            } => process_position(settings, reported_missing, frame, ctx),
        }
    }

    // -----------------------------------------------------------------------
    // Result emission
    // -----------------------------------------------------------------------

    /// Write the `"type:<capability>:<camera_id>"` header, then the
    /// capability payload. Payload failures are caught and logged so the
    /// caller still resets the state (no infinite Pending); header failures
    /// propagate because nothing was delivered at all.
    pub fn base_send<S: Read + Write>(
        &self,
        chan: &mut FramedChannel<S>,
    ) -> Result<(), ProtocolError> {
        let (camera_id, result) = {
            let slot = self.slot.lock().unwrap();
            let camera_id = slot
                .current
                .as_ref()
                .and_then(Frame::camera_id)
                .unwrap_or_default();
            (camera_id, slot.result.clone())
        };

        chan.send_str(&format!("type:{}:{}", self.capability.name(), camera_id))?;
        if let Some(result) = result {
            if let Err(e) = send_payload(chan, &result) {
                log::warn!(
                    "failed to send {} payload: {e}",
                    self.capability.name()
                );
            }
        }
        Ok(())
    }
}

fn send_payload<S: Read + Write>(
    chan: &mut FramedChannel<S>,
    result: &ProcResult,
) -> Result<(), ProtocolError> {
    match result {
        ProcResult::Faces(faces) => {
            chan.send_int(faces.len() as i64)?;
            for (id, b) in faces.ids.iter().zip(&faces.boxes) {
                chan.send_int(*id)?;
                chan.send_int(b.top)?;
                chan.send_int(b.right)?;
                chan.send_int(b.bottom)?;
                chan.send_int(b.left)?;
            }
            Ok(())
        }
        ProcResult::Poses(poses) => {
            let count = poses.person_count();
            chan.send_int(count as i64)?;
            // The keypoint array is only meaningful when someone was found.
            if count > 0 {
                chan.send_bytes(BASE64.encode(poses.to_le_bytes()).as_bytes())?;
            }
            Ok(())
        }
        ProcResult::Positions {
            timestamp,
            estimates,
        } => {
            chan.send_str(&format!("timestamp:int:{timestamp}"))?;
            chan.send_str("END")?;
            chan.send_int(estimates.len() as i64)?;
            for p in estimates {
                chan.send_float(p.x)?;
                chan.send_float(p.y)?;
                chan.send_float(p.z)?;
            }
            Ok(())
        }
    }
}

// ===========================================================================
// Dispatch
// ===========================================================================

/// Intake-side dispatch: offer the frame to every claimable processor and
/// hand the invocation to the worker pool. Never blocks on processing.
pub fn dispatch_frame(ctx: &Arc<ServerContext>, frame: &Frame, client_ip: &str) {
    if frame.camera_id().is_none() {
        log::warn!("dropping frame without camera_id from {client_ip}");
        return;
    }

    for processor in &ctx.processors {
        if !processor.try_claim() {
            continue;
        }
        // The claim is released once a job turns Pending, so holding it does
        // not imply Available: an undelivered result must survive until the
        // send loop drains it.
        if processor.state() != ProcessorState::Available {
            processor.release();
            continue;
        }
        if processor.rate_limited() {
            processor.release();
            continue;
        }

        processor.begin(client_ip, frame.clone());
        let job_proc = Arc::clone(processor);
        let job_ctx = Arc::clone(ctx);
        if !ctx.pool.try_submit(move || job_proc.run(&job_ctx)) {
            log::warn!(
                "worker queue full, dropping frame for {}",
                processor.capability().name()
            );
            processor.rollback();
            processor.release();
        }
    }
}

// ===========================================================================
// Position capability
// ===========================================================================

fn process_position(
    settings: &PositionSettings,
    reported_missing: &AtomicBool,
    frame: &Frame,
    ctx: &ServerContext,
) -> Result<ProcResult, ProcessError> {
    let timestamp = frame
        .props
        .get_int("timestamp")
        .ok_or(ProcessError::MissingProperty("timestamp"))?;

    let upstream = settings.backend.capability();
    if !ctx.has_capability(upstream) {
        // Report once, then keep the pipeline alive with empty results.
        if !reported_missing.swap(true, Ordering::SeqCst) {
            return Err(ProcessError::BackendUnavailable(upstream.name()));
        }
        return Ok(ProcResult::Positions {
            timestamp,
            estimates: Vec::new(),
        });
    }

    let camera_ids = ctx.camera_ids();
    let estimates = match settings.backend {
        PositionBackend::OpenPose => {
            let results = ctx
                .pose_results
                .wait_take_all(&camera_ids, settings.wait_timeout)?;
            position_from_poses(settings, ctx, &camera_ids, &results)
        }
        PositionBackend::FaceRecognition => {
            let results = ctx
                .face_results
                .wait_take_all(&camera_ids, settings.wait_timeout)?;
            position_from_faces(settings, ctx, &camera_ids, &results)
        }
    };

    log::debug!(
        "position: {} estimate(s) at timestamp {timestamp}",
        estimates.len()
    );
    Ok(ProcResult::Positions {
        timestamp,
        estimates,
    })
}

/// Pick the body keypoint used for localization: the one observed most
/// often across all cameras, preferring neck over nose over mid-hip.
fn choose_keypoint(results: &[&PoseResult]) -> usize {
    let mut num_nose = 0usize;
    let mut num_neck = 0usize;
    let mut num_midhip = 0usize;
    for pose in results {
        for person in 0..pose.person_count() {
            if !pose.is_zero(person, KP_NOSE) {
                num_nose += 1;
            }
            if !pose.is_zero(person, KP_NECK) {
                num_neck += 1;
            }
            if !pose.is_zero(person, KP_MID_HIP) {
                num_midhip += 1;
            }
        }
    }
    if num_neck >= num_nose && num_neck >= num_midhip {
        KP_NECK
    } else if num_nose >= num_midhip {
        KP_NOSE
    } else {
        KP_MID_HIP
    }
}

fn position_from_poses(
    settings: &PositionSettings,
    ctx: &ServerContext,
    camera_ids: &[String],
    results: &std::collections::HashMap<String, PoseResult>,
) -> Vec<Point3<f64>> {
    if let [only_id] = camera_ids {
        let camera = &ctx.cameras[only_id];
        let pose = &results[only_id];
        let mut estimates = Vec::new();
        for person in 0..pose.person_count() {
            // Fall through neck → nose → mid-hip for each person.
            let index = [KP_NECK, KP_NOSE, KP_MID_HIP]
                .into_iter()
                .find(|&i| !pose.is_zero(person, i));
            let Some(index) = index else { continue };
            let (x, y, _conf) = pose.keypoint(person, index);
            if let Some(p) = project_single(camera, x, y, settings.single_camera_distance) {
                estimates.push(p);
            }
        }
        return estimates;
    }

    let ordered: Vec<&PoseResult> = camera_ids.iter().map(|id| &results[id]).collect();
    let use_index = choose_keypoint(&ordered);

    let mut origins = Vec::with_capacity(camera_ids.len());
    let mut directions: Vec<Vec<Vector3<f64>>> = Vec::with_capacity(camera_ids.len());
    for (id, pose) in camera_ids.iter().zip(&ordered) {
        let camera = &ctx.cameras[id];
        origins.push(camera.position());
        let mut dirs = Vec::new();
        for person in 0..pose.person_count() {
            if pose.is_zero(person, use_index) {
                continue;
            }
            let (x, y, _conf) = pose.keypoint(person, use_index);
            dirs.push(camera.image_mapping(x, y).direction);
        }
        directions.push(dirs);
    }
    calc_position(&origins, &directions, settings.tolerance1, settings.tolerance2)
}

fn position_from_faces(
    settings: &PositionSettings,
    ctx: &ServerContext,
    camera_ids: &[String],
    results: &std::collections::HashMap<String, FaceResult>,
) -> Vec<Point3<f64>> {
    if let [only_id] = camera_ids {
        let camera = &ctx.cameras[only_id];
        let faces = &results[only_id];
        return faces
            .boxes
            .iter()
            .filter_map(|b| {
                let (x, y) = b.center_normalized(faces.width, faces.height);
                project_single(camera, x, y, settings.single_camera_distance)
            })
            .collect();
    }

    let mut origins = Vec::with_capacity(camera_ids.len());
    let mut directions: Vec<Vec<Vector3<f64>>> = Vec::with_capacity(camera_ids.len());
    for id in camera_ids {
        let camera = &ctx.cameras[id];
        let faces = &results[id];
        origins.push(camera.position());
        directions.push(
            faces
                .boxes
                .iter()
                .map(|b| {
                    let (x, y) = b.center_normalized(faces.width, faces.height);
                    camera.image_mapping(x, y).direction
                })
                .collect(),
        );
    }
    calc_position(&origins, &directions, settings.tolerance1, settings.tolerance2)
}

/// Single-camera fallback: project the detection ray to a fixed distance.
fn project_single(camera: &Camera, x: f64, y: f64, distance: f64) -> Option<Point3<f64>> {
    match camera.image_mapping(x, y).point_at_z(distance) {
        Ok(p) => Some(p),
        Err(e) => {
            log::debug!("skipping detection: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{ImageData, PropValue, PropertyBag};
    use crate::pool::WorkerPool;
    use crate::recognizer::{BoundingBox, POSE_CHANNELS, POSE_KEYPOINTS};
    use ndarray::Array3;
    use std::collections::BTreeMap;
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    struct FakeFaces {
        calls: AtomicUsize,
        fail: bool,
    }

    impl FakeFaces {
        fn new(fail: bool) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail,
            }
        }
    }

    impl FaceRecognizer for FakeFaces {
        fn recognize(&self, image: &ImageData) -> anyhow::Result<FaceResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("recognizer exploded");
            }
            Ok(FaceResult {
                ids: vec![7],
                boxes: vec![BoundingBox {
                    top: 10,
                    right: 40,
                    bottom: 30,
                    left: 20,
                }],
                width: image.width,
                height: image.height,
            })
        }
    }

    struct FakePoses;

    impl PoseEstimator for FakePoses {
        fn find_pose(&self, _image: &ImageData) -> anyhow::Result<PoseResult> {
            Ok(PoseResult::empty())
        }
    }

    fn test_frame(camera_id: &str) -> Frame {
        let mut props = PropertyBag::new();
        props.insert("camera_id", PropValue::Str(camera_id.to_string()));
        props.insert("timestamp", PropValue::Int(123));
        Frame::new(ImageData::new(4, 4, 3, vec![0; 48]), props)
    }

    fn test_camera(position: Point3<f64>) -> Camera {
        Camera::new(
            position,
            Vector3::new(0.0, 0.0, 1.0),
            Vector3::new(1.0, 0.0, 0.0),
            Some(std::f64::consts::FRAC_PI_2),
            None,
            Some(1.0),
        )
        .unwrap()
    }

    fn context_with(processors: Vec<Arc<Processor>>, cameras: BTreeMap<String, Camera>) -> Arc<ServerContext> {
        Arc::new(ServerContext::new(processors, cameras, WorkerPool::new(2, 4)))
    }

    fn channel_pair() -> (FramedChannel<TcpStream>, FramedChannel<TcpStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = thread::spawn(move || TcpStream::connect(addr).unwrap());
        let (server, _) = listener.accept().unwrap();
        (
            FramedChannel::new(client.join().unwrap()),
            FramedChannel::new(server),
        )
    }

    fn wait_for<F: Fn() -> bool>(cond: F) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_state_machine_full_cycle() {
        let recognizer = Arc::new(FakeFaces::new(false));
        let processor = Arc::new(Processor::face(recognizer.clone(), Duration::ZERO));
        let mut cameras = BTreeMap::new();
        cameras.insert("cam0".to_string(), test_camera(Point3::origin()));
        let ctx = context_with(vec![Arc::clone(&processor)], cameras);

        assert_eq!(processor.state(), ProcessorState::Available);
        dispatch_frame(&ctx, &test_frame("cam0"), "10.0.0.9");
        wait_for(|| processor.is_pending_for("10.0.0.9"));

        // Drain through base_send and reset, like the send loop does.
        let (mut tx, mut rx) = channel_pair();
        processor.base_send(&mut tx).unwrap();
        processor.reset_available();
        assert_eq!(processor.state(), ProcessorState::Available);

        assert_eq!(rx.recv_str().unwrap(), "type:face_recognition:cam0");
        assert_eq!(rx.recv_int().unwrap(), 1); // face count
        assert_eq!(rx.recv_int().unwrap(), 7); // id
        assert_eq!(
            (
                rx.recv_int().unwrap(),
                rx.recv_int().unwrap(),
                rx.recv_int().unwrap(),
                rx.recv_int().unwrap()
            ),
            (10, 40, 30, 20)
        );

        // The result was also published for the position capability.
        assert!(ctx.face_results.latest("cam0").is_some());
    }

    #[test]
    fn test_processing_failure_returns_to_available() {
        let recognizer = Arc::new(FakeFaces::new(true));
        let processor = Arc::new(Processor::face(recognizer.clone(), Duration::ZERO));
        let ctx = context_with(vec![Arc::clone(&processor)], BTreeMap::new());

        dispatch_frame(&ctx, &test_frame("cam0"), "10.0.0.9");
        wait_for(|| {
            recognizer.calls.load(Ordering::SeqCst) == 1
                && processor.state() == ProcessorState::Available
        });
        // The claim must be free again.
        assert!(processor.try_claim());
        processor.release();
    }

    #[test]
    fn test_concurrent_claims_have_one_winner() {
        let processor = Arc::new(Processor::face(
            Arc::new(FakeFaces::new(false)),
            Duration::ZERO,
        ));
        let winners = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let processor = Arc::clone(&processor);
                let winners = Arc::clone(&winners);
                thread::spawn(move || {
                    if processor.try_claim() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_rate_limit_drops_fast_frames() {
        let recognizer = Arc::new(FakeFaces::new(false));
        let processor = Arc::new(Processor::face(
            recognizer.clone(),
            Duration::from_secs(3600),
        ));
        let ctx = context_with(vec![Arc::clone(&processor)], BTreeMap::new());

        dispatch_frame(&ctx, &test_frame("cam0"), "10.0.0.9");
        wait_for(|| processor.is_pending_for("10.0.0.9"));
        processor.reset_available();

        // Within the interval: dropped without error, stays Available.
        dispatch_frame(&ctx, &test_frame("cam0"), "10.0.0.9");
        thread::sleep(Duration::from_millis(50));
        assert_eq!(processor.state(), ProcessorState::Available);
        assert_eq!(recognizer.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dispatch_skips_pending_processor() {
        let recognizer = Arc::new(FakeFaces::new(false));
        let processor = Arc::new(Processor::face(recognizer.clone(), Duration::ZERO));
        let ctx = context_with(vec![Arc::clone(&processor)], BTreeMap::new());

        dispatch_frame(&ctx, &test_frame("cam0"), "10.0.0.1");
        wait_for(|| processor.is_pending_for("10.0.0.1"));

        // The undelivered result belongs to the first client; a frame from
        // another client must not take over the slot.
        dispatch_frame(&ctx, &test_frame("cam0"), "10.0.0.2");
        thread::sleep(Duration::from_millis(50));
        assert!(processor.is_pending_for("10.0.0.1"));
        assert_eq!(recognizer.calls.load(Ordering::SeqCst), 1);

        // Draining frees the slot for the next client.
        processor.reset_available();
        dispatch_frame(&ctx, &test_frame("cam0"), "10.0.0.2");
        wait_for(|| processor.is_pending_for("10.0.0.2"));
    }

    /// Writer that accepts `budget` bytes, then fails like a closed peer.
    struct FailingStream {
        budget: usize,
    }

    impl Read for FailingStream {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Ok(0)
        }
    }

    impl Write for FailingStream {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if self.budget == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "peer closed",
                ));
            }
            let n = buf.len().min(self.budget);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_payload_send_failure_still_resets_to_available() {
        let processor = Arc::new(Processor::face(
            Arc::new(FakeFaces::new(false)),
            Duration::ZERO,
        ));
        let ctx = context_with(vec![Arc::clone(&processor)], BTreeMap::new());
        dispatch_frame(&ctx, &test_frame("cam0"), "10.0.0.9");
        wait_for(|| processor.is_pending_for("10.0.0.9"));

        // Budget covers the framed header line only; the payload write fails
        // and is swallowed, so base_send still reports success.
        let header = "type:face_recognition:cam0";
        let mut chan = FramedChannel::new(FailingStream {
            budget: 16 + header.len(),
        });
        assert!(processor.base_send(&mut chan).is_ok());
        processor.reset_available();
        assert_eq!(processor.state(), ProcessorState::Available);

        // A header failure propagates, but the drain resets the state
        // regardless, exactly as the send loop does.
        dispatch_frame(&ctx, &test_frame("cam0"), "10.0.0.9");
        wait_for(|| processor.is_pending_for("10.0.0.9"));
        let mut dead = FramedChannel::new(FailingStream { budget: 0 });
        assert!(processor.base_send(&mut dead).is_err());
        processor.reset_available();
        assert_eq!(processor.state(), ProcessorState::Available);
    }

    #[test]
    fn test_position_backend_missing_reports_once() {
        let settings = PositionSettings {
            backend: PositionBackend::OpenPose,
            single_camera_distance: 100.0,
            tolerance1: 0.15,
            tolerance2: 0.25,
            wait_timeout: Duration::from_millis(50),
        };
        let processor = Arc::new(Processor::position(settings, Duration::ZERO));
        let ctx = context_with(vec![Arc::clone(&processor)], BTreeMap::new());

        // First invocation fails loudly and resets to Available.
        assert!(processor.try_claim());
        processor.begin("10.0.0.9", test_frame("cam0"));
        processor.run(&ctx);
        assert_eq!(processor.state(), ProcessorState::Available);

        // Second invocation is a standing no-op: Pending with zero estimates.
        assert!(processor.try_claim());
        processor.begin("10.0.0.9", test_frame("cam0"));
        processor.run(&ctx);
        assert!(processor.is_pending_for("10.0.0.9"));
    }

    #[test]
    fn test_position_triangulates_from_two_cameras() {
        // Both cameras look down +z; the normalized pixel for each camera is
        // derived by projecting the target direction onto the image plane:
        // x = 0.5 - dx/(ex*dz), y = 0.5 - dy/(ey*dz) with ex = ey = 2.
        let target = Point3::new(1.0, 2.0, 3.0);
        let stations = [
            ("cam0", Point3::new(0.0, 0.0, 0.0)),
            ("cam1", Point3::new(2.0, 0.0, 0.0)),
            ("cam2", Point3::new(0.0, 2.0, 0.0)),
        ];
        let mut cameras = BTreeMap::new();
        for (id, origin) in stations {
            cameras.insert(id.to_string(), test_camera(origin));
        }

        let settings = PositionSettings {
            backend: PositionBackend::OpenPose,
            single_camera_distance: 100.0,
            tolerance1: 0.15,
            tolerance2: 0.25,
            wait_timeout: Duration::from_secs(2),
        };
        let position = Arc::new(Processor::position(settings, Duration::ZERO));
        let pose_proc = Arc::new(Processor::pose(Arc::new(FakePoses), Duration::ZERO));
        let ctx = context_with(vec![Arc::clone(&position), pose_proc], cameras);

        for (id, origin) in stations {
            let d = target - origin;
            let x = 0.5 - d.x / (2.0 * d.z);
            let y = 0.5 - d.y / (2.0 * d.z);
            let mut kp = Array3::zeros((1, POSE_KEYPOINTS, POSE_CHANNELS));
            kp[[0, KP_NECK, 0]] = x as f32;
            kp[[0, KP_NECK, 1]] = y as f32;
            kp[[0, KP_NECK, 2]] = 0.9;
            ctx.pose_results.publish(id, PoseResult::new(kp));
        }

        assert!(position.try_claim());
        position.begin("10.0.0.9", test_frame("cam0"));
        position.run(&ctx);
        assert!(position.is_pending_for("10.0.0.9"));

        let slot = position.slot.lock().unwrap();
        match slot.result.as_ref().unwrap() {
            ProcResult::Positions {
                timestamp,
                estimates,
            } => {
                assert_eq!(*timestamp, 123);
                assert_eq!(estimates.len(), 1);
                // f32 keypoint storage costs some precision
                assert!((estimates[0] - target).norm() < 1e-3);
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_pose_payload_encoding() {
        let mut kp = Array3::zeros((2, POSE_KEYPOINTS, POSE_CHANNELS));
        kp[[0, KP_NOSE, 0]] = 0.25;
        let result = ProcResult::Poses(PoseResult::new(kp.clone()));

        let (mut tx, mut rx) = channel_pair();
        send_payload(&mut tx, &result).unwrap();
        assert_eq!(rx.recv_int().unwrap(), 2);
        let blob = rx.recv_bytes().unwrap();
        let decoded = BASE64.decode(blob).unwrap();
        assert_eq!(decoded.len(), 2 * POSE_KEYPOINTS * POSE_CHANNELS * 4);
        assert_eq!(&decoded[..4], &0.25f32.to_le_bytes());
    }
}
