//! Error types shared across the transport, geometry and dispatch layers.

use thiserror::Error;

/// Failures on the framed channel.
///
/// `Io` and `BadLength` are transport-level: the connection is considered
/// dead and the owning handler raises its termination signal. Everything
/// else is recoverable; the offending field is dropped or skipped.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("length field is not a decimal integer: {0:?}")]
    BadLength(String),

    #[error("payload is not valid UTF-8")]
    BadUtf8(#[from] std::string::FromUtf8Error),

    #[error("failed to parse {kind} from {text:?}")]
    BadScalar { kind: &'static str, text: String },

    #[error("image payload of {len} bytes does not divide into {width}x{height} pixels")]
    BadImageShape { len: usize, width: u32, height: u32 },

    #[error("base64 payload: {0}")]
    BadBase64(#[from] base64::DecodeError),

    #[error("image codec: {0}")]
    Codec(#[from] image::ImageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Whether the connection itself should be torn down.
    pub fn is_transport(&self) -> bool {
        matches!(self, ProtocolError::Io(_) | ProtocolError::BadLength(_))
    }
}

#[derive(Debug, Error)]
pub enum GeometryError {
    /// 平行な2直線には一意な最近点が存在しない
    #[error("parallel rays have no unique nearest point")]
    DegenerateRays,

    /// z方向成分がゼロの直線は z 平面と交わらない
    #[error("ray never reaches the requested z plane")]
    NoIntersection,
}

/// Construction-time configuration failures. All of these abort startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("camera forward axis and x axis are not orthogonal (dot = {dot:e})")]
    AxesNotOrthogonal { dot: f64 },

    #[error("at least two of theta, phi, whratio must be provided")]
    UnderconstrainedCamera,

    #[error("unknown capability {0:?}")]
    UnknownCapability(String),

    #[error("capability {0:?} is configured more than once")]
    DuplicateCapability(String),

    #[error("unknown position backend {0:?}")]
    UnknownBackend(String),

    #[error("capability {0:?} is enabled but no recognizer was provided")]
    MissingRecognizer(&'static str),

    #[error("no cameras configured")]
    NoCameras,
}

/// Failures inside a processor invocation. Logged by the dispatcher and
/// never propagated to the intake loop.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("backend capability {0:?} is not enabled on this server")]
    BackendUnavailable(&'static str),

    #[error("timed out waiting for results from all cameras")]
    Timeout,

    #[error("frame is missing required property {0:?}")]
    MissingProperty(&'static str),

    #[error(transparent)]
    Recognizer(#[from] anyhow::Error),
}
