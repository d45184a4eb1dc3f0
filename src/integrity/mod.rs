pub mod alert;
pub mod face;
pub mod monitor;
pub mod warning;

pub use alert::{Alert, AlertSink, ChannelAlertSink, TracingAlertSink};
pub use face::{FaceCondition, FaceDetector, FaceSample, FaceWatch};
pub use monitor::{IntegrityMonitor, WarningRecord, CAMERA_FAILURE_DESCRIPTION};
pub use warning::{Warning, WarningKind};
