pub mod monitor_link;
pub mod proctor_link;

pub use monitor_link::{MonitorLink, StreamObserver};
pub use proctor_link::{LinkStatus, ProctorLink};
