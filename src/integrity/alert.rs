use std::time::Duration;

use tokio::sync::mpsc;

use super::warning::Warning;

/// Transient user-facing notice for one warning.
#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub message: String,
    pub dismiss_after: Duration,
}

impl Alert {
    pub fn for_warning(warning: &Warning, dismiss_after: Duration) -> Self {
        Self {
            message: format!("Warning: {}", warning.description),
            dismiss_after,
        }
    }
}

/// Presentation hook. Called once per recorded warning.
pub trait AlertSink: Send + Sync {
    fn show(&self, alert: Alert);
}

/// Logs alerts; used when no UI is attached.
#[derive(Debug, Default)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn show(&self, alert: Alert) {
        tracing::warn!(
            message = %alert.message,
            dismiss_after_ms = alert.dismiss_after.as_millis() as u64,
            "Integrity alert"
        );
    }
}

/// Forwards alerts to a UI task.
pub struct ChannelAlertSink {
    tx: mpsc::UnboundedSender<Alert>,
}

impl ChannelAlertSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Alert>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl AlertSink for ChannelAlertSink {
    fn show(&self, alert: Alert) {
        if self.tx.send(alert).is_err() {
            tracing::debug!("Alert receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::WarningKind;

    #[test]
    fn test_alert_message() {
        let warning = Warning::new(WarningKind::FocusLoss, None);
        let alert = Alert::for_warning(&warning, Duration::from_secs(3));
        assert_eq!(alert.message, "Warning: Window focus lost");
    }

    #[tokio::test]
    async fn test_channel_sink_delivers() {
        let (sink, mut rx) = ChannelAlertSink::channel();
        let warning = Warning::new(WarningKind::NoFace, None);
        sink.show(Alert::for_warning(&warning, Duration::from_secs(3)));

        let alert = rx.recv().await.unwrap();
        assert_eq!(alert.dismiss_after, Duration::from_secs(3));
    }
}
