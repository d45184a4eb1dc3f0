use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::alert::{Alert, AlertSink};
use super::face::{FaceSample, FaceWatch};
use super::warning::{Warning, WarningKind};
use crate::attempt::{AttemptDraft, AttemptStore, SubmissionPipeline, SubmitOutcome};
use crate::config::ProctoringConfig;
use crate::error::{ProctorError, Result};

pub const CAMERA_FAILURE_DESCRIPTION: &str = "Camera access failed";

#[derive(Debug, Clone)]
pub struct WarningRecord {
    pub warning: Warning,
    pub count: usize,
    pub threshold: u32,
    /// Set when this warning crossed the threshold and auto-submitted.
    pub submission: Option<SubmitOutcome>,
}

struct Tracked {
    draft: Arc<AttemptDraft>,
    faces: FaceWatch,
}

/// Decides, per attempt, when integrity warnings force a submission.
///
/// The in-memory warning list on the draft is authoritative for the
/// threshold; the store only mirrors it.
pub struct IntegrityMonitor {
    attempts: Mutex<HashMap<String, Tracked>>,
    store: Arc<dyn AttemptStore>,
    pipeline: Arc<SubmissionPipeline>,
    alerts: Arc<dyn AlertSink>,
    alert_duration: Duration,
}

impl IntegrityMonitor {
    pub fn new(
        store: Arc<dyn AttemptStore>,
        pipeline: Arc<SubmissionPipeline>,
        alerts: Arc<dyn AlertSink>,
        config: &ProctoringConfig,
    ) -> Self {
        Self {
            attempts: Mutex::new(HashMap::new()),
            store,
            pipeline,
            alerts,
            alert_duration: config.alert_duration,
        }
    }

    pub fn attach(&self, draft: Arc<AttemptDraft>) {
        tracing::debug!(attempt_id = %draft.attempt_id(), "Integrity monitoring attached");
        self.attempts().insert(
            draft.attempt_id().to_string(),
            Tracked {
                draft,
                faces: FaceWatch::new(),
            },
        );
    }

    pub fn detach(&self, attempt_id: &str) -> bool {
        self.attempts().remove(attempt_id).is_some()
    }

    pub fn draft(&self, attempt_id: &str) -> Option<Arc<AttemptDraft>> {
        self.attempts().get(attempt_id).map(|t| t.draft.clone())
    }

    /// Appends a warning, mirrors it to the store, raises an alert and
    /// auto-submits when the allowed count is reached.
    ///
    /// Fails with `AttemptClosed` once the attempt is submitting or
    /// submitted, and with `SubmissionFailed` when the triggered auto-submit
    /// could not be finalized.
    pub async fn record_warning(
        &self,
        attempt_id: &str,
        kind: WarningKind,
        description: Option<&str>,
    ) -> Result<WarningRecord> {
        let draft = self
            .draft(attempt_id)
            .ok_or_else(|| ProctorError::AttemptNotFound(attempt_id.to_string()))?;

        let warning = Warning::new(kind, description);
        let appended = draft.append_warning(warning.clone())?;

        tracing::warn!(
            attempt_id = %attempt_id,
            kind = ?kind,
            count = appended.count,
            threshold = appended.threshold,
            "Integrity warning recorded"
        );

        if let Err(e) = self.store.append_warning(attempt_id, &warning).await {
            tracing::error!(attempt_id = %attempt_id, error = %e, "Failed to persist warning");
        }

        self.alerts.show(Alert::for_warning(&warning, self.alert_duration));

        let submission = match appended.ticket {
            Some(ticket) => {
                tracing::warn!(
                    attempt_id = %attempt_id,
                    count = appended.count,
                    "Warning threshold reached, auto-submitting"
                );
                Some(self.pipeline.finalize(&draft, ticket).await?)
            }
            None => None,
        };

        Ok(WarningRecord {
            warning,
            count: appended.count,
            threshold: appended.threshold,
            submission,
        })
    }

    /// Feeds one detector result through the attempt's edge detector.
    pub async fn record_face_sample(
        &self,
        attempt_id: &str,
        sample: FaceSample,
    ) -> Result<Option<WarningRecord>> {
        let kind = {
            let mut attempts = self.attempts();
            let tracked = attempts
                .get_mut(attempt_id)
                .ok_or_else(|| ProctorError::AttemptNotFound(attempt_id.to_string()))?;
            tracked.faces.observe(sample)
        };

        match kind {
            Some(kind) => self.record_warning(attempt_id, kind, None).await.map(Some),
            None => Ok(None),
        }
    }

    /// Camera or microphone could not be acquired: monitoring is degraded,
    /// which counts as a no-face warning.
    pub async fn record_media_failure(
        &self,
        attempt_id: &str,
        error: &ProctorError,
    ) -> Result<WarningRecord> {
        tracing::error!(attempt_id = %attempt_id, error = %error, "Media acquisition failed");
        self.record_warning(attempt_id, WarningKind::NoFace, Some(CAMERA_FAILURE_DESCRIPTION))
            .await
    }

    fn attempts(&self) -> MutexGuard<'_, HashMap<String, Tracked>> {
        self.attempts.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
