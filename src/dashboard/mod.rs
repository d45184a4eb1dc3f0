//! Professor-side live view of a quiz's running attempts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::attempt::{Attempt, AttemptChange, AttemptStore, AttemptSubscription};
use crate::config::ProctoringConfig;
use crate::error::{ProctorError, Result};
use crate::integrity::Warning;

const UNKNOWN_STUDENT: &str = "Unknown Student";

/// Display metadata for students. Email needs elevated access and may be
/// missing; nothing depends on it.
#[async_trait]
pub trait StudentDirectory: Send + Sync {
    async fn display_name(&self, student_id: &str) -> Result<Option<String>>;

    async fn email(&self, student_id: &str) -> Result<Option<String>>;
}

/// Fixed directory, e.g. loaded from a roster file.
#[derive(Debug, Default, Clone)]
pub struct StaticDirectory {
    entries: HashMap<String, (String, Option<String>)>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_student(mut self, student_id: &str, name: &str, email: Option<&str>) -> Self {
        self.entries.insert(
            student_id.to_string(),
            (name.to_string(), email.map(str::to_string)),
        );
        self
    }
}

#[async_trait]
impl StudentDirectory for StaticDirectory {
    async fn display_name(&self, student_id: &str) -> Result<Option<String>> {
        Ok(self.entries.get(student_id).map(|(name, _)| name.clone()))
    }

    async fn email(&self, student_id: &str) -> Result<Option<String>> {
        Ok(self.entries.get(student_id).and_then(|(_, email)| email.clone()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringStudent {
    pub student_id: String,
    pub attempt_id: String,
    pub name: String,
    pub email: Option<String>,
    /// Answered questions.
    pub progress: usize,
    pub elapsed_secs: u64,
    pub warnings: Vec<Warning>,
    pub monitoring_available: bool,
}

#[derive(Clone)]
struct Profile {
    name: String,
    email: Option<String>,
}

/// Keeps the list of unsubmitted attempts current from the store's change
/// feed, with a slow reconciliation poll as fallback.
pub struct AttemptWatcher {
    quiz_id: String,
    store: Arc<dyn AttemptStore>,
    directory: Arc<dyn StudentDirectory>,
    reconcile_interval: Duration,
    students: StdMutex<HashMap<String, MonitoringStudent>>,
    profiles: Mutex<HashMap<String, Profile>>,
    snapshot_tx: watch::Sender<Vec<MonitoringStudent>>,
    shutdown_tx: watch::Sender<bool>,
    task: StdMutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl AttemptWatcher {
    pub fn new(
        quiz_id: impl Into<String>,
        store: Arc<dyn AttemptStore>,
        directory: Arc<dyn StudentDirectory>,
        config: &ProctoringConfig,
    ) -> Arc<Self> {
        let (snapshot_tx, _) = watch::channel(Vec::new());
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            quiz_id: quiz_id.into(),
            store,
            directory,
            reconcile_interval: config.reconcile_interval,
            students: StdMutex::new(HashMap::new()),
            profiles: Mutex::new(HashMap::new()),
            snapshot_tx,
            shutdown_tx,
            task: StdMutex::new(None),
            started: AtomicBool::new(false),
        })
    }

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        // Subscribe before the initial load so no change falls in between.
        let subscription = self.store.subscribe_to_attempts(&self.quiz_id).await?;
        self.refresh().await?;

        let handle = tokio::spawn(Self::run(
            Arc::downgrade(self),
            subscription,
            self.reconcile_interval,
            self.shutdown_tx.subscribe(),
        ));
        *self.task.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);

        tracing::info!(quiz_id = %self.quiz_id, "Attempt watcher started");
        Ok(())
    }

    async fn run(
        watcher: Weak<Self>,
        mut subscription: AttemptSubscription,
        reconcile_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut reconcile = tokio::time::interval_at(
            tokio::time::Instant::now() + reconcile_interval,
            reconcile_interval,
        );
        reconcile.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                change = subscription.recv() => {
                    let Some(change) = change else {
                        tracing::warn!("Attempt change feed closed");
                        break;
                    };
                    let Some(watcher) = watcher.upgrade() else { break };
                    watcher.apply_change(change).await;
                }
                _ = reconcile.tick() => {
                    let Some(watcher) = watcher.upgrade() else { break };
                    if let Err(e) = watcher.refresh().await {
                        tracing::warn!(quiz_id = %watcher.quiz_id, error = %e, "Reconciliation poll failed");
                    }
                }
            }
        }
    }

    /// Rebuilds the view from the store.
    pub async fn refresh(&self) -> Result<()> {
        let attempts = self.store.list_attempts(&self.quiz_id).await?;

        let mut students = HashMap::new();
        for attempt in attempts.iter().filter(|a| !a.is_submitted()) {
            let student = self.build(attempt).await;
            students.insert(attempt.id.clone(), student);
        }

        tracing::debug!(quiz_id = %self.quiz_id, active = students.len(), "Monitoring view refreshed");
        *self.students_map() = students;
        self.publish();
        Ok(())
    }

    async fn apply_change(&self, change: AttemptChange) {
        let attempt = change.attempt;
        if attempt.is_submitted() {
            if self.students_map().remove(&attempt.id).is_some() {
                tracing::info!(student_id = %attempt.student_id, auto_submitted = attempt.auto_submitted, "Student finished");
            }
        } else {
            let student = self.build(&attempt).await;
            self.students_map().insert(attempt.id.clone(), student);
        }
        self.publish();
    }

    async fn build(&self, attempt: &Attempt) -> MonitoringStudent {
        let profile = self.profile(&attempt.student_id).await;
        let elapsed = (Utc::now() - attempt.started_at).num_seconds().max(0) as u64;

        MonitoringStudent {
            student_id: attempt.student_id.clone(),
            attempt_id: attempt.id.clone(),
            name: profile.name,
            email: profile.email,
            progress: attempt.answers.values().filter(|selected| !selected.is_empty()).count(),
            elapsed_secs: elapsed,
            warnings: attempt.warnings.clone(),
            monitoring_available: attempt.monitoring_available,
        }
    }

    async fn profile(&self, student_id: &str) -> Profile {
        let mut profiles = self.profiles.lock().await;
        if let Some(profile) = profiles.get(student_id) {
            return profile.clone();
        }

        let name = match self.directory.display_name(student_id).await {
            Ok(Some(name)) => name,
            Ok(None) => UNKNOWN_STUDENT.to_string(),
            Err(e) => {
                tracing::warn!(student_id = %student_id, error = %e, "Student name lookup failed");
                UNKNOWN_STUDENT.to_string()
            }
        };
        let email = match self.directory.email(student_id).await {
            Ok(email) => email,
            Err(e) => {
                tracing::debug!(student_id = %student_id, error = %e, "Email lookup unavailable");
                None
            }
        };

        let profile = Profile { name, email };
        profiles.insert(student_id.to_string(), profile.clone());
        profile
    }

    /// Students with an unsubmitted attempt, by name.
    pub fn students(&self) -> Vec<MonitoringStudent> {
        let mut students: Vec<MonitoringStudent> = self.students_map().values().cloned().collect();
        students.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.student_id.cmp(&b.student_id)));
        students
    }

    pub fn updates(&self) -> watch::Receiver<Vec<MonitoringStudent>> {
        self.snapshot_tx.subscribe()
    }

    /// Force-submits one student's attempt.
    pub async fn end_quiz_for_student(&self, attempt_id: &str) -> Result<()> {
        match self.store.force_submit(attempt_id).await {
            Ok(_) | Err(ProctorError::AlreadySubmitted(_)) => {}
            Err(e) => return Err(e),
        }
        self.students_map().remove(attempt_id);
        self.publish();
        tracing::info!(attempt_id = %attempt_id, "Quiz ended for student");
        Ok(())
    }

    /// Force-submits every open attempt and closes the quiz to new joins.
    pub async fn end_quiz_for_all(&self) -> Result<usize> {
        let count = self.store.force_submit_all(&self.quiz_id).await?;
        self.store.set_quiz_active(&self.quiz_id, false).await?;
        self.students_map().clear();
        self.publish();
        tracing::info!(quiz_id = %self.quiz_id, count = count, "Quiz ended for all students");
        Ok(count)
    }

    pub async fn stop(&self) {
        self.shutdown_tx.send_replace(true);
        let task = self.task.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.students());
    }

    fn students_map(&self) -> MutexGuard<'_, HashMap<String, MonitoringStudent>> {
        self.students.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Drop for AttemptWatcher {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().unwrap_or_else(|p| p.into_inner()).take() {
            task.abort();
        }
    }
}
