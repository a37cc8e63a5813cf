use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use crate::error::{CronError, Result};
use crate::job::{parse_cron_expr, Job};
use crate::master::dispatcher::Dispatcher;

/// Fallback sleep when no entry has an upcoming firing.
const IDLE_POLL: Duration = Duration::from_secs(1);

struct WheelEntry {
    job: Job,
    schedule: cron::Schedule,
    next: Option<DateTime<Utc>>,
}

type Entries = Arc<RwLock<HashMap<String, WheelEntry>>>;

/// Leader-local cron wheel keyed by job name.
///
/// Each due entry fires `dispatcher.dispatch(job)` on its own task, so a
/// slow dispatch never delays other entries; overlapping firings of one
/// job are permitted here and culled worker-side for `Forbid` jobs.
pub struct CronWheel {
    dispatcher: Arc<dyn Dispatcher>,
    entries: Entries,
    notify: Arc<Notify>,
    running: Arc<AtomicBool>,
    run_state: Mutex<Option<RunState>>,
}

struct RunState {
    handle: JoinHandle<()>,
    dispatches: TaskTracker,
}

impl CronWheel {
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            dispatcher,
            entries: Arc::new(RwLock::new(HashMap::new())),
            notify: Arc::new(Notify::new()),
            running: Arc::new(AtomicBool::new(false)),
            run_state: Mutex::new(None),
        }
    }

    /// Install a job, replacing any previous entry under the same name.
    pub fn add_job(&self, job: &Job) -> Result<()> {
        let schedule = parse_cron_expr(&job.cron_expr)?;
        let next = schedule.upcoming(Utc).next();
        let entry = WheelEntry {
            job: job.clone(),
            schedule,
            next,
        };

        let mut entries = self
            .entries
            .write()
            .map_err(|_| CronError::Internal("wheel entries lock poisoned".to_string()))?;
        entries.insert(job.name.clone(), entry);
        drop(entries);

        tracing::info!(job_name = %job.name, schedule = %job.cron_expr, "added job to scheduler");
        self.notify.notify_one();
        Ok(())
    }

    /// Remove a job. Removing an unknown name is a no-op.
    pub fn remove_job(&self, name: &str) {
        let removed = match self.entries.write() {
            Ok(mut entries) => entries.remove(name).is_some(),
            Err(_) => false,
        };
        if removed {
            tracing::info!(job_name = %name, "removed job from scheduler");
        }
        self.notify.notify_one();
    }

    /// Drop every entry. Used when leadership is lost so a later epoch
    /// reloads from the store without stale entries.
    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
        }
    }

    pub fn entry_count(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    /// Start the wheel loop. A second start without an intervening
    /// [`stop`] is a no-op.
    ///
    /// [`stop`]: CronWheel::stop
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("cron scheduler started");

        let dispatches = TaskTracker::new();
        let handle = tokio::spawn(run_wheel(
            self.entries.clone(),
            self.dispatcher.clone(),
            self.notify.clone(),
            self.running.clone(),
            dispatches.clone(),
        ));
        *self.run_state.lock().await = Some(RunState { handle, dispatches });
    }

    /// Halt firing and wait for the loop and all in-flight dispatch
    /// handlers to finish.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!("cron scheduler stopping");
        self.notify.notify_one();

        if let Some(state) = self.run_state.lock().await.take() {
            let _ = state.handle.await;
            state.dispatches.close();
            state.dispatches.wait().await;
        }
        tracing::info!("cron scheduler stopped");
    }
}

async fn run_wheel(
    entries: Entries,
    dispatcher: Arc<dyn Dispatcher>,
    notify: Arc<Notify>,
    running: Arc<AtomicBool>,
    dispatches: TaskTracker,
) {
    loop {
        if !running.load(Ordering::SeqCst) {
            break;
        }

        let now = Utc::now();
        let mut due = Vec::new();
        let mut min_next: Option<DateTime<Utc>> = None;
        if let Ok(mut entries) = entries.write() {
            for entry in entries.values_mut() {
                let Some(next) = entry.next else { continue };
                if next <= now {
                    due.push(entry.job.clone());
                    entry.next = entry.schedule.after(&now).next();
                }
                if let Some(upcoming) = entry.next {
                    min_next = Some(match min_next {
                        Some(m) if m <= upcoming => m,
                        _ => upcoming,
                    });
                }
            }
        }

        for job in due {
            let dispatcher = dispatcher.clone();
            let span = tracing::info_span!("dispatch", job_name = %job.name, job_id = %job.id);
            dispatches.spawn(
                async move {
                    tracing::info!("dispatching job");
                    if let Err(e) = dispatcher.dispatch(&job).await {
                        tracing::error!(error = %e, "failed to dispatch job");
                    }
                }
                .instrument(span),
            );
        }

        let sleep_for = min_next
            .map(|next| (next - Utc::now()).to_std().unwrap_or(Duration::ZERO))
            .unwrap_or(IDLE_POLL);
        tokio::select! {
            _ = tokio::time::sleep(sleep_for) => {}
            _ = notify.notified() => {}
        }
    }
}
