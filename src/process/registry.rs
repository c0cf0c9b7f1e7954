//! Process registry for running jobs.
//!
//! Cancellation and crash recovery need to reach the assistant (and the
//! index watcher) by job id after the spawning worker has moved on. This
//! registry is the sole mutator of the `assistant_pid` field on running
//! jobs: workers read PIDs from here before persisting them.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct RunningJob {
    pub assistant_pid: Option<u32>,
    pub watcher_pid: Option<u32>,
}

static RUNNING: Lazy<Mutex<HashMap<Uuid, RunningJob>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn with_entry(job_id: Uuid, f: impl FnOnce(&mut RunningJob)) {
    let mut guard = RUNNING.lock().unwrap_or_else(|e| e.into_inner());
    f(guard.entry(job_id).or_default());
}

pub fn set_assistant(job_id: Uuid, pid: u32) {
    with_entry(job_id, |e| e.assistant_pid = Some(pid));
}

pub fn clear_assistant(job_id: Uuid) {
    with_entry(job_id, |e| e.assistant_pid = None);
}

pub fn set_watcher(job_id: Uuid, pid: u32) {
    with_entry(job_id, |e| e.watcher_pid = Some(pid));
}

pub fn clear_watcher(job_id: Uuid) {
    with_entry(job_id, |e| e.watcher_pid = None);
}

pub fn get(job_id: Uuid) -> Option<RunningJob> {
    let guard = RUNNING.lock().unwrap_or_else(|e| e.into_inner());
    guard.get(&job_id).cloned()
}

/// Drop the whole entry once a job reaches a terminal state
pub fn remove(job_id: Uuid) {
    let mut guard = RUNNING.lock().unwrap_or_else(|e| e.into_inner());
    guard.remove(&job_id);
}

/// Number of live watcher registrations across all jobs
pub fn watcher_count() -> usize {
    let guard = RUNNING.lock().unwrap_or_else(|e| e.into_inner());
    guard.values().filter(|e| e.watcher_pid.is_some()).count()
}

/// Send the platform's graceful termination signal to every process
/// registered for the given job. Returns the PIDs that were signalled.
pub fn interrupt(job_id: Uuid) -> Vec<u32> {
    let Some(entry) = get(job_id) else {
        return Vec::new();
    };
    let mut signalled = Vec::new();
    for pid in [entry.assistant_pid, entry.watcher_pid].into_iter().flatten() {
        if super::send_signal(pid, super::Signal::Term) {
            signalled.push(pid);
        }
    }
    signalled
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_tracks_assistant_and_watcher() {
        let id = Uuid::new_v4();
        set_assistant(id, 100);
        set_watcher(id, 200);

        let entry = get(id).expect("entry");
        assert_eq!(entry.assistant_pid, Some(100));
        assert_eq!(entry.watcher_pid, Some(200));

        clear_watcher(id);
        assert_eq!(get(id).unwrap().watcher_pid, None);

        remove(id);
        assert!(get(id).is_none());
    }

    #[test]
    fn watcher_count_reflects_registrations() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let before = watcher_count();

        set_watcher(a, 300);
        set_watcher(b, 301);
        assert_eq!(watcher_count(), before + 2);

        clear_watcher(a);
        remove(b);
        assert_eq!(watcher_count(), before);
        remove(a);
    }
}
