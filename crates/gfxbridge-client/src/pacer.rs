use std::time::Duration;

use gfxbridge_shm::{NamedSemaphore, ShmError};
use tracing::warn;

/// Paces frame submission so the interceptor never runs more than a
/// bounded number of frames ahead of the worker.
///
/// The semaphore starts at `max_frames_ahead`; the interceptor takes one
/// count per present, the worker posts one back after consuming a frame.
/// A wait that exhausts the safety timeout means the worker has stopped
/// consuming frames entirely, which the session treats as fatal.
#[derive(Debug)]
pub struct FramePacer {
    sem: NamedSemaphore,
    timeout: Duration,
}

impl FramePacer {
    pub fn new(sem: NamedSemaphore, timeout: Duration) -> Self {
        Self { sem, timeout }
    }

    /// Block until the worker is within the frame budget. Returns false
    /// if the safety timeout expired.
    pub fn acquire_frame(&self) -> bool {
        match self.sem.wait(self.timeout) {
            Ok(()) => true,
            Err(ShmError::SemaphoreTimeout(t)) => {
                warn!(timeout = ?t, "worker stopped consuming frames");
                false
            }
            Err(err) => {
                warn!(%err, "frame pacing semaphore failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique(name: &str) -> String {
        format!("gfxbridge-pacer-{name}-{}", std::process::id())
    }

    #[test]
    fn budget_frames_are_free_then_waits() {
        let sem = NamedSemaphore::create(&unique("budget"), 2).unwrap();
        let pacer = FramePacer::new(sem, Duration::from_millis(30));
        assert!(pacer.acquire_frame());
        assert!(pacer.acquire_frame());
        // Budget exhausted, worker never posts: the wait fails.
        assert!(!pacer.acquire_frame());
    }

    #[test]
    fn worker_post_releases_a_frame() {
        let name = unique("release");
        let sem = NamedSemaphore::create(&name, 0).unwrap();
        let worker_side = NamedSemaphore::open(&name).unwrap();
        let pacer = FramePacer::new(sem, Duration::from_secs(2));

        let worker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            worker_side.post().unwrap();
        });
        assert!(pacer.acquire_frame());
        worker.join().unwrap();
    }
}
