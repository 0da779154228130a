use std::ffi::CString;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{Result, ShmError};

/// A named POSIX counting semaphore shared between the interceptor and the
/// worker process.
///
/// gfxbridge uses one of these to pace frame submission: the interceptor
/// waits before presenting, the worker posts after consuming a frame, and
/// the initial count bounds how far ahead the interceptor may run.
pub struct NamedSemaphore {
    sem: *mut libc::sem_t,
    name: String,
    owner: bool,
}

// SAFETY: sem_t operations are documented as thread-safe; the raw pointer
// is only ever passed to sem_* functions.
unsafe impl Send for NamedSemaphore {}
// SAFETY: see above.
unsafe impl Sync for NamedSemaphore {}

impl NamedSemaphore {
    /// Create a named semaphore with the given initial count, replacing a
    /// stale one left by a crashed session.
    pub fn create(name: &str, initial: u32) -> Result<Self> {
        let cname = sem_name(name)?;

        // SAFETY: valid NUL-terminated string; ENOENT for a fresh name is fine.
        unsafe {
            libc::sem_unlink(cname.as_ptr());
        }

        // SAFETY: valid NUL-terminated string, owner-only mode, explicit count.
        let sem = unsafe {
            libc::sem_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                0o600 as libc::mode_t,
                initial,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(ShmError::Semaphore {
                name: name.to_string(),
                source: std::io::Error::last_os_error(),
            });
        }
        debug!(name, initial, "created named semaphore");
        Ok(Self {
            sem,
            name: name.to_string(),
            owner: true,
        })
    }

    /// Open a semaphore created by the peer process.
    pub fn open(name: &str) -> Result<Self> {
        let cname = sem_name(name)?;
        // SAFETY: valid NUL-terminated string.
        let sem = unsafe { libc::sem_open(cname.as_ptr(), 0) };
        if sem == libc::SEM_FAILED {
            return Err(ShmError::Semaphore {
                name: name.to_string(),
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(Self {
            sem,
            name: name.to_string(),
            owner: false,
        })
    }

    /// Increment the count, waking one waiter if any.
    pub fn post(&self) -> Result<()> {
        // SAFETY: `sem` is a live semaphore handle.
        let rc = unsafe { libc::sem_post(self.sem) };
        if rc != 0 {
            return Err(ShmError::Semaphore {
                name: self.name.clone(),
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    /// Decrement the count, blocking up to `timeout`.
    ///
    /// Returns `ShmError::SemaphoreTimeout` if the deadline passes first.
    /// Implemented as a trywait/park loop so the same code serves platforms
    /// without `sem_timedwait`.
    pub fn wait(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut backoff = Duration::from_micros(50);
        loop {
            // SAFETY: `sem` is a live semaphore handle.
            let rc = unsafe { libc::sem_trywait(self.sem) };
            if rc == 0 {
                return Ok(());
            }
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EINTR) => {}
                _ => {
                    return Err(ShmError::Semaphore {
                        name: self.name.clone(),
                        source: err,
                    })
                }
            }
            if Instant::now() >= deadline {
                return Err(ShmError::SemaphoreTimeout(timeout));
            }
            std::thread::sleep(backoff);
            backoff = (backoff * 2).min(Duration::from_millis(1));
        }
    }

    /// Decrement the count without blocking. Returns false if the count
    /// was zero.
    pub fn try_wait(&self) -> Result<bool> {
        // SAFETY: `sem` is a live semaphore handle.
        let rc = unsafe { libc::sem_trywait(self.sem) };
        if rc == 0 {
            return Ok(true);
        }
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) => Ok(false),
            _ => Err(ShmError::Semaphore {
                name: self.name.clone(),
                source: err,
            }),
        }
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        // SAFETY: `sem` is a live semaphore handle.
        unsafe {
            libc::sem_close(self.sem);
        }
        if self.owner {
            if let Ok(cname) = sem_name(&self.name) {
                // SAFETY: valid NUL-terminated string.
                unsafe {
                    libc::sem_unlink(cname.as_ptr());
                }
            }
        }
    }
}

impl std::fmt::Debug for NamedSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedSemaphore")
            .field("name", &self.name)
            .field("owner", &self.owner)
            .finish()
    }
}

fn sem_name(name: &str) -> Result<CString> {
    let bare = name.trim_start_matches('/');
    if bare.is_empty() || bare.len() > 240 || bare.contains('/') {
        return Err(ShmError::InvalidName {
            name: name.to_string(),
        });
    }
    CString::new(format!("/{bare}")).map_err(|_| ShmError::InvalidName {
        name: name.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn unique(name: &str) -> String {
        format!("gfxbridge-sem-{name}-{}", std::process::id())
    }

    #[test]
    fn post_then_wait_succeeds() {
        let sem = NamedSemaphore::create(&unique("basic"), 0).unwrap();
        sem.post().unwrap();
        sem.wait(Duration::from_millis(100)).unwrap();
    }

    #[test]
    fn initial_count_is_consumable() {
        let sem = NamedSemaphore::create(&unique("initial"), 3).unwrap();
        for _ in 0..3 {
            assert!(sem.try_wait().unwrap());
        }
        assert!(!sem.try_wait().unwrap());
    }

    #[test]
    fn wait_times_out_when_never_posted() {
        let sem = NamedSemaphore::create(&unique("timeout"), 0).unwrap();
        let start = Instant::now();
        let err = sem.wait(Duration::from_millis(30)).unwrap_err();
        assert!(matches!(err, ShmError::SemaphoreTimeout(_)));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn post_from_another_thread_wakes_waiter() {
        let sem = Arc::new(NamedSemaphore::create(&unique("cross"), 0).unwrap());
        let poster = Arc::clone(&sem);

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            poster.post().unwrap();
        });

        sem.wait(Duration::from_secs(2)).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn open_sees_creator_posts() {
        let name = unique("openpair");
        let created = NamedSemaphore::create(&name, 0).unwrap();
        let opened = NamedSemaphore::open(&name).unwrap();
        created.post().unwrap();
        opened.wait(Duration::from_millis(100)).unwrap();
    }
}
