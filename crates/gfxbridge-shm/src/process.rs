use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};

use tracing::{error, info};

use crate::error::{Result, ShmError};

/// Handle to the spawned worker process.
///
/// The interceptor owns exactly one of these per bridge session. An exit
/// watcher thread fires the registered callback as soon as the worker
/// terminates; the session uses that to poison itself, since a bridge
/// without its worker cannot continue meaningfully.
pub struct WorkerProcess {
    child: Arc<Mutex<Option<Child>>>,
    pid: u32,
    program: String,
}

impl WorkerProcess {
    /// Spawn the worker executable with the given arguments.
    pub fn spawn(program: &str, args: &[String]) -> Result<Self> {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|source| ShmError::Spawn {
                program: program.to_string(),
                source,
            })?;
        let pid = child.id();
        info!(%program, pid, "spawned worker process");
        Ok(Self {
            child: Arc::new(Mutex::new(Some(child))),
            pid,
            program: program.to_string(),
        })
    }

    /// OS process id of the worker.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Register an exit callback, fired from a watcher thread when the
    /// worker terminates for any reason.
    ///
    /// The callback receives the exit code when one is available. The
    /// watcher polls `try_wait` so `kill` stays usable concurrently.
    /// Calling this more than once spawns independent watchers; the session
    /// registers exactly one.
    pub fn on_exit<F>(&self, callback: F)
    where
        F: FnOnce(Option<i32>) + Send + 'static,
    {
        let slot = Arc::clone(&self.child);
        let program = self.program.clone();
        let pid = self.pid;
        std::thread::Builder::new()
            .name("gfxbridge-worker-watch".to_string())
            .spawn(move || loop {
                {
                    let mut guard = slot.lock().expect("worker slot poisoned");
                    let Some(child) = guard.as_mut() else {
                        // Another watcher already reaped the worker.
                        return;
                    };
                    match child.try_wait() {
                        Ok(Some(status)) => {
                            *guard = None;
                            drop(guard);
                            error!(%program, pid, ?status, "worker process exited");
                            callback(status.code());
                            return;
                        }
                        Ok(None) => {}
                        Err(err) => {
                            *guard = None;
                            drop(guard);
                            error!(%program, pid, %err, "failed waiting on worker process");
                            callback(None);
                            return;
                        }
                    }
                }
                std::thread::sleep(std::time::Duration::from_millis(20));
            })
            .expect("failed to spawn worker watcher thread");
    }

    /// Kill the worker outright. Used on fatal session teardown; a worker
    /// already gone is not an error.
    pub fn kill(&self) {
        if let Some(child) = self.child.lock().expect("worker slot poisoned").as_mut() {
            let _ = child.kill();
        }
    }
}

impl std::fmt::Debug for WorkerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerProcess")
            .field("program", &self.program)
            .field("pid", &self.pid)
            .finish()
    }
}
