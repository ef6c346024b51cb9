//! Named worker threads with cooperative shutdown
//!
//! Every processor runs one [`ThreadLoop`] on its own thread. The loop body
//! must return within a bounded wait so the exit flag is re-checked; exit is
//! never preemptive.

use crate::errors::{recover, CameraError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub trait ThreadLoop: Send + Sync + 'static {
    /// Run one iteration. Returning `false` ends the thread.
    fn thread_loop(&self) -> bool;
}

pub struct Worker {
    name: String,
    exit_flag: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    pub fn spawn(name: impl Into<String>, target: Arc<dyn ThreadLoop>) -> Result<Self, CameraError> {
        let name = name.into();
        let exit_flag = Arc::new(AtomicBool::new(false));

        let thread_exit = exit_flag.clone();
        let thread_name = name.clone();
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                log::debug!("{}: started", thread_name);
                while !thread_exit.load(Ordering::Acquire) {
                    if !target.thread_loop() {
                        break;
                    }
                }
                log::debug!("{}: exiting", thread_name);
            })?;

        Ok(Self {
            name,
            exit_flag,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn request_exit(&self) {
        self.exit_flag.store(true, Ordering::Release);
    }

    pub fn exit_pending(&self) -> bool {
        self.exit_flag.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(recover)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Request exit and wait up to `timeout` for the thread to finish.
    ///
    /// Called from the worker's own thread this only requests exit. On
    /// timeout the handle is kept so a later join can retry.
    pub fn join(&self, timeout: Duration) -> Result<(), CameraError> {
        self.request_exit();

        let Some(handle) = self.handle.lock().unwrap_or_else(recover).take() else {
            return Ok(());
        };
        if handle.thread().id() == std::thread::current().id() {
            *self.handle.lock().unwrap_or_else(recover) = Some(handle);
            return Ok(());
        }

        let start = Instant::now();
        let mut handle = Some(handle);
        loop {
            if handle.as_ref().is_some_and(|h| h.is_finished()) {
                if let Some(h) = handle.take() {
                    if h.join().is_err() {
                        log::error!("{}: worker panicked", self.name);
                    }
                }
                return Ok(());
            }
            if start.elapsed() >= timeout {
                log::warn!("{}: did not exit within {:?}", self.name, timeout);
                *self.handle.lock().unwrap_or_else(recover) = handle.take();
                return Err(CameraError::TimedOut);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.request_exit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counter {
        iterations: AtomicUsize,
        stop_after: usize,
    }

    impl ThreadLoop for Counter {
        fn thread_loop(&self) -> bool {
            let n = self.iterations.fetch_add(1, Ordering::SeqCst) + 1;
            std::thread::sleep(Duration::from_millis(1));
            n < self.stop_after
        }
    }

    #[test]
    fn test_loop_returning_false_ends_thread() {
        let counter = Arc::new(Counter {
            iterations: AtomicUsize::new(0),
            stop_after: 3,
        });
        let worker = Worker::spawn("test-worker", counter.clone()).unwrap();
        worker.join(Duration::from_secs(2)).unwrap();
        assert_eq!(counter.iterations.load(Ordering::SeqCst), 3);
        assert!(!worker.is_running());
    }

    #[test]
    fn test_request_exit_stops_endless_loop() {
        let counter = Arc::new(Counter {
            iterations: AtomicUsize::new(0),
            stop_after: usize::MAX,
        });
        let worker = Worker::spawn("endless", counter.clone()).unwrap();
        std::thread::sleep(Duration::from_millis(10));
        worker.request_exit();
        assert!(worker.exit_pending());
        worker.join(Duration::from_secs(2)).unwrap();
        assert!(counter.iterations.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn test_join_twice_is_ok() {
        let counter = Arc::new(Counter {
            iterations: AtomicUsize::new(0),
            stop_after: 1,
        });
        let worker = Worker::spawn("once", counter).unwrap();
        worker.join(Duration::from_secs(2)).unwrap();
        worker.join(Duration::from_secs(2)).unwrap();
    }
}
