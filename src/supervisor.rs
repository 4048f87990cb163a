//! Owns the lifetime of the background reconciliation task.

use std::future::Future;
use std::{io, panic};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A spawned task together with the token that stops it.
pub struct Supervisor {
    task: Mutex<Option<CancellableTask<()>>>,
}

impl Supervisor {
    /// Spawns `run` on the tokio runtime, handing it the stop token.
    pub fn start<F, Fut>(run: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let join_handle = tokio::spawn(run(token.clone()));
        Self {
            task: Mutex::new(Some(CancellableTask { join_handle, token })),
        }
    }

    /// Signals the task to stop and waits for it.
    ///
    /// Only the first call does anything; it returns `true`.
    pub async fn stop(&self) -> bool {
        let task = self.task.lock().take();
        match task {
            Some(task) => {
                task.cancel().await;
                true
            }
            None => false,
        }
    }
}

struct CancellableTask<T> {
    join_handle: JoinHandle<T>,
    token: CancellationToken,
}

impl<T> CancellableTask<T> {
    async fn cancel(self) {
        self.token.cancel();
        if let Err(err) = self.join_handle.await {
            if let Ok(panic) = err.try_into_panic() {
                panic::resume_unwind(panic)
            }
        }
    }
}

/// SIGINT and SIGTERM listeners, installed when the value is created.
///
/// Register before starting any work, so that a signal arriving during
/// startup is queued rather than handled by the default disposition.
#[cfg(unix)]
pub struct ShutdownSignal {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl ShutdownSignal {
    pub fn register() -> io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// Resolves on the first SIGINT or SIGTERM.
    pub async fn recv(mut self) -> io::Result<()> {
        tokio::select! {
            _ = self.interrupt.recv() => {}
            _ = self.terminate.recv() => {}
        }
        Ok(())
    }
}

#[cfg(not(unix))]
pub struct ShutdownSignal(());

#[cfg(not(unix))]
impl ShutdownSignal {
    pub fn register() -> io::Result<Self> {
        Ok(Self(()))
    }

    pub async fn recv(self) -> io::Result<()> {
        tokio::signal::ctrl_c().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn stop_is_delivered_once() {
        let stops = Arc::new(AtomicUsize::new(0));
        let supervisor = Supervisor::start({
            let stops = Arc::clone(&stops);
            move |token| async move {
                token.cancelled().await;
                stops.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert!(supervisor.task.lock().is_some());

        assert!(supervisor.stop().await);
        assert!(!supervisor.stop().await);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert!(supervisor.task.lock().is_none());
    }

    #[tokio::test]
    #[should_panic(expected = "reconciler blew up")]
    async fn task_panics_surface_on_stop() {
        let supervisor = Supervisor::start(|_token| async {
            panic!("reconciler blew up");
        });
        supervisor.stop().await;
    }

    /// A SIGTERM that lands after registration but before anyone awaits
    /// `recv` is still delivered, and the task started in between is stopped.
    #[cfg(unix)]
    #[tokio::test]
    async fn signal_registered_before_start_is_not_lost() {
        let shutdown = ShutdownSignal::register().unwrap();
        let supervisor = Supervisor::start(|token| async move {
            token.cancelled().await;
        });

        let status = std::process::Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());

        tokio::time::timeout(std::time::Duration::from_secs(10), shutdown.recv())
            .await
            .expect("SIGTERM was not observed")
            .unwrap();
        assert!(supervisor.stop().await);
    }
}
