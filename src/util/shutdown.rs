use std::future::Future;
use tokio::signal::unix::SignalKind;
use tokio::signal::unix::signal;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Coordinated shutdown of the gateway.
///
/// One token, cancelled by SIGTERM or SIGINT, fans out to the HTTP server,
/// the claim scheduler's queue scanner, and the pending-proposal sweeper.
/// Long-lived background tasks are spawned through [`Shutdown::spawn`] so
/// that [`Shutdown::drain`] can wait for all of them after the server stops
/// accepting requests. In-flight claims finish, the sweeper exits its tick
/// loop, and only then does the process return.
pub struct Shutdown {
    token: CancellationToken,
    background: TaskTracker,
}

impl Shutdown {
    /// Installs the signal handlers. Either signal cancels the token; a
    /// second signal is not treated specially.
    pub fn install() -> Result<Self, std::io::Error> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let this = Self::with_token(CancellationToken::new());
        let signal_token = this.token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM, shutting down");
                }
                _ = sigint.recv() => {
                    tracing::info!("received SIGINT, shutting down");
                }
            }
            signal_token.cancel();
        });
        Ok(this)
    }

    fn with_token(token: CancellationToken) -> Self {
        Shutdown {
            token,
            background: TaskTracker::new(),
        }
    }

    /// A clone of the shutdown token for a subsystem to watch.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Spawns a background task whose completion [`Shutdown::drain`] waits
    /// for. The task is expected to exit once the shutdown token cancels.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.background.spawn(task);
    }

    /// Waits for every spawned background task to finish. Call after the
    /// HTTP server has stopped; the token is already cancelled by then, so
    /// well-behaved tasks are on their way out.
    pub async fn drain(self) {
        self.background.close();
        self.background.wait().await;
        tracing::info!("background tasks drained");
    }
}
