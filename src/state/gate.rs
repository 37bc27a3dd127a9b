//! Readiness Gate
//!
//! One readiness sequence per process. Concurrent callers share the same
//! run; every waiter is released once it settles, with the error if it
//! failed. `Ready` and `Failed` are both terminal.

use std::sync::Arc;
use tokio::sync::watch;

use crate::error::{Error, Result};

/// Gate state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateState {
    NotReady,
    InProgress,
    Ready,
    Failed(String),
}

impl GateState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateState::NotReady => "notReady",
            GateState::InProgress => "inProgress",
            GateState::Ready => "ready",
            GateState::Failed(_) => "failed",
        }
    }

    fn is_settled(&self) -> bool {
        matches!(self, GateState::Ready | GateState::Failed(_))
    }
}

/// Work the gate runs before opening
#[async_trait::async_trait]
pub trait ReadinessSequence: Send + Sync + 'static {
    /// Steps that must all succeed before the gate opens
    async fn run(&self) -> Result<()>;

    /// Called once the steps succeeded, right before the gate opens.
    /// A failure here is logged and does not keep the gate closed.
    async fn after_ready(&self) -> Result<()> {
        Ok(())
    }
}

/// Readiness gate shared by every component of a process
pub struct ReadinessGate {
    state: Arc<watch::Sender<GateState>>,
}

impl ReadinessGate {
    pub fn new() -> Self {
        let (state, _) = watch::channel(GateState::NotReady);
        Self {
            state: Arc::new(state),
        }
    }

    /// Current state
    pub fn state(&self) -> GateState {
        self.state.borrow().clone()
    }

    pub fn is_ready(&self) -> bool {
        *self.state.borrow() == GateState::Ready
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<GateState> {
        self.state.subscribe()
    }

    /// Resolve once the gate is open, starting the sequence if nobody has
    pub async fn ensure_ready(&self, sequence: Arc<dyn ReadinessSequence>) -> Result<()> {
        let rx = self.state.subscribe();

        let start = self.state.send_if_modified(|state| {
            if *state == GateState::NotReady {
                *state = GateState::InProgress;
                true
            } else {
                false
            }
        });

        if start {
            tracing::info!("Readiness sequence started");
            let state = Arc::clone(&self.state);
            // Detached so a cancelled caller cannot strand the gate in progress
            tokio::spawn(async move {
                run_sequence(state, sequence).await;
            });
        }

        wait_settled(rx).await
    }

    /// Resolve once the gate is open without starting anything
    pub async fn wait_ready(&self) -> Result<()> {
        wait_settled(self.state.subscribe()).await
    }
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_sequence(state: Arc<watch::Sender<GateState>>, sequence: Arc<dyn ReadinessSequence>) {
    let worker = Arc::clone(&sequence);
    let outcome = match tokio::spawn(async move { worker.run().await }).await {
        Ok(result) => result,
        Err(e) => Err(Error::Internal(format!("Readiness sequence aborted: {}", e))),
    };

    match outcome {
        Ok(()) => {
            if let Err(e) = sequence.after_ready().await {
                tracing::error!("Post-readiness step failed: {}", e);
            }
            state.send_replace(GateState::Ready);
            tracing::info!("Ready");
        }
        Err(e) => {
            tracing::error!("Readiness sequence failed: {}", e);
            state.send_replace(GateState::Failed(e.to_string()));
        }
    }
}

async fn wait_settled(mut rx: watch::Receiver<GateState>) -> Result<()> {
    let settled = rx
        .wait_for(GateState::is_settled)
        .await
        .map_err(|_| Error::ShuttingDown)?
        .clone();

    match settled {
        GateState::Failed(reason) => Err(Error::ReadinessFailed(reason)),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct Counting {
        runs: AtomicU32,
        after: AtomicU32,
        fail: bool,
        delay: Duration,
    }

    impl Counting {
        fn new(fail: bool, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                runs: AtomicU32::new(0),
                after: AtomicU32::new(0),
                fail,
                delay,
            })
        }
    }

    #[async_trait::async_trait]
    impl ReadinessSequence for Counting {
        async fn run(&self) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(Error::Bootstrap("master unreachable".into()));
            }
            Ok(())
        }

        async fn after_ready(&self) -> Result<()> {
            self.after.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_run() {
        let gate = Arc::new(ReadinessGate::new());
        let sequence = Counting::new(false, Duration::from_millis(20));

        let mut waiters = Vec::new();
        for _ in 0..5 {
            let gate = Arc::clone(&gate);
            let sequence: Arc<dyn ReadinessSequence> = sequence.clone();
            waiters.push(tokio::spawn(async move { gate.ensure_ready(sequence).await }));
        }
        for waiter in waiters {
            waiter.await.unwrap().unwrap();
        }

        assert_eq!(gate.state(), GateState::Ready);
        assert_eq!(sequence.runs.load(Ordering::SeqCst), 1);

        // Already open: resolves immediately without another run
        gate.ensure_ready(sequence.clone()).await.unwrap();
        assert_eq!(sequence.runs.load(Ordering::SeqCst), 1);

        assert_eq!(sequence.after.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_releases_every_waiter() {
        let gate = Arc::new(ReadinessGate::new());
        let sequence = Counting::new(true, Duration::from_millis(20));

        let early = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.wait_ready().await })
        };
        let first = gate.ensure_ready(sequence.clone()).await;
        assert!(matches!(first, Err(Error::ReadinessFailed(_))));
        assert!(matches!(early.await.unwrap(), Err(Error::ReadinessFailed(_))));

        // Terminal: later callers fail at once, nothing reruns
        assert!(matches!(gate.state(), GateState::Failed(_)));
        let later = gate.ensure_ready(sequence.clone()).await;
        assert!(matches!(later, Err(Error::ReadinessFailed(_))));
        assert_eq!(sequence.runs.load(Ordering::SeqCst), 1);
        assert_eq!(sequence.after.load(Ordering::SeqCst), 0);
        assert!(!gate.is_ready());
    }

    #[tokio::test]
    async fn test_cancelled_caller_does_not_strand_gate() {
        let gate = ReadinessGate::new();
        let sequence = Counting::new(false, Duration::from_millis(30));

        let attempt = tokio::time::timeout(
            Duration::from_millis(1),
            gate.ensure_ready(sequence.clone()),
        )
        .await;
        assert!(attempt.is_err());
        assert_eq!(gate.state(), GateState::InProgress);

        gate.wait_ready().await.unwrap();
        assert_eq!(gate.state(), GateState::Ready);
    }
}
