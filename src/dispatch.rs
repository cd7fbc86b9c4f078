//! Dispatch loop
//!
//! Pulls updates from an [`UpdateSource`] and broadcasts them through the
//! [`SubscriberRegistry`] until cancelled or the source fails. The loop's
//! outcome is reported once, through a [`Termination`].

use crate::error::{Error, Result};
use crate::registry::SubscriberRegistry;
use crate::source::UpdateSource;
use std::fmt;
use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Why a dispatch loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    /// The rendered terminal error; the error itself goes to the
    /// [`Termination`] consumer.
    Error(String),
}

/// Lifecycle of the dispatch loop.
///
/// `Idle -> Running -> Stopped(..)`. A stopped loop never restarts
/// itself; starting again creates a new `Running` phase.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LoopState {
    #[default]
    Idle,
    Running,
    Stopped(StopReason),
}

impl LoopState {
    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Running => f.write_str("running"),
            Self::Stopped(StopReason::Cancelled) => f.write_str("stopped (cancelled)"),
            Self::Stopped(StopReason::Error(e)) => write!(f, "stopped ({e})"),
        }
    }
}

impl From<&Result<()>> for LoopState {
    fn from(outcome: &Result<()>) -> Self {
        match outcome {
            Ok(()) => Self::Stopped(StopReason::Cancelled),
            Err(e) => Self::Stopped(StopReason::Error(e.to_string())),
        }
    }
}

/// Drive `source` until it is cancelled (`Ok`) or fails (`Err`).
///
/// Updates are broadcast in the order `next` returns them. Once `cancel`
/// fires nothing more is broadcast, even an update already in hand.
pub async fn run<S: UpdateSource>(
    source: &mut S,
    registry: &SubscriberRegistry,
    cancel: &CancellationToken,
) -> Result<()> {
    info!("Dispatch loop running");
    loop {
        match source.next(cancel).await {
            Ok(update) => {
                if cancel.is_cancelled() {
                    debug!("Discarding UID {} received during cancellation", update.uid);
                    break;
                }
                let delivered = registry.broadcast(&update);
                debug!("UID {} delivered to {} subscriber(s)", update.uid, delivered);
            }
            Err(Error::Cancelled) => break,
            Err(e) => {
                warn!("Dispatch loop stopped: {}", e);
                return Err(e);
            }
        }
    }
    info!("Dispatch loop cancelled");
    Ok(())
}

/// One-shot outcome of a dispatch loop.
///
/// Yields `Ok(())` for a clean cancellation or the terminal error,
/// exactly once. Later calls return `None` immediately. A loop that
/// panicked reports [`Error::Aborted`], never a connection error.
pub struct Termination {
    rx: Option<oneshot::Receiver<Result<()>>>,
}

impl Termination {
    pub(crate) fn channel() -> (oneshot::Sender<Result<()>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx: Some(rx) })
    }

    /// Wait for the loop to stop.
    ///
    /// Cancel-safe: dropping this future before it completes leaves the
    /// outcome in place for the next call.
    pub async fn wait(&mut self) -> Option<Result<()>> {
        let rx = self.rx.as_mut()?;
        let outcome = rx.await.unwrap_or(Err(Error::Aborted));
        self.rx = None;
        Some(outcome)
    }

    /// The outcome if the loop has already stopped and it has not been
    /// taken yet.
    pub fn try_outcome(&mut self) -> Option<Result<()>> {
        let outcome = match self.rx.as_mut()?.try_recv() {
            Ok(outcome) => outcome,
            Err(TryRecvError::Empty) => return None,
            Err(TryRecvError::Closed) => Err(Error::Aborted),
        };
        self.rx = None;
        Some(outcome)
    }

    /// Whether the outcome has already been handed out.
    #[must_use]
    pub const fn is_consumed(&self) -> bool {
        self.rx.is_none()
    }
}

impl fmt::Debug for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Termination")
            .field("consumed", &self.is_consumed())
            .finish()
    }
}
