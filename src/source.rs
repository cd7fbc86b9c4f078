//! Update sources
//!
//! An [`UpdateSource`] is the single blocking point of a watch: `next`
//! parks until the server reports a new message, the session fails, or
//! the cancellation token fires.
//!
//! [`ImapUpdateSource`] implements it over a live IMAP session, using
//! IDLE (RFC 2177) when the server supports it and `UID SEARCH` polling
//! otherwise. New messages are fetched headers-only and queued, so one
//! notification announcing several arrivals yields several updates.

use crate::config::{ConnectionConfig, UpdateMode};
use crate::connection::{self, ImapSession, MailboxState};
use crate::error::{Error, Result};
use crate::folder::Folder;
use crate::update::MailUpdate;
use async_imap::extensions::idle::IdleResponse;
use async_imap::imap_proto::{MailboxDatum, Response};
use async_imap::types::Fetch;
use chrono::Utc;
use futures::TryStreamExt;
use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Headers only; `RFC822.HEADER` is the non-`\Seen`-setting peek.
const FETCH_ITEMS: &str = "(UID INTERNALDATE RFC822.HEADER)";

/// How long a cancelled IDLE may take to acknowledge `DONE` before the
/// session is abandoned.
const DONE_TIMEOUT: Duration = Duration::from_secs(5);
/// How long a command already on the wire may keep running after
/// cancellation before its session is abandoned.
const CANCEL_GRACE: Duration = Duration::from_secs(1);
const LOGOUT_TIMEOUT: Duration = Duration::from_secs(5);

/// Something that can be waited on for new mail.
///
/// Implementations own their session exclusively; the dispatch loop is
/// the only caller of [`next`](Self::next).
pub trait UpdateSource: Send + 'static {
    /// Wait for the next new message.
    ///
    /// Returns [`Error::Cancelled`] promptly once `cancel` fires and
    /// [`Error::ConnectionLost`] when the session is gone. Neither is
    /// retried here.
    fn next(&mut self, cancel: &CancellationToken) -> impl Future<Output = Result<MailUpdate>> + Send;

    /// Release the session. Called once, after the last `next`.
    fn shutdown(&mut self) -> impl Future<Output = ()> + Send {
        async {}
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    Idle { timeout: Duration },
    Poll { interval: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wake {
    NewMail,
    Quiet,
    Cancelled,
}

/// Update source backed by one IMAP session on the watched folder.
pub struct ImapUpdateSource {
    session: Option<ImapSession>,
    folder: Folder,
    strategy: Strategy,
    exists: u32,
    next_uid: u32,
    pending: VecDeque<MailUpdate>,
}

impl ImapUpdateSource {
    /// Connect, log in, and select the watched folder.
    ///
    /// Messages already in the folder are not reported; only arrivals
    /// after this call are.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be set up, or if IDLE is
    /// required but not advertised.
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let (session, state) = connection::connect(config).await?;
        Self::from_session(session, state, config)
    }

    /// Wrap an already selected session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Imap`] when the config demands IDLE and the
    /// server does not advertise it.
    pub fn from_session(
        session: ImapSession,
        state: MailboxState,
        config: &ConnectionConfig,
    ) -> Result<Self> {
        let strategy = match (config.mode, state.idle) {
            (UpdateMode::Auto | UpdateMode::Idle, true) => Strategy::Idle {
                timeout: config.idle_timeout,
            },
            (UpdateMode::Idle, false) => {
                return Err(Error::Imap("server does not advertise IDLE".into()));
            }
            (UpdateMode::Auto, false) | (UpdateMode::Poll, _) => Strategy::Poll {
                interval: config.poll_interval,
            },
        };
        info!("Watching {} using {:?}", config.folder, strategy);

        Ok(Self {
            session: Some(session),
            folder: config.folder.clone(),
            strategy,
            exists: state.exists,
            next_uid: state.uid_next,
            pending: VecDeque::new(),
        })
    }

    /// Whether the server pushes updates (IDLE) rather than being polled.
    #[must_use]
    pub const fn is_push(&self) -> bool {
        matches!(self.strategy, Strategy::Idle { .. })
    }

    fn take_session(&mut self) -> Result<ImapSession> {
        self.session
            .take()
            .ok_or_else(|| Error::ConnectionLost("session closed".into()))
    }

    /// One IDLE round: enter IDLE, wait, leave IDLE.
    async fn idle_round(&mut self, timeout: Duration, cancel: &CancellationToken) -> Result<Wake> {
        let session = self.take_session()?;
        let mut idle = session.idle();

        let started = {
            let init = idle.init();
            tokio::pin!(init);
            tokio::select! {
                res = &mut init => Some(res),
                () = cancel.cancelled() => tokio::time::timeout(CANCEL_GRACE, &mut init).await.ok(),
            }
        };
        let Some(started) = started else {
            warn!("IDLE not acknowledged after cancellation, abandoning session");
            return Ok(Wake::Cancelled);
        };
        started.map_err(lost)?;

        let outcome = {
            let (wait, _interrupt) = idle.wait_with_timeout(timeout);
            tokio::select! {
                res = wait => res.map_err(lost),
                () = cancel.cancelled() => Ok(IdleResponse::ManualInterrupt),
            }
        };

        let wake = match outcome? {
            IdleResponse::NewData(data) => self.observe(data.parsed()),
            IdleResponse::Timeout => {
                debug!("IDLE timeout elapsed, re-issuing IDLE");
                Wake::Quiet
            }
            IdleResponse::ManualInterrupt => Wake::Cancelled,
        };

        match tokio::time::timeout(DONE_TIMEOUT, idle.done()).await {
            Ok(Ok(session)) => self.session = Some(session),
            // The caller is leaving anyway; report the cancellation, the
            // next call reports the lost session.
            _ if wake == Wake::Cancelled => warn!("IDLE DONE not acknowledged, abandoning session"),
            Ok(Err(e)) => return Err(lost(e)),
            Err(_) => return Err(Error::ConnectionLost("IDLE DONE not acknowledged".into())),
        }
        Ok(wake)
    }

    /// One polling round: sleep, then look for UIDs at or past UIDNEXT.
    async fn poll_round(&mut self, interval: Duration, cancel: &CancellationToken) -> Result<Wake> {
        tokio::select! {
            () = tokio::time::sleep(interval) => {}
            () = cancel.cancelled() => return Ok(Wake::Cancelled),
        }

        let mut session = self.take_session()?;
        let query = format!("UID {}:*", self.next_uid);
        let searched = {
            let search = session.uid_search(&query);
            tokio::pin!(search);
            tokio::select! {
                res = &mut search => Some(res),
                () = cancel.cancelled() => tokio::time::timeout(CANCEL_GRACE, &mut search).await.ok(),
            }
        };
        let Some(searched) = searched else {
            warn!("UID SEARCH not answered after cancellation, abandoning session");
            return Ok(Wake::Cancelled);
        };
        let uids = searched.map_err(lost)?;
        self.session = Some(session);
        if cancel.is_cancelled() {
            return Ok(Wake::Cancelled);
        }

        // `N:*` always matches the highest UID, even when it is below N.
        if uids.iter().any(|uid| *uid >= self.next_uid) {
            Ok(Wake::NewMail)
        } else {
            Ok(Wake::Quiet)
        }
    }

    /// Track the mailbox size from an untagged response seen during IDLE.
    fn observe(&mut self, response: &Response<'_>) -> Wake {
        match response {
            Response::MailboxData(MailboxDatum::Exists(count)) => {
                let grew = *count > self.exists;
                self.exists = *count;
                if grew { Wake::NewMail } else { Wake::Quiet }
            }
            Response::Expunge(_) => {
                self.exists = self.exists.saturating_sub(1);
                Wake::Quiet
            }
            other => {
                debug!("Ignoring IDLE response: {:?}", other);
                Wake::Quiet
            }
        }
    }

    /// Fetch every message at or past UIDNEXT and queue its update.
    async fn fetch_new(&mut self, cancel: &CancellationToken) -> Result<()> {
        let mut session = self.take_session()?;
        let query = format!("{}:*", self.next_uid);

        let fetched = tokio::select! {
            res = fetch_all(&mut session, &query) => Some(res),
            () = cancel.cancelled() => None,
        };
        let Some(fetched) = fetched else {
            // Abandoned mid-response: the session cannot be trusted.
            return Err(Error::Cancelled);
        };
        let mut messages = fetched.map_err(lost)?;
        self.session = Some(session);

        messages.retain(|m| m.uid.is_some_and(|uid| uid >= self.next_uid));
        messages.sort_by_key(|m| m.uid);

        for message in &messages {
            let Some(uid) = message.uid else { continue };
            let received_at = message.internal_date().map(|d| d.with_timezone(&Utc));
            let update = match message.header() {
                Some(raw) => MailUpdate::from_headers(uid, &self.folder, raw, received_at)
                    .unwrap_or_else(|e| {
                        warn!("Failed to decode UID {}: {}", uid, e);
                        bare_update(uid, &self.folder, received_at)
                    }),
                None => {
                    warn!("No header returned for UID {}", uid);
                    bare_update(uid, &self.folder, received_at)
                }
            };
            self.next_uid = self.next_uid.max(uid.saturating_add(1));
            self.pending.push_back(update);
        }

        info!("{} new message(s) in {}", messages.len(), self.folder);
        Ok(())
    }
}

impl UpdateSource for ImapUpdateSource {
    async fn next(&mut self, cancel: &CancellationToken) -> Result<MailUpdate> {
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if let Some(update) = self.pending.pop_front() {
                return Ok(update);
            }

            let wake = match self.strategy {
                Strategy::Idle { timeout } => self.idle_round(timeout, cancel).await?,
                Strategy::Poll { interval } => self.poll_round(interval, cancel).await?,
            };

            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match wake {
                Wake::NewMail => self.fetch_new(cancel).await?,
                Wake::Quiet => {}
                Wake::Cancelled => return Err(Error::Cancelled),
            }
        }
    }

    async fn shutdown(&mut self) {
        self.pending.clear();
        let Some(mut session) = self.session.take() else {
            return;
        };
        match tokio::time::timeout(LOGOUT_TIMEOUT, session.logout()).await {
            Ok(Ok(())) => debug!("Logged out"),
            Ok(Err(e)) => debug!("LOGOUT failed: {}", e),
            Err(_) => debug!("LOGOUT timed out"),
        }
    }
}

async fn fetch_all(session: &mut ImapSession, query: &str) -> async_imap::error::Result<Vec<Fetch>> {
    let stream = session.uid_fetch(query, FETCH_ITEMS).await?;
    stream.try_collect().await
}

fn bare_update(uid: u32, folder: &Folder, received_at: Option<chrono::DateTime<Utc>>) -> MailUpdate {
    let mut update = MailUpdate::new(uid, "").in_folder(folder.clone());
    update.received_at = received_at;
    update
}

#[allow(clippy::needless_pass_by_value)]
fn lost(err: async_imap::error::Error) -> Error {
    Error::ConnectionLost(err.to_string())
}
