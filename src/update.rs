//! New-mail notifications

use crate::error::{Error, Result};
use crate::folder::Folder;
use chrono::{DateTime, Utc};
use mail_parser::MessageParser;
use serde::{Deserialize, Serialize};

/// One new message in the watched folder.
///
/// Plain value type: subscribers each receive their own clone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailUpdate {
    /// IMAP UID, unique within the folder's UIDVALIDITY epoch.
    pub uid: u32,
    /// Decoded `Subject:`; empty when the header is missing.
    pub subject: String,
    /// First address of `From:`.
    pub from: Option<String>,
    pub message_id: Option<String>,
    /// The `Date:` header as sent by the author.
    pub date: Option<DateTime<Utc>>,
    /// Server arrival time (`INTERNALDATE`).
    pub received_at: Option<DateTime<Utc>>,
    pub folder: Folder,
}

impl MailUpdate {
    /// A bare update with only the identifying fields set.
    #[must_use]
    pub fn new(uid: u32, subject: impl Into<String>) -> Self {
        Self {
            uid,
            subject: subject.into(),
            from: None,
            message_id: None,
            date: None,
            received_at: None,
            folder: Folder::Inbox,
        }
    }

    #[must_use]
    pub fn in_folder(mut self, folder: Folder) -> Self {
        self.folder = folder;
        self
    }

    /// Decode an update from the raw RFC 5322 header block of a message.
    ///
    /// Encoded words (`=?UTF-8?B?...?=`) in the subject are decoded.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Parse`] if `raw` holds no parseable header block.
    pub fn from_headers(
        uid: u32,
        folder: &Folder,
        headers: &[u8],
        received_at: Option<DateTime<Utc>>,
    ) -> Result<Self> {
        let message = MessageParser::default()
            .parse(headers)
            .ok_or_else(|| Error::Parse(format!("Unparseable headers for UID {uid}")))?;

        let from = message
            .from()
            .and_then(|addresses| addresses.first())
            .and_then(|addr| addr.address())
            .map(ToString::to_string);

        let date = message
            .date()
            .and_then(|dt| DateTime::from_timestamp(dt.to_timestamp(), 0));

        Ok(Self {
            uid,
            subject: message.subject().unwrap_or_default().to_string(),
            from,
            message_id: message.message_id().map(ToString::to_string),
            date,
            received_at,
            folder: folder.clone(),
        })
    }
}
