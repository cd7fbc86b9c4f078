//! The watched mailbox
//!
//! A client watches exactly one folder. `INBOX` is special-cased because
//! servers match it in any case; every other path is carried verbatim.

use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

/// A mailbox folder that can be watched for new mail.
///
/// # Examples
///
/// ```
/// use mailstream::Folder;
///
/// assert_eq!(Folder::from("inbox"), Folder::Inbox);
/// assert_eq!(Folder::custom("Alerts").as_str(), "Alerts");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Folder {
    /// `INBOX`, the only name IMAP treats case-insensitively.
    #[default]
    Inbox,
    /// Any other mailbox, by its full server path.
    Custom(String),
}

impl Folder {
    #[must_use]
    pub fn custom(name: impl Into<String>) -> Self {
        Self::from(name.into())
    }

    /// The mailbox name sent in `SELECT`.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Inbox => "INBOX",
            Self::Custom(path) => path,
        }
    }
}

impl fmt::Display for Folder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for Folder {
    fn from(path: String) -> Self {
        if path.eq_ignore_ascii_case("INBOX") {
            Self::Inbox
        } else {
            Self::Custom(path)
        }
    }
}

impl From<&str> for Folder {
    fn from(path: &str) -> Self {
        Self::from(path.to_owned())
    }
}

impl From<Folder> for String {
    fn from(folder: Folder) -> Self {
        match folder {
            Folder::Inbox => "INBOX".to_owned(),
            Folder::Custom(path) => path,
        }
    }
}

impl FromStr for Folder {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from(s))
    }
}
