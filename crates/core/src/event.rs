//! Events delivered to hosts during an update, and the error payload they carry.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Host-facing update event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventId {
    Checking,
    Error,
    NoUpdate,
    Downloading,
    Progress,
    UpdateReady,
    Cached,
    Obsolete,
}

impl EventId {
    /// An update attempt ends with exactly one of these per host.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Error | Self::NoUpdate | Self::UpdateReady | Self::Cached | Self::Obsolete
        )
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Checking => "checking",
            Self::Error => "error",
            Self::NoUpdate => "noupdate",
            Self::Downloading => "downloading",
            Self::Progress => "progress",
            Self::UpdateReady => "updateready",
            Self::Cached => "cached",
            Self::Obsolete => "obsolete",
        };
        f.write_str(name)
    }
}

/// Reason code carried by an error event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorReason {
    /// Manifest could not be fetched or parsed.
    Manifest,
    Signature,
    /// A listed resource failed to download.
    Resource,
    /// The manifest changed while the update was running.
    Changed,
    Abort,
    Quota,
    Policy,
    Unknown,
}

/// Error event payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub message: String,
    pub reason: ErrorReason,
    /// Offending URL, when a specific fetch failed.
    pub url: Option<String>,
    /// HTTP status of the failed fetch, if one was received.
    pub status: Option<u16>,
    pub is_cross_origin: bool,
}

impl ErrorDetails {
    pub fn new(message: impl Into<String>, reason: ErrorReason) -> Self {
        Self {
            message: message.into(),
            reason,
            url: None,
            status: None,
            is_cross_origin: false,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn cross_origin(mut self, is_cross_origin: bool) -> Self {
        self.is_cross_origin = is_cross_origin;
        self
    }
}

/// Coarse status of a group as seen by hosts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStatus {
    #[default]
    Idle,
    Checking,
    Downloading,
}
