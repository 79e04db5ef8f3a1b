//! Lifecycle states, host controls and inbound events.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::http::{Request, Response};
use crate::stats::{ActivationOutcome, OfflineReport};

/// Lifecycle state of one synchronizer instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Registered but install has not started.
    Uninstalled,
    /// Core set is being fetched into the staging partition.
    Installing,
    /// Installed and eligible to activate.
    Waiting,
    /// Promoting staged resources into the content partition.
    Activating,
    /// Serving requests.
    Active,
    /// Install failed; this instance will never activate.
    Redundant,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninstalled => "uninstalled",
            Self::Installing => "installing",
            Self::Waiting => "waiting",
            Self::Activating => "activating",
            Self::Active => "active",
            Self::Redundant => "redundant",
        };
        f.write_str(name)
    }
}

/// Operations the host offers over the pages it controls.
///
/// Both methods have no-op defaults.
pub trait ClientControl: Send + Sync {
    /// Activate this instance without waiting for the previous one to
    /// release its pages.
    fn skip_waiting(&self) {}

    /// Make this instance the handler for every open page without a reload.
    fn claim(&self) {}
}

impl<T: ClientControl + ?Sized> ClientControl for Arc<T> {
    fn skip_waiting(&self) {
        (**self).skip_waiting();
    }

    fn claim(&self) {
        (**self).claim();
    }
}

/// A host that ignores both controls.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoClients;

impl ClientControl for NoClients {}

/// Control messages accepted from pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// `"skipWaiting"`: activate immediately.
    SkipWaiting,
    /// `"downloadOffline"`: cache every manifest resource not yet cached.
    DownloadOffline,
}

impl ControlMessage {
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::SkipWaiting => "skipWaiting",
            Self::DownloadOffline => "downloadOffline",
        }
    }
}

impl FromStr for ControlMessage {
    type Err = String;

    fn from_str(payload: &str) -> Result<Self, Self::Err> {
        match payload {
            "skipWaiting" => Ok(Self::SkipWaiting),
            "downloadOffline" => Ok(Self::DownloadOffline),
            other => Err(format!("unknown control message {other:?}")),
        }
    }
}

/// What handling a control message did.
#[derive(Debug)]
pub enum MessageOutcome {
    SkippedWaiting,
    DownloadedOffline(OfflineReport),
    /// Payload was not a recognized tag.
    Ignored,
}

/// An event delivered by the host.
#[derive(Debug, Clone)]
pub enum Event {
    Install,
    Activate,
    Fetch(Request),
    Message(String),
}

/// Result of dispatching an [`Event`].
#[derive(Debug)]
pub enum EventOutcome {
    Installed,
    Activated(ActivationOutcome),
    /// The request was answered by the synchronizer.
    Responded(Response),
    /// The request is left to the host's default network handling.
    Declined,
    Message(MessageOutcome),
}
