//! Core types shared across the postroom workspace.
//!
//! This crate holds the small domain vocabulary every other crate speaks:
//! languages, delivery status, digest volume frequency, queue names, and
//! the log-event payloads recorded by `postroom-events`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Language a list's generated prose is rendered in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lang {
    /// English (default)
    #[default]
    En,
    /// German
    De,
    /// French
    Fr,
}

impl Lang {
    /// ISO 639-1 code for this language.
    pub fn code(&self) -> &'static str {
        match self {
            Lang::En => "en",
            Lang::De => "de",
            Lang::Fr => "fr",
        }
    }

    /// Parse an ISO 639-1 code, falling back to English.
    pub fn from_code(code: &str) -> Self {
        match code {
            "de" => Lang::De,
            "fr" => Lang::Fr,
            _ => Lang::En,
        }
    }

    /// MIME charset advertised for text parts in this language.
    pub fn charset(&self) -> &'static str {
        // All shipped catalogs are UTF-8 clean.
        "utf-8"
    }
}

/// Per-member delivery status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Delivery is on.
    #[default]
    Enabled,
    /// Member turned delivery off themselves.
    ByUser,
    /// An administrator turned delivery off.
    ByAdmin,
    /// Bounce processing turned delivery off.
    ByBounce,
}

impl DeliveryStatus {
    /// Whether mail should currently be delivered to the member.
    pub fn is_enabled(&self) -> bool {
        matches!(self, DeliveryStatus::Enabled)
    }
}

/// How often a list's digest volume number rolls over.
///
/// The discriminants follow the wire values used in list state
/// (`yearly = 0`, `monthly = 1`, `quarterly = 2`, `weekly = 3`, anything
/// else is daily).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DigestFrequency {
    Yearly,
    #[default]
    Monthly,
    Quarterly,
    Weekly,
    Daily,
}

impl DigestFrequency {
    /// Decode the integer form found in imported list state.
    pub fn from_wire(value: i64) -> Self {
        match value {
            0 => DigestFrequency::Yearly,
            1 => DigestFrequency::Monthly,
            2 => DigestFrequency::Quarterly,
            3 => DigestFrequency::Weekly,
            _ => DigestFrequency::Daily,
        }
    }
}

/// The standard spool directories a site runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    /// Inbound postings from the MTA.
    In,
    /// Messages ready for final delivery.
    Out,
    /// Mail to the -request, -join, and -leave sub-addresses.
    Cmd,
    /// Delivery-status notifications.
    Bounces,
    /// Messages synthesised by postroom itself.
    Virgin,
    /// Copies destined for the archiver.
    Archive,
    /// Accumulated digest mboxes awaiting assembly.
    Digest,
    /// Deliveries waiting out a backoff interval.
    Retry,
    /// Entries that raised unexpected errors; operator triage.
    Shunt,
    /// Entries whose message bytes could not be parsed at all.
    Bad,
}

impl QueueName {
    /// Directory name under the queue root.
    pub fn dir_name(&self) -> &'static str {
        match self {
            QueueName::In => "in",
            QueueName::Out => "out",
            QueueName::Cmd => "cmd",
            QueueName::Bounces => "bounces",
            QueueName::Virgin => "virgin",
            QueueName::Archive => "archive",
            QueueName::Digest => "digest",
            QueueName::Retry => "retry",
            QueueName::Shunt => "shunt",
            QueueName::Bad => "bad",
        }
    }

    /// All queues, in the order a site initialises them.
    pub fn all() -> &'static [QueueName] {
        &[
            QueueName::In,
            QueueName::Out,
            QueueName::Cmd,
            QueueName::Bounces,
            QueueName::Virgin,
            QueueName::Archive,
            QueueName::Digest,
            QueueName::Retry,
            QueueName::Shunt,
            QueueName::Bad,
        ]
    }

    /// Parse a queue directory name.
    pub fn parse(name: &str) -> Option<Self> {
        QueueName::all()
            .iter()
            .copied()
            .find(|q| q.dir_name() == name)
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Named log channel, one JSONL file per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Loop defence, discarded mail, moderation decisions.
    Vette,
    /// Bounce scoring and removals.
    Bounce,
    /// Digest accumulation and assembly.
    Digest,
    /// Accepted postings.
    Post,
    /// Unexpected failures and shunted entries.
    Error,
    /// Runner lifecycle (start, stop, recovery).
    Qrunner,
    /// Subscription lifecycle.
    Subscribe,
}

impl Channel {
    /// Log file stem for this channel.
    pub fn file_stem(&self) -> &'static str {
        match self {
            Channel::Vette => "vette",
            Channel::Bounce => "bounce",
            Channel::Digest => "digest",
            Channel::Post => "post",
            Channel::Error => "error",
            Channel::Qrunner => "qrunner",
            Channel::Subscribe => "subscribe",
        }
    }
}

/// One recorded log event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    /// When the event happened.
    pub timestamp: DateTime<Utc>,
    /// Which channel it belongs to.
    pub channel: Channel,
    /// The list involved, when one is in scope.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listname: Option<String>,
    /// Human-readable description.
    pub message: String,
}

impl LogEvent {
    /// Build an event stamped with the current time.
    pub fn now(channel: Channel, listname: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            channel,
            listname: listname.map(str::to_string),
            message: message.into(),
        }
    }
}
