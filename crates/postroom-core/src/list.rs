//! The mailing-list model and its persistence seam.
//!
//! A [`MailingList`] is a plain data record composed of capability
//! records: the subscription roster, the digest clock, the moderation
//! policy, and the bounce log. The engine mutates only a small set of
//! fields (digest counters, one_last_digest, member options, bounce
//! state) and only while holding the list lock; everything else belongs
//! to the external list manager, reached through the [`ListStore`] seam.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use postroom_types::{DeliveryStatus, DigestFrequency, Lang};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// SHA-256 hex digest used for member and moderator passwords.
pub fn password_digest(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

/// One subscribed address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    /// Address as originally subscribed (case preserved for delivery).
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub real_name: Option<String>,
    /// SHA-256 hex digest of the member password.
    pub password: String,
    #[serde(default)]
    pub delivery_status: DeliveryStatus,
    /// Digest delivery instead of per-message delivery.
    #[serde(default)]
    pub digest: bool,
    /// MIME digests; `false` selects the RFC 1153 plain digest.
    #[serde(default = "default_true")]
    pub mime_digest: bool,
    /// Individual moderation flag.
    #[serde(default)]
    pub moderated: bool,
}

fn default_true() -> bool {
    true
}

impl Member {
    pub fn new(address: &str, password: &str) -> Self {
        Self {
            address: address.to_string(),
            real_name: None,
            password: password_digest(password),
            delivery_status: DeliveryStatus::Enabled,
            digest: false,
            mime_digest: true,
            moderated: false,
        }
    }

    pub fn check_password(&self, candidate: &str) -> bool {
        self.password == password_digest(candidate)
    }
}

/// Subscription capability: the member roster.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Roster {
    /// Members keyed by lowercased address.
    members: BTreeMap<String, Member>,
    /// Addresses owed one final digest after leaving digest delivery.
    #[serde(default)]
    pub one_last_digest: BTreeSet<String>,
    /// Whether the roster is hidden from the `who` command.
    #[serde(default)]
    pub private: bool,
}

impl Roster {
    pub fn is_member(&self, address: &str) -> bool {
        self.members.contains_key(&address.to_ascii_lowercase())
    }

    pub fn get(&self, address: &str) -> Option<&Member> {
        self.members.get(&address.to_ascii_lowercase())
    }

    pub fn get_mut(&mut self, address: &str) -> Option<&mut Member> {
        self.members.get_mut(&address.to_ascii_lowercase())
    }

    /// Add a member; replaces any previous subscription of the address.
    pub fn subscribe(&mut self, member: Member) {
        self.members
            .insert(member.address.to_ascii_lowercase(), member);
    }

    /// Remove a member. Errors when the address is not subscribed.
    pub fn remove(&mut self, address: &str) -> Result<Member> {
        let key = address.to_ascii_lowercase();
        self.one_last_digest.remove(&key);
        self.members
            .remove(&key)
            .with_context(|| format!("{address} is not a member"))
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Every member, keyed address order.
    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    /// Addresses receiving each message individually: enabled, non-digest.
    pub fn regular_delivery_addresses(&self) -> Vec<String> {
        self.members
            .values()
            .filter(|m| !m.digest && m.delivery_status.is_enabled())
            .map(|m| m.address.clone())
            .collect()
    }

    /// Lowercased addresses of digest members.
    pub fn digest_member_keys(&self) -> Vec<String> {
        self.members
            .iter()
            .filter(|(_, m)| m.digest)
            .map(|(key, _)| key.clone())
            .collect()
    }
}

/// What to do with a posting from a given sender class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderAction {
    Accept,
    #[default]
    Hold,
    Reject,
    Discard,
}

/// Moderation capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModerationPolicy {
    /// Moderate posts from members by default.
    #[serde(default)]
    pub member_posts_moderated: bool,
    /// Action for non-member postings.
    #[serde(default)]
    pub nonmember_action: SenderAction,
    /// Non-member senders (lowercased) accepted without moderation.
    #[serde(default)]
    pub accept_these_nonmembers: BTreeSet<String>,
    /// Maximum message size in KiB; 0 is unlimited.
    #[serde(default = "default_max_message_size")]
    pub max_message_size_kib: u64,
    /// Top-level content types that are held for moderation.
    #[serde(default)]
    pub forbidden_content_types: BTreeSet<String>,
    /// SHA-256 hex digest of the moderator password, if one is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub moderator_password: Option<String>,
    /// Notify the owner when a message is held.
    #[serde(default = "default_true")]
    pub notify_owner_on_hold: bool,
}

fn default_max_message_size() -> u64 {
    40
}

impl Default for ModerationPolicy {
    fn default() -> Self {
        Self {
            member_posts_moderated: false,
            nonmember_action: SenderAction::Hold,
            accept_these_nonmembers: BTreeSet::new(),
            max_message_size_kib: default_max_message_size(),
            forbidden_content_types: BTreeSet::new(),
            moderator_password: None,
            notify_owner_on_hold: true,
        }
    }
}

/// Digest capability: accumulation policy and the volume/issue clock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DigestClock {
    /// Whether the list produces digests at all.
    #[serde(default = "default_true")]
    pub digestable: bool,
    /// Assembly threshold for the accumulating mbox, in KiB.
    #[serde(default = "default_digest_threshold")]
    pub size_threshold_kib: u32,
    #[serde(default)]
    pub frequency: DigestFrequency,
    #[serde(default = "default_one")]
    pub volume: u32,
    #[serde(default = "default_one")]
    pub next_digest_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sent_at: Option<DateTime<Utc>>,
    /// Optional text rendered before the table of contents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,
    /// Optional text rendered after the messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub footer: Option<String>,
}

fn default_digest_threshold() -> u32 {
    30
}

fn default_one() -> u32 {
    1
}

impl Default for DigestClock {
    fn default() -> Self {
        Self {
            digestable: true,
            size_threshold_kib: default_digest_threshold(),
            frequency: DigestFrequency::default(),
            volume: 1,
            next_digest_number: 1,
            last_sent_at: None,
            header: None,
            footer: None,
        }
    }
}

impl DigestClock {
    /// Whether `last` and `now` fall in different volume buckets for the
    /// configured frequency.
    pub fn needs_volume_bump(&self, now: DateTime<Utc>) -> bool {
        let Some(last) = self.last_sent_at else {
            return false;
        };
        match self.frequency {
            DigestFrequency::Yearly => last.year() < now.year(),
            DigestFrequency::Monthly => {
                (last.year(), last.month()) != (now.year(), now.month())
            }
            // Calendar quarters: Jan-Mar, Apr-Jun, Jul-Sep, Oct-Dec.
            DigestFrequency::Quarterly => {
                (last.year(), (last.month() - 1) / 3) != (now.year(), (now.month() - 1) / 3)
            }
            DigestFrequency::Weekly => {
                let last_week = last.iso_week();
                let now_week = now.iso_week();
                (last_week.year(), last_week.week()) != (now_week.year(), now_week.week())
            }
            DigestFrequency::Daily => last.date_naive() != now.date_naive(),
        }
    }
}

/// One address's bounce history. The record is versioned so the on-disk
/// shape can evolve without guessing at positional fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BounceRecord {
    #[serde(default = "bounce_record_version")]
    pub version: u32,
    pub first_seen: DateTime<Utc>,
    /// Post id (or digest volume, for digest members) at the first bounce.
    pub first_post_id: u64,
    /// Post id (or volume) at the most recent bounce.
    pub last_post_id: u64,
}

fn bounce_record_version() -> u32 {
    1
}

impl BounceRecord {
    pub fn new(now: DateTime<Utc>, post_id: u64) -> Self {
        Self {
            version: bounce_record_version(),
            first_seen: now,
            first_post_id: post_id,
            last_post_id: post_id,
        }
    }
}

/// Bouncing capability: per-address records, thresholds, and policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BounceLog {
    /// Records keyed by lowercased address.
    #[serde(default)]
    pub records: BTreeMap<String, BounceRecord>,
    /// Monotonic posting counter, incremented per accepted post.
    #[serde(default)]
    pub post_id: u64,
    /// Whether bounce mail is scanned at all.
    #[serde(default = "default_true")]
    pub process_bounces: bool,
    /// Remove failing addresses automatically (vs. only notify).
    #[serde(default = "default_true")]
    pub auto_remove: bool,
    /// Notify the owner when an address is removed.
    #[serde(default = "default_true")]
    pub notify_owner_on_removal: bool,
    /// Days an address must have been bouncing before removal.
    #[serde(default = "default_minimum_removal_days")]
    pub minimum_removal_days: u32,
    /// Posts since the first bounce before removal is considered.
    #[serde(default = "default_minimum_post_count")]
    pub minimum_post_count_before_removal: u32,
    /// Post gap past which an existing record is stale.
    #[serde(default = "default_max_posts_between_bounces")]
    pub max_posts_between_bounces: u32,
}

fn default_minimum_removal_days() -> u32 {
    5
}
fn default_minimum_post_count() -> u32 {
    10
}
fn default_max_posts_between_bounces() -> u32 {
    5
}

impl Default for BounceLog {
    fn default() -> Self {
        Self {
            records: BTreeMap::new(),
            post_id: 0,
            process_bounces: true,
            auto_remove: true,
            notify_owner_on_removal: true,
            minimum_removal_days: default_minimum_removal_days(),
            minimum_post_count_before_removal: default_minimum_post_count(),
            max_posts_between_bounces: default_max_posts_between_bounces(),
        }
    }
}

impl BounceLog {
    pub fn clear(&mut self, address: &str) {
        self.records.remove(&address.to_ascii_lowercase());
    }
}

/// How the list responds to mail at its -request address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoResponse {
    /// No automatic response.
    #[default]
    None,
    /// Send the canned response and discard the message.
    RespondAndDiscard,
    /// Send the canned response, then process normally.
    RespondAndContinue,
}

/// Per-sender autoresponse throttle: `(date, count)` per address.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutoresponseWindow {
    counters: BTreeMap<String, (NaiveDate, u32)>,
}

impl AutoresponseWindow {
    /// Record an intent to autorespond to `address` today; false when the
    /// sender already hit the daily cap.
    pub fn allow(&mut self, address: &str, today: NaiveDate, max_per_day: u32) -> bool {
        let entry = self
            .counters
            .entry(address.to_ascii_lowercase())
            .or_insert((today, 0));
        if entry.0 != today {
            *entry = (today, 0);
        }
        if entry.1 >= max_per_day {
            return false;
        }
        entry.1 += 1;
        true
    }
}

/// A mailing list: identity plus capability records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailingList {
    /// Fully qualified list name, `local@domain`.
    pub name: String,
    /// Display name used in generated prose.
    pub real_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub preferred_language: Lang,
    /// Prefix prepended to Subject lines, e.g. `[Test] `.
    #[serde(default)]
    pub subject_prefix: String,
    /// Point Reply-To at the list rather than the author.
    #[serde(default)]
    pub reply_goes_to_list: bool,
    /// Strip text/html parts from postings.
    #[serde(default)]
    pub filter_html: bool,
    /// Template prepended to each delivered message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_header: Option<String>,
    /// Template appended to each delivered message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_footer: Option<String>,
    /// Autoresponse policy for the -request address.
    #[serde(default)]
    pub autorespond_requests: AutoResponse,
    /// Canned -request autoresponse text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autoresponse_text: Option<String>,
    #[serde(default)]
    pub autoresponses: AutoresponseWindow,
    #[serde(default)]
    pub roster: Roster,
    #[serde(default)]
    pub moderation: ModerationPolicy,
    #[serde(default)]
    pub digest: DigestClock,
    #[serde(default)]
    pub bounce: BounceLog,
}

impl MailingList {
    /// A new list with defaults; `name` must be `local@domain`.
    pub fn new(name: &str, real_name: &str) -> Result<Self> {
        if !name.contains('@') {
            bail!("list name {name:?} is not fully qualified (local@domain)");
        }
        Ok(Self {
            name: name.to_ascii_lowercase(),
            real_name: real_name.to_string(),
            description: String::new(),
            preferred_language: Lang::default(),
            subject_prefix: format!("[{real_name}] "),
            reply_goes_to_list: false,
            filter_html: false,
            msg_header: None,
            msg_footer: None,
            autorespond_requests: AutoResponse::None,
            autoresponse_text: None,
            autoresponses: AutoresponseWindow::default(),
            roster: Roster::default(),
            moderation: ModerationPolicy::default(),
            digest: DigestClock::default(),
            bounce: BounceLog::default(),
        })
    }

    /// Local part of the list address.
    pub fn list_name(&self) -> &str {
        self.name.split('@').next().unwrap_or(&self.name)
    }

    /// Domain part of the list address.
    pub fn host_name(&self) -> &str {
        self.name.split('@').nth(1).unwrap_or("localhost")
    }

    /// The posting address.
    pub fn posting_address(&self) -> &str {
        &self.name
    }

    pub fn request_address(&self) -> String {
        format!("{}-request@{}", self.list_name(), self.host_name())
    }

    pub fn bounces_address(&self) -> String {
        format!("{}-bounces@{}", self.list_name(), self.host_name())
    }

    pub fn owner_address(&self) -> String {
        format!("{}-owner@{}", self.list_name(), self.host_name())
    }

    /// VERP'd address a confirm reply comes back on.
    pub fn confirm_address(&self, token: &str) -> String {
        format!("{}+confirm.{}@{}", self.list_name(), token, self.host_name())
    }

    /// Check a candidate against the moderator password.
    pub fn check_moderator_password(&self, candidate: &str) -> bool {
        match &self.moderation.moderator_password {
            Some(digest) => *digest == password_digest(candidate),
            None => false,
        }
    }
}

/// Persistence seam for list state. The production list manager is an
/// external collaborator; [`FileListStore`] is the engine-side reference
/// implementation.
pub trait ListStore {
    fn load(&self, name: &str) -> Result<MailingList>;
    fn save(&self, list: &MailingList) -> Result<()>;
    fn exists(&self, name: &str) -> bool;
    /// All known list names, sorted.
    fn names(&self) -> Result<Vec<String>>;
}

/// JSON-file list store: `<root>/<name>/config.json`, written via
/// tmp+rename so readers never observe a torn file.
#[derive(Debug, Clone)]
pub struct FileListStore {
    root: PathBuf,
}

impl FileListStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Per-list directory (also holds `digest.mbox`).
    pub fn list_dir(&self, name: &str) -> PathBuf {
        self.root.join(name.to_ascii_lowercase())
    }

    fn config_path(&self, name: &str) -> PathBuf {
        self.list_dir(name).join("config.json")
    }
}

impl ListStore for FileListStore {
    fn load(&self, name: &str) -> Result<MailingList> {
        let path = self.config_path(name);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read list config {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse list config {}", path.display()))
    }

    fn save(&self, list: &MailingList) -> Result<()> {
        let dir = self.list_dir(&list.name);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create list dir {}", dir.display()))?;
        let path = self.config_path(&list.name);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(list).context("failed to serialize list")?;
        std::fs::write(&tmp, json)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("failed to rename {} into place", tmp.display()))?;
        Ok(())
    }

    fn exists(&self, name: &str) -> bool {
        self.config_path(name).exists()
    }

    fn names(&self) -> Result<Vec<String>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.root)
            .with_context(|| format!("failed to read list root {}", self.root.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str()
                && self.exists(name)
            {
                names.push(name.to_string());
            }
        }
        names.sort_unstable();
        Ok(names)
    }
}

/// Path of a list's accumulating digest mbox.
pub fn digest_mbox_path(list_dir: &Path) -> PathBuf {
    list_dir.join("digest.mbox")
}
