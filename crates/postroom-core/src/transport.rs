//! Final delivery: the MTA hook trait, the outgoing/retry/virgin queue
//! disposers, and a sendmail-spawning reference transport.
//!
//! Actual SMTP/LMTP wire clients are external collaborators; the engine
//! only hands a fully formed message plus an envelope to the
//! [`MailTransport`] seam.

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use postroom_message::{Message, make_message_id, rfc2822_now};
use postroom_switchboard::{Metadata, Switchboard};
use postroom_types::{Channel, QueueName};

use crate::Site;
use crate::list::ListStore;
use crate::runner::{Dispose, Disposition};

/// Wait before a failed delivery is retried.
const DELIVERY_RETRY_WAIT_SECS: i64 = 15 * 60;

/// The MTA hook: deliver one message to a recipient set.
pub trait MailTransport {
    fn deliver(&self, envelope_from: &str, recipients: &[String], message: &[u8])
    -> Result<()>;
}

/// Reference transport: pipe the message to a sendmail-compatible binary.
pub struct SendmailTransport {
    program: PathBuf,
}

impl SendmailTransport {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for SendmailTransport {
    fn default() -> Self {
        Self::new("/usr/sbin/sendmail")
    }
}

impl MailTransport for SendmailTransport {
    fn deliver(
        &self,
        envelope_from: &str,
        recipients: &[String],
        message: &[u8],
    ) -> Result<()> {
        let mut child = Command::new(&self.program)
            .arg("-oi")
            .arg("-f")
            .arg(envelope_from)
            .args(recipients)
            .stdin(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.program.display()))?;
        child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("no stdin handle on {}", self.program.display()))?
            .write_all(message)
            .context("failed to stream message to sendmail")?;
        let status = child.wait().context("failed to wait for sendmail")?;
        if !status.success() {
            bail!("{} exited with {status}", self.program.display());
        }
        Ok(())
    }
}

/// Test double that records deliveries in memory.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    deliveries: std::sync::Mutex<Vec<(String, Vec<String>, Vec<u8>)>>,
    pub fail: std::sync::atomic::AtomicBool,
}

impl RecordingTransport {
    pub fn deliveries(&self) -> Vec<(String, Vec<String>, Vec<u8>)> {
        self.deliveries.lock().expect("poisoned").clone()
    }
}

impl MailTransport for &RecordingTransport {
    fn deliver(
        &self,
        envelope_from: &str,
        recipients: &[String],
        message: &[u8],
    ) -> Result<()> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            bail!("transport told to fail");
        }
        self.deliveries.lock().expect("poisoned").push((
            envelope_from.to_string(),
            recipients.to_vec(),
            message.to_vec(),
        ));
        Ok(())
    }
}

/// Disposal logic for the `out` queue: hand each entry to the transport;
/// a failed delivery parks the entry in `retry` with a deliver-after
/// stamp.
pub struct Outgoing<T> {
    site: Site,
    transport: T,
    retry: Switchboard,
}

impl<T: MailTransport> Outgoing<T> {
    pub fn new(site: Site, transport: T) -> Result<Self> {
        let retry = site.queue(QueueName::Retry)?;
        Ok(Self {
            site,
            transport,
            retry,
        })
    }
}

impl<T: MailTransport> Dispose for Outgoing<T> {
    fn dispose(&mut self, msg: Message, meta: Metadata) -> Result<Disposition> {
        let listname = meta
            .listname()
            .ok_or_else(|| anyhow!("outgoing entry has no listname"))?
            .to_string();
        let list = self.site.list_store().load(&listname)?;

        let recipients = meta
            .recipients()
            .unwrap_or_else(|| list.roster.regular_delivery_addresses());
        if recipients.is_empty() {
            return Ok(Disposition::Finish);
        }

        let bytes = msg.to_bytes();
        match self
            .transport
            .deliver(&list.bounces_address(), &recipients, &bytes)
        {
            Ok(()) => Ok(Disposition::Finish),
            Err(err) => {
                self.site.logger().log(
                    Channel::Error,
                    Some(&listname),
                    format!("delivery failed, parking in retry: {err:#}"),
                );
                let mut retry_meta = meta.clone();
                retry_meta.set_i64(
                    "deliver_after",
                    Utc::now().timestamp() + DELIVERY_RETRY_WAIT_SECS,
                );
                retry_meta.set_str("last_delivery_error", &format!("{err:#}"));
                self.retry.enqueue(&bytes, &retry_meta)?;
                Ok(Disposition::Finish)
            }
        }
    }
}

/// Disposal logic for the `retry` queue: move entries back to `out` once
/// their deliver-after time has passed.
pub struct Retry {
    out: Switchboard,
}

impl Retry {
    pub fn new(site: &Site) -> Result<Self> {
        Ok(Self {
            out: site.queue(QueueName::Out)?,
        })
    }
}

impl Dispose for Retry {
    fn dispose(&mut self, msg: Message, meta: Metadata) -> Result<Disposition> {
        let due = meta.get_i64("deliver_after").unwrap_or(0);
        if Utc::now().timestamp() < due {
            return Ok(Disposition::Retry);
        }
        self.out.enqueue(&msg.to_bytes(), &meta)?;
        Ok(Disposition::Finish)
    }
}

/// Disposal logic for the `virgin` queue: system-synthesised mail gets
/// its Message-ID and Date stamped, then takes the normal outgoing path.
pub struct Virgin {
    out: Switchboard,
}

impl Virgin {
    pub fn new(site: &Site) -> Result<Self> {
        Ok(Self {
            out: site.queue(QueueName::Out)?,
        })
    }
}

impl Dispose for Virgin {
    fn dispose(&mut self, mut msg: Message, meta: Metadata) -> Result<Disposition> {
        let host = meta
            .listname()
            .and_then(|name| name.split('@').nth(1))
            .unwrap_or("localhost")
            .to_string();
        msg.ensure("Message-ID", make_message_id(&host));
        msg.ensure("Date", rfc2822_now());
        self.out.enqueue(&msg.to_bytes(), &meta)?;
        Ok(Disposition::Finish)
    }
}
