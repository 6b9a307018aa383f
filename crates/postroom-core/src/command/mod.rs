//! The -request robot: parse commands from Subject and body, dispatch
//! each line through the static verb registry, and mail back a report.

mod verbs;

pub use verbs::find_command;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use postroom_lock::LockError;
use postroom_message::{Body, Message, wrap};
use postroom_pending::PendingStore;
use postroom_switchboard::{Metadata, Switchboard};
use postroom_types::{Channel, QueueName};
use regex::Regex;

use crate::Site;
use crate::handlers::autorespond_request;
use crate::i18n::Catalog;
use crate::list::{AutoResponse, FileListStore, ListStore, MailingList};
use crate::runner::{Dispose, Disposition};

/// Whether command processing continues after a verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// One email command verb.
pub trait MailCommand: Sync {
    fn name(&self) -> &'static str;

    fn run(
        &self,
        ctx: &mut CommandCtx<'_>,
        res: &mut Results,
        args: &[&str],
    ) -> Result<Flow>;
}

/// Everything a verb may touch.
pub struct CommandCtx<'a> {
    pub site: &'a Site,
    pub virgin: &'a Switchboard,
    pub pending: &'a PendingStore,
    pub store: &'a FileListStore,
    pub list: &'a mut MailingList,
    pub msg: &'a Message,
    pub catalog: Catalog,
}

/// Accumulated state of one command message: the lines to process and
/// the three report sections.
pub struct Results {
    pub commands: Vec<String>,
    pub results: Vec<String>,
    pub ignored: Vec<String>,
    pub lineno: usize,
    pub respond: bool,
    /// Reply somewhere other than the sender (e.g. password resets).
    pub return_addr: Option<String>,
    subjcmd_retried: bool,
}

impl Results {
    /// Gather command lines: the Subject first, then the first text/plain
    /// part's body up to `max_lines`; everything past that is ignored.
    pub fn new(msg: &Message, max_lines: usize, catalog: &Catalog) -> Self {
        let mut res = Self {
            commands: vec![msg.subject().unwrap_or("").to_string()],
            results: Vec::new(),
            ignored: Vec::new(),
            lineno: 0,
            respond: true,
            return_addr: None,
            subjcmd_retried: false,
        };

        let part = msg.first_text_plain();
        let (ctype, subtype) = msg.content_type();
        let top_is_plain =
            matches!(msg.body(), Body::Text(_)) && ctype == "text" && subtype == "plain";
        if part.is_none() || !top_is_plain {
            res.results.push(catalog.ignoring_non_text().to_string());
        }
        if let Some(body) = part {
            let lines: Vec<String> = body.lines().map(str::to_string).collect();
            for (index, line) in lines.into_iter().enumerate() {
                if index < max_lines {
                    res.commands.push(line);
                } else {
                    res.ignored.push(line);
                }
            }
        }
        res
    }

    /// Process each line until a verb stops us or a non-command line is
    /// hit past the Subject.
    pub fn process(&mut self, ctx: &mut CommandCtx<'_>) -> Result<()> {
        let lines = self.commands.clone();
        for line in lines {
            let mut stop = false;
            if !line.trim().is_empty() {
                let mut args: Vec<String> =
                    line.split_whitespace().map(str::to_string).collect();
                let cmd = args.remove(0).to_lowercase();
                stop = self.do_command(ctx, &cmd, args)?;
            }
            self.lineno += 1;
            if stop {
                break;
            }
        }
        Ok(())
    }

    /// Dispatch one verb. Returns whether processing stops.
    pub fn do_command(
        &mut self,
        ctx: &mut CommandCtx<'_>,
        cmd: &str,
        mut args: Vec<String>,
    ) -> Result<bool> {
        if let Some(handler) = find_command(cmd) {
            let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
            return Ok(handler.run(ctx, self, &arg_refs)? == Flow::Stop);
        }

        // On the Subject line, a localised Re: prefix may be masking the
        // real verb. Strip it once and retry.
        if self.lineno == 0 && !self.subjcmd_retried {
            for prefix in ctx.catalog.re_prefixes() {
                if let Some(rest) = cmd.strip_prefix(prefix) {
                    self.subjcmd_retried = true;
                    let next = if rest.is_empty() {
                        if args.is_empty() {
                            return Ok(false);
                        }
                        args.remove(0).to_lowercase()
                    } else {
                        rest.to_lowercase()
                    };
                    return self.do_command(ctx, &next, args);
                }
            }
        }

        // A failed Subject command is not enough to stop processing; a
        // failed body line is.
        Ok(self.lineno != 0)
    }

    /// Compose and enqueue the reply: Results / Unprocessed / Ignored
    /// sections plus the original message, sent from the bounces address.
    pub fn send_response(&self, ctx: &mut CommandCtx<'_>) -> Result<()> {
        if !self.respond {
            return Ok(());
        }
        let Some(recipient) = self
            .return_addr
            .clone()
            .or_else(|| ctx.msg.sender())
        else {
            return Ok(());
        };

        // Cap autoresponses per sender per day to stop reply loops with
        // misconfigured robots.
        let max = ctx.site.config().max_autoresponses_per_day();
        if !ctx
            .list
            .autoresponses
            .allow(&recipient, Utc::now().date_naive(), max)
        {
            ctx.site.logger().log(
                Channel::Vette,
                Some(&ctx.list.name),
                format!("command response suppressed, cap reached for {recipient}"),
            );
            return Ok(());
        }

        let indent = |lines: &[String]| -> Vec<String> {
            lines.iter().map(|l| format!("    {l}")).collect()
        };

        let mut resp = vec![wrap(ctx.catalog.results_preamble(), 70)];
        if !self.results.is_empty() {
            resp.push(ctx.catalog.results_section().to_string());
            resp.extend(indent(&self.results));
        }
        let unprocessed: Vec<String> = self
            .commands
            .iter()
            .skip(self.lineno)
            .filter(|l| !l.trim().is_empty())
            .cloned()
            .collect();
        if !unprocessed.is_empty() {
            resp.push(ctx.catalog.unprocessed_section().to_string());
            resp.extend(indent(&unprocessed));
        }
        if !self.ignored.is_empty() {
            resp.push(ctx.catalog.ignored_section().to_string());
            resp.extend(indent(&self.ignored));
        }
        resp.push(ctx.catalog.done().to_string());

        let mut reply = Message::multipart("mixed");
        reply.append("From", ctx.list.bounces_address());
        reply.append("To", recipient.clone());
        reply.append("Subject", ctx.catalog.command_results_subject());
        reply.append(
            "Message-ID",
            postroom_message::make_message_id(ctx.list.host_name()),
        );
        reply.append("Date", postroom_message::rfc2822_now());
        reply.append("X-Ack", "no");
        reply.attach(Message::text_plain(
            resp.join("\n"),
            ctx.list.preferred_language.charset(),
        ))?;

        let mut original = Message::new();
        original.append("Content-Type", "message/rfc822");
        original.append("Content-Description", "Original message");
        original.set_body(Body::Rfc822(Box::new(ctx.msg.clone())));
        reply.attach(original)?;

        let mut meta = Metadata::new();
        meta.set_listname(&ctx.list.name);
        meta.set_recipients(std::slice::from_ref(&recipient));
        ctx.virgin.enqueue(&reply.to_bytes(), &meta)?;
        Ok(())
    }
}

/// Disposal logic for the command queue.
pub struct CommandProcessor {
    site: Site,
    virgin: Switchboard,
}

impl CommandProcessor {
    pub fn new(site: Site) -> Result<Self> {
        let virgin = site.queue(QueueName::Virgin)?;
        Ok(Self { site, virgin })
    }
}

impl Dispose for CommandProcessor {
    fn dispose(&mut self, msg: Message, meta: Metadata) -> Result<Disposition> {
        let listname = meta
            .listname()
            .ok_or_else(|| anyhow!("command entry has no listname"))?
            .to_string();

        // Loop defence: bulk-precedence mail without an explicit X-Ack
        // yes is discarded before anything else happens.
        let precedence = msg.get("precedence").unwrap_or("").to_ascii_lowercase();
        let ack = msg.get("x-ack").unwrap_or("").to_ascii_lowercase();
        if ack != "yes" && matches!(precedence.as_str(), "bulk" | "junk" | "list") {
            self.site.logger().log(
                Channel::Vette,
                Some(&listname),
                format!("Precedence: {precedence} message discarded"),
            );
            return Ok(Disposition::Finish);
        }

        let _lock = match self.site.lock_list(&listname) {
            Ok(lock) => lock,
            Err(LockError::Timeout { .. }) => return Ok(Disposition::Retry),
            Err(err) => return Err(err).context("list lock"),
        };

        let store = self.site.list_store();
        let mut list = store.load(&listname)?;

        // The replybot runs first; a respond-and-discard list never
        // reaches the parser.
        autorespond_request(&self.site, &self.virgin, &mut list, &msg)?;
        if list.autorespond_requests == AutoResponse::RespondAndDiscard {
            self.site.logger().log(
                Channel::Vette,
                Some(&listname),
                "replied to -request mail and discarded it",
            );
            store.save(&list)?;
            return Ok(Disposition::Finish);
        }

        let catalog = Catalog::new(list.preferred_language);
        let max_lines = self.site.config().max_command_lines();
        let mut res = Results::new(&msg, max_lines, &catalog);
        let pending = self.site.pending_store();

        let mut ctx = CommandCtx {
            site: &self.site,
            virgin: &self.virgin,
            pending: &pending,
            store: &store,
            list: &mut list,
            msg: &msg,
            catalog,
        };

        // The MTA routed this to one of -request, -join, -leave, or the
        // VERP confirm address; metadata says which.
        if meta.get_bool("tojoin") {
            res.do_command(&mut ctx, "join", Vec::new())?;
        } else if meta.get_bool("toleave") {
            res.do_command(&mut ctx, "leave", Vec::new())?;
        } else if meta.get_bool("toconfirm") {
            let pattern = Regex::new(self.site.config().verp_confirm_regexp())
                .context("invalid VERP confirm regexp")?;
            if let Some(cookie) = msg
                .get("to")
                .and_then(|to| pattern.captures(to))
                .and_then(|caps| caps.name("cookie").map(|m| m.as_str().to_string()))
            {
                res.do_command(&mut ctx, "confirm", vec![cookie])?;
            }
        } else {
            res.process(&mut ctx)?;
        }

        res.send_response(&mut ctx)?;
        store.save(&list)?;
        Ok(Disposition::Finish)
    }
}
