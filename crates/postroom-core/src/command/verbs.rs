//! The email command verbs.
//!
//! Verbs live in a static registry resolved once per line; nothing is
//! loaded dynamically per message.

use std::collections::BTreeMap;

use anyhow::Result;
use postroom_types::{Channel, DeliveryStatus};
use rand::RngExt;
use rand::distr::Alphanumeric;

use super::{CommandCtx, Flow, MailCommand, Results};
use crate::list::{ListStore, Member};
use crate::notify::{enqueue_virgin, user_notification};

static HELP: Help = Help;
static INFO: Info = Info;
static LISTS: Lists = Lists;
static WHO: Who = Who;
static SUBSCRIBE: Subscribe = Subscribe;
static UNSUBSCRIBE: Unsubscribe = Unsubscribe;
static REMOVE: Remove = Remove;
static JOIN: Join = Join;
static LEAVE: Leave = Leave;
static CONFIRM: Confirm = Confirm;
static SET: Set = Set;
static OPTIONS: Options = Options;
static PASSWORD: Password = Password;
static END: End = End;

/// Resolve a lowercased verb to its handler.
pub fn find_command(verb: &str) -> Option<&'static dyn MailCommand> {
    Some(match verb {
        "help" => &HELP,
        "info" => &INFO,
        "lists" => &LISTS,
        "who" => &WHO,
        "subscribe" => &SUBSCRIBE,
        "unsubscribe" => &UNSUBSCRIBE,
        "remove" => &REMOVE,
        "join" => &JOIN,
        "leave" => &LEAVE,
        "confirm" => &CONFIRM,
        "set" => &SET,
        "options" => &OPTIONS,
        "password" => &PASSWORD,
        "end" | "stop" => &END,
        _ => return None,
    })
}

fn make_password() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect()
}

/// Pend a subscription and tell the requester how to confirm. When the
/// request came from the address itself, the instructions ride in the
/// command reply; a third-party request mails the address directly.
fn request_subscription(
    ctx: &mut CommandCtx<'_>,
    res: &mut Results,
    address: Option<String>,
    password: Option<String>,
    digest: bool,
) -> Result<()> {
    let Some(addr) = address.or_else(|| ctx.msg.sender()) else {
        res.results
            .push("Nothing to subscribe: no address given".to_string());
        return Ok(());
    };
    if !addr.contains('@') || addr.starts_with('-') {
        res.results.push(format!("Invalid address: {addr}"));
        return Ok(());
    }
    if ctx.list.roster.is_member(&addr) {
        res.results.push(format!(
            "{addr} is already a member of the {} mailing list",
            ctx.list.real_name
        ));
        return Ok(());
    }

    let password = password.unwrap_or_else(make_password);
    let mut fields = BTreeMap::new();
    fields.insert("action".to_string(), "subscribe".to_string());
    fields.insert("address".to_string(), addr.clone());
    fields.insert("password".to_string(), password);
    fields.insert("digest".to_string(), digest.to_string());
    fields.insert("listname".to_string(), ctx.list.name.clone());
    let token = ctx.pending.add(fields, None)?;
    let confirm_addr = ctx.list.confirm_address(&token);

    res.results.push(format!("Confirmation requested for {addr}"));
    if ctx.msg.sender().as_deref() == Some(addr.as_str()) {
        res.results
            .push(format!("To finish, send any message to {confirm_addr},"));
        res.results
            .push(format!("or a message containing the line: confirm {token}"));
    } else {
        let body = format!(
            "A subscription of your address to the {} mailing list has been\n\
             requested. To confirm, send any message to\n\n    {}\n\n\
             or reply with a message containing the line:\n\n    confirm {}\n\n\
             If this request is not yours, simply ignore this message.\n",
            ctx.list.real_name, confirm_addr, token
        );
        let notice = user_notification(
            ctx.list,
            &addr,
            &format!(
                "Your confirmation is required to join the {} mailing list",
                ctx.list.real_name
            ),
            &body,
        );
        enqueue_virgin(ctx.virgin, ctx.list, &notice, std::slice::from_ref(&addr))?;
    }

    ctx.site.logger().log(
        Channel::Subscribe,
        Some(&ctx.list.name),
        format!("subscription of {addr} pended"),
    );
    Ok(())
}

/// Remove immediately with the right password, otherwise pend a
/// confirmation.
fn request_removal(
    ctx: &mut CommandCtx<'_>,
    res: &mut Results,
    address: Option<String>,
    password: Option<String>,
) -> Result<()> {
    let Some(addr) = address.or_else(|| ctx.msg.sender()) else {
        res.results
            .push("Nothing to unsubscribe: no address given".to_string());
        return Ok(());
    };
    if !ctx.list.roster.is_member(&addr) {
        res.results.push(format!(
            "{addr} is not a member of the {} mailing list",
            ctx.list.real_name
        ));
        return Ok(());
    }

    if let Some(password) = password
        && ctx
            .list
            .roster
            .get(&addr)
            .is_some_and(|m| m.check_password(&password))
    {
        ctx.list.roster.remove(&addr)?;
        ctx.list.bounce.clear(&addr);
        res.results.push(format!("Unsubscribed: {addr}"));
        ctx.site.logger().log(
            Channel::Subscribe,
            Some(&ctx.list.name),
            format!("{addr} unsubscribed by password"),
        );
        return Ok(());
    }

    let mut fields = BTreeMap::new();
    fields.insert("action".to_string(), "unsubscribe".to_string());
    fields.insert("address".to_string(), addr.clone());
    fields.insert("listname".to_string(), ctx.list.name.clone());
    let token = ctx.pending.add(fields, None)?;
    let confirm_addr = ctx.list.confirm_address(&token);

    res.results
        .push(format!("Confirmation requested to remove {addr}"));
    res.results
        .push(format!("To finish, send any message to {confirm_addr},"));
    res.results
        .push(format!("or a message containing the line: confirm {token}"));
    Ok(())
}

struct Help;

impl MailCommand for Help {
    fn name(&self) -> &'static str {
        "help"
    }

    fn run(
        &self,
        ctx: &mut CommandCtx<'_>,
        res: &mut Results,
        _args: &[&str],
    ) -> Result<Flow> {
        res.results.push(format!(
            "Help for the {} mailing list ({}):",
            ctx.list.real_name,
            ctx.list.posting_address()
        ));
        res.results.extend(
            [
                "",
                "subscribe [password] [digest|nodigest] [address=<address>]",
                "    Subscribe to the list, pending email confirmation.",
                "unsubscribe [password] [address=<address>]",
                "    Leave the list; immediate with your password.",
                "confirm <token>",
                "    Complete a pended subscribe or unsubscribe.",
                "who",
                "    Show the list membership, where public.",
                "info",
                "    Describe this mailing list.",
                "lists",
                "    Name the mailing lists on this server.",
                "set <digest|mime|delivery> <on|off>",
                "    Change your delivery options.",
                "options",
                "    Show your current delivery options.",
                "password <old> <new>",
                "    Change your list password.",
                "end",
                "    Stop processing further commands.",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
        Ok(Flow::Continue)
    }
}

struct Info;

impl MailCommand for Info {
    fn name(&self) -> &'static str {
        "info"
    }

    fn run(
        &self,
        ctx: &mut CommandCtx<'_>,
        res: &mut Results,
        _args: &[&str],
    ) -> Result<Flow> {
        res.results
            .push(format!("{} mailing list", ctx.list.real_name));
        if ctx.list.description.is_empty() {
            res.results.push("(no description available)".to_string());
        } else {
            res.results.push(ctx.list.description.clone());
        }
        res.results
            .push(format!("Posting address: {}", ctx.list.posting_address()));
        res.results
            .push(format!("Requests: {}", ctx.list.request_address()));
        Ok(Flow::Continue)
    }
}

struct Lists;

impl MailCommand for Lists {
    fn name(&self) -> &'static str {
        "lists"
    }

    fn run(
        &self,
        ctx: &mut CommandCtx<'_>,
        res: &mut Results,
        _args: &[&str],
    ) -> Result<Flow> {
        res.results
            .push("Mailing lists on this server:".to_string());
        for name in ctx.store.names()? {
            res.results.push(format!("    {name}"));
        }
        Ok(Flow::Continue)
    }
}

struct Who;

impl MailCommand for Who {
    fn name(&self) -> &'static str {
        "who"
    }

    fn run(
        &self,
        ctx: &mut CommandCtx<'_>,
        res: &mut Results,
        _args: &[&str],
    ) -> Result<Flow> {
        if ctx.list.roster.private {
            res.results
                .push("The membership roster is not available".to_string());
            return Ok(Flow::Continue);
        }
        res.results.push(format!(
            "Members of the {} mailing list:",
            ctx.list.real_name
        ));
        for member in ctx.list.roster.members() {
            res.results.push(format!("    {}", member.address));
        }
        Ok(Flow::Continue)
    }
}

struct Subscribe;

impl MailCommand for Subscribe {
    fn name(&self) -> &'static str {
        "subscribe"
    }

    fn run(
        &self,
        ctx: &mut CommandCtx<'_>,
        res: &mut Results,
        args: &[&str],
    ) -> Result<Flow> {
        let mut password = None;
        let mut digest = false;
        let mut address = None;
        for arg in args {
            if let Some(addr) = arg.strip_prefix("address=") {
                address = Some(addr.to_ascii_lowercase());
            } else if arg.eq_ignore_ascii_case("digest") {
                digest = true;
            } else if arg.eq_ignore_ascii_case("nodigest") {
                digest = false;
            } else if password.is_none() {
                password = Some((*arg).to_string());
            }
        }
        request_subscription(ctx, res, address, password, digest)?;
        Ok(Flow::Continue)
    }
}

struct Unsubscribe;

impl MailCommand for Unsubscribe {
    fn name(&self) -> &'static str {
        "unsubscribe"
    }

    fn run(
        &self,
        ctx: &mut CommandCtx<'_>,
        res: &mut Results,
        args: &[&str],
    ) -> Result<Flow> {
        let mut password = None;
        let mut address = None;
        for arg in args {
            if let Some(addr) = arg.strip_prefix("address=") {
                address = Some(addr.to_ascii_lowercase());
            } else if password.is_none() {
                password = Some((*arg).to_string());
            }
        }
        request_removal(ctx, res, address, password)?;
        Ok(Flow::Continue)
    }
}

struct Remove;

impl MailCommand for Remove {
    fn name(&self) -> &'static str {
        "remove"
    }

    fn run(
        &self,
        ctx: &mut CommandCtx<'_>,
        res: &mut Results,
        args: &[&str],
    ) -> Result<Flow> {
        UNSUBSCRIBE.run(ctx, res, args)
    }
}

struct Join;

impl MailCommand for Join {
    fn name(&self) -> &'static str {
        "join"
    }

    fn run(
        &self,
        ctx: &mut CommandCtx<'_>,
        res: &mut Results,
        _args: &[&str],
    ) -> Result<Flow> {
        request_subscription(ctx, res, None, None, false)?;
        Ok(Flow::Continue)
    }
}

struct Leave;

impl MailCommand for Leave {
    fn name(&self) -> &'static str {
        "leave"
    }

    fn run(
        &self,
        ctx: &mut CommandCtx<'_>,
        res: &mut Results,
        _args: &[&str],
    ) -> Result<Flow> {
        request_removal(ctx, res, None, None)?;
        Ok(Flow::Continue)
    }
}

struct Confirm;

impl MailCommand for Confirm {
    fn name(&self) -> &'static str {
        "confirm"
    }

    fn run(
        &self,
        ctx: &mut CommandCtx<'_>,
        res: &mut Results,
        args: &[&str],
    ) -> Result<Flow> {
        let Some(token) = args.first() else {
            res.results.push("Usage: confirm <token>".to_string());
            return Ok(Flow::Continue);
        };
        let Some(fields) = ctx.pending.confirm(token, true)? else {
            res.results
                .push("Invalid confirmation string".to_string());
            return Ok(Flow::Continue);
        };

        let address = fields.get("address").cloned().unwrap_or_default();
        match fields.get("action").map(String::as_str) {
            Some("subscribe") => {
                let password = fields
                    .get("password")
                    .cloned()
                    .unwrap_or_else(make_password);
                let mut member = Member::new(&address, &password);
                member.digest = fields.get("digest").map(String::as_str) == Some("true");
                ctx.list.roster.subscribe(member);
                res.results
                    .push(format!("Subscription confirmed: {address}"));
                ctx.site.logger().log(
                    Channel::Subscribe,
                    Some(&ctx.list.name),
                    format!("{address} subscribed by confirmation"),
                );
            }
            Some("unsubscribe") => {
                match ctx.list.roster.remove(&address) {
                    Ok(_) => {
                        ctx.list.bounce.clear(&address);
                        res.results.push(format!("Unsubscribed: {address}"));
                        ctx.site.logger().log(
                            Channel::Subscribe,
                            Some(&ctx.list.name),
                            format!("{address} unsubscribed by confirmation"),
                        );
                    }
                    Err(_) => {
                        res.results
                            .push(format!("{address} is not a member"));
                    }
                }
            }
            _ => {
                res.results
                    .push("Invalid confirmation record".to_string());
            }
        }
        Ok(Flow::Continue)
    }
}

struct Set;

impl MailCommand for Set {
    fn name(&self) -> &'static str {
        "set"
    }

    fn run(
        &self,
        ctx: &mut CommandCtx<'_>,
        res: &mut Results,
        args: &[&str],
    ) -> Result<Flow> {
        let (Some(option), Some(value)) = (args.first(), args.get(1)) else {
            res.results
                .push("Usage: set <digest|mime|delivery> <on|off>".to_string());
            return Ok(Flow::Continue);
        };
        let on = match value.to_ascii_lowercase().as_str() {
            "on" => true,
            "off" => false,
            _ => {
                res.results
                    .push(format!("Bad value {value:?}: expected on or off"));
                return Ok(Flow::Continue);
            }
        };
        let Some(sender) = ctx.msg.sender() else {
            res.results.push("No sender address".to_string());
            return Ok(Flow::Continue);
        };
        if !ctx.list.roster.is_member(&sender) {
            res.results.push(format!(
                "{sender} is not a member of the {} mailing list",
                ctx.list.real_name
            ));
            return Ok(Flow::Continue);
        }

        match option.to_ascii_lowercase().as_str() {
            "digest" => {
                let was_digest = ctx
                    .list
                    .roster
                    .get(&sender)
                    .is_some_and(|m| m.digest);
                if let Some(member) = ctx.list.roster.get_mut(&sender) {
                    member.digest = on;
                }
                // Leaving digest delivery still owes one final digest.
                if was_digest && !on {
                    ctx.list
                        .roster
                        .one_last_digest
                        .insert(sender.to_ascii_lowercase());
                }
                res.results
                    .push(format!("set digest {}", if on { "on" } else { "off" }));
            }
            "mime" => {
                if let Some(member) = ctx.list.roster.get_mut(&sender) {
                    member.mime_digest = on;
                }
                res.results
                    .push(format!("set mime {}", if on { "on" } else { "off" }));
            }
            "delivery" => {
                if let Some(member) = ctx.list.roster.get_mut(&sender) {
                    member.delivery_status = if on {
                        DeliveryStatus::Enabled
                    } else {
                        DeliveryStatus::ByUser
                    };
                }
                res.results
                    .push(format!("set delivery {}", if on { "on" } else { "off" }));
            }
            other => {
                res.results.push(format!("Unknown option: {other}"));
            }
        }
        Ok(Flow::Continue)
    }
}

struct Options;

impl MailCommand for Options {
    fn name(&self) -> &'static str {
        "options"
    }

    fn run(
        &self,
        ctx: &mut CommandCtx<'_>,
        res: &mut Results,
        _args: &[&str],
    ) -> Result<Flow> {
        let Some(member) = ctx.msg.sender().and_then(|s| ctx.list.roster.get(&s).cloned())
        else {
            res.results
                .push("You are not a member of this mailing list".to_string());
            return Ok(Flow::Continue);
        };
        res.results
            .push(format!("Options for {}:", member.address));
        res.results.push(format!(
            "    digest {}",
            if member.digest { "on" } else { "off" }
        ));
        res.results.push(format!(
            "    mime {}",
            if member.mime_digest { "on" } else { "off" }
        ));
        res.results.push(format!(
            "    delivery {}",
            if member.delivery_status.is_enabled() {
                "on"
            } else {
                "off"
            }
        ));
        Ok(Flow::Continue)
    }
}

struct Password;

impl MailCommand for Password {
    fn name(&self) -> &'static str {
        "password"
    }

    fn run(
        &self,
        ctx: &mut CommandCtx<'_>,
        res: &mut Results,
        args: &[&str],
    ) -> Result<Flow> {
        let (Some(old), Some(new)) = (args.first(), args.get(1)) else {
            res.results
                .push("Usage: password <oldpassword> <newpassword>".to_string());
            return Ok(Flow::Continue);
        };
        let Some(sender) = ctx.msg.sender() else {
            res.results.push("No sender address".to_string());
            return Ok(Flow::Continue);
        };
        let Some(member) = ctx.list.roster.get_mut(&sender) else {
            res.results.push(format!(
                "{sender} is not a member of the {} mailing list",
                ctx.list.real_name
            ));
            return Ok(Flow::Continue);
        };
        if !member.check_password(old) {
            res.results.push("Incorrect password".to_string());
            return Ok(Flow::Continue);
        }
        member.password = crate::list::password_digest(new);
        res.results.push("Password changed".to_string());
        Ok(Flow::Continue)
    }
}

struct End;

impl MailCommand for End {
    fn name(&self) -> &'static str {
        "end"
    }

    fn run(
        &self,
        _ctx: &mut CommandCtx<'_>,
        _res: &mut Results,
        _args: &[&str],
    ) -> Result<Flow> {
        Ok(Flow::Stop)
    }
}
