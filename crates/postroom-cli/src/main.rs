use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use postroom_core::Site;
use postroom_core::bounce::BounceScanner;
use postroom_core::command::CommandProcessor;
use postroom_core::incoming::Incoming;
use postroom_core::inject::inject_message;
use postroom_core::list::ListStore;
use postroom_core::mta::AliasWriter;
use postroom_core::runner::{Dispose, Runner};
use postroom_core::transport::{Outgoing, Retry, SendmailTransport, Virgin};
use postroom_types::QueueName;

#[derive(Parser, Debug)]
#[command(name = "postroom", version)]
#[command(about = "Filesystem-spool mailing list engine: queue runners and site tooling")]
struct Cli {
    /// Path to the site configuration file.
    #[arg(long, default_value = "postroom.toml")]
    config: PathBuf,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Drain one spool directory until stopped.
    Runner {
        /// Queue to drain: in, cmd, bounces, out, virgin, retry.
        #[arg(long)]
        queue: String,

        /// Drain the queue once and exit instead of looping.
        #[arg(long)]
        once: bool,

        /// Sendmail-compatible binary used for final delivery.
        #[arg(long, default_value = "/usr/sbin/sendmail")]
        sendmail: PathBuf,

        /// Sleep between empty cycles (e.g. 1s, 500ms); overrides config.
        #[arg(long)]
        sleep: Option<String>,
    },
    /// Regenerate the MTA alias map atomically.
    Aliases,
    /// Inject an RFC 5322 message file into a queue.
    Inject {
        /// Fully qualified list name (local@domain).
        #[arg(long)]
        list: String,

        /// Target queue (default: in).
        #[arg(long, default_value = "in")]
        queue: String,

        /// Explicit recipient (repeatable); default is the list roster.
        #[arg(long = "recipient")]
        recipients: Vec<String>,

        /// Message file to inject.
        file: PathBuf,
    },
    /// Remove expired pending confirmations.
    Evict,
    /// Enqueue a clean-stop sentinel for a queue's runner.
    Stop {
        #[arg(long)]
        queue: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = postroom_config::load_config_from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let site = Site::new(config);

    match cli.cmd {
        Commands::Runner {
            queue,
            once,
            sendmail,
            sleep,
        } => run_runner(site, &queue, once, sendmail, sleep),
        Commands::Aliases => {
            AliasWriter::new(&site).regenerate()?;
            eprintln!("[info] alias map regenerated at {}", site.alias_map_path().display());
            Ok(())
        }
        Commands::Inject {
            list,
            queue,
            recipients,
            file,
        } => {
            let queue = parse_queue(&queue)?;
            let mailing_list = site.list_store().load(&list)?;
            let raw = std::fs::read(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let recipients = if recipients.is_empty() {
                None
            } else {
                Some(recipients)
            };
            let id = inject_message(&site, &mailing_list, &raw, recipients.as_deref(), queue)?;
            eprintln!("[info] injected {id} into {queue}");
            Ok(())
        }
        Commands::Evict => {
            let removed = site.pending_store().evict()?;
            eprintln!("[info] evicted {removed} expired pending records");
            Ok(())
        }
        Commands::Stop { queue } => {
            let queue = parse_queue(&queue)?;
            site.queue(queue)?.enqueue_stop()?;
            eprintln!("[info] stop sentinel enqueued for {queue}");
            Ok(())
        }
    }
}

fn parse_queue(name: &str) -> Result<QueueName> {
    QueueName::parse(name).with_context(|| format!("unknown queue {name:?}"))
}

fn run_runner(
    site: Site,
    queue: &str,
    once: bool,
    sendmail: PathBuf,
    sleep: Option<String>,
) -> Result<()> {
    let queue = parse_queue(queue)?;
    let sleep = match sleep {
        Some(text) => humantime::parse_duration(&text)
            .with_context(|| format!("bad --sleep value {text:?}"))?,
        None => site.config().runner_sleep_interval(),
    };

    match queue {
        QueueName::In => {
            let disposer = Incoming::new(site.clone())?;
            drive(build(&site, "incoming", queue, sleep, disposer)?, once)
        }
        QueueName::Cmd => {
            let disposer = CommandProcessor::new(site.clone())?;
            drive(build(&site, "command", queue, sleep, disposer)?, once)
        }
        QueueName::Bounces => {
            let disposer = BounceScanner::new(site.clone())?;
            drive(build(&site, "bounce", queue, sleep, disposer)?, once)
        }
        QueueName::Out => {
            let disposer = Outgoing::new(site.clone(), SendmailTransport::new(sendmail))?;
            drive(build(&site, "outgoing", queue, sleep, disposer)?, once)
        }
        QueueName::Virgin => {
            let disposer = Virgin::new(&site)?;
            drive(build(&site, "virgin", queue, sleep, disposer)?, once)
        }
        QueueName::Retry => {
            let disposer = Retry::new(&site)?;
            drive(build(&site, "retry", queue, sleep, disposer)?, once)
        }
        other => bail!("no runner drains the {other} queue"),
    }
}

fn build<D: Dispose>(
    site: &Site,
    name: &'static str,
    queue: QueueName,
    sleep: Duration,
    disposer: D,
) -> Result<Runner<D>> {
    Ok(Runner::new(
        name,
        site.queue(queue)?,
        site.queue(QueueName::Shunt)?,
        site.queue(QueueName::Bad)?,
        site.logger().clone(),
        sleep,
        site.config().runner_refresh_every(),
        disposer,
    ))
}

fn drive<D: Dispose>(mut runner: Runner<D>, once: bool) -> Result<()> {
    runner.install_signal_handlers()?;
    if once {
        runner.recover()?;
        runner.run_once()?;
        Ok(())
    } else {
        runner.run()
    }
}
