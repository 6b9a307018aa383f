//! Atomic regeneration of the local-delivery alias map.
//!
//! Create, delete, and regenerate are all the same operation: under the
//! site-wide MTA lock, rewrite the whole `postfix_lmtp` file to a `.new`
//! sibling, rename it into place, and run the configured post-map
//! command so the MTA's binary index catches up. Readers therefore never
//! observe a partial file, and concurrent regenerations serialise on the
//! lock.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use postroom_types::Channel;

use crate::Site;
use crate::list::ListStore;

/// Sub-addresses every list answers on, besides the bare posting alias.
pub const SUBDESTINATIONS: [&str; 8] = [
    "bounces",
    "confirm",
    "join",
    "leave",
    "owner",
    "request",
    "subscribe",
    "unsubscribe",
];

/// Writer for the generated alias map.
pub struct AliasWriter<'a> {
    site: &'a Site,
}

impl<'a> AliasWriter<'a> {
    pub fn new(site: &'a Site) -> Self {
        Self { site }
    }

    /// Hook for list creation; the whole file is regenerated.
    pub fn create(&self, _listname: &str) -> Result<()> {
        self.regenerate()
    }

    /// Hook for list deletion; the whole file is regenerated.
    pub fn delete(&self, _listname: &str) -> Result<()> {
        self.regenerate()
    }

    /// Rewrite the alias map under the MTA lock and reindex it.
    pub fn regenerate(&self) -> Result<()> {
        let _lock = self
            .site
            .lock_mta()
            .map_err(|err| anyhow::anyhow!("cannot take MTA lock: {err}"))?;

        let live = self.site.alias_map_path();
        if let Some(parent) = live.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let content = self.render()?;
        let new_path = PathBuf::from(format!("{}.new", live.display()));
        std::fs::write(&new_path, content)
            .with_context(|| format!("failed to write {}", new_path.display()))?;
        std::fs::rename(&new_path, &live)
            .with_context(|| format!("failed to rename {} into place", new_path.display()))?;

        self.run_post_map(&live)
    }

    /// Render the full alias file, grouped by host then list name.
    fn render(&self) -> Result<String> {
        let store = self.site.list_store();
        let mut by_host: std::collections::BTreeMap<String, Vec<String>> =
            std::collections::BTreeMap::new();
        for name in store.names()? {
            let Some((local, domain)) = postroom_message::split_address(&name) else {
                continue;
            };
            by_host.entry(domain).or_default().push(local);
        }

        let lmtp_host = self.site.config().lmtp_host();
        let lmtp_port = self.site.config().lmtp_port();

        let mut out = String::new();
        out.push_str(&format!(
            "# AUTOMATICALLY GENERATED BY POSTROOM ON {}\n\
             #\n\
             # This file is kept in sync with the binary hash file. DO NOT EDIT\n\
             # unless you can keep the two in sync yourself.\n",
            Utc::now().format("%Y-%m-%d %H:%M:%S")
        ));
        for (domain, locals) in &by_host {
            out.push_str(&format!(
                "\n# Aliases which are visible only in the @{domain} domain.\n"
            ));
            // Column alignment comes from the longest name in the group,
            // so adding a short list does not rewrite every line. The
            // extra room covers "-unsubscribe", the longest sub-address.
            let longest = locals
                .iter()
                .map(|local| local.len() + domain.len())
                .max()
                .unwrap_or(0);
            let width = longest + 14;
            let mut locals = locals.clone();
            locals.sort_unstable();
            for local in &locals {
                let bare = format!("{local}@{domain}");
                out.push_str(&format!(
                    "{bare:<width$}lmtp:inet:{lmtp_host}:{lmtp_port}\n"
                ));
                for destination in SUBDESTINATIONS {
                    let alias = format!("{local}-{destination}@{domain}");
                    out.push_str(&format!(
                        "{alias:<width$}lmtp:inet:{lmtp_host}:{lmtp_port}\n"
                    ));
                }
            }
        }
        Ok(out)
    }

    /// Run the configured post-map command over the live file. An empty
    /// command means the site indexes the file some other way.
    fn run_post_map(&self, live: &Path) -> Result<()> {
        let command_line = self.site.config().postfix_map_cmd();
        if command_line.trim().is_empty() {
            return Ok(());
        }
        let mut pieces = command_line.split_whitespace();
        let Some(program) = pieces.next() else {
            return Ok(());
        };
        let status = Command::new(program)
            .args(pieces)
            .arg(live)
            .status()
            .with_context(|| format!("failed to spawn post-map command {command_line:?}"))?;
        if !status.success() {
            self.site.logger().log(
                Channel::Error,
                None,
                format!("post-map command failed: {command_line} {} ({status})", live.display()),
            );
            bail!("post-map command {command_line:?} exited with {status}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::list::MailingList;
    use crate::pipeline::test_support::{Fixture, chain_fixture};

    fn site_with_map_cmd(fx: &Fixture, cmd: &str) -> Site {
        let td = tempfile::tempdir().expect("tempdir");
        let toml = format!(
            "[dirs]\nqueue_dir = {:?}\ndata_dir = {:?}\nlog_dir = {:?}\nlist_data_dir = {:?}\nlock_dir = {:?}\n[mta]\npostfix_map_cmd = {:?}\n",
            fx.site.config().queue_dir(),
            fx.site.config().data_dir(),
            fx.site.config().log_dir(),
            fx.site.config().list_data_dir(),
            fx.site.config().lock_dir(),
            cmd,
        );
        std::fs::write(td.path().join("postroom.toml"), toml).expect("write");
        Site::new(postroom_config::load_config(td.path()).expect("load"))
    }

    fn seed_lists(fx: &Fixture, names: &[(&str, &str)]) {
        let store = fx.site.list_store();
        for (name, real) in names {
            let list = MailingList::new(name, real).expect("list");
            store.save(&list).expect("save");
        }
    }

    #[test]
    fn regenerate_writes_all_aliases_grouped_by_host() {
        let (_td, fx) = chain_fixture();
        seed_lists(
            &fx,
            &[
                ("test@example.com", "Test"),
                ("announce@example.com", "Announce"),
                ("dev@example.org", "Dev"),
            ],
        );
        let site = site_with_map_cmd(&fx, "");
        AliasWriter::new(&site).regenerate().expect("regenerate");

        let content =
            std::fs::read_to_string(site.alias_map_path()).expect("read alias map");

        // Hosts grouped and each list carries nine aliases.
        assert!(content.contains("@example.com domain"));
        assert!(content.contains("@example.org domain"));
        for alias in [
            "test@example.com",
            "test-bounces@example.com",
            "test-confirm@example.com",
            "test-join@example.com",
            "test-leave@example.com",
            "test-owner@example.com",
            "test-request@example.com",
            "test-subscribe@example.com",
            "test-unsubscribe@example.com",
            "announce@example.com",
            "dev-request@example.org",
        ] {
            assert!(content.contains(alias), "missing alias {alias}");
        }
        assert!(content.contains("lmtp:inet:127.0.0.1:8024"));
        // No leftover temp file.
        assert!(
            !PathBuf::from(format!("{}.new", site.alias_map_path().display())).exists()
        );
    }

    #[test]
    fn columns_align_within_a_host_group() {
        let (_td, fx) = chain_fixture();
        seed_lists(
            &fx,
            &[("a@example.com", "A"), ("longername@example.com", "Long")],
        );
        let site = site_with_map_cmd(&fx, "");
        AliasWriter::new(&site).regenerate().expect("regenerate");

        let content =
            std::fs::read_to_string(site.alias_map_path()).expect("read alias map");
        let columns: std::collections::BTreeSet<usize> = content
            .lines()
            .filter(|line| line.contains("lmtp:inet:"))
            .map(|line| line.find("lmtp:inet:").expect("target column"))
            .collect();
        assert_eq!(columns.len(), 1, "all lines share one target column");
    }

    #[test]
    fn create_and_delete_are_full_regenerations() {
        let (_td, fx) = chain_fixture();
        seed_lists(&fx, &[("test@example.com", "Test")]);
        let site = site_with_map_cmd(&fx, "");
        let writer = AliasWriter::new(&site);

        writer.create("test@example.com").expect("create");
        let first = std::fs::read_to_string(site.alias_map_path()).expect("read");

        writer.delete("test@example.com").expect("delete");
        let second = std::fs::read_to_string(site.alias_map_path()).expect("read");

        // Same list set in, same content out (modulo the timestamp line).
        let strip_ts = |s: &str| {
            s.lines()
                .filter(|l| !l.starts_with("# AUTOMATICALLY"))
                .collect::<Vec<_>>()
                .join("\n")
        };
        assert_eq!(strip_ts(&first), strip_ts(&second));
    }

    #[test]
    fn failing_post_map_command_is_an_error() {
        let (_td, fx) = chain_fixture();
        seed_lists(&fx, &[("test@example.com", "Test")]);
        let site = site_with_map_cmd(&fx, "false");
        let result = AliasWriter::new(&site).regenerate();
        assert!(result.is_err());
        // The rename already happened; the file itself is complete.
        assert!(site.alias_map_path().exists());
    }

    #[test]
    fn succeeding_post_map_command_passes() {
        let (_td, fx) = chain_fixture();
        seed_lists(&fx, &[("test@example.com", "Test")]);
        let site = site_with_map_cmd(&fx, "true");
        AliasWriter::new(&site).regenerate().expect("regenerate");
    }

    #[test]
    fn empty_list_set_still_writes_a_header() {
        let (_td, fx) = chain_fixture();
        let site = site_with_map_cmd(&fx, "");
        AliasWriter::new(&site).regenerate().expect("regenerate");
        let content =
            std::fs::read_to_string(site.alias_map_path()).expect("read alias map");
        assert!(content.starts_with("# AUTOMATICALLY GENERATED BY POSTROOM"));
    }
}
