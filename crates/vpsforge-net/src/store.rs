//! Durable rule specifications.
//!
//! Layout under the rules directory:
//!
//! ```text
//! forwards/<external port>.rules   one file per forward, append form
//! post-apply.rules                 ordered list reapplied by reconcile
//! pre-teardown.rules               ordered list run before host teardown
//! .lock                            held by writers, see NatManager
//! ```
//!
//! Every line is a rendered `iptables` invocation, so the files can also
//! be sourced by a shell during interface bring-up.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use vpsforge_common::error::{ForgeError, Result};
use vpsforge_common::types::NatRule;

use crate::rule::{FirewallRule, RuleOp};

const FORWARDS_DIR: &str = "forwards";
const POST_APPLY: &str = "post-apply.rules";
const PRE_TEARDOWN: &str = "pre-teardown.rules";
const LOCK_FILE: &str = ".lock";

/// Rule directory on disk.
#[derive(Debug, Clone)]
pub struct RuleStore {
    dir: PathBuf,
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ForgeError + '_ {
    move |source| ForgeError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn read_lines(path: &Path) -> Result<Vec<String>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(String::from)
            .collect()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(io_error(path)(e)),
    }
}

/// Replaces `path` through a temporary file and a rename.
fn write_lines(path: &Path, lines: &[String]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_error(parent))?;
    }
    let mut content = lines.join("\n");
    if !content.is_empty() {
        content.push('\n');
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, content).map_err(io_error(&tmp))?;
    std::fs::rename(&tmp, path).map_err(io_error(path))
}

fn parse_rules(lines: &[String]) -> Result<Vec<FirewallRule>> {
    lines
        .iter()
        .map(|line| FirewallRule::parse(line).map(|(_, rule)| rule))
        .collect()
}

impl RuleStore {
    /// Opens the store rooted at `dir`. Nothing is created until the
    /// first write.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Root directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File locked while the directory is being rewritten.
    #[must_use]
    pub fn lock_path(&self) -> PathBuf {
        self.dir.join(LOCK_FILE)
    }

    fn forward_path(&self, external_port: u16) -> PathBuf {
        self.dir
            .join(FORWARDS_DIR)
            .join(format!("{external_port}.rules"))
    }

    fn post_apply_path(&self) -> PathBuf {
        self.dir.join(POST_APPLY)
    }

    fn pre_teardown_path(&self) -> PathBuf {
        self.dir.join(PRE_TEARDOWN)
    }

    /// Persists `forward`, replacing any forward on the same port.
    ///
    /// Lines already present in the lists are not appended twice.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be read or written.
    pub fn save_forward(&self, forward: &NatRule) -> Result<()> {
        if let Some(previous) = self.load_forward(forward.external_port)? {
            if previous != *forward {
                let _ = self.remove_forward(previous.external_port)?;
            }
        }
        let rules = FirewallRule::for_forward(forward);
        let apply: Vec<String> = rules.iter().map(|r| r.render(RuleOp::Append)).collect();
        let teardown: Vec<String> = rules.iter().map(|r| r.render(RuleOp::Delete)).collect();

        write_lines(&self.forward_path(forward.external_port), &apply)?;
        append_missing(&self.post_apply_path(), &apply)?;
        append_missing(&self.pre_teardown_path(), &teardown)?;
        tracing::debug!(forward = %forward, dir = %self.dir.display(), "forward persisted");
        Ok(())
    }

    /// Reads the forward on `external_port`, if persisted.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is malformed.
    pub fn load_forward(&self, external_port: u16) -> Result<Option<NatRule>> {
        let lines = read_lines(&self.forward_path(external_port))?;
        if lines.is_empty() {
            return Ok(None);
        }
        Ok(FirewallRule::forward_of(&parse_rules(&lines)?))
    }

    /// Removes the forward on `external_port` from the directory and from
    /// both lists. Returns what was removed.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be read or written.
    pub fn remove_forward(&self, external_port: u16) -> Result<Option<NatRule>> {
        let Some(forward) = self.load_forward(external_port)? else {
            return Ok(None);
        };
        let rules = FirewallRule::for_forward(&forward);
        remove_lines(&self.post_apply_path(), &rules)?;
        remove_lines(&self.pre_teardown_path(), &rules)?;
        let path = self.forward_path(external_port);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(io_error(&path)(e)),
        }
        tracing::debug!(forward = %forward, "forward removed from store");
        Ok(Some(forward))
    }

    /// Every persisted forward, ordered by external port.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or a file cannot be read.
    pub fn forwards(&self) -> Result<Vec<NatRule>> {
        let dir = self.dir.join(FORWARDS_DIR);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&dir)(e)),
        };
        let mut forwards = Vec::new();
        for entry in entries {
            let path = entry.map_err(io_error(&dir))?.path();
            let port = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<u16>().ok());
            let is_rules = path.extension().is_some_and(|ext| ext == "rules");
            if let (Some(port), true) = (port, is_rules) {
                if let Some(forward) = self.load_forward(port)? {
                    forwards.push(forward);
                }
            }
        }
        forwards.sort_by_key(|f| f.external_port);
        Ok(forwards)
    }

    /// The post-apply list, in order.
    ///
    /// # Errors
    ///
    /// Returns an error if the list cannot be read or is malformed.
    pub fn post_apply(&self) -> Result<Vec<FirewallRule>> {
        parse_rules(&read_lines(&self.post_apply_path())?)
    }

    /// The pre-teardown list, in order.
    ///
    /// # Errors
    ///
    /// Returns an error if the list cannot be read or is malformed.
    pub fn pre_teardown(&self) -> Result<Vec<FirewallRule>> {
        parse_rules(&read_lines(&self.pre_teardown_path())?)
    }
}

fn append_missing(path: &Path, lines: &[String]) -> Result<()> {
    let mut current = read_lines(path)?;
    let before = current.len();
    for line in lines {
        if !current.contains(line) {
            current.push(line.clone());
        }
    }
    if current.len() == before {
        return Ok(());
    }
    write_lines(path, &current)
}

fn remove_lines(path: &Path, rules: &[FirewallRule]) -> Result<()> {
    let current = read_lines(path)?;
    let kept: Vec<String> = current
        .iter()
        .filter(|line| !FirewallRule::parse(line).is_ok_and(|(_, rule)| rules.contains(&rule)))
        .cloned()
        .collect();
    if kept.len() == current.len() {
        return Ok(());
    }
    write_lines(path, &kept)
}
