//! Redundant-copy detection across a set of containers and archives.
//!
//! Files are identified (title id, version, original size), grouped by title
//! (and version unless `old_versions`), and ranked inside each group:
//!
//! 1. blacklisted members never rank; they are superseded by whoever wins,
//! 2. earliest matching `priority` pattern,
//! 3. whitelisted before not whitelisted,
//! 4. higher version,
//! 5. larger original size.
//!
//! Members equal on every criterion make the group ambiguous; the tied
//! members are reported and left alone unless [`TieBreak::PathOrder`] is
//! configured.  Blacklisted members of such a group are still superseded.
//! A group whose members are all blacklisted is kept whole.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::Serialize;

use crate::classify::{identify, FileIdentity};
use crate::config::{TieBreak, UndupeAction, UndupePolicy};
use crate::container::FileKind;
use crate::error::{NszError, Result};
use crate::keys;
use crate::perf::run_jobs;

pub const SUPERSEDED_SUFFIX: &str = "superseded";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupersedeReason {
    Blacklisted,
    Outranked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Superseded {
    pub path:       PathBuf,
    pub retained:   PathBuf,
    pub reason:     SupersedeReason,
    pub action:     UndupeAction,
    /// Whether the action was carried out (false for reports, dry runs and
    /// failed links).
    pub applied:    bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub renamed_to: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note:       Option<String>,
}

#[derive(Debug, Default)]
pub struct UndupeReport {
    pub kept:       Vec<PathBuf>,
    pub superseded: Vec<Superseded>,
    /// `AmbiguousContent` per skipped group.
    pub ambiguous:  Vec<NszError>,
    /// Identification failures and failed actions.
    pub failures:   Vec<NszError>,
    pub dry_run:    bool,
}

// ── Ranking ──────────────────────────────────────────────────────────────────

struct Patterns {
    priority:  Vec<Regex>,
    whitelist: Vec<Regex>,
    blacklist: Vec<Regex>,
}

fn compile(name: &'static str, patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| Regex::new(p).map_err(|e| NszError::invalid(name, format!("{p:?}: {e}"))))
        .collect()
}

impl Patterns {
    fn new(policy: &UndupePolicy) -> Result<Self> {
        Ok(Self {
            priority:  compile("priority", &policy.priority)?,
            whitelist: compile("whitelist", &policy.whitelist)?,
            blacklist: compile("blacklist", &policy.blacklist)?,
        })
    }

    fn blacklisted(&self, path: &Path) -> bool {
        let s = path.to_string_lossy();
        self.blacklist.iter().any(|re| re.is_match(&s))
    }

    /// Smaller sorts first.
    fn rank(&self, id: &FileIdentity) -> (usize, bool, Reverse<u32>, Reverse<u64>) {
        let s = id.path.to_string_lossy();
        let priority = self.priority.iter().position(|re| re.is_match(&s)).unwrap_or(usize::MAX);
        let unlisted = !self.whitelist.iter().any(|re| re.is_match(&s));
        (priority, unlisted, Reverse(id.version), Reverse(id.original_size))
    }
}

/// Outcome of ranking one group.
#[derive(Debug, PartialEq, Eq)]
enum Decision {
    KeepAll,
    /// The top rank is shared.  Blacklisted members are still superseded.
    Ambiguous { tied: Vec<usize>, blacklisted: Vec<usize> },
    Resolve { winner: usize, losers: Vec<(usize, SupersedeReason)> },
}

fn decide(members: &[FileIdentity], patterns: &Patterns, tie_break: TieBreak) -> Decision {
    if members.len() < 2 {
        return Decision::KeepAll;
    }
    let (blacklisted, eligible): (Vec<usize>, Vec<usize>) =
        (0..members.len()).partition(|&i| patterns.blacklisted(&members[i].path));
    if eligible.is_empty() {
        return Decision::KeepAll;
    }

    let mut ranked = eligible;
    ranked.sort_by(|&a, &b| {
        patterns
            .rank(&members[a])
            .cmp(&patterns.rank(&members[b]))
            .then_with(|| members[a].path.cmp(&members[b].path))
    });
    let best = patterns.rank(&members[ranked[0]]);
    let tied: Vec<usize> = ranked.iter().copied().filter(|&i| patterns.rank(&members[i]) == best).collect();
    if tied.len() > 1 && tie_break == TieBreak::Refuse {
        return Decision::Ambiguous { tied, blacklisted };
    }

    let winner = ranked[0];
    let losers = ranked[1..]
        .iter()
        .map(|&i| (i, SupersedeReason::Outranked))
        .chain(blacklisted.into_iter().map(|i| (i, SupersedeReason::Blacklisted)))
        .collect();
    Decision::Resolve { winner, losers }
}

// ── Actions ──────────────────────────────────────────────────────────────────

/// `EXDEV` on Unix, `ERROR_NOT_SAME_DEVICE` on Windows.
fn is_cross_device(e: &io::Error) -> bool {
    #[cfg(windows)]
    {
        e.raw_os_error() == Some(17)
    }
    #[cfg(not(windows))]
    {
        e.raw_os_error() == Some(18)
    }
}

/// Replace `path` with a hard link to `target`.  The link is made beside
/// `path` first and renamed over it, so a failure leaves `path` intact.
fn replace_with_link(path: &Path, target: &Path) -> Result<()> {
    let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let staging = path.with_file_name(format!(".{name}.link"));
    if let Err(source) = fs::hard_link(target, &staging) {
        if is_cross_device(&source) {
            tracing::warn!(path = %path.display(), target = %target.display(), "members are on different volumes");
        }
        return Err(NszError::LinkFailed { path: path.to_owned(), target: target.to_owned(), source });
    }
    fs::rename(&staging, path).map_err(|e| {
        let _ = fs::remove_file(&staging);
        NszError::io(path, e)
    })
}

fn superseded_name(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(SUPERSEDED_SUFFIX);
    path.with_file_name(name)
}

fn apply(entry: &mut Superseded, dry_run: bool) -> Result<()> {
    if dry_run {
        return Ok(());
    }
    match entry.action {
        UndupeAction::Report => {}
        UndupeAction::Remove => {
            fs::remove_file(&entry.path).map_err(|e| NszError::io(&entry.path, e))?;
            entry.applied = true;
        }
        UndupeAction::Hardlink => {
            let same_kind = FileKind::of(&entry.path) == FileKind::of(&entry.retained);
            if !same_kind {
                entry.note = Some("retained copy has a different format; not linked".into());
                return Ok(());
            }
            if let Err(e) = replace_with_link(&entry.path, &entry.retained) {
                entry.note = Some("link failed; reported only".into());
                return Err(e);
            }
            entry.applied = true;
        }
        UndupeAction::Rename => {
            let to = superseded_name(&entry.path);
            if to.exists() {
                entry.note = Some(format!("{} already exists", to.display()));
                return Ok(());
            }
            fs::rename(&entry.path, &to).map_err(|e| NszError::io(&entry.path, e))?;
            entry.renamed_to = Some(to);
            entry.applied = true;
        }
    }
    Ok(())
}

fn supersede(report: &mut UndupeReport, policy: &UndupePolicy, path: &Path, retained: &Path, reason: SupersedeReason) {
    let mut entry = Superseded {
        path: path.to_owned(),
        retained: retained.to_owned(),
        reason,
        action: policy.action,
        applied: false,
        renamed_to: None,
        note: None,
    };
    if let Err(e) = apply(&mut entry, policy.dry_run) {
        tracing::warn!(error = %e, "undupe action failed");
        report.failures.push(e);
    }
    tracing::info!(path = %entry.path.display(), kept = %retained.display(), action = ?entry.action, applied = entry.applied, "superseded");
    report.superseded.push(entry);
}

// ── Entry point ──────────────────────────────────────────────────────────────

pub fn undupe(paths: &[PathBuf], policy: &UndupePolicy) -> Result<UndupeReport> {
    if policy.multi == 0 {
        return Err(NszError::invalid("multi", "must be at least 1"));
    }
    let patterns = Patterns::new(policy)?;
    let key = keys::resolve(policy.keys_file.as_deref())?;

    let mut report = UndupeReport { dry_run: policy.dry_run, ..Default::default() };
    let identities = run_jobs(paths.to_vec(), policy.multi, |p| identify(&p, policy.cnmt, key.as_ref()));

    let mut groups: BTreeMap<(u64, Option<u32>), Vec<FileIdentity>> = BTreeMap::new();
    for id in identities {
        match id {
            Ok(id) => {
                let version = (!policy.old_versions).then_some(id.version);
                groups.entry((id.title_id, version)).or_default().push(id);
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot identify file, leaving it alone");
                report.failures.push(e);
            }
        }
    }

    for ((title_id, version), mut members) in groups {
        members.sort_by(|a, b| a.path.cmp(&b.path));
        members.dedup_by(|a, b| a.path == b.path);
        match decide(&members, &patterns, policy.tie_break) {
            Decision::KeepAll => report.kept.extend(members.into_iter().map(|m| m.path)),
            Decision::Ambiguous { tied, blacklisted } => {
                tracing::warn!(title = format_args!("{title_id:016x}"), ?version, members = tied.len(), "ambiguous group skipped");
                // Every tied member stays; blacklisted copies are superseded by the first of them.
                let retained = members[tied[0]].path.clone();
                for i in blacklisted {
                    supersede(&mut report, policy, &members[i].path, &retained, SupersedeReason::Blacklisted);
                }
                let tied: Vec<PathBuf> = tied.into_iter().map(|i| members[i].path.clone()).collect();
                report.kept.extend(tied.iter().cloned());
                report.ambiguous.push(NszError::AmbiguousContent { title_id, members: tied });
            }
            Decision::Resolve { winner, losers } => {
                let retained = members[winner].path.clone();
                for (i, reason) in losers {
                    supersede(&mut report, policy, &members[i].path, &retained, reason);
                }
                report.kept.push(retained);
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{IdentitySource, UnitType};

    fn id(path: &str, version: u32, size: u64) -> FileIdentity {
        FileIdentity {
            path: PathBuf::from(path),
            title_id: 0x0100_0000_0000_1000,
            version,
            unit_type: UnitType::Program,
            original_size: size,
            source: IdentitySource::FileName,
        }
    }

    fn patterns(policy: &UndupePolicy) -> Patterns {
        Patterns::new(policy).unwrap()
    }

    #[test]
    fn higher_version_then_larger_size_wins() {
        let p = patterns(&UndupePolicy::default());
        let members = vec![id("a", 1, 500), id("b", 2, 100), id("c", 2, 200)];
        match decide(&members, &p, TieBreak::Refuse) {
            Decision::Resolve { winner, losers } => {
                assert_eq!(winner, 2);
                assert_eq!(losers.len(), 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn blacklist_beats_size_and_priority() {
        let policy = UndupePolicy {
            priority: vec!["big".into()],
            blacklist: vec!["big".into()],
            ..Default::default()
        };
        let members = vec![id("big.nsp", 0, 900), id("small.nsp", 0, 10)];
        assert_eq!(
            decide(&members, &patterns(&policy), TieBreak::Refuse),
            Decision::Resolve { winner: 1, losers: vec![(0, SupersedeReason::Blacklisted)] }
        );
    }

    #[test]
    fn priority_outranks_version() {
        let policy = UndupePolicy { priority: vec!["^keep/".into()], ..Default::default() };
        let members = vec![id("keep/a.nsz", 1, 1), id("other/b.nsz", 9, 1)];
        assert!(matches!(decide(&members, &patterns(&policy), TieBreak::Refuse), Decision::Resolve { winner: 0, .. }));
    }

    #[test]
    fn identical_ranks_are_ambiguous_unless_path_order() {
        let p = patterns(&UndupePolicy::default());
        let members = vec![id("x", 1, 10), id("y", 1, 10)];
        assert_eq!(decide(&members, &p, TieBreak::Refuse), Decision::Ambiguous { tied: vec![0, 1], blacklisted: vec![] });
        assert!(matches!(decide(&members, &p, TieBreak::PathOrder), Decision::Resolve { winner: 0, .. }));
    }

    #[test]
    fn blacklisted_members_are_flagged_even_when_the_rest_tie() {
        let policy = UndupePolicy { blacklist: vec!["bad".into()], ..Default::default() };
        let members = vec![id("a.nsp", 0, 10), id("b.nsp", 0, 10), id("bad.nsp", 0, 99)];
        assert_eq!(
            decide(&members, &patterns(&policy), TieBreak::Refuse),
            Decision::Ambiguous { tied: vec![0, 1], blacklisted: vec![2] }
        );
    }

    #[test]
    fn all_blacklisted_keeps_everything() {
        let policy = UndupePolicy { blacklist: vec![".".into()], ..Default::default() };
        let members = vec![id("x", 1, 10), id("y", 2, 10)];
        assert_eq!(decide(&members, &patterns(&policy), TieBreak::Refuse), Decision::KeepAll);
    }

    #[test]
    fn bad_pattern_is_invalid_parameter() {
        let policy = UndupePolicy { whitelist: vec!["(".into()], ..Default::default() };
        assert!(matches!(Patterns::new(&policy), Err(NszError::InvalidParameter { name: "whitelist", .. })));
    }

    #[test]
    fn superseded_name_appends_suffix() {
        assert_eq!(superseded_name(Path::new("/d/game.nsz")), PathBuf::from("/d/game.nsz.superseded"));
    }
}
