//! Commit log format and parser.
//!
//! `git log` is asked for unit/record separated fields so messages with
//! arbitrary newlines parse unambiguously.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::command::GitCommand;
use super::invocation::Invocation;
use crate::error::{GitError, Result};
use crate::models::{AuthorInfo, CommitDetail, CommitInfo};

const FIELD_SEP: char = '\u{1f}';
const RECORD_SEP: char = '\u{1e}';

/// hash, parents, author name/email, committer name/email, committer time, body
pub const LOG_FORMAT: &str = "--format=%H%x1f%P%x1f%an%x1f%ae%x1f%cn%x1f%ce%x1f%ct%x1f%B%x1e";

/// Which commits a history walk covers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HistoryView {
    /// Every local and remote ref instead of just HEAD.
    pub all_branches: bool,
    pub first_parent: bool,
}

/// One parsed commit; everything an API response needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogCommit {
    pub oid: String,
    pub message: String,
    pub author_name: String,
    pub author_email: String,
    pub committer_name: String,
    pub committer_email: String,
    pub timestamp: i64,
    pub parents: Vec<String>,
}

impl LogCommit {
    pub fn to_commit_detail(&self) -> CommitDetail {
        CommitDetail {
            oid: self.oid.clone(),
            message: self.message.clone(),
            author: AuthorInfo {
                name: self.author_name.clone(),
                email: self.author_email.clone(),
            },
            committer: AuthorInfo {
                name: self.committer_name.clone(),
                email: self.committer_email.clone(),
            },
            timestamp: self.timestamp,
            relative_time: format_relative_time(self.timestamp),
            parent_count: self.parents.len(),
            parents: self.parents.clone(),
        }
    }

    pub fn to_commit_info(&self) -> CommitInfo {
        CommitInfo {
            oid: self.oid.clone(),
            message: self.message.clone(),
            author: self.author_name.clone(),
            timestamp: self.timestamp,
            relative_time: format_relative_time(self.timestamp),
        }
    }

    /// Rough heap footprint, for memory-bounded caches.
    pub fn approx_size(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.oid.len()
            + self.message.len()
            + self.author_name.len()
            + self.author_email.len()
            + self.committer_name.len()
            + self.committer_email.len()
            + self.parents.iter().map(|p| p.len() + 24).sum::<usize>()
    }
}

/// Newest first. `max_count` of `None` walks the whole history.
pub fn log_invocation(working_dir: &Path, view: HistoryView, max_count: Option<usize>) -> Invocation {
    let mut inv = Invocation::new(working_dir, GitCommand::Log)
        .arg(LOG_FORMAT)
        .arg("--date-order");
    if view.first_parent {
        inv = inv.arg("--first-parent");
    }
    if let Some(n) = max_count {
        inv = inv.arg(format!("--max-count={n}"));
    }
    if view.all_branches {
        inv.arg("--all")
    } else {
        inv.arg("HEAD")
    }
}

/// `rev-list --count` over the same commits `log_invocation` walks.
pub fn count_invocation(working_dir: &Path, view: HistoryView) -> Invocation {
    let mut inv = Invocation::new(working_dir, GitCommand::RevList).arg("--count");
    if view.first_parent {
        inv = inv.arg("--first-parent");
    }
    if view.all_branches {
        inv.arg("--all")
    } else {
        inv.arg("HEAD")
    }
}

pub fn parse_log(stdout: &str) -> Result<Vec<LogCommit>> {
    stdout
        .split(RECORD_SEP)
        .map(|record| record.trim_start_matches(['\n', '\r']))
        .filter(|record| !record.trim().is_empty())
        .map(parse_record)
        .collect()
}

fn parse_record(record: &str) -> Result<LogCommit> {
    let fields: Vec<&str> = record.splitn(8, FIELD_SEP).collect();
    let [oid, parents, author_name, author_email, committer_name, committer_email, time, body] =
        fields.as_slice()
    else {
        return Err(GitError::Parse(format!(
            "log record has {} fields, expected 8",
            fields.len()
        )));
    };

    let timestamp = time
        .trim()
        .parse::<i64>()
        .map_err(|e| GitError::Parse(format!("bad commit time {time:?}: {e}")))?;

    Ok(LogCommit {
        oid: oid.trim().to_string(),
        message: body.trim().to_string(),
        author_name: non_empty_or(author_name, "Unknown"),
        author_email: author_email.to_string(),
        committer_name: non_empty_or(committer_name, "Unknown"),
        committer_email: committer_email.to_string(),
        timestamp,
        parents: parents.split_whitespace().map(str::to_string).collect(),
    })
}

fn non_empty_or(value: &str, fallback: &str) -> String {
    if value.is_empty() {
        fallback.to_string()
    } else {
        value.to_string()
    }
}

pub fn format_relative_time(timestamp: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let diff = now - timestamp;

    let plural = |n: i64, unit: &str| format!("{n} {unit}{} ago", if n == 1 { "" } else { "s" });

    if diff < 60 {
        "just now".to_string()
    } else if diff < 3_600 {
        plural(diff / 60, "minute")
    } else if diff < 86_400 {
        plural(diff / 3_600, "hour")
    } else if diff < 2_592_000 {
        plural(diff / 86_400, "day")
    } else if diff < 31_536_000 {
        plural(diff / 2_592_000, "month")
    } else {
        plural(diff / 31_536_000, "year")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(oid: &str, parents: &str, body: &str) -> String {
        format!(
            "{oid}\u{1f}{parents}\u{1f}Ada\u{1f}ada@example.com\u{1f}Bob\u{1f}bob@example.com\u{1f}1700000000\u{1f}{body}\u{1e}\n"
        )
    }

    #[test]
    fn test_parse_multiline_and_merge() {
        let out = format!(
            "{}{}",
            record("bbb", "aaa ccc", "Merge branch 'x'\n\nDetails here\n"),
            record("aaa", "", "Initial commit\n")
        );
        let commits = parse_log(&out).unwrap();
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].oid, "bbb");
        assert_eq!(commits[0].parents, vec!["aaa", "ccc"]);
        assert_eq!(commits[0].message, "Merge branch 'x'\n\nDetails here");
        assert!(commits[1].parents.is_empty());
        assert_eq!(commits[1].timestamp, 1_700_000_000);

        let detail = commits[0].to_commit_detail();
        assert_eq!(detail.parent_count, 2);
        assert_eq!(detail.author.email, "ada@example.com");
        assert_eq!(detail.committer.name, "Bob");
    }

    #[test]
    fn test_parse_empty_output() {
        assert!(parse_log("").unwrap().is_empty());
        assert!(parse_log("\n").unwrap().is_empty());
    }

    #[test]
    fn test_parse_rejects_truncated_record() {
        let err = parse_log("abc\u{1f}def\u{1e}").unwrap_err();
        assert!(matches!(err, GitError::Parse(_)));
    }

    #[test]
    fn test_log_invocation_args() {
        let view = HistoryView { all_branches: true, first_parent: true };
        let inv = log_invocation(Path::new("/tmp"), view, Some(10));
        let args = inv.full_args();
        assert_eq!(args[0], "log");
        assert!(args.contains(&"--first-parent".to_string()));
        assert!(args.contains(&"--max-count=10".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("--all"));

        let head_only = log_invocation(Path::new("/tmp"), HistoryView::default(), None);
        assert_eq!(head_only.full_args().last().map(String::as_str), Some("HEAD"));
    }

    #[test]
    fn test_relative_time() {
        let now = chrono::Utc::now().timestamp();
        assert_eq!(format_relative_time(now), "just now");
        assert_eq!(format_relative_time(now - 60), "1 minute ago");
        assert_eq!(format_relative_time(now - 7_200), "2 hours ago");
        assert_eq!(format_relative_time(now - 3 * 86_400), "3 days ago");
        assert_eq!(format_relative_time(now - 2 * 31_536_000), "2 years ago");
    }
}
