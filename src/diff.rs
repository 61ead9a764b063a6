//! Tree and line-level diffs
//!
//! [`diff_trees`] classifies every path present in either manifest. It only
//! compares entries, so it is cheap and never touches blob content.
//! Line detail for a modified text file is computed on request through
//! [`Delta::line_detail`], which reads both blobs and runs a longest common
//! subsequence over their lines. A differing region too large for the LCS
//! table is reported as one replaced block instead.
//!
//! ## Binary detection
//!
//! The first 8 KiB of each side are sampled. A null byte, or bytes that are
//! not valid UTF-8 (other than a multi-byte sequence cut off by the sample
//! boundary), marks the content as binary and no line detail is produced.
//!
//! ## Examples
//!
//! ```rust
//! use rewind::diff::compute_line_diff;
//! use rewind::types::{DiffOptions, LineChange};
//!
//! let hunks = compute_line_diff(b"a\nb\nc\n", b"a\nB\nc\n", &DiffOptions::default());
//! assert_eq!(hunks.len(), 1);
//! assert!(hunks[0].changes.contains(&LineChange::Deleted(2, "b".to_string())));
//! assert!(hunks[0].changes.contains(&LineChange::Added(2, "B".to_string())));
//! ```

use crate::error::Result;
use crate::store::{BlobHash, ContentStore};
use crate::tree::{TreeEntry, TreeManifest};
use crate::types::{ChangeStats, DiffHunk, DiffOptions, FileDiff, LineChange};
use std::cmp::Ordering;
use std::fmt::Write as _;
use std::iter::Peekable;
use tracing::{debug, trace};

const BINARY_SAMPLE: usize = 8192;

/// Largest LCS table built for one line diff (16 MiB of `u32`)
///
/// Past this the differing middle is reported as replaced wholesale.
const MAX_LCS_CELLS: usize = 1 << 22;

/// How a path differs between two trees
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// Only in the second tree
    Added(TreeEntry),
    /// Only in the first tree
    Removed(TreeEntry),
    /// In both with a different blob or mode
    Modified {
        /// Entry in the first tree
        old: TreeEntry,
        /// Entry in the second tree
        new: TreeEntry,
    },
}

impl Change {
    /// Short label used in listings
    pub fn label(&self) -> &'static str {
        match self {
            Change::Added(_) => "added",
            Change::Removed(_) => "removed",
            Change::Modified { .. } => "modified",
        }
    }
}

/// One changed path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delta {
    /// Manifest path
    pub path: String,
    /// Classification
    pub change: Change,
}

/// Result of requesting line detail for a delta
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineDetail {
    /// Both sides are text
    Text(FileDiff),
    /// At least one side is binary, or too large to diff
    Binary,
    /// Added or removed paths, or a mode-only change
    NotApplicable,
}

impl Delta {
    /// Whether the blob content differs (false for mode-only changes)
    pub fn content_changed(&self) -> bool {
        match &self.change {
            Change::Modified { old, new } => old.hash != new.hash,
            _ => true,
        }
    }

    /// Line-level diff of a modified file
    ///
    /// Reads both blobs from `store`. Symlinks and special entries are
    /// compared as their stored metadata text.
    pub fn line_detail(&self, store: &ContentStore, options: &DiffOptions) -> Result<LineDetail> {
        let (old, new) = match &self.change {
            Change::Modified { old, new } if old.hash != new.hash => (old, new),
            _ => return Ok(LineDetail::NotApplicable),
        };
        if options.max_file_size > 0
            && (old.size > options.max_file_size || new.size > options.max_file_size)
        {
            return Ok(LineDetail::Binary);
        }

        let old_content = store.get(&old.hash)?;
        let new_content = store.get(&new.hash)?;
        if is_binary(&old_content) || is_binary(&new_content) {
            trace!("{} is binary, skipping line detail", self.path);
            return Ok(LineDetail::Binary);
        }

        Ok(LineDetail::Text(create_file_diff(
            &self.path,
            &old.hash,
            &new.hash,
            &old_content,
            &new_content,
            options,
        )))
    }
}

/// Changed paths between two trees, sorted by path
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeltaSet {
    deltas: Vec<Delta>,
}

impl DeltaSet {
    /// Changed paths in path order
    pub fn iter(&self) -> std::slice::Iter<'_, Delta> {
        self.deltas.iter()
    }

    /// Number of changed paths
    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    /// Whether the trees are identical
    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    /// Delta for `path`, if it changed
    pub fn get(&self, path: &str) -> Option<&Delta> {
        self.deltas
            .binary_search_by(|d| d.path.as_str().cmp(path))
            .ok()
            .map(|i| &self.deltas[i])
    }

    /// File and byte counts
    pub fn stats(&self) -> ChangeStats {
        let mut stats = ChangeStats::default();
        for delta in &self.deltas {
            match &delta.change {
                Change::Added(entry) => {
                    stats.files_added += 1;
                    stats.bytes_added += entry.size;
                }
                Change::Removed(entry) => {
                    stats.files_removed += 1;
                    stats.bytes_removed += entry.size;
                }
                Change::Modified { new, .. } => {
                    stats.files_modified += 1;
                    stats.bytes_modified += new.size;
                }
            }
        }
        stats
    }
}

impl IntoIterator for DeltaSet {
    type Item = Delta;
    type IntoIter = std::vec::IntoIter<Delta>;

    fn into_iter(self) -> Self::IntoIter {
        self.deltas.into_iter()
    }
}

impl<'a> IntoIterator for &'a DeltaSet {
    type Item = &'a Delta;
    type IntoIter = std::slice::Iter<'a, Delta>;

    fn into_iter(self) -> Self::IntoIter {
        self.deltas.iter()
    }
}

/// Classify every path in `from` or `to`; unchanged paths are omitted
///
/// Both manifests are sorted maps, so this is a single merge pass and the
/// output order is the path order.
pub fn diff_trees(from: &TreeManifest, to: &TreeManifest) -> DeltaSet {
    let mut deltas = Vec::new();
    let mut left: Peekable<_> = from.iter().peekable();
    let mut right: Peekable<_> = to.iter().peekable();

    loop {
        let order = match (left.peek(), right.peek()) {
            (None, None) => break,
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some((a, _)), Some((b, _))) => a.cmp(b),
        };
        match order {
            Ordering::Less => {
                if let Some((path, entry)) = left.next() {
                    deltas.push(Delta {
                        path: path.clone(),
                        change: Change::Removed(entry.clone()),
                    });
                }
            }
            Ordering::Greater => {
                if let Some((path, entry)) = right.next() {
                    deltas.push(Delta {
                        path: path.clone(),
                        change: Change::Added(entry.clone()),
                    });
                }
            }
            Ordering::Equal => {
                if let (Some((path, old)), Some((_, new))) = (left.next(), right.next()) {
                    if old != new {
                        deltas.push(Delta {
                            path: path.clone(),
                            change: Change::Modified {
                                old: old.clone(),
                                new: new.clone(),
                            },
                        });
                    }
                }
            }
        }
    }

    DeltaSet { deltas }
}

/// Whether content looks binary
pub fn is_binary(content: &[u8]) -> bool {
    let sample = &content[..content.len().min(BINARY_SAMPLE)];
    if sample.contains(&0) {
        return true;
    }
    match std::str::from_utf8(sample) {
        Ok(_) => false,
        // `error_len() == None` means the sample ends inside a valid sequence
        Err(e) => !(e.error_len().is_none() && sample.len() < content.len()),
    }
}

/// Build a [`FileDiff`] for two text contents
pub fn create_file_diff(
    path: &str,
    from_hash: &BlobHash,
    to_hash: &BlobHash,
    old_content: &[u8],
    new_content: &[u8],
    options: &DiffOptions,
) -> FileDiff {
    let hunks = compute_line_diff(old_content, new_content, options);
    let mut lines_added = 0;
    let mut lines_deleted = 0;
    for change in hunks.iter().flat_map(|h| h.changes.iter()) {
        match change {
            LineChange::Added(..) => lines_added += 1,
            LineChange::Deleted(..) => lines_deleted += 1,
            LineChange::Context(..) => {}
        }
    }

    FileDiff {
        path: path.to_string(),
        from_hash: from_hash.to_string(),
        to_hash: to_hash.to_string(),
        hunks,
        lines_added,
        lines_deleted,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Keep(usize, usize),
    Delete(usize),
    Insert(usize),
}

/// Line-level hunks between two texts
pub fn compute_line_diff(old_content: &[u8], new_content: &[u8], options: &DiffOptions) -> Vec<DiffHunk> {
    let old_text = String::from_utf8_lossy(old_content);
    let new_text = String::from_utf8_lossy(new_content);
    let old_lines: Vec<&str> = old_text.lines().collect();
    let new_lines: Vec<&str> = new_text.lines().collect();

    let ops = compute_ops(&old_lines, &new_lines, options.ignore_whitespace);
    group_hunks(&ops, &old_lines, &new_lines, options.context_lines)
}

fn lines_equal(a: &str, b: &str, ignore_whitespace: bool) -> bool {
    if ignore_whitespace {
        a.split_whitespace().eq(b.split_whitespace())
    } else {
        a == b
    }
}

fn compute_ops(old: &[&str], new: &[&str], ignore_whitespace: bool) -> Vec<Op> {
    // Common prefix and suffix never take part in the quadratic table
    let prefix = old
        .iter()
        .zip(new.iter())
        .take_while(|(a, b)| lines_equal(a, b, ignore_whitespace))
        .count();
    let suffix = old[prefix..]
        .iter()
        .rev()
        .zip(new[prefix..].iter().rev())
        .take_while(|(a, b)| lines_equal(a, b, ignore_whitespace))
        .count();

    let old_mid = &old[prefix..old.len() - suffix];
    let new_mid = &new[prefix..new.len() - suffix];
    let (m, n) = (old_mid.len(), new_mid.len());

    let mut ops: Vec<Op> = (0..prefix).map(|i| Op::Keep(i, i)).collect();
    let old_tail = old.len() - suffix;
    let new_tail = new.len() - suffix;

    if (m + 1).saturating_mul(n + 1) > MAX_LCS_CELLS {
        debug!(
            "Line diff of {}x{} differing lines exceeds table budget, replacing block",
            m, n
        );
        ops.extend((prefix..old_tail).map(Op::Delete));
        ops.extend((prefix..new_tail).map(Op::Insert));
        ops.extend((0..suffix).map(|k| Op::Keep(old_tail + k, new_tail + k)));
        return ops;
    }

    // dp[i][j] = LCS length of old_mid[i..] and new_mid[j..]
    let mut dp = vec![vec![0u32; n + 1]; m + 1];
    for i in (0..m).rev() {
        for j in (0..n).rev() {
            dp[i][j] = if lines_equal(old_mid[i], new_mid[j], ignore_whitespace) {
                dp[i + 1][j + 1] + 1
            } else {
                dp[i + 1][j].max(dp[i][j + 1])
            };
        }
    }

    let (mut i, mut j) = (0, 0);
    while i < m && j < n {
        if lines_equal(old_mid[i], new_mid[j], ignore_whitespace) {
            ops.push(Op::Keep(prefix + i, prefix + j));
            i += 1;
            j += 1;
        } else if dp[i + 1][j] >= dp[i][j + 1] {
            ops.push(Op::Delete(prefix + i));
            i += 1;
        } else {
            ops.push(Op::Insert(prefix + j));
            j += 1;
        }
    }
    ops.extend((i..m).map(|i| Op::Delete(prefix + i)));
    ops.extend((j..n).map(|j| Op::Insert(prefix + j)));

    ops.extend((0..suffix).map(|k| Op::Keep(old_tail + k, new_tail + k)));
    ops
}

fn group_hunks(ops: &[Op], old: &[&str], new: &[&str], context: usize) -> Vec<DiffHunk> {
    let changed: Vec<usize> = ops
        .iter()
        .enumerate()
        .filter(|(_, op)| !matches!(op, Op::Keep(..)))
        .map(|(i, _)| i)
        .collect();

    // Merge change positions whose context windows touch
    let mut ranges: Vec<(usize, usize)> = Vec::new();
    for &pos in &changed {
        let start = pos.saturating_sub(context);
        let end = (pos + context + 1).min(ops.len());
        match ranges.last_mut() {
            Some(last) if start <= last.1 => last.1 = end,
            _ => ranges.push((start, end)),
        }
    }

    ranges
        .into_iter()
        .filter_map(|(start, end)| {
            let mut builder = HunkBuilder::default();
            for op in &ops[start..end] {
                match *op {
                    Op::Keep(o, n) => builder.context(o, n, old[o]),
                    Op::Delete(o) => builder.deletion(o, old[o]),
                    Op::Insert(n) => builder.insertion(n, new[n]),
                }
            }
            builder.build(ops, start)
        })
        .collect()
}

#[derive(Default)]
struct HunkBuilder {
    from_start: Option<usize>,
    to_start: Option<usize>,
    from_count: usize,
    to_count: usize,
    changes: Vec<LineChange>,
}

impl HunkBuilder {
    fn context(&mut self, old_idx: usize, new_idx: usize, line: &str) {
        self.from_start.get_or_insert(old_idx + 1);
        self.to_start.get_or_insert(new_idx + 1);
        self.from_count += 1;
        self.to_count += 1;
        self.changes.push(LineChange::Context(new_idx + 1, line.to_string()));
    }

    fn deletion(&mut self, old_idx: usize, line: &str) {
        self.from_start.get_or_insert(old_idx + 1);
        self.from_count += 1;
        self.changes.push(LineChange::Deleted(old_idx + 1, line.to_string()));
    }

    fn insertion(&mut self, new_idx: usize, line: &str) {
        self.to_start.get_or_insert(new_idx + 1);
        self.to_count += 1;
        self.changes.push(LineChange::Added(new_idx + 1, line.to_string()));
    }

    /// A side with no lines in the hunk anchors after the preceding line
    fn build(self, ops: &[Op], start: usize) -> Option<DiffHunk> {
        if self.changes.is_empty() {
            return None;
        }
        let (old_before, new_before) = ops[..start].iter().fold((0, 0), |(o, n), op| match op {
            Op::Keep(..) => (o + 1, n + 1),
            Op::Delete(_) => (o + 1, n),
            Op::Insert(_) => (o, n + 1),
        });
        Some(DiffHunk {
            from_line: self.from_start.unwrap_or(old_before),
            from_count: self.from_count,
            to_line: self.to_start.unwrap_or(new_before),
            to_count: self.to_count,
            changes: self.changes,
        })
    }
}

/// Render a unified diff for one file
pub fn render_unified(diff: &FileDiff) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "--- a/{}", diff.path);
    let _ = writeln!(out, "+++ b/{}", diff.path);
    for hunk in &diff.hunks {
        let _ = writeln!(
            out,
            "@@ -{},{} +{},{} @@",
            hunk.from_line, hunk.from_count, hunk.to_line, hunk.to_count
        );
        for change in &hunk.changes {
            let _ = match change {
                LineChange::Added(_, line) => writeln!(out, "+{}", line),
                LineChange::Deleted(_, line) => writeln!(out, "-{}", line),
                LineChange::Context(_, line) => writeln!(out, " {}", line),
            };
        }
    }
    out
}
