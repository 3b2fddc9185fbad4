//! Local file transfer between a source and a destination root.
//!
//! `src` is relative to the source root and is one of:
//! - a file: copied to `dest`, or into it when `dest` ends in `/`
//! - a directory: copied recursively, with `dest` substituted for the
//!   directory itself, or the directory placed inside `dest/`
//! - directory contents (`dir/` or `.`): everything below the directory is
//!   copied into `dest`
//! - a glob: every match is copied into `dest`, keeping the path below the
//!   match's parent directory
//!
//! An empty `dest` keeps each entry's relative path. Entries matching an
//! exclude pattern are skipped together with everything below them.

use crate::ExecutorError;
use glob::{MatchOptions, Pattern};
use knita_schema::TransferOpts;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use tracing::debug;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// One item to create on the destination side. Paths use `/` and are
/// relative to their roots.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct TransferEntry {
    pub src: String,
    pub dest: String,
    pub is_dir: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferSummary {
    pub files: usize,
    pub directories: usize,
    pub bytes: u64,
}

/// Work out what copying `src` from `root` to `opts.dest` involves.
pub fn plan_transfer(
    root: &Path,
    src: &str,
    opts: &TransferOpts,
) -> Result<Vec<TransferEntry>, ExecutorError> {
    opts.validate(src)?;
    let excludes = opts
        .excludes
        .iter()
        .map(|p| {
            Pattern::new(p)
                .map_err(|e| ExecutorError::Transfer(format!("invalid exclude '{p}': {e}")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let walker = Walker {
        root,
        excludes: &excludes,
    };
    let dest = opts.dest.as_str();

    let mut entries = Vec::new();
    if is_glob(src) {
        let matches = walker.glob(src)?;
        if matches.is_empty() {
            return Err(ExecutorError::Transfer(format!("no files matched '{src}'")));
        }
        for matched in matches {
            let parent = parent_of(&matched);
            for (path, is_dir) in walker.walk(&matched)? {
                let final_dest = if dest.is_empty() {
                    path.clone()
                } else {
                    join(dest, strip_base(&path, parent))
                };
                push(&mut entries, path, final_dest, is_dir);
            }
        }
        return Ok(dedup(entries));
    }

    let trimmed = match src.trim_end_matches('/') {
        "" => ".",
        t => t,
    };
    let meta = fs::metadata(root.join(trimmed)).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ExecutorError::Transfer(format!("source '{src}' does not exist"))
        } else {
            ExecutorError::Io(e)
        }
    })?;

    if src.ends_with('/') || trimmed == "." {
        for (path, is_dir) in walker.walk(trimmed)? {
            if path == trimmed {
                continue;
            }
            let final_dest = if dest.is_empty() {
                path.clone()
            } else {
                join(dest, strip_base(&path, trimmed))
            };
            push(&mut entries, path, final_dest, is_dir);
        }
    } else if meta.is_dir() {
        for (path, is_dir) in walker.walk(trimmed)? {
            let final_dest = if dest.is_empty() {
                path.clone()
            } else if dest.ends_with('/') {
                join(dest, strip_base(&path, parent_of(trimmed)))
            } else {
                join(dest, strip_base(&path, trimmed))
            };
            push(&mut entries, path, final_dest, is_dir);
        }
    } else if !walker.is_excluded(trimmed) {
        let final_dest = if dest.is_empty() {
            trimmed.to_owned()
        } else if dest.ends_with('/') || join(dest, "") == "." {
            join(dest, file_name(trimmed))
        } else {
            join(dest, "")
        };
        push(&mut entries, trimmed.to_owned(), final_dest, false);
    }
    Ok(entries)
}

/// Copy `src` from `from_root` into `to_root` as described by `opts`.
pub fn transfer(
    from_root: &Path,
    to_root: &Path,
    src: &str,
    opts: &TransferOpts,
) -> Result<TransferSummary, ExecutorError> {
    let entries = plan_transfer(from_root, src, opts)?;
    let mut summary = TransferSummary::default();
    for entry in &entries {
        let target = to_root.join(&entry.dest);
        if entry.is_dir {
            fs::create_dir_all(&target)?;
            summary.directories += 1;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            summary.bytes += fs::copy(from_root.join(&entry.src), &target)?;
            summary.files += 1;
        }
    }
    debug!(
        "transferred '{src}': {} files, {} dirs, {} bytes",
        summary.files, summary.directories, summary.bytes
    );
    Ok(summary)
}

struct Walker<'a> {
    root: &'a Path,
    excludes: &'a [Pattern],
}

impl Walker<'_> {
    fn is_excluded(&self, rel: &str) -> bool {
        self.excludes
            .iter()
            .any(|p| p.matches_with(rel, MATCH_OPTIONS))
    }

    /// `rel` and everything below it, parents before children, in name order.
    fn walk(&self, rel: &str) -> Result<Vec<(String, bool)>, ExecutorError> {
        let mut out = Vec::new();
        self.walk_into(rel, &mut out)?;
        Ok(out)
    }

    fn walk_into(&self, rel: &str, out: &mut Vec<(String, bool)>) -> Result<(), ExecutorError> {
        if rel != "." && self.is_excluded(rel) {
            debug!("skipping excluded '{rel}'");
            return Ok(());
        }
        let path = self.root.join(rel);
        let is_dir = fs::metadata(&path)?.is_dir();
        out.push((rel.to_owned(), is_dir));
        if !is_dir {
            return Ok(());
        }
        let mut names = fs::read_dir(&path)?
            .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
            .collect::<Result<Vec<_>, _>>()?;
        names.sort();
        for name in names {
            let child = if rel == "." {
                name
            } else {
                format!("{rel}/{name}")
            };
            self.walk_into(&child, out)?;
        }
        Ok(())
    }

    /// Glob matches as relative paths, excluding the root itself.
    fn glob(&self, src: &str) -> Result<Vec<String>, ExecutorError> {
        let base = Pattern::escape(&self.root.to_string_lossy());
        let pattern = format!("{}/{src}", base.trim_end_matches('/'));
        let paths = glob::glob_with(&pattern, MATCH_OPTIONS)
            .map_err(|e| ExecutorError::Transfer(format!("invalid pattern '{src}': {e}")))?;
        let mut matches = Vec::new();
        for path in paths {
            let path = path.map_err(|e| ExecutorError::Transfer(e.to_string()))?;
            let Ok(rel) = path.strip_prefix(self.root) else {
                continue;
            };
            let rel = rel.to_string_lossy().replace('\\', "/");
            if rel.is_empty() {
                continue;
            }
            matches.push(rel);
        }
        Ok(matches)
    }
}

fn push(entries: &mut Vec<TransferEntry>, src: String, dest: String, is_dir: bool) {
    if dest == "." {
        return;
    }
    entries.push(TransferEntry { src, dest, is_dir });
}

fn dedup(entries: Vec<TransferEntry>) -> Vec<TransferEntry> {
    let mut seen = BTreeSet::new();
    entries
        .into_iter()
        .filter(|e| seen.insert((e.src.clone(), e.dest.clone())))
        .collect()
}

fn is_glob(src: &str) -> bool {
    src.contains(|c| matches!(c, '*' | '?' | '['))
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => ".",
    }
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// `path` relative to `base`; `base` of `.` leaves `path` unchanged.
fn strip_base<'a>(path: &'a str, base: &str) -> &'a str {
    if base == "." {
        return path;
    }
    match path.strip_prefix(base) {
        Some(rest) => rest.trim_start_matches('/'),
        None => path,
    }
}

/// Join and clean relative `/` paths. An empty result is `.`.
fn join(a: &str, b: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for component in a.split('/').chain(b.split('/')) {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            name => parts.push(name),
        }
    }
    if parts.is_empty() {
        ".".to_owned()
    } else {
        parts.join("/")
    }
}
