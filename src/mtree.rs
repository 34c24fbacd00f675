//! Metadata manifests of directory trees
//!
//! A [DirectoryHierarchy] records one entry per inode of a filesystem
//! tree, keyed by a selectable set of [Keyword]s (size, mode, owner,
//! content digest, ...). Comparing the hierarchy captured at unpack
//! time against a fresh walk of the rootfs yields the list of
//! [InodeDelta]s that a repacked layer must contain.
//!
//! The on-disk form is a line-oriented text format: one entry per
//! line as space-separated `keyword=value` pairs, with directory
//! scoping expressed by the directory's own entry line (enter) and a
//! bare `..` (leave). Names and values are vis(3)-style octal escaped.

use sha2::{Digest as _, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::{Error, Result};

/// A metadata keyword recognized by the walker and differ
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Keyword {
    Type,
    Size,
    Mode,
    Uid,
    Gid,
    Link,
    Nlink,
    Sha256Digest,
    Time,
}

impl Keyword {
    pub const ALL: [Keyword; 9] = [
        Keyword::Type,
        Keyword::Size,
        Keyword::Mode,
        Keyword::Uid,
        Keyword::Gid,
        Keyword::Link,
        Keyword::Nlink,
        Keyword::Sha256Digest,
        Keyword::Time,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Keyword::Type => "type",
            Keyword::Size => "size",
            Keyword::Mode => "mode",
            Keyword::Uid => "uid",
            Keyword::Gid => "gid",
            Keyword::Link => "link",
            Keyword::Nlink => "nlink",
            Keyword::Sha256Digest => "sha256digest",
            Keyword::Time => "time",
        }
    }

    pub fn parse(s: &str) -> Option<Keyword> {
        Keyword::ALL.iter().copied().find(|k| k.as_str() == s)
    }
}

/// Keywords captured when no explicit selection is given.
///
/// `time` and `nlink` are recognized but not captured by default: both
/// change on content-neutral operations and would surface directories
/// as modified whenever a sibling is touched.
pub const DEFAULT_KEYWORDS: [Keyword; 7] = [
    Keyword::Type,
    Keyword::Size,
    Keyword::Mode,
    Keyword::Uid,
    Keyword::Gid,
    Keyword::Link,
    Keyword::Sha256Digest,
];

/// One inode at one path, with its captured keyword values
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Path relative to the walk root; the root itself is `.`
    pub path: PathBuf,
    pub keywords: BTreeMap<Keyword, String>,
}

impl Entry {
    pub fn is_dir(&self) -> bool {
        self.keywords.get(&Keyword::Type).map(String::as_str) == Some("dir")
    }
}

/// An ordered sequence of [Entry]s in lexicographic walk order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryHierarchy {
    pub entries: Vec<Entry>,
}

/// What happened to one path between two hierarchies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaKind {
    /// Present in the reference tree only; becomes a tar whiteout
    Missing,
    /// Present in the current tree only
    Extra,
    /// Present in both with differing keyword values
    Modified,
}

/// Old/new values of one keyword for a modified path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeywordDelta {
    pub keyword: Keyword,
    pub old: Option<String>,
    pub new: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeDelta {
    pub kind: DeltaKind,
    pub path: PathBuf,
    /// Per-keyword diffs; populated for [DeltaKind::Modified] only
    pub keywords: Vec<KeywordDelta>,
}

/// Walk `root`, capturing the selected keywords for every inode.
///
/// The walk is deterministic: children are visited in file-name order,
/// so the resulting entry sequence is ordered by path components.
/// Symlinks are not followed. With `rootless` set, uid/gid are treated
/// as unobservable and never captured. Metadata manifests stored next
/// to the rootfs (`*.mtree` at the top level) are excluded.
pub fn walk(root: &Path, keywords: &[Keyword], rootless: bool) -> Result<DirectoryHierarchy> {
    // `type` is always captured: the text format scopes directories by
    // their type, and the differ cannot classify a delta without it.
    let mut selection = vec![Keyword::Type];
    selection.extend(
        keywords
            .iter()
            .copied()
            .filter(|k| *k != Keyword::Type)
            .filter(|k| !(rootless && matches!(k, Keyword::Uid | Keyword::Gid))),
    );

    let mut entries = Vec::new();
    let mut seen_inodes: HashMap<(u64, u64), PathBuf> = HashMap::new();

    for dirent in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let dirent = dirent.map_err(|e| {
            let io_err: io::Error = e.into();
            Error::Io(io_err)
        })?;
        let rel = dirent
            .path()
            .strip_prefix(root)
            .expect("walkdir yields paths under its root");
        let path = if rel.as_os_str().is_empty() {
            PathBuf::from(".")
        } else {
            rel.to_path_buf()
        };
        if dirent.depth() == 1 && path.extension().map(|e| e == "mtree").unwrap_or(false) {
            continue;
        }

        let meta = dirent.metadata().map_err(|e| {
            let io_err: io::Error = e.into();
            Error::Io(io_err)
        })?;
        let file_type = meta.file_type();
        let hardlinked = !file_type.is_dir()
            && meta.nlink() > 1
            && seen_inodes
                .insert((meta.dev(), meta.ino()), path.clone())
                .is_some();

        let mut kw = BTreeMap::new();
        for k in &selection {
            match k {
                Keyword::Type => {
                    let t = if file_type.is_dir() {
                        "dir"
                    } else if file_type.is_symlink() {
                        "link"
                    } else if file_type.is_block_device() {
                        "block"
                    } else if file_type.is_char_device() {
                        "char"
                    } else if file_type.is_fifo() {
                        "fifo"
                    } else if file_type.is_socket() {
                        "socket"
                    } else {
                        "file"
                    };
                    kw.insert(Keyword::Type, t.to_string());
                }
                // Size and digest describe contents, which later paths
                // of a hard-linked inode do not repeat.
                Keyword::Size if file_type.is_file() && !hardlinked => {
                    kw.insert(Keyword::Size, meta.len().to_string());
                }
                Keyword::Sha256Digest if file_type.is_file() && !hardlinked => {
                    let mut f = fs::File::open(dirent.path())?;
                    let mut hasher = Sha256::new();
                    io::copy(&mut f, &mut hasher)?;
                    kw.insert(
                        Keyword::Sha256Digest,
                        base16ct::lower::encode_string(&hasher.finalize()),
                    );
                }
                Keyword::Mode => {
                    kw.insert(Keyword::Mode, format!("{:04o}", meta.mode() & 0o7777));
                }
                Keyword::Uid => {
                    kw.insert(Keyword::Uid, meta.uid().to_string());
                }
                Keyword::Gid => {
                    kw.insert(Keyword::Gid, meta.gid().to_string());
                }
                Keyword::Link if file_type.is_symlink() => {
                    let target = fs::read_link(dirent.path())?;
                    kw.insert(
                        Keyword::Link,
                        escape(target.as_os_str().as_bytes()),
                    );
                }
                Keyword::Nlink => {
                    kw.insert(Keyword::Nlink, meta.nlink().to_string());
                }
                Keyword::Time => {
                    kw.insert(
                        Keyword::Time,
                        format!("{}.{:09}", meta.mtime(), meta.mtime_nsec()),
                    );
                }
                _ => {}
            }
        }
        entries.push(Entry { path, keywords: kw });
    }

    Ok(DirectoryHierarchy { entries })
}

impl DirectoryHierarchy {
    /// The union of keywords captured by any entry, in canonical order.
    /// Recovers the selection a stored hierarchy was walked with.
    pub fn keywords(&self) -> Vec<Keyword> {
        Keyword::ALL
            .iter()
            .copied()
            .filter(|k| self.entries.iter().any(|e| e.keywords.contains_key(k)))
            .collect()
    }

    pub fn to_writer(&self, mut w: impl Write) -> Result<()> {
        // stack of open directory scopes, as path component names
        let mut stack: Vec<String> = Vec::new();
        for entry in &self.entries {
            let parent_depth = entry.path.components().count() - 1;
            while stack.len() > parent_depth + 1 {
                stack.pop();
                writeln!(w, "..")?;
            }
            let name = if entry.path == Path::new(".") {
                ".".to_string()
            } else {
                escape(
                    entry
                        .path
                        .file_name()
                        .expect("walk never yields .. components")
                        .as_bytes(),
                )
            };
            write!(w, "{}", name)?;
            for (k, v) in &entry.keywords {
                write!(w, " {}={}", k.as_str(), v)?;
            }
            writeln!(w)?;
            if entry.is_dir() {
                stack.push(name);
            }
        }
        // close every scope except the root's
        while stack.len() > 1 {
            stack.pop();
            writeln!(w, "..")?;
        }
        Ok(())
    }

    pub fn from_reader(r: impl Read) -> Result<Self> {
        let mut entries = Vec::new();
        // path components of the currently open directory scopes,
        // excluding the root `.`
        let mut stack: Vec<PathBuf> = Vec::new();
        let mut seen_root = false;
        for (lineno, line) in BufReader::new(r).lines().enumerate() {
            let lineno = lineno + 1;
            let line = line?;
            let line = line.trim_end();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut tokens = line.split(' ').filter(|t| !t.is_empty());
            let name = tokens.next().expect("non-empty line has a first token");
            if name == ".." {
                if stack.pop().is_none() {
                    return Err(Error::MalformedManifestFile {
                        line: lineno,
                        reason: "unbalanced `..`".to_string(),
                    });
                }
                continue;
            }

            let mut keywords = BTreeMap::new();
            for token in tokens {
                let Some((k, v)) = token.split_once('=') else {
                    return Err(Error::MalformedManifestFile {
                        line: lineno,
                        reason: format!("expected keyword=value, got `{}`", token),
                    });
                };
                match Keyword::parse(k) {
                    Some(keyword) => {
                        keywords.insert(keyword, v.to_string());
                    }
                    // tolerate keywords from a newer writer
                    None => log::debug!("ignoring unknown keyword `{}`", k),
                }
            }

            let path = if name == "." {
                if seen_root || !stack.is_empty() {
                    return Err(Error::MalformedManifestFile {
                        line: lineno,
                        reason: "`.` entry is only valid at the top".to_string(),
                    });
                }
                seen_root = true;
                PathBuf::from(".")
            } else {
                let name = unescape(name).ok_or(Error::MalformedManifestFile {
                    line: lineno,
                    reason: format!("bad escape in `{}`", name),
                })?;
                match stack.last() {
                    Some(dir) => dir.join(&name),
                    None => PathBuf::from(&name),
                }
            };

            let entry = Entry { path, keywords };
            if entry.is_dir() && entry.path != Path::new(".") {
                stack.push(entry.path.clone());
            }
            entries.push(entry);
        }
        Ok(DirectoryHierarchy { entries })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut f = fs::File::create(path)?;
        self.to_writer(&mut f)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let f = fs::File::open(path)?;
        Self::from_reader(f)
    }
}

/// Where a bundle stores the metadata manifest for the image manifest
/// it was unpacked from. The digest's `:` is rewritten to `_` so the
/// digest stays a single file name.
pub fn stored_manifest_path(bundle: &Path, image_manifest: &crate::Digest) -> PathBuf {
    bundle.join(format!("{}.mtree", image_manifest.to_filename()))
}

/// Path-aligned merge of two hierarchies, yielding one delta per path
/// that differs in any of the selected keywords. An entry whose
/// selected keywords all match is suppressed.
pub fn compare(
    old: &DirectoryHierarchy,
    new: &DirectoryHierarchy,
    keywords: &[Keyword],
) -> Vec<InodeDelta> {
    let mut deltas = Vec::new();
    let mut old_iter = old.entries.iter().peekable();
    let mut new_iter = new.entries.iter().peekable();

    loop {
        match (old_iter.peek(), new_iter.peek()) {
            (Some(o), Some(n)) => match o.path.cmp(&n.path) {
                std::cmp::Ordering::Less => {
                    deltas.push(missing(old_iter.next().expect("peeked")));
                }
                std::cmp::Ordering::Greater => {
                    deltas.push(extra(new_iter.next().expect("peeked")));
                }
                std::cmp::Ordering::Equal => {
                    let o = old_iter.next().expect("peeked");
                    let n = new_iter.next().expect("peeked");
                    let diffs: Vec<KeywordDelta> = keywords
                        .iter()
                        .copied()
                        .filter(|k| o.keywords.get(k) != n.keywords.get(k))
                        .map(|k| KeywordDelta {
                            keyword: k,
                            old: o.keywords.get(&k).cloned(),
                            new: n.keywords.get(&k).cloned(),
                        })
                        .collect();
                    if !diffs.is_empty() {
                        deltas.push(InodeDelta {
                            kind: DeltaKind::Modified,
                            path: n.path.clone(),
                            keywords: diffs,
                        });
                    }
                }
            },
            (Some(_), None) => deltas.push(missing(old_iter.next().expect("peeked"))),
            (None, Some(_)) => deltas.push(extra(new_iter.next().expect("peeked"))),
            (None, None) => break,
        }
    }
    deltas
}

fn missing(entry: &Entry) -> InodeDelta {
    InodeDelta {
        kind: DeltaKind::Missing,
        path: entry.path.clone(),
        keywords: Vec::new(),
    }
}

fn extra(entry: &Entry) -> InodeDelta {
    InodeDelta {
        kind: DeltaKind::Extra,
        path: entry.path.clone(),
        keywords: Vec::new(),
    }
}

/// vis(3)-style escaping: non-printable bytes, space, `#` and `\` are
/// written as three-digit octal escapes so names and link targets stay
/// one whitespace-free token.
fn escape(bytes: &[u8]) -> String {
    let mut out = String::new();
    for &b in bytes {
        if b.is_ascii_graphic() && b != b'\\' && b != b'#' {
            out.push(b as char);
        } else {
            out.push_str(&format!("\\{:03o}", b));
        }
    }
    out
}

fn unescape(s: &str) -> Option<std::ffi::OsString> {
    use std::os::unix::ffi::OsStringExt;
    let mut out = Vec::new();
    let mut bytes = s.bytes();
    while let Some(b) = bytes.next() {
        if b == b'\\' {
            let mut v = 0u32;
            for _ in 0..3 {
                let d = bytes.next()?;
                if !(b'0'..=b'7').contains(&d) {
                    return None;
                }
                v = v * 8 + (d - b'0') as u32;
            }
            if v > 0xff {
                return None;
            }
            out.push(v as u8);
        } else {
            out.push(b);
        }
    }
    Some(std::ffi::OsString::from_vec(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    fn sample_tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("etc")).unwrap();
        fs::write(dir.path().join("etc/host.conf"), b"multi on\n").unwrap();
        fs::write(dir.path().join("etc/hostname"), b"quark\n").unwrap();
        symlink("host.conf", dir.path().join("etc/alias")).unwrap();
        fs::create_dir(dir.path().join("var")).unwrap();
        dir
    }

    #[test]
    fn walk_is_deterministic() {
        let dir = sample_tree();
        let a = walk(dir.path(), &DEFAULT_KEYWORDS, false).unwrap();
        let b = walk(dir.path(), &DEFAULT_KEYWORDS, false).unwrap();
        assert_eq!(a, b);
        let paths: Vec<_> = a.entries.iter().map(|e| e.path.clone()).collect();
        assert_eq!(
            paths,
            vec![
                PathBuf::from("."),
                PathBuf::from("etc"),
                PathBuf::from("etc/alias"),
                PathBuf::from("etc/host.conf"),
                PathBuf::from("etc/hostname"),
                PathBuf::from("var"),
            ]
        );
    }

    #[test]
    fn walk_captures_selected_keywords() {
        let dir = sample_tree();
        let h = walk(dir.path(), &DEFAULT_KEYWORDS, false).unwrap();
        let host_conf = h
            .entries
            .iter()
            .find(|e| e.path == Path::new("etc/host.conf"))
            .unwrap();
        assert_eq!(host_conf.keywords[&Keyword::Type], "file");
        assert_eq!(host_conf.keywords[&Keyword::Size], "9");
        assert_eq!(
            host_conf.keywords[&Keyword::Sha256Digest],
            crate::Digest::from_buf_sha256(b"multi on\n").encoded
        );
        let alias = h
            .entries
            .iter()
            .find(|e| e.path == Path::new("etc/alias"))
            .unwrap();
        assert_eq!(alias.keywords[&Keyword::Type], "link");
        assert_eq!(alias.keywords[&Keyword::Link], "host.conf");
        assert!(!alias.keywords.contains_key(&Keyword::Size));
    }

    #[test]
    fn rootless_walk_omits_ownership() {
        let dir = sample_tree();
        let h = walk(dir.path(), &DEFAULT_KEYWORDS, true).unwrap();
        assert!(h
            .entries
            .iter()
            .all(|e| !e.keywords.contains_key(&Keyword::Uid)));
        assert_eq!(
            h.keywords(),
            vec![
                Keyword::Type,
                Keyword::Size,
                Keyword::Mode,
                Keyword::Link,
                Keyword::Sha256Digest,
            ]
        );
    }

    #[test]
    fn mtree_files_excluded_at_top_level() {
        let dir = sample_tree();
        fs::write(dir.path().join("sha256_abcd.mtree"), b". type=dir\n").unwrap();
        let h = walk(dir.path(), &DEFAULT_KEYWORDS, false).unwrap();
        assert!(!h
            .entries
            .iter()
            .any(|e| e.path.extension().map(|x| x == "mtree").unwrap_or(false)));
    }

    #[test]
    fn text_roundtrip() {
        let dir = sample_tree();
        fs::write(dir.path().join("etc/with space"), b"x").unwrap();
        let h = walk(dir.path(), &DEFAULT_KEYWORDS, false).unwrap();
        let mut buf = Vec::new();
        h.to_writer(&mut buf).unwrap();
        let parsed = DirectoryHierarchy::from_reader(&buf[..]).unwrap();
        assert_eq!(h, parsed);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(DirectoryHierarchy::from_reader(&b".. \n"[..]).is_err());
        assert!(DirectoryHierarchy::from_reader(&b". type=dir\nfoo sizeless\n"[..]).is_err());
    }

    #[test]
    fn compare_empty_on_identical_trees() {
        let dir = sample_tree();
        let a = walk(dir.path(), &DEFAULT_KEYWORDS, false).unwrap();
        let b = walk(dir.path(), &DEFAULT_KEYWORDS, false).unwrap();
        assert!(compare(&a, &b, &DEFAULT_KEYWORDS).is_empty());
    }

    #[test]
    fn compare_detects_change_kinds() {
        let dir = sample_tree();
        let before = walk(dir.path(), &DEFAULT_KEYWORDS, false).unwrap();

        fs::write(dir.path().join("etc/hostname"), b"gluon\n").unwrap();
        fs::remove_file(dir.path().join("etc/host.conf")).unwrap();
        fs::write(dir.path().join("etc/resolv.conf"), b"nameserver ::1\n").unwrap();
        let after = walk(dir.path(), &DEFAULT_KEYWORDS, false).unwrap();

        let deltas = compare(&before, &after, &DEFAULT_KEYWORDS);
        let find = |p: &str| deltas.iter().find(|d| d.path == Path::new(p)).unwrap();
        assert_eq!(find("etc/host.conf").kind, DeltaKind::Missing);
        assert_eq!(find("etc/resolv.conf").kind, DeltaKind::Extra);
        let modified = find("etc/hostname");
        assert_eq!(modified.kind, DeltaKind::Modified);
        assert!(modified
            .keywords
            .iter()
            .any(|d| d.keyword == Keyword::Sha256Digest));
        assert_eq!(deltas.len(), 3);
    }

    #[test]
    fn compare_is_symmetric() {
        let dir = sample_tree();
        let before = walk(dir.path(), &DEFAULT_KEYWORDS, false).unwrap();
        fs::remove_file(dir.path().join("etc/hostname")).unwrap();
        fs::write(dir.path().join("boot"), b"").unwrap();
        let after = walk(dir.path(), &DEFAULT_KEYWORDS, false).unwrap();

        let forward = compare(&before, &after, &DEFAULT_KEYWORDS);
        let backward = compare(&after, &before, &DEFAULT_KEYWORDS);
        assert_eq!(forward.len(), backward.len());
        for d in &forward {
            let mirrored = backward.iter().find(|b| b.path == d.path).unwrap();
            match d.kind {
                DeltaKind::Missing => assert_eq!(mirrored.kind, DeltaKind::Extra),
                DeltaKind::Extra => assert_eq!(mirrored.kind, DeltaKind::Missing),
                DeltaKind::Modified => assert_eq!(mirrored.kind, DeltaKind::Modified),
            }
        }
    }

    #[test]
    fn selection_recovered_from_stored_manifest() {
        let dir = sample_tree();
        let h = walk(dir.path(), &[Keyword::Type, Keyword::Mode], false).unwrap();
        let mut buf = Vec::new();
        h.to_writer(&mut buf).unwrap();
        let parsed = DirectoryHierarchy::from_reader(&buf[..]).unwrap();
        assert_eq!(parsed.keywords(), vec![Keyword::Type, Keyword::Mode]);
    }
}
