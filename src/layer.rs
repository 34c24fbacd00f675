//! Turning inode deltas into tar layer entries
//!
//! Added and modified paths become regular tar entries carrying their
//! current on-disk state; removed paths become `.wh.<name>` whiteout
//! markers. Ids in the headers are rewritten from the host namespace
//! to the container namespace of the bundle's id maps.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tar::{Builder, EntryType, Header};

use crate::error::Result;
use crate::idmap::{to_container, MapOptions};
use crate::mtree::{DeltaKind, InodeDelta, Keyword};

/// Prefix marking a deleted path in a layer
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Append one tar entry (or whiteout) per delta, in delta order.
///
/// `root` is the rootfs the deltas were computed against; added and
/// modified entries read their current state from it. Whiteouts for
/// paths underneath an already-removed (or no-longer-a-directory)
/// ancestor are suppressed, since deleting the ancestor deletes them.
pub fn append_deltas<W: Write>(
    builder: &mut Builder<W>,
    root: &Path,
    deltas: &[InodeDelta],
    opts: &MapOptions,
) -> Result<()> {
    // paths whose descendants no longer need their own whiteouts
    let mut covered: Vec<PathBuf> = Vec::new();
    // first-seen path per hard-linked inode
    let mut seen_inodes: HashMap<(u64, u64), PathBuf> = HashMap::new();

    for delta in deltas {
        if delta.path == Path::new(".") {
            log::debug!("Skipping tar entry for the rootfs root itself");
            continue;
        }
        match delta.kind {
            DeltaKind::Missing => {
                if covered.iter().any(|c| delta.path.starts_with(c)) {
                    continue;
                }
                append_whiteout(builder, &delta.path)?;
                covered.push(delta.path.clone());
            }
            DeltaKind::Extra | DeltaKind::Modified => {
                if delta.kind == DeltaKind::Modified && was_directory_replaced(delta) {
                    covered.push(delta.path.clone());
                }
                append_entry(builder, root, &delta.path, opts, &mut seen_inodes)?;
            }
        }
    }
    Ok(())
}

/// A modified path that used to be a directory but is one no longer;
/// its former children all show up as `Missing`.
fn was_directory_replaced(delta: &InodeDelta) -> bool {
    delta.keywords.iter().any(|d| {
        d.keyword == Keyword::Type
            && d.old.as_deref() == Some("dir")
            && d.new.as_deref() != Some("dir")
    })
}

fn append_whiteout<W: Write>(builder: &mut Builder<W>, path: &Path) -> Result<()> {
    let name = path
        .file_name()
        .expect("compare never yields `..` or root components");
    let mut whiteout = String::from(WHITEOUT_PREFIX);
    whiteout.push_str(&name.to_string_lossy());
    let wh_path = path.parent().unwrap_or(Path::new("")).join(whiteout);

    let mut header = Header::new_ustar();
    header.set_entry_type(EntryType::Regular);
    header.set_size(0);
    header.set_mode(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);
    builder.append_data(&mut header, wh_path, io::empty())?;
    Ok(())
}

fn map_ids(meta: &fs::Metadata, opts: &MapOptions) -> (u64, u64) {
    if opts.rootless {
        // only one id is mappable in a rootless bundle
        (0, 0)
    } else {
        (
            to_container(meta.uid(), &opts.uid_mappings) as u64,
            to_container(meta.gid(), &opts.gid_mappings) as u64,
        )
    }
}

fn append_entry<W: Write>(
    builder: &mut Builder<W>,
    root: &Path,
    path: &Path,
    opts: &MapOptions,
    seen_inodes: &mut HashMap<(u64, u64), PathBuf>,
) -> Result<()> {
    let full = root.join(path);
    let meta = fs::symlink_metadata(&full)?;
    let file_type = meta.file_type();

    let mut header = Header::new_ustar();
    header.set_mode(meta.mode() & 0o7777);
    header.set_mtime(meta.mtime().max(0) as u64);
    let (uid, gid) = map_ids(&meta, opts);
    header.set_uid(uid);
    header.set_gid(gid);

    use std::os::unix::fs::FileTypeExt;
    if file_type.is_dir() {
        header.set_entry_type(EntryType::Directory);
        header.set_size(0);
        builder.append_data(&mut header, path, io::empty())?;
    } else if file_type.is_symlink() {
        header.set_entry_type(EntryType::Symlink);
        header.set_size(0);
        let target = fs::read_link(&full)?;
        builder.append_link(&mut header, path, target)?;
    } else if file_type.is_block_device() || file_type.is_char_device() {
        header.set_entry_type(if file_type.is_block_device() {
            EntryType::Block
        } else {
            EntryType::Char
        });
        header.set_size(0);
        header.set_device_major(nix::sys::stat::major(meta.rdev()) as u32)?;
        header.set_device_minor(nix::sys::stat::minor(meta.rdev()) as u32)?;
        builder.append_data(&mut header, path, io::empty())?;
    } else if file_type.is_fifo() {
        header.set_entry_type(EntryType::Fifo);
        header.set_size(0);
        builder.append_data(&mut header, path, io::empty())?;
    } else if file_type.is_socket() {
        log::warn!("Skipping socket {}: not representable in a layer", path.display());
    } else {
        let inode = (meta.dev(), meta.ino());
        let linked = meta.nlink() > 1;
        let first_path = if linked {
            seen_inodes.get(&inode).cloned()
        } else {
            None
        };
        if let Some(first) = first_path {
            header.set_entry_type(EntryType::Link);
            header.set_size(0);
            builder.append_link(&mut header, path, first)?;
        } else {
            if linked {
                seen_inodes.insert(inode, path.to_path_buf());
            }
            header.set_entry_type(EntryType::Regular);
            header.set_size(meta.len());
            let f = fs::File::open(&full)?;
            builder.append_data(&mut header, path, f)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mtree::{compare, walk, DEFAULT_KEYWORDS};
    use std::io::Read;
    use tar::Archive;

    fn entries_of(tar_bytes: &[u8]) -> Vec<(PathBuf, EntryType, u64, u32, u64)> {
        let mut out = Vec::new();
        let mut archive = Archive::new(tar_bytes);
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            out.push((
                entry.path().unwrap().into_owned(),
                entry.header().entry_type(),
                entry.header().size().unwrap(),
                entry.header().mode().unwrap(),
                entry.header().uid().unwrap(),
            ));
        }
        out
    }

    fn build(root: &Path, deltas: &[InodeDelta], opts: &MapOptions) -> Vec<u8> {
        let mut builder = Builder::new(Vec::new());
        append_deltas(&mut builder, root, deltas, opts).unwrap();
        builder.into_inner().unwrap()
    }

    #[test]
    fn added_file_entry() {
        let dir = tempfile::tempdir().unwrap();
        let before = walk(dir.path(), &DEFAULT_KEYWORDS, false).unwrap();
        fs::write(dir.path().join("hello"), b"hello, world\n").unwrap();
        let mut perms = fs::metadata(dir.path().join("hello")).unwrap().permissions();
        std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o644);
        fs::set_permissions(dir.path().join("hello"), perms).unwrap();
        let after = walk(dir.path(), &DEFAULT_KEYWORDS, false).unwrap();
        let deltas = compare(&before, &after, &DEFAULT_KEYWORDS);

        let tar = build(dir.path(), &deltas, &MapOptions::default());
        let entries = entries_of(&tar);
        assert_eq!(entries.len(), 1);
        let (path, kind, size, mode, _) = &entries[0];
        assert_eq!(path, Path::new("hello"));
        assert_eq!(*kind, EntryType::Regular);
        assert_eq!(*size, 13);
        assert_eq!(*mode, 0o644);

        let mut archive = Archive::new(&tar[..]);
        let mut content = String::new();
        archive
            .entries()
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "hello, world\n");
    }

    #[test]
    fn removed_file_becomes_whiteout() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("etc")).unwrap();
        fs::write(dir.path().join("etc/host.conf"), b"multi on\n").unwrap();
        let before = walk(dir.path(), &DEFAULT_KEYWORDS, false).unwrap();
        fs::remove_file(dir.path().join("etc/host.conf")).unwrap();
        let after = walk(dir.path(), &DEFAULT_KEYWORDS, false).unwrap();
        let deltas = compare(&before, &after, &DEFAULT_KEYWORDS);

        let entries = entries_of(&build(dir.path(), &deltas, &MapOptions::default()));
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, Path::new("etc/.wh.host.conf"));
        assert_eq!(entries[0].1, EntryType::Regular);
        assert_eq!(entries[0].2, 0);
        assert_eq!(entries[0].3, 0);
    }

    #[test]
    fn removed_tree_yields_single_whiteout() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("opt/app")).unwrap();
        fs::write(dir.path().join("opt/app/bin"), b"x").unwrap();
        let before = walk(dir.path(), &DEFAULT_KEYWORDS, false).unwrap();
        fs::remove_dir_all(dir.path().join("opt")).unwrap();
        let after = walk(dir.path(), &DEFAULT_KEYWORDS, false).unwrap();
        let deltas = compare(&before, &after, &DEFAULT_KEYWORDS);

        let entries = entries_of(&build(dir.path(), &deltas, &MapOptions::default()));
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, Path::new(".wh.opt"));
    }

    #[test]
    fn rootless_headers_are_root_owned() {
        let dir = tempfile::tempdir().unwrap();
        let before = walk(dir.path(), &DEFAULT_KEYWORDS, true).unwrap();
        fs::write(dir.path().join("hello"), b"hi").unwrap();
        let after = walk(dir.path(), &DEFAULT_KEYWORDS, true).unwrap();
        let deltas = compare(&before, &after, &DEFAULT_KEYWORDS);

        let opts = MapOptions::new(true, Vec::new(), Vec::new());
        let entries = entries_of(&build(dir.path(), &deltas, &opts));
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].4, 0);
    }

    #[test]
    fn explicit_map_rewrites_ids() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("owned"), b"x").unwrap();
        // the on-disk owner falls inside the mapping's host range, so
        // the header carries the corresponding container id
        let euid = nix::unistd::geteuid().as_raw();
        let opts = MapOptions::new(
            false,
            vec![crate::idmap::IdMapping {
                container_id: 42,
                host_id: euid,
                size: 1,
            }],
            Vec::new(),
        );
        let deltas = vec![InodeDelta {
            kind: DeltaKind::Extra,
            path: PathBuf::from("owned"),
            keywords: Vec::new(),
        }];
        let entries = entries_of(&build(dir.path(), &deltas, &opts));
        assert_eq!(entries[0].4, 42);
    }

    #[test]
    fn ids_outside_map_ranges_pass_through() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("owned"), b"x").unwrap();
        let euid = nix::unistd::geteuid().as_raw();
        // a mapping whose host range does not contain the on-disk owner
        // leaves the id unchanged
        let opts = MapOptions::new(
            false,
            vec![crate::idmap::IdMapping {
                container_id: 0,
                host_id: euid + 1,
                size: 1,
            }],
            Vec::new(),
        );
        let deltas = vec![InodeDelta {
            kind: DeltaKind::Extra,
            path: PathBuf::from("owned"),
            keywords: Vec::new(),
        }];
        let entries = entries_of(&build(dir.path(), &deltas, &opts));
        assert_eq!(entries[0].4, euid as u64);
    }

    #[test]
    fn symlink_and_hardlink_entries() {
        let dir = tempfile::tempdir().unwrap();
        let before = walk(dir.path(), &DEFAULT_KEYWORDS, false).unwrap();
        fs::write(dir.path().join("data"), b"shared").unwrap();
        fs::hard_link(dir.path().join("data"), dir.path().join("data2")).unwrap();
        std::os::unix::fs::symlink("data", dir.path().join("alias")).unwrap();
        let after = walk(dir.path(), &DEFAULT_KEYWORDS, false).unwrap();
        let deltas = compare(&before, &after, &DEFAULT_KEYWORDS);

        let tar = build(dir.path(), &deltas, &MapOptions::default());
        let mut archive = Archive::new(&tar[..]);
        let mut kinds: HashMap<PathBuf, (EntryType, Option<PathBuf>)> = HashMap::new();
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            kinds.insert(
                entry.path().unwrap().into_owned(),
                (
                    entry.header().entry_type(),
                    entry.link_name().unwrap().map(|l| l.into_owned()),
                ),
            );
        }
        assert_eq!(
            kinds[Path::new("alias")],
            (EntryType::Symlink, Some(PathBuf::from("data")))
        );
        // walk order puts `data` before `data2`; the second path of the
        // inode becomes a hard link to the first
        assert_eq!(kinds[Path::new("data")].0, EntryType::Regular);
        assert_eq!(
            kinds[Path::new("data2")],
            (EntryType::Link, Some(PathBuf::from("data")))
        );
    }
}
