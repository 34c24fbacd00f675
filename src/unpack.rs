//! Unpacking an image into a runtime bundle
//!
//! A bundle is a directory holding the extracted `rootfs/`, a runtime
//! `config.json` derived from the image config, and a metadata
//! manifest snapshot of the rootfs that repacking later diffs against.

use flate2::read::GzDecoder;
use oci_spec::image::{ImageConfiguration, MediaType};
use oci_spec::runtime::{ProcessBuilder, RootBuilder, SpecBuilder, UserBuilder};
use std::fs;
use std::io::{self, Read};
use std::path::{Component, Path};
use tar::Archive;

use crate::digest::{Digest, DigestReader};
use crate::error::{Error, Result};
use crate::idmap::{to_host, MapOptions};
use crate::image_dir::{Blob, ImageDir};
use crate::layer::WHITEOUT_PREFIX;
use crate::mtree;
use crate::reference::RefName;

/// Name of the rootfs directory inside a bundle
pub const ROOTFS_NAME: &str = "rootfs";

const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Unpack the image named by `from` into a fresh bundle directory.
pub fn unpack(image: &Path, from: &RefName, bundle: &Path, opts: &MapOptions) -> Result<()> {
    let dir = ImageDir::open(image)?;
    let descriptor = dir.get_reference(from)?;
    if descriptor.media_type() != &MediaType::ImageManifest {
        return Err(Error::UnsupportedMediaType(
            descriptor.media_type().to_string(),
        ));
    }
    let manifest_digest = Digest::from_descriptor(&descriptor)?;
    let Blob::Manifest(manifest) = dir.from_descriptor(&descriptor)? else {
        return Err(Error::UnsupportedMediaType(
            descriptor.media_type().to_string(),
        ));
    };
    let Blob::Config(config) = dir.from_descriptor(manifest.config())? else {
        return Err(Error::UnsupportedMediaType(
            manifest.config().media_type().to_string(),
        ));
    };
    if manifest.layers().len() != config.rootfs().diff_ids().len() {
        return Err(Error::CorruptLayout {
            path: image.to_path_buf(),
            reason: format!(
                "manifest has {} layers but config has {} diff ids",
                manifest.layers().len(),
                config.rootfs().diff_ids().len()
            ),
        });
    }

    let rootfs = bundle.join(ROOTFS_NAME);
    if rootfs.exists() {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} already exists", rootfs.display()),
        )));
    }
    fs::create_dir_all(&rootfs)?;

    for (layer_desc, diff_id) in manifest.layers().iter().zip(config.rootfs().diff_ids()) {
        let Blob::Layer(blob) = dir.from_descriptor(layer_desc)? else {
            return Err(Error::UnsupportedMediaType(
                layer_desc.media_type().to_string(),
            ));
        };
        log::debug!("Extracting layer {}", layer_desc.digest());
        extract_layer(blob, layer_desc.digest(), diff_id, &rootfs, opts)?;
    }

    let runtime_config = runtime_config_from(&config)?;
    runtime_config.save(bundle.join("config.json"))?;

    let hierarchy = mtree::walk(&rootfs, &mtree::DEFAULT_KEYWORDS, opts.rootless)?;
    hierarchy.save(&mtree::stored_manifest_path(bundle, &manifest_digest))?;
    log::info!(
        "Unpacked {} ({} layers) into {}",
        from,
        manifest.layers().len(),
        bundle.display()
    );
    Ok(())
}

/// Extract one gzip layer, applying whiteouts and verifying both the
/// blob digest and the diff ID in the same pass as the extraction.
fn extract_layer(
    blob: fs::File,
    blob_digest: &str,
    diff_id: &str,
    rootfs: &Path,
    opts: &MapOptions,
) -> Result<()> {
    let compressed = DigestReader::new(blob);
    let decoder = GzDecoder::new(compressed);
    let mut archive = Archive::new(DigestReader::new(decoder));
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            log::warn!("Ignoring entry escaping the rootfs: {}", path.display());
            continue;
        }

        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name.to_string(),
            None => continue,
        };
        if name == OPAQUE_WHITEOUT {
            let target = rootfs.join(path.parent().unwrap_or(Path::new("")));
            if target.is_dir() {
                for child in fs::read_dir(&target)? {
                    remove_all(&child?.path())?;
                }
            }
            continue;
        }
        if let Some(hidden) = name.strip_prefix(WHITEOUT_PREFIX) {
            let target = rootfs
                .join(path.parent().unwrap_or(Path::new("")))
                .join(hidden);
            remove_all(&target)?;
            continue;
        }

        entry.unpack_in(rootfs)?;
        if !opts.rootless {
            restore_ownership(&entry, rootfs.join(&path).as_path(), opts)?;
        }
    }

    // Drain the terminator and gzip trailer so the digests cover the
    // complete streams.
    let mut tar_stream = archive.into_inner();
    io::copy(&mut tar_stream, &mut io::sink())?;
    let (decoder, found_diff_id, _) = tar_stream.finish();
    if found_diff_id.to_string() != diff_id {
        return Err(Error::DigestMismatch {
            expected: diff_id.to_string(),
            found: found_diff_id.to_string(),
        });
    }
    let mut compressed = decoder.into_inner();
    io::copy(&mut compressed, &mut io::sink())?;
    let (_, found_blob, _) = compressed.finish();
    if found_blob.to_string() != blob_digest {
        return Err(Error::DigestMismatch {
            expected: blob_digest.to_string(),
            found: found_blob.to_string(),
        });
    }
    Ok(())
}

fn remove_all(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path)?,
        Ok(_) => fs::remove_file(path)?,
        // a whiteout for something a prior layer never created
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(Error::Io(e)),
    }
    Ok(())
}

fn restore_ownership<R: Read>(
    entry: &tar::Entry<R>,
    path: &Path,
    opts: &MapOptions,
) -> Result<()> {
    use nix::unistd::{fchownat, FchownatFlags, Gid, Uid};
    let uid = to_host(entry.header().uid()? as u32, &opts.uid_mappings);
    let gid = to_host(entry.header().gid()? as u32, &opts.gid_mappings);
    fchownat(
        None,
        path,
        Some(Uid::from_raw(uid)),
        Some(Gid::from_raw(gid)),
        FchownatFlags::NoFollowSymlink,
    )
    .map_err(|e| Error::Io(io::Error::from(e)))?;
    Ok(())
}

/// Derive the runtime-spec `config.json` from an image configuration.
fn runtime_config_from(config: &ImageConfiguration) -> Result<oci_spec::runtime::Spec> {
    let mut cwd = "/".to_string();
    let mut env = None;
    let mut args = Vec::new();
    let mut user = (0, 0);
    if let Some(ctr) = config.config() {
        if let Some(dir) = ctr.working_dir() {
            if !dir.is_empty() {
                cwd = dir.clone();
            }
        }
        if let Some(e) = ctr.env() {
            env = Some(e.clone());
        }
        if let Some(entrypoint) = ctr.entrypoint() {
            args.extend(entrypoint.clone());
        }
        if let Some(cmd) = ctr.cmd() {
            args.extend(cmd.clone());
        }
        if let Some(u) = ctr.user() {
            if !u.is_empty() {
                user = parse_user(u)?;
            }
        }
    }

    let mut process = ProcessBuilder::default()
        .cwd(cwd)
        .user(UserBuilder::default().uid(user.0).gid(user.1).build()?);
    if let Some(env) = env {
        process = process.env(env);
    }
    if !args.is_empty() {
        process = process.args(args);
    }

    Ok(SpecBuilder::default()
        .root(
            RootBuilder::default()
                .path(ROOTFS_NAME)
                .readonly(false)
                .build()?,
        )
        .process(process.build()?)
        .build()?)
}

/// Parse an image config `user` of the numeric `uid[:gid]` form.
/// Resolving names against the rootfs passwd database is not done.
fn parse_user(user: &str) -> Result<(u32, u32)> {
    let parse = |s: &str| {
        s.parse::<u32>().map_err(|_| {
            Error::MalformedMapping(format!("non-numeric user `{}` in image config", s))
        })
    };
    match user.split_once(':') {
        Some((uid, gid)) => Ok((parse(uid)?, parse(gid)?)),
        None => {
            let uid = parse(user)?;
            Ok((uid, uid))
        }
    }
}
