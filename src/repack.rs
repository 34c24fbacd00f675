//! Repacking a modified bundle into its image as a new layer
//!
//! The bundle's stored metadata manifest describes the rootfs as it
//! was unpacked; diffing it against the current rootfs yields the
//! delta layer. The tar stream is hashed uncompressed (the diff ID)
//! and compressed+hashed (the blob) in one pass, then the new blob is
//! threaded through config and manifest before the reference moves.

use oci_spec::image::{Descriptor, DescriptorBuilder, HistoryBuilder, MediaType};
use std::path::Path;

use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::idmap::MapOptions;
use crate::image_dir::{Blob, ImageDir};
use crate::layer::append_deltas;
use crate::mtree::{self, DirectoryHierarchy};
use crate::reference::RefName;
use crate::unpack::ROOTFS_NAME;

/// Pack the changes in `bundle` into the image at `image` as a new
/// layer on top of the image named by `from`. With a `tag`, the new
/// manifest is bound to it. Returns the new manifest's descriptor.
pub fn repack(
    image: &Path,
    from: &RefName,
    bundle: &Path,
    tag: Option<&RefName>,
    opts: &MapOptions,
) -> Result<Descriptor> {
    let dir = ImageDir::open(image)?;
    let descriptor = dir.get_reference(from)?;
    if descriptor.media_type() != &MediaType::ImageManifest {
        return Err(Error::UnsupportedMediaType(
            descriptor.media_type().to_string(),
        ));
    }
    let manifest_digest = Digest::from_descriptor(&descriptor)?;

    let stored_path = mtree::stored_manifest_path(bundle, &manifest_digest);
    if !stored_path.is_file() {
        return Err(Error::MissingBundleState(stored_path));
    }
    let stored = DirectoryHierarchy::load(&stored_path)?;
    // ownership is unobservable in a rootless bundle, even when the
    // stored manifest recorded it
    let mut selection = stored.keywords();
    if opts.rootless {
        selection.retain(|k| !matches!(k, mtree::Keyword::Uid | mtree::Keyword::Gid));
    }

    let rootfs = bundle.join(ROOTFS_NAME);
    let current = mtree::walk(&rootfs, &selection, opts.rootless)?;
    let deltas = mtree::compare(&stored, &current, &selection);
    log::info!(
        "Bundle {} differs from {} in {} entries",
        bundle.display(),
        from,
        deltas.len()
    );

    let mut builder = dir.create_layer()?;
    append_deltas(&mut builder, &rootfs, &deltas, opts)?;
    let layer = builder.into_inner()?.complete(&dir)?;

    let Blob::Manifest(mut manifest) = dir.from_descriptor(&descriptor)? else {
        return Err(Error::UnsupportedMediaType(
            descriptor.media_type().to_string(),
        ));
    };
    let Blob::Config(mut config) = dir.from_descriptor(manifest.config())? else {
        return Err(Error::UnsupportedMediaType(
            manifest.config().media_type().to_string(),
        ));
    };

    let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    let mut rootfs_section = config.rootfs().clone();
    rootfs_section.diff_ids_mut().push(layer.diff_id.to_string());
    config.set_rootfs(rootfs_section);
    config.history_mut().push(
        HistoryBuilder::default()
            .created(now)
            .created_by("ocibundle repack")
            .build()?,
    );

    let (config_digest, config_size) = dir.put_blob_json(&config)?;
    let config_desc = DescriptorBuilder::default()
        .media_type(MediaType::ImageConfig)
        .digest(config_digest.to_string())
        .size(config_size as i64)
        .build()?;
    manifest.set_config(config_desc);
    manifest.layers_mut().push(layer.descriptor.clone());

    let (new_digest, new_size) = dir.put_blob_json(&manifest)?;
    let manifest_desc = DescriptorBuilder::default()
        .media_type(MediaType::ImageManifest)
        .digest(new_digest.to_string())
        .size(new_size as i64)
        .build()?;

    if let Some(tag) = tag {
        match dir.delete_reference(tag) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        dir.put_reference(tag, &manifest_desc)?;
    }
    Ok(manifest_desc)
}
