//! Rewriting an image configuration in place
//!
//! Produces a new config blob and a new manifest pointing at it; the
//! layer stack is untouched, so the layer/diff-id pairing survives any
//! sequence of edits.

use oci_spec::image::{Descriptor, DescriptorBuilder, MediaType};
use std::path::Path;

use crate::error::{Error, Result};
use crate::image_dir::{Blob, ImageDir};
use crate::reference::RefName;

/// Requested edits; unset fields keep their current value.
#[derive(Debug, Clone, Default)]
pub struct ConfigChanges {
    /// `uid[:gid]` the container process runs as
    pub user: Option<String>,
    /// Environment entries appended to the existing ones
    pub env: Vec<String>,
    pub working_dir: Option<String>,
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
}

impl ConfigChanges {
    pub fn is_empty(&self) -> bool {
        self.user.is_none()
            && self.env.is_empty()
            && self.working_dir.is_none()
            && self.entrypoint.is_none()
            && self.cmd.is_none()
    }
}

/// Apply `changes` to the config of the image named by `from`, binding
/// the resulting manifest to `tag` (or back to `from` when no tag is
/// given). Returns the new manifest's descriptor.
pub fn rewrite_config(
    image: &Path,
    from: &RefName,
    tag: Option<&RefName>,
    changes: &ConfigChanges,
) -> Result<Descriptor> {
    let dir = ImageDir::open(image)?;
    let descriptor = dir.get_reference(from)?;
    if descriptor.media_type() != &MediaType::ImageManifest {
        return Err(Error::UnsupportedMediaType(
            descriptor.media_type().to_string(),
        ));
    }
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

    let mut ctr = config.config().clone().unwrap_or_default();
    if let Some(user) = &changes.user {
        ctr.set_user(Some(user.clone()));
    }
    if !changes.env.is_empty() {
        let mut env = ctr.env().clone().unwrap_or_default();
        env.extend(changes.env.iter().cloned());
        ctr.set_env(Some(env));
    }
    if let Some(dir) = &changes.working_dir {
        ctr.set_working_dir(Some(dir.clone()));
    }
    if let Some(entrypoint) = &changes.entrypoint {
        ctr.set_entrypoint(Some(entrypoint.clone()));
    }
    if let Some(cmd) = &changes.cmd {
        ctr.set_cmd(Some(cmd.clone()));
    }
    config.set_config(Some(ctr));
    let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    config.set_created(Some(now));

    let (config_digest, config_size) = dir.put_blob_json(&config)?;
    manifest.set_config(
        DescriptorBuilder::default()
            .media_type(MediaType::ImageConfig)
            .digest(config_digest.to_string())
            .size(config_size as i64)
            .build()?,
    );
    let (new_digest, new_size) = dir.put_blob_json(&manifest)?;
    let manifest_desc = DescriptorBuilder::default()
        .media_type(MediaType::ImageManifest)
        .digest(new_digest.to_string())
        .size(new_size as i64)
        .build()?;

    let target = tag.unwrap_or(from);
    match dir.delete_reference(target) {
        Ok(()) => {}
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e),
    }
    dir.put_reference(target, &manifest_desc)?;
    Ok(manifest_desc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idmap::MapOptions;
    use crate::image_dir::create_image;
    use crate::unpack::unpack;
    use std::fs;

    #[test]
    fn user_change_flows_into_runtime_config() {
        let tmp = tempfile::tempdir().unwrap();
        let image = tmp.path().join("img");
        let bundle = tmp.path().join("bundle");
        let tag = RefName::new("latest").unwrap();
        create_image(&image, Some(&tag)).unwrap();

        rewrite_config(
            &image,
            &tag,
            Some(&tag),
            &ConfigChanges {
                user: Some("1234:1332".to_string()),
                ..Default::default()
            },
        )
        .unwrap();

        unpack(
            &image,
            &tag,
            &bundle,
            &MapOptions::new(true, Vec::new(), Vec::new()),
        )
        .unwrap();
        let spec: serde_json::Value =
            serde_json::from_slice(&fs::read(bundle.join("config.json")).unwrap()).unwrap();
        assert_eq!(spec["process"]["user"]["uid"], 1234);
        assert_eq!(spec["process"]["user"]["gid"], 1332);
        assert_eq!(
            spec["process"]["user"]["additionalGids"],
            serde_json::Value::Null
        );
        assert_eq!(fs::read_dir(bundle.join("rootfs")).unwrap().count(), 0);
    }

    #[test]
    fn layers_and_diff_ids_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        let image = tmp.path().join("img");
        let tag = RefName::new("latest").unwrap();
        create_image(&image, Some(&tag)).unwrap();

        rewrite_config(
            &image,
            &tag,
            Some(&tag),
            &ConfigChanges {
                env: vec!["A=1".to_string(), "B=2".to_string()],
                cmd: Some(vec!["/bin/sh".to_string()]),
                ..Default::default()
            },
        )
        .unwrap();

        let dir = ImageDir::open(&image).unwrap();
        let desc = dir.get_reference(&tag).unwrap();
        let Blob::Manifest(manifest) = dir.from_descriptor(&desc).unwrap() else {
            panic!("expected manifest");
        };
        let Blob::Config(config) = dir.from_descriptor(manifest.config()).unwrap() else {
            panic!("expected config");
        };
        assert!(manifest.layers().is_empty());
        assert!(config.rootfs().diff_ids().is_empty());
        let ctr = config.config().as_ref().unwrap();
        assert_eq!(ctr.env().as_ref().unwrap(), &vec!["A=1", "B=2"]);
        assert_eq!(ctr.cmd().as_ref().unwrap(), &vec!["/bin/sh"]);
    }
}
