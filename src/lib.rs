//! Create, unpack, and repack OCI container images without a container
//! runtime.
//!
//! An image repository is a directory in the
//! [OCI Image Layout](https://github.com/opencontainers/image-spec/blob/v1.0.1/image-layout.md)
//! form, extended with named references under `refs/`. [unpack::unpack]
//! turns an image into a runtime bundle (a rootfs plus `config.json`),
//! and [repack::repack] folds the bundle's changes back into the image
//! as a new `tar+gzip` layer, keeping the manifest's layer list and the
//! config's diff-id list in lockstep.

pub mod config_edit;
pub mod error;
pub mod idmap;
pub mod image_dir;
pub mod layer;
pub mod mtree;
pub mod repack;
pub mod unpack;

mod digest;
mod reference;

pub use digest::{Digest, DigestBuf, DigestReader};
pub use image_dir::{create_image, Blob, ImageDir};
pub use reference::RefName;
