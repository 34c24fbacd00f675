//! Translation between host and container uid/gid namespaces

use nix::unistd::{getegid, geteuid};

use crate::error::{Error, Result};

/// A single `container:host:length` interval mapping, as used by
/// `user_namespaces(7)` style id maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMapping {
    pub container_id: u32,
    pub host_id: u32,
    pub size: u32,
}

impl IdMapping {
    /// Parse a `container:host:length` triple, e.g. `0:1000:1`.
    pub fn parse(input: &str) -> Result<Self> {
        let parts: Vec<&str> = input.split(':').collect();
        let &[container, host, size] = parts.as_slice() else {
            return Err(Error::MalformedMapping(input.to_string()));
        };
        let parse = |s: &str| {
            s.parse::<u32>()
                .map_err(|_| Error::MalformedMapping(input.to_string()))
        };
        let mapping = IdMapping {
            container_id: parse(container)?,
            host_id: parse(host)?,
            size: parse(size)?,
        };
        if mapping.size == 0 {
            return Err(Error::MalformedMapping(input.to_string()));
        }
        Ok(mapping)
    }
}

/// Map a host-namespace id to the container namespace. Ids outside
/// every interval pass through unchanged.
pub fn to_container(id: u32, mappings: &[IdMapping]) -> u32 {
    for m in mappings {
        if id >= m.host_id && id - m.host_id < m.size {
            return m.container_id + (id - m.host_id);
        }
    }
    id
}

/// Map a container-namespace id back to the host namespace.
pub fn to_host(id: u32, mappings: &[IdMapping]) -> u32 {
    for m in mappings {
        if id >= m.container_id && id - m.container_id < m.size {
            return m.host_id + (id - m.container_id);
        }
    }
    id
}

/// How uids and gids are rewritten when moving between tar headers and
/// the on-disk rootfs.
#[derive(Debug, Clone, Default)]
pub struct MapOptions {
    pub rootless: bool,
    pub uid_mappings: Vec<IdMapping>,
    pub gid_mappings: Vec<IdMapping>,
}

impl MapOptions {
    /// Build map options from parsed mappings. In rootless mode with no
    /// explicit maps, the effective uid/gid are the only mappable ids,
    /// so `euid:0:1` and `egid:0:1` are synthesized.
    pub fn new(rootless: bool, uid_mappings: Vec<IdMapping>, gid_mappings: Vec<IdMapping>) -> Self {
        let mut opts = MapOptions {
            rootless,
            uid_mappings,
            gid_mappings,
        };
        if rootless {
            if opts.uid_mappings.is_empty() {
                opts.uid_mappings.push(IdMapping {
                    container_id: geteuid().as_raw(),
                    host_id: 0,
                    size: 1,
                });
            }
            if opts.gid_mappings.is_empty() {
                opts.gid_mappings.push(IdMapping {
                    container_id: getegid().as_raw(),
                    host_id: 0,
                    size: 1,
                });
            }
        }
        opts
    }
}
