//! Onion package codec
//!
//! Containers are uncompressed tar archives built with deterministic
//! headers and sorted member order. Every layer is verified by hashing the
//! whole container file, never by per-member digests.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tar::{Archive, Builder, HeaderMode};
use tracing::{debug, warn};

use crate::crypto::digest_file;
use crate::types::Digest;
use crate::{Error, Result};

/// Innermost content container (original payload + timestamp0)
pub const PACKAGE0: &str = "Package0.tar";
/// Innermost complete evidence unit
pub const PACKAGE1: &str = "Package1.tar";
/// Prefix shared by every container name
pub const PACKAGE_PREFIX: &str = "Package";
/// Prefix of renewal containers, followed by the layer number
pub const RENEWAL_PREFIX: &str = "PackageF";

pub const TIMESTAMP0: &str = "timestamp0";
pub const TIMESTAMP1: &str = "timestamp1";
/// Timestamp member of a renewal layer
pub const RENEWAL_TIMESTAMP: &str = "timestamp";
pub const SIGNATURE: &str = "signature.sig";

pub const CERTIFICATE_DIR: &str = "certificate_files";
pub const SIGNING_CERT: &str = "signing_cert.pem";
pub const SIGNING_CRL: &str = "signing_cert_crl.crl";
pub const TSA_CERT: &str = "tsa_cert.crt";
pub const TSA_CA: &str = "tsa_ca.pem";
pub const TSA_CRL: &str = "tsa_cert_crl.crl";

/// Role of a container, derived from its file name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerLayer {
    /// `Package0.tar`
    Content,
    /// `Package1.tar`
    Initial,
    /// `PackageF{n}.tar`
    Renewal(u32),
}

impl ContainerLayer {
    pub fn classify(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::WrongPathToArchivedFile(format!("{:?}", path)))?;

        if name == PACKAGE0 {
            return Ok(ContainerLayer::Content);
        }
        if name == PACKAGE1 {
            return Ok(ContainerLayer::Initial);
        }
        name.strip_prefix(RENEWAL_PREFIX)
            .and_then(|rest| rest.strip_suffix(".tar"))
            .and_then(|n| n.parse::<u32>().ok())
            .filter(|n| *n > 0)
            .map(ContainerLayer::Renewal)
            .ok_or_else(|| Error::WrongPathToArchivedFile(name.to_string()))
    }

    pub fn file_name(&self) -> String {
        match self {
            ContainerLayer::Content => PACKAGE0.to_string(),
            ContainerLayer::Initial => PACKAGE1.to_string(),
            ContainerLayer::Renewal(n) => format!("{}{}.tar", RENEWAL_PREFIX, n),
        }
    }
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort();
    Ok(entries)
}

fn append_tree<W: std::io::Write>(
    builder: &mut Builder<W>,
    path: &Path,
    name: &Path,
) -> Result<()> {
    if path.is_dir() {
        builder.append_dir(name, path)?;
        for child in sorted_entries(path)? {
            if let Some(child_name) = child.file_name() {
                append_tree(builder, &child, &name.join(child_name))?;
            }
        }
    } else {
        builder.append_path_with_name(path, name)?;
    }
    Ok(())
}

/// Archive every entry of `source_dir` into `container_path`, then remove
/// the archived entries from `source_dir`
pub fn build_container(source_dir: &Path, container_path: &Path) -> Result<()> {
    let container_name = container_path.file_name().map(|n| n.to_os_string());
    let in_source = container_path.parent() == Some(source_dir);

    let members: Vec<PathBuf> = sorted_entries(source_dir)?
        .into_iter()
        .filter(|p| !(in_source && p.file_name().map(|n| n.to_os_string()) == container_name))
        .collect();

    let file = File::create(container_path)?;
    let mut builder = Builder::new(file);
    builder.mode(HeaderMode::Deterministic);
    for member in &members {
        let name = member
            .file_name()
            .ok_or_else(|| Error::MalformedData(format!("unnamed entry {:?}", member)))?;
        append_tree(&mut builder, member, Path::new(name))?;
    }
    let file = builder.into_inner()?;
    file.sync_all()?;

    for member in &members {
        if member.is_dir() {
            fs::remove_dir_all(member)?;
        } else {
            fs::remove_file(member)?;
        }
    }

    debug!(
        "Built container {:?} with {} members",
        container_path,
        members.len()
    );
    Ok(())
}

/// Digest of a container file as a single opaque blob
pub fn container_digest(container_path: &Path) -> Result<Digest> {
    digest_file(container_path)
}

/// Build `name` inside `dir` from the rest of `dir` and return its path and digest
pub fn seal(dir: &Path, layer: ContainerLayer) -> Result<(PathBuf, Digest)> {
    let path = dir.join(layer.file_name());
    build_container(dir, &path)?;
    let digest = container_digest(&path)?;
    Ok((path, digest))
}

/// Unpack a container into `dest_dir`, leaving the container untouched
pub fn extract(container_path: &Path, dest_dir: &Path) -> Result<()> {
    fs::create_dir_all(dest_dir)?;
    let file = File::open(container_path)?;
    let mut archive = Archive::new(file);
    archive.set_overwrite(false);
    archive.unpack(dest_dir).map_err(|e| {
        warn!("Failed to unpack {:?}: {}", container_path, e);
        Error::MalformedData(format!("cannot unpack {:?}: {}", container_path, e))
    })?;
    Ok(())
}

/// Locate the single entry of `dir` whose name starts with `prefix`
pub fn find_member(dir: &Path, prefix: &str) -> Result<PathBuf> {
    let matches: Vec<PathBuf> = sorted_entries(dir)?
        .into_iter()
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |n| n.starts_with(prefix))
        })
        .collect();

    match matches.len() {
        1 => Ok(matches.into_iter().next().unwrap_or_default()),
        0 => Err(Error::FileNotInDirectory(format!(
            "no entry starting with {:?} in {:?}",
            prefix, dir
        ))),
        n => Err(Error::FileNotInDirectory(format!(
            "{} entries starting with {:?} in {:?}",
            n, prefix, dir
        ))),
    }
}

/// Path of an exactly named member, failing if it is absent
pub fn require_member(dir: &Path, name: &str) -> Result<PathBuf> {
    let path = dir.join(name);
    if path.exists() {
        Ok(path)
    } else {
        Err(Error::FileNotInDirectory(format!("{} missing in {:?}", name, dir)))
    }
}
