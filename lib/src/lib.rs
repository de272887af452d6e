//! Core library for `satchel`, a tool for saving locally stored container images
//! to docker archives, OCI archives, and directories.

use bon::Builder;
use color_eyre::{
    eyre::{self, bail, eyre, Context},
    Result, Section, SectionExt,
};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};
use std::{str::FromStr, sync::LazyLock};
use strum::{AsRefStr, EnumIter, IntoEnumIterator};

mod cio;
pub mod destination;
mod export;
mod ext;
pub mod image;
pub mod layout;
pub mod naming;
pub mod push;
pub mod save;
pub mod tags;
mod transform;

pub use destination::{Destination, Format, ManifestType};
pub use image::{Image, ImageNotFound, ImageStore, DEFAULT_LOCAL_REGISTRY};
pub use layout::LayoutStore;
pub use push::{Progress, PushOptions, Pusher, RegistryOptions, SigningOptions};
pub use save::{save, SaveError, SaveRequest, STDOUT};

/// A content-addressable digest in the format `algorithm:hash`.
///
/// The `FromStr` implementation parses the format used in OCI containers by default,
/// which is `algorithm:hex`.
///
/// ```
/// # use std::str::FromStr;
/// let digest = satchel_lib::Digest::from_str("sha256:a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4").expect("parse digest");
/// assert_eq!(digest.algorithm, "sha256");
/// assert_eq!(digest.as_hex(), "a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    /// The hashing algorithm used (e.g. "sha256")
    pub algorithm: String,

    /// The raw hash bytes
    pub hash: Vec<u8>,
}

impl Digest {
    /// The SHA256 algorithm
    pub const SHA256: &'static str = "sha256";

    /// Shortest hex string accepted for any algorithm.
    const MIN_HEX_LEN: usize = 32;

    /// Returns the hash as a hex string
    pub fn as_hex(&self) -> String {
        hex::encode(&self.hash)
    }

    /// Create a SHA256 digest from an already computed hash.
    pub fn from_hash(hash: Vec<u8>) -> Self {
        Self {
            algorithm: Self::SHA256.to_string(),
            hash,
        }
    }

    /// Compute the SHA256 digest of the content.
    pub fn sha256(content: &[u8]) -> Self {
        Self::from_hash(Sha256::digest(content).to_vec())
    }
}

static DIGEST_ALGORITHM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9]*(?:[-_+.][A-Za-z][A-Za-z0-9]*)*$").expect("digest algorithm regex")
});

impl FromStr for Digest {
    type Err = color_eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let input_section = || s.to_string().header("Input:");
        let (algorithm, hex) = s.split_once(':').ok_or_else(|| {
            eyre!("invalid digest format: missing algorithm separator ':'")
                .with_section(input_section)
        })?;

        if algorithm.is_empty() {
            bail!("algorithm cannot be empty");
        }
        if hex.is_empty() {
            bail!("hex cannot be empty");
        }
        if !DIGEST_ALGORITHM.is_match(algorithm) {
            return Err(eyre!("invalid digest algorithm").with_section(input_section));
        }
        if hex.len() < Self::MIN_HEX_LEN {
            return Err(eyre!("digest hex is too short").with_section(input_section));
        }
        if algorithm == Self::SHA256 && hex.len() != 64 {
            return Err(eyre!("sha256 digests must be 64 hex characters").with_section(input_section));
        }

        Ok(Self {
            algorithm: algorithm.to_string(),
            hash: hex::decode(hex).map_err(|e| eyre!("invalid hex string: {e}"))?,
        })
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.as_hex())
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Digest::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// A parsed container image reference, normalized the way Docker normalizes references.
///
/// ```
/// # use satchel_lib::Reference;
/// # use std::str::FromStr;
/// // Bare names are qualified with the default registry.
/// let reference = Reference::from_str("ubuntu").expect("parse reference");
/// assert_eq!(reference.host, "docker.io");
/// assert_eq!(reference.repository, "library/ubuntu");
/// assert_eq!(reference.tag, None);
///
/// // Parse a tag
/// let reference = Reference::from_str("localhost/foo:v1").expect("parse reference");
/// assert_eq!(reference.host, "localhost");
/// assert_eq!(reference.repository, "foo");
/// assert_eq!(reference.tag.as_deref(), Some("v1"));
/// assert_eq!(reference.familiar(), "localhost/foo:v1");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Builder)]
pub struct Reference {
    /// Registry host (e.g. "docker.io", "localhost", "quay.io:5000")
    #[builder(into)]
    pub host: String,

    /// Repository name including namespace (e.g. "library/ubuntu", "username/project")
    #[builder(into)]
    pub repository: String,

    /// Tag, if one was provided.
    #[builder(into)]
    pub tag: Option<String>,

    /// Digest, if one was provided.
    pub digest: Option<Digest>,
}

impl Reference {
    /// Registry used for references that do not name a host.
    pub const DEFAULT_HOST: &'static str = "docker.io";

    /// Namespace used for single component repositories on the default registry.
    pub const DEFAULT_NAMESPACE: &'static str = "library";

    /// Tag applied to references that name neither a tag nor a digest.
    pub const DEFAULT_TAG: &'static str = "latest";

    /// Longest allowed `host/repository` string.
    pub const NAME_MAX_LEN: usize = 255;

    /// The fully qualified name of the reference, without tag or digest.
    pub fn name(&self) -> String {
        format!("{}/{}", self.host, self.repository)
    }

    /// Whether this reference carries a tag.
    pub fn is_tagged(&self) -> bool {
        self.tag.is_some()
    }

    /// Ensure the reference names a tag.
    ///
    /// References with neither tag nor digest are tagged `latest`.
    /// References that only carry a digest cannot be turned into a tag and are rejected.
    pub fn into_tagged(self) -> Result<Self> {
        if self.tag.is_some() {
            return Ok(self);
        }
        if self.digest.is_some() {
            return Err(eyre!("not a tagged reference"))
                .with_section(|| self.to_string().header("Reference:"));
        }
        Ok(Self {
            tag: Some(Self::DEFAULT_TAG.to_string()),
            ..self
        })
    }

    /// Render the reference in the short form Docker shows users,
    /// e.g. `docker.io/library/ubuntu:latest` becomes `ubuntu:latest`.
    pub fn familiar(&self) -> String {
        let name = if self.host == Self::DEFAULT_HOST {
            match self.repository.strip_prefix("library/") {
                Some(short) if !short.contains('/') => short.to_string(),
                _ => self.repository.clone(),
            }
        } else {
            self.name()
        };

        let mut rendered = name;
        if let Some(tag) = &self.tag {
            rendered.push(':');
            rendered.push_str(tag);
        }
        if let Some(digest) = &self.digest {
            rendered.push('@');
            rendered.push_str(&digest.to_string());
        }
        rendered
    }
}

static DOMAIN: LazyLock<Regex> = LazyLock::new(|| {
    let label = r"(?:[a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9-]*[a-zA-Z0-9])";
    Regex::new(&format!(r"^{label}(?:\.{label})*(?::[0-9]+)?$")).expect("domain regex")
});

static REPOSITORY: LazyLock<Regex> = LazyLock::new(|| {
    let component = r"[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*";
    Regex::new(&format!(r"^{component}(?:/{component})*$")).expect("repository regex")
});

static TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}$").expect("tag regex"));

static IMAGE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-f0-9]{64}$").expect("image id regex"));

impl FromStr for Reference {
    type Err = eyre::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let input_section = || s.to_string().header("Input:");
        let expected_section = || {
            "[{host}/]{repository}[:{tag}][@{digest}]"
                .to_string()
                .header("Expected:")
        };

        if s.is_empty() {
            return Err(eyre!("reference cannot be empty")).with_section(expected_section);
        }

        // Check for '@' first since digests also contain ':'.
        let (remainder, digest) = match s.split_once('@') {
            Some((remainder, digest)) => {
                let digest = Digest::from_str(digest)
                    .context("parse digest")
                    .with_section(input_section)?;
                (remainder, Some(digest))
            }
            None => (s, None),
        };

        // A ':' after the last '/' separates the tag; earlier ones belong to a host port.
        let (name, tag) = match remainder.rfind(':') {
            Some(idx) if !remainder[idx..].contains('/') => {
                (&remainder[..idx], Some(&remainder[idx + 1..]))
            }
            _ => (remainder, None),
        };

        if let Some(tag) = tag {
            if !TAG.is_match(tag) {
                return Err(eyre!("invalid tag format"))
                    .with_section(input_section)
                    .with_section(|| tag.to_string().header("Tag:"));
            }
        }
        if name.is_empty() {
            return Err(eyre!("repository cannot be empty")).with_section(input_section);
        }
        if name.len() > Self::NAME_MAX_LEN {
            return Err(eyre!(
                "repository name must not be more than {} characters",
                Self::NAME_MAX_LEN
            ))
            .with_section(input_section);
        }

        // Docker considers the first component a host if it looks like one:
        // it contains a '.' or ':', it is 'localhost', or it has uppercase characters.
        let (host, repository) = match name.split_once('/') {
            Some((first, rest))
                if first.contains(['.', ':'])
                    || first == "localhost"
                    || first.chars().any(|c| c.is_ascii_uppercase()) =>
            {
                (first.to_string(), rest.to_string())
            }
            _ => {
                if tag.is_none() && digest.is_none() && IMAGE_ID.is_match(name) {
                    return Err(eyre!(
                        "invalid repository name, cannot specify 64-byte hexadecimal strings"
                    ))
                    .with_section(input_section);
                }
                (Self::DEFAULT_HOST.to_string(), name.to_string())
            }
        };

        let host = match host.as_str() {
            "index.docker.io" => Self::DEFAULT_HOST.to_string(),
            _ => host,
        };
        let repository = if host == Self::DEFAULT_HOST && !repository.contains('/') {
            format!("{}/{repository}", Self::DEFAULT_NAMESPACE)
        } else {
            repository
        };

        if host.is_empty() || !DOMAIN.is_match(&host) {
            return Err(eyre!("invalid registry host"))
                .with_section(input_section)
                .with_section(|| host.clone().header("Host:"));
        }
        if repository.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(eyre!("repository name must be lowercase")).with_section(input_section);
        }
        if !REPOSITORY.is_match(&repository) {
            return Err(eyre!("invalid reference format"))
                .with_section(input_section)
                .with_section(expected_section);
        }

        Ok(Reference {
            host,
            repository,
            tag: tag.map(String::from),
            digest,
        })
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.host, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

/// Media types for container image layers.
///
/// Each entry in this enum is a unique media type "base"; some of them then can have flags applied.
/// For example, even though `Foreign` is a valid [`LayerMediaTypeFlag`], [`LayerMediaType::DockerForeign`]
/// is distinct from [`LayerMediaType::Docker`] because it is an entirely different media type.
///
/// Spec reference: https://github.com/opencontainers/image-spec/blob/main/media-types.md
#[derive(Debug, Clone, PartialEq, Eq, AsRefStr, EnumIter)]
pub enum LayerMediaType {
    /// A standard Docker container layer in gzipped tar format.
    #[strum(serialize = "application/vnd.docker.image.rootfs.diff.tar.gzip")]
    Docker,

    /// A Docker container layer in plain tar format.
    #[strum(serialize = "application/vnd.docker.image.rootfs.diff.tar")]
    DockerUncompressed,

    /// A Docker container layer whose content is distributed out of band.
    #[strum(serialize = "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip")]
    DockerForeign,

    /// A standard OCI container layer.
    #[strum(serialize = "application/vnd.oci.image.layer.v1.tar")]
    Oci(Vec<LayerMediaTypeFlag>),

    /// An OCI container layer that has restrictions on distribution.
    ///
    /// These are officially marked deprecated in the OCI spec, along with the directive
    /// that clients should handle the layers as usual:
    /// https://github.com/opencontainers/image-spec/blob/main/layer.md#non-distributable-layers
    #[strum(serialize = "application/vnd.oci.image.layer.nondistributable.v1.tar")]
    OciNonDistributable(Vec<LayerMediaTypeFlag>),
}

impl LayerMediaType {
    /// Overwrite the flags for the media type.
    fn replace_flags(self, flags: Vec<LayerMediaTypeFlag>) -> Self {
        match self {
            LayerMediaType::Oci(_) => LayerMediaType::Oci(flags),
            LayerMediaType::OciNonDistributable(_) => LayerMediaType::OciNonDistributable(flags),
            LayerMediaType::Docker
            | LayerMediaType::DockerUncompressed
            | LayerMediaType::DockerForeign => self,
        }
    }

    /// Whether the layer content is compressed.
    pub fn is_compressed(&self) -> bool {
        match self {
            LayerMediaType::Docker | LayerMediaType::DockerForeign => true,
            LayerMediaType::DockerUncompressed => false,
            LayerMediaType::Oci(flags) | LayerMediaType::OciNonDistributable(flags) => flags
                .iter()
                .any(|flag| matches!(flag, LayerMediaTypeFlag::Gzip | LayerMediaTypeFlag::Zstd)),
        }
    }

    /// The media type describing this layer after its content is gzip compressed.
    /// Already compressed media types are returned unchanged.
    pub fn gzipped(self) -> Self {
        if self.is_compressed() {
            return self;
        }
        match self {
            LayerMediaType::DockerUncompressed => LayerMediaType::Docker,
            LayerMediaType::Oci(ref flags) | LayerMediaType::OciNonDistributable(ref flags) => {
                let mut flags = flags.clone();
                flags.push(LayerMediaTypeFlag::Gzip);
                self.replace_flags(flags)
            }
            other => other,
        }
    }

    /// The equivalent OCI media type.
    pub fn to_oci(&self) -> Self {
        match self {
            LayerMediaType::Docker => LayerMediaType::Oci(vec![LayerMediaTypeFlag::Gzip]),
            LayerMediaType::DockerUncompressed => LayerMediaType::Oci(vec![]),
            LayerMediaType::DockerForeign => {
                LayerMediaType::OciNonDistributable(vec![LayerMediaTypeFlag::Gzip])
            }
            LayerMediaType::Oci(_) | LayerMediaType::OciNonDistributable(_) => self.clone(),
        }
    }

    /// The equivalent Docker v2 schema 2 media type.
    ///
    /// Docker media types have no zstd variant, so zstd layers cannot be converted.
    pub fn to_docker(&self) -> Result<Self> {
        use LayerMediaTypeFlag::*;
        match self {
            LayerMediaType::Docker
            | LayerMediaType::DockerUncompressed
            | LayerMediaType::DockerForeign => Ok(self.clone()),
            LayerMediaType::Oci(flags) => match flags.as_slice() {
                [] | [Foreign] => Ok(LayerMediaType::DockerUncompressed),
                [Gzip] | [Foreign, Gzip] => Ok(LayerMediaType::Docker),
                _ => Err(eyre!("layer media type has no Docker v2 schema 2 equivalent"))
                    .with_section(|| self.to_string().header("Media type:")),
            },
            LayerMediaType::OciNonDistributable(flags) => match flags.as_slice() {
                [Gzip] | [Foreign, Gzip] => Ok(LayerMediaType::DockerForeign),
                _ => Err(eyre!("layer media type has no Docker v2 schema 2 equivalent"))
                    .with_section(|| self.to_string().header("Media type:")),
            },
        }
    }
}

impl FromStr for LayerMediaType {
    type Err = eyre::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (base, flags) = s.split_once('+').unwrap_or((s, ""));
        for media_type in LayerMediaType::iter() {
            // Docker media types don't have flags, so they must match in full.
            if s == media_type.as_ref() {
                return Ok(media_type);
            }

            if base == media_type.as_ref() {
                if let mt @ (LayerMediaType::Oci(_) | LayerMediaType::OciNonDistributable(_)) =
                    media_type
                {
                    return flags
                        .split('+')
                        .map(LayerMediaTypeFlag::from_str)
                        .collect::<Result<Vec<_>>>()
                        .map(|flags| mt.replace_flags(flags));
                }
            }
        }
        bail!("unknown media type: {s}");
    }
}

impl std::fmt::Display for LayerMediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_ref())?;
        if let LayerMediaType::Oci(flags) | LayerMediaType::OciNonDistributable(flags) = self {
            for flag in flags {
                write!(f, "+{}", flag.as_ref())?;
            }
        }
        Ok(())
    }
}

/// Flags for layer media types.
///
/// The flags are rendered in the order they are stored,
/// so `Oci(vec![Foreign, Gzip])` is `application/vnd.oci.image.layer.v1.tar+foreign+gzip`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, AsRefStr, EnumIter)]
pub enum LayerMediaTypeFlag {
    /// Foreign layers are distributed out of band.
    #[strum(serialize = "foreign")]
    Foreign,

    /// The layer is compressed with zstd.
    #[strum(serialize = "zstd")]
    Zstd,

    /// The layer is compressed with gzip.
    #[strum(serialize = "gzip")]
    Gzip,
}

impl FromStr for LayerMediaTypeFlag {
    type Err = eyre::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::iter()
            .find(|flag| flag.as_ref() == s)
            .ok_or_else(|| eyre!("unknown flag: {s}"))
    }
}
