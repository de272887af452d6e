//! Resolves where, and in which representation, an image is saved.

use std::{
    path::{Path, PathBuf},
    str::FromStr,
    sync::LazyLock,
};

use color_eyre::{
    eyre::{bail, eyre, Context},
    Result, Section, SectionExt,
};
use itertools::Itertools;
use regex::Regex;
use strum::{AsRefStr, EnumIter, IntoEnumIterator};
use tracing::debug;

use crate::{save::SaveError, Reference};

/// The representation an image is saved as.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, AsRefStr, EnumIter)]
pub enum Format {
    /// A single tarball in the format `docker save` produces.
    /// This is the default when no format is requested.
    #[default]
    #[strum(serialize = "docker-archive")]
    DockerArchive,

    /// A single tarball holding an OCI image layout.
    #[strum(serialize = "oci-archive")]
    OciArchive,

    /// A directory of loose blobs with an OCI image manifest.
    #[strum(serialize = "oci-dir")]
    OciDir,

    /// A directory of loose blobs with a Docker v2 schema 2 manifest.
    #[strum(serialize = "docker-dir")]
    DockerDir,
}

impl Format {
    /// Whether the format writes a directory rather than a single file.
    pub fn is_directory(self) -> bool {
        matches!(self, Format::OciDir | Format::DockerDir)
    }
}

impl FromStr for Format {
    type Err = SaveError;

    /// Parse a format selector; the empty string selects the default format.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(Format::default());
        }
        Format::iter()
            .find(|format| format.as_ref() == s)
            .ok_or_else(|| SaveError::UnknownFormat {
                format: s.to_string(),
            })
    }
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

/// The manifest format written to directory destinations.
#[derive(Debug, Copy, Clone, PartialEq, Eq, AsRefStr, EnumIter)]
pub enum ManifestType {
    /// OCI image manifest.
    #[strum(serialize = "application/vnd.oci.image.manifest.v1+json")]
    Oci,

    /// Docker v2 schema 2 manifest.
    #[strum(serialize = "application/vnd.docker.distribution.manifest.v2+json")]
    DockerV2Schema2,
}

impl ManifestType {
    /// The media type of the image config referenced by a manifest of this type.
    pub fn config_media_type(self) -> &'static str {
        match self {
            ManifestType::Oci => "application/vnd.oci.image.config.v1+json",
            ManifestType::DockerV2Schema2 => "application/vnd.docker.container.image.v1+json",
        }
    }
}

impl std::fmt::Display for ManifestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

impl FromStr for ManifestType {
    type Err = color_eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ManifestType::iter()
            .find(|kind| kind.as_ref() == s)
            .ok_or_else(|| eyre!("unsupported manifest type: {s}"))
    }
}

/// A concrete place an image is written to.
///
/// Directories never carry a name: only archives embed names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// A docker-archive tarball, optionally naming the image inside it.
    DockerArchive {
        /// The tarball path.
        path: PathBuf,

        /// The name recorded for the image in the tarball.
        tag: Option<Reference>,
    },

    /// An OCI archive tarball, optionally naming the image inside it.
    OciArchive {
        /// The tarball path.
        path: PathBuf,

        /// The `org.opencontainers.image.ref.name` recorded for the image.
        name: Option<String>,
    },

    /// A directory of loose blobs.
    Directory {
        /// The directory path.
        path: PathBuf,

        /// The manifest format written into the directory.
        manifest_type: ManifestType,
    },
}

static OCI_REF_NAME: LazyLock<Regex> = LazyLock::new(|| {
    let component = r"[A-Za-z0-9]+(?:(?:[-._:@+]|--)[A-Za-z0-9]+)*";
    Regex::new(&format!(r"^{component}(?:/{component})*$")).expect("oci ref name regex")
});

impl Destination {
    /// Build the destination for the requested format.
    ///
    /// `name` is the name to embed (see [`crate::naming::destination_name`]);
    /// it is ignored for directory formats and omitted from archives when empty.
    #[tracing::instrument]
    pub fn resolve(format: Format, output: &str, name: &str) -> Result<Self> {
        let destination = match format {
            Format::DockerArchive => {
                let spec = if name.is_empty() {
                    output.to_string()
                } else {
                    format!("{output}:{name}")
                };
                Self::docker_archive(&spec).wrap_err_with(|| SaveError::ReferenceConstruction {
                    format,
                    destination: spec.clone(),
                })
            }
            Format::OciArchive => Self::oci_archive(output, name).wrap_err_with(|| {
                SaveError::ReferenceConstruction {
                    format,
                    destination: format!("({output:?}, {name:?})"),
                }
            }),
            Format::OciDir => Self::directory(output, ManifestType::Oci).wrap_err_with(|| {
                SaveError::ReferenceConstruction {
                    format,
                    destination: output.to_string(),
                }
            }),
            Format::DockerDir => Self::directory(output, ManifestType::DockerV2Schema2)
                .wrap_err_with(|| SaveError::ReferenceConstruction {
                    format,
                    destination: output.to_string(),
                }),
        }?;

        debug!(?destination, "resolved destination");
        Ok(destination)
    }

    /// Parse a docker-archive destination in the form `path[:name]`.
    ///
    /// The name must be a tag reference; untagged names are tagged `latest`.
    pub fn docker_archive(spec: &str) -> Result<Self> {
        let (path, name) = match spec.split_once(':') {
            Some((path, name)) => (path, Some(name)),
            None => (spec, None),
        };
        if path.is_empty() {
            bail!("docker-archive reference {spec:?} does not name a path");
        }

        let tag = match name {
            None => None,
            Some(name) => {
                let reference = Reference::from_str(name).context("parse archive name")?;
                if reference.digest.is_some() {
                    return Err(eyre!("docker-archive doesn't support digest references"))
                        .with_section(|| name.to_string().header("Name:"));
                }
                Some(reference.into_tagged()?)
            }
        };

        Ok(Destination::DockerArchive {
            path: PathBuf::from(path),
            tag,
        })
    }

    /// Build an OCI archive destination; an empty name embeds no name.
    pub fn oci_archive(path: &str, name: &str) -> Result<Self> {
        if path.is_empty() {
            bail!("oci-archive destination does not name a path");
        }
        if path.contains(':') {
            return Err(eyre!("invalid OCI reference: path contains a colon"))
                .with_section(|| path.to_string().header("Path:"));
        }
        if !name.is_empty() && !OCI_REF_NAME.is_match(name) {
            return Err(eyre!("invalid image name for an OCI archive"))
                .with_section(|| name.to_string().header("Name:"))
                .with_section(|| {
                    "component ('/' component)*, components of alphanumerics joined by [-._:@+] or '--'"
                        .to_string()
                        .header("Expected:")
                });
        }

        Ok(Destination::OciArchive {
            path: PathBuf::from(path),
            name: (!name.is_empty()).then(|| name.to_string()),
        })
    }

    /// Build a directory destination writing the given manifest type.
    pub fn directory(path: &str, manifest_type: ManifestType) -> Result<Self> {
        if path.is_empty() {
            bail!("directory destination does not name a path");
        }
        let path = std::path::absolute(path)
            .with_context(|| format!("resolve directory path {path:?}"))?;

        Ok(Destination::Directory {
            path,
            manifest_type,
        })
    }

    /// The path written by this destination.
    pub fn path(&self) -> &Path {
        match self {
            Destination::DockerArchive { path, .. }
            | Destination::OciArchive { path, .. }
            | Destination::Directory { path, .. } => path,
        }
    }

    /// The manifest type marker; only directories specify one.
    pub fn manifest_type(&self) -> Option<ManifestType> {
        match self {
            Destination::Directory { manifest_type, .. } => Some(*manifest_type),
            Destination::DockerArchive { .. } | Destination::OciArchive { .. } => None,
        }
    }

    /// All format names accepted on the command line, for help and error output.
    pub fn format_names() -> String {
        Format::iter().map(|format| format.to_string()).join(", ")
    }
}
