//! A local image store backed by an OCI image layout directory.
//!
//! Reference: https://github.com/opencontainers/image-spec/blob/main/image-layout.md

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    str::FromStr,
};

use async_trait::async_trait;
use color_eyre::{
    eyre::{bail, eyre, Context},
    Result, Section, SectionExt,
};
use itertools::Itertools;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    ext::PriorityFind, Digest, Image, ImageNotFound, ImageStore, LayerMediaType, ManifestType,
    Reference, DEFAULT_LOCAL_REGISTRY,
};

/// Annotation containerd uses to record the full image name on an index entry.
pub const IMAGE_NAME_ANNOTATION: &str = "io.containerd.image.name";

/// Annotation the OCI image spec uses to name an index entry.
pub const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// Content of the `oci-layout` marker file.
pub const OCI_LAYOUT_VERSION: &str = "1.0.0";

/// Media type of an OCI image index.
pub const INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";

/// Describes a blob by its media type, digest, and size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced content.
    pub media_type: String,

    /// Digest of the referenced content.
    pub digest: Digest,

    /// Size in bytes of the referenced content.
    pub size: u64,

    /// Arbitrary metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Descriptor {
    /// The name recorded on this descriptor, if any.
    ///
    /// The containerd annotation holds a full reference and is preferred.
    pub fn name(&self) -> Option<&str> {
        self.annotations
            .get(IMAGE_NAME_ANNOTATION)
            .or_else(|| self.annotations.get(REF_NAME_ANNOTATION))
            .map(String::as_str)
    }

    /// A copy of the descriptor whose only annotation is the OCI ref name `name`.
    pub fn named(&self, name: impl Into<String>) -> Self {
        Self {
            annotations: BTreeMap::from([(REF_NAME_ANNOTATION.to_string(), name.into())]),
            ..self.clone()
        }
    }
}

/// The `index.json` at the root of an image layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Index {
    /// Always `2`.
    pub schema_version: u32,

    /// Media type of the index, if recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,

    /// Manifests reachable from the layout.
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
}

impl Index {
    /// An index listing the given manifests.
    pub fn new(manifests: Vec<Descriptor>) -> Self {
        Self {
            schema_version: 2,
            media_type: Some(INDEX_MEDIA_TYPE.to_string()),
            manifests,
        }
    }
}

/// An image manifest; the OCI and Docker v2 schema 2 formats share this shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Always `2`.
    pub schema_version: u32,

    /// Media type of the manifest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,

    /// The image config.
    pub config: Descriptor,

    /// Layers, ordered from the base of the image.
    pub layers: Vec<Descriptor>,

    /// Arbitrary metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Manifest {
    /// Rewrite the manifest and its descriptors as the given manifest type.
    ///
    /// Fails if a layer has no equivalent media type in the target format.
    pub fn convert(self, target: ManifestType) -> Result<Self> {
        let layers = self
            .layers
            .into_iter()
            .map(|layer| {
                let media_type = LayerMediaType::from_str(&layer.media_type)
                    .context("parse layer media type")
                    .with_section(|| layer.digest.to_string().header("Layer:"))?;
                let media_type = match target {
                    ManifestType::Oci => media_type.to_oci(),
                    ManifestType::DockerV2Schema2 => media_type.to_docker()?,
                };
                Ok(Descriptor {
                    media_type: media_type.to_string(),
                    ..layer
                })
            })
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("convert manifest to {target}"))?;

        Ok(Self {
            schema_version: 2,
            media_type: Some(target.to_string()),
            config: Descriptor {
                media_type: target.config_media_type().to_string(),
                ..self.config
            },
            layers,
            annotations: self.annotations,
        })
    }
}

/// One image entry in the `manifest.json` of a docker-archive tarball.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ArchiveManifestEntry {
    /// Path to the image config inside the tarball.
    pub config: String,

    /// Names the image is loaded as.
    #[serde(default)]
    pub repo_tags: Vec<String>,

    /// Paths to the layer tarballs inside the tarball, ordered from the base of the image.
    pub layers: Vec<String>,
}

/// How an image matched user input, best first.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
enum Match {
    /// The input is exactly one of the image's names.
    #[default]
    Name,

    /// The input is the image ID or a prefix of it.
    Id,

    /// The input matches a name once normalized (`foo` is `docker.io/library/foo:latest`).
    Normalized,

    /// The input matches a name once qualified with the local registry.
    Local,
}

/// An image store over an OCI image layout on disk.
///
/// ```no_run
/// # async fn run() -> color_eyre::Result<()> {
/// use satchel_lib::{ImageStore, LayoutStore};
///
/// let store = LayoutStore::builder().root("/var/lib/satchel/store").build().await?;
/// let image = store.lookup("alpine").await?;
/// println!("{}", image.id);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct LayoutStore {
    root: PathBuf,
    images: Vec<Image>,
}

#[bon::bon]
impl LayoutStore {
    /// Open the image layout at `root`, reading its index.
    #[builder]
    pub async fn new(
        /// The directory containing `oci-layout` and `index.json`.
        #[builder(into)]
        root: PathBuf,
    ) -> Result<Self> {
        let marker = root.join("oci-layout");
        let layout = tokio::fs::read_to_string(&marker)
            .await
            .context("read oci-layout marker")
            .with_section(|| root.display().to_string().header("Store:"))?;
        debug!(%layout, "opened image layout");

        let index = read_json::<Index>(&root.join("index.json"))
            .await
            .context("read layout index")
            .with_section(|| root.display().to_string().header("Store:"))?;

        let mut store = Self {
            root,
            images: Vec::new(),
        };
        store.images = store.images_from(&index).await?;
        debug!(count = store.images.len(), "indexed images");
        Ok(store)
    }
}

impl LayoutStore {
    /// The layout directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// All images in the store.
    pub fn images(&self) -> &[Image] {
        &self.images
    }

    /// The path of the blob with the given digest.
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root
            .join("blobs")
            .join(&digest.algorithm)
            .join(digest.as_hex())
    }

    /// Read the manifest with the given digest.
    pub async fn manifest(&self, digest: &Digest) -> Result<Manifest> {
        read_json(&self.blob_path(digest))
            .await
            .context("read manifest")
            .with_section(|| digest.to_string().header("Manifest:"))
    }

    /// Group index entries into images, one per manifest, keeping index order.
    async fn images_from(&self, index: &Index) -> Result<Vec<Image>> {
        let mut images = Vec::<Image>::new();
        for entry in &index.manifests {
            if entry.media_type != ManifestType::Oci.as_ref()
                && entry.media_type != ManifestType::DockerV2Schema2.as_ref()
            {
                warn!(media_type = %entry.media_type, digest = %entry.digest, "skip: not an image manifest");
                continue;
            }

            let position = match images.iter().position(|image| image.manifest == entry.digest) {
                Some(position) => position,
                None => {
                    let manifest = self.manifest(&entry.digest).await?;
                    images.push(Image {
                        id: manifest.config.digest.as_hex(),
                        names: Vec::new(),
                        manifest: entry.digest.clone(),
                    });
                    images.len() - 1
                }
            };

            let image = &mut images[position];
            if let Some(name) = entry.name() {
                if !image.names.iter().any(|known| known == name) {
                    image.names.push(name.to_string());
                }
            }
        }
        Ok(images)
    }

    /// How well the image matches the input, if at all.
    fn matches(image: &Image, input: &str, id: Option<&str>, normalized: &[String]) -> Option<Match> {
        if image.names.iter().any(|name| name == input) {
            return Some(Match::Name);
        }
        if id.is_some_and(|id| image.id.starts_with(id)) {
            return Some(Match::Id);
        }
        match normalized {
            [full, ..] if image.names.contains(full) => Some(Match::Normalized),
            [_, local] if image.names.contains(local) => Some(Match::Local),
            _ => None,
        }
    }
}

/// The hex portion of input that could be an image ID or ID prefix.
fn id_prefix(input: &str) -> Option<&str> {
    let hex = input.strip_prefix("sha256:").unwrap_or(input);
    let valid = !hex.is_empty() && hex.len() <= 64 && hex.chars().all(|c| c.is_ascii_hexdigit());
    valid.then_some(hex)
}

/// The stored names the input could refer to: its normalized form,
/// then its form qualified with the local registry.
fn normalized_names(input: &str) -> Vec<String> {
    let parse = |input: &str| {
        Reference::from_str(input)
            .and_then(Reference::into_tagged)
            .map(|reference| reference.to_string())
            .ok()
    };

    let Some(full) = parse(input) else {
        return Vec::new();
    };
    match parse(&format!("{DEFAULT_LOCAL_REGISTRY}/{input}")) {
        Some(local) => vec![full, local],
        None => vec![full],
    }
}

#[async_trait]
impl ImageStore for LayoutStore {
    #[tracing::instrument(skip(self))]
    async fn lookup(&self, input: &str) -> Result<Image> {
        let id = id_prefix(input);
        let normalized = normalized_names(input);
        let best = self
            .images
            .iter()
            .map(|image| (image, Self::matches(image, input, id, &normalized)))
            .priority_find(|(_, matched)| *matched)
            .and_then(|(image, matched)| matched.map(|matched| (image, matched)));

        let Some((image, matched)) = best else {
            return Err(ImageNotFound {
                input: input.to_string(),
            }
            .into());
        };

        if matched == Match::Id {
            let candidates = self
                .images
                .iter()
                .filter(|image| id.is_some_and(|id| image.id.starts_with(id)))
                .map(|image| image.id.as_str())
                .unique()
                .collect::<Vec<_>>();
            if candidates.len() > 1 {
                return Err(eyre!("image ID prefix {input:?} is ambiguous"))
                    .with_section(|| candidates.iter().join("\n").header("Candidates:"));
            }
        }

        debug!(?matched, id = %image.id, "matched image");
        Ok(image.clone())
    }

    fn shutdown(&mut self) {
        debug!(root = ?self.root, "closing image layout");
        self.images.clear();
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = tokio::fs::read(path)
        .await
        .with_context(|| format!("read {path:?}"))?;
    serde_json::from_slice(&content).with_context(|| format!("parse {path:?}"))
}

/// Fail unless the store holds the blob the descriptor refers to, with the described size.
pub(crate) async fn verify_blob(store: &LayoutStore, descriptor: &Descriptor) -> Result<PathBuf> {
    let path = store.blob_path(&descriptor.digest);
    let meta = tokio::fs::metadata(&path)
        .await
        .context("read blob metadata")
        .with_section(|| descriptor.digest.to_string().header("Blob:"))?;
    if meta.len() != descriptor.size {
        bail!(
            "blob {} is {} bytes, but its descriptor records {}",
            descriptor.digest,
            meta.len(),
            descriptor.size
        );
    }
    Ok(path)
}
