//! Fixtures for satchel tests.
//!
//! Tests build small OCI image layouts on disk with [`Fixture`], point satchel at them
//! as its local image store, and inspect what it writes with [`read_tarball`].

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use bon::Builder;
use color_eyre::{Result, eyre::Context};
use futures_lite::StreamExt;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tokio_tar::{Archive, Header};

/// Media type of an uncompressed OCI layer.
pub const OCI_LAYER: &str = "application/vnd.oci.image.layer.v1.tar";

/// Media type of an OCI image manifest.
pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

/// Media type of an OCI image config.
pub const OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";

/// Annotation the store reads image names from.
pub const IMAGE_NAME_ANNOTATION: &str = "io.containerd.image.name";

/// An image to write into a fixture layout.
#[derive(Debug, Clone, Builder)]
pub struct FixtureImage {
    /// Names recorded for the image, one index entry each.
    #[builder(default)]
    pub names: Vec<String>,

    /// Files in each layer as `(path, content)`, base layer first.
    #[builder(default = vec![vec![(String::from("hello.txt"), b"hello".to_vec())]])]
    pub layers: Vec<Vec<(String, Vec<u8>)>>,

    /// Media type recorded for every layer; the layer content is always a plain tarball.
    #[builder(into, default = OCI_LAYER.to_string())]
    pub layer_media_type: String,

    /// Recorded in the config so otherwise identical images get distinct IDs.
    #[builder(into, default)]
    pub label: String,
}

/// What was written for one fixture image.
#[derive(Debug, Clone)]
pub struct WrittenImage {
    /// The image ID: hex digest of the config.
    pub id: String,

    /// Digest of the manifest, as `sha256:<hex>`.
    pub manifest: String,

    /// Digest of the config, as `sha256:<hex>`.
    pub config: String,

    /// Digests of the layer blobs, as `sha256:<hex>`.
    pub layers: Vec<String>,
}

/// An OCI image layout on disk, used as a local image store.
#[derive(Debug, Clone)]
pub struct Fixture {
    /// The layout directory.
    pub root: PathBuf,

    /// The images written, in the order given.
    pub images: Vec<WrittenImage>,
}

#[bon::bon]
impl Fixture {
    /// Write an image layout containing the images at `root`.
    #[builder]
    pub async fn new(
        #[builder(into)] root: PathBuf,
        #[builder(default)] images: Vec<FixtureImage>,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(root.join("blobs").join("sha256"))
            .await
            .context("create blob directory")?;
        write_json(&root.join("oci-layout"), &json!({ "imageLayoutVersion": "1.0.0" })).await?;

        let mut written = Vec::new();
        let mut entries = Vec::new();
        for image in &images {
            let (image_written, descriptor) = write_image(&root, image).await?;
            if image.names.is_empty() {
                entries.push(descriptor.clone());
            }
            for name in &image.names {
                let mut entry = descriptor.clone();
                entry["annotations"] = json!({ IMAGE_NAME_ANNOTATION: name });
                entries.push(entry);
            }
            written.push(image_written);
        }

        let index = json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.index.v1+json",
            "manifests": entries,
        });
        write_json(&root.join("index.json"), &index).await?;

        Ok(Self {
            root,
            images: written,
        })
    }
}

impl Fixture {
    /// The path of a blob in the layout, given its `sha256:<hex>` digest.
    pub fn blob(&self, digest: &str) -> PathBuf {
        let hex = digest.trim_start_matches("sha256:");
        self.root.join("blobs").join("sha256").join(hex)
    }
}

async fn write_image(root: &Path, image: &FixtureImage) -> Result<(WrittenImage, Value)> {
    let mut layers = Vec::new();
    let mut diff_ids = Vec::new();
    for files in &image.layers {
        let content = layer_tarball(files).await?;
        let digest = write_blob(root, &content).await?;
        diff_ids.push(digest.clone());
        layers.push(json!({
            "mediaType": image.layer_media_type,
            "digest": digest,
            "size": content.len(),
        }));
    }

    let config = serde_json::to_vec(&json!({
        "architecture": "amd64",
        "os": "linux",
        "config": { "Labels": { "fixture": image.label } },
        "rootfs": { "type": "layers", "diff_ids": diff_ids },
    }))
    .context("render config")?;
    let config_digest = write_blob(root, &config).await?;

    let manifest = serde_json::to_vec(&json!({
        "schemaVersion": 2,
        "mediaType": OCI_MANIFEST,
        "config": { "mediaType": OCI_CONFIG, "digest": config_digest, "size": config.len() },
        "layers": layers,
    }))
    .context("render manifest")?;
    let manifest_digest = write_blob(root, &manifest).await?;

    let descriptor = json!({
        "mediaType": OCI_MANIFEST,
        "digest": manifest_digest,
        "size": manifest.len(),
    });
    let written = WrittenImage {
        id: config_digest.trim_start_matches("sha256:").to_string(),
        manifest: manifest_digest,
        config: config_digest,
        layers: diff_ids,
    };
    Ok((written, descriptor))
}

/// Build a plain tarball holding the files.
async fn layer_tarball(files: &[(String, Vec<u8>)]) -> Result<Vec<u8>> {
    let mut tarball = tokio_tar::Builder::new(Vec::new());
    for (path, content) in files {
        let mut header = Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        tarball
            .append_data(&mut header, path, content.as_slice())
            .await
            .with_context(|| format!("add {path} to layer"))?;
    }
    tarball.into_inner().await.context("finish layer")
}

/// The `sha256:<hex>` digest of the content.
pub fn sha256(content: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(content)))
}

async fn write_blob(root: &Path, content: &[u8]) -> Result<String> {
    let digest = sha256(content);
    let path = root
        .join("blobs")
        .join("sha256")
        .join(digest.trim_start_matches("sha256:"));
    tokio::fs::write(&path, content)
        .await
        .with_context(|| format!("write blob {path:?}"))?;
    Ok(digest)
}

async fn write_json(path: &Path, value: &Value) -> Result<()> {
    let content = serde_json::to_vec_pretty(value).context("render json")?;
    tokio::fs::write(path, content)
        .await
        .with_context(|| format!("write {path:?}"))
}

/// Read every regular file in a tarball into memory, keyed by path.
pub async fn read_tarball(path: &Path) -> Result<BTreeMap<String, Vec<u8>>> {
    let content = tokio::fs::read(path)
        .await
        .with_context(|| format!("read {path:?}"))?;
    read_tarball_bytes(&content).await
}

/// Read every regular file in an in-memory tarball, keyed by path.
pub async fn read_tarball_bytes(content: &[u8]) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut archive = Archive::new(std::io::Cursor::new(content.to_vec()));
    let mut entries = archive.entries().context("read entries")?;

    let mut files = BTreeMap::new();
    while let Some(entry) = entries.next().await {
        let mut entry = entry.context("read entry")?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry
            .path()
            .context("read entry path")?
            .to_string_lossy()
            .to_string();
        let mut buf = Vec::new();
        entry
            .read_to_end(&mut buf)
            .await
            .with_context(|| format!("read {path}"))?;
        files.insert(path, buf);
    }
    Ok(files)
}
