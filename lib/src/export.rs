//! Writes images held in a [`LayoutStore`] to save destinations.

use std::{collections::HashSet, path::Path, str::FromStr};

use async_trait::async_trait;
use color_eyre::{
    eyre::{eyre, Context},
    Result, Section, SectionExt,
};
use itertools::Itertools;
use serde_json::json;
use tokio::{
    fs::File,
    io::{AsyncWriteExt, BufWriter},
};
use tokio_tar::Builder;
use tracing::{debug, info, warn};

use crate::{
    cio,
    layout::{self, ArchiveManifestEntry, Descriptor, Index, Manifest, OCI_LAYOUT_VERSION},
    push::ProgressExt,
    transform, Destination, Digest, Image, LayerMediaType, LayoutStore, ManifestType, Progress,
    PushOptions, Pusher, Reference,
};

/// Content of the `version` file in directory destinations.
const DIRECTORY_VERSION: &str = "Directory Transport Version: 1.1\n";

#[async_trait]
impl Pusher for LayoutStore {
    #[tracing::instrument(skip(self, options))]
    async fn push(
        &self,
        image: &Image,
        destination: &Destination,
        options: PushOptions,
    ) -> Result<()> {
        let PushOptions {
            manifest_type,
            compress,
            signing,
            registry,
            additional_tags,
            mut progress,
        } = options;

        if let Some(key) = signing.sign_by {
            return Err(eyre!("signing is not supported when saving to local destinations"))
                .with_section(|| key.header("Sign by:"));
        }
        if signing.remove_signatures {
            debug!("local images carry no signatures to remove");
        }
        debug!(?registry, "registry options are unused for local destinations");

        let manifest = self.manifest(&image.manifest).await?;
        let written = match destination {
            Destination::DockerArchive { path, tag } => {
                let tags = tag.iter().chain(additional_tags.iter());
                self.write_docker_archive(path, &manifest, tags, &mut progress)
                    .await
            }
            Destination::OciArchive { path, name } => {
                let names = name
                    .iter()
                    .cloned()
                    .chain(additional_tags.iter().map(Reference::to_string));
                self.write_oci_archive(path, image, &manifest, names, &mut progress)
                    .await
            }
            Destination::Directory {
                path,
                manifest_type: marker,
            } => {
                if !additional_tags.is_empty() {
                    warn!(
                        count = additional_tags.len(),
                        "directory destinations do not record names; ignoring additional tags"
                    );
                }
                let manifest_type = manifest_type.unwrap_or(*marker);
                self.write_directory(path, manifest, manifest_type, compress, &mut progress)
                    .await
            }
        };
        written.with_section(|| destination.path().display().to_string().header("Destination:"))?;

        progress.line("Storing signatures");
        info!(path = ?destination.path(), "wrote image");
        Ok(())
    }
}

impl LayoutStore {
    /// Write the image as a tarball in the format `docker save` produces.
    ///
    /// Layers are stored as plain tarballs named after the digest of their uncompressed content.
    async fn write_docker_archive<'a>(
        &self,
        path: &Path,
        manifest: &Manifest,
        tags: impl Iterator<Item = &'a Reference>,
        progress: &mut Option<Progress>,
    ) -> Result<()> {
        let mut tarball = create_tarball(path).await?;

        let mut layers = Vec::new();
        for layer in &manifest.layers {
            progress.line(format!("Copying blob {}", layer.digest));
            let source = layout::verify_blob(self, layer).await?;
            let media_type = LayerMediaType::from_str(&layer.media_type)
                .context("parse layer media type")
                .with_section(|| layer.digest.to_string().header("Layer:"))?;

            let stream = transform::decompress(&media_type, cio::read_stream(&source).await?);
            let plain = cio::collect_tmp(stream).await.context("decompress layer")?;
            let (diff_id, _) = cio::file_digest(plain.file_path()).await?;

            let name = format!("{}.tar", diff_id.as_hex());
            if !layers.contains(&name) {
                cio::append_file(&mut tarball, plain.file_path(), &name).await?;
            }
            debug!(layer = %layer.digest, %diff_id, "added layer");
            layers.push(name);
        }

        progress.line(format!("Copying config {}", manifest.config.digest));
        let config = layout::verify_blob(self, &manifest.config).await?;
        let config_name = format!("{}.json", manifest.config.digest.as_hex());
        cio::append_file(&mut tarball, &config, &config_name).await?;

        progress.line("Writing manifest to image destination");
        let entry = ArchiveManifestEntry {
            config: config_name,
            repo_tags: tags.map(Reference::familiar).unique().collect(),
            layers,
        };
        debug!(?entry, "archive manifest");
        let rendered = serde_json::to_vec(&[entry]).context("render archive manifest")?;
        cio::append_bytes(&mut tarball, "manifest.json", &rendered).await?;

        finish_tarball(tarball).await
    }

    /// Write the image as a tarball holding an OCI image layout.
    ///
    /// Each name becomes an index entry for the same manifest.
    async fn write_oci_archive(
        &self,
        path: &Path,
        image: &Image,
        manifest: &Manifest,
        names: impl Iterator<Item = String>,
        progress: &mut Option<Progress>,
    ) -> Result<()> {
        let mut tarball = create_tarball(path).await?;
        let marker = json!({ "imageLayoutVersion": OCI_LAYOUT_VERSION }).to_string();
        cio::append_bytes(&mut tarball, "oci-layout", marker.as_bytes()).await?;

        let mut written = HashSet::new();
        for layer in &manifest.layers {
            progress.line(format!("Copying blob {}", layer.digest));
            let source = layout::verify_blob(self, layer).await?;
            if written.insert(layer.digest.clone()) {
                cio::append_file(&mut tarball, &source, &blob_name(&layer.digest)).await?;
            }
        }

        progress.line(format!("Copying config {}", manifest.config.digest));
        let config = layout::verify_blob(self, &manifest.config).await?;
        cio::append_file(&mut tarball, &config, &blob_name(&manifest.config.digest)).await?;

        progress.line("Writing manifest to image destination");
        let content = tokio::fs::read(self.blob_path(&image.manifest))
            .await
            .context("read manifest blob")?;
        cio::append_bytes(&mut tarball, &blob_name(&image.manifest), &content).await?;

        let descriptor = Descriptor {
            media_type: manifest
                .media_type
                .clone()
                .unwrap_or_else(|| ManifestType::Oci.to_string()),
            digest: image.manifest.clone(),
            size: content.len() as u64,
            annotations: Default::default(),
        };
        let names = names.unique().collect::<Vec<_>>();
        let entries = if names.is_empty() {
            vec![descriptor]
        } else {
            names.iter().map(|name| descriptor.named(name)).collect()
        };
        debug!(?names, "archive index");

        let index = serde_json::to_vec(&Index::new(entries)).context("render index")?;
        cio::append_bytes(&mut tarball, "index.json", &index).await?;

        finish_tarball(tarball).await
    }

    /// Write the image as a directory of loose blobs and a manifest of the given type.
    async fn write_directory(
        &self,
        path: &Path,
        manifest: Manifest,
        manifest_type: ManifestType,
        compress: bool,
        progress: &mut Option<Progress>,
    ) -> Result<()> {
        // Convert first: an image the target format can't describe fails before anything is written.
        let manifest = manifest.convert(manifest_type)?;

        tokio::fs::create_dir_all(path)
            .await
            .context("create destination directory")?;
        tokio::fs::write(path.join("version"), DIRECTORY_VERSION)
            .await
            .context("write version file")?;

        let mut layers = Vec::with_capacity(manifest.layers.len());
        for layer in manifest.layers {
            progress.line(format!("Copying blob {}", layer.digest));
            let source = layout::verify_blob(self, &layer).await?;
            let media_type = LayerMediaType::from_str(&layer.media_type)
                .context("parse layer media type")
                .with_section(|| layer.digest.to_string().header("Layer:"))?;

            if !compress || media_type.is_compressed() {
                copy_blob(&source, path, &layer.digest).await?;
                layers.push(layer);
                continue;
            }

            let stream = Box::pin(transform::gzip(cio::read_stream(&source).await?));
            let compressed = cio::collect_tmp(stream).await.context("compress layer")?;
            let (digest, size) = cio::file_digest(compressed.file_path()).await?;
            copy_blob(compressed.file_path(), path, &digest).await?;
            debug!(layer = %layer.digest, compressed = %digest, "compressed layer");

            layers.push(Descriptor {
                media_type: media_type.gzipped().to_string(),
                digest,
                size,
                ..layer
            });
        }

        progress.line(format!("Copying config {}", manifest.config.digest));
        let config = layout::verify_blob(self, &manifest.config).await?;
        copy_blob(&config, path, &manifest.config.digest).await?;

        progress.line("Writing manifest to image destination");
        let manifest = Manifest { layers, ..manifest };
        let rendered = serde_json::to_vec(&manifest).context("render manifest")?;
        tokio::fs::write(path.join("manifest.json"), rendered)
            .await
            .context("write manifest")
    }
}

/// The path of a blob inside an OCI image layout.
fn blob_name(digest: &Digest) -> String {
    format!("blobs/{}/{}", digest.algorithm, digest.as_hex())
}

async fn copy_blob(source: &Path, dir: &Path, digest: &Digest) -> Result<()> {
    let target = dir.join(digest.as_hex());
    tokio::fs::copy(source, &target)
        .await
        .with_context(|| format!("copy blob {digest} to {target:?}"))
        .map(|_| ())
}

async fn create_tarball(path: &Path) -> Result<Builder<BufWriter<File>>> {
    let file = File::create(path)
        .await
        .with_context(|| format!("create {path:?}"))?;
    Ok(Builder::new(BufWriter::new(file)))
}

async fn finish_tarball(tarball: Builder<BufWriter<File>>) -> Result<()> {
    let mut writer = tarball.into_inner().await.context("finish tarball")?;
    writer.flush().await.context("flush tarball")
}
