use std::path::Path;

use async_tempfile::TempDir;
use color_eyre::Result;
use pretty_assertions::assert_eq;
use satchel_integration::{read_tarball, sha256, Fixture, FixtureImage, OCI_MANIFEST};
use satchel_lib::{
    layout::{ArchiveManifestEntry, Index, Manifest, REF_NAME_ANNOTATION},
    Destination, ImageStore, LayoutStore, PushOptions, Pusher, SaveRequest, SigningOptions,
};
use serde_json::Value;

async fn save(fixture: &Fixture, args: &[&str], format: &str, output: &Path) -> Result<()> {
    let store = LayoutStore::builder().root(&fixture.root).build().await?;
    let request = SaveRequest::builder()
        .args(args.iter().map(|arg| arg.to_string()).collect())
        .format(format)
        .output(output.to_string_lossy())
        .quiet(true)
        .stdout_is_terminal(false)
        .build();
    satchel_lib::save(store, request).await
}

fn parse<T: serde::de::DeserializeOwned>(content: &[u8]) -> T {
    serde_json::from_slice(content).expect("parse json")
}

#[test_log::test(tokio::test)]
async fn docker_archive() -> Result<()> {
    let tmp = TempDir::new().await?;
    let fixture = crate::store(&tmp, &[&["localhost/foo:latest"]]).await?;
    let image = &fixture.images[0];
    let output = tmp.dir_path().join("foo.tar");

    save(&fixture, &["foo", "foo:v2", "bar"], "docker-archive", &output).await?;

    let files = read_tarball(&output).await?;
    let layer = format!("{}.tar", image.layers[0].trim_start_matches("sha256:"));
    let config = format!("{}.json", image.id);
    assert_eq!(
        files.keys().cloned().collect::<Vec<_>>(),
        {
            let mut expected = vec![layer.clone(), config.clone(), String::from("manifest.json")];
            expected.sort();
            expected
        }
    );

    let entries = parse::<Vec<ArchiveManifestEntry>>(&files["manifest.json"]);
    assert_eq!(
        entries,
        vec![ArchiveManifestEntry {
            config: config.clone(),
            repo_tags: vec![
                String::from("localhost/foo:latest"),
                String::from("foo:v2"),
                String::from("bar:latest"),
            ],
            layers: vec![layer.clone()],
        }]
    );

    let stored = tokio::fs::read(fixture.blob(&image.config)).await?;
    assert_eq!(files[&config], stored);
    assert_eq!(sha256(&files[&layer]), image.layers[0]);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn docker_archive_by_id_has_no_names() -> Result<()> {
    let tmp = TempDir::new().await?;
    let fixture = crate::store(&tmp, &[&["localhost/foo:latest"]]).await?;
    let output = tmp.dir_path().join("foo.tar");

    save(&fixture, &[&fixture.images[0].id[..12]], "", &output).await?;

    let files = read_tarball(&output).await?;
    let entries = parse::<Vec<ArchiveManifestEntry>>(&files["manifest.json"]);
    assert_eq!(entries.len(), 1);
    assert!(entries[0].repo_tags.is_empty());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn docker_archive_shares_layers() -> Result<()> {
    let tmp = TempDir::new().await?;
    let base = vec![(String::from("base.txt"), b"base".to_vec())];
    let fixture = Fixture::builder()
        .root(tmp.dir_path().join("store"))
        .images(vec![FixtureImage::builder()
            .names(vec![String::from("localhost/foo:latest")])
            .layers(vec![base.clone(), base])
            .build()])
        .build()
        .await?;
    let output = tmp.dir_path().join("foo.tar");

    save(&fixture, &["foo"], "docker-archive", &output).await?;

    let files = read_tarball(&output).await?;
    let entries = parse::<Vec<ArchiveManifestEntry>>(&files["manifest.json"]);
    assert_eq!(entries[0].layers.len(), 2);
    assert_eq!(entries[0].layers[0], entries[0].layers[1]);
    assert_eq!(files.len(), 3);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn oci_archive() -> Result<()> {
    let tmp = TempDir::new().await?;
    let fixture = crate::store(&tmp, &[&["localhost/foo:latest"]]).await?;
    let image = &fixture.images[0];
    let output = tmp.dir_path().join("foo.tar");

    save(&fixture, &["foo", "foo:v2"], "oci-archive", &output).await?;

    let files = read_tarball(&output).await?;
    let marker = parse::<Value>(&files["oci-layout"]);
    assert_eq!(marker["imageLayoutVersion"], "1.0.0");

    let index = parse::<Index>(&files["index.json"]);
    let names = index
        .manifests
        .iter()
        .map(|entry| entry.annotations[REF_NAME_ANNOTATION].as_str())
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["localhost/foo", "docker.io/library/foo:v2"]);
    for entry in &index.manifests {
        assert_eq!(entry.digest.to_string(), image.manifest);
        assert_eq!(entry.media_type, OCI_MANIFEST);
    }

    for digest in [&image.manifest, &image.config, &image.layers[0]] {
        let name = format!("blobs/sha256/{}", digest.trim_start_matches("sha256:"));
        let content = files.get(&name).unwrap_or_else(|| panic!("missing {name}"));
        assert_eq!(&sha256(content), digest);
    }
    Ok(())
}

#[test_log::test(tokio::test)]
async fn oci_archive_by_id_has_no_names() -> Result<()> {
    let tmp = TempDir::new().await?;
    let fixture = crate::store(&tmp, &[&["localhost/foo:latest"]]).await?;
    let output = tmp.dir_path().join("foo.tar");

    save(&fixture, &[fixture.images[0].id.as_str()], "oci-archive", &output).await?;

    let files = read_tarball(&output).await?;
    let index = parse::<Index>(&files["index.json"]);
    assert_eq!(index.manifests.len(), 1);
    assert!(index.manifests[0].annotations.is_empty());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn oci_dir() -> Result<()> {
    let tmp = TempDir::new().await?;
    let fixture = crate::store(&tmp, &[&["localhost/foo:latest"]]).await?;
    let image = &fixture.images[0];
    let output = tmp.dir_path().join("foo");

    save(&fixture, &["foo"], "oci-dir", &output).await?;

    let version = tokio::fs::read_to_string(output.join("version")).await?;
    assert_eq!(version, "Directory Transport Version: 1.1\n");

    let manifest = parse::<Manifest>(&tokio::fs::read(output.join("manifest.json")).await?);
    assert_eq!(manifest.media_type.as_deref(), Some(OCI_MANIFEST));
    assert_eq!(manifest.config.digest.to_string(), image.config);
    assert_eq!(manifest.layers[0].digest.to_string(), image.layers[0]);

    for digest in [&image.config, &image.layers[0]] {
        let content = tokio::fs::read(output.join(digest.trim_start_matches("sha256:"))).await?;
        assert_eq!(&sha256(&content), digest);
    }
    Ok(())
}

#[test_log::test(tokio::test)]
async fn docker_dir() -> Result<()> {
    let tmp = TempDir::new().await?;
    let fixture = crate::store(&tmp, &[&["localhost/foo:latest"]]).await?;
    let image = &fixture.images[0];
    let output = tmp.dir_path().join("foo");

    save(&fixture, &["foo", "foo:v2"], "docker-dir", &output).await?;

    let manifest = parse::<Manifest>(&tokio::fs::read(output.join("manifest.json")).await?);
    assert_eq!(
        manifest.media_type.as_deref(),
        Some("application/vnd.docker.distribution.manifest.v2+json")
    );
    assert_eq!(
        manifest.config.media_type,
        "application/vnd.docker.container.image.v1+json"
    );
    assert_eq!(
        manifest.layers[0].media_type,
        "application/vnd.docker.image.rootfs.diff.tar"
    );
    assert_eq!(manifest.layers[0].digest.to_string(), image.layers[0]);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn compressed_dir() -> Result<()> {
    let tmp = TempDir::new().await?;
    let fixture = crate::store(&tmp, &[&["localhost/foo:latest"]]).await?;
    let image = &fixture.images[0];
    let output = tmp.dir_path().join("foo");

    let store = LayoutStore::builder().root(&fixture.root).build().await?;
    let request = SaveRequest::builder()
        .args(vec![String::from("foo")])
        .format("oci-dir")
        .output(output.to_string_lossy())
        .compress(true)
        .quiet(true)
        .stdout_is_terminal(false)
        .build();
    satchel_lib::save(store, request).await?;

    let manifest = parse::<Manifest>(&tokio::fs::read(output.join("manifest.json")).await?);
    let layer = &manifest.layers[0];
    assert_eq!(layer.media_type, "application/vnd.oci.image.layer.v1.tar+gzip");
    assert_ne!(layer.digest.to_string(), image.layers[0]);

    let content = tokio::fs::read(output.join(layer.digest.as_hex())).await?;
    assert!(content.starts_with(&[0x1f, 0x8b]), "not gzip");
    assert_eq!(content.len() as u64, layer.size);
    assert_eq!(sha256(&content), layer.digest.to_string());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn zstd_layers_cannot_be_docker_dir() -> Result<()> {
    let tmp = TempDir::new().await?;
    let fixture = Fixture::builder()
        .root(tmp.dir_path().join("store"))
        .images(vec![FixtureImage::builder()
            .names(vec![String::from("localhost/foo:latest")])
            .layer_media_type("application/vnd.oci.image.layer.v1.tar+zstd")
            .build()])
        .build()
        .await?;
    let output = tmp.dir_path().join("foo");

    let result = save(&fixture, &["foo"], "docker-dir", &output).await;
    assert!(result.is_err());
    assert!(!output.exists());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn signing_is_refused() -> Result<()> {
    let tmp = TempDir::new().await?;
    let fixture = crate::store(&tmp, &[&["localhost/foo:latest"]]).await?;
    let store = LayoutStore::builder().root(&fixture.root).build().await?;
    let image = store.lookup("foo").await?;
    let output = tmp.dir_path().join("foo.tar");
    let destination = Destination::docker_archive(&output.to_string_lossy())?;

    let options = PushOptions::builder()
        .signing(SigningOptions {
            remove_signatures: false,
            sign_by: Some(String::from("me@example.com")),
        })
        .build();
    let result = store.push(&image, &destination, options).await;
    assert!(result.is_err());
    assert!(!output.exists());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn failed_archive_keeps_existing_directory() -> Result<()> {
    let tmp = TempDir::new().await?;
    let fixture = crate::store(&tmp, &[&["localhost/foo:latest"]]).await?;
    let output = tmp.dir_path().join("my-project");
    tokio::fs::create_dir_all(&output).await?;
    tokio::fs::write(output.join("notes.txt"), b"keep me").await?;

    let result = save(&fixture, &["foo"], "", &output).await;
    assert!(result.is_err());
    assert!(output.is_dir());
    assert_eq!(tokio::fs::read(output.join("notes.txt")).await?, b"keep me");
    Ok(())
}

#[test_log::test(tokio::test)]
async fn failed_dir_keeps_existing_directory() -> Result<()> {
    let tmp = TempDir::new().await?;
    let fixture = Fixture::builder()
        .root(tmp.dir_path().join("store"))
        .images(vec![FixtureImage::builder()
            .names(vec![String::from("localhost/foo:latest")])
            .layer_media_type("application/vnd.oci.image.layer.v1.tar+zstd")
            .build()])
        .build()
        .await?;
    let output = tmp.dir_path().join("foo");
    tokio::fs::create_dir_all(&output).await?;
    tokio::fs::write(output.join("notes.txt"), b"keep me").await?;

    let result = save(&fixture, &["foo"], "docker-dir", &output).await;
    assert!(result.is_err());
    assert_eq!(tokio::fs::read(output.join("notes.txt")).await?, b"keep me");
    Ok(())
}
