use async_tempfile::TempDir;
use color_eyre::Result;
use pretty_assertions::assert_eq;
use satchel_integration::{Fixture, FixtureImage};
use satchel_lib::{ImageNotFound, ImageStore, LayoutStore};
use simple_test_case::test_case;

#[test_case("localhost/foo:latest", 0; "exact_local_name")]
#[test_case("foo", 0; "bare_local_name")]
#[test_case("foo:latest", 0; "tagged_local_name")]
#[test_case("localhost/foo", 0; "untagged_local_name")]
#[test_case("alpine", 1; "docker_hub_short")]
#[test_case("docker.io/library/alpine", 1; "docker_hub_untagged")]
#[test_case("quay.io/bar/baz:v1", 2; "remote_name")]
#[test_log::test(tokio::test)]
async fn lookup_by_name(input: &str, expected: usize) -> Result<()> {
    let tmp = TempDir::new().await?;
    let fixture = crate::store(
        &tmp,
        &[
            &["localhost/foo:latest"],
            &["docker.io/library/alpine:latest"],
            &["quay.io/bar/baz:v1"],
        ],
    )
    .await?;

    let store = LayoutStore::builder().root(&fixture.root).build().await?;
    let image = store.lookup(input).await?;
    pretty_assertions::assert_eq!(image.id, fixture.images[expected].id);
    pretty_assertions::assert_eq!(image.manifest.to_string(), fixture.images[expected].manifest);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn lookup_by_id() -> Result<()> {
    let tmp = TempDir::new().await?;
    let fixture = crate::store(&tmp, &[&["localhost/foo:latest"]]).await?;
    let store = LayoutStore::builder().root(&fixture.root).build().await?;
    let id = &fixture.images[0].id;

    for input in [id.clone(), id[..12].to_string(), format!("sha256:{id}")] {
        let image = store.lookup(&input).await?;
        assert_eq!(&image.id, id, "input: {input}");
        assert_eq!(image.names, vec![String::from("localhost/foo:latest")]);
    }
    Ok(())
}

#[test_log::test(tokio::test)]
async fn names_are_grouped_per_image() -> Result<()> {
    let tmp = TempDir::new().await?;
    let fixture = crate::store(
        &tmp,
        &[&["localhost/foo:latest", "localhost/foo:v1", "quay.io/foo/foo:v1"]],
    )
    .await?;

    let store = LayoutStore::builder().root(&fixture.root).build().await?;
    assert_eq!(store.images().len(), 1);

    let image = store.lookup("foo:v1").await?;
    assert_eq!(
        image.names,
        vec!["localhost/foo:latest", "localhost/foo:v1", "quay.io/foo/foo:v1"]
    );
    Ok(())
}

#[test_log::test(tokio::test)]
async fn unnamed_images_are_found_by_id() -> Result<()> {
    let tmp = TempDir::new().await?;
    let fixture = crate::store(&tmp, &[&[]]).await?;
    let store = LayoutStore::builder().root(&fixture.root).build().await?;

    let image = store.lookup(&fixture.images[0].id[..8]).await?;
    assert!(image.names.is_empty());
    Ok(())
}

#[test_case("missing"; "unknown_name")]
#[test_case("foo:v2"; "unknown_tag")]
#[test_case("ffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff0"; "too_long_id")]
#[test_log::test(tokio::test)]
async fn lookup_not_found(input: &str) -> Result<()> {
    let tmp = TempDir::new().await?;
    let fixture = crate::store(&tmp, &[&["localhost/foo:latest"]]).await?;
    let store = LayoutStore::builder().root(&fixture.root).build().await?;

    let err = store.lookup(input).await.expect_err("must error");
    let not_found = err
        .downcast_ref::<ImageNotFound>()
        .unwrap_or_else(|| panic!("not an image lookup error: {err:?}"));
    pretty_assertions::assert_eq!(not_found.input, input);
    pretty_assertions::assert_eq!(err.to_string(), format!("{input}: image not known"));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn ambiguous_id_prefix() -> Result<()> {
    let tmp = TempDir::new().await?;

    // Seventeen images guarantee two IDs share a first hex digit.
    let images = (0..17)
        .map(|n| {
            FixtureImage::builder()
                .names(vec![format!("localhost/img{n}:latest")])
                .label(n.to_string())
                .build()
        })
        .collect();
    let fixture = Fixture::builder()
        .root(tmp.dir_path().join("store"))
        .images(images)
        .build()
        .await?;

    let ids = fixture.images.iter().map(|image| &image.id).collect::<Vec<_>>();
    let prefix = ids
        .iter()
        .map(|id| &id[..1])
        .find(|prefix| ids.iter().filter(|id| id.starts_with(*prefix)).count() > 1)
        .expect("two ids share a prefix");

    let store = LayoutStore::builder().root(&fixture.root).build().await?;
    let err = store.lookup(prefix).await.expect_err("must error");
    assert!(err.downcast_ref::<ImageNotFound>().is_none());
    assert!(err.to_string().contains("ambiguous"), "error: {err:?}");
    Ok(())
}

#[test_log::test(tokio::test)]
async fn name_beats_id() -> Result<()> {
    let tmp = TempDir::new().await?;
    let fixture = crate::store(&tmp, &[&["localhost/foo:latest"], &[]]).await?;

    // Name the first image after a prefix of the second image's ID.
    let prefix = fixture.images[1].id[..6].to_string();
    let renamed = crate::store(&tmp, &[&[prefix.as_str()], &[]]).await?;
    let store = LayoutStore::builder().root(&renamed.root).build().await?;

    let image = store.lookup(&prefix).await?;
    assert_eq!(image.id, renamed.images[0].id);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn open_requires_layout() -> Result<()> {
    let tmp = TempDir::new().await?;
    let result = LayoutStore::builder()
        .root(tmp.dir_path().join("missing"))
        .build()
        .await;
    assert!(result.is_err());
    Ok(())
}
