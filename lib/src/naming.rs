//! Decides which name is embedded in a saved archive.

use crate::{Image, DEFAULT_LOCAL_REGISTRY};

/// Returns the name to embed in the destination for an image the user referred to as `input`,
/// or an empty string if no name should be embedded.
///
/// - If `input` is part of the image ID, the user referred to the image by ID;
///   the archive holds a single unambiguous image, so no name is embedded.
/// - If looking up `input` only succeeded because the store qualified it with
///   the local registry (e.g. `foo` is stored as `localhost/foo:latest`),
///   the qualified form is embedded so that loading the archive restores the same name.
/// - Otherwise `input` is embedded as typed.
///
/// ```
/// # use satchel_lib::{naming::destination_name, Image, Digest};
/// let image = Image {
///     id: String::from("ab12cd34ef56ab12cd34ef56ab12cd34ef56ab12cd34ef56ab12cd34ef56ab12"),
///     names: vec![String::from("localhost/foo:latest")],
///     manifest: Digest::sha256(b"manifest"),
/// };
/// assert_eq!(destination_name(&image, "ab12"), "");
/// assert_eq!(destination_name(&image, "foo"), "localhost/foo");
/// ```
pub fn destination_name(image: &Image, input: &str) -> String {
    if image.id.contains(input) {
        return String::new();
    }

    let prefix = format!("{DEFAULT_LOCAL_REGISTRY}/");
    if input.starts_with(&prefix) {
        return input.to_string();
    }

    let latest = format!("{input}:latest");
    let qualified = image.names.iter().any(|name| {
        name.starts_with(&prefix) && (name.ends_with(input) || name.ends_with(&latest))
    });

    if qualified {
        format!("{prefix}{input}")
    } else {
        input.to_string()
    }
}
