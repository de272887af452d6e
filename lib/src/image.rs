//! Local image identity and the store that resolves user input to it.

use async_trait::async_trait;
use color_eyre::Result;
use derive_more::{Display, Error};

use crate::Digest;

/// Registry host synthesized for images that were stored without one.
///
/// A bare name such as `foo` that only exists locally is stored as `localhost/foo:latest`.
pub const DEFAULT_LOCAL_REGISTRY: &str = "localhost";

/// A locally stored image, as resolved from user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    /// Content ID of the image: the hex digest of its config.
    pub id: String,

    /// Human readable names the store knows for this image, in store order.
    pub names: Vec<String>,

    /// Digest of the manifest describing the image content.
    pub manifest: Digest,
}

/// Returned when no stored image matches the user's input.
#[derive(Debug, Display, Error)]
#[display("{input}: image not known")]
pub struct ImageNotFound {
    /// The input that failed to resolve.
    #[error(not(source))]
    pub input: String,
}

/// Resolves user input to locally stored images.
///
/// A store handle is held for the duration of a single save;
/// [`ImageStore::shutdown`] is called once when it is released.
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Resolve the input (a name, a full ID, or an ID prefix) to an image.
    ///
    /// Fails with [`ImageNotFound`] if nothing matches.
    async fn lookup(&self, input: &str) -> Result<Image>;

    /// Release any resources held by the store.
    fn shutdown(&mut self) {}
}
