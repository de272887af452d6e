//! Writing image content to a destination.

use std::io::Write;

use async_trait::async_trait;
use bon::Builder;
use color_eyre::Result;
use derive_more::Debug;
use tracing::debug;

use crate::{Destination, Image, ManifestType, Reference};

/// Writes image content (layers, config, manifest) to a destination.
#[async_trait]
pub trait Pusher: Send + Sync {
    /// Write the image to the destination.
    ///
    /// This is a single blocking operation from the caller's point of view:
    /// it either completes or fails, and a failure may leave partial output behind.
    async fn push(
        &self,
        image: &Image,
        destination: &Destination,
        options: PushOptions,
    ) -> Result<()>;
}

/// Parameters for a single push.
#[derive(Debug, Builder)]
pub struct PushOptions {
    /// Manifest format to write; only directory destinations use this.
    pub manifest_type: Option<ManifestType>,

    /// Compress uncompressed layers; only directory destinations use this.
    #[builder(default)]
    pub compress: bool,

    /// How the written image is signed.
    #[builder(default)]
    pub signing: SigningOptions,

    /// Registry connection settings.
    #[builder(default)]
    pub registry: RegistryOptions,

    /// Extra names recorded for the same image content.
    #[builder(default)]
    pub additional_tags: Vec<Reference>,

    /// Receives human readable status lines; absent when quiet.
    pub progress: Option<Progress>,
}

/// Signature handling during a push.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SigningOptions {
    /// Drop any signatures the source carries.
    pub remove_signatures: bool,

    /// Key identity to sign the written manifest with.
    pub sign_by: Option<String>,
}

/// Registry connection settings for destinations that talk to a registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryOptions {
    /// Require TLS verification, if set.
    pub tls_verify: Option<bool>,

    /// Path to registry credentials.
    pub auth_file: Option<std::path::PathBuf>,
}

/// Sink for status lines emitted while pushing.
#[derive(Debug)]
pub struct Progress {
    #[debug(skip)]
    writer: Box<dyn Write + Send>,
}

impl Progress {
    /// Report progress to the given writer.
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            writer: Box::new(writer),
        }
    }

    /// Report progress to stderr.
    pub fn stderr() -> Self {
        Self::new(std::io::stderr())
    }

    /// Write a status line.
    ///
    /// Progress is informational; a failed write is logged and otherwise ignored.
    pub fn line(&mut self, message: impl std::fmt::Display) {
        if let Err(err) = writeln!(self.writer, "{message}") {
            debug!(?err, "write progress");
        }
    }
}

/// Convenience for optional progress sinks.
pub trait ProgressExt {
    /// Write a status line if progress is being reported.
    fn line(&mut self, message: impl std::fmt::Display);
}

impl ProgressExt for Option<Progress> {
    fn line(&mut self, message: impl std::fmt::Display) {
        if let Some(progress) = self {
            progress.line(message);
        }
    }
}
