//! Saving a local image to an archive or directory.
//!
//! A save runs linearly: validate the request, resolve the destination, aggregate extra tags,
//! then push. If the push fails, output the push created is removed on a best effort basis
//! and the push error is returned. An output that existed before the save is left in place.

use std::{
    io::IsTerminal,
    ops::Deref,
    path::{Path, PathBuf},
    str::FromStr,
};

use bon::Builder;
use color_eyre::{eyre::Context, Result, Section, SectionExt};
use derive_more::{Display, Error};
use tap::TapFallible;
use tracing::{debug, error, info, warn};

use crate::{naming, tags, Destination, Format, ImageStore, Progress, PushOptions, Pusher};

/// Output path that denotes standard output.
pub const STDOUT: &str = "/dev/stdout";

/// The ways a save can fail.
///
/// Every failure from [`save`] can be classified with
/// `report.downcast_ref::<SaveError>()`; collaborator failures keep their original
/// error in the report chain beneath this context.
#[derive(Debug, Display, Error)]
pub enum SaveError {
    /// No source image was named.
    #[display("need at least 1 argument")]
    MissingArgument,

    /// `--compress` was combined with a format that does not support it.
    #[display("--compress can only be set when --format is either 'oci-dir' or 'docker-dir'")]
    IncompatibleFlags,

    /// Output would be written to an interactive terminal.
    #[display("refusing to save to terminal. Use -o flag or redirect")]
    RefuseTerminalOutput,

    /// The output path cannot be used.
    #[display("invalid filename ({reason}) {path:?}")]
    InvalidOutputPath {
        /// The rejected path.
        path: String,

        /// Why it was rejected.
        reason: &'static str,
    },

    /// The requested format is not one of the supported formats.
    #[display("unknown format option {format:?}")]
    UnknownFormat {
        /// The rejected format.
        format: String,
    },

    /// The destination could not be built.
    #[display("error getting {format} reference for {destination}")]
    ReferenceConstruction {
        /// The requested format.
        format: Format,

        /// The destination that was being built.
        destination: String,
    },

    /// An additional tag is not a valid tag reference.
    #[display("invalid additional tag {arg:?}")]
    ReferenceSyntax {
        /// The rejected argument.
        arg: String,
    },

    /// Writing the image to the destination failed.
    #[display("unable to save {args:?}")]
    Push {
        /// The positional arguments of the save.
        args: Vec<String>,
    },
}

/// A request to save a local image.
#[derive(Debug, Clone, Builder)]
pub struct SaveRequest {
    /// Positional arguments: the source image, then any additional tags.
    #[builder(default)]
    pub args: Vec<String>,

    /// Format selector; empty selects the default docker-archive format.
    #[builder(into, default)]
    pub format: String,

    /// Output path; defaults to [`STDOUT`].
    #[builder(into, default = STDOUT.to_string())]
    pub output: String,

    /// Compress layers; only valid for directory formats.
    #[builder(default)]
    pub compress: bool,

    /// Suppress progress output.
    #[builder(default)]
    pub quiet: bool,

    /// Whether standard output is an interactive terminal.
    #[builder(default = std::io::stdout().is_terminal())]
    pub stdout_is_terminal: bool,
}

impl SaveRequest {
    /// Check the request for errors that don't require the image store.
    ///
    /// Returns the parsed format.
    fn validate(&self) -> Result<Format> {
        let format = Format::from_str(&self.format)
            .map_err(color_eyre::Report::from)
            .with_section(|| Destination::format_names().header("Expected one of:"))?;

        if self.compress && !format.is_directory() {
            return Err(SaveError::IncompatibleFlags.into());
        }

        // Only the default output is checked: a custom path that happens to be a terminal
        // device is written like any other file.
        if self.output == STDOUT && self.stdout_is_terminal {
            return Err(SaveError::RefuseTerminalOutput.into());
        }

        validate_file_name(&self.output)?;
        Ok(format)
    }
}

/// Reject output paths that can't be written unambiguously.
///
/// A ':' is refused because docker-archive destinations are written as `path:name`.
pub fn validate_file_name(path: &str) -> Result<(), SaveError> {
    let reason = if path.is_empty() {
        "should not be empty"
    } else if path.contains(':') {
        "should not contain ':'"
    } else {
        return Ok(());
    };

    Err(SaveError::InvalidOutputPath {
        path: path.to_string(),
        reason,
    })
}

/// Save the image named by the first argument of the request.
///
/// The runtime is owned for the duration of the save and shut down on every exit path.
#[tracing::instrument(skip(runtime))]
pub async fn save<R: ImageStore + Pusher>(runtime: R, request: SaveRequest) -> Result<()> {
    let runtime = Session::new(runtime);

    let Some((source, additional)) = request.args.split_first() else {
        return Err(SaveError::MissingArgument.into());
    };
    if source.is_empty() {
        return Err(SaveError::MissingArgument.into());
    }

    let format = request.validate()?;
    let additional_tags = if additional.is_empty() {
        Vec::new()
    } else {
        tags::aggregate(additional)?
    };

    let image = runtime
        .lookup(source)
        .await
        .tap_ok(|image| info!(id = %image.id, names = ?image.names, "resolved source image"))
        .with_section(|| source.clone().header("Source:"))?;

    let name = naming::destination_name(&image, source);
    let destination = Destination::resolve(format, &request.output, &name)?;

    let progress = (!request.quiet).then(Progress::stderr);
    let options = PushOptions::builder()
        .maybe_manifest_type(destination.manifest_type())
        .compress(request.compress)
        .additional_tags(additional_tags)
        .maybe_progress(progress)
        .build();

    let existed = output_exists(&request.output).await;
    info!(%format, output = %request.output, existed, "writing image");
    if let Err(err) = runtime.push(&image, &destination, options).await {
        cleanup(&request.output, existed).await.log();
        return Err(err).wrap_err_with(|| SaveError::Push {
            args: request.args.clone(),
        });
    }

    info!(output = %request.output, "saved image");
    Ok(())
}

/// Holds the runtime for one save and shuts it down when dropped.
struct Session<R: ImageStore> {
    runtime: R,
}

impl<R: ImageStore> Session<R> {
    fn new(runtime: R) -> Self {
        debug!("acquired image store");
        Self { runtime }
    }
}

impl<R: ImageStore> Deref for Session<R> {
    type Target = R;

    fn deref(&self) -> &Self::Target {
        &self.runtime
    }
}

impl<R: ImageStore> Drop for Session<R> {
    fn drop(&mut self) {
        self.runtime.shutdown();
        debug!("released image store");
    }
}

/// Result of removing partial output after a failed push.
#[derive(Debug)]
enum Cleanup {
    /// The partial output was removed.
    Removed(PathBuf),

    /// There was nothing to remove, or the output can't be removed.
    Skipped(PathBuf),

    /// The output existed before the save, so it is left in place.
    Preexisting(PathBuf),

    /// Removal was attempted and failed.
    Failed(PathBuf, std::io::Error),
}

impl Cleanup {
    /// Report the outcome; cleanup never changes the result of the save.
    fn log(self) {
        match self {
            Cleanup::Removed(path) => info!(?path, "removed partial output"),
            Cleanup::Skipped(path) => debug!(?path, "skipped removing output"),
            Cleanup::Preexisting(path) => {
                warn!(?path, "output existed before the save; leaving it in place")
            }
            Cleanup::Failed(path, err) => error!(?path, %err, "error deleting partial output"),
        }
    }
}

/// Whether anything is present at the output path.
async fn output_exists(output: &str) -> bool {
    tokio::fs::symlink_metadata(output).await.is_ok()
}

/// Remove whatever a failed push left at the output path.
///
/// Only output the push created is removed; `existed` records whether the path was
/// present before the push started.
async fn cleanup(output: &str, existed: bool) -> Cleanup {
    let path = Path::new(output).to_path_buf();
    if output == STDOUT {
        return Cleanup::Skipped(path);
    }
    if existed {
        return Cleanup::Preexisting(path);
    }

    let removed = match tokio::fs::symlink_metadata(&path).await {
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Cleanup::Skipped(path),
        Err(err) => return Cleanup::Failed(path, err),
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(&path).await,
        Ok(_) => tokio::fs::remove_file(&path).await,
    };

    match removed {
        Ok(()) => Cleanup::Removed(path),
        Err(err) => Cleanup::Failed(path, err),
    }
}
