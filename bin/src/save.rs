use std::path::PathBuf;

use clap::Parser;
use color_eyre::{
    eyre::{Context, OptionExt, Result},
    Section, SectionExt,
};
use satchel_lib::{LayoutStore, SaveRequest, STDOUT};
use tracing::debug;

#[derive(Debug, Parser)]
pub struct Options {
    /// Image to save (name, image ID, or ID prefix), followed by additional tags
    ///
    /// Additional tags are names the saved image is recorded under, e.g. `foo:v1 foo:stable`.
    #[arg(value_name = "IMAGE")]
    args: Vec<String>,

    /// Save image to the specified format
    ///
    /// One of `docker-archive` (default), `oci-archive`, `oci-dir`, or `docker-dir`.
    #[arg(long, default_value = "")]
    format: String,

    /// Write to a file or directory instead of stdout
    #[arg(long, short, default_value = STDOUT)]
    output: String,

    /// Compress layers when saving to a directory (`oci-dir` or `docker-dir` only)
    #[arg(long)]
    compress: bool,

    /// Suppress progress output
    #[arg(long, short)]
    quiet: bool,
}

#[tracing::instrument]
pub async fn main(store: Option<PathBuf>, opts: Options) -> Result<()> {
    let root = match store {
        Some(root) => root,
        None => default_store()?,
    };
    debug!(?root, "opening image store");

    let store = LayoutStore::builder()
        .root(root.clone())
        .build()
        .await
        .context("open local image store")
        .with_section(|| root.display().to_string().header("Store:"))?;

    let request = SaveRequest::builder()
        .args(opts.args)
        .format(opts.format)
        .output(opts.output)
        .compress(opts.compress)
        .quiet(opts.quiet)
        .build();

    satchel_lib::save(store, request).await
}

/// The image store used when none is configured.
fn default_store() -> Result<PathBuf> {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .ok_or_eyre("HOME is not set; pass --store or set SATCHEL_STORE")
        .map(|home| home.join(".local").join("share").join("satchel").join("store"))
}
