//! Parses extra positional arguments into tags saved alongside the image.

use std::str::FromStr;

use color_eyre::{eyre::Context, Result};
use tracing::debug;

use crate::{save::SaveError, Reference};

/// Parse each argument as a named, tagged reference.
///
/// Untagged names are tagged `latest`; digest-only references are rejected.
/// Order is preserved and duplicates are kept: this is purely a syntax check.
/// The first invalid argument fails the whole set with [`SaveError::ReferenceSyntax`].
#[tracing::instrument]
pub fn aggregate(args: &[String]) -> Result<Vec<Reference>> {
    args.iter()
        .map(|arg| {
            Reference::from_str(arg)
                .and_then(Reference::into_tagged)
                .wrap_err_with(|| SaveError::ReferenceSyntax { arg: arg.clone() })
        })
        .collect::<Result<Vec<_>>>()
        .inspect(|tags| debug!(count = tags.len(), "aggregated additional tags"))
}
