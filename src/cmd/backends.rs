//! The `backends` subcommand.

use clap::Args;

use super::write_json;
use crate::enhance::backend_catalog;
use crate::prelude::*;

/// The `backends` subcommand's options.
#[derive(Args, Debug)]
pub struct BackendsOpts {
    /// Write the JSON catalog here instead of standard output.
    #[clap(short = 'o', long)]
    pub output: Option<PathBuf>,
}

/// The `backends` subcommand.
pub fn cmd_backends(opts: &BackendsOpts) -> Result<()> {
    write_json(opts.output.as_deref(), &backend_catalog())
}
