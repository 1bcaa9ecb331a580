use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan,
    layer::SubscriberExt, util::SubscriberInitExt as _,
};

use self::prelude::*;

mod cmd;
mod device;
mod engines;
mod enhance;
mod error;
mod normalize;
mod pipeline;
mod prelude;
mod provider;

/// Extract text from document images and refine it with local language
/// models.
#[derive(Debug, Parser)]
#[clap(
    version,
    after_help = r#"
Environment Variables:
  - HF_HOME (optional): Override the model snapshot cache location.
  - RUST_LOG (optional): Tracing filter, e.g. "textlift=debug".

  These variables may be set in a standard `.env` file.
"#
)]
struct Opts {
    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// Run the extraction and enhancement pipeline on one image.
    Extract(cmd::extract::ExtractOpts),
    /// List the available enhancement backends.
    Backends(cmd::backends::BackendsOpts),
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing. Diagnostics go to stderr so JSON output on
    // stdout stays clean.
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(std::io::stderr)
        .with_filter(env_filter);

    tracing_subscriber::registry().with(subscriber).init();

    // Call our real `main` function now that logging is set up.
    real_main().await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main() -> Result<()> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    // Parse command-line arguments.
    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    // Run the appropriate subcommand.
    match &opts.subcmd {
        Cmd::Extract(opts) => cmd::extract::cmd_extract(opts).await,
        Cmd::Backends(opts) => cmd::backends::cmd_backends(opts),
    }
}
