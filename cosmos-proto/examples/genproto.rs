//! Generate updated proto code for this crate.
//!
//! This is setup as an example instead of as part of the build.rs because the
//! protocode ships along with the crate when distributed.

use anyhow::{Context, Result};

fn main() -> Result<()> {
    tonic_build::configure()
        .out_dir("src")
        .build_client(true)
        .build_server(true)
        .compile(&["proto/cosmos.proto"], &["proto"])
        .context("error compiling cosmos proto")?;

    Ok(())
}
