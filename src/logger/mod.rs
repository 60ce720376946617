// SPDX-License-Identifier: GPL-3.0-only

use anyhow::Result;
use tracing::info;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};

pub fn init_logger() -> Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    info!("Version: {}", std::env!("CARGO_PKG_VERSION"));
    Ok(())
}
