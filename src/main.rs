// SPDX-License-Identifier: GPL-3.0-only

use std::{
    env,
    path::PathBuf,
    time::{Duration, Instant},
};

use anyhow::{bail, Context, Result};
use glow::HasContext;
use tracing::info;

pub mod backend;
mod logger;

use backend::kms::{DeviceManager, Phase};

const DEFAULT_DEVICE: &str = "/dev/dri/card0";
const POLL_TIMEOUT: Duration = Duration::from_millis(100);
// Stand-in cadence for hotplug notification; udev integration belongs to
// the surrounding compositor.
const RECONCILE_INTERVAL: Duration = Duration::from_secs(2);

fn main() -> Result<()> {
    logger::init_logger()?;
    info!("Prism starting up!");

    let device = env::args()
        .nth(1)
        .or_else(|| env::var("PRISM_DRM_DEVICE").ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DEVICE));

    let mut manager = DeviceManager::open(&device)
        .with_context(|| format!("Failed to initialize display engine on {}", device.display()))?;
    manager.reconcile().context("Failed to bring up outputs")?;
    if manager.display_count() == 0 {
        bail!("no connected outputs on {}", device.display());
    }

    let mut last_reconcile = Instant::now();
    loop {
        manager
            .poll_events(Some(POLL_TIMEOUT))
            .context("display event loop failed")?;

        manager.for_each_display(|display| {
            if matches!(display.phase(), Phase::Armed | Phase::Scanning) {
                display.submit_frame(|ctx| {
                    let gl = ctx.gl();
                    unsafe {
                        gl.clear_color(0.5, 0.5, 0.5, 1.0);
                        gl.clear(glow::COLOR_BUFFER_BIT);
                    }
                });
            }
        });

        if last_reconcile.elapsed() >= RECONCILE_INTERVAL {
            manager.reconcile().context("hotplug reconcile failed")?;
            last_reconcile = Instant::now();
        }
    }
}
