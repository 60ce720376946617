// SPDX-License-Identifier: GPL-3.0-only

//! KMS display engine: device lifecycle, hotplug reconciliation, CRTC
//! assignment and page-flip event routing.

use std::{
    collections::{HashMap, HashSet},
    path::Path,
    sync::{mpsc, Arc},
    time::Duration,
};

use tracing::{debug, error, info, trace, warn};

pub mod buffers;
pub mod device;
pub mod drm_helpers;
#[cfg(test)]
pub(crate) mod fake;
pub mod gpu;
pub mod hardware;
pub mod render;
pub mod surface;

pub use self::gpu::{FlipError, Gpu, GpuError, ModeInfo};
pub use self::hardware::DrmGpu;
pub use self::surface::{Display, DisplayEvent, Phase};

/// Top-level coordinator for one GPU.
///
/// Owns the session, tracks which CRTC drives which connector, and keeps
/// the partition invariant: every CRTC discovered at construction is
/// either assigned to exactly one display or in the free set.
pub struct DeviceManager<G: Gpu> {
    gpu: Arc<G>,
    /// Positional CRTC list from construction; encoder masks index into it.
    crtcs: Vec<G::CrtcId>,
    free_crtcs: HashSet<G::CrtcId>,
    displays: HashMap<G::ConnectorId, Display<G>>,
    /// Page-flip cookie registry; entries die with their display so late
    /// completions fall through to the unknown-cookie warning.
    routes: HashMap<G::CrtcId, G::ConnectorId>,
    events_tx: mpsc::Sender<(G::ConnectorId, DisplayEvent)>,
    events_rx: mpsc::Receiver<(G::ConnectorId, DisplayEvent)>,
}

impl DeviceManager<DrmGpu> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, GpuError> {
        let gpu = DrmGpu::open(path.as_ref())?;
        Self::with_gpu(Arc::new(gpu))
    }
}

impl<G: Gpu> DeviceManager<G> {
    pub fn with_gpu(gpu: Arc<G>) -> Result<Self, GpuError> {
        let snapshot = gpu.resources()?;
        let free_crtcs = snapshot.crtcs.iter().copied().collect();
        let (events_tx, events_rx) = mpsc::channel();
        info!(
            "Managing {} connectors, {} CRTCs",
            snapshot.connectors.len(),
            snapshot.crtcs.len()
        );

        Ok(Self {
            gpu,
            crtcs: snapshot.crtcs,
            free_crtcs,
            displays: HashMap::new(),
            routes: HashMap::new(),
            events_tx,
            events_rx,
        })
    }

    pub fn display_count(&self) -> usize {
        self.displays.len()
    }

    pub fn for_each_display(&self, mut f: impl FnMut(&Display<G>)) {
        for display in self.displays.values() {
            f(display);
        }
    }

    /// Bring the set of displays in line with what is plugged in.
    ///
    /// Disconnected outputs release first so their CRTCs are available to
    /// whatever got plugged in; a connector that cannot be served (no
    /// mode, no compatible free CRTC, failed mode-set) is skipped and
    /// retried on the next call.
    pub fn reconcile(&mut self) -> Result<(), GpuError> {
        let snapshot = self.gpu.resources()?;

        let mut connectors = HashMap::new();
        for connector in &snapshot.connectors {
            match self.gpu.connector(*connector) {
                Ok(info) => {
                    connectors.insert(*connector, info);
                }
                Err(err) => warn!(?err, "failed to query connector {:?}", connector),
            }
        }

        let stale: Vec<G::ConnectorId> = self
            .displays
            .keys()
            .copied()
            .filter(|connector| {
                !connectors
                    .get(connector)
                    .is_some_and(|info| info.connected)
            })
            .collect();
        for connector in stale {
            info!("Output {:?} disconnected", connector);
            self.release_display(connector);
        }

        for connector in &snapshot.connectors {
            let Some(info) = connectors.get(connector) else {
                continue;
            };
            if !info.connected || self.displays.contains_key(connector) {
                continue;
            }

            let Some(mode) = drm_helpers::find_best_mode(&info.modes) else {
                warn!("No usable mode on {}", info.name);
                continue;
            };
            let encoder_masks: Vec<u32> = info
                .encoders
                .iter()
                .filter_map(|encoder| match self.gpu.encoder(*encoder) {
                    Ok(encoder) => Some(encoder.possible_crtcs),
                    Err(err) => {
                        warn!(?err, "failed to query encoder {:?}", encoder);
                        None
                    }
                })
                .collect();
            let Some(crtc) =
                drm_helpers::find_crtc_for_connector(&self.crtcs, &self.free_crtcs, &encoder_masks)
            else {
                warn!("No compatible CRTC for {}", info.name);
                continue;
            };

            let (width, height) = mode.dimensions();
            info!(
                "Found display {} at {}x{}@{}",
                info.name,
                width,
                height,
                mode.refresh()
            );
            match Display::new(
                self.gpu.clone(),
                *connector,
                crtc,
                mode,
                info.name.clone(),
                self.events_tx.clone(),
            ) {
                Ok(display) => {
                    self.free_crtcs.remove(&crtc);
                    self.routes.insert(crtc, *connector);
                    self.displays.insert(*connector, display);
                }
                Err(err) => {
                    warn!(?err, "failed to initialize output {}, skipping", info.name);
                }
            }
        }

        Ok(())
    }

    /// Drive the event loop for one iteration: wait for the device to
    /// become readable, route completed flips to their displays, and act
    /// on worker notifications.
    pub fn poll_events(&mut self, timeout: Option<Duration>) -> Result<(), GpuError> {
        if self.gpu.wait_events(timeout)? {
            for event in self.gpu.receive_events()? {
                match self.routes.get(&event.crtc) {
                    Some(connector) => {
                        if let Some(display) = self.displays.get(connector) {
                            display.on_flip_complete(event);
                        }
                    }
                    None => warn!(
                        crtc = ?event.crtc,
                        "dropping page-flip event with unknown cookie"
                    ),
                }
            }
        }
        self.drain_display_events();
        Ok(())
    }

    fn drain_display_events(&mut self) {
        while let Ok((connector, event)) = self.events_rx.try_recv() {
            match event {
                DisplayEvent::FrameLatched { frame, time } => {
                    trace!(?connector, frame, ?time, "frame latched");
                }
                DisplayEvent::FlipBusy => {
                    debug!(?connector, "flip busy, display will retry");
                }
                DisplayEvent::Failed(err) => {
                    error!(?err, "display {:?} failed, releasing it", connector);
                    self.release_display(connector);
                }
            }
        }
    }

    pub fn shutdown(&mut self) {
        for (_, mut display) in self.displays.drain() {
            let crtc = display.crtc();
            self.routes.remove(&crtc);
            display.release();
            self.free_crtcs.insert(crtc);
        }
    }

    fn release_display(&mut self, connector: G::ConnectorId) {
        if let Some(mut display) = self.displays.remove(&connector) {
            let crtc = display.crtc();
            // De-register first so a late completion cannot route to a
            // dead display.
            self.routes.remove(&crtc);
            display.release();
            self.free_crtcs.insert(crtc);
        }
    }
}

impl<G: Gpu> Drop for DeviceManager<G> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
