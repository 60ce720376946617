// SPDX-License-Identifier: GPL-3.0-only

//! Exclusive access to the DRM primary node and snapshots of its
//! mode-setting resources.

use std::{
    io,
    os::fd::{AsFd, BorrowedFd, OwnedFd},
    path::Path,
    sync::Arc,
    time::Duration,
};

use drm::control::{connector, crtc, encoder, Device as ControlDevice, ModeTypeFlags};
use drm::Device as BasicDevice;
use rustix::event::{poll, PollFd, PollFlags};
use rustix::fs::{Mode as FsMode, OFlags};
use rustix::io::Errno;
use tracing::{trace, warn};

use super::gpu::{
    ConnectorSnapshot, EncoderSnapshot, FlipEvent, GpuError, ModeInfo, ResourceSnapshot,
};

/// Cloneable handle to the opened device node. Components like the GBM
/// device need their own reference to the descriptor; the descriptor
/// itself closes once the last clone drops.
#[derive(Debug, Clone)]
pub struct DeviceFd(Arc<OwnedFd>);

impl AsFd for DeviceFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

/// Scoped DRM master lease over a primary node.
///
/// While a session is alive it holds mode-setting authority; dropping it
/// relinquishes master before the descriptor closes.
#[derive(Debug)]
pub struct GpuSession {
    fd: DeviceFd,
}

impl AsFd for GpuSession {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl BasicDevice for GpuSession {}
impl ControlDevice for GpuSession {}

impl GpuSession {
    pub fn open(path: &Path) -> Result<Self, GpuError> {
        let fd = rustix::fs::open(
            path,
            OFlags::RDWR | OFlags::CLOEXEC | OFlags::NOCTTY | OFlags::NONBLOCK,
            FsMode::empty(),
        )
        .map_err(|err| GpuError::DeviceOpen(err.into()))?;

        let session = GpuSession {
            fd: DeviceFd(Arc::new(fd)),
        };
        session
            .acquire_master_lock()
            .map_err(GpuError::MasterAcquire)?;
        Ok(session)
    }

    pub fn device_fd(&self) -> DeviceFd {
        self.fd.clone()
    }

    pub fn mode_resources(
        &self,
    ) -> Result<ResourceSnapshot<connector::Handle, crtc::Handle>, GpuError> {
        let handles = self.resource_handles().map_err(GpuError::NoResources)?;
        Ok(ResourceSnapshot {
            connectors: handles.connectors().to_vec(),
            crtcs: handles.crtcs().to_vec(),
        })
    }

    pub fn connector_snapshot(
        &self,
        handle: connector::Handle,
    ) -> Result<ConnectorSnapshot<encoder::Handle, drm::control::Mode>, GpuError> {
        let info = self.get_connector(handle, false)?;
        Ok(ConnectorSnapshot {
            name: interface_name(&info),
            connected: info.state() == connector::State::Connected,
            current_encoder: info.current_encoder(),
            encoders: info.encoders().to_vec(),
            modes: info.modes().to_vec(),
        })
    }

    pub fn encoder_snapshot(&self, handle: encoder::Handle) -> Result<EncoderSnapshot, GpuError> {
        let info = self.get_encoder(handle)?;
        let handles = self.resource_handles()?;
        let compatible = handles.filter_crtcs(info.possible_crtcs());

        let mut possible_crtcs = 0u32;
        for (index, crtc) in handles.crtcs().iter().enumerate().take(32) {
            if compatible.contains(crtc) {
                possible_crtcs |= 1 << index;
            }
        }
        Ok(EncoderSnapshot { possible_crtcs })
    }

    pub fn wait_readable(&self, timeout: Option<Duration>) -> Result<bool, GpuError> {
        let mut fds = [PollFd::new(&self.fd, PollFlags::IN)];
        let timeout_ms = timeout.map_or(-1i32, |t| t.as_millis().min(i32::MAX as u128) as i32);
        match poll(&mut fds, timeout_ms) {
            Ok(n) => Ok(n > 0),
            Err(err) if err == Errno::INTR => Ok(false),
            Err(err) => Err(GpuError::Io(err.into())),
        }
    }

    pub fn pending_flip_events(&self) -> Result<Vec<FlipEvent<crtc::Handle>>, GpuError> {
        let events = match self.receive_events() {
            Ok(events) => events,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut completed = Vec::new();
        for event in events {
            match event {
                drm::control::Event::PageFlip(flip) => completed.push(FlipEvent {
                    crtc: flip.crtc,
                    frame: flip.frame,
                    time: flip.duration,
                }),
                drm::control::Event::Vblank(_) => {}
                _ => trace!("ignoring unknown drm event"),
            }
        }
        Ok(completed)
    }
}

impl Drop for GpuSession {
    fn drop(&mut self) {
        if let Err(err) = self.release_master_lock() {
            warn!(?err, "failed to drop drm master");
        }
    }
}

impl ModeInfo for drm::control::Mode {
    fn dimensions(&self) -> (u16, u16) {
        self.size()
    }

    fn refresh(&self) -> u32 {
        self.vrefresh()
    }

    fn is_preferred(&self) -> bool {
        self.mode_type().contains(ModeTypeFlags::PREFERRED)
    }
}

fn interface_name(info: &connector::Info) -> String {
    let other;
    let short = match info.interface() {
        connector::Interface::DVII => "DVI-I",
        connector::Interface::DVID => "DVI-D",
        connector::Interface::DVIA => "DVI-A",
        connector::Interface::SVideo => "S-VIDEO",
        connector::Interface::DisplayPort => "DP",
        connector::Interface::HDMIA => "HDMI-A",
        connector::Interface::HDMIB => "HDMI-B",
        connector::Interface::EmbeddedDisplayPort => "eDP",
        interface => {
            other = format!("{:?}", interface);
            &other
        }
    };
    format!("{}-{}", short, info.interface_id())
}
