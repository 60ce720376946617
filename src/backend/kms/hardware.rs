// SPDX-License-Identifier: GPL-3.0-only

//! The production [`Gpu`] implementation over the kernel and GL stacks.

use std::{path::Path, time::Duration};

use drm::control::{connector, crtc, encoder, framebuffer, Device as ControlDevice, PageFlipFlags};
use rustix::io::Errno;
use tracing::info;

use super::buffers::{BufferDevice, LockedBuffer, SwapChain};
use super::device::GpuSession;
use super::gpu::{
    ConnectorSnapshot, EncoderSnapshot, FlipError, FlipEvent, Gpu, GpuError, ResourceSnapshot,
};
use super::render::{DisplayContext, MasterContext, RenderDisplay};

/// One opened GPU: session, buffer allocator and render stack.
///
/// Field order pins teardown: the share context drops before the EGL
/// display, the display before the GBM device, and everything before the
/// session holding DRM master.
pub struct DrmGpu {
    master: MasterContext,
    render: RenderDisplay,
    buffers: BufferDevice,
    session: GpuSession,
}

impl DrmGpu {
    pub fn open(path: &Path) -> Result<Self, GpuError> {
        info!("Opening DRM device {}", path.display());
        let session = GpuSession::open(path)?;
        let buffers = BufferDevice::new(session.device_fd())?;
        let render = RenderDisplay::new(buffers.raw_handle())?;
        let master = MasterContext::new(&render)?;

        Ok(Self {
            master,
            render,
            buffers,
            session,
        })
    }
}

impl Gpu for DrmGpu {
    type ConnectorId = connector::Handle;
    type CrtcId = crtc::Handle;
    type EncoderId = encoder::Handle;
    type Mode = drm::control::Mode;
    type Framebuffer = framebuffer::Handle;
    type SwapChain = SwapChain;
    type Buffer = LockedBuffer;
    type DrawContext = DisplayContext;

    fn resources(&self) -> Result<ResourceSnapshot<connector::Handle, crtc::Handle>, GpuError> {
        self.session.mode_resources()
    }

    fn connector(
        &self,
        connector: connector::Handle,
    ) -> Result<ConnectorSnapshot<encoder::Handle, drm::control::Mode>, GpuError> {
        self.session.connector_snapshot(connector)
    }

    fn encoder(&self, encoder: encoder::Handle) -> Result<EncoderSnapshot, GpuError> {
        self.session.encoder_snapshot(encoder)
    }

    fn create_swapchain(&self, size: (u32, u32)) -> Result<SwapChain, GpuError> {
        self.buffers.create_swapchain(size)
    }

    fn destroy_swapchain(&self, chain: SwapChain) {
        chain.destroy(&self.session);
    }

    fn lock_front(&self, chain: &mut SwapChain) -> Result<LockedBuffer, GpuError> {
        chain.lock_front()
    }

    fn release_buffer(&self, chain: &mut SwapChain, buffer: LockedBuffer) {
        chain.release(buffer);
    }

    fn ensure_framebuffer(
        &self,
        chain: &mut SwapChain,
        buffer: &LockedBuffer,
    ) -> Result<framebuffer::Handle, GpuError> {
        chain.ensure_framebuffer(&self.session, buffer)
    }

    fn create_draw_context(&self, chain: &SwapChain) -> Result<DisplayContext, GpuError> {
        DisplayContext::new(&self.render, &self.master, chain.window_handle())
    }

    fn clear(&self, ctx: &DisplayContext, color: [f32; 4]) {
        ctx.clear(color);
    }

    fn swap_buffers(&self, ctx: &DisplayContext) -> Result<(), GpuError> {
        ctx.swap_buffers()
    }

    fn release_draw_context(&self, ctx: DisplayContext) {
        drop(ctx);
    }

    fn set_crtc(
        &self,
        crtc: crtc::Handle,
        framebuffer: framebuffer::Handle,
        connector: connector::Handle,
        mode: &Self::Mode,
    ) -> Result<(), GpuError> {
        self.session
            .set_crtc(crtc, Some(framebuffer), (0, 0), &[connector], Some(*mode))
            .map_err(GpuError::ModeSet)
    }

    fn disable_crtc(&self, crtc: crtc::Handle) -> Result<(), GpuError> {
        // Null commit; the legacy api needs this to stop scanout.
        self.session
            .set_crtc(crtc, None, (0, 0), &[], None)
            .map_err(GpuError::ModeSet)
    }

    fn page_flip(
        &self,
        crtc: crtc::Handle,
        framebuffer: framebuffer::Handle,
    ) -> Result<(), FlipError> {
        self.session
            .page_flip(crtc, framebuffer, PageFlipFlags::EVENT, None)
            .map_err(|err| {
                if err.raw_os_error() == Some(Errno::BUSY.raw_os_error()) {
                    FlipError::Busy
                } else {
                    FlipError::Failed(err)
                }
            })
    }

    fn wait_events(&self, timeout: Option<Duration>) -> Result<bool, GpuError> {
        self.session.wait_readable(timeout)
    }

    fn receive_events(&self) -> Result<Vec<FlipEvent<crtc::Handle>>, GpuError> {
        self.session.pending_flip_events()
    }
}
