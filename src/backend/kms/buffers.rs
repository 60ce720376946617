// SPDX-License-Identifier: GPL-3.0-only

//! GBM-backed swap chains and their scanout framebuffer attachments.

use std::{collections::HashMap, fmt, io, sync::Mutex};

use drm::buffer::Buffer as DrmBuffer;
use drm::control::{framebuffer, Device as ControlDevice};
use gbm::{AsRaw, BufferObjectFlags, Format};
use tracing::warn;

use super::device::{DeviceFd, GpuSession};
use super::gpu::GpuError;

// XRGB8888: 24 bits of colour in a 32-bit word.
const FB_DEPTH: u32 = 24;
const FB_BPP: u32 = 32;

/// GBM allocator bound to the GPU session.
pub struct BufferDevice {
    // libgbm device state is not thread-safe; swap-chain creation from
    // the display workers serializes here.
    gbm: Mutex<gbm::Device<DeviceFd>>,
}

impl BufferDevice {
    pub fn new(fd: DeviceFd) -> Result<Self, GpuError> {
        let gbm = gbm::Device::new(fd).map_err(GpuError::BufferDevice)?;
        Ok(Self {
            gbm: Mutex::new(gbm),
        })
    }

    /// Raw device pointer for binding the EGL platform display. Only used
    /// during startup, before any worker threads exist.
    pub fn raw_handle(&self) -> *mut std::ffi::c_void {
        self.gbm.lock().unwrap().as_raw() as *mut _
    }

    pub fn create_swapchain(&self, (width, height): (u32, u32)) -> Result<SwapChain, GpuError> {
        let surface = self
            .gbm
            .lock()
            .unwrap()
            .create_surface::<()>(
                width,
                height,
                Format::Xrgb8888,
                BufferObjectFlags::SCANOUT | BufferObjectFlags::RENDERING,
            )
            .map_err(GpuError::Allocation)?;
        Ok(SwapChain {
            surface,
            framebuffers: HashMap::new(),
        })
    }
}

/// A GPU-side swap chain plus the KMS framebuffers attached to its
/// buffer pool.
///
/// GBM cycles through a small fixed pool of buffer objects, so each one
/// gets a framebuffer attached on its first lock and keeps it until the
/// pool dies with the surface.
pub struct SwapChain {
    surface: gbm::Surface<()>,
    framebuffers: HashMap<drm::buffer::Handle, framebuffer::Handle>,
}

/// Front buffer ownership taken from a swap chain. Must go back to the
/// chain exactly once, and only after it stopped scanning out.
pub struct LockedBuffer {
    bo: gbm::BufferObject<()>,
}

impl fmt::Debug for LockedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockedBuffer")
            .field("gem", &DrmBuffer::handle(&self.bo))
            .finish()
    }
}

impl SwapChain {
    /// Native window handle for EGL surface creation.
    pub fn window_handle(&self) -> *mut std::ffi::c_void {
        self.surface.as_raw() as *mut _
    }

    pub fn lock_front(&mut self) -> Result<LockedBuffer, GpuError> {
        let bo = unsafe { self.surface.lock_front_buffer() }.map_err(|err| {
            GpuError::Allocation(io::Error::other(format!(
                "failed to lock front buffer: {}",
                err
            )))
        })?;
        Ok(LockedBuffer { bo })
    }

    pub fn release(&mut self, buffer: LockedBuffer) {
        drop(buffer);
    }

    pub fn ensure_framebuffer(
        &mut self,
        session: &GpuSession,
        buffer: &LockedBuffer,
    ) -> Result<framebuffer::Handle, GpuError> {
        let gem = DrmBuffer::handle(&buffer.bo);
        if let Some(framebuffer) = self.framebuffers.get(&gem) {
            return Ok(*framebuffer);
        }

        let framebuffer = session
            .add_framebuffer(&buffer.bo, FB_DEPTH, FB_BPP)
            .map_err(GpuError::Allocation)?;
        self.framebuffers.insert(gem, framebuffer);
        Ok(framebuffer)
    }

    /// Remove every attached framebuffer, then drop the surface and its
    /// buffer pool. All locked buffers must have been released.
    pub fn destroy(mut self, session: &GpuSession) {
        for (_, framebuffer) in self.framebuffers.drain() {
            if let Err(err) = session.destroy_framebuffer(framebuffer) {
                warn!(?err, "failed to remove framebuffer");
            }
        }
    }
}
