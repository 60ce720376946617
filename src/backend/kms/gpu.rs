// SPDX-License-Identifier: GPL-3.0-only

//! The seam between the display engine and the hardware it drives.
//!
//! Everything above this trait (mode selection, CRTC assignment, the
//! per-display flip state machine) is pure bookkeeping; everything below it
//! (`DrmGpu`) talks to the kernel and the GL stack. Tests substitute a
//! recording fake.

use std::{fmt, hash::Hash, io, time::Duration};

use thiserror::Error;

/// Read access to a display timing, enough to drive mode selection.
pub trait ModeInfo {
    /// Active area as (horizontal, vertical) pixels.
    fn dimensions(&self) -> (u16, u16);
    /// Vertical refresh rate in Hz.
    fn refresh(&self) -> u32;
    /// Whether the connector marks this timing as preferred.
    fn is_preferred(&self) -> bool;

    fn area(&self) -> u32 {
        let (w, h) = self.dimensions();
        u32::from(w) * u32::from(h)
    }
}

/// Connector and CRTC id lists as reported by the device.
///
/// The CRTC list is positional: bit `i` of an encoder's `possible_crtcs`
/// mask refers to `crtcs[i]`.
#[derive(Debug, Clone)]
pub struct ResourceSnapshot<C, R> {
    pub connectors: Vec<C>,
    pub crtcs: Vec<R>,
}

#[derive(Debug, Clone)]
pub struct ConnectorSnapshot<E, M> {
    pub name: String,
    pub connected: bool,
    pub current_encoder: Option<E>,
    pub encoders: Vec<E>,
    pub modes: Vec<M>,
}

#[derive(Debug, Clone, Copy)]
pub struct EncoderSnapshot {
    pub possible_crtcs: u32,
}

/// A completed page flip, latched at vblank.
#[derive(Debug, Clone, Copy)]
pub struct FlipEvent<C> {
    pub crtc: C,
    pub frame: u32,
    pub time: Duration,
}

#[derive(Debug, Error)]
pub enum GpuError {
    #[error("failed to open drm device: {0}")]
    DeviceOpen(#[source] io::Error),
    #[error("failed to acquire drm master: {0}")]
    MasterAcquire(#[source] io::Error),
    #[error("failed to query display resources: {0}")]
    NoResources(#[source] io::Error),
    #[error("failed to create buffer device: {0}")]
    BufferDevice(#[source] io::Error),
    #[error("egl: {0}")]
    EglInit(String),
    #[error("failed to create share context: {0}")]
    MasterContext(String),
    #[error("failed to create render context: {0}")]
    ContextCreate(String),
    #[error("buffer allocation failed: {0}")]
    Allocation(#[source] io::Error),
    #[error("kernel rejected mode-set: {0}")]
    ModeSet(#[source] io::Error),
    #[error("failed to present frame: {0}")]
    Present(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum FlipError {
    /// The CRTC still holds an earlier flip; retry after the next vblank.
    #[error("page flip queue is busy")]
    Busy,
    #[error("page flip failed: {0}")]
    Failed(#[source] io::Error),
}

/// A GPU as the display engine sees it: a mode-setting node, a scanout
/// buffer allocator and an accelerated rendering stack sharing one
/// resource namespace.
///
/// Swap chains, buffers and draw contexts are only ever touched from the
/// worker thread that created them; the handle types therefore carry no
/// `Send` bounds, and implementations are free to make them thread-pinned.
pub trait Gpu: Send + Sync + Sized + 'static {
    type ConnectorId: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static;
    type CrtcId: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static;
    type EncoderId: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static;
    type Mode: ModeInfo + Clone + Send + 'static;
    type Framebuffer: Copy + Eq + fmt::Debug + Send + 'static;
    type SwapChain;
    type Buffer: fmt::Debug;
    type DrawContext;

    fn resources(&self) -> Result<ResourceSnapshot<Self::ConnectorId, Self::CrtcId>, GpuError>;
    fn connector(
        &self,
        connector: Self::ConnectorId,
    ) -> Result<ConnectorSnapshot<Self::EncoderId, Self::Mode>, GpuError>;
    fn encoder(&self, encoder: Self::EncoderId) -> Result<EncoderSnapshot, GpuError>;

    fn create_swapchain(&self, size: (u32, u32)) -> Result<Self::SwapChain, GpuError>;
    fn destroy_swapchain(&self, chain: Self::SwapChain);
    fn lock_front(&self, chain: &mut Self::SwapChain) -> Result<Self::Buffer, GpuError>;
    fn release_buffer(&self, chain: &mut Self::SwapChain, buffer: Self::Buffer);
    /// Attach a scanout framebuffer to the buffer, or return the one
    /// attached by an earlier lock of the same buffer.
    fn ensure_framebuffer(
        &self,
        chain: &mut Self::SwapChain,
        buffer: &Self::Buffer,
    ) -> Result<Self::Framebuffer, GpuError>;

    /// Create a draw context over the swap chain and make it current on
    /// the calling thread. The context must not be used from any other
    /// thread afterwards.
    fn create_draw_context(&self, chain: &Self::SwapChain) -> Result<Self::DrawContext, GpuError>;
    fn clear(&self, ctx: &Self::DrawContext, color: [f32; 4]);
    fn swap_buffers(&self, ctx: &Self::DrawContext) -> Result<(), GpuError>;
    fn release_draw_context(&self, ctx: Self::DrawContext);

    fn set_crtc(
        &self,
        crtc: Self::CrtcId,
        framebuffer: Self::Framebuffer,
        connector: Self::ConnectorId,
        mode: &Self::Mode,
    ) -> Result<(), GpuError>;
    fn disable_crtc(&self, crtc: Self::CrtcId) -> Result<(), GpuError>;
    fn page_flip(&self, crtc: Self::CrtcId, framebuffer: Self::Framebuffer)
        -> Result<(), FlipError>;

    /// Block until page-flip events are readable, or the timeout elapses.
    fn wait_events(&self, timeout: Option<Duration>) -> Result<bool, GpuError>;
    fn receive_events(&self) -> Result<Vec<FlipEvent<Self::CrtcId>>, GpuError>;
}
