// SPDX-License-Identifier: GPL-3.0-only

//! Scriptable stand-in for the DRM/GBM/EGL stack.
//!
//! Records every buffer lock, framebuffer attachment, mode-set and flip
//! so tests can check the engine's resource accounting, and lets tests
//! inject kernel rejections and synthesize vblank completions.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    io,
    sync::{Condvar, Mutex},
    thread::{self, ThreadId},
    time::{Duration, Instant},
};

use super::gpu::{
    ConnectorSnapshot, EncoderSnapshot, FlipError, FlipEvent, Gpu, GpuError, ModeInfo,
    ResourceSnapshot,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FakeMode {
    pub width: u16,
    pub height: u16,
    pub refresh_rate: u32,
    pub preferred: bool,
}

impl FakeMode {
    pub fn new(width: u16, height: u16, refresh_rate: u32) -> Self {
        Self {
            width,
            height,
            refresh_rate,
            preferred: false,
        }
    }

    pub fn preferred(width: u16, height: u16, refresh_rate: u32) -> Self {
        Self {
            preferred: true,
            ..Self::new(width, height, refresh_rate)
        }
    }
}

impl ModeInfo for FakeMode {
    fn dimensions(&self) -> (u16, u16) {
        (self.width, self.height)
    }

    fn refresh(&self) -> u32 {
        self.refresh_rate
    }

    fn is_preferred(&self) -> bool {
        self.preferred
    }
}

#[derive(Debug, Clone)]
pub struct FakeConnector {
    pub connected: bool,
    pub encoders: Vec<u32>,
    pub modes: Vec<FakeMode>,
}

#[derive(Debug)]
pub struct FakeSwapChain {
    id: u32,
}

#[derive(Debug)]
pub struct FakeBuffer {
    id: u64,
}

#[derive(Debug)]
pub struct FakeDrawContext {
    chain: u32,
}

#[derive(Default)]
struct ChainRecord {
    alive: bool,
    frame_ready: bool,
    free_pool: Vec<u64>,
    locked: Vec<u64>,
    framebuffers: HashMap<u64, u32>,
    threads: Vec<ThreadId>,
}

#[derive(Default)]
struct FakeState {
    connectors: BTreeMap<u32, FakeConnector>,
    encoder_masks: BTreeMap<u32, u32>,
    crtcs: Vec<u32>,

    chains: HashMap<u32, ChainRecord>,
    next_chain: u32,
    next_buffer: u64,
    next_framebuffer: u32,
    frame_seq: u32,

    pending_flips: HashMap<u32, u32>,
    events: VecDeque<FlipEvent<u32>>,
    scanout: HashMap<u32, u32>,
    disabled_crtcs: Vec<u32>,

    reject_mode_sets: u32,
    reject_flips_busy: u32,
    reject_flips_failed: u32,

    flips_attempted: u32,
    double_flip: bool,
    destroyed_with_locked: bool,
    total_locked: u64,
    total_released: u64,
    framebuffers_created: u32,
    framebuffers_removed: u32,
    framebuffer_attaches: HashMap<u64, u32>,
}

pub struct FakeGpu {
    state: Mutex<FakeState>,
    wakeup: Condvar,
}

impl FakeGpu {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            wakeup: Condvar::new(),
        }
    }

    pub fn set_crtcs(&self, crtcs: Vec<u32>) {
        self.state.lock().unwrap().crtcs = crtcs;
    }

    pub fn add_encoder(&self, id: u32, possible_crtcs: u32) {
        self.state
            .lock()
            .unwrap()
            .encoder_masks
            .insert(id, possible_crtcs);
    }

    pub fn add_connector(&self, id: u32, connector: FakeConnector) {
        self.state.lock().unwrap().connectors.insert(id, connector);
    }

    pub fn set_connected(&self, id: u32, connected: bool) {
        if let Some(connector) = self.state.lock().unwrap().connectors.get_mut(&id) {
            connector.connected = connected;
        }
    }

    pub fn reject_next_mode_sets(&self, count: u32) {
        self.state.lock().unwrap().reject_mode_sets = count;
    }

    pub fn reject_next_flips_with_busy(&self, count: u32) {
        self.state.lock().unwrap().reject_flips_busy = count;
    }

    pub fn reject_next_flips_with_error(&self, count: u32) {
        self.state.lock().unwrap().reject_flips_failed = count;
    }

    /// Latch every pending flip and queue its completion event, as the
    /// next vblank would.
    pub fn complete_flips(&self) {
        let mut state = self.state.lock().unwrap();
        let pending: Vec<(u32, u32)> = state.pending_flips.drain().collect();
        for (crtc, framebuffer) in pending {
            state.scanout.insert(crtc, framebuffer);
            state.frame_seq += 1;
            let event = FlipEvent {
                crtc,
                frame: state.frame_seq,
                time: Duration::from_millis(u64::from(state.frame_seq) * 16),
            };
            state.events.push_back(event);
        }
        self.wakeup.notify_all();
    }

    /// Queue a completion for a CRTC nothing flipped; exercises the
    /// unknown-cookie path.
    pub fn queue_spurious_event(&self, crtc: u32) {
        let mut state = self.state.lock().unwrap();
        state.frame_seq += 1;
        let event = FlipEvent {
            crtc,
            frame: state.frame_seq,
            time: Duration::ZERO,
        };
        state.events.push_back(event);
        self.wakeup.notify_all();
    }

    pub fn pending_flip_count(&self) -> usize {
        self.state.lock().unwrap().pending_flips.len()
    }

    pub fn flips_attempted(&self) -> u32 {
        self.state.lock().unwrap().flips_attempted
    }

    pub fn double_flip_detected(&self) -> bool {
        self.state.lock().unwrap().double_flip
    }

    pub fn destroyed_with_locked_buffers(&self) -> bool {
        self.state.lock().unwrap().destroyed_with_locked
    }

    pub fn locked_buffer_ids(&self) -> Vec<u64> {
        let state = self.state.lock().unwrap();
        let mut ids: Vec<u64> = state
            .chains
            .values()
            .flat_map(|chain| chain.locked.iter().copied())
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn buffer_balance(&self) -> (u64, u64) {
        let state = self.state.lock().unwrap();
        (state.total_locked, state.total_released)
    }

    pub fn scanout_fb(&self, crtc: u32) -> Option<u32> {
        self.state.lock().unwrap().scanout.get(&crtc).copied()
    }

    pub fn disabled_crtcs(&self) -> Vec<u32> {
        self.state.lock().unwrap().disabled_crtcs.clone()
    }

    pub fn framebuffer_counts(&self) -> (u32, u32) {
        let state = self.state.lock().unwrap();
        (state.framebuffers_created, state.framebuffers_removed)
    }

    pub fn framebuffer_attaches(&self) -> HashMap<u64, u32> {
        self.state.lock().unwrap().framebuffer_attaches.clone()
    }

    pub fn draw_threads(&self) -> Vec<ThreadId> {
        let state = self.state.lock().unwrap();
        state
            .chains
            .values()
            .flat_map(|chain| chain.threads.iter().copied())
            .collect()
    }
}

impl Gpu for FakeGpu {
    type ConnectorId = u32;
    type CrtcId = u32;
    type EncoderId = u32;
    type Mode = FakeMode;
    type Framebuffer = u32;
    type SwapChain = FakeSwapChain;
    type Buffer = FakeBuffer;
    type DrawContext = FakeDrawContext;

    fn resources(&self) -> Result<ResourceSnapshot<u32, u32>, GpuError> {
        let state = self.state.lock().unwrap();
        Ok(ResourceSnapshot {
            connectors: state.connectors.keys().copied().collect(),
            crtcs: state.crtcs.clone(),
        })
    }

    fn connector(&self, connector: u32) -> Result<ConnectorSnapshot<u32, FakeMode>, GpuError> {
        let state = self.state.lock().unwrap();
        let info = state
            .connectors
            .get(&connector)
            .ok_or_else(|| GpuError::Io(io::Error::other("no such connector")))?;
        Ok(ConnectorSnapshot {
            name: format!("FAKE-{}", connector),
            connected: info.connected,
            current_encoder: None,
            encoders: info.encoders.clone(),
            modes: info.modes.clone(),
        })
    }

    fn encoder(&self, encoder: u32) -> Result<EncoderSnapshot, GpuError> {
        let state = self.state.lock().unwrap();
        let possible_crtcs = state.encoder_masks.get(&encoder).copied().unwrap_or(0);
        Ok(EncoderSnapshot { possible_crtcs })
    }

    fn create_swapchain(&self, _size: (u32, u32)) -> Result<FakeSwapChain, GpuError> {
        let mut state = self.state.lock().unwrap();
        state.next_chain += 1;
        let id = state.next_chain;
        state.chains.insert(
            id,
            ChainRecord {
                alive: true,
                ..ChainRecord::default()
            },
        );
        Ok(FakeSwapChain { id })
    }

    fn destroy_swapchain(&self, chain: FakeSwapChain) {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        let Some(record) = state.chains.get_mut(&chain.id) else {
            return;
        };
        record.alive = false;
        if !record.locked.is_empty() {
            state.destroyed_with_locked = true;
        }
        state.framebuffers_removed += record.framebuffers.len() as u32;
        record.framebuffers.clear();
    }

    fn lock_front(&self, chain: &mut FakeSwapChain) -> Result<FakeBuffer, GpuError> {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        let record = state
            .chains
            .get_mut(&chain.id)
            .filter(|record| record.alive)
            .ok_or_else(|| GpuError::Io(io::Error::other("swapchain destroyed")))?;
        if !record.frame_ready {
            return Err(GpuError::Allocation(io::Error::other(
                "no frame swapped before lock",
            )));
        }
        record.frame_ready = false;
        record.threads.push(thread::current().id());
        let id = match record.free_pool.pop() {
            Some(id) => id,
            None => {
                state.next_buffer += 1;
                state.next_buffer
            }
        };
        record.locked.push(id);
        state.total_locked += 1;
        Ok(FakeBuffer { id })
    }

    fn release_buffer(&self, chain: &mut FakeSwapChain, buffer: FakeBuffer) {
        let mut state = self.state.lock().unwrap();
        if let Some(record) = state.chains.get_mut(&chain.id) {
            if let Some(position) = record.locked.iter().position(|id| *id == buffer.id) {
                record.locked.swap_remove(position);
                record.free_pool.push(buffer.id);
            }
        }
        state.total_released += 1;
    }

    fn ensure_framebuffer(
        &self,
        chain: &mut FakeSwapChain,
        buffer: &FakeBuffer,
    ) -> Result<u32, GpuError> {
        let mut state = self.state.lock().unwrap();
        if let Some(framebuffer) = state
            .chains
            .get(&chain.id)
            .and_then(|record| record.framebuffers.get(&buffer.id))
        {
            return Ok(*framebuffer);
        }

        state.next_framebuffer += 1;
        let framebuffer = state.next_framebuffer;
        state.framebuffers_created += 1;
        *state
            .framebuffer_attaches
            .entry(buffer.id)
            .or_insert(0) += 1;
        if let Some(record) = state.chains.get_mut(&chain.id) {
            record.framebuffers.insert(buffer.id, framebuffer);
        }
        Ok(framebuffer)
    }

    fn create_draw_context(&self, chain: &FakeSwapChain) -> Result<FakeDrawContext, GpuError> {
        let mut state = self.state.lock().unwrap();
        if let Some(record) = state.chains.get_mut(&chain.id) {
            record.threads.push(thread::current().id());
        }
        Ok(FakeDrawContext { chain: chain.id })
    }

    fn clear(&self, ctx: &FakeDrawContext, _color: [f32; 4]) {
        let mut state = self.state.lock().unwrap();
        if let Some(record) = state.chains.get_mut(&ctx.chain) {
            record.threads.push(thread::current().id());
        }
    }

    fn swap_buffers(&self, ctx: &FakeDrawContext) -> Result<(), GpuError> {
        let mut state = self.state.lock().unwrap();
        if let Some(record) = state.chains.get_mut(&ctx.chain) {
            record.threads.push(thread::current().id());
            record.frame_ready = true;
        }
        Ok(())
    }

    fn release_draw_context(&self, ctx: FakeDrawContext) {
        let mut state = self.state.lock().unwrap();
        if let Some(record) = state.chains.get_mut(&ctx.chain) {
            record.threads.push(thread::current().id());
        }
    }

    fn set_crtc(
        &self,
        crtc: u32,
        framebuffer: u32,
        _connector: u32,
        _mode: &FakeMode,
    ) -> Result<(), GpuError> {
        let mut state = self.state.lock().unwrap();
        if state.reject_mode_sets > 0 {
            state.reject_mode_sets -= 1;
            return Err(GpuError::ModeSet(io::Error::other(
                "mode-set rejected by fake",
            )));
        }
        state.scanout.insert(crtc, framebuffer);
        Ok(())
    }

    fn disable_crtc(&self, crtc: u32) -> Result<(), GpuError> {
        let mut state = self.state.lock().unwrap();
        state.scanout.remove(&crtc);
        state.pending_flips.remove(&crtc);
        state.disabled_crtcs.push(crtc);
        Ok(())
    }

    fn page_flip(&self, crtc: u32, framebuffer: u32) -> Result<(), FlipError> {
        let mut state = self.state.lock().unwrap();
        state.flips_attempted += 1;
        if state.reject_flips_busy > 0 {
            state.reject_flips_busy -= 1;
            return Err(FlipError::Busy);
        }
        if state.reject_flips_failed > 0 {
            state.reject_flips_failed -= 1;
            return Err(FlipError::Failed(io::Error::other(
                "flip rejected by fake",
            )));
        }
        if state.pending_flips.contains_key(&crtc) {
            state.double_flip = true;
            return Err(FlipError::Failed(io::Error::other("flip already pending")));
        }
        state.pending_flips.insert(crtc, framebuffer);
        Ok(())
    }

    fn wait_events(&self, timeout: Option<Duration>) -> Result<bool, GpuError> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.state.lock().unwrap();
        loop {
            if !state.events.is_empty() {
                return Ok(true);
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    let (guard, _) = self
                        .wakeup
                        .wait_timeout(state, deadline - now)
                        .unwrap();
                    state = guard;
                }
                None => state = self.wakeup.wait(state).unwrap(),
            }
        }
    }

    fn receive_events(&self) -> Result<Vec<FlipEvent<u32>>, GpuError> {
        let mut state = self.state.lock().unwrap();
        Ok(state.events.drain(..).collect())
    }
}
