// SPDX-License-Identifier: GPL-3.0-only

//! Per-monitor display state machine.
//!
//! Every [`Display`] owns a dedicated worker thread; the worker is the
//! only thread that ever makes the display's draw context current or
//! touches its buffer slots. The coordinator talks to it exclusively
//! through the command channel and routes page-flip completions back as
//! [`ThreadCommand::Tick`].

use std::{
    io,
    sync::{
        atomic::{AtomicU8, Ordering},
        mpsc::{self, SyncSender},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use calloop::channel::{self, Channel, Event, Sender};
use calloop::EventLoop;
use tracing::{debug, error, info, trace, warn};

use super::drm_helpers;
use super::gpu::{FlipError, FlipEvent, Gpu, GpuError, ModeInfo};

/// Extra slack past one refresh interval before a shutdown gives up on an
/// outstanding flip and disables the CRTC instead.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(5);

/// Neutral grey for the frame backing the initial mode-set.
const MODE_SET_COLOR: [f32; 4] = [0.5, 0.5, 0.5, 1.0];

pub type DrawFn<G> = Box<dyn FnOnce(&<G as Gpu>::DrawContext) + Send>;

/// Lifecycle of a display, advanced only on its worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    Uninitialized = 0,
    /// First frame locked and the CRTC driving it.
    Armed = 1,
    /// Scanning out `current` with no flip outstanding.
    Scanning = 2,
    /// A flip was accepted by the kernel and has not latched yet.
    FlipPending = 3,
    Closed = 4,
}

impl Phase {
    fn from_u8(value: u8) -> Phase {
        match value {
            0 => Phase::Uninitialized,
            1 => Phase::Armed,
            2 => Phase::Scanning,
            3 => Phase::FlipPending,
            _ => Phase::Closed,
        }
    }
}

pub enum ThreadCommand<G: Gpu> {
    Attach {
        mode: G::Mode,
        result: SyncSender<Result<(), GpuError>>,
    },
    Frame(DrawFn<G>),
    Tick(FlipEvent<G::CrtcId>),
    Detach,
}

/// Worker-to-coordinator notifications, drained in
/// `DeviceManager::poll_events`.
#[derive(Debug)]
pub enum DisplayEvent {
    FrameLatched { frame: u32, time: Duration },
    FlipBusy,
    Failed(GpuError),
}

/// Coordinator-side handle to one monitor.
pub struct Display<G: Gpu> {
    connector: G::ConnectorId,
    crtc: G::CrtcId,
    name: String,
    commands: Sender<ThreadCommand<G>>,
    phase: Arc<AtomicU8>,
    thread: Option<JoinHandle<()>>,
}

impl<G: Gpu> Display<G> {
    /// Spawn the worker and perform the initial mode-set on it. Blocks
    /// until the worker reports the outcome; on failure the worker is
    /// already gone and no resources remain allocated.
    pub fn new(
        gpu: Arc<G>,
        connector: G::ConnectorId,
        crtc: G::CrtcId,
        mode: G::Mode,
        name: String,
        events: mpsc::Sender<(G::ConnectorId, DisplayEvent)>,
    ) -> Result<Self, GpuError> {
        let (commands, channel) = channel::channel();
        let phase = Arc::new(AtomicU8::new(Phase::Uninitialized as u8));
        let refresh = drm_helpers::refresh_interval(mode.refresh());

        // The worker state (swap chain, draw context, buffer slots) is
        // built on the worker itself; only plain ids and channels cross
        // the spawn boundary.
        let worker_name = name.clone();
        let worker_phase = phase.clone();
        let thread = thread::Builder::new()
            .name(format!("display-{}", name))
            .spawn(move || {
                if let Err(err) = display_thread(
                    gpu,
                    connector,
                    crtc,
                    worker_name,
                    refresh,
                    worker_phase,
                    events,
                    channel,
                ) {
                    error!(?err, "display thread exited with error");
                }
            })?;

        let (result_tx, result_rx) = mpsc::sync_channel(1);
        let _ = commands.send(ThreadCommand::Attach {
            mode,
            result: result_tx,
        });

        let mut display = Display {
            connector,
            crtc,
            name,
            commands,
            phase,
            thread: Some(thread),
        };
        match result_rx.recv() {
            Ok(Ok(())) => Ok(display),
            Ok(Err(err)) => {
                display.join();
                Err(err)
            }
            Err(_) => {
                display.join();
                Err(GpuError::Io(io::Error::other(
                    "display thread died during mode-set",
                )))
            }
        }
    }

    pub fn connector(&self) -> G::ConnectorId {
        self.connector
    }

    pub fn crtc(&self) -> G::CrtcId {
        self.crtc
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    /// Enqueue a frame. The closure runs on the worker thread with the
    /// display context current and must only issue GL calls.
    pub fn submit_frame<F>(&self, draw_fn: F)
    where
        F: FnOnce(&G::DrawContext) + Send + 'static,
    {
        let _ = self.commands.send(ThreadCommand::Frame(Box::new(draw_fn)));
    }

    /// Relay a page-flip completion to the worker.
    pub fn on_flip_complete(&self, event: FlipEvent<G::CrtcId>) {
        let _ = self.commands.send(ThreadCommand::Tick(event));
    }

    /// Stop the worker and wait for it to tear down. An outstanding flip
    /// is given one refresh interval to latch before the CRTC is forced
    /// off. Idempotent.
    pub fn release(&mut self) {
        if self.thread.is_some() {
            let _ = self.commands.send(ThreadCommand::Detach);
            self.join();
        }
    }

    fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("display thread for {} panicked", self.name);
            }
        }
    }
}

impl<G: Gpu> Drop for Display<G> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Everything the worker thread owns. Slot fields come before the draw
/// context and swap chain so a stray drop releases buffers before the
/// pool that owns them.
struct DisplayThreadState<G: Gpu> {
    gpu: Arc<G>,
    connector: G::ConnectorId,
    crtc: G::CrtcId,
    name: String,
    refresh: Duration,
    phase: Arc<AtomicU8>,
    events: mpsc::Sender<(G::ConnectorId, DisplayEvent)>,

    current: Option<G::Buffer>,
    pending: Option<G::Buffer>,
    ctx: Option<G::DrawContext>,
    chain: Option<G::SwapChain>,

    queued_draw: Option<DrawFn<G>>,
    draining: Option<Instant>,
    armed_once: bool,
    done: bool,
}

#[allow(clippy::too_many_arguments)]
fn display_thread<G: Gpu>(
    gpu: Arc<G>,
    connector: G::ConnectorId,
    crtc: G::CrtcId,
    name: String,
    refresh: Duration,
    phase: Arc<AtomicU8>,
    events: mpsc::Sender<(G::ConnectorId, DisplayEvent)>,
    commands: Channel<ThreadCommand<G>>,
) -> Result<(), calloop::Error> {
    let mut state = DisplayThreadState {
        gpu,
        connector,
        crtc,
        name,
        refresh,
        phase,
        events,
        current: None,
        pending: None,
        ctx: None,
        chain: None,
        queued_draw: None,
        draining: None,
        armed_once: false,
        done: false,
    };

    let mut event_loop = EventLoop::<DisplayThreadState<G>>::try_new()?;
    event_loop
        .handle()
        .insert_source(commands, |event, _, state: &mut DisplayThreadState<G>| {
            match event {
                Event::Msg(command) => state.handle_command(command),
                Event::Closed => state.begin_detach(),
            }
        })
        .map_err(|err| err.error)?;

    while !state.done {
        let timeout = state.drain_timeout();
        event_loop.dispatch(timeout, &mut state)?;
        state.check_drain_deadline();
    }
    state.teardown();
    Ok(())
}

impl<G: Gpu> DisplayThreadState<G> {
    fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::SeqCst);
    }

    fn handle_command(&mut self, command: ThreadCommand<G>) {
        match command {
            ThreadCommand::Attach { mode, result } => {
                let outcome = self.attach(&mode);
                if outcome.is_err() {
                    self.done = true;
                }
                let _ = result.send(outcome);
            }
            ThreadCommand::Frame(draw_fn) => self.queue_frame(draw_fn),
            ThreadCommand::Tick(event) => self.finish_flip(event),
            ThreadCommand::Detach => self.begin_detach(),
        }
    }

    /// Initial mode-set: render one grey frame, lock it, and point the
    /// CRTC at it.
    fn attach(&mut self, mode: &G::Mode) -> Result<(), GpuError> {
        debug_assert_eq!(self.phase(), Phase::Uninitialized);

        let (width, height) = mode.dimensions();
        let mut chain = self
            .gpu
            .create_swapchain((u32::from(width), u32::from(height)))?;
        let ctx = match self.gpu.create_draw_context(&chain) {
            Ok(ctx) => ctx,
            Err(err) => {
                self.gpu.destroy_swapchain(chain);
                return Err(err);
            }
        };

        self.gpu.clear(&ctx, MODE_SET_COLOR);
        if let Err(err) = self.gpu.swap_buffers(&ctx) {
            self.gpu.release_draw_context(ctx);
            self.gpu.destroy_swapchain(chain);
            return Err(err);
        }
        let front = match self.gpu.lock_front(&mut chain) {
            Ok(front) => front,
            Err(err) => {
                self.gpu.release_draw_context(ctx);
                self.gpu.destroy_swapchain(chain);
                return Err(err);
            }
        };
        let framebuffer = match self.gpu.ensure_framebuffer(&mut chain, &front) {
            Ok(framebuffer) => framebuffer,
            Err(err) => {
                self.gpu.release_buffer(&mut chain, front);
                self.gpu.release_draw_context(ctx);
                self.gpu.destroy_swapchain(chain);
                return Err(err);
            }
        };
        if let Err(err) = self
            .gpu
            .set_crtc(self.crtc, framebuffer, self.connector, mode)
        {
            // The locked frame goes back to the pool before we bail.
            self.gpu.release_buffer(&mut chain, front);
            self.gpu.release_draw_context(ctx);
            self.gpu.destroy_swapchain(chain);
            return Err(err);
        }

        self.current = Some(front);
        self.ctx = Some(ctx);
        self.chain = Some(chain);
        self.armed_once = true;
        self.set_phase(Phase::Armed);
        info!(
            "Lit up {} at {}x{}@{}",
            self.name,
            width,
            height,
            mode.refresh()
        );
        Ok(())
    }

    fn queue_frame(&mut self, draw_fn: DrawFn<G>) {
        if self.done || self.draining.is_some() {
            return;
        }
        match self.phase() {
            Phase::Armed | Phase::Scanning => self.begin_flip(draw_fn),
            Phase::FlipPending => {
                if self.queued_draw.replace(draw_fn).is_some() {
                    trace!("dropping stale frame for {}", self.name);
                }
            }
            Phase::Uninitialized | Phase::Closed => {
                debug!("ignoring frame for inactive display {}", self.name);
            }
        }
    }

    /// Draw, swap, lock the produced frame and submit it to the kernel.
    fn begin_flip(&mut self, draw_fn: DrawFn<G>) {
        debug_assert!(self.current.is_some(), "begin_flip before mode_set");
        debug_assert!(self.pending.is_none(), "begin_flip with a flip in flight");

        let (Some(ctx), Some(chain)) = (self.ctx.as_ref(), self.chain.as_mut()) else {
            return;
        };

        draw_fn(ctx);
        if let Err(err) = self.gpu.swap_buffers(ctx) {
            self.fail(err);
            return;
        }
        let front = match self.gpu.lock_front(chain) {
            Ok(front) => front,
            Err(err) => {
                self.fail(err);
                return;
            }
        };
        let framebuffer = match self.gpu.ensure_framebuffer(chain, &front) {
            Ok(framebuffer) => framebuffer,
            Err(err) => {
                self.gpu.release_buffer(chain, front);
                self.fail(err);
                return;
            }
        };

        match self.gpu.page_flip(self.crtc, framebuffer) {
            Ok(()) => {
                self.pending = Some(front);
                self.set_phase(Phase::FlipPending);
            }
            Err(FlipError::Busy) => {
                // Must not leak into the pending slot; the caller simply
                // retries with its next frame.
                self.gpu.release_buffer(chain, front);
                debug!("page flip busy on {}", self.name);
                let _ = self.events.send((self.connector, DisplayEvent::FlipBusy));
            }
            Err(FlipError::Failed(err)) => {
                self.gpu.release_buffer(chain, front);
                self.fail(GpuError::Io(err));
            }
        }
    }

    /// The kernel latched the pending frame: retire the old scanout
    /// buffer and promote the pending one. No GL work happens here.
    fn finish_flip(&mut self, event: FlipEvent<G::CrtcId>) {
        if self.phase() != Phase::FlipPending {
            debug!("spurious flip completion for {}", self.name);
            return;
        }
        let Some(chain) = self.chain.as_mut() else {
            return;
        };

        if let Some(old) = self.current.take() {
            self.gpu.release_buffer(chain, old);
        }
        self.current = self.pending.take();
        self.set_phase(Phase::Scanning);
        trace!(
            frame = event.frame,
            "flip latched on {} at {:?}",
            self.name,
            event.time
        );
        let _ = self.events.send((
            self.connector,
            DisplayEvent::FrameLatched {
                frame: event.frame,
                time: event.time,
            },
        ));

        if self.draining.is_some() {
            self.done = true;
            return;
        }
        if let Some(draw_fn) = self.queued_draw.take() {
            self.begin_flip(draw_fn);
        }
    }

    fn fail(&mut self, err: GpuError) {
        warn!(?err, "display {} failed", self.name);
        // The coordinator releases us on this message; stop producing
        // frames in the meantime.
        self.queued_draw = None;
        let _ = self
            .events
            .send((self.connector, DisplayEvent::Failed(err)));
    }

    fn begin_detach(&mut self) {
        if self.done || self.draining.is_some() {
            return;
        }
        if self.phase() == Phase::FlipPending {
            // Give the outstanding flip one refresh cycle to latch before
            // forcing the CRTC off.
            self.draining = Some(Instant::now() + self.refresh + SHUTDOWN_GRACE);
        } else {
            self.done = true;
        }
    }

    fn drain_timeout(&self) -> Option<Duration> {
        self.draining
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    fn check_drain_deadline(&mut self) {
        if let Some(deadline) = self.draining {
            if !self.done && Instant::now() >= deadline {
                warn!(
                    "flip completion never arrived for {}, forcing CRTC off",
                    self.name
                );
                self.done = true;
            }
        }
    }

    fn teardown(&mut self) {
        self.queued_draw = None;
        if self.armed_once {
            // Scanout has to stop before its buffers go back to the pool.
            if let Err(err) = self.gpu.disable_crtc(self.crtc) {
                warn!(?err, "failed to disable CRTC for {}", self.name);
            }
        }
        if let Some(chain) = self.chain.as_mut() {
            if let Some(pending) = self.pending.take() {
                self.gpu.release_buffer(chain, pending);
            }
            if let Some(current) = self.current.take() {
                self.gpu.release_buffer(chain, current);
            }
        }
        if let Some(ctx) = self.ctx.take() {
            self.gpu.release_draw_context(ctx);
        }
        if let Some(chain) = self.chain.take() {
            self.gpu.destroy_swapchain(chain);
        }
        self.set_phase(Phase::Closed);
    }
}
