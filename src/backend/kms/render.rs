// SPDX-License-Identifier: GPL-3.0-only

//! EGL display, the surfaceless share-root context and the per-display
//! draw contexts.
//!
//! EGL keeps "which context is current" in thread-local state, so a
//! [`DisplayContext`] is pinned to the worker thread that created it and
//! deliberately not `Send`.

use std::{ffi::c_void, marker::PhantomData, sync::Arc};

use khronos_egl as egl;
use tracing::{debug, info, warn};

use super::gpu::GpuError;

type EglInstance = egl::DynamicInstance<egl::EGL1_5>;

// EGL_KHR_platform_gbm; not part of the core enums the crate ships.
const PLATFORM_GBM_KHR: egl::Enum = 0x31d7;

const CONFIG_ATTRIBUTES: [egl::Int; 13] = [
    egl::SURFACE_TYPE,
    egl::WINDOW_BIT,
    egl::RED_SIZE,
    8,
    egl::GREEN_SIZE,
    8,
    egl::BLUE_SIZE,
    8,
    egl::ALPHA_SIZE,
    0,
    egl::RENDERABLE_TYPE,
    egl::OPENGL_ES3_BIT,
    egl::NONE,
];

const CONTEXT_ATTRIBUTES: [egl::Int; 3] = [egl::CONTEXT_CLIENT_VERSION, 3, egl::NONE];

/// EGL display platform-bound to the GBM device.
pub struct RenderDisplay {
    egl: Arc<EglInstance>,
    display: egl::Display,
    config: egl::Config,
}

// EGL object handles are process-global names; only current-ness is
// thread-local. Sharing the handles across threads is sound.
unsafe impl Send for RenderDisplay {}
unsafe impl Sync for RenderDisplay {}

impl RenderDisplay {
    pub fn new(gbm_device: *mut c_void) -> Result<Self, GpuError> {
        let egl = unsafe { EglInstance::load_required() }
            .map_err(|err| GpuError::EglInit(format!("failed to load libEGL: {}", err)))?;
        let egl = Arc::new(egl);

        let display = unsafe {
            egl.get_platform_display(PLATFORM_GBM_KHR, gbm_device, &[egl::ATTRIB_NONE])
        }
        .map_err(|err| GpuError::EglInit(format!("no EGL display for gbm device: {}", err)))?;

        let (major, minor) = egl
            .initialize(display)
            .map_err(|err| GpuError::EglInit(format!("failed to initialize EGL: {}", err)))?;
        info!("EGL version: {}.{}", major, minor);
        for (label, name) in [
            ("EGL vendor", egl::VENDOR),
            ("EGL extensions", egl::EXTENSIONS),
        ] {
            match egl.query_string(Some(display), name) {
                Ok(value) => info!("{}: {}", label, value.to_string_lossy()),
                Err(err) => debug!(?err, "failed to query {}", label),
            }
        }

        egl.bind_api(egl::OPENGL_ES_API)
            .map_err(|err| GpuError::EglInit(format!("OpenGL ES unsupported: {}", err)))?;

        let config = egl
            .choose_first_config(display, &CONFIG_ATTRIBUTES)
            .map_err(|err| GpuError::EglInit(format!("eglChooseConfig failed: {}", err)))?
            .ok_or_else(|| GpuError::EglInit("no EGL config with window/ES3 support".into()))?;

        Ok(Self {
            egl,
            display,
            config,
        })
    }
}

impl Drop for RenderDisplay {
    fn drop(&mut self) {
        if let Err(err) = self.egl.terminate(self.display) {
            warn!(?err, "failed to terminate EGL display");
        }
    }
}

/// Surfaceless ES3 context owning the shared texture/buffer namespace.
/// Created before any display context and made current on the
/// coordinator thread; it must outlive every [`DisplayContext`] sharing
/// with it.
pub struct MasterContext {
    egl: Arc<EglInstance>,
    display: egl::Display,
    context: egl::Context,
}

unsafe impl Send for MasterContext {}
unsafe impl Sync for MasterContext {}

impl MasterContext {
    pub fn new(render: &RenderDisplay) -> Result<Self, GpuError> {
        let context = render
            .egl
            .create_context(render.display, render.config, None, &CONTEXT_ATTRIBUTES)
            .map_err(|err| {
                GpuError::MasterContext(format!("failed to create share context: {}", err))
            })?;
        render
            .egl
            .make_current(render.display, None, None, Some(context))
            .map_err(|err| {
                let _ = render.egl.destroy_context(render.display, context);
                GpuError::MasterContext(format!("failed to make share context current: {}", err))
            })?;

        Ok(Self {
            egl: render.egl.clone(),
            display: render.display,
            context,
        })
    }
}

impl Drop for MasterContext {
    fn drop(&mut self) {
        if let Err(err) = self.egl.make_current(self.display, None, None, None) {
            warn!(?err, "failed to unbind share context");
        }
        if let Err(err) = self.egl.destroy_context(self.display, self.context) {
            warn!(?err, "failed to destroy share context");
        }
    }
}

/// Per-display window-surface context, current on exactly one worker
/// thread for its whole lifetime.
pub struct DisplayContext {
    egl: Arc<EglInstance>,
    display: egl::Display,
    context: egl::Context,
    surface: egl::Surface,
    gl: glow::Context,
    _thread_pinned: PhantomData<*mut ()>,
}

impl DisplayContext {
    pub fn new(
        render: &RenderDisplay,
        share: &MasterContext,
        window: *mut c_void,
    ) -> Result<Self, GpuError> {
        // A context already current here would be silently unbound by the
        // make-current below.
        assert!(
            render.egl.get_current_context().is_none(),
            "constructing a display context on a thread that already has one current"
        );

        let context = render
            .egl
            .create_context(
                render.display,
                render.config,
                Some(share.context),
                &CONTEXT_ATTRIBUTES,
            )
            .map_err(|err| GpuError::ContextCreate(format!("eglCreateContext: {}", err)))?;

        let surface = match unsafe {
            render
                .egl
                .create_window_surface(render.display, render.config, window, None)
        } {
            Ok(surface) => surface,
            Err(err) => {
                let _ = render.egl.destroy_context(render.display, context);
                return Err(GpuError::ContextCreate(format!(
                    "eglCreateWindowSurface: {}",
                    err
                )));
            }
        };

        if let Err(err) =
            render
                .egl
                .make_current(render.display, Some(surface), Some(surface), Some(context))
        {
            let _ = render.egl.destroy_context(render.display, context);
            let _ = render.egl.destroy_surface(render.display, surface);
            return Err(GpuError::ContextCreate(format!("eglMakeCurrent: {}", err)));
        }

        let loader = render.egl.clone();
        let gl = unsafe {
            glow::Context::from_loader_function(|name| match loader.get_proc_address(name) {
                Some(procedure) => procedure as *const c_void,
                None => std::ptr::null(),
            })
        };

        Ok(Self {
            egl: render.egl.clone(),
            display: render.display,
            context,
            surface,
            gl,
            _thread_pinned: PhantomData,
        })
    }

    /// GL entry points for drawing while this context is current.
    pub fn gl(&self) -> &glow::Context {
        &self.gl
    }

    pub fn clear(&self, color: [f32; 4]) {
        use glow::HasContext;
        unsafe {
            self.gl.clear_color(color[0], color[1], color[2], color[3]);
            self.gl.clear(glow::COLOR_BUFFER_BIT);
        }
    }

    pub fn swap_buffers(&self) -> Result<(), GpuError> {
        self.egl
            .swap_buffers(self.display, self.surface)
            .map_err(|err| GpuError::Present(format!("eglSwapBuffers: {}", err)))
    }
}

impl Drop for DisplayContext {
    fn drop(&mut self) {
        // Unbind first so the thread's current-context state stays sane,
        // then destroy context before surface.
        if let Err(err) = self.egl.make_current(self.display, None, None, None) {
            warn!(?err, "failed to unbind display context");
        }
        if let Err(err) = self.egl.destroy_context(self.display, self.context) {
            warn!(?err, "failed to destroy display context");
        }
        if let Err(err) = self.egl.destroy_surface(self.display, self.surface) {
            warn!(?err, "failed to destroy display surface");
        }
    }
}
