// =============================================================================
// STRATA DEMO - Window host driving the renderer
// =============================================================================
//
// FRAME FLOW:
// 1. Resize pending? Recreate the swapchain (skipped while minimized)
// 2. Animate the background layer's clear color
// 3. Renderer::flush_render (acquire, record, submit, present, idle)
// 4. Update FPS counter in the window title
//
// Controls: ESC quits.
//
// =============================================================================

use anyhow::{Context, Result};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::ffi::CStr;
use std::sync::Arc;
use std::time::Instant;
use strata::{ClearLayer, Config, FrameOutcome, LayerRegistry, RenderError, Renderer};
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    init_logging();

    // Load configuration from strata.toml
    let config = Config::load();
    log::info!("Starting strata demo");
    log::info!(
        "Window: {}x{} ({:?} acquire)",
        config.window.width,
        config.window.height,
        config.graphics.acquire
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

/// Info by default; RUST_LOG overrides
fn init_logging() {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Field order matters for Drop: the renderer owns the window surface and
/// must go before the window itself.
struct App {
    renderer: Option<Renderer>,
    window: Option<Arc<Window>>,
    config: Config,

    /// Index of the clear layer in the main composition
    background: usize,
    started: Instant,

    /// Set when the window is resized or the chain reports out of date
    needs_resize: bool,
    /// Window has zero size - skip rendering
    is_minimized: bool,

    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let now = Instant::now();
        Self {
            renderer: None,
            window: None,
            config,
            background: 0,
            started: now,
            needs_resize: false,
            is_minimized: false,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    // =========================================================================
    // INITIALIZATION
    // =========================================================================

    fn init_renderer(&mut self, window: &Window) -> Result<()> {
        log::info!("Initializing renderer...");

        let display_handle = window
            .display_handle()
            .context("Failed to get display handle")?
            .as_raw();
        let window_handle = window
            .window_handle()
            .context("Failed to get window handle")?
            .as_raw();

        // Platform surface extensions on top of the engine set
        let required = ash_window::enumerate_required_extensions(display_handle)
            .context("Failed to query surface extensions")?;
        let extensions: Vec<&CStr> = required
            .iter()
            .map(|&name| unsafe { CStr::from_ptr(name) })
            .collect();

        let mut renderer = Renderer::initialize(self.config.render_config(), &extensions, &[])
            .context("Failed to initialize the render context")?;

        let surface = unsafe {
            ash_window::create_surface(
                renderer.entry(),
                renderer.instance(),
                display_handle,
                window_handle,
                None,
            )
        }
        .context("Failed to create window surface")?;
        renderer.set_surface(surface)?;
        renderer.create_device(&[], &[])?;

        let size = window.inner_size();
        if size.width == 0 || size.height == 0 {
            self.is_minimized = true;
        } else {
            renderer.create_swapchain(size.width, size.height)?;
        }

        self.background = renderer.create_layer(LayerRegistry::CLEAR, "background")?;
        renderer
            .layer_as_mut::<ClearLayer>(self.background)?
            .set_color(self.config.graphics.clear_color);

        self.renderer = Some(renderer);
        log::info!("Renderer initialized successfully!");
        Ok(())
    }

    // =========================================================================
    // FRAME
    // =========================================================================

    /// Returns true when a frame was presented
    fn render_frame(&mut self) -> Result<bool> {
        if self.is_minimized {
            return Ok(false);
        }
        let (Some(renderer), Some(window)) = (self.renderer.as_mut(), self.window.as_ref()) else {
            return Ok(false);
        };

        if self.needs_resize {
            let size = window.inner_size();
            if size.width == 0 || size.height == 0 {
                self.is_minimized = true;
                return Ok(false);
            }
            renderer.recreate_swapchain(size.width, size.height)?;
            self.needs_resize = false;
        }

        // Slow pulse around the configured color
        let t = self.started.elapsed().as_secs_f32();
        let base = self.config.graphics.clear_color;
        let pulse = 0.75 + 0.25 * t.sin();
        renderer
            .layer_as_mut::<ClearLayer>(self.background)?
            .set_color([base[0] * pulse, base[1] * pulse, base[2] * pulse, base[3]]);

        match renderer.flush_render() {
            Ok(FrameOutcome::Presented { suboptimal, .. }) => {
                if suboptimal {
                    self.needs_resize = true;
                }
                Ok(true)
            }
            Ok(FrameOutcome::Skipped) => Ok(false),
            Err(RenderError::RenderFailure { stage, detail }) => {
                // Usually an out-of-date chain; rebuild on the next tick
                log::debug!("Frame dropped during {}: {}", stage, detail);
                self.needs_resize = true;
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    // =========================================================================
    // FPS TRACKING
    // =========================================================================

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        // Update title every second
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;
            if let Some(ref window) = self.window {
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms)",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0
                ));
            }
            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.init_renderer(&window) {
            log::error!("Failed to initialize renderer: {:?}", e);
            event_loop.exit();
            return;
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                if let Some(ref renderer) = self.renderer {
                    if let Err(e) = renderer.wait_idle() {
                        log::warn!("Device wait on close failed: {}", e);
                    }
                }
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                if size.width == 0 || size.height == 0 {
                    self.is_minimized = true;
                } else {
                    self.is_minimized = false;
                    self.needs_resize = true;
                }
            }

            WindowEvent::RedrawRequested => match self.render_frame() {
                Ok(true) => self.update_fps(),
                Ok(false) => {}
                Err(e) => log::error!("Render error: {:?}", e),
            },

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed()
                    && event.physical_key == PhysicalKey::Code(KeyCode::Escape)
                {
                    log::info!("ESC pressed, exiting...");
                    event_loop.exit();
                }
            }

            _ => {}
        }
    }

    /// Continuous redraws
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

// =============================================================================
// CLEANUP
// =============================================================================

impl Drop for App {
    fn drop(&mut self) {
        log::info!("Cleaning up...");
        if let Some(renderer) = self.renderer.take() {
            let stats = renderer.frame_stats();
            log::info!(
                "Presented {} frames, skipped {}, abandoned {}",
                stats.presented,
                stats.skipped,
                stats.abandoned
            );
        }
        log::info!("Cleanup complete");
    }
}
