// =============================================================================
// MESH RENDERER - Draws one OBJ model into a resizable window
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌──────────────────────────────────────────────────────────────────┐
// │  winit event loop (window, resize, close)                        │
// │    └── Renderer                                                  │
// │          ├── FrameLoop (acquire → record → submit → present)     │
// │          │     └── SwapchainManager (images, views, framebuffers)│
// │          ├── Vertex + index buffers (host visible, mapped)       │
// │          ├── MeshPipeline (render pass, pipeline)                │
// │          └── VulkanContext (instance, surface, device, queue)    │
// └──────────────────────────────────────────────────────────────────┘
//
// USAGE: mesh-renderer <model.obj>
//
// =============================================================================

mod backend;
mod config;
mod error;
mod frame;
mod mesh;
mod renderer;
#[cfg(test)]
mod testing;

use anyhow::Result;
use config::Config;
use error::RendererError;
use frame::FrameOutcome;
use mesh::Mesh;
use renderer::Renderer;
use std::path::PathBuf;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Window, WindowAttributes, WindowId},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() {
    init_logging();

    let Some(model_path) = std::env::args_os().nth(1).map(PathBuf::from) else {
        log::error!("Usage: mesh-renderer <model.obj>");
        std::process::exit(1);
    };

    if let Err(e) = run(model_path) {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}

fn init_logging() {
    use env_logger::Builder;
    use log::LevelFilter;

    let mut builder = Builder::from_default_env();
    builder.filter_level(LevelFilter::Info);
    builder.init();
}

fn run(model_path: PathBuf) -> Result<()> {
    let config = Config::load();
    log::info!("Starting mesh renderer");
    log::info!("Window: {}x{}", config.window.width, config.window.height);
    log::info!("Present mode: {:?}", config.present_mode());

    // The model is loaded before any window or GPU object exists
    let mesh = Mesh::load(&model_path)?;

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config, mesh);
    event_loop.run_app(&mut app)?;

    match app.error.take() {
        None => {
            log::info!("Presented {} frames", app.frames_presented);
            Ok(())
        }
        Some(e) => match e.downcast_ref::<RendererError>() {
            Some(classified) if !classified.is_fatal() => {
                log::warn!("{}", classified);
                Ok(())
            }
            _ => Err(e),
        },
    }
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// IMPORTANT: Field order matters for Drop! The renderer must go before the
/// window its surface was created for.
struct App {
    config: Config,
    mesh: Mesh,
    renderer: Option<Renderer>,
    window: Option<Window>,
    /// First error that stopped the event loop
    error: Option<anyhow::Error>,
    frames_presented: u64,
}

impl App {
    fn new(config: Config, mesh: Mesh) -> Self {
        Self {
            config,
            mesh,
            renderer: None,
            window: None,
            error: None,
            frames_presented: 0,
        }
    }

    fn init(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        let window = event_loop.create_window(window_attributes)?;
        let renderer = Renderer::new(&window, &self.config, &self.mesh)?;

        self.renderer = Some(renderer);
        self.window = Some(window);
        Ok(())
    }

    /// One iteration of the frame loop; errors stop the event loop
    fn frame(&mut self, event_loop: &ActiveEventLoop, close_requested: bool) {
        if self.error.is_some() {
            return;
        }
        let Some(renderer) = self.renderer.as_mut() else {
            return;
        };

        match renderer.render_frame(close_requested) {
            Ok(FrameOutcome::Closed) => {
                self.frames_presented = renderer.frames_presented();
                event_loop.exit();
            }
            Ok(_) => {}
            Err(e) => {
                self.frames_presented = renderer.frames_presented();
                self.error = Some(e);
                event_loop.exit();
            }
        }
    }

    fn shutdown(&mut self) {
        // Renderer teardown waits for the device before releasing anything
        self.renderer = None;
        self.window = None;
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    /// Called when the application is ready to create windows.
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() || self.error.is_some() {
            return;
        }

        if let Err(e) = self.init(event_loop) {
            self.error = Some(e);
            event_loop.exit();
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.frame(event_loop, true);
                self.shutdown();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                if let Some(renderer) = self.renderer.as_mut() {
                    renderer.resize(size.width, size.height);
                }
            }

            WindowEvent::RedrawRequested => {
                self.frame(event_loop, false);
            }

            _ => {}
        }
    }

    /// Continuous redraws; the loop only blocks inside the frame itself
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        self.shutdown();
    }
}
