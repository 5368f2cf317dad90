// =============================================================================
// VULKAN RAY TRACING DEMO
// =============================================================================
//
// Opens a window, brings up a Vulkan device with the ray tracing extension
// set, creates a swapchain, uploads a triangle mesh through a staging copy,
// and builds bottom- and top-level acceleration structures over it. The
// window then polls events until closed.
//
// STARTUP FLOW:
// 1. Load config.toml
// 2. Instance + debug messenger + physical/logical device
// 3. Surface + swapchain
// 4. Vertex/index upload (staging -> device-local)
// 5. BLAS build, then TLAS build over one instance
//
// =============================================================================

mod backend;
mod config;

use anyhow::{Context, Result};
use ash::vk;
use backend::geometry::{TriangleMesh, TRIANGLE_INDICES, TRIANGLE_VERTICES};
use backend::raytracing::{self, AccelerationStructure, BlasInstance, RayTracingContext};
use backend::{command, Swapchain, VulkanDevice};
use config::Config;
use glam::Mat4;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::sync::Arc;
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
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let config = Config::load();

    log::info!("Starting ray tracing demo");
    log::info!(
        "Window: {}x{}",
        config.window.width,
        config.window.height
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Main application struct holding all Vulkan resources.
///
/// IMPORTANT: Field order matters for Drop! Resources must be destroyed
/// in reverse order of creation to avoid use-after-free.
pub struct App {
    config: Config,

    window: Option<Arc<Window>>,
    surface: Option<vk::SurfaceKHR>,
    surface_loader: Option<ash::extensions::khr::Surface>,

    device: Option<Arc<VulkanDevice>>,
    swapchain: Option<Swapchain>,
    command_pool: Option<vk::CommandPool>,

    rt_context: Option<RayTracingContext>,
    mesh: Option<TriangleMesh>,
    blas: Option<AccelerationStructure>,
    tlas: Option<AccelerationStructure>,
}

impl App {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            window: None,
            surface: None,
            surface_loader: None,
            device: None,
            swapchain: None,
            command_pool: None,
            rt_context: None,
            mesh: None,
            blas: None,
            tlas: None,
        }
    }

    // =========================================================================
    // INITIALIZATION
    // =========================================================================

    /// Initialize all Vulkan resources.
    ///
    /// Called once when the window is created. Sets up the device, the
    /// swapchain, and the acceleration structures.
    fn init_vulkan(&mut self, window: Arc<Window>) -> Result<()> {
        log::info!("Initializing Vulkan...");

        let display_handle = window.raw_display_handle();
        let window_handle = window.raw_window_handle();

        // Enable validation layers based on config (and debug build)
        let enable_validation = cfg!(debug_assertions) && self.config.debug.validation_layers;
        let device = VulkanDevice::new(&self.config.window.title, display_handle, enable_validation)?;

        let surface_loader = ash::extensions::khr::Surface::new(&device.entry, &device.instance);
        let surface = unsafe {
            ash_window::create_surface(
                &device.entry,
                &device.instance,
                display_handle,
                window_handle,
                None,
            )
        }
        .context("Failed to create window surface")?;

        // Verify the GPU supports presenting to this surface
        let surface_support = unsafe {
            surface_loader.get_physical_device_surface_support(
                device.physical_device,
                device.graphics_queue_family,
                surface,
            )?
        };

        if !surface_support {
            unsafe { surface_loader.destroy_surface(surface, None) };
            anyhow::bail!("GPU doesn't support presenting to this surface");
        }

        self.device = Some(device.clone());
        self.surface = Some(surface);
        self.surface_loader = Some(surface_loader);

        let size = window.inner_size();
        let swapchain = Swapchain::new(
            device.clone(),
            surface,
            self.surface_loader
                .as_ref()
                .context("Surface loader not initialized")?,
            size.width,
            size.height,
            self.config.get_surface_format(),
            self.config.get_present_mode(),
        )?;
        log::info!(
            "Swapchain ready: {} images, {:?}, {}x{}",
            swapchain.images.len(),
            swapchain.format,
            swapchain.extent.width,
            swapchain.extent.height
        );
        self.swapchain = Some(swapchain);

        let command_pool = command::create_command_pool(&device)?;
        self.command_pool = Some(command_pool);

        self.build_scene(&device, command_pool)?;

        log::info!("Vulkan initialized successfully!");
        Ok(())
    }

    /// Upload the triangle and build the acceleration structures over it
    fn build_scene(&mut self, device: &Arc<VulkanDevice>, pool: vk::CommandPool) -> Result<()> {
        let rt_context = RayTracingContext::new(device);

        let mesh = TriangleMesh::upload(device, pool, &TRIANGLE_VERTICES, &TRIANGLE_INDICES)?;

        let blas = match raytracing::build_blas(
            device,
            &rt_context,
            pool,
            &mesh,
            self.config.raytracing.prefer_fast_trace,
        ) {
            Ok(blas) => blas,
            Err(e) => {
                mesh.destroy(device);
                return Err(e);
            }
        };

        let instances = [BlasInstance {
            blas_address: blas.address,
            transform: Mat4::IDENTITY,
            custom_index: 0,
            mask: 0xff,
        }];

        let tlas = match raytracing::build_tlas(
            device,
            &rt_context,
            pool,
            &instances,
            self.config.raytracing.allow_update,
        ) {
            Ok(tlas) => tlas,
            Err(e) => {
                blas.destroy(device, &rt_context);
                mesh.destroy(device);
                return Err(e);
            }
        };

        self.rt_context = Some(rt_context);
        self.mesh = Some(mesh);
        self.blas = Some(blas);
        self.tlas = Some(tlas);

        Ok(())
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    /// Called when the application is ready to create windows.
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ))
            .with_resizable(false);

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.init_vulkan(window.clone()) {
            log::error!("Failed to initialize Vulkan: {:?}", e);
            event_loop.exit();
            return;
        }

        self.window = Some(window);
    }

    /// Handle window events.
    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        if let WindowEvent::CloseRequested = event {
            log::info!("Close requested, shutting down...");
            if let Some(ref device) = self.device {
                let _ = device.wait_idle();
            }
            event_loop.exit();
        }
    }
}

// =============================================================================
// CLEANUP
// =============================================================================

impl Drop for App {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");

        if let Some(ref device) = self.device {
            // Wait for GPU to finish before destroying anything
            let _ = device.wait_idle();

            // Destroy in reverse order of creation!
            if let Some(ref rt_context) = self.rt_context {
                if let Some(ref tlas) = self.tlas {
                    tlas.destroy(device, rt_context);
                }
                if let Some(ref blas) = self.blas {
                    blas.destroy(device, rt_context);
                }
            }

            if let Some(ref mesh) = self.mesh {
                mesh.destroy(device);
            }

            if let Some(pool) = self.command_pool {
                unsafe { device.device.destroy_command_pool(pool, None) };
            }

            // Swapchain drops before the surface it was created from
            self.swapchain = None;

            if let (Some(surface), Some(ref loader)) = (self.surface, &self.surface_loader) {
                unsafe { loader.destroy_surface(surface, None) };
            }

            // Device is dropped automatically (Arc)
        }

        log::info!("Cleanup complete");
    }
}
