// =============================================================================
// RENDERER - Host-facing facade
// =============================================================================
//
// Wires RenderContext, compositions (each with its own swapchain) and the
// frame scheduler together.
//
// TEARDOWN ORDER (Drop):
// 1. device idle
// 2. debug messenger
// 3. compositions: layers, framebuffers, image views, swapchain, surface
// 4. scheduler: semaphores, command pool
// 5. logical device, instance (inside RenderContext)

use crate::backend::device::{LogicalDevice, RenderContext};
use crate::backend::selection::{DeviceSelector, FirstGraphicsCapable};
use crate::backend::surface::Surface;
use crate::backend::swapchain::SwapchainManager;
use crate::backend::sync::{FrameOutcome, FrameScheduler, FrameStats};
use crate::composition::{Composition, Layer, LayerRegistry};
use crate::config::RenderConfig;
use crate::error::{FrameStage, RenderError, RenderResult};
use ash::vk;
use std::ffi::CStr;
use std::sync::Arc;

pub struct Renderer {
    // Field order is drop order
    compositions: Vec<Composition>,
    active: Option<usize>,
    registry: LayerRegistry,
    scheduler: Option<FrameScheduler>,
    context: RenderContext,
}

impl Renderer {
    /// Create the instance and select a GPU with the default selector
    pub fn initialize(
        config: RenderConfig,
        extensions: &[&CStr],
        layers: &[&CStr],
    ) -> RenderResult<Self> {
        Self::initialize_with_selector(config, &FirstGraphicsCapable, extensions, layers)
    }

    pub fn initialize_with_selector(
        config: RenderConfig,
        selector: &dyn DeviceSelector,
        extensions: &[&CStr],
        layers: &[&CStr],
    ) -> RenderResult<Self> {
        let context = RenderContext::initialize(config, selector, extensions, layers)?;
        Ok(Self {
            compositions: Vec::new(),
            active: None,
            registry: LayerRegistry::with_defaults(),
            scheduler: None,
            context,
        })
    }

    // =========================================================================
    // CONTEXT
    // =========================================================================

    pub fn instance(&self) -> &ash::Instance {
        self.context.instance()
    }

    pub fn entry(&self) -> &ash::Entry {
        self.context.entry()
    }

    pub fn config(&self) -> &RenderConfig {
        self.context.config()
    }

    pub fn context(&self) -> &RenderContext {
        &self.context
    }

    /// Needed to install a custom debug messenger
    pub fn context_mut(&mut self) -> &mut RenderContext {
        &mut self.context
    }

    pub fn logical_device(&self) -> Option<&Arc<LogicalDevice>> {
        self.context.logical_device()
    }

    // =========================================================================
    // COMPOSITIONS
    // =========================================================================

    fn bind(&self, surface: vk::SurfaceKHR) -> SwapchainManager {
        SwapchainManager::new(Surface::new(
            surface,
            self.context.surface_loader().clone(),
        ))
    }

    /// Bind `surface` to the active composition, creating `"main"` if needed.
    ///
    /// Ownership of the handle moves to the renderer. A previously bound
    /// surface is destroyed together with its chain.
    pub fn set_surface(&mut self, surface: vk::SurfaceKHR) -> RenderResult<()> {
        let manager = self.bind(surface);

        let Some(active) = self.active else {
            self.compositions
                .push(Composition::with_swapchain("main", manager));
            self.active = Some(self.compositions.len() - 1);
            return Ok(());
        };

        let device = self.context.logical_device();
        let composition = &mut self.compositions[active];
        if composition.swapchain().is_some() {
            if let Some(device) = device {
                device.wait_idle().map_err(|e| {
                    RenderError::SwapchainCreationFailure(format!(
                        "device wait before rebinding the surface failed: {e}"
                    ))
                })?;
            }
            log::debug!("Rebinding surface of composition `{}`", composition.name());
        }
        drop(composition.set_swapchain(manager));
        Ok(())
    }

    /// Add a composition, optionally bound to `surface`. The first one becomes active.
    pub fn add_composition(
        &mut self,
        name: impl Into<String>,
        surface: Option<vk::SurfaceKHR>,
    ) -> usize {
        let composition = match surface {
            Some(surface) => Composition::with_swapchain(name, self.bind(surface)),
            None => Composition::new(name),
        };
        self.compositions.push(composition);
        let index = self.compositions.len() - 1;
        if self.active.is_none() {
            self.active = Some(index);
        }
        index
    }

    pub fn set_active_composition(&mut self, index: usize) -> RenderResult<()> {
        if index >= self.compositions.len() {
            return Err(RenderError::not_found("composition", index));
        }
        self.active = Some(index);
        Ok(())
    }

    pub fn composition_count(&self) -> usize {
        self.compositions.len()
    }

    pub fn composition(&self, index: usize) -> RenderResult<&Composition> {
        self.compositions
            .get(index)
            .ok_or_else(|| RenderError::not_found("composition", index))
    }

    pub fn composition_mut(&mut self, index: usize) -> RenderResult<&mut Composition> {
        self.compositions
            .get_mut(index)
            .ok_or_else(|| RenderError::not_found("composition", index))
    }

    pub fn active_composition(&self) -> RenderResult<&Composition> {
        let index = self
            .active
            .ok_or_else(|| RenderError::not_found("composition", "active"))?;
        self.composition(index)
    }

    pub fn active_composition_mut(&mut self) -> RenderResult<&mut Composition> {
        let index = self
            .active
            .ok_or_else(|| RenderError::not_found("composition", "active"))?;
        self.composition_mut(index)
    }

    fn active_surface(&self) -> Option<vk::SurfaceKHR> {
        self.active_composition()
            .ok()
            .and_then(|composition| composition.swapchain())
            .map(|manager| manager.surface().handle())
    }

    fn require_device(&self) -> RenderResult<Arc<LogicalDevice>> {
        self.context.logical_device().cloned().ok_or_else(|| {
            RenderError::SwapchainCreationFailure("the logical device has not been created".into())
        })
    }

    fn active_manager(&mut self) -> RenderResult<&mut SwapchainManager> {
        let composition = self.active_composition_mut()?;
        let name = composition.name().to_string();
        composition.swapchain_mut().ok_or_else(|| {
            RenderError::SwapchainCreationFailure(format!(
                "composition `{name}` has no surface bound"
            ))
        })
    }

    // =========================================================================
    // DEVICE & SWAPCHAIN
    // =========================================================================

    /// Create the logical device against the active surface, then the frame scheduler
    pub fn create_device(&mut self, extensions: &[&CStr], layers: &[&CStr]) -> RenderResult<()> {
        let surface = self.active_surface().ok_or_else(|| {
            RenderError::DeviceSelectionFailure(
                "no surface is bound to the active composition; call set_surface first".into(),
            )
        })?;

        let device = self.context.create_device(Some(surface), extensions, layers)?;
        let scheduler = FrameScheduler::new(device, self.context.config())?;
        self.scheduler = Some(scheduler);
        Ok(())
    }

    pub fn create_swapchain(&mut self, width: u32, height: u32) -> RenderResult<()> {
        let device = self.require_device()?;
        self.active_manager()?
            .create_swapchain(&device, width, height)?;
        Ok(())
    }

    pub fn recreate_swapchain(&mut self, width: u32, height: u32) -> RenderResult<()> {
        let device = self.require_device()?;
        self.active_manager()?
            .recreate_swapchain(&device, width, height)?;
        Ok(())
    }

    /// Destroy the active chain; the surface stays bound
    pub fn destroy_swapchain(&mut self) -> RenderResult<()> {
        if let Some(device) = self.context.logical_device() {
            device
                .wait_idle()
                .map_err(|e| RenderError::render(FrameStage::Synchronize, e))?;
        }
        self.active_manager()?.destroy_swapchain();
        Ok(())
    }

    // =========================================================================
    // LAYERS
    // =========================================================================

    pub fn register_layer_kind<F>(&mut self, tag: impl Into<String>, factory: F)
    where
        F: Fn(&str) -> Box<dyn Layer> + 'static,
    {
        self.registry.register(tag, factory);
    }

    pub fn layer_registry(&self) -> &LayerRegistry {
        &self.registry
    }

    /// Append `layer` to the active composition
    pub fn add_layer(&mut self, layer: Box<dyn Layer>) -> RenderResult<usize> {
        Ok(self.active_composition_mut()?.add_layer(layer))
    }

    /// Build a layer of kind `tag` and append it to the active composition
    pub fn create_layer(&mut self, tag: &str, name: &str) -> RenderResult<usize> {
        let layer = self.registry.create(tag, name)?;
        self.add_layer(layer)
    }

    pub fn layer(&self, index: usize) -> RenderResult<&dyn Layer> {
        self.active_composition()?.layer(index)
    }

    pub fn layer_mut(&mut self, index: usize) -> RenderResult<&mut dyn Layer> {
        self.active_composition_mut()?.layer_mut(index)
    }

    pub fn layer_by_name(&self, name: &str) -> RenderResult<&dyn Layer> {
        self.active_composition()?.layer_by_name(name)
    }

    pub fn layers_of<T: Layer>(&self) -> RenderResult<Vec<&T>> {
        Ok(self.active_composition()?.layers_of::<T>())
    }

    pub fn layer_as<T: Layer>(&self, index: usize) -> RenderResult<&T> {
        self.active_composition()?.layer_as::<T>(index)
    }

    pub fn layer_as_mut<T: Layer>(&mut self, index: usize) -> RenderResult<&mut T> {
        self.active_composition_mut()?.layer_as_mut::<T>(index)
    }

    // =========================================================================
    // FRAME
    // =========================================================================

    /// Render and present one frame of the active composition
    pub fn flush_render(&mut self) -> RenderResult<FrameOutcome> {
        let scheduler = self.scheduler.as_mut().ok_or_else(|| {
            RenderError::render(FrameStage::Acquire, "the logical device has not been created")
        })?;
        let composition = self
            .active
            .and_then(|index| self.compositions.get(index))
            .ok_or_else(|| RenderError::render(FrameStage::Acquire, "no active composition"))?;

        scheduler.flush_render(composition)
    }

    pub fn frame_stats(&self) -> FrameStats {
        self.scheduler
            .as_ref()
            .map(FrameScheduler::frame_stats)
            .unwrap_or_default()
    }

    pub fn scheduler(&self) -> Option<&FrameScheduler> {
        self.scheduler.as_ref()
    }

    pub fn wait_idle(&self) -> RenderResult<()> {
        match self.context.logical_device() {
            Some(device) => device
                .wait_idle()
                .map_err(|e| RenderError::render(FrameStage::Synchronize, e)),
            None => Ok(()),
        }
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        log::info!("Shutting down renderer...");
        if let Err(e) = self.wait_idle() {
            log::warn!("Device wait during shutdown failed: {}", e);
        }
        self.context.destroy_debug_messenger();
        // Remaining resources are released by field order
    }
}
