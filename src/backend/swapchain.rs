// Swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen.
// Fixed policy: FIFO presentation, two images clamped to what the surface
// allows, BGRA8 sRGB when offered and the first listed format otherwise.

use super::device::LogicalDevice;
use super::selection::QueueFamilyIndices;
use super::surface::Surface;
use crate::error::{RenderError, RenderResult};
use ash::prelude::VkResult;
use ash::vk;
use std::sync::Arc;

pub const PREFERRED_FORMAT: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
    format: vk::Format::B8G8R8A8_SRGB,
    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
};

/// Double buffering before surface clamping
pub const TARGET_IMAGE_COUNT: u32 = 2;

pub const PRESENT_MODE: vk::PresentModeKHR = vk::PresentModeKHR::FIFO;

/// Preferred format if listed, otherwise the first one; `None` only for an empty list
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| {
            f.format == PREFERRED_FORMAT.format && f.color_space == PREFERRED_FORMAT.color_space
        })
        .or_else(|| formats.first())
        .copied()
}

/// Clamp the target into `[min, max]`; a max of zero means unbounded
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let mut count = TARGET_IMAGE_COUNT.max(caps.min_image_count);
    if caps.max_image_count > 0 {
        count = count.min(caps.max_image_count);
    }
    count.max(1)
}

/// Requested size clamped into the surface's supported extent range
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> vk::Extent2D {
    vk::Extent2D {
        width: width
            .max(caps.min_image_extent.width)
            .min(caps.max_image_extent.width),
        height: height
            .max(caps.min_image_extent.height)
            .min(caps.max_image_extent.height),
    }
}

/// Concurrent sharing across both families when they differ
pub fn choose_sharing(families: QueueFamilyIndices) -> (vk::SharingMode, Vec<u32>) {
    match (families.graphics, families.present) {
        (Some(graphics), Some(present)) if graphics != present => {
            (vk::SharingMode::CONCURRENT, vec![graphics, present])
        }
        _ => (vk::SharingMode::EXCLUSIVE, Vec::new()),
    }
}

/// Create one handle per item; on the first failure destroy what was
/// already created and return the failing index with its error.
pub(crate) fn create_all_or_rollback<T, H, E>(
    items: &[T],
    mut create: impl FnMut(&T) -> Result<H, E>,
    mut destroy: impl FnMut(H),
) -> Result<Vec<H>, (usize, E)> {
    let mut created = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        match create(item) {
            Ok(handle) => created.push(handle),
            Err(err) => {
                for handle in created.drain(..).rev() {
                    destroy(handle);
                }
                return Err((index, err));
            }
        }
    }
    Ok(created)
}

/// The present family was picked against one surface; every other surface is checked here
fn require_present_support(support: VkResult<bool>, family: u32) -> RenderResult<()> {
    match support {
        Ok(true) => Ok(()),
        Ok(false) => Err(RenderError::SwapchainCreationFailure(format!(
            "present family {family} cannot present to this surface"
        ))),
        Err(e) => Err(swapchain_error("surface support query failed", e)),
    }
}

fn swapchain_error(what: &str, result: vk::Result) -> RenderError {
    RenderError::SwapchainCreationFailure(format!("{what}: {result}"))
}

pub struct Swapchain {
    handle: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    framebuffers: Vec<vk::Framebuffer>,
    surface: vk::SurfaceKHR,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
    device: Arc<LogicalDevice>,
}

impl Swapchain {
    pub fn new(
        device: Arc<LogicalDevice>,
        surface: &Surface,
        width: u32,
        height: u32,
    ) -> RenderResult<Self> {
        log::info!("Creating swapchain: {}x{}", width, height);

        let loader = device.swapchain_loader().ok_or_else(|| {
            RenderError::SwapchainCreationFailure("the SWAPCHAIN feature is not enabled".into())
        })?;

        if width == 0 || height == 0 {
            return Err(RenderError::SwapchainCreationFailure(format!(
                "zero-sized extent {}x{}",
                width, height
            )));
        }

        let physical = device.physical_device();
        let surface_loader = surface.loader();

        let support = unsafe {
            surface_loader.get_physical_device_surface_support(
                physical,
                device.present_family(),
                surface.handle(),
            )
        };
        require_present_support(support, device.present_family())?;

        // Query surface capabilities
        let caps = unsafe {
            surface_loader.get_physical_device_surface_capabilities(physical, surface.handle())
        }
        .map_err(|e| swapchain_error("surface capabilities query failed", e))?;

        // Query supported formats
        let formats = unsafe {
            surface_loader.get_physical_device_surface_formats(physical, surface.handle())
        }
        .map_err(|e| swapchain_error("surface format query failed", e))?;

        let format = choose_surface_format(&formats).ok_or_else(|| {
            RenderError::SwapchainCreationFailure("surface reports no formats".into())
        })?;
        if format != PREFERRED_FORMAT {
            log::info!("Preferred format unavailable, using {:?}", format.format);
        }

        let image_count = choose_image_count(&caps);
        let extent = choose_extent(&caps, width, height);
        if extent.width != width || extent.height != height {
            log::warn!(
                "Requested {}x{} clamped to {}x{} by the surface",
                width,
                height,
                extent.width,
                extent.height
            );
        }

        let (sharing_mode, family_indices) = choose_sharing(device.queue_families());

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface.handle())
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(&family_indices)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(PRESENT_MODE)
            .clipped(true);

        let handle = unsafe { loader.create_swapchain(&create_info, None) }
            .map_err(|e| swapchain_error("vkCreateSwapchainKHR failed", e))?;

        // Images belong to the swapchain and are never destroyed individually
        let images = match unsafe { loader.get_swapchain_images(handle) } {
            Ok(images) => images,
            Err(e) => {
                unsafe { loader.destroy_swapchain(handle, None) };
                return Err(swapchain_error("failed to fetch swapchain images", e));
            }
        };

        let raw = device.raw();
        let image_views = create_all_or_rollback(
            &images,
            |&image| {
                let create_info = vk::ImageViewCreateInfo::default()
                    .image(image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(format.format)
                    .components(vk::ComponentMapping {
                        r: vk::ComponentSwizzle::IDENTITY,
                        g: vk::ComponentSwizzle::IDENTITY,
                        b: vk::ComponentSwizzle::IDENTITY,
                        a: vk::ComponentSwizzle::IDENTITY,
                    })
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        base_mip_level: 0,
                        level_count: 1,
                        base_array_layer: 0,
                        layer_count: 1,
                    });
                unsafe { raw.create_image_view(&create_info, None) }
            },
            |view| unsafe { raw.destroy_image_view(view, None) },
        );

        let image_views = match image_views {
            Ok(views) => views,
            Err((index, result)) => {
                unsafe { loader.destroy_swapchain(handle, None) };
                return Err(RenderError::ImageViewCreationFailure { index, result });
            }
        };

        log::info!(
            "Created swapchain with {} images ({:?}, {:?})",
            images.len(),
            format.format,
            sharing_mode
        );

        Ok(Self {
            handle,
            images,
            image_views,
            framebuffers: Vec::new(),
            surface: surface.handle(),
            format,
            extent,
            device,
        })
    }

    /// Build one framebuffer per image view for a render-pass based layer.
    /// Existing framebuffers are replaced.
    pub fn create_framebuffers(&mut self, render_pass: vk::RenderPass) -> RenderResult<()> {
        self.destroy_framebuffers();

        let raw = self.device.raw();
        let extent = self.extent;
        let framebuffers = create_all_or_rollback(
            &self.image_views,
            |&view| {
                let attachments = [view];
                let create_info = vk::FramebufferCreateInfo::default()
                    .render_pass(render_pass)
                    .attachments(&attachments)
                    .width(extent.width)
                    .height(extent.height)
                    .layers(1);
                unsafe { raw.create_framebuffer(&create_info, None) }
            },
            |framebuffer| unsafe { raw.destroy_framebuffer(framebuffer, None) },
        )
        .map_err(|(index, result)| {
            RenderError::SwapchainCreationFailure(format!(
                "framebuffer {index} creation failed: {result}"
            ))
        })?;

        self.framebuffers = framebuffers;
        Ok(())
    }

    fn destroy_framebuffers(&mut self) {
        for framebuffer in self.framebuffers.drain(..) {
            unsafe {
                self.device.raw().destroy_framebuffer(framebuffer, None);
            }
        }
    }

    /// Acquire next image for rendering
    pub fn acquire_next_image(&self, timeout: u64, semaphore: vk::Semaphore) -> VkResult<(u32, bool)> {
        let loader = self
            .device
            .swapchain_loader()
            .ok_or(vk::Result::ERROR_EXTENSION_NOT_PRESENT)?;
        unsafe { loader.acquire_next_image(self.handle, timeout, semaphore, vk::Fence::null()) }
    }

    /// Present rendered image to screen; `Ok(true)` means suboptimal
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> VkResult<bool> {
        let loader = self
            .device
            .swapchain_loader()
            .ok_or(vk::Result::ERROR_EXTENSION_NOT_PRESENT)?;

        let swapchains = [self.handle];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        unsafe { loader.queue_present(queue, &present_info) }
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.handle
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    pub fn image_views(&self) -> &[vk::ImageView] {
        &self.image_views
    }

    pub fn framebuffers(&self) -> &[vk::Framebuffer] {
        &self.framebuffers
    }

    pub fn surface(&self) -> vk::SurfaceKHR {
        self.surface
    }

    pub fn format(&self) -> vk::Format {
        self.format.format
    }

    pub fn color_space(&self) -> vk::ColorSpaceKHR {
        self.format.color_space
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn device(&self) -> &Arc<LogicalDevice> {
        &self.device
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        log::debug!("Destroying swapchain {:?}", self.handle);
        self.destroy_framebuffers();
        unsafe {
            for view in self.image_views.drain(..) {
                self.device.raw().destroy_image_view(view, None);
            }
            if let Some(loader) = self.device.swapchain_loader() {
                loader.destroy_swapchain(self.handle, None);
            }
        }
    }
}

/// Owns a surface and the chain currently built on it
pub struct SwapchainManager {
    // Field order is teardown order: the chain goes before its surface
    chain: Option<Swapchain>,
    surface: Surface,
}

impl SwapchainManager {
    pub fn new(surface: Surface) -> Self {
        Self {
            chain: None,
            surface,
        }
    }

    pub fn surface(&self) -> &Surface {
        &self.surface
    }

    pub fn swapchain(&self) -> Option<&Swapchain> {
        self.chain.as_ref()
    }

    pub fn swapchain_mut(&mut self) -> Option<&mut Swapchain> {
        self.chain.as_mut()
    }

    /// Build the chain; an existing chain is recreated instead
    pub fn create_swapchain(
        &mut self,
        device: &Arc<LogicalDevice>,
        width: u32,
        height: u32,
    ) -> RenderResult<&Swapchain> {
        if self.chain.is_some() {
            return self.recreate_swapchain(device, width, height);
        }
        let chain = Swapchain::new(device.clone(), &self.surface, width, height)?;
        Ok(self.chain.insert(chain))
    }

    /// Drain the GPU, tear the old chain down, then build a new one
    pub fn recreate_swapchain(
        &mut self,
        device: &Arc<LogicalDevice>,
        width: u32,
        height: u32,
    ) -> RenderResult<&Swapchain> {
        log::debug!("Recreating swapchain at {}x{}", width, height);

        // The old images may still be referenced by in-flight work
        device
            .wait_idle()
            .map_err(|e| swapchain_error("device wait before recreation failed", e))?;
        self.destroy_swapchain();

        let chain = Swapchain::new(device.clone(), &self.surface, width, height)?;
        Ok(self.chain.insert(chain))
    }

    /// Framebuffers, image views, then the swapchain handle
    pub fn destroy_swapchain(&mut self) {
        self.chain = None;
    }
}
