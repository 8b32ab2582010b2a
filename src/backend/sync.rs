// Frame scheduling and synchronization
//
// One acquire -> record -> submit -> present iteration per host tick.
// Two semaphores tie the GPU steps together; the CPU side is collapsed to a
// synchronous frame boundary by a device idle wait at the end of every frame.

use super::device::LogicalDevice;
use super::swapchain::Swapchain;
use crate::composition::layer::{color_range, record_clear};
use crate::composition::{Composition, FrameTarget};
use crate::config::{AcquirePolicy, RenderConfig};
use crate::error::{FrameStage, RenderError, RenderResult};
use ash::prelude::VkResult;
use ash::vk;
use std::sync::Arc;

/// Result of a single `flush_render` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented { image_index: u32, suboptimal: bool },
    /// Non-blocking acquire found no image ready; nothing was recorded
    Skipped,
}

impl FrameOutcome {
    pub fn is_presented(&self) -> bool {
        matches!(self, FrameOutcome::Presented { .. })
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FrameStats {
    pub presented: u64,
    pub skipped: u64,
    /// Frames that failed after acquire; their image went back unrendered
    pub abandoned: u64,
    /// Command buffers currently allocated from the frame pool
    pub live_command_buffers: usize,
}

/// What an acquire result means for the rest of the frame
#[derive(Debug, PartialEq, Eq)]
enum Acquired {
    Image { index: u32, suboptimal: bool },
    NotReady,
}

fn classify_acquire(policy: AcquirePolicy, result: VkResult<(u32, bool)>) -> RenderResult<Acquired> {
    match result {
        Ok((index, suboptimal)) => Ok(Acquired::Image { index, suboptimal }),
        Err(vk::Result::NOT_READY | vk::Result::TIMEOUT) if policy == AcquirePolicy::NonBlocking => {
            Ok(Acquired::NotReady)
        }
        Err(e) => Err(RenderError::render(FrameStage::Acquire, e)),
    }
}

fn image_barrier(
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    src_access: vk::AccessFlags,
    dst_access: vk::AccessFlags,
) -> vk::ImageMemoryBarrier<'static> {
    vk::ImageMemoryBarrier::default()
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(color_range())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    /// Image acquired, the acquire semaphore is (or will be) signaled
    Acquired,
    /// Work is on the queue and consumes the acquire semaphore
    Submitted,
    /// GPU finished the frame
    Retired,
}

/// Scoped per-frame command buffers.
///
/// Dropping it leaves no GPU work referencing the buffers and frees them.
/// A frame abandoned after acquire still hands its image back: one barrier
/// into PRESENT_SRC, then present. Only if that cannot be submitted is the
/// acquire semaphore drained with an empty batch instead.
struct FrameCommands<'a> {
    device: &'a LogicalDevice,
    chain: &'a Swapchain,
    pool: vk::CommandPool,
    command_buffers: Vec<vk::CommandBuffer>,
    image_index: u32,
    image_acquired: vk::Semaphore,
    render_complete: vk::Semaphore,
    state: FrameState,
    stats: &'a mut FrameStats,
}

impl<'a> FrameCommands<'a> {
    fn new(
        device: &'a LogicalDevice,
        chain: &'a Swapchain,
        image_index: u32,
        semaphores: (vk::Semaphore, vk::Semaphore),
        pool: vk::CommandPool,
        stats: &'a mut FrameStats,
    ) -> Self {
        Self {
            device,
            chain,
            pool,
            command_buffers: Vec::with_capacity(1),
            image_index,
            image_acquired: semaphores.0,
            render_complete: semaphores.1,
            state: FrameState::Acquired,
            stats,
        }
    }

    fn allocate(&mut self) -> VkResult<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let buffers = unsafe { self.device.raw().allocate_command_buffers(&alloc_info) }?;
        let command_buffer = buffers
            .first()
            .copied()
            .ok_or(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)?;

        self.command_buffers.push(command_buffer);
        self.stats.live_command_buffers += 1;
        Ok(command_buffer)
    }

    /// Present the acquired image untouched so the chain gets it back
    fn release_image(&mut self) -> VkResult<()> {
        let image = self
            .chain
            .images()
            .get(self.image_index as usize)
            .copied()
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        let command_buffer = self.allocate()?;
        let raw = self.device.raw();

        let begin_info =
            vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        let begun = unsafe { raw.begin_command_buffer(command_buffer, &begin_info) };
        begun?;

        let to_present = image_barrier(
            image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::AccessFlags::empty(),
            vk::AccessFlags::empty(),
        );
        unsafe {
            raw.cmd_pipeline_barrier(
                command_buffer,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_present],
            );
        }
        let ended = unsafe { raw.end_command_buffer(command_buffer) };
        ended?;

        let wait_semaphores = [self.image_acquired];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [self.render_complete];
        let command_buffers = [command_buffer];
        let submit = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);
        let submitted =
            unsafe { raw.queue_submit(self.device.graphics_queue(), &[submit], vk::Fence::null()) };
        submitted?;
        self.state = FrameState::Submitted;

        self.chain
            .present(self.device.present_queue(), self.image_index, &signal_semaphores)?;
        self.device.wait_idle()?;
        self.state = FrameState::Retired;
        self.stats.abandoned += 1;
        Ok(())
    }

    /// Empty batch on the graphics queue consuming the acquire semaphore
    fn drain_acquire(&self) {
        let wait_semaphores = [self.image_acquired];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let submit = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages);

        let result = unsafe {
            self.device
                .raw()
                .queue_submit(self.device.graphics_queue(), &[submit], vk::Fence::null())
        }
        .and_then(|_| self.device.wait_idle());

        if let Err(e) = result {
            log::warn!("Failed to release the acquire semaphore: {}", e);
        }
    }
}

impl Drop for FrameCommands<'_> {
    fn drop(&mut self) {
        if self.state == FrameState::Acquired {
            log::debug!("Frame abandoned, handing image {} back", self.image_index);
            if let Err(e) = self.release_image() {
                log::warn!("Failed to hand back image {}: {}", self.image_index, e);
            }
        }

        match self.state {
            FrameState::Acquired => self.drain_acquire(),
            FrameState::Submitted => {
                if let Err(e) = self.device.wait_idle() {
                    log::warn!("Device wait before freeing the frame failed: {}", e);
                }
            }
            FrameState::Retired => {}
        }

        if !self.command_buffers.is_empty() {
            unsafe {
                self.device
                    .raw()
                    .free_command_buffers(self.pool, &self.command_buffers);
            }
            self.stats.live_command_buffers -= self.command_buffers.len();
            self.command_buffers.clear();
        }
    }
}

/// Drives the per-frame cycle against one composition at a time.
pub struct FrameScheduler {
    device: Arc<LogicalDevice>,
    command_pool: vk::CommandPool,
    image_acquired: vk::Semaphore,
    render_complete: vk::Semaphore,
    acquire: AcquirePolicy,
    clear_color: [f32; 4],
    stats: FrameStats,
}

impl FrameScheduler {
    pub fn new(device: Arc<LogicalDevice>, config: &RenderConfig) -> RenderResult<Self> {
        let raw = device.raw();

        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(device.graphics_family());
        let command_pool = unsafe { raw.create_command_pool(&pool_info, None) }.map_err(|e| {
            RenderError::DeviceCreationFailure(format!("frame command pool creation failed: {e}"))
        })?;

        let semaphore_info = vk::SemaphoreCreateInfo::default();
        let semaphores = unsafe {
            raw.create_semaphore(&semaphore_info, None).and_then(|acquired| {
                match raw.create_semaphore(&semaphore_info, None) {
                    Ok(complete) => Ok((acquired, complete)),
                    Err(e) => {
                        raw.destroy_semaphore(acquired, None);
                        Err(e)
                    }
                }
            })
        };

        let (image_acquired, render_complete) = match semaphores {
            Ok(pair) => pair,
            Err(e) => {
                unsafe { raw.destroy_command_pool(command_pool, None) };
                return Err(RenderError::DeviceCreationFailure(format!(
                    "frame semaphore creation failed: {e}"
                )));
            }
        };

        log::debug!("Frame scheduler ready ({:?} acquire)", config.acquire_policy());

        Ok(Self {
            device,
            command_pool,
            image_acquired,
            render_complete,
            acquire: config.acquire_policy(),
            clear_color: config.clear_color(),
            stats: FrameStats::default(),
        })
    }

    /// Render and present one frame of `composition`.
    ///
    /// `ERROR_OUT_OF_DATE_KHR` surfaces as a `RenderFailure`; the host is
    /// expected to recreate the swapchain and try again. Any other failure
    /// after acquire (including a layer or proxy error) hands the image back
    /// to the chain before returning, so calling again without recreating
    /// is safe.
    pub fn flush_render(&mut self, composition: &Composition) -> RenderResult<FrameOutcome> {
        let chain = composition
            .swapchain()
            .and_then(|manager| manager.swapchain())
            .ok_or_else(|| {
                RenderError::render(
                    FrameStage::Acquire,
                    format!("composition `{}` has no swapchain", composition.name()),
                )
            })?;

        // Step 1: Acquire
        let acquired = chain.acquire_next_image(self.acquire.timeout_ns(), self.image_acquired);
        let (image_index, acquire_suboptimal) = match classify_acquire(self.acquire, acquired)? {
            Acquired::Image { index, suboptimal } => (index, suboptimal),
            Acquired::NotReady => {
                self.stats.skipped += 1;
                log::trace!("No swapchain image ready, skipping frame");
                return Ok(FrameOutcome::Skipped);
            }
        };

        let device = self.device.as_ref();
        let raw = device.raw();
        let mut frame = FrameCommands::new(
            device,
            chain,
            image_index,
            (self.image_acquired, self.render_complete),
            self.command_pool,
            &mut self.stats,
        );

        // Step 2: Record
        let command_buffer = frame
            .allocate()
            .map_err(|e| RenderError::render(FrameStage::Record, e))?;
        let slot = image_index as usize;
        let (image, image_view) = match (chain.images().get(slot), chain.image_views().get(slot)) {
            (Some(&image), Some(&view)) => (image, view),
            _ => {
                return Err(RenderError::render(
                    FrameStage::Acquire,
                    format!("acquired image {image_index} is outside the chain"),
                ))
            }
        };
        let target = FrameTarget {
            device: raw,
            command_buffer,
            image_index,
            image,
            image_view,
            framebuffer: chain.framebuffers().get(slot).copied(),
            format: chain.format(),
            extent: chain.extent(),
        };

        let begin_info =
            vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        let begun = unsafe { raw.begin_command_buffer(command_buffer, &begin_info) };
        begun.map_err(|e| RenderError::render(FrameStage::Record, e))?;

        let to_general = image_barrier(
            image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::GENERAL,
            vk::AccessFlags::empty(),
            vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
        );
        unsafe {
            raw.cmd_pipeline_barrier(
                command_buffer,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_general],
            );
        }

        if composition.is_empty() {
            record_clear(&target, self.clear_color);
        } else {
            composition.render(&target)?;
        }

        let to_present = image_barrier(
            image,
            vk::ImageLayout::GENERAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::AccessFlags::MEMORY_WRITE,
            vk::AccessFlags::empty(),
        );
        unsafe {
            raw.cmd_pipeline_barrier(
                command_buffer,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_present],
            );
        }

        let ended = unsafe { raw.end_command_buffer(command_buffer) };
        ended.map_err(|e| RenderError::render(FrameStage::Record, e))?;

        // Step 3: Submit
        let wait_semaphores = [self.image_acquired];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [self.render_complete];
        let command_buffers = [command_buffer];
        let submit = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        let submitted =
            unsafe { raw.queue_submit(device.graphics_queue(), &[submit], vk::Fence::null()) };
        submitted.map_err(|e| RenderError::render(FrameStage::Submit, e))?;
        frame.state = FrameState::Submitted;

        // Step 4: Present
        let present_suboptimal = chain
            .present(device.present_queue(), image_index, &signal_semaphores)
            .map_err(|e| {
                if e == vk::Result::ERROR_OUT_OF_DATE_KHR {
                    log::debug!("Swapchain out of date at present");
                }
                RenderError::render(FrameStage::Present, e)
            })?;

        // Step 5: Synchronize
        device
            .wait_idle()
            .map_err(|e| RenderError::render(FrameStage::Synchronize, e))?;
        frame.state = FrameState::Retired;

        // Step 6: Release
        frame.stats.presented += 1;
        drop(frame);

        Ok(FrameOutcome::Presented {
            image_index,
            suboptimal: acquire_suboptimal || present_suboptimal,
        })
    }

    pub fn frame_stats(&self) -> FrameStats {
        self.stats
    }

    /// Semaphores owned by the scheduler; constant for its whole life
    pub fn semaphore_count(&self) -> usize {
        [self.image_acquired, self.render_complete]
            .iter()
            .filter(|semaphore| **semaphore != vk::Semaphore::null())
            .count()
    }

    pub fn acquire_policy(&self) -> AcquirePolicy {
        self.acquire
    }

    pub fn device(&self) -> &Arc<LogicalDevice> {
        &self.device
    }
}

impl Drop for FrameScheduler {
    fn drop(&mut self) {
        log::debug!("Destroying frame scheduler");
        if let Err(e) = self.device.wait_idle() {
            log::warn!("Device wait before destroying the scheduler failed: {}", e);
        }
        let raw = self.device.raw();
        unsafe {
            raw.destroy_semaphore(self.render_complete, None);
            raw.destroy_semaphore(self.image_acquired, None);
            raw.destroy_command_pool(self.command_pool, None);
        }
    }
}
