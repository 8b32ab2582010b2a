// Backend module - Vulkan abstraction layer
//
// Design: Thin wrapper around ash, RAII ownership for every handle

pub mod device;
pub mod selection;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use device::{LogicalDevice, RenderContext};
pub use selection::{DeviceSelector, FirstGraphicsCapable, PhysicalDeviceInfo, QueueFamilyIndices};
pub use surface::Surface;
pub use swapchain::{Swapchain, SwapchainManager};
pub use sync::{FrameOutcome, FrameScheduler, FrameStats};
