// Presentable surface supplied by the windowing layer
//
// The host creates the raw handle (it needs the instance for that) and
// hands ownership over. The surface is destroyed after every swapchain
// built on it and before the instance.

use ash::vk;

pub struct Surface {
    handle: vk::SurfaceKHR,
    loader: ash::khr::surface::Instance,
}

impl Surface {
    /// Take ownership of `handle`, which must come from the same instance as `loader`
    pub fn new(handle: vk::SurfaceKHR, loader: ash::khr::surface::Instance) -> Self {
        Self { handle, loader }
    }

    pub fn handle(&self) -> vk::SurfaceKHR {
        self.handle
    }

    pub fn loader(&self) -> &ash::khr::surface::Instance {
        &self.loader
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        log::debug!("Destroying surface {:?}", self.handle);
        unsafe {
            self.loader.destroy_surface(self.handle, None);
        }
    }
}
