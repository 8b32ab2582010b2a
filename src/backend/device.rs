// Render context - instance, physical device and logical device
//
// Responsibilities:
// - Loader bootstrap and instance creation (engine set + caller lists)
// - Physical device selection through a pluggable DeviceSelector
// - Logical device + queue creation against the bound surface
// - Optional debug messenger forwarding validation output into `log`

use crate::backend::selection::{
    select_device, union_names, DeviceSelector, PhysicalDeviceInfo, QueueFamilyIndices,
};
use crate::config::{RenderConfig, RenderFeatures};
use crate::error::{RenderError, RenderResult};
use ash::prelude::VkResult;
use ash::{vk, Entry};
use std::ffi::{c_char, c_void, CStr, CString};
use std::sync::Arc;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";
const ENGINE_NAME: &CStr = c"strata";

/// Instance extensions the engine itself needs for `features`
pub fn base_instance_extensions(features: RenderFeatures) -> Vec<&'static CStr> {
    let mut extensions = Vec::new();
    if features.contains(RenderFeatures::SWAPCHAIN) {
        extensions.push(ash::khr::surface::NAME);
    }
    if features.contains(RenderFeatures::VALIDATION) {
        extensions.push(ash::ext::debug_utils::NAME);
    }
    extensions
}

pub fn base_instance_layers(features: RenderFeatures) -> Vec<&'static CStr> {
    if features.contains(RenderFeatures::VALIDATION) {
        vec![VALIDATION_LAYER]
    } else {
        Vec::new()
    }
}

/// Device extensions the engine itself needs for `features`
pub fn base_device_extensions(features: RenderFeatures) -> Vec<&'static CStr> {
    let mut extensions = Vec::new();
    if features.contains(RenderFeatures::SWAPCHAIN) {
        extensions.push(ash::khr::swapchain::NAME);
    }
    if features.contains(RenderFeatures::RAY_TRACING) {
        extensions.push(ash::khr::acceleration_structure::NAME);
        extensions.push(ash::khr::ray_tracing_pipeline::NAME);
        extensions.push(ash::khr::deferred_host_operations::NAME);
    }
    extensions
}

fn as_ptrs(names: &[&CStr]) -> Vec<*const c_char> {
    names.iter().map(|name| name.as_ptr()).collect()
}

/// Logical device with its queues and device-level loaders.
///
/// Shared by `Arc` with every swapchain and the frame scheduler; the device
/// is destroyed when the last of them lets go.
pub struct LogicalDevice {
    device: ash::Device,
    physical_device: vk::PhysicalDevice,
    graphics_family: u32,
    present_family: u32,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
    surface_loader: ash::khr::surface::Instance,
    swapchain_loader: Option<ash::khr::swapchain::Device>,
}

impl LogicalDevice {
    pub fn raw(&self) -> &ash::Device {
        &self.device
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn queue_families(&self) -> QueueFamilyIndices {
        QueueFamilyIndices {
            graphics: Some(self.graphics_family),
            present: Some(self.present_family),
        }
    }

    pub fn graphics_family(&self) -> u32 {
        self.graphics_family
    }

    pub fn present_family(&self) -> u32 {
        self.present_family
    }

    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    pub fn present_queue(&self) -> vk::Queue {
        self.present_queue
    }

    pub fn surface_loader(&self) -> &ash::khr::surface::Instance {
        &self.surface_loader
    }

    /// `None` unless the SWAPCHAIN feature was enabled
    pub fn swapchain_loader(&self) -> Option<&ash::khr::swapchain::Device> {
        self.swapchain_loader.as_ref()
    }

    /// Block until the GPU has finished every submitted command
    pub fn wait_idle(&self) -> VkResult<()> {
        unsafe { self.device.device_wait_idle() }
    }
}

impl Drop for LogicalDevice {
    fn drop(&mut self) {
        log::info!("Destroying logical device...");
        if let Err(e) = self.wait_idle() {
            log::warn!("Device wait before destruction failed: {}", e);
        }
        unsafe {
            self.device.destroy_device(None);
        }
    }
}

struct DebugMessenger {
    loader: ash::ext::debug_utils::Instance,
    handle: vk::DebugUtilsMessengerEXT,
}

/// API connection, selected GPU and (once created) the logical device.
pub struct RenderContext {
    config: RenderConfig,
    device_info: PhysicalDeviceInfo,
    device: Option<Arc<LogicalDevice>>,
    debug_messenger: Option<DebugMessenger>,
    surface_loader: ash::khr::surface::Instance,
    instance: ash::Instance,
    entry: Entry,
}

impl RenderContext {
    /// Load Vulkan, create the instance and select a physical device.
    ///
    /// `extensions` and `layers` are appended to the engine base set derived
    /// from the configured features.
    pub fn initialize(
        config: RenderConfig,
        selector: &dyn DeviceSelector,
        extensions: &[&CStr],
        layers: &[&CStr],
    ) -> RenderResult<Self> {
        log::info!("Initializing render context: {}", config.app_name());

        // Step 1: Load Vulkan library
        let entry = unsafe { Entry::load() }.map_err(|e| {
            RenderError::InitializationFailure(format!("failed to load the Vulkan loader: {e}"))
        })?;

        // Step 2: Create instance
        let instance = Self::create_instance(&entry, &config, extensions, layers)?;

        // Step 3: Pick physical device
        let device_info = match Self::pick_physical_device(&instance, selector) {
            Ok(info) => info,
            Err(err) => {
                unsafe { instance.destroy_instance(None) };
                return Err(err);
            }
        };

        log::info!(
            "Selected GPU: {} ({:?}, API {}.{}.{})",
            device_info.name,
            device_info.device_type,
            vk::api_version_major(device_info.api_version),
            vk::api_version_minor(device_info.api_version),
            vk::api_version_patch(device_info.api_version)
        );

        let surface_loader = ash::khr::surface::Instance::new(&entry, &instance);
        let mut context = Self {
            config,
            device_info,
            device: None,
            debug_messenger: None,
            surface_loader,
            instance,
            entry,
        };

        // Step 4: Route validation output into the log
        if context.config.features().contains(RenderFeatures::VALIDATION) {
            unsafe {
                context.create_debug_messenger(Some(log_debug_callback), std::ptr::null_mut())?;
            }
        }

        Ok(context)
    }

    fn create_instance(
        entry: &Entry,
        config: &RenderConfig,
        extensions: &[&CStr],
        layers: &[&CStr],
    ) -> RenderResult<ash::Instance> {
        let app_name = CString::new(config.app_name()).map_err(|_| {
            RenderError::InitializationFailure("application name contains a NUL byte".into())
        })?;

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(ENGINE_NAME)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_3);

        let features = config.features();
        let extension_names = union_names(&base_instance_extensions(features), extensions);
        let layer_names = union_names(&base_instance_layers(features), layers);

        if features.contains(RenderFeatures::VALIDATION) {
            Self::warn_missing_layers(entry, &layer_names);
        }

        log::debug!("Instance extensions: {:?}", extension_names);
        log::debug!("Instance layers: {:?}", layer_names);

        let extension_ptrs = as_ptrs(&extension_names);
        let layer_ptrs = as_ptrs(&layer_names);

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extension_ptrs)
            .enabled_layer_names(&layer_ptrs);

        let instance = unsafe { entry.create_instance(&create_info, None) }.map_err(|e| {
            RenderError::InitializationFailure(format!("failed to create Vulkan instance: {e}"))
        })?;
        Ok(instance)
    }

    fn warn_missing_layers(entry: &Entry, requested: &[&CStr]) {
        let Ok(available) = (unsafe { entry.enumerate_instance_layer_properties() }) else {
            return;
        };

        for layer in requested {
            let present = available
                .iter()
                .any(|props| props.layer_name_as_c_str().is_ok_and(|name| name == *layer));
            if !present {
                log::warn!("Instance layer {:?} is not installed", layer);
            }
        }
    }

    fn pick_physical_device(
        instance: &ash::Instance,
        selector: &dyn DeviceSelector,
    ) -> RenderResult<PhysicalDeviceInfo> {
        let handles = unsafe { instance.enumerate_physical_devices() }.map_err(|e| {
            RenderError::InitializationFailure(format!("failed to enumerate GPUs: {e}"))
        })?;

        if handles.is_empty() {
            return Err(RenderError::InitializationFailure(
                "no Vulkan-capable GPU found".into(),
            ));
        }

        let devices: Vec<PhysicalDeviceInfo> = handles
            .into_iter()
            .map(|handle| PhysicalDeviceInfo::query(instance, handle))
            .collect();

        for device in &devices {
            log::debug!(
                "Found GPU: {} ({:?}, {} queue families)",
                device.name,
                device.device_type,
                device.queue_families.len()
            );
        }

        select_device(selector, &devices).cloned()
    }

    /// Create the logical device.
    ///
    /// Queue families are rediscovered against `surface`; both a graphics
    /// and a present family are required.
    pub fn create_device(
        &mut self,
        surface: Option<vk::SurfaceKHR>,
        extensions: &[&CStr],
        layers: &[&CStr],
    ) -> RenderResult<Arc<LogicalDevice>> {
        if self.device.is_some() {
            return Err(RenderError::DeviceCreationFailure(
                "a logical device already exists for this context".into(),
            ));
        }

        let indices = self.find_queue_families(surface);
        let (graphics_family, present_family) = match (indices.graphics, indices.present) {
            (Some(graphics), Some(present)) => (graphics, present),
            _ => {
                return Err(RenderError::DeviceSelectionFailure(format!(
                    "{} has incomplete queue families (graphics: {:?}, present: {:?})",
                    self.device_info.name, indices.graphics, indices.present
                )))
            }
        };

        // One queue per distinct family
        let queue_priorities = [1.0];
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = indices
            .unique_families()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
            })
            .collect();

        let features = self.config.features();
        let extension_names = union_names(&base_device_extensions(features), extensions);
        let layer_names = union_names(&[], layers);
        log::debug!("Device extensions: {:?}", extension_names);

        let extension_ptrs = as_ptrs(&extension_names);
        let layer_ptrs = as_ptrs(&layer_names);

        #[allow(deprecated)]
        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extension_ptrs)
            .enabled_layer_names(&layer_ptrs);

        let device = unsafe {
            self.instance
                .create_device(self.device_info.handle, &create_info, None)
        }
        .map_err(|e| RenderError::DeviceCreationFailure(e.to_string()))?;

        let graphics_queue = unsafe { device.get_device_queue(graphics_family, 0) };
        let present_queue = unsafe { device.get_device_queue(present_family, 0) };

        let swapchain_loader = features
            .contains(RenderFeatures::SWAPCHAIN)
            .then(|| ash::khr::swapchain::Device::new(&self.instance, &device));

        log::info!(
            "Created logical device (graphics family {}, present family {})",
            graphics_family,
            present_family
        );

        let logical = Arc::new(LogicalDevice {
            device,
            physical_device: self.device_info.handle,
            graphics_family,
            present_family,
            graphics_queue,
            present_queue,
            surface_loader: self.surface_loader.clone(),
            swapchain_loader,
        });
        self.device = Some(logical.clone());
        Ok(logical)
    }

    /// Queue family discovery for the selected GPU, probing `surface` for presentation
    pub fn find_queue_families(&self, surface: Option<vk::SurfaceKHR>) -> QueueFamilyIndices {
        let physical = self.device_info.handle;
        let loader = &self.surface_loader;

        let present_support = surface.map(|surface| {
            move |index: u32| {
                let supported =
                    unsafe { loader.get_physical_device_surface_support(physical, index, surface) };
                supported.unwrap_or_else(|e| {
                    log::warn!("Presentation query failed for family {}: {}", index, e);
                    false
                })
            }
        });

        QueueFamilyIndices::discover(&self.device_info.queue_families, present_support)
    }

    /// Install `callback` as the debug messenger, replacing any existing one.
    ///
    /// # Safety
    /// `user_data` is passed verbatim to `callback` and must stay valid for
    /// as long as the messenger exists.
    pub unsafe fn create_debug_messenger(
        &mut self,
        callback: vk::PFN_vkDebugUtilsMessengerCallbackEXT,
        user_data: *mut c_void,
    ) -> RenderResult<()> {
        if !self.config.features().contains(RenderFeatures::VALIDATION) {
            return Err(RenderError::InitializationFailure(
                "debug messenger requires the VALIDATION feature".into(),
            ));
        }

        self.destroy_debug_messenger();

        let loader = ash::ext::debug_utils::Instance::new(&self.entry, &self.instance);
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(callback)
            .user_data(user_data);

        let handle = unsafe { loader.create_debug_utils_messenger(&create_info, None) }.map_err(
            |e| RenderError::InitializationFailure(format!("failed to create debug messenger: {e}")),
        )?;

        self.debug_messenger = Some(DebugMessenger { loader, handle });
        Ok(())
    }

    pub(crate) fn destroy_debug_messenger(&mut self) {
        if let Some(messenger) = self.debug_messenger.take() {
            unsafe {
                messenger
                    .loader
                    .destroy_debug_utils_messenger(messenger.handle, None);
            }
        }
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.device_info.handle
    }

    pub fn device_info(&self) -> &PhysicalDeviceInfo {
        &self.device_info
    }

    pub fn surface_loader(&self) -> &ash::khr::surface::Instance {
        &self.surface_loader
    }

    pub fn logical_device(&self) -> Option<&Arc<LogicalDevice>> {
        self.device.as_ref()
    }
}

impl Drop for RenderContext {
    fn drop(&mut self) {
        log::info!("Destroying render context...");

        self.destroy_debug_messenger();

        if let Some(device) = self.device.take() {
            if Arc::strong_count(&device) > 1 {
                log::warn!("Logical device still referenced while the context is dropped");
            }
            drop(device);
        }

        unsafe {
            self.instance.destroy_instance(None);
        }
    }
}

/// Default messenger callback: Vulkan severities mapped onto `log` levels
unsafe extern "system" fn log_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _p_user_data: *mut c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || unsafe { (*p_callback_data).p_message.is_null() } {
        return vk::FALSE;
    }
    let message = unsafe { CStr::from_ptr((*p_callback_data).p_message) }.to_string_lossy();

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan {:?}] {}", message_type, message);
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan {:?}] {}", message_type, message);
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
            log::info!("[Vulkan {:?}] {}", message_type, message);
        }
        _ => {
            log::trace!("[Vulkan {:?}] {}", message_type, message);
        }
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_sets_follow_features() {
        assert_eq!(
            base_instance_extensions(RenderFeatures::SWAPCHAIN),
            vec![ash::khr::surface::NAME]
        );
        assert!(base_instance_layers(RenderFeatures::SWAPCHAIN).is_empty());

        let debug = RenderFeatures::SWAPCHAIN | RenderFeatures::VALIDATION;
        assert!(base_instance_extensions(debug).contains(&ash::ext::debug_utils::NAME));
        assert_eq!(base_instance_layers(debug), vec![VALIDATION_LAYER]);
    }

    #[test]
    fn swapchain_extension_comes_first() {
        let names = union_names(
            &base_device_extensions(RenderFeatures::SWAPCHAIN | RenderFeatures::RAY_TRACING),
            &[c"VK_KHR_custom", ash::khr::swapchain::NAME],
        );
        assert_eq!(names[0], ash::khr::swapchain::NAME);
        assert_eq!(names.last(), Some(&c"VK_KHR_custom"));
        assert_eq!(names.len(), 5);
    }

    #[test]
    fn headless_feature_set_needs_no_device_extensions() {
        assert!(base_device_extensions(RenderFeatures::empty()).is_empty());
    }
}
