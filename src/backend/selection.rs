// Physical device selection and queue family discovery
//
// Everything here works on plain snapshots of driver data so the policies
// can be exercised without a GPU.

use crate::error::{RenderError, RenderResult};
use ash::vk;
use std::ffi::CStr;

/// Read-only snapshot of an enumerated GPU
#[derive(Debug, Clone)]
pub struct PhysicalDeviceInfo {
    pub handle: vk::PhysicalDevice,
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub api_version: u32,
    pub queue_families: Vec<vk::QueueFamilyProperties>,
}

impl PhysicalDeviceInfo {
    /// Query properties and queue families of `handle`
    pub fn query(instance: &ash::Instance, handle: vk::PhysicalDevice) -> Self {
        let properties = unsafe { instance.get_physical_device_properties(handle) };
        let queue_families =
            unsafe { instance.get_physical_device_queue_family_properties(handle) };

        let name = properties
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "<unnamed device>".to_string());

        Self {
            handle,
            name,
            device_type: properties.device_type,
            api_version: properties.api_version,
            queue_families,
        }
    }

    pub fn has_graphics_queue(&self) -> bool {
        self.queue_families
            .iter()
            .any(|family| family.queue_flags.contains(vk::QueueFlags::GRAPHICS))
    }
}

/// Strategy choosing the physical device the renderer runs on.
///
/// Presentation support is not known at this point; it is re-validated
/// against the real surface when the logical device is created.
pub trait DeviceSelector {
    fn select<'a>(&self, devices: &'a [PhysicalDeviceInfo]) -> Option<&'a PhysicalDeviceInfo>;
}

/// First device in enumeration order exposing a graphics queue family.
/// Devices are not ranked.
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstGraphicsCapable;

impl DeviceSelector for FirstGraphicsCapable {
    fn select<'a>(&self, devices: &'a [PhysicalDeviceInfo]) -> Option<&'a PhysicalDeviceInfo> {
        devices.iter().find(|device| device.has_graphics_queue())
    }
}

/// Run `selector` over `devices`, turning a refusal into an error
pub fn select_device<'a>(
    selector: &dyn DeviceSelector,
    devices: &'a [PhysicalDeviceInfo],
) -> RenderResult<&'a PhysicalDeviceInfo> {
    selector.select(devices).ok_or_else(|| {
        RenderError::DeviceSelectionFailure(format!(
            "none of the {} enumerated devices is suitable",
            devices.len()
        ))
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: Option<u32>,
    pub present: Option<u32>,
}

impl QueueFamilyIndices {
    /// Single pass over `families`.
    ///
    /// The first graphics-capable family becomes `graphics`. Independently,
    /// the first family for which `present_support` answers true becomes
    /// `present`. Without a query function presentation is not queried.
    /// The scan stops as soon as both are known.
    pub fn discover<F>(families: &[vk::QueueFamilyProperties], mut present_support: Option<F>) -> Self
    where
        F: FnMut(u32) -> bool,
    {
        let mut indices = QueueFamilyIndices::default();

        for (index, family) in (0u32..).zip(families) {
            if indices.graphics.is_none() && family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
                indices.graphics = Some(index);
            }

            if indices.present.is_none() {
                if let Some(query) = present_support.as_mut() {
                    if query(index) {
                        indices.present = Some(index);
                    }
                }
            }

            if indices.is_complete() {
                break;
            }
        }

        indices
    }

    /// Graphics-only discovery, used where no surface exists yet
    pub fn discover_graphics(families: &[vk::QueueFamilyProperties]) -> Self {
        Self::discover(families, None::<fn(u32) -> bool>)
    }

    pub fn is_complete(&self) -> bool {
        self.graphics.is_some() && self.present.is_some()
    }

    /// Distinct families that need a queue, graphics first
    pub fn unique_families(&self) -> Vec<u32> {
        let mut families = Vec::with_capacity(2);
        for index in [self.graphics, self.present].into_iter().flatten() {
            if !families.contains(&index) {
                families.push(index);
            }
        }
        families
    }
}

/// Union of two name lists: `base` first, then `extra`, no duplicates.
pub fn union_names<'a>(base: &[&'a CStr], extra: &[&'a CStr]) -> Vec<&'a CStr> {
    let mut names: Vec<&CStr> = Vec::with_capacity(base.len() + extra.len());
    for &name in base.iter().chain(extra) {
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}
