// Layers and proxies - the pluggable units a frame is recorded from
//
// A layer owns an ordered list of proxies and records them into the frame's
// command buffer. Images arrive in GENERAL layout and must leave in it.

use crate::error::RenderResult;
use ash::vk;
use std::any::Any;

/// Everything a layer needs to record into the current frame
#[derive(Clone, Copy)]
pub struct FrameTarget<'a> {
    pub device: &'a ash::Device,
    pub command_buffer: vk::CommandBuffer,
    pub image_index: u32,
    pub image: vk::Image,
    pub image_view: vk::ImageView,
    /// Present once `Swapchain::create_framebuffers` has been called
    pub framebuffer: Option<vk::Framebuffer>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

impl FrameTarget<'_> {
    /// Full render area of the target
    pub fn render_area(&self) -> vk::Rect2D {
        vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: self.extent,
        }
    }
}

/// Leaf rendering unit owned by a layer
pub trait Proxy {
    fn record(&self, target: &FrameTarget<'_>) -> RenderResult<()>;
}

pub trait Layer: Any {
    fn name(&self) -> &str;

    /// Append `proxy`; returns its dense zero-based index
    fn add_proxy(&mut self, proxy: Box<dyn Proxy>) -> usize;

    fn proxy_count(&self) -> usize;

    /// Record this layer. Takes `&self`: nothing is added while a frame records.
    fn render(&self, target: &FrameTarget<'_>) -> RenderResult<()>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Insertion-ordered proxy storage shared by the built-in layers
#[derive(Default)]
pub struct ProxyList {
    proxies: Vec<Box<dyn Proxy>>,
}

impl ProxyList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, proxy: Box<dyn Proxy>) -> usize {
        self.proxies.push(proxy);
        self.proxies.len() - 1
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    /// Stops at the first proxy that fails
    pub fn record_all(&self, target: &FrameTarget<'_>) -> RenderResult<()> {
        for proxy in &self.proxies {
            proxy.record(target)?;
        }
        Ok(())
    }
}

/// Plain layer: its proxies in order, nothing else
pub struct ProxyLayer {
    name: String,
    proxies: ProxyList,
}

impl ProxyLayer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            proxies: ProxyList::new(),
        }
    }
}

impl Layer for ProxyLayer {
    fn name(&self) -> &str {
        &self.name
    }

    fn add_proxy(&mut self, proxy: Box<dyn Proxy>) -> usize {
        self.proxies.push(proxy)
    }

    fn proxy_count(&self) -> usize {
        self.proxies.len()
    }

    fn render(&self, target: &FrameTarget<'_>) -> RenderResult<()> {
        self.proxies.record_all(target)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Clears the whole target to a color, then records its proxies
pub struct ClearLayer {
    name: String,
    color: [f32; 4],
    proxies: ProxyList,
}

impl ClearLayer {
    pub const DEFAULT_COLOR: [f32; 4] = [0.0, 0.0, 0.0, 1.0];

    pub fn new(name: impl Into<String>, color: [f32; 4]) -> Self {
        Self {
            name: name.into(),
            color,
            proxies: ProxyList::new(),
        }
    }

    pub fn color(&self) -> [f32; 4] {
        self.color
    }

    pub fn set_color(&mut self, color: [f32; 4]) {
        self.color = color;
    }
}

impl Layer for ClearLayer {
    fn name(&self) -> &str {
        &self.name
    }

    fn add_proxy(&mut self, proxy: Box<dyn Proxy>) -> usize {
        self.proxies.push(proxy)
    }

    fn proxy_count(&self) -> usize {
        self.proxies.len()
    }

    fn render(&self, target: &FrameTarget<'_>) -> RenderResult<()> {
        record_clear(target, self.color);
        self.proxies.record_all(target)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub(crate) fn color_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

/// Clear the target image in place (GENERAL layout)
pub(crate) fn record_clear(target: &FrameTarget<'_>, rgba: [f32; 4]) {
    let clear = vk::ClearColorValue { float32: rgba };
    let ranges = [color_range()];
    unsafe {
        target.device.cmd_clear_color_image(
            target.command_buffer,
            target.image,
            vk::ImageLayout::GENERAL,
            &clear,
            &ranges,
        );
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::RenderError;
    use std::cell::RefCell;
    use std::rc::Rc;

    pub(crate) type Journal = Rc<RefCell<Vec<String>>>;

    /// Device whose entry points are never loaded; valid as long as nothing calls into it
    pub(crate) fn stub_device() -> ash::Device {
        unsafe { ash::Device::load_with(|_| std::ptr::null(), vk::Device::null()) }
    }

    pub(crate) fn target(device: &ash::Device) -> FrameTarget<'_> {
        FrameTarget {
            device,
            command_buffer: vk::CommandBuffer::null(),
            image_index: 0,
            image: vk::Image::null(),
            image_view: vk::ImageView::null(),
            framebuffer: None,
            format: vk::Format::B8G8R8A8_SRGB,
            extent: vk::Extent2D {
                width: 64,
                height: 32,
            },
        }
    }

    /// Proxy that writes its label into a shared journal
    pub(crate) struct Recording {
        pub label: String,
        pub journal: Journal,
    }

    impl Proxy for Recording {
        fn record(&self, _target: &FrameTarget<'_>) -> RenderResult<()> {
            self.journal.borrow_mut().push(self.label.clone());
            Ok(())
        }
    }

    pub(crate) fn recording(label: &str, journal: &Journal) -> Box<dyn Proxy> {
        Box::new(Recording {
            label: label.to_string(),
            journal: journal.clone(),
        })
    }

    struct Failing;

    impl Proxy for Failing {
        fn record(&self, _target: &FrameTarget<'_>) -> RenderResult<()> {
            Err(RenderError::render(crate::error::FrameStage::Record, "proxy gave up"))
        }
    }

    #[test]
    fn proxy_indices_are_dense_and_increasing() {
        let journal = Journal::default();
        let mut layer = ProxyLayer::new("scene");
        assert_eq!(layer.add_proxy(recording("a", &journal)), 0);
        assert_eq!(layer.add_proxy(recording("b", &journal)), 1);
        assert_eq!(layer.add_proxy(recording("c", &journal)), 2);
        assert_eq!(layer.proxy_count(), 3);
    }

    #[test]
    fn proxies_record_in_insertion_order() {
        let device = stub_device();
        let journal = Journal::default();
        let mut layer = ProxyLayer::new("scene");
        for label in ["p0", "p1", "p2"] {
            layer.add_proxy(recording(label, &journal));
        }

        layer.render(&target(&device)).unwrap();
        assert_eq!(*journal.borrow(), vec!["p0", "p1", "p2"]);
    }

    #[test]
    fn empty_layer_records_nothing() {
        let device = stub_device();
        let layer = ProxyLayer::new("empty");
        assert!(layer.render(&target(&device)).is_ok());
        assert_eq!(layer.proxy_count(), 0);
    }

    #[test]
    fn first_failing_proxy_stops_the_layer() {
        let device = stub_device();
        let journal = Journal::default();
        let mut layer = ProxyLayer::new("scene");
        layer.add_proxy(recording("before", &journal));
        layer.add_proxy(Box::new(Failing));
        layer.add_proxy(recording("after", &journal));

        let err = layer.render(&target(&device)).unwrap_err();
        assert!(matches!(err, RenderError::RenderFailure { .. }));
        assert_eq!(*journal.borrow(), vec!["before"]);
    }

    #[test]
    fn clear_layer_color_is_adjustable() {
        let mut layer = ClearLayer::new("background", ClearLayer::DEFAULT_COLOR);
        layer.set_color([0.2, 0.4, 0.6, 1.0]);
        assert_eq!(layer.color(), [0.2, 0.4, 0.6, 1.0]);
        assert_eq!(layer.name(), "background");
    }

    #[test]
    fn render_area_covers_the_extent() {
        let device = stub_device();
        let area = target(&device).render_area();
        assert_eq!((area.extent.width, area.extent.height), (64, 32));
        assert_eq!((area.offset.x, area.offset.y), (0, 0));
    }
}
