// GPU integration tests against VK_EXT_headless_surface.
//
// These need a Vulkan driver exposing the headless surface extension:
//     cargo test -- --ignored

use ash::vk;
use strata::composition::{FrameTarget, Layer, Proxy};
use strata::{
    AcquirePolicy, ClearLayer, FrameOutcome, FrameStage, LayerRegistry, ProxyLayer, RenderConfig, RenderError,
    RenderFeatures, RenderResult, Renderer,
};
use std::cell::Cell;
use std::rc::Rc;

fn bare_renderer(features: RenderFeatures, policy: AcquirePolicy) -> Renderer {
    let config = RenderConfig::new(features)
        .with_app_name("strata headless")
        .with_acquire_policy(policy)
        .with_clear_color([0.3, 0.3, 0.3, 1.0]);

    let extensions = [ash::khr::surface::NAME, ash::ext::headless_surface::NAME];
    Renderer::initialize(config, &extensions, &[]).expect("render context")
}

fn headless_surface(renderer: &Renderer) -> vk::SurfaceKHR {
    let loader = ash::ext::headless_surface::Instance::new(renderer.entry(), renderer.instance());
    unsafe { loader.create_headless_surface(&vk::HeadlessSurfaceCreateInfoEXT::default(), None) }
        .expect("headless surface")
}

fn headless_renderer(features: RenderFeatures, policy: AcquirePolicy) -> Renderer {
    let mut renderer = bare_renderer(features, policy);
    let surface = headless_surface(&renderer);
    renderer.set_surface(surface).expect("bind surface");
    renderer.create_device(&[], &[]).expect("logical device");
    renderer
}

fn renderer() -> Renderer {
    headless_renderer(RenderFeatures::SWAPCHAIN, AcquirePolicy::Blocking)
}

struct CountingProxy(Rc<Cell<u32>>);

impl Proxy for CountingProxy {
    fn record(&self, target: &FrameTarget<'_>) -> RenderResult<()> {
        assert!(target.extent.width > 0 && target.extent.height > 0);
        self.0.set(self.0.get() + 1);
        Ok(())
    }
}

/// Fails while the shared switch is on
struct FlakyProxy(Rc<Cell<bool>>);

impl Proxy for FlakyProxy {
    fn record(&self, _target: &FrameTarget<'_>) -> RenderResult<()> {
        if self.0.get() {
            Err(RenderError::render(FrameStage::Record, "asset not ready"))
        } else {
            Ok(())
        }
    }
}

#[test]
#[ignore = "needs a Vulkan driver"]
fn every_image_gets_exactly_one_view() {
    let mut renderer = renderer();
    renderer.create_swapchain(640, 480).unwrap();

    let composition = renderer.active_composition().unwrap();
    let chain = composition.swapchain().unwrap().swapchain().unwrap();
    assert!(!chain.images().is_empty());
    assert_eq!(chain.image_views().len(), chain.images().len());
    assert!(chain.framebuffers().is_empty());
    assert_ne!(chain.format(), vk::Format::UNDEFINED);
}

#[test]
#[ignore = "needs a Vulkan driver"]
fn recreation_uses_the_new_extent() {
    let mut renderer = renderer();
    renderer.create_swapchain(640, 480).unwrap();
    renderer.recreate_swapchain(800, 600).unwrap();

    let chain = renderer
        .active_composition()
        .unwrap()
        .swapchain()
        .unwrap()
        .swapchain()
        .unwrap();
    assert_eq!(chain.extent(), vk::Extent2D { width: 800, height: 600 });
    assert_eq!(chain.image_views().len(), chain.images().len());
}

#[test]
#[ignore = "needs a Vulkan driver"]
fn zero_extent_is_rejected() {
    let mut renderer = renderer();
    let err = renderer.create_swapchain(0, 480).unwrap_err();
    assert!(matches!(err, RenderError::SwapchainCreationFailure(_)));
}

#[test]
#[ignore = "needs a Vulkan driver"]
fn swapchain_requires_the_feature() {
    let mut renderer = headless_renderer(RenderFeatures::empty(), AcquirePolicy::Blocking);
    let err = renderer.create_swapchain(640, 480).unwrap_err();
    assert!(matches!(err, RenderError::SwapchainCreationFailure(_)));
}

#[test]
#[ignore = "needs a Vulkan driver"]
fn steady_state_frames_do_not_leak() {
    let mut renderer = renderer();
    renderer.create_swapchain(320, 240).unwrap();

    let recorded = Rc::new(Cell::new(0));
    let background = renderer.create_layer(LayerRegistry::CLEAR, "background").unwrap();
    renderer
        .layer_mut(background)
        .unwrap()
        .add_proxy(Box::new(CountingProxy(recorded.clone())));

    let semaphores = renderer.scheduler().unwrap().semaphore_count();
    let mut presented = 0;
    for _ in 0..5 {
        match renderer.flush_render().unwrap() {
            FrameOutcome::Presented { .. } => presented += 1,
            FrameOutcome::Skipped => unreachable!("blocking acquire never skips"),
        }
        let stats = renderer.frame_stats();
        assert_eq!(stats.live_command_buffers, 0);
        assert_eq!(renderer.scheduler().unwrap().semaphore_count(), semaphores);
    }

    assert_eq!(presented, 5);
    assert_eq!(recorded.get(), 5);
    assert_eq!(renderer.frame_stats().presented, 5);
}

#[test]
#[ignore = "needs a Vulkan driver"]
fn empty_composition_falls_back_to_clear() {
    let mut renderer = headless_renderer(RenderFeatures::SWAPCHAIN, AcquirePolicy::NonBlocking);
    renderer.create_swapchain(320, 240).unwrap();
    assert!(renderer.active_composition().unwrap().is_empty());

    for _ in 0..3 {
        renderer.flush_render().unwrap();
    }
    let stats = renderer.frame_stats();
    assert_eq!(stats.presented + stats.skipped, 3);
    assert_eq!(stats.live_command_buffers, 0);
}

#[test]
#[ignore = "needs a Vulkan driver"]
fn framebuffers_follow_image_views() {
    let mut renderer = renderer();
    renderer.create_swapchain(320, 240).unwrap();
    let device = renderer.logical_device().unwrap().clone();

    let format = renderer
        .active_composition()
        .unwrap()
        .swapchain()
        .unwrap()
        .swapchain()
        .unwrap()
        .format();

    let attachments = [vk::AttachmentDescription::default()
        .format(format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::LOAD)
        .store_op(vk::AttachmentStoreOp::STORE)
        .initial_layout(vk::ImageLayout::GENERAL)
        .final_layout(vk::ImageLayout::GENERAL)];
    let color_refs = [vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::GENERAL,
    }];
    let subpasses = [vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_refs)];
    let create_info = vk::RenderPassCreateInfo::default()
        .attachments(&attachments)
        .subpasses(&subpasses);
    let render_pass = unsafe { device.raw().create_render_pass(&create_info, None) }.unwrap();

    let chain = renderer
        .active_composition_mut()
        .unwrap()
        .swapchain_mut()
        .unwrap()
        .swapchain_mut()
        .unwrap();
    chain.create_framebuffers(render_pass).unwrap();
    assert_eq!(chain.framebuffers().len(), chain.image_views().len());

    // rebuilding replaces rather than appends
    chain.create_framebuffers(render_pass).unwrap();
    assert_eq!(chain.framebuffers().len(), chain.image_views().len());

    renderer.destroy_swapchain().unwrap();
    unsafe { device.raw().destroy_render_pass(render_pass, None) };
}

#[test]
#[ignore = "needs a Vulkan driver"]
fn lookups_on_the_active_composition() {
    let mut renderer = renderer();
    renderer.create_layer(LayerRegistry::PROXY, "world").unwrap();
    renderer.create_layer(LayerRegistry::CLEAR, "hud").unwrap();

    assert_eq!(renderer.layer_by_name("hud").unwrap().name(), "hud");
    assert_eq!(renderer.layers_of::<ProxyLayer>().unwrap().len(), 1);
    assert!(renderer.layer_as::<ClearLayer>(0).is_err());
    assert!(renderer.create_layer("sprite", "s").unwrap_err().is_recoverable());

    let offscreen = renderer.add_composition("offscreen", None);
    renderer.set_active_composition(offscreen).unwrap();
    assert!(renderer.layer(0).is_err());
    assert!(renderer.set_active_composition(7).is_err());
}

#[test]
#[ignore = "needs a Vulkan driver"]
fn failed_frames_hand_their_image_back() {
    let mut renderer = renderer();
    renderer.create_swapchain(320, 240).unwrap();
    let image_count = renderer
        .active_composition()
        .unwrap()
        .swapchain()
        .unwrap()
        .swapchain()
        .unwrap()
        .images()
        .len();

    let failing = Rc::new(Cell::new(true));
    let mut world = ProxyLayer::new("world");
    world.add_proxy(Box::new(FlakyProxy(failing.clone())));
    renderer.add_layer(Box::new(world)).unwrap();

    // more failures than the chain has images: a leaked image would block here
    let failures = image_count + 2;
    for _ in 0..failures {
        let err = renderer.flush_render().unwrap_err();
        assert!(matches!(
            err,
            RenderError::RenderFailure {
                stage: FrameStage::Record,
                ..
            }
        ));
        assert_eq!(renderer.frame_stats().live_command_buffers, 0);
    }
    assert_eq!(renderer.frame_stats().abandoned, failures as u64);

    failing.set(false);
    assert!(renderer.flush_render().unwrap().is_presented());
    assert_eq!(renderer.frame_stats().presented, 1);
    assert_eq!(renderer.frame_stats().live_command_buffers, 0);
}

#[test]
#[ignore = "needs a Vulkan driver"]
fn second_composition_presents_on_its_own_surface() {
    let mut renderer = renderer();
    renderer.create_swapchain(320, 240).unwrap();

    let surface = headless_surface(&renderer);
    let secondary = renderer.add_composition("secondary", Some(surface));
    renderer.set_active_composition(secondary).unwrap();
    renderer.create_swapchain(200, 100).unwrap();

    let chain = renderer
        .active_composition()
        .unwrap()
        .swapchain()
        .unwrap()
        .swapchain()
        .unwrap();
    assert_eq!(chain.extent(), vk::Extent2D { width: 200, height: 100 });
    assert!(renderer.flush_render().unwrap().is_presented());

    // rebinding replaces the chain; a new one must be built on the new surface
    let rebound = headless_surface(&renderer);
    renderer.set_surface(rebound).unwrap();
    assert!(renderer.active_composition().unwrap().swapchain().unwrap().swapchain().is_none());
    renderer.create_swapchain(200, 100).unwrap();
    assert!(renderer.flush_render().unwrap().is_presented());
}

#[test]
#[ignore = "needs a Vulkan driver"]
fn device_creation_requires_a_bound_surface() {
    let mut renderer = bare_renderer(RenderFeatures::SWAPCHAIN, AcquirePolicy::Blocking);
    let err = renderer.create_device(&[], &[]).unwrap_err();
    assert!(matches!(err, RenderError::DeviceSelectionFailure(_)));
    assert!(err.to_string().contains("surface"));
    assert!(renderer.logical_device().is_none());
}
