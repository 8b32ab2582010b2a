// =============================================================================
// STRATA - Vulkan orchestration layer
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  Renderer (host facade)                                         │
// │    ├── RenderContext (instance, GPU, logical device)            │
// │    ├── Compositions                                             │
// │    │     ├── SwapchainManager (surface + image chain)           │
// │    │     └── Layers -> Proxies (draw command recording)         │
// │    └── FrameScheduler (acquire, record, submit, present)        │
// └─────────────────────────────────────────────────────────────────┘
//
// =============================================================================

pub mod backend;
pub mod composition;
pub mod config;
pub mod error;
pub mod renderer;

pub use backend::{
    DeviceSelector, FirstGraphicsCapable, FrameOutcome, FrameStats, LogicalDevice,
    PhysicalDeviceInfo, RenderContext,
};
pub use composition::{ClearLayer, Composition, FrameTarget, Layer, LayerRegistry, Proxy, ProxyLayer};
pub use config::{AcquirePolicy, Config, RenderConfig, RenderFeatures};
pub use error::{FrameStage, RenderError, RenderResult};
pub use renderer::Renderer;
