// Composition graph
//
// Composition -> Layer -> Proxy, each level an insertion-ordered list.
// Insertion order is painting order; nothing is ever reordered or removed.

pub mod layer;
pub mod registry;

pub use layer::{ClearLayer, FrameTarget, Layer, Proxy, ProxyLayer, ProxyList};
pub use registry::{LayerFactory, LayerRegistry};

use crate::backend::swapchain::SwapchainManager;
use crate::error::{RenderError, RenderResult};
use std::any::type_name;

pub struct Composition {
    name: String,
    // Layers go before the chain they draw into
    layers: Vec<Box<dyn Layer>>,
    swapchain: Option<SwapchainManager>,
}

impl Composition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            layers: Vec::new(),
            swapchain: None,
        }
    }

    pub fn with_swapchain(name: impl Into<String>, swapchain: SwapchainManager) -> Self {
        Self {
            swapchain: Some(swapchain),
            ..Self::new(name)
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append `layer`; returns its dense zero-based index
    pub fn add_layer(&mut self, layer: Box<dyn Layer>) -> usize {
        log::debug!("Composition `{}`: adding layer `{}`", self.name, layer.name());
        self.layers.push(layer);
        self.layers.len() - 1
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn layer(&self, index: usize) -> RenderResult<&dyn Layer> {
        self.layers
            .get(index)
            .map(|layer| layer.as_ref())
            .ok_or_else(|| RenderError::not_found("layer", index))
    }

    pub fn layer_mut(&mut self, index: usize) -> RenderResult<&mut dyn Layer> {
        match self.layers.get_mut(index) {
            Some(layer) => Ok(layer.as_mut()),
            None => Err(RenderError::not_found("layer", index)),
        }
    }

    /// First layer called `name`
    pub fn layer_by_name(&self, name: &str) -> RenderResult<&dyn Layer> {
        self.layers
            .iter()
            .find(|layer| layer.name() == name)
            .map(|layer| layer.as_ref())
            .ok_or_else(|| RenderError::not_found("layer", name))
    }

    pub fn layer_by_name_mut(&mut self, name: &str) -> RenderResult<&mut dyn Layer> {
        match self.layers.iter_mut().find(|layer| layer.name() == name) {
            Some(layer) => Ok(layer.as_mut()),
            None => Err(RenderError::not_found("layer", name)),
        }
    }

    /// Every layer whose concrete type is `T`, in painting order
    pub fn layers_of<T: Layer>(&self) -> Vec<&T> {
        self.layers
            .iter()
            .filter_map(|layer| layer.as_any().downcast_ref::<T>())
            .collect()
    }

    pub fn layer_as<T: Layer>(&self, index: usize) -> RenderResult<&T> {
        self.layer(index)?
            .as_any()
            .downcast_ref::<T>()
            .ok_or_else(|| RenderError::not_found(type_name::<T>(), index))
    }

    pub fn layer_as_mut<T: Layer>(&mut self, index: usize) -> RenderResult<&mut T> {
        self.layer_mut(index)?
            .as_any_mut()
            .downcast_mut::<T>()
            .ok_or_else(|| RenderError::not_found(type_name::<T>(), index))
    }

    /// Record every layer in insertion order into `target`
    pub fn render(&self, target: &FrameTarget<'_>) -> RenderResult<()> {
        for layer in &self.layers {
            layer.render(target)?;
        }
        Ok(())
    }

    pub fn swapchain(&self) -> Option<&SwapchainManager> {
        self.swapchain.as_ref()
    }

    pub fn swapchain_mut(&mut self) -> Option<&mut SwapchainManager> {
        self.swapchain.as_mut()
    }

    /// Replace the bound chain, returning the previous one
    pub fn set_swapchain(&mut self, swapchain: SwapchainManager) -> Option<SwapchainManager> {
        self.swapchain.replace(swapchain)
    }
}

#[cfg(test)]
mod tests {
    use super::layer::tests::{recording, stub_device, target, Journal};
    use super::*;

    fn scene(journal: &Journal) -> Composition {
        let mut composition = Composition::new("main");
        let mut background = ProxyLayer::new("background");
        background.add_proxy(recording("background/sky", journal));
        let mut world = ProxyLayer::new("world");
        world.add_proxy(recording("world/terrain", journal));
        world.add_proxy(recording("world/units", journal));
        let mut hud = ClearLayer::new("hud", ClearLayer::DEFAULT_COLOR);
        hud.add_proxy(recording("hud/text", journal));

        composition.add_layer(Box::new(background));
        composition.add_layer(Box::new(world));
        composition.add_layer(Box::new(hud));
        composition
    }

    #[test]
    fn layer_indices_are_dense_and_increasing() {
        let mut composition = Composition::new("main");
        assert!(composition.is_empty());
        for expected in 0..4 {
            let index = composition.add_layer(Box::new(ProxyLayer::new(format!("l{expected}"))));
            assert_eq!(index, expected);
        }
        assert_eq!(composition.len(), 4);
        assert_eq!(composition.layer(2).unwrap().name(), "l2");
    }

    #[test]
    fn proxy_layers_render_in_painter_order() {
        let device = stub_device();
        let journal = Journal::default();
        let mut composition = Composition::new("main");
        for name in ["first", "second"] {
            let mut layer = ProxyLayer::new(name);
            layer.add_proxy(recording(&format!("{name}/a"), &journal));
            layer.add_proxy(recording(&format!("{name}/b"), &journal));
            composition.add_layer(Box::new(layer));
        }

        composition.render(&target(&device)).unwrap();
        assert_eq!(
            *journal.borrow(),
            vec!["first/a", "first/b", "second/a", "second/b"]
        );
    }

    #[test]
    fn empty_composition_renders_nothing() {
        let device = stub_device();
        assert!(Composition::new("idle").render(&target(&device)).is_ok());
    }

    #[test]
    fn out_of_range_index_is_not_found() {
        let journal = Journal::default();
        let mut composition = scene(&journal);
        assert!(composition.layer(3).err().unwrap().is_recoverable());
        assert!(composition.layer_mut(99).is_err());
    }

    #[test]
    fn name_lookup_returns_first_match() {
        let mut composition = Composition::new("main");
        composition.add_layer(Box::new(ProxyLayer::new("dup")));
        let mut second = ProxyLayer::new("dup");
        second.add_proxy(recording("x", &Journal::default()));
        composition.add_layer(Box::new(second));

        assert_eq!(composition.layer_by_name("dup").unwrap().proxy_count(), 0);
        assert!(composition.layer_by_name("missing").is_err());

        let layer = composition.layer_by_name_mut("dup").unwrap();
        layer.add_proxy(recording("y", &Journal::default()));
        assert_eq!(composition.layer(0).unwrap().proxy_count(), 1);
    }

    #[test]
    fn typed_lookup_filters_by_concrete_type() {
        let journal = Journal::default();
        let mut composition = scene(&journal);

        let plain = composition.layers_of::<ProxyLayer>();
        assert_eq!(plain.len(), 2);
        assert_eq!(plain[1].name(), "world");
        assert_eq!(composition.layers_of::<ClearLayer>().len(), 1);

        assert!(composition.layer_as::<ProxyLayer>(2).is_err());
        composition
            .layer_as_mut::<ClearLayer>(2)
            .unwrap()
            .set_color([0.0, 1.0, 0.0, 1.0]);
        assert_eq!(
            composition.layer_as::<ClearLayer>(2).unwrap().color(),
            [0.0, 1.0, 0.0, 1.0]
        );
    }

    #[test]
    fn unbound_composition_has_no_swapchain() {
        let composition = Composition::new("offscreen");
        assert!(composition.swapchain().is_none());
        assert_eq!(composition.name(), "offscreen");
    }
}
