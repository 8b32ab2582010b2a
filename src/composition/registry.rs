// Runtime layer factory keyed by a type tag

use super::layer::{ClearLayer, Layer, ProxyLayer};
use crate::error::{RenderError, RenderResult};
use std::collections::HashMap;

/// Builds a layer with the given name
pub type LayerFactory = Box<dyn Fn(&str) -> Box<dyn Layer>>;

pub struct LayerRegistry {
    factories: HashMap<String, LayerFactory>,
}

impl Default for LayerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl LayerRegistry {
    pub const PROXY: &'static str = "proxy";
    pub const CLEAR: &'static str = "clear";

    /// Registry without any kinds
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry holding the built-in `"proxy"` and `"clear"` kinds
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(Self::PROXY, |name| Box::new(ProxyLayer::new(name)));
        registry.register(Self::CLEAR, |name| {
            Box::new(ClearLayer::new(name, ClearLayer::DEFAULT_COLOR))
        });
        registry
    }

    /// Register `factory` under `tag`, replacing any previous one
    pub fn register<F>(&mut self, tag: impl Into<String>, factory: F)
    where
        F: Fn(&str) -> Box<dyn Layer> + 'static,
    {
        let tag = tag.into();
        if self.factories.insert(tag.clone(), Box::new(factory)).is_some() {
            log::debug!("Layer kind `{}` re-registered", tag);
        }
    }

    pub fn create(&self, tag: &str, name: &str) -> RenderResult<Box<dyn Layer>> {
        let factory = self
            .factories
            .get(tag)
            .ok_or_else(|| RenderError::not_found("layer kind", tag))?;
        Ok(factory(name))
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.factories.contains_key(tag)
    }

    /// Registered tags, sorted
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn built_in_kinds_are_registered() {
        let registry = LayerRegistry::with_defaults();
        assert_eq!(registry.kinds(), vec!["clear", "proxy"]);

        let layer = registry.create("clear", "background").unwrap();
        assert_eq!(layer.name(), "background");
        assert!(layer.as_any().downcast_ref::<ClearLayer>().is_some());

        let layer = registry.create("proxy", "scene").unwrap();
        assert!(layer.as_any().downcast_ref::<ProxyLayer>().is_some());
    }

    #[test]
    fn unknown_kind_is_not_found() {
        let registry = LayerRegistry::empty();
        let err = registry.create("proxy", "scene").err().unwrap();
        assert!(err.is_recoverable());
        assert_eq!(err.to_string(), "layer kind `proxy` not found");
    }

    #[test]
    fn custom_kind_can_replace_a_built_in() {
        let mut registry = LayerRegistry::with_defaults();
        registry.register("clear", |name| {
            Box::new(ClearLayer::new(name, [1.0, 0.0, 0.0, 1.0]))
        });

        let layer = registry.create("clear", "red").unwrap();
        let clear = layer.as_any().downcast_ref::<ClearLayer>().unwrap();
        assert_eq!(clear.color(), [1.0, 0.0, 0.0, 1.0]);
        assert_eq!(registry.kinds().len(), 2);
    }
}
