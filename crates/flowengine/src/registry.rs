use crate::builtin;
use crate::{BoxedComponent, ComponentMap, FlowConfig, FlowError};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Builds a component instance from its instance name.
pub type ComponentFactory = Arc<dyn Fn(&str) -> BoxedComponent + Send + Sync>;

/// Static table from component type key to factory.
#[derive(Clone, Default)]
pub struct ComponentRegistry {
    factories: BTreeMap<String, ComponentFactory>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the `flowengine.*` components.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        builtin::register_builtin(&mut registry);
        registry
    }

    pub fn register(
        &mut self,
        kind: impl Into<String>,
        factory: ComponentFactory,
    ) -> Option<ComponentFactory> {
        self.factories.insert(kind.into(), factory)
    }

    pub fn register_fn<F>(&mut self, kind: impl Into<String>, factory: F) -> Option<ComponentFactory>
    where
        F: Fn(&str) -> BoxedComponent + Send + Sync + 'static,
    {
        self.register(kind, Arc::new(factory))
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// The created component reports `kind` so a worker process can rebuild it.
    pub fn create(&self, kind: &str, name: &str) -> Option<BoxedComponent> {
        let factory = self.factories.get(kind)?;
        let mut component = factory(name);
        let base = component.base_mut();
        base.name = name.to_string();
        base.kind = kind.to_string();
        Some(component)
    }
}

/// Instantiates every declared component by its `type`. Instances are not yet initialized.
pub fn build_components(
    config: &FlowConfig,
    registry: &ComponentRegistry,
) -> Result<ComponentMap, FlowError> {
    let mut components = ComponentMap::new();
    let mut unknown = Vec::new();
    for declared in &config.components {
        match registry.create(&declared.kind, &declared.name) {
            Some(component) => {
                components.insert(declared.name.clone(), component);
            }
            None => unknown.push(format!(
                "component '{}' has unknown type '{}'",
                declared.name, declared.kind
            )),
        }
    }
    if !unknown.is_empty() {
        return Err(FlowError::configuration("unknown component types", unknown));
    }
    Ok(components)
}
