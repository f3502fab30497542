//! Service factory map: type name → constructor.
//!
//! Implementations register here by name; the worker consults the map when
//! handling a creation command. Owned by the router so every worker sees
//! the same registry.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::service::Service;

pub type ServiceCtor = Arc<dyn Fn() -> Box<dyn Service> + Send + Sync>;

#[derive(Default)]
pub struct FactoryMap {
    ctors: RwLock<HashMap<String, ServiceCtor>>,
}

impl FactoryMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor under `kind`, replacing any previous one.
    pub fn register<F>(&self, kind: impl Into<String>, ctor: F)
    where
        F: Fn() -> Box<dyn Service> + Send + Sync + 'static,
    {
        self.ctors.write().insert(kind.into(), Arc::new(ctor));
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.ctors.read().contains_key(kind)
    }

    /// Instantiate a service of the given type, if registered.
    pub fn create(&self, kind: &str) -> Option<Box<dyn Service>> {
        let ctor = self.ctors.read().get(kind).cloned()?;
        Some(ctor())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::service::ServiceContext;

    struct Nop;

    impl Service for Nop {
        fn init(&mut self, _ctx: &mut ServiceContext, _config: &str) -> crate::Result<()> {
            Ok(())
        }

        fn dispatch(&mut self, _ctx: &mut ServiceContext, _msg: &mut Message) {}
    }

    #[test]
    fn create_returns_registered_type_only() {
        let map = FactoryMap::new();
        assert!(map.create("nop").is_none());
        map.register("nop", || Box::new(Nop));
        assert!(map.contains("nop"));
        assert!(map.create("nop").is_some());
        assert!(!map.contains("other"));
    }
}
