use std::collections::HashMap;
use std::sync::Arc;

use numio_core::{NumioError, ProviderId};

use crate::ProviderAdapter;

/// Registry of configured adapters, keyed by provider id.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<ProviderId, Arc<dyn ProviderAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.provider_id(), adapter);
    }

    pub fn get(&self, id: &ProviderId) -> Result<Arc<dyn ProviderAdapter>, NumioError> {
        self.adapters
            .get(id)
            .cloned()
            .ok_or_else(|| NumioError::UnknownProvider(id.clone()))
    }

    pub fn provider_ids(&self) -> Vec<ProviderId> {
        let mut ids: Vec<_> = self.adapters.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MockAdapter;

    #[test]
    fn lookup_and_unknown() {
        let mut reg = AdapterRegistry::new();
        reg.register(Arc::new(MockAdapter::new("smshub")));
        assert!(reg.get(&ProviderId::new("smshub")).is_ok());
        assert!(matches!(
            reg.get(&ProviderId::new("ghost")),
            Err(NumioError::UnknownProvider(_))
        ));
    }
}
