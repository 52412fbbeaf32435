// Step Registry
// Holds the step descriptors known to a process, keyed by their unique name

use crate::execution::graph::GraphError;
use crate::step::descriptor::StepDescriptor;

use std::collections::HashMap;
use std::sync::Arc;

/// Registry of step descriptors
#[derive(Debug, Default, Clone)]
pub struct StepRegistry {
    steps: HashMap<String, Arc<StepDescriptor>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor; names are unique
    pub fn register(&mut self, step: StepDescriptor) -> Result<Arc<StepDescriptor>, GraphError> {
        if self.steps.contains_key(step.name()) {
            return Err(GraphError::DuplicateStep {
                step: step.name().to_string(),
            });
        }
        let step = Arc::new(step);
        self.steps.insert(step.name().to_string(), Arc::clone(&step));
        Ok(step)
    }

    pub fn get(&self, name: &str) -> Option<Arc<StepDescriptor>> {
        self.steps.get(name).cloned()
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.steps.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::descriptor::FnAction;
    use crate::step::models::Outputs;

    fn noop(name: &str) -> StepDescriptor {
        StepDescriptor::new(name, FnAction::new(|_, _| Ok(Outputs::new())))
    }

    #[test]
    fn test_register_and_get() {
        let mut registry = StepRegistry::new();
        registry.register(noop("smooth")).unwrap();
        registry.register(noop("design")).unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names(), vec!["design", "smooth"]);
        assert!(registry.get("smooth").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut registry = StepRegistry::new();
        registry.register(noop("smooth")).unwrap();
        let err = registry.register(noop("smooth")).unwrap_err();
        assert!(matches!(err, GraphError::DuplicateStep { .. }));
    }
}
