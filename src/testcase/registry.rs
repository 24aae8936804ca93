//! Test case registry: numeric id → descriptor and factory.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use super::{CommandTestCase, TestCase, TestCaseUnit};
use crate::config::Config;
use crate::manifest::TestCaseEntry;

/// Builds a fresh test case instance for every scheduled unit.
pub type TestCaseFactory = Arc<dyn Fn() -> Box<dyn TestCase> + Send + Sync>;

/// Static metadata of a registered test case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCaseDescriptor {
    pub id: u64,
    pub name: String,
    pub product: String,
    pub os: String,
}

impl TestCaseDescriptor {
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            product: String::new(),
            os: String::new(),
        }
    }

    pub fn with_product(mut self, product: impl Into<String>) -> Self {
        self.product = product.into();
        self
    }

    pub fn with_os(mut self, os: impl Into<String>) -> Self {
        self.os = os.into();
        self
    }
}

struct Registration {
    descriptor: TestCaseDescriptor,
    factory: TestCaseFactory,
}

/// Maps numeric test case ids to their implementations.
#[derive(Default)]
pub struct TestCaseRegistry {
    entries: BTreeMap<u64, Registration>,
}

impl TestCaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the command-backed test cases of a configuration.
    ///
    /// Keys that are not numeric ids are skipped with a warning.
    pub fn from_config(config: &Config) -> Self {
        let mut registry = Self::new();
        for (key, tc) in &config.testcases {
            let Ok(id) = key.trim().parse::<u64>() else {
                warn!("Ignoring [testcases.{}]: test case ids must be numeric", key);
                continue;
            };
            let descriptor = TestCaseDescriptor::new(id, tc.name.clone())
                .with_product(tc.product.clone())
                .with_os(tc.os.clone());
            let tc = Arc::new(tc.clone());
            let shell = config.harness.shell.clone();
            registry.register(descriptor, move || {
                Box::new(CommandTestCase::new(Arc::clone(&tc), shell.clone())) as Box<dyn TestCase>
            });
        }
        debug!("Registered {} command test case(s)", registry.len());
        registry
    }

    /// Registers a test case. A later registration for the same id wins.
    pub fn register<F>(&mut self, descriptor: TestCaseDescriptor, factory: F) -> &mut Self
    where
        F: Fn() -> Box<dyn TestCase> + Send + Sync + 'static,
    {
        let id = descriptor.id;
        if self
            .entries
            .insert(
                id,
                Registration {
                    descriptor,
                    factory: Arc::new(factory),
                },
            )
            .is_some()
        {
            warn!("Test case {} registered twice; keeping the later one", id);
        }
        self
    }

    pub fn descriptor(&self, id: u64) -> Option<&TestCaseDescriptor> {
        self.entries.get(&id).map(|r| &r.descriptor)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolves a manifest entry into a schedulable unit.
    ///
    /// Unknown ids still produce a unit; it fails when executed.
    pub fn unit(&self, entry: &TestCaseEntry) -> TestCaseUnit {
        match self.entries.get(&entry.id) {
            Some(reg) => TestCaseUnit::new(
                entry.id,
                reg.descriptor.name.clone(),
                entry.inputs.clone(),
                Some(Arc::clone(&reg.factory)),
            ),
            None => TestCaseUnit::new(entry.id, entry.id.to_string(), entry.inputs.clone(), None),
        }
    }
}
