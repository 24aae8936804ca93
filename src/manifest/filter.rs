//! Command-line selection of testsets and test cases.

use std::collections::HashSet;

use super::RunManifest;

/// Restricts which testsets and test cases of a manifest are run.
///
/// An empty list means "everything". Testset names compare
/// case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    testsets: HashSet<String>,
    testcases: HashSet<u64>,
}

impl RunFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_testsets<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.testsets = names
            .into_iter()
            .map(|n| n.as_ref().trim().to_lowercase())
            .collect();
        self
    }

    pub fn with_testcases<I>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = u64>,
    {
        self.testcases = ids.into_iter().collect();
        self
    }

    pub fn admits_testset(&self, name: &str) -> bool {
        self.testsets.is_empty() || self.testsets.contains(&name.to_lowercase())
    }

    pub fn admits_testcase(&self, id: u64) -> bool {
        self.testcases.is_empty() || self.testcases.contains(&id)
    }

    /// Testset names requested on the command line that the manifest does
    /// not define.
    pub fn unknown_testsets(&self, manifest: &RunManifest) -> Vec<String> {
        let known: HashSet<String> = manifest.testsets().map(|t| t.name.to_lowercase()).collect();
        let mut unknown: Vec<String> = self
            .testsets
            .iter()
            .filter(|name| !known.contains(*name))
            .cloned()
            .collect();
        unknown.sort();
        unknown
    }

    pub fn is_empty(&self) -> bool {
        self.testsets.is_empty() && self.testcases.is_empty()
    }
}
