//! Conversion of the legacy `testcases` shortcut into `testsets`.
//!
//! Each test case lands in a testset named `{product}_{os}` after its
//! registered product and OS; unregistered ids are grouped under
//! `UNKNOWN_UNKNOWN`. Testset order follows the first appearance of each
//! group in the input.

use indexmap::IndexMap;
use tracing::{debug, warn};

use super::{
    ManifestError, RunFilter, RunManifest, TestCaseEntry, TestSetConfig, TestSetDefinition,
    parse_test_case_id,
};
use crate::testcase::TestCaseRegistry;

const UNKNOWN: &str = "UNKNOWN";

/// Returns a manifest that carries `testsets`.
///
/// Manifests that already have `testsets` are returned unchanged. The
/// test case filter is applied while converting; testset filters are not,
/// since the generated names are only known afterwards.
pub fn normalize(
    manifest: &RunManifest,
    registry: &TestCaseRegistry,
    filter: &RunFilter,
) -> Result<RunManifest, ManifestError> {
    if !manifest.needs_conversion() {
        return Ok(manifest.clone());
    }

    let mut testsets: IndexMap<String, TestSetDefinition> = IndexMap::new();
    for (raw_id, inputs) in manifest.testcases.iter().flatten() {
        let id = parse_test_case_id(raw_id)?;
        if !filter.admits_testcase(id) {
            debug!("Test case {} not selected, leaving it out of the conversion", id);
            continue;
        }

        let (product, os) = match registry.descriptor(id) {
            Some(d) => (non_empty(&d.product), non_empty(&d.os)),
            None => {
                warn!("Test case {} is not registered; grouping it under {}", id, UNKNOWN);
                (UNKNOWN.to_string(), UNKNOWN.to_string())
            }
        };
        let name = format!("{product}_{os}");

        let testset = testsets.entry(name.clone()).or_insert_with(|| TestSetDefinition {
            name,
            product: Some(product),
            os_type: Some(os),
            ..Default::default()
        });
        testset
            .test_cases
            .push(TestCaseEntry::new(id).with_inputs(inputs.clone().unwrap_or_default()));
    }

    let mut converted = manifest.clone();
    converted.testcases = None;
    converted.testsets = Some(testsets);
    if converted.testset_config.is_none() {
        converted.testset_config = Some(TestSetConfig::default());
    }
    Ok(converted)
}

fn non_empty(value: &str) -> String {
    if value.trim().is_empty() {
        UNKNOWN.to_string()
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testcase::{TestCase, TestCaseDescriptor, TestContext};
    use async_trait::async_trait;
    use serde_json::json;

    struct Noop;

    #[async_trait]
    impl TestCase for Noop {
        async fn run(&mut self, _ctx: &mut TestContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn registry() -> TestCaseRegistry {
        let mut registry = TestCaseRegistry::new();
        registry
            .register(
                TestCaseDescriptor::new(1, "one").with_product("FS").with_os("UNIX"),
                || Box::new(Noop) as Box<dyn TestCase>,
            )
            .register(
                TestCaseDescriptor::new(2, "two").with_product("SQL").with_os("WINDOWS"),
                || Box::new(Noop) as Box<dyn TestCase>,
            )
            .register(
                TestCaseDescriptor::new(3, "three").with_product("FS").with_os("UNIX"),
                || Box::new(Noop) as Box<dyn TestCase>,
            );
        registry
    }

    fn legacy() -> RunManifest {
        RunManifest::from_value(json!({
            "jobID": 9,
            "testcases": {
                "1": { "ClientName": "c1" },
                "2": null,
                "3": {},
                "404": {}
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_groups_by_product_and_os() {
        let converted = normalize(&legacy(), &registry(), &RunFilter::new()).unwrap();
        assert!(!converted.needs_conversion());
        assert!(converted.testcases.is_none());
        assert!(converted.testset_config.is_some());

        let sets: Vec<_> = converted
            .testsets()
            .map(|t| (t.name.clone(), t.test_cases.iter().map(|e| e.id).collect::<Vec<_>>()))
            .collect();
        assert_eq!(
            sets,
            vec![
                ("FS_UNIX".to_string(), vec![1, 3]),
                ("SQL_WINDOWS".to_string(), vec![2]),
                ("UNKNOWN_UNKNOWN".to_string(), vec![404]),
            ]
        );
        let fs = converted.testsets().next().unwrap();
        assert_eq!(fs.test_cases.iter().next().unwrap().inputs["ClientName"], "c1");
    }

    #[test]
    fn test_honours_testcase_filter() {
        let filter = RunFilter::new().with_testcases([2]);
        let converted = normalize(&legacy(), &registry(), &filter).unwrap();
        let names: Vec<_> = converted.testsets().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["SQL_WINDOWS"]);
    }

    #[test]
    fn test_converted_manifest_serializes_testsets() {
        let converted = normalize(&legacy(), &registry(), &RunFilter::new()).unwrap();
        let value = serde_json::to_value(&converted).unwrap();
        assert_eq!(value["jobID"], 9);
        assert!(value.get("testcases").is_none());
        assert_eq!(value["testsets"]["FS_UNIX"]["TESTSET_PRODUCT_NAME"], "FS");
        assert!(value["testsets"]["FS_UNIX"]["testCases"]["1"].is_object());
    }

    #[test]
    fn test_manifest_with_testsets_is_unchanged() {
        let manifest = RunManifest::from_value(json!({
            "testsets": { "A": { "testCases": [1] } }
        }))
        .unwrap();
        let normalized = normalize(&manifest, &registry(), &RunFilter::new()).unwrap();
        assert_eq!(normalized.testsets().count(), 1);
    }
}
