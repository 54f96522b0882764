//! `test_spec.json`: which binaries each build produced.
//!
//! ```json
//! {"builds": {"K64F-ARM": {"platform": "K64F", "toolchain": "ARM",
//!   "base_path": "./BUILD/K64F/ARM", "baud_rate": 115200,
//!   "tests": {"tests-basic": {"binaries": [
//!     {"binary_type": "bootable", "path": "./BUILD/K64F/ARM/tests-basic.bin"}]}}}}}
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::RunConfig;
use crate::task::{BuildTarget, ExecutionTask, FirmwareImage};

const BOOTABLE: &str = "bootable";

#[derive(Error, Debug)]
pub enum SpecError {
    #[error("Cannot read test spec {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid test spec {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn default_binary_type() -> String {
    BOOTABLE.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestBinary {
    #[serde(default = "default_binary_type")]
    pub binary_type: String,
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compare_log: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestEntry {
    #[serde(default)]
    pub binaries: Vec<TestBinary>,
}

impl TestEntry {
    /// The bootable binary, or the first one listed.
    pub fn binary(&self) -> Option<&TestBinary> {
        self.binaries
            .iter()
            .find(|b| b.binary_type == BOOTABLE)
            .or_else(|| self.binaries.first())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestBuild {
    pub platform: String,
    #[serde(default)]
    pub toolchain: String,
    #[serde(default)]
    pub base_path: PathBuf,
    #[serde(default)]
    pub baud_rate: Option<u32>,
    #[serde(default)]
    pub tests: BTreeMap<String, TestEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestSpec {
    #[serde(default)]
    pub builds: BTreeMap<String, TestBuild>,
}

impl TestSpec {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, SpecError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| SpecError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| SpecError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load and merge several spec files in order.
    pub fn load_all<P: AsRef<Path>>(paths: &[P]) -> Result<Self, SpecError> {
        let mut spec = TestSpec::default();
        for path in paths {
            spec.merge(Self::load_from_file(path)?);
        }
        Ok(spec)
    }

    /// Add `other`'s builds; tests of a build present in both are unioned.
    pub fn merge(&mut self, other: TestSpec) {
        for (name, build) in other.builds {
            match self.builds.get_mut(&name) {
                Some(existing) => existing.tests.extend(build.tests),
                None => {
                    self.builds.insert(name, build);
                }
            }
        }
    }

    /// Turn every build into a [`BuildTarget`] holding the tests that survive
    /// the configured filter.
    pub fn to_build_targets(&self, config: &RunConfig) -> Vec<BuildTarget> {
        let filter = config.filter();
        self.builds
            .iter()
            .map(|(name, build)| {
                let tasks = build
                    .tests
                    .iter()
                    .filter(|(test_name, _)| {
                        let keep = filter.matches(test_name);
                        if !keep {
                            debug!(build = %name, test = %test_name, "Filtered out");
                        }
                        keep
                    })
                    .filter_map(|(test_name, entry)| {
                        let binary = entry.binary()?;
                        Some(ExecutionTask {
                            build: name.clone(),
                            image: FirmwareImage {
                                path: binary.path.clone(),
                                test_name: test_name.clone(),
                                compare_log: binary.compare_log.clone(),
                            },
                            copy_method: config.copy_method.clone(),
                            reset_method: config.reset_method.clone(),
                            program_cycle: Duration::from_millis(config.program_cycle_ms),
                            sync_packets: config.sync_packets,
                            tags: config.tags.clone(),
                            build_path: Some(build.base_path.clone())
                                .filter(|p| !p.as_os_str().is_empty()),
                            baud_rate: build.baud_rate,
                        })
                    })
                    .collect();
                BuildTarget {
                    name: name.clone(),
                    platform: build.platform.clone(),
                    tasks,
                }
            })
            .collect()
    }
}

/// `test_by_names` / `skip_tests` selection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestFilter {
    by_names: Vec<String>,
    skip: Vec<String>,
}

fn split_list(list: Option<&str>) -> Vec<String> {
    list.map(|l| {
        l.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

impl TestFilter {
    /// Both arguments are comma lists; a trailing `*` in `test_by_names`
    /// matches by prefix.
    pub fn new(test_by_names: Option<&str>, skip_tests: Option<&str>) -> Self {
        Self {
            by_names: split_list(test_by_names),
            skip: split_list(skip_tests),
        }
    }

    pub fn matches(&self, test_name: &str) -> bool {
        if self.skip.iter().any(|s| s == test_name) {
            return false;
        }
        if self.by_names.is_empty() {
            return true;
        }
        self.by_names.iter().any(|pattern| match pattern.strip_suffix('*') {
            Some(prefix) => test_name.starts_with(prefix),
            None => pattern == test_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPEC: &str = r#"{
        "builds": {
            "K64F-ARM": {
                "platform": "K64F",
                "toolchain": "ARM",
                "base_path": "./BUILD/K64F/ARM",
                "baud_rate": 9600,
                "tests": {
                    "tests-example-1": {"binaries": [{"binary_type": "bootable", "path": "./BUILD/K64F/ARM/tests-mbedmicro-rtos-mbed-mail.bin"}]},
                    "tests-example-2": {"binaries": [{"binary_type": "bootable", "path": "./BUILD/K64F/ARM/tests-mbed-drivers-c_strings.bin"}]}
                }
            },
            "K64F-GCC": {
                "platform": "K64F",
                "toolchain": "GCC_ARM",
                "base_path": "./BUILD/K64F/GCC_ARM",
                "tests": {
                    "tests-example-7": {"binaries": [{"path": "./BUILD/K64F/GCC_ARM/tests-example-7.bin"}]}
                }
            }
        }
    }"#;

    #[test]
    fn test_parse_spec() {
        let spec: TestSpec = serde_json::from_str(SPEC).unwrap();
        let build = &spec.builds["K64F-ARM"];
        assert_eq!(build.platform, "K64F");
        assert_eq!(build.baud_rate, Some(9600));
        assert_eq!(build.tests.len(), 2);
        let binary = build.tests["tests-example-1"].binary().unwrap();
        assert_eq!(
            binary.path,
            PathBuf::from("./BUILD/K64F/ARM/tests-mbedmicro-rtos-mbed-mail.bin")
        );
        assert_eq!(
            spec.builds["K64F-GCC"].tests["tests-example-7"].binaries[0].binary_type,
            "bootable"
        );
    }

    #[test]
    fn test_merge_unions_tests() {
        let mut spec: TestSpec = serde_json::from_str(SPEC).unwrap();
        let extra: TestSpec = serde_json::from_str(
            r#"{"builds": {"K64F-ARM": {"platform": "K64F", "tests": {"tests-extra": {"binaries": [{"path": "x.bin"}]}}},
                           "NRF52-GCC": {"platform": "NRF52_DK", "tests": {}}}}"#,
        )
        .unwrap();
        spec.merge(extra);
        assert_eq!(spec.builds.len(), 3);
        assert_eq!(spec.builds["K64F-ARM"].tests.len(), 3);
        assert_eq!(spec.builds["K64F-ARM"].base_path, PathBuf::from("./BUILD/K64F/ARM"));
    }

    #[test]
    fn test_filter() {
        let filter = TestFilter::new(Some("tests-example-*, tests-other"), Some("tests-example-2"));
        assert!(filter.matches("tests-example-1"));
        assert!(!filter.matches("tests-example-2"));
        assert!(filter.matches("tests-other"));
        assert!(!filter.matches("tests-other-2"));
        assert!(TestFilter::default().matches("anything"));
    }

    #[test]
    fn test_build_targets_respect_filter() {
        let spec: TestSpec = serde_json::from_str(SPEC).unwrap();
        let config = RunConfig {
            skip_tests: Some("tests-example-2".into()),
            ..RunConfig::default()
        };
        let targets = spec.to_build_targets(&config);
        assert_eq!(targets.len(), 2);
        let arm = targets.iter().find(|t| t.name == "K64F-ARM").unwrap();
        assert_eq!(arm.tasks.len(), 1);
        assert_eq!(arm.tasks[0].image.test_name, "tests-example-1");
        assert_eq!(arm.tasks[0].baud_rate, Some(9600));
        assert_eq!(arm.tasks[0].build_path, Some(PathBuf::from("./BUILD/K64F/ARM")));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            TestSpec::load_from_file("/no/such/test_spec.json"),
            Err(SpecError::Io { .. })
        ));
    }
}
