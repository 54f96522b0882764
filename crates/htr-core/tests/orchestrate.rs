use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use htr_core::{
    CancellationToken, DecodeOptions, Device, DeviceInventory, ExecutionTask, Kettle,
    Orchestrator, RunConfig, SuiteOutcome, SuiteResult, TaskExecutor, TestSpec, decode_log,
};

const SPEC: &str = r#"{
    "builds": {
        "K64F-GCC_ARM": {
            "platform": "K64F",
            "toolchain": "GCC_ARM",
            "base_path": "./BUILD/K64F/GCC_ARM",
            "baud_rate": 115200,
            "tests": {
                "tests-mbed_drivers-ticker": {"binaries": [{"binary_type": "bootable", "path": "ticker.bin"}]},
                "tests-mbed_drivers-timeout": {"binaries": [{"binary_type": "bootable", "path": "timeout.bin"}]},
                "tests-mbed_hal-flash": {"binaries": [{"binary_type": "bootable", "path": "flash.bin"}]},
                "tests-mbed_hal-rtc": {"binaries": [{"binary_type": "bootable", "path": "rtc.bin"}]}
            }
        },
        "NUCLEO_F429ZI-GCC_ARM": {
            "platform": "NUCLEO_F429ZI",
            "toolchain": "GCC_ARM",
            "tests": {
                "tests-mbed_drivers-ticker": {"binaries": [{"path": "f429/ticker.bin"}]}
            }
        }
    }
}"#;

const DEVICES: &str = r#"
[[devices]]
target_id = "0240000031"
platform_name = "K64F"
address = { kind = "serial", port = "/dev/ttyACM0" }

[[devices]]
target_id = "0240000032"
platform_name = "K64F"
address = { kind = "serial", port = "/dev/ttyACM1" }
"#;

/// Replays a canned device log per test instead of touching hardware.
#[derive(Default)]
struct ReplayExecutor {
    active: AtomicUsize,
    peak: AtomicUsize,
    seen: Mutex<Vec<(String, String)>>,
}

impl TaskExecutor for ReplayExecutor {
    fn execute(
        &self,
        task: &ExecutionTask,
        device: &Device,
        _cancel: &CancellationToken,
    ) -> SuiteResult {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.seen
            .lock()
            .unwrap()
            .push((task.image.test_name.clone(), device.target_id.clone()));
        thread::sleep(Duration::from_millis(20));
        self.active.fetch_sub(1, Ordering::SeqCst);

        let log = if task.image.test_name.ends_with("flash") {
            "{{__testcase_start;erase}}\n{{__testcase_finish;erase;0;1}}\n{{end;failure}}\n"
        } else {
            "{{__testcase_start;basic}}\n{{__testcase_finish;basic;1;0}}\n{{end;success}}\n"
        };
        decode_log(
            log,
            DecodeOptions {
                test_name: task.image.test_name.clone(),
                build_path: task.build_path.clone(),
                duration: Some(0.02),
            },
        )
    }
}

#[test]
fn test_run_spec_across_two_devices() {
    let lock_dir = tempfile::tempdir().unwrap();
    let config = RunConfig {
        parallelism: 2,
        skip_tests: Some("tests-mbed_hal-rtc".into()),
        ..RunConfig::default()
    };
    let spec: TestSpec = serde_json::from_str(SPEC).unwrap();
    let targets = spec.to_build_targets(&config);
    let mut inventory: DeviceInventory = toml::from_str(DEVICES).unwrap();

    let kettle = Kettle::with_instance_id(lock_dir.path(), "it", None);
    let orch = Orchestrator::new(config, ReplayExecutor::default(), CancellationToken::new())
        .with_kettle(kettle.clone());
    let summary = orch.run(&targets, &mut inventory);

    let report = &summary.report;
    let k64f = &report.builds["K64F-GCC_ARM"];
    assert_eq!(k64f.len(), 3);
    assert!(!k64f.contains_key("tests-mbed_hal-rtc"));
    assert_eq!(k64f["tests-mbed_drivers-ticker"].outcome, SuiteOutcome::Ok);
    assert_eq!(k64f["tests-mbed_hal-flash"].outcome, SuiteOutcome::Fail);
    assert_eq!(k64f["tests-mbed_hal-flash"].test_cases["erase"].result_text, "FAIL");
    assert_eq!(k64f["tests-mbed_hal-flash"].platform, "K64F");

    assert!(orch.executor().peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(orch.executor().seen.lock().unwrap().len(), 3);

    assert_eq!(report.unmatched_platforms, vec!["NUCLEO_F429ZI".to_string()]);
    assert_eq!(report.suite_outcome(), SuiteOutcome::Fail);
    assert_eq!(summary.exit_code(), 2);

    // Locks are handed back once the build is done.
    assert!(!kettle.is_held("0240000031").unwrap());
    assert!(!kettle.is_held("0240000032").unwrap());
    assert!(inventory.devices.iter().all(Device::is_idle));

    let json = serde_json::to_value(report).unwrap();
    assert_eq!(
        json["builds"]["K64F-GCC_ARM"]["tests-mbed_drivers-ticker"]["outcome"],
        "OK"
    );
}
