//! Integration tests for topocache

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use std::path::Path;
    use tempfile::TempDir;

    fn topocache() -> Command {
        cargo_bin_cmd!("topocache")
    }

    /// A command isolated from the user's config and cache
    fn isolated(home: &Path) -> Command {
        let mut cmd = topocache();
        cmd.env("HOME", home)
            .env("TOPOCACHE_CONFIG", home.join("config.toml"))
            .env_remove("TOPOCACHE_TOPOLOGY_DIR");
        cmd
    }

    #[test]
    fn help_displays() {
        topocache()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("topology detection"));
    }

    #[test]
    fn version_displays() {
        topocache()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("topocache"));
    }

    #[test]
    fn config_path_honors_env() {
        let temp = TempDir::new().unwrap();
        isolated(temp.path())
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show() {
        let temp = TempDir::new().unwrap();
        isolated(temp.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[general]"))
            .stdout(predicate::str::contains("generic"));
    }

    #[test]
    fn config_init_writes_file() {
        let temp = TempDir::new().unwrap();
        isolated(temp.path())
            .args(["config", "init"])
            .assert()
            .success();
        assert!(temp.path().join("config.toml").exists());
    }

    #[test]
    fn invalid_config_fails_with_hint() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("config.toml"), "[system\n").unwrap();
        isolated(temp.path())
            .args(["show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Error:"))
            .stderr(predicate::str::contains("Hint:"));
    }

    #[test]
    fn probe_prints_report() {
        topocache()
            .arg("probe")
            .assert()
            .success()
            .stdout(predicate::str::contains("\"processor\""))
            .stdout(predicate::str::contains("\"num_cpus\""));
    }

    #[test]
    fn probe_writes_output_file() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("report.json");
        topocache()
            .args(["probe", "--output"])
            .arg(&out)
            .assert()
            .success();

        let report: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
        assert!(report["processor"].is_object());
        assert!(report["devices"].is_array());
    }

    #[test]
    fn show_before_detect_is_not_cached() {
        let temp = TempDir::new().unwrap();
        isolated(temp.path())
            .args(["show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("generic:default"))
            .stdout(predicate::str::contains("not cached"));
    }

    #[test]
    fn detect_populates_cache() {
        let temp = TempDir::new().unwrap();
        isolated(temp.path())
            .args(["detect", "--format", "json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("local-probe"));

        let entry = temp.path().join(".topocache/topology/generic-default");
        assert!(entry.join("processor.json").exists());
        assert!(entry.join("devices.json").exists());

        isolated(temp.path())
            .args(["show", "--format", "json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"cache\""));
    }

    #[test]
    fn detect_keeps_cached_devices() {
        let temp = TempDir::new().unwrap();
        let entry = temp.path().join(".topocache/topology/generic-default");
        std::fs::create_dir_all(&entry).unwrap();
        std::fs::write(
            entry.join("devices.json"),
            r#"[{"type": "gpu", "arch": "a100", "num_devices": 8}]"#,
        )
        .unwrap();

        isolated(temp.path())
            .args(["detect", "--format", "json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"a100\""));

        assert!(entry.join("processor.json").exists());
    }

    #[test]
    fn topology_dir_flag_overrides_home() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("custom");
        isolated(temp.path())
            .args(["detect", "--topology-dir"])
            .arg(&root)
            .assert()
            .success();

        assert!(root.join("generic-default/processor.json").exists());
        assert!(!temp.path().join(".topocache/topology").exists());
    }

    #[test]
    fn cache_clear_removes_entries() {
        let temp = TempDir::new().unwrap();
        isolated(temp.path()).arg("detect").assert().success();

        isolated(temp.path())
            .args(["cache", "clear", "--partition", "default"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Cleared"));
        assert!(!temp
            .path()
            .join(".topocache/topology/generic-default/processor.json")
            .exists());
    }

    #[test]
    fn cache_clear_unknown_partition_fails() {
        let temp = TempDir::new().unwrap();
        isolated(temp.path())
            .args(["cache", "clear", "--partition", "gpu"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("gpu"));
    }
}
