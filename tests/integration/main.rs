//! Integration tests for the byoe binary

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use std::path::Path;
    use tempfile::TempDir;

    fn byoe() -> Command {
        let mut cmd = cargo_bin_cmd!("byoe");
        cmd.env_remove("BYOE_CONFIG").env_remove("RUST_LOG");
        cmd
    }

    /// A site initialized under a temp dir; returns its config path
    fn init_site(temp: &TempDir) -> String {
        let config = temp.path().join("byoe.toml");
        byoe()
            .arg("init-dir")
            .arg("--config")
            .arg(&config)
            .arg("--base-dir")
            .arg(temp.path().join("stack"))
            .assert()
            .success();
        config.display().to_string()
    }

    #[test]
    fn help_displays() {
        byoe()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("rolling snapshots"));
    }

    #[test]
    fn version_displays() {
        byoe()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("byoe"));
    }

    #[test]
    fn init_dir_creates_layout() {
        let temp = TempDir::new().unwrap();
        let config = init_site(&temp);

        assert!(Path::new(&config).is_file());
        assert!(temp.path().join("conf.d/envs/example.toml").is_file());
        for dir in ["snapshots", "channels", "logs", "cache"] {
            assert!(temp.path().join("stack").join(dir).is_dir());
        }
    }

    #[test]
    fn init_dir_refuses_to_overwrite() {
        let temp = TempDir::new().unwrap();
        let config = init_site(&temp);

        byoe()
            .args(["init-dir", "--config", &config])
            .assert()
            .failure()
            .stderr(predicate::str::contains("--force"));

        byoe()
            .args(["init-dir", "--force", "--config", &config])
            .assert()
            .success();
    }

    #[test]
    fn snapshots_empty() {
        let temp = TempDir::new().unwrap();
        let config = init_site(&temp);

        byoe()
            .args(["snapshots", "--config", &config])
            .assert()
            .success()
            .stdout(predicate::str::contains("No snapshots yet"));

        byoe()
            .args(["snapshots", "--format", "json", "--config", &config])
            .assert()
            .success()
            .stdout(predicate::str::contains("[]"));
    }

    #[test]
    fn show_without_publish_hints_update() {
        let temp = TempDir::new().unwrap();
        let config = init_site(&temp);

        byoe()
            .args(["show", "--config", &config])
            .assert()
            .failure()
            .stderr(predicate::str::contains("No published snapshot"))
            .stderr(predicate::str::contains("byoe update"));
    }

    #[test]
    fn show_channel_without_snapshots() {
        let temp = TempDir::new().unwrap();
        let config = init_site(&temp);

        byoe()
            .args(["show", "--channel", "stable", "--config", &config])
            .assert()
            .failure()
            .stderr(predicate::str::contains("No published snapshot"));
    }

    #[test]
    fn show_rejects_bad_id() {
        let temp = TempDir::new().unwrap();
        let config = init_site(&temp);

        byoe()
            .args(["show", "not-an-id", "--config", &config])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid snapshot id"));
    }

    #[test]
    fn cache_list_empty() {
        let temp = TempDir::new().unwrap();
        let config = init_site(&temp);

        byoe()
            .args(["cache", "list", "--config", &config])
            .assert()
            .success()
            .stdout(predicate::str::contains("Build cache is empty"));
    }

    #[test]
    fn cache_gc_on_empty_cache() {
        let temp = TempDir::new().unwrap();
        let config = init_site(&temp);

        byoe()
            .args(["cache", "gc", "--dry-run", "--config", &config])
            .assert()
            .success()
            .stdout(predicate::str::contains("Nothing to collect"));
    }

    #[test]
    fn missing_config_hints_init() {
        let temp = TempDir::new().unwrap();
        let config = temp.path().join("absent.toml");

        byoe()
            .arg("snapshots")
            .arg("--config")
            .arg(&config)
            .assert()
            .failure()
            .stderr(predicate::str::contains("Configuration file not found"))
            .stderr(predicate::str::contains("init-dir"));
    }

    #[test]
    fn config_from_environment() {
        let temp = TempDir::new().unwrap();
        let config = init_site(&temp);

        byoe()
            .arg("snapshots")
            .env("BYOE_CONFIG", &config)
            .assert()
            .success();
    }

    #[test]
    fn update_rejects_unknown_env() {
        let temp = TempDir::new().unwrap();
        let config = init_site(&temp);

        byoe()
            .args(["update", "--only", "nope", "--config", &config])
            .assert()
            .failure()
            .stderr(predicate::str::contains("unknown environment 'nope'"));
    }

    #[test]
    fn completions_generate() {
        byoe()
            .args(["completions", "bash"])
            .assert()
            .success()
            .stdout(predicate::str::contains("byoe"));
    }
}
