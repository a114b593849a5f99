#[cfg(unix)]
mod unix {
    use std::{fs, os::unix::fs::PermissionsExt, path::Path, process::Command};

    use tempfile::TempDir;

    fn write_executable(dir: &Path, name: &str, body: &str) {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\nset -eu\n{body}\n")).expect("write script");
        let mut perms = fs::metadata(&path).expect("metadata").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).expect("chmod");
    }

    fn singer_elt() -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_singer-elt"));
        cmd.env_remove("RUST_LOG");
        cmd.env_remove("SINGER_ELT_BUFFER_SIZE");
        cmd
    }

    fn pipeline(dir: &Path, loader_body: &str) -> std::path::PathBuf {
        write_executable(
            dir,
            "tap-users",
            r#"echo '{"type":"RECORD","stream":"users","record":{"id":1}}'"#,
        );
        write_executable(dir, "target-users", loader_body);
        fs::write(dir.join("tap.json"), "{}").expect("write tap config");
        let file = dir.join("pipeline.toml");
        fs::write(
            &file,
            r#"
kill_grace_period_ms = 500

[extractor]
name = "tap-users"
executable = "./tap-users"
plugin = { kind = "tap", config = "tap.json" }

[loader]
name = "target-users"
executable = "./target-users"
"#,
        )
        .expect("write pipeline");
        file
    }

    #[test]
    fn run_succeeds_and_writes_state() {
        let dir = TempDir::new().expect("temp dir");
        let file = pipeline(
            dir.path(),
            r#"cat > /dev/null
echo '{"type":"STATE","value":{"bookmarks":{"users":1}}}'"#,
        );
        let state = dir.path().join("out/state.json");

        let output = singer_elt()
            .arg("run")
            .arg("--config")
            .arg(&file)
            .arg("--state-output")
            .arg(&state)
            .output()
            .expect("spawn singer-elt");

        assert_eq!(output.status.code(), Some(0), "{output:?}");
        assert_eq!(
            String::from_utf8_lossy(&output.stdout).trim(),
            "Extract and load complete"
        );
        let written: serde_json::Value =
            serde_json::from_slice(&fs::read(&state).expect("read state")).expect("json");
        assert_eq!(written, serde_json::json!({"bookmarks": {"users": 1}}));
    }

    #[test]
    fn loader_failure_maps_to_exit_code() {
        let dir = TempDir::new().expect("temp dir");
        let file = pipeline(dir.path(), "cat > /dev/null\nexit 5");

        let output = singer_elt()
            .args(["run", "--config"])
            .arg(&file)
            .output()
            .expect("spawn singer-elt");

        assert_eq!(output.status.code(), Some(12), "{output:?}");
        assert!(String::from_utf8_lossy(&output.stdout).contains("exit code 5"));
    }

    #[test]
    fn buffer_size_flag_overrides_the_file() {
        let dir = TempDir::new().expect("temp dir");
        let file = pipeline(dir.path(), "cat > /dev/null");

        let output = singer_elt()
            .args(["run", "--buffer-size", "16", "--config"])
            .arg(&file)
            .output()
            .expect("spawn singer-elt");

        assert_eq!(output.status.code(), Some(14), "{output:?}");
        assert!(String::from_utf8_lossy(&output.stdout).contains("buffer_size"));
    }

    #[test]
    fn validate_prints_resolved_commands() {
        let dir = TempDir::new().expect("temp dir");
        let file = pipeline(dir.path(), "cat > /dev/null");

        let output = singer_elt()
            .args(["validate", "--config"])
            .arg(&file)
            .output()
            .expect("spawn singer-elt");

        assert_eq!(output.status.code(), Some(0), "{output:?}");
        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(stdout.contains("tap-users"), "{stdout}");
        assert!(stdout.contains("--config"), "{stdout}");
        assert!(stdout.contains("tap.json"), "{stdout}");
    }

    #[test]
    fn invalid_pipeline_file_exits_with_config_error() {
        let dir = TempDir::new().expect("temp dir");
        let file = dir.path().join("pipeline.toml");
        fs::write(&file, "[extractor]\nname = \"tap\"\n").expect("write pipeline");

        let output = singer_elt()
            .args(["validate", "--config"])
            .arg(&file)
            .output()
            .expect("spawn singer-elt");

        assert_eq!(output.status.code(), Some(2), "{output:?}");
    }

    #[test]
    fn missing_plugin_binary_exits_with_spawn_error() {
        let dir = TempDir::new().expect("temp dir");
        let file = pipeline(dir.path(), "cat > /dev/null");
        fs::remove_file(dir.path().join("target-users")).expect("remove loader");

        let output = singer_elt()
            .args(["run", "--config"])
            .arg(&file)
            .output()
            .expect("spawn singer-elt");

        assert_eq!(output.status.code(), Some(16), "{output:?}");
    }
}
