//! Integration tests for gfs

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use std::fs;
    use tempfile::TempDir;

    /// Command isolated from the user's config and cache
    fn gfs(home: &TempDir) -> Command {
        let mut cmd = cargo_bin_cmd!("gfs");
        cmd.env("GFS_CONFIG", home.path().join("config.toml"))
            .env("GFS_CACHE_DIR", home.path().join("cache"))
            .env_remove("RUST_LOG");
        cmd
    }

    fn path_str(dir: &TempDir, name: &str) -> String {
        dir.path().join(name).display().to_string()
    }

    #[test]
    fn help_displays() {
        let home = TempDir::new().unwrap();
        gfs(&home)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("Generic filesystem access"));
    }

    #[test]
    fn version_displays() {
        let home = TempDir::new().unwrap();
        gfs(&home)
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("gfs"));
    }

    #[test]
    fn cat_prints_contents() {
        let home = TempDir::new().unwrap();
        fs::write(home.path().join("hello.txt"), "hello world").unwrap();

        gfs(&home)
            .args(["cat", &path_str(&home, "hello.txt")])
            .assert()
            .success()
            .stdout("hello world");
    }

    #[test]
    fn cat_honors_offset_and_length() {
        let home = TempDir::new().unwrap();
        fs::write(home.path().join("hello.txt"), "hello world").unwrap();

        gfs(&home)
            .args(["cat", &path_str(&home, "hello.txt"), "--offset", "6", "-n", "3"])
            .assert()
            .success()
            .stdout("wor");
    }

    #[test]
    fn cat_missing_file_fails() {
        let home = TempDir::new().unwrap();
        gfs(&home)
            .args(["cat", &path_str(&home, "missing.txt")])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Not found"));
    }

    #[test]
    fn stat_reports_size() {
        let home = TempDir::new().unwrap();
        fs::write(home.path().join("data.bin"), [0u8; 5]).unwrap();

        gfs(&home)
            .args(["stat", &path_str(&home, "data.bin"), "--format", "plain"])
            .assert()
            .success()
            .stdout(predicate::str::starts_with("file\t5\t"));
    }

    #[test]
    fn stat_json_output() {
        let home = TempDir::new().unwrap();
        fs::write(home.path().join("data.bin"), [0u8; 5]).unwrap();

        gfs(&home)
            .args(["stat", &path_str(&home, "data.bin"), "--format", "json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"kind\": \"file\""))
            .stdout(predicate::str::contains("\"size\": 5"));
    }

    #[test]
    fn ls_lists_files_and_directories() {
        let home = TempDir::new().unwrap();
        let root = home.path().join("root");
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("a.txt"), "a").unwrap();

        gfs(&home)
            .args(["ls", &path_str(&home, "root")])
            .assert()
            .success()
            .stdout(predicate::str::contains("a.txt"))
            .stdout(predicate::str::contains("sub/"));
    }

    #[test]
    fn cp_copies_into_directory() {
        let home = TempDir::new().unwrap();
        fs::write(home.path().join("src.txt"), "payload").unwrap();
        fs::create_dir(home.path().join("out")).unwrap();

        gfs(&home)
            .args(["cp", &path_str(&home, "src.txt"), &path_str(&home, "out")])
            .assert()
            .success();

        assert_eq!(
            fs::read_to_string(home.path().join("out/src.txt")).unwrap(),
            "payload"
        );
    }

    #[test]
    fn mv_moves_file() {
        let home = TempDir::new().unwrap();
        fs::write(home.path().join("old.txt"), "x").unwrap();

        gfs(&home)
            .args(["mv", &path_str(&home, "old.txt"), &path_str(&home, "new.txt")])
            .assert()
            .success();

        assert!(!home.path().join("old.txt").exists());
        assert!(home.path().join("new.txt").exists());
    }

    #[test]
    fn mkdir_and_rm() {
        let home = TempDir::new().unwrap();
        let nested = path_str(&home, "a/b/c");

        gfs(&home).args(["mkdir", &nested]).assert().failure();
        gfs(&home).args(["mkdir", "-p", &nested]).assert().success();
        assert!(home.path().join("a/b/c").is_dir());

        gfs(&home)
            .args(["rm", &path_str(&home, "a")])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Directory not empty"));

        gfs(&home)
            .args(["rm", "-r", &path_str(&home, "a")])
            .assert()
            .success();
        assert!(!home.path().join("a").exists());
    }

    #[test]
    fn fetch_local_prints_path() {
        let home = TempDir::new().unwrap();
        fs::write(home.path().join("f.txt"), "x").unwrap();

        gfs(&home)
            .args(["fetch", &path_str(&home, "f.txt")])
            .assert()
            .success()
            .stdout(predicate::str::contains("f.txt"));
    }

    #[test]
    fn unknown_protocol_fails() {
        let home = TempDir::new().unwrap();
        gfs(&home)
            .args(["stat", "hdfs://namenode/data"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("No filesystem registered for protocol: hdfs"));
    }

    #[test]
    fn cache_path_uses_env() {
        let home = TempDir::new().unwrap();
        gfs(&home)
            .args(["cache", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains(path_str(&home, "cache")));
    }

    #[test]
    fn cache_clean_on_empty_cache() {
        let home = TempDir::new().unwrap();
        gfs(&home)
            .args(["cache", "clean"])
            .assert()
            .success()
            .stdout(predicate::str::contains("ENTRIES"));
    }

    #[test]
    fn cache_purge_uncached_url() {
        let home = TempDir::new().unwrap();
        gfs(&home)
            .args(["cache", "purge", "https://example.com/data.csv"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Nothing cached"));
    }

    #[test]
    fn config_path() {
        let home = TempDir::new().unwrap();
        gfs(&home)
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show() {
        let home = TempDir::new().unwrap();
        gfs(&home)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[cache]"));
    }

    #[test]
    fn config_init_writes_once() {
        let home = TempDir::new().unwrap();
        gfs(&home)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration initialized"));
        assert!(home.path().join("config.toml").exists());

        gfs(&home)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));
    }

    #[test]
    fn invalid_config_reports_path() {
        let home = TempDir::new().unwrap();
        fs::write(home.path().join("config.toml"), "cache = 3").unwrap();
        gfs(&home)
            .args(["config", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid configuration"));
    }
}
