use reelrs::AppConfig;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

struct EnvGuard {
    _lock: std::sync::MutexGuard<'static, ()>,
    home: Option<String>,
}

impl EnvGuard {
    fn set_home(value: Option<&str>) -> Self {
        let lock = ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap();
        let home = std::env::var("REELRS_HOME").ok();

        // SAFETY: env mutation is guarded by ENV_LOCK, ensuring exclusive access.
        unsafe {
            match value {
                Some(value) => std::env::set_var("REELRS_HOME", value),
                None => std::env::remove_var("REELRS_HOME"),
            }
        }

        Self { _lock: lock, home }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        // SAFETY: env mutation is guarded by ENV_LOCK, ensuring exclusive access.
        unsafe {
            match &self.home {
                Some(value) => std::env::set_var("REELRS_HOME", value),
                None => std::env::remove_var("REELRS_HOME"),
            }
        }
    }
}

#[test]
fn config_path_defaults_to_working_directory() {
    let _guard = EnvGuard::set_home(None);
    assert_eq!(
        AppConfig::default_path(),
        PathBuf::from(".reelrs").join("config.json")
    );
}

#[test]
fn reelrs_home_selects_config_file() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("config.json"),
        r#"{
            "paths": {"checkpoints": "/var/lib/reelrs/checkpoints"},
            "agent": {"program": "clip-agent"},
            "critic": {"program": "clip-critic"},
            "notifier": {"webhook_url": "https://hooks.example.com/reelrs"}
        }"#,
    )
    .unwrap();
    let _guard = EnvGuard::set_home(dir.path().to_str());

    let config = AppConfig::load().unwrap();
    assert_eq!(config.paths.checkpoints, "/var/lib/reelrs/checkpoints");
    assert_eq!(config.paths.event_log, ".reelrs/logs");
    assert_eq!(config.agent.program, "clip-agent");
    config.validate().unwrap();
}
