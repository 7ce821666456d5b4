use rollcall_core::ledger::DEFAULT_MIN_SHIFT_SECS;
use rollcall_core::matcher::DEFAULT_MATCH_THRESHOLD;
use rollcall_core::recognition::{DEFAULT_FRAME_STRIDE, DEFAULT_MAX_READ_FAILURES};
use rollcall_core::LoopPolicy;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Longest accepted minimum shift: one year.
const MAX_MIN_SHIFT_SECS: i64 = 366 * 24 * 60 * 60;
/// Longest accepted base read backoff.
const MAX_READ_RETRY_MS: u64 = 60_000;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    pub capture_width: u32,
    pub capture_height: u32,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// One subdirectory of face images per identity.
    pub enrollment_dir: PathBuf,
    pub ledger_path: PathBuf,
    /// Maximum Euclidean distance for a positive match.
    pub match_threshold: f32,
    /// Minimum time between check-in and check-out.
    pub min_shift_secs: i64,
    /// Run detection on every Nth frame.
    pub frame_stride: u32,
    /// Downscale frames wider than this before detection; 0 disables.
    pub max_frame_width: u32,
    pub read_retry_ms: u64,
    pub max_read_failures: u32,
    /// Serve on the system bus instead of the session bus.
    pub system_bus: bool,
    /// Start recognition as soon as the daemon is up.
    pub autostart: bool,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = lookup("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = lookup("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let path = |key: &str, default: &str| {
            lookup(key)
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join(default))
        };
        let flag = |key: &str| lookup(key).is_some_and(|v| v != "0" && !v.is_empty());

        Self {
            camera_device: lookup("ROLLCALL_CAMERA_DEVICE").unwrap_or_else(|| "/dev/video0".to_string()),
            capture_width: parse_or(&lookup, "ROLLCALL_CAPTURE_WIDTH", 640),
            capture_height: parse_or(&lookup, "ROLLCALL_CAPTURE_HEIGHT", 480),
            model_dir: path("ROLLCALL_MODEL_DIR", "models"),
            enrollment_dir: path("ROLLCALL_ENROLLMENT_DIR", "known_faces"),
            ledger_path: path("ROLLCALL_LEDGER_PATH", "attendance.csv"),
            match_threshold: parse_or(&lookup, "ROLLCALL_MATCH_THRESHOLD", DEFAULT_MATCH_THRESHOLD),
            min_shift_secs: at_most(
                "ROLLCALL_MIN_SHIFT_SECS",
                parse_or(&lookup, "ROLLCALL_MIN_SHIFT_SECS", DEFAULT_MIN_SHIFT_SECS),
                MAX_MIN_SHIFT_SECS,
            ),
            frame_stride: parse_or(&lookup, "ROLLCALL_FRAME_STRIDE", DEFAULT_FRAME_STRIDE),
            max_frame_width: parse_or(&lookup, "ROLLCALL_MAX_FRAME_WIDTH", 0),
            read_retry_ms: at_most(
                "ROLLCALL_READ_RETRY_MS",
                parse_or(&lookup, "ROLLCALL_READ_RETRY_MS", 500),
                MAX_READ_RETRY_MS,
            ),
            max_read_failures: parse_or(&lookup, "ROLLCALL_MAX_READ_FAILURES", DEFAULT_MAX_READ_FAILURES),
            system_bus: flag("ROLLCALL_SYSTEM_BUS"),
            autostart: flag("ROLLCALL_AUTOSTART"),
        }
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join("det_10g.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_dir
            .join("w600k_r50.onnx")
            .to_string_lossy()
            .into_owned()
    }

    pub fn min_shift(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.min_shift_secs.clamp(0, MAX_MIN_SHIFT_SECS))
    }

    pub fn loop_policy(&self) -> LoopPolicy {
        LoopPolicy {
            threshold: self.match_threshold,
            frame_stride: self.frame_stride.max(1),
            max_frame_width: (self.max_frame_width > 0).then_some(self.max_frame_width),
            read_retry_delay: Duration::from_millis(self.read_retry_ms.min(MAX_READ_RETRY_MS)),
            max_read_failures: self.max_read_failures,
        }
    }
}

fn parse_or<T: FromStr>(lookup: impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "unparseable setting, using default");
            default
        }),
    }
}

fn at_most<T: PartialOrd + std::fmt::Display + Copy>(key: &str, value: T, max: T) -> T {
    if value > max {
        tracing::warn!(key, %value, %max, "setting too large, clamping");
        return max;
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(move |key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let cfg = config(&[("HOME", "/home/ada")]);
        assert_eq!(cfg.camera_device, "/dev/video0");
        assert_eq!((cfg.capture_width, cfg.capture_height), (640, 480));
        assert_eq!(cfg.ledger_path, PathBuf::from("/home/ada/.local/share/rollcall/attendance.csv"));
        assert_eq!(cfg.enrollment_dir, PathBuf::from("/home/ada/.local/share/rollcall/known_faces"));
        assert_eq!(cfg.min_shift(), chrono::Duration::hours(8));
        assert!(!cfg.system_bus && !cfg.autostart);

        let policy = cfg.loop_policy();
        assert_eq!(policy.threshold, 0.6);
        assert_eq!(policy.frame_stride, 3);
        assert_eq!(policy.max_frame_width, None);
        assert_eq!(policy.read_retry_delay, Duration::from_millis(500));
    }

    #[test]
    fn test_overrides() {
        let cfg = config(&[
            ("XDG_DATA_HOME", "/data"),
            ("ROLLCALL_LEDGER_PATH", "/srv/att.csv"),
            ("ROLLCALL_MATCH_THRESHOLD", "0.45"),
            ("ROLLCALL_MAX_FRAME_WIDTH", "320"),
            ("ROLLCALL_FRAME_STRIDE", "0"),
            ("ROLLCALL_AUTOSTART", "1"),
        ]);
        assert_eq!(cfg.ledger_path, PathBuf::from("/srv/att.csv"));
        assert_eq!(cfg.model_dir, PathBuf::from("/data/rollcall/models"));
        assert!(cfg.autostart);
        assert!(cfg.arcface_model_path().ends_with("w600k_r50.onnx"));

        let policy = cfg.loop_policy();
        assert_eq!(policy.threshold, 0.45);
        assert_eq!(policy.max_frame_width, Some(320));
        assert_eq!(policy.frame_stride, 1);
    }

    #[test]
    fn test_garbage_falls_back_to_default() {
        let cfg = config(&[("ROLLCALL_MIN_SHIFT_SECS", "eight hours"), ("ROLLCALL_SYSTEM_BUS", "0")]);
        assert_eq!(cfg.min_shift_secs, DEFAULT_MIN_SHIFT_SECS);
        assert!(!cfg.system_bus);
    }

    #[test]
    fn test_huge_durations_are_clamped() {
        let cfg = config(&[
            ("ROLLCALL_MIN_SHIFT_SECS", "9223372036854775807"),
            ("ROLLCALL_READ_RETRY_MS", "18446744073709551615"),
        ]);
        assert_eq!(cfg.min_shift(), chrono::Duration::days(366));
        assert_eq!(cfg.loop_policy().read_retry_delay, Duration::from_secs(60));

        let cfg = Config {
            min_shift_secs: i64::MAX,
            read_retry_ms: u64::MAX,
            ..cfg
        };
        assert_eq!(cfg.min_shift(), chrono::Duration::days(366));
        assert_eq!(cfg.loop_policy().read_retry_delay, Duration::from_secs(60));
    }
}
