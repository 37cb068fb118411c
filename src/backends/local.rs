//! Local model backends.
//!
//! Both local backends drive the same external inference binary, once with
//! an accelerator device and once on the CPU. The binary takes a PNG path and
//! prints the detected elements as JSON on stdout.
//!
//! A backend is only ready when its hardware can hold the model: the
//! accelerated one needs a CUDA device with enough video memory, the CPU one
//! enough free system memory. The hardware is checked once per adapter.

use super::BackendAdapter;
use crate::capture::Screenshot;
use crate::config::LocalBackendConfig;
use crate::types::{BackendKind, FailureKind};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;
use sysinfo::System;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// Name of the inference binary searched for when no path is configured
pub const INFERENCE_BINARY: &str = "vision-infer";

/// Video memory the accelerated model needs by default, in MiB
pub const DEFAULT_MIN_VRAM_MB: u64 = 16 * 1024;

/// Free system memory the CPU model needs by default, in MiB
pub const DEFAULT_MIN_RAM_MB: u64 = 6 * 1024;

const GPU_QUERY_COMMAND: &str = "nvidia-smi";

const MIB: u64 = 1024 * 1024;

static REQUEST_SEQ: AtomicU64 = AtomicU64::new(0);

/// Temp image handed to the binary, removed when dropped
struct TempImage(PathBuf);

impl Drop for TempImage {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

/// Local model backend client
pub struct LocalModelAdapter {
    kind: BackendKind,
    binary_path: PathBuf,
    model: String,
    device: String,
    min_memory_mb: u64,
    gpu_query_command: PathBuf,
    hardware: OnceLock<Result<(), String>>,
}

impl LocalModelAdapter {
    /// GPU-backed adapter
    pub fn accelerated(config: &LocalBackendConfig) -> Self {
        Self::new(BackendKind::AcceleratedLocal, config)
    }

    /// CPU-backed adapter
    pub fn cpu(config: &LocalBackendConfig) -> Self {
        Self::new(BackendKind::CpuLocal, config)
    }

    fn new(kind: BackendKind, config: &LocalBackendConfig) -> Self {
        let binary_path = config
            .binary_path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(Self::default_binary_path);

        let device = if config.device.is_empty() {
            match kind {
                BackendKind::AcceleratedLocal => "cuda".to_string(),
                _ => "cpu".to_string(),
            }
        } else {
            config.device.clone()
        };

        let min_memory_mb = config.min_memory_mb.unwrap_or(match kind {
            BackendKind::AcceleratedLocal => DEFAULT_MIN_VRAM_MB,
            _ => DEFAULT_MIN_RAM_MB,
        });

        Self {
            kind,
            binary_path,
            model: config.model.clone(),
            device,
            min_memory_mb,
            gpu_query_command: PathBuf::from(
                config
                    .gpu_query_command
                    .as_deref()
                    .unwrap_or(GPU_QUERY_COMMAND),
            ),
            hardware: OnceLock::new(),
        }
    }

    /// Get the default binary path
    fn default_binary_path() -> PathBuf {
        let exe_dir = std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(|p| p.to_path_buf()))
            .unwrap_or_else(|| PathBuf::from("."));

        let mut paths = vec![
            // Same directory as the running binary
            exe_dir.join(INFERENCE_BINARY),
            // Relative to the working directory
            PathBuf::from("models/bin").join(INFERENCE_BINARY),
            // System paths
            PathBuf::from("/usr/local/bin").join(INFERENCE_BINARY),
        ];

        if let Some(path_var) = std::env::var_os("PATH") {
            paths.extend(std::env::split_paths(&path_var).map(|dir| dir.join(INFERENCE_BINARY)));
        }

        for path in paths {
            if path.exists() {
                return path;
            }
        }

        // Default fallback - ready() reports false
        PathBuf::from(INFERENCE_BINARY)
    }

    pub fn binary_path(&self) -> &PathBuf {
        &self.binary_path
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    /// Outcome of the one-time hardware check
    fn hardware(&self) -> &Result<(), String> {
        self.hardware.get_or_init(|| {
            let outcome = self.check_hardware();
            match &outcome {
                Ok(()) => info!("{} hardware is sufficient", self.kind.as_str()),
                Err(reason) => warn!("{} unusable: {}", self.kind.as_str(), reason),
            }
            outcome
        })
    }

    fn check_hardware(&self) -> Result<(), String> {
        if self.min_memory_mb == 0 {
            return Ok(());
        }

        let (available, memory) = match self.kind {
            BackendKind::AcceleratedLocal => (self.query_vram_mb()?, "video memory"),
            _ => (available_ram_mb(), "free memory"),
        };

        if available < self.min_memory_mb {
            return Err(format!(
                "{} MiB {} available, {} MiB needed",
                available, memory, self.min_memory_mb
            ));
        }
        Ok(())
    }

    /// Largest video memory of any CUDA device, in MiB
    fn query_vram_mb(&self) -> Result<u64, String> {
        let output = std::process::Command::new(&self.gpu_query_command)
            .args(["--query-gpu=memory.total", "--format=csv,noheader,nounits"])
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .map_err(|e| {
                format!(
                    "no CUDA device: cannot run {}: {}",
                    self.gpu_query_command.display(),
                    e
                )
            })?;

        if !output.status.success() {
            return Err(format!(
                "no CUDA device: {} exited with {}",
                self.gpu_query_command.display(),
                output.status
            ));
        }

        parse_vram_mb(&String::from_utf8_lossy(&output.stdout))
            .ok_or_else(|| "no CUDA device reported".to_string())
    }

    async fn write_temp_image(&self, screenshot: &Screenshot) -> Result<TempImage, FailureKind> {
        let png = screenshot
            .to_png_bytes()
            .map_err(|e| FailureKind::TransientError(format!("Failed to encode image: {}", e)))?;

        let path = std::env::temp_dir().join(format!(
            "vision_capture_{}_{}_{}.png",
            std::process::id(),
            REQUEST_SEQ.fetch_add(1, Ordering::Relaxed),
            screenshot.fingerprint().short()
        ));

        tokio::fs::write(&path, png).await.map_err(|e| {
            FailureKind::TransientError(format!("Failed to save temp image: {}", e))
        })?;
        Ok(TempImage(path))
    }
}

#[async_trait::async_trait]
impl BackendAdapter for LocalModelAdapter {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn ready(&self) -> bool {
        if !self.binary_path.is_file() {
            debug!(
                "Inference binary not found at: {}",
                self.binary_path.display()
            );
            return false;
        }
        self.hardware().is_ok()
    }

    async fn run_model(
        &self,
        screenshot: &Screenshot,
        deadline: Duration,
    ) -> Result<String, FailureKind> {
        if !self.binary_path.is_file() {
            return Err(FailureKind::Unavailable(format!(
                "inference binary not found at {}",
                self.binary_path.display()
            )));
        }
        if let Err(reason) = self.hardware() {
            return Err(FailureKind::Unavailable(reason.clone()));
        }

        let image = self.write_temp_image(screenshot).await?;
        info!(
            "Running {} on {} ({}x{})",
            self.model,
            self.device,
            screenshot.width(),
            screenshot.height()
        );

        let mut command = Command::new(&self.binary_path);
        command
            .arg("--image")
            .arg(&image.0)
            .arg("--device")
            .arg(&self.device)
            .arg("--model")
            .arg(&self.model)
            .arg("--json")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Dropping the output future kills the child
        let output = match tokio::time::timeout(deadline, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FailureKind::Unavailable(e.to_string()));
            }
            Ok(Err(e)) => return Err(FailureKind::TransientError(e.to_string())),
            Err(_) => return Err(FailureKind::Timeout),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!("{} inference failed: {}", self.kind.as_str(), stderr.trim());
            return Err(FailureKind::TransientError(format!(
                "exit status {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        debug!("Inference output: {} bytes", stdout.len());

        // The binary reports its own failures as {"error": "..."}
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(stdout.trim()) {
            if let Some(error) = value["error"].as_str() {
                return Err(FailureKind::TransientError(error.to_string()));
            }
        }

        Ok(stdout)
    }
}

fn available_ram_mb() -> u64 {
    let mut system = System::new();
    system.refresh_memory();
    system.available_memory() / MIB
}

/// Largest per-device total from `nvidia-smi` CSV output, one MiB value per line
fn parse_vram_mb(output: &str) -> Option<u64> {
    output
        .lines()
        .filter_map(|line| line.trim().parse::<u64>().ok())
        .max()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbaImage;

    fn config_with(path: Option<String>) -> LocalBackendConfig {
        LocalBackendConfig {
            enabled: true,
            binary_path: path,
            model: "test-model".to_string(),
            device: String::new(),
            min_memory_mb: Some(0),
            gpu_query_command: None,
        }
    }

    /// A path that exists, for adapters that never get to run it
    fn existing_file() -> String {
        std::env::current_exe()
            .unwrap()
            .to_string_lossy()
            .into_owned()
    }

    #[test]
    fn test_parse_vram_mb() {
        assert_eq!(parse_vram_mb("24576\n"), Some(24576));
        assert_eq!(parse_vram_mb("8192\n 16384 \n"), Some(16384));
        assert_eq!(parse_vram_mb(""), None);
        assert_eq!(parse_vram_mb("No devices were found\n"), None);
    }

    #[test]
    fn test_memory_defaults_by_kind() {
        let mut config = config_with(None);
        config.min_memory_mb = None;
        assert_eq!(
            LocalModelAdapter::accelerated(&config).min_memory_mb,
            DEFAULT_MIN_VRAM_MB
        );
        assert_eq!(LocalModelAdapter::cpu(&config).min_memory_mb, DEFAULT_MIN_RAM_MB);
    }

    #[tokio::test]
    async fn test_cpu_without_enough_memory_is_unavailable() {
        let mut config = config_with(Some(existing_file()));
        config.min_memory_mb = Some(u64::MAX);
        let adapter = LocalModelAdapter::cpu(&config);
        assert!(!adapter.ready());

        let shot = Screenshot::new(RgbaImage::new(4, 4), "test");
        assert!(matches!(
            adapter.run_model(&shot, Duration::from_secs(1)).await,
            Err(FailureKind::Unavailable(msg)) if msg.contains("free memory")
        ));
    }

    #[test]
    fn test_accelerated_without_cuda_is_not_ready() {
        let mut config = config_with(Some(existing_file()));
        config.min_memory_mb = None;
        config.gpu_query_command = Some("/nonexistent/nvidia-smi".to_string());
        let adapter = LocalModelAdapter::accelerated(&config);

        assert!(!adapter.ready());
        assert!(matches!(adapter.hardware(), Err(msg) if msg.starts_with("no CUDA device")));
    }

    #[cfg(unix)]
    #[test]
    fn test_accelerated_needs_enough_video_memory() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let gpu = |name: &str, body: &str| {
            let path = dir.path().join(name);
            std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            let mut config = config_with(Some(existing_file()));
            config.min_memory_mb = None;
            config.gpu_query_command = Some(path.to_string_lossy().into_owned());
            LocalModelAdapter::accelerated(&config)
        };

        let small = gpu("small.sh", "echo 8192");
        let large = gpu("large.sh", "echo 8192\necho 24576");
        let broken = gpu("broken.sh", "exit 9");

        assert!(!small.ready());
        assert_eq!(
            small.hardware(),
            &Err("8192 MiB video memory available, 16384 MiB needed".to_string())
        );
        assert!(large.ready());
        assert!(!broken.ready());
    }

    #[test]
    fn test_device_defaults_by_kind() {
        let gpu = LocalModelAdapter::accelerated(&config_with(None));
        let cpu = LocalModelAdapter::cpu(&config_with(None));
        assert_eq!(gpu.device(), "cuda");
        assert_eq!(cpu.device(), "cpu");
        assert_eq!(gpu.kind(), BackendKind::AcceleratedLocal);
    }

    #[tokio::test]
    async fn test_missing_binary_is_unavailable() {
        let adapter = LocalModelAdapter::cpu(&config_with(Some(
            "/nonexistent/vision-infer".to_string(),
        )));
        assert!(!adapter.ready());

        let shot = Screenshot::new(RgbaImage::new(4, 4), "test");
        let result = adapter.run_model(&shot, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(FailureKind::Unavailable(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runs_inference_binary() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let shot = Screenshot::new(RgbaImage::new(20, 20), "test");

        let script = |name: &str, body: &str| {
            let path = dir.path().join(name);
            std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            LocalModelAdapter::cpu(&config_with(Some(path.to_string_lossy().into_owned())))
        };

        let ok = script(
            "ok.sh",
            r#"[ "$1" = "--image" ] && [ -f "$2" ] || exit 3
echo '[{"type":"button","text":"OK","bbox":[1,1,5,5],"confidence":0.9}]'"#,
        );
        let failing = script("fail.sh", "echo 'model crashed' >&2\nexit 1");
        let reported = script("reported.sh", r#"echo '{"error":"out of memory"}'"#);
        let slow = script("slow.sh", "sleep 5");

        let output = ok.run_model(&shot, Duration::from_secs(5)).await.unwrap();
        assert!(output.contains("\"OK\""));

        assert!(matches!(
            failing.run_model(&shot, Duration::from_secs(5)).await,
            Err(FailureKind::TransientError(msg)) if msg.contains("model crashed")
        ));

        assert_eq!(
            reported.run_model(&shot, Duration::from_secs(5)).await,
            Err(FailureKind::TransientError("out of memory".to_string()))
        );

        assert_eq!(
            slow.run_model(&shot, Duration::from_millis(200)).await,
            Err(FailureKind::Timeout)
        );
    }
}
