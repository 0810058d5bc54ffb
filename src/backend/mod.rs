//! 推理后端选择
//!
//! 优先级固定: TensorRT > DirectML > OpenVINO > CPU
//!
//! - 非 auto 偏好先单独尝试, 失败后回落到自动检测
//! - `prefer_gpu = false` 时自动检测跳过 GPU 后端 (TensorRT / DirectML)
//! - 硬件可用性通过 [`HardwareProbe`] 查询, 生产环境使用 [`OrtProbe`]

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::DetectionConfig;

mod probe;

pub use probe::OrtProbe;

/// 实际使用的推理后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Backend {
    TensorRT,
    DirectML,
    OpenVINO,
    Cpu,
}

impl Backend {
    pub fn name(&self) -> &'static str {
        match self {
            Backend::TensorRT => "TensorRT",
            Backend::DirectML => "DirectML",
            Backend::OpenVINO => "OpenVINO",
            Backend::Cpu => "CPU",
        }
    }

    pub fn is_gpu(&self) -> bool {
        matches!(self, Backend::TensorRT | Backend::DirectML)
    }

    /// 硬件说明 (日志用)
    pub fn hardware(&self) -> &'static str {
        match self {
            Backend::TensorRT => "NVIDIA GPU",
            Backend::DirectML => "AMD/其他 GPU",
            Backend::OpenVINO => "Intel CPU/iGPU",
            Backend::Cpu => "CPU",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 配置中的后端偏好
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendPreference {
    #[default]
    Auto,
    TensorRT,
    DirectML,
    OpenVINO,
    Cpu,
}

impl BackendPreference {
    pub fn as_backend(&self) -> Option<Backend> {
        match self {
            BackendPreference::Auto => None,
            BackendPreference::TensorRT => Some(Backend::TensorRT),
            BackendPreference::DirectML => Some(Backend::DirectML),
            BackendPreference::OpenVINO => Some(Backend::OpenVINO),
            BackendPreference::Cpu => Some(Backend::Cpu),
        }
    }
}

impl FromStr for BackendPreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(BackendPreference::Auto),
            "tensorrt" | "trt" => Ok(BackendPreference::TensorRT),
            "directml" | "dml" => Ok(BackendPreference::DirectML),
            "openvino" => Ok(BackendPreference::OpenVINO),
            "cpu" => Ok(BackendPreference::Cpu),
            other => Err(format!("未知后端: {}", other)),
        }
    }
}

/// 推理设备参数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeviceArg {
    /// GPU 设备号
    Gpu(i32),
    Cpu,
    /// 不指定设备, 由后端自行决定
    Default,
}

impl fmt::Display for DeviceArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceArg::Gpu(id) => write!(f, "device={}", id),
            DeviceArg::Cpu => f.write_str("device=cpu"),
            DeviceArg::Default => f.write_str("{}"),
        }
    }
}

/// 后端选择结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendSelection {
    pub backend: Backend,
    /// 选中的模型产物 (TensorRT 引擎缓存 / OpenVINO 缓存目录 / 基础 ONNX)
    pub model_path: PathBuf,
    /// 基础 ONNX 模型 (会话始终从它构建)
    pub base_model: PathBuf,
    pub device: DeviceArg,
}

impl BackendSelection {
    fn new(backend: Backend, model_path: &str, base_model: &str, device: DeviceArg) -> Self {
        Self {
            backend,
            model_path: PathBuf::from(model_path),
            base_model: PathBuf::from(base_model),
            device,
        }
    }

    /// 选中的模型文件是否存在
    pub fn model_exists(&self) -> bool {
        self.model_path.exists() && self.base_model.exists()
    }
}

/// 硬件可用性查询
pub trait HardwareProbe: Send + Sync {
    fn cuda_available(&self) -> bool;
    fn tensorrt_available(&self) -> bool;
    fn directml_available(&self) -> bool;
    fn openvino_available(&self) -> bool;
}

/// 优化产物是否就绪: 普通文件, 或非空目录
pub fn artifact_ready(path: impl AsRef<Path>) -> bool {
    let path = path.as_ref();
    if path.is_file() {
        return true;
    }
    if path.is_dir() {
        return std::fs::read_dir(path)
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false);
    }
    false
}

fn try_backend(
    backend: Backend,
    cfg: &DetectionConfig,
    probe: &dyn HardwareProbe,
) -> Result<BackendSelection, String> {
    match backend {
        Backend::TensorRT => {
            if !probe.cuda_available() {
                return Err("CUDA 不可用".to_string());
            }
            if !artifact_ready(&cfg.model_path_tensorrt) {
                return Err(format!("{} 未找到", cfg.model_path_tensorrt));
            }
            Ok(BackendSelection::new(
                backend,
                &cfg.model_path_tensorrt,
                &cfg.model_path,
                DeviceArg::Gpu(0),
            ))
        }
        Backend::DirectML => {
            if !probe.directml_available() {
                return Err("DirectML 不可用".to_string());
            }
            Ok(BackendSelection::new(
                backend,
                &cfg.model_path,
                &cfg.model_path,
                DeviceArg::Default,
            ))
        }
        Backend::OpenVINO => {
            if !artifact_ready(&cfg.model_path_openvino) {
                return Err(format!("{} 未找到", cfg.model_path_openvino));
            }
            Ok(BackendSelection::new(
                backend,
                &cfg.model_path_openvino,
                &cfg.model_path,
                DeviceArg::Default,
            ))
        }
        Backend::Cpu => Ok(BackendSelection::new(
            backend,
            &cfg.model_path,
            &cfg.model_path,
            DeviceArg::Cpu,
        )),
    }
}

/// 选择推理后端
pub fn select_backend(cfg: &DetectionConfig, probe: &dyn HardwareProbe) -> BackendSelection {
    if let Some(preferred) = cfg.preferred_backend.as_backend() {
        match try_backend(preferred, cfg, probe) {
            Ok(selection) => {
                log::info!(
                    target: "system",
                    "👍 使用首选后端: {} ({})",
                    selection.backend,
                    selection.backend.hardware()
                );
                return selection;
            }
            Err(reason) => {
                log::warn!("⚠️ 首选后端 {} 不可用 ({}), 改为自动检测", preferred, reason);
            }
        }
    }

    log::info!(target: "system", "🤖 开始自动检测后端...");
    for backend in [Backend::TensorRT, Backend::DirectML, Backend::OpenVINO] {
        if backend.is_gpu() && !cfg.prefer_gpu {
            log::debug!("⏭️ prefer_gpu=false, 跳过 {}", backend);
            continue;
        }
        match try_backend(backend, cfg, probe) {
            Ok(selection) => {
                log::info!(
                    target: "system",
                    "🥇 检测到: {} ({})",
                    selection.backend,
                    selection.backend.hardware()
                );
                return selection;
            }
            Err(reason) => log::debug!("⏭️ {}: {}", backend, reason),
        }
    }

    log::info!(target: "system", "🐢 回落到 CPU 后端");
    BackendSelection::new(Backend::Cpu, &cfg.model_path, &cfg.model_path, DeviceArg::Cpu)
}

/// 硬件信息汇总
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HardwareInfo {
    pub cuda_available: bool,
    pub tensorrt_available: bool,
    pub directml_available: bool,
    pub openvino_available: bool,
    pub cpu_threads: usize,
    pub recommended_backend: Backend,
}

pub fn hardware_info(probe: &dyn HardwareProbe) -> HardwareInfo {
    let cuda_available = probe.cuda_available();
    let directml_available = probe.directml_available();
    let recommended_backend = if cuda_available {
        Backend::TensorRT
    } else if directml_available {
        Backend::DirectML
    } else {
        Backend::Cpu
    };

    HardwareInfo {
        cuda_available,
        tensorrt_available: probe.tensorrt_available(),
        directml_available,
        openvino_available: probe.openvino_available(),
        cpu_threads: std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1),
        recommended_backend,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::fs;
    use tempfile::{tempdir, TempDir};

    /// 可配置的假硬件
    #[derive(Default, Clone, Copy)]
    pub struct FakeProbe {
        pub cuda: bool,
        pub tensorrt: bool,
        pub directml: bool,
        pub openvino: bool,
    }

    impl HardwareProbe for FakeProbe {
        fn cuda_available(&self) -> bool {
            self.cuda
        }
        fn tensorrt_available(&self) -> bool {
            self.tensorrt
        }
        fn directml_available(&self) -> bool {
            self.directml
        }
        fn openvino_available(&self) -> bool {
            self.openvino
        }
    }

    /// 在临时目录里准备模型文件, 返回 (目录, 配置)
    fn setup(trt_ready: bool, ov_ready: bool) -> (TempDir, DetectionConfig) {
        let dir = tempdir().unwrap();
        let base = dir.path().join("best.onnx");
        fs::write(&base, b"onnx").unwrap();

        let trt = dir.path().join("best_tensorrt");
        fs::create_dir(&trt).unwrap();
        if trt_ready {
            fs::write(trt.join("engine.bin"), b"x").unwrap();
        }
        let ov = dir.path().join("best_openvino");
        if ov_ready {
            fs::create_dir(&ov).unwrap();
            fs::write(ov.join("model.blob"), b"x").unwrap();
        }

        let cfg = DetectionConfig {
            model_path: base.to_string_lossy().into_owned(),
            model_path_tensorrt: trt.to_string_lossy().into_owned(),
            model_path_openvino: ov.to_string_lossy().into_owned(),
            ..Default::default()
        };
        (dir, cfg)
    }

    #[test]
    fn empty_directory_is_not_ready() {
        let (dir, _) = setup(false, false);
        assert!(!artifact_ready(dir.path().join("best_tensorrt")));
        assert!(artifact_ready(dir.path().join("best.onnx")));
        assert!(!artifact_ready(dir.path().join("missing")));
    }

    #[test]
    fn auto_prefers_tensorrt_when_cuda_and_engine() {
        let (_dir, cfg) = setup(true, true);
        let probe = FakeProbe {
            cuda: true,
            directml: true,
            ..Default::default()
        };
        let selection = select_backend(&cfg, &probe);
        assert_eq!(selection.backend, Backend::TensorRT);
        assert_eq!(selection.device, DeviceArg::Gpu(0));
        assert_eq!(selection.model_path, PathBuf::from(&cfg.model_path_tensorrt));
        assert_eq!(selection.base_model, PathBuf::from(&cfg.model_path));
    }

    #[test]
    fn cuda_without_engine_falls_to_directml() {
        let (_dir, cfg) = setup(false, true);
        let probe = FakeProbe {
            cuda: true,
            directml: true,
            ..Default::default()
        };
        let selection = select_backend(&cfg, &probe);
        assert_eq!(selection.backend, Backend::DirectML);
        assert_eq!(selection.device, DeviceArg::Default);
        assert_eq!(selection.model_path, PathBuf::from(&cfg.model_path));
    }

    #[test]
    fn openvino_then_cpu() {
        let (_dir, cfg) = setup(false, true);
        let selection = select_backend(&cfg, &FakeProbe::default());
        assert_eq!(selection.backend, Backend::OpenVINO);

        let (_dir, cfg) = setup(false, false);
        let selection = select_backend(&cfg, &FakeProbe::default());
        assert_eq!(selection.backend, Backend::Cpu);
        assert_eq!(selection.device, DeviceArg::Cpu);
    }

    #[test]
    fn failed_preference_falls_back_to_auto() {
        let (_dir, mut cfg) = setup(false, true);
        cfg.preferred_backend = BackendPreference::TensorRT;
        let selection = select_backend(&cfg, &FakeProbe::default());
        assert_eq!(selection.backend, Backend::OpenVINO);
    }

    #[test]
    fn cpu_preference_wins_over_gpu() {
        let (_dir, mut cfg) = setup(true, true);
        cfg.preferred_backend = BackendPreference::Cpu;
        let probe = FakeProbe {
            cuda: true,
            ..Default::default()
        };
        assert_eq!(select_backend(&cfg, &probe).backend, Backend::Cpu);
    }

    #[test]
    fn prefer_gpu_off_skips_gpu_backends() {
        let (_dir, mut cfg) = setup(true, false);
        cfg.prefer_gpu = false;
        let probe = FakeProbe {
            cuda: true,
            directml: true,
            ..Default::default()
        };
        assert_eq!(select_backend(&cfg, &probe).backend, Backend::Cpu);

        // 显式偏好不受 prefer_gpu 影响
        cfg.preferred_backend = BackendPreference::DirectML;
        assert_eq!(select_backend(&cfg, &probe).backend, Backend::DirectML);
    }

    #[test]
    fn preference_parses_from_json_and_cli() {
        let pref: BackendPreference = serde_json::from_str("\"openvino\"").unwrap();
        assert_eq!(pref, BackendPreference::OpenVINO);
        assert_eq!(
            serde_json::to_string(&BackendPreference::TensorRT).unwrap(),
            "\"tensorrt\""
        );
        assert_eq!("TRT".parse::<BackendPreference>(), Ok(BackendPreference::TensorRT));
        assert!("metal".parse::<BackendPreference>().is_err());
    }

    #[test]
    fn recommended_backend() {
        let info = hardware_info(&FakeProbe {
            directml: true,
            ..Default::default()
        });
        assert_eq!(info.recommended_backend, Backend::DirectML);
        assert!(info.cpu_threads >= 1);
        let info = hardware_info(&FakeProbe {
            cuda: true,
            directml: true,
            ..Default::default()
        });
        assert_eq!(info.recommended_backend, Backend::TensorRT);
    }
}
