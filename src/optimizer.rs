//! 首次运行时的模型优化
//!
//! 检查硬件并生成 TensorRT / OpenVINO 优化产物, 导出失败只记录日志, 不影响启动

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use ort::execution_providers::{OpenVINOExecutionProvider, TensorRTExecutionProvider};
use serde::Serialize;

use crate::backend::{artifact_ready, Backend, BackendSelection, DeviceArg, HardwareProbe};
use crate::config::DetectionConfig;
use crate::ort_backend::OrtBackend;

/// 优化结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OptimizationReport {
    pub base_model: bool,
    pub tensorrt: bool,
    pub openvino: bool,
    pub directml: bool,
}

impl OptimizationReport {
    /// 人类可读的优化摘要
    pub fn summary(&self) -> String {
        let line = "=".repeat(60);
        let mut out = String::new();
        let _ = writeln!(out, "\n{}", line);
        let _ = writeln!(out, "📊 模型优化摘要");
        let _ = writeln!(out, "{}", line);
        if !self.base_model {
            let _ = writeln!(out, "❌ 基础模型 (ONNX): 未找到");
            return out;
        }
        let _ = writeln!(out, "✅ 基础模型 (ONNX): 可用");
        let rows = [
            (self.tensorrt, "TensorRT (NVIDIA): 已导出, 可用", "TensorRT (NVIDIA): 不可用"),
            (self.openvino, "OpenVINO (Intel): 已导出, 可用", "OpenVINO (Intel): 未导出"),
            (self.directml, "DirectML (AMD/其他): 可用", "DirectML (AMD/其他): 不可用"),
        ];
        for (ok, yes, no) in rows {
            if ok {
                let _ = writeln!(out, "✅ {}", yes);
            } else {
                let _ = writeln!(out, "⏭️  {}", no);
            }
        }
        let _ = writeln!(out, "{}", line);
        out
    }
}

/// 优化产物导出器
pub trait ModelExporter {
    /// 生成 TensorRT 引擎缓存到 `target`
    fn export_tensorrt(&self, base_model: &Path, target: &Path, image_size: u32) -> Result<()>;
    /// 生成 OpenVINO 编译缓存到 `target`
    fn export_openvino(&self, base_model: &Path, target: &Path, image_size: u32) -> Result<()>;
}

/// 借助 ONNX Runtime 执行提供者的缓存机制导出
///
/// 建立指向产物目录的会话并预热一次, 引擎/缓存文件由执行提供者写出
#[derive(Debug, Default, Clone, Copy)]
pub struct OrtExporter;

impl OrtExporter {
    fn warmup(
        backend: Backend,
        base_model: &Path,
        target: &Path,
        image_size: u32,
        provider: ort::execution_providers::ExecutionProviderDispatch,
    ) -> Result<()> {
        fs::create_dir_all(target)
            .with_context(|| format!("无法创建目录 {}", target.display()))?;
        let selection = BackendSelection {
            backend,
            model_path: target.to_path_buf(),
            base_model: base_model.to_path_buf(),
            device: DeviceArg::Default,
        };
        let mut engine = OrtBackend::build_with(&selection, image_size, vec![provider.error_on_failure()])?;
        engine.warmup()
    }
}

impl ModelExporter for OrtExporter {
    fn export_tensorrt(&self, base_model: &Path, target: &Path, image_size: u32) -> Result<()> {
        let target_str = target.to_string_lossy().into_owned();
        let provider = TensorRTExecutionProvider::default()
            .with_device_id(0)
            .with_fp16(true)
            .with_engine_cache(true)
            .with_engine_cache_path(target_str)
            .build();
        Self::warmup(Backend::TensorRT, base_model, target, image_size, provider)
    }

    fn export_openvino(&self, base_model: &Path, target: &Path, image_size: u32) -> Result<()> {
        let target_str = target.to_string_lossy().into_owned();
        let provider = OpenVINOExecutionProvider::default()
            .with_device_type("CPU")
            .with_cache_dir(target_str)
            .build();
        Self::warmup(Backend::OpenVINO, base_model, target, image_size, provider)
    }
}

/// 检查硬件并导出缺失的优化模型
pub fn check_and_export_models(
    cfg: &DetectionConfig,
    probe: &dyn HardwareProbe,
    exporter: &dyn ModelExporter,
) -> OptimizationReport {
    let mut report = OptimizationReport::default();

    let base_model = Path::new(&cfg.model_path);
    if !base_model.exists() {
        log::error!("❌ 基础模型不存在: {}, 请把 ONNX 模型放到该路径", cfg.model_path);
        return report;
    }
    report.base_model = true;
    log::info!(target: "system", "✅ 找到基础模型: {}", cfg.model_path);

    if !cfg.auto_optimize {
        log::info!("ℹ️ auto_optimize 已关闭, 跳过模型优化");
        return report;
    }

    report.tensorrt = check_tensorrt(cfg, base_model, probe, exporter);
    report.openvino = check_openvino(cfg, base_model, exporter);
    report.directml = probe.directml_available();
    if report.directml {
        log::info!(target: "system", "✅ [DirectML] 检测到可用 GPU");
    }
    report
}

fn check_tensorrt(
    cfg: &DetectionConfig,
    base_model: &Path,
    probe: &dyn HardwareProbe,
    exporter: &dyn ModelExporter,
) -> bool {
    let target = Path::new(&cfg.model_path_tensorrt);
    if !probe.cuda_available() {
        log::info!("ℹ️ [TensorRT] 未检测到 NVIDIA GPU (CUDA 不可用)");
        return false;
    }
    if artifact_ready(target) {
        log::info!("✅ [TensorRT] 优化模型已存在: {}", target.display());
        return true;
    }

    log::info!("🚀 [TensorRT] 检测到 NVIDIA GPU, 开始导出 (首次可能需要几分钟)...");
    if let Err(e) = exporter.export_tensorrt(base_model, target, cfg.image_size) {
        log::error!("❌ [TensorRT] 导出失败: {:#}, 继续使用其他后端", e);
        return false;
    }
    if artifact_ready(target) {
        log::info!(target: "system", "✅ [TensorRT] 导出成功: {}", target.display());
        true
    } else {
        log::warn!("⚠️ [TensorRT] 导出完成但未找到产物: {}", target.display());
        false
    }
}

fn check_openvino(cfg: &DetectionConfig, base_model: &Path, exporter: &dyn ModelExporter) -> bool {
    let target = Path::new(&cfg.model_path_openvino);
    if artifact_ready(target) {
        log::info!("✅ [OpenVINO] 优化模型已存在: {}", target.display());
        return true;
    }

    log::info!("🚀 [OpenVINO] 开始导出 CPU/Intel 优化模型...");
    if let Err(e) = exporter.export_openvino(base_model, target, cfg.image_size) {
        log::error!("❌ [OpenVINO] 导出失败: {:#}, 继续使用 CPU", e);
        return false;
    }
    if artifact_ready(target) {
        log::info!(target: "system", "✅ [OpenVINO] 导出成功: {}", target.display());
        true
    } else {
        log::warn!("⚠️ [OpenVINO] 导出完成但未找到产物: {}", target.display());
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::tests::FakeProbe;
    use std::cell::RefCell;
    use tempfile::tempdir;

    /// 记录调用并按需写出产物
    #[derive(Default)]
    struct FakeExporter {
        produce: bool,
        fail: bool,
        calls: RefCell<Vec<&'static str>>,
    }

    impl FakeExporter {
        fn export(&self, name: &'static str, target: &Path) -> Result<()> {
            self.calls.borrow_mut().push(name);
            if self.fail {
                anyhow::bail!("exporter crashed");
            }
            if self.produce {
                fs::create_dir_all(target)?;
                fs::write(target.join("cache.bin"), b"x")?;
            }
            Ok(())
        }
    }

    impl ModelExporter for FakeExporter {
        fn export_tensorrt(&self, _: &Path, target: &Path, _: u32) -> Result<()> {
            self.export("tensorrt", target)
        }
        fn export_openvino(&self, _: &Path, target: &Path, _: u32) -> Result<()> {
            self.export("openvino", target)
        }
    }

    fn config(dir: &Path, with_base: bool) -> DetectionConfig {
        let base = dir.join("best.onnx");
        if with_base {
            fs::write(&base, b"onnx").unwrap();
        }
        DetectionConfig {
            model_path: base.to_string_lossy().into_owned(),
            model_path_tensorrt: dir.join("trt").to_string_lossy().into_owned(),
            model_path_openvino: dir.join("ov").to_string_lossy().into_owned(),
            ..Default::default()
        }
    }

    #[test]
    fn missing_base_model_stops_everything() {
        let dir = tempdir().unwrap();
        let exporter = FakeExporter::default();
        let report = check_and_export_models(&config(dir.path(), false), &FakeProbe::default(), &exporter);
        assert_eq!(report, OptimizationReport::default());
        assert!(exporter.calls.borrow().is_empty());
        assert!(report.summary().contains("未找到"));
    }

    #[test]
    fn auto_optimize_off_only_checks_base() {
        let dir = tempdir().unwrap();
        let mut cfg = config(dir.path(), true);
        cfg.auto_optimize = false;
        let exporter = FakeExporter::default();
        let probe = FakeProbe {
            cuda: true,
            directml: true,
            ..Default::default()
        };
        let report = check_and_export_models(&cfg, &probe, &exporter);
        assert_eq!(
            report,
            OptimizationReport {
                base_model: true,
                ..Default::default()
            }
        );
        assert!(exporter.calls.borrow().is_empty());
    }

    #[test]
    fn exports_missing_artifacts() {
        let dir = tempdir().unwrap();
        let exporter = FakeExporter {
            produce: true,
            ..Default::default()
        };
        let probe = FakeProbe {
            cuda: true,
            ..Default::default()
        };
        let report = check_and_export_models(&config(dir.path(), true), &probe, &exporter);
        assert!(report.tensorrt && report.openvino && !report.directml);
        assert_eq!(*exporter.calls.borrow(), vec!["tensorrt", "openvino"]);

        // 第二次运行直接复用产物
        let again = FakeExporter::default();
        let report = check_and_export_models(&config(dir.path(), true), &probe, &again);
        assert!(report.tensorrt && report.openvino);
        assert!(again.calls.borrow().is_empty());
    }

    #[test]
    fn no_cuda_skips_tensorrt_export() {
        let dir = tempdir().unwrap();
        let exporter = FakeExporter {
            produce: true,
            ..Default::default()
        };
        let report = check_and_export_models(&config(dir.path(), true), &FakeProbe::default(), &exporter);
        assert!(!report.tensorrt);
        assert_eq!(*exporter.calls.borrow(), vec!["openvino"]);
    }

    #[test]
    fn export_failures_are_not_fatal() {
        let dir = tempdir().unwrap();
        let exporter = FakeExporter {
            fail: true,
            ..Default::default()
        };
        let probe = FakeProbe {
            cuda: true,
            directml: true,
            ..Default::default()
        };
        let report = check_and_export_models(&config(dir.path(), true), &probe, &exporter);
        assert!(report.base_model && !report.tensorrt && !report.openvino && report.directml);
    }

    #[test]
    fn export_without_output_is_not_ready() {
        let dir = tempdir().unwrap();
        let exporter = FakeExporter::default();
        let probe = FakeProbe {
            cuda: true,
            ..Default::default()
        };
        let report = check_and_export_models(&config(dir.path(), true), &probe, &exporter);
        assert!(!report.tensorrt && !report.openvino);
        assert_eq!(exporter.calls.borrow().len(), 2);
    }
}
