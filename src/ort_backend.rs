//! ONNX Runtime 推理引擎封装
//!
//! 会话始终从基础 ONNX 模型构建, 优化产物通过执行提供者的缓存目录接入:
//! - TensorRT: 引擎缓存目录 (首次构建后复用)
//! - OpenVINO: 编译缓存目录
//! - DirectML / CPU: 直接运行基础模型

use std::path::Path;

use anyhow::{Context, Result};
use ndarray::{Array, IxDyn};
use once_cell::sync::Lazy;
use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, DirectMLExecutionProvider,
    ExecutionProviderDispatch, OpenVINOExecutionProvider, TensorRTExecutionProvider,
};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use regex::Regex;

use crate::backend::{Backend, BackendSelection, DeviceArg};

/// Ultralytics 导出的 names 元数据: {0: 'person', 1: 'car'}
static NAMES_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)\s*:\s*'([^']*)'").unwrap());

fn gpu_id(device: DeviceArg) -> i32 {
    match device {
        DeviceArg::Gpu(id) => id,
        _ => 0,
    }
}

/// 按后端构造执行提供者列表 (最后总是 CPU 兜底)
fn execution_providers(selection: &BackendSelection) -> Vec<ExecutionProviderDispatch> {
    let artifact = selection.model_path.to_string_lossy().into_owned();
    let mut eps = Vec::new();
    match selection.backend {
        Backend::TensorRT => {
            let device_id = gpu_id(selection.device);
            eps.push(
                TensorRTExecutionProvider::default()
                    .with_device_id(device_id)
                    .with_fp16(true)
                    .with_engine_cache(true)
                    .with_engine_cache_path(artifact)
                    .build(),
            );
            eps.push(CUDAExecutionProvider::default().with_device_id(device_id).build());
        }
        // DirectML 不传设备参数
        Backend::DirectML => eps.push(DirectMLExecutionProvider::default().build()),
        Backend::OpenVINO => eps.push(
            OpenVINOExecutionProvider::default()
                .with_device_type("CPU")
                .with_cache_dir(artifact)
                .build(),
        ),
        Backend::Cpu => {}
    }
    eps.push(CPUExecutionProvider::default().build());
    eps
}

/// 推理引擎
pub struct OrtBackend {
    session: Session,
    backend: Backend,
    image_size: u32,
    names: Vec<String>,
    producer: Option<String>,
}

impl OrtBackend {
    /// 为选中的后端构建会话
    pub fn build(selection: &BackendSelection, image_size: u32) -> Result<Self> {
        Self::build_with(selection, image_size, execution_providers(selection))
    }

    /// 只用给定执行提供者构建会话 (导出优化产物时使用)
    pub fn build_with(
        selection: &BackendSelection,
        image_size: u32,
        providers: Vec<ExecutionProviderDispatch>,
    ) -> Result<Self> {
        let model = &selection.base_model;
        if !model.exists() {
            anyhow::bail!("模型文件不存在: {}", model.display());
        }
        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(threads)?
            .with_execution_providers(providers)?
            .commit_from_file(model)
            .with_context(|| format!("加载模型失败: {}", model.display()))?;

        let (names, producer) = read_metadata(&session);
        log::info!(
            target: "system",
            "✅ 模型已加载: {} (后端 {}, {} 个类别)",
            model.display(),
            selection.backend,
            names.len()
        );

        Ok(Self {
            session,
            backend: selection.backend,
            image_size,
            names,
            producer,
        })
    }

    /// 执行一次推理, 返回全部输出
    pub fn run(&mut self, xs: Array<f32, IxDyn>) -> Result<Vec<Array<f32, IxDyn>>> {
        let input = Tensor::from_array(xs)?;
        let outputs = self.session.run(ort::inputs![input])?;

        let mut ys = Vec::with_capacity(outputs.len());
        for (_, value) in outputs.iter() {
            let (shape, data) = value.try_extract_tensor::<f32>()?;
            let dims: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
            ys.push(Array::from_shape_vec(IxDyn(&dims), data.to_vec())?);
        }
        Ok(ys)
    }

    /// 用全零输入跑一次, 触发引擎/缓存构建
    pub fn warmup(&mut self) -> Result<()> {
        let size = self.image_size as usize;
        let xs = Array::zeros((1, 3, size, size)).into_dyn();
        self.run(xs).map(|_| ())
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn image_size(&self) -> u32 {
        self.image_size
    }

    /// 模型内嵌的类别名称 (可能为空)
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn summary(&self) -> String {
        format!(
            "后端: {} | 输入: {}x{} | 类别: {}{}",
            self.backend,
            self.image_size,
            self.image_size,
            self.names.len(),
            self.producer
                .as_deref()
                .map(|p| format!(" | 导出: {}", p))
                .unwrap_or_default()
        )
    }
}

fn read_metadata(session: &Session) -> (Vec<String>, Option<String>) {
    let metadata = match session.metadata() {
        Ok(metadata) => metadata,
        Err(e) => {
            log::debug!("⚠️ 读取模型元数据失败: {}", e);
            return (Vec::new(), None);
        }
    };
    let names = metadata
        .custom("names")
        .ok()
        .flatten()
        .map(|raw| parse_names(&raw))
        .unwrap_or_default();
    let producer = metadata.producer().ok();
    (names, producer)
}

/// 解析 names 元数据, 按类别序号排列
pub fn parse_names(raw: &str) -> Vec<String> {
    let mut pairs: Vec<(usize, String)> = NAMES_RE
        .captures_iter(raw)
        .filter_map(|cap| Some((cap[1].parse().ok()?, cap[2].to_string())))
        .collect();
    pairs.sort_by_key(|(id, _)| *id);
    pairs.into_iter().map(|(_, name)| name).collect()
}

/// 模型路径是否像一个 ONNX 文件
pub fn is_onnx(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("onnx"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn selection(backend: Backend, device: DeviceArg) -> BackendSelection {
        BackendSelection {
            backend,
            model_path: PathBuf::from("models/best_tensorrt"),
            base_model: PathBuf::from("models/best.onnx"),
            device,
        }
    }

    #[test]
    fn names_are_ordered_by_index() {
        let names = parse_names("{1: 'torta', 0: 'caixa', 2: 'saco grande'}");
        assert_eq!(names, vec!["caixa", "torta", "saco grande"]);
        assert!(parse_names("").is_empty());
    }

    #[test]
    fn provider_lists_end_with_cpu() {
        assert_eq!(execution_providers(&selection(Backend::Cpu, DeviceArg::Cpu)).len(), 1);
        assert_eq!(
            execution_providers(&selection(Backend::TensorRT, DeviceArg::Gpu(0))).len(),
            3
        );
        assert_eq!(
            execution_providers(&selection(Backend::DirectML, DeviceArg::Default)).len(),
            2
        );
    }

    #[test]
    fn missing_model_is_an_error() {
        let sel = BackendSelection {
            base_model: PathBuf::from("/nonexistent/best.onnx"),
            ..selection(Backend::Cpu, DeviceArg::Cpu)
        };
        assert!(OrtBackend::build(&sel, 640).is_err());
        assert!(is_onnx(&sel.base_model));
        assert!(!is_onnx(Path::new("best.pt")));
    }
}
