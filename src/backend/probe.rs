use ort::execution_providers::{
    CUDAExecutionProvider, DirectMLExecutionProvider, ExecutionProvider, OpenVINOExecutionProvider,
    TensorRTExecutionProvider,
};

use super::HardwareProbe;

/// 通过 ONNX Runtime 已编译的执行提供者查询硬件
#[derive(Debug, Default, Clone, Copy)]
pub struct OrtProbe;

fn provider_available<P: ExecutionProvider>(name: &str, provider: P) -> bool {
    match provider.is_available() {
        Ok(available) => available,
        Err(e) => {
            log::debug!("⚠️ 查询 {} 可用性失败: {}", name, e);
            false
        }
    }
}

impl HardwareProbe for OrtProbe {
    fn cuda_available(&self) -> bool {
        provider_available("CUDA", CUDAExecutionProvider::default())
    }

    fn tensorrt_available(&self) -> bool {
        provider_available("TensorRT", TensorRTExecutionProvider::default())
    }

    fn directml_available(&self) -> bool {
        provider_available("DirectML", DirectMLExecutionProvider::default())
    }

    fn openvino_available(&self) -> bool {
        provider_available("OpenVINO", OpenVINOExecutionProvider::default())
    }
}
