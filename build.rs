// 构建脚本: 静态链接 FFmpeg (vcpkg) 时补充系统库
fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    #[cfg(all(target_os = "windows", target_env = "msvc"))]
    {
        // dshow 摄像头采集
        for lib in ["strmiids", "ole32", "oleaut32", "vfw32"] {
            println!("cargo:rustc-link-lib=dylib={}", lib);
        }
        // RTSP over TLS
        println!("cargo:rustc-link-lib=dylib=secur32");
        // Intel QSV 解码
        println!("cargo:rustc-link-lib=dylib=libmfx");
    }
}
