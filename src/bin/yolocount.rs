/// 多路摄像头检测计数 - 命令行入口
///
/// 直接运行: cargo run --bin yolocount --release -- run
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::unbounded;
use image::DynamicImage;

use yolocount_rs::backend::{hardware_info, select_backend, OrtProbe};
use yolocount_rs::config::{migrate_legacy, CameraConfig, CameraUpdate, ConfigManager, LegacyConfig};
use yolocount_rs::logger::{self, log_user_action};
use yolocount_rs::optimizer::{check_and_export_models, OrtExporter};
use yolocount_rs::paths::AppPaths;
use yolocount_rs::report::{ApiClient, CargoType, DailyReport, ReportStore};
use yolocount_rs::service::{DetectionService, FrameCallback, OrtPipeline, ServiceEvent};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// 预览图写盘间隔
const PREVIEW_INTERVAL: Duration = Duration::from_secs(1);

/// 多路摄像头目标检测与过线计数
#[derive(Parser, Debug)]
#[command(author, version, about = "多路摄像头目标检测与过线计数", long_about = None)]
struct Cli {
    /// 数据目录 (默认系统配置目录下的 YoloCount)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// 配置文件路径 (默认 <数据目录>/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// 输出调试日志
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 启动检测计数
    Run {
        /// 摄像头ID, 逗号分隔 (默认全部启用的摄像头)
        #[arg(long, value_delimiter = ',')]
        cameras: Vec<u32>,

        /// 操作员
        #[arg(long, default_value = "operator")]
        user: String,

        /// 货物类型 (TORTA_NORMAL, SOJA_SECA, ...)
        #[arg(long, default_value = "DESCONHECIDO")]
        cargo: CargoType,

        /// 运行秒数, 不指定时运行到 Ctrl-C
        #[arg(long)]
        duration: Option<u64>,

        /// 跳过启动时的模型优化
        #[arg(long)]
        no_optimize: bool,

        /// 结束后把日报发送到 api_base_url
        #[arg(long)]
        send_report: bool,
    },
    /// 显示硬件与后端选择
    Hardware,
    /// 生成 TensorRT / OpenVINO 优化模型
    Optimize,
    /// 配置管理
    #[command(subcommand)]
    Config(ConfigCommand),
    /// 把 v1 扁平配置迁移到当前格式
    Migrate {
        /// v1 配置文件
        legacy: PathBuf,
    },
    /// 已保存的报告
    #[command(subcommand)]
    Report(ReportCommand),
}

#[derive(Subcommand, Debug)]
enum ReportCommand {
    /// 列出报告 (最新的在前)
    List,
    /// 按文件名删除报告
    Delete { filename: String },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// 打印当前配置
    Show,
    /// 打印配置文件路径
    Path,
    /// 恢复默认配置
    RestoreDefaults,
    /// 添加摄像头
    AddCamera {
        #[arg(long)]
        id: u32,
        #[arg(long)]
        name: String,
        /// 设备索引或 RTSP 地址
        #[arg(long)]
        source: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long)]
        disabled: bool,
    },
    /// 删除摄像头
    RemoveCamera { id: u32 },
    /// 修改摄像头
    SetCamera {
        id: u32,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        source: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        enabled: Option<bool>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let paths = AppPaths::resolve(cli.data_dir.as_deref());
    paths.ensure_dirs().context("无法创建数据目录")?;
    let log_file = logger::init(&paths.logs_dir(), cli.verbose)?;
    log::debug!("📝 日志文件: {}", log_file.display());

    let config_path = cli.config.clone().unwrap_or_else(|| paths.config_file());
    let manager = ConfigManager::open(config_path);

    match cli.command {
        Command::Run {
            cameras,
            user,
            cargo,
            duration,
            no_optimize,
            send_report,
        } => run(
            manager,
            &paths,
            RunOptions {
                cameras,
                user,
                cargo,
                duration: duration.map(Duration::from_secs),
                optimize: !no_optimize,
                send_report,
            },
        ),
        Command::Hardware => {
            print_hardware(&manager);
            Ok(())
        }
        Command::Optimize => {
            let report =
                check_and_export_models(&manager.config().detection, &OrtProbe, &OrtExporter);
            println!("{}", report.summary());
            Ok(())
        }
        Command::Config(cmd) => config_command(manager, cmd),
        Command::Migrate { legacy } => migrate(manager, &legacy),
        Command::Report(cmd) => report_command(&paths, cmd),
    }
}

fn print_hardware(manager: &ConfigManager) {
    let info = hardware_info(&OrtProbe);
    println!("🖥️  硬件信息");
    println!("   CUDA:      {}", yes_no(info.cuda_available));
    println!("   TensorRT:  {}", yes_no(info.tensorrt_available));
    println!("   DirectML:  {}", yes_no(info.directml_available));
    println!("   OpenVINO:  {}", yes_no(info.openvino_available));
    println!("   CPU 线程:  {}", info.cpu_threads);
    println!("   推荐后端:  {}", info.recommended_backend);

    let selection = select_backend(&manager.config().detection, &OrtProbe);
    println!("⚙️  当前配置将使用: {} ({})", selection.backend, selection.backend.hardware());
    println!("   模型: {}", selection.model_path.display());
    println!("   设备: {}", selection.device);
    if !selection.model_exists() {
        println!("   ⚠️ 模型文件不存在");
    }
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "✅"
    } else {
        "❌"
    }
}

fn config_command(mut manager: ConfigManager, cmd: ConfigCommand) -> Result<()> {
    match cmd {
        ConfigCommand::Show => {
            println!("{}", serde_json::to_string_pretty(manager.config())?);
        }
        ConfigCommand::Path => {
            println!("{}", manager.path().display());
        }
        ConfigCommand::RestoreDefaults => {
            manager.restore_defaults()?;
            println!("✅ 已恢复默认配置: {}", manager.path().display());
        }
        ConfigCommand::AddCamera {
            id,
            name,
            source,
            description,
            disabled,
        } => {
            let mut camera = CameraConfig::new(id, name, source).with_description(description);
            if disabled {
                camera = camera.disabled();
            }
            manager.add_camera(camera)?;
            println!("✅ 摄像头 {} 已添加", id);
        }
        ConfigCommand::RemoveCamera { id } => {
            let removed = manager.remove_camera(id)?;
            println!("✅ 摄像头 {} ({}) 已删除", id, removed.name);
        }
        ConfigCommand::SetCamera {
            id,
            name,
            source,
            description,
            enabled,
        } => {
            let update = CameraUpdate {
                name,
                source,
                description,
                enabled,
            };
            if manager.update_camera(id, update)? {
                println!("✅ 摄像头 {} 已更新", id);
            } else {
                println!("ℹ️ 摄像头 {} 没有变化", id);
            }
        }
    }
    Ok(())
}

fn migrate(mut manager: ConfigManager, legacy: &Path) -> Result<()> {
    let text = std::fs::read_to_string(legacy)
        .with_context(|| format!("无法读取 {}", legacy.display()))?;
    let legacy_config = LegacyConfig::from_json(&text)?;
    let config = migrate_legacy(&legacy_config)?;
    let cameras = config.cameras.len();
    manager.replace(config)?;
    println!(
        "✅ 迁移完成: {} 个摄像头, 已写入 {}",
        cameras,
        manager.path().display()
    );
    Ok(())
}

fn report_command(paths: &AppPaths, cmd: ReportCommand) -> Result<()> {
    let store = ReportStore::new(paths.reports_dir())?;
    match cmd {
        ReportCommand::List => {
            let reports = store.list_reports()?;
            if reports.is_empty() {
                println!("ℹ️ 没有报告: {}", store.dir().display());
            }
            for r in reports {
                println!(
                    "📄 {}  {}  摄像头 {} ({})  {}  计数 {}  {:.2} KB",
                    r.filename,
                    r.date,
                    r.camera_id,
                    r.camera_name,
                    r.cargo_type,
                    r.detection_count,
                    r.size_kb
                );
            }
        }
        ReportCommand::Delete { filename } => {
            if store.delete_report(&filename)? {
                println!("✅ 报告已删除: {}", filename);
            } else {
                bail!("报告不存在: {}", filename);
            }
        }
    }
    Ok(())
}

struct RunOptions {
    cameras: Vec<u32>,
    user: String,
    cargo: CargoType,
    duration: Option<Duration>,
    optimize: bool,
    send_report: bool,
}

/// 把标注画面定期写成 `preview/camera_<id>.jpg`
fn preview_writer(dir: PathBuf) -> FrameCallback {
    let last_write: Mutex<HashMap<u32, Instant>> = Mutex::new(HashMap::new());
    Arc::new(move |camera_id, _count, image| {
        {
            let mut last = last_write.lock().unwrap_or_else(PoisonError::into_inner);
            let now = Instant::now();
            if last
                .get(&camera_id)
                .is_some_and(|t| now.duration_since(*t) < PREVIEW_INTERVAL)
            {
                return;
            }
            last.insert(camera_id, now);
        }
        let path = dir.join(format!("camera_{}.jpg", camera_id));
        let rgb = DynamicImage::ImageRgba8(image.clone()).to_rgb8();
        if let Err(e) = rgb.save(&path) {
            log::warn!("⚠️ 预览图写入失败 {}: {}", path.display(), e);
        }
    })
}

fn run(manager: ConfigManager, paths: &AppPaths, opts: RunOptions) -> Result<()> {
    let detection = manager.config().detection.clone();
    if opts.optimize && detection.auto_optimize {
        let report = check_and_export_models(&detection, &OrtProbe, &OrtExporter);
        log::info!("{}", report.summary());
    }

    let camera_ids: Vec<u32> = if opts.cameras.is_empty() {
        manager.config().enabled_cameras().map(|c| c.id).collect()
    } else {
        opts.cameras.clone()
    };
    if camera_ids.is_empty() {
        bail!("没有可启动的摄像头, 请先用 `config add-camera` 添加");
    }

    let config = Arc::new(RwLock::new(manager));
    let (tx, rx) = unbounded();
    let service = DetectionService::new(Arc::clone(&config), Arc::new(OrtPipeline::new()), tx);
    let callback = detection.show_window.then(|| preview_writer(paths.preview_dir()));

    let mut started = 0;
    for &camera_id in &camera_ids {
        match service.start_detection(camera_id, &opts.user, opts.cargo, callback.clone()) {
            Ok(()) => started += 1,
            Err(e) => log::error!("❌ 摄像头 {} 启动失败: {}", camera_id, e),
        }
    }
    if started == 0 {
        bail!("没有任何摄像头成功启动");
    }

    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    ctrlc::set_handler(move || {
        println!("\n🛑 收到 Ctrl-C, 正在停止...");
        flag.store(false, Ordering::SeqCst);
    })
    .context("无法注册 Ctrl-C 处理")?;

    let deadline = opts.duration.map(|d| Instant::now() + d);
    while running.load(Ordering::SeqCst) {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            log::info!("⏱️ 达到运行时长, 停止检测");
            break;
        }
        if let Ok(event) = rx.recv_timeout(Duration::from_millis(200)) {
            report_event(&event);
        }
        if service.active_cameras().is_empty() {
            log::info!("📹 所有检测线程已结束");
            break;
        }
    }

    service.stop_all_detections();
    for event in rx.try_iter() {
        report_event(&event);
    }
    log_user_action(&opts.user, "停止检测");

    let sessions = service.take_finished_sessions();
    let store = ReportStore::new(paths.reports_dir())?;
    let (names, api_base_url) = {
        let manager = config.read().unwrap_or_else(PoisonError::into_inner);
        let names: HashMap<u32, String> = manager
            .config()
            .cameras
            .values()
            .map(|c| (c.id, c.name.clone()))
            .collect();
        (names, manager.config().api_base_url.clone())
    };
    let client = if opts.send_report {
        match ApiClient::new(&api_base_url) {
            Ok(client) => Some(client),
            Err(e) => {
                log::error!("❌ {}", e);
                None
            }
        }
    } else {
        None
    };

    for session in &sessions {
        let name = names
            .get(&session.camera_id)
            .cloned()
            .unwrap_or_else(|| format!("Camera {}", session.camera_id));
        println!(
            "📊 摄像头 {} ({}): 计数 {} | {} | 时长 {}s",
            session.camera_id,
            name,
            session.detection_count,
            session.cargo_type,
            session.duration().num_seconds()
        );
        if let Err(e) = store.save_session(&name, session) {
            log::error!("❌ 报告保存失败: {:#}", e);
        }
        if let Some(client) = &client {
            if let Err(e) = client.send_daily_report(&DailyReport::from_session(&name, session)) {
                log::error!("❌ {:#}", e);
            }
        }
    }
    Ok(())
}

fn report_event(event: &ServiceEvent) {
    match event {
        ServiceEvent::Error(message) => log::error!("❌ {}", message),
        ServiceEvent::DetectionStarting { camera_id } => {
            log::info!("⏳ 摄像头 {} 正在启动", camera_id)
        }
        ServiceEvent::DetectionStarted { camera_id } => {
            log::info!("▶️ 摄像头 {} 检测已开始", camera_id)
        }
        ServiceEvent::DetectionFailed { camera_id, reason } => {
            log::error!("❌ 摄像头 {} 检测失败: {}", camera_id, reason)
        }
        ServiceEvent::DetectionStopped { camera_id } => {
            log::info!("⏹️ 摄像头 {} 检测已停止", camera_id)
        }
        ServiceEvent::ObjectCrossed {
            camera_id,
            track_id,
            count,
        } => println!("📦 摄像头 {} | ID {} 过线 | 计数 {}", camera_id, track_id, count),
        ServiceEvent::CountReset { camera_id } => log::info!("🔄 摄像头 {} 计数已清零", camera_id),
    }
}
