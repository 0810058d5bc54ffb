//! 检测会话、日报与上报
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local, NaiveDate};
use serde::{Deserialize, Serialize};

/// 日报接口路径
pub const DAILY_REPORT_ENDPOINT: &str = "/daily-reports";
/// 上报请求超时
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// 货物类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CargoType {
    TortaNormal,
    TortaMoida,
    SojaSeca,
    SojaIntegral,
    FareloMilhoFino,
    FareloMilhoGrosso,
    #[default]
    Desconhecido,
}

impl CargoType {
    pub const ALL: [CargoType; 7] = [
        CargoType::TortaNormal,
        CargoType::TortaMoida,
        CargoType::SojaSeca,
        CargoType::SojaIntegral,
        CargoType::FareloMilhoFino,
        CargoType::FareloMilhoGrosso,
        CargoType::Desconhecido,
    ];

    /// 接口使用的代码 (`TORTA_NORMAL` ...)
    pub fn code(&self) -> &'static str {
        match self {
            CargoType::TortaNormal => "TORTA_NORMAL",
            CargoType::TortaMoida => "TORTA_MOIDA",
            CargoType::SojaSeca => "SOJA_SECA",
            CargoType::SojaIntegral => "SOJA_INTEGRAL",
            CargoType::FareloMilhoFino => "FARELO_MILHO_FINO",
            CargoType::FareloMilhoGrosso => "FARELO_MILHO_GROSSO",
            CargoType::Desconhecido => "DESCONHECIDO",
        }
    }

    /// 显示名称
    pub fn display_name(&self) -> &'static str {
        match self {
            CargoType::TortaNormal => "Torta Normal",
            CargoType::TortaMoida => "Torta Moída",
            CargoType::SojaSeca => "Soja Seca",
            CargoType::SojaIntegral => "Soja Integral",
            CargoType::FareloMilhoFino => "Farelo de Milho Fino",
            CargoType::FareloMilhoGrosso => "Farelo de Milho Grosso",
            CargoType::Desconhecido => "Não Especificado",
        }
    }
}

impl fmt::Display for CargoType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for CargoType {
    type Err = String;

    /// 接受代码或显示名称 (不区分大小写)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        CargoType::ALL
            .into_iter()
            .find(|c| c.code().eq_ignore_ascii_case(s) || c.display_name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("未知的货物类型: {}", s))
    }
}

/// 一次检测会话 (启动到停止)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionSession {
    pub camera_id: u32,
    pub user: String,
    pub model_version: String,
    pub cargo_type: CargoType,
    pub start_time: DateTime<Local>,
    pub end_time: Option<DateTime<Local>>,
    pub detection_count: u64,
}

impl DetectionSession {
    pub fn new(
        camera_id: u32,
        user: impl Into<String>,
        model_version: impl Into<String>,
        cargo_type: CargoType,
    ) -> Self {
        Self {
            camera_id,
            user: user.into(),
            model_version: model_version.into(),
            cargo_type,
            start_time: Local::now(),
            end_time: None,
            detection_count: 0,
        }
    }

    pub fn end(&mut self) {
        if self.end_time.is_none() {
            self.end_time = Some(Local::now());
        }
    }

    pub fn is_finished(&self) -> bool {
        self.end_time.is_some()
    }

    /// 持续时间; 未结束的会话计算到当前时刻
    pub fn duration(&self) -> chrono::Duration {
        self.end_time.unwrap_or_else(Local::now) - self.start_time
    }

    /// 导出用记录
    pub fn record(&self) -> SessionRecord {
        SessionRecord {
            camera_id: self.camera_id,
            user: self.user.clone(),
            cargo_type: self.cargo_type.display_name().to_string(),
            model_version: self.model_version.clone(),
            start_time: self.start_time.to_rfc3339(),
            end_time: self.end_time.map(|t| t.to_rfc3339()),
            duration_seconds: self.duration().num_milliseconds() as f64 / 1000.0,
            detection_count: self.detection_count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub camera_id: u32,
    pub user: String,
    pub cargo_type: String,
    pub model_version: String,
    pub start_time: String,
    pub end_time: Option<String>,
    pub duration_seconds: f64,
    pub detection_count: u64,
}

/// 日报
#[derive(Debug, Clone, PartialEq)]
pub struct DailyReport {
    pub camera_name: String,
    pub cargo_type: CargoType,
    pub total: u64,
    pub start: DateTime<Local>,
    pub end: DateTime<Local>,
    pub date: NaiveDate,
    pub total_hours: f64,
}

impl DailyReport {
    pub fn new(
        camera_name: impl Into<String>,
        cargo_type: CargoType,
        total: u64,
        start: DateTime<Local>,
        end: DateTime<Local>,
    ) -> Self {
        let seconds = (end - start).num_milliseconds() as f64 / 1000.0;
        Self {
            camera_name: camera_name.into(),
            cargo_type,
            total,
            start,
            end,
            date: start.date_naive(),
            total_hours: (seconds / 3600.0).max(0.0),
        }
    }

    /// 从会话生成日报; 未结束的会话以当前时刻为结束时间
    pub fn from_session(camera_name: impl Into<String>, session: &DetectionSession) -> Self {
        Self::new(
            camera_name,
            session.cargo_type,
            session.detection_count,
            session.start_time,
            session.end_time.unwrap_or_else(Local::now),
        )
    }

    /// 上报接口的请求体
    pub fn payload(&self) -> DailyReportPayload {
        DailyReportPayload {
            tipo: self.cargo_type.code().to_string(),
            total: self.total,
            hora_inicio: self.start.format("%H:%M:%S").to_string(),
            hora_termino: self.end.format("%H:%M:%S").to_string(),
            total_horas: (self.total_hours * 100.0).round() / 100.0,
            data: self.date.format("%Y-%m-%d").to_string(),
        }
    }

    /// 报告文件名: `Relatorio_<摄像头>_<开始时间>`
    pub fn file_stem(&self) -> String {
        let safe: String = self
            .camera_name
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { '_' })
            .collect();
        format!("Relatorio_{}_{}", safe, self.start.format("%Y%m%d_%H%M%S"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyReportPayload {
    pub tipo: String,
    pub total: u64,
    pub hora_inicio: String,
    pub hora_termino: String,
    pub total_horas: f64,
    pub data: String,
}

/// 本地报告目录
pub struct ReportStore {
    dir: PathBuf,
}

#[derive(Serialize, Deserialize)]
struct StoredReport {
    camera_name: String,
    session: SessionRecord,
    daily_report: DailyReportPayload,
    generated_at: String,
}

/// 报告列表中的一项
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportEntry {
    pub filename: String,
    pub path: PathBuf,
    pub size_kb: f64,
    pub modified: DateTime<Local>,
    pub camera_name: String,
    pub camera_id: u32,
    /// 货物类型显示名称
    pub cargo_type: String,
    /// 日报日期 `YYYY-MM-DD`
    pub date: String,
    pub detection_count: u64,
}

impl ReportEntry {
    fn read(path: &Path) -> Result<Self> {
        let meta = fs::metadata(path)?;
        let text = fs::read_to_string(path)?;
        let stored: StoredReport = serde_json::from_str(&text)?;
        let modified: DateTime<Local> = meta.modified()?.into();
        Ok(Self {
            filename: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            path: path.to_path_buf(),
            size_kb: (meta.len() as f64 / 1024.0 * 100.0).round() / 100.0,
            modified,
            camera_name: stored.camera_name,
            camera_id: stored.session.camera_id,
            cargo_type: stored.session.cargo_type,
            date: stored.daily_report.data,
            detection_count: stored.session.detection_count,
        })
    }
}

impl ReportStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).with_context(|| format!("无法创建报告目录 {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 保存会话报告 (JSON), 返回文件路径
    pub fn save_session(&self, camera_name: &str, session: &DetectionSession) -> Result<PathBuf> {
        let report = DailyReport::from_session(camera_name, session);
        let path = self.dir.join(format!("{}.json", report.file_stem()));
        let stored = StoredReport {
            camera_name: camera_name.to_string(),
            session: session.record(),
            daily_report: report.payload(),
            generated_at: Local::now().to_rfc3339(),
        };
        let json = serde_json::to_string_pretty(&stored)?;
        fs::write(&path, json).with_context(|| format!("写入报告失败: {}", path.display()))?;
        log::info!(target: "system", "📄 报告已保存: {}", path.display());
        Ok(path)
    }

    /// 已保存的报告, 最新的在前; 无法解析的文件跳过
    pub fn list_reports(&self) -> Result<Vec<ReportEntry>> {
        let mut reports: Vec<ReportEntry> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
            .filter_map(|path| match ReportEntry::read(&path) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    log::warn!("⚠️ 跳过无法读取的报告 {}: {:#}", path.display(), e);
                    None
                }
            })
            .collect();
        reports.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.filename.cmp(&a.filename)));
        Ok(reports)
    }

    /// 按文件名删除报告; 文件不存在时返回 false
    pub fn delete_report(&self, filename: &str) -> Result<bool> {
        let name = Path::new(filename);
        if name.file_name() != Some(name.as_os_str()) {
            bail!("无效的报告文件名: '{}'", filename);
        }
        let path = self.dir.join(name);
        if !path.is_file() {
            log::warn!("⚠️ 报告不存在: {}", path.display());
            return Ok(false);
        }
        fs::remove_file(&path).with_context(|| format!("删除报告失败: {}", path.display()))?;
        log::info!(target: "system", "🗑️ 报告已删除: {}", filename);
        Ok(true)
    }
}

/// 日报上报客户端
pub struct ApiClient {
    base_url: String,
    agent: ureq::Agent,
}

impl ApiClient {
    /// 基础地址必须以 http 开头
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = base_url.trim();
        if !base_url.starts_with("http") {
            bail!("无效的 API 基础地址: '{}'", base_url);
        }
        let agent = ureq::AgentBuilder::new().timeout(REQUEST_TIMEOUT).build();
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            agent,
        })
    }

    pub fn endpoint(&self) -> String {
        format!("{}{}", self.base_url, DAILY_REPORT_ENDPOINT)
    }

    pub fn send_daily_report(&self, report: &DailyReport) -> Result<()> {
        let url = self.endpoint();
        log::info!(target: "system", "📤 发送日报: {}", url);
        let response = self
            .agent
            .post(&url)
            .set("Content-Type", "application/json")
            .send_json(report.payload());

        match response {
            Ok(resp) => {
                log::info!(target: "system", "✅ 日报发送成功: 状态 {}", resp.status());
                Ok(())
            }
            Err(ureq::Error::Status(code, resp)) => {
                let body = resp.into_string().unwrap_or_default();
                let body: String = body.chars().take(200).collect();
                bail!("日报发送失败: 状态 {} 响应 {}", code, body)
            }
            Err(e) => bail!("日报发送失败 ({}): {}", url, e),
        }
    }
}
