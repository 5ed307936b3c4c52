/// 数字卫兵 (Digital Sentinel)
///
/// 多路摄像头智能监控 (检测 / 分割 / 车牌识别)
///
/// 系统架构:
/// 1. 采集线程: 每路摄像头独立解码与渲染
/// 2. 推理线程: 每路摄像头独立检测、追踪与事件入库
/// 3. 显示线程: 最新画面写入 `<output_dir>/<camera>.jpg`
/// 4. 主线程:   读取标准输入命令 (连接/断开/云台/查询事件)
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use mimalloc::MiMalloc;
use sentinel_anpr::models::OnnxEngineFactory;
use sentinel_anpr::ptz::WebSocketConnector;
use sentinel_anpr::{
    AppConfig, ConnectionManager, DefaultSourceOpener, EventRecord, EventStore, Overlay,
    PtzAction, Services, TaskKind,
};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// 数字卫兵参数
#[derive(Parser, Debug)]
#[command(author, version, about = "数字卫兵 - 多路摄像头智能监控", long_about = None)]
struct Args {
    /// 配置文件
    #[arg(short, long, default_value = "config/cameras.yaml")]
    config: PathBuf,

    /// 日志级别 (trace/debug/info/warn/error)
    #[arg(long, default_value = "info")]
    log_level: tracing::Level,

    /// 只启动指定摄像头 (可重复), 默认全部
    #[arg(long = "camera")]
    cameras: Vec<String>,

    /// 画面输出目录
    #[arg(short, long, default_value = "output")]
    output_dir: PathBuf,

    /// 事件表显示行数
    #[arg(long, default_value_t = 3)]
    rows: usize,

    /// 图片目录回放间隔 (毫秒)
    #[arg(long, default_value_t = 40)]
    replay_interval_ms: u64,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt().with_max_level(args.log_level).init();

    let config = AppConfig::load(&args.config)?;
    std::fs::create_dir_all(&args.output_dir)?;

    let mut overlay = Overlay::new(config.pipeline.jpeg_quality);
    if let Some(font) = &config.pipeline.font_path {
        overlay = overlay.with_font_file(font)?;
    }

    let services = Services {
        store: Arc::new(EventStore::open(&config.database)?),
        opener: Arc::new(DefaultSourceOpener {
            replay_interval_ms: args.replay_interval_ms,
        }),
        engines: Arc::new(OnnxEngineFactory::new(
            config.models.clone(),
            config.tracker.clone(),
        )),
        connector: Arc::new(WebSocketConnector),
        overlay: Arc::new(overlay),
        pipeline: config.pipeline.clone(),
        ptz: config.ptz.clone(),
    };

    tracing::info!("🚀 数字卫兵系统启动");
    let mut managers = Vec::new();
    for spec in &config.cameras {
        if !args.cameras.is_empty() && !args.cameras.contains(&spec.name) {
            continue;
        }
        tracing::info!(
            camera = %spec.name,
            source = %spec.source,
            task = spec.task.as_str(),
            "📹 注册摄像头"
        );
        let manager = Arc::new(ConnectionManager::new(spec.clone(), &services)?);
        spawn_display(&manager, &args.output_dir)?;
        spawn_event_table(&manager, args.rows)?;
        if let Err(e) = manager.connect() {
            tracing::error!(camera = %spec.name, "连接失败: {}", e);
        }
        managers.push(manager);
    }

    if managers.is_empty() {
        anyhow::bail!("没有可用的摄像头");
    }

    println!("命令: <camera> connect|disconnect|toggle|up|down|left|right|wiper|zoom_in|zoom_out|zoom <0-100>|stop|events|stats, quit");
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            [] => continue,
            ["quit"] | ["exit"] => break,
            [camera, rest @ ..] => match managers.iter().find(|m| m.camera() == *camera) {
                Some(manager) => handle_command(manager, rest, args.rows),
                None => println!("未知摄像头: {}", camera),
            },
        }
    }

    for manager in &managers {
        manager.disconnect();
    }
    tracing::info!("👋 已退出");
    Ok(())
}

fn handle_command(manager: &ConnectionManager, words: &[&str], rows: usize) {
    match words {
        ["connect"] => {
            if let Err(e) = manager.connect() {
                println!("连接失败: {}", e);
            }
        }
        ["disconnect"] => manager.disconnect(),
        ["toggle"] => println!("{}: {}", manager.camera(), manager.toggle()),
        ["events"] => print_events(manager, rows),
        ["stats"] => match manager.stats() {
            Some(stats) => println!("{}", serde_json::to_string(&stats).unwrap_or_default()),
            None => println!("{}: {}", manager.camera(), manager.state()),
        },
        [command, rest @ ..] => {
            let Some(ptz) = manager.ptz() else {
                println!("{} 不支持云台控制", manager.camera());
                return;
            };
            match (*command, rest) {
                ("stop", []) => ptz.stop_all(),
                ("zoom", [level]) => match level.parse::<i64>() {
                    Ok(level) => ptz.set_zoom(level),
                    Err(_) => println!("无效的变焦值: {}", level),
                },
                (action, []) => match action.parse::<PtzAction>() {
                    Ok(action) => match ptz.toggle(action) {
                        Some(active) => println!("{} {}: {}", manager.camera(), action, active),
                        None => println!("{} 不支持 {}", manager.camera(), action),
                    },
                    Err(e) => println!("{}", e),
                },
                _ => println!("无效命令"),
            }
        }
        [] => {}
    }
}

/// 最新画面覆盖写入文件
fn spawn_display(manager: &Arc<ConnectionManager>, output_dir: &Path) -> std::io::Result<()> {
    let frames = manager.frames();
    let path = output_dir.join(format!("{}.jpg", manager.camera()));
    std::thread::Builder::new()
        .name(format!("display-{}", manager.camera()))
        .spawn(move || {
            for frame in frames {
                if let Err(e) = std::fs::write(&path, &frame.jpeg) {
                    tracing::warn!(path = %path.display(), "写入画面失败: {}", e);
                }
            }
        })?;
    Ok(())
}

/// 有新事件时刷新事件表
fn spawn_event_table(manager: &Arc<ConnectionManager>, rows: usize) -> std::io::Result<()> {
    let events = manager.events();
    let manager = Arc::downgrade(manager);
    std::thread::Builder::new()
        .name("event-table".to_string())
        .spawn(move || {
            while events.recv().is_ok() {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                print_events(&manager, rows);
            }
        })?;
    Ok(())
}

fn print_events(manager: &ConnectionManager, rows: usize) {
    let records = match manager.fetch_latest(rows) {
        Ok(records) => records,
        Err(e) => {
            tracing::warn!(camera = %manager.camera(), "读取事件失败: {}", e);
            return;
        }
    };
    let padded = pad_rows(records, rows, manager.spec().task == TaskKind::Anpr);
    match serde_json::to_string(&padded) {
        Ok(json) => println!("📋 {} {}", manager.camera(), json),
        Err(e) => tracing::warn!("序列化事件失败: {}", e),
    }
}

/// 不足的行用 "--" 补齐
fn pad_rows(mut records: Vec<EventRecord>, rows: usize, with_plate: bool) -> Vec<EventRecord> {
    while records.len() < rows {
        records.push(EventRecord {
            time: "--".to_string(),
            id: "--".to_string(),
            object_type: "--".to_string(),
            license_number: with_plate.then(|| "--".to_string()),
        });
    }
    records
}
