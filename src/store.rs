//! 事件存储 (SQLite)
//!
//! 每路摄像头一张表, 表名即摄像头名称:
//! `(Time TEXT, ID TEXT, Type TEXT[, LicenseNumber TEXT])`
//!
//! 写入来自各路推理线程, 读取来自刷新线程, 统一经由一把互斥锁串行化。

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::config::TaskKind;
use crate::detection::DetectionEvent;
use crate::error::{Error, Result};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// 写入结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// 同一ID或同一车牌已存在, 跳过
    Duplicate,
}

/// 表中一行记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventRecord {
    pub time: String,
    pub id: String,
    pub object_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license_number: Option<String>,
}

struct StoreInner {
    conn: Connection,
    tables: HashMap<String, TaskKind>,
}

pub struct EventStore {
    inner: Mutex<StoreInner>,
}

impl EventStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        tracing::info!(path = %path.as_ref().display(), "事件库已打开");
        Ok(Self::with_connection(conn))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::with_connection(Connection::open_in_memory()?))
    }

    fn with_connection(conn: Connection) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                conn,
                tables: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        // 写入线程 panic 不应让其他摄像头失去存储
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 建表 (若不存在) 并清空旧记录
    pub fn ensure_schema(&self, camera: &str, task: TaskKind) -> Result<()> {
        let mut inner = self.lock();
        let table = quote_ident(camera);

        let columns = if task == TaskKind::Anpr {
            "Time TEXT, ID TEXT, Type TEXT, LicenseNumber TEXT"
        } else {
            "Time TEXT, ID TEXT, Type TEXT"
        };
        inner.conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} ({columns});
             DELETE FROM {table};"
        ))?;
        inner.tables.insert(camera.to_string(), task);

        tracing::debug!(camera, task = task.as_str(), "事件表已重置");
        Ok(())
    }

    /// 追加一条事件; ANPR 表按 ID / 车牌去重
    pub fn insert(&self, camera: &str, event: &DetectionEvent) -> Result<InsertOutcome> {
        let inner = self.lock();
        let task = *inner
            .tables
            .get(camera)
            .ok_or_else(|| Error::Config(format!("摄像头 {} 的事件表未初始化", camera)))?;
        let table = quote_ident(camera);
        let time = event.timestamp.format(TIME_FORMAT).to_string();
        let id = event.id_text();

        if task == TaskKind::Anpr {
            let exists: Option<i64> = inner
                .conn
                .query_row(
                    &format!(
                        "SELECT 1 FROM {table}
                         WHERE (?1 != '' AND ID = ?1) OR (?2 != '' AND LicenseNumber = ?2)
                         LIMIT 1"
                    ),
                    params![id, event.plate],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_some() {
                tracing::debug!(camera, id = %id, plate = %event.plate, "重复事件, 跳过");
                return Ok(InsertOutcome::Duplicate);
            }

            inner.conn.execute(
                &format!("INSERT INTO {table} (Time, ID, Type, LicenseNumber) VALUES (?1, ?2, ?3, ?4)"),
                params![time, id, event.object_type, event.plate],
            )?;
        } else {
            inner.conn.execute(
                &format!("INSERT INTO {table} (Time, ID, Type) VALUES (?1, ?2, ?3)"),
                params![time, id, event.object_type],
            )?;
        }

        tracing::info!(camera, id = %id, object = %event.object_type, plate = %event.plate, "事件已记录");
        Ok(InsertOutcome::Inserted)
    }

    /// 最新的 n 条记录, 新的在前
    pub fn fetch_latest(&self, camera: &str, n: usize) -> Result<Vec<EventRecord>> {
        let inner = self.lock();
        let Some(&task) = inner.tables.get(camera) else {
            return Ok(Vec::new());
        };
        let table = quote_ident(camera);
        let anpr = task == TaskKind::Anpr;

        let columns = if anpr {
            "Time, ID, Type, LicenseNumber"
        } else {
            "Time, ID, Type"
        };
        let mut stmt = inner.conn.prepare(&format!(
            "SELECT {columns} FROM {table} ORDER BY ROWID DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![n as i64], |row| {
            Ok(EventRecord {
                time: row.get(0)?,
                id: row.get(1)?,
                object_type: row.get(2)?,
                license_number: if anpr { row.get(3)? } else { None },
            })
        })?;

        let records = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    pub fn count(&self, camera: &str) -> Result<usize> {
        let inner = self.lock();
        if !inner.tables.contains_key(camera) {
            return Ok(0);
        }
        let n: i64 = inner.conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", quote_ident(camera)),
            [],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }
}

/// SQL 标识符转义
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
