//! The persistent device inventory.
//!
//! All writes go through a single mutex-guarded connection, serializing
//! access without relying on thread-local state. Upserts are
//! last-write-wins: the merge key for devices is `ip_address`, for ports
//! `(device_id, port_number, protocol)`, and every field of the new
//! observation overwrites the stored row, null included.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};

use netpulse_core::types::{
    Device, DeviceObservation, Event, NewEvent, NewScanRecord, NewScanTask, Port, PortObservation,
    ScanRecord, ScanTask, Severity, TaskStatus,
};

use crate::error::{Result, StoreError};
use crate::schema;

/// SQLite-backed inventory of devices, ports, tasks, results, and events.
pub struct DeviceStore {
    conn: Mutex<Connection>,
}

impl DeviceStore {
    /// Open (or create) the inventory database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        schema::initialize(&conn)?;
        tracing::debug!(path = %path.display(), "Inventory database opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("store mutex poisoned")
    }

    // ── Devices ──────────────────────────────────────────────────

    /// Insert or update a device, matched strictly by `ip_address`.
    ///
    /// On insert, `first_seen = last_seen = now`. On conflict, every
    /// observation field overwrites the stored value (nulls included)
    /// and `last_seen` is refreshed. Returns the device id.
    pub fn upsert_device(&self, obs: &DeviceObservation) -> Result<i64> {
        let now = Utc::now();
        let metadata = serde_json::to_string(&obs.metadata)?;
        let conn = self.conn();

        conn.execute(
            "INSERT INTO devices (
                ip_address, mac_address, hostname, vendor, oui,
                device_type, os_name, os_family, os_version, os_accuracy,
                status, first_seen, last_seen, metadata
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12, ?13)
            ON CONFLICT(ip_address) DO UPDATE SET
                mac_address = excluded.mac_address,
                hostname = excluded.hostname,
                vendor = excluded.vendor,
                oui = excluded.oui,
                device_type = excluded.device_type,
                os_name = excluded.os_name,
                os_family = excluded.os_family,
                os_version = excluded.os_version,
                os_accuracy = excluded.os_accuracy,
                status = excluded.status,
                is_active = 1,
                last_seen = excluded.last_seen,
                metadata = excluded.metadata",
            params![
                obs.ip_address,
                obs.mac_address,
                obs.hostname,
                obs.vendor,
                obs.oui,
                obs.device_type,
                obs.os_name,
                obs.os_family,
                obs.os_version,
                obs.os_accuracy,
                obs.status,
                now,
                metadata,
            ],
        )?;

        let id = conn.query_row(
            "SELECT id FROM devices WHERE ip_address = ?1",
            params![obs.ip_address],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn get_device(&self, id: i64) -> Result<Option<Device>> {
        self.conn()
            .query_row(
                "SELECT * FROM devices WHERE id = ?1",
                params![id],
                device_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn get_device_by_ip(&self, ip: &str) -> Result<Option<Device>> {
        self.conn()
            .query_row(
                "SELECT * FROM devices WHERE ip_address = ?1",
                params![ip],
                device_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    /// List devices, most recently seen first.
    pub fn list_devices(&self, active_only: bool) -> Result<Vec<Device>> {
        let conn = self.conn();
        let sql = if active_only {
            "SELECT * FROM devices WHERE is_active = 1 ORDER BY last_seen DESC"
        } else {
            "SELECT * FROM devices ORDER BY last_seen DESC"
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map([], device_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    // ── Ports ────────────────────────────────────────────────────

    /// Insert or update a port, matched by
    /// `(device_id, port_number, protocol)`. Last-write-wins; refreshes
    /// `last_seen`.
    pub fn upsert_port(&self, device_id: i64, port: &PortObservation) -> Result<()> {
        let now = Utc::now();
        self.conn().execute(
            "INSERT INTO ports (
                device_id, port_number, protocol, state,
                service_name, service_product, service_version, service_extrainfo,
                last_seen
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(device_id, port_number, protocol) DO UPDATE SET
                state = excluded.state,
                service_name = excluded.service_name,
                service_product = excluded.service_product,
                service_version = excluded.service_version,
                service_extrainfo = excluded.service_extrainfo,
                last_seen = excluded.last_seen",
            params![
                device_id,
                port.port_number,
                port.protocol,
                port.state,
                port.service_name,
                port.service_product,
                port.service_version,
                port.service_extrainfo,
                now,
            ],
        )?;
        Ok(())
    }

    /// All ports for a device, ordered by port number.
    pub fn device_ports(&self, device_id: i64) -> Result<Vec<Port>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT * FROM ports WHERE device_id = ?1 ORDER BY port_number")?;
        let rows = stmt.query_map(params![device_id], port_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    // ── Scan tasks ───────────────────────────────────────────────

    /// Create a new scan task with status `pending`.
    pub fn create_task(&self, task: &NewScanTask) -> Result<i64> {
        let now = Utc::now();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO scan_tasks (task_type, target, scan_options, status, priority, created_at, scheduled_at)
             VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6)",
            params![
                task.task_type.as_str(),
                task.target,
                task.scan_options,
                task.priority,
                now,
                task.scheduled_at,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_task(&self, id: i64) -> Result<Option<ScanTask>> {
        self.conn()
            .query_row(
                "SELECT * FROM scan_tasks WHERE id = ?1",
                params![id],
                task_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Recent tasks, newest first.
    pub fn list_tasks(&self, limit: usize) -> Result<Vec<ScanTask>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT * FROM scan_tasks ORDER BY created_at DESC, id DESC LIMIT ?1")?;
        let rows = stmt.query_map(params![limit as i64], task_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Due pending tasks: `scheduled_at` absent or elapsed, highest
    /// priority first, then oldest first.
    pub fn pending_tasks(&self, limit: usize) -> Result<Vec<ScanTask>> {
        let now = Utc::now();
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM scan_tasks
             WHERE status = 'pending' AND (scheduled_at IS NULL OR scheduled_at <= ?1)
             ORDER BY priority DESC, created_at ASC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![now, limit as i64], task_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Transition a task `pending → running`, stamping `started_at`.
    ///
    /// Returns false if the task was not in `pending` (the state machine
    /// is monotonic; no other transition into `running` exists).
    pub fn mark_task_running(&self, id: i64) -> Result<bool> {
        let now = Utc::now();
        let changed = self.conn().execute(
            "UPDATE scan_tasks SET status = 'running', started_at = ?1
             WHERE id = ?2 AND status = 'pending'",
            params![now, id],
        )?;
        Ok(changed == 1)
    }

    /// Transition a task `running → {completed, failed}`, stamping
    /// `completed_at`. Returns false unless the task was `running`.
    pub fn mark_task_finished(
        &self,
        id: i64,
        status: TaskStatus,
        error: Option<&str>,
    ) -> Result<bool> {
        debug_assert!(status.is_terminal());
        let now = Utc::now();
        let changed = self.conn().execute(
            "UPDATE scan_tasks SET status = ?1, completed_at = ?2, error = ?3
             WHERE id = ?4 AND status = 'running'",
            params![status.as_str(), now, error, id],
        )?;
        Ok(changed == 1)
    }

    // ── Scan results ─────────────────────────────────────────────

    /// Append an immutable scan result record.
    pub fn save_scan_record(&self, record: &NewScanRecord) -> Result<i64> {
        let now = Utc::now();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO scan_results (
                task_id, scan_type, target, start_time, end_time, duration,
                hosts_up, hosts_down, hosts_total,
                command_line, tool_version, raw_output, structured_output, summary,
                created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                record.task_id,
                record.scan_type.as_str(),
                record.target,
                record.start_time,
                record.end_time,
                record.duration,
                record.hosts_up,
                record.hosts_down,
                record.hosts_total,
                record.command_line,
                record.tool_version,
                record.raw_output,
                record.structured_output,
                record.summary,
                now,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Recent scan records, newest first.
    pub fn list_scan_records(&self, limit: usize) -> Result<Vec<ScanRecord>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT * FROM scan_results ORDER BY created_at DESC, id DESC LIMIT ?1")?;
        let rows = stmt.query_map(params![limit as i64], record_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    // ── Events ───────────────────────────────────────────────────

    /// Append an event.
    pub fn create_event(&self, event: &NewEvent) -> Result<i64> {
        let now = Utc::now();
        let metadata = serde_json::to_string(&event.metadata)?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO events (event_type, severity, device_id, title, description, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                event.event_type,
                event.severity.as_str(),
                event.device_id,
                event.title,
                event.description,
                metadata,
                now,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Recent events, newest first, optionally filtered by severity.
    pub fn list_events(&self, limit: usize, severity: Option<Severity>) -> Result<Vec<Event>> {
        let conn = self.conn();
        match severity {
            Some(sev) => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM events WHERE severity = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![sev.as_str(), limit as i64], event_from_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
            }
            None => {
                let mut stmt = conn
                    .prepare("SELECT * FROM events ORDER BY created_at DESC, id DESC LIMIT ?1")?;
                let rows = stmt.query_map(params![limit as i64], event_from_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
            }
        }
    }

    // ── Runtime configuration ────────────────────────────────────

    pub fn get_value(&self, key: &str) -> Result<Option<String>> {
        self.conn()
            .query_row(
                "SELECT value FROM configuration WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn set_value(&self, key: &str, value: &str, description: Option<&str>) -> Result<()> {
        let now = Utc::now();
        self.conn().execute(
            "INSERT INTO configuration (key, value, description, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at",
            params![key, value, description, now],
        )?;
        Ok(())
    }

    // ── OUI cache ────────────────────────────────────────────────

    /// Look up a vendor by OUI prefix (uppercase hex, no separators).
    pub fn oui_vendor(&self, oui: &str) -> Result<Option<String>> {
        self.conn()
            .query_row(
                "SELECT vendor FROM oui_cache WHERE oui = ?1",
                params![oui.to_uppercase()],
                |row| row.get(0),
            )
            .optional()
            .map_err(Into::into)
    }

    /// Replace-or-insert a batch of `(oui, vendor)` pairs in one
    /// transaction. Returns the number of entries written.
    pub fn bulk_insert_oui(&self, entries: &[(String, String)]) -> Result<usize> {
        let now = Utc::now();
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO oui_cache (oui, vendor, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(oui) DO UPDATE SET
                    vendor = excluded.vendor,
                    updated_at = excluded.updated_at",
            )?;
            for (oui, vendor) in entries {
                stmt.execute(params![oui.to_uppercase(), vendor, now])?;
            }
        }
        tx.commit()?;
        Ok(entries.len())
    }
}

// ── Row mapping ───────────────────────────────────────────────────

fn parse_json(raw: String) -> serde_json::Value {
    serde_json::from_str(&raw).unwrap_or(serde_json::Value::Null)
}

fn device_from_row(row: &Row<'_>) -> rusqlite::Result<Device> {
    Ok(Device {
        id: row.get("id")?,
        ip_address: row.get("ip_address")?,
        mac_address: row.get("mac_address")?,
        hostname: row.get("hostname")?,
        vendor: row.get("vendor")?,
        oui: row.get("oui")?,
        device_type: row.get("device_type")?,
        os_name: row.get("os_name")?,
        os_family: row.get("os_family")?,
        os_version: row.get("os_version")?,
        os_accuracy: row.get("os_accuracy")?,
        status: row.get("status")?,
        is_active: row.get::<_, i64>("is_active")? != 0,
        first_seen: row.get("first_seen")?,
        last_seen: row.get("last_seen")?,
        metadata: parse_json(row.get("metadata")?),
    })
}

fn port_from_row(row: &Row<'_>) -> rusqlite::Result<Port> {
    Ok(Port {
        id: row.get("id")?,
        device_id: row.get("device_id")?,
        port_number: row.get("port_number")?,
        protocol: row.get("protocol")?,
        state: row.get("state")?,
        service_name: row.get("service_name")?,
        service_product: row.get("service_product")?,
        service_version: row.get("service_version")?,
        service_extrainfo: row.get("service_extrainfo")?,
        last_seen: row.get("last_seen")?,
    })
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<ScanTask> {
    Ok(ScanTask {
        id: row.get("id")?,
        task_type: parse_enum(row, "task_type")?,
        target: row.get("target")?,
        scan_options: row.get("scan_options")?,
        status: parse_enum(row, "status")?,
        priority: row.get("priority")?,
        created_at: row.get("created_at")?,
        scheduled_at: row.get("scheduled_at")?,
        started_at: row.get("started_at")?,
        completed_at: row.get("completed_at")?,
        error: row.get("error")?,
    })
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<ScanRecord> {
    Ok(ScanRecord {
        id: row.get("id")?,
        task_id: row.get("task_id")?,
        scan_type: parse_enum(row, "scan_type")?,
        target: row.get("target")?,
        start_time: row.get("start_time")?,
        end_time: row.get("end_time")?,
        duration: row.get("duration")?,
        hosts_up: row.get("hosts_up")?,
        hosts_down: row.get("hosts_down")?,
        hosts_total: row.get("hosts_total")?,
        command_line: row.get("command_line")?,
        tool_version: row.get("tool_version")?,
        raw_output: row.get("raw_output")?,
        structured_output: row.get("structured_output")?,
        summary: row.get("summary")?,
        created_at: row.get("created_at")?,
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<Event> {
    let severity: String = row.get("severity")?;
    let severity = match severity.as_str() {
        "warning" => Severity::Warning,
        "critical" => Severity::Critical,
        _ => Severity::Info,
    };
    Ok(Event {
        id: row.get("id")?,
        event_type: row.get("event_type")?,
        severity,
        device_id: row.get("device_id")?,
        title: row.get("title")?,
        description: row.get("description")?,
        metadata: parse_json(row.get("metadata")?),
        created_at: row.get("created_at")?,
    })
}

fn parse_enum<T: std::str::FromStr<Err = String>>(
    row: &Row<'_>,
    column: &str,
) -> rusqlite::Result<T> {
    let raw: String = row.get(column)?;
    raw.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(StoreError::InvalidValue(e)),
        )
    })
}
