//! SQLite schema for the NetPulse inventory.
//!
//! All statements are idempotent (`IF NOT EXISTS`) so initialization can
//! run on every startup.

use rusqlite::Connection;

use crate::error::Result;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS devices (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ip_address TEXT NOT NULL UNIQUE,
    mac_address TEXT,
    hostname TEXT,
    vendor TEXT,
    oui TEXT,
    device_type TEXT,
    os_name TEXT,
    os_family TEXT,
    os_version TEXT,
    os_accuracy INTEGER,
    status TEXT NOT NULL DEFAULT 'up',
    is_active INTEGER NOT NULL DEFAULT 1,
    first_seen TEXT NOT NULL,
    last_seen TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS ports (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id INTEGER NOT NULL,
    port_number INTEGER NOT NULL,
    protocol TEXT NOT NULL DEFAULT 'tcp',
    state TEXT NOT NULL,
    service_name TEXT,
    service_product TEXT,
    service_version TEXT,
    service_extrainfo TEXT,
    last_seen TEXT NOT NULL,
    UNIQUE(device_id, port_number, protocol),
    FOREIGN KEY(device_id) REFERENCES devices(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS scan_tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_type TEXT NOT NULL,
    target TEXT NOT NULL,
    scan_options TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    priority INTEGER NOT NULL DEFAULT 5,
    created_at TEXT NOT NULL,
    scheduled_at TEXT,
    started_at TEXT,
    completed_at TEXT,
    error TEXT
);

CREATE TABLE IF NOT EXISTS scan_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id INTEGER,
    scan_type TEXT NOT NULL,
    target TEXT NOT NULL,
    start_time TEXT,
    end_time TEXT,
    duration REAL NOT NULL DEFAULT 0,
    hosts_up INTEGER NOT NULL DEFAULT 0,
    hosts_down INTEGER NOT NULL DEFAULT 0,
    hosts_total INTEGER NOT NULL DEFAULT 0,
    command_line TEXT,
    tool_version TEXT,
    raw_output TEXT,
    structured_output TEXT,
    summary TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type TEXT NOT NULL,
    severity TEXT NOT NULL DEFAULT 'info',
    device_id INTEGER,
    title TEXT NOT NULL,
    description TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS configuration (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    key TEXT NOT NULL UNIQUE,
    value TEXT NOT NULL,
    description TEXT,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS oui_cache (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    oui TEXT NOT NULL UNIQUE,
    vendor TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_devices_last_seen ON devices(last_seen);
CREATE INDEX IF NOT EXISTS idx_ports_device ON ports(device_id);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON scan_tasks(status);
CREATE INDEX IF NOT EXISTS idx_events_severity ON events(severity);
CREATE INDEX IF NOT EXISTS idx_results_created ON scan_results(created_at);
"#;

/// Create all tables and indexes, and enable foreign key enforcement
/// for the connection.
pub fn initialize(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.execute_batch(SCHEMA)?;
    Ok(())
}
