use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("rollcall.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            owner TEXT,
            late_threshold_minutes INTEGER NOT NULL DEFAULT 15
        )",
        [],
    )?;
    // Existing workspaces may predate the schedule/timezone settings. Add
    // the columns when missing.
    ensure_classes_schedule_columns(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            student_no TEXT NOT NULL,
            name TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            UNIQUE(class_id, student_no),
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class_sort ON students(class_id, sort_order)",
        [],
    )?;

    // Duplicate scans per (class, date, student) are allowed at rest; the
    // summary pipeline collapses them on read.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS check_ins(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            student_no TEXT NOT NULL,
            name TEXT NOT NULL,
            email TEXT,
            checked_at TEXT NOT NULL,
            date TEXT NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_check_ins_class ON check_ins(class_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_check_ins_class_date ON check_ins(class_id, date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS status_overrides(
            class_id TEXT NOT NULL,
            date TEXT NOT NULL,
            student_no TEXT NOT NULL,
            status TEXT NOT NULL,
            PRIMARY KEY(class_id, date, student_no),
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_status_overrides_class ON status_overrides(class_id)",
        [],
    )?;

    Ok(conn)
}

fn ensure_classes_schedule_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "classes", "scheduled_start")? {
        conn.execute("ALTER TABLE classes ADD COLUMN scheduled_start TEXT", [])?;
    }
    if !table_has_column(conn, "classes", "utc_offset_minutes")? {
        conn.execute(
            "ALTER TABLE classes ADD COLUMN utc_offset_minutes INTEGER NOT NULL DEFAULT 0",
            [],
        )?;
    }
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
