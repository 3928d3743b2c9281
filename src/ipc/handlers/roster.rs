use crate::ipc::error::{db_err, err, ok, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::roster::parse_roster_csv;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::path::PathBuf;
use uuid::Uuid;

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

fn require_class(conn: &Connection, class_id: &str) -> Result<(), HandlerErr> {
    let exists = conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [class_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(db_err)?
        .is_some();
    if exists {
        Ok(())
    } else {
        Err(HandlerErr::new("not_found", "class not found"))
    }
}

fn roster_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    require_class(conn, &class_id)?;

    let mut stmt = conn
        .prepare(
            "SELECT id, student_no, name, sort_order
             FROM students
             WHERE class_id = ?
             ORDER BY sort_order",
        )
        .map_err(db_err)?;
    let students = stmt
        .query_map([&class_id], |r| {
            let id: String = r.get(0)?;
            let student_no: String = r.get(1)?;
            let name: String = r.get(2)?;
            let sort_order: i64 = r.get(3)?;
            Ok(json!({
                "id": id,
                "studentNo": student_no,
                "name": name,
                "sortOrder": sort_order
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    Ok(json!({ "students": students }))
}

fn next_sort_order(conn: &Connection, class_id: &str) -> Result<i64, HandlerErr> {
    conn.query_row(
        "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM students WHERE class_id = ?",
        [class_id],
        |r| r.get(0),
    )
    .map_err(db_err)
}

fn roster_add(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let student_no = get_required_str(params, "studentNo")?;
    let name = get_required_str(params, "name")?;
    require_class(conn, &class_id)?;

    let sort_order = next_sort_order(conn, &class_id)?;
    let student_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, class_id, student_no, name, sort_order)
         VALUES(?, ?, ?, ?, ?)",
        (&student_id, &class_id, &student_no, &name, sort_order),
    )
    .map_err(|e| {
        HandlerErr::with_details("db_insert_failed", e.to_string(), json!({ "table": "students" }))
    })?;

    Ok(json!({
        "studentId": student_id,
        "studentNo": student_no,
        "name": name
    }))
}

fn roster_rename(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let student_no = get_required_str(params, "studentNo")?;
    let name = get_required_str(params, "name")?;
    require_class(conn, &class_id)?;

    let changed = conn
        .execute(
            "UPDATE students SET name = ? WHERE class_id = ? AND student_no = ?",
            (&name, &class_id, &student_no),
        )
        .map_err(|e| {
            HandlerErr::with_details(
                "db_update_failed",
                e.to_string(),
                json!({ "table": "students" }),
            )
        })?;
    if changed == 0 {
        return Err(HandlerErr::new("not_found", "student not on roster"));
    }

    Ok(json!({ "studentNo": student_no, "name": name }))
}

fn roster_import_csv(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let path = PathBuf::from(get_required_str(params, "path")?);
    require_class(conn, &class_id)?;

    let rows = parse_roster_csv(&path).map_err(|e| {
        HandlerErr::with_details(
            "csv_parse_failed",
            format!("{e:#}"),
            json!({ "path": path.to_string_lossy() }),
        )
    })?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    let mut imported = 0_i64;
    let mut updated = 0_i64;
    let mut sort_order = next_sort_order(&tx, &class_id)?;
    for row in rows {
        let existing: Option<String> = tx
            .query_row(
                "SELECT id FROM students WHERE class_id = ? AND student_no = ?",
                (&class_id, &row.student_no),
                |r| r.get(0),
            )
            .optional()
            .map_err(db_err)?;
        match existing {
            Some(student_id) => {
                // Re-upload is a name correction, never a duplicate row.
                tx.execute(
                    "UPDATE students SET name = ? WHERE id = ?",
                    (&row.name, &student_id),
                )
                .map_err(|e| {
                    HandlerErr::with_details(
                        "db_update_failed",
                        e.to_string(),
                        json!({ "table": "students" }),
                    )
                })?;
                updated += 1;
            }
            None => {
                tx.execute(
                    "INSERT INTO students(id, class_id, student_no, name, sort_order)
                     VALUES(?, ?, ?, ?, ?)",
                    (
                        Uuid::new_v4().to_string(),
                        &class_id,
                        &row.student_no,
                        &row.name,
                        sort_order,
                    ),
                )
                .map_err(|e| {
                    HandlerErr::with_details(
                        "db_insert_failed",
                        e.to_string(),
                        json!({ "table": "students" }),
                    )
                })?;
                sort_order += 1;
                imported += 1;
            }
        }
    }

    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "imported": imported, "updated": updated }))
}

fn with_db(
    state: &mut AppState,
    req: &Request,
    f: impl FnOnce(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let Some(conn) = state.conn() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "roster.list" => Some(with_db(state, req, roster_list)),
        "roster.add" => Some(with_db(state, req, roster_add)),
        "roster.rename" => Some(with_db(state, req, roster_rename)),
        "roster.importCsv" => Some(with_db(state, req, roster_import_csv)),
        _ => None,
    }
}
