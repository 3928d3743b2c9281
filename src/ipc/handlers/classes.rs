use crate::attendance::DEFAULT_LATE_THRESHOLD_MINUTES;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveTime;
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_classes_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.conn() else {
        return ok(&req.id, json!({ "classes": [] }));
    };

    // Include roster/scan counts so the shell can render a dashboard without
    // extra round trips. Correlated subqueries avoid join double-counting.
    let mut stmt = match conn.prepare(
        "SELECT
           c.id,
           c.name,
           c.owner,
           c.late_threshold_minutes,
           c.scheduled_start,
           c.utc_offset_minutes,
           (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id) AS student_count,
           (SELECT COUNT(*) FROM check_ins ci WHERE ci.class_id = c.id) AS check_in_count
         FROM classes c
         ORDER BY c.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let owner: Option<String> = row.get(2)?;
            let late_threshold_minutes: i64 = row.get(3)?;
            let scheduled_start: Option<String> = row.get(4)?;
            let utc_offset_minutes: i64 = row.get(5)?;
            let student_count: i64 = row.get(6)?;
            let check_in_count: i64 = row.get(7)?;
            Ok(json!({
                "id": id,
                "name": name,
                "owner": owner,
                "lateThresholdMinutes": late_threshold_minutes,
                "scheduledStart": scheduled_start,
                "utcOffsetMinutes": utc_offset_minutes,
                "studentCount": student_count,
                "checkInCount": check_in_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(classes) => ok(&req.id, json!({ "classes": classes })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_classes_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.conn() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing name", None),
    };
    if name.is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }
    let owner = req
        .params
        .get("owner")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let class_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO classes(id, name, owner, late_threshold_minutes) VALUES(?, ?, ?, ?)",
        (&class_id, &name, &owner, DEFAULT_LATE_THRESHOLD_MINUTES),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "classes" })),
        );
    }

    ok(
        &req.id,
        json!({
            "classId": class_id,
            "name": name,
            "lateThresholdMinutes": DEFAULT_LATE_THRESHOLD_MINUTES
        }),
    )
}

fn handle_classes_set_config(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.conn() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [&class_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "class not found", None);
    }

    // Partial patch: absent fields keep their current value; an explicit
    // null clears the scheduled start. Threshold edits affect the next
    // recomputation pass only, stored summaries are never rewritten.
    if let Some(v) = req.params.get("lateThresholdMinutes") {
        let Some(minutes) = v.as_i64().filter(|m| *m >= 0) else {
            return err(
                &req.id,
                "bad_params",
                "lateThresholdMinutes must be a non-negative integer",
                None,
            );
        };
        if let Err(e) = conn.execute(
            "UPDATE classes SET late_threshold_minutes = ? WHERE id = ?",
            (minutes, &class_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    if let Some(v) = req.params.get("scheduledStart") {
        if v.is_null() {
            if let Err(e) = conn.execute(
                "UPDATE classes SET scheduled_start = NULL WHERE id = ?",
                [&class_id],
            ) {
                return err(&req.id, "db_update_failed", e.to_string(), None);
            }
        } else {
            let Some(raw) = v.as_str() else {
                return err(
                    &req.id,
                    "bad_params",
                    "scheduledStart must be \"HH:MM\" or null",
                    None,
                );
            };
            if NaiveTime::parse_from_str(raw, "%H:%M").is_err() {
                return err(
                    &req.id,
                    "bad_params",
                    format!("scheduledStart not HH:MM: {}", raw),
                    None,
                );
            }
            if let Err(e) = conn.execute(
                "UPDATE classes SET scheduled_start = ? WHERE id = ?",
                (raw, &class_id),
            ) {
                return err(&req.id, "db_update_failed", e.to_string(), None);
            }
        }
    }

    if let Some(v) = req.params.get("utcOffsetMinutes") {
        let Some(offset) = v.as_i64() else {
            return err(
                &req.id,
                "bad_params",
                "utcOffsetMinutes must be an integer",
                None,
            );
        };
        if let Err(e) = conn.execute(
            "UPDATE classes SET utc_offset_minutes = ? WHERE id = ?",
            (offset, &class_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    let row = conn
        .query_row(
            "SELECT late_threshold_minutes, scheduled_start, utc_offset_minutes
             FROM classes WHERE id = ?",
            [&class_id],
            |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, Option<String>>(1)?,
                    r.get::<_, i64>(2)?,
                ))
            },
        );
    match row {
        Ok((threshold, start, offset)) => ok(
            &req.id,
            json!({
                "classId": class_id,
                "lateThresholdMinutes": threshold,
                "scheduledStart": start,
                "utcOffsetMinutes": offset
            }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_classes_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.conn() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [&class_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "class not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Dependency order; no ON DELETE CASCADE in the schema.
    for (table, sql) in [
        (
            "status_overrides",
            "DELETE FROM status_overrides WHERE class_id = ?",
        ),
        ("check_ins", "DELETE FROM check_ins WHERE class_id = ?"),
        ("students", "DELETE FROM students WHERE class_id = ?"),
        ("classes", "DELETE FROM classes WHERE id = ?"),
    ] {
        if let Err(e) = tx.execute(sql, [&class_id]) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": table })),
            );
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.list" => Some(handle_classes_list(state, req)),
        "classes.create" => Some(handle_classes_create(state, req)),
        "classes.setConfig" => Some(handle_classes_set_config(state, req)),
        "classes.delete" => Some(handle_classes_delete(state, req)),
        _ => None,
    }
}
