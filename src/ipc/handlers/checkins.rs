use crate::attendance::{DayStatus, TimestampValue};
use crate::ipc::error::{db_err, err, ok, HandlerErr};
use crate::ipc::types::{AppState, Request};
use chrono::{Duration, NaiveDate};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

fn class_utc_offset(conn: &Connection, class_id: &str) -> Result<i64, HandlerErr> {
    conn.query_row(
        "SELECT utc_offset_minutes FROM classes WHERE id = ?",
        [class_id],
        |r| r.get(0),
    )
    .optional()
    .map_err(db_err)?
    .ok_or_else(|| HandlerErr::new("not_found", "class not found"))
}

fn parse_date_key(raw: &str) -> Result<NaiveDate, HandlerErr> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| HandlerErr::new("bad_params", format!("date must be YYYY-MM-DD: {}", raw)))
}

fn checkins_record(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let student_no = get_required_str(params, "studentNo")?;
    let name = get_required_str(params, "name")?;
    let email = params
        .get("email")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let offset_minutes = class_utc_offset(conn, &class_id)?;

    let Some(raw_ts) = params.get("timestamp") else {
        return Err(HandlerErr::new("bad_params", "missing timestamp"));
    };
    let Some(ts_value) = TimestampValue::from_json(raw_ts) else {
        return Err(HandlerErr::new(
            "invalid_timestamp",
            "timestamp must be an ISO string, epoch millis, or {seconds, nanoseconds}",
        ));
    };
    let checked_at = ts_value
        .resolve()
        .map_err(|e| HandlerErr::new("invalid_timestamp", e.message))?;

    // The calendar-day key is derived from the scan instant shifted into the
    // class's configured zone, unless the shell already decided the key.
    let date = match params.get("date").and_then(|v| v.as_str()) {
        Some(raw) => parse_date_key(raw)?.format("%Y-%m-%d").to_string(),
        None => (checked_at + Duration::minutes(offset_minutes))
            .date()
            .format("%Y-%m-%d")
            .to_string(),
    };

    let check_in_id = Uuid::new_v4().to_string();
    let checked_at_text = checked_at.format("%Y-%m-%dT%H:%M:%S").to_string();
    conn.execute(
        "INSERT INTO check_ins(id, class_id, student_no, name, email, checked_at, date)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &check_in_id,
            &class_id,
            &student_no,
            &name,
            &email,
            &checked_at_text,
            &date,
        ),
    )
    .map_err(|e| {
        HandlerErr::with_details(
            "db_insert_failed",
            e.to_string(),
            json!({ "table": "check_ins" }),
        )
    })?;

    Ok(json!({
        "checkInId": check_in_id,
        "studentNo": student_no,
        "date": date,
        "checkedAt": checked_at_text
    }))
}

fn checkins_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let _ = class_utc_offset(conn, &class_id)?;
    let date = match params.get("date").and_then(|v| v.as_str()) {
        Some(raw) => Some(parse_date_key(raw)?.format("%Y-%m-%d").to_string()),
        None => None,
    };

    let mut sql = String::from(
        "SELECT id, student_no, name, email, checked_at, date
         FROM check_ins
         WHERE class_id = ?",
    );
    if date.is_some() {
        sql.push_str(" AND date = ?");
    }
    sql.push_str(" ORDER BY date, checked_at, id");

    let mut stmt = conn.prepare(&sql).map_err(db_err)?;
    let map_row = |r: &rusqlite::Row<'_>| {
        let id: String = r.get(0)?;
        let student_no: String = r.get(1)?;
        let name: String = r.get(2)?;
        let email: Option<String> = r.get(3)?;
        let checked_at: String = r.get(4)?;
        let date: String = r.get(5)?;
        Ok(json!({
            "id": id,
            "studentNo": student_no,
            "name": name,
            "email": email,
            "checkedAt": checked_at,
            "date": date
        }))
    };
    let rows = match &date {
        Some(d) => stmt
            .query_map((&class_id, d), map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
        None => stmt
            .query_map([&class_id], map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
    }
    .map_err(db_err)?;

    Ok(json!({ "checkIns": rows }))
}

fn parse_status(raw: &str) -> Result<DayStatus, HandlerErr> {
    match raw {
        "present" => Ok(DayStatus::Present),
        "late" => Ok(DayStatus::Late),
        _ => Err(HandlerErr::new(
            "bad_params",
            format!("status must be \"present\" or \"late\": {}", raw),
        )),
    }
}

/// Owner override of one student's derived status for one day. This rewrites
/// the source outcome; every later summary recomputation picks it up, and
/// summaries already handed to the shell are left alone.
fn checkins_set_status(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let student_no = get_required_str(params, "studentNo")?;
    let date = parse_date_key(&get_required_str(params, "date")?)?
        .format("%Y-%m-%d")
        .to_string();
    let status = parse_status(&get_required_str(params, "status")?)?;
    let _ = class_utc_offset(conn, &class_id)?;

    let has_check_in = conn
        .query_row(
            "SELECT 1 FROM check_ins WHERE class_id = ? AND date = ? AND student_no = ? LIMIT 1",
            (&class_id, &date, &student_no),
            |r| r.get::<_, i64>(0),
        )
        .optional()
        .map_err(db_err)?
        .is_some();
    if !has_check_in {
        return Err(HandlerErr::new(
            "not_found",
            "no check-in recorded for that student and date",
        ));
    }

    let status_text = match status {
        DayStatus::Present => "present",
        DayStatus::Late => "late",
    };
    conn.execute(
        "INSERT INTO status_overrides(class_id, date, student_no, status)
         VALUES(?, ?, ?, ?)
         ON CONFLICT(class_id, date, student_no) DO UPDATE SET
           status = excluded.status",
        (&class_id, &date, &student_no, status_text),
    )
    .map_err(|e| {
        HandlerErr::with_details(
            "db_update_failed",
            e.to_string(),
            json!({ "table": "status_overrides" }),
        )
    })?;

    Ok(json!({
        "classId": class_id,
        "date": date,
        "studentNo": student_no,
        "status": status_text
    }))
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
        "checkins.record" => Some(with_db(state, req, checkins_record)),
        "checkins.list" => Some(with_db(state, req, checkins_list)),
        "checkins.setStatus" => Some(with_db(state, req, checkins_set_status)),
        _ => None,
    }
}
