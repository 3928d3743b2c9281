use crate::attendance::{
    apply_filter, build_report, process_day, AbsenceFilter, CheckIn, CheckInFeed, ClassConfig,
    DayStatus, TimestampValue,
};
use crate::ipc::error::{db_err, err, ok, HandlerErr};
use crate::ipc::types::{AppState, Request};
use chrono::{NaiveDate, NaiveTime};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

fn load_config(conn: &Connection, class_id: &str) -> Result<ClassConfig, HandlerErr> {
    let row = conn
        .query_row(
            "SELECT late_threshold_minutes, scheduled_start, utc_offset_minutes
             FROM classes WHERE id = ?",
            [class_id],
            |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, Option<String>>(1)?,
                    r.get::<_, i64>(2)?,
                ))
            },
        )
        .optional()
        .map_err(db_err)?;
    let Some((late_threshold_minutes, scheduled_start, utc_offset_minutes)) = row else {
        return Err(HandlerErr::new("not_found", "class not found"));
    };
    Ok(ClassConfig {
        late_threshold_minutes,
        scheduled_start: scheduled_start
            .as_deref()
            .and_then(|s| NaiveTime::parse_from_str(s, "%H:%M").ok()),
        utc_offset_minutes,
    })
}

fn load_roster(
    conn: &Connection,
    class_id: &str,
) -> Result<Vec<crate::attendance::RosterEntry>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT student_no, name
             FROM students
             WHERE class_id = ?
             ORDER BY sort_order",
        )
        .map_err(db_err)?;
    stmt.query_map([class_id], |r| {
        Ok(crate::attendance::RosterEntry {
            student_no: r.get(0)?,
            name: r.get(1)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(db_err)
}

fn load_check_ins(
    conn: &Connection,
    class_id: &str,
    date: Option<&str>,
) -> Result<Vec<CheckIn>, HandlerErr> {
    let mut sql = String::from(
        "SELECT student_no, name, email, checked_at, date
         FROM check_ins
         WHERE class_id = ?",
    );
    if date.is_some() {
        sql.push_str(" AND date = ?");
    }
    sql.push_str(" ORDER BY date, checked_at, id");

    let mut stmt = conn.prepare(&sql).map_err(db_err)?;
    let map_row = |r: &rusqlite::Row<'_>| {
        Ok(CheckIn {
            student_no: r.get(0)?,
            name: r.get(1)?,
            email: r.get(2)?,
            checked_at: TimestampValue::Iso(r.get(3)?),
            date: r.get(4)?,
        })
    };
    match date {
        Some(d) => stmt
            .query_map((class_id, d), map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
        None => stmt
            .query_map([class_id], map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
    }
    .map_err(db_err)
}

fn load_overrides(
    conn: &Connection,
    class_id: &str,
) -> Result<HashMap<(String, String), DayStatus>, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT date, student_no, status FROM status_overrides WHERE class_id = ?")
        .map_err(db_err)?;
    let rows = stmt
        .query_map([class_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let mut overrides = HashMap::new();
    for (date, student_no, status) in rows {
        // Unknown status text is routed around, not fatal.
        let status = match status.as_str() {
            "present" => DayStatus::Present,
            "late" => DayStatus::Late,
            _ => continue,
        };
        overrides.insert((date, student_no), status);
    }
    Ok(overrides)
}

fn parse_filter(params: &serde_json::Value) -> Result<AbsenceFilter, HandlerErr> {
    let Some(raw) = params.get("filter") else {
        return Ok(AbsenceFilter::All);
    };
    if raw.is_null() {
        return Ok(AbsenceFilter::All);
    }
    serde_json::from_value(raw.clone()).map_err(|_| {
        HandlerErr::new(
            "bad_params",
            "filter must be one of \"all\", \"absent-1\", \"absent-2\", \"absent-3+\"",
        )
    })
}

fn parse_session_dates(
    params: &serde_json::Value,
) -> Result<Option<BTreeSet<NaiveDate>>, HandlerErr> {
    let Some(raw) = params.get("dates") else {
        return Ok(None);
    };
    if raw.is_null() {
        return Ok(None);
    }
    let Some(items) = raw.as_array() else {
        return Err(HandlerErr::new(
            "bad_params",
            "dates must be an array of YYYY-MM-DD strings",
        ));
    };
    let mut dates = BTreeSet::new();
    for item in items {
        let parsed = item
            .as_str()
            .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok());
        let Some(date) = parsed else {
            return Err(HandlerErr::new(
                "bad_params",
                format!("bad session date: {}", item),
            ));
        };
        dates.insert(date);
    }
    Ok(Some(dates))
}

fn to_json<T: serde::Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

/// Full recomputation pass for one class: read the current snapshot, run the
/// pipeline, return the replacement result. Each call is independent, so
/// repeated or out-of-order invocations from the shell are harmless.
fn summary_open(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let filter = parse_filter(params)?;
    let session_dates = parse_session_dates(params)?;

    let config = load_config(conn, &class_id)?;
    let roster = load_roster(conn, &class_id)?;
    let check_ins = load_check_ins(conn, &class_id, None)?;
    let overrides = load_overrides(conn, &class_id)?;

    let report = build_report(
        &roster,
        CheckInFeed::Flat(check_ins),
        &overrides,
        &config,
        session_dates.as_ref(),
    );
    let filtered = apply_filter(&report.summaries, filter);

    Ok(json!({
        "classId": class_id,
        "totalClassDays": report.total_class_days,
        "filter": to_json(&filter),
        "summaries": to_json(&filtered),
        "pie": to_json(&report.charts.pie),
        "bar": to_json(&report.charts.bar),
        "totals": to_json(&report.charts.totals)
    }))
}

fn summary_day(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let date_key = get_required_str(params, "date")?;
    let date = NaiveDate::parse_from_str(&date_key, "%Y-%m-%d").map_err(|_| {
        HandlerErr::new("bad_params", format!("date must be YYYY-MM-DD: {}", date_key))
    })?;

    let config = load_config(conn, &class_id)?;
    let records = load_check_ins(conn, &class_id, Some(&date_key))?;
    let day_overrides: HashMap<String, DayStatus> = load_overrides(conn, &class_id)?
        .into_iter()
        .filter(|((d, _), _)| *d == date_key)
        .map(|((_, student_no), status)| (student_no, status))
        .collect();

    let statuses = process_day(date, &records, &config, &day_overrides);
    let entries: Vec<serde_json::Value> = statuses.values().map(|s| to_json(s)).collect();

    Ok(json!({
        "classId": class_id,
        "date": date_key,
        "entries": entries
    }))
}

/// Write the merged summaries as CSV for the export collaborators; the rows
/// carry exactly the summary shape the charts consume.
fn summary_export_csv(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let out_path = PathBuf::from(get_required_str(params, "outPath")?);

    let config = load_config(conn, &class_id)?;
    let roster = load_roster(conn, &class_id)?;
    let check_ins = load_check_ins(conn, &class_id, None)?;
    let overrides = load_overrides(conn, &class_id)?;
    let report = build_report(
        &roster,
        CheckInFeed::Flat(check_ins),
        &overrides,
        &config,
        None,
    );

    let io_err = |e: csv::Error| {
        HandlerErr::with_details(
            "io_failed",
            e.to_string(),
            json!({ "path": out_path.to_string_lossy() }),
        )
    };

    let mut writer = csv::Writer::from_path(&out_path).map_err(io_err)?;
    writer
        .write_record([
            "student_no",
            "name",
            "days_present",
            "on_time",
            "late",
            "absent",
            "last_attendance",
        ])
        .map_err(io_err)?;
    for s in &report.summaries {
        writer
            .write_record([
                s.student_no.as_str(),
                s.name.as_str(),
                &s.count.to_string(),
                &s.on_time_count.to_string(),
                &s.late_count.to_string(),
                &s.absent_days.to_string(),
                s.last_attendance.as_deref().unwrap_or(""),
            ])
            .map_err(io_err)?;
    }
    writer.flush().map_err(|e| {
        HandlerErr::with_details(
            "io_failed",
            e.to_string(),
            json!({ "path": out_path.to_string_lossy() }),
        )
    })?;

    Ok(json!({
        "outPath": out_path.to_string_lossy(),
        "rows": report.summaries.len()
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
        "summary.open" => Some(with_db(state, req, summary_open)),
        "summary.day" => Some(with_db(state, req, summary_day)),
        "summary.exportCsv" => Some(with_db(state, req, summary_export_csv)),
        _ => None,
    }
}
