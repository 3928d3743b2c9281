use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

pub const DEFAULT_LATE_THRESHOLD_MINUTES: i64 = 15;

pub const ON_TIME_COLOR: &str = "#22c55e";
pub const LATE_COLOR: &str = "#f59e0b";
pub const ABSENT_COLOR: &str = "#ef4444";

#[derive(Debug, Clone, Serialize)]
pub struct ReportError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ReportError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }
}

/// Timestamp shapes accepted at the ingestion boundary. The shell may hand
/// us an ISO-8601 string, epoch milliseconds, or the remote store's
/// `{seconds, nanoseconds}` object. Everything else is an unrecognized kind
/// and the record carrying it gets dropped from aggregation, never a crash.
#[derive(Debug, Clone, PartialEq)]
pub enum TimestampValue {
    Iso(String),
    EpochMillis(i64),
    Remote { seconds: i64, nanos: u32 },
}

impl TimestampValue {
    pub fn from_json(v: &serde_json::Value) -> Option<Self> {
        if let Some(s) = v.as_str() {
            return Some(TimestampValue::Iso(s.to_string()));
        }
        if let Some(n) = v.as_i64() {
            return Some(TimestampValue::EpochMillis(n));
        }
        if let Some(obj) = v.as_object() {
            let seconds = obj.get("seconds").and_then(|s| s.as_i64())?;
            let nanos = obj
                .get("nanoseconds")
                .or_else(|| obj.get("nanos"))
                .and_then(|n| n.as_u64())
                .unwrap_or(0) as u32;
            return Some(TimestampValue::Remote { seconds, nanos });
        }
        None
    }

    /// Resolve to a naive UTC datetime. Callers treat an error as "cannot
    /// classify this record" and exclude it from the day's aggregation.
    pub fn resolve(&self) -> Result<NaiveDateTime, ReportError> {
        match self {
            TimestampValue::Iso(s) => {
                if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
                    return Ok(dt.naive_utc());
                }
                if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
                    return Ok(dt);
                }
                Err(ReportError::new(
                    "invalid_timestamp",
                    format!("unparseable timestamp string: {}", s),
                ))
            }
            TimestampValue::EpochMillis(ms) => chrono::DateTime::from_timestamp_millis(*ms)
                .map(|dt| dt.naive_utc())
                .ok_or_else(|| {
                    ReportError::new("invalid_timestamp", format!("epoch millis out of range: {}", ms))
                }),
            TimestampValue::Remote { seconds, nanos } => {
                chrono::DateTime::from_timestamp(*seconds, *nanos)
                    .map(|dt| dt.naive_utc())
                    .ok_or_else(|| {
                        ReportError::new(
                            "invalid_timestamp",
                            format!("remote timestamp out of range: {}s", seconds),
                        )
                    })
            }
        }
    }
}

/// Per-day outcome for a student who scanned in. Absence is represented by
/// absence from the day's map, not by a third variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DayStatus {
    Present,
    Late,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    pub student_no: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckIn {
    pub student_no: String,
    pub name: String,
    pub email: Option<String>,
    pub checked_at: TimestampValue,
    /// Calendar day key, "YYYY-MM-DD", derived at record time with the
    /// class's configured UTC offset.
    pub date: String,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassConfig {
    pub late_threshold_minutes: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_start: Option<NaiveTime>,
    pub utc_offset_minutes: i64,
}

impl Default for ClassConfig {
    fn default() -> Self {
        Self {
            late_threshold_minutes: DEFAULT_LATE_THRESHOLD_MINUTES,
            scheduled_start: None,
            utc_offset_minutes: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyStatus {
    pub student_no: String,
    pub name: String,
    pub status: DayStatus,
    pub checked_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentSummary {
    pub student_no: String,
    pub name: String,
    /// Days attended at all: on-time plus late.
    pub count: i64,
    pub on_time_count: i64,
    pub late_count: i64,
    pub absent_days: i64,
    pub last_attendance: Option<String>,
    /// False for entries synthesized from check-ins that arrived before the
    /// roster upload did.
    pub on_roster: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PieSlice {
    pub label: String,
    pub color: String,
    pub value: i64,
    pub percent: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BarDatum {
    pub name: String,
    pub student_no: String,
    pub on_time: i64,
    pub late: i64,
    pub absent: i64,
    pub total: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportTotals {
    pub on_time: i64,
    pub late: i64,
    pub absent: i64,
    pub students: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartModel {
    pub pie: Vec<PieSlice>,
    pub bar: Vec<BarDatum>,
    pub totals: ReportTotals,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceReport {
    pub total_class_days: i64,
    pub summaries: Vec<StudentSummary>,
    pub charts: ChartModel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AbsenceFilter {
    #[default]
    #[serde(rename = "all")]
    All,
    #[serde(rename = "absent-1")]
    AbsentExactlyOne,
    #[serde(rename = "absent-2")]
    AbsentExactlyTwo,
    #[serde(rename = "absent-3+")]
    AbsentThreeOrMore,
}

/// Check-in snapshots arrive from the shell either as a flat list or as the
/// nested per-date shape `{date: {studentNo: record}}`. Nested input is
/// flattened before any aggregation runs.
#[derive(Debug, Clone)]
pub enum CheckInFeed {
    Flat(Vec<CheckIn>),
    Nested(BTreeMap<String, BTreeMap<String, CheckIn>>),
}

pub fn flatten_feed(feed: CheckInFeed) -> Vec<CheckIn> {
    match feed {
        CheckInFeed::Flat(records) => records,
        CheckInFeed::Nested(by_date) => {
            let mut flat = Vec::new();
            for (date, by_student) in by_date {
                for (student_no, mut record) in by_student {
                    // The outer keys are authoritative for the nested shape.
                    record.date = date.clone();
                    record.student_no = student_no;
                    flat.push(record);
                }
            }
            flat
        }
    }
}

/// On-time vs. late for one retained check-in. The anchor is supplied by the
/// caller (scheduled start, or the day's earliest scan); checking in before
/// the anchor is on-time, never a negative-late anomaly.
pub fn classify(
    check_in: NaiveDateTime,
    class_start: NaiveDateTime,
    late_threshold_minutes: i64,
) -> DayStatus {
    let delta = check_in.signed_duration_since(class_start);
    if delta.num_seconds() <= late_threshold_minutes * 60 {
        DayStatus::Present
    } else {
        DayStatus::Late
    }
}

/// One calendar day: resolve timestamps, collapse duplicate scans, classify.
///
/// Duplicate scans for one student collapse to the earliest timestamp
/// (first-scan-wins; equal timestamps keep the first record in input order).
/// Records with unrecognized timestamps are excluded. Status overrides, when
/// present for a (date, student) pair, replace the derived status.
///
/// Classification runs in the class's local frame: the scheduled start is a
/// local wall-clock time, so stored UTC instants are shifted by
/// `utc_offset_minutes` before the comparison. Reported `checked_at` stays
/// UTC.
pub fn process_day(
    date: NaiveDate,
    records: &[CheckIn],
    config: &ClassConfig,
    overrides: &HashMap<String, DayStatus>,
) -> BTreeMap<String, DailyStatus> {
    let mut retained: BTreeMap<String, (&CheckIn, NaiveDateTime)> = BTreeMap::new();
    for record in records {
        let Ok(ts) = record.checked_at.resolve() else {
            continue;
        };
        match retained.get(&record.student_no) {
            Some((_, best)) if *best <= ts => {}
            _ => {
                retained.insert(record.student_no.clone(), (record, ts));
            }
        }
    }

    let offset = Duration::minutes(config.utc_offset_minutes);
    let anchor = match config.scheduled_start {
        Some(start) => Some(date.and_time(start)),
        None => retained.values().map(|(_, ts)| *ts + offset).min(),
    };
    let Some(anchor) = anchor else {
        return BTreeMap::new();
    };

    retained
        .into_iter()
        .map(|(student_no, (record, ts))| {
            let derived = classify(ts + offset, anchor, config.late_threshold_minutes);
            let status = overrides.get(&student_no).copied().unwrap_or(derived);
            (
                student_no.clone(),
                DailyStatus {
                    student_no,
                    name: record.name.clone(),
                    status,
                    checked_at: ts,
                },
            )
        })
        .collect()
}

/// Merge the authoritative roster with the derived per-day statuses.
///
/// Every roster student appears exactly once even with zero check-ins.
/// Students seen in the derived maps but missing from the roster are
/// synthesized from the name recorded at scan time rather than dropped,
/// which guards against check-ins landing before the roster upload.
pub fn merge_roster(
    roster: &[RosterEntry],
    per_date: &BTreeMap<NaiveDate, BTreeMap<String, DailyStatus>>,
    total_class_days: i64,
) -> Vec<StudentSummary> {
    struct Tally {
        name: String,
        on_time: i64,
        late: i64,
        last: Option<NaiveDate>,
        on_roster: bool,
    }

    let mut order: Vec<String> = Vec::new();
    let mut tallies: HashMap<String, Tally> = HashMap::new();
    for entry in roster {
        if tallies.contains_key(&entry.student_no) {
            continue;
        }
        order.push(entry.student_no.clone());
        tallies.insert(
            entry.student_no.clone(),
            Tally {
                name: entry.name.clone(),
                on_time: 0,
                late: 0,
                last: None,
                on_roster: true,
            },
        );
    }

    for (date, by_student) in per_date {
        for (student_no, status) in by_student {
            let tally = tallies.entry(student_no.clone()).or_insert_with(|| {
                order.push(student_no.clone());
                Tally {
                    name: status.name.clone(),
                    on_time: 0,
                    late: 0,
                    last: None,
                    on_roster: false,
                }
            });
            match status.status {
                DayStatus::Present => tally.on_time += 1,
                DayStatus::Late => tally.late += 1,
            }
            if tally.last.map(|d| d < *date).unwrap_or(true) {
                tally.last = Some(*date);
            }
            // Synthesized entries track the most recent recorded name.
            if !tally.on_roster {
                tally.name = status.name.clone();
            }
        }
    }

    let mut summaries: Vec<StudentSummary> = order
        .into_iter()
        .filter_map(|student_no| {
            let tally = tallies.remove(&student_no)?;
            let count = tally.on_time + tally.late;
            Some(StudentSummary {
                student_no,
                name: tally.name,
                count,
                on_time_count: tally.on_time,
                late_count: tally.late,
                absent_days: (total_class_days - count).max(0),
                last_attendance: tally.last.map(|d| d.format("%Y-%m-%d").to_string()),
                on_roster: tally.on_roster,
            })
        })
        .collect();

    // Most attendance first; name then student number break ties so repeated
    // runs over the same snapshot produce identical output.
    summaries.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then_with(|| a.name.cmp(&b.name))
            .then_with(|| a.student_no.cmp(&b.student_no))
    });
    summaries
}

fn percent_of(value: i64, total: i64) -> i64 {
    if total <= 0 {
        return 0;
    }
    (100.0 * value as f64 / total as f64).round() as i64
}

/// Chart-ready breakdowns over the merged summaries.
pub fn aggregate(summaries: &[StudentSummary]) -> ChartModel {
    let on_time: i64 = summaries.iter().map(|s| s.on_time_count).sum();
    let late: i64 = summaries.iter().map(|s| s.late_count).sum();
    let absent: i64 = summaries.iter().map(|s| s.absent_days).sum();
    let slice_total = on_time + late + absent;

    let pie = vec![
        PieSlice {
            label: "On time".to_string(),
            color: ON_TIME_COLOR.to_string(),
            value: on_time,
            percent: percent_of(on_time, slice_total),
        },
        PieSlice {
            label: "Late".to_string(),
            color: LATE_COLOR.to_string(),
            value: late,
            percent: percent_of(late, slice_total),
        },
        PieSlice {
            label: "Absent".to_string(),
            color: ABSENT_COLOR.to_string(),
            value: absent,
            percent: percent_of(absent, slice_total),
        },
    ];

    let bar = summaries
        .iter()
        .map(|s| BarDatum {
            name: s.name.clone(),
            student_no: s.student_no.clone(),
            on_time: s.on_time_count,
            late: s.late_count,
            absent: s.absent_days,
            total: s.on_time_count + s.late_count + s.absent_days,
        })
        .collect();

    ChartModel {
        pie,
        bar,
        totals: ReportTotals {
            on_time,
            late,
            absent,
            students: summaries.len() as i64,
        },
    }
}

pub fn apply_filter(summaries: &[StudentSummary], filter: AbsenceFilter) -> Vec<StudentSummary> {
    summaries
        .iter()
        .filter(|s| match filter {
            AbsenceFilter::All => true,
            AbsenceFilter::AbsentExactlyOne => s.absent_days == 1,
            AbsenceFilter::AbsentExactlyTwo => s.absent_days == 2,
            AbsenceFilter::AbsentThreeOrMore => s.absent_days >= 3,
        })
        .cloned()
        .collect()
}

/// Full recomputation pass over one snapshot: flatten, key by date, process
/// each day, merge against the roster, aggregate. Stateless and idempotent;
/// each realtime push from the shell reruns this from scratch.
///
/// `session_dates`, when supplied, replaces the observed-date derivation:
/// only listed dates are processed and `total_class_days` is the list length.
/// Otherwise a class day is any date with at least one classifiable check-in.
pub fn build_report(
    roster: &[RosterEntry],
    feed: CheckInFeed,
    overrides: &HashMap<(String, String), DayStatus>,
    config: &ClassConfig,
    session_dates: Option<&BTreeSet<NaiveDate>>,
) -> AttendanceReport {
    let mut by_date: BTreeMap<NaiveDate, Vec<CheckIn>> = BTreeMap::new();
    for record in flatten_feed(feed) {
        let Ok(date) = NaiveDate::parse_from_str(&record.date, "%Y-%m-%d") else {
            continue;
        };
        if let Some(sessions) = session_dates {
            if !sessions.contains(&date) {
                continue;
            }
        }
        by_date.entry(date).or_default().push(record);
    }

    let mut per_date: BTreeMap<NaiveDate, BTreeMap<String, DailyStatus>> = BTreeMap::new();
    for (date, records) in &by_date {
        let date_key = date.format("%Y-%m-%d").to_string();
        let day_overrides: HashMap<String, DayStatus> = overrides
            .iter()
            .filter(|((d, _), _)| *d == date_key)
            .map(|((_, student_no), status)| (student_no.clone(), *status))
            .collect();
        let statuses = process_day(*date, records, config, &day_overrides);
        if !statuses.is_empty() {
            per_date.insert(*date, statuses);
        }
    }

    let total_class_days = match session_dates {
        Some(sessions) => sessions.len() as i64,
        None => per_date.len() as i64,
    };

    let summaries = merge_roster(roster, &per_date, total_class_days);
    let charts = aggregate(&summaries);
    AttendanceReport {
        total_class_days,
        summaries,
        charts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iso(s: &str) -> TimestampValue {
        TimestampValue::Iso(s.to_string())
    }

    fn check_in(student_no: &str, name: &str, ts: TimestampValue, date: &str) -> CheckIn {
        CheckIn {
            student_no: student_no.to_string(),
            name: name.to_string(),
            email: None,
            checked_at: ts,
            date: date.to_string(),
        }
    }

    fn roster(entries: &[(&str, &str)]) -> Vec<RosterEntry> {
        entries
            .iter()
            .map(|(no, name)| RosterEntry {
                student_no: no.to_string(),
                name: name.to_string(),
            })
            .collect()
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").expect("test date")
    }

    #[test]
    fn timestamp_kinds_resolve_to_same_instant() {
        let from_iso = iso("2025-01-01T09:00:00Z").resolve().expect("iso");
        let from_millis = TimestampValue::EpochMillis(1735722000000)
            .resolve()
            .expect("millis");
        let from_remote = TimestampValue::Remote {
            seconds: 1735722000,
            nanos: 0,
        }
        .resolve()
        .expect("remote");
        assert_eq!(from_iso, from_millis);
        assert_eq!(from_iso, from_remote);
    }

    #[test]
    fn unrecognized_timestamp_shapes_are_rejected() {
        assert!(TimestampValue::from_json(&serde_json::json!(true)).is_none());
        assert!(TimestampValue::from_json(&serde_json::json!(["x"])).is_none());
        assert!(TimestampValue::from_json(&serde_json::json!({"foo": 1})).is_none());
        let err = iso("not a timestamp").resolve().expect_err("bad iso");
        assert_eq!(err.code, "invalid_timestamp");
    }

    #[test]
    fn early_check_in_is_present_not_negative_late() {
        let start = iso("2025-01-01T09:00:00Z").resolve().unwrap();
        let early = iso("2025-01-01T08:40:00Z").resolve().unwrap();
        assert_eq!(classify(early, start, 15), DayStatus::Present);
    }

    #[test]
    fn classification_boundary_is_inclusive() {
        let start = iso("2025-01-01T09:00:00Z").resolve().unwrap();
        let at_threshold = iso("2025-01-01T09:15:00Z").resolve().unwrap();
        let past_threshold = iso("2025-01-01T09:15:01Z").resolve().unwrap();
        assert_eq!(classify(at_threshold, start, 15), DayStatus::Present);
        assert_eq!(classify(past_threshold, start, 15), DayStatus::Late);
    }

    #[test]
    fn duplicate_scans_collapse_to_earliest() {
        let records = vec![
            check_in("S1", "Alice", iso("2025-01-01T09:20:00Z"), "2025-01-01"),
            check_in("S2", "Bob", iso("2025-01-01T09:00:00Z"), "2025-01-01"),
            check_in("S1", "Alice", iso("2025-01-01T09:05:00Z"), "2025-01-01"),
        ];
        let statuses = process_day(
            date("2025-01-01"),
            &records,
            &ClassConfig::default(),
            &HashMap::new(),
        );
        assert_eq!(statuses.len(), 2);
        let s1 = &statuses["S1"];
        assert_eq!(
            s1.checked_at,
            iso("2025-01-01T09:05:00Z").resolve().unwrap()
        );
        // Earliest scan (09:05) is 5 minutes after the day's anchor (09:00).
        assert_eq!(s1.status, DayStatus::Present);
    }

    #[test]
    fn invalid_timestamp_drops_record_not_day() {
        let records = vec![
            check_in("S1", "Alice", iso("garbage"), "2025-01-01"),
            check_in("S2", "Bob", iso("2025-01-01T09:00:00Z"), "2025-01-01"),
        ];
        let statuses = process_day(
            date("2025-01-01"),
            &records,
            &ClassConfig::default(),
            &HashMap::new(),
        );
        assert_eq!(statuses.len(), 1);
        assert!(statuses.contains_key("S2"));
    }

    #[test]
    fn scheduled_start_overrides_earliest_scan_anchor() {
        let config = ClassConfig {
            scheduled_start: Some(NaiveTime::from_hms_opt(9, 0, 0).unwrap()),
            ..ClassConfig::default()
        };
        // Only scan of the day is 20 minutes past the scheduled start; with
        // no schedule it would anchor itself and come out present.
        let records = vec![check_in(
            "S1",
            "Alice",
            iso("2025-01-01T09:20:00Z"),
            "2025-01-01",
        )];
        let statuses = process_day(date("2025-01-01"), &records, &config, &HashMap::new());
        assert_eq!(statuses["S1"].status, DayStatus::Late);
    }

    #[test]
    fn scheduled_start_compares_in_class_local_frame() {
        // UTC+8 class, scheduled 09:00 local. A scan at 01:30Z is 09:30
        // local, 30 minutes past the start; compared in UTC it would look
        // hours early and always come out present.
        let config = ClassConfig {
            scheduled_start: Some(NaiveTime::from_hms_opt(9, 0, 0).unwrap()),
            utc_offset_minutes: 480,
            ..ClassConfig::default()
        };
        let records = vec![
            check_in("S1", "Alice", iso("2025-01-01T01:30:00Z"), "2025-01-01"),
            check_in("S2", "Bob", iso("2025-01-01T00:50:00Z"), "2025-01-01"),
        ];
        let statuses = process_day(date("2025-01-01"), &records, &config, &HashMap::new());
        assert_eq!(statuses["S1"].status, DayStatus::Late);
        // 08:50 local, before the start.
        assert_eq!(statuses["S2"].status, DayStatus::Present);
        // Reported timestamps stay UTC.
        assert_eq!(
            statuses["S1"].checked_at,
            iso("2025-01-01T01:30:00Z").resolve().unwrap()
        );
    }

    #[test]
    fn override_replaces_derived_status() {
        let records = vec![check_in(
            "S1",
            "Alice",
            iso("2025-01-01T09:00:00Z"),
            "2025-01-01",
        )];
        let overrides: HashMap<String, DayStatus> =
            [("S1".to_string(), DayStatus::Late)].into_iter().collect();
        let statuses = process_day(
            date("2025-01-01"),
            &records,
            &ClassConfig::default(),
            &overrides,
        );
        assert_eq!(statuses["S1"].status, DayStatus::Late);
    }

    fn two_day_scenario_feed() -> CheckInFeed {
        CheckInFeed::Flat(vec![
            check_in("S1", "Alice", iso("2025-01-01T09:00:00Z"), "2025-01-01"),
            check_in("S2", "Bob", iso("2025-01-01T09:20:00Z"), "2025-01-01"),
            check_in("S1", "Alice", iso("2025-01-02T09:01:00Z"), "2025-01-02"),
        ])
    }

    #[test]
    fn two_day_scenario_counts_and_pie() {
        let roster = roster(&[("S1", "Alice"), ("S2", "Bob")]);
        let report = build_report(
            &roster,
            two_day_scenario_feed(),
            &HashMap::new(),
            &ClassConfig::default(),
            None,
        );

        assert_eq!(report.total_class_days, 2);
        assert_eq!(report.summaries.len(), 2);

        let s1 = &report.summaries[0];
        assert_eq!(s1.student_no, "S1");
        assert_eq!((s1.count, s1.on_time_count, s1.late_count, s1.absent_days), (2, 2, 0, 0));
        let s2 = &report.summaries[1];
        assert_eq!(s2.student_no, "S2");
        assert_eq!((s2.count, s2.on_time_count, s2.late_count, s2.absent_days), (1, 0, 1, 1));
        assert_eq!(s2.last_attendance.as_deref(), Some("2025-01-01"));

        let pie = &report.charts.pie;
        assert_eq!((pie[0].value, pie[1].value, pie[2].value), (2, 1, 1));
        assert_eq!((pie[0].percent, pie[1].percent, pie[2].percent), (50, 25, 25));
        assert_eq!(report.charts.totals.students, 2);
    }

    #[test]
    fn bar_totals_equal_class_days_for_every_student() {
        let roster = roster(&[("S1", "Alice"), ("S2", "Bob"), ("S3", "Cara")]);
        let report = build_report(
            &roster,
            two_day_scenario_feed(),
            &HashMap::new(),
            &ClassConfig::default(),
            None,
        );
        for datum in &report.charts.bar {
            assert_eq!(datum.total, report.total_class_days, "{}", datum.student_no);
        }
    }

    #[test]
    fn zero_check_in_students_still_appear() {
        let roster = roster(&[("S1", "Alice"), ("S9", "Zoe")]);
        let report = build_report(
            &roster,
            two_day_scenario_feed(),
            &HashMap::new(),
            &ClassConfig::default(),
            None,
        );
        let zoe = report
            .summaries
            .iter()
            .find(|s| s.student_no == "S9")
            .expect("Zoe in output");
        assert_eq!(zoe.count, 0);
        assert_eq!(zoe.absent_days, report.total_class_days);
        assert_eq!(zoe.last_attendance, None);
        assert!(zoe.on_roster);
    }

    #[test]
    fn unrostered_check_ins_are_synthesized_not_dropped() {
        let roster = roster(&[("S1", "Alice")]);
        let report = build_report(
            &roster,
            two_day_scenario_feed(),
            &HashMap::new(),
            &ClassConfig::default(),
            None,
        );
        let bob = report
            .summaries
            .iter()
            .find(|s| s.student_no == "S2")
            .expect("unrostered student surfaces");
        assert_eq!(bob.name, "Bob");
        assert!(!bob.on_roster);
        assert_eq!(bob.count, 1);
    }

    #[test]
    fn pipeline_is_idempotent() {
        let roster = roster(&[("S1", "Alice"), ("S2", "Bob")]);
        let run = || {
            build_report(
                &roster,
                two_day_scenario_feed(),
                &HashMap::new(),
                &ClassConfig::default(),
                None,
            )
        };
        let a = serde_json::to_string(&run()).expect("serialize");
        let b = serde_json::to_string(&run()).expect("serialize");
        assert_eq!(a, b);
    }

    #[test]
    fn threshold_change_flips_status_on_recompute() {
        let roster = roster(&[("S1", "Alice"), ("S2", "Bob")]);
        let feed = || {
            CheckInFeed::Flat(vec![
                check_in("S1", "Alice", iso("2025-01-01T09:00:00Z"), "2025-01-01"),
                check_in("S2", "Bob", iso("2025-01-01T09:10:00Z"), "2025-01-01"),
            ])
        };

        let relaxed = build_report(
            &roster,
            feed(),
            &HashMap::new(),
            &ClassConfig::default(),
            None,
        );
        let bob = relaxed.summaries.iter().find(|s| s.student_no == "S2").unwrap();
        assert_eq!((bob.on_time_count, bob.late_count), (1, 0));

        let strict = build_report(
            &roster,
            feed(),
            &HashMap::new(),
            &ClassConfig {
                late_threshold_minutes: 5,
                ..ClassConfig::default()
            },
            None,
        );
        let bob = strict.summaries.iter().find(|s| s.student_no == "S2").unwrap();
        assert_eq!((bob.on_time_count, bob.late_count), (0, 1));
    }

    #[test]
    fn nested_feed_matches_flat_feed() {
        let roster = roster(&[("S1", "Alice"), ("S2", "Bob")]);
        let mut nested: BTreeMap<String, BTreeMap<String, CheckIn>> = BTreeMap::new();
        for record in match two_day_scenario_feed() {
            CheckInFeed::Flat(v) => v,
            CheckInFeed::Nested(_) => unreachable!(),
        } {
            nested
                .entry(record.date.clone())
                .or_default()
                .insert(record.student_no.clone(), record);
        }

        let flat = build_report(
            &roster,
            two_day_scenario_feed(),
            &HashMap::new(),
            &ClassConfig::default(),
            None,
        );
        let from_nested = build_report(
            &roster,
            CheckInFeed::Nested(nested),
            &HashMap::new(),
            &ClassConfig::default(),
            None,
        );
        assert_eq!(flat, from_nested);
    }

    #[test]
    fn session_date_list_replaces_observed_days() {
        let roster = roster(&[("S1", "Alice"), ("S2", "Bob")]);
        let sessions: BTreeSet<NaiveDate> = ["2025-01-01", "2025-01-02", "2025-01-03"]
            .iter()
            .map(|s| date(s))
            .collect();
        let report = build_report(
            &roster,
            two_day_scenario_feed(),
            &HashMap::new(),
            &ClassConfig::default(),
            Some(&sessions),
        );
        assert_eq!(report.total_class_days, 3);
        let s1 = report.summaries.iter().find(|s| s.student_no == "S1").unwrap();
        assert_eq!(s1.absent_days, 1);
    }

    #[test]
    fn absent_days_never_negative() {
        // One roster student, two observed days, explicit single session day:
        // days attended exceeds the configured day count.
        let roster = roster(&[("S1", "Alice")]);
        let sessions: BTreeSet<NaiveDate> = [date("2025-01-01")].into_iter().collect();
        let feed = CheckInFeed::Flat(vec![check_in(
            "S1",
            "Alice",
            iso("2025-01-01T09:00:00Z"),
            "2025-01-01",
        )]);
        let report = build_report(&roster, feed, &HashMap::new(), &ClassConfig::default(), Some(&sessions));
        assert_eq!(report.summaries[0].absent_days, 0);
    }

    #[test]
    fn empty_class_reports_zero_percentages() {
        let report = build_report(
            &[],
            CheckInFeed::Flat(Vec::new()),
            &HashMap::new(),
            &ClassConfig::default(),
            None,
        );
        assert_eq!(report.total_class_days, 0);
        for slice in &report.charts.pie {
            assert_eq!(slice.value, 0);
            assert_eq!(slice.percent, 0);
        }
    }

    #[test]
    fn sort_is_count_desc_then_name_then_number() {
        let roster = roster(&[("S3", "Cara"), ("S2", "Bob"), ("S1", "Alice"), ("S4", "Bob")]);
        let feed = CheckInFeed::Flat(vec![
            check_in("S3", "Cara", iso("2025-01-01T09:00:00Z"), "2025-01-01"),
        ]);
        let report = build_report(&roster, feed, &HashMap::new(), &ClassConfig::default(), None);
        let order: Vec<&str> = report.summaries.iter().map(|s| s.student_no.as_str()).collect();
        assert_eq!(order, vec!["S3", "S1", "S2", "S4"]);
    }

    #[test]
    fn filter_selects_exact_absence_bands() {
        let make = |no: &str, name: &str, absent: i64| StudentSummary {
            student_no: no.to_string(),
            name: name.to_string(),
            count: 5 - absent,
            on_time_count: 5 - absent,
            late_count: 0,
            absent_days: absent,
            last_attendance: None,
            on_roster: true,
        };
        let summaries = vec![
            make("S1", "Alice", 0),
            make("S2", "Bob", 1),
            make("S3", "Cara", 2),
            make("S4", "Dan", 3),
            make("S5", "Eve", 5),
        ];

        assert_eq!(apply_filter(&summaries, AbsenceFilter::All).len(), 5);
        let one = apply_filter(&summaries, AbsenceFilter::AbsentExactlyOne);
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].student_no, "S2");
        let two = apply_filter(&summaries, AbsenceFilter::AbsentExactlyTwo);
        assert_eq!(two.len(), 1);
        assert_eq!(two[0].student_no, "S3");
        let three_plus = apply_filter(&summaries, AbsenceFilter::AbsentThreeOrMore);
        let nos: Vec<&str> = three_plus.iter().map(|s| s.student_no.as_str()).collect();
        assert_eq!(nos, vec!["S4", "S5"]);
    }

    #[test]
    fn filter_on_two_day_scenario_returns_single_absence() {
        let roster = roster(&[("S1", "Alice"), ("S2", "Bob")]);
        let report = build_report(
            &roster,
            two_day_scenario_feed(),
            &HashMap::new(),
            &ClassConfig::default(),
            None,
        );
        let filtered = apply_filter(&report.summaries, AbsenceFilter::AbsentExactlyOne);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].student_no, "S2");
    }

    #[test]
    fn filter_mode_round_trips_through_serde() {
        for (tag, mode) in [
            ("all", AbsenceFilter::All),
            ("absent-1", AbsenceFilter::AbsentExactlyOne),
            ("absent-2", AbsenceFilter::AbsentExactlyTwo),
            ("absent-3+", AbsenceFilter::AbsentThreeOrMore),
        ] {
            let parsed: AbsenceFilter =
                serde_json::from_value(serde_json::json!(tag)).expect("parse filter tag");
            assert_eq!(parsed, mode);
        }
        assert!(serde_json::from_value::<AbsenceFilter>(serde_json::json!("absent-4")).is_err());
    }
}
