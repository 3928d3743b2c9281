use anyhow::{bail, Context};
use std::path::Path;

#[derive(Debug, Clone, PartialEq)]
pub struct RosterRow {
    pub student_no: String,
    pub name: String,
}

fn normalize_header(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter(|c| !matches!(c, '_' | ' ' | '-'))
        .collect::<String>()
        .to_ascii_lowercase()
}

/// Parse an uploaded roster CSV. The header row must name a student-number
/// column ("student_no", "studentId", "id", ...) and a name column; blank
/// rows are skipped and a duplicate student number anywhere in the file is
/// an error, reported with its line number.
pub fn parse_roster_csv(path: &Path) -> anyhow::Result<Vec<RosterRow>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("open roster csv {}", path.display()))?;

    let headers = reader.headers().context("read roster csv header")?.clone();
    let mut no_col: Option<usize> = None;
    let mut name_col: Option<usize> = None;
    for (idx, header) in headers.iter().enumerate() {
        match normalize_header(header).as_str() {
            "studentno" | "studentid" | "no" | "id" => {
                if no_col.is_none() {
                    no_col = Some(idx);
                }
            }
            "name" | "studentname" | "fullname" => {
                if name_col.is_none() {
                    name_col = Some(idx);
                }
            }
            _ => {}
        }
    }
    let Some(no_col) = no_col else {
        bail!("roster csv has no student number column");
    };
    let Some(name_col) = name_col else {
        bail!("roster csv has no name column");
    };

    let mut rows: Vec<RosterRow> = Vec::new();
    // Line 1 is the header.
    for (idx, record) in reader.records().enumerate() {
        let line = idx + 2;
        let record = record.with_context(|| format!("roster csv line {}", line))?;
        if record.iter().all(|f| f.trim().is_empty()) {
            continue;
        }
        let student_no = record.get(no_col).unwrap_or("").trim().to_string();
        let name = record.get(name_col).unwrap_or("").trim().to_string();
        if student_no.is_empty() {
            bail!("roster csv line {}: empty student number", line);
        }
        if name.is_empty() {
            bail!("roster csv line {}: empty name", line);
        }
        if rows.iter().any(|r| r.student_no == student_no) {
            bail!(
                "roster csv line {}: duplicate student number {}",
                line,
                student_no
            );
        }
        rows.push(RosterRow { student_no, name });
    }

    Ok(rows)
}
