//! Output file classification and metrics aggregation.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Extensions of volumetric images, longest first so `.nii.gz` wins over `.gz`.
pub const VOLUMETRIC_EXTENSIONS: &[&str] = &[".nii.gz", ".nii", ".mgz", ".mgh"];

const SEGMENTATION_HINTS: &[&str] = &["seg", "aseg", "aparc", "label", "mask", "parc"];
const REPORT_EXTENSIONS: &[&str] = &[".html", ".pdf", ".svg", ".png"];
const LOG_EXTENSIONS: &[&str] = &[".log", ".out", ".err"];

/// Role of an output file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Volume,
    Segmentation,
    MetricsTable,
    Log,
    Report,
    Other,
}

impl FileKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FileKind::Volume => "volume",
            FileKind::Segmentation => "segmentation",
            FileKind::MetricsTable => "metrics_table",
            FileKind::Log => "log",
            FileKind::Report => "report",
            FileKind::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "volume" => FileKind::Volume,
            "segmentation" => FileKind::Segmentation,
            "metrics_table" => FileKind::MetricsTable,
            "log" => FileKind::Log,
            "report" => FileKind::Report,
            _ => FileKind::Other,
        }
    }
}

/// One file found under a job's output location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFile {
    /// Path relative to the output directory, `/`-separated.
    pub path: String,
    pub size_bytes: u64,
    pub kind: FileKind,
}

impl OutputFile {
    pub fn new(path: impl Into<String>, size_bytes: u64) -> Self {
        let path = path.into();
        let kind = classify(&path);
        Self {
            path,
            size_bytes,
            kind,
        }
    }
}

pub fn is_volumetric(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    VOLUMETRIC_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// Classify a relative output path. First matching rule wins.
pub fn classify(rel_path: &str) -> FileKind {
    let lower = rel_path.to_ascii_lowercase();
    let name = lower.rsplit('/').next().unwrap_or(&lower);
    let dirs: Vec<&str> = lower.split('/').rev().skip(1).collect();

    if is_volumetric(name) {
        return if SEGMENTATION_HINTS.iter().any(|h| name.contains(h)) {
            FileKind::Segmentation
        } else {
            FileKind::Volume
        };
    }
    if name.ends_with(".csv") || name.ends_with(".tsv") || name.ends_with(".stats") {
        return FileKind::MetricsTable;
    }
    if name.ends_with(".json") && (dirs.contains(&"metrics") || name.contains("metrics")) {
        return FileKind::MetricsTable;
    }
    if LOG_EXTENSIONS.iter().any(|ext| name.ends_with(ext)) || dirs.contains(&"logs") {
        return FileKind::Log;
    }
    if REPORT_EXTENSIONS.iter().any(|ext| name.ends_with(ext)) {
        return FileKind::Report;
    }
    FileKind::Other
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Parse one metrics table into a flat JSON object.
///
/// Returns `None` when the content is not a recognisable table.
pub fn parse_metrics(rel_path: &str, content: &str) -> Option<Map<String, Value>> {
    let lower = rel_path.to_ascii_lowercase();
    if lower.ends_with(".json") {
        match serde_json::from_str::<Value>(content).ok()? {
            Value::Object(map) => Some(map),
            _ => None,
        }
    } else if lower.ends_with(".stats") {
        parse_freesurfer_stats(content)
    } else if lower.ends_with(".csv") {
        parse_delimited(content, ',')
    } else if lower.ends_with(".tsv") {
        parse_delimited(content, '\t')
    } else {
        None
    }
}

/// Aggregate every metrics table, keyed by file stem.
pub fn aggregate_metrics<'a, I>(tables: I) -> Map<String, Value>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut out = Map::new();
    for (rel_path, content) in tables {
        if let Some(map) = parse_metrics(rel_path, content) {
            out.insert(metrics_key(rel_path), Value::Object(map));
        }
    }
    out
}

fn metrics_key(rel_path: &str) -> String {
    let name = rel_path.rsplit('/').next().unwrap_or(rel_path);
    name.split('.').next().unwrap_or(name).to_string()
}

fn scalar(raw: &str) -> Value {
    let raw = raw.trim();
    if let Ok(i) = raw.parse::<i64>() {
        return Value::from(i);
    }
    match raw.parse::<f64>() {
        Ok(f) if f.is_finite() => Value::from(f),
        _ => Value::from(raw),
    }
}

/// Two-column tables become key/value pairs; wider tables use the first data
/// row, or one object per row keyed by the first column when there are many.
fn parse_delimited(content: &str, delim: char) -> Option<Map<String, Value>> {
    let mut lines = content.lines().filter(|l| !l.trim().is_empty());
    let header: Vec<&str> = lines.next()?.split(delim).map(str::trim).collect();
    let rows: Vec<Vec<&str>> = lines
        .map(|l| l.split(delim).map(str::trim).collect())
        .collect();
    if rows.is_empty() {
        return None;
    }

    let mut map = Map::new();
    if header.len() == 2 && rows.len() > 1 {
        for row in &rows {
            if let [key, value] = row.as_slice() {
                map.insert((*key).to_string(), scalar(value));
            }
        }
    } else if rows.len() == 1 {
        for (key, value) in header.iter().zip(&rows[0]) {
            map.insert((*key).to_string(), scalar(value));
        }
    } else {
        for row in &rows {
            let Some(first) = row.first() else { continue };
            let mut obj = Map::new();
            for (key, value) in header.iter().zip(row).skip(1) {
                obj.insert((*key).to_string(), scalar(value));
            }
            map.insert((*first).to_string(), Value::Object(obj));
        }
    }
    Some(map)
}

/// FreeSurfer `.stats`: `# Measure` lines plus a `# ColHeaders` table whose
/// `StructName` rows are reported as `Volume_mm3` values.
fn parse_freesurfer_stats(content: &str) -> Option<Map<String, Value>> {
    let mut map = Map::new();
    let mut headers: Vec<&str> = Vec::new();

    for line in content.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("# Measure ") {
            let fields: Vec<&str> = rest.split(',').map(str::trim).collect();
            if fields.len() >= 4 {
                map.insert(fields[1].to_string(), scalar(fields[3]));
            }
        } else if let Some(rest) = line.strip_prefix("# ColHeaders") {
            headers = rest.split_whitespace().collect();
        } else if !line.starts_with('#') && !line.is_empty() && !headers.is_empty() {
            let cols: Vec<&str> = line.split_whitespace().collect();
            let name = headers.iter().position(|h| *h == "StructName");
            let volume = headers
                .iter()
                .position(|h| *h == "Volume_mm3" || *h == "GrayVol");
            if let (Some(n), Some(v)) = (name, volume) {
                if let (Some(name), Some(value)) = (cols.get(n), cols.get(v)) {
                    map.insert((*name).to_string(), scalar(value));
                }
            }
        }
    }
    (!map.is_empty()).then_some(map)
}
