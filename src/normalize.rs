//! Type normalization of fetched row sets.
//!
//! Turns loosely typed driver values into one warehouse-safe [`CellValue`] kind
//! per column. Normalization never fails on data: a column that cannot be
//! converted is cast to text instead.

use crate::error::{Error, Result};
use crate::rowset::{
    CellKind, CellValue, NormalizedColumn, NormalizedRowSet, RowSet, SourceColumn, SourceValue,
    TIMESTAMP_FORMAT,
};
use rust_decimal::prelude::ToPrimitive;
use std::collections::{HashMap, HashSet};
use std::fmt::Write;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Number of non-null values inspected when looking for mixed columns.
pub const MIXED_TYPE_SAMPLE: usize = 100;

/// Text forms that mean "no value" once a column has been cast to text.
const NULL_TEXT_FORMS: [&str; 2] = ["nan", "None"];

/// What happened while normalizing a row set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizeReport {
    /// `(original, renamed)` for every deduplicated column
    pub renamed: Vec<(String, String)>,
    /// Columns forced to text because they mixed numbers and strings
    pub mixed_to_text: Vec<String>,
    /// Columns cast to text after a conversion failure
    pub fallback_to_text: Vec<String>,
}

/// Normalize a fetched row set.
#[instrument(skip(rows), fields(columns = rows.columns().len(), rows = rows.row_count()))]
pub fn normalize(rows: RowSet) -> Result<(NormalizedRowSet, NormalizeReport)> {
    let mut report = NormalizeReport::default();
    let columns = rows.into_columns();

    let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
    let unique = dedup_column_names(&names);
    for (original, renamed) in names.iter().zip(&unique) {
        if original != renamed {
            debug!("Renamed duplicate column {} -> {}", original, renamed);
            report.renamed.push((original.to_string(), renamed.clone()));
        }
    }

    let mut normalized = Vec::with_capacity(columns.len());
    for (column, name) in columns.into_iter().zip(unique) {
        let values = normalize_column(&name, &column, &mut report);
        normalized.push(NormalizedColumn::new(name, values));
    }

    let result = NormalizedRowSet::new(normalized)?;
    Ok((result, report))
}

/// Rename repeated column names: the first keeps its name, the i-th repeat
/// becomes `<name>_<i>`. A suffix already used by another column is skipped.
pub fn dedup_column_names(names: &[&str]) -> Vec<String> {
    let mut taken: HashSet<String> = names.iter().map(|n| n.to_string()).collect();
    let mut seen: HashMap<&str, usize> = HashMap::new();
    names
        .iter()
        .map(|name| {
            let count = seen.entry(name).or_insert(0);
            if *count == 0 {
                *count = 1;
                return name.to_string();
            }
            let mut candidate = format!("{}_{}", name, count);
            while taken.contains(&candidate) {
                *count += 1;
                candidate = format!("{}_{}", name, count);
            }
            *count += 1;
            taken.insert(candidate.clone());
            candidate
        })
        .collect()
}

fn normalize_column(name: &str, column: &SourceColumn, report: &mut NormalizeReport) -> Vec<CellValue> {
    let converted = match column.values.iter().find(|v| !v.is_null()) {
        None => Ok(vec![CellValue::Null; column.values.len()]),
        Some(SourceValue::Binary(_)) | Some(SourceValue::Guid(_)) => Ok(guid_column(&column.values)),
        Some(SourceValue::Decimal(_)) => decimal_column(name, &column.values),
        Some(v) if v.is_temporal() => timestamp_column(name, &column.values),
        Some(_) if is_mixed(&column.values) => {
            debug!("Column {} mixes numbers and text, casting to text", name);
            report.mixed_to_text.push(name.to_string());
            Ok(text_column(&column.values))
        }
        Some(_) => passthrough_column(name, &column.values),
    };

    let values = match converted {
        Ok(values) => values,
        Err(e) => {
            warn!(
                "Column {} ({}) could not be converted, casting to text: {}",
                name, column.type_tag, e
            );
            report.fallback_to_text.push(name.to_string());
            return text_column(&column.values);
        }
    };

    if let Err(e) = ensure_homogeneous(name, &values) {
        warn!("{}; casting column to text", e);
        report.fallback_to_text.push(name.to_string());
        return text_column(&column.values);
    }
    values
}

/// Binary GUIDs use the SQL Server mixed-endian layout.
fn guid_column(values: &[SourceValue]) -> Vec<CellValue> {
    values
        .iter()
        .map(|v| match v {
            SourceValue::Null => CellValue::Null,
            SourceValue::Guid(u) => CellValue::Text(u.hyphenated().to_string()),
            SourceValue::Binary(bytes) => CellValue::Text(guid_text(bytes)),
            other => text_cell(other),
        })
        .collect()
}

/// Decode a little-endian GUID, falling back to hex for anything else.
pub fn guid_text(bytes: &[u8]) -> String {
    match Uuid::from_slice_le(bytes) {
        Ok(uuid) => uuid.hyphenated().to_string(),
        Err(_) => hex(bytes),
    }
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

fn decimal_column(name: &str, values: &[SourceValue]) -> Result<Vec<CellValue>> {
    values
        .iter()
        .map(|v| match v {
            SourceValue::Null => Ok(CellValue::Null),
            SourceValue::Decimal(d) => d
                .to_f64()
                .map(CellValue::Float)
                .ok_or_else(|| Error::cell_conversion(name, format!("decimal {} out of range", d))),
            SourceValue::Int(i) => Ok(CellValue::Float(*i as f64)),
            SourceValue::Float(f) if f.is_nan() => Ok(CellValue::Null),
            SourceValue::Float(f) => Ok(CellValue::Float(*f)),
            other => Err(Error::cell_conversion(
                name,
                format!("unexpected {} value in decimal column", other.kind()),
            )),
        })
        .collect()
}

fn timestamp_column(name: &str, values: &[SourceValue]) -> Result<Vec<CellValue>> {
    values
        .iter()
        .map(|v| match v {
            SourceValue::Null => Ok(CellValue::Null),
            SourceValue::Date(d) => d
                .and_hms_opt(0, 0, 0)
                .map(CellValue::Timestamp)
                .ok_or_else(|| Error::cell_conversion(name, format!("invalid date {}", d))),
            SourceValue::DateTime(dt) => Ok(CellValue::Timestamp(*dt)),
            SourceValue::DateTimeTz(dt) => Ok(CellValue::Timestamp(dt.naive_utc())),
            other => Err(Error::cell_conversion(
                name,
                format!("unexpected {} value in temporal column", other.kind()),
            )),
        })
        .collect()
}

/// A column is mixed when its first non-null samples hold both numeric and
/// non-empty text values.
fn is_mixed(values: &[SourceValue]) -> bool {
    let mut numeric = false;
    let mut text = false;
    for v in values.iter().filter(|v| !v.is_null()).take(MIXED_TYPE_SAMPLE) {
        match v {
            SourceValue::Text(s) if !s.trim().is_empty() => text = true,
            v if v.is_numeric() => numeric = true,
            _ => {}
        }
        if numeric && text {
            return true;
        }
    }
    false
}

fn passthrough_column(name: &str, values: &[SourceValue]) -> Result<Vec<CellValue>> {
    let has_float = values
        .iter()
        .any(|v| matches!(v, SourceValue::Float(_) | SourceValue::Decimal(_)));
    let numeric = values.iter().find(|v| !v.is_null()).is_some_and(SourceValue::is_numeric);

    values
        .iter()
        .map(|v| match v {
            SourceValue::Null => Ok(CellValue::Null),
            SourceValue::Float(f) if f.is_nan() => Ok(CellValue::Null),
            SourceValue::Float(f) => Ok(CellValue::Float(*f)),
            SourceValue::Int(i) if has_float => Ok(CellValue::Float(*i as f64)),
            SourceValue::Int(i) => Ok(CellValue::Integer(*i)),
            SourceValue::Decimal(d) => d
                .to_f64()
                .map(CellValue::Float)
                .ok_or_else(|| Error::cell_conversion(name, format!("decimal {} out of range", d))),
            SourceValue::Bool(b) => Ok(CellValue::Boolean(*b)),
            SourceValue::Text(s) if numeric && s.trim().is_empty() => Ok(CellValue::Null),
            other => Ok(text_cell(other)),
        })
        .collect()
}

fn ensure_homogeneous(name: &str, values: &[CellValue]) -> Result<()> {
    let mut kind: Option<CellKind> = None;
    for v in values {
        match (kind, v.kind()) {
            (_, None) => {}
            (None, Some(k)) => kind = Some(k),
            (Some(a), Some(b)) if a == b => {}
            (Some(a), Some(b)) => {
                return Err(Error::cell_conversion(
                    name,
                    format!("column mixes {:?} and {:?} values", a, b),
                ));
            }
        }
    }
    Ok(())
}

/// Cast a whole column to text. Placeholder strings left by the cast become null.
fn text_column(values: &[SourceValue]) -> Vec<CellValue> {
    values
        .iter()
        .map(|v| match text_cell(v) {
            CellValue::Text(s) if NULL_TEXT_FORMS.contains(&s.as_str()) => CellValue::Null,
            other => other,
        })
        .collect()
}

fn text_cell(value: &SourceValue) -> CellValue {
    let text = match value {
        SourceValue::Null => return CellValue::Null,
        SourceValue::Float(f) if f.is_nan() => return CellValue::Null,
        SourceValue::Bool(b) => b.to_string(),
        SourceValue::Int(i) => i.to_string(),
        SourceValue::Float(f) => f.to_string(),
        SourceValue::Decimal(d) => d.to_string(),
        SourceValue::Text(s) => s.clone(),
        SourceValue::Binary(b) => guid_text(b),
        SourceValue::Guid(u) => u.hyphenated().to_string(),
        SourceValue::Date(d) => d.format("%Y-%m-%d").to_string(),
        SourceValue::DateTime(dt) => dt.format(TIMESTAMP_FORMAT).to_string(),
        SourceValue::DateTimeTz(dt) => dt.to_rfc3339(),
    };
    CellValue::Text(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};
    use proptest::prelude::*;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn rowset(columns: Vec<(&str, Vec<SourceValue>)>) -> RowSet {
        RowSet::new(
            columns
                .into_iter()
                .map(|(name, values)| SourceColumn::new(name, "test", values))
                .collect(),
        )
        .unwrap()
    }

    fn single(values: Vec<SourceValue>) -> (Vec<CellValue>, NormalizeReport) {
        let (rows, report) = normalize(rowset(vec![("c", values)])).unwrap();
        (rows.columns()[0].values.clone(), report)
    }

    #[test]
    fn test_dedup_triple() {
        assert_eq!(dedup_column_names(&["A", "A", "A"]), vec!["A", "A_1", "A_2"]);
    }

    #[test]
    fn test_dedup_interleaved() {
        assert_eq!(
            dedup_column_names(&["ID", "Cislo", "ID", "Cislo"]),
            vec!["ID", "Cislo", "ID_1", "Cislo_1"]
        );
    }

    #[test]
    fn test_dedup_skips_suffix_taken_by_real_column() {
        assert_eq!(dedup_column_names(&["A", "A_1", "A"]), vec!["A", "A_1", "A_2"]);
        assert_eq!(dedup_column_names(&["A", "A", "A_1"]), vec!["A", "A_2", "A_1"]);

        let rows = rowset(vec![
            ("A", vec![SourceValue::Int(1)]),
            ("A_1", vec![SourceValue::Int(2)]),
            ("A", vec![SourceValue::Int(3)]),
        ]);
        let (normalized, _) = normalize(rows).unwrap();
        assert_eq!(normalized.column_names(), vec!["A", "A_1", "A_2"]);
    }

    #[test]
    fn test_normalize_reports_renames() {
        let rows = rowset(vec![
            ("A", vec![SourceValue::Int(1)]),
            ("A", vec![SourceValue::Int(2)]),
        ]);
        let (normalized, report) = normalize(rows).unwrap();
        assert_eq!(normalized.column_names(), vec!["A", "A_1"]);
        assert_eq!(report.renamed, vec![("A".to_string(), "A_1".to_string())]);
    }

    #[test]
    fn test_guid_little_endian_round_trip() {
        let uuid = Uuid::parse_str("123e4567-e89b-12d3-a456-426614174000").unwrap();
        let (a, b, c, d) = uuid.as_fields();
        let mut bytes = Vec::with_capacity(16);
        bytes.extend_from_slice(&a.to_le_bytes());
        bytes.extend_from_slice(&b.to_le_bytes());
        bytes.extend_from_slice(&c.to_le_bytes());
        bytes.extend_from_slice(d);

        let (values, _) = single(vec![SourceValue::Binary(bytes), SourceValue::Null]);
        assert_eq!(
            values,
            vec![
                CellValue::Text("123e4567-e89b-12d3-a456-426614174000".into()),
                CellValue::Null
            ]
        );
    }

    #[test]
    fn test_guid_bad_length_falls_back_to_hex() {
        let good = Uuid::nil().to_bytes_le().to_vec();
        let (values, _) = single(vec![
            SourceValue::Binary(good),
            SourceValue::Binary(vec![0xde, 0xad, 0xbe, 0xef]),
        ]);
        assert_eq!(
            values[0],
            CellValue::Text("00000000-0000-0000-0000-000000000000".into())
        );
        assert_eq!(values[1], CellValue::Text("deadbeef".into()));
    }

    #[test]
    fn test_decimal_to_float() {
        let (values, _) = single(vec![
            SourceValue::Decimal(Decimal::from_str("19.99").unwrap()),
            SourceValue::Null,
        ]);
        match values[0] {
            CellValue::Float(f) => assert!((f - 19.99).abs() < 1e-9),
            ref other => panic!("expected float, got {:?}", other),
        }
        assert_eq!(values[1], CellValue::Null);
    }

    #[test]
    fn test_dates_become_timestamps() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();
        let tz = Utc.with_ymd_and_hms(2024, 2, 1, 10, 0, 0).unwrap();
        let (values, _) = single(vec![
            SourceValue::Date(date),
            SourceValue::DateTimeTz(tz),
            SourceValue::Null,
        ]);
        assert_eq!(
            values,
            vec![
                CellValue::Timestamp(date.and_hms_opt(0, 0, 0).unwrap()),
                CellValue::Timestamp(tz.naive_utc()),
                CellValue::Null,
            ]
        );
    }

    #[test]
    fn test_mixed_column_forced_to_text() {
        let (values, report) = single(vec![
            SourceValue::Int(1),
            SourceValue::Text("x".into()),
            SourceValue::Null,
        ]);
        assert_eq!(
            values,
            vec![CellValue::Text("1".into()), CellValue::Text("x".into()), CellValue::Null]
        );
        assert_eq!(report.mixed_to_text, vec!["c".to_string()]);
    }

    #[test]
    fn test_mixed_column_converts_values_beyond_sample() {
        let mut values: Vec<SourceValue> = (0..MIXED_TYPE_SAMPLE as i64 - 1).map(SourceValue::Int).collect();
        values.push(SourceValue::Text("x".into()));
        values.push(SourceValue::Int(7));
        values.push(SourceValue::Text("nan".into()));
        let (out, _) = single(values);
        assert!(out.iter().all(|v| matches!(v, CellValue::Text(_) | CellValue::Null)));
        assert_eq!(out[MIXED_TYPE_SAMPLE], CellValue::Text("7".into()));
        assert_eq!(out[MIXED_TYPE_SAMPLE + 1], CellValue::Null);
    }

    #[test]
    fn test_numbers_with_empty_strings_are_not_mixed() {
        let (values, report) = single(vec![
            SourceValue::Int(4),
            SourceValue::Text("  ".into()),
            SourceValue::Int(5),
        ]);
        assert_eq!(
            values,
            vec![CellValue::Integer(4), CellValue::Null, CellValue::Integer(5)]
        );
        assert!(report.mixed_to_text.is_empty());
    }

    #[test]
    fn test_text_column_keeps_placeholder_words() {
        let (values, _) = single(vec![
            SourceValue::Text("None".into()),
            SourceValue::Text("nan".into()),
            SourceValue::Text("ok".into()),
        ]);
        assert_eq!(
            values,
            vec![
                CellValue::Text("None".into()),
                CellValue::Text("nan".into()),
                CellValue::Text("ok".into())
            ]
        );
    }

    #[test]
    fn test_nan_becomes_null() {
        let (values, _) = single(vec![SourceValue::Float(1.5), SourceValue::Float(f64::NAN)]);
        assert_eq!(values, vec![CellValue::Float(1.5), CellValue::Null]);
    }

    #[test]
    fn test_int_and_float_promoted() {
        let (values, _) = single(vec![SourceValue::Int(2), SourceValue::Float(2.5)]);
        assert_eq!(values, vec![CellValue::Float(2.0), CellValue::Float(2.5)]);
    }

    #[test]
    fn test_unexpected_value_in_temporal_column_falls_back_to_text() {
        let date = NaiveDate::from_ymd_opt(2024, 5, 6).unwrap();
        let (values, report) = single(vec![
            SourceValue::Date(date),
            SourceValue::Text("not a date".into()),
        ]);
        assert_eq!(
            values,
            vec![
                CellValue::Text("2024-05-06".into()),
                CellValue::Text("not a date".into())
            ]
        );
        assert_eq!(report.fallback_to_text, vec!["c".to_string()]);
    }

    #[test]
    fn test_late_heterogeneous_value_falls_back_to_text() {
        let mut values: Vec<SourceValue> =
            (0..MIXED_TYPE_SAMPLE).map(|i| SourceValue::Text(format!("r{}", i))).collect();
        values.push(SourceValue::Bool(true));
        let (out, report) = single(values);
        assert_eq!(out.last(), Some(&CellValue::Text("true".into())));
        assert_eq!(report.fallback_to_text, vec!["c".to_string()]);
    }

    #[test]
    fn test_all_null_column() {
        let (values, _) = single(vec![SourceValue::Null, SourceValue::Null]);
        assert_eq!(values, vec![CellValue::Null, CellValue::Null]);
    }

    proptest! {
        #[test]
        fn prop_dedup_names_unique(names in proptest::collection::vec("[a-c](_[12])?", 0..12)) {
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            let out = dedup_column_names(&refs);
            prop_assert_eq!(out.len(), names.len());
            for (i, name) in out.iter().enumerate() {
                prop_assert!(!out[..i].contains(name));
            }
            for (orig, renamed) in names.iter().zip(&out) {
                prop_assert!(renamed.starts_with(orig.as_str()));
            }
        }
    }
}
