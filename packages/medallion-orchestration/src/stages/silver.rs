use chrono::{DateTime, Utc};
use medallion_storage::{CustomerSegment, StagedRecord};
use rayon::prelude::*;
use std::collections::HashMap;
use std::time::Instant;
use tracing::{info, warn};

use crate::config::{DedupPolicy, RowErrorPolicy};
use crate::error::{PipelineError, Result};
use crate::raw_store::RawTable;

/// Source header -> staged field
pub const COLUMN_MAPPING: [(&str, &str); 21] = [
    ("customerID", "customer_id"),
    ("gender", "gender"),
    ("SeniorCitizen", "senior_citizen"),
    ("Partner", "partner"),
    ("Dependents", "dependents"),
    ("tenure", "tenure"),
    ("PhoneService", "phone_service"),
    ("MultipleLines", "multiple_lines"),
    ("InternetService", "internet_service"),
    ("OnlineSecurity", "online_security"),
    ("OnlineBackup", "online_backup"),
    ("DeviceProtection", "device_protection"),
    ("TechSupport", "tech_support"),
    ("StreamingTV", "streaming_tv"),
    ("StreamingMovies", "streaming_movies"),
    ("Contract", "contract_type"),
    ("PaperlessBilling", "paperless_billing"),
    ("PaymentMethod", "payment_method"),
    ("MonthlyCharges", "monthly_charges"),
    ("TotalCharges", "total_charges"),
    ("Churn", "churned"),
];

/// Source headers the raw layer must carry
pub fn required_headers() -> impl Iterator<Item = &'static str> {
    COLUMN_MAPPING.iter().map(|(source, _)| *source)
}

/// A row that failed coercion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowRejection {
    pub record_id: String,
    pub reason: String,
}

impl From<RowRejection> for PipelineError {
    fn from(r: RowRejection) -> Self {
        PipelineError::transformation(r.record_id, r.reason)
    }
}

/// Output of the staging transform
#[derive(Debug, Clone, Default)]
pub struct StagedSet {
    pub records: Vec<StagedRecord>,
    pub rows_in: usize,
    pub rejected: Vec<RowRejection>,
    pub duplicates_dropped: usize,
}

impl StagedSet {
    pub fn summary(&self) -> String {
        format!(
            "{} staged, {} rejected, {} duplicates dropped",
            self.records.len(),
            self.rejected.len(),
            self.duplicates_dropped
        )
    }
}

/// Parse a boolean encoding: Yes/No/True/False/1/0, case-insensitive
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "yes" | "true" | "1" => Some(true),
        "no" | "false" | "0" => Some(false),
        _ => None,
    }
}

/// Trim and collapse inner whitespace runs to a single space
pub fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Canonical categorical value; `No internet service` / `No phone service` fold to `No`
pub fn normalize_category(value: &str) -> String {
    let collapsed = collapse_whitespace(value);
    match collapsed.to_ascii_lowercase().as_str() {
        "no internet service" | "no phone service" => "No".to_string(),
        "yes" | "true" => "Yes".to_string(),
        "no" | "false" => "No".to_string(),
        _ => collapsed,
    }
}

pub fn title_case(value: &str) -> String {
    collapse_whitespace(value)
        .split(' ')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(|c| c.to_lowercase()))
                    .collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Lifetime charges spread over tenure; falls back to the monthly charge at tenure 0
pub fn avg_monthly_revenue(tenure: u32, monthly_charges: f64, total_charges: f64) -> f64 {
    if tenure == 0 {
        monthly_charges
    } else {
        total_charges / tenure as f64
    }
}

pub(crate) fn parse_tenure(value: &str) -> std::result::Result<u32, String> {
    if let Ok(v) = value.parse::<u32>() {
        return Ok(v);
    }
    match value.parse::<f64>() {
        Ok(v) if v.is_finite() && v >= 0.0 && v.fract() == 0.0 && v <= u32::MAX as f64 => {
            Ok(v as u32)
        }
        Ok(v) if v < 0.0 => Err(format!("negative tenure {}", value)),
        _ => Err(format!("tenure {:?} is not a non-negative integer", value)),
    }
}

fn parse_amount(field: &str, value: &str) -> std::result::Result<f64, String> {
    match value.parse::<f64>() {
        Ok(v) if !v.is_finite() => Err(format!("{} {:?} is not finite", field, value)),
        Ok(v) if v < 0.0 => Err(format!("negative {} {}", field, value)),
        Ok(v) => Ok(v),
        Err(_) => Err(format!("{} {:?} is not a number", field, value)),
    }
}

/// Resolved positions of every source column
struct ColumnMap {
    idx: HashMap<&'static str, usize>,
}

impl ColumnMap {
    fn resolve(table: &RawTable) -> Result<Self> {
        let mut idx = HashMap::new();
        let mut missing = Vec::new();
        for header in required_headers() {
            match table.column_index(header) {
                Some(i) => {
                    idx.insert(header, i);
                }
                None => missing.push(header),
            }
        }
        if !missing.is_empty() {
            return Err(PipelineError::transformation(
                "<header>",
                format!("missing source columns: {}", missing.join(", ")),
            ));
        }
        Ok(Self { idx })
    }

    fn get<'a>(&self, row: &'a [Option<String>], header: &str) -> Option<&'a str> {
        self.idx
            .get(header)
            .and_then(|&i| row.get(i))
            .and_then(|c| c.as_deref())
    }
}

struct RowReader<'a> {
    columns: &'a ColumnMap,
    row: &'a [Option<String>],
    record_id: String,
}

impl RowReader<'_> {
    fn reject(&self, reason: impl Into<String>) -> RowRejection {
        RowRejection {
            record_id: self.record_id.clone(),
            reason: reason.into(),
        }
    }

    fn optional(&self, header: &str) -> Option<&str> {
        self.columns.get(self.row, header)
    }

    fn required(&self, header: &str) -> std::result::Result<&str, RowRejection> {
        self.optional(header)
            .ok_or_else(|| self.reject(format!("{} is blank", header)))
    }

    fn flag(&self, header: &str) -> std::result::Result<bool, RowRejection> {
        let raw = self.required(header)?;
        parse_bool(raw).ok_or_else(|| self.reject(format!("{} {:?} is not a boolean", header, raw)))
    }

    fn category(&self, header: &str) -> std::result::Result<String, RowRejection> {
        let value = normalize_category(self.required(header)?);
        if value.is_empty() {
            return Err(self.reject(format!("{} is blank", header)));
        }
        Ok(value)
    }
}

/// Coerce one raw row into a staged record
fn coerce_row(
    columns: &ColumnMap,
    row: &[Option<String>],
    line: usize,
    ingested_at: DateTime<Utc>,
) -> std::result::Result<StagedRecord, RowRejection> {
    let customer_id = columns
        .get(row, "customerID")
        .map(collapse_whitespace)
        .filter(|id| !id.is_empty());

    let reader = RowReader {
        columns,
        row,
        record_id: customer_id
            .clone()
            .unwrap_or_else(|| format!("line {}", line)),
    };
    let customer_id = customer_id.ok_or_else(|| reader.reject("customerID is blank"))?;

    let tenure = parse_tenure(reader.required("tenure")?).map_err(|r| reader.reject(r))?;
    let monthly_charges = parse_amount("MonthlyCharges", reader.required("MonthlyCharges")?)
        .map_err(|r| reader.reject(r))?;

    // Blank total means "not yet billed", which only makes sense at tenure 0
    let total_charges = match reader.optional("TotalCharges") {
        Some(raw) => parse_amount("TotalCharges", raw).map_err(|r| reader.reject(r))?,
        None if tenure == 0 => 0.0,
        None => {
            return Err(reader.reject(format!(
                "TotalCharges is blank but tenure is {}",
                tenure
            )))
        }
    };

    let gender = title_case(reader.required("gender")?);
    if gender.is_empty() {
        return Err(reader.reject("gender is blank"));
    }

    Ok(StagedRecord {
        gender,
        senior_citizen: reader.flag("SeniorCitizen")?,
        partner: reader.flag("Partner")?,
        dependents: reader.flag("Dependents")?,
        tenure,
        phone_service: reader.flag("PhoneService")?,
        multiple_lines: reader.category("MultipleLines")?,
        internet_service: reader.category("InternetService")?,
        online_security: reader.category("OnlineSecurity")?,
        online_backup: reader.category("OnlineBackup")?,
        device_protection: reader.category("DeviceProtection")?,
        tech_support: reader.category("TechSupport")?,
        streaming_tv: reader.category("StreamingTV")?,
        streaming_movies: reader.category("StreamingMovies")?,
        contract_type: reader.category("Contract")?,
        paperless_billing: reader.flag("PaperlessBilling")?,
        payment_method: reader.category("PaymentMethod")?,
        monthly_charges,
        total_charges,
        avg_monthly_revenue: avg_monthly_revenue(tenure, monthly_charges, total_charges),
        customer_segment: CustomerSegment::from_tenure(tenure),
        churned: reader.flag("Churn")?,
        ingested_at,
        customer_id,
    })
}

/// Silver transformer: parse, coerce, normalize, dedup, derive
pub struct SilverTransformer {
    dedup: DedupPolicy,
    row_errors: RowErrorPolicy,
}

impl SilverTransformer {
    pub fn new(dedup: DedupPolicy, row_errors: RowErrorPolicy) -> Self {
        Self { dedup, row_errors }
    }

    pub fn transform(&self, table: &RawTable, ingested_at: DateTime<Utc>) -> Result<StagedSet> {
        let start = Instant::now();
        let columns = ColumnMap::resolve(table)?;
        let rows_in = table.row_count();

        info!(
            "SilverTransformer: coercing {} rows (dedup: {:?}, row errors: {:?})",
            rows_in, self.dedup, self.row_errors
        );

        // Line numbers are 1-based and count the header
        let coerced: Vec<std::result::Result<StagedRecord, RowRejection>> = table
            .rows
            .par_iter()
            .enumerate()
            .map(|(i, row)| coerce_row(&columns, row, i + 2, ingested_at))
            .collect();

        let framing = table.malformed.iter().map(|m| RowRejection {
            record_id: format!("line {}", m.line),
            reason: m.reason.clone(),
        });

        let mut records = Vec::with_capacity(coerced.len());
        let mut rejected = Vec::new();
        for result in coerced {
            match result {
                Ok(record) => records.push(record),
                Err(rejection) => rejected.push(rejection),
            }
        }
        rejected.extend(framing);

        if !rejected.is_empty() {
            match self.row_errors {
                RowErrorPolicy::Abort => return Err(rejected.swap_remove(0).into()),
                RowErrorPolicy::Skip => {
                    for r in &rejected {
                        warn!("Skipping record {}: {}", r.record_id, r.reason);
                    }
                }
            }
        }

        if records.is_empty() {
            return Err(PipelineError::transformation(
                "*",
                format!("all {} rows were rejected", rows_in),
            ));
        }

        let before = records.len();
        let records = deduplicate(records, self.dedup)?;
        let duplicates_dropped = before - records.len();
        if duplicates_dropped > 0 {
            info!(
                "SilverTransformer: dropped {} duplicate customer_id rows ({:?})",
                duplicates_dropped, self.dedup
            );
        }

        let staged = StagedSet {
            records,
            rows_in,
            rejected,
            duplicates_dropped,
        };
        info!(
            "SilverTransformer: {} in {}ms",
            staged.summary(),
            start.elapsed().as_millis()
        );
        Ok(staged)
    }
}

/// Resolve duplicate identities, preserving input order of the kept rows
pub fn deduplicate(records: Vec<StagedRecord>, policy: DedupPolicy) -> Result<Vec<StagedRecord>> {
    let mut keep: HashMap<String, usize> = HashMap::with_capacity(records.len());
    for (i, record) in records.iter().enumerate() {
        match keep.get_mut(&record.customer_id) {
            None => {
                keep.insert(record.customer_id.clone(), i);
            }
            Some(kept) => match policy {
                DedupPolicy::KeepFirst => {}
                DedupPolicy::KeepLast => *kept = i,
                DedupPolicy::Reject => {
                    return Err(PipelineError::transformation(
                        record.customer_id.clone(),
                        "duplicate customer_id",
                    ))
                }
            },
        }
    }

    Ok(records
        .into_iter()
        .enumerate()
        .filter(|(i, r)| keep.get(&r.customer_id) == Some(i))
        .map(|(_, r)| r)
        .collect())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub const HEADER: &str = "customerID,gender,SeniorCitizen,Partner,Dependents,tenure,PhoneService,MultipleLines,InternetService,OnlineSecurity,OnlineBackup,DeviceProtection,TechSupport,StreamingTV,StreamingMovies,Contract,PaperlessBilling,PaymentMethod,MonthlyCharges,TotalCharges,Churn";

    pub fn csv_row(id: &str, tenure: &str, monthly: &str, total: &str, churn: &str) -> String {
        format!(
            "{},female,0,Yes,No,{},Yes,No phone service,DSL,No,Yes,No,No internet service,No,No,Month-to-month,Yes,Electronic  check,{},{},{}",
            id, tenure, monthly, total, churn
        )
    }

    fn table(rows: &[String]) -> RawTable {
        let mut csv = String::from(HEADER);
        for row in rows {
            csv.push('\n');
            csv.push_str(row);
        }
        csv.push('\n');
        RawTable::parse(csv.as_bytes()).unwrap()
    }

    fn transformer(dedup: DedupPolicy, rows: RowErrorPolicy) -> SilverTransformer {
        SilverTransformer::new(dedup, rows)
    }

    #[test]
    fn test_coercion_and_normalization() {
        let raw = table(&[csv_row("7590-VHVEG", "1", "29.85", "29.85", "No")]);
        let staged = transformer(DedupPolicy::KeepFirst, RowErrorPolicy::Abort)
            .transform(&raw, Utc::now())
            .unwrap();

        let r = &staged.records[0];
        assert_eq!(r.customer_id, "7590-VHVEG");
        assert_eq!(r.gender, "Female");
        assert!(!r.senior_citizen);
        assert!(r.partner);
        assert_eq!(r.multiple_lines, "No");
        assert_eq!(r.tech_support, "No");
        assert_eq!(r.payment_method, "Electronic check");
        assert_eq!(r.customer_segment, CustomerSegment::New);
        assert!(!r.churned);
    }

    #[test]
    fn test_blank_total_with_zero_tenure_is_zero() {
        let raw = table(&[csv_row("A", "0", "20.00", " ", "No")]);
        let staged = transformer(DedupPolicy::KeepFirst, RowErrorPolicy::Abort)
            .transform(&raw, Utc::now())
            .unwrap();

        let r = &staged.records[0];
        assert_eq!(r.total_charges, 0.0);
        assert_eq!(r.avg_monthly_revenue, 20.0);
    }

    #[test]
    fn test_blank_total_with_positive_tenure_aborts() {
        let raw = table(&[csv_row("A", "5", "20.00", "", "No")]);
        let err = transformer(DedupPolicy::KeepFirst, RowErrorPolicy::Abort)
            .transform(&raw, Utc::now())
            .unwrap_err();

        match err {
            PipelineError::TransformationError { record_id, reason } => {
                assert_eq!(record_id, "A");
                assert!(reason.contains("TotalCharges"));
            }
            other => panic!("Expected TransformationError, got {:?}", other),
        }
    }

    #[test]
    fn test_skip_policy_drops_bad_rows() {
        let raw = table(&[
            csv_row("A", "-3", "20.00", "1", "No"),
            csv_row("B", "2", "20.00", "40", "Maybe"),
            csv_row("C", "2", "20.00", "40", "Yes"),
        ]);
        let staged = transformer(DedupPolicy::KeepFirst, RowErrorPolicy::Skip)
            .transform(&raw, Utc::now())
            .unwrap();

        assert_eq!(staged.records.len(), 1);
        assert_eq!(staged.records[0].customer_id, "C");
        assert_eq!(staged.rejected.len(), 2);
        assert_eq!(staged.rows_in, 3);
    }

    #[test]
    fn test_all_rows_skipped_fails() {
        let raw = table(&[csv_row("A", "x", "20.00", "1", "No")]);
        let err = transformer(DedupPolicy::KeepFirst, RowErrorPolicy::Skip)
            .transform(&raw, Utc::now())
            .unwrap_err();
        assert_eq!(err.exit_code(), 12);
    }

    #[test]
    fn test_missing_columns_fail() {
        let raw = RawTable::parse(b"customerID,Churn\nA,No\n").unwrap();
        let err = transformer(DedupPolicy::KeepFirst, RowErrorPolicy::Skip)
            .transform(&raw, Utc::now())
            .unwrap_err();
        assert!(err.to_string().contains("TotalCharges"));
    }

    #[test]
    fn test_dedup_policies() {
        let rows = [
            csv_row("A", "1", "10", "10", "No"),
            csv_row("B", "1", "10", "10", "No"),
            csv_row("A", "1", "99", "99", "Yes"),
        ];

        let first = transformer(DedupPolicy::KeepFirst, RowErrorPolicy::Abort)
            .transform(&table(&rows), Utc::now())
            .unwrap();
        assert_eq!(first.records.len(), 2);
        assert_eq!(first.records[0].monthly_charges, 10.0);
        assert_eq!(first.duplicates_dropped, 1);

        let last = transformer(DedupPolicy::KeepLast, RowErrorPolicy::Abort)
            .transform(&table(&rows), Utc::now())
            .unwrap();
        let ids: Vec<_> = last.records.iter().map(|r| r.customer_id.as_str()).collect();
        assert_eq!(ids, vec!["B", "A"]);
        assert_eq!(last.records[1].monthly_charges, 99.0);

        let err = transformer(DedupPolicy::Reject, RowErrorPolicy::Skip)
            .transform(&table(&rows), Utc::now())
            .unwrap_err();
        assert!(matches!(err, PipelineError::TransformationError { ref record_id, .. } if record_id == "A"));
    }

    #[test]
    fn test_helpers() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
        assert_eq!(normalize_category("  No   internet service "), "No");
        assert_eq!(normalize_category("Fiber  optic"), "Fiber optic");
        assert_eq!(title_case("mALE"), "Male");
        assert_eq!(avg_monthly_revenue(0, 50.0, 0.0), 50.0);
        assert_eq!(avg_monthly_revenue(4, 50.0, 100.0), 25.0);
        assert_eq!(parse_tenure("12.0"), Ok(12));
        assert!(parse_tenure("1.5").is_err());
    }
}
