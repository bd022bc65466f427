use medallion_storage::{is_rounded_to, CustomerSegment, MeasureKind, ModelTable, StagedRecord};
use std::collections::{BTreeMap, HashSet};

use super::{CheckKind, Dataset, Finding};
use crate::raw_store::RawTable;
use crate::stages::gold::{self, MODEL_DEFINITIONS};
use crate::stages::silver::{self, parse_bool};

/// Examples quoted in a finding's detail
const MAX_EXAMPLES: usize = 5;

pub(crate) fn run(check: CheckKind, dataset: Dataset<'_>, min_sample_size: usize) -> Finding {
    match dataset {
        Dataset::Raw(table) => match check {
            CheckKind::Schema => raw_schema(table),
            CheckKind::Null => raw_null(table),
            CheckKind::Type => raw_type(table),
            CheckKind::Uniqueness => raw_uniqueness(table),
            CheckKind::Business => raw_business(table),
            CheckKind::SampleSize => raw_sample_size(table, min_sample_size),
        },
        Dataset::Silver(records) => match check {
            CheckKind::Schema => silver_schema(records),
            CheckKind::Null => silver_null(records),
            CheckKind::Type => silver_type(records),
            CheckKind::Uniqueness => silver_uniqueness(records),
            CheckKind::Business => silver_business(records),
            CheckKind::SampleSize => silver_sample_size(records, min_sample_size),
        },
        Dataset::Gold(tables) => match check {
            CheckKind::Schema => gold_schema(tables),
            CheckKind::Null => gold_null(tables),
            CheckKind::Type => gold_type(tables),
            CheckKind::Uniqueness => gold_uniqueness(tables),
            CheckKind::Business => gold_business(tables),
            CheckKind::SampleSize => gold_sample_size(tables, min_sample_size),
        },
    }
}

/// Summarize offending items, quoting the first few
fn summarize(offending: usize, what: &str, examples: &[String]) -> Finding {
    if offending == 0 {
        return Finding::clean(format!("no {}", what));
    }
    let shown: Vec<&str> = examples.iter().take(MAX_EXAMPLES).map(String::as_str).collect();
    let more = if examples.len() > MAX_EXAMPLES {
        format!(" (+{} more)", examples.len() - MAX_EXAMPLES)
    } else {
        String::new()
    };
    Finding::offending(
        offending,
        format!("{} {}: {}{}", offending, what, shown.join("; "), more),
    )
}

// ── raw ──────────────────────────────────────────────────────────────────

/// 1-based file line of data row `i` (the header is line 1)
fn line(i: usize) -> usize {
    i + 2
}

fn raw_schema(table: &RawTable) -> Finding {
    let missing: Vec<String> = silver::required_headers()
        .filter(|h| table.column_index(h).is_none())
        .map(str::to_string)
        .collect();
    summarize(missing.len(), "missing columns", &missing)
}

fn raw_null(table: &RawTable) -> Finding {
    let cols: Vec<(&str, usize)> = ["customerID", "Churn"]
        .iter()
        .filter_map(|h| table.column_index(h).map(|i| (*h, i)))
        .collect();

    let mut examples = Vec::new();
    for (i, row) in table.rows.iter().enumerate() {
        let nulls: Vec<&str> = cols
            .iter()
            .filter(|(_, c)| table.cell(row, *c).is_none())
            .map(|(h, _)| *h)
            .collect();
        if !nulls.is_empty() {
            examples.push(format!("line {} ({})", line(i), nulls.join(", ")));
        }
    }
    summarize(examples.len(), "rows with null identity or outcome", &examples)
}

fn raw_type(table: &RawTable) -> Finding {
    let tenure = table.column_index("tenure");
    let monthly = table.column_index("MonthlyCharges");
    let total = table.column_index("TotalCharges");

    let non_negative = |v: &str| v.parse::<f64>().map(|x| x.is_finite() && x >= 0.0).unwrap_or(false);

    let mut examples = Vec::new();
    for (i, row) in table.rows.iter().enumerate() {
        let mut problems = Vec::new();
        if let Some(c) = tenure {
            match table.cell(row, c) {
                Some(v) if silver::parse_tenure(v).is_ok() => {}
                Some(v) => problems.push(format!("tenure {:?}", v)),
                None => problems.push("tenure blank".to_string()),
            }
        }
        if let Some(c) = monthly {
            match table.cell(row, c) {
                Some(v) if non_negative(v) => {}
                Some(v) => problems.push(format!("MonthlyCharges {:?}", v)),
                None => problems.push("MonthlyCharges blank".to_string()),
            }
        }
        if let Some(c) = total {
            // Blank is legal here; the staging stage decides what it means
            if let Some(v) = table.cell(row, c) {
                if !non_negative(v) {
                    problems.push(format!("TotalCharges {:?}", v));
                }
            }
        }
        if !problems.is_empty() {
            examples.push(format!("line {} ({})", line(i), problems.join(", ")));
        }
    }
    summarize(examples.len(), "rows with invalid numeric fields", &examples)
}

fn raw_uniqueness(table: &RawTable) -> Finding {
    let Some(col) = table.column_index("customerID") else {
        return Finding::clean("no customerID column to check");
    };
    let mut seen = HashSet::new();
    let mut examples = Vec::new();
    for row in &table.rows {
        if let Some(id) = table.cell(row, col) {
            if !seen.insert(id) {
                examples.push(id.to_string());
            }
        }
    }
    summarize(examples.len(), "duplicate customerID rows", &examples)
}

fn raw_business(table: &RawTable) -> Finding {
    let churn = table.column_index("Churn");
    let senior = table.column_index("SeniorCitizen");

    let mut examples = Vec::new();
    for (i, row) in table.rows.iter().enumerate() {
        let mut problems = Vec::new();
        if let Some(v) = churn.and_then(|c| table.cell(row, c)) {
            if parse_bool(v).is_none() {
                problems.push(format!("Churn {:?}", v));
            }
        }
        if let Some(v) = senior.and_then(|c| table.cell(row, c)) {
            if v != "0" && v != "1" {
                problems.push(format!("SeniorCitizen {:?}", v));
            }
        }
        if !problems.is_empty() {
            examples.push(format!("line {} ({})", line(i), problems.join(", ")));
        }
    }
    summarize(examples.len(), "rows with unrecognised encodings", &examples)
}

fn raw_sample_size(table: &RawTable, min: usize) -> Finding {
    if table.rows.len() < min {
        Finding::offending(
            1,
            format!("{} data rows, fewer than {}", table.rows.len(), min),
        )
    } else {
        Finding::clean(format!("{} data rows", table.rows.len()))
    }
}

// ── silver ───────────────────────────────────────────────────────────────

fn silver_schema(records: &[StagedRecord]) -> Finding {
    let mut examples = Vec::new();
    for r in records {
        let fields = [
            ("gender", &r.gender),
            ("multiple_lines", &r.multiple_lines),
            ("internet_service", &r.internet_service),
            ("online_security", &r.online_security),
            ("online_backup", &r.online_backup),
            ("device_protection", &r.device_protection),
            ("tech_support", &r.tech_support),
            ("streaming_tv", &r.streaming_tv),
            ("streaming_movies", &r.streaming_movies),
            ("contract_type", &r.contract_type),
            ("payment_method", &r.payment_method),
        ];
        let empty: Vec<&str> = fields
            .iter()
            .filter(|(_, v)| v.trim().is_empty())
            .map(|(name, _)| *name)
            .collect();
        if !empty.is_empty() {
            examples.push(format!("{} ({})", r.customer_id, empty.join(", ")));
        }
    }
    summarize(examples.len(), "records with empty categorical fields", &examples)
}

fn silver_null(records: &[StagedRecord]) -> Finding {
    let count = records
        .iter()
        .filter(|r| r.customer_id.trim().is_empty())
        .count();
    let examples = vec!["empty customer_id".to_string(); count.min(1)];
    summarize(count, "records without customer_id", &examples)
}

fn silver_type(records: &[StagedRecord]) -> Finding {
    let valid = |v: f64| v.is_finite() && v >= 0.0;
    let examples: Vec<String> = records
        .iter()
        .filter(|r| {
            !(valid(r.monthly_charges) && valid(r.total_charges) && valid(r.avg_monthly_revenue))
        })
        .map(|r| r.customer_id.clone())
        .collect();
    summarize(examples.len(), "records with invalid amounts", &examples)
}

fn silver_uniqueness(records: &[StagedRecord]) -> Finding {
    let mut seen = HashSet::new();
    let examples: Vec<String> = records
        .iter()
        .filter(|r| !seen.insert(r.customer_id.as_str()))
        .map(|r| r.customer_id.clone())
        .collect();
    summarize(examples.len(), "duplicate customer_id records", &examples)
}

fn silver_business(records: &[StagedRecord]) -> Finding {
    let mut examples = Vec::new();
    for r in records {
        let segment = CustomerSegment::from_tenure(r.tenure);
        if r.customer_segment != segment {
            examples.push(format!(
                "{} (segment {} for tenure {}, expected {})",
                r.customer_id, r.customer_segment, r.tenure, segment
            ));
            continue;
        }
        let expected = silver::avg_monthly_revenue(r.tenure, r.monthly_charges, r.total_charges);
        if (r.avg_monthly_revenue - expected).abs() > 1e-9 * expected.abs().max(1.0) {
            examples.push(format!(
                "{} (avg_monthly_revenue {} != {})",
                r.customer_id, r.avg_monthly_revenue, expected
            ));
        }
    }
    summarize(examples.len(), "records with inconsistent derived fields", &examples)
}

fn silver_sample_size(records: &[StagedRecord], min: usize) -> Finding {
    let mut counts: BTreeMap<CustomerSegment, usize> = BTreeMap::new();
    for r in records {
        *counts.entry(r.customer_segment).or_default() += 1;
    }
    let examples: Vec<String> = counts
        .iter()
        .filter(|(_, n)| **n < min)
        .map(|(segment, n)| format!("{} has {} records", segment, n))
        .collect();
    summarize(
        examples.len(),
        &format!("segments below {} records", min),
        &examples,
    )
}

// ── gold ─────────────────────────────────────────────────────────────────

fn find<'a>(tables: &'a [ModelTable], name: &str) -> Option<&'a ModelTable> {
    tables.iter().find(|t| t.name == name)
}

fn gold_schema(tables: &[ModelTable]) -> Finding {
    let mut examples = Vec::new();
    for def in MODEL_DEFINITIONS.iter() {
        let Some(table) = find(tables, def.name) else {
            examples.push(format!("{} missing", def.name));
            continue;
        };
        let dims_match = table.dimensions.iter().map(String::as_str).eq(def.dimensions.iter().copied());
        let measures_match = table
            .measures
            .iter()
            .map(|m| (m.name.as_str(), m.kind))
            .eq(def.measures.iter().copied());
        if !dims_match || !measures_match {
            examples.push(format!("{} has unexpected columns", def.name));
        }
    }
    summarize(examples.len(), "model tables with schema problems", &examples)
}

fn gold_null(tables: &[ModelTable]) -> Finding {
    let mut examples = Vec::new();
    for table in tables {
        for row in &table.rows {
            if row.dimensions.iter().any(|d| d.trim().is_empty()) {
                examples.push(format!("{} {:?}", table.name, row.dimensions));
            }
        }
    }
    summarize(examples.len(), "rows with blank dimension cells", &examples)
}

fn measure_problem(kind: MeasureKind, value: f64) -> Option<&'static str> {
    if !value.is_finite() {
        return Some("not finite");
    }
    if !is_rounded_to(value, kind.decimal_places()) {
        return Some("not rounded");
    }
    match kind {
        MeasureKind::Rate if !(0.0..=100.0).contains(&value) => Some("rate outside [0, 100]"),
        MeasureKind::Count if value < 0.0 => Some("negative count"),
        _ => None,
    }
}

fn gold_type(tables: &[ModelTable]) -> Finding {
    let mut examples = Vec::new();
    for table in tables {
        for row in &table.rows {
            let problems: Vec<String> = row
                .measures
                .iter()
                .zip(&table.measures)
                .filter_map(|(&value, column)| {
                    measure_problem(column.kind, value)
                        .map(|p| format!("{}={} {}", column.name, value, p))
                })
                .collect();
            if !problems.is_empty() {
                examples.push(format!(
                    "{} {:?} ({})",
                    table.name,
                    row.dimensions,
                    problems.join(", ")
                ));
            }
        }
    }
    summarize(examples.len(), "rows with invalid measures", &examples)
}

fn gold_uniqueness(tables: &[ModelTable]) -> Finding {
    let mut examples = Vec::new();
    for table in tables {
        let mut seen = HashSet::new();
        for row in &table.rows {
            if !seen.insert(&row.dimensions) {
                examples.push(format!("{} {:?}", table.name, row.dimensions));
            }
        }
    }
    summarize(examples.len(), "duplicate dimension keys", &examples)
}

fn sum_measure(table: &ModelTable, measure: &str) -> f64 {
    table
        .rows
        .iter()
        .filter_map(|row| table.measure(row, measure))
        .sum()
}

fn gold_business(tables: &[ModelTable]) -> Finding {
    let (Some(summary), Some(exec)) = (
        find(tables, gold::CHURN_SUMMARY),
        find(tables, gold::EXECUTIVE_SUMMARY),
    ) else {
        return Finding::offending(1, "churn_summary or executive_summary is missing");
    };

    let segment_total = sum_measure(summary, "total_customers");
    let exec_total = sum_measure(exec, "total_customers");
    if (segment_total - exec_total).abs() > 0.5 {
        Finding::offending(
            1,
            format!(
                "executive_summary total_customers {} != churn_summary total {}",
                exec_total, segment_total
            ),
        )
    } else {
        Finding::clean(format!("{} customers in both summaries", exec_total))
    }
}

fn gold_sample_size(tables: &[ModelTable], min: usize) -> Finding {
    let Some(summary) = find(tables, gold::CHURN_SUMMARY) else {
        return Finding::clean("no churn_summary to check");
    };
    let examples: Vec<String> = summary
        .rows
        .iter()
        .filter_map(|row| {
            let n = summary.measure(row, "total_customers")?;
            (n < min as f64).then(|| format!("{} has {} customers", row.dimensions.join("/"), n))
        })
        .collect();
    summarize(
        examples.len(),
        &format!("segments below {} customers", min),
        &examples,
    )
}
