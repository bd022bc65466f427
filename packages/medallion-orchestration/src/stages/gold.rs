//! Gold model builder
//!
//! Each model is a pure function of the staged set. Groups are emitted in
//! sorted key order so repeated builds over the same input are identical.

use chrono::{DateTime, Utc};
use medallion_storage::{MeasureColumn, MeasureKind, ModelTable, StagedRecord};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, info};

use crate::error::{PipelineError, Result};

pub const CHURN_SUMMARY: &str = "churn_summary";
pub const REVENUE_ANALYSIS: &str = "revenue_analysis";
pub const SERVICE_CHURN_CORRELATION: &str = "service_churn_correlation";
pub const EXECUTIVE_SUMMARY: &str = "executive_summary";

/// Column layout of one model table
#[derive(Debug, Clone, Copy)]
pub struct ModelDefinition {
    pub name: &'static str,
    pub dimensions: &'static [&'static str],
    pub measures: &'static [(&'static str, MeasureKind)],
}

impl ModelDefinition {
    fn empty_table(&self, calculated_at: DateTime<Utc>) -> ModelTable {
        ModelTable::new(
            self.name,
            self.dimensions.iter().map(|d| d.to_string()).collect(),
            self.measures
                .iter()
                .map(|(name, kind)| MeasureColumn::new(*name, *kind))
                .collect(),
            calculated_at,
        )
    }
}

pub const MODEL_DEFINITIONS: [ModelDefinition; 4] = [
    ModelDefinition {
        name: CHURN_SUMMARY,
        dimensions: &["customer_segment"],
        measures: &[
            ("total_customers", MeasureKind::Count),
            ("churned_customers", MeasureKind::Count),
            ("churn_rate_percent", MeasureKind::Rate),
            ("avg_tenure_months", MeasureKind::Duration),
            ("avg_monthly_charges", MeasureKind::Currency),
            ("total_monthly_revenue", MeasureKind::Currency),
            ("avg_lifetime_value", MeasureKind::Currency),
        ],
    },
    ModelDefinition {
        name: REVENUE_ANALYSIS,
        dimensions: &["contract_type", "payment_method"],
        measures: &[
            ("customer_count", MeasureKind::Count),
            ("total_monthly_revenue", MeasureKind::Currency),
            ("avg_monthly_revenue", MeasureKind::Currency),
            ("total_lifetime_revenue", MeasureKind::Currency),
            ("revenue_at_risk", MeasureKind::Currency),
            ("churn_rate_percent", MeasureKind::Rate),
        ],
    },
    ModelDefinition {
        name: SERVICE_CHURN_CORRELATION,
        dimensions: &["internet_service", "online_security", "tech_support"],
        measures: &[
            ("customer_count", MeasureKind::Count),
            ("churned_customers", MeasureKind::Count),
            ("churn_rate_percent", MeasureKind::Rate),
            ("avg_monthly_charges", MeasureKind::Currency),
        ],
    },
    ModelDefinition {
        name: EXECUTIVE_SUMMARY,
        dimensions: &[],
        measures: &[
            ("total_customers", MeasureKind::Count),
            ("total_churned", MeasureKind::Count),
            ("overall_churn_rate", MeasureKind::Rate),
            ("total_monthly_revenue", MeasureKind::Currency),
            ("at_risk_revenue", MeasureKind::Currency),
            ("avg_revenue_per_customer", MeasureKind::Currency),
            ("avg_customer_tenure", MeasureKind::Duration),
        ],
    },
];

pub fn definition(name: &str) -> Option<&'static ModelDefinition> {
    MODEL_DEFINITIONS.iter().find(|d| d.name == name)
}

/// Running sums for one group
#[derive(Debug, Default, Clone, Copy)]
struct GroupStats {
    customers: usize,
    churned: usize,
    tenure: f64,
    monthly: f64,
    total: f64,
    churned_monthly: f64,
}

impl GroupStats {
    fn add(&mut self, r: &StagedRecord) {
        self.customers += 1;
        self.tenure += r.tenure as f64;
        self.monthly += r.monthly_charges;
        self.total += r.total_charges;
        if r.churned {
            self.churned += 1;
            self.churned_monthly += r.monthly_charges;
        }
    }

    fn churn_rate(&self) -> f64 {
        percent(self.churned, self.customers)
    }

    fn mean(&self, sum: f64) -> f64 {
        if self.customers == 0 {
            0.0
        } else {
            sum / self.customers as f64
        }
    }
}

fn percent(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

fn group_by<F>(records: &[StagedRecord], key: F) -> BTreeMap<Vec<String>, GroupStats>
where
    F: Fn(&StagedRecord) -> Vec<String>,
{
    let mut groups: BTreeMap<Vec<String>, GroupStats> = BTreeMap::new();
    for r in records {
        groups.entry(key(r)).or_default().add(r);
    }
    groups
}

/// Fail when a grouping dimension carries no usable value at all
fn require_dimension<F>(records: &[StagedRecord], table: &str, dim: &str, value: F) -> Result<()>
where
    F: Fn(&StagedRecord) -> &str,
{
    if records.iter().all(|r| value(r).trim().is_empty()) {
        return Err(PipelineError::aggregation(
            table,
            format!("dimension {} is blank for every record", dim),
        ));
    }
    Ok(())
}

/// Builds every gold model from a staged set
pub struct GoldBuilder {
    min_sample_size: usize,
}

impl GoldBuilder {
    pub fn new(min_sample_size: usize) -> Self {
        Self { min_sample_size }
    }

    pub fn build(
        &self,
        records: &[StagedRecord],
        calculated_at: DateTime<Utc>,
    ) -> Result<Vec<ModelTable>> {
        let start = Instant::now();
        if records.is_empty() {
            return Err(PipelineError::aggregation("*", "staged set is empty"));
        }

        let tables = vec![
            self.churn_summary(records, calculated_at)?,
            self.revenue_analysis(records, calculated_at)?,
            self.service_churn_correlation(records, calculated_at)?,
            self.executive_summary(records, calculated_at)?,
        ];

        info!(
            "GoldBuilder: built {} tables from {} records in {}ms",
            tables.len(),
            records.len(),
            start.elapsed().as_millis()
        );
        Ok(tables)
    }

    fn churn_summary(
        &self,
        records: &[StagedRecord],
        calculated_at: DateTime<Utc>,
    ) -> Result<ModelTable> {
        let mut table = MODEL_DEFINITIONS[0].empty_table(calculated_at);

        // Segment order (New, Growing, Loyal) rather than alphabetical
        let mut groups: BTreeMap<_, GroupStats> = BTreeMap::new();
        for r in records {
            groups.entry(r.customer_segment).or_default().add(r);
        }

        for (segment, g) in groups {
            table.push_row(
                vec![segment.as_str().to_string()],
                vec![
                    g.customers as f64,
                    g.churned as f64,
                    g.churn_rate(),
                    g.mean(g.tenure),
                    g.mean(g.monthly),
                    g.monthly,
                    g.mean(g.total),
                ],
            )?;
        }
        Ok(table)
    }

    fn revenue_analysis(
        &self,
        records: &[StagedRecord],
        calculated_at: DateTime<Utc>,
    ) -> Result<ModelTable> {
        require_dimension(records, REVENUE_ANALYSIS, "contract_type", |r| r.contract_type.as_str())?;
        require_dimension(records, REVENUE_ANALYSIS, "payment_method", |r| r.payment_method.as_str())?;

        let mut table = MODEL_DEFINITIONS[1].empty_table(calculated_at);
        let groups = group_by(records, |r| {
            vec![r.contract_type.clone(), r.payment_method.clone()]
        });

        for (key, g) in groups {
            table.push_row(
                key,
                vec![
                    g.customers as f64,
                    g.monthly,
                    g.mean(g.monthly),
                    g.total,
                    g.churned_monthly,
                    g.churn_rate(),
                ],
            )?;
        }
        Ok(table)
    }

    fn service_churn_correlation(
        &self,
        records: &[StagedRecord],
        calculated_at: DateTime<Utc>,
    ) -> Result<ModelTable> {
        let table_name = SERVICE_CHURN_CORRELATION;
        require_dimension(records, table_name, "internet_service", |r| r.internet_service.as_str())?;
        require_dimension(records, table_name, "online_security", |r| r.online_security.as_str())?;
        require_dimension(records, table_name, "tech_support", |r| r.tech_support.as_str())?;

        let mut table = MODEL_DEFINITIONS[2].empty_table(calculated_at);
        let groups = group_by(records, |r| {
            vec![
                r.internet_service.clone(),
                r.online_security.clone(),
                r.tech_support.clone(),
            ]
        });

        let mut dropped = 0usize;
        for (key, g) in groups {
            if g.customers < self.min_sample_size {
                debug!(
                    "Dropping service group {:?}: {} customers < {}",
                    key, g.customers, self.min_sample_size
                );
                dropped += 1;
                continue;
            }
            table.push_row(
                key,
                vec![
                    g.customers as f64,
                    g.churned as f64,
                    g.churn_rate(),
                    g.mean(g.monthly),
                ],
            )?;
        }

        if dropped > 0 {
            info!(
                "GoldBuilder: dropped {} service groups below {} customers",
                dropped, self.min_sample_size
            );
        }
        Ok(table)
    }

    fn executive_summary(
        &self,
        records: &[StagedRecord],
        calculated_at: DateTime<Utc>,
    ) -> Result<ModelTable> {
        let mut table = MODEL_DEFINITIONS[3].empty_table(calculated_at);
        let mut g = GroupStats::default();
        for r in records {
            g.add(r);
        }

        table.push_row(
            vec![],
            vec![
                g.customers as f64,
                g.churned as f64,
                g.churn_rate(),
                g.monthly,
                g.churned_monthly,
                g.mean(g.monthly),
                g.mean(g.tenure),
            ],
        )?;
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medallion_storage::CustomerSegment;

    fn record(id: usize, tenure: u32, monthly: f64, churned: bool) -> StagedRecord {
        let total = monthly * tenure as f64;
        StagedRecord {
            customer_id: format!("C{:05}", id),
            gender: "Male".to_string(),
            senior_citizen: false,
            partner: false,
            dependents: false,
            tenure,
            phone_service: true,
            multiple_lines: "No".to_string(),
            internet_service: "DSL".to_string(),
            online_security: "No".to_string(),
            online_backup: "No".to_string(),
            device_protection: "No".to_string(),
            tech_support: "No".to_string(),
            streaming_tv: "No".to_string(),
            streaming_movies: "No".to_string(),
            contract_type: "Month-to-month".to_string(),
            paperless_billing: true,
            payment_method: "Mailed check".to_string(),
            monthly_charges: monthly,
            total_charges: total,
            avg_monthly_revenue: if tenure == 0 { monthly } else { total / tenure as f64 },
            customer_segment: CustomerSegment::from_tenure(tenure),
            churned,
            ingested_at: Utc::now(),
        }
    }

    #[test]
    fn test_empty_staged_set_fails() {
        let err = GoldBuilder::new(10).build(&[], Utc::now()).unwrap_err();
        assert!(matches!(err, PipelineError::AggregationError { .. }));
    }

    #[test]
    fn test_churn_summary_by_segment() {
        let records = vec![
            record(1, 1, 10.0, true),
            record(2, 2, 20.0, false),
            record(3, 40, 30.0, false),
        ];
        let tables = GoldBuilder::new(1).build(&records, Utc::now()).unwrap();
        let summary = &tables[0];

        let segments: Vec<_> = summary.rows.iter().map(|r| r.dimensions[0].as_str()).collect();
        assert_eq!(segments, vec!["New", "Loyal"]);

        let new = summary.find_row(&["New"]).unwrap();
        assert_eq!(summary.measure(new, "total_customers"), Some(2.0));
        assert_eq!(summary.measure(new, "churn_rate_percent"), Some(50.0));
        assert_eq!(summary.measure(new, "avg_tenure_months"), Some(1.5));
        assert_eq!(summary.measure(new, "total_monthly_revenue"), Some(30.0));
        assert_eq!(summary.measure(new, "avg_lifetime_value"), Some(25.0));
    }

    #[test]
    fn test_small_service_groups_are_dropped() {
        let mut records: Vec<_> = (0..12).map(|i| record(i, 5, 50.0, i % 3 == 0)).collect();
        for i in 100..104 {
            let mut r = record(i, 5, 80.0, true);
            r.internet_service = "Fiber optic".to_string();
            records.push(r);
        }

        let tables = GoldBuilder::new(10).build(&records, Utc::now()).unwrap();
        let services = &tables[2];
        assert_eq!(services.rows.len(), 1);
        assert!(services.find_row(&["Fiber optic", "No", "No"]).is_none());
        assert!(services.find_row(&["DSL", "No", "No"]).is_some());
    }

    #[test]
    fn test_executive_summary_matches_segments() {
        let records: Vec<_> = (0..30)
            .map(|i| record(i, (i * 3) as u32, 19.95 + i as f64, i % 4 == 0))
            .collect();
        let tables = GoldBuilder::new(10).build(&records, Utc::now()).unwrap();

        let summary = &tables[0];
        let segment_total: f64 = summary
            .rows
            .iter()
            .filter_map(|row| summary.measure(row, "total_customers"))
            .sum();

        let exec = &tables[3];
        assert!(exec.dimensions.is_empty());
        assert_eq!(exec.rows.len(), 1);
        assert_eq!(exec.measure(&exec.rows[0], "total_customers"), Some(segment_total));
        assert_eq!(exec.measure(&exec.rows[0], "total_churned"), Some(8.0));
    }

    #[test]
    fn test_blank_dimension_fails() {
        let records: Vec<_> = (0..3)
            .map(|i| {
                let mut r = record(i, 5, 10.0, false);
                r.payment_method = String::new();
                r
            })
            .collect();
        let err = GoldBuilder::new(1).build(&records, Utc::now()).unwrap_err();
        match err {
            PipelineError::AggregationError { table, reason } => {
                assert_eq!(table, REVENUE_ANALYSIS);
                assert!(reason.contains("payment_method"));
            }
            other => panic!("Expected AggregationError, got {:?}", other),
        }
    }

    #[test]
    fn test_revenue_at_risk_counts_churned_only() {
        let records = vec![record(1, 3, 10.0, true), record(2, 3, 25.0, false)];
        let tables = GoldBuilder::new(1).build(&records, Utc::now()).unwrap();
        let revenue = &tables[1];
        let row = revenue.find_row(&["Month-to-month", "Mailed check"]).unwrap();
        assert_eq!(revenue.measure(row, "revenue_at_risk"), Some(10.0));
        assert_eq!(revenue.measure(row, "total_monthly_revenue"), Some(35.0));
        assert_eq!(revenue.measure(row, "total_lifetime_revenue"), Some(105.0));
    }
}
