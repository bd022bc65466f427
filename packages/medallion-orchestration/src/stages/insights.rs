//! Business insights read off the gold models
//!
//! Nothing here aggregates staged records again: every figure comes from
//! `executive_summary`, `churn_summary` or `revenue_analysis`.

use medallion_storage::{round_to, ModelTable};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

use super::gold::{CHURN_SUMMARY, EXECUTIVE_SUMMARY, REVENUE_ANALYSIS};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentFocus {
    pub segment: String,
    pub churn_rate_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractRevenue {
    pub contract_type: String,
    pub total_monthly_revenue: f64,
}

/// Headline figures for one set of gold models
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusinessInsights {
    pub total_customers: f64,
    pub overall_churn_rate: f64,
    pub total_monthly_revenue: f64,
    /// Monthly revenue of churned customers
    pub at_risk_revenue: f64,
    /// Share of monthly revenue that is at risk, 0 when there is no revenue
    pub at_risk_percent: f64,
    /// `at_risk_revenue` over twelve months
    pub annual_revenue_impact: f64,
    /// Segment with the highest churn rate
    pub priority_segment: Option<SegmentFocus>,
    /// Contract type with the most monthly revenue, summed over payment methods
    pub top_contract: Option<ContractRevenue>,
}

fn find<'a>(tables: &'a [ModelTable], name: &str) -> Option<&'a ModelTable> {
    tables.iter().find(|t| t.name == name)
}

impl BusinessInsights {
    /// `None` when the executive summary is missing or empty
    pub fn from_tables(tables: &[ModelTable]) -> Option<Self> {
        let exec = find(tables, EXECUTIVE_SUMMARY)?;
        let row = exec.rows.first()?;
        let measure = |name: &str| exec.measure(row, name).unwrap_or(0.0);

        let total_monthly_revenue = measure("total_monthly_revenue");
        let at_risk_revenue = measure("at_risk_revenue");
        let at_risk_percent = if total_monthly_revenue > 0.0 {
            round_to(at_risk_revenue / total_monthly_revenue * 100.0, 2)
        } else {
            0.0
        };

        Some(Self {
            total_customers: measure("total_customers"),
            overall_churn_rate: measure("overall_churn_rate"),
            total_monthly_revenue,
            at_risk_revenue,
            at_risk_percent,
            annual_revenue_impact: round_to(at_risk_revenue * 12.0, 2),
            priority_segment: find(tables, CHURN_SUMMARY).and_then(priority_segment),
            top_contract: find(tables, REVENUE_ANALYSIS).and_then(top_contract),
        })
    }

    pub fn log(&self) {
        info!(
            "Insights: {} customers, {:.2}% churn, {:.2} monthly revenue",
            self.total_customers, self.overall_churn_rate, self.total_monthly_revenue
        );
        info!(
            "Insights: {:.2} monthly revenue at risk ({:.2}% of total, {:.2} per year)",
            self.at_risk_revenue, self.at_risk_percent, self.annual_revenue_impact
        );
        if let Some(focus) = &self.priority_segment {
            info!(
                "Insights: priority segment {} ({:.2}% churn)",
                focus.segment, focus.churn_rate_percent
            );
        }
        if let Some(top) = &self.top_contract {
            info!(
                "Insights: highest-revenue contract type {} ({:.2}/month)",
                top.contract_type, top.total_monthly_revenue
            );
        }
    }
}

/// First segment with the highest churn rate, in table order
fn priority_segment(summary: &ModelTable) -> Option<SegmentFocus> {
    let mut best: Option<SegmentFocus> = None;
    for row in &summary.rows {
        let rate = summary.measure(row, "churn_rate_percent")?;
        if best.as_ref().map_or(true, |b| rate > b.churn_rate_percent) {
            best = Some(SegmentFocus {
                segment: row.dimensions.first()?.clone(),
                churn_rate_percent: rate,
            });
        }
    }
    best
}

fn top_contract(revenue: &ModelTable) -> Option<ContractRevenue> {
    let mut by_contract: BTreeMap<&str, f64> = BTreeMap::new();
    for row in &revenue.rows {
        let contract = row.dimensions.first()?;
        *by_contract.entry(contract.as_str()).or_default() +=
            revenue.measure(row, "total_monthly_revenue")?;
    }

    let mut top: Option<ContractRevenue> = None;
    for (contract, total) in by_contract {
        if top.as_ref().map_or(true, |t| total > t.total_monthly_revenue) {
            top = Some(ContractRevenue {
                contract_type: contract.to_string(),
                total_monthly_revenue: round_to(total, 2),
            });
        }
    }
    top
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::gold::GoldBuilder;
    use chrono::Utc;
    use medallion_storage::{CustomerSegment, StagedRecord};

    fn record(id: &str, tenure: u32, monthly: f64, contract: &str, churned: bool) -> StagedRecord {
        StagedRecord {
            customer_id: id.to_string(),
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
            contract_type: contract.to_string(),
            paperless_billing: false,
            payment_method: "Mailed check".to_string(),
            monthly_charges: monthly,
            total_charges: monthly * tenure as f64,
            avg_monthly_revenue: monthly,
            customer_segment: CustomerSegment::from_tenure(tenure),
            churned,
            ingested_at: Utc::now(),
        }
    }

    fn tables() -> Vec<ModelTable> {
        let records = vec![
            // New: 2 of 2 churned
            record("A", 3, 70.0, "Month-to-month", true),
            record("B", 5, 80.0, "Month-to-month", true),
            // Growing: 0 of 2
            record("C", 20, 50.0, "One year", false),
            record("D", 24, 50.0, "One year", false),
            // Loyal: 1 of 2
            record("E", 50, 100.0, "Two year", true),
            record("F", 60, 150.0, "Two year", false),
        ];
        GoldBuilder::new(1).build(&records, Utc::now()).unwrap()
    }

    #[test]
    fn test_insights_from_models() {
        let insights = BusinessInsights::from_tables(&tables()).unwrap();

        assert_eq!(insights.total_customers, 6.0);
        assert_eq!(insights.overall_churn_rate, 50.0);
        assert_eq!(insights.total_monthly_revenue, 500.0);
        assert_eq!(insights.at_risk_revenue, 250.0);
        assert_eq!(insights.at_risk_percent, 50.0);
        assert_eq!(insights.annual_revenue_impact, 3000.0);

        let focus = insights.priority_segment.unwrap();
        assert_eq!(focus.segment, "New");
        assert_eq!(focus.churn_rate_percent, 100.0);

        let top = insights.top_contract.unwrap();
        assert_eq!(top.contract_type, "Two year");
        assert_eq!(top.total_monthly_revenue, 250.0);
    }

    #[test]
    fn test_no_insights_without_executive_summary() {
        let partial: Vec<ModelTable> = tables()
            .into_iter()
            .filter(|t| t.name != EXECUTIVE_SUMMARY)
            .collect();
        assert!(BusinessInsights::from_tables(&partial).is_none());
        assert!(BusinessInsights::from_tables(&[]).is_none());
    }

    #[test]
    fn test_insights_serialize_for_reports() {
        let insights = BusinessInsights::from_tables(&tables()).unwrap();
        let json = serde_json::to_value(&insights).unwrap();
        assert_eq!(json["priority_segment"]["segment"], "New");
        assert_eq!(json["annual_revenue_impact"], 3000.0);
    }
}
