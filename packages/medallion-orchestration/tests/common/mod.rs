//! Shared fixtures: synthetic churn extracts and an in-memory harness

#![allow(dead_code)]

use medallion_orchestration::{
    DedupPolicy, InMemoryRawStore, InMemorySource, PipelineConfig, PipelineOrchestrator,
    SourceConfig,
};
use medallion_storage::{InMemoryRunLedger, InMemoryWarehouse};
use std::sync::Arc;

pub const HEADER: &str = "customerID,gender,SeniorCitizen,Partner,Dependents,tenure,PhoneService,MultipleLines,InternetService,OnlineSecurity,OnlineBackup,DeviceProtection,TechSupport,StreamingTV,StreamingMovies,Contract,PaperlessBilling,PaymentMethod,MonthlyCharges,TotalCharges,Churn";

const CONTRACTS: [&str; 3] = ["Month-to-month", "One year", "Two year"];
const PAYMENTS: [&str; 4] = [
    "Electronic check",
    "Mailed check",
    "Bank transfer (automatic)",
    "Credit card (automatic)",
];
const INTERNET: [&str; 3] = ["DSL", "Fiber optic", "No"];

/// One synthetic customer; `total` of `None` is written as a blank cell
#[derive(Debug, Clone)]
pub struct Customer {
    pub id: String,
    pub tenure: u32,
    pub monthly: f64,
    pub total: Option<f64>,
    pub churned: bool,
    pub contract: &'static str,
    pub payment: &'static str,
    pub internet: &'static str,
    pub security: &'static str,
    pub tech_support: &'static str,
}

impl Customer {
    pub fn new(id: impl Into<String>, tenure: u32, monthly: f64, churned: bool) -> Self {
        Self {
            id: id.into(),
            tenure,
            monthly,
            total: Some(monthly * tenure as f64),
            churned,
            contract: CONTRACTS[0],
            payment: PAYMENTS[0],
            internet: INTERNET[0],
            security: "No",
            tech_support: "No",
        }
    }

    pub fn services(
        mut self,
        internet: &'static str,
        security: &'static str,
        tech: &'static str,
    ) -> Self {
        self.internet = internet;
        self.security = security;
        self.tech_support = tech;
        self
    }

    pub fn to_csv(&self) -> String {
        let total = self.total.map(|t| format!("{:.2}", t)).unwrap_or_default();
        format!(
            "{},Female,0,Yes,No,{},Yes,No,{},{},No,No,{},No,No,{},Yes,{},{:.2},{},{}",
            self.id,
            self.tenure,
            self.internet,
            self.security,
            self.tech_support,
            self.contract,
            self.payment,
            self.monthly,
            total,
            if self.churned { "Yes" } else { "No" }
        )
    }
}

pub fn to_csv(customers: &[Customer]) -> String {
    let mut out = String::from(HEADER);
    for c in customers {
        out.push('\n');
        out.push_str(&c.to_csv());
    }
    out.push('\n');
    out
}

/// `rows` customers of which the first `churned` churned, spread across
/// every contract, payment method, service and tenure bucket
pub fn population(rows: usize, churned: usize) -> Vec<Customer> {
    (0..rows)
        .map(|i| {
            let tenure = (i % 73) as u32;
            let monthly = 18.25 + (i % 100) as f64 * 0.85;
            let internet = INTERNET[i % 3];
            let (security, tech) = if internet == "No" {
                ("No internet service", "No internet service")
            } else {
                (
                    if i % 2 == 0 { "Yes" } else { "No" },
                    if i % 5 == 0 { "Yes" } else { "No" },
                )
            };
            let mut c = Customer::new(format!("{:04}-CUST", i), tenure, monthly, i < churned)
                .services(internet, security, tech);
            c.contract = CONTRACTS[i % 3];
            c.payment = PAYMENTS[(i / 3) % 4];
            if tenure == 0 {
                c.total = None;
            }
            c
        })
        .collect()
}

pub fn config() -> PipelineConfig {
    PipelineConfig::new(
        SourceConfig::Local {
            path: "telco.csv".into(),
        },
        DedupPolicy::KeepFirst,
    )
}

/// Orchestrator wired to in-memory adapters that the test can inspect
pub struct Harness {
    pub orchestrator: PipelineOrchestrator,
    pub source: Arc<InMemorySource>,
    pub raw_store: Arc<InMemoryRawStore>,
    pub warehouse: Arc<InMemoryWarehouse>,
    pub ledger: Arc<InMemoryRunLedger>,
}

impl Harness {
    pub fn new(config: PipelineConfig, source: InMemorySource) -> Self {
        let source = Arc::new(source);
        let raw_store = Arc::new(InMemoryRawStore::new());
        let warehouse = Arc::new(InMemoryWarehouse::new());
        let ledger = Arc::new(InMemoryRunLedger::new());
        let orchestrator = PipelineOrchestrator::new(
            config,
            source.clone(),
            raw_store.clone(),
            warehouse.clone(),
            ledger.clone(),
        )
        .expect("valid config");

        Self {
            orchestrator,
            source,
            raw_store,
            warehouse,
            ledger,
        }
    }

    pub fn with_csv(config: PipelineConfig, csv: String) -> Self {
        Self::new(config, InMemorySource::new(csv))
    }
}
