//! Benchmark for the staging and modeling stages
//!
//! Measures:
//! - Silver transform (parse + coerce + dedup)
//! - Gold build (all four models)
//! - Full in-memory run, landing to gate
//! - Scaling with extract size

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use medallion_orchestration::{
    DedupPolicy, GoldBuilder, InMemoryRawStore, InMemorySource, PipelineConfig,
    PipelineOrchestrator, RawTable, RowErrorPolicy, SilverTransformer, SourceConfig,
};
use medallion_storage::{InMemoryRunLedger, InMemoryWarehouse};
use std::sync::Arc;

const HEADER: &str = "customerID,gender,SeniorCitizen,Partner,Dependents,tenure,PhoneService,MultipleLines,InternetService,OnlineSecurity,OnlineBackup,DeviceProtection,TechSupport,StreamingTV,StreamingMovies,Contract,PaperlessBilling,PaymentMethod,MonthlyCharges,TotalCharges,Churn";

/// Generate a churn extract with `rows` customers
fn generate_extract(rows: usize) -> String {
    let contracts = ["Month-to-month", "One year", "Two year"];
    let payments = ["Electronic check", "Mailed check", "Credit card (automatic)"];
    let internet = ["DSL", "Fiber optic", "No"];

    let mut csv = String::from(HEADER);
    for i in 0..rows {
        let tenure = i % 73;
        let monthly = 18.25 + (i % 100) as f64 * 0.85;
        let total = if tenure == 0 {
            String::new()
        } else {
            format!("{:.2}", monthly * tenure as f64)
        };
        let service = internet[i % 3];
        let extra = if service == "No" { "No internet service" } else { "Yes" };
        csv.push_str(&format!(
            "\n{:05}-BENCH,Male,{},No,Yes,{},Yes,No,{},{},No,No,{},No,No,{},Yes,{},{:.2},{},{}",
            i,
            i % 2,
            tenure,
            service,
            extra,
            extra,
            contracts[i % 3],
            payments[(i / 3) % 3],
            monthly,
            total,
            if i % 4 == 0 { "Yes" } else { "No" }
        ));
    }
    csv.push('\n');
    csv
}

fn bench_silver_transform(c: &mut Criterion) {
    let mut group = c.benchmark_group("silver_transform");

    for rows in [1_000, 7_043, 50_000].iter() {
        let table = RawTable::parse(generate_extract(*rows).as_bytes()).expect("parse failed");
        let transformer = SilverTransformer::new(DedupPolicy::KeepFirst, RowErrorPolicy::Abort);

        group.bench_with_input(BenchmarkId::from_parameter(rows), &table, |b, table| {
            b.iter(|| {
                let staged = transformer
                    .transform(table, Utc::now())
                    .expect("transform failed");
                black_box(staged);
            });
        });
    }

    group.finish();
}

fn bench_gold_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("gold_build");

    for rows in [1_000, 7_043, 50_000].iter() {
        let table = RawTable::parse(generate_extract(*rows).as_bytes()).expect("parse failed");
        let staged = SilverTransformer::new(DedupPolicy::KeepFirst, RowErrorPolicy::Abort)
            .transform(&table, Utc::now())
            .expect("transform failed");
        let builder = GoldBuilder::new(10);

        group.bench_with_input(
            BenchmarkId::from_parameter(rows),
            &staged.records,
            |b, records| {
                b.iter(|| {
                    let tables = builder.build(records, Utc::now()).expect("build failed");
                    black_box(tables);
                });
            },
        );
    }

    group.finish();
}

fn bench_full_run(c: &mut Criterion) {
    let mut group = c.benchmark_group("full_run");
    group.sample_size(20);

    let rt = tokio::runtime::Runtime::new().unwrap();
    for rows in [1_000, 7_043].iter() {
        let extract = generate_extract(*rows);

        group.bench_with_input(BenchmarkId::from_parameter(rows), &extract, |b, extract| {
            b.iter(|| {
                rt.block_on(async {
                    let config = PipelineConfig::new(
                        SourceConfig::Local {
                            path: "bench.csv".into(),
                        },
                        DedupPolicy::KeepFirst,
                    );
                    let orchestrator = PipelineOrchestrator::new(
                        config,
                        Arc::new(InMemorySource::new(extract.clone())),
                        Arc::new(InMemoryRawStore::new()),
                        Arc::new(InMemoryWarehouse::new()),
                        Arc::new(InMemoryRunLedger::new()),
                    )
                    .expect("invalid config");

                    let outcome = orchestrator.run().await.expect("run failed");
                    assert!(outcome.is_success());
                    black_box(outcome);
                });
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_silver_transform,
    bench_gold_build,
    bench_full_run
);
criterion_main!(benches);
