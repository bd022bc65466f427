//! Property tests for the staging and modeling invariants

mod common;

use chrono::Utc;
use common::{to_csv, Customer};
use medallion_orchestration::stages::silver::avg_monthly_revenue;
use medallion_orchestration::{
    DedupPolicy, GoldBuilder, RawTable, RowErrorPolicy, SilverTransformer, StagedSet,
};
use medallion_storage::{is_rounded_to, CustomerSegment, MeasureKind};
use proptest::prelude::*;
use std::collections::HashSet;

const INTERNET: [&str; 3] = ["DSL", "Fiber optic", "No"];

/// (id slot, tenure, monthly cents, churned, internet)
fn customers(max_ids: usize) -> impl Strategy<Value = Vec<Customer>> {
    prop::collection::vec(
        (0..max_ids, 0u32..90, 1_800u32..12_000, any::<bool>(), 0usize..3),
        1..150,
    )
    .prop_map(|rows| {
        rows.into_iter()
            .map(|(slot, tenure, cents, churned, internet)| {
                let monthly = cents as f64 / 100.0;
                let mut c = Customer::new(format!("ID-{:05}", slot), tenure, monthly, churned);
                c.internet = INTERNET[internet];
                if tenure == 0 && cents % 2 == 0 {
                    c.total = None;
                }
                c
            })
            .collect()
    })
}

fn stage(customers: &[Customer], dedup: DedupPolicy) -> StagedSet {
    let table = RawTable::parse(to_csv(customers).as_bytes()).unwrap();
    SilverTransformer::new(dedup, RowErrorPolicy::Abort)
        .transform(&table, Utc::now())
        .unwrap()
}

proptest! {
    #[test]
    fn prop_segment_is_pure_function_of_tenure(tenure in any::<u32>()) {
        let segment = CustomerSegment::from_tenure(tenure);
        let expected = if tenure < 12 {
            CustomerSegment::New
        } else if tenure < 36 {
            CustomerSegment::Growing
        } else {
            CustomerSegment::Loyal
        };
        prop_assert_eq!(segment, expected);
        prop_assert_eq!(CustomerSegment::from_tenure(tenure), segment);
    }

    #[test]
    fn prop_avg_revenue_never_divides_by_zero(
        tenure in 0u32..1000,
        monthly in 0.0f64..500.0,
        total in 0.0f64..100_000.0,
    ) {
        let avg = avg_monthly_revenue(tenure, monthly, total);
        prop_assert!(avg.is_finite());
        if tenure == 0 {
            prop_assert_eq!(avg, monthly);
        }
    }

    #[test]
    fn prop_staged_identities_are_unique(
        rows in customers(40),
        keep_last in any::<bool>(),
    ) {
        let policy = if keep_last { DedupPolicy::KeepLast } else { DedupPolicy::KeepFirst };
        let staged = stage(&rows, policy);

        let distinct: HashSet<&str> = rows.iter().map(|c| c.id.as_str()).collect();
        let mut seen = HashSet::new();
        for r in &staged.records {
            prop_assert!(seen.insert(r.customer_id.as_str()), "duplicate {}", r.customer_id);
            prop_assert_eq!(r.customer_segment, CustomerSegment::from_tenure(r.tenure));
        }
        prop_assert_eq!(staged.records.len(), distinct.len());
        prop_assert_eq!(staged.duplicates_dropped, rows.len() - distinct.len());
    }

    #[test]
    fn prop_rates_are_bounded_and_rounded(rows in customers(10_000), min in 1usize..15) {
        let staged = stage(&rows, DedupPolicy::KeepFirst);
        let tables = GoldBuilder::new(min).build(&staged.records, Utc::now()).unwrap();

        for table in &tables {
            for row in &table.rows {
                for (value, column) in row.measures.iter().zip(&table.measures) {
                    prop_assert!(is_rounded_to(*value, column.kind.decimal_places()));
                    if column.kind == MeasureKind::Rate {
                        prop_assert!(
                            (0.0..=100.0).contains(value),
                            "{}.{} = {}", table.name, column.name, value
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn prop_models_are_deterministic(rows in customers(10_000)) {
        let staged = stage(&rows, DedupPolicy::KeepFirst);
        let builder = GoldBuilder::new(3);

        let first = builder.build(&staged.records, Utc::now()).unwrap();
        let second = builder.build(&staged.records, Utc::now()).unwrap();

        prop_assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(&second) {
            prop_assert_eq!(&a.name, &b.name);
            prop_assert_eq!(&a.rows, &b.rows);
        }
    }
}
