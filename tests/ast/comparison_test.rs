//! Tests for time comparison measures and the base/comparison join.

use chrono::{TimeZone, Utc};
use metricsview::ast::{Ast, JoinType};
use metricsview::model::{
    Dimension, DimensionSpec, Measure, MeasureCompute, MeasureSpec, MetricsViewSpec, Query,
    ResolvedSecurity, TimeGrain, TimeRange, Value,
};
use metricsview::sql::Dialect;

fn view() -> MetricsViewSpec {
    MetricsViewSpec {
        name: "sales".into(),
        table: "orders".into(),
        time_dimension: "ts".into(),
        dimensions: vec![DimensionSpec::column("country")],
        measures: vec![
            MeasureSpec::simple("total", "SUM(amount)"),
            MeasureSpec::simple("cnt", "COUNT(*)"),
            MeasureSpec::derived("avg", "total / cnt", &["total", "cnt"]),
        ],
        ..Default::default()
    }
}

fn january() -> TimeRange {
    TimeRange::new(
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(),
    )
}

fn december() -> TimeRange {
    TimeRange::new(
        Utc.with_ymd_and_hms(2023, 12, 1, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
    )
}

fn comparison_query(compute: MeasureCompute) -> Query {
    Query {
        dimensions: vec![Dimension::new("country")],
        measures: vec![
            Measure::new("total"),
            Measure::computed("total_prev", compute),
        ],
        time_range: Some(january()),
        comparison_time_range: Some(december()),
        ..Default::default()
    }
}

fn compile(q: &Query) -> (String, Vec<Value>) {
    let mv = view();
    let sec = ResolvedSecurity::open();
    Ast::new(&mv, &sec, q, Dialect::DuckDb)
        .unwrap()
        .sql()
        .unwrap()
}

#[test]
fn test_comparison_value_joins_both_ranges() {
    let q = comparison_query(MeasureCompute::ComparisonValue {
        measure: "total".into(),
    });
    let (sql, args) = compile(&q);

    assert_eq!(
        sql,
        r#"SELECT (COALESCE(base."country", comparison."country")) AS "country", (base."total") AS "total", (comparison."total") AS "total_prev" FROM (SELECT ("country") AS "country", (SUM(amount)) AS "total" FROM "orders" WHERE ("ts" >= ? AND "ts" < ?) GROUP BY 1) base FULL OUTER JOIN (SELECT ("country") AS "country", (SUM(amount)) AS "total" FROM "orders" WHERE ("ts" >= ? AND "ts" < ?) GROUP BY 1) comparison ON base."country" IS NOT DISTINCT FROM comparison."country""#
    );

    let jan = january();
    let dec = december();
    assert_eq!(
        args,
        vec![
            Value::Timestamp(jan.start.unwrap()),
            Value::Timestamp(jan.end.unwrap()),
            Value::Timestamp(dec.start.unwrap()),
            Value::Timestamp(dec.end.unwrap()),
        ]
    );
}

#[test]
fn test_comparison_join_shape() {
    let q = comparison_query(MeasureCompute::ComparisonValue {
        measure: "total".into(),
    });
    let mv = view();
    let sec = ResolvedSecurity::open();
    let ast = Ast::new(&mv, &sec, &q, Dialect::DuckDb).unwrap();

    let Some((comparison, join_type)) = ast.root.comparison() else {
        panic!("expected a comparison join");
    };
    assert_eq!(join_type, JoinType::Full);
    assert_eq!(comparison.alias, "comparison");
    assert_eq!(ast.root.inner().map(|n| n.alias.as_str()), Some("base"));
}

#[test]
fn test_comparison_delta_and_ratio() {
    let q = comparison_query(MeasureCompute::ComparisonDelta {
        measure: "total".into(),
    });
    let (sql, _) = compile(&q);
    assert!(
        sql.contains(r#"(base."total" - comparison."total") AS "total_prev""#),
        "{}",
        sql
    );

    let q = comparison_query(MeasureCompute::ComparisonRatio {
        measure: "total".into(),
    });
    let (sql, _) = compile(&q);
    assert!(
        sql.contains(r#"((base."total" - comparison."total")/CAST(comparison."total" AS DOUBLE)) AS "total_prev""#),
        "{}",
        sql
    );
}

#[test]
fn test_comparison_requires_range() {
    let mut q = comparison_query(MeasureCompute::ComparisonValue {
        measure: "total".into(),
    });
    q.comparison_time_range = None;

    let mv = view();
    let sec = ResolvedSecurity::open();
    let err = Ast::new(&mv, &sec, &q, Dialect::DuckDb).unwrap_err();
    assert_eq!(
        err.to_string(),
        "can't query measure \"total_prev\": comparison time range not provided"
    );
}

#[test]
fn test_derived_measure_below_comparison() {
    let q = Query {
        dimensions: vec![Dimension::new("country")],
        measures: vec![
            Measure::computed(
                "total_prev",
                MeasureCompute::ComparisonValue {
                    measure: "total".into(),
                },
            ),
            Measure::new("avg"),
        ],
        time_range: Some(january()),
        comparison_time_range: Some(december()),
        ..Default::default()
    };
    let mv = view();
    let sec = ResolvedSecurity::open();
    let ast = Ast::new(&mv, &sec, &q, Dialect::DuckDb).unwrap();

    // The derived measure resolves inside the base select only.
    let Some(base) = ast.root.inner() else {
        panic!("expected a base select");
    };
    assert!(base.has_measure("avg"));
    assert_eq!(
        ast.root.field("avg").map(|f| f.expr.as_str()),
        Some(r#"base."avg""#)
    );
}

#[test]
fn test_time_floor_shifted_onto_base_range() {
    let q = Query {
        dimensions: vec![Dimension::time_floor("day", "ts", TimeGrain::Day)],
        measures: vec![
            Measure::new("total"),
            Measure::computed(
                "total_prev",
                MeasureCompute::ComparisonValue {
                    measure: "total".into(),
                },
            ),
        ],
        time_range: Some(january()),
        comparison_time_range: Some(december()),
        ..Default::default()
    };
    let (sql, _) = compile(&q);

    let Some((_, comparison)) = sql.split_once(" FULL OUTER JOIN ") else {
        panic!("expected a comparison join: {}", sql);
    };
    assert!(
        comparison.starts_with(r#"(SELECT ((date_trunc('DAY', "ts"::TIMESTAMP)::TIMESTAMP - INTERVAL (DATEDIFF('DAY', "#),
        "{}",
        comparison
    );
    assert!(
        comparison.ends_with(r#"comparison ON base."day" IS NOT DISTINCT FROM comparison."day""#),
        "{}",
        comparison
    );
}

#[test]
fn test_comparison_time_measure() {
    let q = Query {
        dimensions: vec![Dimension::time_floor("day", "ts", TimeGrain::Day)],
        measures: vec![
            Measure::new("total"),
            Measure::computed(
                "day_prev",
                MeasureCompute::ComparisonTime {
                    dimension: "day".into(),
                },
            ),
        ],
        time_range: Some(january()),
        comparison_time_range: Some(december()),
        ..Default::default()
    };
    let mv = view();
    let sec = ResolvedSecurity::open();
    let ast = Ast::new(&mv, &sec, &q, Dialect::DuckDb).unwrap();

    let Some((comparison, _)) = ast.root.comparison() else {
        panic!("expected a comparison join");
    };
    assert_eq!(
        comparison.field("day_prev").map(|f| f.expr.as_str()),
        Some("ANY_VALUE(date_trunc('DAY', \"ts\"::TIMESTAMP)::TIMESTAMP)")
    );
    assert_eq!(
        ast.root.field("day_prev").map(|f| f.expr.as_str()),
        Some(r#"comparison."day_prev""#)
    );
}

#[test]
fn test_time_floor_comparison_requires_starts() {
    let q = Query {
        dimensions: vec![Dimension::time_floor("day", "ts", TimeGrain::Day)],
        measures: vec![Measure::computed(
            "total_prev",
            MeasureCompute::ComparisonValue {
                measure: "total".into(),
            },
        )],
        time_range: Some(TimeRange {
            end: january().end,
            ..Default::default()
        }),
        comparison_time_range: Some(december()),
        ..Default::default()
    };
    let mv = view();
    let sec = ResolvedSecurity::open();
    let err = Ast::new(&mv, &sec, &q, Dialect::DuckDb).unwrap_err();
    assert!(
        err.to_string()
            .contains("must specify an explicit start time for both the base and comparison time range"),
        "{}",
        err
    );
}
