//! Tests for the AST rewrite passes and query rewrites.

use chrono::{TimeZone, Utc};
use metricsview::ast::{Ast, JoinType};
use metricsview::config::ExecutorSettings;
use metricsview::executor::apply_static_passes;
use metricsview::executor::rewrites::pivot::PivotPlan;
use metricsview::executor::rewrites::time_ranges::resolve_time_range;
use metricsview::model::{
    Dimension, DimensionSpec, Expression, Measure, MeasureCompute, MeasureSpec, MetricsViewSpec,
    Operator, Query, ResolvedSecurity, Sort, TimeGrain, TimeRange,
};
use metricsview::sql::Dialect;

fn view() -> MetricsViewSpec {
    let mut country_name = DimensionSpec::column("country_name");
    country_name.column = "country_code".into();
    country_name.lookup_table = "countries".into();
    country_name.lookup_key_column = "code".into();
    country_name.lookup_value_column = "name".into();

    MetricsViewSpec {
        name: "sales".into(),
        table: "orders".into(),
        time_dimension: "ts".into(),
        dimensions: vec![
            DimensionSpec::column("country"),
            DimensionSpec::column("device"),
            country_name,
        ],
        measures: vec![
            MeasureSpec::simple("total", "SUM(amount)"),
            MeasureSpec::simple("cnt", "COUNT(*)"),
            MeasureSpec::derived("avg", "total / cnt", &["total", "cnt"]),
        ],
        ..Default::default()
    }
}

fn derived_query() -> Query {
    Query {
        dimensions: vec![Dimension::new("country")],
        measures: vec![Measure::new("avg")],
        sort: vec![Sort::asc("country")],
        limit: Some(10),
        ..Default::default()
    }
}

fn comparison_query(sort: Sort) -> Query {
    Query {
        dimensions: vec![Dimension::new("country")],
        measures: vec![
            Measure::new("total"),
            Measure::computed(
                "total_prev",
                MeasureCompute::ComparisonValue {
                    measure: "total".into(),
                },
            ),
            Measure::computed(
                "total_delta",
                MeasureCompute::ComparisonDelta {
                    measure: "total".into(),
                },
            ),
        ],
        sort: vec![sort],
        limit: Some(10),
        time_range: Some(TimeRange::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(),
        )),
        comparison_time_range: Some(TimeRange::new(
            Utc.with_ymd_and_hms(2023, 12, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        )),
        ..Default::default()
    }
}

/// Build, rewrite with `settings`, and render `q`.
fn rewritten_sql(q: &Query, dialect: Dialect, settings: &ExecutorSettings) -> String {
    let mv = view();
    let sec = ResolvedSecurity::open();
    let mut ast = Ast::new(&mv, &sec, q, dialect).unwrap();
    apply_static_passes(&mut ast, settings).unwrap();
    ast.sql().unwrap().0
}

// =============================================================================
// Limit pushdown
// =============================================================================

#[test]
fn test_limit_pushed_into_wrapped_select() {
    let sql = rewritten_sql(&derived_query(), Dialect::DuckDb, &ExecutorSettings::default());
    assert_eq!(
        sql,
        r#"SELECT (t1."country") AS "country", (total / cnt) AS "avg" FROM (SELECT ("country") AS "country", (SUM(amount)) AS "total", (COUNT(*)) AS "cnt" FROM "orders" GROUP BY 1 ORDER BY "country" NULLS LAST LIMIT 10) t1 ORDER BY "country" NULLS LAST LIMIT 10"#
    );
}

#[test]
fn test_limit_pushdown_includes_offset() {
    let mut q = derived_query();
    q.offset = Some(5);
    let sql = rewritten_sql(&q, Dialect::DuckDb, &ExecutorSettings::default());
    assert!(sql.contains("GROUP BY 1 ORDER BY \"country\" NULLS LAST LIMIT 15) t1"), "{}", sql);
    assert!(sql.ends_with("LIMIT 10 OFFSET 5"), "{}", sql);
}

#[test]
fn test_limit_pushdown_disabled() {
    let settings = ExecutorSettings {
        limit_pushdown: false,
        ..Default::default()
    };
    let sql = rewritten_sql(&derived_query(), Dialect::DuckDb, &settings);
    assert!(sql.contains("GROUP BY 1) t1"), "{}", sql);
}

#[test]
fn test_limit_not_pushed_below_having() {
    let mut q = derived_query();
    q.having = Some(Expression::binary(Operator::Gt, "avg", 1.0));
    let sql = rewritten_sql(&q, Dialect::DuckDb, &ExecutorSettings::default());
    assert_eq!(sql.matches("LIMIT").count(), 1, "{}", sql);
}

// =============================================================================
// Approximate comparisons
// =============================================================================

fn rewritten(q: &Query, settings: &ExecutorSettings, f: impl FnOnce(&Ast<'_>)) {
    let mv = view();
    let sec = ResolvedSecurity::open();
    let mut ast = Ast::new(&mv, &sec, q, Dialect::DuckDb).unwrap();
    apply_static_passes(&mut ast, settings).unwrap();
    f(&ast);
}

#[test]
fn test_approx_comparison_base_sort() {
    let q = comparison_query(Sort::desc("total"));
    rewritten(&q, &ExecutorSettings::default(), |ast| {
        let Some((_, join_type)) = ast.root.comparison() else {
            panic!("expected a comparison join");
        };
        assert_eq!(join_type, JoinType::Left);

        let Some(base) = ast.root.inner() else {
            panic!("expected a base select");
        };
        assert_eq!(base.limit, Some(10));
        assert_eq!(base.order_by.len(), 1);
        assert_eq!(base.order_by[0].name, "total");
        assert!(base.order_by[0].desc);

        let (sql, _) = ast.sql().unwrap();
        assert!(
            sql.contains(r#"GROUP BY 1 ORDER BY "total" DESC NULLS LAST LIMIT 10) base LEFT OUTER JOIN"#),
            "{}",
            sql
        );
    });
}

#[test]
fn test_approx_comparison_dimension_sort() {
    let q = comparison_query(Sort::asc("country"));
    rewritten(&q, &ExecutorSettings::default(), |ast| {
        let Some((_, join_type)) = ast.root.comparison() else {
            panic!("expected a comparison join");
        };
        assert_eq!(join_type, JoinType::Left);
    });
}

#[test]
fn test_approx_comparison_value_sort() {
    let q = comparison_query(Sort::desc("total_prev"));
    rewritten(&q, &ExecutorSettings::default(), |ast| {
        let Some((comparison, join_type)) = ast.root.comparison() else {
            panic!("expected a comparison join");
        };
        assert_eq!(join_type, JoinType::Right);
        assert_eq!(comparison.limit, Some(10));
        assert_eq!(comparison.order_by[0].name, "total");

        let base = ast.root.inner().unwrap();
        assert_eq!(base.limit, None);
    });
}

#[test]
fn test_approx_comparison_skips_delta_sort() {
    let q = comparison_query(Sort::desc("total_delta"));
    rewritten(&q, &ExecutorSettings::default(), |ast| {
        let Some((comparison, join_type)) = ast.root.comparison() else {
            panic!("expected a comparison join");
        };
        assert_eq!(join_type, JoinType::Full);
        assert_eq!(comparison.limit, None);
        assert_eq!(ast.root.inner().unwrap().limit, None);
    });
}

#[test]
fn test_approx_comparison_disabled() {
    let mut settings = ExecutorSettings::default();
    settings.comparisons.approximate = false;
    let q = comparison_query(Sort::desc("total"));
    rewritten(&q, &settings, |ast| {
        let Some((_, join_type)) = ast.root.comparison() else {
            panic!("expected a comparison join");
        };
        assert_eq!(join_type, JoinType::Full);
    });
}

#[test]
fn test_approx_comparison_cte() {
    let mut settings = ExecutorSettings::default();
    settings.comparisons.approximate_cte = true;
    let q = comparison_query(Sort::desc("total"));
    rewritten(&q, &settings, |ast| {
        assert_eq!(ast.ctes.len(), 1);
        assert_eq!(ast.ctes[0].alias, "base");

        let (sql, args) = ast.sql().unwrap();
        assert!(sql.starts_with("WITH base AS (SELECT "), "{}", sql);
        assert!(sql.contains(" FROM base LEFT OUTER JOIN ("), "{}", sql);
        assert!(
            sql.contains(r#"AND ("country" IN (SELECT base."country" FROM base)) GROUP BY 1) comparison"#),
            "{}",
            sql
        );
        assert_eq!(args.len(), 4);
    });
}

#[test]
fn test_approx_comparison_requires_limit() {
    let mut q = comparison_query(Sort::desc("total"));
    q.limit = None;
    rewritten(&q, &ExecutorSettings::default(), |ast| {
        let Some((_, join_type)) = ast.root.comparison() else {
            panic!("expected a comparison join");
        };
        assert_eq!(join_type, JoinType::Full);
    });
}

// =============================================================================
// Dialect passes
// =============================================================================

#[test]
fn test_druid_groups_join_nodes() {
    let mut q = comparison_query(Sort::desc("total"));
    q.sort.clear();
    q.limit = None;

    let mv = view();
    let sec = ResolvedSecurity::open();
    let mut ast = Ast::new(&mv, &sec, &q, Dialect::Druid).unwrap();
    apply_static_passes(&mut ast, &ExecutorSettings::default()).unwrap();

    assert!(ast.root.group);
    assert_eq!(
        ast.root.field("total").map(|f| f.expr.as_str()),
        Some(r#"ANY_VALUE(base."total")"#)
    );
    let (sql, _) = ast.sql().unwrap();
    assert!(
        sql.ends_with(r#"ON base."country" IS NOT DISTINCT FROM comparison."country" GROUP BY 1"#),
        "{}",
        sql
    );
}

#[test]
fn test_clickhouse_lookup_resolved_after_grouping() {
    let q = Query {
        dimensions: vec![Dimension::new("country_name")],
        measures: vec![Measure::new("total")],
        ..Default::default()
    };
    let sql = rewritten_sql(&q, Dialect::ClickHouse, &ExecutorSettings::default());
    assert_eq!(
        sql,
        r#"SELECT (dictGet('countries', 'name', t1."country_name")) AS "country_name", (any(t1."total")) AS "total" FROM (SELECT ("country_code") AS "country_name", (SUM(amount)) AS "total" FROM "orders" GROUP BY 1) t1 GROUP BY 1"#
    );
}

#[test]
fn test_clickhouse_time_floor_renamed() {
    let q = Query {
        dimensions: vec![Dimension::time_floor("ts", "ts", TimeGrain::Day)],
        measures: vec![Measure::new("total")],
        ..Default::default()
    };
    let sql = rewritten_sql(&q, Dialect::ClickHouse, &ExecutorSettings::default());
    assert_eq!(
        sql,
        r#"SELECT (t1."ts_computed") AS "ts", (t1."total") AS "total" FROM (SELECT (date_trunc('day', "ts")::DateTime64) AS "ts_computed", (SUM(amount)) AS "total" FROM "orders" GROUP BY 1) t1"#
    );
}

#[test]
fn test_passes_are_idempotent() {
    let mut cte_settings = ExecutorSettings::default();
    cte_settings.comparisons.approximate_cte = true;

    let cases = vec![
        (derived_query(), Dialect::DuckDb, ExecutorSettings::default()),
        (
            comparison_query(Sort::desc("total_prev")),
            Dialect::DuckDb,
            ExecutorSettings::default(),
        ),
        (comparison_query(Sort::desc("total")), Dialect::DuckDb, cte_settings),
        (
            comparison_query(Sort::asc("country")),
            Dialect::Druid,
            ExecutorSettings::default(),
        ),
        (
            Query {
                dimensions: vec![
                    Dimension::new("country_name"),
                    Dimension::time_floor("ts", "ts", TimeGrain::Day),
                ],
                measures: vec![Measure::new("total")],
                sort: vec![Sort::desc("total")],
                limit: Some(5),
                ..Default::default()
            },
            Dialect::ClickHouse,
            ExecutorSettings::default(),
        ),
    ];

    let mv = view();
    let sec = ResolvedSecurity::open();
    for (q, dialect, settings) in &cases {
        let mut ast = Ast::new(&mv, &sec, q, *dialect).unwrap();
        apply_static_passes(&mut ast, settings).unwrap();
        let once = ast.sql().unwrap();
        apply_static_passes(&mut ast, settings).unwrap();
        let twice = ast.sql().unwrap();
        assert_eq!(once, twice, "{:?}", dialect);
    }
}

// =============================================================================
// Query rewrites
// =============================================================================

#[test]
fn test_pivot_over_underlying_query() {
    let mut q = Query {
        dimensions: vec![Dimension::new("country"), Dimension::new("device")],
        measures: vec![Measure::new("total")],
        pivot_on: vec!["device".into()],
        sort: vec![Sort::asc("country")],
        limit: Some(100),
        ..Default::default()
    };

    let mv = view();
    let sec = ResolvedSecurity::open();
    let err = Ast::new(&mv, &sec, &q, Dialect::DuckDb).unwrap_err();
    assert_eq!(err.to_string(), "cannot build AST for pivot queries");

    let plan = PivotPlan::extract(&mut q).unwrap().unwrap();
    let ast = Ast::new(&mv, &sec, &q, Dialect::DuckDb).unwrap();
    let names = plan.output_names(&ast).unwrap();
    let (underlying, _) = ast.sql().unwrap();
    let sql = plan.sql(&names, &format!("({})", underlying)).unwrap();

    assert_eq!(
        sql,
        r#"PIVOT (SELECT ("country") AS "country", ("device") AS "device", (SUM(amount)) AS "total" FROM "orders" GROUP BY 1,2) ON "device" USING ANY_VALUE("total") AS "total" GROUP BY "country" ORDER BY "country" NULLS LAST LIMIT 100"#
    );
}

#[test]
fn test_resolve_week_rounded_range() {
    let mut tr = TimeRange {
        iso_duration: Some("P2W".into()),
        round_to_grain: TimeGrain::Week,
        ..Default::default()
    };
    let anchor = Utc.with_ymd_and_hms(2024, 3, 13, 12, 0, 0).unwrap();
    resolve_time_range(&mut tr, Some(anchor), 1, 1).unwrap();

    assert_eq!(tr.start, Some(Utc.with_ymd_and_hms(2024, 2, 26, 0, 0, 0).unwrap()));
    assert_eq!(tr.end, Some(Utc.with_ymd_and_hms(2024, 3, 11, 0, 0, 0).unwrap()));
    assert!(tr.is_resolved());
}
