//! Tests for query deserialization, validation and field analysis.

use chrono::{TimeZone, Utc};
use metricsview::model::{
    Dimension, DimensionCompute, Expression, Measure, MeasureCompute, Query, Sort, TimeGrain,
    TimeRange,
};

#[test]
fn test_deserialize_full_query() {
    let json = r#"{
        "metrics_view": "sales",
        "dimensions": [
            {"name": "country"},
            {"name": "day", "compute": {"time_floor": {"dimension": "ts", "grain": "day"}}}
        ],
        "measures": [
            {"name": "total"},
            {"name": "total_prev", "compute": {"comparison_value": {"measure": "total"}}}
        ],
        "sort": [{"name": "total", "desc": true}],
        "time_range": {"start": "2024-01-01T00:00:00Z", "end": "2024-02-01T00:00:00Z"},
        "where": {"cond": {"op": "eq", "exprs": [{"name": "country"}, {"val": "US"}]}},
        "limit": 10,
        "time_zone": "Europe/Copenhagen"
    }"#;

    let q: Query = serde_json::from_str(json).unwrap();

    assert_eq!(q.metrics_view, "sales");
    assert_eq!(q.dimensions[0], Dimension::new("country"));
    assert_eq!(
        q.dimensions[1].compute,
        Some(DimensionCompute::TimeFloor {
            dimension: "ts".into(),
            grain: TimeGrain::Day,
        })
    );
    assert_eq!(
        q.measures[1].compute,
        Some(MeasureCompute::ComparisonValue {
            measure: "total".into()
        })
    );
    assert_eq!(q.sort, vec![Sort::desc("total")]);
    assert_eq!(
        q.time_range,
        Some(TimeRange::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(),
        ))
    );
    assert_eq!(q.where_clause, Some(Expression::eq("country", "US")));
    assert_eq!(q.limit, Some(10));
    assert_eq!(q.offset, None);
    assert!(!q.rows);
}

#[test]
fn test_deserialize_relative_time_range() {
    let q: Query = serde_json::from_str(
        r#"{"measures": [{"name": "total"}], "time_range": {"iso_duration": "P7D", "round_to_grain": "day"}}"#,
    )
    .unwrap();
    let tr = q.time_range.unwrap();
    assert_eq!(tr.iso_duration.as_deref(), Some("P7D"));
    assert_eq!(tr.round_to_grain, TimeGrain::Day);
    assert!(!tr.is_resolved());
    assert!(!tr.is_zero());
}

#[test]
fn test_rows_rejects_fields() {
    let q = Query {
        rows: true,
        dimensions: vec![Dimension::new("country")],
        ..Default::default()
    };
    assert_eq!(
        q.validate().unwrap_err().to_string(),
        "dimensions not supported when rows is set, all model columns will be returned"
    );

    let q = Query {
        rows: true,
        sort: vec![Sort::asc("country")],
        ..Default::default()
    };
    assert_eq!(
        q.validate().unwrap_err().to_string(),
        "sort not supported when rows is set"
    );

    let q = Query {
        rows: true,
        limit: Some(100),
        ..Default::default()
    };
    assert!(q.validate().is_ok());
}

#[test]
fn test_mismatched_comparison_time_dimension() {
    let q = Query {
        measures: vec![Measure::new("total")],
        time_range: Some(TimeRange {
            time_dimension: Some("ts".into()),
            ..Default::default()
        }),
        comparison_time_range: Some(TimeRange {
            time_dimension: Some("updated_at".into()),
            ..Default::default()
        }),
        ..Default::default()
    };
    assert_eq!(
        q.validate().unwrap_err().to_string(),
        "time_dimension in time_range and comparison_time_range must match"
    );
}

#[test]
fn test_negative_paging_rejected() {
    let q = Query {
        measures: vec![Measure::new("total")],
        offset: Some(-1),
        ..Default::default()
    };
    assert_eq!(
        q.validate().unwrap_err().to_string(),
        "offset must not be negative"
    );
}

#[test]
fn test_analyze_fields() {
    let q = Query {
        dimensions: vec![
            Dimension::new("country"),
            Dimension::time_floor("day", "ts", TimeGrain::Day),
        ],
        measures: vec![
            Measure::new("total"),
            Measure::computed(
                "total_delta",
                MeasureCompute::ComparisonDelta {
                    measure: "total".into(),
                },
            ),
            Measure::computed("n", MeasureCompute::Count(true)),
            Measure::computed(
                "users",
                MeasureCompute::CountDistinct {
                    dimension: "user_id".into(),
                },
            ),
        ],
        where_clause: Some(Expression::and(vec![
            Expression::eq("device", "mobile"),
            Expression::eq("country", "US"),
        ])),
        ..Default::default()
    };

    assert_eq!(
        q.analyze_fields(),
        vec!["country", "ts", "total", "user_id", "device"]
    );
}
