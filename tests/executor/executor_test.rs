//! Tests for the executor against an in-memory OLAP store.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as TimeDelta, TimeZone, Utc};
use serde_json::json;

use metricsview::config::ExecutorSettings;
use metricsview::executor::{
    compute_hash, AnnotationsQuery, Column, ExportFormat, Executor, OlapStore, QueryResult,
    SearchQuery, SearchResult, Statement, TimestampsResult,
};
use metricsview::model::{
    AnnotationSpec, Dimension, DimensionSpec, Measure, MeasureCompute, MeasureSpec, MetricsViewSpec, Query,
    ResolvedSecurity, Sort, TimeRange, Value,
};
use metricsview::sql::Dialect;
use metricsview::{Error, Result};

/// Canned rows returned for statements starting with `prefix`.
#[derive(Debug)]
struct Response {
    prefix: String,
    columns: Vec<Column>,
    rows: Vec<Vec<Value>>,
}

#[derive(Debug)]
struct MockStore {
    dialect: Dialect,
    responses: Vec<Response>,
    /// Statements containing any of these fail.
    failures: Vec<String>,
    delay: Option<Duration>,
    table: Option<Vec<Column>>,
    /// Columns of other tables, by name.
    tables: Vec<(String, Vec<Column>)>,
    native_response: serde_json::Value,
    statements: Mutex<Vec<Statement>>,
    exports: Mutex<Vec<Statement>>,
    native_queries: Mutex<Vec<serde_json::Value>>,
}

impl MockStore {
    fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            responses: Vec::new(),
            failures: Vec::new(),
            delay: None,
            table: Some(vec![
                Column::new("ts", "TIMESTAMP"),
                Column::new("country", "VARCHAR"),
                Column::new("device", "VARCHAR"),
                Column::new("amount", "DOUBLE"),
            ]),
            tables: Vec::new(),
            native_response: json!([]),
            statements: Mutex::new(Vec::new()),
            exports: Mutex::new(Vec::new()),
            native_queries: Mutex::new(Vec::new()),
        }
    }

    fn respond(mut self, prefix: &str, columns: Vec<Column>, rows: Vec<Vec<Value>>) -> Self {
        self.responses.push(Response {
            prefix: prefix.to_string(),
            columns,
            rows,
        });
        self
    }

    fn fail_on(mut self, needle: &str) -> Self {
        self.failures.push(needle.to_string());
        self
    }

    fn statements(&self) -> Vec<Statement> {
        self.statements.lock().unwrap().clone()
    }

    fn queries(&self) -> Vec<String> {
        self.statements().into_iter().map(|s| s.query).collect()
    }
}

#[async_trait]
impl OlapStore for MockStore {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    async fn query(&self, stmt: Statement) -> Result<QueryResult> {
        self.statements.lock().unwrap().push(stmt.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failures.iter().any(|f| stmt.query.contains(f.as_str())) {
            return Err(Error::execution("binder error"));
        }
        Ok(self
            .responses
            .iter()
            .find(|r| stmt.query.starts_with(&r.prefix))
            .map(|r| QueryResult::new(r.columns.clone(), r.rows.clone()))
            .unwrap_or_else(QueryResult::empty))
    }

    async fn export(&self, stmt: Statement, _path: &Path, _format: ExportFormat) -> Result<()> {
        self.exports.lock().unwrap().push(stmt);
        Ok(())
    }

    async fn table_columns(
        &self,
        _database: &str,
        _schema: &str,
        table: &str,
    ) -> Result<Option<Vec<Column>>> {
        if let Some((_, cols)) = self.tables.iter().find(|(name, _)| name == table) {
            return Ok(Some(cols.clone()));
        }
        if table == "orders" {
            return Ok(self.table.clone());
        }
        Ok(None)
    }

    async fn query_native(&self, doc: serde_json::Value) -> Result<serde_json::Value> {
        self.native_queries.lock().unwrap().push(doc);
        Ok(self.native_response.clone())
    }
}

fn view() -> MetricsViewSpec {
    MetricsViewSpec {
        name: "sales".into(),
        table: "orders".into(),
        time_dimension: "ts".into(),
        dimensions: vec![
            DimensionSpec::column("country"),
            DimensionSpec::column("device"),
        ],
        measures: vec![MeasureSpec::simple("total", "SUM(amount)")],
        ..Default::default()
    }
}

fn executor(store: &Arc<MockStore>, settings: ExecutorSettings) -> Executor {
    executor_with(store, view(), ResolvedSecurity::open(), settings)
}

fn executor_with(
    store: &Arc<MockStore>,
    mv: MetricsViewSpec,
    security: ResolvedSecurity,
    settings: ExecutorSettings,
) -> Executor {
    Executor::new(store.clone(), Arc::new(mv), Arc::new(security), settings).unwrap()
}

fn ts(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
}

fn by_country() -> Query {
    Query {
        metrics_view: "sales".into(),
        dimensions: vec![Dimension::new("country")],
        measures: vec![Measure::new("total")],
        sort: vec![Sort::desc("total")],
        limit: Some(10),
        ..Default::default()
    }
}

fn timestamps_response(store: MockStore, watermark: DateTime<Utc>) -> MockStore {
    store.respond(
        "SELECT min(",
        vec![
            Column::new("min", "TIMESTAMP"),
            Column::new("max", "TIMESTAMP"),
            Column::new("watermark", "TIMESTAMP"),
        ],
        vec![vec![
            Value::Timestamp(ts(2023, 1, 1)),
            Value::Timestamp(watermark),
            Value::Timestamp(watermark),
        ]],
    )
}

// =============================================================================
// Queries
// =============================================================================

#[tokio::test]
async fn test_query_executes_compiled_sql() {
    let store = Arc::new(MockStore::new(Dialect::DuckDb).respond(
        "SELECT (",
        vec![Column::new("country", "VARCHAR"), Column::new("total", "DOUBLE")],
        vec![vec![Value::from("US"), Value::Float(12.5)]],
    ));
    let ex = executor(&store, ExecutorSettings::default());

    let res = ex.query(by_country(), None).await.unwrap();
    assert_eq!(res.rows().unwrap().len(), 1);
    assert_eq!(res.first_value(), Some(&Value::from("US")));

    let stmts = store.statements();
    assert_eq!(stmts.len(), 1);
    assert_eq!(
        stmts[0].query,
        r#"SELECT ("country") AS "country", (SUM(amount)) AS "total" FROM "orders" GROUP BY 1 ORDER BY "total" DESC NULLS LAST LIMIT 10"#
    );
    assert_eq!(stmts[0].timeout, Some(Duration::from_secs(180)));
}

#[tokio::test]
async fn test_query_forbidden() {
    let store = Arc::new(MockStore::new(Dialect::DuckDb));
    let ex = executor_with(
        &store,
        view(),
        ResolvedSecurity::denied(),
        ExecutorSettings::default(),
    );

    let err = ex.query(by_country(), None).await.unwrap_err();
    assert!(err.is_forbidden());
    assert!(store.statements().is_empty());

    let err = ex.schema().await.unwrap_err();
    assert!(err.is_forbidden());
}

#[tokio::test]
async fn test_query_forbidden_field() {
    let store = Arc::new(MockStore::new(Dialect::DuckDb));
    let ex = executor_with(
        &store,
        view(),
        ResolvedSecurity::open().with_fields(["country"]),
        ExecutorSettings::default(),
    );

    let err = ex.query(by_country(), None).await.unwrap_err();
    assert!(err.is_forbidden(), "{}", err);
}

#[tokio::test]
async fn test_rows_cap() {
    let rows = vec![
        vec![Value::from("US"), Value::Int(1)],
        vec![Value::from("DK"), Value::Int(2)],
        vec![Value::from("SE"), Value::Int(3)],
    ];
    let store = Arc::new(MockStore::new(Dialect::DuckDb).respond(
        "SELECT (",
        vec![Column::new("country", "VARCHAR"), Column::new("total", "BIGINT")],
        rows,
    ));
    let settings = ExecutorSettings {
        interactive_rows_limit: 2,
        ..Default::default()
    };
    let ex = executor(&store, settings);

    let mut q = by_country();
    q.limit = None;
    let res = ex.query(q, None).await.unwrap();
    assert!(store.queries()[0].ends_with("LIMIT 3"));
    assert_eq!(
        res.rows().unwrap_err().to_string(),
        "query execution failed: query result exceeds limit of 2 rows"
    );

    let err = ex.query(by_country(), None).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "query limit of 10 exceeds the maximum of 2 rows"
    );
}

#[tokio::test]
async fn test_query_timeout() {
    let mut store = MockStore::new(Dialect::DuckDb);
    store.delay = Some(Duration::from_secs(5));
    let store = Arc::new(store);
    let settings = ExecutorSettings {
        interactive_timeout: "20ms".into(),
        ..Default::default()
    };
    let ex = executor(&store, settings);

    let err = ex.query(by_country(), None).await.unwrap_err();
    assert!(matches!(err, Error::Timeout(d) if d == Duration::from_millis(20)), "{}", err);
}

#[tokio::test]
async fn test_invalid_settings_rejected() {
    let store = Arc::new(MockStore::new(Dialect::DuckDb));
    let settings = ExecutorSettings {
        interactive_timeout: "soon".into(),
        ..Default::default()
    };
    let res = Executor::new(
        store,
        Arc::new(view()),
        Arc::new(ResolvedSecurity::open()),
        settings,
    );
    assert!(res.is_err());
}

// =============================================================================
// Time ranges
// =============================================================================

#[tokio::test]
async fn test_timestamps_cached() {
    let watermark = ts(2024, 3, 10);
    let store = Arc::new(timestamps_response(MockStore::new(Dialect::DuckDb), watermark));
    let ex = executor(&store, ExecutorSettings::default());

    let res = ex.timestamps("").await.unwrap();
    assert_eq!(res.min, Some(ts(2023, 1, 1)));
    assert_eq!(res.max, Some(watermark));
    assert_eq!(res.watermark, Some(watermark));

    ex.timestamps("ts").await.unwrap();
    assert_eq!(
        store.queries(),
        vec![r#"SELECT min("ts") AS "min", max("ts") AS "max", max("ts") AS "watermark" FROM "orders""#]
    );
}

#[tokio::test]
async fn test_relative_time_range_anchors_on_watermark() {
    let watermark = ts(2024, 3, 10);
    let store = Arc::new(timestamps_response(MockStore::new(Dialect::DuckDb), watermark));
    let ex = executor(&store, ExecutorSettings::default());

    let mut q = by_country();
    q.time_range = Some(TimeRange {
        iso_duration: Some("P7D".into()),
        ..Default::default()
    });
    ex.query(q, None).await.unwrap();

    let stmts = store.statements();
    assert_eq!(stmts.len(), 2);
    assert!(stmts[0].query.starts_with("SELECT min("));
    assert_eq!(
        stmts[1].args,
        vec![
            Value::Timestamp(watermark - TimeDelta::days(7)),
            Value::Timestamp(watermark),
        ]
    );
}

#[tokio::test]
async fn test_relative_time_range_anchors_on_execution_time() {
    let store = Arc::new(MockStore::new(Dialect::DuckDb));
    let ex = executor(&store, ExecutorSettings::default());

    let mut q = by_country();
    q.time_range = Some(TimeRange {
        iso_duration: Some("P1D".into()),
        ..Default::default()
    });
    let now = Utc.with_ymd_and_hms(2024, 5, 2, 12, 0, 0).unwrap();
    ex.query(q, Some(now)).await.unwrap();

    let stmts = store.statements();
    assert_eq!(stmts.len(), 1);
    assert_eq!(
        stmts[0].args,
        vec![
            Value::Timestamp(now - TimeDelta::days(1)),
            Value::Timestamp(now),
        ]
    );
}

// =============================================================================
// Query rewrites
// =============================================================================

#[tokio::test]
async fn test_percent_of_total_runs_totals_query() {
    let totals_sql = r#"SELECT (SUM(amount)) AS "total" FROM "orders""#;
    let store = Arc::new(MockStore::new(Dialect::DuckDb).respond(
        totals_sql,
        vec![Column::new("total", "DOUBLE")],
        vec![vec![Value::Float(50.0)]],
    ));
    let ex = executor(&store, ExecutorSettings::default());

    let q = Query {
        dimensions: vec![Dimension::new("country")],
        measures: vec![
            Measure::new("total"),
            Measure::computed(
                "share",
                MeasureCompute::PercentOfTotal {
                    measure: "total".into(),
                    total: None,
                },
            ),
        ],
        ..Default::default()
    };
    ex.query(q, None).await.unwrap();

    let queries = store.queries();
    assert_eq!(queries.len(), 2);
    assert_eq!(queries[0], totals_sql);
    assert!(queries[1].contains(r#""total"/50.000000"#), "{}", queries[1]);
}

#[tokio::test]
async fn test_pivot_exported_then_read() {
    let store = Arc::new(MockStore::new(Dialect::DuckDb).respond(
        "SELECT * FROM '",
        vec![Column::new("country", "VARCHAR"), Column::new("mobile", "DOUBLE")],
        vec![vec![Value::from("US"), Value::Float(3.0)]],
    ));
    let ex = executor(&store, ExecutorSettings::default());

    let q = Query {
        dimensions: vec![Dimension::new("country"), Dimension::new("device")],
        measures: vec![Measure::new("total")],
        pivot_on: vec!["device".into()],
        sort: vec![Sort::asc("country")],
        ..Default::default()
    };
    let res = ex.query(q, None).await.unwrap();
    assert_eq!(res.rows().unwrap().len(), 1);

    let exports = store.exports.lock().unwrap().clone();
    assert_eq!(exports.len(), 1);
    assert_eq!(
        exports[0].query,
        r#"PIVOT (SELECT ("country") AS "country", ("device") AS "device", (SUM(amount)) AS "total" FROM "orders" GROUP BY 1,2) ON "device" USING ANY_VALUE("total") AS "total" GROUP BY "country" ORDER BY "country" NULLS LAST"#
    );
    assert!(store.queries()[0].ends_with(".parquet'"));
}

#[tokio::test]
async fn test_pivot_requires_duckdb_store() {
    let store = Arc::new(MockStore::new(Dialect::ClickHouse));
    let ex = executor(&store, ExecutorSettings::default());

    let q = Query {
        dimensions: vec![Dimension::new("country"), Dimension::new("device")],
        measures: vec![Measure::new("total")],
        pivot_on: vec!["device".into()],
        ..Default::default()
    };
    let err = ex.query(q, None).await.unwrap_err();
    assert!(
        err.to_string().contains("require a DuckDB store to serve the pivot"),
        "{}",
        err
    );
}

#[tokio::test]
async fn test_druid_two_phase_comparison() {
    let preview = r#"SELECT ("country") AS "country", (SUM(amount)) AS "total" FROM "orders""#;
    let store = Arc::new(MockStore::new(Dialect::Druid).respond(
        preview,
        vec![Column::new("country", "VARCHAR"), Column::new("total", "DOUBLE")],
        vec![
            vec![Value::from("US"), Value::Float(10.0)],
            vec![Value::from("DK"), Value::Float(5.0)],
        ],
    ));
    let ex = executor(&store, ExecutorSettings::default());

    let mut q = by_country();
    q.measures.push(Measure::computed(
        "total_prev",
        MeasureCompute::ComparisonValue {
            measure: "total".into(),
        },
    ));
    q.time_range = Some(TimeRange::new(ts(2024, 1, 1), ts(2024, 2, 1)));
    q.comparison_time_range = Some(TimeRange::new(ts(2023, 12, 1), ts(2024, 1, 1)));
    ex.query(q, None).await.unwrap();

    let stmts = store.statements();
    assert_eq!(stmts.len(), 2);
    assert!(stmts[0].query.starts_with(preview), "{}", stmts[0].query);
    assert!(stmts[0].query.ends_with("LIMIT 10"), "{}", stmts[0].query);

    let sql = &stmts[1].query;
    assert!(sql.contains("FROM (VALUES ("), "{}", sql);
    assert!(sql.contains(" LEFT OUTER JOIN "), "{}", sql);
    assert!(sql.contains(r#"("country" IN (?,?))"#), "{}", sql);
    assert!(stmts[1].args.contains(&Value::from("US")));
    assert!(stmts[1].args.contains(&Value::from("DK")));
}

#[tokio::test]
async fn test_druid_exactify_topn() {
    let store = Arc::new(MockStore::new(Dialect::Druid).respond(
        r#"SELECT ("country")"#,
        vec![Column::new("country", "VARCHAR"), Column::new("total", "DOUBLE")],
        vec![
            vec![Value::from("US"), Value::Float(10.0)],
            vec![Value::from("DK"), Value::Float(5.0)],
        ],
    ));
    let mut settings = ExecutorSettings::default();
    settings.druid.exactify_topn = true;
    let ex = executor(&store, settings);

    ex.query(by_country(), None).await.unwrap();

    let stmts = store.statements();
    assert_eq!(stmts.len(), 2);
    assert!(stmts[0].query.ends_with("LIMIT 10"), "{}", stmts[0].query);
    assert!(!stmts[1].query.contains("LIMIT"), "{}", stmts[1].query);
    assert_eq!(stmts[1].args, vec![Value::from("US"), Value::from("DK")]);
}

#[tokio::test]
async fn test_export_writes_through_store() {
    let store = Arc::new(MockStore::new(Dialect::DuckDb));
    let ex = executor(&store, ExecutorSettings::default());

    let path = ex.export(by_country(), None, ExportFormat::Csv).await.unwrap();
    assert_eq!(path.extension().and_then(|e| e.to_str()), Some("csv"));

    let exports = store.exports.lock().unwrap().clone();
    assert_eq!(exports.len(), 1);
    assert!(exports[0].query.ends_with("LIMIT 10"));
    assert_eq!(exports[0].timeout, Some(Duration::from_secs(300)));
    assert!(store.statements().is_empty());
}

// =============================================================================
// Search
// =============================================================================

fn search_query() -> SearchQuery {
    SearchQuery {
        metrics_view: "sales".into(),
        dimensions: vec!["country".into(), "device".into()],
        search: "us".into(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_search_unions_dimensions() {
    let store = Arc::new(MockStore::new(Dialect::DuckDb).respond(
        "SELECT 'country' AS dimension",
        vec![Column::new("dimension", "VARCHAR"), Column::new("value", "VARCHAR")],
        vec![
            vec![Value::from("country"), Value::from("US")],
            vec![Value::from("device"), Value::from("mouse")],
        ],
    ));
    let ex = executor(&store, ExecutorSettings::default());

    let res = ex.search(&search_query(), None).await.unwrap();
    assert_eq!(
        res,
        vec![
            SearchResult {
                dimension: "country".into(),
                value: Value::from("US"),
            },
            SearchResult {
                dimension: "device".into(),
                value: Value::from("mouse"),
            },
        ]
    );

    let stmts = store.statements();
    assert_eq!(stmts.len(), 1);
    let sql = &stmts[0].query;
    assert!(
        sql.starts_with(r#"SELECT 'country' AS dimension, "country" AS value FROM (SELECT ("country") AS "country" FROM "orders" WHERE "#),
        "{}",
        sql
    );
    assert!(
        sql.contains(r#" UNION ALL SELECT 'device' AS dimension, "device" AS value FROM (SELECT"#),
        "{}",
        sql
    );
    assert_eq!(stmts[0].args, vec![Value::from("%us%"), Value::from("%us%")]);
}

#[tokio::test]
async fn test_search_druid_native() {
    let mut store = MockStore::new(Dialect::Druid);
    store.native_response = json!([
        {"timestamp": "2024-01-01T00:00:00Z", "result": [
            {"dimension": "country", "value": "US", "count": 3}
        ]}
    ]);
    let store = Arc::new(store);
    let ex = executor(&store, ExecutorSettings::default());

    let mut q = search_query();
    q.dimensions = vec!["country".into()];
    q.time_range = Some(TimeRange::new(ts(2024, 1, 1), ts(2024, 2, 1)));
    let res = ex.search(&q, None).await.unwrap();
    assert_eq!(
        res,
        vec![SearchResult {
            dimension: "country".into(),
            value: Value::from("US"),
        }]
    );

    assert!(store.statements().is_empty());
    let docs = store.native_queries.lock().unwrap().clone();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0]["dataSource"], "orders");
    assert_eq!(docs[0]["searchDimensions"], json!(["country"]));
    assert_eq!(docs[0]["limit"], 100);
    assert_eq!(docs[0]["query"]["value"], "us");
}

#[tokio::test]
async fn test_search_druid_falls_back_to_sql() {
    let store = Arc::new(MockStore::new(Dialect::Druid));
    let ex = executor(&store, ExecutorSettings::default());

    // Native search needs a time range.
    let res = ex.search(&search_query(), None).await.unwrap();
    assert!(res.is_empty());
    assert!(store.native_queries.lock().unwrap().is_empty());

    let queries = store.queries();
    assert_eq!(queries.len(), 1);
    assert!(queries[0].contains(" UNION ALL "), "{}", queries[0]);
    assert!(queries[0].contains("REGEXP_LIKE"), "{}", queries[0]);
}

// =============================================================================
// Schema and validation
// =============================================================================

fn schema_response(store: MockStore, total_type: &str) -> MockStore {
    store.respond(
        "SELECT (date_trunc(",
        vec![
            Column::new("ts", "TIMESTAMP"),
            Column::new("country", "VARCHAR"),
            Column::new("device", "VARCHAR"),
            Column::new("total", total_type),
        ],
        Vec::new(),
    )
}

#[tokio::test]
async fn test_schema() {
    let store = Arc::new(schema_response(MockStore::new(Dialect::DuckDb), "DOUBLE"));
    let ex = executor(&store, ExecutorSettings::default());

    let columns = ex.schema().await.unwrap();
    assert_eq!(columns.len(), 4);
    assert_eq!(columns[3], Column::new("total", "DOUBLE"));

    let stmts = store.statements();
    assert_eq!(stmts.len(), 1);
    assert!(stmts[0].query.ends_with("LIMIT 0"), "{}", stmts[0].query);
}

#[tokio::test]
async fn test_validate_metrics_view() {
    let store = Arc::new(schema_response(MockStore::new(Dialect::DuckDb), "DOUBLE"));
    let ex = executor(&store, ExecutorSettings::default());

    let res = ex.validate_metrics_view().await.unwrap();
    assert!(res.is_zero(), "{:?}", res);

    let stmts = store.statements();
    assert!(stmts[0].dry_run);
    assert_eq!(
        stmts[0].query,
        r#"SELECT ("country") AS "country",("device") AS "device",(SUM(amount)) FROM "orders" GROUP BY 1,2"#
    );
}

#[tokio::test]
async fn test_validate_reports_broken_measure() {
    let mut mv = view();
    mv.measures.push(MeasureSpec::simple("bad", "SUM(nope)"));
    let store = Arc::new(MockStore::new(Dialect::DuckDb).fail_on("SUM(nope)"));
    let ex = executor_with(&store, mv, ResolvedSecurity::open(), ExecutorSettings::default());

    let res = ex.validate_metrics_view().await.unwrap();
    assert!(res.time_dimension_err.is_none());
    assert!(res.dimension_errs.is_empty());
    assert_eq!(res.measure_errs.len(), 1);
    assert_eq!(res.measure_errs[0].idx, 1);
    assert_eq!(
        res.measure_errs[0].err.to_string(),
        "invalid expression for measure \"bad\": query execution failed: binder error"
    );
}

#[tokio::test]
async fn test_validate_non_numeric_measure() {
    let store = Arc::new(schema_response(MockStore::new(Dialect::DuckDb), "VARCHAR"));
    let ex = executor(&store, ExecutorSettings::default());

    let res = ex.validate_metrics_view().await.unwrap();
    assert_eq!(res.measure_errs.len(), 1);
    assert_eq!(
        res.measure_errs[0].err.to_string(),
        "measure \"total\" is of type VARCHAR, but must be a numeric type"
    );
}

#[tokio::test]
async fn test_validate_missing_table_and_time_dimension() {
    let mut store = MockStore::new(Dialect::DuckDb);
    store.table = None;
    let store = Arc::new(store);
    let ex = executor(&store, ExecutorSettings::default());
    let res = ex.validate_metrics_view().await.unwrap();
    assert_eq!(
        res.errors().map(|e| e.to_string()).collect::<Vec<_>>(),
        vec!["table \"orders\" does not exist"]
    );

    let mut store = MockStore::new(Dialect::DuckDb);
    store.table = Some(vec![Column::new("country", "VARCHAR"), Column::new("device", "VARCHAR")]);
    let store = Arc::new(store);
    let ex = executor(&store, ExecutorSettings::default());
    let res = ex.validate_metrics_view().await.unwrap();
    let Some(err) = res.time_dimension_err else {
        panic!("expected a time dimension error");
    };
    assert_eq!(
        err.to_string(),
        "timeseries \"ts\" is not a column in table \"orders\" or defined in metrics view"
    );
}

#[tokio::test]
async fn test_validate_pinot_long_time_column() {
    let mut store = MockStore::new(Dialect::Pinot);
    store.table = Some(vec![
        Column::new("ts", "LONG"),
        Column::new("country", "STRING"),
        Column::new("device", "STRING"),
        Column::new("amount", "DOUBLE"),
    ]);
    let store = Arc::new(store);
    let ex = executor(&store, ExecutorSettings::default());

    let res = ex.validate_metrics_view().await.unwrap();
    assert!(res.time_dimension_err.is_none(), "{:?}", res);
}

#[tokio::test]
async fn test_validate_clickhouse_name_collision() {
    let mut mv = view();
    mv.measures.push(MeasureSpec::simple("amount", "SUM(amount)"));
    let store = Arc::new(MockStore::new(Dialect::ClickHouse));
    let ex = executor_with(&store, mv, ResolvedSecurity::open(), ExecutorSettings::default());

    let res = ex.validate_metrics_view().await.unwrap();
    assert_eq!(res.other_errs.len(), 1);
    assert!(
        res.other_errs[0]
            .to_string()
            .starts_with("invalid measure \"amount\": measures cannot have the same name as a column"),
        "{}",
        res.other_errs[0]
    );
}

// =============================================================================
// Annotations
// =============================================================================

fn annotated_view() -> MetricsViewSpec {
    let mut mv = view();
    mv.measures.push(MeasureSpec::simple("cnt", "COUNT(*)"));
    mv.annotations = vec![
        AnnotationSpec {
            name: "releases".into(),
            table: "release_notes".into(),
            measures: vec!["total".into()],
            ..Default::default()
        },
        AnnotationSpec {
            name: "outages".into(),
            table: "outages".into(),
            measures: vec!["cnt".into()],
            has_time_end: true,
            ..Default::default()
        },
    ];
    mv
}

fn release_notes(store: MockStore, extra: Option<Column>) -> MockStore {
    let mut columns = vec![
        Column::new("time", "TIMESTAMP"),
        Column::new("description", "VARCHAR"),
    ];
    let mut row = vec![Value::Timestamp(ts(2024, 1, 5)), Value::from("v2 launch")];
    if let Some(c) = extra {
        columns.push(c);
        row.push(Value::Int(5));
    }
    store.respond("SELECT *", columns, vec![row])
}

fn january_notes() -> AnnotationsQuery {
    AnnotationsQuery {
        metrics_view: "sales".into(),
        measures: vec!["total".into()],
        time_range: Some(TimeRange::new(ts(2024, 1, 1), ts(2024, 2, 1))),
        limit: Some(50),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_annotations_for_requested_measures() {
    let store = Arc::new(release_notes(MockStore::new(Dialect::DuckDb), None));
    let ex = executor_with(
        &store,
        annotated_view(),
        ResolvedSecurity::open(),
        ExecutorSettings::default(),
    );

    let rows = ex.annotations(&january_notes(), None).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(
        rows[0].fields,
        BTreeMap::from([
            ("description".to_string(), Value::from("v2 launch")),
            ("time".to_string(), Value::Timestamp(ts(2024, 1, 5))),
        ])
    );
    assert_eq!(rows[0].for_measures, vec!["total".to_string()]);

    // The outages annotation only covers an unrequested measure.
    let stmts = store.statements();
    assert_eq!(stmts.len(), 1);
    assert_eq!(
        stmts[0].query,
        r#"SELECT * FROM "release_notes" WHERE "time" >= ? AND "time" < ? ORDER BY "time" LIMIT ?"#
    );
    assert_eq!(
        stmts[0].args,
        vec![
            Value::Timestamp(ts(2024, 1, 1)),
            Value::Timestamp(ts(2024, 2, 1)),
            Value::Int(50),
        ]
    );
}

#[tokio::test]
async fn test_annotations_respect_field_access() {
    let mut mv = annotated_view();
    mv.annotations[0].has_duration = true;
    let store = Arc::new(release_notes(
        MockStore::new(Dialect::DuckDb),
        Some(Column::new("__time_grain", "INTEGER")),
    ));
    let sec = ResolvedSecurity::open().with_fields(["country", "device", "total"]);
    let ex = executor_with(&store, mv, sec, ExecutorSettings::default());

    let qry = AnnotationsQuery {
        measures: Vec::new(),
        ..january_notes()
    };
    let rows = ex.annotations(&qry, None).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert!(!rows[0].fields.contains_key("__time_grain"));

    let queries = store.queries();
    assert_eq!(queries.len(), 1);
    assert!(queries[0].starts_with(r#"SELECT *, (CASE WHEN "duration" = 'millisecond' THEN 1"#));

    let ex = executor_with(
        &store,
        annotated_view(),
        ResolvedSecurity::denied(),
        ExecutorSettings::default(),
    );
    let err = ex.annotations(&january_notes(), None).await.unwrap_err();
    assert!(err.is_forbidden());
}

#[tokio::test]
async fn test_annotations_relative_time_range() {
    let store = Arc::new(release_notes(MockStore::new(Dialect::DuckDb), None));
    let ex = executor_with(
        &store,
        annotated_view(),
        ResolvedSecurity::open(),
        ExecutorSettings::default(),
    );

    let qry = AnnotationsQuery {
        time_range: Some(TimeRange {
            iso_duration: Some("P7D".into()),
            ..Default::default()
        }),
        ..january_notes()
    };
    ex.annotations(&qry, Some(ts(2024, 3, 10))).await.unwrap();

    let stmts = store.statements();
    assert_eq!(stmts.len(), 1);
    assert_eq!(stmts[0].args[0], Value::Timestamp(ts(2024, 3, 3)));
    assert_eq!(stmts[0].args[1], Value::Timestamp(ts(2024, 3, 10)));

    let qry = AnnotationsQuery {
        time_range: None,
        ..january_notes()
    };
    let err = ex.annotations(&qry, None).await.unwrap_err();
    assert_eq!(err.to_string(), "annotations query requires a time range");
}

#[tokio::test]
async fn test_bind_annotations_query() {
    let store = Arc::new(MockStore::new(Dialect::DuckDb));
    let ex = executor_with(
        &store,
        annotated_view(),
        ResolvedSecurity::open(),
        ExecutorSettings::default(),
    );

    let mut qry = AnnotationsQuery {
        time_range: Some(TimeRange {
            iso_duration: Some("P7D".into()),
            ..Default::default()
        }),
        ..january_notes()
    };
    let timestamps = TimestampsResult {
        min: Some(ts(2023, 1, 1)),
        max: Some(ts(2024, 3, 9)),
        watermark: Some(ts(2024, 3, 10)),
        now: ts(2024, 4, 1),
    };
    ex.bind_annotations_query(&mut qry, &timestamps).unwrap();

    let Some(tr) = qry.time_range else {
        panic!("expected a time range");
    };
    assert_eq!(tr.start, Some(ts(2024, 3, 3)));
    assert_eq!(tr.end, Some(ts(2024, 3, 10)));
    assert!(store.statements().is_empty());
}

#[tokio::test]
async fn test_validate_annotations() {
    let mut mv = view();
    mv.annotations = vec![
        AnnotationSpec {
            name: "releases".into(),
            table: "release_notes".into(),
            measures: vec!["total".into(), "nope".into()],
            has_time_end: true,
            ..Default::default()
        },
        AnnotationSpec {
            name: "ghost".into(),
            table: "missing".into(),
            measures: vec!["total".into()],
            ..Default::default()
        },
    ];
    let mut store = MockStore::new(Dialect::DuckDb);
    store.tables.push((
        "release_notes".into(),
        vec![Column::new("time", "TIMESTAMP"), Column::new("title", "VARCHAR")],
    ));
    let store = Arc::new(store);
    let ex = executor_with(&store, mv, ResolvedSecurity::open(), ExecutorSettings::default());

    let res = ex.validate_metrics_view().await.unwrap();
    assert_eq!(
        res.other_errs.iter().map(|e| e.to_string()).collect::<Vec<_>>(),
        vec![
            "invalid measures for annotation \"releases\": measure \"nope\" not found",
            "table \"release_notes\" for annotation \"releases\" does not have the required \"description\" column",
            "table \"release_notes\" for annotation \"releases\" does not have the required \"time_end\" column",
            "table \"missing\" for annotation \"ghost\" does not exist",
        ]
    );
}

// =============================================================================
// Cache keys
// =============================================================================

#[tokio::test]
async fn test_cache_key() {
    let store = Arc::new(MockStore::new(Dialect::DuckDb));
    let ex = executor(&store, ExecutorSettings::default());
    assert_eq!(ex.cache_key().await.unwrap(), Some(String::new()));

    let mut mv = view();
    mv.cache_key_sql = "SELECT max(updated_at) FROM orders".into();
    let store = Arc::new(MockStore::new(Dialect::DuckDb).respond(
        "SELECT max(updated_at)",
        vec![Column::new("max", "BIGINT")],
        vec![vec![Value::Int(5)]],
    ));
    let ex = executor_with(&store, mv, ResolvedSecurity::open(), ExecutorSettings::default());
    assert_eq!(
        ex.cache_key().await.unwrap(),
        Some(compute_hash(&Value::Int(5)).unwrap())
    );

    let mut mv = view();
    mv.streaming = true;
    let ex = executor_with(&store, mv, ResolvedSecurity::open(), ExecutorSettings::default());
    assert_eq!(ex.cache_key().await.unwrap(), None);
}
