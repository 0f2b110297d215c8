//! Dimension value search.
//!
//! Each searched dimension is compiled as a single-dimension query filtered
//! with `ILIKE '%search%'`, and the queries are unioned. Druid stores get a
//! native search query instead when the filter translates to a native one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::ast::FromClause;
use crate::error::{Error, Result, ResultExt};
use crate::executor::rewrites::limits::rewrite_limits_into_subqueries;
use crate::executor::{Executor, Statement};
use crate::model::value::format_timestamp;
use crate::model::{Dimension, Expression, Query, TimeRange, Value};
use crate::sql::{Dialect, SqlDialect};

const DEFAULT_NATIVE_SEARCH_LIMIT: i64 = 100;
const VIRTUAL_COLUMN_SUFFIX: &str = "_virtual_native";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SearchQuery {
    pub metrics_view: String,
    pub dimensions: Vec<String>,
    pub search: String,
    #[serde(rename = "where")]
    pub where_clause: Option<Expression>,
    pub having: Option<Expression>,
    pub time_range: Option<TimeRange>,
    pub limit: Option<i64>,
}

/// A value of `dimension` matching the search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub dimension: String,
    pub value: Value,
}

impl Executor {
    /// Search the values of the query's dimensions.
    pub async fn search(
        &self,
        qry: &SearchQuery,
        execution_time: Option<DateTime<Utc>>,
    ) -> Result<Vec<SearchResult>> {
        if !self.security.can_access() {
            return Err(Error::Forbidden);
        }

        if self.dialect() == Dialect::Druid {
            match self.search_druid_native(qry, execution_time).await {
                Err(err) if matches!(err.root(), Error::NativeSearchUnavailable) => {
                    warn!(metrics_view = %self.metrics_view.name, "native search unavailable, falling back to SQL");
                }
                res => return res,
            }
        }

        self.search_union(qry, execution_time).await
    }

    async fn search_union(
        &self,
        qry: &SearchQuery,
        execution_time: Option<DateTime<Utc>>,
    ) -> Result<Vec<SearchResult>> {
        if qry.dimensions.is_empty() {
            return Ok(Vec::new());
        }
        let dialect = self.dialect();

        let mut sql = String::new();
        let mut args = Vec::new();
        let mut rows_cap = None;
        for (i, d) in qry.dimensions.iter().enumerate() {
            let mut q = Query {
                metrics_view: qry.metrics_view.clone(),
                dimensions: vec![Dimension::new(d.clone())],
                where_clause: search_where(qry.where_clause.clone(), d, &qry.search),
                having: qry.having.clone(),
                time_range: qry.time_range.clone(),
                limit: qry.limit,
                ..Default::default()
            };
            self.rewrite_query_time_ranges(&mut q, execution_time)
                .await?;
            rows_cap = self.rewrite_query_enforce_caps(&mut q)?;

            let mut ast = self.new_ast(&q)?;
            rewrite_limits_into_subqueries(&mut ast);
            let (dim_sql, dim_args) = ast
                .sql()
                .with_context(|| format!("failed to search dimension {:?}", d))?;
            drop(ast);

            if i > 0 {
                sql.push_str(" UNION ALL ");
            }
            sql.push_str(&format!(
                "SELECT {} AS dimension, {} AS value FROM ({})",
                dialect.escape_string_value(d),
                dialect.escape_identifier(d),
                dim_sql
            ));
            args.extend(dim_args);
        }

        debug!(metrics_view = %self.metrics_view.name, sql = %sql, "executing search");
        let mut res = self.execute(Statement::new(sql, args)).await?;
        if let Some(cap) = rows_cap {
            res.set_cap(cap);
        }

        res.rows()?
            .iter()
            .map(|row| match row.as_slice() {
                [Value::String(dimension), value] => Ok(SearchResult {
                    dimension: dimension.clone(),
                    value: value.clone(),
                }),
                _ => Err(Error::execution("unexpected search result row")),
            })
            .collect()
    }

    async fn search_druid_native(
        &self,
        qry: &SearchQuery,
        execution_time: Option<DateTime<Utc>>,
    ) -> Result<Vec<SearchResult>> {
        if qry.time_range.is_none() {
            return Err(Error::NativeSearchUnavailable);
        }

        let mut q = Query {
            metrics_view: qry.metrics_view.clone(),
            dimensions: qry.dimensions.iter().cloned().map(Dimension::new).collect(),
            where_clause: qry.where_clause.clone(),
            having: qry.having.clone(),
            time_range: qry.time_range.clone(),
            limit: qry.limit,
            ..Default::default()
        };
        self.rewrite_query_time_ranges(&mut q, execution_time)
            .await?;
        let (start, end) = match &q.time_range {
            Some(TimeRange {
                start: Some(start),
                end: Some(end),
                ..
            }) => (*start, *end),
            _ => return Err(Error::NativeSearchUnavailable),
        };

        let mut ast = self.new_ast(&q)?;
        rewrite_limits_into_subqueries(&mut ast);

        // Unnests and measure filters compile to subqueries, which native search can't express.
        let FromClause::Table { expr: table, .. } = &ast.root.from else {
            return Err(Error::NativeSearchUnavailable);
        };
        let explain = ast.root.where_clause.as_ref().map(|w| {
            Statement::new(
                format!("EXPLAIN PLAN FOR SELECT 1 FROM {} WHERE {}", table, w.expr),
                w.args.clone(),
            )
        });
        let limit = ast.root.limit.unwrap_or(DEFAULT_NATIVE_SEARCH_LIMIT);

        let mut dimensions = Vec::with_capacity(ast.root.dim_fields.len());
        let mut virtual_columns = Vec::new();
        for f in &ast.root.dim_fields {
            let dim = ast.builder.lookup_dimension(&f.name, true)?;
            if dim.expression.is_empty() {
                dimensions.push(f.name.clone());
                continue;
            }
            let name = format!("{}{}", f.name, VIRTUAL_COLUMN_SUFFIX);
            virtual_columns.push(json!({
                "type": "expression",
                "name": name,
                "expression": dim.expression,
            }));
            dimensions.push(name);
        }
        drop(ast);

        let filter = match explain {
            Some(stmt) => Some(self.native_filter(stmt).await?),
            None => None,
        };

        let doc = native_search_document(NativeSearch {
            data_source: &self.metrics_view.table,
            search: &qry.search,
            dimensions,
            virtual_columns,
            limit,
            start,
            end,
            filter,
        });
        debug!(metrics_view = %self.metrics_view.name, "executing native search");

        let res = self.olap.query_native(doc).await?;
        let res: Vec<NativeSearchResponse> =
            serde_json::from_value(res)
            .map_err(Error::from)
            .context("failed to parse native search response")?;
        Ok(res
            .into_iter()
            .flat_map(|r| r.result)
            .map(|hit| SearchResult {
                dimension: hit
                    .dimension
                    .strip_suffix(VIRTUAL_COLUMN_SUFFIX)
                    .map(str::to_string)
                    .unwrap_or(hit.dimension),
                value: hit.value,
            })
            .collect())
    }

    /// Translate a SQL filter to a native filter by planning it.
    async fn native_filter(&self, stmt: Statement) -> Result<serde_json::Value> {
        let res = self.execute(stmt).await?;
        let Some(raw) = res.first_value().and_then(Value::as_str) else {
            return Err(Error::execution("failed to parse filter"));
        };
        let plan: Vec<QueryPlan> =
            serde_json::from_str(raw)
            .map_err(Error::from)
            .context("failed to parse query plan")?;
        let Some(first) = plan.into_iter().next() else {
            return Err(Error::execution("failed to parse policy filter"));
        };
        // Complex row filters don't plan to a single native filter.
        first.query.filter.ok_or(Error::NativeSearchUnavailable)
    }
}

/// `where AND dimension ILIKE '%search%'`.
fn search_where(where_clause: Option<Expression>, dimension: &str, search: &str) -> Option<Expression> {
    let ilike = Expression::ilike(dimension, &format!("%{}%", search));
    Expression::and_opt(where_clause, Some(ilike))
}

struct NativeSearch<'a> {
    data_source: &'a str,
    search: &'a str,
    dimensions: Vec<String>,
    virtual_columns: Vec<serde_json::Value>,
    limit: i64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    filter: Option<serde_json::Value>,
}

fn native_search_document(s: NativeSearch<'_>) -> serde_json::Value {
    let mut doc = json!({
        "queryType": "search",
        "dataSource": s.data_source,
        "granularity": "all",
        "searchDimensions": s.dimensions,
        "virtualColumns": s.virtual_columns,
        "query": {
            "type": "insensitive_contains",
            "value": s.search,
        },
        "sort": { "type": "lexicographic" },
        "intervals": [format!("{}/{}", format_timestamp(&s.start), format_timestamp(&s.end))],
        "limit": s.limit,
    });
    if let (Some(filter), Some(obj)) = (s.filter, doc.as_object_mut()) {
        obj.insert("filter".to_string(), filter);
    }
    doc
}

#[derive(Debug, Deserialize)]
struct QueryPlan {
    query: PlannedQuery,
}

#[derive(Debug, Deserialize)]
struct PlannedQuery {
    #[serde(default)]
    filter: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct NativeSearchResponse {
    #[serde(default)]
    result: Vec<NativeSearchHit>,
}

#[derive(Debug, Deserialize)]
struct NativeSearchHit {
    dimension: String,
    value: Value,
}
