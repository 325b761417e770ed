//! Read-only SQL execution.
//!
//! The [`QueryRunner`] trait is the seam between the pipeline and the
//! database; [`PgQueryRunner`] executes validated SQL against the read-only
//! replica pool with a per-statement timeout and a hard row cap. Parameters
//! are always bound positionally — `%(name)s` placeholders are rewritten to
//! `$n` and the values travel as binds, never as interpolated text.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Column, Row, TypeInfo};

/// Executes validated, parameterized SQL and returns rows as column→value
/// maps in result-set order.
#[async_trait]
pub trait QueryRunner: Send + Sync {
    async fn execute(
        &self,
        sql: &str,
        parameters: &BTreeMap<String, serde_json::Value>,
        row_cap: i64,
        timeout: Duration,
    ) -> Result<Vec<serde_json::Map<String, serde_json::Value>>>;
}

/// Rewrite `%(name)s` placeholders to positional `$n` binds. Repeated
/// placeholders reuse their first index, and the returned values line up
/// with the indices.
pub fn to_positional(
    sql: &str,
    parameters: &BTreeMap<String, serde_json::Value>,
) -> Result<(String, Vec<serde_json::Value>)> {
    let mut out = String::with_capacity(sql.len());
    let mut order: Vec<String> = Vec::new();
    let mut values: Vec<serde_json::Value> = Vec::new();

    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 1 < bytes.len() && bytes[i + 1] == b'(' {
            if let Some(close) = sql[i + 2..].find(')') {
                let name = &sql[i + 2..i + 2 + close];
                let after = i + 2 + close + 1;
                if after < bytes.len() && bytes[after] == b's' && !name.is_empty() {
                    let index = match order.iter().position(|n| n == name) {
                        Some(pos) => pos + 1,
                        None => {
                            let value = parameters
                                .get(name)
                                .with_context(|| format!("unbound placeholder: {}", name))?;
                            order.push(name.to_string());
                            values.push(value.clone());
                            order.len()
                        }
                    };
                    out.push_str(&format!("${}", index));
                    i = after + 1;
                    continue;
                }
            }
        }
        // Advance one UTF-8 character, not one byte.
        let ch_len = sql[i..].chars().next().map(char::len_utf8).unwrap_or(1);
        out.push_str(&sql[i..i + ch_len]);
        i += ch_len;
    }

    if order.len() != parameters.len() {
        let unused: Vec<&String> = parameters
            .keys()
            .filter(|k| !order.contains(k))
            .collect();
        bail!("parameters without placeholders: {:?}", unused);
    }

    Ok((out, values))
}

/// [`QueryRunner`] over the read-only replica pool.
pub struct PgQueryRunner {
    pool: PgPool,
}

impl PgQueryRunner {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QueryRunner for PgQueryRunner {
    async fn execute(
        &self,
        sql: &str,
        parameters: &BTreeMap<String, serde_json::Value>,
        row_cap: i64,
        timeout: Duration,
    ) -> Result<Vec<serde_json::Map<String, serde_json::Value>>> {
        let (positional, values) = to_positional(sql, parameters)?;

        let run = async {
            let mut tx = self.pool.begin().await?;

            // Statement timeout is scoped to this transaction.
            let millis = timeout.as_millis().max(1);
            sqlx::query(&format!("SET LOCAL statement_timeout = {}", millis))
                .execute(&mut *tx)
                .await?;

            let mut query = sqlx::query(&positional);
            for value in &values {
                query = match value {
                    serde_json::Value::Null => query.bind(None::<String>),
                    serde_json::Value::Bool(b) => query.bind(*b),
                    serde_json::Value::Number(n) => {
                        if let Some(i) = n.as_i64() {
                            query.bind(i)
                        } else {
                            query.bind(n.as_f64().unwrap_or(0.0))
                        }
                    }
                    serde_json::Value::String(s) => query.bind(s.clone()),
                    other => query.bind(other.clone()),
                };
            }

            let rows = query.fetch_all(&mut *tx).await?;
            tx.commit().await?;
            Ok::<Vec<PgRow>, anyhow::Error>(rows)
        };

        // The pool wait and the query itself share the statement window.
        let rows = tokio::time::timeout(timeout, run)
            .await
            .map_err(|_| anyhow::anyhow!("statement timed out after {:?}", timeout))??;

        let mut out = Vec::with_capacity(rows.len().min(row_cap.max(0) as usize));
        for row in rows.into_iter().take(row_cap.max(0) as usize) {
            out.push(decode_row(&row));
        }
        Ok(out)
    }
}

/// Decode one row into a JSON map, by Postgres type name with a text
/// fallback. Unknown types decode to null rather than failing the request.
fn decode_row(row: &PgRow) -> serde_json::Map<String, serde_json::Value> {
    let mut map = serde_json::Map::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let value = decode_column(row, idx, column.type_info().name());
        map.insert(column.name().to_string(), value);
    }
    map
}

fn decode_column(row: &PgRow, idx: usize, type_name: &str) -> serde_json::Value {
    use serde_json::Value;

    match type_name {
        "BOOL" => row
            .try_get::<Option<bool>, _>(idx)
            .ok()
            .flatten()
            .map(Value::Bool)
            .unwrap_or(Value::Null),
        "INT2" => int_value(row.try_get::<Option<i16>, _>(idx).ok().flatten().map(i64::from)),
        "INT4" => int_value(row.try_get::<Option<i32>, _>(idx).ok().flatten().map(i64::from)),
        "INT8" => int_value(row.try_get::<Option<i64>, _>(idx).ok().flatten()),
        "FLOAT4" => float_value(row.try_get::<Option<f32>, _>(idx).ok().flatten().map(f64::from)),
        "FLOAT8" => float_value(row.try_get::<Option<f64>, _>(idx).ok().flatten()),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "CHAR" => row
            .try_get::<Option<String>, _>(idx)
            .ok()
            .flatten()
            .map(Value::String)
            .unwrap_or(Value::Null),
        "TIMESTAMPTZ" => row
            .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx)
            .ok()
            .flatten()
            .map(|dt| Value::String(dt.to_rfc3339()))
            .unwrap_or(Value::Null),
        "TIMESTAMP" => row
            .try_get::<Option<chrono::NaiveDateTime>, _>(idx)
            .ok()
            .flatten()
            .map(|dt| Value::String(dt.format("%Y-%m-%dT%H:%M:%S").to_string()))
            .unwrap_or(Value::Null),
        "DATE" => row
            .try_get::<Option<chrono::NaiveDate>, _>(idx)
            .ok()
            .flatten()
            .map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
            .unwrap_or(Value::Null),
        "UUID" => row
            .try_get::<Option<uuid::Uuid>, _>(idx)
            .ok()
            .flatten()
            .map(|u| Value::String(u.to_string()))
            .unwrap_or(Value::Null),
        "JSON" | "JSONB" => row
            .try_get::<Option<serde_json::Value>, _>(idx)
            .ok()
            .flatten()
            .unwrap_or(Value::Null),
        _ => row
            .try_get::<Option<String>, _>(idx)
            .ok()
            .flatten()
            .map(Value::String)
            .unwrap_or(Value::Null),
    }
}

fn int_value(v: Option<i64>) -> serde_json::Value {
    v.map(serde_json::Value::from).unwrap_or(serde_json::Value::Null)
}

fn float_value(v: Option<f64>) -> serde_json::Value {
    v.and_then(|f| serde_json::Number::from_f64(f).map(serde_json::Value::Number))
        .unwrap_or(serde_json::Value::Null)
}
