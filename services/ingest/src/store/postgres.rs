//! Postgres store.
//!
//! Table, view and column names come from the static dataset table, never from
//! input, so they are interpolated into SQL directly (quoted). Values are
//! always bound.

use super::Store;
use crate::dataset::{Attribute, DatasetSpec, PeriodFormat};
use crate::error::StoreError;
use crate::record::{Attributes, ExistingRecord, GeographyKey, LocationType, LongRecord, Metrics, Period, RecordKey};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use std::collections::{HashMap, HashSet};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(db_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new().max_connections(5).connect(db_url).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // =========================================================================
    // Run audit trail
    // =========================================================================

    pub async fn create_run(&self, dataset: &str, source: &str) -> Result<Uuid, StoreError> {
        let run_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO ingest_runs (run_id, dataset, source, status, detail)
            VALUES ($1, $2, $3, 'running', '{}')
            "#,
        )
        .bind(run_id)
        .bind(dataset)
        .bind(source)
        .execute(&self.pool)
        .await?;

        Ok(run_id)
    }

    pub async fn finish_run(
        &self,
        run_id: Uuid,
        status: &str,
        detail: &JsonValue,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE ingest_runs
            SET finished_at = now(), status = $2, detail = $3, error = $4
            WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .bind(status)
        .bind(detail)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn ident(name: &str) -> String {
    format!("\"{name}\"")
}

/// Period column as text in the dataset's own label format.
fn period_select(spec: &DatasetSpec) -> String {
    let col = ident(spec.layout.period_column);
    match spec.period_format {
        PeriodFormat::YearMonth => format!("t.{col}"),
        PeriodFormat::IsoDate => format!("to_char(t.{col}, 'YYYY-MM-DD')"),
    }
}

/// Right-hand side of a period comparison against a text value.
fn period_cast(spec: &DatasetSpec) -> &'static str {
    match spec.period_format {
        PeriodFormat::YearMonth => "",
        PeriodFormat::IsoDate => "::date",
    }
}

fn select_list(spec: &DatasetSpec) -> String {
    let layout = &spec.layout;
    let mut cols = vec![
        format!("t.{}::text AS geo_id", ident(layout.geo_column)),
        format!("{} AS period", period_select(spec)),
        format!("t.{} AS location_type", ident(layout.type_column)),
        format!("t.{} AS location_name", ident(layout.name_column)),
    ];
    cols.extend(layout.attributes.iter().map(|(_, col)| format!("t.{}", ident(col))));
    cols.extend(spec.metrics.iter().map(|m| format!("t.{}", ident(m.column))));
    cols.push("t.last_update_time".to_string());
    cols.join(", ")
}

/// Insert column order. Values are pushed in the same order by `upsert_batch`.
fn insert_columns(spec: &DatasetSpec) -> Vec<&'static str> {
    let layout = &spec.layout;
    let mut cols = vec![layout.geo_column, layout.period_column, layout.type_column, layout.name_column];
    cols.extend(layout.attributes.iter().map(|(_, col)| *col));
    cols.extend(spec.metric_names());
    cols.push("last_update_time");
    cols
}

/// Every non-key column is replaced with the incoming value.
fn conflict_clause(spec: &DatasetSpec) -> String {
    let layout = &spec.layout;
    let updates: Vec<String> = insert_columns(spec)
        .into_iter()
        .filter(|c| *c != layout.geo_column && *c != layout.period_column)
        .map(|c| format!("{0} = EXCLUDED.{0}", ident(c)))
        .collect();
    format!(
        " ON CONFLICT ({}, {}) DO UPDATE SET {}",
        ident(layout.geo_column),
        ident(layout.period_column),
        updates.join(", ")
    )
}

fn decode_row(spec: &DatasetSpec, row: &PgRow) -> Result<ExistingRecord, StoreError> {
    let geo_id: String = row.try_get("geo_id")?;
    let period: String = row.try_get("period")?;
    let raw_type: String = row.try_get("location_type")?;
    let location_type = LocationType::parse(&raw_type).ok_or_else(|| {
        StoreError::Rejected(format!(
            "{}: unknown location type '{raw_type}' for {geo_id}",
            spec.layout.table
        ))
    })?;

    let mut attributes = Attributes {
        name: row.try_get("location_name")?,
        ..Attributes::default()
    };
    for (attr, col) in spec.layout.attributes {
        match attr {
            Attribute::Population => {
                attributes.population = row.try_get::<Option<i64>, _>(*col)?.unwrap_or(0)
            }
            Attribute::SizeRank => {
                attributes.size_rank = row.try_get::<Option<i64>, _>(*col)?.unwrap_or(0)
            }
            Attribute::State => attributes.state = row.try_get::<Option<String>, _>(*col)?.unwrap_or_default(),
            Attribute::County => attributes.county = row.try_get::<Option<String>, _>(*col)?.unwrap_or_default(),
            Attribute::Metro => attributes.metro = row.try_get::<Option<String>, _>(*col)?.unwrap_or_default(),
        }
    }

    let values = spec
        .metrics
        .iter()
        .map(|m| row.try_get::<Option<f64>, _>(m.column))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ExistingRecord {
        record: LongRecord {
            geography: GeographyKey { geo_id, location_type },
            period: Period::new(period),
            attributes,
            metrics: Metrics::from_values(values),
        },
        last_update_time: row.try_get("last_update_time")?,
    })
}

#[async_trait]
impl Store for PgStore {
    async fn fetch_existing(
        &self,
        spec: &DatasetSpec,
        keys: &[RecordKey],
    ) -> Result<HashMap<RecordKey, ExistingRecord>, StoreError> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let layout = &spec.layout;
        let geo_ids: Vec<&str> = keys.iter().map(|k| k.geo_id.as_str()).collect();
        let periods: Vec<&str> = keys.iter().map(|k| k.period.as_str()).collect();

        let sql = format!(
            r#"
            SELECT {select}
            FROM {table} t
            JOIN unnest($1::text[], $2::text[]) AS k(geo_id, period)
              ON t.{geo}::text = k.geo_id AND t.{period} = k.period{cast}
            "#,
            select = select_list(spec),
            table = ident(layout.table),
            geo = ident(layout.geo_column),
            period = ident(layout.period_column),
            cast = period_cast(spec),
        );

        let rows = sqlx::query(&sql)
            .bind(&geo_ids)
            .bind(&periods)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| decode_row(spec, row).map(|r| (r.record.key(), r)))
            .collect()
    }

    async fn known_geographies(
        &self,
        spec: &DatasetSpec,
        geo_ids: &[String],
    ) -> Result<HashSet<String>, StoreError> {
        if geo_ids.is_empty() {
            return Ok(HashSet::new());
        }
        let geo = ident(spec.layout.geo_column);
        let sql = format!(
            "SELECT DISTINCT {geo}::text FROM {table} WHERE {geo}::text = ANY($1::text[])",
            table = ident(spec.layout.table),
        );
        let rows: Vec<(String,)> = sqlx::query_as(&sql).bind(geo_ids).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn upsert_batch(
        &self,
        spec: &DatasetSpec,
        records: &[LongRecord],
        stamped_at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        let layout = &spec.layout;
        let columns: Vec<String> = insert_columns(spec).into_iter().map(ident).collect();

        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "INSERT INTO {} ({}) ",
            ident(layout.table),
            columns.join(", ")
        ));
        qb.push_values(records, |mut row, record| {
            row.push_bind(record.geography.geo_id.clone());
            row.push_bind(record.period.as_str().to_string())
                .push_unseparated(period_cast(spec));
            row.push_bind(record.geography.location_type.as_str());
            row.push_bind(record.attributes.name.clone());
            for (attr, _) in layout.attributes {
                match attr {
                    Attribute::Population => row.push_bind(record.attributes.population),
                    Attribute::SizeRank => row.push_bind(record.attributes.size_rank),
                    Attribute::State => row.push_bind(record.attributes.state.clone()),
                    Attribute::County => row.push_bind(record.attributes.county.clone()),
                    Attribute::Metro => row.push_bind(record.attributes.metro.clone()),
                };
            }
            for value in record.metrics.iter() {
                row.push_bind(value);
            }
            row.push_bind(stamped_at);
        });
        qb.push(conflict_clause(spec));

        let result = qb.build().execute(&self.pool).await?;
        debug!(
            dataset = %spec.kind,
            rows = records.len(),
            affected = result.rows_affected(),
            "upserted batch"
        );
        Ok(result.rows_affected())
    }

    async fn refresh_view(&self, spec: &DatasetSpec) -> Result<(), StoreError> {
        let sql = format!("REFRESH MATERIALIZED VIEW {}", ident(spec.layout.view));
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::DatasetKind;

    #[test]
    fn test_insert_columns_follow_layout() {
        let cols = insert_columns(DatasetKind::RentEstimates.spec());
        assert_eq!(
            cols,
            vec![
                "location_fips_code",
                "year_month",
                "location_type",
                "location_name",
                "population",
                "state",
                "county",
                "metro",
                "rent_estimate_overall",
                "rent_estimate_1br",
                "rent_estimate_2br",
                "last_update_time",
            ]
        );
    }

    #[test]
    fn test_conflict_target_is_geo_and_period() {
        let clause = conflict_clause(DatasetKind::MedianSalePrice.spec());
        assert!(clause.starts_with(" ON CONFLICT (\"region_id\", \"date\") DO UPDATE SET"));
        assert!(clause.contains("\"median_sale_price_all_home\" = EXCLUDED.\"median_sale_price_all_home\""));
        assert!(clause.contains("\"last_update_time\" = EXCLUDED.\"last_update_time\""));
        assert!(!clause.contains("\"region_id\" = EXCLUDED"));
    }

    #[test]
    fn test_date_periods_round_trip_as_text() {
        let spec = DatasetKind::RenterAffordability.spec();
        assert_eq!(period_select(spec), "to_char(t.\"date\", 'YYYY-MM-DD')");
        assert_eq!(period_cast(spec), "::date");
        assert_eq!(period_cast(DatasetKind::VacancyIndex.spec()), "");
        assert!(select_list(spec).contains("t.\"size_rank\""));
    }
}
