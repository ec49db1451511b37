//! Long-format transformer: wide panel -> one `LongRecord` per (geography, period).
//!
//! Melt is purely structural: every identity row yields exactly one record per
//! period column. Pivoted datasets (rent estimates) then fold their bed-size
//! rows into side-by-side metrics. Sanitization nulls metric values outside the
//! dataset's domain; it never clamps them.
//!
//! This module is DETERMINISTIC: same table = same records, same order.

use crate::dataset::{Attribute, DatasetSpec, Pivot};
use crate::error::{IngestError, Result};
use crate::reader::PanelTable;
use crate::record::{Attributes, GeographyKey, LocationType, LongRecord, Metrics, Period, RecordKey};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::{debug, info, warn};

/// Resolved column positions for one table.
struct Columns {
    geo_id: usize,
    location_type: usize,
    name: usize,
    attributes: Vec<(Attribute, usize)>,
    pivot: Option<usize>,
}

pub struct Transformer<'a> {
    spec: &'a DatasetSpec,
}

impl<'a> Transformer<'a> {
    pub fn new(spec: &'a DatasetSpec) -> Self {
        Self { spec }
    }

    pub fn transform(&self, table: &PanelTable) -> Result<Vec<LongRecord>> {
        let columns = self.resolve(table)?;
        let mut nulled = 0usize;

        let records = match self.spec.pivot {
            None => self.melt(table, &columns, &mut nulled)?,
            Some(pivot) => self.melt_and_pivot(table, &columns, pivot, &mut nulled)?,
        };

        if nulled > 0 {
            info!(
                dataset = %self.spec.kind,
                nulled,
                "nulled metric values outside their domain"
            );
        }
        debug!(dataset = %self.spec.kind, records = records.len(), "transformed to long format");
        Ok(records)
    }

    fn resolve(&self, table: &PanelTable) -> Result<Columns> {
        let find = |name: &str| {
            table
                .column_index(name)
                .ok_or_else(|| IngestError::format(format!("missing required column: {name}")))
        };
        let identity = &self.spec.identity;
        let mut attributes = Vec::with_capacity(identity.attributes.len());
        for (attr, col) in identity.attributes {
            match table.column_index(col) {
                Some(idx) => attributes.push((*attr, idx)),
                None if identity.attributes_required => {
                    return Err(IngestError::format(format!("missing required column: {col}")));
                }
                // Absent optional columns leave the attribute at its default.
                None => {}
            }
        }
        let pivot = match self.spec.pivot {
            Some(p) => Some(find(p.column)?),
            None => None,
        };
        Ok(Columns {
            geo_id: find(identity.geo_id)?,
            location_type: find(identity.location_type)?,
            name: find(identity.name)?,
            attributes,
            pivot,
        })
    }

    /// One record per (row, period column). `rows_out = rows_in * period_columns`.
    fn melt(&self, table: &PanelTable, cols: &Columns, nulled: &mut usize) -> Result<Vec<LongRecord>> {
        if self.spec.metrics.len() != 1 {
            return Err(IngestError::format(format!(
                "dataset {} has {} metrics but no pivot column",
                self.spec.kind,
                self.spec.metrics.len()
            )));
        }
        let domain = self.spec.metrics[0].domain;
        let mut records = Vec::with_capacity(table.row_count() * table.period_column_count());
        let mut seen_geographies = HashSet::new();

        for row in 0..table.row_count() {
            let (geography, attributes) = self.identity(table, cols, row)?;
            if !seen_geographies.insert(geography.geo_id.clone()) {
                return Err(IngestError::format(format!(
                    "line {}: geography {} appears more than once",
                    PanelTable::line_of(row),
                    geography.geo_id
                )));
            }

            for (col, label) in table.period_columns() {
                let raw = parse_metric(table, row, col)?;
                let value = domain.sanitize(raw);
                if raw.is_some() && value.is_none() {
                    *nulled += 1;
                }
                records.push(LongRecord {
                    geography: geography.clone(),
                    period: Period::new(label),
                    attributes: attributes.clone(),
                    metrics: Metrics::from_values(vec![value]),
                });
            }
        }

        Ok(records)
    }

    /// Melt, then group by (geography, period) spreading each pivot variant
    /// into its own metric. A repeated (geography, period, variant) is ambiguous
    /// source data and fails the whole table.
    fn melt_and_pivot(
        &self,
        table: &PanelTable,
        cols: &Columns,
        pivot: Pivot,
        nulled: &mut usize,
    ) -> Result<Vec<LongRecord>> {
        let pivot_col = cols
            .pivot
            .ok_or_else(|| IngestError::format(format!("missing pivot column: {}", pivot.column)))?;

        let mut grouped: BTreeMap<RecordKey, (LongRecord, Vec<bool>)> = BTreeMap::new();
        let mut unknown_variants = BTreeSet::new();

        for row in 0..table.row_count() {
            let line = PanelTable::line_of(row);
            let (geography, attributes) = self.identity(table, cols, row)?;

            let variant = table.cell(row, pivot_col).ok_or_else(|| {
                IngestError::format(format!("line {line}: missing {}", pivot.column))
            })?;
            let Some(metric_idx) = pivot.metric_for(variant) else {
                unknown_variants.insert(variant.to_string());
                continue;
            };
            let domain = self.spec.metrics[metric_idx].domain;

            for (col, label) in table.period_columns() {
                let raw = parse_metric(table, row, col)?;
                let value = domain.sanitize(raw);
                if raw.is_some() && value.is_none() {
                    *nulled += 1;
                }

                let key = RecordKey::new(geography.geo_id.clone(), label);
                let (record, filled) = grouped.entry(key).or_insert_with(|| {
                    (
                        LongRecord {
                            geography: geography.clone(),
                            period: Period::new(label),
                            attributes: attributes.clone(),
                            metrics: Metrics::empty(self.spec),
                        },
                        vec![false; self.spec.metrics.len()],
                    )
                });
                if filled[metric_idx] {
                    return Err(IngestError::format(format!(
                        "line {line}: duplicate {} '{}' for geography {} period {}",
                        pivot.column, variant, geography.geo_id, label
                    )));
                }
                filled[metric_idx] = true;
                record.metrics.set(metric_idx, value);
            }
        }

        if !unknown_variants.is_empty() {
            warn!(
                dataset = %self.spec.kind,
                column = pivot.column,
                variants = ?unknown_variants,
                "skipped rows with unmapped pivot values"
            );
        }

        Ok(grouped.into_values().map(|(record, _)| record).collect())
    }

    /// Identity keys are never defaulted; the name and descriptive attributes
    /// are. An empty name is rejected later by the validator.
    fn identity(&self, table: &PanelTable, cols: &Columns, row: usize) -> Result<(GeographyKey, Attributes)> {
        let line = PanelTable::line_of(row);
        let identity = &self.spec.identity;

        let geo_id = table
            .cell(row, cols.geo_id)
            .ok_or_else(|| IngestError::format(format!("line {line}: missing {}", identity.geo_id)))?;
        let raw_type = table.cell(row, cols.location_type).ok_or_else(|| {
            IngestError::format(format!("line {line}: missing {}", identity.location_type))
        })?;
        let location_type = LocationType::parse(raw_type).ok_or_else(|| {
            IngestError::format(format!("line {line}: unknown location type '{raw_type}'"))
        })?;
        let mut attributes = Attributes {
            name: table.cell(row, cols.name).unwrap_or_default().to_string(),
            ..Attributes::default()
        };
        for (attr, col) in &cols.attributes {
            let cell = table.cell(row, *col);
            match attr {
                Attribute::Population => attributes.population = parse_count(cell, line, "population")?,
                Attribute::SizeRank => attributes.size_rank = parse_count(cell, line, "size rank")?,
                Attribute::State => attributes.state = cell.unwrap_or_default().to_string(),
                Attribute::County => attributes.county = cell.unwrap_or_default().to_string(),
                Attribute::Metro => attributes.metro = cell.unwrap_or_default().to_string(),
            }
        }

        Ok((
            GeographyKey {
                geo_id: geo_id.to_string(),
                location_type,
            },
            attributes,
        ))
    }
}

fn parse_metric(table: &PanelTable, row: usize, col: usize) -> Result<Option<f64>> {
    match table.cell(row, col) {
        None => Ok(None),
        Some(raw) => raw.parse::<f64>().map(Some).map_err(|_| {
            IngestError::format(format!(
                "line {}: non-numeric value '{}' in column {}",
                PanelTable::line_of(row),
                raw,
                table.headers()[col]
            ))
        }),
    }
}

/// Integral count; missing defaults to 0. Accepts `1234.0` as written by
/// spreadsheet exports.
fn parse_count(cell: Option<&str>, line: usize, what: &str) -> Result<i64> {
    let Some(raw) = cell else {
        return Ok(0);
    };
    if let Ok(n) = raw.parse::<i64>() {
        return Ok(n);
    }
    match raw.parse::<f64>() {
        Ok(f) if f.is_finite() && f.fract() == 0.0 => Ok(f as i64),
        _ => Err(IngestError::format(format!(
            "line {line}: invalid {what} '{raw}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::DatasetKind;
    use crate::reader::read_panel;

    const AL_HEADER: &str = "location_name,location_type,location_fips_code,population,state,county,metro";

    fn transform(kind: DatasetKind, csv: &str) -> Result<Vec<LongRecord>> {
        let spec = kind.spec();
        let table = read_panel(csv.as_bytes(), spec)?;
        Transformer::new(spec).transform(&table)
    }

    #[test]
    fn test_melt_row_count_invariant() {
        let csv = format!(
            "{AL_HEADER},2024_01,2024_02,2024_03\n\
             Austin,City,4805000,961855,TX,Travis,Austin,30,31,32\n\
             Travis County,County,48453,1290188,TX,Travis,Austin,28,,29\n"
        );
        let records = transform(DatasetKind::TimeOnMarket, &csv).unwrap();
        assert_eq!(records.len(), 2 * 3);

        let keys: HashSet<RecordKey> = records.iter().map(|r| r.key()).collect();
        assert_eq!(keys.len(), records.len());
        assert_eq!(records[4].metrics.get(0), None);
        assert_eq!(records[5].metrics.get(0), Some(29.0));
    }

    #[test]
    fn test_melt_carries_identity_unchanged() {
        let csv = format!("{AL_HEADER},2024_01\nAustin,City,04805000,961855,TX,Travis,Austin,30\n");
        let records = transform(DatasetKind::TimeOnMarket, &csv).unwrap();
        let r = &records[0];
        assert_eq!(r.geography.geo_id, "04805000");
        assert_eq!(r.geography.location_type, LocationType::City);
        assert_eq!(r.attributes.name, "Austin");
        assert_eq!(r.attributes.population, 961855);
        assert_eq!(r.attributes.county, "Travis");
        assert_eq!(r.period.as_str(), "2024_01");
    }

    #[test]
    fn test_vacancy_domain_clipping() {
        let csv = format!("{AL_HEADER},2024_01,2024_02,2024_03,2024_04\nAustin,City,1,1,TX,,,-0.1,1.1,0,1\n");
        let records = transform(DatasetKind::VacancyIndex, &csv).unwrap();
        let values: Vec<Option<f64>> = records.iter().map(|r| r.metrics.get(0)).collect();
        assert_eq!(values, vec![None, None, Some(0.0), Some(1.0)]);
    }

    #[test]
    fn test_negative_duration_nulled() {
        let csv = format!("{AL_HEADER},2024_01,2024_02\nAustin,City,1,1,TX,,,-3,0\n");
        let records = transform(DatasetKind::TimeOnMarket, &csv).unwrap();
        assert_eq!(records[0].metrics.get(0), None);
        assert_eq!(records[1].metrics.get(0), Some(0.0));
    }

    #[test]
    fn test_affordability_is_unrestricted() {
        let csv = "RegionID,SizeRank,RegionName,RegionType,StateName,2024-01-31\n394913,1,\"New York, NY\",msa,NY,1.42\n";
        let records = transform(DatasetKind::RenterAffordability, csv).unwrap();
        assert_eq!(records[0].metrics.get(0), Some(1.42));
        assert_eq!(records[0].geography.location_type, LocationType::Metro);
        assert_eq!(records[0].attributes.size_rank, 1);
        assert_eq!(records[0].attributes.state, "NY");
    }

    #[test]
    fn test_zillow_without_rank_or_state_columns() {
        let csv = "RegionID,RegionName,RegionType,2024-01-31\n102001,United States,country,0.31\n";
        let records = transform(DatasetKind::HomeownerAffordability, csv).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].attributes.size_rank, 0);
        assert_eq!(records[0].attributes.state, "");
    }

    #[test]
    fn test_apartment_list_attribute_columns_stay_required() {
        let csv = "location_name,location_type,location_fips_code,2024_01\nAustin,City,1,30\n";
        let err = transform(DatasetKind::TimeOnMarket, csv).unwrap_err();
        assert!(matches!(err, IngestError::Format(_)));
        assert!(err.to_string().contains("population"));
    }

    #[test]
    fn test_missing_name_is_left_for_the_validator() {
        let csv = format!("{AL_HEADER},2024_01\n,City,4805000,1,TX,,,30\n");
        let records = transform(DatasetKind::TimeOnMarket, &csv).unwrap();
        assert_eq!(records[0].attributes.name, "");
    }

    #[test]
    fn test_attribute_defaults() {
        let csv = format!("{AL_HEADER},2024_01\nUnited States,Country,1,,,,,30\n");
        let records = transform(DatasetKind::TimeOnMarket, &csv).unwrap();
        let attrs = &records[0].attributes;
        assert_eq!(attrs.population, 0);
        assert_eq!(attrs.state, "");
        assert_eq!(attrs.county, "");
        assert_eq!(attrs.metro, "");
    }

    #[test]
    fn test_float_population_accepted() {
        let csv = format!("{AL_HEADER},2024_01\nAustin,City,1,961855.0,TX,,,30\n");
        let records = transform(DatasetKind::TimeOnMarket, &csv).unwrap();
        assert_eq!(records[0].attributes.population, 961855);
    }

    #[test]
    fn test_missing_geography_id_is_fatal() {
        let csv = format!("{AL_HEADER},2024_01\nAustin,City,,1,TX,,,30\n");
        let err = transform(DatasetKind::TimeOnMarket, &csv).unwrap_err();
        assert!(matches!(err, IngestError::Format(_)));
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_unknown_location_type_is_fatal() {
        let csv = format!("{AL_HEADER},2024_01\nAustin,Zip,1,1,TX,,,30\n");
        let err = transform(DatasetKind::TimeOnMarket, &csv).unwrap_err();
        assert!(err.to_string().contains("unknown location type"));
    }

    #[test]
    fn test_non_numeric_metric_is_fatal() {
        let csv = format!("{AL_HEADER},2024_01\nAustin,City,1,1,TX,,,abc\n");
        let err = transform(DatasetKind::TimeOnMarket, &csv).unwrap_err();
        assert!(err.to_string().contains("non-numeric value 'abc'"));
    }

    #[test]
    fn test_repeated_geography_is_fatal() {
        let csv = format!("{AL_HEADER},2024_01\nAustin,City,1,1,TX,,,30\nAustin,City,1,1,TX,,,31\n");
        let err = transform(DatasetKind::TimeOnMarket, &csv).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_pivot_spreads_bed_sizes() {
        let csv = format!(
            "{AL_HEADER},bed_size,2024_01,2024_02\n\
             Austin,City,1,1,TX,,,overall,1500,1510\n\
             Austin,City,1,1,TX,,,1br,1300,\n\
             Austin,City,1,1,TX,,,2br,1700,1720\n\
             Boise,City,2,1,ID,,,overall,1200,1210\n"
        );
        let records = transform(DatasetKind::RentEstimates, &csv).unwrap();
        assert_eq!(records.len(), 4);

        let austin_jan = &records[0];
        assert_eq!(austin_jan.key(), RecordKey::new("1", "2024_01"));
        assert_eq!(austin_jan.metrics.get(0), Some(1500.0));
        assert_eq!(austin_jan.metrics.get(1), Some(1300.0));
        assert_eq!(austin_jan.metrics.get(2), Some(1700.0));

        let austin_feb = &records[1];
        assert_eq!(austin_feb.metrics.get(1), None);

        let boise_jan = &records[2];
        assert_eq!(boise_jan.metrics.get(0), Some(1200.0));
        assert_eq!(boise_jan.metrics.get(1), None);
        assert_eq!(boise_jan.metrics.get(2), None);
    }

    #[test]
    fn test_pivot_duplicate_variant_is_fatal() {
        let csv = format!(
            "{AL_HEADER},bed_size,2024_01\n\
             Austin,City,1,1,TX,,,overall,1500\n\
             Austin,City,1,1,TX,,,overall,1600\n"
        );
        let err = transform(DatasetKind::RentEstimates, &csv).unwrap_err();
        assert!(matches!(err, IngestError::Format(_)));
        assert!(err.to_string().contains("duplicate bed_size 'overall'"));
    }

    #[test]
    fn test_pivot_skips_unmapped_variants() {
        let csv = format!(
            "{AL_HEADER},bed_size,2024_01\n\
             Austin,City,1,1,TX,,,overall,1500\n\
             Austin,City,1,1,TX,,,studio,1100\n"
        );
        let records = transform(DatasetKind::RentEstimates, &csv).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].metrics.get(0), Some(1500.0));
    }

    #[test]
    fn test_transform_is_deterministic() {
        let csv = format!(
            "{AL_HEADER},bed_size,2024_01,2024_02\n\
             Boise,City,2,1,ID,,,overall,1200,1210\n\
             Austin,City,1,1,TX,,,overall,1500,1510\n"
        );
        let baseline = transform(DatasetKind::RentEstimates, &csv).unwrap();
        for _ in 0..5 {
            assert_eq!(transform(DatasetKind::RentEstimates, &csv).unwrap(), baseline);
        }
        assert_eq!(baseline[0].geography.geo_id, "1");
    }
}
