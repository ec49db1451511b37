//! Schema validator: the data-quality gate between transform and reconcile.
//!
//! Checks run in a fixed order and stop at the first failure. The result is a
//! single reason, never an aggregate report.

use crate::dataset::{DatasetSpec, VolumeRules};
use crate::error::{IngestError, Result};
use crate::reader::PanelTable;
use crate::record::LongRecord;
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Validation {
    pub ok: bool,
    pub reason: Option<String>,
}

impl Validation {
    pub fn pass() -> Self {
        Self { ok: true, reason: None }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            reason: Some(reason.into()),
        }
    }

    pub fn into_result(self) -> Result<()> {
        match self.reason {
            Some(reason) if !self.ok => Err(IngestError::Validation(reason)),
            _ => Ok(()),
        }
    }
}

pub struct Validator<'a> {
    spec: &'a DatasetSpec,
    volume: VolumeRules,
    as_of: NaiveDate,
}

impl<'a> Validator<'a> {
    /// `volume` is usually `spec.volume`; callers may relax it for backfills
    /// of partial panels.
    pub fn new(spec: &'a DatasetSpec, volume: VolumeRules) -> Self {
        Self {
            spec,
            volume,
            as_of: Utc::now().date_naive(),
        }
    }

    /// Date the coverage rule counts months up to. Defaults to today (UTC).
    pub fn as_of(mut self, as_of: NaiveDate) -> Self {
        self.as_of = as_of;
        self
    }

    pub fn validate(&self, table: &PanelTable, records: &[LongRecord]) -> Validation {
        let outcome = self
            .check_columns(table)
            .and_then(|_| self.check_volume(table))
            .and_then(|_| self.check_empty_columns(table))
            .and_then(|_| self.check_records(records));

        match outcome {
            Ok(()) => {
                debug!(dataset = %self.spec.kind, records = records.len(), "validation passed");
                Validation::pass()
            }
            Err(reason) => {
                warn!(dataset = %self.spec.kind, %reason, "validation failed");
                Validation::fail(reason)
            }
        }
    }

    // ---
    // Structure
    // ---

    fn check_columns(&self, table: &PanelTable) -> Result<(), String> {
        let mut required = self.spec.identity.required();
        if let Some(pivot) = self.spec.pivot {
            required.push(pivot.column);
        }
        let missing: Vec<&str> = required
            .into_iter()
            .filter(|col| table.column_index(col).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(format!("missing required columns: {missing:?}"));
        }
        if table.period_column_count() == 0 {
            return Err(format!(
                "no period columns matching {}",
                self.spec.period_format.describe()
            ));
        }
        Ok(())
    }

    // ---
    // Volume
    // ---

    fn check_volume(&self, table: &PanelTable) -> Result<(), String> {
        let rows = table.row_count();
        if rows < self.volume.min_rows {
            return Err(format!(
                "row count {rows} is below the minimum of {}",
                self.volume.min_rows
            ));
        }

        let periods = table.period_column_count();
        if periods < self.volume.min_period_columns {
            return Err(format!(
                "period column count {periods} is below the minimum of {}",
                self.volume.min_period_columns
            ));
        }

        if let Some(coverage) = self.volume.coverage {
            let needed = coverage.min_period_columns(self.as_of);
            if periods < needed {
                return Err(format!(
                    "period column count {periods} covers less than {}% of the {} months since {}-01 (need {needed})",
                    coverage.percent,
                    coverage.expected_months(self.as_of),
                    coverage.since_year
                ));
            }
        }

        if let Some(expected) = self.volume.earliest_period {
            // Both period formats sort chronologically as text.
            let earliest = table.period_columns().map(|(_, p)| p).min();
            if let Some(earliest) = earliest {
                if earliest > expected {
                    return Err(format!(
                        "earliest period {earliest} is later than expected {expected}"
                    ));
                }
            }
        }
        Ok(())
    }

    fn check_empty_columns(&self, table: &PanelTable) -> Result<(), String> {
        let empty: Vec<&str> = table
            .headers()
            .iter()
            .enumerate()
            .filter(|(idx, _)| table.is_column_empty(*idx))
            .map(|(_, h)| h.as_str())
            .collect();
        if empty.is_empty() {
            Ok(())
        } else {
            Err(format!("completely empty columns: {empty:?}"))
        }
    }

    // ---
    // Records
    // ---

    fn check_records(&self, records: &[LongRecord]) -> Result<(), String> {
        let format = self.spec.period_format;
        for record in records {
            let key = record.key();
            if record.geography.geo_id.trim().is_empty() {
                return Err(format!("record {key}: empty geography id"));
            }
            if record.attributes.name.trim().is_empty() {
                return Err(format!("record {key}: empty location name"));
            }
            if !format.is_calendar_valid(record.period.as_str()) {
                return Err(format!(
                    "record {key}: period is not a valid {} label",
                    format.describe()
                ));
            }
            if record.metrics.len() != self.spec.metrics.len() {
                return Err(format!(
                    "record {key}: expected {} metrics, found {}",
                    self.spec.metrics.len(),
                    record.metrics.len()
                ));
            }
            for (metric, value) in self.spec.metrics.iter().zip(record.metrics.iter()) {
                if let Some(v) = value {
                    if !metric.domain.contains(v) {
                        return Err(format!(
                            "record {key}: {} = {v} outside {}",
                            metric.column,
                            metric.domain.describe()
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{DatasetKind, PeriodCoverage};
    use crate::reader::read_panel;
    use crate::record::{Attributes, GeographyKey, LocationType, Metrics, Period};
    use crate::transform::Transformer;

    const AL_HEADER: &str = "location_name,location_type,location_fips_code,population,state,county,metro";

    fn small() -> VolumeRules {
        VolumeRules::PERMISSIVE
    }

    fn run(kind: DatasetKind, csv: &str, volume: VolumeRules) -> Validation {
        let spec = kind.spec();
        let table = read_panel(csv.as_bytes(), spec).unwrap();
        let records = Transformer::new(spec).transform(&table).unwrap();
        Validator::new(spec, volume).validate(&table, &records)
    }

    fn austin(period: &str, value: Option<f64>) -> LongRecord {
        LongRecord {
            geography: GeographyKey {
                geo_id: "4805000".into(),
                location_type: LocationType::City,
            },
            period: Period::new(period),
            attributes: Attributes {
                name: "Austin".into(),
                ..Attributes::default()
            },
            metrics: Metrics::from_values(vec![value]),
        }
    }

    fn tom_table() -> PanelTable {
        let csv = format!("{AL_HEADER},2024_01\nAustin,City,4805000,1,TX,Travis,Austin,30\n");
        read_panel(csv.as_bytes(), DatasetKind::TimeOnMarket.spec()).unwrap()
    }

    // ---
    // Pass / fail plumbing
    // ---

    #[test]
    fn test_clean_panel_passes() {
        let csv = format!(
            "{AL_HEADER},2024_01,2024_02\n\
             Austin,City,4805000,961855,TX,Travis,Austin,0.05,0.06\n\
             Travis County,County,48453,1290188,TX,Travis,Austin,0.04,\n"
        );
        let v = run(DatasetKind::VacancyIndex, &csv, small());
        assert_eq!(v, Validation::pass());
        assert!(v.into_result().is_ok());
    }

    #[test]
    fn test_failure_maps_to_validation_error() {
        let err = Validation::fail("too short").into_result().unwrap_err();
        assert!(matches!(err, IngestError::Validation(ref r) if r == "too short"));
    }

    // ---
    // Volume
    // ---

    #[test]
    fn test_row_minimum() {
        let csv = format!("{AL_HEADER},2024_01\nAustin,City,4805000,1,TX,Travis,Austin,0.05\n");
        let rules = VolumeRules {
            min_rows: 100,
            ..small()
        };
        let v = run(DatasetKind::VacancyIndex, &csv, rules);
        assert!(!v.ok);
        assert!(v.reason.unwrap().contains("row count 1 is below the minimum of 100"));
    }

    #[test]
    fn test_period_minimum_and_earliest_period() {
        let csv = format!("{AL_HEADER},2019_02,2019_03\nAustin,City,4805000,1,TX,Travis,Austin,30,31\n");

        let rules = VolumeRules {
            min_period_columns: 73,
            ..small()
        };
        let v = run(DatasetKind::TimeOnMarket, &csv, rules);
        assert!(v.reason.unwrap().contains("period column count 2"));

        let rules = VolumeRules {
            earliest_period: Some("2019_01"),
            ..small()
        };
        let v = run(DatasetKind::TimeOnMarket, &csv, rules);
        assert!(v.reason.unwrap().contains("earliest period 2019_02"));
    }

    #[test]
    fn test_vacancy_coverage_grows_with_the_run_date() {
        let csv = format!("{AL_HEADER},2017_01,2017_02,2017_03\nAustin,City,4805000,1,TX,Travis,Austin,0.05,0.06,0.07\n");
        let spec = DatasetKind::VacancyIndex.spec();
        let table = read_panel(csv.as_bytes(), spec).unwrap();
        let records = Transformer::new(spec).transform(&table).unwrap();
        let rules = VolumeRules {
            coverage: Some(PeriodCoverage {
                since_year: 2017,
                percent: 80,
            }),
            ..small()
        };

        // 4 months expected, 3 required
        let early = NaiveDate::from_ymd_opt(2017, 5, 2).unwrap();
        let v = Validator::new(spec, rules).as_of(early).validate(&table, &records);
        assert!(v.ok);

        // 12 months expected, 9 required
        let later = NaiveDate::from_ymd_opt(2018, 1, 2).unwrap();
        let v = Validator::new(spec, rules).as_of(later).validate(&table, &records);
        let reason = v.reason.unwrap();
        assert!(reason.contains("covers less than 80% of the 12 months since 2017-01"));
        assert!(reason.contains("need 9"));
    }

    fn panel_with_rows(kind: DatasetKind, rows: usize) -> String {
        let mut csv = match kind {
            DatasetKind::RentEstimates => format!("{AL_HEADER},bed_size,2024_01\n"),
            DatasetKind::VacancyIndex | DatasetKind::TimeOnMarket => format!("{AL_HEADER},2024_01\n"),
            _ => "RegionID,RegionName,RegionType,SizeRank,StateName,2024-01-31\n".to_string(),
        };
        for i in 0..rows {
            let row = match kind {
                DatasetKind::RentEstimates => format!("Place {i},City,{i:07},1,TX,Travis,Austin,overall,1500"),
                DatasetKind::VacancyIndex | DatasetKind::TimeOnMarket => {
                    format!("Place {i},City,{i:07},1,TX,Travis,Austin,0.05")
                }
                _ => format!("{i},Place {i},msa,{i},TX,0.3"),
            };
            csv.push_str(&row);
            csv.push('\n');
        }
        csv
    }

    #[test]
    fn test_dataset_row_minimums() {
        let cases = [
            (DatasetKind::RentEstimates, 3000),
            (DatasetKind::VacancyIndex, 400),
            (DatasetKind::HomeownerAffordability, 10),
            (DatasetKind::RenterAffordability, 200),
            (DatasetKind::MedianSalePrice, 50),
        ];
        for (kind, min_rows) in cases {
            let spec = kind.spec();
            assert_eq!(spec.volume.min_rows, min_rows, "{kind}");
            let csv = panel_with_rows(kind, min_rows - 1);
            let table = read_panel(csv.as_bytes(), spec).unwrap();
            let err = Validator::new(spec, spec.volume)
                .validate(&table, &[])
                .into_result()
                .unwrap_err();
            let expected = format!("row count {} is below the minimum of {min_rows}", min_rows - 1);
            assert!(matches!(err, IngestError::Validation(ref r) if r.contains(&expected)), "{kind}: {err}");
        }
    }

    #[test]
    fn test_row_check_runs_before_period_check() {
        let csv = format!("{AL_HEADER},2024_01\nAustin,City,4805000,1,TX,Travis,Austin,30\n");
        let v = run(DatasetKind::TimeOnMarket, &csv, DatasetKind::TimeOnMarket.spec().volume);
        assert!(v.reason.unwrap().starts_with("row count"));
    }

    #[test]
    fn test_completely_empty_column() {
        let csv = format!(
            "{AL_HEADER},2024_01,2024_02\n\
             Austin,City,4805000,1,TX,Travis,Austin,30,\n\
             Boise,City,1608830,1,ID,Ada,Boise,28,\n"
        );
        let v = run(DatasetKind::TimeOnMarket, &csv, small());
        assert!(v.reason.unwrap().contains("\"2024_02\""));
    }

    // ---
    // Records
    // ---

    #[test]
    fn test_record_period_must_be_a_real_month() {
        let table = tom_table();
        let spec = DatasetKind::TimeOnMarket.spec();
        let v = Validator::new(spec, small()).validate(&table, &[austin("2024_13", Some(3.0))]);
        assert!(v.reason.unwrap().contains("not a valid YYYY_MM"));
    }

    #[test]
    fn test_record_identity_reasserted() {
        let table = tom_table();
        let spec = DatasetKind::TimeOnMarket.spec();
        let mut record = austin("2024_01", Some(3.0));
        record.attributes.name = " ".into();
        let v = Validator::new(spec, small()).validate(&table, &[record]);
        assert!(v.reason.unwrap().contains("empty location name"));
    }

    #[test]
    fn test_record_domain_reasserted() {
        let table = tom_table();
        let spec = DatasetKind::TimeOnMarket.spec();
        let v = Validator::new(spec, small()).validate(&table, &[austin("2024_01", Some(-1.0))]);
        assert!(v.reason.unwrap().contains("time_on_market = -1 outside >= 0"));

        let v = Validator::new(spec, small()).validate(&table, &[austin("2024_01", None)]);
        assert!(v.ok);
    }
}
