//! Dataset policy table.
//!
//! Each provider panel is described by one static `DatasetSpec`: how its
//! periods are labelled, which source columns identify a geography, which
//! metrics it carries (with their domain and zero policy), how it maps onto
//! the store, and the volume floor that guards against truncated files.
//! Reader, transformer, validator, reconciler and store all read from here;
//! there is no per-dataset code path.

use chrono::{Datelike, NaiveDate};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum DatasetKind {
    RentEstimates,
    VacancyIndex,
    TimeOnMarket,
    HomeownerAffordability,
    RenterAffordability,
    MedianSalePrice,
}

impl DatasetKind {
    pub const ALL: [DatasetKind; 6] = [
        DatasetKind::RentEstimates,
        DatasetKind::VacancyIndex,
        DatasetKind::TimeOnMarket,
        DatasetKind::HomeownerAffordability,
        DatasetKind::RenterAffordability,
        DatasetKind::MedianSalePrice,
    ];

    pub fn spec(self) -> &'static DatasetSpec {
        match self {
            DatasetKind::RentEstimates => &RENT_ESTIMATES,
            DatasetKind::VacancyIndex => &VACANCY_INDEX,
            DatasetKind::TimeOnMarket => &TIME_ON_MARKET,
            DatasetKind::HomeownerAffordability => &HOMEOWNER_AFFORDABILITY,
            DatasetKind::RenterAffordability => &RENTER_AFFORDABILITY,
            DatasetKind::MedianSalePrice => &MEDIAN_SALE_PRICE,
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.spec().slug == slug)
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.spec().slug)
    }
}

/// How period columns are labelled in the wide panel and stored in the long table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodFormat {
    /// `YYYY_MM`
    YearMonth,
    /// `YYYY-MM-DD`
    IsoDate,
}

impl PeriodFormat {
    fn pattern(self) -> &'static Regex {
        static YEAR_MONTH: OnceLock<Regex> = OnceLock::new();
        static ISO_DATE: OnceLock<Regex> = OnceLock::new();
        match self {
            PeriodFormat::YearMonth => {
                YEAR_MONTH.get_or_init(|| Regex::new(r"^\d{4}_\d{2}$").expect("static pattern"))
            }
            PeriodFormat::IsoDate => {
                ISO_DATE.get_or_init(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").expect("static pattern"))
            }
        }
    }

    /// Strict shape test. Truncated or otherwise near-miss labels never match.
    pub fn matches(self, label: &str) -> bool {
        self.pattern().is_match(label)
    }

    /// Shape test plus a calendar check (`2024_13` has the shape but no month).
    pub fn is_calendar_valid(self, label: &str) -> bool {
        if !self.matches(label) {
            return false;
        }
        match self {
            PeriodFormat::YearMonth => {
                let (year, month) = label.split_at(4);
                match (year.parse::<i32>(), month[1..].parse::<u32>()) {
                    (Ok(y), Ok(m)) => NaiveDate::from_ymd_opt(y, m, 1).is_some(),
                    _ => false,
                }
            }
            PeriodFormat::IsoDate => NaiveDate::parse_from_str(label, "%Y-%m-%d").is_ok(),
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            PeriodFormat::YearMonth => "YYYY_MM",
            PeriodFormat::IsoDate => "YYYY-MM-DD",
        }
    }
}

/// Valid value range of a metric. Values outside it are nulled, never clamped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    NonNegative,
    UnitInterval,
    Unrestricted,
}

impl Domain {
    pub fn contains(self, value: f64) -> bool {
        if !value.is_finite() {
            return false;
        }
        match self {
            Domain::NonNegative => value >= 0.0,
            Domain::UnitInterval => (0.0..=1.0).contains(&value),
            Domain::Unrestricted => true,
        }
    }

    pub fn sanitize(self, value: Option<f64>) -> Option<f64> {
        value.filter(|v| self.contains(*v))
    }

    pub fn describe(self) -> &'static str {
        match self {
            Domain::NonNegative => ">= 0",
            Domain::UnitInterval => "[0, 1]",
            Domain::Unrestricted => "finite",
        }
    }
}

/// Whether an incoming zero counts as a reported value during reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZeroPolicy {
    /// Only null means "not reported"; zero is a true zero.
    NullOnly,
    /// Null and zero both mean "not reported".
    ZeroIsMissing,
}

impl ZeroPolicy {
    pub fn reports(self, value: Option<f64>) -> bool {
        match (self, value) {
            (_, None) => false,
            (ZeroPolicy::NullOnly, Some(_)) => true,
            (ZeroPolicy::ZeroIsMissing, Some(v)) => v != 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MetricSpec {
    /// Store column, also the metric's name in long records.
    pub column: &'static str,
    pub domain: Domain,
    pub zero_policy: ZeroPolicy,
}

/// A categorical source column whose values become side-by-side metrics.
#[derive(Debug, Clone, Copy)]
pub struct Pivot {
    pub column: &'static str,
    /// (source value, index into `DatasetSpec::metrics`)
    pub variants: &'static [(&'static str, usize)],
}

impl Pivot {
    pub fn metric_for(&self, value: &str) -> Option<usize> {
        self.variants
            .iter()
            .find(|(label, _)| label.eq_ignore_ascii_case(value))
            .map(|(_, idx)| *idx)
    }
}

/// Descriptive attributes carried alongside a geography.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribute {
    Population,
    State,
    County,
    Metro,
    SizeRank,
}

/// Source column names for the identity and attribute fields of a panel row.
#[derive(Debug, Clone, Copy)]
pub struct IdentityColumns {
    pub geo_id: &'static str,
    pub location_type: &'static str,
    pub name: &'static str,
    pub attributes: &'static [(Attribute, &'static str)],
    /// When false, absent attribute columns default like empty cells.
    pub attributes_required: bool,
}

impl IdentityColumns {
    /// Columns that must be present in the source header.
    pub fn required(&self) -> Vec<&'static str> {
        let mut cols = vec![self.name, self.location_type, self.geo_id];
        if self.attributes_required {
            cols.extend(self.attributes.iter().map(|(_, col)| *col));
        }
        cols
    }
}

/// Where a dataset lives in the store.
#[derive(Debug, Clone, Copy)]
pub struct StoreLayout {
    pub table: &'static str,
    pub view: &'static str,
    pub geo_column: &'static str,
    pub period_column: &'static str,
    pub name_column: &'static str,
    pub type_column: &'static str,
    pub attributes: &'static [(Attribute, &'static str)],
}

/// Volume floor for a panel. A provider occasionally publishes a truncated
/// file; these thresholds reject it before anything reaches the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeRules {
    pub min_rows: usize,
    pub min_period_columns: usize,
    pub earliest_period: Option<&'static str>,
    pub coverage: Option<PeriodCoverage>,
}

impl VolumeRules {
    pub const PERMISSIVE: VolumeRules = VolumeRules {
        min_rows: 1,
        min_period_columns: 1,
        earliest_period: None,
        coverage: None,
    };
}

/// A growing series must carry period columns for at least `percent` of the
/// months from January of `since_year` through the month before the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodCoverage {
    pub since_year: i32,
    pub percent: usize,
}

impl PeriodCoverage {
    pub fn expected_months(&self, as_of: NaiveDate) -> usize {
        let months = (as_of.year() - self.since_year) * 12 + as_of.month0() as i32;
        usize::try_from(months).unwrap_or(0)
    }

    pub fn min_period_columns(&self, as_of: NaiveDate) -> usize {
        self.expected_months(as_of) * self.percent / 100
    }
}

#[derive(Debug)]
pub struct DatasetSpec {
    pub kind: DatasetKind,
    pub slug: &'static str,
    pub provider: &'static str,
    pub period_format: PeriodFormat,
    pub identity: IdentityColumns,
    pub pivot: Option<Pivot>,
    pub metrics: &'static [MetricSpec],
    pub layout: StoreLayout,
    pub volume: VolumeRules,
}

impl DatasetSpec {
    pub fn metric_index(&self, column: &str) -> Option<usize> {
        self.metrics.iter().position(|m| m.column == column)
    }

    pub fn metric_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.metrics.iter().map(|m| m.column)
    }
}

// =============================================================================
// Apartment List
// =============================================================================

const APARTMENT_LIST_ATTRIBUTES: &[(Attribute, &str)] = &[
    (Attribute::Population, "population"),
    (Attribute::State, "state"),
    (Attribute::County, "county"),
    (Attribute::Metro, "metro"),
];

const APARTMENT_LIST_IDENTITY: IdentityColumns = IdentityColumns {
    geo_id: "location_fips_code",
    location_type: "location_type",
    name: "location_name",
    attributes: APARTMENT_LIST_ATTRIBUTES,
    attributes_required: true,
};

const fn apartment_list_layout(table: &'static str, view: &'static str) -> StoreLayout {
    StoreLayout {
        table,
        view,
        geo_column: "location_fips_code",
        period_column: "year_month",
        name_column: "location_name",
        type_column: "location_type",
        attributes: APARTMENT_LIST_ATTRIBUTES,
    }
}

static RENT_ESTIMATES: DatasetSpec = DatasetSpec {
    kind: DatasetKind::RentEstimates,
    slug: "rent-estimates",
    provider: "apartment_list",
    period_format: PeriodFormat::YearMonth,
    identity: APARTMENT_LIST_IDENTITY,
    pivot: Some(Pivot {
        column: "bed_size",
        variants: &[("overall", 0), ("1br", 1), ("2br", 2)],
    }),
    metrics: &[
        MetricSpec {
            column: "rent_estimate_overall",
            domain: Domain::NonNegative,
            zero_policy: ZeroPolicy::ZeroIsMissing,
        },
        MetricSpec {
            column: "rent_estimate_1br",
            domain: Domain::NonNegative,
            zero_policy: ZeroPolicy::ZeroIsMissing,
        },
        MetricSpec {
            column: "rent_estimate_2br",
            domain: Domain::NonNegative,
            zero_policy: ZeroPolicy::ZeroIsMissing,
        },
    ],
    layout: apartment_list_layout(
        "apartment_list_rent_estimates",
        "apartment_list_rent_estimates_view",
    ),
    volume: VolumeRules {
        min_rows: 3000,
        min_period_columns: 1,
        earliest_period: None,
        coverage: None,
    },
};

static VACANCY_INDEX: DatasetSpec = DatasetSpec {
    kind: DatasetKind::VacancyIndex,
    slug: "vacancy-index",
    provider: "apartment_list",
    period_format: PeriodFormat::YearMonth,
    identity: APARTMENT_LIST_IDENTITY,
    pivot: None,
    metrics: &[MetricSpec {
        column: "vacancy_index",
        domain: Domain::UnitInterval,
        zero_policy: ZeroPolicy::NullOnly,
    }],
    layout: apartment_list_layout(
        "apartment_list_vacancy_index",
        "apartment_list_vacancy_index_view",
    ),
    // Series starts January 2017 and grows by one column a month.
    volume: VolumeRules {
        min_rows: 400,
        min_period_columns: 1,
        earliest_period: None,
        coverage: Some(PeriodCoverage {
            since_year: 2017,
            percent: 80,
        }),
    },
};

static TIME_ON_MARKET: DatasetSpec = DatasetSpec {
    kind: DatasetKind::TimeOnMarket,
    slug: "time-on-market",
    provider: "apartment_list",
    period_format: PeriodFormat::YearMonth,
    identity: APARTMENT_LIST_IDENTITY,
    pivot: None,
    metrics: &[MetricSpec {
        column: "time_on_market",
        domain: Domain::NonNegative,
        zero_policy: ZeroPolicy::NullOnly,
    }],
    layout: apartment_list_layout(
        "apartment_list_time_on_market",
        "apartment_list_time_on_market_view",
    ),
    // Series starts January 2019; 73 months through January 2025.
    volume: VolumeRules {
        min_rows: 100,
        min_period_columns: 73,
        earliest_period: Some("2019_01"),
        coverage: None,
    },
};

// =============================================================================
// Zillow
// =============================================================================

const ZILLOW_IDENTITY: IdentityColumns = IdentityColumns {
    geo_id: "RegionID",
    location_type: "RegionType",
    name: "RegionName",
    attributes: &[(Attribute::SizeRank, "SizeRank"), (Attribute::State, "StateName")],
    attributes_required: false,
};

const ZILLOW_STORE_ATTRIBUTES: &[(Attribute, &str)] =
    &[(Attribute::SizeRank, "size_rank"), (Attribute::State, "state_name")];

const fn zillow_layout(table: &'static str, view: &'static str) -> StoreLayout {
    StoreLayout {
        table,
        view,
        geo_column: "region_id",
        period_column: "date",
        name_column: "region_name",
        type_column: "region_type",
        attributes: ZILLOW_STORE_ATTRIBUTES,
    }
}

static HOMEOWNER_AFFORDABILITY: DatasetSpec = DatasetSpec {
    kind: DatasetKind::HomeownerAffordability,
    slug: "homeowner-affordability",
    provider: "zillow",
    period_format: PeriodFormat::IsoDate,
    identity: ZILLOW_IDENTITY,
    pivot: None,
    metrics: &[MetricSpec {
        column: "new_home_affordability_down_20pct",
        domain: Domain::Unrestricted,
        zero_policy: ZeroPolicy::NullOnly,
    }],
    layout: zillow_layout(
        "zillow_new_home_affordability_down_20pct",
        "zillow_new_home_affordability_down_20pct_view",
    ),
    volume: VolumeRules {
        min_rows: 10,
        min_period_columns: 1,
        earliest_period: None,
        coverage: None,
    },
};

static RENTER_AFFORDABILITY: DatasetSpec = DatasetSpec {
    kind: DatasetKind::RenterAffordability,
    slug: "renter-affordability",
    provider: "zillow",
    period_format: PeriodFormat::IsoDate,
    identity: ZILLOW_IDENTITY,
    pivot: None,
    metrics: &[MetricSpec {
        column: "new_renter_affordability",
        domain: Domain::Unrestricted,
        zero_policy: ZeroPolicy::NullOnly,
    }],
    layout: zillow_layout(
        "zillow_new_renter_affordability",
        "zillow_new_renter_affordability_view",
    ),
    volume: VolumeRules {
        min_rows: 200,
        min_period_columns: 1,
        earliest_period: None,
        coverage: None,
    },
};

static MEDIAN_SALE_PRICE: DatasetSpec = DatasetSpec {
    kind: DatasetKind::MedianSalePrice,
    slug: "median-sale-price",
    provider: "zillow",
    period_format: PeriodFormat::IsoDate,
    identity: ZILLOW_IDENTITY,
    pivot: None,
    metrics: &[MetricSpec {
        column: "median_sale_price_all_home",
        domain: Domain::NonNegative,
        zero_policy: ZeroPolicy::ZeroIsMissing,
    }],
    layout: zillow_layout(
        "zillow_median_sale_price_all_home",
        "zillow_median_sale_price_all_home_view",
    ),
    volume: VolumeRules {
        min_rows: 50,
        min_period_columns: 1,
        earliest_period: None,
        coverage: None,
    },
};
