//! Price history storage, point-in-time slicing and CSV loading.
//!
//! Series are validated on insert (strictly ascending dates, finite positive
//! prices) so every later lookup can rely on binary search. All reads used for
//! decisions at date `t` go through cutoff helpers that exclude observations
//! dated on or after `t`.

use crate::error::{Result, SimulationError};
use crate::types::Observation;
use chrono::NaiveDate;
use csv::ReaderBuilder;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

/// Chronologically ordered observations for one asset.
#[derive(Debug, Clone, PartialEq)]
pub struct AssetSeries {
    symbol: String,
    observations: Vec<Observation>,
}

impl AssetSeries {
    /// Build a series from (date, price) pairs, computing simple returns.
    pub fn from_prices(symbol: impl Into<String>, prices: &[(NaiveDate, f64)]) -> Result<Self> {
        let symbol = symbol.into();
        let mut observations = Vec::with_capacity(prices.len());
        let mut prev: Option<(NaiveDate, f64)> = None;

        for &(date, price) in prices {
            if !(price.is_finite() && price > 0.0) {
                return Err(SimulationError::Data(format!(
                    "{}: invalid price {} on {}",
                    symbol, price, date
                )));
            }
            let ret = match prev {
                Some((prev_date, _)) if prev_date >= date => {
                    return Err(SimulationError::Data(format!(
                        "{}: dates not strictly ascending ({} then {})",
                        symbol, prev_date, date
                    )));
                }
                Some((_, prev_price)) => price / prev_price - 1.0,
                None => f64::NAN,
            };
            observations.push(Observation::new(date, price, ret));
            prev = Some((date, price));
        }

        Ok(Self {
            symbol,
            observations,
        })
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn first_date(&self) -> Option<NaiveDate> {
        self.observations.first().map(|o| o.date)
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.observations.last().map(|o| o.date)
    }

    /// Number of observations dated strictly before `date`.
    pub fn cutoff(&self, date: NaiveDate) -> usize {
        self.observations.partition_point(|o| o.date < date)
    }

    /// Observations dated strictly before `date`.
    pub fn before(&self, date: NaiveDate) -> &[Observation] {
        &self.observations[..self.cutoff(date)]
    }

    /// Latest known price as of the close of `date`.
    pub fn price_on_or_before(&self, date: NaiveDate) -> Option<f64> {
        let idx = self.observations.partition_point(|o| o.date <= date);
        idx.checked_sub(1).map(|i| self.observations[i].price)
    }
}

/// Per-asset price history for the whole universe.
///
/// Assets are kept in a `BTreeMap` so iteration is alphabetical and therefore
/// identical across runs and machines.
#[derive(Debug, Clone, Default)]
pub struct PriceHistory {
    series: BTreeMap<String, AssetSeries>,
}

impl PriceHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a series.
    pub fn insert(&mut self, series: AssetSeries) {
        self.series.insert(series.symbol.clone(), series);
    }

    /// Add a symbol from (date, price) pairs.
    pub fn add_prices(
        &mut self,
        symbol: impl Into<String>,
        prices: &[(NaiveDate, f64)],
    ) -> Result<()> {
        let series = AssetSeries::from_prices(symbol, prices)?;
        self.insert(series);
        Ok(())
    }

    pub fn get(&self, symbol: &str) -> Option<&AssetSeries> {
        self.series.get(symbol)
    }

    /// Symbols in alphabetical order.
    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.series.keys().map(String::as_str)
    }

    pub fn series(&self) -> impl Iterator<Item = &AssetSeries> {
        self.series.values()
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    /// Sorted union of all observation dates.
    pub fn calendar(&self) -> Vec<NaiveDate> {
        let dates: BTreeSet<NaiveDate> = self
            .series
            .values()
            .flat_map(|s| s.observations.iter().map(|o| o.date))
            .collect();
        dates.into_iter().collect()
    }

    /// Observations for `symbol` strictly before `date`.
    pub fn history_before(&self, symbol: &str, date: NaiveDate) -> &[Observation] {
        self.series.get(symbol).map(|s| s.before(date)).unwrap_or(&[])
    }

    pub fn price_on_or_before(&self, symbol: &str, date: NaiveDate) -> Option<f64> {
        self.series.get(symbol)?.price_on_or_before(date)
    }

    /// Build the return matrix for `symbols` over the last `rows` calendar dates
    /// strictly before `cutoff`.
    ///
    /// `calendar` must be the output of [`PriceHistory::calendar`]. Missing
    /// observations are NaN. This is the only place a historical slice is
    /// copied out of the history.
    pub fn materialize_window(
        &self,
        calendar: &[NaiveDate],
        symbols: &[String],
        cutoff: NaiveDate,
        rows: usize,
    ) -> ReturnWindow {
        let end = calendar.partition_point(|d| *d < cutoff);
        let start = end.saturating_sub(rows);
        let dates = calendar[start..end].to_vec();

        let mut sorted: Vec<String> = symbols.to_vec();
        sorted.sort();
        sorted.dedup();

        let columns = sorted
            .iter()
            .map(|symbol| {
                let mut column = vec![f64::NAN; dates.len()];
                if let (Some(series), Some(first)) = (self.series.get(symbol), dates.first()) {
                    let obs = series.observations();
                    let mut i = obs.partition_point(|o| o.date < *first);
                    for (row, date) in dates.iter().enumerate() {
                        while i < obs.len() && obs[i].date < *date {
                            i += 1;
                        }
                        if i < obs.len() && obs[i].date == *date {
                            column[row] = obs[i].ret;
                        }
                    }
                }
                column
            })
            .collect();

        ReturnWindow {
            cutoff,
            dates,
            symbols: sorted,
            columns,
        }
    }
}

/// Dates × assets matrix of simple returns, all dated strictly before `cutoff`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReturnWindow {
    cutoff: NaiveDate,
    dates: Vec<NaiveDate>,
    symbols: Vec<String>,
    columns: Vec<Vec<f64>>,
}

impl ReturnWindow {
    /// The decision date this window was built for (exclusive upper bound).
    pub fn cutoff(&self) -> NaiveDate {
        self.cutoff
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    /// Symbols in alphabetical order.
    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn rows(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty() || self.symbols.is_empty()
    }

    pub fn start(&self) -> Option<NaiveDate> {
        self.dates.first().copied()
    }

    pub fn end(&self) -> Option<NaiveDate> {
        self.dates.last().copied()
    }

    /// Full return column for `symbol`.
    pub fn column(&self, symbol: &str) -> Option<&[f64]> {
        self.symbols
            .binary_search_by(|s| s.as_str().cmp(symbol))
            .ok()
            .map(|i| self.columns[i].as_slice())
    }

    /// The last `rows` returns for `symbol`, optionally dropping the most recent `skip`.
    pub fn tail(&self, symbol: &str, rows: usize, skip: usize) -> Option<&[f64]> {
        let column = self.column(symbol)?;
        let end = column.len().saturating_sub(skip);
        let start = column.len().saturating_sub(rows).min(end);
        Some(&column[start..end])
    }

    /// Restrict to `symbols` and the last `rows` dates.
    ///
    /// Symbols absent from the window are ignored.
    pub fn select(&self, symbols: &[String], rows: usize) -> ReturnWindow {
        let start = self.dates.len().saturating_sub(rows);
        let mut picked: Vec<String> = symbols
            .iter()
            .filter(|s| self.column(s).is_some())
            .cloned()
            .collect();
        picked.sort();
        picked.dedup();

        let columns = picked
            .iter()
            .filter_map(|s| self.column(s).map(|c| c[start..].to_vec()))
            .collect();

        ReturnWindow {
            cutoff: self.cutoff,
            dates: self.dates[start..].to_vec(),
            symbols: picked,
            columns,
        }
    }
}

/// Options for CSV loading.
#[derive(Debug, Clone)]
pub struct CsvOptions {
    pub date_format: String,
    pub delimiter: u8,
    /// Skip unparseable rows instead of failing.
    pub skip_invalid: bool,
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            date_format: "%Y-%m-%d".to_string(),
            delimiter: b',',
            skip_invalid: false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct LongRow {
    date: String,
    symbol: String,
    price: f64,
}

#[derive(Debug, Deserialize)]
struct SingleRow {
    date: String,
    price: f64,
}

/// Load a long-format CSV with `date,symbol,price` columns.
pub fn load_long_csv(path: impl AsRef<Path>, options: &CsvOptions) -> Result<PriceHistory> {
    let path = path.as_ref();
    info!("Loading prices from: {}", path.display());

    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .delimiter(options.delimiter)
        .trim(csv::Trim::All)
        .from_path(path)?;

    let mut grouped: BTreeMap<String, Vec<(NaiveDate, f64)>> = BTreeMap::new();
    let mut skipped = 0usize;

    for (row_num, result) in reader.deserialize::<LongRow>().enumerate() {
        let parsed = result
            .map_err(SimulationError::from)
            .and_then(|row| Ok((parse_date(&row.date, options)?, row.symbol, row.price)));
        match parsed {
            Ok((date, symbol, price)) => grouped.entry(symbol).or_default().push((date, price)),
            Err(e) if options.skip_invalid => {
                debug!("Skipping row {}: {}", row_num + 1, e);
                skipped += 1;
            }
            Err(e) => return Err(e),
        }
    }

    if skipped > 0 {
        warn!("Skipped {} invalid rows", skipped);
    }

    let mut history = PriceHistory::new();
    for (symbol, mut prices) in grouped {
        normalize(&symbol, &mut prices);
        history.add_prices(symbol, &prices)?;
    }

    if history.is_empty() {
        return Err(SimulationError::NoData);
    }

    info!("Loaded {} assets", history.len());
    Ok(history)
}

/// Load every `*.csv` file in `dir` as one asset with `date,price` columns.
///
/// The file stem is used as the symbol.
pub fn load_dir(dir: impl AsRef<Path>, options: &CsvOptions) -> Result<PriceHistory> {
    let dir = dir.as_ref();
    info!("Loading price directory: {}", dir.display());

    let mut paths: Vec<_> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("csv")))
        .collect();
    paths.sort();

    let mut history = PriceHistory::new();
    for path in paths {
        let Some(symbol) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
            continue;
        };

        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .delimiter(options.delimiter)
            .trim(csv::Trim::All)
            .from_path(&path)?;

        let mut prices = Vec::new();
        for result in reader.deserialize::<SingleRow>() {
            let parsed = result
                .map_err(SimulationError::from)
                .and_then(|row| Ok((parse_date(&row.date, options)?, row.price)));
            match parsed {
                Ok(point) => prices.push(point),
                Err(e) if options.skip_invalid => debug!("{}: skipping row: {}", symbol, e),
                Err(e) => return Err(e),
            }
        }

        normalize(&symbol, &mut prices);
        history.add_prices(symbol, &prices)?;
    }

    if history.is_empty() {
        return Err(SimulationError::NoData);
    }
    Ok(history)
}

fn parse_date(s: &str, options: &CsvOptions) -> Result<NaiveDate> {
    Ok(NaiveDate::parse_from_str(s, &options.date_format)?)
}

/// Sort by date and drop duplicate dates (first wins).
fn normalize(symbol: &str, prices: &mut Vec<(NaiveDate, f64)>) {
    prices.sort_by_key(|(d, _)| *d);
    let before = prices.len();
    prices.dedup_by_key(|(d, _)| *d);
    if prices.len() < before {
        warn!(
            "{}: removed {} duplicate dates",
            symbol,
            before - prices.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{tempdir, NamedTempFile};

    fn day(n: i64) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + chrono::Duration::days(n)
    }

    fn series(prices: &[f64]) -> Vec<(NaiveDate, f64)> {
        prices
            .iter()
            .enumerate()
            .map(|(i, p)| (day(i as i64), *p))
            .collect()
    }

    #[test]
    fn test_returns_computed() {
        let s = AssetSeries::from_prices("AAA", &series(&[100.0, 110.0, 99.0])).unwrap();
        let obs = s.observations();
        assert!(obs[0].ret.is_nan());
        assert!((obs[1].ret - 0.10).abs() < 1e-12);
        assert!((obs[2].ret + 0.10).abs() < 1e-12);
    }

    #[test]
    fn test_unsorted_dates_rejected() {
        let prices = vec![(day(1), 10.0), (day(0), 11.0)];
        assert!(AssetSeries::from_prices("AAA", &prices).is_err());

        let dup = vec![(day(0), 10.0), (day(0), 11.0)];
        assert!(AssetSeries::from_prices("AAA", &dup).is_err());
    }

    #[test]
    fn test_non_positive_price_rejected() {
        assert!(AssetSeries::from_prices("AAA", &series(&[10.0, 0.0])).is_err());
        assert!(AssetSeries::from_prices("AAA", &series(&[10.0, f64::NAN])).is_err());
    }

    #[test]
    fn test_cutoff_excludes_as_of_date() {
        let s = AssetSeries::from_prices("AAA", &series(&[1.0, 2.0, 3.0, 4.0])).unwrap();
        assert_eq!(s.cutoff(day(2)), 2);
        assert!(s.before(day(2)).iter().all(|o| o.date < day(2)));
        assert_eq!(s.before(day(0)).len(), 0);
        assert_eq!(s.price_on_or_before(day(2)), Some(3.0));
        assert_eq!(s.price_on_or_before(day(-1)), None);
        assert_eq!(s.price_on_or_before(day(10)), Some(4.0));
    }

    #[test]
    fn test_materialize_window_alignment() {
        let mut history = PriceHistory::new();
        history
            .add_prices("AAA", &series(&[100.0, 101.0, 102.0, 103.0, 104.0]))
            .unwrap();
        // BBB starts two days late
        history
            .add_prices("BBB", &[(day(2), 50.0), (day(3), 55.0), (day(4), 44.0)])
            .unwrap();

        let calendar = history.calendar();
        let symbols = vec!["BBB".to_string(), "AAA".to_string()];
        let window = history.materialize_window(&calendar, &symbols, day(4), 10);

        assert_eq!(window.symbols(), &["AAA".to_string(), "BBB".to_string()]);
        assert_eq!(window.rows(), 4);
        assert_eq!(window.end(), Some(day(3)));
        assert!(window.dates().iter().all(|d| *d < window.cutoff()));

        let b = window.column("BBB").unwrap();
        assert!(b[0].is_nan() && b[1].is_nan() && b[2].is_nan());
        assert!((b[3] - 0.10).abs() < 1e-12);
    }

    #[test]
    fn test_window_tail_and_select() {
        let mut history = PriceHistory::new();
        history
            .add_prices("AAA", &series(&[1.0, 2.0, 4.0, 8.0, 16.0, 32.0]))
            .unwrap();
        history
            .add_prices("BBB", &series(&[1.0, 1.0, 1.0, 1.0, 1.0, 1.0]))
            .unwrap();
        let calendar = history.calendar();
        let all: Vec<String> = history.symbols().map(str::to_string).collect();
        let window = history.materialize_window(&calendar, &all, day(6), 6);

        let tail = window.tail("AAA", 3, 1).unwrap();
        assert_eq!(tail.len(), 2);
        assert!(tail.iter().all(|r| (*r - 1.0).abs() < 1e-12));

        let sub = window.select(&["BBB".to_string(), "ZZZ".to_string()], 2);
        assert_eq!(sub.symbols(), &["BBB".to_string()]);
        assert_eq!(sub.rows(), 2);
        assert_eq!(sub.end(), window.end());
    }

    #[test]
    fn test_load_long_csv() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "date,symbol,price").unwrap();
        writeln!(file, "2024-01-02,BBB,20.0").unwrap();
        writeln!(file, "2024-01-01,AAA,10.0").unwrap();
        writeln!(file, "2024-01-02,AAA,11.0").unwrap();
        writeln!(file, "2024-01-01,BBB,21.0").unwrap();

        let history = load_long_csv(file.path(), &CsvOptions::default()).unwrap();
        assert_eq!(history.len(), 2);
        let aaa = history.get("AAA").unwrap();
        assert_eq!(aaa.len(), 2);
        assert!((aaa.observations()[1].ret - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_load_long_csv_bad_row() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "date,symbol,price").unwrap();
        writeln!(file, "2024-01-01,AAA,10.0").unwrap();
        writeln!(file, "not-a-date,AAA,11.0").unwrap();

        assert!(load_long_csv(file.path(), &CsvOptions::default()).is_err());

        let lenient = CsvOptions {
            skip_invalid: true,
            ..Default::default()
        };
        let history = load_long_csv(file.path(), &lenient).unwrap();
        assert_eq!(history.get("AAA").unwrap().len(), 1);
    }

    #[test]
    fn test_load_dir() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("XYZ.csv"),
            "date,price\n2024-01-01,5.0\n2024-01-02,5.5\n",
        )
        .unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let history = load_dir(dir.path(), &CsvOptions::default()).unwrap();
        assert_eq!(history.symbols().collect::<Vec<_>>(), vec!["XYZ"]);
    }
}
