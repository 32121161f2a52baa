use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc, Weekday};
use log::warn;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::models::Bar;

/// Intraday trading window; bars outside it (or on weekends) are discarded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionConfig {
    pub open: NaiveTime,
    pub close: NaiveTime,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            open: NaiveTime::from_hms_opt(9, 15, 0).unwrap(),
            close: NaiveTime::from_hms_opt(15, 30, 0).unwrap(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawBarRow {
    timestamp: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: i64,
    #[serde(default)]
    max_tradeable_volume: Option<f64>,
}

/// Cleaned minute-bar series for one instrument: session-filtered,
/// gap-filled to a full minute grid, timestamps strictly increasing.
#[derive(Debug, Clone)]
pub struct MarketData {
    symbol: String,
    bars: Vec<Bar>,
    session: SessionConfig,
}

impl MarketData {
    pub fn from_csv(
        path: &Path,
        symbol: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open bar file {}", path.display()))?;
        Self::from_reader(file, symbol, start, end, SessionConfig::default())
    }

    pub fn from_reader<R: Read>(
        reader: R,
        symbol: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        session: SessionConfig,
    ) -> Result<Self> {
        let mut csv_reader = csv::Reader::from_reader(reader);
        let mut bars = Vec::new();
        for (row_index, row) in csv_reader.deserialize::<RawBarRow>().enumerate() {
            let row = row.with_context(|| format!("Malformed bar row {}", row_index + 1))?;
            let timestamp = parse_bar_timestamp(&row.timestamp)
                .with_context(|| format!("Bad timestamp in bar row {}", row_index + 1))?;
            if !row.close.is_finite() || row.close <= 0.0 {
                return Err(anyhow!(
                    "Non-positive close {} at {}",
                    row.close,
                    timestamp
                ));
            }
            if row.volume < 0 {
                return Err(anyhow!("Negative volume {} at {}", row.volume, timestamp));
            }
            bars.push(Bar {
                timestamp,
                open: row.open,
                high: row.high,
                low: row.low,
                close: row.close,
                volume: row.volume,
                max_tradeable_volume: row.max_tradeable_volume,
            });
        }

        bars.sort_by_key(|bar| bar.timestamp);
        bars.retain(|bar| {
            start.map_or(true, |s| bar.timestamp >= s) && end.map_or(true, |e| bar.timestamp <= e)
        });

        Self::from_bars(symbol, bars, session)
    }

    /// Build a series from already-parsed bars, applying the session filter
    /// and filling intra-session minute gaps with flat zero-volume bars.
    pub fn from_bars(symbol: &str, bars: Vec<Bar>, session: SessionConfig) -> Result<Self> {
        let mut by_timestamp: BTreeMap<DateTime<Utc>, Bar> = BTreeMap::new();
        for bar in bars {
            let local = bar.timestamp.naive_utc();
            if !in_session(&local, &session) {
                continue;
            }
            let timestamp = bar.timestamp;
            if by_timestamp.insert(timestamp, bar).is_some() {
                return Err(anyhow!(
                    "Duplicate bar timestamp for {}: {}",
                    symbol,
                    timestamp
                ));
            }
        }

        if by_timestamp.is_empty() {
            return Err(anyhow!("No bars for {} within the requested range", symbol));
        }

        // Per-day minute grid between the first and last observed bar of
        // that day. Gaps get flat zero-volume bars carrying the prior close.
        let mut day_bounds: BTreeMap<NaiveDate, (NaiveDateTime, NaiveDateTime)> = BTreeMap::new();
        for ts in by_timestamp.keys() {
            let local = ts.naive_utc();
            let entry = day_bounds.entry(local.date()).or_insert((local, local));
            entry.1 = local;
        }

        let mut filled = Vec::new();
        let mut last_close: Option<f64> = None;
        let mut gap_count = 0usize;
        for (_, (day_start, day_end)) in day_bounds {
            let mut minute = day_start;
            while minute <= day_end {
                let timestamp = minute.and_utc();
                if let Some(bar) = by_timestamp.get(&timestamp) {
                    last_close = Some(bar.close);
                    filled.push(bar.clone());
                } else if let Some(close) = last_close {
                    gap_count += 1;
                    filled.push(Bar {
                        timestamp,
                        open: close,
                        high: close,
                        low: close,
                        close,
                        volume: 0,
                        max_tradeable_volume: Some(0.0),
                    });
                }
                minute += Duration::minutes(1);
            }
        }

        if gap_count > 0 {
            warn!(
                "Filled {gap_count} missing minute bars for {symbol} with flat zero-volume bars"
            );
        }

        Ok(Self {
            symbol: symbol.to_string(),
            bars: filled,
            session,
        })
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn bars(&self) -> &[Bar] {
        &self.bars
    }

    pub fn session(&self) -> SessionConfig {
        self.session
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn first_timestamp(&self) -> Option<DateTime<Utc>> {
        self.bars.first().map(|bar| bar.timestamp)
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.bars.last().map(|bar| bar.timestamp)
    }

    /// Strictly-causal prefix: every bar with a timestamp before `as_of`.
    /// The bar stamped `as_of` itself is excluded so a strategy can never
    /// peek at the close it is being asked to trade on.
    pub fn historical(&self, as_of: DateTime<Utc>) -> &[Bar] {
        let cut = self.bars.partition_point(|bar| bar.timestamp < as_of);
        &self.bars[..cut]
    }
}

fn in_session(local: &NaiveDateTime, session: &SessionConfig) -> bool {
    let weekday = local.weekday();
    if weekday == Weekday::Sat || weekday == Weekday::Sun {
        return false;
    }
    let time = local.time();
    time >= session.open && time <= session.close
}

fn parse_bar_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .map_err(|e| anyhow!("Unparseable timestamp {}: {}", raw, e))?;
    Ok(naive.and_utc())
}
