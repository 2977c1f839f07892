use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

impl MetricType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
            MetricType::Histogram => "histogram",
        }
    }
}

/// A persisted point-in-time metric value.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub id: i64,
    pub timestamp: String,
    pub name: String,
    pub value: f64,
    pub labels: Option<String>,
    pub metric_type: MetricType,
}

#[derive(Clone, Debug, Default)]
pub struct MetricsQuery {
    pub name: Option<String>,
    pub since: Option<String>,
    pub limit: Option<u32>,
}

/// Summary statistics from a histogram.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Registry key. The metric type is part of the key, so a counter and a
/// gauge may share a name without clobbering each other. Labels are sorted
/// at construction so label order never matters.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct MetricKey {
    kind: MetricType,
    name: String,
    labels: Vec<(String, String)>,
}

impl MetricKey {
    fn new(kind: MetricType, name: &str, labels: &[(&str, &str)]) -> Self {
        let mut labels: Vec<(String, String)> = labels
            .iter()
            .map(|&(k, v)| (k.to_string(), v.to_string()))
            .collect();
        labels.sort();
        Self {
            kind,
            name: name.to_string(),
            labels,
        }
    }

    fn labels_json(&self) -> Option<String> {
        if self.labels.is_empty() {
            return None;
        }
        let map: serde_json::Map<String, serde_json::Value> = self
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect();
        serde_json::to_string(&map).ok()
    }
}

/// Live storage for one metric. Counters and gauges are lock-free atomics
/// (gauges store f64 bits); histograms keep raw samples for percentiles.
enum MetricCell {
    Counter(AtomicU64),
    Gauge(AtomicU64),
    Histogram(Mutex<Vec<f64>>),
}

fn quantile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let pos = ((sorted.len() - 1) as f64 * q).round() as usize;
    sorted[pos.min(sorted.len() - 1)]
}

fn summarize(samples: &mut [f64]) -> HistogramSummary {
    if samples.is_empty() {
        return HistogramSummary::default();
    }
    samples.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    HistogramSummary {
        count: samples.len() as u64,
        sum: samples.iter().sum(),
        p50: quantile(samples, 0.50),
        p95: quantile(samples, 0.95),
        p99: quantile(samples, 0.99),
    }
}

/// Thread-safe metrics recorder with SQLite-backed history.
///
/// Live values accumulate in memory; `snapshot` persists the current state
/// of every registered instrument and `prune` ages old rows out.
pub struct MetricsRecorder {
    cells: DashMap<MetricKey, MetricCell>,
    db: Mutex<Connection>,
}

impl MetricsRecorder {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS metrics_snapshots (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 timestamp TEXT NOT NULL,
                 name TEXT NOT NULL,
                 value REAL NOT NULL,
                 labels TEXT,
                 metric_type TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_metrics_name ON metrics_snapshots(name, timestamp);",
        )?;
        Ok(Self {
            cells: DashMap::new(),
            db: Mutex::new(conn),
        })
    }

    /// Increment a counter by n.
    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        let cell = self
            .cells
            .entry(MetricKey::new(MetricType::Counter, name, labels))
            .or_insert_with(|| MetricCell::Counter(AtomicU64::new(0)));
        if let MetricCell::Counter(v) = cell.value() {
            v.fetch_add(n, Ordering::Relaxed);
        }
    }

    /// Set a gauge to a specific value.
    pub fn gauge_set(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let cell = self
            .cells
            .entry(MetricKey::new(MetricType::Gauge, name, labels))
            .or_insert_with(|| MetricCell::Gauge(AtomicU64::new(0)));
        if let MetricCell::Gauge(bits) = cell.value() {
            bits.store(value.to_bits(), Ordering::Relaxed);
        }
    }

    /// Add delta to a gauge (negative to decrement).
    pub fn gauge_inc(&self, name: &str, labels: &[(&str, &str)], delta: f64) {
        let cell = self
            .cells
            .entry(MetricKey::new(MetricType::Gauge, name, labels))
            .or_insert_with(|| MetricCell::Gauge(AtomicU64::new(0)));
        if let MetricCell::Gauge(bits) = cell.value() {
            let _ = bits.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |b| {
                Some((f64::from_bits(b) + delta).to_bits())
            });
        }
    }

    /// Record a histogram observation.
    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let cell = self
            .cells
            .entry(MetricKey::new(MetricType::Histogram, name, labels))
            .or_insert_with(|| MetricCell::Histogram(Mutex::new(Vec::new())));
        if let MetricCell::Histogram(samples) = cell.value() {
            samples.lock().push(value);
        }
    }

    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        match self.cells.get(&MetricKey::new(MetricType::Counter, name, labels)) {
            Some(cell) => match cell.value() {
                MetricCell::Counter(v) => v.load(Ordering::Relaxed),
                _ => 0,
            },
            None => 0,
        }
    }

    pub fn gauge_get(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        match self.cells.get(&MetricKey::new(MetricType::Gauge, name, labels)) {
            Some(cell) => match cell.value() {
                MetricCell::Gauge(bits) => f64::from_bits(bits.load(Ordering::Relaxed)),
                _ => 0.0,
            },
            None => 0.0,
        }
    }

    pub fn histogram_summary(&self, name: &str, labels: &[(&str, &str)]) -> HistogramSummary {
        match self.cells.get(&MetricKey::new(MetricType::Histogram, name, labels)) {
            Some(cell) => match cell.value() {
                MetricCell::Histogram(samples) => summarize(&mut samples.lock()),
                _ => HistogramSummary::default(),
            },
            None => HistogramSummary::default(),
        }
    }

    /// Persist the current value of every registered instrument.
    /// Histograms record their median.
    pub fn snapshot(&self) -> Result<usize, rusqlite::Error> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock();
        let mut stmt = db.prepare(
            "INSERT INTO metrics_snapshots (timestamp, name, value, labels, metric_type)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;

        let mut count = 0;
        for entry in self.cells.iter() {
            let key = entry.key();
            let value = match entry.value() {
                MetricCell::Counter(v) => v.load(Ordering::Relaxed) as f64,
                MetricCell::Gauge(bits) => f64::from_bits(bits.load(Ordering::Relaxed)),
                MetricCell::Histogram(samples) => summarize(&mut samples.lock()).p50,
            };
            stmt.execute(rusqlite::params![
                now,
                key.name,
                value,
                key.labels_json(),
                key.kind.as_str(),
            ])?;
            count += 1;
        }
        Ok(count)
    }

    /// Query historical snapshots, newest first.
    pub fn query(&self, q: &MetricsQuery) -> Result<Vec<MetricsSnapshot>, rusqlite::Error> {
        let mut clauses: Vec<String> = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(name) = &q.name {
            params.push(Box::new(name.clone()));
            clauses.push(format!("name = ?{}", params.len()));
        }
        if let Some(since) = &q.since {
            params.push(Box::new(since.clone()));
            clauses.push(format!("timestamp >= ?{}", params.len()));
        }

        let mut sql = String::from(
            "SELECT id, timestamp, name, value, labels, metric_type FROM metrics_snapshots",
        );
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(&format!(" ORDER BY id DESC LIMIT {}", q.limit.unwrap_or(100)));

        let db = self.db.lock();
        let mut stmt = db.prepare(&sql)?;
        let param_refs: Vec<&dyn rusqlite::types::ToSql> =
            params.iter().map(|p| p.as_ref()).collect();
        let rows = stmt.query_map(param_refs.as_slice(), |row| {
            let kind: String = row.get(5)?;
            Ok(MetricsSnapshot {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                name: row.get(2)?,
                value: row.get(3)?,
                labels: row.get(4)?,
                metric_type: match kind.as_str() {
                    "gauge" => MetricType::Gauge,
                    "histogram" => MetricType::Histogram,
                    _ => MetricType::Counter,
                },
            })
        })?;

        rows.collect()
    }

    /// Delete snapshots older than the retention window.
    pub fn prune(&self, retention_days: u32) -> Result<usize, rusqlite::Error> {
        let cutoff = Utc::now()
            .checked_sub_signed(chrono::Duration::days(i64::from(retention_days)))
            .unwrap_or_else(Utc::now)
            .to_rfc3339();
        self.db.lock().execute(
            "DELETE FROM metrics_snapshots WHERE timestamp < ?1",
            rusqlite::params![cutoff],
        )
    }
}
