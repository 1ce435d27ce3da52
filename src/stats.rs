//! Index statistics and freshness overview.
//!
//! Used by `frag stats`: replays the commit log, then prints clocks, index
//! size, compaction totals, the embedding cache and a per-source freshness
//! table. With `--json` the full [`MetricsSnapshot`] is printed instead.

use std::fmt;

use anyhow::Result;
use chrono::{DateTime, Utc};

use fintech_rag_core::metrics::MetricsSnapshot;

use crate::config::Config;
use crate::service::LiveIndex;

pub async fn run_stats(config: &Config, json: bool) -> Result<()> {
    let live = LiveIndex::open(config).await?;
    let metrics = live.metrics();

    if json {
        println!("{}", serde_json::to_string_pretty(&metrics)?);
        return Ok(());
    }

    let wal = config
        .index
        .wal_path
        .as_ref()
        .map(|p| {
            let size = std::fs::metadata(p).map(|m| m.len()).unwrap_or(0);
            format!("{} ({})", p.display(), format_bytes(size))
        })
        .unwrap_or_else(|| "in-memory".to_string());

    print!("{}", render_stats(&metrics, &wal));
    Ok(())
}

/// Human-readable report for a metrics snapshot.
pub fn render_stats(m: &MetricsSnapshot, wal: &str) -> String {
    StatsReport { metrics: m, wal }.to_string()
}

struct StatsReport<'a> {
    metrics: &'a MetricsSnapshot,
    wal: &'a str,
}

impl fmt::Display for StatsReport<'_> {
    fn fmt(&self, out: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.metrics;
        let wal = self.wal;
        let idx = &m.index;

        writeln!(out, "Fintech RAG — Live Index Stats")?;
        writeln!(out, "==============================")?;
        writeln!(out)?;
        writeln!(out, "  Commit log:       {}", wal)?;
        writeln!(out, "  Assigned clock:   {}", m.assigned_clock)?;
        writeln!(out, "  Visible clock:    {}", m.visible_clock)?;
        writeln!(
            out,
            "  Global watermark: {}",
            m.global_watermark
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string())
        )?;
        writeln!(out)?;
        writeln!(out, "  Dimensions:       {}", idx.dims)?;
        writeln!(out, "  Documents:        {}", idx.documents)?;
        writeln!(out, "  Tombstoned:       {}", idx.tombstoned)?;
        writeln!(out, "  Versions:         {}", idx.versions)?;
        writeln!(out, "  Posting lists:    {}", idx.posting_lists)?;
        writeln!(
            out,
            "  Snapshots:        {} active (oldest {})",
            idx.active_snapshots,
            idx.oldest_snapshot
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string())
        )?;
        writeln!(
            out,
            "  Compaction:       {} runs, {} versions reclaimed, horizon {}",
            idx.compactions, idx.versions_reclaimed, idx.compaction_horizon
        )?;
        writeln!(
            out,
            "  Embedding cache:  {} entries, {} hits / {} misses",
            m.embedding.entries, m.embedding.hits, m.embedding.misses
        )?;
        writeln!(out, "  Pending retries:  {}", m.pending_retries)?;

        if !m.sources.is_empty() {
            writeln!(out)?;
            writeln!(out, "  By source:")?;
            writeln!(
                out,
                "  {:<20} {:>8} {:>8} {:>6} {:>8} {:>10}   {}",
                "SOURCE", "CLOCK", "APPLIED", "DUPS", "FAILED", "LAG", "LAST APPLIED"
            )?;
            writeln!(out, "  {}", "-".repeat(86))?;

            for (id, s) in &m.sources {
                let w = &s.watermark;
                let lag = s
                    .lag_ms
                    .map(format_lag)
                    .unwrap_or_else(|| "never".to_string());
                let last = w
                    .last_applied_at
                    .map(|t| format_ts_relative(t, m.generated_at))
                    .unwrap_or_else(|| "never".to_string());
                writeln!(
                    out,
                    "  {:<20} {:>8} {:>8} {:>6} {:>8} {:>10}   {}",
                    id,
                    w.last_clock.value(),
                    w.applied,
                    w.duplicates,
                    w.rejected + w.embedding_failures,
                    lag,
                    last
                )?;
            }
        }

        writeln!(out)
    }
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

fn format_lag(ms: u64) -> String {
    if ms < 1_000 {
        format!("{} ms", ms)
    } else if ms < 60_000 {
        format!("{:.1} s", ms as f64 / 1000.0)
    } else {
        format!("{} min", ms / 60_000)
    }
}

/// Relative time such as "3 hours ago".
fn format_ts_relative(ts: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let delta = (now - ts).num_seconds();

    if delta < 0 {
        return ts.format("%Y-%m-%d %H:%M").to_string();
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        ts.format("%Y-%m-%d %H:%M").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use fintech_rag_core::normalize::SourceRecord;

    #[test]
    fn test_format_helpers() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_lag(250), "250 ms");
        assert_eq!(format_lag(1_500), "1.5 s");
        assert_eq!(format_lag(180_000), "3 min");

        let now = Utc::now();
        assert_eq!(format_ts_relative(now - Duration::seconds(5), now), "just now");
        assert_eq!(format_ts_relative(now - Duration::minutes(1), now), "1 min ago");
        assert_eq!(format_ts_relative(now - Duration::hours(3), now), "3 hours ago");
    }

    #[tokio::test]
    async fn test_render_lists_sources() {
        let live = LiveIndex::open(&Config::minimal()).await.unwrap();
        live.submit_record(
            "market",
            SourceRecord::MarketTick {
                symbol: "AAPL".into(),
                price: 189.5,
                volume: None,
                currency: None,
                exchange: None,
                ts: Utc::now(),
            },
        )
        .await
        .unwrap();

        let text = render_stats(&live.metrics(), "in-memory");
        assert!(text.contains("Visible clock:    1"), "{text}");
        assert!(text.contains("market"));
        assert!(text.contains("in-memory"));
    }

    #[tokio::test]
    async fn test_render_empty_index() {
        let live = LiveIndex::open(&Config::minimal()).await.unwrap();
        let text = render_stats(&live.metrics(), "in-memory");
        assert!(text.starts_with("Fintech RAG — Live Index Stats\n"), "{text}");
        assert!(text.contains("Global watermark: -"));
        assert!(!text.contains("By source:"));
        assert!(text.ends_with("\n\n"));
    }
}
