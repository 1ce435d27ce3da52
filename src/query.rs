//! `frag query`: one-shot retrieval against the replayed index.

use std::time::Duration;

use anyhow::Result;

use fintech_rag_core::index::{FieldClause, Filter};
use fintech_rag_core::query::{QueryRequest, QueryResponse};

use crate::config::Config;
use crate::service::LiveIndex;

/// Command-line query options.
#[derive(Debug, Clone, Default)]
pub struct QueryArgs {
    pub text: String,
    pub k: Option<usize>,
    pub sources: Vec<String>,
    /// `field=value` style clauses, see [`FieldClause::parse`].
    pub filters: Vec<String>,
    pub bound_secs: Option<f64>,
    pub wait_ms: Option<u64>,
    pub json: bool,
}

/// Turn CLI arguments into a request.
pub fn build_request(args: &QueryArgs) -> Result<QueryRequest> {
    let mut filter = Filter::new();
    for s in &args.sources {
        filter = filter.source(s.clone());
    }
    for expr in &args.filters {
        filter = filter.clause(FieldClause::parse(expr)?);
    }

    let mut req = QueryRequest::text(args.text.clone()).with_filter(filter);
    if let Some(k) = args.k {
        req = req.with_k(k);
    }
    if let Some(secs) = args.bound_secs {
        if !secs.is_finite() || secs < 0.0 {
            anyhow::bail!("--bound-secs must be a non-negative number");
        }
        req = req.with_bound(Duration::from_secs_f64(secs));
    }
    if let Some(ms) = args.wait_ms {
        req = req.with_max_wait(Duration::from_millis(ms));
    }
    Ok(req)
}

pub async fn run_query(config: &Config, args: &QueryArgs) -> Result<()> {
    let req = build_request(args)?;
    let live = LiveIndex::open(config).await?;
    let resp = live.query(&req).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&resp)?);
    } else {
        print!("{}", render_response(&resp));
    }
    Ok(())
}

pub fn render_response(resp: &QueryResponse) -> String {
    let mut out = String::new();
    out.push_str(&format!("Snapshot clock: {}\n", resp.snapshot_clock));
    if resp.stale_beyond_bound {
        out.push_str(&format!(
            "WARNING: stale beyond bound for: {}\n",
            resp.stale_sources.join(", ")
        ));
    }
    if resp.waited_ms > 0 {
        out.push_str(&format!("Waited {} ms for freshness\n", resp.waited_ms));
    }
    out.push('\n');

    if resp.results.is_empty() {
        out.push_str("No results.\n");
        return out;
    }

    for (i, r) in resp.results.iter().enumerate() {
        out.push_str(&format!(
            "{}. [{:.3}] {} (v{} @ clock {})\n",
            i + 1,
            r.score,
            r.doc_id,
            r.version,
            r.version_applied
        ));
        out.push_str(&format!("    observed: {}\n", r.observed_at.to_rfc3339()));
        out.push_str(&format!("    {}\n", snippet(&r.text, 160)));
    }
    out
}

fn snippet(text: &str, max_chars: usize) -> String {
    let flat: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let cut: String = flat.chars().take(max_chars).collect();
    format!("{}…", cut.trim_end())
}
