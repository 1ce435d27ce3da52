use anyhow::Result;

use crate::config::Config;

/// One row of `frag sources`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceStatus {
    pub name: String,
    pub kind: &'static str,
    pub location: String,
    pub status: &'static str,
}

pub fn source_statuses(config: &Config) -> Vec<SourceStatus> {
    let mut rows = Vec::new();

    for (name, feed) in &config.sources.feeds {
        let status = if feed.path.is_file() {
            "OK"
        } else {
            "WAITING (file not present)"
        };
        rows.push(SourceStatus {
            name: name.clone(),
            kind: "feed",
            location: feed.path.display().to_string(),
            status,
        });
    }

    for (name, docs) in &config.sources.documents {
        let status = if docs.root.is_dir() {
            "OK"
        } else {
            "UNHEALTHY (root does not exist)"
        };
        rows.push(SourceStatus {
            name: name.clone(),
            kind: "documents",
            location: docs.root.display().to_string(),
            status,
        });
    }

    rows
}

pub fn list_sources(config: &Config) -> Result<()> {
    let rows = source_statuses(config);
    if rows.is_empty() {
        println!("No sources configured. Add [sources.feeds.<name>] or [sources.documents.<name>] to the config.");
        return Ok(());
    }

    println!("{:<20} {:<10} {:<40} STATUS", "SOURCE", "KIND", "LOCATION");
    for r in rows {
        println!("{:<20} {:<10} {:<40} {}", r.name, r.kind, r.location, r.status);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_statuses_reflect_filesystem() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("ticks.jsonl"), "").unwrap();
        let src = format!(
            r#"
[sources.feeds.market]
path = "{root}/ticks.jsonl"

[sources.feeds.news]
path = "{root}/news.jsonl"

[sources.documents.research]
root = "{root}/missing"
"#,
            root = tmp.path().display()
        );
        let cfg: Config = toml::from_str(&src).unwrap();
        let rows = source_statuses(&cfg);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].name, "market");
        assert_eq!(rows[0].status, "OK");
        assert!(rows[1].status.starts_with("WAITING"));
        assert_eq!(rows[2].kind, "documents");
        assert!(rows[2].status.starts_with("UNHEALTHY"));
    }
}
