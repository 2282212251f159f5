//! Shared helpers for integration tests: fixture archives, an in-process
//! pipeline with workers, and Prometheus exposition parsing.

#![allow(dead_code)]

use provis_pipeline::config::Config;
use provis_pipeline::models::{Event, Job};
use provis_pipeline::pipeline::{Orchestrator, PipelineContext, WorkerPool};
use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;
use zip::write::SimpleFileOptions;

/// Build a zip archive from `(path, contents)` pairs
pub fn build_zip(files: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    for (path, contents) in files {
        writer.start_file(*path, options).unwrap();
        writer.write_all(contents.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// Three small files with one internal and one external import
pub fn sample_repo() -> Vec<u8> {
    build_zip(&[
        (
            "src/index.ts",
            "import { add } from './util';\nimport express from 'express';\n\nexport function main() {\n  return add(1, 2);\n}\n",
        ),
        (
            "src/util.ts",
            "export function add(a: number, b: number) {\n  return a + b;\n}\n",
        ),
        ("README.md", "# sample\n"),
    ])
}

/// In-process pipeline over in-memory backends rooted in a temp dir
pub struct TestPipeline {
    pub orchestrator: Arc<Orchestrator>,
    pub workers: WorkerPool,
    pub dir: TempDir,
}

impl TestPipeline {
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    pub async fn start_with(customize: impl FnOnce(&mut Config)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = Config::for_testing(dir.path());
        customize(&mut config);
        let workers = config.server.workers;

        let ctx = Arc::new(PipelineContext::from_config(config).await.unwrap());
        let orchestrator = Arc::new(Orchestrator::new(ctx));
        let pool = WorkerPool::new(orchestrator.clone(), workers);
        pool.start().await.unwrap();

        Self {
            orchestrator,
            workers: pool,
            dir,
        }
    }

    pub fn ctx(&self) -> &Arc<PipelineContext> {
        self.orchestrator.context()
    }

    /// Poll the ledger until the job is `done` or `failed`
    pub async fn wait_for_terminal(&self, job_id: Uuid) -> Job {
        wait_for_terminal(&self.orchestrator, job_id).await
    }

    pub async fn events(&self, job_id: Uuid) -> Vec<Event> {
        self.ctx().ledger.events_after(&job_id, 0).await.unwrap()
    }
}

pub async fn wait_for_terminal(orchestrator: &Orchestrator, job_id: Uuid) -> Job {
    let ledger = &orchestrator.context().ledger;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        let job = ledger.get_job(&job_id).await.unwrap().unwrap();
        if job.is_terminal() {
            return job;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {} stuck in {} at {}%",
            job_id,
            job.phase,
            job.pct
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Event type names in sequence order
pub fn event_types(events: &[Event]) -> Vec<String> {
    events
        .iter()
        .map(|e| e.payload.event_type().to_string())
        .collect()
}

/// Map of metric name to its HELP/TYPE and sample lines
pub fn parse_prometheus_output(output: &str) -> HashMap<String, Vec<String>> {
    let mut metrics = HashMap::new();
    let mut current_metric = String::new();

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if line.starts_with("# HELP") || line.starts_with("# TYPE") {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() >= 3 {
                current_metric = parts[2].to_string();
                metrics
                    .entry(current_metric.clone())
                    .or_insert_with(Vec::new)
                    .push(line.to_string());
            }
        } else if !line.starts_with('#') && !current_metric.is_empty() {
            metrics
                .entry(current_metric.clone())
                .or_insert_with(Vec::new)
                .push(line.to_string());
        }
    }

    metrics
}

/// Helper to validate metric name follows Prometheus conventions
pub fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }
    !name.starts_with("__") && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

/// Extract metric value from a Prometheus output line
/// Example: `metric_name{label1="value1"} 42.5` -> Some(42.5)
pub fn extract_metric_value(line: &str) -> Option<f64> {
    line.split_whitespace().last()?.parse::<f64>().ok()
}

/// Extract labels from a Prometheus metric line
pub fn extract_labels(line: &str) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    if let (Some(start), Some(end)) = (line.find('{'), line.find('}')) {
        for pair in line[start + 1..end].split(',') {
            if let Some((key, value)) = pair.split_once('=') {
                labels.insert(key.trim().to_string(), value.trim().trim_matches('"').to_string());
            }
        }
    }
    labels
}

/// Value of the sample of `metric` whose labels include every pair in `want`
pub fn sample_value(output: &str, metric: &str, want: &[(&str, &str)]) -> Option<f64> {
    output
        .lines()
        .filter(|line| !line.starts_with('#'))
        .filter(|line| {
            line.split(|c| c == '{' || c == ' ').next() == Some(metric)
        })
        .find(|line| {
            let labels = extract_labels(line);
            want.iter()
                .all(|(k, v)| labels.get(*k).map(String::as_str) == Some(*v))
        })
        .and_then(extract_metric_value)
}

/// Validate that a Prometheus exposition format output is well-formed
pub fn validate_exposition_format(output: &str) -> Result<(), String> {
    let lines: Vec<&str> = output.lines().collect();

    for (i, line) in lines.iter().enumerate() {
        let line = line.trim();

        if line.starts_with("# HELP") {
            let help_parts: Vec<&str> = line.split_whitespace().collect();
            if help_parts.len() < 4 {
                return Err(format!("Line {}: Invalid HELP format", i + 1));
            }
            let metric_name = help_parts[2];
            let next = lines.get(i + 1).map(|l| l.trim()).unwrap_or_default();
            if !next.starts_with(&format!("# TYPE {}", metric_name)) {
                return Err(format!(
                    "Line {}: HELP not followed by TYPE for metric {}",
                    i + 1,
                    metric_name
                ));
            }
        }

        if line.starts_with("# TYPE") {
            let type_parts: Vec<&str> = line.split_whitespace().collect();
            let valid_types = ["counter", "gauge", "histogram", "summary", "untyped"];
            if type_parts.len() < 4 || !valid_types.contains(&type_parts[3]) {
                return Err(format!("Line {}: Invalid TYPE line", i + 1));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_metric_names() {
        assert!(is_valid_metric_name("provis_jobs_total"));
        assert!(is_valid_metric_name("my_metric_123"));
        assert!(!is_valid_metric_name("123_invalid"));
        assert!(!is_valid_metric_name("invalid-name"));
        assert!(!is_valid_metric_name("__reserved"));
        assert!(!is_valid_metric_name(""));
    }

    #[test]
    fn test_sample_value() {
        let output = "# HELP m x\n# TYPE m counter\nm{a=\"1\",b=\"2\"} 3\nm{a=\"9\"} 4\nm_other 5";
        assert_eq!(sample_value(output, "m", &[("a", "1")]), Some(3.0));
        assert_eq!(sample_value(output, "m", &[("a", "9")]), Some(4.0));
        assert_eq!(sample_value(output, "m", &[("a", "7")]), None);
        assert_eq!(sample_value(output, "m_other", &[]), Some(5.0));
    }

    #[test]
    fn test_validate_exposition_format() {
        let valid = "# HELP test_metric Test metric\n# TYPE test_metric counter\ntest_metric 1";
        assert!(validate_exposition_format(valid).is_ok());

        let invalid = "# HELP test_metric Test metric\ntest_metric 1";
        assert!(validate_exposition_format(invalid).is_err());
    }
}
