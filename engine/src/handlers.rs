//! Command handlers for CLI operations
//!
//! - ask: run the full pipeline over CSV files
//! - check: policy-check a script
//! - exec: run a script in the sandbox
//! - inspect: describe CSV files
//! - history: show recent runs
//! - doctor: validate configuration and check dependencies

use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde_json::json;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::conductor::FinalResult;
use crate::config::Config;
use crate::datasets::{CsvDatasetProvider, DatasetProvider};
use crate::db::Database;
use crate::llm::LLMRouter;
use crate::policy::PolicyValidator;
use crate::sandbox::{ExecutionOutcome, ProcessSandbox, Sandbox};
use crate::secrets::SecretManager;
use crate::service::{AnalysisRequest, AnalysisService, ServiceError};
use sdk::{DatasetDescriptor, ResultValue, Scalar};

/// Output format for command results
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for machine consumption
    Json,
}

/// Answer a question about CSV files
pub async fn handle_ask(
    query: String,
    files: Vec<PathBuf>,
    session: String,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let database = Database::new(&config.database_path())
        .await
        .context("Failed to open database")?;
    let provider = CsvDatasetProvider::new(config.pipeline.sample_rows);
    let descriptors = describe_all(&provider, &files).await?;

    let service = AnalysisService::from_config(config, &database)?;
    let outcome = service
        .ask(AnalysisRequest {
            session_id: session,
            query,
            files: descriptors,
        })
        .await;
    database.close().await?;

    match outcome {
        Ok(response) => {
            print_response(&response, "completed", format)?;
            Ok(())
        }
        Err(ServiceError::Analysis(terminal)) => {
            print_response(&terminal.response, "failed", format)?;
            Err(anyhow::anyhow!("Analysis failed: {}", terminal.kind))
        }
        Err(e) => {
            if let OutputFormat::Json = format {
                let output = json!({"status": "rejected", "error": e.to_string()});
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            Err(e.into())
        }
    }
}

fn print_response(response: &FinalResult, status: &str, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            if let Some(result) = &response.result {
                println!("{}", render_result(result));
                println!();
            }
            println!("{}", response.explanation);
            if !response.recommendations.is_empty() {
                println!();
                println!("Recommendations:");
                for r in &response.recommendations {
                    println!("  - {}", r);
                }
            }
            println!();
            let kind = match (response.intent, response.operation_type) {
                (Some(i), Some(o)) => format!("{} / {}", i, o),
                _ => "unclassified".to_string(),
            };
            println!(
                "{} {} ({}; files: {}; retries: {}{})",
                if status == "completed" { "✓" } else { "✗" },
                status,
                kind,
                response.files_used.join(", "),
                response.retry_count,
                if response.cached { "; cached" } else { "" }
            );
        }
        OutputFormat::Json => {
            let mut output = serde_json::to_value(response)?;
            if let Some(map) = output.as_object_mut() {
                map.insert("status".to_string(), json!(status));
            }
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Ok(())
}

/// Check a script against the policy without running it
pub async fn handle_check(script: PathBuf, format: OutputFormat) -> Result<()> {
    let code = read_script(&script).await?;
    let verdict = PolicyValidator::new()?.evaluate(&code);

    match format {
        OutputFormat::Text => {
            if verdict.valid {
                println!("✓ Script passes the policy");
            } else {
                println!("✗ Script rejected:");
                for line in verdict.describe() {
                    println!("  - {}", line);
                }
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&verdict)?),
    }

    if verdict.valid {
        Ok(())
    } else {
        Err(anyhow::anyhow!(
            "Script violates {} rule(s)",
            verdict.violations.len()
        ))
    }
}

/// Run a policy-clean script in the sandbox against CSV files
pub async fn handle_exec(
    script: PathBuf,
    files: Vec<PathBuf>,
    timeout: Option<u64>,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let code = read_script(&script).await?;
    let verdict = PolicyValidator::new()?.evaluate(&code);
    if !verdict.valid {
        return Err(anyhow::anyhow!(
            "Script rejected by policy: {}",
            verdict.describe().join("; ")
        ));
    }

    let provider = CsvDatasetProvider::new(config.pipeline.sample_rows);
    let descriptors = describe_all(&provider, &files).await?;
    let mut tables = IndexMap::new();
    for descriptor in &descriptors {
        let table = provider.load(descriptor).await?;
        tables.insert(descriptor.name.clone(), table);
    }

    let sandbox = ProcessSandbox::from_config(&config.pipeline)
        .context("Failed to locate the sandbox worker")?;
    let timeout = timeout
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.pipeline.sandbox_timeout());
    let outcome = sandbox.execute(&code, &tables, timeout).await;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&outcome)?),
        OutputFormat::Text => match &outcome {
            ExecutionOutcome::Success { result, stdout } => {
                if !stdout.is_empty() {
                    print!("{}", stdout);
                }
                println!("{}", render_result(result));
            }
            ExecutionOutcome::Failure { kind, message } => {
                println!("✗ {}: {}", kind.as_str(), message);
            }
        },
    }

    match outcome {
        ExecutionOutcome::Success { .. } => Ok(()),
        ExecutionOutcome::Failure { kind, .. } => {
            Err(anyhow::anyhow!("Execution failed: {}", kind.as_str()))
        }
    }
}

/// Describe CSV files: columns, inferred types, rows and version
pub async fn handle_inspect(files: Vec<PathBuf>, config: &Config, format: OutputFormat) -> Result<()> {
    let provider = CsvDatasetProvider::new(config.pipeline.sample_rows);
    let descriptors = describe_all(&provider, &files).await?;

    match format {
        OutputFormat::Text => {
            for d in &descriptors {
                println!("{} ({})", d.name, d.id);
                println!("  Rows: {}", d.row_count);
                println!("  Version: {}", &d.version[..12.min(d.version.len())]);
                println!("  Columns:");
                for column in &d.columns {
                    let kind = d
                        .column_types
                        .get(column)
                        .map(|t| format!("{:?}", t).to_lowercase())
                        .unwrap_or_else(|| "unknown".to_string());
                    println!("    {:<24} {}", column, kind);
                }
                println!();
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&descriptors)?),
    }
    Ok(())
}

/// Show recent runs
pub async fn handle_history(
    limit: usize,
    session: Option<String>,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let database = Database::new(&config.database_path())
        .await
        .context("Failed to open database")?;

    let runs = database
        .runs()
        .recent(session.as_deref(), limit as i64)
        .await
        .context("Failed to fetch run history")?;

    match format {
        OutputFormat::Text => {
            if runs.is_empty() {
                println!("No runs in history");
                return Ok(());
            }

            println!("Run History (last {} runs):", limit);
            println!();

            for run in &runs {
                println!("Run ID: {}", run.id);
                println!("  Session: {}", run.session_id);
                println!("  Query: {}", run.query);
                match run.failure_kind {
                    Some(kind) => println!("  Status: failed ({})", kind),
                    None => println!("  Status: {}", run.status.as_str()),
                }
                if !run.files_used.is_empty() {
                    println!("  Files: {}", run.files_used.join(", "));
                }
                println!("  Retries: {}", run.retry_count);
                println!("  Duration: {}ms{}", run.duration_ms, if run.cached { " (cached)" } else { "" });

                let created = chrono::DateTime::from_timestamp(run.created_at, 0)
                    .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "Unknown".to_string());
                println!("  Created: {}", created);
                println!();
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "runs": runs,
                "count": runs.len(),
                "limit": limit
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    database.close().await?;
    Ok(())
}

/// Validate configuration and check that the pipeline's dependencies work
pub async fn handle_doctor(config: &Config, format: OutputFormat) -> Result<()> {
    let mut issues = Vec::new();
    let mut checks: Vec<(String, String)> = Vec::new();
    let mut check = |name: &str, status: &str| checks.push((name.to_string(), status.to_string()));

    // Config is already validated when loaded
    check("Configuration", "Valid");

    if config.core.data_dir.exists() {
        check("Data directory", "Exists");
    } else {
        check("Data directory", "Missing");
        issues.push(format!(
            "Data directory does not exist: {}",
            config.core.data_dir.display()
        ));
    }

    match Database::new(&config.database_path()).await {
        Ok(db) => {
            check("Database", "OK");
            db.close().await.ok();
        }
        Err(e) => {
            check("Database", "Failed");
            issues.push(format!("Cannot open database: {:#}", e));
        }
    }

    match PolicyValidator::new() {
        Ok(_) => check("Policy deny-list", "Compiled"),
        Err(e) => {
            check("Policy deny-list", "Invalid");
            issues.push(e.to_string());
        }
    }

    match ProcessSandbox::from_config(&config.pipeline) {
        Ok(sandbox) => {
            let outcome = sandbox
                .execute("result = 1 + 1", &IndexMap::new(), Duration::from_secs(10))
                .await;
            match outcome {
                ExecutionOutcome::Success {
                    result: ResultValue::Scalar(Scalar::Int(2)),
                    ..
                } => check("Sandbox worker", "OK"),
                ExecutionOutcome::Success { .. } => {
                    check("Sandbox worker", "Failed");
                    issues.push("Sandbox self-test returned a wrong answer".to_string());
                }
                ExecutionOutcome::Failure { kind, message } => {
                    check("Sandbox worker", "Failed");
                    issues.push(format!("Sandbox self-test failed ({}): {}", kind.as_str(), message));
                }
            }
        }
        Err(e) => {
            check("Sandbox worker", "Missing");
            issues.push(format!("Cannot locate sandbox worker: {}", e));
        }
    }

    let router = LLMRouter::from_config(Arc::new(config.llm.clone()), &SecretManager::new("sift"));
    let health = router.provider_health().await;
    for (name, healthy) in &health {
        check(
            &format!("Provider {}", name),
            if *healthy { "Available" } else { "Not available" },
        );
    }
    if !health.iter().any(|(_, healthy)| *healthy) {
        issues.push("No LLM providers available. Start Ollama or configure an API key.".to_string());
    }

    match format {
        OutputFormat::Text => {
            println!("Sift System Diagnostics");
            println!("=======================");
            println!();
            println!("System Checks:");
            for (name, status) in &checks {
                println!("  {:<25} {}", format!("{}:", name), status);
            }
            println!();
            if issues.is_empty() {
                println!("✓ All checks passed!");
            } else {
                println!("⚠ Issues found:");
                println!();
                for (i, issue) in issues.iter().enumerate() {
                    println!("  {}. {}", i + 1, issue);
                }
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "checks": checks.iter().map(|(name, status)| {
                    json!({"name": name, "status": status})
                }).collect::<Vec<_>>(),
                "issues": issues,
                "healthy": issues.is_empty()
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

/// Describe every file concurrently, keeping argument order
async fn describe_all(
    provider: &CsvDatasetProvider,
    files: &[PathBuf],
) -> Result<Vec<DatasetDescriptor>> {
    let descriptors = futures::future::try_join_all(
        files.iter().map(|path| provider.describe_path(path, None)),
    )
    .await?;
    Ok(descriptors)
}

/// Read a script from a file, or stdin for `-`
async fn read_script(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut code = String::new();
        std::io::stdin()
            .read_to_string(&mut code)
            .context("Failed to read script from stdin")?;
        return Ok(code);
    }
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read script {}", path.display()))
}

/// Render a result for the terminal. Tables are column-aligned.
pub fn render_result(result: &ResultValue) -> String {
    let ResultValue::Table(table) = result else {
        return serde_json::to_string_pretty(result).unwrap_or_default();
    };

    let cell = |v: &Scalar| match v {
        Scalar::Null => String::new(),
        Scalar::Text(s) => s.clone(),
        other => other.to_json().to_string(),
    };
    let rows: Vec<Vec<String>> = table
        .records
        .iter()
        .map(|record| {
            table
                .columns
                .iter()
                .map(|c| record.get(c).map(cell).unwrap_or_default())
                .collect()
        })
        .collect();

    let widths: Vec<usize> = table
        .columns
        .iter()
        .enumerate()
        .map(|(i, c)| {
            rows.iter()
                .map(|r| r[i].chars().count())
                .chain(std::iter::once(c.chars().count()))
                .max()
                .unwrap_or(0)
        })
        .collect();

    let line = |cells: Vec<&str>| {
        cells
            .iter()
            .zip(&widths)
            .map(|(c, w)| format!("{:<width$}", c, width = *w))
            .collect::<Vec<_>>()
            .join("  ")
            .trim_end()
            .to_string()
    };

    let mut out = vec![
        line(table.columns.iter().map(String::as_str).collect()),
        widths.iter().map(|w| "-".repeat(*w)).collect::<Vec<_>>().join("  "),
    ];
    for row in &rows {
        out.push(line(row.iter().map(String::as_str).collect()));
    }
    out.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdk::TabularResult;

    #[test]
    fn test_render_table_aligns_columns() {
        let mut a = IndexMap::new();
        a.insert("Group".to_string(), Scalar::Text("A".to_string()));
        a.insert("X".to_string(), Scalar::Float(200.0));
        let mut b = IndexMap::new();
        b.insert("Group".to_string(), Scalar::Text("Bravo".to_string()));
        b.insert("X".to_string(), Scalar::Null);

        let rendered = render_result(&ResultValue::Table(TabularResult {
            columns: vec!["Group".to_string(), "X".to_string()],
            records: vec![a, b],
        }));
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines[0], "Group  X");
        assert_eq!(lines[1], "-----  -----");
        assert_eq!(lines[2], "A      200.0");
        assert_eq!(lines[3], "Bravo");
    }

    #[test]
    fn test_render_scalar() {
        assert_eq!(render_result(&ResultValue::Scalar(Scalar::Int(42))), "42");
    }
}
