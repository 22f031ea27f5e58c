//! Run report: console/markdown summary plus the files written under
//! `reports/<run_id>/`.

use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, Int64Array, RecordBatch, StringArray, UInt64Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use clubsync_core::{Counters, EntityKind};
use clubsync_storage::{ArtifactStore, StoredArtifact};
use parquet::arrow::ArrowWriter;
use serde::Serialize;

use crate::orchestrator::{RunSummary, YearOutcome};

#[derive(Debug, Clone, Serialize)]
pub struct ReportManifest {
    pub schema_version: u32,
    pub run_id: String,
    pub dry_run: bool,
    pub files: Vec<ReportManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

fn counters_cells(c: &Counters) -> String {
    format!(
        "{} | {} | {} | {} | {} | {} | {}",
        c.created, c.matched, c.updated, c.conflicts, c.skipped, c.ambiguous, c.errors
    )
}

pub fn render_markdown(summary: &RunSummary) -> String {
    let mut lines = vec![
        "# Legacy Migration Report".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!(
            "- Mode: {}",
            if summary.dry_run { "dry run (no writes)" } else { "live" }
        ),
        String::new(),
        "## Years".to_string(),
    ];
    for outcome in &summary.years {
        lines.push(match outcome {
            YearOutcome::Imported { year, rows, invalid } => {
                format!("- {year}: {rows} rows imported, {invalid} invalid")
            }
            YearOutcome::Absent { year } => format!("- {year}: no legacy partition"),
            YearOutcome::Failed { year, reason } => format!("- {year}: FAILED ({reason})"),
        });
    }

    lines.push(String::new());
    lines.push("## Counts".to_string());
    lines.push(String::new());
    lines.push(
        "| scope | entity | created | matched | updated | conflicts | skipped | ambiguous | errors |"
            .to_string(),
    );
    lines.push("|---|---|---|---|---|---|---|---|---|".to_string());
    for row in summary.stats.rows() {
        lines.push(format!(
            "| {} | {} | {} |",
            row.scope,
            row.entity,
            counters_cells(&row.counters)
        ));
    }
    lines.push(format!(
        "| total | | {} |",
        counters_cells(&summary.stats.totals())
    ));

    lines.push(String::new());
    lines.push(format!("## Conflicts ({})", summary.conflicts.len()));
    for report in &summary.conflicts {
        lines.push(format!(
            "- [{}] {} #{} {}",
            report.scope, report.entity, report.canonical_id, report.label
        ));
        for conflict in &report.conflicts {
            lines.push(format!(
                "  - `{}`: existing {:?}, incoming {:?}",
                conflict.field, conflict.existing, conflict.incoming
            ));
        }
    }

    lines.push(String::new());
    lines.push(format!("## Ambiguous matches ({})", summary.ambiguities.len()));
    for item in &summary.ambiguities {
        lines.push(format!(
            "- [{}] {} {:?} in {}: picked #{} of {:?} (confidence {:.2})",
            item.scope,
            item.entity,
            item.raw_name,
            item.context,
            item.chosen_id,
            item.candidate_ids,
            item.confidence
        ));
    }

    if !summary.failures.is_empty() {
        lines.push(String::new());
        lines.push(format!("## Row errors ({})", summary.failures.len()));
        for failure in &summary.failures {
            lines.push(format!(
                "- [{}] {} {}: {}",
                failure.scope,
                failure.entity,
                failure
                    .legacy_id
                    .map(|id| format!("#{id}"))
                    .unwrap_or_default(),
                failure.message
            ));
        }
    }

    lines.push(String::new());
    lines.join("\n")
}

pub fn conflicts_json(summary: &RunSummary) -> Result<Vec<u8>> {
    serde_json::to_vec_pretty(&serde_json::json!({
        "run_id": summary.run_id,
        "dry_run": summary.dry_run,
        "years": summary.years,
        "conflicts": summary.conflicts,
        "ambiguities": summary.ambiguities,
        "failures": summary.failures,
    }))
    .context("serializing conflicts report")
}

fn parquet_bytes(batch: RecordBatch) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), None)
        .context("opening parquet writer")?;
    writer.write(&batch).context("writing record batch")?;
    writer.close().context("closing parquet writer")?;
    Ok(buffer)
}

pub fn stats_parquet(summary: &RunSummary) -> Result<Vec<u8>> {
    let rows = summary.stats.rows();
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("scope", DataType::Utf8, false),
        ArrowField::new("entity", DataType::Utf8, false),
        ArrowField::new("created", DataType::UInt64, false),
        ArrowField::new("matched", DataType::UInt64, false),
        ArrowField::new("updated", DataType::UInt64, false),
        ArrowField::new("conflicts", DataType::UInt64, false),
        ArrowField::new("skipped", DataType::UInt64, false),
        ArrowField::new("ambiguous", DataType::UInt64, false),
        ArrowField::new("errors", DataType::UInt64, false),
    ]));

    let column = |pick: fn(&Counters) -> u64| {
        Arc::new(UInt64Array::from(
            rows.iter().map(|r| pick(&r.counters)).collect::<Vec<_>>(),
        ))
    };
    let scopes = StringArray::from(rows.iter().map(|r| r.scope.to_string()).collect::<Vec<_>>());
    let entities = StringArray::from(
        rows.iter()
            .map(|r| r.entity.as_str())
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(scopes),
            Arc::new(entities),
            column(|c| c.created),
            column(|c| c.matched),
            column(|c| c.updated),
            column(|c| c.conflicts),
            column(|c| c.skipped),
            column(|c| c.ambiguous),
            column(|c| c.errors),
        ],
    )
    .context("building stats record batch")?;
    parquet_bytes(batch)
}

pub fn conflicts_parquet(summary: &RunSummary) -> Result<Vec<u8>> {
    parquet_bytes(conflicts_batch(summary)?)
}

/// One row per conflicting field, followed by one row per ambiguous match.
fn conflicts_batch(summary: &RunSummary) -> Result<RecordBatch> {
    struct Row<'a> {
        kind: &'static str,
        scope: String,
        entity: &'a str,
        canonical_id: i64,
        label: &'a str,
        field: Option<&'a str>,
        existing: Option<&'a str>,
        incoming: Option<&'a str>,
        confidence: Option<f64>,
    }

    let mut rows = Vec::new();
    for report in &summary.conflicts {
        for conflict in &report.conflicts {
            rows.push(Row {
                kind: "conflict",
                scope: report.scope.to_string(),
                entity: report.entity.as_str(),
                canonical_id: report.canonical_id,
                label: &report.label,
                field: Some(&conflict.field),
                existing: Some(&conflict.existing),
                incoming: Some(&conflict.incoming),
                confidence: None,
            });
        }
    }
    for item in &summary.ambiguities {
        rows.push(Row {
            kind: "ambiguous",
            scope: item.scope.to_string(),
            entity: item.entity.as_str(),
            canonical_id: item.chosen_id,
            label: &item.context,
            field: None,
            existing: None,
            incoming: Some(&item.raw_name),
            confidence: Some(item.confidence),
        });
    }

    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("kind", DataType::Utf8, false),
        ArrowField::new("scope", DataType::Utf8, false),
        ArrowField::new("entity", DataType::Utf8, false),
        ArrowField::new("canonical_id", DataType::Int64, false),
        ArrowField::new("label", DataType::Utf8, false),
        ArrowField::new("field", DataType::Utf8, true),
        ArrowField::new("existing", DataType::Utf8, true),
        ArrowField::new("incoming", DataType::Utf8, true),
        ArrowField::new("confidence", DataType::Float64, true),
    ]));
    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from(rows.iter().map(|r| r.kind).collect::<Vec<_>>())),
            Arc::new(StringArray::from(
                rows.iter().map(|r| r.scope.as_str()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(rows.iter().map(|r| r.entity).collect::<Vec<_>>())),
            Arc::new(Int64Array::from(
                rows.iter().map(|r| r.canonical_id).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(rows.iter().map(|r| r.label).collect::<Vec<_>>())),
            Arc::new(StringArray::from(rows.iter().map(|r| r.field).collect::<Vec<_>>())),
            Arc::new(StringArray::from(
                rows.iter().map(|r| r.existing).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                rows.iter().map(|r| r.incoming).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                rows.iter().map(|r| r.confidence).collect::<Vec<_>>(),
            )),
        ],
    )
    .context("building conflicts record batch")
}

fn manifest_entry(stored: &StoredArtifact) -> ReportManifestFile {
    ReportManifestFile {
        name: stored.name.clone(),
        path: stored.relative_path.display().to_string(),
        sha256: stored.sha256.clone(),
        bytes: stored.byte_size as u64,
    }
}

/// Writes every report file, then `manifest.json` listing their hashes.
pub async fn write_artifacts(
    store: &ArtifactStore,
    summary: &RunSummary,
) -> Result<Vec<StoredArtifact>> {
    let run_id = summary.run_id;
    let files = [
        ("migration_report.md", render_markdown(summary).into_bytes()),
        ("conflicts.json", conflicts_json(summary)?),
        ("stats.parquet", stats_parquet(summary)?),
        ("conflicts.parquet", conflicts_parquet(summary)?),
    ];

    let mut stored = Vec::with_capacity(files.len() + 1);
    for (name, bytes) in files {
        stored.push(
            store
                .store_bytes(run_id, name, &bytes)
                .await
                .with_context(|| format!("writing {name}"))?,
        );
    }

    let manifest = ReportManifest {
        schema_version: 1,
        run_id: run_id.to_string(),
        dry_run: summary.dry_run,
        files: stored.iter().map(manifest_entry).collect(),
    };
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing report manifest")?;
    stored.push(store.store_bytes(run_id, "manifest.json", &bytes).await?);
    Ok(stored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_array::Array;
    use chrono::Utc;
    use clubsync_core::{
        AmbiguityReviewItem, ConflictReport, FieldConflict, MigrationStats, Outcome, StatsScope,
    };
    use uuid::Uuid;

    fn summary() -> RunSummary {
        let mut stats = MigrationStats::new();
        stats.record(StatsScope::Global, EntityKind::Person, Outcome::Created);
        stats.record(StatsScope::Year(2019), EntityKind::Assignment, Outcome::Created);
        stats.record(StatsScope::Year(2019), EntityKind::Assignment, Outcome::Skipped);
        RunSummary {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            dry_run: false,
            years: vec![
                YearOutcome::Imported {
                    year: 2019,
                    rows: 1,
                    invalid: 0,
                },
                YearOutcome::Absent { year: 2020 },
            ],
            stats,
            conflicts: vec![ConflictReport {
                entity: EntityKind::Person,
                canonical_id: 7,
                label: "Mario Rossi".into(),
                scope: StatsScope::Global,
                conflicts: vec![FieldConflict {
                    field: "city".into(),
                    existing: "Milano".into(),
                    incoming: "Roma".into(),
                }],
            }],
            ambiguities: vec![AmbiguityReviewItem {
                scope: StatsScope::Year(2019),
                entity: EntityKind::Assignment,
                context: "Coppa 2019/4".into(),
                raw_name: "Ferrari".into(),
                chosen_id: 3,
                candidate_ids: vec![3, 5],
                confidence: 0.5,
            }],
            failures: vec![],
            stages: vec![],
            reports_dir: None,
        }
    }

    #[test]
    fn markdown_lists_counts_conflicts_and_ambiguities() {
        let text = render_markdown(&summary());
        assert!(text.contains("| 2019 | assignment | 1 | 0 | 0 | 0 | 1 | 0 | 0 |"));
        assert!(text.contains("- 2020: no legacy partition"));
        assert!(text.contains("`city`: existing \"Milano\", incoming \"Roma\""));
        assert!(text.contains("- [2019] assignment \"Ferrari\" in Coppa 2019/4: picked #3 of [3, 5]"));
    }

    #[test]
    fn ambiguous_rows_keep_their_entity() {
        let mut summary = summary();
        summary.ambiguities.push(AmbiguityReviewItem {
            scope: StatsScope::Year(2022),
            entity: EntityKind::Event,
            context: "tournament Open".into(),
            raw_name: "Open".into(),
            chosen_id: 8,
            candidate_ids: vec![8, 9],
            confidence: 0.5,
        });
        let batch = conflicts_batch(&summary).expect("batch");
        let column = |name: &str| {
            batch
                .column_by_name(name)
                .and_then(|c| c.as_any().downcast_ref::<StringArray>())
                .map(|c| c.iter().map(|v| v.unwrap_or_default().to_string()).collect::<Vec<_>>())
                .expect("string column")
        };
        assert_eq!(column("kind"), vec!["conflict", "ambiguous", "ambiguous"]);
        assert_eq!(column("entity"), vec!["person", "assignment", "event"]);
    }

    #[tokio::test]
    async fn artifacts_are_listed_in_the_manifest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        let summary = summary();
        let stored = write_artifacts(&store, &summary).await.expect("write");
        let names = stored.iter().map(|s| s.name.as_str()).collect::<Vec<_>>();
        assert_eq!(
            names,
            vec![
                "migration_report.md",
                "conflicts.json",
                "stats.parquet",
                "conflicts.parquet",
                "manifest.json"
            ]
        );

        let manifest: serde_json::Value = serde_json::from_slice(
            &std::fs::read(store.run_dir(summary.run_id).join("manifest.json")).expect("read"),
        )
        .expect("json");
        let files = manifest["files"].as_array().expect("files");
        assert_eq!(files.len(), 4);
        let parquet = std::fs::read(store.run_dir(summary.run_id).join("stats.parquet"))
            .expect("parquet");
        assert_eq!(&parquet[..4], b"PAR1");
        assert_eq!(
            files[2]["sha256"].as_str(),
            Some(ArtifactStore::sha256_hex(&parquet).as_str())
        );
    }
}
