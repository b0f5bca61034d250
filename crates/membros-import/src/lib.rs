//! Import pipelines: roster spreadsheet, report spreadsheet and lookup bootstrap.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use membros_core::{
    normalize_label, validate_column_specs, CoreError, FriendGraph, MemberField, MembroDraft,
    ReportDocument, RosterColumn, LOOKUP_SOURCES, ROSTER_COLUMNS,
};
use membros_sheet::{
    data_rows, detect_header, is_issue_date_row, load_rows, map_columns, no_metadata_rows,
    report_labels, CellValue, ColumnMap, Row, SheetError,
};
use membros_storage::{
    add_friendship, clear_reports, clear_roster, insert_lookup_if_absent,
    membro_directory, report_label_values, upsert_membro, upsert_report, StorageError,
    UpsertOutcome,
};
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "membros-import";

#[derive(Debug, Error)]
pub enum ImportError {
    #[error(transparent)]
    Sheet(#[from] SheetError),
    #[error("invalid roster column table: {0}")]
    ColumnTable(#[from] CoreError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone)]
pub struct ImportConfig {
    pub database_url: String,
    pub sheet_path: PathBuf,
}

impl ImportConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://membros.db".to_string()),
            sheet_path: std::env::var("MEMBROS_SHEET_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("promo.xls")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportOptions {
    /// Clear the target tables before importing.
    pub fresh: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    /// Friendship edges that did not exist before the run.
    pub friendships: usize,
}

impl ImportSummary {
    fn start(run_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            started_at: now,
            finished_at: now,
            inserted: 0,
            updated: 0,
            skipped: 0,
            friendships: 0,
        }
    }

    fn record(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Inserted(_) => self.inserted += 1,
            UpsertOutcome::Updated(_) => self.updated += 1,
        }
    }

    fn finish(mut self) -> Self {
        self.finished_at = Utc::now();
        self
    }
}

fn is_blank_sheet(rows: &[Row]) -> bool {
    rows.iter().all(|row| row.iter().all(CellValue::is_blank))
}

/// Build a person from one roster row; `None` when the name cell is blank.
pub fn transform_row(row: &[CellValue], columns: &ColumnMap) -> Option<MembroDraft> {
    let nome = columns
        .cell(row, RosterColumn::Field(MemberField::Nome))
        .map(CellValue::text)
        .unwrap_or_default();
    if nome.is_empty() {
        return None;
    }

    let mut draft = MembroDraft::new(nome);
    for field in MemberField::ALL {
        if field == MemberField::Nome {
            continue;
        }
        if let Some(cell) = columns.cell(row, RosterColumn::Field(field)) {
            draft.set_raw(field, &cell.text());
        }
    }
    Some(draft)
}

/// Positive integers appearing in a friends cell, in order.
pub fn parse_friend_ids(cell: &str) -> Vec<i64> {
    cell.split(|c: char| !c.is_ascii_digit())
        .filter_map(|run| run.parse::<i64>().ok())
        .filter(|id| *id > 0)
        .collect()
}

/// Resolves friends cells against the stored people.
#[derive(Debug, Clone, Default)]
pub struct FriendResolver {
    by_name: HashMap<String, i64>,
    known: HashSet<i64>,
}

impl FriendResolver {
    /// The first person with a given normalized name wins.
    pub fn new(directory: impl IntoIterator<Item = (i64, String)>) -> Self {
        let mut resolver = Self::default();
        for (id, nome) in directory {
            resolver.known.insert(id);
            let key = normalize_label(&nome);
            if !key.is_empty() {
                resolver.by_name.entry(key).or_insert(id);
            }
        }
        resolver
    }

    /// Friend ids for `owner`. Digit runs are taken as ids when present,
    /// otherwise the cell is split on newlines, commas and semicolons and each
    /// token is matched by normalized name. Unknown ids, unresolved names and
    /// the owner itself are dropped.
    pub fn resolve(&self, owner: i64, cell: &str) -> Vec<i64> {
        let ids = parse_friend_ids(cell);
        let candidates: Vec<i64> = if ids.is_empty() {
            cell.split(['\n', '\r', ',', ';'])
                .map(normalize_label)
                .filter(|token| !token.is_empty())
                .filter_map(|token| self.by_name.get(&token).copied())
                .collect()
        } else {
            ids.into_iter().filter(|id| self.known.contains(id)).collect()
        };

        let mut seen = HashSet::new();
        candidates
            .into_iter()
            .filter(|id| *id != owner && seen.insert(*id))
            .collect()
    }
}

pub struct RosterImporter {
    pool: SqlitePool,
}

impl RosterImporter {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn run(
        &self,
        path: &Path,
        options: ImportOptions,
    ) -> Result<ImportSummary, ImportError> {
        let run_id = Uuid::new_v4();
        let span = info_span!(
            "roster_import",
            %run_id,
            path = %path.display(),
            fresh = options.fresh
        );
        async {
            let rows = load_rows(path)?;
            self.import_rows_as(run_id, &rows, options).await
        }
        .instrument(span)
        .await
    }

    pub async fn import_rows(
        &self,
        rows: &[Row],
        options: ImportOptions,
    ) -> Result<ImportSummary, ImportError> {
        self.import_rows_as(Uuid::new_v4(), rows, options).await
    }

    async fn import_rows_as(
        &self,
        run_id: Uuid,
        rows: &[Row],
        options: ImportOptions,
    ) -> Result<ImportSummary, ImportError> {
        validate_column_specs(ROSTER_COLUMNS)?;
        let mut summary = ImportSummary::start(run_id);
        let mut tx = self.pool.begin().await?;

        if options.fresh {
            clear_roster(&mut *tx).await?;
        }

        if is_blank_sheet(rows) {
            warn!("roster sheet is empty");
            tx.commit().await?;
            return Ok(summary.finish());
        }

        let header = detect_header(rows, no_metadata_rows)?;
        let columns = map_columns(&header, ROSTER_COLUMNS);
        debug!(header_row = header.row_index, mapped = columns.len(), "roster header resolved");

        let mut friend_cells = Vec::new();
        for (offset, row) in data_rows(rows, &header).iter().enumerate() {
            let Some(draft) = transform_row(row, &columns) else {
                debug!(row = header.row_index + 1 + offset, "skipping row without name");
                summary.skipped += 1;
                continue;
            };
            let outcome = upsert_membro(&mut *tx, &draft).await?;
            summary.record(outcome);

            if let Some(cell) = columns.cell(row, RosterColumn::Friends) {
                let text = cell.text();
                if !text.is_empty() {
                    friend_cells.push((outcome.id(), text));
                }
            }
        }

        let link_friends = columns.contains(RosterColumn::Field(MemberField::Nome))
            && columns.contains(RosterColumn::Friends);
        if link_friends {
            let resolver = FriendResolver::new(membro_directory(&mut *tx).await?);
            let mut graph = FriendGraph::new();
            for (owner, cell) in &friend_cells {
                for friend in resolver.resolve(*owner, cell) {
                    graph.add(*owner, friend);
                }
            }
            for edge in graph.iter() {
                if add_friendship(&mut *tx, edge).await? {
                    summary.friendships += 1;
                }
            }
        }

        tx.commit().await?;
        let summary = summary.finish();
        info!(
            inserted = summary.inserted,
            updated = summary.updated,
            skipped = summary.skipped,
            friendships = summary.friendships,
            "roster import finished"
        );
        Ok(summary)
    }
}

/// Build the stored document for one report row.
pub fn report_document(labels: &[String], row: &[CellValue]) -> ReportDocument {
    let data: Map<String, JsonValue> = labels
        .iter()
        .enumerate()
        .map(|(pos, label)| {
            let value = row.get(pos).map_or(JsonValue::Null, CellValue::to_json);
            (label.clone(), value)
        })
        .collect();
    ReportDocument::new(data)
}

pub struct ReportImporter {
    pool: SqlitePool,
}

impl ReportImporter {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn run(
        &self,
        path: &Path,
        options: ImportOptions,
    ) -> Result<ImportSummary, ImportError> {
        let run_id = Uuid::new_v4();
        let span = info_span!(
            "report_import",
            %run_id,
            path = %path.display(),
            fresh = options.fresh
        );
        async {
            let rows = load_rows(path)?;
            self.import_rows_as(run_id, &rows, options).await
        }
        .instrument(span)
        .await
    }

    pub async fn import_rows(
        &self,
        rows: &[Row],
        options: ImportOptions,
    ) -> Result<ImportSummary, ImportError> {
        self.import_rows_as(Uuid::new_v4(), rows, options).await
    }

    async fn import_rows_as(
        &self,
        run_id: Uuid,
        rows: &[Row],
        options: ImportOptions,
    ) -> Result<ImportSummary, ImportError> {
        let mut summary = ImportSummary::start(run_id);
        let mut tx = self.pool.begin().await?;

        if options.fresh {
            clear_reports(&mut *tx).await?;
        }

        if is_blank_sheet(rows) {
            warn!("report sheet is empty");
            tx.commit().await?;
            return Ok(summary.finish());
        }

        let header = detect_header(rows, is_issue_date_row)?;
        let labels = report_labels(&header);
        debug!(header_row = header.row_index, columns = labels.len(), "report header resolved");

        for (offset, row) in data_rows(rows, &header).iter().enumerate() {
            if row.iter().all(CellValue::is_blank) {
                debug!(row = header.row_index + 1 + offset, "skipping blank report row");
                summary.skipped += 1;
                continue;
            }
            let doc = report_document(&labels, row);
            summary.record(upsert_report(&mut *tx, &doc).await?);
        }

        tx.commit().await?;
        let summary = summary.finish();
        info!(
            inserted = summary.inserted,
            updated = summary.updated,
            skipped = summary.skipped,
            "report import finished"
        );
        Ok(summary)
    }
}

pub struct LookupBootstrapper {
    pool: SqlitePool,
}

impl LookupBootstrapper {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Seed lookups from the distinct report values; returns how many were added.
    pub async fn run(&self) -> Result<usize, ImportError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for source in LOOKUP_SOURCES {
            let mut seen = HashSet::new();
            for raw in report_label_values(&mut *tx, source.label).await? {
                let name = raw.trim();
                if name.is_empty() || !seen.insert(name.to_string()) {
                    continue;
                }
                if insert_lookup_if_absent(&mut *tx, source.lookup_type, name).await? {
                    inserted += 1;
                }
            }
            debug!(
                lookup_type = source.lookup_type,
                distinct = seen.len(),
                "lookup source scanned"
            );
        }

        tx.commit().await?;
        info!(inserted, "lookup bootstrap finished");
        Ok(inserted)
    }
}
