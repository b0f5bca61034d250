//! Spreadsheet input: workbook/CSV readers, header detection and column mapping.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use calamine::{open_workbook_auto, Data, ExcelDateTime, Reader};
use chrono::NaiveTime;
use membros_core::{normalize_label, ColumnSpec, RosterColumn};
use regex::Regex;
use serde_json::{Number, Value as JsonValue};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "membros-sheet";

#[derive(Debug, Error)]
pub enum SheetError {
    #[error("file not found: {0}")]
    NotFound(PathBuf),
    #[error("reading spreadsheet {path}: {message}")]
    Read { path: PathBuf, message: String },
    #[error("no header row found")]
    NoHeader,
}

impl SheetError {
    fn read(path: &Path, err: impl std::fmt::Display) -> Self {
        SheetError::Read {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Empty,
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl CellValue {
    /// Trimmed textual form. Integral floats render without a fraction.
    pub fn text(&self) -> String {
        match self {
            CellValue::Empty => String::new(),
            CellValue::Text(s) => s.trim().to_string(),
            CellValue::Int(n) => n.to_string(),
            CellValue::Float(f) => match integral(*f) {
                Some(n) => n.to_string(),
                None => f.to_string(),
            },
            CellValue::Bool(b) => b.to_string(),
        }
    }

    pub fn is_blank(&self) -> bool {
        match self {
            CellValue::Empty => true,
            CellValue::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    /// JSON form stored in report documents; strings are trimmed.
    pub fn to_json(&self) -> JsonValue {
        match self {
            CellValue::Empty => JsonValue::Null,
            CellValue::Text(s) => JsonValue::String(s.trim().to_string()),
            CellValue::Int(n) => JsonValue::from(*n),
            CellValue::Float(f) => match integral(*f) {
                Some(n) => JsonValue::from(n),
                None => Number::from_f64(*f).map_or(JsonValue::Null, JsonValue::Number),
            },
            CellValue::Bool(b) => JsonValue::Bool(*b),
        }
    }
}

fn integral(f: f64) -> Option<i64> {
    (f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15).then_some(f as i64)
}

/// Dates render as `dd/mm/yyyy`, with the time only when it is not midnight.
/// Durations and serials that do not convert keep their numeric value.
fn excel_datetime(dt: &ExcelDateTime) -> CellValue {
    if dt.is_duration() {
        return CellValue::Float(dt.as_f64());
    }
    match dt.as_datetime() {
        Some(value) if value.time() == NaiveTime::MIN => {
            CellValue::Text(value.format("%d/%m/%Y").to_string())
        }
        Some(value) => CellValue::Text(value.format("%d/%m/%Y %H:%M:%S").to_string()),
        None => CellValue::Float(dt.as_f64()),
    }
}

impl From<&Data> for CellValue {
    fn from(cell: &Data) -> Self {
        match cell {
            Data::Empty | Data::Error(_) => CellValue::Empty,
            Data::String(s) => CellValue::Text(s.clone()),
            Data::Int(n) => CellValue::Int(*n),
            Data::Float(f) => CellValue::Float(*f),
            Data::Bool(b) => CellValue::Bool(*b),
            Data::DateTime(dt) => excel_datetime(dt),
            Data::DateTimeIso(s) | Data::DurationIso(s) => CellValue::Text(s.clone()),
        }
    }
}

/// One spreadsheet row; the vector index is the column position.
pub type Row = Vec<CellValue>;

pub trait SheetReader {
    fn read_rows(&self, path: &Path) -> Result<Vec<Row>, SheetError>;
}

/// xls/xlsx/xlsb/ods through calamine. Reads the first worksheet.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkbookReader;

impl SheetReader for WorkbookReader {
    fn read_rows(&self, path: &Path) -> Result<Vec<Row>, SheetError> {
        let mut workbook = open_workbook_auto(path).map_err(|e| SheetError::read(path, e))?;
        let Some(sheet_name) = workbook.sheet_names().first().cloned() else {
            return Ok(Vec::new());
        };
        let range = workbook
            .worksheet_range(&sheet_name)
            .map_err(|e| SheetError::read(path, e))?;

        // calamine ranges start at the first used cell; pad back to A1 so
        // row indexes and column letters match what the operator sees.
        let (row_offset, col_offset) = range
            .start()
            .map(|(r, c)| (r as usize, c as usize))
            .unwrap_or((0, 0));
        let mut rows: Vec<Row> = vec![Vec::new(); row_offset];
        for cells in range.rows() {
            let mut row = vec![CellValue::Empty; col_offset];
            row.extend(cells.iter().map(CellValue::from));
            rows.push(row);
        }
        debug!(sheet = %sheet_name, rows = rows.len(), "workbook sheet loaded");
        Ok(rows)
    }
}

/// Delimited text; the delimiter is sniffed from the first non-empty line.
#[derive(Debug, Clone, Copy, Default)]
pub struct CsvReader;

impl SheetReader for CsvReader {
    fn read_rows(&self, path: &Path) -> Result<Vec<Row>, SheetError> {
        let bytes = fs::read(path).map_err(|e| SheetError::read(path, e))?;
        let text = String::from_utf8_lossy(&bytes);
        let text = text.trim_start_matches('\u{feff}');

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(sniff_delimiter(text))
            .has_headers(false)
            .flexible(true)
            .from_reader(text.as_bytes());

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|e| SheetError::read(path, e))?;
            rows.push(
                record
                    .iter()
                    .map(|field| {
                        if field.trim().is_empty() {
                            CellValue::Empty
                        } else {
                            CellValue::Text(field.to_string())
                        }
                    })
                    .collect(),
            );
        }
        Ok(rows)
    }
}

fn sniff_delimiter(text: &str) -> u8 {
    let Some(line) = text.lines().find(|l| !l.trim().is_empty()) else {
        return b',';
    };
    [b';', b'\t', b',']
        .into_iter()
        .max_by_key(|d| (line.bytes().filter(|b| b == d).count(), *d == b','))
        .unwrap_or(b',')
}

pub fn reader_for_path(path: &Path) -> Box<dyn SheetReader> {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "csv" | "tsv" | "txt" => Box::new(CsvReader),
        _ => Box::new(WorkbookReader),
    }
}

/// Read every row of the sheet at `path`.
pub fn load_rows(path: impl AsRef<Path>) -> Result<Vec<Row>, SheetError> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(SheetError::NotFound(path.to_path_buf()));
    }
    reader_for_path(path).read_rows(path)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub row_index: usize,
    /// Trimmed label for every column position up to the sheet width.
    pub labels: Vec<String>,
}

/// Find the first row with at least two non-blank cells that `skip` does not reject.
pub fn detect_header<F>(rows: &[Row], skip: F) -> Result<Header, SheetError>
where
    F: Fn(&[CellValue]) -> bool,
{
    let width = rows.iter().map(Vec::len).max().unwrap_or(0);
    for (row_index, row) in rows.iter().enumerate() {
        if row.iter().filter(|c| !c.is_blank()).count() < 2 {
            continue;
        }
        if skip(row.as_slice()) {
            debug!(row_index, "skipping metadata row above header");
            continue;
        }
        let mut labels: Vec<String> = row.iter().map(CellValue::text).collect();
        labels.resize(width, String::new());
        return Ok(Header { row_index, labels });
    }
    Err(SheetError::NoHeader)
}

/// Header rule that accepts any row.
pub fn no_metadata_rows(_row: &[CellValue]) -> bool {
    false
}

/// Matches the "Data emissão" banner some report exports put above the header.
pub fn is_issue_date_row(row: &[CellValue]) -> bool {
    static ISSUE_DATE: LazyLock<Regex> =
        LazyLock::new(|| {
            Regex::new(r"(?i)^data\s*(de\s*)?emi(ss|s|ç)[aã]o").expect("static regex compiles")
        });
    row.first()
        .map(|cell| ISSUE_DATE.is_match(&cell.text()))
        .unwrap_or(false)
}

/// Rows after the header.
pub fn data_rows<'a>(rows: &'a [Row], header: &Header) -> &'a [Row] {
    rows.get(header.row_index + 1..).unwrap_or(&[])
}

/// Resolved positions of known roster columns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnMap {
    positions: BTreeMap<RosterColumn, usize>,
}

impl ColumnMap {
    pub fn position(&self, column: RosterColumn) -> Option<usize> {
        self.positions.get(&column).copied()
    }

    pub fn contains(&self, column: RosterColumn) -> bool {
        self.positions.contains_key(&column)
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Cell for `column` in `row`; `None` when unmapped or past the row end.
    pub fn cell<'a>(&self, row: &'a [CellValue], column: RosterColumn) -> Option<&'a CellValue> {
        self.position(column).and_then(|pos| row.get(pos))
    }
}

/// Map header labels onto the fixed roster schema.
///
/// Exact normalized matches are resolved first across all columns; remaining
/// fields then accept a substring match in either direction. A header column
/// feeds at most one field, so "Nome dos filhos" cannot steal the name field
/// when a plain "Nome" column exists.
pub fn map_columns(header: &Header, specs: &[ColumnSpec]) -> ColumnMap {
    let labels: Vec<(usize, String)> = header
        .labels
        .iter()
        .enumerate()
        .map(|(pos, label)| (pos, normalize_label(label)))
        .filter(|(_, label)| !label.is_empty())
        .collect();
    let aliases: Vec<Vec<String>> = specs
        .iter()
        .map(|spec| spec.aliases.iter().map(|a| normalize_label(a)).collect())
        .collect();

    let mut positions = BTreeMap::new();
    let mut claimed = HashSet::new();

    for (spec, normalized) in specs.iter().zip(&aliases) {
        if let Some((pos, _)) = labels
            .iter()
            .find(|(pos, label)| !claimed.contains(pos) && normalized.contains(label))
        {
            positions.insert(spec.column, *pos);
            claimed.insert(*pos);
        }
    }

    for (spec, normalized) in specs.iter().zip(&aliases) {
        if positions.contains_key(&spec.column) {
            continue;
        }
        let partial = labels.iter().find(|(pos, label)| {
            !claimed.contains(pos)
                && normalized
                    .iter()
                    .any(|alias| label.contains(alias.as_str()) || alias.contains(label.as_str()))
        });
        if let Some((pos, _)) = partial {
            positions.insert(spec.column, *pos);
            claimed.insert(*pos);
        }
    }

    ColumnMap { positions }
}

/// Spreadsheet column letter for a zero-based position (0 → A, 26 → AA).
pub fn column_letter(position: usize) -> String {
    let mut n = position + 1;
    let mut letters = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.push(char::from(b'A' + rem as u8));
        n = (n - 1) / 26;
    }
    letters.iter().rev().collect()
}

/// Free-schema labels: blanks become `Column_{letter}`, repeats get `_1`, `_2`, ….
pub fn report_labels(header: &Header) -> Vec<String> {
    let mut used = HashSet::new();
    header
        .labels
        .iter()
        .enumerate()
        .map(|(pos, label)| {
            let base = if label.trim().is_empty() {
                format!("Column_{}", column_letter(pos))
            } else {
                label.trim().to_string()
            };
            let mut unique = base.clone();
            let mut suffix = 1;
            while used.contains(&unique) {
                unique = format!("{base}_{suffix}");
                suffix += 1;
            }
            used.insert(unique.clone());
            unique
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use membros_core::{MemberField, ROSTER_COLUMNS};
    use std::io::Write;

    fn text_row(cells: &[&str]) -> Row {
        cells
            .iter()
            .map(|c| {
                if c.is_empty() {
                    CellValue::Empty
                } else {
                    CellValue::Text(c.to_string())
                }
            })
            .collect()
    }

    fn header(labels: &[&str]) -> Header {
        Header {
            row_index: 0,
            labels: labels.iter().map(|l| l.to_string()).collect(),
        }
    }

    #[test]
    fn header_is_first_row_with_two_filled_cells() {
        let rows = vec![
            text_row(&["Relatório de membros"]),
            text_row(&[]),
            text_row(&["", "", "só uma"]),
            text_row(&["Nome", "Email", ""]),
            text_row(&["Ana", "ana@example.org", ""]),
        ];
        let header = detect_header(&rows, no_metadata_rows).expect("header");
        assert_eq!(header.row_index, 3);
        assert_eq!(header.labels, vec!["Nome", "Email", ""]);
        assert_eq!(data_rows(&rows, &header).len(), 1);
    }

    #[test]
    fn issue_date_banner_is_skipped() {
        let rows = vec![
            text_row(&["Data emissão:", "01/02/2025"]),
            text_row(&["Membro", "Concurso"]),
            text_row(&["Ana", "2019"]),
        ];
        assert!(is_issue_date_row(&rows[0]));
        assert!(is_issue_date_row(&text_row(&["DATA EMISAO", "x"])));
        let header = detect_header(&rows, is_issue_date_row).expect("header");
        assert_eq!(header.row_index, 1);
    }

    #[test]
    fn sheet_with_only_banner_has_no_header() {
        let rows = vec![text_row(&["Data emissão", "hoje"]), text_row(&["sozinho"])];
        assert!(matches!(
            detect_header(&rows, is_issue_date_row),
            Err(SheetError::NoHeader)
        ));
    }

    #[test]
    fn email_alias_maps_like_canonical_label() {
        let canonical = map_columns(&header(&["Nome", "eMail pessoal"]), ROSTER_COLUMNS);
        let alias = map_columns(&header(&["Nome", "E-mail"]), ROSTER_COLUMNS);
        let email = RosterColumn::Field(MemberField::EmailPessoal);
        assert_eq!(canonical.position(email), Some(1));
        assert_eq!(alias.position(email), Some(1));
    }

    #[test]
    fn exact_matches_win_over_earlier_partial_matches() {
        let map = map_columns(
            &header(&["Nome dos filhos", "Nome", "Comarca de Lotação", "Amigos no MP (Nomes)"]),
            ROSTER_COLUMNS,
        );
        assert_eq!(map.position(RosterColumn::Field(MemberField::Nome)), Some(1));
        assert_eq!(map.position(RosterColumn::Field(MemberField::NomesFilhos)), Some(0));
        assert_eq!(map.position(RosterColumn::Field(MemberField::ComarcaLotacao)), Some(2));
        assert_eq!(map.position(RosterColumn::Friends), Some(3));
        assert!(!map.contains(RosterColumn::Field(MemberField::Sexo)));
    }

    #[test]
    fn partial_match_accepts_decorated_labels() {
        let map = map_columns(&header(&["Nome completo", "Sexo (M/F)"]), ROSTER_COLUMNS);
        assert_eq!(map.position(RosterColumn::Field(MemberField::Nome)), Some(0));
        assert_eq!(map.position(RosterColumn::Field(MemberField::Sexo)), Some(1));
    }

    #[test]
    fn report_labels_fill_blanks_and_disambiguate_repeats() {
        let labels = report_labels(&header(&["Total", "Nome", "", "Total", "Total"]));
        assert_eq!(labels, vec!["Total", "Nome", "Column_C", "Total_1", "Total_2"]);
    }

    #[test]
    fn column_letters_roll_over() {
        assert_eq!(column_letter(0), "A");
        assert_eq!(column_letter(25), "Z");
        assert_eq!(column_letter(26), "AA");
        assert_eq!(column_letter(27), "AB");
    }

    #[test]
    fn numeric_cells_render_without_spurious_fraction() {
        assert_eq!(CellValue::Float(2019.0).text(), "2019");
        assert_eq!(CellValue::Float(2.5).text(), "2.5");
        assert_eq!(CellValue::Float(2019.0).to_json(), JsonValue::from(2019));
        assert_eq!(CellValue::Text("  x ".into()).to_json(), JsonValue::from("x"));
        assert!(CellValue::Text("   ".into()).is_blank());
    }

    #[test]
    fn workbook_dates_render_as_calendar_text() {
        use calamine::ExcelDateTimeType;

        let date = Data::DateTime(ExcelDateTime::new(45689.0, ExcelDateTimeType::DateTime, false));
        assert_eq!(CellValue::from(&date).text(), "01/02/2025");
        assert_eq!(CellValue::from(&date).to_json(), JsonValue::from("01/02/2025"));

        let stamp = Data::DateTime(ExcelDateTime::new(45689.5, ExcelDateTimeType::DateTime, false));
        assert_eq!(CellValue::from(&stamp).text(), "01/02/2025 12:00:00");

        let duration =
            Data::DateTime(ExcelDateTime::new(1.5, ExcelDateTimeType::TimeDelta, false));
        assert_eq!(CellValue::from(&duration), CellValue::Float(1.5));
    }

    #[test]
    fn csv_reader_sniffs_semicolons() {
        let mut file = tempfile::Builder::new().suffix(".csv").tempfile().expect("tempfile");
        writeln!(file, "Nome;Concurso;Cidade").unwrap();
        writeln!(file, "Ana;2019;\"Belo Horizonte; MG\"").unwrap();
        writeln!(file, "Bia;;").unwrap();

        let rows = load_rows(file.path()).expect("rows");
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1][2], CellValue::Text("Belo Horizonte; MG".into()));
        assert_eq!(rows[2][1], CellValue::Empty);
    }

    #[test]
    fn missing_file_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = load_rows(dir.path().join("nada.xlsx")).unwrap_err();
        assert!(matches!(err, SheetError::NotFound(_)));
    }
}
