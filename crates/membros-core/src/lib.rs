//! Core domain model for the membros backend: people, friendships, reports and lookups.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use sha2::{Digest, Sha256};
use thiserror::Error;
use unicode_normalization::{char::is_combining_mark, UnicodeNormalization};

pub const CRATE_NAME: &str = "membros-core";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("alias {alias:?} of column {column} normalizes to an empty label")]
    EmptyAlias {
        column: &'static str,
        alias: &'static str,
    },
    #[error("normalized alias {alias:?} is claimed by both {first} and {second}")]
    SharedAlias {
        alias: String,
        first: &'static str,
        second: &'static str,
    },
    #[error("column {column} is declared as {declared:?} but the field is {expected:?}")]
    KindMismatch {
        column: &'static str,
        declared: FieldKind,
        expected: FieldKind,
    },
    #[error("column {0} is declared more than once")]
    DuplicateColumn(&'static str),
    #[error("field {0} has no column aliases")]
    MissingColumn(&'static str),
}

/// Lowercase, strip diacritics, keep only ASCII letters and digits.
///
/// Used for both spreadsheet header labels and friend-name tokens, so
/// "Unidade de Lotação", "unidade de lotacao" and "UNIDADE-DE-LOTAÇÃO" all
/// collapse to `unidadedelotacao`.
pub fn normalize_label(input: &str) -> String {
    input
        .trim()
        .to_lowercase()
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// How a raw cell is coerced into a stored attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    Text,
    Count,
    StateCode,
}

impl FieldKind {
    /// Coerce trimmed text. `Count` fields never produce text; use [`parse_count`].
    pub fn coerce_text(self, raw: &str) -> Option<String> {
        let trimmed = raw.trim();
        let value = match self {
            FieldKind::Text => trimmed.to_string(),
            FieldKind::StateCode => trimmed.chars().take(2).collect(),
            FieldKind::Count => return None,
        };
        if value.is_empty() {
            None
        } else {
            Some(value)
        }
    }
}

/// Parse a non-negative integer from a cell such as `3`, `3.0` or `3 filhos`.
pub fn parse_count(raw: &str) -> Option<i64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(n) = trimmed.parse::<i64>() {
        return (n >= 0).then_some(n);
    }
    if let Ok(f) = trimmed.replace(',', ".").parse::<f64>() {
        return (f.is_finite() && f >= 0.0).then_some(f.trunc() as i64);
    }
    let digits: String = trimmed.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberField {
    Nome,
    Sexo,
    Concurso,
    CargoEfetivo,
    Titularidade,
    EmailPessoal,
    CargoEspecial,
    TelefoneUnidade,
    TelefoneCelular,
    UnidadeLotacao,
    ComarcaLotacao,
    TimeExtraprofissionais,
    QuantidadeFilhos,
    NomesFilhos,
    EstadoOrigem,
    Academico,
    PretensaoCarreira,
    CarreiraAnterior,
    Lideranca,
    GruposIdentitarios,
}

impl MemberField {
    pub const ALL: [MemberField; 20] = [
        MemberField::Nome,
        MemberField::Sexo,
        MemberField::Concurso,
        MemberField::CargoEfetivo,
        MemberField::Titularidade,
        MemberField::EmailPessoal,
        MemberField::CargoEspecial,
        MemberField::TelefoneUnidade,
        MemberField::TelefoneCelular,
        MemberField::UnidadeLotacao,
        MemberField::ComarcaLotacao,
        MemberField::TimeExtraprofissionais,
        MemberField::QuantidadeFilhos,
        MemberField::NomesFilhos,
        MemberField::EstadoOrigem,
        MemberField::Academico,
        MemberField::PretensaoCarreira,
        MemberField::CarreiraAnterior,
        MemberField::Lideranca,
        MemberField::GruposIdentitarios,
    ];

    /// Database column name.
    pub fn column(self) -> &'static str {
        match self {
            MemberField::Nome => "nome",
            MemberField::Sexo => "sexo",
            MemberField::Concurso => "concurso",
            MemberField::CargoEfetivo => "cargo_efetivo",
            MemberField::Titularidade => "titularidade",
            MemberField::EmailPessoal => "email_pessoal",
            MemberField::CargoEspecial => "cargo_especial",
            MemberField::TelefoneUnidade => "telefone_unidade",
            MemberField::TelefoneCelular => "telefone_celular",
            MemberField::UnidadeLotacao => "unidade_lotacao",
            MemberField::ComarcaLotacao => "comarca_lotacao",
            MemberField::TimeExtraprofissionais => "time_extraprofissionais",
            MemberField::QuantidadeFilhos => "quantidade_filhos",
            MemberField::NomesFilhos => "nomes_filhos",
            MemberField::EstadoOrigem => "estado_origem",
            MemberField::Academico => "academico",
            MemberField::PretensaoCarreira => "pretensao_carreira",
            MemberField::CarreiraAnterior => "carreira_anterior",
            MemberField::Lideranca => "lideranca",
            MemberField::GruposIdentitarios => "grupos_identitarios",
        }
    }

    pub fn from_column(column: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.column() == column)
    }

    pub fn kind(self) -> FieldKind {
        match self {
            MemberField::QuantidadeFilhos => FieldKind::Count,
            MemberField::EstadoOrigem => FieldKind::StateCode,
            _ => FieldKind::Text,
        }
    }
}

/// A typed attribute value as read from or written to storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Text(Option<String>),
    Integer(Option<i64>),
}

/// Person attributes without storage identity.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MembroDraft {
    pub nome: String,
    pub sexo: Option<String>,
    pub concurso: Option<String>,
    pub cargo_efetivo: Option<String>,
    pub titularidade: Option<String>,
    pub email_pessoal: Option<String>,
    pub cargo_especial: Option<String>,
    pub telefone_unidade: Option<String>,
    pub telefone_celular: Option<String>,
    pub unidade_lotacao: Option<String>,
    pub comarca_lotacao: Option<String>,
    pub time_extraprofissionais: Option<String>,
    pub quantidade_filhos: Option<i64>,
    pub nomes_filhos: Option<String>,
    pub estado_origem: Option<String>,
    pub academico: Option<String>,
    pub pretensao_carreira: Option<String>,
    pub carreira_anterior: Option<String>,
    pub lideranca: Option<String>,
    pub grupos_identitarios: Option<String>,
}

impl MembroDraft {
    pub fn new(nome: impl Into<String>) -> Self {
        Self {
            nome: nome.into().trim().to_string(),
            ..Default::default()
        }
    }

    /// Import identity: trimmed name plus personal email.
    pub fn identity(&self) -> (&str, Option<&str>) {
        (self.nome.as_str(), self.email_pessoal.as_deref())
    }

    /// Store a raw spreadsheet/request value, applying the field's coercion.
    pub fn set_raw(&mut self, field: MemberField, raw: &str) {
        match field {
            MemberField::Nome => self.nome = raw.trim().to_string(),
            MemberField::QuantidadeFilhos => self.quantidade_filhos = parse_count(raw),
            _ => {
                if let Some(slot) = self.text_slot_mut(field) {
                    *slot = field.kind().coerce_text(raw);
                }
            }
        }
    }

    pub fn value(&self, field: MemberField) -> FieldValue {
        match field {
            MemberField::Nome => FieldValue::Text(Some(self.nome.clone())),
            MemberField::QuantidadeFilhos => FieldValue::Integer(self.quantidade_filhos),
            _ => FieldValue::Text(self.text_slot(field).cloned().flatten()),
        }
    }

    /// Store an already-typed value; mismatched variants are ignored.
    pub fn put(&mut self, field: MemberField, value: FieldValue) {
        match (field, value) {
            (MemberField::Nome, FieldValue::Text(text)) => self.nome = text.unwrap_or_default(),
            (MemberField::QuantidadeFilhos, FieldValue::Integer(n)) => self.quantidade_filhos = n,
            (field, FieldValue::Text(text)) => {
                if let Some(slot) = self.text_slot_mut(field) {
                    *slot = text;
                }
            }
            (_, FieldValue::Integer(_)) => {}
        }
    }

    /// Re-apply trimming and per-field coercion to every text attribute.
    pub fn normalized(mut self) -> Self {
        self.nome = self.nome.trim().to_string();
        for field in MemberField::ALL {
            if let Some(slot) = self.text_slot_mut(field) {
                let raw = slot.take().unwrap_or_default();
                *slot = field.kind().coerce_text(&raw);
            }
        }
        self
    }

    fn text_slot(&self, field: MemberField) -> Option<&Option<String>> {
        Some(match field {
            MemberField::Sexo => &self.sexo,
            MemberField::Concurso => &self.concurso,
            MemberField::CargoEfetivo => &self.cargo_efetivo,
            MemberField::Titularidade => &self.titularidade,
            MemberField::EmailPessoal => &self.email_pessoal,
            MemberField::CargoEspecial => &self.cargo_especial,
            MemberField::TelefoneUnidade => &self.telefone_unidade,
            MemberField::TelefoneCelular => &self.telefone_celular,
            MemberField::UnidadeLotacao => &self.unidade_lotacao,
            MemberField::ComarcaLotacao => &self.comarca_lotacao,
            MemberField::TimeExtraprofissionais => &self.time_extraprofissionais,
            MemberField::NomesFilhos => &self.nomes_filhos,
            MemberField::EstadoOrigem => &self.estado_origem,
            MemberField::Academico => &self.academico,
            MemberField::PretensaoCarreira => &self.pretensao_carreira,
            MemberField::CarreiraAnterior => &self.carreira_anterior,
            MemberField::Lideranca => &self.lideranca,
            MemberField::GruposIdentitarios => &self.grupos_identitarios,
            MemberField::Nome | MemberField::QuantidadeFilhos => return None,
        })
    }

    fn text_slot_mut(&mut self, field: MemberField) -> Option<&mut Option<String>> {
        Some(match field {
            MemberField::Sexo => &mut self.sexo,
            MemberField::Concurso => &mut self.concurso,
            MemberField::CargoEfetivo => &mut self.cargo_efetivo,
            MemberField::Titularidade => &mut self.titularidade,
            MemberField::EmailPessoal => &mut self.email_pessoal,
            MemberField::CargoEspecial => &mut self.cargo_especial,
            MemberField::TelefoneUnidade => &mut self.telefone_unidade,
            MemberField::TelefoneCelular => &mut self.telefone_celular,
            MemberField::UnidadeLotacao => &mut self.unidade_lotacao,
            MemberField::ComarcaLotacao => &mut self.comarca_lotacao,
            MemberField::TimeExtraprofissionais => &mut self.time_extraprofissionais,
            MemberField::NomesFilhos => &mut self.nomes_filhos,
            MemberField::EstadoOrigem => &mut self.estado_origem,
            MemberField::Academico => &mut self.academico,
            MemberField::PretensaoCarreira => &mut self.pretensao_carreira,
            MemberField::CarreiraAnterior => &mut self.carreira_anterior,
            MemberField::Lideranca => &mut self.lideranca,
            MemberField::GruposIdentitarios => &mut self.grupos_identitarios,
            MemberField::Nome | MemberField::QuantidadeFilhos => return None,
        })
    }
}

/// Persisted person.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Membro {
    pub id: i64,
    #[serde(flatten)]
    pub fields: MembroDraft,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Identifier of a roster spreadsheet column the importer knows how to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RosterColumn {
    Field(MemberField),
    Friends,
}

impl RosterColumn {
    pub fn name(self) -> &'static str {
        match self {
            RosterColumn::Field(field) => field.column(),
            RosterColumn::Friends => "amigos",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ColumnSpec {
    pub column: RosterColumn,
    pub kind: FieldKind,
    pub aliases: &'static [&'static str],
}

const fn spec(field: MemberField, kind: FieldKind, aliases: &'static [&'static str]) -> ColumnSpec {
    ColumnSpec {
        column: RosterColumn::Field(field),
        kind,
        aliases,
    }
}

/// Accepted header spellings for every roster column, in matching order.
pub const ROSTER_COLUMNS: &[ColumnSpec] = &[
    spec(MemberField::Nome, FieldKind::Text, &["Membro", "Nome", "NOME"]),
    spec(MemberField::Sexo, FieldKind::Text, &["Sexo", "SEXO"]),
    spec(MemberField::Concurso, FieldKind::Text, &["Concurso"]),
    spec(
        MemberField::CargoEfetivo,
        FieldKind::Text,
        &["Cargo efetivo", "Cargo Efetivo", "CARGO EFETIVO"],
    ),
    spec(MemberField::Titularidade, FieldKind::Text, &["Titularidade"]),
    spec(
        MemberField::EmailPessoal,
        FieldKind::Text,
        &["eMail pessoal", "Email pessoal", "Email", "E-mail", "e-mail pessoal"],
    ),
    spec(MemberField::CargoEspecial, FieldKind::Text, &["Cargo Especial", "CARGO ESPECIAL"]),
    spec(
        MemberField::TelefoneUnidade,
        FieldKind::Text,
        &["Telefone Unidade", "Telefone da Unidade", "Telefone (Unidade)"],
    ),
    spec(
        MemberField::TelefoneCelular,
        FieldKind::Text,
        &["Telefone celular", "Celular", "Telefone Celular"],
    ),
    spec(
        MemberField::UnidadeLotacao,
        FieldKind::Text,
        &["Unidade Lotação", "Unidade de Lotação", "Unidade de lotação"],
    ),
    spec(
        MemberField::ComarcaLotacao,
        FieldKind::Text,
        &["Comarca Lotação", "Comarca de Lotação", "Comarca"],
    ),
    spec(
        MemberField::TimeExtraprofissionais,
        FieldKind::Text,
        &[
            "Time de futebol e outros grupos extraprofissionais",
            "Grupos extraprofissionais",
            "Time de futebol",
        ],
    ),
    spec(
        MemberField::QuantidadeFilhos,
        FieldKind::Count,
        &["Quantidade de filhos", "Qtde de filhos", "Qtd filhos"],
    ),
    spec(MemberField::NomesFilhos, FieldKind::Text, &["Nome dos filhos", "Nomes dos filhos"]),
    spec(
        MemberField::EstadoOrigem,
        FieldKind::StateCode,
        &["Estado de origem", "UF de origem", "Estado origem"],
    ),
    spec(MemberField::Academico, FieldKind::Text, &["Acadêmico", "Academico"]),
    spec(
        MemberField::PretensaoCarreira,
        FieldKind::Text,
        &[
            "Pretensão de movimentação na carreira",
            "Pretensao de movimentacao na carreira",
            "Pretensão de carreira",
        ],
    ),
    spec(MemberField::CarreiraAnterior, FieldKind::Text, &["Carreira anterior"]),
    spec(MemberField::Lideranca, FieldKind::Text, &["Liderança", "Lideranca"]),
    spec(
        MemberField::GruposIdentitarios,
        FieldKind::Text,
        &["Grupos identitários", "Grupos identitarios"],
    ),
    ColumnSpec {
        column: RosterColumn::Friends,
        kind: FieldKind::Text,
        aliases: &["Amigos no MP", "Amigos no MP (IDs)", "Amigos no MP (Nomes)", "Amigos MP"],
    },
];

/// Check a column table for internal consistency.
///
/// Every person field must appear exactly once with its own kind, and no
/// normalized alias may be empty or belong to two different columns.
/// Repeated spellings within one column are fine (`"Nome"`/`"NOME"`).
pub fn validate_column_specs(specs: &[ColumnSpec]) -> Result<(), CoreError> {
    let mut owners: HashMap<String, RosterColumn> = HashMap::new();
    let mut seen = BTreeSet::new();

    for spec in specs {
        if !seen.insert(spec.column) {
            return Err(CoreError::DuplicateColumn(spec.column.name()));
        }
        if let RosterColumn::Field(field) = spec.column {
            if field.kind() != spec.kind {
                return Err(CoreError::KindMismatch {
                    column: field.column(),
                    declared: spec.kind,
                    expected: field.kind(),
                });
            }
        }
        for alias in spec.aliases.iter().copied() {
            let normalized = normalize_label(alias);
            if normalized.is_empty() {
                return Err(CoreError::EmptyAlias {
                    column: spec.column.name(),
                    alias,
                });
            }
            match owners.get(&normalized) {
                Some(owner) if *owner != spec.column => {
                    return Err(CoreError::SharedAlias {
                        alias: normalized,
                        first: owner.name(),
                        second: spec.column.name(),
                    });
                }
                Some(_) => {}
                None => {
                    owners.insert(normalized, spec.column);
                }
            }
        }
    }

    if let Some(missing) = MemberField::ALL
        .into_iter()
        .find(|f| !seen.contains(&RosterColumn::Field(*f)))
    {
        return Err(CoreError::MissingColumn(missing.column()));
    }
    Ok(())
}

/// Undirected friendship between two distinct people, stored as `(low, high)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Friendship {
    low: i64,
    high: i64,
}

impl Friendship {
    /// `None` for self-references.
    pub fn new(a: i64, b: i64) -> Option<Self> {
        match a.cmp(&b) {
            std::cmp::Ordering::Less => Some(Self { low: a, high: b }),
            std::cmp::Ordering::Greater => Some(Self { low: b, high: a }),
            std::cmp::Ordering::Equal => None,
        }
    }

    pub fn low(self) -> i64 {
        self.low
    }

    pub fn high(self) -> i64 {
        self.high
    }
}

/// Set of undirected edges with idempotent insertion.
#[derive(Debug, Clone, Default)]
pub struct FriendGraph {
    edges: BTreeSet<Friendship>,
}

impl FriendGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when the edge is new; self-loops are rejected.
    pub fn add(&mut self, a: i64, b: i64) -> bool {
        Friendship::new(a, b).is_some_and(|edge| self.edges.insert(edge))
    }

    pub fn contains(&self, a: i64, b: i64) -> bool {
        Friendship::new(a, b).is_some_and(|edge| self.edges.contains(&edge))
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Friendship> + '_ {
        self.edges.iter().copied()
    }
}

/// Render a JSON value the way it appears in the report search blob.
pub fn value_text(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s.clone(),
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Array(_) | JsonValue::Object(_) => value.to_string(),
    }
}

/// Schema-less report row with its derived search blob and content hash.
///
/// The derived fields are computed in [`ReportDocument::new`]; `data` is
/// read-only afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportDocument {
    data: Map<String, JsonValue>,
    search_text: String,
    row_hash: String,
}

impl ReportDocument {
    pub fn new(data: Map<String, JsonValue>) -> Self {
        let search_text = data
            .values()
            .map(value_text)
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
        let canonical = JsonValue::Object(data.clone()).to_string();
        let row_hash = sha256_hex(canonical.as_bytes());
        Self {
            data,
            search_text,
            row_hash,
        }
    }

    /// Only JSON objects are valid report documents.
    pub fn from_value(value: JsonValue) -> Option<Self> {
        match value {
            JsonValue::Object(map) => Some(Self::new(map)),
            _ => None,
        }
    }

    pub fn data(&self) -> &Map<String, JsonValue> {
        &self.data
    }

    pub fn search_text(&self) -> &str {
        &self.search_text
    }

    pub fn row_hash(&self) -> &str {
        &self.row_hash
    }
}

/// Persisted report row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub id: i64,
    pub data: Map<String, JsonValue>,
    pub search_text: String,
    pub row_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Lookup {
    pub id: i64,
    #[serde(rename = "type")]
    pub lookup_type: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Report label feeding one lookup type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookupSource {
    pub label: &'static str,
    pub lookup_type: &'static str,
}

pub const LOOKUP_SOURCES: &[LookupSource] = &[
    LookupSource { label: "Concurso", lookup_type: "concurso" },
    LookupSource { label: "Naturalidade", lookup_type: "naturalidade" },
    LookupSource { label: "Titularidade", lookup_type: "titularidade" },
    LookupSource { label: "Cargo efetivo", lookup_type: "cargo_efetivo" },
    LookupSource { label: "Cargo Especial", lookup_type: "cargo_especial" },
    LookupSource { label: "Comarca Lotação", lookup_type: "comarca_lotacao" },
    LookupSource { label: "Unidade Lotação", lookup_type: "unidade_lotacao" },
];

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: JsonValue) -> Map<String, JsonValue> {
        match value {
            JsonValue::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn normalize_label_strips_accents_case_and_punctuation() {
        assert_eq!(normalize_label("  Unidade de Lotação "), "unidadedelotacao");
        assert_eq!(normalize_label("E-mail"), "email");
        assert_eq!(normalize_label("Telefone (Unidade)"), "telefoneunidade");
        assert_eq!(normalize_label("João da Conceição"), "joaodaconceicao");
        assert_eq!(normalize_label("---"), "");
    }

    #[test]
    fn builtin_roster_columns_are_consistent() {
        validate_column_specs(ROSTER_COLUMNS).expect("builtin table");
    }

    #[test]
    fn shared_alias_between_columns_is_rejected() {
        let specs = [
            spec(MemberField::Nome, FieldKind::Text, &["Nome"]),
            spec(MemberField::Sexo, FieldKind::Text, &["NOME"]),
        ];
        let err = validate_column_specs(&specs).unwrap_err();
        assert_eq!(
            err,
            CoreError::SharedAlias {
                alias: "nome".into(),
                first: "nome",
                second: "sexo",
            }
        );
    }

    #[test]
    fn kind_mismatch_and_missing_fields_are_rejected() {
        let specs = [spec(MemberField::QuantidadeFilhos, FieldKind::Text, &["Filhos"])];
        assert!(matches!(
            validate_column_specs(&specs),
            Err(CoreError::KindMismatch { column: "quantidade_filhos", .. })
        ));

        let specs = [spec(MemberField::Nome, FieldKind::Text, &["Nome"])];
        assert!(matches!(
            validate_column_specs(&specs),
            Err(CoreError::MissingColumn("sexo"))
        ));
    }

    #[test]
    fn set_raw_applies_field_coercions() {
        let mut draft = MembroDraft::new("  Ana  ");
        draft.set_raw(MemberField::EstadoOrigem, " Minas Gerais");
        draft.set_raw(MemberField::QuantidadeFilhos, "2 filhos");
        draft.set_raw(MemberField::Sexo, "   ");
        draft.set_raw(MemberField::Concurso, " 2019 ");

        assert_eq!(draft.nome, "Ana");
        assert_eq!(draft.estado_origem.as_deref(), Some("Mi"));
        assert_eq!(draft.quantidade_filhos, Some(2));
        assert_eq!(draft.sexo, None);
        assert_eq!(draft.concurso.as_deref(), Some("2019"));
    }

    #[test]
    fn parse_count_handles_spreadsheet_numbers() {
        assert_eq!(parse_count("3"), Some(3));
        assert_eq!(parse_count("3.0"), Some(3));
        assert_eq!(parse_count(""), None);
        assert_eq!(parse_count("nenhum"), None);
        assert_eq!(parse_count("-1"), None);
    }

    #[test]
    fn value_and_put_mirror_each_other() {
        let mut draft = MembroDraft::new("Ana");
        draft.email_pessoal = Some("ana@example.org".into());
        draft.quantidade_filhos = Some(1);

        let mut copy = MembroDraft::default();
        for field in MemberField::ALL {
            copy.put(field, draft.value(field));
        }
        assert_eq!(copy, draft);
        assert_eq!(copy.identity(), ("Ana", Some("ana@example.org")));
    }

    #[test]
    fn friendships_are_undirected_and_reject_self_loops() {
        assert_eq!(Friendship::new(7, 3), Friendship::new(3, 7));
        assert!(Friendship::new(4, 4).is_none());

        let mut graph = FriendGraph::new();
        assert!(graph.add(1, 2));
        assert!(!graph.add(2, 1));
        assert!(!graph.add(5, 5));
        assert_eq!(graph.len(), 1);
        assert!(graph.contains(2, 1));
        let edge = graph.iter().next().expect("edge");
        assert_eq!((edge.low(), edge.high()), (1, 2));
    }

    #[test]
    fn report_document_derives_search_text_and_stable_hash() {
        let data = object(json!({"Nome": "Ana SILVA", "Total": 3, "Obs": null}));
        let doc = ReportDocument::new(data.clone());
        assert_eq!(doc.search_text(), "ana silva 3 ");
        assert_eq!(doc.row_hash().len(), 64);
        assert_eq!(doc.row_hash(), ReportDocument::new(data).row_hash());

        let other =
            ReportDocument::new(object(json!({"Nome": "Ana SILVA", "Total": 4, "Obs": null})));
        assert_ne!(doc.row_hash(), other.row_hash());
    }

    #[test]
    fn report_document_hash_depends_on_column_order() {
        let a = ReportDocument::new(object(json!({"A": 1, "B": 2})));
        let b = ReportDocument::new(object(json!({"B": 2, "A": 1})));
        assert_ne!(a.row_hash(), b.row_hash());
    }

    #[test]
    fn sha256_hex_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }
}
