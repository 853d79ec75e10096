//! Raw row normalization into canonical entities.
//!
//! Raw rows come in more than one shape: column names differ between the
//! snapshot reader, the change feed and older schema revisions, ids may be
//! numbers or strings, and status-like columns are free text. Every canonical
//! field therefore reads from an ordered list of column aliases, and the
//! first present, non-null alias wins.
//!
//! Normalization is fail-soft per row: a row without its identity yields a
//! [`NormalizeError`] and the caller drops it, nothing here panics or aborts
//! a batch.

use std::collections::HashSet;

use chrono::{DateTime, Days, Local, NaiveDate};
use serde_json::Value;

use crate::NormalizeError;
use crate::types::{
    Absence, Client, Holiday, Impact, Priority, Project, ProjectMember, RawRow, Table, Task,
    TaskStatus, TimesheetEntry, User, member_key,
};

/// Days added to today when a task has no usable estimated delivery.
pub const DEFAULT_DELIVERY_DAYS: u64 = 7;

const ID: &[&str] = &["id"];
const NAME: &[&str] = &["name", "nome", "display_name"];
const CLIENT_ID: &[&str] = &["client_id", "cliente_id"];
const PROJECT_ID: &[&str] = &["project_id", "projeto_id"];
const TASK_ID: &[&str] = &["task_id", "tarefa_id"];
const USER_ID: &[&str] = &["user_id", "usuario_id", "collaborator_id"];
const ACTIVE: &[&str] = &["active", "ativo", "is_active"];
const DELETED_AT: &[&str] = &["deleted_at", "deletedAt"];
const START_DATE: &[&str] = &["start_date", "data_inicio"];
const END_DATE: &[&str] = &["end_date", "data_fim"];
const DESCRIPTION: &[&str] = &["description", "descricao"];

/// Ordered keyword groups for task status. First match wins.
const STATUS_KEYWORDS: &[(TaskStatus, &[&str])] = &[
    (
        TaskStatus::Done,
        &["conclu", "done", "finaliz", "entregue"],
    ),
    (TaskStatus::Blocked, &["bloque", "block", "imped"]),
    (TaskStatus::Review, &["revis", "review", "homolog"]),
    (
        TaskStatus::InProgress,
        &["andamento", "progress", "execu", "fazendo", "doing"],
    ),
];

/// Negated forms that contain a status keyword. Blanked out before matching.
const NEGATED_STATUS: &[&str] = &[
    "desbloque",
    "unblock",
    "não conclu",
    "nao conclu",
    "não finaliz",
    "nao finaliz",
    "não entregue",
    "nao entregue",
    "not done",
    "undone",
];

const PRIORITY_KEYWORDS: &[(Priority, &[&str])] = &[
    (Priority::Urgent, &["urgent", "crític", "critic"]),
    (Priority::High, &["alta", "high"]),
    (Priority::Low, &["baixa", "low"]),
    (Priority::Medium, &["méd", "med", "normal"]),
];

const IMPACT_KEYWORDS: &[(Impact, &[&str])] = &[
    (Impact::High, &["alto", "alta", "high", "grande"]),
    (Impact::Low, &["baixo", "baixa", "low", "pequeno"]),
    (Impact::Medium, &["méd", "med"]),
];

/// Conversion from a raw row into a canonical entity.
pub trait Normalize: Sized {
    fn normalize(raw: &RawRow) -> Result<Self, NormalizeError>;

    /// Keep fields that a live row cannot carry from the previously cached value.
    fn carry_over(&mut self, _previous: &Self, _raw: &RawRow) {}
}

/// Case-insensitive substring match against ordered keyword groups.
fn match_keywords<T: Copy>(raw: &str, groups: &[(T, &[&str])], default: T) -> T {
    let lowered = raw.to_lowercase();
    groups
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| lowered.contains(k)))
        .map(|(value, _)| *value)
        .unwrap_or(default)
}

impl TaskStatus {
    pub fn from_raw(raw: &str) -> Self {
        let lowered = NEGATED_STATUS
            .iter()
            .fold(raw.to_lowercase(), |text, negated| text.replace(negated, " "));
        match_keywords(&lowered, STATUS_KEYWORDS, TaskStatus::Todo)
    }
}

impl Priority {
    pub fn from_raw(raw: &str) -> Self {
        match_keywords(raw, PRIORITY_KEYWORDS, Priority::Medium)
    }
}

impl Impact {
    pub fn from_raw(raw: &str) -> Self {
        match_keywords(raw, IMPACT_KEYWORDS, Impact::Medium)
    }
}

/// Whole days a task is past due. Due today is not overdue, done is never overdue.
pub fn days_overdue(status: TaskStatus, due: NaiveDate, today: NaiveDate) -> i64 {
    if status == TaskStatus::Done {
        return 0;
    }
    (today - due).num_days().max(0)
}

/// Normalize a date value to a calendar date.
///
/// `YYYY-MM-DD` passes through, ISO timestamps are cut to their date part,
/// anything else goes through a generic parse and lands on the local date.
pub fn normalize_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Some(date);
    }
    if matches!(value.as_bytes().get(10), Some(b'T' | b't' | b' ')) {
        if let Some(date) = value
            .get(..10)
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
        {
            return Some(date);
        }
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Local).date_naive());
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(value) {
        return Some(dt.with_timezone(&Local).date_naive());
    }
    ["%d/%m/%Y", "%Y/%m/%d", "%d-%m-%Y", "%d.%m.%Y"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(value, fmt).ok())
}

fn field<'a>(raw: &'a RawRow, aliases: &[&str]) -> Option<&'a Value> {
    aliases
        .iter()
        .find_map(|alias| raw.get(*alias).filter(|v| !v.is_null()))
}

/// Render an identifier value as a string; numbers are stringified.
fn id_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i.to_string())
            } else if let Some(u) = n.as_u64() {
                Some(u.to_string())
            } else {
                n.as_f64()
                    .filter(|f| f.fract() == 0.0)
                    .map(|f| format!("{f:.0}"))
            }
        }
        _ => None,
    }
}

fn required_id(
    table: Table,
    raw: &RawRow,
    aliases: &[&str],
    name: &'static str,
) -> Result<String, NormalizeError> {
    match field(raw, aliases) {
        None => Err(NormalizeError::MissingField { table, field: name }),
        Some(value) => id_value(value).ok_or_else(|| match value {
            Value::String(_) => NormalizeError::MissingField { table, field: name },
            other => NormalizeError::InvalidField {
                table,
                field: name,
                reason: format!("expected a string or integer id, got {other}"),
            },
        }),
    }
}

fn optional_id(raw: &RawRow, aliases: &[&str]) -> Option<String> {
    field(raw, aliases).and_then(id_value)
}

fn text(raw: &RawRow, aliases: &[&str]) -> Option<String> {
    match field(raw, aliases)? {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn number(raw: &RawRow, aliases: &[&str]) -> Option<f64> {
    match field(raw, aliases)? {
        Value::Number(n) => n.as_f64(),
        // Decimal commas show up in hand-entered values.
        Value::String(s) => s.trim().replace(',', ".").parse().ok(),
        _ => None,
    }
}

fn flag(raw: &RawRow, aliases: &[&str]) -> Option<bool> {
    match field(raw, aliases)? {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|i| i != 0),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "t" | "1" | "yes" | "sim" | "s" => Some(true),
            "false" | "f" | "0" | "no" | "nao" | "não" | "n" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn date(raw: &RawRow, aliases: &[&str]) -> Option<NaiveDate> {
    match field(raw, aliases)? {
        Value::String(s) => normalize_date(s),
        _ => None,
    }
}

/// Whether a task row carries collaborator data (snapshot rows do, feed rows don't).
pub fn has_collaborator_columns(raw: &RawRow) -> bool {
    ["collaborator_ids", "collaboratorIds", "task_collaborators"]
        .iter()
        .any(|k| raw.contains_key(*k))
}

fn collaborators(raw: &RawRow) -> Vec<String> {
    let items = match field(raw, &["collaborator_ids", "collaboratorIds", "task_collaborators"]) {
        Some(Value::Array(items)) => items,
        _ => return Vec::new(),
    };

    let mut seen = HashSet::new();
    items
        .iter()
        .filter_map(|item| match item {
            Value::Object(obj) => optional_id(obj, USER_ID),
            other => id_value(other),
        })
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

/// Only a timestamp string marks a row as deleted.
fn tombstone(raw: &RawRow) -> Option<String> {
    match field(raw, DELETED_AT)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

/// Normalize a task row against an explicit calendar date.
pub fn normalize_task_at(raw: &RawRow, today: NaiveDate) -> Result<Task, NormalizeError> {
    let table = Table::Tasks;
    let progress = number(raw, &["progress", "progresso", "percent_complete"])
        .unwrap_or(0.0)
        .clamp(0.0, 100.0)
        .round() as u8;
    let estimated_delivery = date(
        raw,
        &["estimated_delivery", "data_entrega", "due_date", "deadline"],
    )
    .unwrap_or_else(|| {
        today
            .checked_add_days(Days::new(DEFAULT_DELIVERY_DAYS))
            .unwrap_or(today)
    });

    Ok(Task {
        id: required_id(table, raw, ID, "id")?,
        title: text(raw, &["title", "titulo", "name", "nome"]).unwrap_or_default(),
        description: text(raw, DESCRIPTION),
        project_id: optional_id(raw, PROJECT_ID),
        client_id: optional_id(raw, CLIENT_ID),
        developer_id: optional_id(raw, &["developer_id", "assignee_id", "responsavel_id"]),
        status: text(raw, &["status"])
            .map(|s| TaskStatus::from_raw(&s))
            .unwrap_or_default(),
        priority: text(raw, &["priority", "prioridade"])
            .map(|s| Priority::from_raw(&s))
            .unwrap_or_default(),
        impact: text(raw, &["impact", "impacto"])
            .map(|s| Impact::from_raw(&s))
            .unwrap_or_default(),
        progress,
        estimated_delivery,
        collaborator_ids: collaborators(raw),
        created_at: text(raw, &["created_at"]),
        deleted_at: tombstone(raw),
    })
}

impl Normalize for Task {
    fn normalize(raw: &RawRow) -> Result<Self, NormalizeError> {
        normalize_task_at(raw, Local::now().date_naive())
    }

    /// Feed rows for `tasks` never embed the join table, so the cached
    /// collaborator set survives an update of the task itself.
    fn carry_over(&mut self, previous: &Self, raw: &RawRow) {
        if !has_collaborator_columns(raw) {
            self.collaborator_ids = previous.collaborator_ids.clone();
        }
    }
}

impl Normalize for Client {
    fn normalize(raw: &RawRow) -> Result<Self, NormalizeError> {
        let table = Table::Clients;
        Ok(Client {
            id: required_id(table, raw, ID, "id")?,
            name: text(raw, NAME).unwrap_or_default(),
            logo_url: text(raw, &["logo_url", "logo", "logoUrl"]),
            active: flag(raw, ACTIVE).unwrap_or(true),
            partner_id: optional_id(raw, &["partner_id", "parceiro_id", "parent_id"]),
        })
    }
}

impl Normalize for Project {
    fn normalize(raw: &RawRow) -> Result<Self, NormalizeError> {
        let table = Table::Projects;
        Ok(Project {
            id: required_id(table, raw, ID, "id")?,
            name: text(raw, NAME).unwrap_or_default(),
            client_id: optional_id(raw, CLIENT_ID),
            status: text(raw, &["status"]).unwrap_or_default(),
            budget: number(raw, &["budget", "orcamento"]),
            start_date: date(raw, START_DATE),
            end_date: date(raw, END_DATE),
            active: flag(raw, ACTIVE).unwrap_or(true),
        })
    }
}

impl Normalize for TimesheetEntry {
    fn normalize(raw: &RawRow) -> Result<Self, NormalizeError> {
        let table = Table::Timesheets;
        Ok(TimesheetEntry {
            id: required_id(table, raw, ID, "id")?,
            user_id: required_id(table, raw, USER_ID, "user_id")?,
            client_id: optional_id(raw, CLIENT_ID),
            project_id: optional_id(raw, PROJECT_ID),
            task_id: optional_id(raw, TASK_ID),
            date: date(raw, &["date", "data", "work_date"]),
            start_time: text(raw, &["start_time", "hora_inicio"]),
            end_time: text(raw, &["end_time", "hora_fim"]),
            total_hours: number(raw, &["total_hours", "hours", "horas"]).unwrap_or(0.0),
            lunch_deduction: flag(raw, &["lunch_deduction", "desconto_almoco", "deduct_lunch"])
                .unwrap_or(false),
            description: text(raw, DESCRIPTION),
            deleted_at: tombstone(raw),
        })
    }
}

impl Normalize for ProjectMember {
    fn normalize(raw: &RawRow) -> Result<Self, NormalizeError> {
        let table = Table::ProjectMembers;
        let project_id = required_id(table, raw, PROJECT_ID, "project_id")?;
        let user_id = required_id(table, raw, USER_ID, "user_id")?;
        Ok(ProjectMember {
            key: member_key(&project_id, &user_id),
            row_id: optional_id(raw, ID),
            project_id,
            user_id,
            allocation_percentage: number(
                raw,
                &["allocation_percentage", "percentage", "percentual"],
            )
            .unwrap_or(100.0),
            start_date: date(raw, START_DATE),
            end_date: date(raw, END_DATE),
        })
    }
}

impl Normalize for Absence {
    fn normalize(raw: &RawRow) -> Result<Self, NormalizeError> {
        let table = Table::Absences;
        Ok(Absence {
            id: required_id(table, raw, ID, "id")?,
            user_id: required_id(table, raw, USER_ID, "user_id")?,
            kind: text(raw, &["type", "kind", "tipo"]).unwrap_or_default(),
            start_date: date(raw, START_DATE),
            end_date: date(raw, END_DATE),
            reason: text(raw, &["reason", "motivo"]),
            approved: flag(raw, &["approved", "aprovado"]).unwrap_or(false),
        })
    }
}

impl Normalize for Holiday {
    fn normalize(raw: &RawRow) -> Result<Self, NormalizeError> {
        let table = Table::Holidays;
        Ok(Holiday {
            id: required_id(table, raw, ID, "id")?,
            name: text(raw, NAME).unwrap_or_default(),
            date: date(raw, &["date", "data"]),
            recurring: flag(raw, &["recurring", "recorrente"]).unwrap_or(false),
        })
    }
}

impl Normalize for User {
    fn normalize(raw: &RawRow) -> Result<Self, NormalizeError> {
        let table = Table::Users;
        Ok(User {
            id: required_id(table, raw, ID, "id")?,
            name: text(raw, &["name", "nome", "full_name"]).unwrap_or_default(),
            email: text(raw, &["email"]),
            role: text(raw, &["role", "cargo"]),
            avatar_url: text(raw, &["avatar_url", "avatar"]),
            active: flag(raw, ACTIVE).unwrap_or(true),
        })
    }
}

/// How a delete event identifies the row to remove.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowKey {
    /// The collection key itself.
    Key(String),
    /// Only the surrogate row id of a composite-keyed table was sent.
    RowId(String),
}

/// Extract the identity of a row without normalizing the rest of it.
///
/// Delete events often carry only the primary key columns.
pub fn row_key(table: Table, raw: &RawRow) -> Result<RowKey, NormalizeError> {
    match table {
        Table::ProjectMembers => {
            match (optional_id(raw, PROJECT_ID), optional_id(raw, USER_ID)) {
                (Some(project_id), Some(user_id)) => {
                    Ok(RowKey::Key(member_key(&project_id, &user_id)))
                }
                _ => required_id(table, raw, ID, "id").map(RowKey::RowId),
            }
        }
        Table::TaskCollaborators => {
            let (task_id, user_id) = collaborator_pair(raw)?;
            Ok(RowKey::Key(format!("{task_id}:{user_id}")))
        }
        _ => required_id(table, raw, ID, "id").map(RowKey::Key),
    }
}

/// `(task_id, user_id)` of a task-collaborator join row.
pub fn collaborator_pair(raw: &RawRow) -> Result<(String, String), NormalizeError> {
    let table = Table::TaskCollaborators;
    Ok((
        required_id(table, raw, TASK_ID, "task_id")?,
        required_id(table, raw, USER_ID, "user_id")?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Entity;
    use serde_json::json;
    use test_case::test_case;

    fn row(value: Value) -> RawRow {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test_case("Concluída" => TaskStatus::Done)]
    #[test_case("DONE" => TaskStatus::Done)]
    #[test_case("Finalizado" => TaskStatus::Done)]
    #[test_case("Em andamento" => TaskStatus::InProgress)]
    #[test_case("in progress" => TaskStatus::InProgress)]
    #[test_case("Em execução" => TaskStatus::InProgress)]
    #[test_case("Em revisão" => TaskStatus::Review)]
    #[test_case("Bloqueada" => TaskStatus::Blocked)]
    #[test_case("A fazer" => TaskStatus::Todo)]
    #[test_case("Pendente" => TaskStatus::Todo)]
    #[test_case("" => TaskStatus::Todo)]
    #[test_case("Incompleto" => TaskStatus::Todo)]
    #[test_case("incomplete" => TaskStatus::Todo)]
    #[test_case("Desbloqueada" => TaskStatus::Todo)]
    #[test_case("Invalidada" => TaskStatus::Todo)]
    #[test_case("Não concluída" => TaskStatus::Todo)]
    #[test_case("Desbloqueada, em andamento" => TaskStatus::InProgress)]
    #[test_case("undone" => TaskStatus::Todo)]
    fn test_status_keywords(raw: &str) -> TaskStatus {
        TaskStatus::from_raw(raw)
    }

    #[test_case("Urgente" => Priority::Urgent)]
    #[test_case("Crítica" => Priority::Urgent)]
    #[test_case("Alta" => Priority::High)]
    #[test_case("low" => Priority::Low)]
    #[test_case("Média" => Priority::Medium)]
    #[test_case("whatever" => Priority::Medium)]
    fn test_priority_keywords(raw: &str) -> Priority {
        Priority::from_raw(raw)
    }

    #[test_case("Alto" => Impact::High)]
    #[test_case("baixo" => Impact::Low)]
    #[test_case("n/a" => Impact::Medium)]
    fn test_impact_keywords(raw: &str) -> Impact {
        Impact::from_raw(raw)
    }

    #[test]
    fn test_status_first_group_wins() {
        // Contains both "conclu" and "andamento"; Done is checked first.
        assert_eq!(
            TaskStatus::from_raw("andamento concluído"),
            TaskStatus::Done
        );
    }

    #[test_case("2024-03-05" => Some(day("2024-03-05")); "canonical")]
    #[test_case("2024-03-05T23:30:00Z" => Some(day("2024-03-05")); "iso timestamp truncated")]
    #[test_case("2024-03-05 08:00:00+00" => Some(day("2024-03-05")); "postgres timestamp")]
    #[test_case("05/03/2024" => Some(day("2024-03-05")); "day first")]
    #[test_case("2024/03/05" => Some(day("2024-03-05")); "slashes")]
    #[test_case("soon" => None; "garbage")]
    #[test_case("  " => None; "blank")]
    fn test_normalize_date(raw: &str) -> Option<NaiveDate> {
        normalize_date(raw)
    }

    #[test]
    fn test_days_overdue_boundaries() {
        let today = day("2024-06-10");
        assert_eq!(days_overdue(TaskStatus::InProgress, today, today), 0);
        assert_eq!(
            days_overdue(TaskStatus::InProgress, day("2024-06-09"), today),
            1
        );
        assert_eq!(days_overdue(TaskStatus::Done, day("2024-01-01"), today), 0);
        assert_eq!(days_overdue(TaskStatus::Todo, day("2024-07-01"), today), 0);
    }

    #[test]
    fn test_task_full_row() {
        let raw = row(json!({
            "id": 42,
            "title": "  Ship it ",
            "project_id": 7,
            "client_id": "3",
            "developer_id": 11,
            "status": "Em andamento",
            "prioridade": "Alta",
            "impact": "baixo",
            "progress": 140,
            "estimated_delivery": "2024-06-01T12:00:00Z",
            "task_collaborators": [{"user_id": 2}, {"user_id": 3}, {"user_id": 2}],
            "deleted_at": null
        }));
        let task = normalize_task_at(&raw, day("2024-06-03")).unwrap();

        assert_eq!(task.id, "42");
        assert_eq!(task.title, "Ship it");
        assert_eq!(task.project_id.as_deref(), Some("7"));
        assert_eq!(task.client_id.as_deref(), Some("3"));
        assert_eq!(task.developer_id.as_deref(), Some("11"));
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.priority, Priority::High);
        assert_eq!(task.impact, Impact::Low);
        assert_eq!(task.progress, 100);
        assert_eq!(task.estimated_delivery, day("2024-06-01"));
        assert_eq!(task.collaborator_ids, vec!["2".to_string(), "3".to_string()]);
        assert_eq!(task.deleted_at, None);
        assert_eq!(task.days_overdue(day("2024-06-03")), 2);
    }

    #[test]
    fn test_task_missing_delivery_defaults_to_next_week() {
        let raw = row(json!({"id": 1, "estimated_delivery": "not a date"}));
        let task = normalize_task_at(&raw, day("2024-06-03")).unwrap();
        assert_eq!(task.estimated_delivery, day("2024-06-10"));
        assert_eq!(task.days_overdue(day("2024-06-03")), 0);
    }

    #[test]
    fn test_task_negative_progress_clamped() {
        let raw = row(json!({"id": 1, "progress": "-5"}));
        let task = normalize_task_at(&raw, day("2024-06-03")).unwrap();
        assert_eq!(task.progress, 0);
    }

    #[test]
    fn test_missing_id_is_an_error() {
        let raw = row(json!({"name": "Acme"}));
        assert_eq!(
            Client::normalize(&raw),
            Err(NormalizeError::MissingField {
                table: Table::Clients,
                field: "id"
            })
        );
    }

    #[test]
    fn test_object_id_is_invalid() {
        let raw = row(json!({"id": {"nested": true}}));
        assert!(matches!(
            Client::normalize(&raw),
            Err(NormalizeError::InvalidField { field: "id", .. })
        ));
    }

    #[test]
    fn test_client_aliases() {
        let raw = row(json!({
            "id": 9,
            "nome": "Acme Ltda",
            "logo_url": "https://cdn.example.com/acme.png",
            "ativo": "nao",
            "partner_id": 2
        }));
        let client = Client::normalize(&raw).unwrap();
        assert_eq!(client.name, "Acme Ltda");
        assert!(!client.active);
        assert_eq!(client.partner_id.as_deref(), Some("2"));
    }

    #[test]
    fn test_timesheet_decimal_comma_and_flag() {
        let raw = row(json!({
            "id": 1,
            "user_id": "u-1",
            "date": "2024-05-02",
            "total_hours": "7,5",
            "lunch_deduction": 1,
            "deleted_at": "2024-05-03T10:00:00Z"
        }));
        let entry = TimesheetEntry::normalize(&raw).unwrap();
        assert_eq!(entry.total_hours, 7.5);
        assert!(entry.lunch_deduction);
        assert_eq!(entry.date, Some(day("2024-05-02")));
        assert_eq!(entry.deleted_at.as_deref(), Some("2024-05-03T10:00:00Z"));
    }

    #[test]
    fn test_project_member_composite_key() {
        let raw = row(json!({"id": 77, "project_id": 1, "user_id": 2, "percentage": 50}));
        let member = ProjectMember::normalize(&raw).unwrap();
        assert_eq!(member.key, "1:2");
        assert_eq!(member.row_id.as_deref(), Some("77"));
        assert_eq!(member.allocation_percentage, 50.0);
    }

    #[test]
    fn test_row_key_variants() {
        assert_eq!(
            row_key(Table::Tasks, &row(json!({"id": 5}))).unwrap(),
            RowKey::Key("5".to_string())
        );
        assert_eq!(
            row_key(Table::ProjectMembers, &row(json!({"project_id": 1, "user_id": 2}))).unwrap(),
            RowKey::Key("1:2".to_string())
        );
        assert_eq!(
            row_key(Table::ProjectMembers, &row(json!({"id": 77}))).unwrap(),
            RowKey::RowId("77".to_string())
        );
        assert_eq!(
            row_key(Table::ProjectMembers, &row(json!({"project_id": 1}))).unwrap_err(),
            NormalizeError::MissingField {
                table: Table::ProjectMembers,
                field: "id"
            }
        );
    }

    #[test_case(json!("2024-05-03T10:00:00Z") => Some("2024-05-03T10:00:00Z".to_string()))]
    #[test_case(json!("  ") => None)]
    #[test_case(json!(false) => None)]
    #[test_case(json!(0) => None)]
    #[test_case(json!(null) => None)]
    fn test_tombstone_requires_timestamp_string(deleted_at: Value) -> Option<String> {
        let raw = row(json!({"id": 1, "user_id": 2, "deleted_at": deleted_at}));
        let entry = TimesheetEntry::normalize(&raw).unwrap();
        assert_eq!(entry.is_tombstoned(), entry.deleted_at.is_some());
        entry.deleted_at
    }

    #[test]
    fn test_carry_over_keeps_collaborators_for_feed_rows() {
        let today = day("2024-06-03");
        let previous = normalize_task_at(
            &row(json!({"id": 5, "collaborator_ids": ["2"]})),
            today,
        )
        .unwrap();

        let feed_row = row(json!({"id": 5, "title": "renamed"}));
        let mut task = normalize_task_at(&feed_row, today).unwrap();
        task.carry_over(&previous, &feed_row);
        assert_eq!(task.collaborator_ids, vec!["2".to_string()]);

        let snapshot_row = row(json!({"id": 5, "collaborator_ids": []}));
        let mut task = normalize_task_at(&snapshot_row, today).unwrap();
        task.carry_over(&previous, &snapshot_row);
        assert!(task.collaborator_ids.is_empty());
    }
}
