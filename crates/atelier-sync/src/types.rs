//! Canonical entity types and change-feed event types.

use std::fmt;
use std::str::FromStr;

use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::SyncError;

/// A raw row as delivered by the snapshot reader or the change feed.
pub type RawRow = serde_json::Map<String, serde_json::Value>;

/// A table of the backing store that the engine reads or subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Clients,
    Projects,
    Tasks,
    Timesheets,
    ProjectMembers,
    Absences,
    Holidays,
    Users,
    /// Join table between tasks and their collaborating users.
    TaskCollaborators,
}

impl Table {
    /// The eight collections that are bulk loaded and cached.
    pub const COLLECTIONS: [Table; 8] = [
        Table::Clients,
        Table::Projects,
        Table::Tasks,
        Table::Timesheets,
        Table::ProjectMembers,
        Table::Absences,
        Table::Holidays,
        Table::Users,
    ];

    /// Every table the change feed subscribes to.
    pub const ALL: [Table; 9] = [
        Table::Clients,
        Table::Projects,
        Table::Tasks,
        Table::Timesheets,
        Table::ProjectMembers,
        Table::Absences,
        Table::Holidays,
        Table::Users,
        Table::TaskCollaborators,
    ];

    /// Storage name of the table.
    pub fn name(self) -> &'static str {
        match self {
            Table::Clients => "clients",
            Table::Projects => "projects",
            Table::Tasks => "tasks",
            Table::Timesheets => "timesheets",
            Table::ProjectMembers => "project_members",
            Table::Absences => "absences",
            Table::Holidays => "holidays",
            Table::Users => "users",
            Table::TaskCollaborators => "task_collaborators",
        }
    }

    /// Join tables only patch a list field on their parent entity.
    pub fn is_join(self) -> bool {
        matches!(self, Table::TaskCollaborators)
    }

    /// Whether rows of this table carry a `deleted_at` tombstone.
    pub fn has_tombstone(self) -> bool {
        matches!(self, Table::Tasks | Table::Timesheets)
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Table {
    type Err = SyncError;

    /// Accepts bare names and schema-qualified names (`public.tasks`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.rsplit('.').next().unwrap_or(s).trim();
        Table::ALL
            .into_iter()
            .find(|t| t.name() == name)
            .ok_or_else(|| SyncError::UnknownTable(s.to_string()))
    }
}

/// Row-level operation carried by a change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    #[serde(alias = "INSERT")]
    Insert,
    #[serde(alias = "UPDATE")]
    Update,
    #[serde(alias = "DELETE")]
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        })
    }
}

impl FromStr for Operation {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "insert" => Ok(Operation::Insert),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            _ => Err(SyncError::UnknownOperation(s.to_string())),
        }
    }
}

/// A decoded row-level notification from the change feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub table: Table,
    pub operation: Operation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_row: Option<RawRow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_row: Option<RawRow>,
}

impl ChangeEvent {
    pub fn insert(table: Table, row: RawRow) -> Self {
        Self {
            table,
            operation: Operation::Insert,
            new_row: Some(row),
            old_row: None,
        }
    }

    pub fn update(table: Table, row: RawRow) -> Self {
        Self {
            table,
            operation: Operation::Update,
            new_row: Some(row),
            old_row: None,
        }
    }

    pub fn delete(table: Table, old_row: RawRow) -> Self {
        Self {
            table,
            operation: Operation::Delete,
            new_row: None,
            old_row: Some(old_row),
        }
    }
}

/// A canonical, cacheable entity.
pub trait Entity: Clone + PartialEq + Send + Sync + 'static {
    /// The table this entity is loaded from.
    const TABLE: Table;

    /// Identity within the collection.
    fn key(&self) -> &str;

    /// Tombstone timestamp, for kinds that soft-delete.
    fn deleted_at(&self) -> Option<&str> {
        None
    }

    /// Whether the row is soft-deleted and must be hidden from read views.
    fn is_tombstoned(&self) -> bool {
        self.deleted_at().is_some_and(|t| !t.trim().is_empty())
    }

    /// Fold in fields that only a snapshot row carries, when a newer live
    /// value is kept over `snapshot`.
    fn merge_snapshot(&mut self, _snapshot: &Self) {}
}

/// Workflow status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Todo,
    InProgress,
    Review,
    Blocked,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Impact {
    Low,
    #[default]
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Client {
    pub id: String,
    pub name: String,
    pub logo_url: Option<String>,
    pub active: bool,
    /// Parent client, if this client is a partner account.
    pub partner_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    pub client_id: Option<String>,
    pub status: String,
    pub budget: Option<f64>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub project_id: Option<String>,
    pub client_id: Option<String>,
    /// Assignee.
    pub developer_id: Option<String>,
    pub status: TaskStatus,
    pub priority: Priority,
    pub impact: Impact,
    /// Percent complete, always within 0..=100.
    pub progress: u8,
    pub estimated_delivery: NaiveDate,
    /// Set of user ids; never holds duplicates.
    pub collaborator_ids: Vec<String>,
    pub created_at: Option<String>,
    #[serde(rename = "deleted_at")]
    pub deleted_at: Option<String>,
}

impl Task {
    /// Whole days past the estimated delivery, as of `today`.
    pub fn days_overdue(&self, today: NaiveDate) -> i64 {
        crate::normalize::days_overdue(self.status, self.estimated_delivery, today)
    }

    /// Whole days past the estimated delivery, as of the local calendar date.
    pub fn days_overdue_today(&self) -> i64 {
        self.days_overdue(Local::now().date_naive())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimesheetEntry {
    pub id: String,
    pub user_id: String,
    pub client_id: Option<String>,
    pub project_id: Option<String>,
    pub task_id: Option<String>,
    pub date: Option<NaiveDate>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub total_hours: f64,
    pub lunch_deduction: bool,
    pub description: Option<String>,
    #[serde(rename = "deleted_at")]
    pub deleted_at: Option<String>,
}

/// A row of the project membership join table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectMember {
    /// Composite key, see [`member_key`].
    pub key: String,
    /// Surrogate row id, when the table has one.
    pub row_id: Option<String>,
    pub project_id: String,
    pub user_id: String,
    #[serde(rename = "allocation_percentage")]
    pub allocation_percentage: f64,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

/// Composite identity of a project membership.
pub fn member_key(project_id: &str, user_id: &str) -> String {
    format!("{project_id}:{user_id}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Absence {
    pub id: String,
    pub user_id: String,
    pub kind: String,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub reason: Option<String>,
    pub approved: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Holiday {
    pub id: String,
    pub name: String,
    pub date: Option<NaiveDate>,
    pub recurring: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: Option<String>,
    pub role: Option<String>,
    pub avatar_url: Option<String>,
    pub active: bool,
}

macro_rules! impl_entity {
    ($($ty:ty => $table:ident, $key:ident);* $(;)?) => {
        $(
            impl Entity for $ty {
                const TABLE: Table = Table::$table;

                fn key(&self) -> &str {
                    &self.$key
                }
            }
        )*
    };
}

impl_entity! {
    Client => Clients, id;
    Project => Projects, id;
    ProjectMember => ProjectMembers, key;
    Absence => Absences, id;
    Holiday => Holidays, id;
    User => Users, id;
}

impl Entity for Task {
    const TABLE: Table = Table::Tasks;

    fn key(&self) -> &str {
        &self.id
    }

    fn deleted_at(&self) -> Option<&str> {
        self.deleted_at.as_deref()
    }

    /// Feed rows never embed the join table, so the snapshot's collaborator
    /// set is the starting point. Later join patches are re-applied by the store.
    fn merge_snapshot(&mut self, snapshot: &Self) {
        self.collaborator_ids = snapshot.collaborator_ids.clone();
    }
}

impl Entity for TimesheetEntry {
    const TABLE: Table = Table::Timesheets;

    fn key(&self) -> &str {
        &self.id
    }

    fn deleted_at(&self) -> Option<&str> {
        self.deleted_at.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_round_trip_names() {
        for table in Table::ALL {
            assert_eq!(table.name().parse::<Table>().unwrap(), table);
        }
    }

    #[test]
    fn test_table_schema_qualified() {
        assert_eq!("public.tasks".parse::<Table>().unwrap(), Table::Tasks);
        assert!("public.invoices".parse::<Table>().is_err());
    }

    #[test]
    fn test_operation_parse_case_insensitive() {
        assert_eq!("INSERT".parse::<Operation>().unwrap(), Operation::Insert);
        assert_eq!("Update".parse::<Operation>().unwrap(), Operation::Update);
        assert!(matches!(
            "truncate".parse::<Operation>(),
            Err(SyncError::UnknownOperation(_))
        ));
    }

    #[test]
    fn test_change_event_deserialize() {
        let json = r#"{"table":"tasks","operation":"UPDATE","newRow":{"id":5}}"#;
        let event: ChangeEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.table, Table::Tasks);
        assert_eq!(event.operation, Operation::Update);
        assert!(event.old_row.is_none());
    }

    #[test]
    fn test_tombstone_whitespace_is_not_deleted() {
        let entry = TimesheetEntry {
            id: "1".to_string(),
            user_id: "u".to_string(),
            client_id: None,
            project_id: None,
            task_id: None,
            date: None,
            start_time: None,
            end_time: None,
            total_hours: 0.0,
            lunch_deduction: false,
            description: None,
            deleted_at: Some("  ".to_string()),
        };
        assert!(!entry.is_tombstoned());
    }

    #[test]
    fn test_join_and_tombstone_tables() {
        assert!(Table::TaskCollaborators.is_join());
        assert!(!Table::Tasks.is_join());
        assert!(Table::Timesheets.has_tombstone());
        assert!(!Table::Clients.has_tombstone());
    }
}
