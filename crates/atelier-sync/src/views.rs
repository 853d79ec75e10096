//! Filtered read views of the cache.
//!
//! Readers never see tombstoned rows. The dispatcher owns a [`ViewPublisher`]
//! and republishes the visible rows of every collection a message touched;
//! everyone else reads through the cloneable [`Views`] handle.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::trace;

use crate::cache::{CacheStore, Collection, Stored};
use crate::types::{
    Absence, Client, Entity, Holiday, Project, ProjectMember, Table, Task, TimesheetEntry, User,
};

/// Rows of a collection that are not soft-deleted, in store order.
pub fn visible<T: Entity>(collection: &Collection<T>) -> Vec<T> {
    collection
        .iter()
        .filter(|value| !value.is_tombstoned())
        .cloned()
        .collect()
}

/// A published, immutable view of one collection.
pub type View<T> = Arc<Vec<T>>;

/// An entity kind with a published view.
pub trait Published: Stored {
    fn sender(publisher: &ViewPublisher) -> &watch::Sender<View<Self>>;
    fn receiver(views: &Views) -> &watch::Receiver<View<Self>>;
}

macro_rules! define_views {
    ($( $table:ident => $type:ty, $field:ident );* $(;)?) => {
        /// Write side of the views, owned by the dispatcher.
        pub struct ViewPublisher {
            $( $field: watch::Sender<View<$type>>, )*
            revisions: BTreeMap<Table, u64>,
        }

        /// Cloneable read handle over the published views.
        #[derive(Clone)]
        pub struct Views {
            $( $field: watch::Receiver<View<$type>>, )*
        }

        impl ViewPublisher {
            /// Create a publisher with empty views, and its read handle.
            pub fn channel() -> (Self, Views) {
                $( let $field = watch::channel(View::<$type>::default()); )*
                let publisher = Self {
                    $( $field: $field.0, )*
                    revisions: BTreeMap::new(),
                };
                let views = Views {
                    $( $field: $field.1, )*
                };
                (publisher, views)
            }

            /// Republish the view backing `table` if its collection changed.
            pub fn refresh(&mut self, store: &CacheStore, table: Table) {
                match table {
                    $( Table::$table => self.publish::<$type>(store), )*
                    Table::TaskCollaborators => self.publish::<Task>(store),
                }
            }

            /// Republish every view.
            pub fn refresh_all(&mut self, store: &CacheStore) {
                $( self.publish::<$type>(store); )*
            }
        }

        impl Views {
            /// Visible row counts per collection.
            pub fn counts(&self) -> BTreeMap<Table, usize> {
                BTreeMap::from([
                    $( (Table::$table, self.$field.borrow().len()), )*
                ])
            }
        }

        $(
            impl Published for $type {
                fn sender(publisher: &ViewPublisher) -> &watch::Sender<View<Self>> {
                    &publisher.$field
                }

                fn receiver(views: &Views) -> &watch::Receiver<View<Self>> {
                    &views.$field
                }
            }
        )*
    };
}

define_views! {
    Clients => Client, clients;
    Projects => Project, projects;
    Tasks => Task, tasks;
    Timesheets => TimesheetEntry, timesheets;
    ProjectMembers => ProjectMember, project_members;
    Absences => Absence, absences;
    Holidays => Holiday, holidays;
    Users => User, users;
}

impl ViewPublisher {
    fn publish<T: Published>(&mut self, store: &CacheStore) {
        let collection = store.collection::<T>();
        let revision = collection.revision();
        if self.revisions.get(&T::TABLE) == Some(&revision) {
            return;
        }
        self.revisions.insert(T::TABLE, revision);

        let rows = visible(collection);
        trace!(table = %T::TABLE, revision, visible = rows.len(), "publishing view");
        T::sender(self).send_replace(Arc::new(rows));
    }
}

impl Views {
    /// The current visible rows of a collection.
    pub fn current<T: Published>(&self) -> View<T> {
        T::receiver(self).borrow().clone()
    }

    /// A receiver that is notified whenever the collection's view changes.
    pub fn watch<T: Published>(&self) -> watch::Receiver<View<T>> {
        T::receiver(self).clone()
    }

    /// A visible row by key.
    pub fn find<T: Published>(&self, key: &str) -> Option<T> {
        T::receiver(self)
            .borrow()
            .iter()
            .find(|value| value.key() == key)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    fn entry(id: &str, deleted_at: Option<&str>) -> TimesheetEntry {
        TimesheetEntry {
            id: id.to_string(),
            user_id: "u1".to_string(),
            client_id: None,
            project_id: None,
            task_id: None,
            date: NaiveDate::from_ymd_opt(2024, 5, 2),
            start_time: None,
            end_time: None,
            total_hours: 8.0,
            lunch_deduction: false,
            description: None,
            deleted_at: deleted_at.map(str::to_string),
        }
    }

    #[test]
    fn test_visible_hides_tombstones() {
        let mut store = CacheStore::new();
        store.upsert(entry("1", None), 1);
        store.upsert(entry("2", Some("2024-05-03T10:00:00Z")), 2);
        store.upsert(entry("3", Some("")), 3);

        let ids: Vec<String> = visible(store.collection::<TimesheetEntry>())
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec!["1".to_string(), "3".to_string()]);
        // The raw store still has the tombstoned row.
        assert!(store.get::<TimesheetEntry>("2").is_some());
    }

    #[test]
    fn test_refresh_publishes_and_skips_unchanged() {
        let mut store = CacheStore::new();
        let (mut publisher, views) = ViewPublisher::channel();
        let mut rx = views.watch::<TimesheetEntry>();

        store.upsert(entry("1", None), 1);
        publisher.refresh(&store, Table::Timesheets);
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        publisher.refresh(&store, Table::Timesheets);
        assert!(!rx.has_changed().unwrap());

        assert_eq!(views.current::<TimesheetEntry>().len(), 1);
        assert_eq!(views.find::<TimesheetEntry>("1").map(|e| e.total_hours), Some(8.0));
        assert_eq!(views.find::<TimesheetEntry>("9"), None);
    }

    #[test]
    fn test_counts_cover_every_collection() {
        let (mut publisher, views) = ViewPublisher::channel();
        let mut store = CacheStore::new();
        store.upsert(entry("1", None), 1);
        store.upsert(entry("2", Some("2024-05-03")), 2);
        publisher.refresh_all(&store);

        let counts = views.counts();
        assert_eq!(counts.len(), 8);
        assert_eq!(counts[&Table::Timesheets], 1);
        assert_eq!(counts[&Table::Users], 0);
    }
}
