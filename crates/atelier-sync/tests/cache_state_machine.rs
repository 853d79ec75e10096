//! Stateful property testing for change-event dispatch.
//!
//! Drives the real `CacheStore` through `dispatch` with raw feed rows and
//! compares it against a small reference model of the task collection. The
//! model tracks:
//!
//! - Store order (new tasks land at the front, updates keep their slot)
//! - Titles and tombstones of every cached task
//! - Collaborator sets patched in from the join table
//! - Patches parked for tasks that are not cached yet

use std::collections::VecDeque;

use proptest::prelude::*;
use proptest_state_machine::{ReferenceStateMachine, StateMachineTest, prop_state_machine};
use serde_json::{Value, json};

use atelier_sync::{
    CacheStore, ChangeEvent, Entity, Envelope, RawRow, SeqClock, Table, Task, apply, dispatch,
    visible,
};

const TASK_IDS: u8 = 4;
const USER_IDS: u8 = 3;

fn row(value: Value) -> RawRow {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

fn task_id(n: u8) -> String {
    format!("t{n}")
}

fn user_id(n: u8) -> String {
    format!("u{n}")
}

/// Operations a change feed can deliver.
#[derive(Debug, Clone)]
pub enum FeedOperation {
    /// Insert or update a task row. Feed rows never carry collaborators.
    WriteTask { task: u8, title: u8, tombstoned: bool },
    /// Hard-delete a task row.
    DeleteTask { task: u8 },
    /// Insert a collaborator join row.
    AddCollaborator { task: u8, user: u8 },
    /// Delete a collaborator join row.
    RemoveCollaborator { task: u8, user: u8 },
    /// Deliver the previous event a second time.
    Redeliver,
    /// Reload tasks from a snapshot of what the server currently holds.
    Reload,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskModel {
    pub id: String,
    pub title: String,
    pub tombstoned: bool,
    pub collaborators: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct ParkedModel {
    pub task: String,
    pub user: String,
    pub add: bool,
}

/// Reference model of the task collection.
#[derive(Clone, Debug, Default)]
pub struct TaskCacheModel {
    /// Cached tasks in store order.
    pub tasks: Vec<TaskModel>,
    /// Relationship patches waiting for their task.
    pub parked: VecDeque<ParkedModel>,
    /// The last event delivered, for redelivery.
    pub last: Option<FeedOperation>,
}

impl TaskCacheModel {
    fn position(&self, id: &str) -> Option<usize> {
        self.tasks.iter().position(|t| t.id == id)
    }

    fn patch(&mut self, task: &str, user: &str, add: bool) {
        let Some(index) = self.position(task) else {
            self.parked.push_back(ParkedModel {
                task: task.to_string(),
                user: user.to_string(),
                add,
            });
            return;
        };
        let collaborators = &mut self.tasks[index].collaborators;
        if add {
            if !collaborators.iter().any(|u| u == user) {
                collaborators.push(user.to_string());
            }
        } else {
            collaborators.retain(|u| u != user);
        }
    }
}

impl ReferenceStateMachine for TaskCacheModel {
    type State = Self;
    type Transition = FeedOperation;

    fn init_state() -> BoxedStrategy<Self::State> {
        Just(Self::default()).boxed()
    }

    fn transitions(_state: &Self::State) -> BoxedStrategy<Self::Transition> {
        prop_oneof![
            4 => (0..TASK_IDS, 0u8..3, prop::bool::weighted(0.2)).prop_map(
                |(task, title, tombstoned)| FeedOperation::WriteTask { task, title, tombstoned }
            ),
            1 => (0..TASK_IDS).prop_map(|task| FeedOperation::DeleteTask { task }),
            3 => (0..TASK_IDS, 0..USER_IDS)
                .prop_map(|(task, user)| FeedOperation::AddCollaborator { task, user }),
            2 => (0..TASK_IDS, 0..USER_IDS)
                .prop_map(|(task, user)| FeedOperation::RemoveCollaborator { task, user }),
            1 => Just(FeedOperation::Redeliver),
            1 => Just(FeedOperation::Reload),
        ]
        .boxed()
    }

    fn apply(mut state: Self::State, transition: &Self::Transition) -> Self::State {
        match transition {
            FeedOperation::WriteTask {
                task,
                title,
                tombstoned,
            } => {
                let id = task_id(*task);
                let title = format!("Task {task} v{title}");
                match state.position(&id) {
                    Some(index) => {
                        let cached = &mut state.tasks[index];
                        cached.title = title;
                        cached.tombstoned = *tombstoned;
                    }
                    None => {
                        state.tasks.insert(
                            0,
                            TaskModel {
                                id: id.clone(),
                                title,
                                tombstoned: *tombstoned,
                                collaborators: Vec::new(),
                            },
                        );
                        let (ready, waiting): (VecDeque<_>, VecDeque<_>) =
                            std::mem::take(&mut state.parked)
                                .into_iter()
                                .partition(|p| p.task == id);
                        state.parked = waiting;
                        for patch in ready {
                            state.patch(&patch.task, &patch.user, patch.add);
                        }
                    }
                }
            }
            FeedOperation::DeleteTask { task } => {
                let id = task_id(*task);
                state.tasks.retain(|t| t.id != id);
                state.parked.retain(|p| p.task != id);
            }
            FeedOperation::AddCollaborator { task, user } => {
                state.patch(&task_id(*task), &user_id(*user), true);
            }
            FeedOperation::RemoveCollaborator { task, user } => {
                state.patch(&task_id(*task), &user_id(*user), false);
            }
            FeedOperation::Redeliver => {
                return match state.last.clone() {
                    Some(last) => Self::apply(state, &last),
                    None => state,
                };
            }
            // A fresh snapshot of the server holds exactly what the cache
            // already converged to.
            FeedOperation::Reload => return state,
        }
        state.last = Some(transition.clone());
        state
    }

    fn preconditions(state: &Self::State, transition: &Self::Transition) -> bool {
        match transition {
            FeedOperation::Redeliver => state.last.is_some(),
            _ => true,
        }
    }
}

/// Test harness that feeds raw events into a real `CacheStore`.
pub struct DispatchHarness {
    store: CacheStore,
    clock: SeqClock,
    last: Option<ChangeEvent>,
}

impl DispatchHarness {
    fn new() -> Self {
        Self {
            store: CacheStore::new(),
            clock: SeqClock::new(),
            last: None,
        }
    }

    fn deliver(&mut self, event: ChangeEvent) {
        let seq = self.clock.tick();
        dispatch(&mut self.store, &event, seq);
        self.last = Some(event);
    }

    fn apply_operation(&mut self, op: &FeedOperation, model: &TaskCacheModel) {
        match op {
            FeedOperation::WriteTask {
                task,
                title,
                tombstoned,
            } => {
                let id = task_id(*task);
                let mut raw = json!({
                    "id": id,
                    "title": format!("Task {task} v{title}"),
                    "status": "todo",
                });
                if *tombstoned {
                    raw["deleted_at"] = json!("2024-06-01T12:00:00Z");
                }
                let event = if self.store.get::<Task>(&id).is_some() {
                    ChangeEvent::update(Table::Tasks, row(raw))
                } else {
                    ChangeEvent::insert(Table::Tasks, row(raw))
                };
                self.deliver(event);
            }
            FeedOperation::DeleteTask { task } => {
                let event = ChangeEvent::delete(Table::Tasks, row(json!({"id": task_id(*task)})));
                self.deliver(event);
            }
            FeedOperation::AddCollaborator { task, user } => {
                let raw = json!({"task_id": task_id(*task), "user_id": user_id(*user)});
                self.deliver(ChangeEvent::insert(Table::TaskCollaborators, row(raw)));
            }
            FeedOperation::RemoveCollaborator { task, user } => {
                let raw = json!({"task_id": task_id(*task), "user_id": user_id(*user)});
                self.deliver(ChangeEvent::delete(Table::TaskCollaborators, row(raw)));
            }
            FeedOperation::Redeliver => {
                if let Some(event) = self.last.clone() {
                    self.deliver(event);
                }
            }
            FeedOperation::Reload => {
                // The server's view of the tasks, in the order they are cached.
                let rows = model
                    .tasks
                    .iter()
                    .map(|t| {
                        let mut raw = json!({
                            "id": t.id,
                            "title": t.title,
                            "task_collaborators": t
                                .collaborators
                                .iter()
                                .map(|u| json!({"user_id": u}))
                                .collect::<Vec<_>>(),
                        });
                        if t.tombstoned {
                            raw["deleted_at"] = json!("2024-06-01T12:00:00Z");
                        }
                        row(raw)
                    })
                    .collect();
                let issued_at = self.clock.tick();
                apply(
                    &mut self.store,
                    Envelope::snapshot(issued_at, Table::Tasks, Ok(rows)),
                );
            }
        }
    }

    fn verify_invariants(&self, model: &TaskCacheModel) {
        let tasks = self.store.collection::<Task>();

        let keys: Vec<&str> = tasks.iter().map(|t| t.key()).collect();
        let expected: Vec<&str> = model.tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(keys, expected, "store order diverged from the model");

        for expected in &model.tasks {
            let Some(actual) = tasks.get(&expected.id) else {
                panic!("task {} missing from the store", expected.id);
            };
            assert_eq!(actual.title, expected.title);
            assert_eq!(
                actual.is_tombstoned(),
                expected.tombstoned,
                "tombstone of {}",
                expected.id
            );
            assert_eq!(
                actual.collaborator_ids, expected.collaborators,
                "collaborators of {}",
                expected.id
            );
        }

        let shown: Vec<String> = visible(tasks).into_iter().map(|t| t.id).collect();
        let expected_shown: Vec<String> = model
            .tasks
            .iter()
            .filter(|t| !t.tombstoned)
            .map(|t| t.id.clone())
            .collect();
        assert_eq!(shown, expected_shown, "tombstoned tasks must stay hidden");

        assert_eq!(self.store.parked_patches(), model.parked.len());
    }
}

impl StateMachineTest for DispatchHarness {
    type SystemUnderTest = Self;
    type Reference = TaskCacheModel;

    fn init_test(
        _ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) -> Self::SystemUnderTest {
        Self::new()
    }

    fn apply(
        mut state: Self::SystemUnderTest,
        ref_state: &<Self::Reference as ReferenceStateMachine>::State,
        transition: <Self::Reference as ReferenceStateMachine>::Transition,
    ) -> Self::SystemUnderTest {
        // `ref_state` is the model after the transition; reloads only need
        // the rows, which a reload does not change.
        state.apply_operation(&transition, ref_state);
        state.verify_invariants(ref_state);
        state
    }

    fn check_invariants(
        state: &Self::SystemUnderTest,
        ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) {
        state.verify_invariants(ref_state);
    }
}

prop_state_machine! {
    #![proptest_config(ProptestConfig {
        cases: 200,
        max_shrink_iters: 10000,
        ..ProptestConfig::default()
    })]

    #[test]
    fn dispatch_state_machine_test(sequential 1..60 => DispatchHarness);
}

#[test]
fn test_patch_before_task_is_replayed_in_order() {
    let mut harness = DispatchHarness::new();
    let mut model = TaskCacheModel::default();

    let ops = [
        FeedOperation::AddCollaborator { task: 1, user: 0 },
        FeedOperation::AddCollaborator { task: 1, user: 2 },
        FeedOperation::RemoveCollaborator { task: 1, user: 0 },
        FeedOperation::WriteTask {
            task: 1,
            title: 0,
            tombstoned: false,
        },
    ];
    for op in &ops {
        model = <TaskCacheModel as ReferenceStateMachine>::apply(model, op);
        harness.apply_operation(op, &model);
        harness.verify_invariants(&model);
    }

    let task = harness.store.get::<Task>("t1").unwrap();
    assert_eq!(task.collaborator_ids, vec!["u2".to_string()]);
    assert_eq!(harness.store.parked_patches(), 0);
}

#[test]
fn test_delete_discards_parked_patches() {
    let mut harness = DispatchHarness::new();
    let mut model = TaskCacheModel::default();

    let ops = [
        FeedOperation::AddCollaborator { task: 2, user: 1 },
        FeedOperation::DeleteTask { task: 2 },
        FeedOperation::WriteTask {
            task: 2,
            title: 1,
            tombstoned: false,
        },
    ];
    for op in &ops {
        model = <TaskCacheModel as ReferenceStateMachine>::apply(model, op);
        harness.apply_operation(op, &model);
    }

    harness.verify_invariants(&model);
    assert!(harness.store.get::<Task>("t2").unwrap().collaborator_ids.is_empty());
}

#[test]
fn test_task_update_keeps_collaborators() {
    let mut harness = DispatchHarness::new();
    let mut model = TaskCacheModel::default();

    let ops = [
        FeedOperation::WriteTask {
            task: 0,
            title: 0,
            tombstoned: false,
        },
        FeedOperation::AddCollaborator { task: 0, user: 1 },
        FeedOperation::WriteTask {
            task: 0,
            title: 2,
            tombstoned: true,
        },
        FeedOperation::Redeliver,
    ];
    for op in &ops {
        model = <TaskCacheModel as ReferenceStateMachine>::apply(model, op);
        harness.apply_operation(op, &model);
        harness.verify_invariants(&model);
    }

    let task = harness.store.get::<Task>("t0").unwrap();
    assert_eq!(task.title, "Task 0 v2");
    assert_eq!(task.collaborator_ids, vec!["u1".to_string()]);
    assert!(visible(harness.store.collection::<Task>()).is_empty());
}
