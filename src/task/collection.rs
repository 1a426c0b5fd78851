//! Queryable snapshot lists of tasks.

use crate::task::Task;
use std::fmt;
use std::sync::Arc;

/// A snapshot list of tasks, as returned by the chain and manager queries.
///
/// The collection holds strong references taken at query time; the
/// underlying tasks may change state (or retire) after the snapshot.
#[derive(Default, Clone)]
pub struct TaskCollection {
    tasks: Vec<Arc<Task>>,
}

impl TaskCollection {
    /// Creates an empty collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a task.
    pub fn add_task(&mut self, task: Arc<Task>) {
        self.tasks.push(task);
    }

    /// Appends every task from another collection.
    pub fn add_tasks_from(&mut self, other: &TaskCollection) {
        self.tasks.extend(other.tasks.iter().cloned());
    }

    /// Removes the first occurrence of a task. Returns whether it was
    /// present.
    pub fn remove_task(&mut self, task: &Arc<Task>) -> bool {
        match self.tasks.iter().position(|t| t.id() == task.id()) {
            Some(index) => {
                self.tasks.remove(index);
                true
            }
            None => false,
        }
    }

    /// True if the collection contains the task.
    #[must_use]
    pub fn has_task(&self, task: &Arc<Task>) -> bool {
        self.tasks.iter().any(|t| t.id() == task.id())
    }

    /// The first task with the given name, if any.
    #[must_use]
    pub fn find_task(&self, name: &str) -> Option<Arc<Task>> {
        self.tasks.iter().find(|t| t.name() == name).cloned()
    }

    /// Number of tasks in the snapshot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// True if the snapshot is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// The task at `index`, if in bounds.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Arc<Task>> {
        self.tasks.get(index)
    }

    /// Iterates over the snapshot.
    pub fn iter(&self) -> std::slice::Iter<'_, Arc<Task>> {
        self.tasks.iter()
    }
}

impl fmt::Debug for TaskCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.tasks.iter()).finish()
    }
}

impl fmt::Display for TaskCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskCollection of {} tasks", self.tasks.len())
    }
}

impl FromIterator<Arc<Task>> for TaskCollection {
    fn from_iter<I: IntoIterator<Item = Arc<Task>>>(iter: I) -> Self {
        Self {
            tasks: iter.into_iter().collect(),
        }
    }
}

impl Extend<Arc<Task>> for TaskCollection {
    fn extend<I: IntoIterator<Item = Arc<Task>>>(&mut self, iter: I) {
        self.tasks.extend(iter);
    }
}

impl IntoIterator for TaskCollection {
    type Item = Arc<Task>;
    type IntoIter = std::vec::IntoIter<Arc<Task>>;

    fn into_iter(self) -> Self::IntoIter {
        self.tasks.into_iter()
    }
}

impl<'a> IntoIterator for &'a TaskCollection {
    type Item = &'a Arc<Task>;
    type IntoIter = std::slice::Iter<'a, Arc<Task>>;

    fn into_iter(self) -> Self::IntoIter {
        self.tasks.iter()
    }
}
