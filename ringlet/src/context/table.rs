use crate::sqe::Request;
use crate::task::{Id, Task};
use std::collections::{HashMap, HashSet, VecDeque};

/// Every task owned by a context, indexed by where it is in its lifecycle.
///
/// A task lives in exactly one of `pending` (not started), `in_flight`
/// (suspended on its request) or `parked` (suspended on a child or a yield),
/// or in none of them while it is being resumed. Finished tasks are in none.
/// `ready` holds ids of tasks to resume on the next pass, parked ones or
/// in-flight ones that also awaited a child or yielded. Ids of tasks that
/// ran meanwhile are skipped or cause a spurious poll.
#[derive(Default)]
pub(crate) struct TaskTable {
    pending: VecDeque<Task>,
    in_flight: HashMap<Id, Task>,
    parked: HashMap<Id, Task>,
    ready: VecDeque<Id>,

    /// Requests still owned by the kernel whose task is gone.
    orphans: HashMap<Id, Request>,

    /// Tasks aborted while running, cancelled once their poll returns.
    aborting: HashSet<Id>,

    #[cfg(test)]
    in_flight_history: HashSet<Id>,
}

impl TaskTable {
    pub(crate) fn push_pending(&mut self, task: Task) {
        self.pending.push_back(task);
    }

    pub(crate) fn pop_pending(&mut self) -> Option<Task> {
        self.pending.pop_front()
    }

    pub(crate) fn insert_in_flight(&mut self, task: Task) {
        #[cfg(test)]
        self.in_flight_history.insert(task.id());

        self.in_flight.insert(task.id(), task);
    }

    pub(crate) fn insert_parked(&mut self, task: Task) {
        self.parked.insert(task.id(), task);
    }

    pub(crate) fn take_in_flight(&mut self, id: Id) -> Option<Task> {
        self.in_flight.remove(&id)
    }

    pub(crate) fn take_parked(&mut self, id: Id) -> Option<Task> {
        self.parked.remove(&id)
    }

    pub(crate) fn get_in_flight(&self, id: Id) -> Option<&Task> {
        self.in_flight.get(&id)
    }

    pub(crate) fn get_parked(&self, id: Id) -> Option<&Task> {
        self.parked.get(&id)
    }

    /// Removes a task wherever it is.
    pub(crate) fn take(&mut self, id: Id) -> Option<Task> {
        if let Some(task) = self.in_flight.remove(&id) {
            return Some(task);
        }

        if let Some(task) = self.parked.remove(&id) {
            return Some(task);
        }

        let pos = self.pending.iter().position(|task| task.id() == id)?;
        self.pending.remove(pos)
    }

    /// Records `parent` as waiting on `child`. Returns `false` when the child
    /// is not owned by this table anymore.
    pub(crate) fn link_parent(&mut self, child: Id, parent: Id) -> bool {
        let task = match self.in_flight.get_mut(&child) {
            Some(task) => Some(task),
            None => match self.parked.get_mut(&child) {
                Some(task) => Some(task),
                None => self.pending.iter_mut().find(|task| task.id() == child),
            },
        };

        match task {
            Some(task) => {
                task.set_parent(parent);
                true
            }
            None => false,
        }
    }

    pub(crate) fn push_ready(&mut self, id: Id) {
        self.ready.push_back(id);
    }

    pub(crate) fn pop_ready(&mut self) -> Option<Id> {
        self.ready.pop_front()
    }

    pub(crate) fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// No task can run without a completion first.
    pub(crate) fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.ready.is_empty()
    }

    pub(crate) fn insert_orphan(&mut self, id: Id, request: Request) {
        self.orphans.insert(id, request);
    }

    pub(crate) fn take_orphan(&mut self, id: Id) -> Option<Request> {
        self.orphans.remove(&id)
    }

    pub(crate) fn has_orphan(&self, id: Id) -> bool {
        self.orphans.contains_key(&id)
    }

    pub(crate) fn mark_aborting(&mut self, id: Id) {
        self.aborting.insert(id);
    }

    pub(crate) fn take_aborting(&mut self, id: Id) -> bool {
        self.aborting.remove(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len() + self.in_flight.len() + self.parked.len()
    }

    /// Empties the table, handing back every task and orphaned request so
    /// they can be dropped outside of any borrow.
    pub(crate) fn take_all(&mut self) -> (Vec<Task>, Vec<Request>) {
        let tasks = self
            .pending
            .drain(..)
            .chain(self.in_flight.drain().map(|(_, task)| task))
            .chain(self.parked.drain().map(|(_, task)| task))
            .collect();

        self.ready.clear();
        self.aborting.clear();

        (tasks, self.orphans.drain().map(|(_, req)| req).collect())
    }
}

#[cfg(test)]
impl TaskTable {
    pub(crate) fn was_in_flight(&self, id: Id) -> bool {
        self.in_flight_history.contains(&id)
    }

    pub(crate) fn num_orphans(&self) -> usize {
        self.orphans.len()
    }
}
