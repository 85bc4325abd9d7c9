//! Dependency resolution over migration records
//!
//! Builds the dependency DAG, orders it with Kahn's algorithm (ties broken by
//! ascending id so the order is reproducible across runs) and answers
//! ancestor/descendant queries used to scope partial runs.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use shale_core::TargetMatch;

use super::definitions::{MigrationDirection, MigrationRecord, Plan};
use crate::error::{MigrateError, MigrateResult};

/// Validated dependency graph over a set of migrations
///
/// Construction fails on duplicate ids, unknown dependencies and cycles, so
/// every graph that exists is acyclic and closed over its dependencies.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    records: BTreeMap<String, MigrationRecord>,
    dependents: BTreeMap<String, BTreeSet<String>>,
    order: Vec<String>,
}

impl DependencyGraph {
    /// Build and validate the graph
    pub fn build(records: impl IntoIterator<Item = MigrationRecord>) -> MigrateResult<Self> {
        let mut by_id = BTreeMap::new();
        for record in records {
            let id = record.id().to_string();
            if by_id.insert(id.clone(), record).is_some() {
                return Err(MigrateError::DuplicateMigration { id });
            }
        }

        let mut dependents: BTreeMap<String, BTreeSet<String>> = by_id
            .keys()
            .map(|id| (id.clone(), BTreeSet::new()))
            .collect();

        for (id, record) in &by_id {
            for dependency in record.dependencies() {
                match dependents.get_mut(dependency) {
                    Some(children) => {
                        children.insert(id.clone());
                    }
                    None => {
                        return Err(MigrateError::UnknownDependency {
                            migration: id.clone(),
                            dependency: dependency.clone(),
                        })
                    }
                }
            }
        }

        let order = topological_sort(&by_id, &dependents)?;

        Ok(Self {
            records: by_id,
            dependents,
            order,
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&MigrationRecord> {
        self.records.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    /// All migrations in apply order
    pub fn topological_order(&self) -> Vec<&MigrationRecord> {
        self.order.iter().filter_map(|id| self.records.get(id)).collect()
    }

    /// Ids of every migration that transitively depends on `id`
    pub fn descendants(&self, id: &str) -> MigrateResult<BTreeSet<String>> {
        self.require(id)?;
        Ok(self.walk(id, |current| {
            self.dependents
                .get(current)
                .into_iter()
                .flatten()
                .cloned()
                .collect()
        }))
    }

    /// Ids of every migration `id` transitively depends on
    pub fn ancestors(&self, id: &str) -> MigrateResult<BTreeSet<String>> {
        self.require(id)?;
        Ok(self.walk(id, |current| {
            self.records
                .get(current)
                .map(|record| record.dependencies().iter().cloned().collect())
                .unwrap_or_default()
        }))
    }

    /// Resolve an operator-supplied revision to exactly one migration
    pub fn resolve_target(&self, revision: &str, mode: TargetMatch) -> MigrateResult<&MigrationRecord> {
        let candidates: Vec<&MigrationRecord> = self
            .records
            .values()
            .filter(|record| mode.matches(record.id(), revision))
            .collect();

        match candidates.as_slice() {
            [] => Err(MigrateError::NoSuchTarget {
                revision: revision.to_string(),
            }),
            [single] => Ok(*single),
            many => Err(MigrateError::AmbiguousTarget {
                revision: revision.to_string(),
                candidates: many.iter().map(|m| m.id().to_string()).collect(),
            }),
        }
    }

    /// Plan applying every migration not yet applied
    pub fn plan_apply(&self, applied: &BTreeSet<String>) -> Plan {
        let steps = self.in_order(|id| !applied.contains(id));
        let skipped = self.len() - steps.len();
        Plan::new(MigrationDirection::Up, steps, skipped)
    }

    /// Plan applying `target` and everything it depends on that is not yet applied
    pub fn plan_apply_to(&self, target: &str, applied: &BTreeSet<String>) -> MigrateResult<Plan> {
        let mut scope = self.ancestors(target)?;
        scope.insert(target.to_string());

        let steps = self.in_order(|id| scope.contains(id) && !applied.contains(id));
        let skipped = scope.len() - steps.len();
        Ok(Plan::new(MigrationDirection::Up, steps, skipped))
    }

    /// Plan rolling back every applied migration, dependents first
    pub fn plan_rollback_all(&self, applied: &BTreeSet<String>) -> Plan {
        let mut steps = self.in_order(|id| applied.contains(id));
        steps.reverse();
        let skipped = self.len() - steps.len();
        Plan::new(MigrationDirection::Down, steps, skipped)
    }

    /// Plan rolling back `target` and every applied migration that depends on it
    pub fn plan_rollback_to(&self, target: &str, applied: &BTreeSet<String>) -> MigrateResult<Plan> {
        let mut doomed = self.descendants(target)?;
        doomed.insert(target.to_string());

        let mut steps = self.in_order(|id| doomed.contains(id) && applied.contains(id));
        steps.reverse();
        let skipped = doomed.len() - steps.len();
        Ok(Plan::new(MigrationDirection::Down, steps, skipped))
    }

    fn in_order(&self, keep: impl Fn(&str) -> bool) -> Vec<MigrationRecord> {
        self.order
            .iter()
            .filter(|id| keep(id.as_str()))
            .filter_map(|id| self.records.get(id).cloned())
            .collect()
    }

    fn require(&self, id: &str) -> MigrateResult<()> {
        if self.records.contains_key(id) {
            Ok(())
        } else {
            Err(MigrateError::NoSuchTarget {
                revision: id.to_string(),
            })
        }
    }

    fn walk(&self, start: &str, next: impl Fn(&str) -> Vec<String>) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<String> = next(start).into();

        while let Some(current) = queue.pop_front() {
            if seen.insert(current.clone()) {
                queue.extend(next(&current));
            }
        }

        seen
    }
}

/// Order `records` so no migration precedes one of its dependencies
pub fn topological_order(records: &[MigrationRecord]) -> MigrateResult<Vec<MigrationRecord>> {
    let graph = DependencyGraph::build(records.iter().cloned())?;
    Ok(graph.topological_order().into_iter().cloned().collect())
}

/// Every record that transitively depends on `target`, sorted by id
pub fn descendants(target: &str, records: &[MigrationRecord]) -> MigrateResult<Vec<MigrationRecord>> {
    let graph = DependencyGraph::build(records.iter().cloned())?;
    let ids = graph.descendants(target)?;
    Ok(ids.iter().filter_map(|id| graph.get(id).cloned()).collect())
}

/// Every record `target` transitively depends on, sorted by id
pub fn ancestors(target: &str, records: &[MigrationRecord]) -> MigrateResult<Vec<MigrationRecord>> {
    let graph = DependencyGraph::build(records.iter().cloned())?;
    let ids = graph.ancestors(target)?;
    Ok(ids.iter().filter_map(|id| graph.get(id).cloned()).collect())
}

/// Kahn's algorithm with an ordered ready set
fn topological_sort(
    records: &BTreeMap<String, MigrationRecord>,
    dependents: &BTreeMap<String, BTreeSet<String>>,
) -> MigrateResult<Vec<String>> {
    let mut in_degree: BTreeMap<&str, usize> = records
        .iter()
        .map(|(id, record)| (id.as_str(), record.dependencies().len()))
        .collect();

    let mut ready: BTreeSet<&str> = in_degree
        .iter()
        .filter(|(_, &degree)| degree == 0)
        .map(|(id, _)| *id)
        .collect();

    let mut result = Vec::with_capacity(records.len());

    while let Some(current) = ready.pop_first() {
        result.push(current.to_string());

        for dependent in dependents.get(current).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                *degree -= 1;
                if *degree == 0 {
                    ready.insert(dependent.as_str());
                }
            }
        }
    }

    if result.len() != records.len() {
        let sorted: BTreeSet<&str> = result.iter().map(String::as_str).collect();
        return Err(MigrateError::Cycle {
            cycle: find_cycle(records, &sorted),
        });
    }

    Ok(result)
}

/// Find one cycle among the migrations Kahn's algorithm could not order
fn find_cycle(records: &BTreeMap<String, MigrationRecord>, sorted: &BTreeSet<&str>) -> Vec<String> {
    let mut visited = BTreeSet::new();

    for start in records.keys().filter(|id| !sorted.contains(id.as_str())) {
        let mut path = Vec::new();
        if let Some(cycle) = dfs_cycle(records, start, &mut visited, &mut path) {
            return cycle;
        }
    }

    // Unreachable for a graph Kahn's algorithm rejected
    records
        .keys()
        .filter(|id| !sorted.contains(id.as_str()))
        .cloned()
        .collect()
}

fn dfs_cycle(
    records: &BTreeMap<String, MigrationRecord>,
    current: &str,
    visited: &mut BTreeSet<String>,
    path: &mut Vec<String>,
) -> Option<Vec<String>> {
    if let Some(start) = path.iter().position(|id| id == current) {
        let mut cycle = path[start..].to_vec();
        cycle.push(current.to_string());
        return Some(cycle);
    }
    if !visited.insert(current.to_string()) {
        return None;
    }

    path.push(current.to_string());
    if let Some(record) = records.get(current) {
        for dependency in record.dependencies() {
            if let Some(cycle) = dfs_cycle(records, dependency, visited, path) {
                return Some(cycle);
            }
        }
    }
    path.pop();

    None
}
