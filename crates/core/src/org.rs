//! Reporting-line graph used to expand row scopes into explicit identity sets.
//!
//! Employees live in an arena indexed by position; reporting lines are stored as index lists.
//! Every traversal is iterative and tracks visited nodes, so malformed upstream data (cycles in
//! `manager_id`, self-management, dangling managers) can never hang or overflow the stack.

use std::collections::{BTreeSet, HashMap, VecDeque};

use crate::domain::access::{RowScope, VisibleSet};
use crate::domain::employee::{Employee, EmployeeId};

#[derive(Clone, Debug, Default)]
pub struct IdentityGraph {
    nodes: Vec<Employee>,
    index: HashMap<EmployeeId, usize>,
    reports: Vec<Vec<usize>>,
}

/// One node reached from a traversal root, with its distance from the root.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Reached<'a> {
    pub employee: &'a Employee,
    pub depth: u32,
}

impl IdentityGraph {
    pub fn build(employees: Vec<Employee>) -> Self {
        let mut nodes = Vec::with_capacity(employees.len());
        let mut index = HashMap::with_capacity(employees.len());
        for employee in employees {
            // first record wins on duplicate ids
            if index.contains_key(&employee.id) {
                continue;
            }
            index.insert(employee.id, nodes.len());
            nodes.push(employee);
        }

        let mut reports = vec![Vec::new(); nodes.len()];
        for (position, employee) in nodes.iter().enumerate() {
            let Some(manager_id) = employee.manager_id else { continue };
            if manager_id == employee.id {
                continue;
            }
            if let Some(&manager_position) = index.get(&manager_id) {
                reports[manager_position].push(position);
            }
        }

        Self { nodes, index, reports }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn employee(&self, id: EmployeeId) -> Option<&Employee> {
        self.index.get(&id).map(|&position| &self.nodes[position])
    }

    pub fn employees(&self) -> impl Iterator<Item = &Employee> {
        self.nodes.iter()
    }

    pub fn direct_reports(&self, id: EmployeeId) -> Vec<&Employee> {
        self.index
            .get(&id)
            .map(|&position| self.reports[position].iter().map(|&r| &self.nodes[r]).collect())
            .unwrap_or_default()
    }

    /// Breadth-first walk from `root` (included at depth 0) down to `max_depth`.
    pub fn walk(&self, root: EmployeeId, max_depth: Option<u32>) -> Vec<Reached<'_>> {
        let Some(&start) = self.index.get(&root) else {
            return Vec::new();
        };

        let mut visited = vec![false; self.nodes.len()];
        let mut queue = VecDeque::from([(start, 0_u32)]);
        let mut reached = Vec::new();
        visited[start] = true;

        while let Some((position, depth)) = queue.pop_front() {
            reached.push(Reached { employee: &self.nodes[position], depth });
            if max_depth.is_some_and(|limit| depth >= limit) {
                continue;
            }
            for &report in &self.reports[position] {
                if !visited[report] {
                    visited[report] = true;
                    queue.push_back((report, depth + 1));
                }
            }
        }

        reached
    }

    /// The caller plus every direct and indirect report, or `None` when the caller is unknown.
    pub fn subtree(&self, root: EmployeeId) -> Option<BTreeSet<EmployeeId>> {
        if !self.index.contains_key(&root) {
            return None;
        }
        Some(self.walk(root, None).into_iter().map(|reached| reached.employee.id).collect())
    }

    /// Expands a row scope into the identities `caller` may read.
    ///
    /// Falls back to the singleton set when the caller is missing from the graph.
    pub fn expand(&self, caller: EmployeeId, scope: RowScope) -> VisibleSet {
        match scope {
            RowScope::All => VisibleSet::All,
            RowScope::OwnOnly => VisibleSet::only_self(caller),
            RowScope::OwnAndSubtree => self
                .subtree(caller)
                .map(VisibleSet::Only)
                .unwrap_or_else(|| VisibleSet::only_self(caller)),
            RowScope::DivisionOnly => {
                let (Some(me), Some(subtree)) = (self.employee(caller), self.subtree(caller)) else {
                    return VisibleSet::only_self(caller);
                };
                let division = me.division.clone();
                let mut ids: BTreeSet<EmployeeId> = subtree
                    .into_iter()
                    .filter(|id| self.employee(*id).is_some_and(|e| e.division == division))
                    .collect();
                ids.insert(caller);
                VisibleSet::Only(ids)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::IdentityGraph;
    use crate::domain::access::{RowScope, VisibleSet};
    use crate::domain::employee::{Employee, EmployeeId};

    fn employee(id: i64, manager: Option<i64>, division: &str) -> Employee {
        Employee {
            id: EmployeeId(id),
            name: format!("Employee {id}"),
            title: "Account Executive".to_string(),
            division: division.to_string(),
            unit: None,
            manager_id: manager.map(EmployeeId),
            active: true,
        }
    }

    fn ids(values: &[i64]) -> BTreeSet<EmployeeId> {
        values.iter().copied().map(EmployeeId).collect()
    }

    fn sample_graph() -> IdentityGraph {
        IdentityGraph::build(vec![
            employee(1, None, "north"),
            employee(2, Some(1), "north"),
            employee(3, Some(1), "south"),
            employee(4, Some(2), "north"),
            employee(5, Some(3), "south"),
            employee(6, None, "west"),
        ])
    }

    #[test]
    fn subtree_is_transitive_closure_of_reports() {
        let graph = sample_graph();
        assert_eq!(graph.subtree(EmployeeId(1)), Some(ids(&[1, 2, 3, 4, 5])));
        assert_eq!(graph.subtree(EmployeeId(3)), Some(ids(&[3, 5])));
        assert_eq!(graph.subtree(EmployeeId(4)), Some(ids(&[4])));
    }

    #[test]
    fn own_only_and_all_short_circuit() {
        let graph = sample_graph();
        assert_eq!(graph.expand(EmployeeId(1), RowScope::OwnOnly), VisibleSet::Only(ids(&[1])));
        assert_eq!(graph.expand(EmployeeId(1), RowScope::All), VisibleSet::All);
    }

    #[test]
    fn division_scope_intersects_subtree_with_division() {
        let graph = sample_graph();
        assert_eq!(
            graph.expand(EmployeeId(1), RowScope::DivisionOnly),
            VisibleSet::Only(ids(&[1, 2, 4]))
        );
    }

    #[test]
    fn unknown_caller_fails_closed_to_singleton() {
        let graph = sample_graph();
        assert_eq!(
            graph.expand(EmployeeId(99), RowScope::OwnAndSubtree),
            VisibleSet::Only(ids(&[99]))
        );
        assert_eq!(
            graph.expand(EmployeeId(99), RowScope::DivisionOnly),
            VisibleSet::Only(ids(&[99]))
        );
    }

    #[test]
    fn cyclic_manager_data_terminates_without_duplicates() {
        // 10 -> 11 -> 12 -> 10 forms a cycle below the caller's report 2
        let mut employees = vec![employee(1, None, "north"), employee(2, Some(1), "north")];
        employees.push(employee(10, Some(12), "north"));
        employees.push(employee(11, Some(10), "north"));
        employees.push(employee(12, Some(11), "north"));
        employees.push(employee(13, Some(2), "north"));
        employees.push(employee(14, Some(14), "north"));
        let graph = IdentityGraph::build(employees);

        assert_eq!(graph.subtree(EmployeeId(1)), Some(ids(&[1, 2, 13])));
        assert_eq!(graph.subtree(EmployeeId(10)), Some(ids(&[10, 11, 12])));
        assert_eq!(graph.subtree(EmployeeId(14)), Some(ids(&[14])));
    }

    #[test]
    fn senior_manager_with_cyclic_rows_stays_within_team_size() {
        // caller 100 manages 12 people; two rows point back up the chain
        let mut employees = vec![employee(100, Some(111), "north")];
        for id in 101..=104 {
            employees.push(employee(id, Some(100), "north"));
        }
        for id in 105..=112 {
            employees.push(employee(id, Some(101 + (id - 105) % 4), "north"));
        }
        // row 111 is a report and also the caller's manager: a two-row cycle
        let graph = IdentityGraph::build(employees);

        let visible = graph.expand(EmployeeId(100), RowScope::OwnAndSubtree);
        let count = visible.len().expect("explicit set");
        assert!(count <= 13, "resolved {count} identities");
        assert_eq!(count, 13);
        assert!(visible.contains(EmployeeId(111)));
    }

    #[test]
    fn walk_respects_depth_limit() {
        let graph = sample_graph();
        let reached = graph.walk(EmployeeId(1), Some(1));
        let depths: Vec<(i64, u32)> = reached.iter().map(|r| (r.employee.id.0, r.depth)).collect();
        assert_eq!(depths, vec![(1, 0), (2, 1), (3, 1)]);
    }
}
