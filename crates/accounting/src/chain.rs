//! Chain-entry graph over event codes.

use std::collections::{BTreeMap, BTreeSet};

use branchledger_core::EventCode;

use crate::registry::AccountingRule;

/// Directed graph `event -> next event` built from active chain-entry rules.
#[derive(Debug, Clone, Default)]
pub struct ChainGraph {
    edges: BTreeMap<EventCode, BTreeSet<EventCode>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

impl ChainGraph {
    pub fn from_rules<'a>(rules: impl IntoIterator<Item = &'a AccountingRule>) -> Self {
        let mut graph = Self::default();
        for rule in rules.into_iter().filter(|r| r.active) {
            if let Some(link) = &rule.chain {
                graph.add_edge(rule.event.clone(), link.next_event.clone());
            }
        }
        graph
    }

    pub fn add_edge(&mut self, from: EventCode, to: EventCode) {
        self.edges.entry(from).or_default().insert(to);
    }

    pub fn successors(&self, event: &EventCode) -> impl Iterator<Item = &EventCode> {
        self.edges.get(event).into_iter().flatten()
    }

    /// First cycle found, as the event path that closes it (`A -> B -> A`).
    pub fn find_cycle(&self) -> Option<Vec<EventCode>> {
        let mut marks: BTreeMap<&EventCode, Mark> = BTreeMap::new();
        for start in self.edges.keys() {
            if marks.contains_key(start) {
                continue;
            }
            let mut path: Vec<&EventCode> = Vec::new();
            if let Some(cycle) = self.visit(start, &mut marks, &mut path) {
                return Some(cycle);
            }
        }
        None
    }

    fn visit<'a>(
        &'a self,
        node: &'a EventCode,
        marks: &mut BTreeMap<&'a EventCode, Mark>,
        path: &mut Vec<&'a EventCode>,
    ) -> Option<Vec<EventCode>> {
        match marks.get(node) {
            Some(Mark::Done) => return None,
            Some(Mark::InProgress) => {
                let start = path.iter().position(|e| *e == node).unwrap_or(0);
                let mut cycle: Vec<EventCode> = path[start..].iter().map(|e| (*e).clone()).collect();
                cycle.push(node.clone());
                return Some(cycle);
            }
            None => {}
        }

        marks.insert(node, Mark::InProgress);
        path.push(node);
        for next in self.successors(node) {
            if let Some(cycle) = self.visit(next, marks, path) {
                return Some(cycle);
            }
        }
        path.pop();
        marks.insert(node, Mark::Done);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(s: &str) -> EventCode {
        s.parse().unwrap()
    }

    #[test]
    fn linear_chain_has_no_cycle() {
        let mut graph = ChainGraph::default();
        graph.add_edge(ev("A"), ev("B"));
        graph.add_edge(ev("B"), ev("C"));
        assert_eq!(graph.find_cycle(), None);
    }

    #[test]
    fn cycle_path_is_reported_in_order() {
        let mut graph = ChainGraph::default();
        graph.add_edge(ev("A"), ev("B"));
        graph.add_edge(ev("B"), ev("C"));
        graph.add_edge(ev("C"), ev("B"));
        assert_eq!(graph.find_cycle(), Some(vec![ev("B"), ev("C"), ev("B")]));
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let mut graph = ChainGraph::default();
        graph.add_edge(ev("A"), ev("A"));
        assert_eq!(graph.find_cycle(), Some(vec![ev("A"), ev("A")]));
    }
}
