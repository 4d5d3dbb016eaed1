use std::collections::{BTreeSet, HashMap, HashSet};

/// Wait-for graph over the live transactions of one pod. An edge `A -> B`
/// exists iff `A` waits for a resource `B` currently holds. Edges are stored
/// as a wait map plus a holder index so removing a node prunes everything it
/// touches in one pass.
#[derive(Debug, Default)]
pub struct WaitForGraph {
    waits: HashMap<String, String>,
    holds: HashMap<String, BTreeSet<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cycle {
    pub participants: Vec<String>,
    pub resources: BTreeSet<String>,
}

impl Cycle {
    pub fn signature(&self) -> BTreeSet<String> {
        self.participants.iter().cloned().collect()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    Gray,
    Black,
}

impl WaitForGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_wait(&mut self, txn: &str, resource: &str) {
        self.waits.insert(txn.to_string(), resource.to_string());
    }

    pub fn clear_wait(&mut self, txn: &str) {
        self.waits.remove(txn);
    }

    pub fn add_hold(&mut self, txn: &str, resource: &str) {
        self.holds
            .entry(resource.to_string())
            .or_default()
            .insert(txn.to_string());
        // A granted lock is no longer waited for.
        if self.waits.get(txn).map(String::as_str) == Some(resource) {
            self.waits.remove(txn);
        }
    }

    /// Drops the node and every edge referencing it.
    pub fn remove_txn(&mut self, txn: &str) {
        self.waits.remove(txn);
        self.holds.retain(|_, holders| {
            holders.remove(txn);
            !holders.is_empty()
        });
    }

    pub fn is_empty(&self) -> bool {
        self.waits.is_empty() && self.holds.is_empty()
    }

    fn successors(&self, txn: &str) -> Vec<&str> {
        let Some(resource) = self.waits.get(txn) else {
            return Vec::new();
        };
        self.holds
            .get(resource)
            .map(|holders| {
                holders
                    .iter()
                    .filter(|h| h.as_str() != txn)
                    .map(String::as_str)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every distinct cycle currently present, deduplicated by participant
    /// set. Waiters are the only possible cycle entry points, so the search
    /// starts there.
    pub fn find_cycles(&self) -> Vec<Cycle> {
        let mut colors: HashMap<&str, Color> = HashMap::new();
        let mut path: Vec<&str> = Vec::new();
        let mut seen: HashSet<BTreeSet<String>> = HashSet::new();
        let mut cycles = Vec::new();

        for start in self.waits.keys() {
            if !colors.contains_key(start.as_str()) {
                self.visit(start, &mut colors, &mut path, &mut seen, &mut cycles);
            }
        }
        cycles
    }

    fn visit<'a>(
        &'a self,
        node: &'a str,
        colors: &mut HashMap<&'a str, Color>,
        path: &mut Vec<&'a str>,
        seen: &mut HashSet<BTreeSet<String>>,
        cycles: &mut Vec<Cycle>,
    ) {
        colors.insert(node, Color::Gray);
        path.push(node);
        for succ in self.successors(node) {
            match colors.get(succ) {
                None => self.visit(succ, colors, path, seen, cycles),
                Some(Color::Gray) => {
                    let from = path.iter().position(|n| *n == succ).unwrap_or(0);
                    let participants: Vec<String> =
                        path[from..].iter().map(|n| n.to_string()).collect();
                    let resources: BTreeSet<String> = participants
                        .iter()
                        .filter_map(|p| self.waits.get(p))
                        .cloned()
                        .collect();
                    let cycle = Cycle {
                        participants,
                        resources,
                    };
                    if seen.insert(cycle.signature()) {
                        cycles.push(cycle);
                    }
                }
                Some(Color::Black) => {}
            }
        }
        path.pop();
        colors.insert(node, Color::Black);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_party_cycle_is_found_with_its_resources() {
        let mut graph = WaitForGraph::new();
        graph.add_hold("A", "users");
        graph.add_hold("B", "orders");
        graph.set_wait("A", "orders");
        graph.set_wait("B", "users");

        let cycles = graph.find_cycles();
        assert_eq!(cycles.len(), 1);
        assert_eq!(
            cycles[0].signature(),
            BTreeSet::from(["A".to_string(), "B".to_string()])
        );
        assert_eq!(
            cycles[0].resources,
            BTreeSet::from(["orders".to_string(), "users".to_string()])
        );
    }

    #[test]
    fn waiting_without_conflict_is_not_a_cycle() {
        let mut graph = WaitForGraph::new();
        graph.add_hold("A", "users");
        graph.set_wait("B", "users");
        assert!(graph.find_cycles().is_empty());
    }

    #[test]
    fn three_party_ring_is_one_cycle() {
        let mut graph = WaitForGraph::new();
        graph.add_hold("A", "t1");
        graph.add_hold("B", "t2");
        graph.add_hold("C", "t3");
        graph.set_wait("A", "t2");
        graph.set_wait("B", "t3");
        graph.set_wait("C", "t1");

        let cycles = graph.find_cycles();
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].participants.len(), 3);
    }

    #[test]
    fn removing_a_participant_breaks_the_cycle() {
        let mut graph = WaitForGraph::new();
        graph.add_hold("A", "users");
        graph.add_hold("B", "orders");
        graph.set_wait("A", "orders");
        graph.set_wait("B", "users");
        assert_eq!(graph.find_cycles().len(), 1);

        graph.remove_txn("B");
        assert!(graph.find_cycles().is_empty());
    }

    #[test]
    fn granting_a_waited_lock_clears_the_wait_edge() {
        let mut graph = WaitForGraph::new();
        graph.set_wait("A", "users");
        graph.add_hold("A", "users");
        assert!(graph.find_cycles().is_empty());
        // only the holder index remains
        assert!(!graph.is_empty());
        graph.remove_txn("A");
        assert!(graph.is_empty());
    }
}
