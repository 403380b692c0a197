//! Dependency graph construction.
//!
//! Nodes are the resources of one stack. Edges come from explicit
//! `depends_on` entries and from `Deferred` references embedded anywhere in
//! a resource's inputs. The same ordering machinery also orders stacks by
//! their cross-stack `StackOutput` references.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};
use tracing::debug;

use crate::error::{ModelError, Result};
use crate::model::{Reference, ResourceId, Stack};

/// Acyclic dependency graph over a stack's resources.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    stack: String,
    ids: Vec<ResourceId>,
    index: HashMap<ResourceId, usize>,
    /// `deps[i]`: nodes that `i` depends on.
    deps: Vec<BTreeSet<usize>>,
    /// `rdeps[i]`: nodes that depend on `i`.
    rdeps: Vec<BTreeSet<usize>>,
    order: Vec<usize>,
}

impl DependencyGraph {
    /// Builds the graph for a stack.
    ///
    /// # Errors
    ///
    /// `UnknownResource` if a resource or exported output references an
    /// undeclared id; `CyclicDependency` if the edges form a cycle.
    pub fn build(stack: &Stack) -> Result<Self> {
        let ids: Vec<ResourceId> = stack.resources().iter().map(|r| r.id.clone()).collect();
        let index: HashMap<ResourceId, usize> = ids.iter().cloned().enumerate().map(|(i, id)| (id, i)).collect();

        let mut deps = vec![BTreeSet::new(); ids.len()];
        let mut rdeps = vec![BTreeSet::new(); ids.len()];

        for (i, resource) in stack.resources().iter().enumerate() {
            for dep in resource.all_dependencies() {
                let Some(&j) = index.get(&dep) else {
                    return Err(ModelError::UnknownResource {
                        stack: stack.name().to_string(),
                        resource: dep.to_string(),
                        referenced_by: resource.id.to_string(),
                    }
                    .into());
                };
                deps[i].insert(j);
                rdeps[j].insert(i);
            }
        }

        for (key, value) in stack.outputs() {
            for reference in value.references() {
                if let Reference::Resource { resource, .. } = reference
                    && !index.contains_key(&resource)
                {
                    return Err(ModelError::UnknownResource {
                        stack: stack.name().to_string(),
                        resource: resource.to_string(),
                        referenced_by: format!("output {key}"),
                    }
                    .into());
                }
            }
        }

        if let Some(cycle) = find_cycle(&deps) {
            let names = rotate_cycle(cycle.into_iter().map(|i| ids[i].to_string()).collect());
            return Err(ModelError::CyclicDependency { cycle: names }.into());
        }

        let order = kahn_order(&deps, &rdeps);
        debug!("Built dependency graph for stack {} with {} nodes", stack.name(), ids.len());

        Ok(Self {
            stack: stack.name().to_string(),
            ids,
            index,
            deps,
            rdeps,
            order,
        })
    }

    /// Name of the stack this graph was built from.
    #[must_use]
    pub fn stack(&self) -> &str {
        &self.stack
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Resource ids in topological order, ties broken by declaration order.
    #[must_use]
    pub fn order(&self) -> Vec<&ResourceId> {
        self.order.iter().map(|&i| &self.ids[i]).collect()
    }

    /// Position of a resource in the topological order.
    #[must_use]
    pub fn position(&self, id: &str) -> Option<usize> {
        let node = *self.index.get(id)?;
        self.order.iter().position(|&i| i == node)
    }

    /// Direct dependencies of a resource.
    #[must_use]
    pub fn dependencies(&self, id: &str) -> Vec<&ResourceId> {
        self.index
            .get(id)
            .map(|&i| self.deps[i].iter().map(|&j| &self.ids[j]).collect())
            .unwrap_or_default()
    }

    /// Resources that depend directly on `id`.
    #[must_use]
    pub fn dependents(&self, id: &str) -> Vec<&ResourceId> {
        self.index
            .get(id)
            .map(|&i| self.rdeps[i].iter().map(|&j| &self.ids[j]).collect())
            .unwrap_or_default()
    }

    /// Every resource that depends on `id`, directly or transitively.
    #[must_use]
    pub fn transitive_dependents(&self, id: &str) -> BTreeSet<ResourceId> {
        let Some(&start) = self.index.get(id) else {
            return BTreeSet::new();
        };

        let mut seen = BTreeSet::new();
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            for &next in &self.rdeps[node] {
                if seen.insert(next) {
                    stack.push(next);
                }
            }
        }
        seen.into_iter().map(|i| self.ids[i].clone()).collect()
    }
}

/// Orders stacks so that every stack comes after the stacks whose outputs
/// it reads. References to stacks outside `stacks` are ignored.
///
/// # Errors
///
/// `CyclicDependency` if stacks reference each other in a cycle.
pub fn stack_order(stacks: &[Stack]) -> Result<Vec<&Stack>> {
    stack_order_with(stacks, |_| BTreeSet::new())
}

/// Like [`stack_order`], also counting the stacks `extra` reports for each
/// stack, such as those read by its providers' settings.
///
/// # Errors
///
/// `CyclicDependency` if stacks reference each other in a cycle.
pub fn stack_order_with<F>(stacks: &[Stack], extra: F) -> Result<Vec<&Stack>>
where
    F: Fn(&Stack) -> BTreeSet<String>,
{
    let index: HashMap<&str, usize> = stacks.iter().enumerate().map(|(i, s)| (s.name(), i)).collect();
    let mut deps = vec![BTreeSet::new(); stacks.len()];
    let mut rdeps = vec![BTreeSet::new(); stacks.len()];

    for (i, stack) in stacks.iter().enumerate() {
        let mut upstreams = stack.referenced_stacks();
        upstreams.extend(extra(stack));
        upstreams.remove(stack.name());
        for upstream in upstreams {
            if let Some(&j) = index.get(upstream.as_str()) {
                deps[i].insert(j);
                rdeps[j].insert(i);
            }
        }
    }

    if let Some(cycle) = find_cycle(&deps) {
        let names = rotate_cycle(cycle.into_iter().map(|i| stacks[i].name().to_string()).collect());
        return Err(ModelError::CyclicDependency { cycle: names }.into());
    }

    Ok(kahn_order(&deps, &rdeps).into_iter().map(|i| &stacks[i]).collect())
}

/// Kahn's algorithm; ready nodes leave the queue lowest index first.
pub(crate) fn kahn_order(deps: &[BTreeSet<usize>], rdeps: &[BTreeSet<usize>]) -> Vec<usize> {
    let mut in_degree: Vec<usize> = deps.iter().map(BTreeSet::len).collect();
    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut order = Vec::with_capacity(deps.len());
    while let Some(Reverse(node)) = ready.pop() {
        order.push(node);
        for &next in &rdeps[node] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push(Reverse(next));
            }
        }
    }
    order
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

/// DFS with a recursion stack. The returned cycle follows dependency edges.
fn find_cycle(deps: &[BTreeSet<usize>]) -> Option<Vec<usize>> {
    let mut marks = vec![Mark::Unvisited; deps.len()];
    let mut path = Vec::new();

    for start in 0..deps.len() {
        if marks[start] == Mark::Unvisited
            && let Some(cycle) = visit(start, deps, &mut marks, &mut path)
        {
            return Some(cycle);
        }
    }
    None
}

fn visit(node: usize, deps: &[BTreeSet<usize>], marks: &mut [Mark], path: &mut Vec<usize>) -> Option<Vec<usize>> {
    marks[node] = Mark::OnStack;
    path.push(node);

    for &next in &deps[node] {
        match marks[next] {
            Mark::OnStack => {
                let from = path.iter().position(|&n| n == next).unwrap_or(0);
                return Some(path[from..].to_vec());
            }
            Mark::Unvisited => {
                if let Some(cycle) = visit(next, deps, marks, path) {
                    return Some(cycle);
                }
            }
            Mark::Done => {}
        }
    }

    path.pop();
    marks[node] = Mark::Done;
    None
}

/// Rotates a cycle so that its lowest element comes first.
fn rotate_cycle<T: Ord>(mut cycle: Vec<T>) -> Vec<T> {
    if let Some(min_pos) = cycle.iter().enumerate().min_by(|a, b| a.1.cmp(b.1)).map(|(i, _)| i) {
        cycle.rotate_left(min_pos);
    }
    cycle
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StackweaveError;
    use crate::model::{Inputs, Value};

    fn inputs(pairs: Vec<(&str, Value)>) -> Inputs {
        pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    fn no_deps() -> Vec<&'static str> {
        Vec::new()
    }

    #[test]
    fn test_topological_order_places_dependencies_first() {
        let mut stack = Stack::new("eks");
        stack
            .declare("aws:eks/cluster", "cluster", inputs(vec![("role", Value::deferred("role", "arn"))]), no_deps())
            .expect("declare");
        stack
            .declare("aws:iam/role", "role", Inputs::new(), no_deps())
            .expect("declare");
        stack
            .declare("aws:eks/nodegroup", "nodes", Inputs::new(), ["cluster"])
            .expect("declare");

        let graph = DependencyGraph::build(&stack).expect("build");
        let order: Vec<&str> = graph.order().iter().map(|id| id.as_str()).collect();
        assert_eq!(order, vec!["role", "cluster", "nodes"]);

        for resource in stack.resources() {
            let own = graph.position(resource.id.as_str()).expect("position");
            for dep in resource.all_dependencies() {
                assert!(graph.position(dep.as_str()).expect("dep position") < own);
            }
        }
    }

    #[test]
    fn test_ties_follow_declaration_order() {
        let mut stack = Stack::new("istio");
        for id in ["base", "istiod", "cni"] {
            stack.declare("k8s:helm/release", id, Inputs::new(), no_deps()).expect("declare");
        }

        let graph = DependencyGraph::build(&stack).expect("build");
        let order: Vec<&str> = graph.order().iter().map(|id| id.as_str()).collect();
        assert_eq!(order, vec!["base", "istiod", "cni"]);
    }

    #[test]
    fn test_nested_deferred_values_add_edges() {
        let mut stack = Stack::new("ingress");
        stack.declare("aws:acm/certificate", "cert", Inputs::new(), no_deps()).expect("declare");
        stack.declare("aws:ec2/securityGroup", "sg", Inputs::new(), no_deps()).expect("declare");
        stack
            .declare(
                "k8s:core/service",
                "lb",
                inputs(vec![(
                    "annotations",
                    Value::Map(
                        [
                            (String::from("cert"), Value::deferred("cert", "arn")),
                            (
                                String::from("groups"),
                                Value::List(vec![Value::Concat(vec![Value::deferred("sg", "id")])]),
                            ),
                        ]
                        .into_iter()
                        .collect(),
                    ),
                )]),
                no_deps(),
            )
            .expect("declare");

        let graph = DependencyGraph::build(&stack).expect("build");
        let deps: Vec<&str> = graph.dependencies("lb").iter().map(|id| id.as_str()).collect();
        assert_eq!(deps, vec!["cert", "sg"]);
        assert_eq!(graph.dependents("cert").len(), 1);
    }

    #[test]
    fn test_two_node_cycle_is_rejected() {
        let mut stack = Stack::new("loop");
        stack
            .declare("test:thing", "b", inputs(vec![("x", Value::deferred("a", "id"))]), no_deps())
            .expect("declare");
        stack.declare("test:thing", "a", Inputs::new(), ["b"]).expect("declare");

        let err = DependencyGraph::build(&stack).expect_err("cycle");
        assert_eq!(err.exit_code(), 3);
        match err {
            StackweaveError::Model(ModelError::CyclicDependency { cycle }) => {
                assert_eq!(cycle, vec![String::from("a"), String::from("b")]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_cycle_is_rotated_to_lowest_element() {
        let deps = vec![
            BTreeSet::new(),
            BTreeSet::from([2]),
            BTreeSet::from([3]),
            BTreeSet::from([1]),
        ];
        let cycle = find_cycle(&deps).expect("cycle");
        assert_eq!(rotate_cycle(cycle), vec![1, 2, 3]);
        assert_eq!(rotate_cycle(vec!["mesh", "cluster", "network"]), vec!["cluster", "network", "mesh"]);
    }

    #[test]
    fn test_unknown_dependency() {
        let mut stack = Stack::new("eks");
        stack
            .declare("aws:eks/cluster", "cluster", Inputs::new(), ["vpc"])
            .expect("declare");

        let err = DependencyGraph::build(&stack).expect_err("unknown");
        assert!(matches!(err, StackweaveError::Model(ModelError::UnknownResource { .. })));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_unknown_resource_in_output() {
        let mut stack = Stack::new("network");
        stack.export("vpcId", Value::deferred("vpc", "id"));

        let err = DependencyGraph::build(&stack).expect_err("unknown");
        assert!(matches!(err, StackweaveError::Model(ModelError::UnknownResource { .. })));
    }

    #[test]
    fn test_transitive_dependents() {
        let mut stack = Stack::new("chain");
        stack.declare("test:thing", "a", Inputs::new(), no_deps()).expect("declare");
        stack.declare("test:thing", "b", Inputs::new(), ["a"]).expect("declare");
        stack.declare("test:thing", "c", Inputs::new(), ["b"]).expect("declare");
        stack.declare("test:thing", "d", Inputs::new(), no_deps()).expect("declare");

        let graph = DependencyGraph::build(&stack).expect("build");
        let dependents: Vec<String> = graph.transitive_dependents("a").iter().map(ToString::to_string).collect();
        assert_eq!(dependents, vec!["b", "c"]);
        assert!(graph.transitive_dependents("d").is_empty());
    }

    #[test]
    fn test_stack_order_follows_stack_outputs() {
        let mut cluster = Stack::new("cluster");
        cluster
            .declare(
                "aws:eks/cluster",
                "cluster",
                inputs(vec![("vpc", Value::stack_output("network", "vpcId"))]),
                no_deps(),
            )
            .expect("declare");
        let mut mesh = Stack::new("mesh");
        mesh.export("kubeconfig", Value::stack_output("cluster", "kubeconfig"));
        let network = Stack::new("network");
        let mut external = Stack::new("dns");
        external.export("zone", Value::stack_output("legacy", "zone"));

        let stacks = vec![mesh, cluster, external, network];
        let order: Vec<&str> = stack_order(&stacks).expect("order").iter().map(|s| s.name()).collect();
        assert_eq!(order, vec!["dns", "network", "cluster", "mesh"]);
    }

    #[test]
    fn test_stack_order_counts_extra_references() {
        let mesh = Stack::new("mesh");
        let cluster = Stack::new("cluster");
        let stacks = vec![mesh, cluster];

        let plain: Vec<&str> = stack_order(&stacks).expect("order").iter().map(|s| s.name()).collect();
        assert_eq!(plain, vec!["mesh", "cluster"]);

        let reads_cluster = |s: &Stack| {
            if s.name() == "mesh" {
                BTreeSet::from([String::from("cluster"), String::from("mesh")])
            } else {
                BTreeSet::new()
            }
        };
        let order: Vec<&str> = stack_order_with(&stacks, reads_cluster)
            .expect("order")
            .iter()
            .map(|s| s.name())
            .collect();
        assert_eq!(order, vec!["cluster", "mesh"]);
    }

    #[test]
    fn test_stack_cycle() {
        let mut a = Stack::new("a");
        a.export("x", Value::stack_output("b", "x"));
        let mut b = Stack::new("b");
        b.export("x", Value::stack_output("a", "x"));

        let err = stack_order(&[a, b]).expect_err("cycle");
        assert!(matches!(err, StackweaveError::Model(ModelError::CyclicDependency { .. })));
    }
}
