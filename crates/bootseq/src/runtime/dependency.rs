//! Service dependency resolution: topological ordering and parallel layering

use indexmap::{IndexMap, IndexSet};
use std::collections::{HashSet, VecDeque};

/// A registered service and the services it needs started first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceNode {
    /// Service name
    pub name: String,
    /// Direct dependencies, in the order they were declared
    pub dependencies: IndexSet<String>,
}

impl ServiceNode {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            dependencies: IndexSet::new(),
        }
    }
}

/// Dependency graph of named services.
///
/// Built single-threaded during registration and read-only afterwards.
/// Registration order is preserved and used as the tie-break wherever the
/// graph leaves the order open, so every query is deterministic.
#[derive(Debug, Clone, Default)]
pub struct DependencyResolver {
    services: IndexMap<String, ServiceNode>,
}

impl DependencyResolver {
    /// Create an empty resolver
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service together with its dependencies.
    ///
    /// Repeated calls for the same name merge the dependency sets. A
    /// dependency that has not been registered yet gets an empty node of its
    /// own, so services may be referenced before their own registration call.
    pub fn register_service<I, S>(&mut self, name: impl Into<String>, dependencies: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = name.into();
        let dependencies: Vec<String> = dependencies.into_iter().map(Into::into).collect();

        if !self.services.contains_key(&name) {
            self.services.insert(name.clone(), ServiceNode::new(&name));
        }

        for dep in &dependencies {
            if !self.services.contains_key(dep) {
                log::warn!(
                    "Service '{}' depends on '{}' which is not registered yet",
                    name,
                    dep
                );
                self.services.insert(dep.clone(), ServiceNode::new(dep));
            }
        }

        if let Some(node) = self.services.get_mut(&name) {
            node.dependencies.extend(dependencies.iter().cloned());
        }

        log::debug!(
            "Registered service: {}, dependencies: [{}]",
            name,
            dependencies.join(", ")
        );
    }

    /// Whether a service is known to the resolver
    pub fn contains(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    /// Number of known services
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Whether no services are registered
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Service names in registration order
    pub fn service_names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    /// Direct dependencies of a service
    pub fn dependencies(&self, name: &str) -> Option<&IndexSet<String>> {
        self.services.get(name).map(|node| &node.dependencies)
    }

    /// Services that directly depend on `name`
    pub fn dependents(&self, name: &str) -> Vec<&str> {
        self.services
            .values()
            .filter(|node| node.dependencies.contains(name))
            .map(|node| node.name.as_str())
            .collect()
    }

    /// Services in initialization order.
    ///
    /// Every dependency precedes every service that depends on it. Computed
    /// with Kahn's algorithm; services that become ready at the same time
    /// keep their registration order.
    pub fn initialization_order(&self) -> Result<Vec<String>, DependencyError> {
        log::debug!("Resolving service initialization order");

        let (sorted, unplaced) = self.kahn();
        if !unplaced.is_empty() {
            let cycle = self.cycle_members(&unplaced);
            log::error!(
                "Circular dependency detected involving services: [{}]",
                cycle.join(", ")
            );
            return Err(DependencyError::CyclicDependency(cycle));
        }

        log::info!("Service initialization order: [{}]", sorted.join(" -> "));
        Ok(sorted)
    }

    /// Shutdown order (reverse of initialization order)
    pub fn shutdown_order(&self) -> Result<Vec<String>, DependencyError> {
        let mut order = self.initialization_order()?;
        order.reverse();
        Ok(order)
    }

    /// Partition the services into layers that can start concurrently.
    ///
    /// Group `i` holds every service whose dependencies all live in groups
    /// `0..i`. Members of a group never depend on each other.
    pub fn parallel_groups(&self) -> Result<Vec<Vec<String>>, DependencyError> {
        // Fail with the precise cycle before layering
        self.initialization_order()?;

        let mut placed: HashSet<&str> = HashSet::with_capacity(self.services.len());
        let mut groups: Vec<Vec<String>> = Vec::new();

        while placed.len() < self.services.len() {
            let group: Vec<&str> = self
                .services
                .values()
                .filter(|node| !placed.contains(node.name.as_str()))
                .filter(|node| {
                    node.dependencies
                        .iter()
                        .all(|dep| placed.contains(dep.as_str()))
                })
                .map(|node| node.name.as_str())
                .collect();

            if group.is_empty() {
                let remaining: Vec<String> = self
                    .services
                    .keys()
                    .filter(|name| !placed.contains(name.as_str()))
                    .cloned()
                    .collect();
                log::error!(
                    "Circular dependency detected. Remaining services: [{}]",
                    remaining.join(", ")
                );
                return Err(DependencyError::CyclicDependency(
                    self.cycle_members(&remaining),
                ));
            }

            log::debug!("Parallel group {}: [{}]", groups.len(), group.join(", "));
            placed.extend(group.iter().copied());
            groups.push(group.into_iter().map(String::from).collect());
        }

        log::info!("Resolved {} parallel service groups", groups.len());
        Ok(groups)
    }

    /// Check the graph for cycles without failing.
    ///
    /// On failure the error lists the services caught in a cycle.
    pub fn validate_dependencies(&self) -> Result<(), Vec<String>> {
        let (_, unplaced) = self.kahn();
        if unplaced.is_empty() {
            log::info!("Service dependencies validated - no circular dependencies found");
            Ok(())
        } else {
            let cycle = self.cycle_members(&unplaced);
            log::error!("Circular dependency validation failed: [{}]", cycle.join(", "));
            Err(cycle)
        }
    }

    /// Kahn's algorithm over registration indices.
    ///
    /// Returns the sorted names and the names that could not be placed.
    fn kahn(&self) -> (Vec<String>, Vec<String>) {
        let count = self.services.len();
        let mut in_degree: Vec<usize> = vec![0; count];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); count];

        for (index, node) in self.services.values().enumerate() {
            for dep in &node.dependencies {
                if let Some(dep_index) = self.services.get_index_of(dep) {
                    in_degree[index] += 1;
                    dependents[dep_index].push(index);
                }
            }
        }

        // Start with services that have no dependencies
        let mut queue: VecDeque<usize> = (0..count).filter(|&i| in_degree[i] == 0).collect();
        let mut sorted: Vec<usize> = Vec::with_capacity(count);

        while let Some(index) = queue.pop_front() {
            sorted.push(index);
            for &dependent in &dependents[index] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push_back(dependent);
                }
            }
        }

        let placed: HashSet<usize> = sorted.iter().copied().collect();
        let name_of = |i: usize| {
            self.services
                .get_index(i)
                .map(|(name, _)| name.clone())
                .unwrap_or_default()
        };

        let unplaced = (0..count)
            .filter(|i| !placed.contains(i))
            .map(name_of)
            .collect();
        (sorted.into_iter().map(name_of).collect(), unplaced)
    }

    /// Narrow a set of unplaceable services down to those on a cycle.
    ///
    /// Services that merely sit downstream of a cycle have no dependents left
    /// in the set once the leaves are peeled off repeatedly.
    fn cycle_members(&self, unplaced: &[String]) -> Vec<String> {
        let mut remaining: IndexSet<&str> = unplaced.iter().map(String::as_str).collect();

        loop {
            let leaves: Vec<&str> = remaining
                .iter()
                .copied()
                .filter(|candidate| {
                    !remaining.iter().any(|other| {
                        self.services
                            .get(*other)
                            .is_some_and(|node| node.dependencies.contains(*candidate))
                    })
                })
                .collect();

            if leaves.is_empty() {
                break;
            }
            for leaf in leaves {
                remaining.shift_remove(leaf);
            }
        }

        if remaining.is_empty() {
            unplaced.to_vec()
        } else {
            remaining.into_iter().map(String::from).collect()
        }
    }
}

/// Errors raised while resolving the service graph
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DependencyError {
    #[error("Cyclic dependency detected involving services: {}", .0.join(", "))]
    CyclicDependency(Vec<String>),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> DependencyResolver {
        let mut resolver = DependencyResolver::new();
        resolver.register_service("a", Vec::<String>::new());
        resolver.register_service("b", ["a"]);
        resolver.register_service("c", ["a"]);
        resolver.register_service("d", ["b", "c"]);
        resolver
    }

    fn assert_dependencies_precede(resolver: &DependencyResolver) {
        let order = resolver.initialization_order().unwrap();
        assert_eq!(order.len(), resolver.len());
        for (position, name) in order.iter().enumerate() {
            for dep in resolver.dependencies(name).unwrap() {
                let dep_position = order.iter().position(|n| n == dep).unwrap();
                assert!(
                    dep_position < position,
                    "{} must come before {} in {:?}",
                    dep,
                    name,
                    order
                );
            }
        }
    }

    fn group_of(groups: &[Vec<String>], name: &str) -> usize {
        groups
            .iter()
            .position(|g| g.iter().any(|n| n == name))
            .unwrap()
    }

    #[test]
    fn test_diamond_initialization_order() {
        let resolver = diamond();
        let order = resolver.initialization_order().unwrap();

        assert_eq!(order[0], "a");
        assert_eq!(order[3], "d");
        assert!(order[1] == "b" || order[1] == "c");
        assert!(order[2] == "b" || order[2] == "c");
        assert_dependencies_precede(&resolver);
    }

    #[test]
    fn test_diamond_parallel_groups() {
        let groups = diamond().parallel_groups().unwrap();

        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0], vec!["a"]);
        let mut middle = groups[1].clone();
        middle.sort();
        assert_eq!(middle, vec!["b", "c"]);
        assert_eq!(groups[2], vec!["d"]);
    }

    #[test]
    fn test_dependencies_precede_dependents_across_shapes() {
        let mut chain = DependencyResolver::new();
        chain.register_service("z", ["y"]);
        chain.register_service("y", ["x"]);
        chain.register_service("x", ["w"]);

        let mut wide = DependencyResolver::new();
        for i in 0..8 {
            wide.register_service(format!("leaf{}", i), ["root"]);
        }
        wide.register_service("sink", (0..8).map(|i| format!("leaf{}", i)));

        let mut mixed = DependencyResolver::new();
        mixed.register_service("ui", ["cache", "theme"]);
        mixed.register_service("cache", ["database"]);
        mixed.register_service("database", ["secrets", "configuration"]);
        mixed.register_service("secrets", ["configuration"]);
        mixed.register_service("theme", ["configuration"]);
        mixed.register_service("logging", Vec::<String>::new());

        for resolver in [diamond(), chain, wide, mixed] {
            assert_dependencies_precede(&resolver);

            let groups = resolver.parallel_groups().unwrap();
            let total: usize = groups.iter().map(Vec::len).sum();
            assert_eq!(total, resolver.len());
            for group in &groups {
                for name in group {
                    for dep in resolver.dependencies(name).unwrap() {
                        assert!(group_of(&groups, dep) < group_of(&groups, name));
                    }
                }
            }
        }
    }

    #[test]
    fn test_registration_order_breaks_ties() {
        let mut resolver = DependencyResolver::new();
        resolver.register_service("logging", Vec::<String>::new());
        resolver.register_service("configuration", Vec::<String>::new());
        resolver.register_service("diagnostics", Vec::<String>::new());

        assert_eq!(
            resolver.initialization_order().unwrap(),
            vec!["logging", "configuration", "diagnostics"]
        );
    }

    #[test]
    fn test_unregistered_dependency_is_created_implicitly() {
        let mut resolver = DependencyResolver::new();
        resolver.register_service("cache", ["database"]);

        assert!(resolver.contains("database"));
        assert!(resolver.dependencies("database").unwrap().is_empty());
        assert_eq!(
            resolver.initialization_order().unwrap(),
            vec!["database", "cache"]
        );
    }

    #[test]
    fn test_register_is_idempotent_upsert() {
        let mut resolver = DependencyResolver::new();
        resolver.register_service("cache", ["database"]);
        resolver.register_service("cache", ["database", "configuration"]);
        resolver.register_service("cache", ["database"]);

        assert_eq!(resolver.len(), 3);
        let deps: Vec<&str> = resolver
            .dependencies("cache")
            .unwrap()
            .iter()
            .map(String::as_str)
            .collect();
        assert_eq!(deps, vec!["database", "configuration"]);
    }

    #[test]
    fn test_two_node_cycle() {
        let mut resolver = DependencyResolver::new();
        resolver.register_service("a", ["b"]);
        resolver.register_service("b", ["a"]);

        let mut cycle = resolver.validate_dependencies().unwrap_err();
        cycle.sort();
        assert_eq!(cycle, vec!["a", "b"]);

        assert!(matches!(
            resolver.initialization_order(),
            Err(DependencyError::CyclicDependency(_))
        ));
        assert!(matches!(
            resolver.parallel_groups(),
            Err(DependencyError::CyclicDependency(_))
        ));
    }

    #[test]
    fn test_cycle_report_excludes_downstream_services() {
        let mut resolver = DependencyResolver::new();
        resolver.register_service("base", Vec::<String>::new());
        resolver.register_service("a", ["base", "c"]);
        resolver.register_service("b", ["a"]);
        resolver.register_service("c", ["b"]);
        resolver.register_service("downstream", ["c"]);

        match resolver.initialization_order() {
            Err(DependencyError::CyclicDependency(mut names)) => {
                names.sort();
                assert_eq!(names, vec!["a", "b", "c"]);
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let mut resolver = DependencyResolver::new();
        resolver.register_service("loop", ["loop"]);

        assert_eq!(
            resolver.validate_dependencies(),
            Err(vec!["loop".to_string()])
        );
    }

    #[test]
    fn test_dependents_and_shutdown_order() {
        let resolver = diamond();

        let mut dependents = resolver.dependents("a");
        dependents.sort();
        assert_eq!(dependents, vec!["b", "c"]);

        let shutdown = resolver.shutdown_order().unwrap();
        assert_eq!(shutdown.first().map(String::as_str), Some("d"));
        assert_eq!(shutdown.last().map(String::as_str), Some("a"));
    }

    #[test]
    fn test_empty_resolver() {
        let resolver = DependencyResolver::new();
        assert!(resolver.is_empty());
        assert!(resolver.initialization_order().unwrap().is_empty());
        assert!(resolver.parallel_groups().unwrap().is_empty());
        assert!(resolver.validate_dependencies().is_ok());
    }
}
