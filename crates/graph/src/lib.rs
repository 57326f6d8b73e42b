//! Static dependency graph of the cluster's services.
//!
//! Startup ordering is a property of this data structure, checkable for
//! acyclicity at construction, rather than an artifact of the order some
//! script happens to list services in.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use datalab_probe::HealthProbe;
use url::Url;

/// Tier a service belongs to, deciding which bootstrap stage brings it up.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ServiceTier {
    /// Stateful foundation the rest of the cluster depends on.
    Base,

    /// Query-layer service that must not run during schema repair.
    Query,
}

/// Options for configuring `ServiceNode`.
pub struct ServiceNodeOptions {
    /// Name of the service; also the name the supervisor knows it by.
    pub name: String,

    /// Names of the services that must be ready before this one starts.
    pub depends_on: Vec<String>,

    /// The readiness probe for this service.
    pub probe: Arc<dyn HealthProbe>,

    /// Upper bound on how long to wait for readiness after starting.
    pub max_wait: Duration,

    /// The tier this service belongs to.
    pub tier: ServiceTier,

    /// Client-facing endpoint, when the service exposes one.
    pub endpoint: Option<Url>,
}

/// One service in the graph. Identity is the name.
///
/// Constructed once at orchestrator startup and consumed read-only for the
/// duration of a run.
pub struct ServiceNode {
    name: String,
    depends_on: Vec<String>,
    probe: Arc<dyn HealthProbe>,
    max_wait: Duration,
    tier: ServiceTier,
    endpoint: Option<Url>,
}

impl ServiceNode {
    /// Creates a new instance of `ServiceNode`.
    #[must_use]
    pub fn new(
        ServiceNodeOptions {
            name,
            depends_on,
            probe,
            max_wait,
            tier,
            endpoint,
        }: ServiceNodeOptions,
    ) -> Self {
        Self {
            name,
            depends_on,
            probe,
            max_wait,
            tier,
            endpoint,
        }
    }

    /// The service's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Names of the services this one depends on.
    #[must_use]
    pub fn depends_on(&self) -> &[String] {
        &self.depends_on
    }

    /// The readiness probe for this service.
    #[must_use]
    pub fn probe(&self) -> Arc<dyn HealthProbe> {
        self.probe.clone()
    }

    /// Upper bound on how long to wait for readiness after starting.
    #[must_use]
    pub const fn max_wait(&self) -> Duration {
        self.max_wait
    }

    /// The tier this service belongs to.
    #[must_use]
    pub const fn tier(&self) -> ServiceTier {
        self.tier
    }

    /// Client-facing endpoint, when the service exposes one.
    #[must_use]
    pub const fn endpoint(&self) -> Option<&Url> {
        self.endpoint.as_ref()
    }
}

/// Static, acyclic dependency graph of the cluster's services.
pub struct ServiceGraph {
    nodes: Vec<ServiceNode>,
}

impl ServiceGraph {
    /// Validates and builds the graph: names must be unique, every edge
    /// must resolve, and the result must be acyclic.
    ///
    /// # Errors
    ///
    /// Returns the first violation found.
    pub fn new(nodes: Vec<ServiceNode>) -> Result<Self, Error> {
        let mut seen: HashSet<&str> = HashSet::new();
        for node in &nodes {
            if !seen.insert(node.name()) {
                return Err(Error::DuplicateName(node.name().to_string()));
            }
        }

        for node in &nodes {
            for dependency in node.depends_on() {
                if !seen.contains(dependency.as_str()) {
                    return Err(Error::UnknownDependency {
                        node: node.name().to_string(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }

        let graph = Self { nodes };
        let placed: usize = graph.waves_where(|_| true).iter().map(Vec::len).sum();

        if placed < graph.nodes.len() {
            let ordered: HashSet<&str> = graph
                .waves_where(|_| true)
                .into_iter()
                .flatten()
                .map(ServiceNode::name)
                .collect();
            let cyclic: Vec<&str> = graph
                .nodes
                .iter()
                .map(ServiceNode::name)
                .filter(|name| !ordered.contains(name))
                .collect();

            return Err(Error::Cycle(cyclic.join(", ")));
        }

        Ok(graph)
    }

    /// All nodes, in declaration order.
    #[must_use]
    pub fn nodes(&self) -> &[ServiceNode] {
        &self.nodes
    }

    /// Looks up a node by name.
    #[must_use]
    pub fn node(&self, name: &str) -> Option<&ServiceNode> {
        self.nodes.iter().find(|node| node.name() == name)
    }

    /// Groups nodes into dependency waves: every node's dependencies live
    /// in an earlier wave, and nodes within one wave have no dependency
    /// relation, so they may be probed concurrently.
    #[must_use]
    pub fn waves(&self) -> Vec<Vec<&ServiceNode>> {
        self.waves_where(|_| true)
    }

    /// Dependency waves restricted to nodes matching the filter. Edges to
    /// nodes outside the filter are treated as already satisfied, which is
    /// how later stages build on services earlier stages brought up.
    pub fn waves_where(&self, keep: impl Fn(&ServiceNode) -> bool) -> Vec<Vec<&ServiceNode>> {
        let selected: HashSet<&str> = self
            .nodes
            .iter()
            .filter(|node| keep(node))
            .map(ServiceNode::name)
            .collect();

        let mut remaining: Vec<&ServiceNode> =
            self.nodes.iter().filter(|node| keep(node)).collect();
        let mut placed: HashSet<&str> = HashSet::new();
        let mut waves = Vec::new();

        while !remaining.is_empty() {
            let (ready, rest): (Vec<&ServiceNode>, Vec<&ServiceNode>) =
                remaining.into_iter().partition(|node| {
                    node.depends_on().iter().all(|dependency| {
                        !selected.contains(dependency.as_str())
                            || placed.contains(dependency.as_str())
                    })
                });

            if ready.is_empty() {
                // Unreachable after construction-time validation.
                break;
            }

            placed.extend(ready.iter().map(|node| node.name()));
            waves.push(ready);
            remaining = rest;
        }

        waves
    }

    /// All nodes in reverse dependency order, dependents first. This is
    /// the shutdown order.
    #[must_use]
    pub fn reverse_order(&self) -> Vec<&ServiceNode> {
        let mut ordered: Vec<&ServiceNode> = self.waves().into_iter().flatten().collect();
        ordered.reverse();
        ordered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use datalab_probe::ProbeResult;

    struct NullProbe;

    #[async_trait]
    impl HealthProbe for NullProbe {
        fn describe(&self) -> String {
            "null".to_string()
        }

        async fn check(&self) -> ProbeResult {
            ProbeResult::Ready
        }
    }

    fn node(name: &str, depends_on: &[&str], tier: ServiceTier) -> ServiceNode {
        ServiceNode::new(ServiceNodeOptions {
            name: name.to_string(),
            depends_on: depends_on.iter().map(ToString::to_string).collect(),
            probe: Arc::new(NullProbe),
            max_wait: Duration::from_secs(60),
            tier,
            endpoint: None,
        })
    }

    fn cluster() -> ServiceGraph {
        ServiceGraph::new(vec![
            node("metastore-db", &[], ServiceTier::Base),
            node("namenode", &[], ServiceTier::Base),
            node("resourcemanager", &["namenode"], ServiceTier::Query),
            node(
                "hive-metastore",
                &["metastore-db", "namenode"],
                ServiceTier::Query,
            ),
            node(
                "hiveserver2",
                &["hive-metastore", "resourcemanager"],
                ServiceTier::Query,
            ),
        ])
        .unwrap()
    }

    #[test]
    fn test_waves_respect_dependencies() {
        let graph = cluster();
        let waves: Vec<Vec<&str>> = graph
            .waves()
            .into_iter()
            .map(|wave| wave.into_iter().map(ServiceNode::name).collect())
            .collect();

        assert_eq!(
            waves,
            vec![
                vec!["metastore-db", "namenode"],
                vec!["resourcemanager", "hive-metastore"],
                vec!["hiveserver2"],
            ]
        );
    }

    #[test]
    fn test_filtered_waves_treat_outside_edges_as_satisfied() {
        let graph = cluster();
        let waves: Vec<Vec<&str>> = graph
            .waves_where(|node| node.tier() == ServiceTier::Query)
            .into_iter()
            .map(|wave| wave.into_iter().map(ServiceNode::name).collect())
            .collect();

        assert_eq!(
            waves,
            vec![
                vec!["resourcemanager", "hive-metastore"],
                vec!["hiveserver2"],
            ]
        );
    }

    #[test]
    fn test_reverse_order_puts_dependents_first() {
        let graph = cluster();
        let order: Vec<&str> = graph
            .reverse_order()
            .into_iter()
            .map(ServiceNode::name)
            .collect();

        assert_eq!(order[0], "hiveserver2");
        assert!(
            order.iter().position(|n| *n == "hive-metastore").unwrap()
                < order.iter().position(|n| *n == "metastore-db").unwrap()
        );
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let result = ServiceGraph::new(vec![
            node("namenode", &[], ServiceTier::Base),
            node("namenode", &[], ServiceTier::Base),
        ]);

        assert!(matches!(result, Err(Error::DuplicateName(name)) if name == "namenode"));
    }

    #[test]
    fn test_unknown_dependencies_are_rejected() {
        let result = ServiceGraph::new(vec![node("hiveserver2", &["ghost"], ServiceTier::Query)]);

        assert!(matches!(
            result,
            Err(Error::UnknownDependency { node, dependency })
                if node == "hiveserver2" && dependency == "ghost"
        ));
    }

    #[test]
    fn test_cycles_are_rejected() {
        let result = ServiceGraph::new(vec![
            node("a", &["b"], ServiceTier::Base),
            node("b", &["a"], ServiceTier::Base),
        ]);

        assert!(matches!(result, Err(Error::Cycle(_))));
    }
}
