use thiserror::Error;

/// Errors that can occur in this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// A dependency cycle prevents ordering the graph.
    #[error("dependency cycle among: {0}")]
    Cycle(String),

    /// Two nodes share a name.
    #[error("duplicate service name: {0}")]
    DuplicateName(String),

    /// A node depends on a name not present in the graph.
    #[error("{node} depends on unknown service {dependency}")]
    UnknownDependency {
        /// The node carrying the bad edge.
        node: String,

        /// The name that could not be resolved.
        dependency: String,
    },
}
