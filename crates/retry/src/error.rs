use thiserror::Error;

/// Returned when every attempt failed within the policy's budget.
///
/// Distinct from the inner error type so callers can tell "never became
/// ready" apart from a failure on a path that was otherwise reachable.
#[derive(Debug, Error)]
#[error("gave up after {attempts} attempts: {last}")]
pub struct Exhausted<E> {
    /// Number of attempts made before giving up.
    pub attempts: u32,

    /// The failure from the final attempt.
    pub last: E,
}
