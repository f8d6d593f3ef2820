/// Classification for retry policy.
///
/// Used by the source clients to decide whether a failed call is worth
/// repeating before the failure is folded into reduced coverage.
///
/// # Behavior Summary
///
/// | Class | Retry same call? | Fall through to next source? |
/// |-------|------------------|------------------------------|
/// | `Never` | No | No (precondition or caller error) |
/// | `WithBackoff` | Yes, bounded exponential backoff | Yes, once attempts run out |
/// | `NextSource` | No | Yes |
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RetryClass {
    /// Never retry - unsupported interval, malformed request, or a request
    /// that can never fit the budget. Retrying won't help.
    Never,

    /// Transient failure such as a timeout, a 429 or 5xx response, or a
    /// truncated download. Retry after a growing delay.
    WithBackoff,

    /// This source cannot serve the request but another tier might.
    /// No retry is attempted.
    NextSource,
}
