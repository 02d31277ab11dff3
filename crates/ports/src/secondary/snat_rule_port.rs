use domain::snat::entity::SnatRule;
use domain::snat::error::SnatError;

/// Secondary port for the source-rewrite rules required by full-NAT mode.
///
/// The binding owns a dedicated chain jumped to from post-routing and treats
/// the desired set handed to `reconcile` as authoritative; it performs no
/// filtering of its own.
pub trait SnatRulePort: Send + Sync {
    /// Idempotently create the custom chain and the jump rule into it.
    fn ensure_chain(&self) -> Result<(), SnatError>;

    /// Converge the installed rules onto `desired`: add missing rules,
    /// delete stale ones, and replace rules whose source address changed.
    fn reconcile(&self, desired: &[SnatRule]) -> Result<(), SnatError>;

    /// Delete all managed rules, the jump rule, and the chain itself.
    fn cleanup(&self) -> Result<(), SnatError>;
}
