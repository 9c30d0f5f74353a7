//! Resource handle construction and matching.
//!
//! Action handles are deterministic composites of tenant, provider, and
//! action name with a trailing version tag, which is what lets a conflicting
//! registration recover the existing handle without a lookup.

/// Version tag the service appends to action handles.
pub const ACTION_VERSION_TAG: &str = "v1";

/// `trn:openact:{tenant}:action/{provider}/{name}@v1`
pub fn action_trn(tenant: &str, provider: &str, name: &str) -> String {
    format!("trn:openact:{tenant}:action/{provider}/{name}@{ACTION_VERSION_TAG}")
}

/// Loose ownership test for auth connection handles: the handle mentions
/// both the tenant and the provider.
pub fn connection_matches(handle: &str, tenant: &str, provider: &str) -> bool {
    handle.contains(tenant) && handle.contains(provider)
}
