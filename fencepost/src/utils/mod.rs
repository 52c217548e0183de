pub(crate) mod scope_guard;
pub(crate) use scope_guard::ScopeGuard;

#[cfg(test)]
pub(crate) mod tracker;
#[cfg(test)]
pub(crate) use tracker::{Method, Tracker};
