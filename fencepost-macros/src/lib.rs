#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub
)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]

//! Macros for use with fencepost.

mod entry;
mod parse;

/// Runs a test function against a fresh `TaskManager`.
///
/// The function takes a single `&TaskManager` argument. The macro builds the
/// manager, calls the function and shuts the manager down once it returns,
/// including when the test panics.
///
/// ```ignore
/// use fencepost::TaskManager;
///
/// #[fencepost::test(worker_threads = 2)]
/// fn my_test(manager: &TaskManager) {
///     assert_eq!(manager.num_threads(), 2);
/// }
/// ```
///
/// Equivalent code not using `#[fencepost::test]`
///
/// ```ignore
/// #[test]
/// fn my_test() {
///     let manager = fencepost::runtime::Builder::new()
///         .worker_threads(2)
///         .try_build()
///         .unwrap();
///
///     assert_eq!(manager.num_threads(), 2);
/// }
/// ```
///
/// # Options
///
/// - `worker_threads = N`: number of task threads, defaults to the builder's
///   default.
/// - `idle = "yield" | "park"`: what fenced threads do between rounds.
///
/// ```ignore
/// use fencepost::TaskManager;
///
/// #[fencepost::test(worker_threads = 4, idle = "park")]
/// fn parked_workers(manager: &TaskManager) -> anyhow::Result<()> {
///     manager.execute_round()?;
///     Ok(())
/// }
/// ```
#[proc_macro_attribute]
pub fn test(
    args: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    entry::test(args.into(), item.into()).into()
}
