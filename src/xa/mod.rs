/// Commands recorded by XA branches.
pub mod command;
/// Per-branch state before prepare.
pub mod context;
/// Per-branch state between prepare and completion.
pub mod prepared;
/// Serialized per-branch execution of XA verbs.
pub mod processor;
/// The XA resource of a cache.
pub mod resource;
/// Command-recording facade used inside XA branches.
pub mod transactional_store;
/// Branch tables, version table and old-version guard store.
pub mod xa_store;
