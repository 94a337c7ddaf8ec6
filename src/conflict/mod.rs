/// Staleness checks run when an XA branch prepares.
pub mod detection;
/// Per-key version bookkeeping shared by XA branches.
pub mod version_table;
