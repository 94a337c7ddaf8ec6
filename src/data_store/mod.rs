pub mod element;
pub mod lock_provider;
pub mod memory_store;
pub mod stored_value;
