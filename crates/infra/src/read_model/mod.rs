//! Read-model storage.
//!
//! Read models here are disposable: they are derived entirely from the
//! event stream and can be cleared and rebuilt at any time. Nothing in the
//! write path depends on them.

mod tenant_store;

pub use tenant_store::{InMemoryTenantStore, TenantStore};
