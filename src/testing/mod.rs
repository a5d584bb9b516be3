//! Test doubles for the page runtime and the sandbox primitive
//!
//! [`InMemoryPage`] implements both [`PageContext`](crate::runtime::page::PageContext)
//! and [`NavigationSource`](crate::runtime::page::NavigationSource);
//! [`ScriptedRealmFactory`] maps source texts to Rust module bodies and
//! counts live realms so tests can assert that nothing leaks.

mod page;
mod realm;

pub use page::InMemoryPage;
pub use realm::{ModuleScope, RealmHandle, ScriptedRealm, ScriptedRealmFactory};
