//! Credential pool for multi-key access to a rate-limited provider
//!
//! Holds an ordered ring of API keys and hands them out either round-robin
//! (a shared cursor that persists across calls) or by operation class (each
//! operation has a designated key). The pool is built once at startup,
//! validated up front, and shared by `Arc`.
//!
//! Key lifecycle:
//! 1. Startup collects key strings; blank ones are dropped
//! 2. `CredentialPool::new` validates count and operation mapping, or fails fast
//! 3. Callers take `current_credential()` or `credential_for_operation(op)`
//! 4. On a quota error the caller rotates (`rotate_on_error` / `rotate_from`)
//! 5. Every hand-out is recorded in a per-key usage counter

pub mod classes;
pub mod error;
pub mod pool;

pub use classes::{ClassMap, CredentialClass, OperationClass};
pub use error::{Error, Result};
pub use pool::{Credential, CredentialPool, PoolConfig};
