pub mod error;
pub mod hash;
pub mod header;
pub mod kind;
pub mod literal;

// Re-export commonly used types
pub use error::CoreError;
pub use hash::Hash;
pub use header::{OpHeaderLiteral, StoredOpHeader};
pub use kind::{LiteralKind, OperationRecord};
pub use literal::{Dependency, Literal, OP_FLAG};
