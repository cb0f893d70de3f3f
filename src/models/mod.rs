pub mod product;
pub mod update;

// Re-exports for convenience
pub use product::*;
pub use update::*;
