pub mod file_backend;
mod traits;

pub use file_backend::JsonFileBackend;
pub use traits::ExecutionBackend;
#[cfg(test)]
pub use traits::MockExecutionBackend;
