use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GcError {
    #[error("out of memory while allocating {size} bytes")]
    OutOfMemory { size: usize },
    #[error("address {0:#x} is not tracked by this collector")]
    Untracked(usize),
    #[error("could not allocate a registry table of {capacity} slots")]
    RegistryAlloc { capacity: usize },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
