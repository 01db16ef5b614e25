//! Backend client implementations

pub mod endpoint;

// Re-export for convenience
pub use endpoint::EndpointClient;
