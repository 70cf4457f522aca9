//! Generated wire protocol
//!
//! Two gRPC services share one proto package: `ResourceSource`, the
//! streaming protocol this process consumes from remote configuration
//! sources, and `AggregatedDiscovery`, the protocol it serves to data-plane
//! proxies. Resource bodies are opaque JSON; the control plane routes them
//! by collection without interpreting them.

#![allow(missing_docs)] // Generated code doesn't have docs

/// Generated protobuf and gRPC code for the discovery protocol
pub mod discovery {
    /// Version 1 of the discovery protocol
    pub mod v1 {
        tonic::include_proto!("trellis.discovery.v1");
    }
}

// Re-export commonly used types at the module level for convenience
pub use discovery::v1::*;
