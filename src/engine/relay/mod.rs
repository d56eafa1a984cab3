// Honyaku Engine — Backend-C: cloud relay client
//
// Bearer-authenticated HTTP to the relay that proxies cloud LLM providers.
// The coalescer deduplicates metadata reads only; translation traffic is
// never cached.

pub mod client;
pub mod coalesce;
pub mod wire;

pub use client::{RelayClient, SyncInitState, RELAY_PROVIDER_ID};
pub use coalesce::CallCoalescer;
