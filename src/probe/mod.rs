//! Node probing: liveness, egress geolocation and renaming

pub mod cache;
pub mod convert;
pub mod descriptor;
pub mod entrance;
pub mod geo;
pub mod liveness;
pub mod models;
pub mod naming;
pub mod parser;
pub mod pipeline;
pub mod resolver;

pub use cache::{Cache, CacheEntry, MemoryCache, SqliteCache};
pub use convert::{ClashMetaConverter, NodeConverter};
pub use descriptor::{dedupe, IdentityKey, ProxyDescriptor};
pub use entrance::EntranceLocator;
pub use geo::{GeoDatabases, GeoRecord, GeoSource};
pub use liveness::{KernelLatencyProbe, LatencyConfig, LatencyOutcome, LatencyProbe};
pub use models::{NodeState, ProbeResult};
pub use naming::{NameTemplate, Namer};
pub use parser::DescriptorParser;
pub use pipeline::{Pipeline, PipelineConfig, PipelineOutput};
pub use resolver::{
    DedicatedProcessResolver, GeoResolver, MetaResolver, ResolverConfig, SharedProcessResolver,
};
