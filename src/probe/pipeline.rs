//! The probing pipeline
//!
//! Stages, in order:
//!
//! 1. conversion of every descriptor into a kernel node
//! 2. liveness, through one kernel carrying every convertible node
//! 3. egress geolocation of the live nodes, cache first
//! 4. renaming from the located egress
//! 5. filtering and annotation cleanup
//!
//! Output order always matches input order. Per-node failures never abort a
//! run; they end up as a terminal [`NodeState`] for that node.

use super::cache::{cache_key, Cache, CacheEntry, DEFAULT_TTL, GEO_NAMESPACE};
use super::convert::NodeConverter;
use super::descriptor::{
    IdentityKey, ProxyDescriptor, ENTRANCE_KEY, GEO_KEY, INCOMPATIBLE_KEY, LATENCY_KEY, REMOVE_KEY,
};
use super::entrance::EntranceLocator;
use super::geo::{GeoRecord, GeoSource};
use super::liveness::{LatencyOutcome, LatencyProbe};
use super::models::{NodeState, ProbeResult};
use super::naming::{NameTemplate, Namer, NamingInput};
use super::resolver::GeoResolver;
use crate::kernel::KernelNode;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Pipeline behaviour switches
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Run the liveness stage. When off every convertible node counts as alive.
    pub check_liveness: bool,
    /// Run geolocation and renaming. When off names are left untouched.
    pub resolve_geo: bool,
    pub group_by_city: bool,
    pub append_isp: bool,
    pub template: NameTemplate,
    /// Keep `_geo` on the output
    pub keep_geo: bool,
    /// Keep `_incompatible` on the output
    pub keep_incompatible: bool,
    /// Keep `_latency` on the output
    pub keep_latency: bool,
    pub remove_dead: bool,
    pub remove_incompatible: bool,
    /// Drop live nodes whose egress could not be located
    pub remove_unresolved: bool,
    /// Read failure entries as misses and never write them
    pub disable_failed_cache: bool,
    pub cache_ttl: Duration,
    pub identity: IdentityKey,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            check_liveness: true,
            resolve_geo: true,
            group_by_city: false,
            append_isp: false,
            template: NameTemplate::default(),
            keep_geo: false,
            keep_incompatible: false,
            keep_latency: false,
            remove_dead: false,
            remove_incompatible: false,
            remove_unresolved: false,
            disable_failed_cache: false,
            cache_ttl: DEFAULT_TTL,
            identity: IdentityKey::default(),
        }
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_check_liveness(mut self, enabled: bool) -> Self {
        self.check_liveness = enabled;
        self
    }

    pub fn with_resolve_geo(mut self, enabled: bool) -> Self {
        self.resolve_geo = enabled;
        self
    }

    pub fn with_group_by_city(mut self, enabled: bool) -> Self {
        self.group_by_city = enabled;
        self
    }

    pub fn with_append_isp(mut self, enabled: bool) -> Self {
        self.append_isp = enabled;
        self
    }

    pub fn with_template(mut self, template: NameTemplate) -> Self {
        self.template = template;
        self
    }

    pub fn with_keep_geo(mut self, keep: bool) -> Self {
        self.keep_geo = keep;
        self
    }

    pub fn with_keep_incompatible(mut self, keep: bool) -> Self {
        self.keep_incompatible = keep;
        self
    }

    pub fn with_keep_latency(mut self, keep: bool) -> Self {
        self.keep_latency = keep;
        self
    }

    pub fn with_remove_dead(mut self, remove: bool) -> Self {
        self.remove_dead = remove;
        self
    }

    pub fn with_remove_incompatible(mut self, remove: bool) -> Self {
        self.remove_incompatible = remove;
        self
    }

    pub fn with_remove_unresolved(mut self, remove: bool) -> Self {
        self.remove_unresolved = remove;
        self
    }

    pub fn with_disable_failed_cache(mut self, disable: bool) -> Self {
        self.disable_failed_cache = disable;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_identity(mut self, identity: IdentityKey) -> Self {
        self.identity = identity;
        self
    }
}

/// Descriptors after a run, with the outcome of every input node
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    /// Filtered and renamed descriptors, in input order
    pub descriptors: Vec<ProxyDescriptor>,
    /// One result per input descriptor, in input order
    pub results: Vec<ProbeResult>,
    /// Whether the liveness kernel was unavailable and the input was returned
    /// as is
    pub failed_open: bool,
}

/// Egress geolocation: who answers, and what they are asked
struct GeoStage {
    resolver: Arc<dyn GeoResolver>,
    source: GeoSource,
}

pub struct Pipeline {
    config: PipelineConfig,
    converter: Arc<dyn NodeConverter>,
    latency: Option<Arc<dyn LatencyProbe>>,
    geo: Option<GeoStage>,
    cache: Option<Arc<dyn Cache>>,
    entrance: Option<EntranceLocator>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, converter: Arc<dyn NodeConverter>) -> Self {
        Self {
            config,
            converter,
            latency: None,
            geo: None,
            cache: None,
            entrance: None,
        }
    }

    pub fn with_latency_probe(mut self, probe: Arc<dyn LatencyProbe>) -> Self {
        self.latency = Some(probe);
        self
    }

    pub fn with_geo(mut self, resolver: Arc<dyn GeoResolver>, source: GeoSource) -> Self {
        self.geo = Some(GeoStage { resolver, source });
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Annotate descriptors with `_entrance`, which is then kept on the output.
    pub fn with_entrance(mut self, locator: EntranceLocator) -> Self {
        self.entrance = Some(locator);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn run(&self, descriptors: Vec<ProxyDescriptor>) -> Vec<ProxyDescriptor> {
        self.run_detailed(descriptors).await.descriptors
    }

    pub async fn run_detailed(&self, mut descriptors: Vec<ProxyDescriptor>) -> PipelineOutput {
        info!(total = descriptors.len(), "pipeline started");
        // Annotations on the input belong to an earlier run.
        for descriptor in descriptors.iter_mut() {
            descriptor.strip_annotations(&[]);
        }
        let mut results = vec![ProbeResult::default(); descriptors.len()];

        // Stage 1
        let nodes = self.convert(&mut descriptors, &mut results);

        // Stage 3 reads the cache before anything is started, so a fully
        // cached batch without liveness testing never needs a kernel.
        let cached = match self.geo_stage() {
            Some(stage) => self.read_cache(&descriptors, &nodes, &stage.source).await,
            None => HashMap::new(),
        };

        // Stage 2
        let live: Vec<&KernelNode> = match (&self.latency, self.config.check_liveness) {
            (Some(probe), true) => {
                let original = descriptors.clone();
                match self.measure(&**probe, &nodes, &mut descriptors, &mut results).await {
                    Some(live) => live,
                    None => {
                        error!("liveness kernel unavailable, returning the input unchanged");
                        let mut original = original;
                        for descriptor in original.iter_mut() {
                            descriptor.strip_annotations(&[]);
                        }
                        return PipelineOutput {
                            descriptors: original,
                            results,
                            failed_open: true,
                        };
                    }
                }
            }
            _ => {
                for node in &nodes {
                    results[node.index].state = NodeState::Alive;
                }
                nodes.iter().collect()
            }
        };

        // Stages 3 and 4
        if let Some(stage) = self.geo_stage() {
            self.locate(stage, &live, &cached, &mut descriptors, &mut results)
                .await;
            self.rename(&live, &mut descriptors, &results);
        }

        if let Some(locator) = &self.entrance {
            locator.annotate(&mut descriptors).await;
        }

        // Stage 5
        let descriptors = self.finish(descriptors, &results);
        info!(
            output = descriptors.len(),
            alive = results.iter().filter(|r| r.alive()).count(),
            "pipeline finished"
        );
        PipelineOutput {
            descriptors,
            results,
            failed_open: false,
        }
    }

    fn geo_stage(&self) -> Option<&GeoStage> {
        self.geo.as_ref().filter(|_| self.config.resolve_geo)
    }

    fn convert(&self, descriptors: &mut [ProxyDescriptor], results: &mut [ProbeResult]) -> Vec<KernelNode> {
        let mut nodes = Vec::new();
        for (index, descriptor) in descriptors.iter_mut().enumerate() {
            match self.converter.convert(index, descriptor) {
                Some(node) => {
                    results[index] = ProbeResult::converted();
                    nodes.push(node);
                }
                None => {
                    debug!(name = descriptor.name(), "incompatible node");
                    results[index] = ProbeResult::incompatible();
                    descriptor.mark(INCOMPATIBLE_KEY);
                }
            }
        }
        info!(
            converted = nodes.len(),
            incompatible = descriptors.len() - nodes.len(),
            "conversion finished"
        );
        nodes
    }

    /// Best delay per node. `None` when the kernel was unavailable.
    async fn measure<'n>(
        &self,
        probe: &dyn LatencyProbe,
        nodes: &'n [KernelNode],
        descriptors: &mut [ProxyDescriptor],
        results: &mut [ProbeResult],
    ) -> Option<Vec<&'n KernelNode>> {
        let delays = match probe.measure(nodes).await {
            LatencyOutcome::KernelUnavailable => return None,
            LatencyOutcome::Measured(delays) => delays,
        };

        let mut live = Vec::new();
        for (node, delay) in nodes.iter().zip(delays) {
            let descriptor = &mut descriptors[node.index];
            results[node.index].measured(delay);
            match delay {
                Some(ms) => {
                    debug!(name = descriptor.name(), id = %node.id, latency_ms = ms, "alive");
                    descriptor.insert(LATENCY_KEY, Value::from(ms));
                    live.push(node);
                }
                None => {
                    debug!(name = descriptor.name(), id = %node.id, "dead");
                    descriptor.mark(REMOVE_KEY);
                }
            }
        }
        info!(alive = live.len(), total = nodes.len(), "liveness finished");
        Some(live)
    }

    fn geo_key(&self, descriptor: &ProxyDescriptor, source: &GeoSource) -> String {
        cache_key(
            GEO_NAMESPACE,
            &source.cache_tag(),
            &self.config.identity.extract(descriptor),
        )
    }

    /// Cached outcome per node index. A failure entry maps to `None`.
    async fn read_cache(
        &self,
        descriptors: &[ProxyDescriptor],
        nodes: &[KernelNode],
        source: &GeoSource,
    ) -> HashMap<usize, Option<GeoRecord>> {
        let mut hits = HashMap::new();
        let Some(cache) = &self.cache else {
            return hits;
        };
        for node in nodes {
            let descriptor = &descriptors[node.index];
            let key = self.geo_key(descriptor, source);
            match cache.get(&key).await {
                Ok(Some(CacheEntry::Resolved(geo))) => {
                    debug!(name = descriptor.name(), "geolocation cache hit");
                    hits.insert(node.index, Some(geo));
                }
                Ok(Some(CacheEntry::Failed)) if !self.config.disable_failed_cache => {
                    debug!(name = descriptor.name(), "cached geolocation failure");
                    hits.insert(node.index, None);
                }
                Ok(_) => {}
                Err(e) => warn!(name = descriptor.name(), error = %e, "cache read failed"),
            }
        }
        hits
    }

    async fn locate(
        &self,
        stage: &GeoStage,
        live: &[&KernelNode],
        cached: &HashMap<usize, Option<GeoRecord>>,
        descriptors: &mut [ProxyDescriptor],
        results: &mut [ProbeResult],
    ) {
        let mut misses = Vec::new();
        for node in live {
            match cached.get(&node.index) {
                Some(geo) => {
                    results[node.index].located(geo.clone());
                    results[node.index].cached = true;
                }
                None => misses.push((*node).clone()),
            }
        }

        if !misses.is_empty() {
            info!(
                resolver = stage.resolver.name(),
                nodes = misses.len(),
                cached = live.len() - misses.len(),
                "resolving egress"
            );
            let resolved = stage.resolver.resolve(&misses, &stage.source).await;
            for (i, node) in misses.iter().enumerate() {
                let geo = resolved.get(i).cloned().flatten();
                self.write_cache(&descriptors[node.index], &stage.source, geo.as_ref())
                    .await;
                results[node.index].located(geo);
            }
        }

        for node in live {
            let descriptor = &mut descriptors[node.index];
            let Some(geo) = &results[node.index].geo else {
                continue;
            };
            debug!(name = descriptor.name(), geo = %geo, "located");
            match serde_json::to_value(geo) {
                Ok(value) => descriptor.insert(GEO_KEY, value),
                Err(e) => error!(name = descriptor.name(), error = %e, "failed to serialise geolocation"),
            }
        }
    }

    async fn write_cache(&self, descriptor: &ProxyDescriptor, source: &GeoSource, geo: Option<&GeoRecord>) {
        let Some(cache) = &self.cache else {
            return;
        };
        let entry = match geo {
            Some(geo) if !geo.is_unknown() => CacheEntry::Resolved(geo.clone()),
            _ if self.config.disable_failed_cache => return,
            _ => CacheEntry::Failed,
        };
        let key = self.geo_key(descriptor, source);
        if let Err(e) = cache.set(&key, entry, self.config.cache_ttl).await {
            warn!(name = descriptor.name(), error = %e, "cache write failed");
        }
    }

    fn rename(&self, live: &[&KernelNode], descriptors: &mut [ProxyDescriptor], results: &[ProbeResult]) {
        let located: Vec<(usize, &GeoRecord)> = live
            .iter()
            .filter_map(|node| results[node.index].geo.as_ref().map(|geo| (node.index, geo)))
            .collect();
        let originals: Vec<String> = located
            .iter()
            .map(|(index, _)| descriptors[*index].name().to_string())
            .collect();
        let inputs: Vec<NamingInput<'_>> = located
            .iter()
            .zip(&originals)
            .map(|((index, geo), name)| NamingInput {
                name,
                geo,
                latency_ms: results[*index].latency_ms,
            })
            .collect();

        let namer = Namer::new(self.config.template.clone())
            .with_group_by_city(self.config.group_by_city)
            .with_append_isp(self.config.append_isp);
        for ((index, _), name) in located.iter().zip(namer.assign(&inputs)) {
            let descriptor = &mut descriptors[*index];
            debug!(from = descriptor.name(), to = %name, "renamed");
            descriptor.set_name(name);
        }
    }

    fn finish(&self, descriptors: Vec<ProxyDescriptor>, results: &[ProbeResult]) -> Vec<ProxyDescriptor> {
        let mut keep = Vec::new();
        if self.config.keep_geo {
            keep.push(GEO_KEY);
        }
        if self.config.keep_incompatible {
            keep.push(INCOMPATIBLE_KEY);
        }
        if self.config.keep_latency {
            keep.push(LATENCY_KEY);
        }
        if self.entrance.is_some() {
            keep.push(ENTRANCE_KEY);
        }

        descriptors
            .into_iter()
            .zip(results)
            .filter(|(d, result)| {
                let drop = (self.config.remove_dead && d.is_marked(REMOVE_KEY))
                    || (self.config.remove_incompatible && d.is_marked(INCOMPATIBLE_KEY))
                    || (self.config.remove_unresolved && result.state == NodeState::Unknown);
                if drop {
                    debug!(name = d.name(), "removed");
                }
                !drop
            })
            .map(|(mut d, _)| {
                d.strip_annotations(&keep);
                d
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::cache::MemoryCache;
    use crate::probe::convert::ClashMetaConverter;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Delay per server; absent servers are dead.
    struct FakeProbe {
        delays: HashMap<String, u64>,
        available: bool,
        calls: AtomicUsize,
    }

    impl FakeProbe {
        fn new(delays: &[(&str, u64)]) -> Arc<Self> {
            Arc::new(Self {
                delays: delays.iter().map(|(s, d)| (s.to_string(), *d)).collect(),
                available: true,
                calls: AtomicUsize::new(0),
            })
        }

        fn unavailable() -> Arc<Self> {
            Arc::new(Self {
                delays: HashMap::new(),
                available: false,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl LatencyProbe for FakeProbe {
        async fn measure(&self, nodes: &[KernelNode]) -> LatencyOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.available {
                return LatencyOutcome::KernelUnavailable;
            }
            LatencyOutcome::Measured(
                nodes
                    .iter()
                    .map(|n| n.server().and_then(|s| self.delays.get(s).copied()))
                    .collect(),
            )
        }
    }

    /// Country per server; absent servers cannot be located.
    struct FakeResolver {
        countries: HashMap<String, GeoRecord>,
        asked: Mutex<Vec<String>>,
    }

    impl FakeResolver {
        fn new(countries: &[(&str, GeoRecord)]) -> Arc<Self> {
            Arc::new(Self {
                countries: countries
                    .iter()
                    .map(|(s, g)| (s.to_string(), g.clone()))
                    .collect(),
                asked: Mutex::new(Vec::new()),
            })
        }

        fn asked(&self) -> Vec<String> {
            self.asked.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl GeoResolver for FakeResolver {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn resolve(&self, nodes: &[KernelNode], _source: &GeoSource) -> Vec<Option<GeoRecord>> {
            nodes
                .iter()
                .map(|n| {
                    let server = n.server().unwrap_or_default().to_string();
                    self.asked.lock().unwrap().push(server.clone());
                    self.countries.get(&server).cloned()
                })
                .collect()
        }
    }

    fn node(name: &str, server: &str) -> ProxyDescriptor {
        ProxyDescriptor::from_value(json!({
            "name": name, "type": "socks5", "server": server, "port": 1080
        }))
        .unwrap()
    }

    fn names(descriptors: &[ProxyDescriptor]) -> Vec<&str> {
        descriptors.iter().map(ProxyDescriptor::name).collect()
    }

    fn pipeline(config: PipelineConfig, probe: Arc<FakeProbe>, resolver: Arc<FakeResolver>) -> Pipeline {
        Pipeline::new(config, Arc::new(ClashMetaConverter::new()))
            .with_latency_probe(probe)
            .with_geo(resolver, GeoSource::remote("http://geo.test/json"))
    }

    fn us_us_jp() -> (Vec<ProxyDescriptor>, Arc<FakeProbe>, Arc<FakeResolver>) {
        let input = vec![node("a", "10.0.0.1"), node("b", "10.0.0.2"), node("c", "10.0.0.3")];
        let probe = FakeProbe::new(&[("10.0.0.1", 120), ("10.0.0.2", 80), ("10.0.0.3", 200)]);
        let resolver = FakeResolver::new(&[
            ("10.0.0.1", GeoRecord::new("US")),
            ("10.0.0.2", GeoRecord::new("US")),
            ("10.0.0.3", GeoRecord::new("JP")),
        ]);
        (input, probe, resolver)
    }

    #[tokio::test]
    async fn test_groups_and_sequences() {
        let (input, probe, resolver) = us_us_jp();
        let output = pipeline(PipelineConfig::default(), probe, resolver)
            .run(input)
            .await;
        assert_eq!(names(&output), vec!["US 01", "US 02", "JP"]);
        for d in &output {
            assert!(d.get(GEO_KEY).is_none());
            assert!(d.get(LATENCY_KEY).is_none());
            assert_eq!(d.get("port"), Some(&json!(1080)));
        }
    }

    #[tokio::test]
    async fn test_dead_and_incompatible_kept_by_default() {
        let input = vec![
            node("alive", "10.0.0.1"),
            node("dead", "10.0.0.2"),
            ProxyDescriptor::from_value(json!({"name": "odd", "type": "carrier-pigeon", "server": "x", "port": 1}))
                .unwrap(),
        ];
        let probe = FakeProbe::new(&[("10.0.0.1", 50)]);
        let resolver = FakeResolver::new(&[("10.0.0.1", GeoRecord::new("SG"))]);
        let output = pipeline(PipelineConfig::default(), probe, resolver.clone())
            .run_detailed(input)
            .await;

        assert_eq!(names(&output.descriptors), vec!["SG", "dead", "odd"]);
        assert!(output.descriptors.iter().all(|d| d.get(REMOVE_KEY).is_none()));
        assert!(output.descriptors.iter().all(|d| d.get(INCOMPATIBLE_KEY).is_none()));
        let states: Vec<NodeState> = output.results.iter().map(|r| r.state).collect();
        assert_eq!(states, vec![NodeState::Resolved, NodeState::Dead, NodeState::Incompatible]);
        assert_eq!(output.results[0].latency_ms, Some(50));
        // Only live nodes are located.
        assert_eq!(resolver.asked(), vec!["10.0.0.1"]);
    }

    #[tokio::test]
    async fn test_removal_options() {
        let input = || {
            vec![
                node("alive", "10.0.0.1"),
                node("dead", "10.0.0.2"),
                ProxyDescriptor::from_value(json!({"name": "odd", "type": "ss", "server": "x", "port": 1}))
                    .unwrap(),
            ]
        };
        let probe = FakeProbe::new(&[("10.0.0.1", 50)]);
        let resolver = FakeResolver::new(&[("10.0.0.1", GeoRecord::new("SG"))]);

        let config = PipelineConfig::new().with_remove_dead(true);
        let output = pipeline(config, probe.clone(), resolver.clone()).run(input()).await;
        assert_eq!(names(&output), vec!["SG", "odd"]);

        let config = PipelineConfig::new()
            .with_remove_incompatible(true)
            .with_remove_dead(true);
        let output = pipeline(config, probe.clone(), resolver.clone()).run(input()).await;
        assert_eq!(names(&output), vec!["SG"]);

        let config = PipelineConfig::new().with_keep_incompatible(true);
        let output = pipeline(config, probe, resolver).run(input()).await;
        assert_eq!(output.len(), 3);
        assert!(output[2].is_marked(INCOMPATIBLE_KEY));
    }

    #[tokio::test]
    async fn test_kernel_unavailable_returns_input() {
        let (mut input, _, resolver) = us_us_jp();
        input[1].mark(REMOVE_KEY);
        let expected: Vec<ProxyDescriptor> = input
            .iter()
            .cloned()
            .map(|mut d| {
                d.strip_annotations(&[]);
                d
            })
            .collect();

        let config = PipelineConfig::new().with_remove_dead(true);
        let output = pipeline(config, FakeProbe::unavailable(), resolver.clone())
            .run_detailed(input)
            .await;
        assert!(output.failed_open);
        assert_eq!(output.descriptors, expected);
        assert!(output.results.iter().all(|r| !r.alive()));
        assert!(resolver.asked().is_empty());
    }

    #[tokio::test]
    async fn test_cached_rerun_is_idempotent() {
        let (input, probe, resolver) = us_us_jp();
        let cache = Arc::new(MemoryCache::new());
        let pipeline = pipeline(PipelineConfig::default(), probe, resolver.clone()).with_cache(cache.clone());

        let first = pipeline.run(input).await;
        assert_eq!(cache.len().await, 3);
        assert_eq!(resolver.asked().len(), 3);

        let second = pipeline.run_detailed(first.clone()).await;
        assert_eq!(second.descriptors, first);
        assert!(second.results.iter().all(|r| r.cached));
        assert_eq!(resolver.asked().len(), 3);
    }

    #[tokio::test]
    async fn test_failed_resolution_is_cached() {
        let input = vec![node("a", "10.0.0.1"), node("b", "10.0.0.2")];
        let probe = FakeProbe::new(&[("10.0.0.1", 10), ("10.0.0.2", 10)]);
        let resolver = FakeResolver::new(&[("10.0.0.1", GeoRecord::new("NL"))]);
        let cache = Arc::new(MemoryCache::new());

        let output = pipeline(PipelineConfig::default(), probe.clone(), resolver.clone())
            .with_cache(cache.clone())
            .run_detailed(input.clone())
            .await;
        assert_eq!(names(&output.descriptors), vec!["NL", "unknown"]);
        assert_eq!(output.results[1].state, NodeState::Unknown);

        // The failure entry is served from the cache.
        let output = pipeline(PipelineConfig::default(), probe.clone(), resolver.clone())
            .with_cache(cache.clone())
            .run(input.clone())
            .await;
        assert_eq!(names(&output), vec!["NL", "unknown"]);
        assert_eq!(resolver.asked().len(), 2);

        // Unless failure entries are disabled.
        let config = PipelineConfig::new().with_disable_failed_cache(true);
        pipeline(config, probe, resolver.clone())
            .with_cache(cache)
            .run(input)
            .await;
        assert_eq!(resolver.asked(), vec!["10.0.0.1", "10.0.0.2", "10.0.0.2"]);
    }

    #[tokio::test]
    async fn test_disabled_failed_cache_writes_nothing_for_failures() {
        let input = vec![node("a", "10.0.0.1")];
        let probe = FakeProbe::new(&[("10.0.0.1", 10)]);
        let cache = Arc::new(MemoryCache::new());
        let config = PipelineConfig::new().with_disable_failed_cache(true);
        pipeline(config, probe, FakeResolver::new(&[]))
            .with_cache(cache.clone())
            .run(input)
            .await;
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn test_all_cached_without_liveness_starts_nothing() {
        let (input, probe, resolver) = us_us_jp();
        let cache = Arc::new(MemoryCache::new());
        let warm = pipeline(PipelineConfig::default(), probe.clone(), resolver.clone())
            .with_cache(cache.clone())
            .run(input.clone())
            .await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);

        let config = PipelineConfig::new().with_check_liveness(false);
        let output = pipeline(config, probe.clone(), resolver.clone())
            .with_cache(cache)
            .run(input)
            .await;
        assert_eq!(output, warm);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
        assert_eq!(resolver.asked().len(), 3);
    }

    #[tokio::test]
    async fn test_latency_only_keeps_names() {
        let (input, probe, resolver) = us_us_jp();
        let config = PipelineConfig::new()
            .with_resolve_geo(false)
            .with_keep_latency(true);
        let output = pipeline(config, probe, resolver.clone()).run(input).await;
        assert_eq!(names(&output), vec!["a", "b", "c"]);
        assert_eq!(output[1].get(LATENCY_KEY), Some(&json!(80)));
        assert!(resolver.asked().is_empty());
    }

    #[tokio::test]
    async fn test_keep_geo_and_custom_template() {
        let (input, probe, _) = us_us_jp();
        let resolver = FakeResolver::new(&[
            ("10.0.0.1", GeoRecord::new("US").with_isp("Google LLC")),
            ("10.0.0.2", GeoRecord::new("US")),
            ("10.0.0.3", GeoRecord::new("JP").with_isp("IIJ")),
        ]);
        let config = PipelineConfig::new()
            .with_keep_geo(true)
            .with_template(NameTemplate::parse("{country}{seq} {latency}").unwrap())
            .with_append_isp(true);
        let output = pipeline(config, probe, resolver).run(input).await;
        assert_eq!(names(&output), vec!["US01 120ms Google LLC", "US02 80ms", "JP 200ms IIJ"]);
        assert_eq!(output[2].get(GEO_KEY).unwrap()["isp"], "IIJ");
    }

    #[tokio::test]
    async fn test_identity_shares_cache_between_names() {
        let cache = Arc::new(MemoryCache::new());
        let probe = FakeProbe::new(&[("10.0.0.1", 10)]);
        let resolver = FakeResolver::new(&[("10.0.0.1", GeoRecord::new("FR"))]);

        pipeline(PipelineConfig::default(), probe.clone(), resolver.clone())
            .with_cache(cache.clone())
            .run(vec![node("first", "10.0.0.1")])
            .await;
        let output = pipeline(PipelineConfig::default(), probe, resolver.clone())
            .with_cache(cache)
            .run(vec![node("renamed upstream", "10.0.0.1")])
            .await;
        assert_eq!(names(&output), vec!["FR"]);
        assert_eq!(resolver.asked().len(), 1);
    }

    #[tokio::test]
    async fn test_output_never_longer_than_input() {
        let (mut input, probe, resolver) = us_us_jp();
        input.push(node("gone", "10.9.9.9"));
        let total = input.len();
        let output = pipeline(PipelineConfig::new().with_remove_dead(true), probe.clone(), resolver.clone())
            .run(input.clone())
            .await;
        assert_eq!(output.len(), total - 1);
        let output = pipeline(PipelineConfig::default(), probe, resolver).run(input).await;
        assert_eq!(output.len(), total);
    }

    #[tokio::test]
    async fn test_remove_unresolved() {
        let input = || vec![node("known", "10.0.0.1"), node("lost", "10.0.0.2"), node("dead", "10.0.0.3")];
        let probe = FakeProbe::new(&[("10.0.0.1", 40), ("10.0.0.2", 60)]);
        let resolver = FakeResolver::new(&[("10.0.0.1", GeoRecord::new("NL"))]);

        let output = pipeline(PipelineConfig::default(), probe.clone(), resolver.clone())
            .run_detailed(input())
            .await;
        assert_eq!(output.descriptors.len(), 3);
        assert_eq!(output.results[1].state, NodeState::Unknown);

        let config = PipelineConfig::new().with_remove_unresolved(true);
        let output = pipeline(config, probe, resolver).run(input()).await;
        assert_eq!(names(&output), vec!["NL", "dead"]);
    }

    #[tokio::test]
    async fn test_stale_annotations_do_not_survive_a_run() {
        let mut lost = node("lost", "10.0.0.1");
        lost.insert(GEO_KEY, json!({"country": "DE"}));
        lost.insert(LATENCY_KEY, json!(5));
        let mut dead = node("dead", "10.0.0.2");
        dead.insert(GEO_KEY, json!({"country": "DE"}));
        dead.insert(LATENCY_KEY, json!(7));

        let probe = FakeProbe::new(&[("10.0.0.1", 120)]);
        let resolver = FakeResolver::new(&[]);
        let config = PipelineConfig::new().with_keep_geo(true).with_keep_latency(true);
        let output = pipeline(config, probe, resolver).run(vec![lost, dead]).await;

        assert_eq!(output[0].get(GEO_KEY), Some(&json!({"country": "unknown"})));
        assert_eq!(output[0].get(LATENCY_KEY), Some(&json!(120)));
        assert!(output[1].get(GEO_KEY).is_none());
        assert!(output[1].get(LATENCY_KEY).is_none());
    }

    #[tokio::test]
    async fn test_empty_input() {
        let (_, probe, resolver) = us_us_jp();
        let output = pipeline(PipelineConfig::default(), probe, resolver).run_detailed(Vec::new()).await;
        assert!(output.descriptors.is_empty());
        assert!(output.results.is_empty());
    }
}
