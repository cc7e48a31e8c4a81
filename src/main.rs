use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use node_probe::{
    http::HttpConfig,
    kernel::{KernelBinary, KernelSettings, MetaClient, DEFAULT_BASE_PORT, DEFAULT_CONTROLLER_PORT, DEFAULT_META_URL},
    probe::{
        cache::DEFAULT_TTL,
        dedupe,
        geo::{DEFAULT_GEO_API, DEFAULT_IP_URL},
        liveness::DEFAULT_TEST_URL,
        Cache, ClashMetaConverter, DedicatedProcessResolver, DescriptorParser, EntranceLocator,
        GeoDatabases, GeoResolver, GeoSource, IdentityKey, KernelLatencyProbe, LatencyConfig,
        MemoryCache, MetaResolver, NameTemplate, Pipeline, PipelineConfig, ProxyDescriptor,
        ResolverConfig, SharedProcessResolver, SqliteCache,
    },
};
use regex::Regex;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Proxy node liveness checker and egress geolocation renamer
#[derive(Parser)]
#[command(name = "node-probe")]
#[command(about = "Proxy node liveness checker and egress geolocation renamer")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Test, locate and rename every node
    Probe {
        /// JSON file with an array of nodes or a {"proxies": [...]} object
        input: PathBuf,
        /// Output file; stdout if omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[command(flatten)]
        kernel: KernelArgs,
        #[command(flatten)]
        latency: LatencyArgs,
        #[command(flatten)]
        geo: GeoArgs,
        #[command(flatten)]
        naming: NamingArgs,
        #[command(flatten)]
        cache: CacheArgs,
        /// Skip the liveness test; every convertible node counts as alive
        #[arg(long)]
        no_liveness: bool,
        /// Remove nodes that failed the liveness test
        #[arg(long)]
        remove_dead: bool,
        /// Remove nodes the kernel cannot run
        #[arg(long)]
        remove_incompatible: bool,
        /// Remove live nodes whose egress could not be located
        #[arg(long)]
        remove_unresolved: bool,
        /// Keep the `_geo` annotation
        #[arg(long)]
        keep_geo: bool,
        /// Keep the `_latency` annotation
        #[arg(long)]
        keep_latency: bool,
        /// Keep the `_incompatible` annotation
        #[arg(long)]
        keep_incompatible: bool,
        /// Attach `_entrance` with the geolocation of each server address (needs --country-db)
        #[arg(long)]
        entrance: bool,
    },
    /// Only test liveness
    Latency {
        input: PathBuf,
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[command(flatten)]
        kernel: KernelArgs,
        #[command(flatten)]
        latency: LatencyArgs,
        /// Keep dead nodes in the output
        #[arg(long)]
        keep_dead: bool,
    },
    /// Look an IPv4 address up in local databases
    Lookup {
        ip: String,
        #[arg(long, env = "NODE_PROBE_MMDB_COUNTRY")]
        country_db: PathBuf,
        #[arg(long, env = "NODE_PROBE_MMDB_ASN")]
        asn_db: Option<PathBuf>,
        #[arg(long, default_value = "en")]
        lang: String,
    },
    /// Drop nodes repeating the same field values
    Dedupe {
        input: PathBuf,
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Fields compared, comma separated
        #[arg(long, value_delimiter = ',', default_value = "server,port,type")]
        fields: Vec<String>,
    },
}

#[derive(Args)]
struct KernelArgs {
    /// mihomo binary; searched in the usual places if omitted
    #[arg(long, env = "NODE_PROBE_KERNEL")]
    kernel: Option<PathBuf>,
    #[arg(long, default_value_t = DEFAULT_CONTROLLER_PORT)]
    controller_port: u16,
    /// First egress port
    #[arg(long, default_value_t = DEFAULT_BASE_PORT)]
    base_port: u16,
    /// Control-plane secret
    #[arg(long)]
    secret: Option<String>,
}

#[derive(Args)]
struct LatencyArgs {
    #[arg(long, default_value = DEFAULT_TEST_URL)]
    test_url: String,
    /// Timeout of one delay test in milliseconds
    #[arg(long, default_value = "5000")]
    test_timeout: u64,
    /// Delay tests per node; the best one counts
    #[arg(long, default_value = "3")]
    samples: usize,
    /// Nodes tested at once
    #[arg(long, default_value = "10")]
    concurrency: usize,
}

#[derive(Clone, Copy, ValueEnum)]
enum Strategy {
    /// One kernel per node
    Dedicated,
    /// One kernel, switching between nodes
    Shared,
    /// Kernels run by an http-meta service
    Meta,
}

#[derive(Clone, Copy, ValueEnum)]
enum Source {
    /// Remote geolocation API
    Api,
    /// Egress IP looked up in local databases
    Local,
}

#[derive(Args)]
struct GeoArgs {
    #[arg(long, value_enum, default_value = "dedicated")]
    strategy: Strategy,
    #[arg(long, value_enum, default_value = "api")]
    source: Source,
    #[arg(long, default_value = DEFAULT_GEO_API)]
    geo_api: String,
    /// Service answering with the caller's IP, for --source local
    #[arg(long, default_value = DEFAULT_IP_URL)]
    ip_url: String,
    #[arg(long, env = "NODE_PROBE_MMDB_COUNTRY")]
    country_db: Option<PathBuf>,
    #[arg(long, env = "NODE_PROBE_MMDB_ASN")]
    asn_db: Option<PathBuf>,
    /// Preferred language of database names
    #[arg(long, default_value = "en")]
    lang: String,
    /// Nodes located at once
    #[arg(long, default_value = "5")]
    geo_concurrency: usize,
    /// Timeout of a geolocation request in milliseconds
    #[arg(long, default_value = "10000")]
    geo_timeout: u64,
    #[arg(long, default_value = "1")]
    retries: u32,
    /// Base retry delay in milliseconds
    #[arg(long, default_value = "1000")]
    retry_delay: u64,
    #[arg(long, default_value = DEFAULT_META_URL)]
    meta_url: String,
    /// Authorization header sent to http-meta
    #[arg(long)]
    meta_auth: Option<String>,
    /// Milliseconds to wait for http-meta kernels to come up
    #[arg(long, default_value = "3000")]
    meta_start_delay: u64,
    /// Milliseconds of http-meta kernel lifetime per node
    #[arg(long, default_value = "10000")]
    meta_node_timeout: u64,
}

#[derive(Args)]
struct NamingArgs {
    /// Placeholders: {country} {code} {flag} {city} {seq} {isp} {org} {asn} {name} {latency}
    #[arg(long, default_value = "{country} {seq}")]
    template: String,
    /// Number nodes per country and city
    #[arg(long)]
    group_by_city: bool,
    /// Append the ISP to the name
    #[arg(long)]
    append_isp: bool,
}

#[derive(Args)]
struct CacheArgs {
    /// SQLite cache file; an in-memory cache is used if omitted
    #[arg(long)]
    cache: Option<PathBuf>,
    /// Cache lifetime in hours
    #[arg(long, default_value_t = DEFAULT_TTL.as_secs() / 3600)]
    cache_ttl: u64,
    /// Do not cache failed lookups
    #[arg(long)]
    disable_failed_cache: bool,
    /// Fields identifying a node in the cache, comma separated
    #[arg(long, value_delimiter = ',', default_value = "server")]
    identity: Vec<String>,
    /// Regex selecting identity fields; overrides --identity
    #[arg(long)]
    identity_pattern: Option<String>,
}

impl KernelArgs {
    fn settings(&self) -> Result<KernelSettings> {
        let binary = KernelBinary::locate(self.kernel.as_deref())?;
        info!(binary = %binary.display(), "using kernel");
        Ok(KernelSettings::new(binary)
            .with_controller_port(self.controller_port)
            .with_base_port(self.base_port)
            .with_secret(self.secret.clone()))
    }
}

impl LatencyArgs {
    fn config(&self) -> LatencyConfig {
        LatencyConfig::new()
            .with_test_url(self.test_url.clone())
            .with_timeout(Duration::from_millis(self.test_timeout))
            .with_samples(self.samples)
            .with_concurrency(self.concurrency)
    }
}

impl GeoArgs {
    fn databases(&self) -> Result<Option<Arc<GeoDatabases>>> {
        let Some(country) = &self.country_db else {
            return Ok(None);
        };
        let databases = GeoDatabases::open(country.as_path(), self.asn_db.as_deref())?;
        Ok(Some(Arc::new(databases)))
    }

    fn source(&self, databases: Option<Arc<GeoDatabases>>) -> Result<GeoSource> {
        match self.source {
            Source::Api => Ok(GeoSource::remote(self.geo_api.clone())),
            Source::Local => {
                let databases =
                    databases.ok_or_else(|| anyhow!("--source local needs --country-db"))?;
                Ok(GeoSource::local(self.ip_url.clone(), databases, self.lang.clone()))
            }
        }
    }

    fn resolver(&self, settings: Option<KernelSettings>) -> Result<Arc<dyn GeoResolver>> {
        let http = HttpConfig::new()
            .with_timeout(Duration::from_millis(self.geo_timeout))
            .with_retries(self.retries)
            .with_retry_delay(Duration::from_millis(self.retry_delay));
        let config = ResolverConfig::new()
            .with_concurrency(self.geo_concurrency)
            .with_http(http);

        let kernel = || settings.clone().ok_or_else(|| anyhow!("no kernel available"));
        let resolver: Arc<dyn GeoResolver> = match self.strategy {
            Strategy::Dedicated => Arc::new(DedicatedProcessResolver::new(kernel()?, config)),
            Strategy::Shared => Arc::new(SharedProcessResolver::new(kernel()?, config)),
            Strategy::Meta => {
                let client = MetaClient::new(&self.meta_url, self.meta_auth.clone())?;
                Arc::new(
                    MetaResolver::new(client, config)
                        .with_start_delay(Duration::from_millis(self.meta_start_delay))
                        .with_node_timeout(Duration::from_millis(self.meta_node_timeout)),
                )
            }
        };
        Ok(resolver)
    }
}

impl CacheArgs {
    async fn open(&self) -> Result<Arc<dyn Cache>> {
        match &self.cache {
            Some(path) => {
                let cache = SqliteCache::open(path).await?;
                let purged = cache.purge().await?;
                info!(path = %path.display(), purged, "using sqlite cache");
                Ok(Arc::new(cache))
            }
            None => Ok(Arc::new(MemoryCache::new())),
        }
    }

    fn identity(&self) -> Result<IdentityKey> {
        match &self.identity_pattern {
            Some(pattern) => {
                let regex = Regex::new(pattern).with_context(|| format!("invalid identity pattern {}", pattern))?;
                Ok(IdentityKey::Pattern(regex))
            }
            None => Ok(IdentityKey::fields(self.identity.iter().cloned())),
        }
    }
}

fn write_output(descriptors: &[ProxyDescriptor], output: Option<&Path>) -> Result<()> {
    match output {
        Some(path) => {
            DescriptorParser::save_to_file(descriptors, path, true)?;
            info!(count = descriptors.len(), path = %path.display(), "saved nodes");
        }
        None => println!("{}", DescriptorParser::to_string(descriptors, true)?),
    }
    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Probe {
            input,
            output,
            kernel,
            latency,
            geo,
            naming,
            cache,
            no_liveness,
            remove_dead,
            remove_incompatible,
            remove_unresolved,
            keep_geo,
            keep_latency,
            keep_incompatible,
            entrance,
        } => {
            let descriptors = DescriptorParser::parse_file(&input)?;
            info!(count = descriptors.len(), input = %input.display(), "loaded nodes");

            let template = NameTemplate::parse(&naming.template)?;
            let config = PipelineConfig::new()
                .with_check_liveness(!no_liveness)
                .with_group_by_city(naming.group_by_city)
                .with_append_isp(naming.append_isp)
                .with_template(template)
                .with_keep_geo(keep_geo)
                .with_keep_latency(keep_latency)
                .with_keep_incompatible(keep_incompatible)
                .with_remove_dead(remove_dead)
                .with_remove_incompatible(remove_incompatible)
                .with_remove_unresolved(remove_unresolved)
                .with_disable_failed_cache(cache.disable_failed_cache)
                .with_cache_ttl(Duration::from_secs(cache.cache_ttl * 3600))
                .with_identity(cache.identity()?);

            // The meta strategy without liveness testing needs no local kernel.
            let needs_kernel = !no_liveness || !matches!(geo.strategy, Strategy::Meta);
            let settings = if needs_kernel {
                Some(kernel.settings()?)
            } else {
                None
            };

            let databases = geo.databases()?;
            let source = geo.source(databases.clone())?;
            let mut pipeline = Pipeline::new(config, Arc::new(ClashMetaConverter::new()))
                .with_geo(geo.resolver(settings.clone())?, source)
                .with_cache(cache.open().await?);
            if let Some(settings) = settings.filter(|_| !no_liveness) {
                pipeline = pipeline
                    .with_latency_probe(Arc::new(KernelLatencyProbe::new(settings, latency.config())));
            }
            if entrance {
                let databases =
                    databases.ok_or_else(|| anyhow!("--entrance needs --country-db"))?;
                pipeline = pipeline.with_entrance(EntranceLocator::new(databases, geo.lang.clone()));
            }

            let output_nodes = pipeline.run(descriptors).await;
            write_output(&output_nodes, output.as_deref())?;
        }
        Commands::Latency {
            input,
            output,
            kernel,
            latency,
            keep_dead,
        } => {
            let descriptors = DescriptorParser::parse_file(&input)?;
            let config = PipelineConfig::new()
                .with_resolve_geo(false)
                .with_keep_latency(true)
                .with_remove_dead(!keep_dead);
            let probe = KernelLatencyProbe::new(kernel.settings()?, latency.config());
            let pipeline = Pipeline::new(config, Arc::new(ClashMetaConverter::new()))
                .with_latency_probe(Arc::new(probe));

            let output_nodes = pipeline.run(descriptors).await;
            write_output(&output_nodes, output.as_deref())?;
        }
        Commands::Lookup {
            ip,
            country_db,
            asn_db,
            lang,
        } => {
            let ip = ip
                .parse::<Ipv4Addr>()
                .with_context(|| format!("{} is not an IPv4 address", ip))?;
            let databases = GeoDatabases::open(country_db.as_path(), asn_db.as_deref())?;
            let record = databases.lookup(ip, &lang)?;
            let raw = databases.country_db().lookup(ip)?;

            match record {
                Some(record) => println!("{}", record),
                None => println!("not found"),
            }
            if let Some(raw) = raw {
                println!("{}", serde_json::to_string_pretty(&raw.to_json())?);
            }
        }
        Commands::Dedupe {
            input,
            output,
            fields,
        } => {
            let descriptors = DescriptorParser::parse_file(&input)?;
            let before = descriptors.len();
            let kept = dedupe(descriptors, &fields);
            info!(before, after = kept.len(), "deduplicated");
            write_output(&kept, output.as_deref())?;
        }
    }

    Ok(())
}
