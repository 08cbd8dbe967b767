//! A small ad-hoc CLI over the storage daemon and its remotes, grounded on `fs_util`/
//! `process_executor`'s shape: spawn/connect once, dispatch one subcommand, tear the daemon back
//! down. Every subcommand assumes the caller already populated the local CAS/ref files through
//! the real build tool this crate's stack serves; this binary only exercises push/pull/cat/missing
//! against whatever is already there.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::exit;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use cache::{ArtifactCache, AssetCacheCore, AssetCacheError, RemoteKind, RemoteSpec, SourceCache};
use casd::{DaemonConfig, DaemonSupervisor};
use clap::{Parser, Subcommand};
use hashing::{Digest, Fingerprint};
use protos::pb::buildstream::Artifact;
use remote_provider_traits::{ByteStoreProvider, IndexProvider, RemoteAssetProvider, RemoteIndexOptions, RemoteOptions};
use store::LocalCas;

#[derive(Clone)]
struct DigestArg(Digest);

impl FromStr for DigestArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, String> {
        let (fingerprint, size_bytes) = value
            .split_once(':')
            .ok_or_else(|| format!("expected fingerprint:size_bytes, got `{value}`"))?;
        let fingerprint = Fingerprint::from_hex_string(fingerprint)?;
        let size_bytes = size_bytes
            .parse::<usize>()
            .map_err(|e| format!("bad size_bytes in `{value}`: {e}"))?;
        Ok(DigestArg(Digest::new(fingerprint, size_bytes)))
    }
}

#[derive(Parser)]
struct DaemonOpts {
    /// Directory the storage daemon should use as its CAS root (shared with this process).
    #[arg(long)]
    cas_root: PathBuf,

    #[arg(long, default_value = "casd")]
    daemon_binary_name: String,

    #[arg(long)]
    subprojects_dir: Option<PathBuf>,

    #[arg(long)]
    log_dir: Option<PathBuf>,

    #[arg(long, default_value = "info")]
    log_level: String,

    #[arg(long)]
    quota_high_bytes: Option<u64>,

    #[arg(long)]
    protect_session_blobs: bool,

    /// Where `artifact` subcommands keep ref files; defaults to `<cas-root>/artifacts`.
    #[arg(long)]
    artifact_root: Option<PathBuf>,

    /// Where `source` subcommands keep ref files; defaults to `<cas-root>/sources`.
    #[arg(long)]
    source_root: Option<PathBuf>,
}

#[derive(Parser)]
struct RemoteOpts {
    /// Address of a combined index+storage remote (§4.8's `RemoteKind::All`), used by every
    /// `artifact`/`source` push and pull subcommand, and by `store missing`.
    #[arg(long)]
    remote: Option<String>,

    #[arg(long)]
    instance_name: Option<String>,

    #[arg(long)]
    root_ca_cert_file: Option<PathBuf>,

    #[arg(long)]
    client_cert_file: Option<PathBuf>,

    #[arg(long)]
    client_key_file: Option<PathBuf>,

    #[arg(long, default_value_t = 128)]
    rpc_concurrency: usize,

    #[arg(long, default_value_t = 30)]
    rpc_timeout_secs: u64,

    #[arg(long, default_value_t = 3 * 1024 * 1024)]
    chunk_size_bytes: usize,

    #[arg(long, default_value_t = 4 * 1024 * 1024)]
    batch_api_size_limit: usize,
}

impl RemoteOpts {
    fn tls_config(&self) -> Result<grpc_util::tls::Config, String> {
        let root_ca_certs = self
            .root_ca_cert_file
            .as_ref()
            .map(std::fs::read)
            .transpose()
            .map_err(|e| format!("failed to read root CA cert file: {e}"))?;
        let mtls = match (&self.client_cert_file, &self.client_key_file) {
            (Some(cert), Some(key)) => Some((
                std::fs::read(cert).map_err(|e| format!("failed to read client cert file: {e}"))?,
                std::fs::read(key).map_err(|e| format!("failed to read client key file: {e}"))?,
            )),
            (None, None) => None,
            _ => return Err("--client-cert-file and --client-key-file must be set together".to_owned()),
        };
        grpc_util::tls::Config::new(root_ca_certs, mtls)
    }

    fn byte_store_options(&self, address: &str) -> Result<RemoteOptions, String> {
        Ok(RemoteOptions {
            cas_address: address.to_owned(),
            instance_name: self.instance_name.clone(),
            headers: BTreeMap::new(),
            tls_config: self.tls_config()?,
            chunk_size_bytes: self.chunk_size_bytes,
            rpc_timeout: Duration::from_secs(self.rpc_timeout_secs),
            rpc_concurrency_limit: self.rpc_concurrency,
            capabilities_cell_opt: None,
            batch_api_size_limit: self.batch_api_size_limit,
        })
    }

    fn index_options(&self, address: &str) -> Result<RemoteIndexOptions, String> {
        Ok(RemoteIndexOptions {
            instance_name: self.instance_name.clone(),
            index_address: address.to_owned(),
            tls_config: self.tls_config()?,
            headers: BTreeMap::new(),
            concurrency_limit: self.rpc_concurrency,
            rpc_timeout: Duration::from_secs(self.rpc_timeout_secs),
        })
    }

    fn require_remote(&self) -> Result<&str, String> {
        self.remote.as_deref().ok_or_else(|| "this subcommand requires --remote".to_owned())
    }

    /// A single `RemoteKind::All` spec per project, or none if `--remote` wasn't given — `setup`
    /// is still meaningful in that case, it just produces empty remote lists (§4.8).
    fn project_specs(&self) -> HashMap<String, Vec<RemoteSpec>> {
        let specs = match &self.remote {
            Some(url) => vec![RemoteSpec {
                url: url.clone(),
                push: true,
                instance_name: self.instance_name.clone(),
                server_cert: None,
                client_cert: None,
                client_key: None,
                kind: RemoteKind::All,
            }],
            None => Vec::new(),
        };
        HashMap::from([("default".to_owned(), specs)])
    }
}

#[derive(Parser)]
#[command(name = "cas_util", about = "Ad-hoc exerciser for the storage daemon and its remotes.")]
struct Opt {
    #[command(flatten)]
    daemon: DaemonOpts,

    #[command(flatten)]
    remote: RemoteOpts,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Operate directly on the local CAS.
    Store {
        #[command(subcommand)]
        action: StoreAction,
    },
    /// Push/pull an `Artifact` through the Artifact Cache (§4.9).
    Artifact {
        #[command(subcommand)]
        action: ArtifactAction,
    },
    /// Push/pull a committed source through the Source Cache (§4.10).
    Source {
        #[command(subcommand)]
        action: SourceAction,
    },
}

#[derive(Subcommand)]
enum StoreAction {
    /// Print the bytes stored locally under a digest (`fingerprint:size_bytes`).
    CatDigest { digest: DigestArg },
    /// Print which of the given digests `--remote` does not have.
    Missing { digests: Vec<DigestArg> },
}

#[derive(Subcommand)]
enum ArtifactAction {
    /// Publish an already-imported artifact under `ref-name` (and `strong_key`/`weak_key` equal
    /// to it, for ad-hoc use outside of a real build's key derivation).
    Push {
        ref_name: String,
        #[arg(long)]
        files: DigestArg,
        #[arg(long)]
        buildtree: Option<DigestArg>,
        #[arg(long)]
        public_data: Option<DigestArg>,
        #[arg(long = "log")]
        logs: Vec<DigestArg>,
        #[arg(long, default_value = "default")]
        project: String,
    },
    /// Pull a previously published artifact into the ref file and local CAS.
    Pull {
        ref_name: String,
        #[arg(long)]
        pull_buildtrees: bool,
        #[arg(long, default_value = "default")]
        project: String,
    },
}

#[derive(Subcommand)]
enum SourceAction {
    /// Push an already-committed source ref (see `SourceCache::commit`, not exposed here).
    Push {
        source_ref: String,
        #[arg(long, default_value = "default")]
        project: String,
    },
    Pull {
        source_ref: String,
        #[arg(long, default_value = "default")]
        project: String,
    },
}

#[tokio::main]
async fn main() {
    let opt = Opt::parse();
    if let Err(message) = run(opt).await {
        eprintln!("{message}");
        exit(1);
    }
}

async fn run(opt: Opt) -> Result<(), String> {
    let log_level = match opt.daemon.log_level.as_str() {
        "warning" => logging::Level::Warn,
        "trace" => logging::Level::Trace,
        _ => logging::Level::Info,
    };
    logging::init(log_level);

    let cas_root = opt.daemon.cas_root.clone();
    let artifact_root = opt.daemon.artifact_root.clone().unwrap_or_else(|| cas_root.join("artifacts"));
    let source_root = opt.daemon.source_root.clone().unwrap_or_else(|| cas_root.join("sources"));
    let log_dir = opt.daemon.log_dir.clone().unwrap_or_else(|| cas_root.join("logs"));

    let config = DaemonConfig {
        daemon_binary_name: opt.daemon.daemon_binary_name.clone(),
        subprojects_dir: opt.daemon.subprojects_dir.clone(),
        cas_root: cas_root.clone(),
        log_dir,
        log_level: match log_level {
            logging::Level::Trace => casd::LogLevel::Trace,
            logging::Level::Warn | logging::Level::Error => casd::LogLevel::Warning,
            _ => casd::LogLevel::Info,
        },
        quota_high_bytes: opt.daemon.quota_high_bytes,
        protect_session_blobs: opt.daemon.protect_session_blobs,
        cas_remote: None,
    };

    let executor = task_executor::Executor::new();
    let mut supervisor = DaemonSupervisor::spawn(&config).await.map_err(|e| e.to_string())?;
    let request_shutdown = supervisor.request_shutdown_flag();
    let daemon_died = supervisor.monitor_health(&executor);
    let socket_path = supervisor.socket_path().to_path_buf();

    let channel = Arc::new(casd::DaemonChannel::new(
        socket_path,
        request_shutdown,
        daemon_died,
        opt.remote.rpc_concurrency,
        http::HeaderMap::new(),
    ));
    let local_cas = LocalCas::new(channel, cas_root, None);

    let result = dispatch(opt.command, &opt.remote, &local_cas, &artifact_root, &source_root).await;

    if let Err(e) = supervisor.terminate().await {
        log::warn!("failed to cleanly terminate storage daemon: {e}");
    }

    result
}

async fn dispatch(
    command: Command,
    remote_opts: &RemoteOpts,
    local_cas: &LocalCas,
    artifact_root: &Path,
    source_root: &Path,
) -> Result<(), String> {
    match command {
        Command::Store { action } => dispatch_store(action, remote_opts, local_cas).await,
        Command::Artifact { action } => dispatch_artifact(action, remote_opts, local_cas, artifact_root).await,
        Command::Source { action } => dispatch_source(action, remote_opts, local_cas, source_root).await,
    }
}

async fn dispatch_store(action: StoreAction, remote_opts: &RemoteOpts, local_cas: &LocalCas) -> Result<(), String> {
    match action {
        StoreAction::CatDigest { digest } => {
            let path = store::objpath(local_cas.cas_root(), &digest.0);
            let bytes = tokio::fs::read(&path)
                .await
                .map_err(|e| format!("digest {} not found locally: {e}", digest.0))?;
            std::io::stdout().write_all(&bytes).map_err(|e| e.to_string())
        }
        StoreAction::Missing { digests } => {
            let provider = remote_provider_reapi::byte_store::Provider::new(
                remote_opts.byte_store_options(remote_opts.require_remote()?)?,
            )
            .await?;
            let digests: Vec<Digest> = digests.into_iter().map(|d| d.0).collect();
            let missing = provider.list_missing_digests(&mut digests.into_iter()).await?;
            for digest in missing {
                println!("{} {}", digest.hash, digest.size_bytes);
            }
            Ok(())
        }
    }
}

async fn artifact_core(remote_opts: &RemoteOpts) -> AssetCacheCore<dyn IndexProvider> {
    AssetCacheCore::setup(
        &remote_opts.project_specs(),
        |spec| async move {
            let options = remote_opts.index_options(&spec.url).map_err(AssetCacheError::Other)?;
            let provider = remote_provider_reapi::artifact::Provider::new(options)
                .await
                .map_err(AssetCacheError::Other)?;
            provider.check(spec.push).await.map_err(AssetCacheError::RemoteNotCompatible)?;
            Ok(Arc::new(provider) as Arc<dyn IndexProvider>)
        },
        |spec| async move { new_byte_store(remote_opts, spec).await },
        |spec, err| log::warn!("remote {} unavailable: {err}", spec.url),
    )
    .await
}

async fn source_core(remote_opts: &RemoteOpts) -> AssetCacheCore<dyn RemoteAssetProvider> {
    AssetCacheCore::setup(
        &remote_opts.project_specs(),
        |spec| async move {
            let options = remote_opts.index_options(&spec.url).map_err(AssetCacheError::Other)?;
            let provider = remote_provider_reapi::remote_asset::Provider::new(options)
                .await
                .map_err(AssetCacheError::Other)?;
            provider.check(spec.push).await.map_err(AssetCacheError::RemoteNotCompatible)?;
            Ok(Arc::new(provider) as Arc<dyn RemoteAssetProvider>)
        },
        |spec| async move { new_byte_store(remote_opts, spec).await },
        |spec, err| log::warn!("remote {} unavailable: {err}", spec.url),
    )
    .await
}

async fn new_byte_store(
    remote_opts: &RemoteOpts,
    spec: RemoteSpec,
) -> Result<Arc<dyn ByteStoreProvider>, AssetCacheError> {
    let options = remote_opts.byte_store_options(&spec.url).map_err(AssetCacheError::Other)?;
    let provider = remote_provider_reapi::byte_store::Provider::new(options)
        .await
        .map_err(AssetCacheError::Other)?;
    provider.check(spec.push).await.map_err(AssetCacheError::RemoteNotCompatible)?;
    Ok(Arc::new(provider) as Arc<dyn ByteStoreProvider>)
}

async fn dispatch_artifact(
    action: ArtifactAction,
    remote_opts: &RemoteOpts,
    local_cas: &LocalCas,
    artifact_root: &Path,
) -> Result<(), String> {
    let core = artifact_core(remote_opts).await;
    let cache = ArtifactCache::new(core, local_cas.clone(), artifact_root.to_path_buf());

    match action {
        ArtifactAction::Push { ref_name, files, buildtree, public_data, logs, project } => {
            let artifact = Artifact {
                files: Some((&files.0).into()),
                buildtree: buildtree.map(|d| (&d.0).into()),
                public_data: public_data.map(|d| (&d.0).into()),
                logs: logs.into_iter().map(|d| (&d.0).into()).collect(),
                strong_key: ref_name.clone(),
                weak_key: ref_name.clone(),
            };
            let pushed = cache
                .push(&project, &ref_name, &artifact, std::slice::from_ref(&ref_name))
                .await
                .map_err(|e| e.to_string())?;
            println!("pushed={pushed}");
            Ok(())
        }
        ArtifactAction::Pull { ref_name, pull_buildtrees, project } => {
            let pulled = cache
                .pull(&project, &ref_name, &ref_name, pull_buildtrees)
                .await
                .map_err(|e| e.to_string())?;
            println!("pulled={pulled}");
            Ok(())
        }
    }
}

async fn dispatch_source(
    action: SourceAction,
    remote_opts: &RemoteOpts,
    local_cas: &LocalCas,
    source_root: &Path,
) -> Result<(), String> {
    let core = source_core(remote_opts).await;
    let cache = SourceCache::new(core, local_cas.clone(), source_root.to_path_buf());

    match action {
        SourceAction::Push { source_ref, project } => {
            let pushed = cache.push(&project, &source_ref, &source_ref).await.map_err(|e| e.to_string())?;
            println!("pushed={pushed}");
            Ok(())
        }
        SourceAction::Pull { source_ref, project } => {
            let pulled = cache.pull(&project, &source_ref, &source_ref).await.map_err(|e| e.to_string())?;
            println!("pulled={pulled}");
            Ok(())
        }
    }
}
