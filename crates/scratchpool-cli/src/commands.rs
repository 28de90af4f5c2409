//! Command handlers

use crate::leaf;
use crate::output::{self, Emit};
use anyhow::{bail, Context as _};
use chrono::Utc;
use clap::ArgMatches;
use scratchpool_core::{
    EmailNotifier, EnvironmentTemplate, FallbackSettings, FetchRequest, HttpRemoteClient,
    HubBackend, HubConnection, LogContext, PoolAllocator, PoolConfig, PoolMaintainer,
    ProvisioningEngine, RemoteClient, RequestId, ResourceRecordRepository, SandboxInspector,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

const ENV_INSTANCE_URL: &str = "SCRATCHPOOL_INSTANCE_URL";
const ENV_ACCESS_TOKEN: &str = "SCRATCHPOOL_ACCESS_TOKEN";
const ENV_HUB_USERNAME: &str = "SCRATCHPOOL_HUB_USERNAME";

/// Everything a handler needs
struct Session {
    config: PoolConfig,
    remote: Arc<dyn RemoteClient>,
    repository: ResourceRecordRepository,
    hub_username: Option<String>,
    emit: Emit,
    log: LogContext,
}

impl Session {
    fn open(args: &ArgMatches, operation: &str) -> anyhow::Result<Self> {
        let mut config = match args.get_one::<PathBuf>("config") {
            Some(path) => PoolConfig::load(path)?,
            None => PoolConfig::new(),
        };
        if let Some(version) = args.get_one::<String>("apiversion") {
            config = config.with_api_version(version.clone());
        }

        let instance_url =
            std::env::var(ENV_INSTANCE_URL).with_context(|| format!("{ENV_INSTANCE_URL} is not set"))?;
        let access_token =
            std::env::var(ENV_ACCESS_TOKEN).with_context(|| format!("{ENV_ACCESS_TOKEN} is not set"))?;
        let hub_username = std::env::var(ENV_HUB_USERNAME).ok().filter(|u| !u.is_empty());

        let log = LogContext::root(operation);
        let conn = HubConnection::new(instance_url, access_token, config.api_version.clone());
        let remote: Arc<dyn RemoteClient> = Arc::new(HttpRemoteClient::new(conn, log.clone())?);

        let mut repository = ResourceRecordRepository::new(remote.clone(), &config.retry, &log);
        if let Some(user) = &hub_username {
            repository = repository.with_hub_username(user.clone());
        }

        Ok(Self {
            config,
            remote,
            repository,
            hub_username,
            emit: Emit::from_args(args),
            log,
        })
    }

    fn maintainer(&self) -> PoolMaintainer {
        PoolMaintainer::new(self.repository.clone(), &self.config, &self.log)
    }

    fn fallback_engine(&self) -> ProvisioningEngine {
        let backend = Arc::new(HubBackend::new(self.remote.clone(), &self.config, &self.log));
        let mut engine =
            ProvisioningEngine::new(backend, self.repository.clone(), &self.config.retry, &self.log);
        if let Some(sender) = &self.hub_username {
            engine = engine.with_notifier(Arc::new(EmailNotifier::new(
                self.remote.clone(),
                self.config.api_version.clone(),
                sender.clone(),
                &self.log,
            )));
        }
        engine
    }

    fn template(&self) -> anyhow::Result<EnvironmentTemplate> {
        let Some(path) = &self.config.definition_file else {
            bail!("--provision needs definition_file in the pool configuration");
        };
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
        let definition: serde_json::Value =
            serde_json::from_str(&text).with_context(|| format!("parsing {path}"))?;
        Ok(EnvironmentTemplate::from_definition(path.clone(), &definition)?)
    }
}

/// Dispatch `pool <command>`
pub(crate) async fn run(matches: &ArgMatches) -> anyhow::Result<()> {
    let Some(("pool", pool)) = matches.subcommand() else {
        bail!("expected the pool command");
    };
    let Some((name, _)) = pool.subcommand() else {
        bail!("expected a pool subcommand");
    };
    let args = leaf(matches);
    let session = Session::open(args, name)?;

    match name {
        "fetch" => fetch(&session, args).await,
        "info" => info(&session, args).await,
        "list" => list(&session, args).await,
        "cleanup" => cleanup(&session, args).await,
        "limits" => limits(&session).await,
        other => bail!("unknown pool subcommand {other}"),
    }
}

fn tag(args: &ArgMatches) -> anyhow::Result<&str> {
    args.get_one::<String>("tag")
        .map(String::as_str)
        .context("--tag is required")
}

async fn fetch(session: &Session, args: &ArgMatches) -> anyhow::Result<()> {
    let tag = tag(args)?;
    let count = args.get_one::<usize>("count").copied().unwrap_or(1);
    let provision = args.get_flag("provision");
    let requester = format!(
        "{}:{}",
        session.hub_username.as_deref().unwrap_or("scratchpool"),
        RequestId::new()
    );

    let request = FetchRequest::new(tag)
        .with_count(count)
        .only_mine(args.get_flag("mypool"))
        .with_fallback(provision)
        .with_requester(requester);

    let mut allocator = PoolAllocator::new(session.repository.clone(), &session.log);
    if provision {
        let settings = FallbackSettings {
            template: session.template()?,
            expiry_days: session.config.expiry_days,
            owner_email: args.get_one::<String>("email").cloned(),
        };
        allocator = allocator.with_fallback(Arc::new(session.fallback_engine()), settings);
    }

    let outcome = allocator.fetch(&request).await?;
    for warning in &outcome.warnings {
        tracing::warn!("{warning}");
    }
    if outcome.is_exhausted() {
        eprintln!(
            "Pool {tag} supplied {} of {} requested environments",
            outcome.handles.len(),
            outcome.requested
        );
    }
    session
        .emit
        .write(&outcome, || output::handles_table(&outcome.handles))
}

async fn info(session: &Session, args: &ArgMatches) -> anyhow::Result<()> {
    let name = args
        .get_one::<String>("name")
        .context("--name is required")?;
    let latest = args.get_flag("showonlylatest");

    let processes = SandboxInspector::new(session.remote.clone(), &session.log)
        .info(name, latest)
        .await?;
    eprintln!("Successfully retrieved sandbox details");
    session
        .emit
        .write(&processes, || output::sandbox_table(&processes))
}

async fn list(session: &Session, args: &ArgMatches) -> anyhow::Result<()> {
    let tag = tag(args)?;
    let infos = session
        .repository
        .find_by_tag(tag, args.get_flag("mypool"), args.get_flag("unassigned"))
        .await?;
    let rows = output::list_rows(&infos);
    session.emit.write(&rows, || output::list_table(&rows))
}

async fn cleanup(session: &Session, args: &ArgMatches) -> anyhow::Result<()> {
    let tag = tag(args)?;
    let maintainer = session.maintainer();
    let now = Utc::now();

    let retired = maintainer.expire_and_delete(tag, now).await?;
    let report = maintainer.reconcile(tag, now).await?;
    let remaining = maintainer.count_active(tag, false).await?;

    let result = json!({
        "tag": tag,
        "retired": retired,
        "orphaned": report.orphaned,
        "active": remaining,
    });
    session.emit.write(&result, || {
        format!(
            "Retired {retired} environments, marked {} orphaned records Deleted; {remaining} active remain in {tag}\n",
            report.orphaned.len()
        )
    })
}

async fn limits(session: &Session) -> anyhow::Result<()> {
    let maintainer = session.maintainer();
    let limits = maintainer.limits().await?;
    let usage = maintainer.usage_by_user().await?;

    let result = json!({ "limits": limits, "usage": usage });
    session
        .emit
        .write(&result, || output::limits_table(&limits, &usage))
}
