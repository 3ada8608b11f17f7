use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::runtime::Handle;
use tracing::{info, warn};

use crate::api::{self, PlatformConfig, PostResult, PrimaryApi};
use crate::config::{self, Config};
use crate::echo::{AuthForwarder, HttpPipeline};
use crate::media::{FileMediaItem, MediaItem};
use crate::profile::{HttpImageLoader, ProfileSnapshot, RefreshCoordinator, Services};
use crate::shorturl::ShortUrlExpander;
use crate::upload::{Imgur, Mobypicture, UploadBackend, UploadDispatcher};

pub const USAGE: &str = "perch - media upload and profile tools for the command line

  --version, -V                 Show version and exit
  --help,    -h                 Show this help message
  --echo-headers <provider>     Print the delegated auth headers for a provider
  --limits                      Show the selected upload backend's limits
  --upload <file> <text>        Upload a file and post it with text
  --profile <screen-name>       Load and print a profile";

/// What the command line asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    Version,
    Help,
    Run(Command),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    EchoHeaders(String),
    Limits,
    Upload { file: PathBuf, text: String },
    Profile(String),
}

pub fn parse_args(args: &[String]) -> Result<Invocation, String> {
    let mut iter = args.iter();
    let Some(flag) = iter.next().map(String::as_str) else {
        return Ok(Invocation::Help);
    };
    let mut value = || {
        iter.next()
            .cloned()
            .ok_or_else(|| format!("{} needs a value", flag))
    };
    match flag {
        "--version" | "-V" => Ok(Invocation::Version),
        "--help" | "-h" => Ok(Invocation::Help),
        "--echo-headers" => Ok(Invocation::Run(Command::EchoHeaders(value()?))),
        "--limits" => Ok(Invocation::Run(Command::Limits)),
        "--upload" => {
            let file = PathBuf::from(value()?);
            let text = value()?;
            Ok(Invocation::Run(Command::Upload { file, text }))
        }
        "--profile" => Ok(Invocation::Run(Command::Profile(value()?))),
        other => Err(format!("unknown argument: {}", other)),
    }
}

pub async fn run(command: Command) -> Result<()> {
    let cfg = config::load(config::LoadOptions::default()).context("load config")?;
    crate::logging::init(&cfg.log.filter);

    match command {
        Command::EchoHeaders(provider) => {
            for line in echo_headers(&cfg, &provider)? {
                println!("{}", line);
            }
        }
        Command::Limits => {
            let app = App::new(cfg)?;
            println!("{}", app.limits_report()?);
        }
        Command::Upload { file, text } => {
            let app = App::new(cfg)?;
            app.sync_platform_limits().await;
            let result = app.upload(file, &text).await?;
            println!("posted {}: {}", result.id, result.text);
        }
        Command::Profile(screen_name) => {
            let app = App::new(cfg)?;
            let snapshot = app.load_profile(&screen_name).await?;
            println!("{}", describe_profile(&snapshot));
        }
    }
    Ok(())
}

/// The two delegated auth headers, formatted as `Name: value` lines.
pub fn echo_headers(cfg: &Config, provider_uri: &str) -> Result<Vec<String>> {
    let forwarder = AuthForwarder::for_credential(
        HttpPipeline::new(reqwest::Client::new()),
        provider_uri,
        &cfg.credential(),
        None,
    )
    .context("sign verify-identity request")?;
    forwarder
        .headers()
        .iter()
        .map(|(name, value)| {
            let value = value.to_str().context("non-ascii header value")?;
            Ok(format!("{}: {}", name, value))
        })
        .collect()
}

pub struct App {
    config: Config,
    api: Arc<api::Client>,
    dispatcher: UploadDispatcher,
}

impl App {
    pub fn new(config: Config) -> Result<Self> {
        let credential = config.credential();
        credential
            .validate()
            .context("account credentials are incomplete")?;

        let api = Arc::new(
            api::Client::new(
                credential.clone(),
                api::ClientConfig {
                    user_agent: config.api.user_agent.clone(),
                    base_url: Some(config.api.base_url.clone()),
                    timeout: Some(config.api.timeout),
                    http_client: None,
                },
            )
            .context("create api client")?,
        );

        let upload_http = reqwest::Client::builder()
            .user_agent(config.api.user_agent.clone())
            .timeout(config.upload.timeout)
            .build()
            .context("create upload http client")?;

        let mut dispatcher = UploadDispatcher::new();
        if !config.upload.imgur_client_id.is_empty() {
            dispatcher.register(Arc::new(Imgur::new(
                api.clone(),
                upload_http.clone(),
                config.upload.imgur_client_id.clone(),
            )));
        }
        if !config.upload.mobypicture_api_key.is_empty() {
            dispatcher.register(Arc::new(Mobypicture::new(
                api.clone(),
                upload_http,
                config.upload.mobypicture_api_key.clone(),
                credential,
            )));
        }
        if let Err(err) = dispatcher.select(&config.upload.backend) {
            warn!(backend = %config.upload.backend, registered = ?dispatcher.names(), "{}", err);
        }

        Ok(Self {
            config,
            api,
            dispatcher,
        })
    }

    pub fn dispatcher(&self) -> &UploadDispatcher {
        &self.dispatcher
    }

    /// Fetches the platform limits and hands them to every backend. Falls
    /// back to the built-in defaults when the fetch fails.
    pub async fn sync_platform_limits(&self) -> PlatformConfig {
        let limits = match self.api.configuration().await {
            Ok(limits) => limits,
            Err(err) => {
                warn!(error = %err, "using default platform limits");
                PlatformConfig::default()
            }
        };
        self.dispatcher.update_configuration(&limits);
        limits
    }

    pub async fn upload(&self, file: PathBuf, text: &str) -> Result<PostResult> {
        let item = FileMediaItem::new(file);
        let backend = self.dispatcher.selected()?;
        let reserved = backend.reserved_text_length(1);
        info!(backend = backend.name(), file = %item.path().display(), reserved, "uploading");
        let items: [&dyn MediaItem; 1] = [&item];
        let result = self
            .dispatcher
            .upload(text, None, &items)
            .await
            .with_context(|| format!("upload via {}", backend.name()))?;
        Ok(result)
    }

    pub fn limits_report(&self) -> Result<String> {
        let backend = self.dispatcher.selected()?;
        Ok(format_limits(backend.as_ref()))
    }

    pub async fn load_profile(&self, screen_name: &str) -> Result<ProfileSnapshot> {
        let user = self
            .api
            .show_user(screen_name)
            .await
            .with_context(|| format!("load profile {}", screen_name))?;
        let timeout = self.config.api.timeout;
        let coordinator = RefreshCoordinator::new(
            Services {
                api: self.api.clone(),
                expander: Arc::new(ShortUrlExpander::new(timeout)?),
                images: Arc::new(HttpImageLoader::new(http_client(timeout)?)),
                identity: self.config.identity(),
            },
            Handle::current(),
        );
        let report = coordinator.refresh(user).wait().await;
        if report.outcomes.is_empty() {
            bail!("profile refresh did not run");
        }
        Ok(coordinator.view().snapshot())
    }
}

fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .context("create http client")
}

pub fn format_limits(backend: &dyn UploadBackend) -> String {
    let limits = backend.limits();
    let mut out = format!(
        "backend: {}\nmax items: {}\nalt text: {}\nreserved characters: {}\nfiles: {}",
        backend.name(),
        limits.max_item_count,
        if limits.supports_alt_text { "yes" } else { "no" },
        backend.reserved_text_length(1),
        limits.file_filter(),
    );
    for extension in &limits.supported_extensions {
        if let Some(max) = limits.max_file_size(extension) {
            out.push_str(&format!("\n  {}: {} KiB", extension, max / 1024));
        }
    }
    out
}

pub fn describe_profile(snapshot: &ProfileSnapshot) -> String {
    let mut lines = vec![format!("{} (@{})", snapshot.name, snapshot.screen_name)];
    if !snapshot.location.is_empty() {
        lines.push(format!("location: {}", snapshot.location));
    }
    if !snapshot.created_at.is_empty() {
        lines.push(format!("joined: {}", snapshot.created_at));
    }
    lines.push(format!(
        "posts: {}  following: {}  followers: {}",
        snapshot.statuses_count, snapshot.friends_count, snapshot.followers_count
    ));
    if let Some(Some(link)) = snapshot.web_link.ready() {
        lines.push(format!("web: {}", link));
    }
    if let Some(description) = snapshot.description.ready() {
        lines.push(format!("bio: {}", crate::render::strip_tags(description)));
    }
    let relationship = snapshot.relationship.label();
    if !relationship.is_empty() {
        lines.push(format!("relationship: {}", relationship));
    }
    lines.join("\n")
}
