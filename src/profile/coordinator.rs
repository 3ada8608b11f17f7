use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client as HttpClient;
use tokio::runtime::Handle;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    AvatarState, FieldState, FieldTask, ProfileError, ProfileSnapshot, ProfileView,
    RelationshipField, TaskOutcome,
};
use crate::api::{PrimaryApi, ProfileEdit, Relationship, SessionIdentity, UrlEntity, UserProfile};
use crate::media::{MediaItem, MemoryImage};
use crate::render;
use crate::shorturl::UrlExpander;
use crate::upload::{UploadLimits, ValidationError};

const ICON_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif"];
const MAX_ICON_SIZE: u64 = 700 * 1024 - 1;

#[derive(Debug, thiserror::Error)]
pub enum ImageLoadError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("decode error: {0}")]
    Decode(#[from] image::ImageError),
    #[error("decoder task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Fetches and decodes avatar images.
#[async_trait]
pub trait ImageLoader: Send + Sync {
    async fn load(&self, url: &str) -> Result<MemoryImage, ImageLoadError>;
}

pub struct HttpImageLoader {
    http: HttpClient,
}

impl HttpImageLoader {
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ImageLoader for HttpImageLoader {
    async fn load(&self, url: &str) -> Result<MemoryImage, ImageLoadError> {
        let bytes = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        let image = tokio::task::spawn_blocking(move || MemoryImage::decode(&bytes)).await??;
        Ok(image)
    }
}

/// Per-user actions offered on someone else's profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserAction {
    Follow,
    Unfollow,
    Block,
    Unblock,
    /// Also blocks the account.
    ReportSpam,
}

impl UserAction {
    fn relationship_after(self, rel: Relationship) -> Relationship {
        match self {
            UserAction::Follow => Relationship {
                following: true,
                ..rel
            },
            UserAction::Unfollow => Relationship {
                following: false,
                ..rel
            },
            // Blocking breaks follows in both directions.
            UserAction::Block | UserAction::ReportSpam => Relationship::default(),
            UserAction::Unblock => rel,
        }
    }
}

/// Collaborators shared by every refresh.
#[derive(Clone)]
pub struct Services {
    pub api: Arc<dyn PrimaryApi>,
    pub expander: Arc<dyn UrlExpander>,
    pub images: Arc<dyn ImageLoader>,
    pub identity: SessionIdentity,
}

#[derive(Clone)]
struct Epoch {
    id: u64,
    token: CancellationToken,
}

struct Inner {
    services: Services,
    view: Arc<ProfileView>,
    runtime: Handle,
    current: Mutex<Option<Epoch>>,
    next_id: AtomicU64,
}

/// Per-task results of one refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub epoch: Option<u64>,
    pub outcomes: BTreeMap<FieldTask, TaskOutcome>,
}

impl RefreshReport {
    pub fn outcome(&self, task: FieldTask) -> Option<TaskOutcome> {
        self.outcomes.get(&task).copied()
    }

    pub fn all_discarded(&self) -> bool {
        !self.outcomes.is_empty()
            && self
                .outcomes
                .values()
                .all(|outcome| *outcome == TaskOutcome::Discarded)
    }
}

/// Completion signal for one refresh. Dropping it does not cancel anything.
pub struct RefreshHandle {
    epoch: Option<u64>,
    join: Option<JoinHandle<RefreshReport>>,
}

impl RefreshHandle {
    fn noop() -> Self {
        Self {
            epoch: None,
            join: None,
        }
    }

    /// True when the entity was already shown and nothing started.
    pub fn is_noop(&self) -> bool {
        self.join.is_none()
    }

    pub fn epoch(&self) -> Option<u64> {
        self.epoch
    }

    /// Waits until every field task has committed or been discarded.
    pub async fn wait(self) -> RefreshReport {
        let Some(join) = self.join else {
            return RefreshReport::default();
        };
        match join.await {
            Ok(report) => report,
            Err(err) => {
                warn!(error = %err, "refresh supervisor failed");
                RefreshReport {
                    epoch: self.epoch,
                    outcomes: BTreeMap::new(),
                }
            }
        }
    }
}

/// Fills a [`ProfileView`] from the network. Each refresh gets a new
/// epoch; starting one cancels the previous, and only the current epoch
/// may write to the view.
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub fn new(services: Services, runtime: Handle) -> Self {
        Self {
            inner: Arc::new(Inner {
                services,
                view: Arc::new(ProfileView::default()),
                runtime,
                current: Mutex::new(None),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn view(&self) -> Arc<ProfileView> {
        self.inner.view.clone()
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.inner.services.identity
    }

    /// Shows `user`. A no-op when it is already shown.
    pub fn refresh(&self, user: UserProfile) -> RefreshHandle {
        self.inner.start(user, None, false)
    }

    /// Cancels outstanding work and releases the avatar.
    pub fn dispose(&self) {
        let previous = self.inner.current.lock().take();
        if let Some(epoch) = previous {
            epoch.token.cancel();
        }
        let avatar = self.inner.view.clear();
        drop(avatar);
    }

    /// Saves `edit` to the signed-in profile and shows the result. Returns
    /// `None` when another refresh started while the update was in flight.
    pub async fn commit_edit(
        &self,
        edit: ProfileEdit,
    ) -> Result<Option<RefreshHandle>, ProfileError> {
        let (epoch, user) = self.inner.focus()?;
        if !self.inner.services.identity.is(&user) {
            return Err(ProfileError::NotOwnProfile);
        }
        let updated = self.inner.services.api.update_profile(&edit).await?;
        Ok(self.inner.show_if_current(&epoch, updated))
    }

    /// Uploads `item` as the new profile image, then reloads the profile.
    pub async fn change_avatar(
        &self,
        item: &dyn MediaItem,
    ) -> Result<Option<RefreshHandle>, ProfileError> {
        let (epoch, user) = self.inner.focus()?;
        if !self.inner.services.identity.is(&user) {
            return Err(ProfileError::NotOwnProfile);
        }
        validate_icon(item)?;

        let api = &self.inner.services.api;
        api.update_profile_image(item).await?;
        let reloaded = api.show_user(&user.screen_name).await?;
        Ok(self.inner.show_if_current(&epoch, reloaded))
    }

    pub async fn follow(&self) -> Result<TaskOutcome, ProfileError> {
        self.act(UserAction::Follow).await
    }

    pub async fn unfollow(&self) -> Result<TaskOutcome, ProfileError> {
        self.act(UserAction::Unfollow).await
    }

    pub async fn block(&self) -> Result<TaskOutcome, ProfileError> {
        self.act(UserAction::Block).await
    }

    pub async fn unblock(&self) -> Result<TaskOutcome, ProfileError> {
        self.act(UserAction::Unblock).await
    }

    pub async fn report_spam(&self) -> Result<TaskOutcome, ProfileError> {
        self.act(UserAction::ReportSpam).await
    }

    /// Runs `action` against the shown user, then updates the relationship
    /// field. A known relationship is updated in place; otherwise it is
    /// fetched again.
    pub async fn act(&self, action: UserAction) -> Result<TaskOutcome, ProfileError> {
        let (epoch, user) = self.inner.focus()?;
        let identity = &self.inner.services.identity;
        if identity.is(&user) {
            return Err(ProfileError::OwnProfile);
        }
        let api = &self.inner.services.api;
        let screen_name = user.screen_name.as_str();
        match action {
            UserAction::Follow => api.follow(screen_name).await?,
            UserAction::Unfollow => api.unfollow(screen_name).await?,
            UserAction::Block => api.block(screen_name).await?,
            UserAction::Unblock => api.unblock(screen_name).await?,
            UserAction::ReportSpam => api.report_spam(screen_name).await?,
        }
        info!(epoch = epoch.id, ?action, user = %screen_name, "user action done");

        let mut derived = false;
        let committed = self.inner.view.apply(epoch.id, &epoch.token, |snap| {
            if let RelationshipField::Known(rel) = snap.relationship {
                snap.relationship = RelationshipField::Known(action.relationship_after(rel));
                derived = true;
            }
        });
        if !committed {
            return Ok(TaskOutcome::Discarded);
        }
        if derived {
            return Ok(TaskOutcome::Committed);
        }

        let fetch = api.fetch_relationship(&identity.screen_name, screen_name);
        let Some(result) = until_cancelled(&epoch.token, fetch).await else {
            return Ok(TaskOutcome::Discarded);
        };
        let (field, outcome) = match result {
            Ok(rel) => (RelationshipField::Known(rel), TaskOutcome::Committed),
            Err(err) => {
                warn!(epoch = epoch.id, error = %err, "relationship fetch failed");
                (RelationshipField::Unknown, TaskOutcome::Degraded)
            }
        };
        Ok(self.inner.commit(&epoch, outcome, |snap| snap.relationship = field))
    }
}

impl Drop for RefreshCoordinator {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl Inner {
    /// The current epoch together with the user it shows.
    fn focus(&self) -> Result<(Epoch, UserProfile), ProfileError> {
        let epoch = self
            .current
            .lock()
            .clone()
            .ok_or(ProfileError::NothingShown)?;
        let snapshot = self.view.snapshot();
        match snapshot.user {
            Some(user) if snapshot.epoch == epoch.id => Ok((epoch, user)),
            _ => Err(ProfileError::NothingShown),
        }
    }

    fn show_if_current(self: &Arc<Self>, epoch: &Epoch, user: UserProfile) -> Option<RefreshHandle> {
        let handle = self.start(user, Some(epoch.id), true);
        if handle.is_noop() {
            debug!(epoch = epoch.id, "profile action superseded; result dropped");
            None
        } else {
            Some(handle)
        }
    }

    /// Swaps in a new epoch and launches the field tasks. With `expected`
    /// set, only proceeds while that epoch is still current.
    fn start(
        self: &Arc<Self>,
        user: UserProfile,
        expected: Option<u64>,
        force: bool,
    ) -> RefreshHandle {
        let epoch = Epoch {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            token: CancellationToken::new(),
        };
        let is_self = self.services.identity.is(&user);

        {
            let mut current = self.current.lock();
            if let Some(expected) = expected {
                if current.as_ref().map(|e| e.id) != Some(expected) {
                    return RefreshHandle::noop();
                }
            }
            if !force && current.is_some() && self.view.displays(&user) {
                return RefreshHandle::noop();
            }
            let previous = std::mem::replace(&mut *current, Some(epoch.clone()));
            if let Some(previous) = previous {
                previous.token.cancel();
                debug!(epoch = previous.id, "refresh superseded");
            }
            self.view.reset(epoch.id, &user, is_self);
        }
        info!(epoch = epoch.id, user = %user.screen_name, "profile refresh started");

        let user = Arc::new(user);
        let mut tasks = JoinSet::new();
        for task in FieldTask::ALL {
            let inner = self.clone();
            let epoch = epoch.clone();
            let user = user.clone();
            tasks.spawn_on(
                async move { (task, inner.run_task(task, &epoch, &user).await) },
                &self.runtime,
            );
        }

        let id = epoch.id;
        let join = self.runtime.spawn(async move {
            let mut report = RefreshReport {
                epoch: Some(id),
                outcomes: BTreeMap::new(),
            };
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((task, outcome)) => {
                        report.outcomes.insert(task, outcome);
                    }
                    Err(err) => warn!(epoch = id, error = %err, "profile field task failed"),
                }
            }
            debug!(epoch = id, "profile refresh finished");
            report
        });

        RefreshHandle {
            epoch: Some(id),
            join: Some(join),
        }
    }

    async fn run_task(&self, task: FieldTask, epoch: &Epoch, user: &UserProfile) -> TaskOutcome {
        let outcome = match task {
            FieldTask::Description => self.load_description(epoch, user).await,
            FieldTask::RecentStatus => self.load_recent_status(epoch, user).await,
            FieldTask::WebLink => self.load_web_link(epoch, user).await,
            FieldTask::Avatar => self.load_avatar(epoch, user).await,
            FieldTask::Relationship => self.load_relationship(epoch, user).await,
        };
        if outcome == TaskOutcome::Discarded {
            debug!(epoch = epoch.id, ?task, "discarding stale field");
        }
        outcome
    }

    fn commit(
        &self,
        epoch: &Epoch,
        outcome: TaskOutcome,
        f: impl FnOnce(&mut ProfileSnapshot),
    ) -> TaskOutcome {
        if self.view.apply(epoch.id, &epoch.token, f) {
            outcome
        } else {
            TaskOutcome::Discarded
        }
    }

    /// Replaces each entity's target with the fully expanded URL.
    async fn expand_urls(&self, epoch: &Epoch, urls: &mut [UrlEntity]) -> Option<()> {
        for entity in urls.iter_mut() {
            let target = entity.expanded_url.clone().unwrap_or_else(|| entity.url.clone());
            let expanded =
                until_cancelled(&epoch.token, self.services.expander.expand(&target)).await?;
            entity.expanded_url = Some(expanded);
        }
        Some(())
    }

    async fn load_description(&self, epoch: &Epoch, user: &UserProfile) -> TaskOutcome {
        let text = user.description.clone().unwrap_or_default();
        let mut urls = user.entities.description.urls.clone();
        if self.expand_urls(epoch, &mut urls).await.is_none() {
            return TaskOutcome::Discarded;
        }
        let html = render::auto_link_html(&text, &urls);
        self.commit(epoch, TaskOutcome::Committed, |snap| {
            snap.description = FieldState::Ready(html)
        })
    }

    async fn load_recent_status(&self, epoch: &Epoch, user: &UserProfile) -> TaskOutcome {
        let Some(status) = user.status.as_ref() else {
            let state = if user.protected {
                FieldState::Failed("protected account".to_string())
            } else {
                FieldState::Ready(String::new())
            };
            return self.commit(epoch, TaskOutcome::Skipped, |snap| snap.recent_status = state);
        };
        let mut status = status.clone();
        if self
            .expand_urls(epoch, &mut status.entities.urls)
            .await
            .is_none()
        {
            return TaskOutcome::Discarded;
        }
        let html = render::recent_status_html(&status);
        self.commit(epoch, TaskOutcome::Committed, |snap| {
            snap.recent_status = FieldState::Ready(html)
        })
    }

    async fn load_web_link(&self, epoch: &Epoch, user: &UserProfile) -> TaskOutcome {
        let declared = user
            .entities
            .url
            .as_ref()
            .and_then(|group| group.urls.first())
            .and_then(|entity| entity.expanded_url.clone())
            .or_else(|| user.url.clone())
            .filter(|url| !url.trim().is_empty());
        let Some(declared) = declared else {
            return self.commit(epoch, TaskOutcome::Skipped, |snap| {
                snap.web_link = FieldState::Ready(None)
            });
        };
        let Some(link) =
            until_cancelled(&epoch.token, self.services.expander.expand(&declared)).await
        else {
            return TaskOutcome::Discarded;
        };
        self.commit(epoch, TaskOutcome::Committed, |snap| {
            snap.web_link = FieldState::Ready(Some(link))
        })
    }

    async fn load_avatar(&self, epoch: &Epoch, user: &UserProfile) -> TaskOutcome {
        let Some(url) = user.profile_image_url_https.as_deref().map(bigger_avatar_url) else {
            return self.install(epoch, None, AvatarState::None, TaskOutcome::Skipped);
        };
        let Some(loaded) = until_cancelled(&epoch.token, self.services.images.load(&url)).await
        else {
            return TaskOutcome::Discarded;
        };
        match loaded {
            Ok(image) => {
                let state = AvatarState::Loaded {
                    width: image.width(),
                    height: image.height(),
                };
                self.install(epoch, Some(image), state, TaskOutcome::Committed)
            }
            Err(err) => {
                warn!(epoch = epoch.id, %url, error = %err, "avatar load failed");
                let state = AvatarState::Failed(err.to_string());
                self.install(epoch, None, state, TaskOutcome::Degraded)
            }
        }
    }

    /// Installs the new avatar first, then lets the old one go.
    fn install(
        &self,
        epoch: &Epoch,
        image: Option<MemoryImage>,
        state: AvatarState,
        outcome: TaskOutcome,
    ) -> TaskOutcome {
        match self.view.install_avatar(epoch.id, &epoch.token, image, state) {
            Ok(previous) => {
                drop(previous);
                outcome
            }
            Err(unused) => {
                drop(unused);
                TaskOutcome::Discarded
            }
        }
    }

    async fn load_relationship(&self, epoch: &Epoch, user: &UserProfile) -> TaskOutcome {
        let identity = &self.services.identity;
        if identity.is(user) {
            return TaskOutcome::Skipped;
        }
        let fetch = self
            .services
            .api
            .fetch_relationship(&identity.screen_name, &user.screen_name);
        let Some(result) = until_cancelled(&epoch.token, fetch).await else {
            return TaskOutcome::Discarded;
        };
        match result {
            Ok(rel) => self.commit(epoch, TaskOutcome::Committed, |snap| {
                snap.relationship = RelationshipField::Known(rel)
            }),
            Err(err) => {
                warn!(epoch = epoch.id, error = %err, "relationship fetch failed");
                self.commit(epoch, TaskOutcome::Degraded, |snap| {
                    snap.relationship = RelationshipField::Unknown
                })
            }
        }
    }
}

async fn until_cancelled<F: Future>(token: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = token.cancelled() => None,
        out = fut => Some(out),
    }
}

/// Profile images come in a 48px `_normal` variant by default.
pub fn bigger_avatar_url(url: &str) -> String {
    match url.rfind("_normal") {
        Some(idx) => format!("{}_bigger{}", &url[..idx], &url[idx + "_normal".len()..]),
        None => url.to_string(),
    }
}

fn icon_limits() -> UploadLimits {
    UploadLimits::new(1, ICON_EXTENSIONS).with_default_max_size(MAX_ICON_SIZE)
}

fn validate_icon(item: &dyn MediaItem) -> Result<(), ValidationError> {
    let limits = icon_limits();
    if !item.exists() {
        return Err(ValidationError::MediaNotFound(item.name().to_string()));
    }
    let extension = item.extension();
    if !limits.check_extension(&extension) {
        return Err(ValidationError::UnsupportedExtension(extension));
    }
    let size = item
        .size()
        .map_err(|_| ValidationError::MediaNotFound(item.name().to_string()))?;
    if !limits.check_size(&extension, size) {
        return Err(ValidationError::FileTooLarge {
            name: item.name().to_string(),
            extension,
            size,
        });
    }
    Ok(())
}
