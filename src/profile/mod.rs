//! The profile pane: observable field state plus the coordinator that
//! fills it from the network.

mod coordinator;

pub use coordinator::{
    HttpImageLoader, ImageLoadError, ImageLoader, RefreshCoordinator, RefreshHandle,
    RefreshReport, Services, UserAction,
};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::api::{ApiError, Relationship, UserProfile};
use crate::media::MemoryImage;
use crate::upload::ValidationError;

/// Label shown when the relationship could not be fetched.
pub const UNKNOWN_RELATIONSHIP: &str = "unknown";

#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("no profile is shown")]
    NothingShown,
    #[error("only your own profile can be changed")]
    NotOwnProfile,
    #[error("not available on your own profile")]
    OwnProfile,
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// The five fields populated asynchronously on every refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FieldTask {
    Description,
    RecentStatus,
    WebLink,
    Avatar,
    Relationship,
}

impl FieldTask {
    pub const ALL: [FieldTask; 5] = [
        FieldTask::Description,
        FieldTask::RecentStatus,
        FieldTask::WebLink,
        FieldTask::Avatar,
        FieldTask::Relationship,
    ];
}

/// How a field task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Committed,
    /// Committed a placeholder or error text instead of data.
    Degraded,
    /// The refresh was superseded; nothing was written.
    Discarded,
    /// Nothing to do for this entity.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FieldState<T> {
    #[default]
    Loading,
    Ready(T),
    Failed(String),
}

impl<T> FieldState<T> {
    pub fn ready(&self) -> Option<&T> {
        match self {
            FieldState::Ready(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, FieldState::Loading)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RelationshipField {
    /// Own profile, or nothing shown.
    #[default]
    Disabled,
    Loading,
    Known(Relationship),
    Unknown,
}

impl RelationshipField {
    pub fn label(&self) -> &'static str {
        match self {
            RelationshipField::Disabled | RelationshipField::Loading => "",
            RelationshipField::Unknown => UNKNOWN_RELATIONSHIP,
            RelationshipField::Known(rel) => match (rel.following, rel.followed_by) {
                (true, true) => "following each other",
                (true, false) => "following",
                (false, true) => "follows you",
                (false, false) => "not following",
            },
        }
    }

    pub fn can_follow(&self) -> bool {
        matches!(self, RelationshipField::Known(rel) if !rel.following)
    }

    pub fn can_unfollow(&self) -> bool {
        matches!(self, RelationshipField::Known(rel) if rel.following)
    }
}

/// Size of the installed avatar, or why there is none.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AvatarState {
    #[default]
    None,
    Loading,
    Loaded { width: u32, height: u32 },
    Failed(String),
}

/// Everything the pane displays. Fields that need no network are filled
/// the moment a refresh starts.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProfileSnapshot {
    pub epoch: u64,
    pub user: Option<UserProfile>,
    pub is_self: bool,
    pub screen_name: String,
    pub name: String,
    pub location: String,
    pub created_at: String,
    pub protected: bool,
    pub verified: bool,
    pub friends_count: u64,
    pub followers_count: u64,
    pub favourites_count: u64,
    pub statuses_count: u64,
    pub description: FieldState<String>,
    pub recent_status: FieldState<String>,
    pub web_link: FieldState<Option<String>>,
    pub avatar: AvatarState,
    pub relationship: RelationshipField,
}

impl ProfileSnapshot {
    fn loading(epoch: u64, user: &UserProfile, is_self: bool) -> Self {
        Self {
            epoch,
            user: Some(user.clone()),
            is_self,
            screen_name: user.screen_name.clone(),
            name: user.name.clone(),
            location: user.location.clone().unwrap_or_default(),
            created_at: user
                .created()
                .map(|when| crate::render::format_timestamp(&when))
                .unwrap_or_default(),
            protected: user.protected,
            verified: user.verified,
            friends_count: user.friends_count,
            followers_count: user.followers_count,
            favourites_count: user.favourites_count,
            statuses_count: user.statuses_count,
            description: FieldState::Loading,
            recent_status: FieldState::Loading,
            web_link: FieldState::Loading,
            avatar: AvatarState::Loading,
            relationship: if is_self {
                RelationshipField::Disabled
            } else {
                RelationshipField::Loading
            },
        }
    }
}

struct ViewState {
    snapshot: ProfileSnapshot,
    avatar: Option<MemoryImage>,
}

/// Observable state of one profile pane. Writers must name the epoch they
/// belong to; writes from any other epoch are refused.
pub struct ProfileView {
    state: Mutex<ViewState>,
    changes: watch::Sender<ProfileSnapshot>,
}

impl Default for ProfileView {
    fn default() -> Self {
        let (changes, _) = watch::channel(ProfileSnapshot::default());
        Self {
            state: Mutex::new(ViewState {
                snapshot: ProfileSnapshot::default(),
                avatar: None,
            }),
            changes,
        }
    }
}

impl ProfileView {
    pub fn snapshot(&self) -> ProfileSnapshot {
        self.state.lock().snapshot.clone()
    }

    /// Receives a fresh snapshot after every accepted write.
    pub fn subscribe(&self) -> watch::Receiver<ProfileSnapshot> {
        self.changes.subscribe()
    }

    pub fn with_avatar<R>(&self, f: impl FnOnce(Option<&MemoryImage>) -> R) -> R {
        f(self.state.lock().avatar.as_ref())
    }

    /// Whether `user` is exactly what the pane shows.
    pub(crate) fn displays(&self, user: &UserProfile) -> bool {
        self.state.lock().snapshot.user.as_ref() == Some(user)
    }

    /// Starts a new epoch. The previous avatar stays installed until the
    /// new one replaces it.
    pub(crate) fn reset(&self, epoch: u64, user: &UserProfile, is_self: bool) {
        let mut state = self.state.lock();
        state.snapshot = ProfileSnapshot::loading(epoch, user, is_self);
        self.changes.send_replace(state.snapshot.clone());
    }

    /// Applies `f` when `epoch` is still the shown one and `token` has not
    /// been cancelled. Returns whether the write happened.
    pub(crate) fn apply(
        &self,
        epoch: u64,
        token: &CancellationToken,
        f: impl FnOnce(&mut ProfileSnapshot),
    ) -> bool {
        let mut state = self.state.lock();
        if token.is_cancelled() || state.snapshot.epoch != epoch {
            return false;
        }
        f(&mut state.snapshot);
        self.changes.send_replace(state.snapshot.clone());
        true
    }

    /// Swaps in `image` and hands back the one it replaced, so the caller
    /// drops it after the lock is gone. A stale `image` comes back as `Err`.
    pub(crate) fn install_avatar(
        &self,
        epoch: u64,
        token: &CancellationToken,
        image: Option<MemoryImage>,
        avatar: AvatarState,
    ) -> Result<Option<MemoryImage>, Option<MemoryImage>> {
        let mut state = self.state.lock();
        if token.is_cancelled() || state.snapshot.epoch != epoch {
            return Err(image);
        }
        state.snapshot.avatar = avatar;
        let old = std::mem::replace(&mut state.avatar, image);
        self.changes.send_replace(state.snapshot.clone());
        Ok(old)
    }

    /// Empties the pane and returns the avatar it held.
    pub(crate) fn clear(&self) -> Option<MemoryImage> {
        let mut state = self.state.lock();
        state.snapshot = ProfileSnapshot::default();
        self.changes.send_replace(state.snapshot.clone());
        state.avatar.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::png_bytes;

    fn user(id: u64) -> UserProfile {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "screen_name": format!("user{}", id),
            "name": "Some One",
            "location": "Lisbon",
            "followers_count": 12,
        }))
        .unwrap()
    }

    #[test]
    fn reset_fills_offline_fields() {
        let view = ProfileView::default();
        view.reset(3, &user(1), false);
        let snap = view.snapshot();
        assert_eq!(snap.epoch, 3);
        assert_eq!(snap.screen_name, "user1");
        assert_eq!(snap.location, "Lisbon");
        assert_eq!(snap.followers_count, 12);
        assert!(snap.description.is_loading());
        assert_eq!(snap.relationship, RelationshipField::Loading);

        view.reset(4, &user(1), true);
        assert_eq!(view.snapshot().relationship, RelationshipField::Disabled);
    }

    #[test]
    fn stale_epoch_cannot_write() {
        let view = ProfileView::default();
        let token = CancellationToken::new();
        view.reset(1, &user(1), false);
        view.reset(2, &user(2), false);
        assert!(!view.apply(1, &token, |s| s.name = "stale".into()));
        assert!(view.apply(2, &token, |s| s.name = "fresh".into()));
        token.cancel();
        assert!(!view.apply(2, &token, |s| s.name = "late".into()));
        assert_eq!(view.snapshot().name, "fresh");
    }

    #[test]
    fn avatar_swap_returns_previous() {
        let view = ProfileView::default();
        let token = CancellationToken::new();
        view.reset(1, &user(1), false);

        let first = MemoryImage::decode(&png_bytes(2, 2)).unwrap();
        let first_watch = first.watch();
        let loaded = AvatarState::Loaded { width: 2, height: 2 };
        let old = view.install_avatar(1, &token, Some(first), loaded.clone()).unwrap();
        assert!(old.is_none());

        let second = MemoryImage::decode(&png_bytes(3, 3)).unwrap();
        let old = view.install_avatar(1, &token, Some(second), loaded).unwrap();
        drop(old);
        assert!(!first_watch.is_alive());
        assert_eq!(view.with_avatar(|img| img.map(|i| i.width())), Some(3));

        let stale = MemoryImage::decode(&png_bytes(4, 4)).unwrap();
        let rejected = view.install_avatar(9, &token, Some(stale), AvatarState::None);
        assert!(matches!(rejected, Err(Some(_))));
    }

    #[test]
    fn relationship_labels() {
        let both = RelationshipField::Known(Relationship {
            following: true,
            followed_by: true,
        });
        assert_eq!(both.label(), "following each other");
        assert!(both.can_unfollow());
        assert!(!both.can_follow());
        assert_eq!(RelationshipField::Unknown.label(), UNKNOWN_RELATIONSHIP);
        assert!(!RelationshipField::Unknown.can_follow());
    }

    #[tokio::test]
    async fn subscribers_see_writes() {
        let view = ProfileView::default();
        let mut rx = view.subscribe();
        view.reset(1, &user(5), false);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().screen_name, "user5");
    }
}
