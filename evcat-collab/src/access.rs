//! Room access policy and the membership registry behind it.
//!
//! An identity reaches a room when the room's membership key is in its
//! membership set or when it is a superuser. Credentials are verified
//! elsewhere; an [`Authenticator`] only maps an already-presented token to
//! an [`Identity`].

use std::collections::{BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;

/// Access and registry errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccessError {
    #[error("Access denied to room {0}")]
    Denied(String),

    #[error("Missing or invalid credentials")]
    Unauthenticated,

    #[error("Unknown user {0}")]
    UnknownUser(String),

    #[error("User {0} already exists")]
    UserAlreadyExists(String),
}

/// Membership key of a room identifier.
///
/// `room/<name>` and `/room/<name>` address the key `<name>`; any other
/// identifier is its own key, minus a leading `/`.
pub fn membership_key(room_id: &str) -> &str {
    let id = room_id.trim_start_matches('/');
    id.strip_prefix("room/").unwrap_or(id)
}

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user: String,
    pub rooms: BTreeSet<String>,
    pub superuser: bool,
}

impl Identity {
    pub fn new<I, S>(user: impl Into<String>, rooms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            user: user.into(),
            rooms: rooms.into_iter().map(Into::into).collect(),
            superuser: false,
        }
    }

    pub fn superuser(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            rooms: BTreeSet::new(),
            superuser: true,
        }
    }

    pub fn can_access(&self, room_id: &str) -> bool {
        self.superuser || self.rooms.contains(membership_key(room_id))
    }

    /// Fail with [`AccessError::Denied`] unless the room is reachable.
    pub fn check(&self, room_id: &str) -> Result<(), AccessError> {
        if self.can_access(room_id) {
            Ok(())
        } else {
            Err(AccessError::Denied(room_id.to_string()))
        }
    }
}

/// Maps a presented token to an identity.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: Option<&str>) -> Result<Identity, AccessError>;
}

#[derive(Debug, Clone)]
struct UserRecord {
    superuser: bool,
    rooms: BTreeSet<String>,
}

/// Users and their room memberships.
///
/// Registering a user makes them a member of their personal room, named
/// after the local part of their e-mail address.
#[derive(Debug, Default)]
pub struct MembershipRegistry {
    users: RwLock<HashMap<String, UserRecord>>,
}

impl MembershipRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, UserRecord>> {
        self.users.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, UserRecord>> {
        self.users.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register_user(&self, email: &str, superuser: bool) -> Result<Identity, AccessError> {
        let mut users = self.write();
        if users.contains_key(email) {
            return Err(AccessError::UserAlreadyExists(email.to_string()));
        }
        let personal = personal_room(email).to_string();
        let record = UserRecord {
            superuser,
            rooms: BTreeSet::from([personal]),
        };
        let identity = to_identity(email, &record);
        users.insert(email.to_string(), record);
        log::info!("Registered user {email}");
        Ok(identity)
    }

    pub fn get_user(&self, email: &str) -> Result<Identity, AccessError> {
        self.read()
            .get(email)
            .map(|record| to_identity(email, record))
            .ok_or_else(|| AccessError::UnknownUser(email.to_string()))
    }

    /// Returns whether the membership was added; adding twice is a no-op.
    pub fn add_user_to_room(&self, email: &str, room_id: &str) -> Result<bool, AccessError> {
        let mut users = self.write();
        let record = users
            .get_mut(email)
            .ok_or_else(|| AccessError::UnknownUser(email.to_string()))?;
        Ok(record.rooms.insert(membership_key(room_id).to_string()))
    }

    /// Returns whether a membership was removed; removing twice is a no-op.
    pub fn remove_user_from_room(&self, email: &str, room_id: &str) -> Result<bool, AccessError> {
        let mut users = self.write();
        let record = users
            .get_mut(email)
            .ok_or_else(|| AccessError::UnknownUser(email.to_string()))?;
        Ok(record.rooms.remove(membership_key(room_id)))
    }

    /// Rooms the user belongs to, sorted.
    pub fn rooms_for(&self, email: &str) -> Result<Vec<String>, AccessError> {
        self.read()
            .get(email)
            .map(|record| record.rooms.iter().cloned().collect())
            .ok_or_else(|| AccessError::UnknownUser(email.to_string()))
    }

    /// Users belonging to a room, sorted.
    pub fn members_of(&self, room_id: &str) -> Vec<String> {
        let key = membership_key(room_id);
        let mut members: Vec<String> = self
            .read()
            .iter()
            .filter(|(_, record)| record.rooms.contains(key))
            .map(|(email, _)| email.clone())
            .collect();
        members.sort();
        members
    }
}

fn personal_room(email: &str) -> &str {
    email.split_once('@').map_or(email, |(local, _)| local)
}

fn to_identity(email: &str, record: &UserRecord) -> Identity {
    Identity {
        user: email.to_string(),
        rooms: record.rooms.clone(),
        superuser: record.superuser,
    }
}

/// Resolves static tokens to users of a [`MembershipRegistry`].
///
/// Memberships are read at connection time, so registry changes apply to
/// the next connection attempt.
#[derive(Debug)]
pub struct TokenAuthenticator {
    registry: std::sync::Arc<MembershipRegistry>,
    tokens: HashMap<String, String>,
}

impl TokenAuthenticator {
    pub fn new(registry: std::sync::Arc<MembershipRegistry>) -> Self {
        Self {
            registry,
            tokens: HashMap::new(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>, email: impl Into<String>) -> Self {
        self.tokens.insert(token.into(), email.into());
        self
    }
}

impl Authenticator for TokenAuthenticator {
    fn authenticate(&self, token: Option<&str>) -> Result<Identity, AccessError> {
        let email = token
            .and_then(|t| self.tokens.get(t))
            .ok_or(AccessError::Unauthenticated)?;
        self.registry.get_user(email)
    }
}
