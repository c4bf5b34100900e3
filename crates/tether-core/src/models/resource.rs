//! Workspace resource snapshots

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A unique identifier for a workspace app, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AppId(Uuid);

/// A unique identifier for a resource within an app
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceId(Uuid);

macro_rules! uuid_id {
    ($name:ident) => {
        impl $name {
            /// Create a new unique ID using UUID v7
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            /// Get the string representation of this ID
            #[must_use]
            pub fn as_str(&self) -> String {
                self.0.to_string()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

uuid_id!(AppId);
uuid_id!(ResourceId);

/// The kind of a workspace resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Board,
    Event,
    Page,
    Template,
    Profile,
}

impl ResourceKind {
    /// Stable string form used as a storage discriminator
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Board => "board",
            Self::Event => "event",
            Self::Page => "page",
            Self::Template => "template",
            Self::Profile => "profile",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "board" => Ok(Self::Board),
            "event" => Ok(Self::Event),
            "page" => Ok(Self::Page),
            "template" => Ok(Self::Template),
            "profile" => Ok(Self::Profile),
            other => Err(format!("unknown resource kind: {other}")),
        }
    }
}

/// A three-component semantic version pinned by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(pub u32, pub u32, pub u32);

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.0, self.1, self.2)
    }
}

impl FromStr for Version {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().splitn(3, '.');
        let mut next = |name: &str| {
            parts
                .next()
                .ok_or_else(|| format!("version is missing its {name} component: {s}"))?
                .parse::<u32>()
                .map_err(|_| format!("invalid version component in: {s}"))
        };
        let major = next("major")?;
        let minor = next("minor")?;
        let patch = next("patch")?;
        Ok(Self(major, minor, patch))
    }
}

/// A versioned, cached copy of a workspace resource.
///
/// The `body` is the opaque resource document; its shape depends on `kind`.
/// A snapshot read with an explicitly pinned `version` is immutable: the
/// synchronizer never overwrites it with reconciled remote data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    /// Unique identifier
    pub id: ResourceId,
    /// App this resource belongs to
    pub app_id: AppId,
    /// Resource kind
    pub kind: ResourceKind,
    /// Explicit revision, when the resource is version-pinned
    pub version: Option<Version>,
    /// Last update timestamp (Unix ms)
    pub updated_at: i64,
    /// Opaque resource document
    pub body: Value,
}

impl ResourceSnapshot {
    /// Create a new snapshot with the given body
    #[must_use]
    pub fn new(app_id: AppId, kind: ResourceKind, body: Value) -> Self {
        Self {
            id: ResourceId::new(),
            app_id,
            kind,
            version: None,
            updated_at: crate::util::unix_timestamp_millis_now(),
            body,
        }
    }
}
