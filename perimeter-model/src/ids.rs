use std::{fmt, str::FromStr};

use crate::error::ModelError;

/// Strongly typed organization identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct OrgId(pub i32);

/// Strongly typed scan group identifier. Unique only within an organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct GroupId(pub i32);

/// Strongly typed user identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct UserId(pub i32);

macro_rules! int_id {
    ($name:ident, $label:literal) => {
        impl $name {
            pub fn get(self) -> i32 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = ModelError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.trim().parse::<i32>().map($name).map_err(|err| {
                    ModelError::InvalidId(format!(
                        "{} '{}': {}",
                        $label, s, err
                    ))
                })
            }
        }

        impl From<i32> for $name {
            fn from(value: i32) -> Self {
                $name(value)
            }
        }
    };
}

int_id!(OrgId, "org id");
int_id!(GroupId, "group id");
int_id!(UserId, "user id");

/// Identity of a scan group across tenants. Every shared-state entry (work
/// queue, seen set, status, cached configuration) is sharded by this key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GroupKey {
    pub org_id: OrgId,
    pub group_id: GroupId,
}

impl GroupKey {
    pub fn new(org_id: impl Into<OrgId>, group_id: impl Into<GroupId>) -> Self {
        Self {
            org_id: org_id.into(),
            group_id: group_id.into(),
        }
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.org_id, self.group_id)
    }
}

impl FromStr for GroupKey {
    type Err = ModelError;

    /// Parses the `org:group` form produced by `Display`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (org, group) = s.split_once(':').ok_or_else(|| {
            ModelError::InvalidId(format!("group key '{s}' is not org:group"))
        })?;
        Ok(Self {
            org_id: org.parse()?,
            group_id: group.parse()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_key_display_round_trips() {
        let key = GroupKey::new(7, 42);
        assert_eq!(key.to_string(), "7:42");
        assert_eq!("7:42".parse::<GroupKey>().unwrap(), key);
    }

    #[test]
    fn group_key_rejects_malformed_input() {
        assert!("742".parse::<GroupKey>().is_err());
        assert!("7:x".parse::<GroupKey>().is_err());
    }
}
