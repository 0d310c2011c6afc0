//! Subscription owner.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::EngineError;

/// The account a subscription belongs to: a user or an organization, never
/// both and never neither.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Owner {
    User(Uuid),
    Organization(Uuid),
}

impl Owner {
    /// Build an owner from the pair of nullable columns used in storage.
    pub fn from_columns(
        user_id: Option<Uuid>,
        organization_id: Option<Uuid>,
    ) -> Result<Self, EngineError> {
        match (user_id, organization_id) {
            (Some(user), None) => Ok(Owner::User(user)),
            (None, Some(org)) => Ok(Owner::Organization(org)),
            (Some(_), Some(_)) => Err(EngineError::Validation(
                "subscription owner has both a user and an organization".to_string(),
            )),
            (None, None) => Err(EngineError::Validation(
                "subscription owner has neither a user nor an organization".to_string(),
            )),
        }
    }

    pub fn user_id(&self) -> Option<Uuid> {
        match self {
            Owner::User(id) => Some(*id),
            Owner::Organization(_) => None,
        }
    }

    pub fn organization_id(&self) -> Option<Uuid> {
        match self {
            Owner::User(_) => None,
            Owner::Organization(id) => Some(*id),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Owner::User(_) => "user",
            Owner::Organization(_) => "organization",
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            Owner::User(id) | Owner::Organization(id) => *id,
        }
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exactly_one_column_is_required() {
        let id = Uuid::new_v4();
        assert_eq!(Owner::from_columns(Some(id), None).unwrap(), Owner::User(id));
        assert_eq!(
            Owner::from_columns(None, Some(id)).unwrap(),
            Owner::Organization(id)
        );
        assert!(matches!(
            Owner::from_columns(Some(id), Some(id)),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            Owner::from_columns(None, None),
            Err(EngineError::Validation(_))
        ));
    }
}
