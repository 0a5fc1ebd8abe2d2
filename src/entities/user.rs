use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::utils::snowflake::SnowflakeGenerator;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DisplayHint {
    #[default]
    Named,
    Anonymous,
}

/// Author details copied onto an item when it is written.
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AuthorSummary {
    pub user_id: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub display: DisplayHint,
}

/// Struct for giving to frontend
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PublicAuthor {
    pub user_id: Option<String>,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub display: DisplayHint,
    pub member_since: Option<f64>,
}

impl AuthorSummary {
    pub fn public(&self) -> PublicAuthor {
        match self.display {
            DisplayHint::Anonymous => PublicAuthor {
                user_id: None,
                display_name: "Anonymous".to_string(),
                avatar_url: None,
                display: DisplayHint::Anonymous,
                member_since: None,
            },
            DisplayHint::Named => PublicAuthor {
                user_id: Some(self.user_id.clone()),
                display_name: self.display_name.clone(),
                avatar_url: self.avatar_url.clone(),
                display: DisplayHint::Named,
                member_since: self.member_since(),
            },
        }
    }

    /// Account creation time in unix seconds, from the snowflake user id.
    pub fn member_since(&self) -> Option<f64> {
        SnowflakeGenerator::timestamp_ms(&self.user_id).map(|ms| ms as f64 / 1000.0)
    }
}
