use serde::{Deserialize, Serialize};

/// Signed unit change recorded by a counter shard.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(into = "i8", try_from = "i8")]
pub enum Delta {
    Increment,
    Decrement,
}

impl Delta {
    pub fn value(self) -> i64 {
        match self {
            Delta::Increment => 1,
            Delta::Decrement => -1,
        }
    }
}

impl From<Delta> for i8 {
    fn from(delta: Delta) -> Self {
        delta.value() as i8
    }
}

impl TryFrom<i8> for Delta {
    type Error = String;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Delta::Increment),
            -1 => Ok(Delta::Decrement),
            other => Err(format!("shard delta must be +1 or -1, got {}", other)),
        }
    }
}

/// Append-only record under `<item>/shards`. Never updated or removed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CounterShard {
    pub delta: Delta,
    pub created_at: i64,
}

/// Existence of `<item>/supporters/<user_id>` means the user supports the item.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SupportRecord {
    pub user_id: String,
    pub created_at: i64,
}
