use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;

use crate::database::DocRef;
use crate::entities::user::{AuthorSummary, PublicAuthor};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Breakthrough,
    Healing,
    Provision,
    Restoration,
    Calling,
    Growth,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::Breakthrough,
        Category::Healing,
        Category::Provision,
        Category::Restoration,
        Category::Calling,
        Category::Growth,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Breakthrough => "breakthrough",
            Category::Healing => "healing",
            Category::Provision => "provision",
            Category::Restoration => "restoration",
            Category::Calling => "calling",
            Category::Growth => "growth",
        }
    }
}

impl FromStr for Category {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or(UnknownName(s))
    }
}

/// Kind of post. Older clients sent plural names; both are accepted, the
/// singular is canonical.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum PostType {
    #[serde(alias = "testimonies")]
    Testimony,
    #[serde(alias = "verdicts")]
    Verdict,
    #[serde(alias = "prayers")]
    Prayer,
    #[serde(alias = "praises")]
    Praise,
}

impl PostType {
    pub const ALL: [PostType; 4] = [
        PostType::Testimony,
        PostType::Verdict,
        PostType::Prayer,
        PostType::Praise,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PostType::Testimony => "testimony",
            PostType::Verdict => "verdict",
            PostType::Prayer => "prayer",
            PostType::Praise => "praise",
        }
    }

    fn plural(&self) -> &'static str {
        match self {
            PostType::Testimony => "testimonies",
            PostType::Verdict => "verdicts",
            PostType::Prayer => "prayers",
            PostType::Praise => "praises",
        }
    }
}

impl FromStr for PostType {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        PostType::ALL
            .into_iter()
            .find(|t| t.as_str() == s || t.plural() == s)
            .ok_or(UnknownName(s))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ReactionKind {
    Praying,
    Believing,
    Encouraging,
    Inspired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownName(pub String);

impl fmt::Display for UnknownName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown name '{}'", self.0)
    }
}

impl std::error::Error for UnknownName {}

/// Which slice of a feed a pager tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedFilter {
    All,
    Category(Category),
    Type(PostType),
}

impl FeedFilter {
    /// Equality constraint the store applies, if any.
    pub fn constraint(&self) -> Option<(&'static str, Value)> {
        match self {
            FeedFilter::All => None,
            FeedFilter::Category(c) => Some(("category", Value::from(c.as_str()))),
            FeedFilter::Type(t) => Some(("post_type", Value::from(t.as_str()))),
        }
    }

    #[cfg(test)]
    pub fn matches(&self, item: &FeedItem) -> bool {
        match self {
            FeedFilter::All => true,
            FeedFilter::Category(c) => item.category == Some(*c),
            FeedFilter::Type(t) => item.post_type == Some(*t),
        }
    }

    /// Filters whose pages could contain `item`.
    pub fn covering(item: &FeedItem) -> Vec<FeedFilter> {
        let mut filters = vec![FeedFilter::All];
        filters.extend(item.category.map(FeedFilter::Category));
        filters.extend(item.post_type.map(FeedFilter::Type));
        filters
    }
}

impl FromStr for FeedFilter {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("all") {
            return Ok(FeedFilter::All);
        }
        s.parse::<Category>()
            .map(FeedFilter::Category)
            .or_else(|_| s.parse::<PostType>().map(FeedFilter::Type))
    }
}

impl fmt::Display for FeedFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedFilter::All => f.write_str("all"),
            FeedFilter::Category(c) => f.write_str(c.as_str()),
            FeedFilter::Type(t) => f.write_str(t.as_str()),
        }
    }
}

/// The two feeds built on the same item model.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FeedKind {
    Feed,
    Wall,
}

impl FeedKind {
    pub fn collection(&self) -> &'static str {
        match self {
            FeedKind::Feed => "feed_items",
            FeedKind::Wall => "wall_items",
        }
    }

    pub fn item_ref(&self, item_id: &str) -> DocRef {
        DocRef::new(self.collection(), item_id)
    }
}

/// Stored form of a feed or wall entry.
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FeedItem {
    pub id: String,
    pub author: AuthorSummary,
    pub body: String,
    /// Unix milliseconds; the feed's sort key.
    pub created_at: i64,
    pub category: Option<Category>,
    pub post_type: Option<PostType>,
    #[serde(default)]
    pub reactions: BTreeMap<ReactionKind, u64>,
    #[serde(default)]
    pub user_reactions: BTreeMap<String, ReactionKind>,
    #[serde(default)]
    pub support_base: u64,
    #[serde(default)]
    pub support_count: u64,
}

impl FeedItem {
    #[cfg(test)]
    pub fn reaction_count(&self, kind: ReactionKind) -> u64 {
        self.reactions.get(&kind).copied().unwrap_or(0)
    }

    pub fn reaction_of(&self, user_id: &str) -> Option<ReactionKind> {
        self.user_reactions.get(user_id).copied()
    }
}

/// Item as shown to a particular viewer: other users' reaction choices are
/// replaced by the viewer's own.
#[skip_serializing_none]
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct PublicFeedItem {
    pub id: String,
    pub author: PublicAuthor,
    pub body: String,
    pub created_at: i64,
    pub category: Option<Category>,
    pub post_type: Option<PostType>,
    pub reactions: BTreeMap<ReactionKind, u64>,
    pub my_reaction: Option<ReactionKind>,
    pub support_count: u64,
}

impl PublicFeedItem {
    pub fn for_viewer(item: &FeedItem, viewer: Option<&str>) -> Self {
        Self {
            id: item.id.clone(),
            author: item.author.public(),
            body: item.body.clone(),
            created_at: item.created_at,
            category: item.category,
            post_type: item.post_type,
            reactions: item.reactions.clone(),
            my_reaction: viewer.and_then(|user| item.reaction_of(user)),
            support_count: item.support_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::user::DisplayHint;
    use serde_json::json;

    #[test]
    fn plural_post_types_are_accepted() {
        assert_eq!("testimonies".parse::<PostType>().unwrap(), PostType::Testimony);
        assert_eq!("Verdict".parse::<PostType>().unwrap(), PostType::Verdict);
        let parsed: PostType = serde_json::from_value(json!("verdicts")).unwrap();
        assert_eq!(parsed, PostType::Verdict);
        assert_eq!(serde_json::to_value(parsed).unwrap(), json!("verdict"));
    }

    #[test]
    fn filter_keys_parse_and_print() {
        assert_eq!("all".parse::<FeedFilter>().unwrap(), FeedFilter::All);
        assert_eq!(
            "healing".parse::<FeedFilter>().unwrap(),
            FeedFilter::Category(Category::Healing)
        );
        assert_eq!(
            "testimonies".parse::<FeedFilter>().unwrap(),
            FeedFilter::Type(PostType::Testimony)
        );
        assert!("weather".parse::<FeedFilter>().is_err());
        assert_eq!(FeedFilter::Type(PostType::Testimony).to_string(), "testimony");
    }

    #[test]
    fn stored_item_round_trips_with_enum_keyed_maps() {
        let item = FeedItem {
            id: "1".to_string(),
            author: AuthorSummary {
                user_id: "u1".to_string(),
                display_name: "Ruth".to_string(),
                avatar_url: None,
                display: DisplayHint::Named,
            },
            body: "Grateful".to_string(),
            created_at: 10,
            category: Some(Category::Growth),
            post_type: None,
            reactions: BTreeMap::from([(ReactionKind::Praying, 2)]),
            user_reactions: BTreeMap::from([("u2".to_string(), ReactionKind::Praying)]),
            support_base: 0,
            support_count: 0,
        };
        let value = serde_json::to_value(&item).unwrap();
        assert_eq!(value["reactions"], json!({ "praying": 2 }));
        assert!(value.get("post_type").is_none());
        let back: FeedItem = serde_json::from_value(value).unwrap();
        assert_eq!(back, item);
    }

    #[test]
    fn viewer_sees_only_their_own_reaction() {
        let mut item: FeedItem = serde_json::from_value(json!({
            "id": "1",
            "author": { "user_id": "u1", "display_name": "Ruth" },
            "body": "b",
            "created_at": 1
        }))
        .unwrap();
        item.user_reactions
            .insert("u2".to_string(), ReactionKind::Inspired);

        let public = PublicFeedItem::for_viewer(&item, Some("u2"));
        assert_eq!(public.my_reaction, Some(ReactionKind::Inspired));
        let anonymous = PublicFeedItem::for_viewer(&item, None);
        assert_eq!(anonymous.my_reaction, None);
        assert!(serde_json::to_value(&anonymous).unwrap().get("user_reactions").is_none());
    }
}
