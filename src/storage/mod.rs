mod articles;
mod categories;
mod db;
mod feeds;
mod rules;
mod settings;
mod types;

pub use db::Database;
pub use types::{
    Article, ArticleFilter, ArticleQuery, DatabaseError, Feed, FeedKind, ImapConfig,
    LocalFlagChange, NewArticle, RuleRow, ScriptConfig, UpstreamFeedConfig, XpathConfig,
};
