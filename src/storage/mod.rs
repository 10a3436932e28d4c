mod articles;
mod categories;
mod schema;
mod sources;
mod types;

pub use schema::Database;
pub use types::{
    Article, ArticleQuery, CacheHints, Category, DatabaseError, Labels, NewSource, Source,
    StoredItem, SyncReport, MAX_PAGE_SIZE,
};
