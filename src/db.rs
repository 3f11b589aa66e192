use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, FromRow, SqlitePool};

use crate::error::{Error, Result};

#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub name: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct Feed {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub name: String,
    pub url: String,
    pub user_id: i64,
    pub last_fetched_at: Option<DateTime<Utc>>,
}

/// A feed listed together with the name of the user who added it.
#[derive(Debug, Clone, FromRow)]
pub struct FeedWithOwner {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub user_name: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct FeedFollow {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub user_id: i64,
    pub feed_id: i64,
    pub user_name: String,
    pub feed_name: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct FollowedFeed {
    pub feed_id: i64,
    pub feed_name: String,
    pub feed_url: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct PostWithFeed {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub title: Option<String>,
    pub url: String,
    pub description: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub feed_id: i64,
    pub feed_name: String,
}

#[derive(Debug, Clone)]
pub struct NewPost<'a> {
    pub feed_id: i64,
    pub title: Option<&'a str>,
    pub url: &'a str,
    pub description: Option<&'a str>,
    pub published_at: Option<DateTime<Utc>>,
}

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                name TEXT NOT NULL UNIQUE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feeds (
                id INTEGER PRIMARY KEY,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                name TEXT NOT NULL,
                url TEXT NOT NULL UNIQUE,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                last_fetched_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feed_follows (
                id INTEGER PRIMARY KEY,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                feed_id INTEGER NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
                UNIQUE(user_id, feed_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS posts (
                id INTEGER PRIMARY KEY,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                title TEXT,
                url TEXT NOT NULL UNIQUE,
                description TEXT,
                published_at TEXT,
                feed_id INTEGER NOT NULL REFERENCES feeds(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_feeds_last_fetched ON feeds(last_fetched_at)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_posts_feed_published ON posts(feed_id, published_at DESC)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn create_user(&self, name: &str) -> Result<User> {
        let now = Utc::now();
        sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (created_at, updated_at, name)
            VALUES (?, ?, ?)
            RETURNING id, created_at, updated_at, name
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::from_insert(e, format!("user {name:?}")))
    }

    pub async fn get_user(&self, name: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    pub async fn get_user_by_id(&self, user_id: i64) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    pub async fn get_users(&self) -> Result<Vec<User>> {
        let users = sqlx::query_as::<_, User>("SELECT * FROM users ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(users)
    }

    pub async fn create_feed(&self, name: &str, url: &str, user_id: i64) -> Result<Feed> {
        let now = Utc::now();
        sqlx::query_as::<_, Feed>(
            r#"
            INSERT INTO feeds (created_at, updated_at, name, url, user_id)
            VALUES (?, ?, ?, ?, ?)
            RETURNING id, created_at, updated_at, name, url, user_id, last_fetched_at
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(name)
        .bind(url)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::from_insert(e, format!("feed {url:?}")))
    }

    pub async fn get_feed(&self, feed_id: i64) -> Result<Option<Feed>> {
        let feed = sqlx::query_as::<_, Feed>("SELECT * FROM feeds WHERE id = ?")
            .bind(feed_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(feed)
    }

    pub async fn get_feed_by_url(&self, url: &str) -> Result<Option<Feed>> {
        let feed = sqlx::query_as::<_, Feed>("SELECT * FROM feeds WHERE url = ?")
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        Ok(feed)
    }

    pub async fn get_feeds(&self) -> Result<Vec<FeedWithOwner>> {
        let feeds = sqlx::query_as::<_, FeedWithOwner>(
            r#"
            SELECT feeds.id, feeds.name, feeds.url, users.name AS user_name
            FROM feeds
            JOIN users ON users.id = feeds.user_id
            ORDER BY feeds.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(feeds)
    }

    pub async fn create_feed_follow(&self, user_id: i64, feed_id: i64) -> Result<FeedFollow> {
        let now = Utc::now();
        let (follow_id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO feed_follows (created_at, updated_at, user_id, feed_id)
            VALUES (?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(user_id)
        .bind(feed_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::from_insert(e, "feed follow"))?;

        let follow = sqlx::query_as::<_, FeedFollow>(
            r#"
            SELECT ff.id, ff.created_at, ff.updated_at, ff.user_id, ff.feed_id,
                   users.name AS user_name, feeds.name AS feed_name
            FROM feed_follows ff
            JOIN users ON users.id = ff.user_id
            JOIN feeds ON feeds.id = ff.feed_id
            WHERE ff.id = ?
            "#,
        )
        .bind(follow_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(follow)
    }

    /// Returns the number of follow rows removed (0 or 1).
    pub async fn delete_feed_follow(&self, user_id: i64, feed_id: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM feed_follows WHERE user_id = ? AND feed_id = ?")
            .bind(user_id)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn get_feed_follows_for_user(&self, user_id: i64) -> Result<Vec<FollowedFeed>> {
        let feeds = sqlx::query_as::<_, FollowedFeed>(
            r#"
            SELECT feeds.id AS feed_id, feeds.name AS feed_name, feeds.url AS feed_url
            FROM feed_follows ff
            JOIN feeds ON feeds.id = ff.feed_id
            WHERE ff.user_id = ?
            ORDER BY ff.id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(feeds)
    }

    /// Picks the feed that is most overdue: never fetched first, then the oldest fetch
    /// at or before `cutoff`.
    pub async fn get_next_feed_to_fetch(&self, cutoff: DateTime<Utc>) -> Result<Option<i64>> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT id FROM feeds
            WHERE last_fetched_at IS NULL OR last_fetched_at <= ?
            ORDER BY last_fetched_at ASC NULLS FIRST, id ASC
            LIMIT 1
            "#,
        )
        .bind(cutoff)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(id,)| id))
    }

    pub async fn get_feed_url(&self, feed_id: i64) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT url FROM feeds WHERE id = ?")
            .bind(feed_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(url,)| url))
    }

    pub async fn mark_feed_fetched(&self, feed_id: i64) -> Result<()> {
        let now = Utc::now();
        sqlx::query("UPDATE feeds SET last_fetched_at = ?, updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(now)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Inserts a post. Returns `false` when a post with the same URL is already stored.
    pub async fn create_post(&self, post: &NewPost<'_>) -> Result<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO posts (created_at, updated_at, title, url, description, published_at, feed_id)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(url) DO NOTHING
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(post.title)
        .bind(post.url)
        .bind(post.description)
        .bind(post.published_at)
        .bind(post.feed_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn get_posts_for_user(&self, user_id: i64, limit: i64) -> Result<Vec<PostWithFeed>> {
        let posts = sqlx::query_as::<_, PostWithFeed>(
            r#"
            SELECT posts.id, posts.created_at, posts.title, posts.url, posts.description,
                   posts.published_at, posts.feed_id, feeds.name AS feed_name
            FROM posts
            JOIN feeds ON feeds.id = posts.feed_id
            JOIN feed_follows ff ON ff.feed_id = posts.feed_id
            WHERE ff.user_id = ?
            ORDER BY posts.published_at DESC NULLS LAST, posts.id DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(posts)
    }

    /// Makes every insert of a post with `url` abort.
    #[cfg(test)]
    pub(crate) async fn reject_post_url(&self, url: &str) -> Result<()> {
        let trigger = format!(
            r#"
            CREATE TRIGGER reject_post BEFORE INSERT ON posts
            WHEN NEW.url = '{}'
            BEGIN
                SELECT RAISE(ABORT, 'post rejected');
            END
            "#,
            url.replace('\'', "''")
        );
        sqlx::query(&trigger).execute(&self.pool).await?;
        Ok(())
    }

    /// Removes every row from every table.
    pub async fn reset(&self) -> Result<()> {
        for table in ["posts", "feed_follows", "feeds", "users"] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }
}
