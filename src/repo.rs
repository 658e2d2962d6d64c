use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use crate::models::*;

#[derive(thiserror::Error, Debug)]
pub enum RepoError {
    #[error("not found")]
    NotFound,
    #[error("conflict")]
    Conflict,
    #[error("internal: {0}")]
    Internal(String),
}

pub type RepoResult<T> = Result<T, RepoError>;

use async_trait::async_trait;

/// Account creation input; the password arrives already hashed.
#[derive(Debug, Clone)]
pub struct CreateUser {
    pub name: String,
    pub email: String,
    pub password_hash: String,
    pub role: Role,
}

/// Post listing filters. `page` is 1-based; `skip = (page-1) * limit`.
#[derive(Debug, Clone, Default)]
pub struct PostQuery {
    pub q: Option<String>,
    pub tag: Option<String>,
    pub author: Option<Id>,
    pub page: u32,
    pub limit: u32,
}

#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub q: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub page: u32,
    pub limit: u32,
}

#[async_trait]
pub trait UserRepo: Send + Sync {
    /// Fails with `Conflict` when the email is already registered.
    async fn create_user(&self, new: CreateUser) -> RepoResult<User>;
    async fn get_user(&self, id: Id) -> RepoResult<User>;
    async fn get_user_by_email(&self, email: &str) -> RepoResult<User>;
    async fn list_users(&self) -> RepoResult<Vec<User>>;
    /// Bulk lookup used to attach author attribution to listings.
    async fn get_users(&self, ids: &[Id]) -> RepoResult<HashMap<Id, User>>;
    /// Partial profile update; email collisions fail with `Conflict`.
    async fn update_profile(&self, id: Id, upd: UpdateProfile) -> RepoResult<User>;
    async fn set_password(&self, id: Id, password_hash: String) -> RepoResult<()>;
}

#[async_trait]
pub trait PostRepo: Send + Sync {
    async fn create_post(&self, author_id: Id, new: NewPost) -> RepoResult<Post>;
    /// Returns the requested page (newest first) and the total match count.
    async fn list_posts(&self, query: &PostQuery) -> RepoResult<(Vec<Post>, u64)>;
    async fn get_post(&self, id: Id) -> RepoResult<Post>;
    async fn update_post(&self, id: Id, upd: UpdatePost) -> RepoResult<Post>;
    async fn delete_post(&self, id: Id) -> RepoResult<()>;
}

#[async_trait]
pub trait CommentRepo: Send + Sync {
    /// `parent`, when present, must be an existing comment on the same post.
    async fn create_comment(
        &self,
        post_id: Id,
        author_id: Id,
        content: String,
        parent: Option<Id>,
    ) -> RepoResult<Comment>;
    /// All comments of a post, creation order ascending.
    async fn list_comments(&self, post_id: Id) -> RepoResult<Vec<Comment>>;
}

#[async_trait]
pub trait EventRepo: Send + Sync {
    async fn create_event(&self, created_by: Id, new: NewEvent) -> RepoResult<Event>;
    /// Returns the requested page (date ascending) and the total match count.
    async fn list_events(&self, query: &EventQuery) -> RepoResult<(Vec<Event>, u64)>;
    async fn get_event(&self, id: Id) -> RepoResult<Event>;
    async fn update_event(&self, id: Id, upd: UpdateEvent) -> RepoResult<Event>;
    async fn delete_event(&self, id: Id) -> RepoResult<()>;
}

#[async_trait]
pub trait MessageRepo: Send + Sync {
    async fn create_message(&self, from_id: Id, to_id: Id, content: String) -> RepoResult<Message>;
    /// Marks everything `other -> me` as read and returns the full
    /// bidirectional history, oldest first. Marking and fetching happen as
    /// one atomic step so a concurrent send cannot be marked read without
    /// appearing in the returned history.
    async fn conversation(&self, me: Id, other: Id) -> RepoResult<Vec<Message>>;
    /// Unread counts addressed to `me`, grouped per sender.
    async fn unread_summary(&self, me: Id) -> RepoResult<Vec<UnreadEntry>>;
}

pub trait Repo: UserRepo + PostRepo + CommentRepo + EventRepo + MessageRepo {}

impl<T> Repo for T where T: UserRepo + PostRepo + CommentRepo + EventRepo + MessageRepo {}

#[cfg(feature = "inmem-store")]
pub mod inmem {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::path::{Path, PathBuf};

    const SNAPSHOT_PATH: &str = "data/state.json";

    #[derive(Default, Serialize, Deserialize)]
    struct State {
        users: HashMap<Id, User>,
        posts: HashMap<Id, Post>,
        comments: HashMap<Id, Comment>,
        events: HashMap<Id, Event>,
        messages: HashMap<Id, Message>,
        next_id: Id,
    }

    #[derive(Clone)]
    pub struct InMemRepo {
        state: Arc<RwLock<State>>,
        snapshot_path: Arc<PathBuf>,
    }

    impl InMemRepo {
        fn snapshot_path() -> PathBuf {
            match std::env::var("CAMPUS_DATA_DIR") {
                Ok(dir) => {
                    let mut p = PathBuf::from(dir);
                    p.push("state.json");
                    p
                }
                Err(_) => PathBuf::from(SNAPSHOT_PATH),
            }
        }

        fn load_state_from(path: &Path) -> State {
            match std::fs::read(path) {
                Ok(bytes) => match serde_json::from_slice::<State>(&bytes) {
                    Ok(s) => {
                        tracing::info!("loaded snapshot '{}'", path.display());
                        s
                    }
                    Err(e) => {
                        tracing::warn!(
                            "failed to parse snapshot '{}': {e}; starting empty",
                            path.display()
                        );
                        State::default()
                    }
                },
                Err(_) => State::default(),
            }
        }

        fn persist(&self) {
            let path = self.snapshot_path.clone();
            if let Ok(s) = serde_json::to_vec_pretty(&*self.state.read().unwrap()) {
                if let Some(dir) = path.parent() {
                    let _ = std::fs::create_dir_all(dir);
                }
                if let Err(e) = std::fs::write(&*path, s) {
                    tracing::warn!("failed to write snapshot '{}': {e}", path.display());
                }
            }
        }

        pub fn new() -> Self {
            let snapshot_path = Self::snapshot_path();
            let state = Self::load_state_from(&snapshot_path);
            Self {
                state: Arc::new(RwLock::new(state)),
                snapshot_path: Arc::new(snapshot_path),
            }
        }

        fn next_id(state: &mut State) -> Id {
            state.next_id += 1;
            state.next_id
        }
    }

    impl Default for InMemRepo {
        fn default() -> Self {
            Self::new()
        }
    }

    fn contains_ci(haystack: &str, needle: &str) -> bool {
        haystack.to_lowercase().contains(needle)
    }

    fn page_slice<T: Clone>(items: Vec<T>, page: u32, limit: u32) -> (Vec<T>, u64) {
        let total = items.len() as u64;
        let page = page.max(1);
        let limit = limit.max(1) as usize;
        let skip = (page as usize - 1) * limit;
        let slice = items.into_iter().skip(skip).take(limit).collect();
        (slice, total)
    }

    #[async_trait]
    impl UserRepo for InMemRepo {
        async fn create_user(&self, new: CreateUser) -> RepoResult<User> {
            let mut s = self.state.write().unwrap();
            if s.users.values().any(|u| u.email == new.email) {
                return Err(RepoError::Conflict);
            }
            let now = Utc::now();
            let id = Self::next_id(&mut s);
            let user = User {
                id,
                name: new.name,
                email: new.email,
                password_hash: new.password_hash,
                role: new.role,
                avatar_url: None,
                bio: None,
                created_at: now,
                updated_at: now,
            };
            s.users.insert(id, user.clone());
            drop(s);
            self.persist();
            Ok(user)
        }

        async fn get_user(&self, id: Id) -> RepoResult<User> {
            let s = self.state.read().unwrap();
            s.users.get(&id).cloned().ok_or(RepoError::NotFound)
        }

        async fn get_user_by_email(&self, email: &str) -> RepoResult<User> {
            let s = self.state.read().unwrap();
            s.users
                .values()
                .find(|u| u.email == email)
                .cloned()
                .ok_or(RepoError::NotFound)
        }

        async fn list_users(&self) -> RepoResult<Vec<User>> {
            let s = self.state.read().unwrap();
            Ok(s.users.values().cloned().collect())
        }

        async fn get_users(&self, ids: &[Id]) -> RepoResult<HashMap<Id, User>> {
            let s = self.state.read().unwrap();
            Ok(ids
                .iter()
                .filter_map(|id| s.users.get(id).map(|u| (*id, u.clone())))
                .collect())
        }

        async fn update_profile(&self, id: Id, upd: UpdateProfile) -> RepoResult<User> {
            let mut s = self.state.write().unwrap();
            // uniqueness check before taking the mutable borrow
            if let Some(ref email) = upd.email {
                if s.users.values().any(|u| u.email == *email && u.id != id) {
                    return Err(RepoError::Conflict);
                }
            }
            let user = s.users.get_mut(&id).ok_or(RepoError::NotFound)?;
            if let Some(name) = upd.name {
                user.name = name;
            }
            if let Some(email) = upd.email {
                user.email = email;
            }
            if let Some(avatar_url) = upd.avatar_url {
                user.avatar_url = Some(avatar_url);
            }
            if let Some(bio) = upd.bio {
                user.bio = Some(bio);
            }
            user.updated_at = Utc::now();
            let updated = user.clone();
            drop(s);
            self.persist();
            Ok(updated)
        }

        async fn set_password(&self, id: Id, password_hash: String) -> RepoResult<()> {
            let mut s = self.state.write().unwrap();
            let user = s.users.get_mut(&id).ok_or(RepoError::NotFound)?;
            user.password_hash = password_hash;
            user.updated_at = Utc::now();
            drop(s);
            self.persist();
            Ok(())
        }
    }

    #[async_trait]
    impl PostRepo for InMemRepo {
        async fn create_post(&self, author_id: Id, new: NewPost) -> RepoResult<Post> {
            let mut s = self.state.write().unwrap();
            let now = Utc::now();
            let id = Self::next_id(&mut s);
            let post = Post {
                id,
                author_id,
                title: new.title,
                content: new.content,
                tags: new.tags,
                attachments: new.attachments,
                created_at: now,
                updated_at: now,
            };
            s.posts.insert(id, post.clone());
            drop(s);
            self.persist();
            Ok(post)
        }

        async fn list_posts(&self, query: &PostQuery) -> RepoResult<(Vec<Post>, u64)> {
            let s = self.state.read().unwrap();
            let needle = query.q.as_ref().map(|q| q.to_lowercase());
            let mut matches: Vec<Post> = s
                .posts
                .values()
                .filter(|p| {
                    needle.as_ref().map_or(true, |n| {
                        contains_ci(&p.title, n) || contains_ci(&p.content, n)
                    })
                })
                .filter(|p| query.tag.as_ref().map_or(true, |t| p.tags.iter().any(|pt| pt == t)))
                .filter(|p| query.author.map_or(true, |a| p.author_id == a))
                .cloned()
                .collect();
            drop(s);
            // newest first, id as a stable tiebreak
            matches.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
            Ok(page_slice(matches, query.page, query.limit))
        }

        async fn get_post(&self, id: Id) -> RepoResult<Post> {
            let s = self.state.read().unwrap();
            s.posts.get(&id).cloned().ok_or(RepoError::NotFound)
        }

        async fn update_post(&self, id: Id, upd: UpdatePost) -> RepoResult<Post> {
            let mut s = self.state.write().unwrap();
            let post = s.posts.get_mut(&id).ok_or(RepoError::NotFound)?;
            if let Some(title) = upd.title {
                post.title = title;
            }
            if let Some(content) = upd.content {
                post.content = content;
            }
            if let Some(tags) = upd.tags {
                post.tags = tags;
            }
            if let Some(attachments) = upd.attachments {
                post.attachments = attachments;
            }
            post.updated_at = Utc::now();
            let updated = post.clone();
            drop(s);
            self.persist();
            Ok(updated)
        }

        async fn delete_post(&self, id: Id) -> RepoResult<()> {
            let mut s = self.state.write().unwrap();
            s.posts.remove(&id).ok_or(RepoError::NotFound)?;
            // comments go with their post
            s.comments.retain(|_, c| c.post_id != id);
            drop(s);
            self.persist();
            Ok(())
        }
    }

    #[async_trait]
    impl CommentRepo for InMemRepo {
        async fn create_comment(
            &self,
            post_id: Id,
            author_id: Id,
            content: String,
            parent: Option<Id>,
        ) -> RepoResult<Comment> {
            let mut s = self.state.write().unwrap();
            if !s.posts.contains_key(&post_id) {
                return Err(RepoError::NotFound);
            }
            if let Some(pid) = parent {
                match s.comments.get(&pid) {
                    Some(c) if c.post_id == post_id => {}
                    _ => return Err(RepoError::NotFound),
                }
            }
            let id = Self::next_id(&mut s);
            let comment = Comment {
                id,
                post_id,
                author_id,
                content,
                parent_id: parent,
                created_at: Utc::now(),
            };
            s.comments.insert(id, comment.clone());
            drop(s);
            self.persist();
            Ok(comment)
        }

        async fn list_comments(&self, post_id: Id) -> RepoResult<Vec<Comment>> {
            let s = self.state.read().unwrap();
            let mut v: Vec<_> = s
                .comments
                .values()
                .filter(|c| c.post_id == post_id)
                .cloned()
                .collect();
            v.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
            Ok(v)
        }
    }

    #[async_trait]
    impl EventRepo for InMemRepo {
        async fn create_event(&self, created_by: Id, new: NewEvent) -> RepoResult<Event> {
            let mut s = self.state.write().unwrap();
            let now = Utc::now();
            let id = Self::next_id(&mut s);
            let event = Event {
                id,
                title: new.title,
                description: new.description,
                date: new.date,
                location: new.location,
                created_by,
                attachments: new.attachments,
                created_at: now,
                updated_at: now,
            };
            s.events.insert(id, event.clone());
            drop(s);
            self.persist();
            Ok(event)
        }

        async fn list_events(&self, query: &EventQuery) -> RepoResult<(Vec<Event>, u64)> {
            let s = self.state.read().unwrap();
            let needle = query.q.as_ref().map(|q| q.to_lowercase());
            let mut matches: Vec<Event> = s
                .events
                .values()
                .filter(|e| {
                    needle.as_ref().map_or(true, |n| {
                        contains_ci(&e.title, n)
                            || e.description.as_ref().map_or(false, |d| contains_ci(d, n))
                    })
                })
                .filter(|e| query.from.map_or(true, |f| e.date >= f))
                .filter(|e| query.to.map_or(true, |t| e.date <= t))
                .cloned()
                .collect();
            drop(s);
            matches.sort_by(|a, b| a.date.cmp(&b.date).then(a.id.cmp(&b.id)));
            Ok(page_slice(matches, query.page, query.limit))
        }

        async fn get_event(&self, id: Id) -> RepoResult<Event> {
            let s = self.state.read().unwrap();
            s.events.get(&id).cloned().ok_or(RepoError::NotFound)
        }

        async fn update_event(&self, id: Id, upd: UpdateEvent) -> RepoResult<Event> {
            let mut s = self.state.write().unwrap();
            let event = s.events.get_mut(&id).ok_or(RepoError::NotFound)?;
            if let Some(title) = upd.title {
                event.title = title;
            }
            if let Some(description) = upd.description {
                event.description = Some(description);
            }
            if let Some(date) = upd.date {
                event.date = date;
            }
            if let Some(location) = upd.location {
                event.location = Some(location);
            }
            if let Some(attachments) = upd.attachments {
                event.attachments = attachments;
            }
            event.updated_at = Utc::now();
            let updated = event.clone();
            drop(s);
            self.persist();
            Ok(updated)
        }

        async fn delete_event(&self, id: Id) -> RepoResult<()> {
            let mut s = self.state.write().unwrap();
            s.events.remove(&id).ok_or(RepoError::NotFound)?;
            drop(s);
            self.persist();
            Ok(())
        }
    }

    #[async_trait]
    impl MessageRepo for InMemRepo {
        async fn create_message(
            &self,
            from_id: Id,
            to_id: Id,
            content: String,
        ) -> RepoResult<Message> {
            let mut s = self.state.write().unwrap();
            if !s.users.contains_key(&to_id) {
                return Err(RepoError::NotFound);
            }
            let id = Self::next_id(&mut s);
            let msg = Message {
                id,
                from_id,
                to_id,
                content,
                read: false,
                created_at: Utc::now(),
            };
            s.messages.insert(id, msg.clone());
            drop(s);
            self.persist();
            Ok(msg)
        }

        async fn conversation(&self, me: Id, other: Id) -> RepoResult<Vec<Message>> {
            // mark-read and fetch under one write lock
            let mut s = self.state.write().unwrap();
            for m in s.messages.values_mut() {
                if m.from_id == other && m.to_id == me && !m.read {
                    m.read = true;
                }
            }
            let mut history: Vec<Message> = s
                .messages
                .values()
                .filter(|m| {
                    (m.from_id == me && m.to_id == other) || (m.from_id == other && m.to_id == me)
                })
                .cloned()
                .collect();
            drop(s);
            self.persist();
            history.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
            Ok(history)
        }

        async fn unread_summary(&self, me: Id) -> RepoResult<Vec<UnreadEntry>> {
            let s = self.state.read().unwrap();
            let mut counts: HashMap<Id, i64> = HashMap::new();
            for m in s.messages.values() {
                if m.to_id == me && !m.read {
                    *counts.entry(m.from_id).or_default() += 1;
                }
            }
            let mut entries: Vec<UnreadEntry> = counts
                .into_iter()
                .map(|(from, count)| UnreadEntry { from, count })
                .collect();
            entries.sort_by_key(|e| e.from);
            Ok(entries)
        }
    }
}

// Postgres implementation (feature = "postgres-store")
#[cfg(feature = "postgres-store")]
pub mod pg {
    use super::*;
    use sqlx::postgres::PgRow;
    use sqlx::{Pool, Postgres, QueryBuilder, Row};

    #[derive(Clone)]
    pub struct PgRepo {
        pool: Pool<Postgres>,
    }

    impl PgRepo {
        pub fn new(pool: Pool<Postgres>) -> Self {
            Self { pool }
        }

        pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
            sqlx::migrate!("./migrations").run(&self.pool).await
        }
    }

    fn map_sqlx(e: sqlx::Error) -> RepoError {
        match e {
            sqlx::Error::RowNotFound => RepoError::NotFound,
            sqlx::Error::Database(db)
                if matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation) =>
            {
                RepoError::Conflict
            }
            // dangling user/post references surface as NotFound
            sqlx::Error::Database(db)
                if matches!(db.kind(), sqlx::error::ErrorKind::ForeignKeyViolation) =>
            {
                RepoError::NotFound
            }
            other => RepoError::Internal(other.to_string()),
        }
    }

    fn user_from_row(row: &PgRow) -> Result<User, sqlx::Error> {
        let role: String = row.try_get("role")?;
        Ok(User {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            email: row.try_get("email")?,
            password_hash: row.try_get("password_hash")?,
            role: Role::parse(&role).unwrap_or_default(),
            avatar_url: row.try_get("avatar_url")?,
            bio: row.try_get("bio")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn post_from_row(row: &PgRow) -> Result<Post, sqlx::Error> {
        Ok(Post {
            id: row.try_get("id")?,
            author_id: row.try_get("author_id")?,
            title: row.try_get("title")?,
            content: row.try_get("content")?,
            tags: row.try_get("tags")?,
            attachments: row.try_get("attachments")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn comment_from_row(row: &PgRow) -> Result<Comment, sqlx::Error> {
        Ok(Comment {
            id: row.try_get("id")?,
            post_id: row.try_get("post_id")?,
            author_id: row.try_get("author_id")?,
            content: row.try_get("content")?,
            parent_id: row.try_get("parent_id")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn event_from_row(row: &PgRow) -> Result<Event, sqlx::Error> {
        Ok(Event {
            id: row.try_get("id")?,
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            date: row.try_get("date")?,
            location: row.try_get("location")?,
            created_by: row.try_get("created_by")?,
            attachments: row.try_get("attachments")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn message_from_row(row: &PgRow) -> Result<Message, sqlx::Error> {
        Ok(Message {
            id: row.try_get("id")?,
            from_id: row.try_get("from_id")?,
            to_id: row.try_get("to_id")?,
            content: row.try_get("content")?,
            read: row.try_get("read")?,
            created_at: row.try_get("created_at")?,
        })
    }

    const USER_COLS: &str =
        "id, name, email, password_hash, role, avatar_url, bio, created_at, updated_at";
    const POST_COLS: &str =
        "id, author_id, title, content, tags, attachments, created_at, updated_at";
    const EVENT_COLS: &str =
        "id, title, description, date, location, created_by, attachments, created_at, updated_at";

    fn push_post_filters(qb: &mut QueryBuilder<'_, Postgres>, query: &PostQuery) {
        qb.push(" WHERE TRUE");
        if let Some(ref q) = query.q {
            let pattern = format!("%{}%", q);
            qb.push(" AND (title ILIKE ")
                .push_bind(pattern.clone())
                .push(" OR content ILIKE ")
                .push_bind(pattern)
                .push(")");
        }
        if let Some(ref tag) = query.tag {
            qb.push(" AND ").push_bind(tag.clone()).push(" = ANY(tags)");
        }
        if let Some(author) = query.author {
            qb.push(" AND author_id = ").push_bind(author);
        }
    }

    fn push_event_filters(qb: &mut QueryBuilder<'_, Postgres>, query: &EventQuery) {
        qb.push(" WHERE TRUE");
        if let Some(ref q) = query.q {
            let pattern = format!("%{}%", q);
            qb.push(" AND (title ILIKE ")
                .push_bind(pattern.clone())
                .push(" OR description ILIKE ")
                .push_bind(pattern)
                .push(")");
        }
        if let Some(from) = query.from {
            qb.push(" AND date >= ").push_bind(from);
        }
        if let Some(to) = query.to {
            qb.push(" AND date <= ").push_bind(to);
        }
    }

    #[async_trait]
    impl UserRepo for PgRepo {
        async fn create_user(&self, new: CreateUser) -> RepoResult<User> {
            let row = sqlx::query(&format!(
                "INSERT INTO users (name, email, password_hash, role) VALUES ($1,$2,$3,$4) RETURNING {USER_COLS}"
            ))
            .bind(&new.name)
            .bind(&new.email)
            .bind(&new.password_hash)
            .bind(new.role.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;
            user_from_row(&row).map_err(map_sqlx)
        }

        async fn get_user(&self, id: Id) -> RepoResult<User> {
            let row = sqlx::query(&format!("SELECT {USER_COLS} FROM users WHERE id = $1"))
                .bind(id)
                .fetch_one(&self.pool)
                .await
                .map_err(map_sqlx)?;
            user_from_row(&row).map_err(map_sqlx)
        }

        async fn get_user_by_email(&self, email: &str) -> RepoResult<User> {
            let row = sqlx::query(&format!("SELECT {USER_COLS} FROM users WHERE email = $1"))
                .bind(email)
                .fetch_one(&self.pool)
                .await
                .map_err(map_sqlx)?;
            user_from_row(&row).map_err(map_sqlx)
        }

        async fn list_users(&self) -> RepoResult<Vec<User>> {
            let rows = sqlx::query(&format!("SELECT {USER_COLS} FROM users ORDER BY id"))
                .fetch_all(&self.pool)
                .await
                .map_err(map_sqlx)?;
            rows.iter().map(|r| user_from_row(r).map_err(map_sqlx)).collect()
        }

        async fn get_users(&self, ids: &[Id]) -> RepoResult<HashMap<Id, User>> {
            let rows = sqlx::query(&format!(
                "SELECT {USER_COLS} FROM users WHERE id = ANY($1)"
            ))
            .bind(ids)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
            let mut map = HashMap::new();
            for row in &rows {
                let u = user_from_row(row).map_err(map_sqlx)?;
                map.insert(u.id, u);
            }
            Ok(map)
        }

        async fn update_profile(&self, id: Id, upd: UpdateProfile) -> RepoResult<User> {
            let row = sqlx::query(&format!(
                "UPDATE users SET name = COALESCE($2, name), email = COALESCE($3, email), avatar_url = COALESCE($4, avatar_url), bio = COALESCE($5, bio), updated_at = now() WHERE id = $1 RETURNING {USER_COLS}"
            ))
            .bind(id)
            .bind(upd.name.as_ref())
            .bind(upd.email.as_ref())
            .bind(upd.avatar_url.as_ref())
            .bind(upd.bio.as_ref())
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;
            user_from_row(&row).map_err(map_sqlx)
        }

        async fn set_password(&self, id: Id, password_hash: String) -> RepoResult<()> {
            let res = sqlx::query(
                "UPDATE users SET password_hash = $2, updated_at = now() WHERE id = $1",
            )
            .bind(id)
            .bind(&password_hash)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
            if res.rows_affected() == 0 {
                return Err(RepoError::NotFound);
            }
            Ok(())
        }
    }

    #[async_trait]
    impl PostRepo for PgRepo {
        async fn create_post(&self, author_id: Id, new: NewPost) -> RepoResult<Post> {
            let row = sqlx::query(&format!(
                "INSERT INTO posts (author_id, title, content, tags, attachments) VALUES ($1,$2,$3,$4,$5) RETURNING {POST_COLS}"
            ))
            .bind(author_id)
            .bind(&new.title)
            .bind(&new.content)
            .bind(&new.tags)
            .bind(&new.attachments)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;
            post_from_row(&row).map_err(map_sqlx)
        }

        async fn list_posts(&self, query: &PostQuery) -> RepoResult<(Vec<Post>, u64)> {
            let mut count_qb = QueryBuilder::new("SELECT COUNT(*) AS n FROM posts");
            push_post_filters(&mut count_qb, query);
            let total: i64 = count_qb
                .build()
                .fetch_one(&self.pool)
                .await
                .map_err(map_sqlx)?
                .try_get("n")
                .map_err(map_sqlx)?;

            let page = query.page.max(1) as i64;
            let limit = query.limit.max(1) as i64;
            let mut qb = QueryBuilder::new(format!("SELECT {POST_COLS} FROM posts"));
            push_post_filters(&mut qb, query);
            qb.push(" ORDER BY created_at DESC, id DESC LIMIT ")
                .push_bind(limit)
                .push(" OFFSET ")
                .push_bind((page - 1) * limit);
            let rows = qb.build().fetch_all(&self.pool).await.map_err(map_sqlx)?;
            let posts = rows
                .iter()
                .map(|r| post_from_row(r).map_err(map_sqlx))
                .collect::<RepoResult<Vec<_>>>()?;
            Ok((posts, total as u64))
        }

        async fn get_post(&self, id: Id) -> RepoResult<Post> {
            let row = sqlx::query(&format!("SELECT {POST_COLS} FROM posts WHERE id = $1"))
                .bind(id)
                .fetch_one(&self.pool)
                .await
                .map_err(map_sqlx)?;
            post_from_row(&row).map_err(map_sqlx)
        }

        async fn update_post(&self, id: Id, upd: UpdatePost) -> RepoResult<Post> {
            let row = sqlx::query(&format!(
                "UPDATE posts SET title = COALESCE($2, title), content = COALESCE($3, content), \
                 tags = COALESCE($4, tags), attachments = COALESCE($5, attachments), updated_at = now() \
                 WHERE id = $1 RETURNING {POST_COLS}"
            ))
            .bind(id)
            .bind(upd.title.as_ref())
            .bind(upd.content.as_ref())
            .bind(upd.tags.as_ref())
            .bind(upd.attachments.as_ref())
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;
            post_from_row(&row).map_err(map_sqlx)
        }

        async fn delete_post(&self, id: Id) -> RepoResult<()> {
            let res = sqlx::query("DELETE FROM posts WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx)?;
            if res.rows_affected() == 0 {
                return Err(RepoError::NotFound);
            }
            Ok(())
        }
    }

    #[async_trait]
    impl CommentRepo for PgRepo {
        async fn create_comment(
            &self,
            post_id: Id,
            author_id: Id,
            content: String,
            parent: Option<Id>,
        ) -> RepoResult<Comment> {
            if let Some(pid) = parent {
                let ok: Option<(Id,)> =
                    sqlx::query_as("SELECT id FROM comments WHERE id = $1 AND post_id = $2")
                        .bind(pid)
                        .bind(post_id)
                        .fetch_optional(&self.pool)
                        .await
                        .map_err(map_sqlx)?;
                if ok.is_none() {
                    return Err(RepoError::NotFound);
                }
            }
            let row = sqlx::query(
                "INSERT INTO comments (post_id, author_id, content, parent_id) VALUES ($1,$2,$3,$4) \
                 RETURNING id, post_id, author_id, content, parent_id, created_at",
            )
            .bind(post_id)
            .bind(author_id)
            .bind(&content)
            .bind(parent)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;
            comment_from_row(&row).map_err(map_sqlx)
        }

        async fn list_comments(&self, post_id: Id) -> RepoResult<Vec<Comment>> {
            let rows = sqlx::query(
                "SELECT id, post_id, author_id, content, parent_id, created_at \
                 FROM comments WHERE post_id = $1 ORDER BY created_at ASC, id ASC",
            )
            .bind(post_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
            rows.iter()
                .map(|r| comment_from_row(r).map_err(map_sqlx))
                .collect()
        }
    }

    #[async_trait]
    impl EventRepo for PgRepo {
        async fn create_event(&self, created_by: Id, new: NewEvent) -> RepoResult<Event> {
            let row = sqlx::query(&format!(
                "INSERT INTO events (title, description, date, location, created_by, attachments) \
                 VALUES ($1,$2,$3,$4,$5,$6) RETURNING {EVENT_COLS}"
            ))
            .bind(&new.title)
            .bind(new.description.as_ref())
            .bind(new.date)
            .bind(new.location.as_ref())
            .bind(created_by)
            .bind(&new.attachments)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;
            event_from_row(&row).map_err(map_sqlx)
        }

        async fn list_events(&self, query: &EventQuery) -> RepoResult<(Vec<Event>, u64)> {
            let mut count_qb = QueryBuilder::new("SELECT COUNT(*) AS n FROM events");
            push_event_filters(&mut count_qb, query);
            let total: i64 = count_qb
                .build()
                .fetch_one(&self.pool)
                .await
                .map_err(map_sqlx)?
                .try_get("n")
                .map_err(map_sqlx)?;

            let page = query.page.max(1) as i64;
            let limit = query.limit.max(1) as i64;
            let mut qb = QueryBuilder::new(format!("SELECT {EVENT_COLS} FROM events"));
            push_event_filters(&mut qb, query);
            qb.push(" ORDER BY date ASC, id ASC LIMIT ")
                .push_bind(limit)
                .push(" OFFSET ")
                .push_bind((page - 1) * limit);
            let rows = qb.build().fetch_all(&self.pool).await.map_err(map_sqlx)?;
            let events = rows
                .iter()
                .map(|r| event_from_row(r).map_err(map_sqlx))
                .collect::<RepoResult<Vec<_>>>()?;
            Ok((events, total as u64))
        }

        async fn get_event(&self, id: Id) -> RepoResult<Event> {
            let row = sqlx::query(&format!("SELECT {EVENT_COLS} FROM events WHERE id = $1"))
                .bind(id)
                .fetch_one(&self.pool)
                .await
                .map_err(map_sqlx)?;
            event_from_row(&row).map_err(map_sqlx)
        }

        async fn update_event(&self, id: Id, upd: UpdateEvent) -> RepoResult<Event> {
            let row = sqlx::query(&format!(
                "UPDATE events SET title = COALESCE($2, title), description = COALESCE($3, description), \
                 date = COALESCE($4, date), location = COALESCE($5, location), \
                 attachments = COALESCE($6, attachments), updated_at = now() \
                 WHERE id = $1 RETURNING {EVENT_COLS}"
            ))
            .bind(id)
            .bind(upd.title.as_ref())
            .bind(upd.description.as_ref())
            .bind(upd.date)
            .bind(upd.location.as_ref())
            .bind(upd.attachments.as_ref())
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;
            event_from_row(&row).map_err(map_sqlx)
        }

        async fn delete_event(&self, id: Id) -> RepoResult<()> {
            let res = sqlx::query("DELETE FROM events WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx)?;
            if res.rows_affected() == 0 {
                return Err(RepoError::NotFound);
            }
            Ok(())
        }
    }

    #[async_trait]
    impl MessageRepo for PgRepo {
        async fn create_message(
            &self,
            from_id: Id,
            to_id: Id,
            content: String,
        ) -> RepoResult<Message> {
            let row = sqlx::query(
                "INSERT INTO messages (from_id, to_id, content) VALUES ($1,$2,$3) \
                 RETURNING id, from_id, to_id, content, read, created_at",
            )
            .bind(from_id)
            .bind(to_id)
            .bind(&content)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;
            message_from_row(&row).map_err(map_sqlx)
        }

        async fn conversation(&self, me: Id, other: Id) -> RepoResult<Vec<Message>> {
            // mark-read and fetch inside one transaction
            let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
            sqlx::query(
                "UPDATE messages SET read = TRUE WHERE from_id = $1 AND to_id = $2 AND read = FALSE",
            )
            .bind(other)
            .bind(me)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
            let rows = sqlx::query(
                "SELECT id, from_id, to_id, content, read, created_at FROM messages \
                 WHERE (from_id = $1 AND to_id = $2) OR (from_id = $2 AND to_id = $1) \
                 ORDER BY created_at ASC, id ASC",
            )
            .bind(me)
            .bind(other)
            .fetch_all(&mut *tx)
            .await
            .map_err(map_sqlx)?;
            tx.commit().await.map_err(map_sqlx)?;
            rows.iter()
                .map(|r| message_from_row(r).map_err(map_sqlx))
                .collect()
        }

        async fn unread_summary(&self, me: Id) -> RepoResult<Vec<UnreadEntry>> {
            let rows = sqlx::query(
                "SELECT from_id, COUNT(*) AS n FROM messages WHERE to_id = $1 AND read = FALSE \
                 GROUP BY from_id ORDER BY from_id",
            )
            .bind(me)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
            rows.iter()
                .map(|r| {
                    Ok(UnreadEntry {
                        from: r.try_get("from_id").map_err(map_sqlx)?,
                        count: r.try_get("n").map_err(map_sqlx)?,
                    })
                })
                .collect()
        }
    }
}
