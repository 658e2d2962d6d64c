use std::collections::HashMap;
use std::sync::Arc;

use actix_multipart::Multipart;
use actix_web::{web, HttpRequest, HttpResponse};
use chrono::{DateTime, NaiveDate, Utc};
use futures_util::TryStreamExt as _;

use crate::auth::{create_jwt, hash_password, verify_password, CurrentUser};
use crate::error::ApiError;
use crate::models::*;
use crate::policy::{can, Action, Resource};
use crate::rate_limit::RateLimiterFacade;
use crate::repo::{CreateUser, EventQuery, PostQuery, Repo, RepoError};
use crate::storage::{FileStore, ResourceClass, StoredFile};

pub fn config(cfg: &mut web::ServiceConfig) {
    // malformed JSON bodies get the same {message} shape as everything else
    cfg.app_data(web::JsonConfig::default().error_handler(|err, _| {
        ApiError::bad_request(err.to_string()).into()
    }));
    cfg.service(
        web::scope("/api")
            .service(web::resource("/health").route(web::get().to(health)))
            .service(web::resource("/auth/register").route(web::post().to(register)))
            .service(web::resource("/auth/login").route(web::post().to(login)))
            .service(web::resource("/auth/me").route(web::get().to(auth_me)))
            .service(
                web::resource("/auth/change-password").route(web::patch().to(change_password)),
            )
            .service(web::resource("/auth/profile").route(web::patch().to(update_profile)))
            .service(
                web::resource("/users")
                    .route(web::get().to(list_users))
                    .route(web::post().to(create_user)),
            )
            // must be registered before /users/{id}
            .service(web::resource("/users/admin/list").route(web::get().to(admin_list_users)))
            .service(web::resource("/users/{id}").route(web::get().to(get_user)))
            .service(
                web::resource("/posts")
                    .route(web::get().to(list_posts))
                    .route(web::post().to(create_post)),
            )
            .service(
                web::resource("/posts/{id}")
                    .route(web::get().to(get_post))
                    .route(web::patch().to(update_post))
                    .route(web::delete().to(delete_post)),
            )
            .service(
                web::resource("/posts/{post_id}/comments")
                    .route(web::get().to(list_comments))
                    .route(web::post().to(create_comment)),
            )
            .service(
                web::resource("/events")
                    .route(web::get().to(list_events))
                    .route(web::post().to(create_event)),
            )
            .service(
                web::resource("/events/{id}")
                    .route(web::get().to(get_event))
                    .route(web::patch().to(update_event))
                    .route(web::delete().to(delete_event)),
            )
            .service(web::resource("/messages").route(web::post().to(send_message)))
            .service(
                web::resource("/messages/unread-summary")
                    .route(web::get().to(unread_summary)),
            )
            .service(
                web::resource("/messages/with/{user_id}").route(web::get().to(conversation)),
            )
            .service(web::resource("/upload").route(web::post().to(upload_file))),
    );
    // local-disk uploads are served without the /api prefix so stored URLs
    // like /uploads/<name> resolve directly
    cfg.route("/uploads/{name}", web::get().to(serve_upload));
}

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn Repo>,
    pub files: Arc<dyn FileStore>,
    pub rate: RateLimiterFacade,
}

fn client_ip(req: &HttpRequest) -> String {
    req.connection_info()
        .realip_remote_addr()
        .unwrap_or("unknown")
        .to_string()
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({"status": "ok"}))
}

// ---------------- Auth -----------------------------------------------

#[derive(Debug, serde::Serialize, utoipa::ToSchema)]
pub struct AuthResponse {
    pub token: String,
    pub user: UserView,
}

#[derive(Debug, serde::Deserialize, utoipa::ToSchema)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

const MIN_PASSWORD_LEN: usize = 6;

#[utoipa::path(
    post,
    path = "/api/auth/register",
    request_body = NewUser,
    responses(
        (status = 201, description = "Account created", body = AuthResponse),
        (status = 400, description = "Missing fields"),
        (status = 409, description = "Email already registered")
    )
)]
pub async fn register(
    data: web::Data<AppState>,
    payload: web::Json<NewUser>,
) -> Result<HttpResponse, ApiError> {
    let new = payload.into_inner();
    if new.name.trim().is_empty() || new.email.trim().is_empty() || new.password.is_empty() {
        return Err(ApiError::bad_request("Missing fields"));
    }
    let email = new.email.trim().to_lowercase();
    let password_hash = hash_password(&new.password).map_err(|_| ApiError::Internal)?;
    let user = data
        .repo
        .create_user(CreateUser {
            name: new.name,
            email,
            password_hash,
            role: new.role.unwrap_or_default(),
        })
        .await
        .map_err(|e| match e {
            RepoError::Conflict => ApiError::conflict("Email already registered"),
            other => other.into(),
        })?;
    let token = create_jwt(user.id, user.role).map_err(|_| ApiError::Internal)?;
    Ok(HttpResponse::Created().json(AuthResponse {
        token,
        user: UserView::private(&user),
    }))
}

#[utoipa::path(
    post,
    path = "/api/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Authenticated", body = AuthResponse),
        (status = 401, description = "Invalid credentials")
    )
)]
pub async fn login(
    req: HttpRequest,
    data: web::Data<AppState>,
    payload: web::Json<LoginRequest>,
) -> Result<HttpResponse, ApiError> {
    if !data.rate.allow_login(&client_ip(&req)) {
        return Err(ApiError::TooManyRequests);
    }
    let email = payload.email.trim().to_lowercase();
    let user = data
        .repo
        .get_user_by_email(&email)
        .await
        .map_err(|_| ApiError::unauthorized("Invalid credentials"))?;
    if !verify_password(&payload.password, &user.password_hash) {
        return Err(ApiError::unauthorized("Invalid credentials"));
    }
    let token = create_jwt(user.id, user.role).map_err(|_| ApiError::Internal)?;
    Ok(HttpResponse::Ok().json(AuthResponse {
        token,
        user: UserView::private(&user),
    }))
}

#[utoipa::path(
    get,
    path = "/api/auth/me",
    responses(
        (status = 200, description = "Current account", body = UserView),
        (status = 401, description = "Unauthorized")
    )
)]
pub async fn auth_me(user: CurrentUser) -> Result<HttpResponse, ApiError> {
    Ok(HttpResponse::Ok().json(serde_json::json!({ "user": UserView::private(&user.0) })))
}

#[utoipa::path(
    patch,
    path = "/api/auth/change-password",
    request_body = ChangePassword,
    responses(
        (status = 200, description = "Password changed"),
        (status = 400, description = "Validation failure"),
        (status = 401, description = "Current password incorrect")
    )
)]
pub async fn change_password(
    user: CurrentUser,
    data: web::Data<AppState>,
    payload: web::Json<ChangePassword>,
) -> Result<HttpResponse, ApiError> {
    let body = payload.into_inner();
    if body.current_password.is_empty() || body.new_password.is_empty() {
        return Err(ApiError::bad_request(
            "Current password and new password are required",
        ));
    }
    if body.new_password.len() < MIN_PASSWORD_LEN {
        return Err(ApiError::bad_request(
            "New password must be at least 6 characters long",
        ));
    }
    if !verify_password(&body.current_password, &user.0.password_hash) {
        return Err(ApiError::unauthorized("Current password is incorrect"));
    }
    let hash = hash_password(&body.new_password).map_err(|_| ApiError::Internal)?;
    data.repo.set_password(user.0.id, hash).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({"message": "Password changed successfully"})))
}

#[utoipa::path(
    patch,
    path = "/api/auth/profile",
    request_body = UpdateProfile,
    responses(
        (status = 200, description = "Profile updated", body = UserView),
        (status = 409, description = "Email already in use")
    )
)]
pub async fn update_profile(
    user: CurrentUser,
    data: web::Data<AppState>,
    payload: web::Json<UpdateProfile>,
) -> Result<HttpResponse, ApiError> {
    let mut upd = payload.into_inner();
    if let Some(email) = upd.email.take() {
        upd.email = Some(email.trim().to_lowercase());
    }
    let updated = data
        .repo
        .update_profile(user.0.id, upd)
        .await
        .map_err(|e| match e {
            RepoError::Conflict => ApiError::conflict("Email already in use"),
            other => other.into(),
        })?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "user": UserView::private(&updated) })))
}

// ---------------- Users ----------------------------------------------

pub async fn list_users(
    _user: CurrentUser,
    data: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let mut users = data.repo.list_users().await?;
    users.sort_by(|a, b| a.name.cmp(&b.name));
    let views: Vec<UserView> = users.iter().map(UserView::public).collect();
    Ok(HttpResponse::Ok().json(serde_json::json!({ "users": views })))
}

#[utoipa::path(
    post,
    path = "/api/users",
    request_body = NewUser,
    responses(
        (status = 201, description = "Account provisioned", body = UserView),
        (status = 403, description = "Admin only"),
        (status = 409, description = "Email already registered")
    )
)]
pub async fn create_user(
    user: CurrentUser,
    data: web::Data<AppState>,
    payload: web::Json<NewUser>,
) -> Result<HttpResponse, ApiError> {
    if !can(&user.0, Action::Create, &Resource::Accounts) {
        return Err(ApiError::Forbidden);
    }
    let new = payload.into_inner();
    if new.name.trim().is_empty() || new.email.trim().is_empty() || new.password.is_empty() {
        return Err(ApiError::bad_request("Missing fields"));
    }
    let email = new.email.trim().to_lowercase();
    let password_hash = hash_password(&new.password).map_err(|_| ApiError::Internal)?;
    let created = data
        .repo
        .create_user(CreateUser {
            name: new.name,
            email,
            password_hash,
            role: new.role.unwrap_or_default(),
        })
        .await
        .map_err(|e| match e {
            RepoError::Conflict => ApiError::conflict("Email already registered"),
            other => other.into(),
        })?;
    Ok(HttpResponse::Created().json(serde_json::json!({ "user": UserView::private(&created) })))
}

pub async fn admin_list_users(
    user: CurrentUser,
    data: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    if !can(&user.0, Action::List, &Resource::Accounts) {
        return Err(ApiError::Forbidden);
    }
    let mut users = data.repo.list_users().await?;
    users.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
    let views: Vec<UserView> = users.iter().map(UserView::private).collect();
    Ok(HttpResponse::Ok().json(serde_json::json!({ "users": views })))
}

pub async fn get_user(
    _user: CurrentUser,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    let user = data
        .repo
        .get_user(path.into_inner())
        .await
        .map_err(|_| ApiError::not_found("User not found"))?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "user": UserView::private(&user) })))
}

// ---------------- Posts ----------------------------------------------

#[derive(Debug, serde::Deserialize, utoipa::IntoParams)]
pub struct PostListParams {
    pub q: Option<String>,
    pub tag: Option<String>,
    pub author: Option<Id>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

fn author_ref(authors: &HashMap<Id, User>, id: Id) -> AuthorRef {
    authors.get(&id).map(AuthorRef::of).unwrap_or(AuthorRef {
        id,
        name: String::new(),
        role: Role::Student,
    })
}

fn post_view(post: Post, authors: &HashMap<Id, User>) -> PostView {
    let author = author_ref(authors, post.author_id);
    PostView {
        id: post.id,
        title: post.title,
        content: post.content,
        tags: post.tags,
        attachments: post.attachments,
        author,
        created_at: post.created_at,
        updated_at: post.updated_at,
    }
}

fn event_view(event: Event, authors: &HashMap<Id, User>) -> EventView {
    let created_by = author_ref(authors, event.created_by);
    EventView {
        id: event.id,
        title: event.title,
        description: event.description,
        date: event.date,
        location: event.location,
        created_by,
        attachments: event.attachments,
        created_at: event.created_at,
        updated_at: event.updated_at,
    }
}

#[utoipa::path(
    post,
    path = "/api/posts",
    request_body = NewPost,
    responses(
        (status = 201, description = "Post created", body = PostView),
        (status = 400, description = "Missing fields")
    )
)]
pub async fn create_post(
    req: HttpRequest,
    user: CurrentUser,
    data: web::Data<AppState>,
    payload: web::Json<NewPost>,
) -> Result<HttpResponse, ApiError> {
    if !data.rate.allow_post(&client_ip(&req)) {
        return Err(ApiError::TooManyRequests);
    }
    let new = payload.into_inner();
    if new.title.trim().is_empty() || new.content.trim().is_empty() {
        return Err(ApiError::bad_request("Missing fields"));
    }
    let post = data.repo.create_post(user.0.id, new).await?;
    let authors = HashMap::from([(user.0.id, user.0)]);
    Ok(HttpResponse::Created().json(serde_json::json!({ "post": post_view(post, &authors) })))
}

#[utoipa::path(
    get,
    path = "/api/posts",
    params(PostListParams),
    responses((status = 200, description = "Paged post listing"))
)]
pub async fn list_posts(
    _user: CurrentUser,
    data: web::Data<AppState>,
    params: web::Query<PostListParams>,
) -> Result<HttpResponse, ApiError> {
    let page = params.page.unwrap_or(1).max(1);
    let limit = params.limit.unwrap_or(10).max(1);
    let query = PostQuery {
        q: params.q.clone().filter(|s| !s.is_empty()),
        tag: params.tag.clone().filter(|s| !s.is_empty()),
        author: params.author,
        page,
        limit,
    };
    let (posts, total) = data.repo.list_posts(&query).await?;
    let author_ids: Vec<Id> = posts.iter().map(|p| p.author_id).collect();
    let authors = data.repo.get_users(&author_ids).await?;
    let views: Vec<PostView> = posts.into_iter().map(|p| post_view(p, &authors)).collect();
    let pages = total.div_ceil(limit as u64);
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "posts": views,
        "total": total,
        "page": page,
        "pages": pages,
    })))
}

#[utoipa::path(
    get,
    path = "/api/posts/{id}",
    params(("id" = Id, Path, description = "Post id")),
    responses(
        (status = 200, description = "Post", body = PostView),
        (status = 404, description = "Post not found")
    )
)]
pub async fn get_post(
    _user: CurrentUser,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    let post = data
        .repo
        .get_post(path.into_inner())
        .await
        .map_err(|_| ApiError::not_found("Post not found"))?;
    let authors = data.repo.get_users(&[post.author_id]).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "post": post_view(post, &authors) })))
}

#[utoipa::path(
    patch,
    path = "/api/posts/{id}",
    request_body = UpdatePost,
    params(("id" = Id, Path, description = "Post id")),
    responses(
        (status = 200, description = "Post updated", body = PostView),
        (status = 403, description = "Not the author or an admin"),
        (status = 404, description = "Post not found")
    )
)]
pub async fn update_post(
    user: CurrentUser,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<UpdatePost>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    let post = data
        .repo
        .get_post(id)
        .await
        .map_err(|_| ApiError::not_found("Post not found"))?;
    if !can(&user.0, Action::Update, &Resource::Post(&post)) {
        return Err(ApiError::Forbidden);
    }
    let updated = data.repo.update_post(id, payload.into_inner()).await?;
    let authors = data.repo.get_users(&[updated.author_id]).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "post": post_view(updated, &authors) })))
}

#[utoipa::path(
    delete,
    path = "/api/posts/{id}",
    params(("id" = Id, Path, description = "Post id")),
    responses(
        (status = 200, description = "Post deleted"),
        (status = 403, description = "Not the author or an admin"),
        (status = 404, description = "Post not found")
    )
)]
pub async fn delete_post(
    user: CurrentUser,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    let post = data
        .repo
        .get_post(id)
        .await
        .map_err(|_| ApiError::not_found("Post not found"))?;
    if !can(&user.0, Action::Delete, &Resource::Post(&post)) {
        return Err(ApiError::Forbidden);
    }
    data.repo.delete_post(id).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({"ok": true})))
}

// ---------------- Comments -------------------------------------------

/// Rebuild the reply hierarchy from flat parent links: two passes, O(n),
/// stable insertion order. Replies whose parent id does not resolve are
/// silently dropped.
pub fn build_comment_tree(comments: &[Comment], authors: &HashMap<Id, User>) -> Vec<CommentNode> {
    let ids: std::collections::HashSet<Id> = comments.iter().map(|c| c.id).collect();
    let mut children: HashMap<Id, Vec<&Comment>> = HashMap::new();
    let mut roots: Vec<&Comment> = Vec::new();
    for c in comments {
        match c.parent_id {
            Some(pid) if ids.contains(&pid) => children.entry(pid).or_default().push(c),
            Some(_) => {} // orphaned reply
            None => roots.push(c),
        }
    }

    fn assemble(
        c: &Comment,
        children: &HashMap<Id, Vec<&Comment>>,
        authors: &HashMap<Id, User>,
    ) -> CommentNode {
        CommentNode {
            id: c.id,
            content: c.content.clone(),
            author: author_ref(authors, c.author_id),
            parent: c.parent_id,
            created_at: c.created_at,
            children: children
                .get(&c.id)
                .map(|v| v.iter().map(|cc| assemble(cc, children, authors)).collect())
                .unwrap_or_default(),
        }
    }

    roots
        .iter()
        .map(|c| assemble(c, &children, authors))
        .collect()
}

#[utoipa::path(
    post,
    path = "/api/posts/{post_id}/comments",
    request_body = NewComment,
    params(("post_id" = Id, Path, description = "Post id")),
    responses(
        (status = 201, description = "Comment created", body = CommentNode),
        (status = 400, description = "Missing content or invalid parent"),
        (status = 404, description = "Post not found")
    )
)]
pub async fn create_comment(
    user: CurrentUser,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<NewComment>,
) -> Result<HttpResponse, ApiError> {
    let post_id = path.into_inner();
    let new = payload.into_inner();
    if new.content.trim().is_empty() {
        return Err(ApiError::bad_request("Missing fields"));
    }
    data.repo
        .get_post(post_id)
        .await
        .map_err(|_| ApiError::not_found("Post not found"))?;
    let comment = data
        .repo
        .create_comment(post_id, user.0.id, new.content, new.parent)
        .await
        .map_err(|e| match e {
            RepoError::NotFound => ApiError::bad_request("Invalid parent comment"),
            other => other.into(),
        })?;
    let node = CommentNode {
        id: comment.id,
        content: comment.content,
        author: AuthorRef::of(&user.0),
        parent: comment.parent_id,
        created_at: comment.created_at,
        children: Vec::new(),
    };
    Ok(HttpResponse::Created().json(serde_json::json!({ "comment": node })))
}

#[utoipa::path(
    get,
    path = "/api/posts/{post_id}/comments",
    params(("post_id" = Id, Path, description = "Post id")),
    responses(
        (status = 200, description = "Comment tree", body = [CommentNode]),
        (status = 404, description = "Post not found")
    )
)]
pub async fn list_comments(
    _user: CurrentUser,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    let post_id = path.into_inner();
    data.repo
        .get_post(post_id)
        .await
        .map_err(|_| ApiError::not_found("Post not found"))?;
    let comments = data.repo.list_comments(post_id).await?;
    let author_ids: Vec<Id> = comments.iter().map(|c| c.author_id).collect();
    let authors = data.repo.get_users(&author_ids).await?;
    let tree = build_comment_tree(&comments, &authors);
    Ok(HttpResponse::Ok().json(serde_json::json!({ "comments": tree })))
}

// ---------------- Events ---------------------------------------------

#[derive(Debug, serde::Deserialize, utoipa::IntoParams)]
pub struct EventListParams {
    pub q: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

/// Accept either RFC 3339 timestamps or bare `YYYY-MM-DD` dates.
fn parse_date_param(s: &str) -> Result<DateTime<Utc>, ApiError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(d) = s.parse::<NaiveDate>() {
        if let Some(dt) = d.and_hms_opt(0, 0, 0) {
            return Ok(dt.and_utc());
        }
    }
    Err(ApiError::bad_request(format!("Invalid date: {s}")))
}

#[utoipa::path(
    post,
    path = "/api/events",
    request_body = NewEvent,
    responses(
        (status = 201, description = "Event created", body = EventView),
        (status = 403, description = "Only teachers/admin can create events")
    )
)]
pub async fn create_event(
    user: CurrentUser,
    data: web::Data<AppState>,
    payload: web::Json<NewEvent>,
) -> Result<HttpResponse, ApiError> {
    if !can(&user.0, Action::Create, &Resource::Events) {
        return Err(ApiError::Forbidden);
    }
    let new = payload.into_inner();
    if new.title.trim().is_empty() {
        return Err(ApiError::bad_request("Missing fields"));
    }
    let event = data.repo.create_event(user.0.id, new).await?;
    let authors = HashMap::from([(user.0.id, user.0)]);
    Ok(HttpResponse::Created().json(serde_json::json!({ "event": event_view(event, &authors) })))
}

#[utoipa::path(
    get,
    path = "/api/events",
    params(EventListParams),
    responses((status = 200, description = "Paged event listing"))
)]
pub async fn list_events(
    _user: CurrentUser,
    data: web::Data<AppState>,
    params: web::Query<EventListParams>,
) -> Result<HttpResponse, ApiError> {
    let page = params.page.unwrap_or(1).max(1);
    let limit = params.limit.unwrap_or(10).max(1);
    let from = params.from.as_deref().map(parse_date_param).transpose()?;
    let to = params.to.as_deref().map(parse_date_param).transpose()?;
    let query = EventQuery {
        q: params.q.clone().filter(|s| !s.is_empty()),
        from,
        to,
        page,
        limit,
    };
    let (events, total) = data.repo.list_events(&query).await?;
    let creator_ids: Vec<Id> = events.iter().map(|e| e.created_by).collect();
    let authors = data.repo.get_users(&creator_ids).await?;
    let views: Vec<EventView> = events
        .into_iter()
        .map(|e| event_view(e, &authors))
        .collect();
    let pages = total.div_ceil(limit as u64);
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "events": views,
        "total": total,
        "page": page,
        "pages": pages,
    })))
}

#[utoipa::path(
    get,
    path = "/api/events/{id}",
    params(("id" = Id, Path, description = "Event id")),
    responses(
        (status = 200, description = "Event", body = EventView),
        (status = 404, description = "Event not found")
    )
)]
pub async fn get_event(
    _user: CurrentUser,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    let event = data
        .repo
        .get_event(path.into_inner())
        .await
        .map_err(|_| ApiError::not_found("Event not found"))?;
    let authors = data.repo.get_users(&[event.created_by]).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "event": event_view(event, &authors) })))
}

#[utoipa::path(
    patch,
    path = "/api/events/{id}",
    request_body = UpdateEvent,
    params(("id" = Id, Path, description = "Event id")),
    responses(
        (status = 200, description = "Event updated", body = EventView),
        (status = 403, description = "Not the creator or an admin"),
        (status = 404, description = "Event not found")
    )
)]
pub async fn update_event(
    user: CurrentUser,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<UpdateEvent>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    let event = data
        .repo
        .get_event(id)
        .await
        .map_err(|_| ApiError::not_found("Event not found"))?;
    if !can(&user.0, Action::Update, &Resource::Event(&event)) {
        return Err(ApiError::Forbidden);
    }
    let updated = data.repo.update_event(id, payload.into_inner()).await?;
    let authors = data.repo.get_users(&[updated.created_by]).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "event": event_view(updated, &authors) })))
}

#[utoipa::path(
    delete,
    path = "/api/events/{id}",
    params(("id" = Id, Path, description = "Event id")),
    responses(
        (status = 200, description = "Event deleted"),
        (status = 403, description = "Not the creator or an admin"),
        (status = 404, description = "Event not found")
    )
)]
pub async fn delete_event(
    user: CurrentUser,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    let event = data
        .repo
        .get_event(id)
        .await
        .map_err(|_| ApiError::not_found("Event not found"))?;
    if !can(&user.0, Action::Delete, &Resource::Event(&event)) {
        return Err(ApiError::Forbidden);
    }
    data.repo.delete_event(id).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({"ok": true})))
}

// ---------------- Messages -------------------------------------------

#[utoipa::path(
    post,
    path = "/api/messages",
    request_body = NewMessage,
    responses(
        (status = 201, description = "Message sent", body = Message),
        (status = 400, description = "Missing fields"),
        (status = 404, description = "Recipient not found")
    )
)]
pub async fn send_message(
    req: HttpRequest,
    user: CurrentUser,
    data: web::Data<AppState>,
    payload: web::Json<NewMessage>,
) -> Result<HttpResponse, ApiError> {
    if !data.rate.allow_message(&client_ip(&req)) {
        return Err(ApiError::TooManyRequests);
    }
    let new = payload.into_inner();
    if new.content.trim().is_empty() {
        return Err(ApiError::bad_request("Missing fields"));
    }
    let msg = data
        .repo
        .create_message(user.0.id, new.to, new.content)
        .await
        .map_err(|e| match e {
            RepoError::NotFound => ApiError::not_found("Recipient not found"),
            other => other.into(),
        })?;
    Ok(HttpResponse::Created().json(serde_json::json!({ "message": msg })))
}

#[utoipa::path(
    get,
    path = "/api/messages/with/{user_id}",
    params(("user_id" = Id, Path, description = "Conversation counterpart")),
    responses((status = 200, description = "History, oldest first; marks incoming messages read", body = [Message]))
)]
pub async fn conversation(
    user: CurrentUser,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    let other = path.into_inner();
    let messages = data.repo.conversation(user.0.id, other).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "messages": messages })))
}

#[utoipa::path(
    get,
    path = "/api/messages/unread-summary",
    responses((status = 200, description = "Unread counts grouped by sender", body = [UnreadEntry]))
)]
pub async fn unread_summary(
    user: CurrentUser,
    data: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let unread = data.repo.unread_summary(user.0.id).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "unread": unread })))
}

// ---------------- Uploads --------------------------------------------

pub const UPLOAD_SIZE_LIMIT: usize = 10 * 1024 * 1024; // 10 MB

pub const ALLOWED_MIME: &[&str] = &[
    "image/jpeg",
    "image/png",
    "image/webp",
    "application/pdf",
];

#[derive(Debug, serde::Serialize, utoipa::ToSchema)]
pub struct UploadResponse {
    pub url: String,
    pub filename: String,
    pub size: usize,
    #[serde(rename = "type")]
    pub mime_type: String,
    #[serde(rename = "resourceClass")]
    pub resource_class: ResourceClass,
}

impl From<StoredFile> for UploadResponse {
    fn from(f: StoredFile) -> Self {
        Self {
            url: f.url,
            filename: f.original_filename,
            size: f.size,
            mime_type: f.mime_type,
            resource_class: f.resource_class,
        }
    }
}

#[utoipa::path(
    post,
    path = "/api/upload",
    responses(
        (status = 201, description = "File stored", body = UploadResponse),
        (status = 400, description = "No file provided"),
        (status = 413, description = "Payload too large"),
        (status = 415, description = "Unsupported media type")
    )
)]
pub async fn upload_file(
    req: HttpRequest,
    _user: CurrentUser,
    data: web::Data<AppState>,
    mut payload: Multipart,
) -> Result<HttpResponse, ApiError> {
    if !data.rate.allow_upload(&client_ip(&req)) {
        return Err(ApiError::TooManyRequests);
    }
    while let Some(field) = payload.try_next().await.map_err(|e| {
        log::error!("multipart error: {e}");
        ApiError::Internal
    })? {
        match field.content_disposition().get_name() {
            Some("file") => {}
            _ => continue,
        }
        let original_filename = field
            .content_disposition()
            .get_filename()
            .unwrap_or("file")
            .to_string();
        let declared_mime = field.content_type().map(|m| m.to_string());

        let mut bytes: Vec<u8> = Vec::new();
        let mut field_stream = field;
        while let Some(chunk) = field_stream.try_next().await.map_err(|e| {
            log::error!("stream read error: {e}");
            ApiError::Internal
        })? {
            if bytes.len() + chunk.len() > UPLOAD_SIZE_LIMIT {
                return Err(ApiError::PayloadTooLarge);
            }
            bytes.extend_from_slice(&chunk);
        }

        // sniffed content wins over the declared header
        let mime = infer::get(&bytes)
            .map(|t| t.mime_type().to_string())
            .or(declared_mime)
            .unwrap_or_else(|| "application/octet-stream".into());
        if !ALLOWED_MIME.contains(&mime.as_str()) {
            return Err(ApiError::UnsupportedMedia(
                "Only images (jpg,png,webp) and PDFs are allowed".into(),
            ));
        }

        let stored = data.files.save(&original_filename, &mime, &bytes).await?;
        return Ok(HttpResponse::Created().json(UploadResponse::from(stored)));
    }
    Err(ApiError::bad_request("No file provided"))
}

/// Serve a locally stored upload. Raw objects (PDFs) get a download
/// disposition; the stored name already carries the canonical extension.
pub async fn serve_upload(
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let name = path.into_inner();
    let (bytes, mime) = data.files.load(&name).await?;
    let mut resp = HttpResponse::Ok();
    resp.insert_header(("Content-Type", mime.clone()));
    if ResourceClass::classify(&mime) == ResourceClass::Raw {
        resp.insert_header((
            "Content-Disposition",
            format!("attachment; filename=\"{name}\""),
        ));
    }
    Ok(resp.body(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn user(id: Id) -> User {
        User {
            id,
            name: format!("user{id}"),
            email: format!("user{id}@campus.test"),
            password_hash: String::new(),
            role: Role::Student,
            avatar_url: None,
            bio: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn comment(id: Id, parent: Option<Id>, at_secs: i64) -> Comment {
        Comment {
            id,
            post_id: 1,
            author_id: 1,
            content: format!("c{id}"),
            parent_id: parent,
            created_at: Utc.timestamp_opt(at_secs, 0).unwrap(),
        }
    }

    #[test]
    fn comment_tree_preserves_nesting_depth() {
        let comments = vec![
            comment(1, None, 10),
            comment(2, Some(1), 20),
            comment(3, Some(2), 30),
        ];
        let authors = HashMap::from([(1, user(1))]);
        let tree = build_comment_tree(&comments, &authors);
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].id, 1);
        assert_eq!(tree[0].children.len(), 1);
        assert_eq!(tree[0].children[0].id, 2);
        assert_eq!(tree[0].children[0].children.len(), 1);
        assert_eq!(tree[0].children[0].children[0].id, 3);
    }

    #[test]
    fn comment_tree_drops_orphans() {
        let comments = vec![comment(1, None, 10), comment(2, Some(999), 20)];
        let authors = HashMap::from([(1, user(1))]);
        let tree = build_comment_tree(&comments, &authors);
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].id, 1);
        assert!(tree[0].children.is_empty());
    }

    #[test]
    fn comment_tree_keeps_sibling_order() {
        let comments = vec![
            comment(1, None, 10),
            comment(2, Some(1), 20),
            comment(3, Some(1), 30),
            comment(4, None, 40),
        ];
        let authors = HashMap::from([(1, user(1))]);
        let tree = build_comment_tree(&comments, &authors);
        assert_eq!(tree.iter().map(|n| n.id).collect::<Vec<_>>(), vec![1, 4]);
        assert_eq!(
            tree[0].children.iter().map(|n| n.id).collect::<Vec<_>>(),
            vec![2, 3]
        );
    }

    #[test]
    fn date_param_accepts_both_forms() {
        assert!(parse_date_param("2026-09-01").is_ok());
        assert!(parse_date_param("2026-09-01T10:00:00Z").is_ok());
        assert!(parse_date_param("next tuesday").is_err());
    }
}
