use utoipa::OpenApi;

use crate::models::{
    ChangePassword, CommentNode, EventView, Message, NewComment, NewEvent, NewMessage, NewPost,
    NewUser, PostView, UnreadEntry, UpdateEvent, UpdatePost, UpdateProfile, UserView,
};

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::register,
        crate::routes::login,
        crate::routes::auth_me,
        crate::routes::change_password,
        crate::routes::update_profile,
        crate::routes::create_user,
        crate::routes::list_posts,
        crate::routes::create_post,
        crate::routes::get_post,
        crate::routes::update_post,
        crate::routes::delete_post,
        crate::routes::list_comments,
        crate::routes::create_comment,
        crate::routes::list_events,
        crate::routes::create_event,
        crate::routes::get_event,
        crate::routes::update_event,
        crate::routes::delete_event,
        crate::routes::send_message,
        crate::routes::conversation,
        crate::routes::unread_summary,
        crate::routes::upload_file,
    ),
    components(schemas(
        NewUser, UserView, UpdateProfile, ChangePassword,
        NewPost, PostView, UpdatePost,
        NewComment, CommentNode,
        NewEvent, EventView, UpdateEvent,
        NewMessage, Message, UnreadEntry,
        crate::routes::AuthResponse, crate::routes::LoginRequest,
        crate::routes::UploadResponse,
    )),
    tags(
        (name = "auth", description = "Registration, login and account management"),
        (name = "posts", description = "Campus feed posts and comments"),
        (name = "events", description = "Campus events"),
        (name = "messages", description = "Direct messages"),
        (name = "uploads", description = "File uploads"),
    )
)]
pub struct ApiDoc;
