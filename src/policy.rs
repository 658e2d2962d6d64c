//! Central authorization policy. Route handlers never compare ids or roles
//! inline; they ask `can(actor, action, resource)` so the ownership-or-admin
//! rule lives in exactly one place.

use crate::models::{Event, Post, Role, User};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Create,
    /// Privileged listings (the public directory needs no policy check).
    List,
    Update,
    Delete,
}

pub enum Resource<'a> {
    /// The post collection (creation) or a concrete post (mutation).
    Posts,
    Post(&'a Post),
    /// The event collection or a concrete event.
    Events,
    Event(&'a Event),
    /// Account provisioning and privileged listings.
    Accounts,
}

pub fn can(actor: &User, action: Action, resource: &Resource<'_>) -> bool {
    let admin = actor.role == Role::Admin;
    match (action, resource) {
        // Any authenticated account may publish posts.
        (Action::Create, Resource::Posts) => true,
        (Action::Update | Action::Delete, Resource::Post(post)) => {
            admin || post.author_id == actor.id
        }
        // Event creation is gated to teachers and admins.
        (Action::Create, Resource::Events) => matches!(actor.role, Role::Teacher | Role::Admin),
        (Action::Update | Action::Delete, Resource::Event(event)) => {
            admin || event.created_by == actor.id
        }
        (_, Resource::Accounts) => admin,
        _ => false,
    }
}
