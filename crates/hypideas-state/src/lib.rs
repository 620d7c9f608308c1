pub mod analytics;
pub mod comments;
pub mod reactions;
pub mod timeline;
pub mod typing;
