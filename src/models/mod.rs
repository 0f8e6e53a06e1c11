pub mod invitation;
pub mod message;
pub mod project;
pub mod user;

pub use invitation::{Invitation, InvitationResponse, InvitationStatus};
pub use message::{Message, NewMessage};
pub use project::{FileTree, Project};
pub use user::{PublicUser, User};
