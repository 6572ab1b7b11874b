pub mod backend;
pub mod collaborators;
pub mod content;
pub mod errors;
pub mod ids;
pub mod messages;
pub mod session;
