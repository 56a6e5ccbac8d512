//! Registration of one frame-graph link into a transform pair.

mod link;

pub use link::{register_link, RegisteredLink, RegistrationFiles, RegistrationLink};
