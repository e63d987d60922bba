mod controller;
mod snapshot;

pub use controller::SessionController;
pub use snapshot::{AddMessageOption, SessionSnapshot};
