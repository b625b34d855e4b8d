pub mod change_event;
pub mod entity;

pub use change_event::{ChangeEventHeader, ChangeNotification, ChangeType};
pub use entity::EntityType;
