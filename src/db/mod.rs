mod certificates;
mod content;
mod enrollments;
mod gamification;
mod notes;
mod progress;
mod quiz;
mod resets;
mod sessions;
mod users;

pub use certificates::*;
pub use content::*;
pub use enrollments::*;
pub use gamification::*;
pub use notes::*;
pub use progress::*;
pub use quiz::*;
pub use resets::*;
pub use sessions::*;
pub use users::*;
