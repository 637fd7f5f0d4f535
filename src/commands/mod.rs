pub mod call_api;
pub mod meeting_api;

pub use call_api::{CallApi, PayloadFormat};
pub use meeting_api::{MeetingRecord, MeetingRegistry, MeetingView};
