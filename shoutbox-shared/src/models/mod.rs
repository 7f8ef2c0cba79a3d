pub mod errors;
pub mod events;
pub mod message;
pub mod settings;
pub mod timestamp;
pub mod user;

pub use errors::{ApiProblem, ErrorCode};
pub use events::{
    ConnectedEvent, RecentMessagesEvent, ResyncEvent, ShoutboxEvent, StreamErrorEvent,
};
pub use message::{
    EditMessageRequest, HistoryPage, HistoryQuery, Message, MessageId, OnlineResponse,
    SubmitMessageRequest,
};
pub use settings::ShoutboxSettings;
pub use timestamp::Timestamp;
pub use user::UserProfile;
