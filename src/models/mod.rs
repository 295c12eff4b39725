pub mod meeting;
pub mod message;

pub use meeting::{
    HealthResponse, JoinMeetingRequest, MeetingDetail, MeetingSummary, StatusResponse,
    WorkerHealth, WorkerReadyNotification,
};
pub use message::{ControlMessage, SAMPLE_FORMAT_S16LE};
