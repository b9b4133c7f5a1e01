//! Pure logic with no I/O
//!
//! Backoff scheduling, request payload construction, and outcome judgement
//! live here so they can be tested without processes or sockets.

pub mod backoff;
pub mod judge;
pub mod payload;

pub use backoff::BackoffSchedule;
pub use judge::{AcceptAllJudge, Judgement, ManualReviewJudge, SubstringJudge};
pub use payload::{build_chat_payload, parse_chat_reply, ChatReply};
