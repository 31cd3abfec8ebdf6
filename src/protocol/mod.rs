pub mod commands;
pub mod packet;
pub mod param;

pub use commands::{Command, FrameType};
pub use packet::{decode, encode, Notification, QxwFrame};
