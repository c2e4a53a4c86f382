pub mod gateway;
pub mod notify;
pub mod room;
pub mod session;
pub mod subscription;

pub use room::{MemberDetail, Room};
pub use session::SessionRecord;
pub use subscription::{ParameterKind, ParameterSpec, Subscription};
