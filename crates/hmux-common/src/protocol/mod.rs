pub mod error;
pub mod frame;
pub mod opcode;
pub mod request;
pub mod response;


pub use error::{map_io_error, HmuxError, Result};
pub use frame::{Frame, MAX_PAYLOAD_LEN};
pub use opcode::{FrameShape, Opcode};
pub use request::RequestAttributes;
pub use response::{Response, ResponseEvent, ResponseSink};
