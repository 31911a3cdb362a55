pub mod response;
pub mod target;
pub mod transport;

pub use response::{Response, ResponseEnvelope};
pub use target::{ParamLocation, Parameter, PreparedRequest, RawRequest, Target, URI_SENTINEL_KEY};
pub use transport::{Requester, ReqwestTransport, Transport};
