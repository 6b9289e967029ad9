//! DNS observation and filtering: the wire codec and the UDP/53
//! interceptor.

pub mod interceptor;
pub mod packet;

pub use interceptor::DnsInterceptor;
pub use packet::{
    build_nxdomain, build_redirect, encode_name, DnsPacket, Question, RecordData, ResourceRecord,
};
