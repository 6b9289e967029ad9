pub mod ca;
pub mod config;
pub mod control;
pub mod decode;
pub mod dns;
pub mod events;
pub mod net;
pub mod policy;
pub mod proxy;
pub mod store;
pub mod types;

pub use ca::{CertificateAuthority, LeafCert, CERT_PROFILES};
pub use config::{Config, DnsMode};
pub use control::{Command, Monitor, MonitorError};
pub use decode::{ContentDecoder, ContentKind, DecodedContent};
pub use events::{Event, EventSink, FlowEventKind};
pub use policy::{BlockCategory, BlockDecision, KeywordSet, PolicyEngine, ScheduleSet};
pub use store::{QueryFilter, SearchHit, Store, StoreError};
pub use types::{Device, DnsQueryRecord, HttpFlow, Sensitivity, Severity};
